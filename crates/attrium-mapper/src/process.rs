//! Update queue and propagation control: the cooperative runtime around the
//! engine.
//!
//! Create and delete events are evaluated synchronously (a deleted node's
//! context must be read before it becomes unreachable); plain value updates
//! are deduplicated into a pending set and evaluated one entry per
//! [`MapperRuntime::evaluate_next_update`] call. Cascades therefore unfold
//! one step at a time across scheduler turns instead of recursing on the
//! call stack.

use std::collections::BTreeSet;

use attrium_store::{AttributeChange, AttributeEvent, AttributeId, AttributeStore, ValueState};
use tracing::debug;

use crate::engine::MapperEngine;

/// The two explicit reentrancy guards of the mapper: per-node reaction
/// suppression and the global pause flag. Both are plain sets/flags, safe
/// only under the single-thread guarantee.
#[derive(Debug, Default)]
pub struct PropagationControl {
    paused_reactions: BTreeSet<AttributeId>,
    mapper_paused: bool,
}

impl PropagationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress reactions to updates of one node.
    pub fn pause_reactions(&mut self, node: AttributeId) {
        self.paused_reactions.insert(node);
    }

    /// Lift the suppression of one node.
    pub fn resume_reactions(&mut self, node: AttributeId) {
        self.paused_reactions.remove(&node);
    }

    /// Whether reactions to a node's updates are currently suppressed.
    pub fn reactions_paused(&self, node: AttributeId) -> bool {
        self.paused_reactions.contains(&node)
    }

    /// Pause all mapping.
    pub fn pause_mapping(&mut self) {
        self.mapper_paused = true;
    }

    /// Resume mapping.
    pub fn resume_mapping(&mut self) {
        self.mapper_paused = false;
    }

    /// Whether mapping is globally paused.
    pub fn mapping_paused(&self) -> bool {
        self.mapper_paused
    }
}

/// Deduplicating, ordered set of pending `(node, state)` updates.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: BTreeSet<(AttributeId, ValueState)>,
}

impl UpdateQueue {
    fn insert(&mut self, node: AttributeId, state: ValueState) {
        self.pending.insert((node, state));
    }

    fn pop_first(&mut self) -> Option<(AttributeId, ValueState)> {
        self.pending.pop_first()
    }

    /// Drop every queued entry for a node; used when the node is deleted
    /// with updates still pending.
    fn remove_node(&mut self, node: AttributeId) {
        self.pending.retain(|(pending, _)| *pending != node);
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Couples the engine, the update queue, and the propagation control to a
/// store's event stream.
pub struct MapperRuntime {
    engine: MapperEngine,
    queue: UpdateQueue,
    control: PropagationControl,
}

impl MapperRuntime {
    pub fn new(engine: MapperEngine) -> Self {
        Self {
            engine,
            queue: UpdateQueue::default(),
            control: PropagationControl::new(),
        }
    }

    pub fn engine(&self) -> &MapperEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MapperEngine {
        &mut self.engine
    }

    /// Pause all mapping. Events arriving while paused are dropped.
    pub fn pause_mapping(&mut self) {
        self.control.pause_mapping();
    }

    /// Resume mapping.
    pub fn resume_mapping(&mut self) {
        self.control.resume_mapping();
    }

    /// Suppress reactions to one node's updates until resumed.
    pub fn pause_reactions_to(&mut self, node: AttributeId) {
        self.control.pause_reactions(node);
    }

    /// Lift a per-node suppression.
    pub fn resume_reactions_to(&mut self, node: AttributeId) {
        self.control.resume_reactions(node);
    }

    /// Whether updates are waiting to be evaluated.
    pub fn has_pending_evaluations(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drain the store's event FIFO, dispatching each event. Create/delete
    /// events invoke the engine synchronously and may emit further events,
    /// which this loop picks up iteratively rather than recursing.
    pub fn process_store_events(&mut self, store: &mut AttributeStore) {
        while let Some(event) = store.pop_event() {
            self.dispatch(store, event);
        }
    }

    fn dispatch(&mut self, store: &mut AttributeStore, event: AttributeEvent) {
        let deleted = event.change == AttributeChange::Deleted;

        // Events only reach the engine for (type, state) pairs some loaded
        // assignment depends on; this stands in for per-pair callback
        // registration. Deletions still need their bookkeeping.
        let watched = match store.node_type(event.node) {
            Some(node_type) => {
                let state = match event.change {
                    AttributeChange::Updated => event.state,
                    AttributeChange::Created | AttributeChange::Deleted => ValueState::Reported,
                };
                self.engine.is_watched(node_type, state)
            }
            None => false,
        };

        if !watched {
            if deleted {
                self.forget_node(store, event.node);
            }
            return;
        }

        if self.control.mapping_paused() {
            debug!(node = %event.node, "ignoring event, the mapper is paused");
            if deleted {
                self.forget_node(store, event.node);
            }
            return;
        }

        if self.control.reactions_paused(event.node) {
            debug!(
                node = %event.node,
                "ignoring update, the mapper was instructed to ignore this node"
            );
            if deleted {
                self.forget_node(store, event.node);
            }
            return;
        }

        match event.change {
            AttributeChange::Created => {
                // Evaluate immediately on creation.
                self.engine.on_attribute_changed(
                    store,
                    &mut self.control,
                    event.node,
                    ValueState::Reported,
                    AttributeChange::Created,
                );
            }
            AttributeChange::Deleted => {
                // Evaluate immediately: after this the node's context is
                // gone. Also drop any stale queued update for it.
                self.engine.on_attribute_changed(
                    store,
                    &mut self.control,
                    event.node,
                    ValueState::Reported,
                    AttributeChange::Deleted,
                );
                self.forget_node(store, event.node);
            }
            AttributeChange::Updated => {
                self.queue.insert(event.node, event.state);
            }
        }
    }

    fn forget_node(&mut self, store: &mut AttributeStore, node: AttributeId) {
        self.control.resume_reactions(node);
        self.queue.remove_node(node);
        store.purge(node);
    }

    /// Evaluate exactly one pending update, after folding in any outstanding
    /// store events. Returns whether more updates are pending, i.e. whether
    /// the caller should schedule another turn.
    pub fn evaluate_next_update(&mut self, store: &mut AttributeStore) -> bool {
        self.process_store_events(store);

        debug!(pending = self.queue.len(), "pending attribute updates to evaluate");
        if let Some((node, state)) = self.queue.pop_first() {
            if store.node_exists(node) {
                debug!(node = %node, ?state, "processing update");
                self.engine.on_attribute_changed(
                    store,
                    &mut self.control,
                    node,
                    state,
                    AttributeChange::Updated,
                );
            }
            self.process_store_events(store);
        }
        !self.queue.is_empty()
    }

    /// Run evaluation turns until the queue settles. Test and shutdown
    /// convenience; production callers drive one turn per scheduler tick.
    pub fn run_to_completion(&mut self, store: &mut AttributeStore) {
        self.process_store_events(store);
        while self.evaluate_next_update(store) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_set_deduplicates() {
        let mut queue = UpdateQueue::default();
        let node = AttributeId::default();
        queue.insert(node, ValueState::Reported);
        queue.insert(node, ValueState::Reported);
        queue.insert(node, ValueState::Desired);
        assert_eq!(queue.len(), 2);

        queue.remove_node(node);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_propagation_control_flags() {
        let mut control = PropagationControl::new();
        let node = AttributeId::default();

        assert!(!control.reactions_paused(node));
        control.pause_reactions(node);
        assert!(control.reactions_paused(node));
        control.resume_reactions(node);
        assert!(!control.reactions_paused(node));

        assert!(!control.mapping_paused());
        control.pause_mapping();
        assert!(control.mapping_paused());
        control.resume_mapping();
        assert!(!control.mapping_paused());
    }
}
