//! In-memory attribute graph for the Attrium core.
//!
//! The store is a tree of typed nodes, each holding an optional *reported*
//! payload (last known device-side state) and an optional *desired* payload
//! (target state pending application). Nodes are addressed by copyable
//! [`AttributeId`] handles that are validated against a generation counter on
//! every access, so a stale handle can never reach another node's data.
//!
//! Change notification is event based: every mutation appends an
//! [`AttributeEvent`] to an internal FIFO which the mapper runtime drains.
//! Deletion is two-phase: [`AttributeStore::delete_node`] marks the subtree
//! and emits `Deleted` events while the nodes stay navigable, and
//! [`AttributeStore::purge`] reclaims a marked node once its event has been
//! consumed. This lets dependents read the context of a vanishing node before
//! it becomes unreachable.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod error;

pub use error::{Result, StoreError};

/// Attribute type identifier. Types are assigned by higher-level command
/// class code; the store only compares them.
pub type AttributeTypeId = u32;

/// Number of bytes in a numeric payload. Numbers are stored as `f64` in
/// little-endian byte order; payloads of any other length read back as
/// non-numeric.
const NUMERIC_PAYLOAD_LEN: usize = 8;

/// Opaque, copyable handle to a node in the store.
///
/// A handle is only meaningful together with the store that issued it. The
/// generation counter guards against slot reuse: once a node is purged, all
/// handles to it go stale and every accessor returns `None`/`false`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AttributeId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for AttributeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index)
    }
}

/// Which of the two value slots of a node an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueState {
    /// Last known actual device-side state.
    Reported,
    /// Target state pending application to the device.
    Desired,
}

/// Lifecycle of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeChange {
    Created,
    Updated,
    Deleted,
}

/// A single change notification emitted by the store.
///
/// Create and delete events are emitted for the [`ValueState::Reported`]
/// state, matching listeners registered on the reported side of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeEvent {
    pub node: AttributeId,
    pub state: ValueState,
    pub change: AttributeChange,
}

#[derive(Debug)]
struct NodeData {
    attribute_type: AttributeTypeId,
    parent: Option<AttributeId>,
    children: Vec<AttributeId>,
    reported: Option<Vec<u8>>,
    desired: Option<Vec<u8>>,
    marked_for_deletion: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    data: Option<NodeData>,
}

/// The attribute graph.
#[derive(Debug)]
pub struct AttributeStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: AttributeId,
    events: VecDeque<AttributeEvent>,
}

impl AttributeStore {
    /// Create a store with a single root node of the given type.
    ///
    /// The root creation does not emit an event; listeners attach after
    /// construction.
    pub fn new(root_type: AttributeTypeId) -> Self {
        let mut store = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: AttributeId::default(),
            events: VecDeque::new(),
        };
        store.root = store.allocate(root_type, None);
        store
    }

    /// Handle of the root node.
    pub fn root(&self) -> AttributeId {
        self.root
    }

    fn allocate(&mut self, attribute_type: AttributeTypeId, parent: Option<AttributeId>) -> AttributeId {
        let data = NodeData {
            attribute_type,
            parent,
            children: Vec::new(),
            reported: None,
            desired: None,
            marked_for_deletion: false,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.data = Some(data);
                AttributeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    data: Some(data),
                });
                AttributeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Resolve a handle to node data, including nodes marked for deletion.
    fn resolve(&self, id: AttributeId) -> Option<&NodeData> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.data.as_ref()
    }

    fn resolve_mut(&mut self, id: AttributeId) -> Option<&mut NodeData> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.data.as_mut()
    }

    fn resolve_live(&self, id: AttributeId) -> Option<&NodeData> {
        self.resolve(id).filter(|data| !data.marked_for_deletion)
    }

    /// Whether the handle refers to a live node. Nodes marked for deletion no
    /// longer exist, even though they remain navigable until purged.
    pub fn node_exists(&self, id: AttributeId) -> bool {
        self.resolve_live(id).is_some()
    }

    /// Whether the handle refers to a node marked for deletion but not yet
    /// purged.
    pub fn is_marked_for_deletion(&self, id: AttributeId) -> bool {
        self.resolve(id)
            .map(|data| data.marked_for_deletion)
            .unwrap_or(false)
    }

    /// Type of the node. Available for marked nodes too, so dependents can
    /// identify what is vanishing.
    pub fn node_type(&self, id: AttributeId) -> Option<AttributeTypeId> {
        self.resolve(id).map(|data| data.attribute_type)
    }

    /// Parent handle. Available for marked nodes.
    pub fn parent(&self, id: AttributeId) -> Option<AttributeId> {
        self.resolve(id).and_then(|data| data.parent)
    }

    /// Closest ancestor (self excluded) with the given type, marked or not.
    /// Callers that need a live ancestor check [`Self::node_exists`] on the
    /// result to tell "deleted" apart from "never existed".
    pub fn first_parent_of_type(
        &self,
        id: AttributeId,
        attribute_type: AttributeTypeId,
    ) -> Option<AttributeId> {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if self.node_type(node) == Some(attribute_type) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// All live children of a node, in insertion order.
    pub fn children(&self, id: AttributeId) -> Vec<AttributeId> {
        match self.resolve(id) {
            Some(data) => data
                .children
                .iter()
                .copied()
                .filter(|child| self.node_exists(*child))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Live children of a node with the given type.
    pub fn children_of_type(
        &self,
        id: AttributeId,
        attribute_type: AttributeTypeId,
    ) -> Vec<AttributeId> {
        self.children(id)
            .into_iter()
            .filter(|child| self.node_type(*child) == Some(attribute_type))
            .collect()
    }

    /// The `index`-th live child of the given type.
    pub fn child_by_type(
        &self,
        id: AttributeId,
        attribute_type: AttributeTypeId,
        index: usize,
    ) -> Option<AttributeId> {
        self.children_of_type(id, attribute_type).into_iter().nth(index)
    }

    /// First live child of the given type whose payload in `state` equals
    /// `value`.
    pub fn child_by_value(
        &self,
        id: AttributeId,
        attribute_type: AttributeTypeId,
        state: ValueState,
        value: &[u8],
    ) -> Option<AttributeId> {
        self.children_of_type(id, attribute_type)
            .into_iter()
            .find(|child| self.get_raw(*child, state) == Some(value))
    }

    /// Add a node under `parent`. Emits a `Created` event.
    pub fn add_node(
        &mut self,
        attribute_type: AttributeTypeId,
        parent: AttributeId,
    ) -> Result<AttributeId> {
        if self.resolve_live(parent).is_none() {
            return Err(StoreError::InvalidNode(parent));
        }
        let node = self.allocate(attribute_type, Some(parent));
        if let Some(data) = self.resolve_mut(parent) {
            data.children.push(node);
        }
        self.events.push_back(AttributeEvent {
            node,
            state: ValueState::Reported,
            change: AttributeChange::Created,
        });
        Ok(node)
    }

    /// Find a child of `parent` with the given type and value in `state`, or
    /// create it with that value.
    pub fn emplace_node(
        &mut self,
        attribute_type: AttributeTypeId,
        parent: AttributeId,
        state: ValueState,
        value: &[u8],
    ) -> Result<AttributeId> {
        if let Some(existing) = self.child_by_value(parent, attribute_type, state, value) {
            return Ok(existing);
        }
        let node = self.add_node(attribute_type, parent)?;
        self.set_raw(node, state, value.to_vec())?;
        Ok(node)
    }

    /// Mark a node and its subtree for deletion, children first, emitting a
    /// `Deleted` event per node. The nodes stay navigable (types, ancestry)
    /// until purged, but their values read as undefined and they no longer
    /// count as existing.
    pub fn delete_node(&mut self, id: AttributeId) -> Result<()> {
        if self.resolve_live(id).is_none() {
            return Err(StoreError::InvalidNode(id));
        }
        if id == self.root {
            return Err(StoreError::InvalidNode(id));
        }
        let children = self.children(id);
        for child in children {
            self.delete_node(child)?;
        }
        if let Some(data) = self.resolve_mut(id) {
            data.marked_for_deletion = true;
        }
        self.events.push_back(AttributeEvent {
            node: id,
            state: ValueState::Reported,
            change: AttributeChange::Deleted,
        });
        Ok(())
    }

    /// Reclaim a node previously marked for deletion. Invalidates all
    /// handles to it. No-op for live or stale handles.
    pub fn purge(&mut self, id: AttributeId) {
        let Some(data) = self.resolve(id) else {
            return;
        };
        if !data.marked_for_deletion {
            return;
        }
        let parent = data.parent;
        if let Some(parent) = parent {
            if let Some(parent_data) = self.resolve_mut(parent) {
                parent_data.children.retain(|child| *child != id);
            }
        }
        let slot = &mut self.slots[id.index as usize];
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    fn get_raw(&self, id: AttributeId, state: ValueState) -> Option<&[u8]> {
        let data = self.resolve_live(id)?;
        let value = match state {
            ValueState::Reported => data.reported.as_deref(),
            ValueState::Desired => data.desired.as_deref(),
        };
        value
    }

    fn set_raw(&mut self, id: AttributeId, state: ValueState, value: Vec<u8>) -> Result<()> {
        match self.resolve_mut(id) {
            Some(data) if !data.marked_for_deletion => {
                match state {
                    ValueState::Reported => data.reported = Some(value),
                    ValueState::Desired => data.desired = Some(value),
                }
            }
            _ => return Err(StoreError::InvalidNode(id)),
        }
        // An unchanged payload still produces an event: dedup on value is a
        // listener concern, not a store concern.
        self.events.push_back(AttributeEvent {
            node: id,
            state,
            change: AttributeChange::Updated,
        });
        Ok(())
    }

    /// Reported payload, if defined.
    pub fn get_reported_raw(&self, id: AttributeId) -> Option<&[u8]> {
        self.get_raw(id, ValueState::Reported)
    }

    /// Desired payload, if defined.
    pub fn get_desired_raw(&self, id: AttributeId) -> Option<&[u8]> {
        self.get_raw(id, ValueState::Desired)
    }

    /// Desired payload if defined, else the reported payload.
    pub fn desired_or_reported(&self, id: AttributeId) -> Option<Vec<u8>> {
        self.get_desired_raw(id)
            .or_else(|| self.get_reported_raw(id))
            .map(|bytes| bytes.to_vec())
    }

    /// Set the reported payload. Emits an `Updated` event.
    pub fn set_reported_raw(&mut self, id: AttributeId, value: Vec<u8>) -> Result<()> {
        self.set_raw(id, ValueState::Reported, value)
    }

    /// Set the desired payload. Emits an `Updated` event.
    pub fn set_desired_raw(&mut self, id: AttributeId, value: Vec<u8>) -> Result<()> {
        self.set_raw(id, ValueState::Desired, value)
    }

    fn get_number(&self, id: AttributeId, state: ValueState) -> Option<f64> {
        let bytes = self.get_raw(id, state)?;
        let bytes: [u8; NUMERIC_PAYLOAD_LEN] = bytes.try_into().ok()?;
        Some(f64::from_le_bytes(bytes))
    }

    /// Reported payload interpreted as a number. `None` when undefined or
    /// when the payload is not a numeric encoding.
    pub fn get_reported_number(&self, id: AttributeId) -> Option<f64> {
        self.get_number(id, ValueState::Reported)
    }

    /// Desired payload interpreted as a number.
    pub fn get_desired_number(&self, id: AttributeId) -> Option<f64> {
        self.get_number(id, ValueState::Desired)
    }

    /// Payload in `state` interpreted as a number.
    pub fn get_number_in_state(&self, id: AttributeId, state: ValueState) -> Option<f64> {
        self.get_number(id, state)
    }

    /// Set the reported payload to a numeric encoding.
    pub fn set_reported_number(&mut self, id: AttributeId, value: f64) -> Result<()> {
        self.set_raw(id, ValueState::Reported, value.to_le_bytes().to_vec())
    }

    /// Set the desired payload to a numeric encoding.
    pub fn set_desired_number(&mut self, id: AttributeId, value: f64) -> Result<()> {
        self.set_raw(id, ValueState::Desired, value.to_le_bytes().to_vec())
    }

    /// Undefine the reported payload. Emits an `Updated` event.
    pub fn undefine_reported(&mut self, id: AttributeId) -> Result<()> {
        match self.resolve_mut(id) {
            Some(data) if !data.marked_for_deletion => data.reported = None,
            _ => return Err(StoreError::InvalidNode(id)),
        }
        self.events.push_back(AttributeEvent {
            node: id,
            state: ValueState::Reported,
            change: AttributeChange::Updated,
        });
        Ok(())
    }

    /// Undefine the desired payload. Emits an `Updated` event.
    pub fn undefine_desired(&mut self, id: AttributeId) -> Result<()> {
        match self.resolve_mut(id) {
            Some(data) if !data.marked_for_deletion => data.desired = None,
            _ => return Err(StoreError::InvalidNode(id)),
        }
        self.events.push_back(AttributeEvent {
            node: id,
            state: ValueState::Desired,
            change: AttributeChange::Updated,
        });
        Ok(())
    }

    /// Whether the reported payload is defined.
    pub fn reported_defined(&self, id: AttributeId) -> bool {
        self.get_reported_raw(id).is_some()
    }

    /// Whether the desired payload is defined.
    pub fn desired_defined(&self, id: AttributeId) -> bool {
        self.get_desired_raw(id).is_some()
    }

    /// Pop the oldest pending change event.
    pub fn pop_event(&mut self) -> Option<AttributeEvent> {
        self.events.pop_front()
    }

    /// Drain all pending change events.
    pub fn take_events(&mut self) -> Vec<AttributeEvent> {
        self.events.drain(..).collect()
    }

    /// Whether change events are pending.
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Number of pending change events. Used as a high-water mark by callers
    /// that need to discard events emitted inside a suppression window.
    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }

    /// Discard events emitted at or after `mark` (a value previously obtained
    /// from [`Self::pending_event_count`], with no pops in between). With
    /// `only_node` set, only that node's events are discarded. Discarded
    /// `Deleted` events purge their node immediately, since nobody will
    /// consume them.
    pub fn discard_events_since(&mut self, mark: usize, only_node: Option<AttributeId>) {
        let tail = self.events.split_off(mark.min(self.events.len()));
        let mut purge_list = Vec::new();
        for event in tail {
            let discard = only_node.map(|node| node == event.node).unwrap_or(true);
            if discard {
                debug!(node = %event.node, ?event.change, "discarding suppressed event");
                if event.change == AttributeChange::Deleted {
                    purge_list.push(event.node);
                }
            } else {
                self.events.push_back(event);
            }
        }
        for node in purge_list {
            self.purge(node);
        }
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.data
                    .as_ref()
                    .map(|data| !data.marked_for_deletion)
                    .unwrap_or(false)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: AttributeTypeId = 1;
    const ENDPOINT: AttributeTypeId = 2;
    const SENSOR: AttributeTypeId = 3;

    fn store_with_endpoint() -> (AttributeStore, AttributeId) {
        let mut store = AttributeStore::new(ROOT);
        let endpoint = store.add_node(ENDPOINT, store.root()).unwrap();
        store.take_events();
        (store, endpoint)
    }

    #[test]
    fn test_add_and_navigate() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();

        assert_eq!(store.node_type(sensor), Some(SENSOR));
        assert_eq!(store.parent(sensor), Some(endpoint));
        assert_eq!(store.first_parent_of_type(sensor, ROOT), Some(store.root()));
        assert_eq!(store.child_by_type(endpoint, SENSOR, 0), Some(sensor));
        assert_eq!(store.child_by_type(endpoint, SENSOR, 1), None);
    }

    #[test]
    fn test_numeric_round_trip_and_bad_payload() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();

        store.set_reported_number(sensor, 21.5).unwrap();
        assert_eq!(store.get_reported_number(sensor), Some(21.5));

        // A payload of the wrong length is not a number.
        store.set_reported_raw(sensor, vec![1, 2, 3]).unwrap();
        assert_eq!(store.get_reported_number(sensor), None);
        assert_eq!(store.get_reported_raw(sensor), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_child_by_value() {
        let (mut store, endpoint) = store_with_endpoint();
        let a = store.add_node(SENSOR, endpoint).unwrap();
        let b = store.add_node(SENSOR, endpoint).unwrap();
        store.set_reported_number(a, 1.0).unwrap();
        store.set_reported_number(b, 2.0).unwrap();

        let found = store.child_by_value(
            endpoint,
            SENSOR,
            ValueState::Reported,
            &2.0f64.to_le_bytes(),
        );
        assert_eq!(found, Some(b));
    }

    #[test]
    fn test_emplace_reuses_existing() {
        let (mut store, endpoint) = store_with_endpoint();
        let value = 4.0f64.to_le_bytes();
        let first = store
            .emplace_node(SENSOR, endpoint, ValueState::Reported, &value)
            .unwrap();
        let second = store
            .emplace_node(SENSOR, endpoint, ValueState::Reported, &value)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.children_of_type(endpoint, SENSOR).len(), 1);
    }

    #[test]
    fn test_delete_marks_then_purge_invalidates() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();
        store.set_reported_number(sensor, 7.0).unwrap();
        store.take_events();

        store.delete_node(sensor).unwrap();
        // Marked: no longer exists, values undefined, but still navigable.
        assert!(!store.node_exists(sensor));
        assert!(store.is_marked_for_deletion(sensor));
        assert_eq!(store.get_reported_number(sensor), None);
        assert_eq!(store.node_type(sensor), Some(SENSOR));
        assert_eq!(store.parent(sensor), Some(endpoint));
        assert!(store.children_of_type(endpoint, SENSOR).is_empty());

        store.purge(sensor);
        assert_eq!(store.node_type(sensor), None);

        // The slot may be reused; the old handle stays stale.
        let replacement = store.add_node(SENSOR, endpoint).unwrap();
        assert_ne!(replacement, sensor);
        assert!(!store.node_exists(sensor));
    }

    #[test]
    fn test_delete_emits_children_first() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();
        store.take_events();

        store.delete_node(endpoint).unwrap();
        let events: Vec<_> = store.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node, sensor);
        assert_eq!(events[0].change, AttributeChange::Deleted);
        assert_eq!(events[1].node, endpoint);
    }

    #[test]
    fn test_unchanged_value_still_emits_event() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();
        store.set_reported_number(sensor, 5.0).unwrap();
        store.take_events();

        store.set_reported_number(sensor, 5.0).unwrap();
        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change, AttributeChange::Updated);
        assert_eq!(events[0].state, ValueState::Reported);
    }

    #[test]
    fn test_discard_events_since_purges_dropped_deletes() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();
        store.take_events();

        let mark = store.pending_event_count();
        store.set_reported_number(sensor, 1.0).unwrap();
        store.delete_node(sensor).unwrap();
        store.discard_events_since(mark, Some(sensor));

        assert!(!store.has_pending_events());
        // The dropped Deleted event purged the node.
        assert_eq!(store.node_type(sensor), None);
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let mut store = AttributeStore::new(ROOT);
        assert!(store.delete_node(store.root()).is_err());
    }

    #[test]
    fn test_desired_or_reported_prefers_desired() {
        let (mut store, endpoint) = store_with_endpoint();
        let sensor = store.add_node(SENSOR, endpoint).unwrap();
        store.set_reported_number(sensor, 1.0).unwrap();
        assert_eq!(
            store.desired_or_reported(sensor),
            Some(1.0f64.to_le_bytes().to_vec())
        );
        store.set_desired_number(sensor, 2.0).unwrap();
        assert_eq!(
            store.desired_or_reported(sensor),
            Some(2.0f64.to_le_bytes().to_vec())
        );
    }
}
