//! The rule book: per-type get/set rule functions, resolution grouping, and
//! set-rule listeners.
//!
//! Rules are provided by higher-level protocol code. Several attribute types
//! may register the very same set (or get) function; those types form a
//! *resolution group* and are reconciled together when a frame covering them
//! completes. Grouping therefore keys on function identity, which is why
//! [`RuleFunction`] compares by pointer rather than by behavior.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use attrium_store::{AttributeId, AttributeStore, AttributeTypeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which flavor of rule a frame belongs to: a Set pushes the desired value
/// towards the device, a Get fetches the reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Set,
    Get,
}

/// Status returned by a rule function after being asked to build a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// A frame was written and it is the last one needed.
    Ok,
    /// A frame was written but more frames will be needed after it
    /// completes.
    InProgress,
    /// Nothing to send, the attribute is already in the requested state.
    AlreadyExists,
    /// A precondition is not met yet; retry once it clears.
    IsWaiting,
    /// The rule cannot produce a frame for this node at all.
    Failure,
}

type FrameGenerator = dyn Fn(&AttributeStore, AttributeId, &mut Vec<u8>) -> FrameStatus;

/// A frame-building rule function.
///
/// Cloning is cheap and clones compare equal: equality is pointer identity,
/// which is what resolution grouping keys on.
#[derive(Clone)]
pub struct RuleFunction(Rc<FrameGenerator>);

impl RuleFunction {
    pub fn new(
        function: impl Fn(&AttributeStore, AttributeId, &mut Vec<u8>) -> FrameStatus + 'static,
    ) -> Self {
        Self(Rc::new(function))
    }

    /// Ask the rule to build a frame for `node` into `frame`.
    pub fn generate(
        &self,
        store: &AttributeStore,
        node: AttributeId,
        frame: &mut Vec<u8>,
    ) -> FrameStatus {
        (self.0)(store, node, frame)
    }

    fn identity(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for RuleFunction {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.identity(), other.identity())
    }
}

impl Eq for RuleFunction {}

impl fmt::Debug for RuleFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuleFunction").field(&self.identity()).finish()
    }
}

struct Rule {
    set_function: Option<RuleFunction>,
    get_function: Option<RuleFunction>,
}

/// Registry of rule functions keyed by attribute type, with resolution
/// grouping and set-rule notification.
#[derive(Default)]
pub struct RuleBook {
    rules: BTreeMap<AttributeTypeId, Rule>,
    set_listeners: Vec<Box<dyn FnMut(AttributeTypeId)>>,
    grouping_depth: BTreeMap<AttributeTypeId, usize>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule functions for an attribute type. Listeners are
    /// notified when a set rule is added, so upstream components learn the
    /// type became writable.
    pub fn register_rule(
        &mut self,
        attribute_type: AttributeTypeId,
        set_function: Option<RuleFunction>,
        get_function: Option<RuleFunction>,
    ) {
        debug!(
            attribute_type,
            has_set = set_function.is_some(),
            has_get = get_function.is_some(),
            "registering resolution rule"
        );
        let added_set_rule = set_function.is_some();
        if self
            .rules
            .insert(
                attribute_type,
                Rule {
                    set_function,
                    get_function,
                },
            )
            .is_some()
        {
            warn!(attribute_type, "overwriting previously registered rule");
        }
        if added_set_rule {
            for listener in &mut self.set_listeners {
                listener(attribute_type);
            }
        }
    }

    /// Register a listener invoked for every attribute type that gains a set
    /// rule. Types already carrying a set rule are replayed immediately.
    pub fn register_set_rule_listener(
        &mut self,
        mut listener: impl FnMut(AttributeTypeId) + 'static,
    ) {
        for (&attribute_type, rule) in &self.rules {
            if rule.set_function.is_some() {
                listener(attribute_type);
            }
        }
        self.set_listeners.push(Box::new(listener));
    }

    /// Whether any rule entry is registered for the type.
    pub fn has_rule(&self, attribute_type: AttributeTypeId) -> bool {
        self.rules.contains_key(&attribute_type)
    }

    pub fn has_set_rule(&self, attribute_type: AttributeTypeId) -> bool {
        self.rules
            .get(&attribute_type)
            .map(|rule| rule.set_function.is_some())
            .unwrap_or(false)
    }

    pub fn has_get_rule(&self, attribute_type: AttributeTypeId) -> bool {
        self.rules
            .get(&attribute_type)
            .map(|rule| rule.get_function.is_some())
            .unwrap_or(false)
    }

    /// The rule function for a type and kind, if registered.
    pub fn rule_function(
        &self,
        attribute_type: AttributeTypeId,
        kind: RuleKind,
    ) -> Option<RuleFunction> {
        let rule = self.rules.get(&attribute_type)?;
        match kind {
            RuleKind::Set => rule.set_function.clone(),
            RuleKind::Get => rule.get_function.clone(),
        }
    }

    /// Override the grouping depth of an attribute type. Depth is the number
    /// of ancestors to walk up before collecting group members; the default
    /// of 1 groups siblings.
    pub fn set_grouping_depth(&mut self, attribute_type: AttributeTypeId, depth: usize) {
        self.grouping_depth.insert(attribute_type, depth);
    }

    fn grouping_depth(&self, attribute_type: AttributeTypeId) -> usize {
        self.grouping_depth.get(&attribute_type).copied().unwrap_or(1)
    }

    /// All attribute types whose function for `kind` is the very same as the
    /// given type's. Always contains the type itself.
    pub fn group_types(
        &self,
        attribute_type: AttributeTypeId,
        kind: RuleKind,
    ) -> BTreeSet<AttributeTypeId> {
        let mut types = BTreeSet::from([attribute_type]);
        if let Some(function) = self.rule_function(attribute_type, kind) {
            for (&other_type, rule) in &self.rules {
                let other_function = match kind {
                    RuleKind::Set => rule.set_function.as_ref(),
                    RuleKind::Get => rule.get_function.as_ref(),
                };
                if other_function == Some(&function) {
                    types.insert(other_type);
                }
            }
        }
        types
    }

    /// The resolution group of a node: among descendants at exactly
    /// `depth(node.type)` below the `depth`-th ancestor, every node whose
    /// type shares the node's rule function for `kind`.
    pub fn group_nodes(
        &self,
        store: &AttributeStore,
        node: AttributeId,
        kind: RuleKind,
    ) -> Vec<AttributeId> {
        let Some(node_type) = store.node_type(node) else {
            return vec![node];
        };
        let types = self.group_types(node_type, kind);
        let depth = self.grouping_depth(node_type);

        let mut ancestor = node;
        for _ in 0..depth {
            match store.parent(ancestor) {
                Some(parent) => ancestor = parent,
                None => return vec![node],
            }
        }

        let mut members = Vec::new();
        descendants_at_depth(store, ancestor, depth, &mut members);
        members.retain(|member| {
            store
                .node_type(*member)
                .map(|t| types.contains(&t))
                .unwrap_or(false)
        });
        members
    }
}

fn descendants_at_depth(
    store: &AttributeStore,
    node: AttributeId,
    depth: usize,
    out: &mut Vec<AttributeId>,
) {
    if depth == 0 {
        out.push(node);
        return;
    }
    for child in store.children(node) {
        descendants_at_depth(store, child, depth - 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_rule() -> RuleFunction {
        RuleFunction::new(|_, _, _| FrameStatus::Ok)
    }

    #[test]
    fn test_rule_function_identity() {
        let a = noop_rule();
        let b = noop_rule();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_group_types_shares_function() {
        let shared = noop_rule();
        let mut book = RuleBook::new();
        book.register_rule(10, Some(shared.clone()), None);
        book.register_rule(11, Some(shared.clone()), None);
        book.register_rule(12, Some(noop_rule()), None);

        let group = book.group_types(10, RuleKind::Set);
        assert!(group.contains(&10));
        assert!(group.contains(&11));
        assert!(!group.contains(&12));

        // The get side of type 10 has no function, so it groups alone.
        assert_eq!(book.group_types(10, RuleKind::Get).len(), 1);
    }

    #[test]
    fn test_set_rule_listener_replay() {
        let mut book = RuleBook::new();
        book.register_rule(10, Some(noop_rule()), None);
        book.register_rule(11, None, Some(noop_rule()));

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = std::rc::Rc::clone(&seen);
        book.register_set_rule_listener(move |attribute_type| {
            sink.borrow_mut().push(attribute_type)
        });
        // Replayed for the existing set rule only.
        assert_eq!(*seen.borrow(), vec![10]);

        book.register_rule(12, Some(noop_rule()), None);
        assert_eq!(*seen.borrow(), vec![10, 12]);
    }
}
