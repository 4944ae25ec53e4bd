//! The execution state machine: a single outstanding frame resolution with a
//! watchdog timeout and completion-driven reconciliation.
//!
//! `execute` asks the rule function for a frame and hands it to the injected
//! transport; `on_send_complete` reconciles the resolution group's values
//! according to the completion status and returns the machine to idle. The
//! watchdog is polled, not scheduled: callers invoke
//! [`RuleResolver::check_timeout`] from their tick and an expired deadline
//! synthesizes a `Fail` completion so a lost frame can never wedge the
//! machine.

use std::time::{Duration, Instant};

use attrium_store::{AttributeId, AttributeStore, AttributeTypeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::TransportError;
use crate::rule::{FrameStatus, RuleBook, RuleFunction, RuleKind};

/// Outcome of [`RuleResolver::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    /// A frame was sent; the resolution completes via `on_send_complete`.
    Ok,
    /// A frame was sent and more frames will follow.
    InProgress,
    /// No rule is registered for the node's type, or the node is gone.
    NotFound,
    /// Another resolution is outstanding.
    Busy,
    /// The rule produced a frame larger than the configured maximum.
    WouldOverflow,
    /// The transport refused the frame; retry later.
    NotReady,
    /// Nothing to send, the attribute is already in the requested state.
    AlreadyExists,
    /// A rule precondition is not met yet.
    IsWaiting,
    /// The registered rule has no function for the requested kind, or its
    /// function failed outright.
    NotSupported,
}

/// Completion status delivered by the transport for a sent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Delivered, without device-side confirmation of the effect.
    Ok,
    /// Delivered, device-side execution still pending.
    OkExecutionPending,
    /// Delivered and the device confirmed the effect.
    OkExecutionVerified,
    /// Delivered but the device rejected the effect.
    OkExecutionFailed,
    /// Not delivered.
    Fail,
    /// Another component already took care of this resolution.
    AlreadyHandled,
    /// The resolution was aborted by the caller.
    Aborted,
}

/// Frame sink injected by the integration. `send` must return immediately;
/// the completion arrives later through
/// [`RuleResolver::on_send_complete`].
pub trait FrameTransport {
    fn send(
        &mut self,
        node: AttributeId,
        frame: &[u8],
        kind: RuleKind,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Watchdog interval after which a resolution without a completion is
    /// failed.
    pub resolution_timeout: Duration,
    /// Largest frame the transport accepts.
    pub max_frame_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            resolution_timeout: Duration::from_secs(60),
            max_frame_size: 255,
        }
    }
}

/// The resolution state machine. At most one frame is outstanding globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    ExecutingSet(AttributeId),
    ExecutingGet(AttributeId),
}

impl ResolverState {
    fn pending(&self) -> Option<(AttributeId, RuleKind)> {
        match *self {
            ResolverState::Idle => None,
            ResolverState::ExecutingSet(node) => Some((node, RuleKind::Set)),
            ResolverState::ExecutingGet(node) => Some((node, RuleKind::Get)),
        }
    }
}

type CompletionHandler = Box<dyn FnMut(AttributeId, Duration)>;

/// The protocol resolver: rule book plus execution state machine.
pub struct RuleResolver {
    rules: RuleBook,
    config: ResolverConfig,
    state: ResolverState,
    needs_more_frames: bool,
    deadline: Option<Instant>,
    completion: Option<CompletionHandler>,
}

impl RuleResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            rules: RuleBook::new(),
            config,
            state: ResolverState::Idle,
            needs_more_frames: false,
            deadline: None,
            completion: None,
        }
    }

    /// Install the handler invoked whenever a resolution finishes, with the
    /// resolved node and the elapsed transmission time.
    pub fn on_resolution_complete(
        &mut self,
        handler: impl FnMut(AttributeId, Duration) + 'static,
    ) {
        self.completion = Some(Box::new(handler));
    }

    /// Register the rule functions for an attribute type.
    pub fn register_rule(
        &mut self,
        attribute_type: AttributeTypeId,
        set_function: Option<RuleFunction>,
        get_function: Option<RuleFunction>,
    ) {
        self.rules
            .register_rule(attribute_type, set_function, get_function);
    }

    /// Register a listener for attribute types gaining a set rule. Already
    /// registered set rules are replayed immediately.
    pub fn register_set_rule_listener(
        &mut self,
        listener: impl FnMut(AttributeTypeId) + 'static,
    ) {
        self.rules.register_set_rule_listener(listener);
    }

    /// Override the grouping depth of an attribute type (default 1).
    pub fn set_grouping_depth(&mut self, attribute_type: AttributeTypeId, depth: usize) {
        self.rules.set_grouping_depth(attribute_type, depth);
    }

    pub fn has_set_rule(&self, attribute_type: AttributeTypeId) -> bool {
        self.rules.has_set_rule(attribute_type)
    }

    pub fn has_get_rule(&self, attribute_type: AttributeTypeId) -> bool {
        self.rules.has_get_rule(attribute_type)
    }

    /// Whether a resolution is outstanding.
    pub fn is_busy(&self) -> bool {
        self.state != ResolverState::Idle
    }

    /// The node being resolved, if any.
    pub fn pending_node(&self) -> Option<AttributeId> {
        self.state.pending().map(|(node, _)| node)
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Start resolving a node: build a frame with the registered rule
    /// function and hand it to the transport.
    pub fn execute(
        &mut self,
        store: &AttributeStore,
        transport: &mut dyn FrameTransport,
        node: AttributeId,
        kind: RuleKind,
    ) -> ExecuteStatus {
        let Some(node_type) = store.node_type(node) else {
            debug!(node = %node, "cannot resolve, the node is gone");
            return ExecuteStatus::NotFound;
        };
        let function = match self.rules.rule_function(node_type, kind) {
            Some(function) => function,
            None if self.rules.has_rule(node_type) => {
                debug!(
                    node = %node,
                    attribute_type = node_type,
                    ?kind,
                    "rule has no function for this kind"
                );
                return ExecuteStatus::NotSupported;
            }
            None => {
                debug!(node = %node, attribute_type = node_type, "no rule registered");
                return ExecuteStatus::NotFound;
            }
        };
        if self.state != ResolverState::Idle {
            debug!(node = %node, pending = ?self.pending_node(), "resolver is busy");
            return ExecuteStatus::Busy;
        }

        let mut frame = Vec::new();
        let status = function.generate(store, node, &mut frame);
        match status {
            FrameStatus::Ok | FrameStatus::InProgress => {
                if frame.len() > self.config.max_frame_size {
                    warn!(
                        node = %node,
                        frame_size = frame.len(),
                        max_frame_size = self.config.max_frame_size,
                        "rule produced an oversized frame"
                    );
                    return ExecuteStatus::WouldOverflow;
                }
                if let Err(err) = transport.send(node, &frame, kind) {
                    error!(node = %node, %err, "failed to send resolution frame");
                    return ExecuteStatus::NotReady;
                }
                self.state = match kind {
                    RuleKind::Set => ResolverState::ExecutingSet(node),
                    RuleKind::Get => ResolverState::ExecutingGet(node),
                };
                self.needs_more_frames = status == FrameStatus::InProgress;
                self.deadline = Some(Instant::now() + self.config.resolution_timeout);
                debug!(
                    node = %node,
                    ?kind,
                    needs_more_frames = self.needs_more_frames,
                    "resolution frame sent"
                );
                if self.needs_more_frames {
                    ExecuteStatus::InProgress
                } else {
                    ExecuteStatus::Ok
                }
            }
            FrameStatus::AlreadyExists => ExecuteStatus::AlreadyExists,
            FrameStatus::IsWaiting => ExecuteStatus::IsWaiting,
            FrameStatus::Failure => {
                error!(
                    node = %node,
                    attribute_type = node_type,
                    ?kind,
                    "rule function failed to produce a frame"
                );
                ExecuteStatus::NotSupported
            }
        }
    }

    /// Abort the pending resolution of a node. A no-op when the node is not
    /// the pending one.
    pub fn abort(&mut self, store: &mut AttributeStore, node: AttributeId) {
        match self.state.pending() {
            Some((pending, kind)) if pending == node => {
                debug!(node = %node, "aborting pending resolution");
                self.on_send_complete(store, node, kind, SendStatus::Aborted, Duration::ZERO);
            }
            _ => debug!(node = %node, "nothing to abort"),
        }
    }

    /// Poll the watchdog. An expired deadline synthesizes a `Fail`
    /// completion for the pending node, so a lost completion can never leave
    /// the machine stuck.
    pub fn check_timeout(&mut self, store: &mut AttributeStore, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if let Some((node, kind)) = self.state.pending() {
            warn!(node = %node, ?kind, "resolution timed out, giving up");
            self.on_send_complete(
                store,
                node,
                kind,
                SendStatus::Fail,
                self.config.resolution_timeout,
            );
        }
    }

    /// Completion of a sent frame. Reconciles the node's resolution group
    /// and, when the node is the pending one, returns the machine to idle
    /// and invokes the completion handler.
    pub fn on_send_complete(
        &mut self,
        store: &mut AttributeStore,
        node: AttributeId,
        kind: RuleKind,
        status: SendStatus,
        elapsed: Duration,
    ) {
        debug!(node = %node, ?kind, ?status, "resolution frame completed");

        // A multi-frame exchange only reconciles on its final frame.
        let awaiting_more = self.pending_node() == Some(node) && self.needs_more_frames;

        if kind == RuleKind::Set {
            let group = self.rules.group_nodes(store, node, kind);
            match status {
                SendStatus::Ok => {
                    // The device accepted the frame but did not confirm the
                    // effect: drop the reported value so a get fetches it.
                    let _ = store.undefine_reported(node);
                    if !awaiting_more {
                        for &member in &group {
                            let _ = store.undefine_reported(member);
                            let _ = store.undefine_desired(member);
                        }
                    }
                }
                SendStatus::OkExecutionVerified => {
                    if !awaiting_more {
                        for &member in &group {
                            if let Some(desired) =
                                store.get_desired_raw(member).map(<[u8]>::to_vec)
                            {
                                let _ = store.set_reported_raw(member, desired);
                                let _ = store.undefine_desired(member);
                            }
                        }
                    }
                }
                SendStatus::OkExecutionFailed => {
                    if !awaiting_more {
                        for &member in &group {
                            let _ = store.undefine_reported(member);
                            let _ = store.undefine_desired(member);
                        }
                    }
                }
                SendStatus::Fail => {
                    // Roll back: the desired values will not be applied.
                    for &member in &group {
                        let _ = store.undefine_desired(member);
                    }
                }
                SendStatus::OkExecutionPending
                | SendStatus::AlreadyHandled
                | SendStatus::Aborted => {}
            }
        }

        if self.pending_node() == Some(node) {
            self.state = ResolverState::Idle;
            self.deadline = None;
            self.needs_more_frames = false;
            if let Some(completion) = &mut self.completion {
                completion(node, elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.resolution_timeout, Duration::from_secs(60));
        assert_eq!(config.max_frame_size, 255);
    }

    #[test]
    fn test_state_pending() {
        let node = AttributeId::default();
        assert_eq!(ResolverState::Idle.pending(), None);
        assert_eq!(
            ResolverState::ExecutingSet(node).pending(),
            Some((node, RuleKind::Set))
        );
        assert_eq!(
            ResolverState::ExecutingGet(node).pending(),
            Some((node, RuleKind::Get))
        );
    }
}
