//! Protocol resolution for the Attrium core.
//!
//! When a desired value diverges from a reported one (or a reported value is
//! missing altogether), this crate drives the protocol exchange that brings
//! the device in line: rule functions registered per attribute type build
//! the frames, an injected [`FrameTransport`] carries them, and a strict
//! single-outstanding-transaction state machine tracks the exchange with a
//! watchdog timeout and completion-driven reconciliation of the resolution
//! group.
//!
//! No wire format is defined here; the crate is generic over whatever the
//! rule functions encode.

pub mod error;
pub mod resolver;
pub mod rule;

pub use error::TransportError;
pub use resolver::{
    ExecuteStatus, FrameTransport, ResolverConfig, ResolverState, RuleResolver, SendStatus,
};
pub use rule::{FrameStatus, RuleBook, RuleFunction, RuleKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
