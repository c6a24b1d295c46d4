//! Milter Engine - mail filter protocol engine
//!
//! Speaks the milter protocol to a mail transfer agent (Sendmail, Postfix)
//! and hands every stage of an SMTP transaction to a user supplied
//! [`Milter`] implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │     MTA     │─────▶│ PacketCodec  │─────▶│  Dispatcher  │─────▶│    Milter    │
//! │   (agent)   │ TCP/ │  (frames)    │      │ (session +   │      │  (handlers)  │
//! │             │◀─────│              │◀─────│  state)      │◀─────│              │
//! └─────────────┘ unix └──────────────┘      └──────────────┘      └──────────────┘
//! ```
//!
//! One task runs per agent connection; the [`Registry`] and settings are
//! shared read-only between them.

pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod macros;
pub mod milter;
pub mod negotiate;
pub mod proto;
pub mod server;
pub mod session;

// Re-export commonly used items
pub use capabilities::{Action, ActionSet, StepSet};
pub use config::{Config, ConnSpec};
pub use dispatch::{Dispatcher, Outcome};
pub use macros::MacroStage;
pub use milter::{Milter, Registry, Verdict};
pub use negotiate::{Negotiated, NegotiationOutcome, Offer, SymbolList};
pub use proto::{FrameError, PeerAddr, SmtpReply};
pub use server::{ConnectionSettings, Listener, Server};
pub use session::{Phase, Session, Stage};

use std::time::Duration;
use thiserror::Error;

/// Error types for the milter engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("Unexpected {stage} packet in phase {phase}")]
    ProtocolOrder { stage: Stage, phase: Phase },

    #[error("Verdict {verdict} not allowed for {stage}")]
    IllegalVerdict { stage: Stage, verdict: Verdict },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Action not negotiated: {action}")]
    Capability { action: Action },

    #[error("{operation} is only allowed at end of message (current stage: {stage})")]
    ModificationOutsideEndOfMessage {
        operation: &'static str,
        stage: Stage,
    },

    #[error("Reply has {lines} lines (limit {max})")]
    ResourceLimit { lines: usize, max: usize },

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the error ends the agent connection it happened on.
    /// Errors returned to handlers by session methods are not.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Framing(_)
            | Self::ProtocolOrder { .. }
            | Self::IllegalVerdict { .. }
            | Self::Negotiation(_)
            | Self::Timeout(_) => true,
            Self::Capability { .. }
            | Self::ModificationOutsideEndOfMessage { .. }
            | Self::ResourceLimit { .. }
            | Self::InvalidReply(_)
            | Self::InvalidArgument(_)
            | Self::InvalidConfig(_) => false,
        }
    }
}

/// Result type for the milter engine
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
