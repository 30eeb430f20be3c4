//! Convenience re-exports for common `microchat` types.
//!
//! ```ignore
//! use microchat::prelude::*;
//! ```
//!
//! Covers the client façade, its configuration, and the message and result
//! types. Lower-level pieces (parser, transport, executor) are left to
//! their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatMessage, ChatOptions, ErrorKind, ExecutionResult, Role, TokenUsage, ToolDefinition,
    ToolInvocation,
};

// ── Client ──────────────────────────────────────────────────────────
pub use crate::client::ChatClient;
pub use crate::config::{ClientConfig, SlotConfig};
pub use crate::provider::Provider;

// ── Background runs ─────────────────────────────────────────────────
pub use crate::api::retry::RetryConfig;
pub use crate::slot::{AsyncStatus, CancelFlag};
