//! Network-facing layer: SSE parsing, retry, transport, and request execution.
//!
//! - [`retry`]: which statuses are transient and how long to wait before the
//!   next attempt (capped exponential backoff, `Retry-After` aware).
//! - [`streaming`]: incremental SSE parser for the three supported wire
//!   grammars. Produces text fragments, tool calls, and a completion signal.
//! - [`transport`]: the [`Transport`](transport::Transport) collaborator and
//!   a `reqwest`-backed implementation.
//! - [`executor`]: [`RequestExecutor`](executor::RequestExecutor), the
//!   attempt loop tying codec, transport, parser, and retry together.

pub mod executor;
pub mod retry;
pub mod streaming;
pub mod transport;

pub use executor::RequestExecutor;
pub use retry::{RetryConfig, classify_status, delay_for, is_retryable};
pub use streaming::{StreamEvent, StreamParser, WireFormat};
pub use transport::{
    ChunkControl, HttpTransport, StreamOutcome, Transport, TransportResponse, WireRequest,
};
