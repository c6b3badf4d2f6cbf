//! Per-client relay sessions.
//!
//! Every connected viewer gets its own `RelaySession` and its own upstream
//! connection. Sessions share only the read-only fallback buffer and the
//! detection pipeline's cached results.

mod session;

pub use session::{Phase, RelayContext, RelaySession, SessionSettings, SessionStats};
