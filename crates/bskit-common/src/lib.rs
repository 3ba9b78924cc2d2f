//! Shared domain types for bskit build sessions.
//!
//! Everything here is plain data: the build request ([`BuildSpec`]), the
//! identity of a running build ([`SessionId`], [`BuildKey`]), its lifecycle
//! ([`SessionState`], [`SessionStatus`]) and the log lines it produces
//! ([`LogEvent`]). All wire-facing types serialise with camelCase field names.

pub mod event;
pub mod session;
pub mod spec;

pub use event::{LogEvent, LogStream};
pub use session::{FailureReport, SessionId, SessionState, SessionStatus};
pub use spec::{BuildKey, BuildSpec, ParsePlatformError, Platform};
