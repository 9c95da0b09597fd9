//! Request/response payloads and call correlation.

pub mod correlation;
pub mod message;

pub use correlation::{CorrelationTable, PendingCall, Resolution, ResponseCallback};
pub use message::{RemoteError, Request, Response, TIMEOUT_MESSAGE, new_uid};
