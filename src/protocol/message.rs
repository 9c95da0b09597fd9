//! Request and response payloads.
//!
//! Both travel as JSON in the last frame of an envelope:
//!
//! ```json
//! {"uid": "0190…", "fct": "ping", "args": [42], "kwargs": {}}
//! {"uid": "0190…", "data": 84, "error": null}
//! {"uid": "0190…", "data": null, "error": {"message": "boom", "trace": "…"}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ZerobotError};

/// Generates a fresh correlation id.
///
/// UUID v7: unique and ordered by creation time.
#[must_use]
pub fn new_uid() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id echoed by the response.
    pub uid: String,
    /// Method name.
    pub fct: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Request {
    /// Creates a request with a fresh uid and no arguments.
    #[must_use]
    pub fn new(fct: impl Into<String>) -> Self {
        Self {
            uid: new_uid(),
            fct: fct.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Replaces the uid.
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Replaces the positional arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Replaces the keyword arguments.
    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Serializes the request.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`] if an argument cannot be
    /// encoded.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Protocol`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| ZerobotError::Protocol(format!("bad request payload: {err}")))
    }
}

/// Failure description carried by a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human-readable message.
    #[serde(alias = "error")]
    pub message: String,
    /// Formatted trace of where the failure happened.
    #[serde(default, alias = "tb")]
    pub trace: String,
}

impl RemoteError {
    /// Creates an error description.
    #[must_use]
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
        }
    }
}

/// Message of locally synthesized timeout resolutions.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// Result of a remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub uid: String,
    /// Return value; `null` on error.
    #[serde(default)]
    pub data: Value,
    /// Set when the invocation failed.
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn ok(uid: impl Into<String>, data: Value) -> Self {
        Self {
            uid: uid.into(),
            data,
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failed(uid: impl Into<String>, error: RemoteError) -> Self {
        Self {
            uid: uid.into(),
            data: Value::Null,
            error: Some(error),
        }
    }

    /// Local resolution used when a deadline fires before the response.
    #[must_use]
    pub fn timed_out(uid: impl Into<String>) -> Self {
        Self::failed(uid, RemoteError::new(TIMEOUT_MESSAGE, ""))
    }

    /// Returns `true` if the error field is populated.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Converts into the returned data, or the remote failure.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::RemoteExecution`] when `error` is set.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.data),
        }
    }

    /// Serializes the response.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`] if `data` cannot be encoded.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parses a response.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Protocol`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| ZerobotError::Protocol(format!("bad response payload: {err}")))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_survives_encoding() {
        let mut kwargs = Map::new();
        kwargs.insert("c".to_string(), json!(42));
        let request = Request::new("hard_one")
            .with_uid("43")
            .with_args(vec![json!(56), json!({"nested": [1, 2]})])
            .with_kwargs(kwargs);
        let Ok(bytes) = request.encode() else {
            panic!("encode");
        };
        let Ok(decoded) = Request::decode(&bytes) else {
            panic!("decode");
        };
        assert_eq!(decoded, request);
    }

    #[test]
    fn error_response_survives_encoding() {
        let response = Response::failed("1", RemoteError::new("boom", "at line 3"));
        let Ok(bytes) = response.encode() else {
            panic!("encode");
        };
        let Ok(decoded) = Response::decode(&bytes) else {
            panic!("decode");
        };
        assert_eq!(decoded, response);
        assert!(decoded.is_error());
    }

    #[test]
    fn missing_arguments_default_to_empty() {
        let Ok(request) = Request::decode(br#"{"uid":"1","fct":"help"}"#) else {
            panic!("decode");
        };
        assert!(request.args.is_empty());
        assert!(request.kwargs.is_empty());
    }

    #[test]
    fn legacy_error_keys_are_accepted() {
        let raw = br#"{"uid":"9","data":null,"error":{"error":"bad","tb":"Traceback"}}"#;
        let Ok(response) = Response::decode(raw) else {
            panic!("decode");
        };
        assert_eq!(response.error, Some(RemoteError::new("bad", "Traceback")));
    }

    #[test]
    fn null_error_is_absent() {
        let Ok(response) = Response::decode(br#"{"uid":"1","data":84,"error":null}"#) else {
            panic!("decode");
        };
        assert!(!response.is_error());
        let Ok(data) = response.into_result() else {
            panic!("ok response");
        };
        assert_eq!(data, json!(84));
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let result = Request::decode(b"not json");
        assert!(matches!(result, Err(ZerobotError::Protocol(_))));
    }

    #[test]
    fn uids_are_unique_and_time_ordered() {
        let a = new_uid();
        let b = new_uid();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn timed_out_response_carries_timeout_message() {
        let response = Response::timed_out("x");
        let Some(err) = response.error else {
            panic!("timeout is an error");
        };
        assert_eq!(err.message, TIMEOUT_MESSAGE);
        assert!(err.trace.is_empty());
    }
}
