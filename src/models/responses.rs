//! Response DTOs for the line protocol
//!
//! Every response line is one JSON object with `success` and the numeric
//! status `code`; failures add `error`, GET hits add base64 `data`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::error::{CacheError, StatusCode};

/// Response body for every command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    /// Status code shared with the C ABI
    pub code: i32,
    /// Base64 payload of a GET hit; an empty string for an empty payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Success without data.
    pub fn ok() -> Self {
        Self {
            success: true,
            code: StatusCode::Success.code(),
            data: None,
            error: None,
        }
    }

    /// Successful GET carrying `payload`.
    pub fn with_data(payload: &[u8]) -> Self {
        Self {
            data: Some(STANDARD.encode(payload)),
            ..Self::ok()
        }
    }

    /// Failure classified by its status code.
    pub fn failure(err: &CacheError) -> Self {
        let error = match err {
            CacheError::NotFound => "cache entry not found".to_string(),
            other => other.to_string(),
        };
        Self {
            success: false,
            code: err.status_code().code(),
            data: None,
            error: Some(error),
        }
    }

    /// Serialises the response as a single line (without the newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                r#"{{"success":false,"code":{},"error":"failed to encode response: {}"}}"#,
                StatusCode::General.code(),
                err.to_string().replace('"', "'")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_response_serialize() {
        let json = Response::ok().to_line();
        assert_eq!(json, r#"{"success":true,"code":1}"#);
    }

    #[test]
    fn test_data_response_serialize() {
        let json = Response::with_data(b"hello").to_line();
        assert!(json.contains(r#""data":"aGVsbG8=""#));

        let empty = Response::with_data(b"");
        assert_eq!(empty.data.as_deref(), Some(""));
    }

    #[test]
    fn test_not_found_response() {
        let resp = Response::failure(&CacheError::NotFound);
        assert!(!resp.success);
        assert_eq!(resp.code, -3);
        assert!(resp.error.unwrap().contains("not found"));
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(Response::failure(&CacheError::DiskExhausted("x".into())).code, -1);
        assert_eq!(Response::failure(&CacheError::InvalidArgument("x".into())).code, -2);
        assert_eq!(Response::failure(&CacheError::NotInitialized("x".into())).code, -4);
        assert_eq!(Response::failure(&CacheError::Internal("x".into())).code, 0);
    }
}
