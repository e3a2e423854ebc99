use serde_json::Value;
use thiserror::Error;

pub const STATUS_NON_HTTP: u16 = 0;
pub const STATUS_TIMEOUT: u16 = 408;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_response(status: u16, body: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice::<Value>(body)
            && let Some(message) = value.get("message").and_then(Value::as_str)
            && !message.is_empty()
        {
            return Self::new(status, message);
        }

        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Self::new(status, trimmed);
        }

        Self::new(status, reason_phrase(status))
    }

    pub fn from_transport(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::new(STATUS_TIMEOUT, "request timed out");
        }

        let mut message = error.to_string();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            message = format!("{message}: {cause}");
            source = std::error::Error::source(cause);
        }

        Self::new(STATUS_NON_HTTP, message)
    }

    /// Classified by status code only, never by message text.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        408 => "request timed out",
        409 => "conflict",
        500 => "internal server error",
        502 => "bad gateway",
        503 => "service unavailable",
        _ => "request failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_message_wins_over_raw_body() {
        let body = br#"{"kind":"Status","message":"pods \"web\" not found","code":404}"#;
        let err = ApiError::from_response(404, body);
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "pods \"web\" not found");
    }

    #[test]
    fn unparseable_body_falls_back_to_text() {
        let err = ApiError::from_response(502, b"upstream connect error\n");
        assert_eq!(err.status, 502);
        assert_eq!(err.message, "upstream connect error");
    }

    #[test]
    fn empty_body_uses_reason_phrase() {
        let err = ApiError::from_response(403, b"");
        assert_eq!(err.message, "forbidden");

        let err = ApiError::from_response(599, b"");
        assert_eq!(err.message, "request failed");
    }

    #[test]
    fn json_body_without_message_falls_back_to_text() {
        let err = ApiError::from_response(500, br#"{"error":"boom"}"#);
        assert_eq!(err.message, r#"{"error":"boom"}"#);
    }

    #[test]
    fn auth_classification_is_status_based() {
        assert!(ApiError::new(401, "anything").is_auth_error());
        assert!(ApiError::new(403, "anything").is_auth_error());
        assert!(!ApiError::new(404, "unauthorized").is_auth_error());
        assert!(!ApiError::new(500, "forbidden").is_auth_error());
        assert!(!ApiError::new(STATUS_NON_HTTP, "401").is_auth_error());
    }
}
