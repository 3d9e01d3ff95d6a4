use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Too Many Requests. Please try again later.")]
    RateLimited,

    #[error("Not logged in or session expired")]
    Unauthorized,

    #[error("{message}")]
    UpstreamTransport { status: Option<u16>, message: String },

    #[error("{0}")]
    UpstreamDomain(String),

    #[error("Unexpected response from upstream: {0}")]
    MalformedUpstreamResponse(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-checkable error category, serialized for UI callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ErrorKind {
    Validation,
    RateLimited,
    Unauthorized,
    UpstreamTransport,
    UpstreamDomain,
    MalformedUpstreamResponse,
    NotFound,
    Internal,
}

/// HTTP-shaped error payload handed to UI collaborators.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::RateLimited => ErrorKind::RateLimited,
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::UpstreamTransport { .. } => ErrorKind::UpstreamTransport,
            ApiError::UpstreamDomain(_) => ErrorKind::UpstreamDomain,
            ApiError::MalformedUpstreamResponse(_) => ErrorKind::MalformedUpstreamResponse,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status a UI-facing route should answer with.
    ///
    /// Rate limiting is the only 429. Transport errors echo the upstream
    /// status when it is an error status, otherwise 502.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::RateLimited => 429,
            ApiError::Unauthorized | ApiError::UpstreamDomain(_) => 401,
            ApiError::UpstreamTransport { status, .. } => match status {
                Some(code) if (400..600).contains(code) && *code != 429 => *code,
                _ => 502,
            },
            ApiError::MalformedUpstreamResponse(_) => 502,
            ApiError::NotFound(_) => 404,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub(crate) fn transport(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "Connection to the ticketing service timed out".to_string()
        } else if err.is_connect() {
            "Unable to connect to the ticketing service".to_string()
        } else {
            format!("Request to the ticketing service failed: {}", err)
        };
        ApiError::UpstreamTransport {
            status: err.status().map(|s| s.as_u16()),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_is_distinct_status() {
        assert_eq!(ApiError::RateLimited.status(), 429);
        assert_ne!(ApiError::UpstreamDomain("x".into()).status(), 429);
        assert_ne!(ApiError::Internal("x".into()).status(), 429);
        // An upstream 429 is still a transport problem, not our governor
        let upstream = ApiError::UpstreamTransport { status: Some(429), message: "busy".into() };
        assert_eq!(upstream.status(), 502);
    }

    #[test]
    fn test_transport_status_passthrough() {
        let err = ApiError::UpstreamTransport { status: Some(503), message: "down".into() };
        assert_eq!(err.status(), 503);
        let err = ApiError::UpstreamTransport { status: None, message: "refused".into() };
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn test_body_serializes_kind_snake_case() {
        let body = ApiError::NotFound("Ticket image not found".into()).body();
        let json = serde_json::to_value(&body).expect("serialize body");
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["message"], "Ticket image not found");
    }

    #[test]
    fn test_truncate_body() {
        let short = "short body";
        assert_eq!(ApiError::truncate_body(short), short);

        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
        assert!(truncated.len() < long.len());
    }
}
