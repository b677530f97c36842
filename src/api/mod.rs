//! Shared DTOs for the command surface
//!
//! The agent's transport (HTTP server, desktop IPC) lives outside this
//! crate; these are the shapes it exchanges with the command handlers.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;

use crate::errors::AppError;
use serde::{Deserialize, Serialize};

/// Uniform command envelope: either `data` or `code`/`message`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            code: None,
            message: None,
        }
    }

    pub fn error(error: AppError) -> Self {
        Self {
            success: false,
            data: None,
            code: Some(error.code().to_string()),
            message: Some(error.to_string()),
        }
    }
}

/// Parse a range string (`45s`, `15m`, `1h`, bare seconds) into seconds;
/// defaults to 300
pub fn parse_range(range: Option<&str>) -> u64 {
    let Some(raw) = range else { return 300 };
    let s = raw.trim().to_ascii_lowercase();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(|v| v / 1000)
    } else if let Some(sec) = s.strip_suffix('s') {
        sec.parse::<u64>().ok()
    } else if let Some(min) = s.strip_suffix('m') {
        min.parse::<f64>().ok().map(|v| (v * 60.0) as u64)
    } else if let Some(hrs) = s.strip_suffix('h') {
        hrs.parse::<f64>().ok().map(|v| (v * 3600.0) as u64)
    } else {
        s.parse::<u64>().ok()
    };
    parsed.map(|v| v.max(1)).unwrap_or(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range(None), 300);
        assert_eq!(parse_range(Some("45s")), 45);
        assert_eq!(parse_range(Some("15m")), 900);
        assert_eq!(parse_range(Some("1h")), 3600);
        assert_eq!(parse_range(Some("120")), 120);
        assert_eq!(parse_range(Some("500ms")), 1);
        assert_eq!(parse_range(Some("garbage")), 300);
    }

    #[test]
    fn response_envelopes() {
        let ok: ApiResponse<i32> = ApiResponse::success(7);
        assert!(ok.success);
        assert_eq!(ok.data, Some(7));

        let err: ApiResponse<i32> =
            ApiResponse::error(AppError::permission_denied("missing token"));
        assert!(!err.success);
        assert_eq!(err.code.as_deref(), Some("PERMISSION_DENIED"));
    }
}
