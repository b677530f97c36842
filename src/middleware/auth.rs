//! Token authentication for the command surface
//!
//! The agent mints one opaque token per process. The desktop UI learns it
//! from the lockfile or the unauthenticated `handshake` verb and sends it
//! back on every other call, either bare or as a bearer header value.

use crate::errors::{AppError, AppResult};
use log::debug;
use uuid::Uuid;

pub struct AuthManager {
    token: String,
}

impl AuthManager {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Token from `$AGENT_TOKEN`, else a fresh random one
    pub fn from_env() -> Self {
        let token = std::env::var("AGENT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(generate_token);
        Self { token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Check a presented token; accepts a bare value or `Bearer <token>`
    pub fn validate(&self, provided: Option<&str>) -> AppResult<()> {
        let presented = provided.map(|raw| {
            let raw = raw.trim();
            match raw.split_once(' ') {
                Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
                _ => raw,
            }
        });
        match presented {
            Some(token) if token == self.token => Ok(()),
            _ => {
                debug!("auth failed: token missing or mismatched");
                Err(AppError::permission_denied("Missing or invalid token"))
            }
        }
    }
}

/// Opaque URL-safe token
pub fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
