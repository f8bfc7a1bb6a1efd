//! Authentication Module
//!
//! Static username/password authentication for the embedded broker, driven
//! by the `[mqtt.auth]` configuration section.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};

#[cfg(test)]
mod tests;

/// Authentication provider
pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    /// username -> plaintext password
    users: HashMap<String, String>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| (user.username.clone(), user.password.clone()))
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let Some(username) = username else {
            debug!(client_id, "anonymous connect, allowed={}", self.allow_anonymous);
            return Ok(self.allow_anonymous);
        };

        let accepted = match (self.users.get(username), password) {
            (Some(stored), Some(given)) => stored.as_bytes() == given,
            _ => false,
        };
        debug!(client_id, username, accepted, "authentication checked");
        Ok(accepted)
    }
}
