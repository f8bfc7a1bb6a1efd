//! Auth module tests

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user(username: &str, password: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: password.to_string(),
    }
}

#[tokio::test]
async fn test_auth_disabled_allows_all() {
    let provider = AuthProvider::new(&make_auth_config(false, false, vec![]));
    assert!(!provider.is_enabled());

    let result = provider
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert!(result, "Should allow when auth is disabled");
}

#[tokio::test]
async fn test_auth_enabled_rejects_unknown_user() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user("tasmota", "secret")],
    ));

    let result = provider
        .on_authenticate("client1", Some("unknown"), Some(b"secret"))
        .await
        .unwrap();
    assert!(!result, "Should reject unknown user");
}

#[tokio::test]
async fn test_auth_enabled_rejects_wrong_password() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user("tasmota", "secret")],
    ));

    let result = provider
        .on_authenticate("client1", Some("tasmota"), Some(b"wrong"))
        .await
        .unwrap();
    assert!(!result, "Should reject wrong password");

    let result = provider
        .on_authenticate("client1", Some("tasmota"), None)
        .await
        .unwrap();
    assert!(!result, "Should reject missing password");
}

#[tokio::test]
async fn test_auth_enabled_accepts_valid_credentials() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user("tasmota", "secret")],
    ));

    let result = provider
        .on_authenticate("client1", Some("tasmota"), Some(b"secret"))
        .await
        .unwrap();
    assert!(result, "Should accept valid credentials");
}

#[tokio::test]
async fn test_anonymous_follows_config() {
    let allow = AuthProvider::new(&make_auth_config(true, true, vec![]));
    assert!(allow.on_authenticate("anon", None, None).await.unwrap());

    let deny = AuthProvider::new(&make_auth_config(true, false, vec![]));
    assert!(!deny.on_authenticate("anon", None, None).await.unwrap());
}
