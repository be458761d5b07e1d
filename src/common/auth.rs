use std::borrow::Cow;
use std::time::Duration;

use crate::common::config::Config;

/// Pause applied before answering a rejected login.
///
/// This only slows down naive brute forcing from a single connection. The
/// RFC 1929 exchange is cleartext and trivially sniffed, so it is not a
/// security boundary.
pub const AUTH_FAILURE_DELAY: Duration = Duration::from_millis(200);

/// Username/password pair as received on the wire. Compared byte for byte,
/// no text decoding is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl Credentials {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.username)
    }
}

pub struct AuthManager {
    expected: Option<Credentials>,
}

impl AuthManager {
    pub fn new(config: &Config) -> Self {
        let expected = if config.auth_required() {
            Some(Credentials::new(
                config.username.clone().unwrap_or_default(),
                config.password.clone().unwrap_or_default(),
            ))
        } else {
            None
        };
        AuthManager { expected }
    }

    pub fn has_users(&self) -> bool {
        self.expected.is_some()
    }

    /// With no configured user every offer is rejected; callers only get
    /// here after selecting the username/password method.
    pub fn authenticate(&self, offered: &Credentials) -> bool {
        self.expected.as_ref() == Some(offered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(username: Option<&str>, password: Option<&str>) -> Config {
        Config {
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            ..Config::default()
        }
    }

    #[test]
    fn test_authenticate() {
        let auth_manager = AuthManager::new(&config_with(Some("admin"), Some("password")));

        assert!(auth_manager.has_users());
        assert!(auth_manager.authenticate(&Credentials::new("admin", "password")));
        assert!(!auth_manager.authenticate(&Credentials::new("admin", "wrongpass")));
        assert!(!auth_manager.authenticate(&Credentials::new("Admin", "password")));
        assert!(!auth_manager.authenticate(&Credentials::new("nonexistent", "password")));
    }

    #[test]
    fn test_missing_password_means_empty() {
        let auth_manager = AuthManager::new(&config_with(Some("admin"), None));
        assert!(auth_manager.authenticate(&Credentials::new("admin", "")));
        assert!(!auth_manager.authenticate(&Credentials::new("admin", "x")));
    }

    #[test]
    fn test_no_users() {
        let auth_manager = AuthManager::new(&config_with(None, None));
        assert!(!auth_manager.has_users());
        assert!(!auth_manager.authenticate(&Credentials::new("", "")));

        let empty = AuthManager::new(&config_with(Some(""), None));
        assert!(!empty.has_users());
    }

    #[test]
    fn test_non_utf8_credentials() {
        let creds = Credentials::new(vec![0xff, b'a'], vec![0x00]);
        assert_eq!(creds.username_lossy(), "\u{fffd}a");
    }
}
