//! Connection credentials.
//!
//! A credential is a standalone value held by each connection config rather
//! than behavior mixed into it. The secret can be given inline or read from
//! an environment variable at connect time.

use crate::error::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Username.
    pub user: String,

    /// Inline password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password. Takes precedence over
    /// `password` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
            password_env: None,
        }
    }

    pub fn has_secret(&self) -> bool {
        self.password.is_some() || self.password_env.is_some()
    }

    /// The password, resolving `password_env` if configured.
    pub fn password(&self) -> Result<String> {
        if let Some(var) = &self.password_env {
            return std::env::var(var).map_err(|_| {
                ImportError::Config(format!("environment variable {} is not set", var))
            });
        }
        self.password
            .clone()
            .ok_or_else(|| ImportError::Config(format!("no password configured for {}", self.user)))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("password_env", &self.password_env)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::new("sa", "hunter2");
        let debug = format!("{:?}", cred);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_inline_password() {
        assert_eq!(Credential::new("sa", "pw").password().unwrap(), "pw");
    }

    #[test]
    fn test_missing_env_var_is_config_error() {
        let cred = Credential {
            user: "sa".into(),
            password: Some("fallback".into()),
            password_env: Some("SQL_IMPORT_TEST_SURELY_UNSET_VAR".into()),
        };
        assert!(matches!(cred.password(), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_no_secret() {
        let cred = Credential {
            user: "sa".into(),
            ..Default::default()
        };
        assert!(!cred.has_secret());
        assert!(cred.password().is_err());
    }
}
