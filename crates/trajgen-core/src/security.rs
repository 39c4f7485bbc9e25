use std::env;

use crate::TrajgenError;

/// Wrapper around sensitive values to reduce accidental logging.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, TrajgenError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(TrajgenError::MissingSecret(var.to_string())),
    }
}

/// Like [`require_env`] but treats an unset variable as "no secret configured".
pub fn optional_env(var: &str) -> Option<SecretValue> {
    if var.trim().is_empty() {
        return None;
    }
    require_env(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_env_success() {
        unsafe {
            std::env::set_var("TRAJGEN_TEST_SECRET", "value");
        }
        let secret = require_env("TRAJGEN_TEST_SECRET").expect("secret should load");
        assert_eq!(secret.expose(), "value");
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }

    #[test]
    fn require_env_missing() {
        unsafe {
            std::env::remove_var("TRAJGEN_TEST_SECRET_MISSING");
        }
        let err = require_env("TRAJGEN_TEST_SECRET_MISSING").unwrap_err();
        assert!(matches!(err, TrajgenError::MissingSecret(_)));
        assert!(optional_env("TRAJGEN_TEST_SECRET_MISSING").is_none());
        assert!(optional_env("").is_none());
    }
}
