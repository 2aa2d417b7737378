use crate::persona::Persona;
use anyhow::{Context, Result};
use keyring::Entry;

/// Explicit engine configuration, passed into the completion client and
/// dispatch controller at construction time rather than read from ambient
/// storage on every call.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Full URL of the chat-completion endpoint.
    pub endpoint: String,
    /// Model identifier sent in the request body.
    pub model: String,
    /// Reference to the fallback credential: `env:VAR_NAME` or `keyring`.
    /// The user-supplied keyring override always takes precedence over this.
    pub api_key_ref: Option<String>,
    pub persona: Persona,
}

/// Resolved credential pair handed to the completion client. Absence of both
/// keys is not an error here; the client fails with a config error before
/// attempting any network call.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    /// User-supplied override, stored per machine in the OS keyring.
    pub override_key: Option<String>,
    /// Build-time / environment fallback.
    pub default_key: Option<String>,
}

impl Credentials {
    pub fn resolve(&self) -> Option<&str> {
        fn usable(key: Option<&str>) -> Option<&str> {
            key.map(str::trim).filter(|k| !k.is_empty())
        }
        usable(self.override_key.as_deref()).or_else(|| usable(self.default_key.as_deref()))
    }
}

// --- API Key Retrieval ---

const KEYRING_SERVICE: &str = "mentorchat_api_key";
const KEYRING_OVERRIDE_USER: &str = "user_override";

/// Resolves both credential sources for a configuration. A missing override
/// or fallback is normal and logged at debug level only.
pub fn load_credentials(config: &EngineConfig) -> Credentials {
    let override_key = match Entry::new(KEYRING_SERVICE, KEYRING_OVERRIDE_USER) {
        Ok(entry) => match entry.get_password() {
            Ok(key) => Some(key),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::debug!("No keyring override available: {}", e);
                None
            }
        },
        Err(e) => {
            log::debug!("Failed to open keyring entry: {}", e);
            None
        }
    };

    let default_key = match config.api_key_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving fallback API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).ok()
        }
        Some(ref_str) if ref_str == "keyring" => {
            Entry::new(KEYRING_SERVICE, "default")
                .and_then(|entry| entry.get_password())
                .ok()
        }
        Some(other) => {
            log::warn!("Unsupported api_key_ref format: {}", other);
            None
        }
        None => None,
    };

    Credentials {
        override_key,
        default_key,
    }
}

/// Stores a user-supplied API key override in the OS keyring.
pub fn set_api_key_override(api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_OVERRIDE_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key override in keyring");
    entry
        .set_password(api_key)
        .context("Failed to set API key override in keyring")
}

/// Removes the user-supplied override so the fallback credential applies again.
pub fn clear_api_key_override() -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_OVERRIDE_USER)
        .context("Failed to create keyring entry for clearing password")?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e).context("Failed to clear API key override from keyring"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_override() {
        let creds = Credentials {
            override_key: Some("user-key".into()),
            default_key: Some("build-key".into()),
        };
        assert_eq!(creds.resolve(), Some("user-key"));
    }

    #[test]
    fn resolve_falls_back_and_rejects_blank() {
        let creds = Credentials {
            override_key: Some("   ".into()),
            default_key: Some("build-key".into()),
        };
        // A blank override is unusable; the fallback still applies.
        assert_eq!(creds.resolve(), Some("build-key"));

        let creds = Credentials {
            override_key: None,
            default_key: Some("build-key".into()),
        };
        assert_eq!(creds.resolve(), Some("build-key"));

        assert_eq!(Credentials::default().resolve(), None);
    }
}
