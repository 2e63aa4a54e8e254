//! Ledger configuration.

use std::time::Duration;

use consent_core::SigningSecret;

use crate::error::{ConsentError, Result};

/// Environment variable holding the document signing secret.
pub const ENV_DOC_SECRET: &str = "CONSENT_DOC_SECRET";
/// Environment variable holding the public base URL for verify links.
pub const ENV_VERIFY_BASE_URL: &str = "CONSENT_VERIFY_BASE_URL";
/// Environment variable overriding [`ConsentConfig::version_retries`].
pub const ENV_VERSION_RETRIES: &str = "CONSENT_VERSION_RETRIES";
/// Environment variable overriding [`ConsentConfig::audit_retries`].
pub const ENV_AUDIT_RETRIES: &str = "CONSENT_AUDIT_RETRIES";

/// Configuration for the ledger.
#[derive(Debug, Clone)]
pub struct ConsentConfig {
    /// Key used to mint document ids.
    pub signing_secret: SigningSecret,
    /// Base of `{base}/verify/{docId}` links.
    pub verify_base_url: String,
    /// Attempts at claiming a version number before giving up.
    pub version_retries: u32,
    /// Attempts at linking an audit entry onto a moving tail.
    pub audit_retries: u32,
    /// Pause before the single retry of a failed read.
    pub read_retry_backoff: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            signing_secret: SigningSecret::generate(),
            verify_base_url: "http://localhost:3000".to_string(),
            version_retries: 8,
            audit_retries: 16,
            read_retry_backoff: Duration::from_millis(50),
            event_capacity: 256,
        }
    }
}

impl ConsentConfig {
    /// Build a configuration from the process environment.
    ///
    /// `CONSENT_DOC_SECRET` is required; everything else falls back to the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secret = lookup(ENV_DOC_SECRET)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConsentError::Config(format!("{ENV_DOC_SECRET} is not set")))?;

        let mut config = Self {
            signing_secret: SigningSecret::from_bytes(secret.into_bytes()),
            ..Self::default()
        };

        if let Some(url) = lookup(ENV_VERIFY_BASE_URL).filter(|s| !s.is_empty()) {
            config.verify_base_url = url;
        }
        if let Some(n) = parse_count(&lookup, ENV_VERSION_RETRIES)? {
            config.version_retries = n;
        }
        if let Some(n) = parse_count(&lookup, ENV_AUDIT_RETRIES)? {
            config.audit_retries = n;
        }

        Ok(config)
    }

    /// Set the signing secret.
    pub fn with_secret(mut self, secret: SigningSecret) -> Self {
        self.signing_secret = secret;
        self
    }

    /// Set the verify link base URL.
    pub fn with_verify_base_url(mut self, url: impl Into<String>) -> Self {
        self.verify_base_url = url.into();
        self
    }
}

fn parse_count(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u32>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConsentError::Config(format!(
                "{key} must be a positive integer, got {raw:?}"
            ))),
        },
    }
}
