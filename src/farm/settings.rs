//! Immutable per-call farm settings.

use std::fmt;

use url::Url;

use crate::config::ConfigError;

/// Endpoint, credential and TLS choice used for a single farm call.
#[derive(Clone, Eq, PartialEq)]
pub struct FarmSettings {
    endpoint: Url,
    token: String,
    insecure_tls: bool,
}

impl FarmSettings {
    /// Builds settings, normalising the endpoint so relative API paths join
    /// beneath it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEndpoint`] when `endpoint` is not an
    /// absolute HTTP(S) URL, and [`ConfigError::MissingField`] for a blank
    /// token.
    pub fn new(endpoint: &str, token: &str, insecure_tls: bool) -> Result<Self, ConfigError> {
        let trimmed = endpoint.trim();
        let with_slash = if trimmed.ends_with('/') {
            trimmed.to_owned()
        } else {
            format!("{trimmed}/")
        };
        let url = Url::parse(&with_slash).map_err(|err| ConfigError::InvalidEndpoint {
            endpoint: trimmed.to_owned(),
            message: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: trimmed.to_owned(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if token.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "missing farm access token: set STF_TOKEN or add token to [stf] in stf-lease.toml",
            )));
        }
        Ok(Self {
            endpoint: url,
            token: token.trim().to_owned(),
            insecure_tls,
        })
    }

    /// Normalised API base URL (always ends with `/`).
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether invalid TLS certificates are accepted.
    #[must_use]
    pub const fn insecure_tls(&self) -> bool {
        self.insecure_tls
    }
}

impl fmt::Debug for FarmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FarmSettings")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}
