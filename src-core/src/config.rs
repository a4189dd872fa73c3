use std::fmt;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{BoxError, Error, Result};

pub const DEFAULT_PORT: u16 = 993;
pub const DEFAULT_MAILBOX: &str = "INBOX";

pub const ENV_HOST: &str = "IMAP_HOST";
pub const ENV_LOGIN: &str = "IMAP_LOGIN";
pub const ENV_PASSWORD: &str = "IMAP_PASSWORD";
pub const ENV_PORT: &str = "IMAP_PORT";

// ── Config ──────────────────────────────────────────────────────────────────

/// Connection settings as written by the user. Every field is optional;
/// unset fields fall back to the environment, then to defaults.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    /// Signed so that out-of-range values reach validation instead of failing to parse.
    pub port: Option<i64>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub tls_enabled: Option<bool>,
    pub insecure_skip_verify: Option<bool>,
    /// Mailbox listed when a query does not name one.
    pub mailbox: Option<String>,
}

impl ConnectionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| Error::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve with an explicit variable lookup. Explicit config wins over
    /// the environment, which wins over the built-in defaults.
    pub fn resolve_with<F>(&self, env: F) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut host = env(ENV_HOST).unwrap_or_default();
        let mut login = env(ENV_LOGIN).unwrap_or_default();
        let mut password = env(ENV_PASSWORD).unwrap_or_default();
        let mut port = i64::from(DEFAULT_PORT);

        if let Some(raw) = env(ENV_PORT) {
            match raw.trim().parse::<i64>() {
                Ok(p) => port = p,
                Err(_) => warn!("Ignoring non-numeric {}={:?}", ENV_PORT, raw),
            }
        }

        if let Some(ref h) = self.host {
            host = h.clone();
        }
        if let Some(p) = self.port {
            port = p;
        }
        if let Some(ref l) = self.login {
            login = l.clone();
        }
        if let Some(ref p) = self.password {
            password = p.clone();
        }

        if host.is_empty() {
            return Err(Error::Configuration("host must be configured".to_string()));
        }
        if login.is_empty() {
            return Err(Error::Configuration("login must be configured".to_string()));
        }
        if password.is_empty() {
            return Err(Error::Configuration("password must be configured".to_string()));
        }

        let mailbox = match self.mailbox.as_deref() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => DEFAULT_MAILBOX.to_string(),
        };

        Ok(ResolvedConfig {
            host,
            port: validate_port(port)?,
            login,
            password,
            tls_enabled: self.tls_enabled.unwrap_or(true),
            insecure_skip_verify: self.insecure_skip_verify.unwrap_or(false),
            mailbox,
        })
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls_enabled", &self.tls_enabled)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

/// Accept the well-known IMAP ports plus the unprivileged range.
pub fn validate_port(port: i64) -> Result<u16> {
    match port {
        143 | 993 | 1024..=65535 => Ok(port as u16),
        _ => Err(Error::Configuration(format!(
            "port {} is not allowed (use 143, 993 or 1024-65535)",
            port
        ))),
    }
}

// ── Resolved ────────────────────────────────────────────────────────────────

/// Fully resolved settings for one session. Passed explicitly to whatever
/// needs the login or default mailbox; there is no process-wide cache.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub tls_enabled: bool,
    pub insecure_skip_verify: bool,
    pub mailbox: String,
}

impl ResolvedConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn connection_error(&self, source: impl Into<BoxError>) -> Error {
        Error::Connection {
            host: self.host.clone(),
            port: self.port,
            login: self.login.clone(),
            source: source.into(),
        }
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("tls_enabled", &self.tls_enabled)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

// ── Unit tests ──────────────────────────────────────────────────────────────
