use std::path::PathBuf;

use thiserror::Error;

/// Error type returned by the IMAP protocol library.
pub type ImapError = async_imap::error::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid connection setting. Raised before any network activity.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid filter {expr:?}: {reason}")]
    InvalidFilter { expr: String, reason: String },

    /// Dial, TLS or authentication failure. Never carries the password.
    #[error("connection to {host}:{port} as {login} failed: {source}")]
    Connection {
        host: String,
        port: u16,
        login: String,
        #[source]
        source: BoxError,
    },

    #[error("LIST {pattern} failed: {source}")]
    MailboxList {
        pattern: String,
        #[source]
        source: ImapError,
    },

    #[error("SELECT {mailbox} failed: {source}")]
    MailboxSelect {
        mailbox: String,
        #[source]
        source: ImapError,
    },

    #[error("SEARCH {criteria} in {mailbox} failed: {source}")]
    Search {
        mailbox: String,
        criteria: String,
        #[source]
        source: ImapError,
    },

    /// Terminal fetch failure, reported after every already-streamed row was delivered.
    #[error("FETCH in {mailbox} failed after {delivered} messages: {source}")]
    Fetch {
        mailbox: String,
        delivered: usize,
        #[source]
        source: ImapError,
    },
}
