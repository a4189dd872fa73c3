//! Relational-style filters over an IMAP mailbox.
//!
//! Predicates on message columns are folded into a single `SEARCH`, the
//! matches are cut to the row limit and fetched in one batch, and every
//! fetched message is decoded into a [`ParsedMessage`] row and streamed to
//! the caller as it arrives.

pub mod config;
pub mod criteria;
pub mod error;
pub mod fetch;
pub mod imap;
pub mod mailbox;
pub mod message;
pub mod predicate;
pub mod session;

pub use config::{ConnectionConfig, ResolvedConfig};
pub use criteria::{build, SearchCriteria};
pub use error::{Error, Result};
pub use fetch::{list_messages, query_messages, ListOutcome, MessageQuery};
pub use imap::connect;
pub use mailbox::{list_mailboxes, mailbox_status, query_mailboxes, MailboxInfo, MailboxRow, MailboxStatus};
pub use message::{decode, AttachmentInfo, EmailAddress, ParsedMessage};
pub use predicate::{Operator, Predicate, PredicateSet, Value};
pub use session::{MailSession, RawMessage};
