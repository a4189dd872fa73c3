use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::criteria::SearchCriteria;
use crate::error::ImapError;
use crate::mailbox::{MailboxInfo, MailboxStatus};

/// One message as the server returned it for `FETCH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub seq_num: u32,
    pub uid: Option<u32>,
    pub size: Option<u32>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    /// Envelope subject as decoded by the protocol layer, kept for diagnostics.
    pub envelope_subject: Option<String>,
    /// Full RFC 822 message, when the server returned the body section.
    pub body: Option<Vec<u8>>,
}

/// An authenticated connection to one mailbox server.
///
/// A session is owned by a single list operation and is never shared.
#[async_trait]
pub trait MailSession: Send {
    async fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<MailboxInfo>, ImapError>;

    /// `EXAMINE` when `read_only`, `SELECT` otherwise.
    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxStatus, ImapError>;

    /// Matching sequence numbers, in the order the server reported them.
    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, ImapError>;

    /// Fetch `ids` and push each message into `tx` as it arrives.
    ///
    /// Returns the terminal outcome of the batch. If the receiver goes away the
    /// remaining responses are abandoned and the call returns `Ok`.
    async fn fetch(&mut self, ids: &[u32], tx: mpsc::Sender<RawMessage>) -> Result<(), ImapError>;

    async fn logout(&mut self) -> Result<(), ImapError>;
}

/// Log out, reporting but otherwise ignoring failures. Called exactly once at
/// the end of every operation, whatever its outcome.
pub async fn close_session(session: &mut dyn MailSession) {
    match session.logout().await {
        Ok(()) => info!("[IMAP] Session closed"),
        Err(e) => warn!("[IMAP] Logout failed: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub struct Calls {
        pub listed: Vec<String>,
        pub selected: Vec<(String, bool)>,
        pub searches: Vec<String>,
        pub fetched: Vec<Vec<u32>>,
        pub abandoned: bool,
        pub logouts: usize,
    }

    /// In-memory session. `None` statuses/results make the matching command fail.
    pub struct MockSession {
        pub mailboxes: Vec<MailboxInfo>,
        pub status: Option<MailboxStatus>,
        pub search_result: Option<Vec<u32>>,
        pub messages: Vec<RawMessage>,
        pub fetch_error: Option<String>,
        pub calls: Arc<Mutex<Calls>>,
    }

    impl MockSession {
        pub fn with_messages(count: u32) -> Self {
            Self {
                mailboxes: Vec::new(),
                status: Some(MailboxStatus {
                    messages: count,
                    ..Default::default()
                }),
                search_result: Some((1..=count).collect()),
                messages: (1..=count).map(raw_message).collect(),
                fetch_error: None,
                calls: Arc::default(),
            }
        }
    }

    pub fn raw_message(seq: u32) -> RawMessage {
        let body = format!(
            "From: Sender {seq} <Sender{seq}@Example.com>\r\n\
             Subject: message {seq}\r\n\
             Message-ID: <{seq}@example.com>\r\n\
             \r\n\
             body {seq}\r\n"
        );
        RawMessage {
            seq_num: seq,
            uid: Some(1000 + seq),
            size: Some(body.len() as u32),
            flags: vec!["\\Seen".to_string()],
            internal_date: None,
            envelope_subject: Some(format!("message {}", seq)),
            body: Some(body.into_bytes()),
        }
    }

    fn failure(what: &str) -> ImapError {
        ImapError::No(format!("{} failed", what))
    }

    #[async_trait]
    impl MailSession for MockSession {
        async fn list(&mut self, _reference: &str, pattern: &str) -> Result<Vec<MailboxInfo>, ImapError> {
            self.calls.lock().unwrap().listed.push(pattern.to_string());
            if pattern == "*" {
                return Ok(self.mailboxes.clone());
            }
            Ok(self
                .mailboxes
                .iter()
                .filter(|m| m.name == pattern)
                .cloned()
                .collect())
        }

        async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxStatus, ImapError> {
            self.calls
                .lock()
                .unwrap()
                .selected
                .push((mailbox.to_string(), read_only));
            let mut status = self.status.clone().ok_or_else(|| failure("SELECT"))?;
            status.read_only = read_only;
            Ok(status)
        }

        async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, ImapError> {
            self.calls
                .lock()
                .unwrap()
                .searches
                .push(criteria.to_imap_query());
            self.search_result.clone().ok_or_else(|| failure("SEARCH"))
        }

        async fn fetch(&mut self, ids: &[u32], tx: mpsc::Sender<RawMessage>) -> Result<(), ImapError> {
            self.calls.lock().unwrap().fetched.push(ids.to_vec());
            for message in self.messages.iter().filter(|m| ids.contains(&m.seq_num)) {
                if tx.send(message.clone()).await.is_err() {
                    self.calls.lock().unwrap().abandoned = true;
                    return Ok(());
                }
            }
            match self.fetch_error {
                Some(ref e) => Err(ImapError::Bad(e.clone())),
                None => Ok(()),
            }
        }

        async fn logout(&mut self) -> Result<(), ImapError> {
            self.calls.lock().unwrap().logouts += 1;
            Ok(())
        }
    }
}
