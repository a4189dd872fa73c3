use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::{close_session, MailSession};

/// A mailbox as returned by `LIST`. Cheap: one round-trip for all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxInfo {
    pub name: String,
    pub attributes: Vec<String>,
    pub delimiter: Option<String>,
}

/// Live status of a mailbox, only known after selecting it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStatus {
    pub flags: Vec<String>,
    pub permanent_flags: Vec<String>,
    pub messages: u32,
    pub recent: u32,
    pub unseen: Option<u32>,
    pub read_only: bool,
}

/// A listed mailbox with its status, when that was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxRow {
    #[serde(flatten)]
    pub info: MailboxInfo,
    #[serde(flatten)]
    pub status: Option<MailboxStatus>,
}

/// List mailboxes, all of them unless `name` narrows the pattern.
pub async fn list_mailboxes(
    session: &mut dyn MailSession,
    name: Option<&str>,
) -> Result<Vec<MailboxInfo>> {
    let pattern = name.unwrap_or("*");
    let mailboxes = session
        .list("", pattern)
        .await
        .map_err(|source| Error::MailboxList {
            pattern: pattern.to_string(),
            source,
        })?;
    info!("[IMAP] LIST {} returned {} mailboxes", pattern, mailboxes.len());
    Ok(mailboxes)
}

/// Second round-trip for a mailbox's live status, opened read-only.
///
/// Failure yields an empty status so the listing itself still renders;
/// some listed names (e.g. `\Noselect` parents) cannot be examined at all.
pub async fn mailbox_status(session: &mut dyn MailSession, name: &str) -> MailboxStatus {
    match session.select(name, true).await {
        Ok(status) => status,
        Err(e) => {
            warn!("[IMAP] EXAMINE {} failed, returning empty status: {}", name, e);
            MailboxStatus::default()
        }
    }
}

/// Run one mailbox listing on a dedicated session and close it afterwards.
pub async fn query_mailboxes(
    mut session: Box<dyn MailSession>,
    name: Option<&str>,
    with_status: bool,
) -> Result<Vec<MailboxRow>> {
    let result = list_rows(session.as_mut(), name, with_status).await;
    close_session(session.as_mut()).await;
    result
}

async fn list_rows(
    session: &mut dyn MailSession,
    name: Option<&str>,
    with_status: bool,
) -> Result<Vec<MailboxRow>> {
    let mut rows = Vec::new();
    for info in list_mailboxes(session, name).await? {
        let status = if with_status {
            Some(mailbox_status(session, &info.name).await)
        } else {
            None
        };
        rows.push(MailboxRow { info, status });
    }
    Ok(rows)
}

// ── Unit tests ──────────────────────────────────────────────────────────────
