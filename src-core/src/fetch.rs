//! Search and bounded fetch for one list call.
//!
//! SEARCH runs first and its identifiers are cut down to the row limit, so the
//! FETCH only asks for what the consumer can use. The fetch then runs as a
//! producer feeding a bounded channel while this task decodes and hands rows
//! to the sink as they arrive. Both sides are joined on the same task, and the
//! fetch outcome is only reported once every delivered row has been handed over.

use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::criteria::{self, SearchCriteria};
use crate::error::{Error, ImapError, Result};
use crate::message::{decode, ParsedMessage};
use crate::predicate::{Predicate, PredicateSet};
use crate::session::{close_session, MailSession, RawMessage};

const FETCH_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub predicates: Vec<Predicate>,
    /// Maximum number of rows the consumer wants.
    pub limit: Option<usize>,
    /// Open the mailbox with `EXAMINE` instead of `SELECT`.
    pub read_only: bool,
}

impl MessageQuery {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self {
            predicates,
            limit: None,
            read_only: true,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn read_write(mut self) -> Self {
        self.read_only = false;
        self
    }
}

/// What a list call did, for logging by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOutcome {
    pub mailbox: String,
    pub criteria: Option<SearchCriteria>,
    pub matched: usize,
    pub delivered: usize,
}

/// Run `query` against `session`, handing each decoded row to `sink`.
///
/// The sink returns `ControlFlow::Break` to stop early; the rest of the fetch
/// is then abandoned. The mailbox is the query's `mailbox` predicate or
/// `default_mailbox`. The session is left open.
pub async fn list_messages<F>(
    session: &mut dyn MailSession,
    query: &MessageQuery,
    default_mailbox: &str,
    sink: F,
) -> Result<ListOutcome>
where
    F: FnMut(ParsedMessage) -> ControlFlow<()> + Send,
{
    let filters = PredicateSet::collect(&query.predicates);
    let mailbox = filters.mailbox().unwrap_or(default_mailbox).to_string();

    let status = session
        .select(&mailbox, query.read_only)
        .await
        .map_err(|source| {
            error!("[IMAP] SELECT {} failed: {}", mailbox, source);
            Error::MailboxSelect {
                mailbox: mailbox.clone(),
                source,
            }
        })?;

    let criteria = criteria::build(&filters, status.messages);
    let mut outcome = ListOutcome {
        mailbox: mailbox.clone(),
        criteria: Some(criteria.clone()),
        matched: 0,
        delivered: 0,
    };
    if criteria.sequence.is_empty() {
        debug!(
            "[IMAP] Sequence range {}:{} in {} cannot match, skipping SEARCH",
            criteria.sequence.from, criteria.sequence.to, mailbox
        );
        return Ok(outcome);
    }

    debug!("[IMAP] SEARCH {} in {}", criteria, mailbox);
    let mut ids = session.search(&criteria).await.map_err(|source| {
        error!("[IMAP] SEARCH {} in {} failed: {}", criteria, mailbox, source);
        Error::Search {
            mailbox: mailbox.clone(),
            criteria: criteria.to_imap_query(),
            source,
        }
    })?;
    outcome.matched = ids.len();

    if let Some(limit) = query.limit {
        ids.truncate(limit);
    }
    info!(
        "[IMAP] {} matched {} messages, fetching {}",
        mailbox,
        outcome.matched,
        ids.len()
    );
    if ids.is_empty() {
        return Ok(outcome);
    }

    let (delivered, fetched) = stream_messages(session, &ids, &mailbox, sink).await;
    outcome.delivered = delivered;

    if let Err(source) = fetched {
        error!(
            "[IMAP] FETCH in {} failed after {} messages: {}",
            mailbox, delivered, source
        );
        return Err(Error::Fetch {
            mailbox,
            delivered,
            source,
        });
    }
    Ok(outcome)
}

async fn stream_messages<F>(
    session: &mut dyn MailSession,
    ids: &[u32],
    mailbox: &str,
    mut sink: F,
) -> (usize, std::result::Result<(), ImapError>)
where
    F: FnMut(ParsedMessage) -> ControlFlow<()> + Send,
{
    let (tx, mut rx) = mpsc::channel::<RawMessage>(ids.len().clamp(1, FETCH_BUFFER));

    let producer = session.fetch(ids, tx);
    // Owns the receiver, so stopping early closes the channel and the
    // producer gives up on its next send.
    let consumer = async move {
        let mut delivered = 0;
        while let Some(raw) = rx.recv().await {
            delivered += 1;
            if sink(decode(&raw, mailbox)).is_break() {
                debug!("[IMAP] Consumer stopped after {} messages", delivered);
                break;
            }
        }
        delivered
    };

    let (fetched, delivered) = tokio::join!(producer, consumer);
    (delivered, fetched)
}

/// Run one list call on a dedicated session and log it out afterwards,
/// whatever the outcome.
pub async fn query_messages<F>(
    mut session: Box<dyn MailSession>,
    query: &MessageQuery,
    default_mailbox: &str,
    sink: F,
) -> Result<ListOutcome>
where
    F: FnMut(ParsedMessage) -> ControlFlow<()> + Send,
{
    let result = list_messages(session.as_mut(), query, default_mailbox, sink).await;
    close_session(session.as_mut()).await;
    result
}

// ── Unit tests ──────────────────────────────────────────────────────────────
