mod convert;

use std::fmt;
use std::time::Duration;

use async_imap::types::Name;
use async_native_tls::TlsConnector;
use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::criteria::SearchCriteria;
use crate::error::{self, ImapError};
use crate::mailbox::{MailboxInfo, MailboxStatus};
use crate::session::{MailSession, RawMessage};

/// Everything a row needs: envelope, flags, size, internal date and the whole
/// message. `BODY.PEEK[]` leaves `\Seen` untouched.
pub const FETCH_ITEMS: &str = "(FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODY.PEEK[])";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ── Connection creation ─────────────────────────────────────────────────────

/// Open a TLS or plaintext connection and log in.
///
/// Exactly one live session results from a successful call; the caller is
/// responsible for logging it out.
pub async fn connect(config: &ResolvedConfig) -> error::Result<Box<dyn MailSession>> {
    let addr = config.address();
    info!(
        "[IMAP] Connecting to {} (tls={}, login={})",
        addr, config.tls_enabled, config.login
    );

    let tcp = async_std::io::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|e| {
            error!(
                "[IMAP] TCP connect to {} failed (tls={}, login={}): {}",
                addr, config.tls_enabled, config.login, e
            );
            config.connection_error(e)
        })?;

    if !config.tls_enabled {
        warn!("[IMAP] TLS disabled, credentials for {} travel in plaintext", addr);
        return login(async_imap::Client::new(tcp), config).await;
    }

    let tls = if config.insecure_skip_verify {
        warn!("[IMAP] Accepting invalid certificates for {}", config.host);
        TlsConnector::new()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
    } else {
        TlsConnector::new()
    };

    let tls_stream = tls.connect(&config.host, tcp).await.map_err(|e| {
        error!(
            "[IMAP] TLS handshake with {} failed (login={}): {}",
            addr, config.login, e
        );
        config.connection_error(e)
    })?;

    info!("[IMAP] TLS established, authenticating...");
    login(async_imap::Client::new(tls_stream), config).await
}

async fn login<T>(
    client: async_imap::Client<T>,
    config: &ResolvedConfig,
) -> error::Result<Box<dyn MailSession>>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    let session = client
        .login(&config.login, &config.password)
        .await
        .map_err(|(e, _)| {
            error!(
                "[IMAP] Login to {} failed (tls={}, login={}): {}",
                config.address(),
                config.tls_enabled,
                config.login,
                e
            );
            config.connection_error(e)
        })?;

    info!("[IMAP] Session established for {}", config.login);
    Ok(Box::new(ImapSession {
        inner: session,
        literal_plus: None,
    }))
}

// ── Session ─────────────────────────────────────────────────────────────────

/// [`MailSession`] backed by an `async-imap` session over any transport.
pub struct ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    inner: async_imap::Session<T>,
    /// Whether the server advertises `LITERAL+`, asked on first need.
    literal_plus: Option<bool>,
}

impl<T> ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn supports_literal_plus(&mut self) -> bool {
        if let Some(known) = self.literal_plus {
            return known;
        }
        let known = match self.inner.capabilities().await {
            Ok(caps) => caps.has_str("LITERAL+"),
            Err(e) => {
                warn!("[IMAP] CAPABILITY failed, sending quoted search terms: {}", e);
                false
            }
        };
        self.literal_plus = Some(known);
        known
    }
}

#[async_trait]
impl<T> MailSession for ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<MailboxInfo>, ImapError> {
        let names: Vec<Name> = self
            .inner
            .list(Some(reference), Some(pattern))
            .await?
            .try_collect()
            .await?;
        Ok(names.iter().map(convert::mailbox_info).collect())
    }

    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxStatus, ImapError> {
        let mbox = if read_only {
            self.inner.examine(mailbox).await?
        } else {
            self.inner.select(mailbox).await?
        };
        Ok(convert::mailbox_status(&mbox, read_only))
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>, ImapError> {
        // Non-ASCII terms go out as literals when the server allows it.
        let query = if criteria.charset().is_some() && self.supports_literal_plus().await {
            criteria.to_imap_literal_query()
        } else {
            criteria.to_imap_query()
        };
        let found = self.inner.search(query).await?;
        let mut ids: Vec<u32> = found.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch(&mut self, ids: &[u32], tx: mpsc::Sender<RawMessage>) -> Result<(), ImapError> {
        let set = convert::sequence_set(ids);
        debug!("[IMAP] FETCH {} {}", set, FETCH_ITEMS);

        let stream = self.inner.fetch(&set, FETCH_ITEMS).await?;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let fetch = item?;
            if tx.send(convert::raw_message(&fetch)).await.is_err() {
                debug!("[IMAP] Receiver dropped, abandoning remaining FETCH responses");
                break;
            }
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), ImapError> {
        self.inner.logout().await
    }
}
