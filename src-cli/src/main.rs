use std::fs;
use std::io::{self, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mailquery_core::{
    connect, query_mailboxes, query_messages, ConnectionConfig, MessageQuery, Operator, Predicate,
    PredicateSet, ResolvedConfig, Value,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mailquery", version, about = "Filtered IMAP listings as JSON lines")]
struct Cli {
    /// JSON connection file; unset fields fall back to IMAP_* variables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write a daily rotated log file into this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List mailboxes.
    Mailboxes {
        /// Mailbox name or LIST pattern.
        #[arg(long)]
        name: Option<String>,
        /// Examine each mailbox for message counts and flags.
        #[arg(long)]
        status: bool,
    },
    /// List messages matching every filter.
    Messages {
        /// Mailbox to search; overrides the configured default.
        #[arg(short, long)]
        mailbox: Option<String>,
        /// Filter such as `seq_num>=5`, `subject=report` or `timestamp<2024-01-01`.
        #[arg(short = 'w', long = "where", value_name = "FILTER")]
        filters: Vec<String>,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Open the mailbox with SELECT instead of EXAMINE.
        #[arg(long)]
        read_write: bool,
    },
}

/// One output line: the connection login and echoed query, then the row itself.
#[derive(Serialize)]
struct Row<'a, T: Serialize> {
    login: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    #[serde(flatten)]
    item: T,
}

fn setup_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
        return None;
    };

    let _ = fs::create_dir_all(log_dir);
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "mailquery.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(io::stderr))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Logging initialized. Log directory: {:?}", log_dir);
    Some(guard)
}

fn load_config(path: Option<&Path>) -> mailquery_core::Result<ResolvedConfig> {
    let config = match path {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::default(),
    };
    let resolved = config.resolve()?;
    debug!("Resolved connection settings: {:?}", resolved);
    Ok(resolved)
}

/// Parse `--where` filters, with `--mailbox` as one more predicate.
fn build_query(
    filters: &[String],
    mailbox: Option<String>,
    limit: Option<usize>,
    read_write: bool,
) -> mailquery_core::Result<MessageQuery> {
    let mut predicates = filters
        .iter()
        .map(|f| Predicate::parse(f))
        .collect::<mailquery_core::Result<Vec<_>>>()?;
    if let Some(mailbox) = mailbox {
        predicates.push(Predicate::new("mailbox", Operator::Eq, Value::Text(mailbox)));
    }

    let mut query = MessageQuery::new(predicates);
    if let Some(limit) = limit {
        query = query.with_limit(limit);
    }
    if read_write {
        query = query.read_write();
    }
    Ok(query)
}

fn emit<W: Write, T: Serialize>(out: &mut W, row: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *out, row)?;
    out.write_all(b"\n")
}

async fn run(cli: Cli) -> mailquery_core::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let mut out = BufWriter::new(io::stdout());

    match cli.command {
        Command::Mailboxes { name, status } => {
            let session = connect(&config).await?;
            let rows = query_mailboxes(session, name.as_deref(), status).await?;
            for item in rows {
                let row = Row {
                    login: &config.login,
                    query: None,
                    item,
                };
                if let Err(e) = emit(&mut out, &row) {
                    warn!("Stopped writing mailbox rows: {}", e);
                    break;
                }
            }
        }
        Command::Messages {
            mailbox,
            filters,
            limit,
            read_write,
        } => {
            // Bad filters fail before any network activity.
            let query = build_query(&filters, mailbox, limit, read_write)?;
            let echoed = PredicateSet::collect(&query.predicates)
                .query_text()
                .map(str::to_string);

            let session = connect(&config).await?;
            let login = config.login.as_str();
            let mut write_error = None;
            let outcome = query_messages(session, &query, &config.mailbox, |item| {
                let row = Row {
                    login,
                    query: echoed.as_deref(),
                    item,
                };
                match emit(&mut out, &row) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        write_error = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })
            .await?;

            if let Some(e) = write_error {
                debug!("Output closed early: {}", e);
            }
            info!(
                "{} rows from {} ({} matched)",
                outcome.delivered, outcome.mailbox, outcome.matched
            );
        }
    }

    if let Err(e) = out.flush() {
        debug!("Flushing output failed: {}", e);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_dir.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use mailquery_core::{Error, MailboxInfo, MailboxRow, ParsedMessage};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn messages_accepts_repeated_filters() {
        let cli = Cli::try_parse_from([
            "mailquery",
            "--config",
            "imap.json",
            "messages",
            "-w",
            "seq_num>5",
            "--where",
            "subject=weekly report",
            "--limit",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("imap.json")));
        match cli.command {
            Command::Messages {
                filters,
                limit,
                mailbox,
                read_write,
            } => {
                assert_eq!(filters, vec!["seq_num>5", "subject=weekly report"]);
                assert_eq!(limit, Some(3));
                assert!(mailbox.is_none());
                assert!(!read_write);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn mailbox_flag_becomes_a_predicate() {
        let filters = vec!["size>1000".to_string()];
        let query = build_query(&filters, Some("Archive".into()), Some(10), true).unwrap();
        let set = PredicateSet::collect(&query.predicates);
        assert_eq!(set.mailbox(), Some("Archive"));
        assert_eq!(set.size, vec![(Operator::Gt, 1000)]);
        assert_eq!(query.limit, Some(10));
        assert!(!query.read_only);
    }

    #[test]
    fn bad_filter_is_rejected_up_front() {
        let filters = vec!["seq_num>>".to_string()];
        assert!(matches!(
            build_query(&filters, None, None, false),
            Err(Error::InvalidFilter { .. })
        ));
    }

    #[test]
    fn rows_carry_login_and_query() {
        let mut out = Vec::new();
        let row = Row {
            login: "alice@example.com",
            query: Some("invoice"),
            item: ParsedMessage {
                mailbox: "INBOX".into(),
                seq_num: 4,
                subject: "March invoice".into(),
                ..Default::default()
            },
        };
        emit(&mut out, &row).unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["login"], "alice@example.com");
        assert_eq!(json["query"], "invoice");
        assert_eq!(json["seq_num"], 4);
        assert_eq!(json["subject"], "March invoice");
    }

    #[test]
    fn mailbox_rows_omit_query() {
        let mut out = Vec::new();
        let row = Row {
            login: "alice@example.com",
            query: None,
            item: MailboxRow {
                info: MailboxInfo {
                    name: "Sent".into(),
                    attributes: vec!["\\Sent".into()],
                    delimiter: Some("/".into()),
                },
                status: None,
            },
        };
        emit(&mut out, &row).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["name"], "Sent");
        assert!(json.get("query").is_none());
    }
}
