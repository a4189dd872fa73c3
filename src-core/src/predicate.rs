//! Filter predicates and their per-column grouping.
//!
//! A query arrives as a flat list of `column op value` clauses. [`PredicateSet`]
//! buckets them by the columns the criteria builder understands, keeping every
//! clause so repeated range bounds on one column can be folded together.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(Operator::Eq),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            other => Err(Error::InvalidFilter {
                expr: other.to_string(),
                reason: "unknown operator".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Columns that can narrow the server-side search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    SeqNum,
    Size,
    Timestamp,
    FromEmail,
    Sender,
    MessageId,
    Subject,
    Query,
    Mailbox,
}

impl Column {
    pub fn from_name(name: &str) -> Option<Column> {
        match name {
            "seq_num" => Some(Column::SeqNum),
            "size" => Some(Column::Size),
            "timestamp" => Some(Column::Timestamp),
            "from_email" => Some(Column::FromEmail),
            "sender" => Some(Column::Sender),
            "message_id" => Some(Column::MessageId),
            "subject" => Some(Column::Subject),
            "query" => Some(Column::Query),
            "mailbox" => Some(Column::Mailbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub operator: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
        }
    }

    /// Parse a filter expression such as `seq_num>=5`, `subject=invoice` or
    /// `timestamp<2024-03-01`. The value is typed by its column.
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidFilter {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let at = expr
            .find(|c: char| matches!(c, '<' | '>' | '='))
            .ok_or_else(|| invalid("missing operator"))?;
        let column = expr[..at].trim();
        if column.is_empty() {
            return Err(invalid("missing column"));
        }

        let rest = &expr[at..];
        let op_len = if rest.starts_with(">=") || rest.starts_with("<=") {
            2
        } else {
            1
        };
        let operator: Operator = rest[..op_len].parse()?;
        let raw = unquote(rest[op_len..].trim());

        let value = match Column::from_name(column) {
            Some(Column::SeqNum) | Some(Column::Size) => Value::Int(
                raw.parse()
                    .map_err(|_| invalid("expected an integer value"))?,
            ),
            Some(Column::Timestamp) => Value::Timestamp(
                parse_timestamp(raw).ok_or_else(|| invalid("expected RFC 3339 or YYYY-MM-DD"))?,
            ),
            _ => Value::Text(raw.to_string()),
        };

        Ok(Predicate::new(column, operator, value))
    }
}

fn unquote(raw: &str) -> &str {
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?))
}

// ── Collector ───────────────────────────────────────────────────────────────

/// Predicates grouped by column. Range columns keep every `(operator, value)`
/// pair in arrival order; text columns keep every equality value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateSet {
    pub seq_num: Vec<(Operator, i64)>,
    pub size: Vec<(Operator, i64)>,
    pub timestamp: Vec<(Operator, DateTime<Utc>)>,
    pub from_email: Vec<String>,
    pub sender: Vec<String>,
    pub message_id: Vec<String>,
    pub subject: Vec<String>,
    pub query: Vec<String>,
    pub mailbox: Vec<String>,
}

impl PredicateSet {
    /// Unknown columns, non-equality operators on text columns and values of
    /// the wrong type are skipped.
    pub fn collect<'a, I>(predicates: I) -> Self
    where
        I: IntoIterator<Item = &'a Predicate>,
    {
        let mut set = PredicateSet::default();
        for p in predicates {
            let Some(column) = Column::from_name(&p.column) else {
                debug!("Ignoring predicate on unknown column {:?}", p.column);
                continue;
            };
            if !set.push(column, p.operator, &p.value) {
                debug!(
                    "Ignoring unsupported predicate {} {} {:?}",
                    p.column, p.operator, p.value
                );
            }
        }
        set
    }

    fn push(&mut self, column: Column, op: Operator, value: &Value) -> bool {
        match (column, value) {
            (Column::SeqNum, Value::Int(v)) => self.seq_num.push((op, *v)),
            (Column::Size, Value::Int(v)) => self.size.push((op, *v)),
            (Column::Timestamp, Value::Timestamp(ts)) => self.timestamp.push((op, *ts)),
            (_, Value::Text(text)) if op == Operator::Eq => {
                let bucket = match column {
                    Column::FromEmail => &mut self.from_email,
                    Column::Sender => &mut self.sender,
                    Column::MessageId => &mut self.message_id,
                    Column::Subject => &mut self.subject,
                    Column::Query => &mut self.query,
                    Column::Mailbox => &mut self.mailbox,
                    Column::SeqNum | Column::Size | Column::Timestamp => return false,
                };
                bucket.push(text.clone());
            }
            _ => return false,
        }
        true
    }

    /// The mailbox named by the query, if any. The last clause wins.
    pub fn mailbox(&self) -> Option<&str> {
        self.mailbox.last().map(String::as_str)
    }

    /// The free-text query value, as echoed back on rows.
    pub fn query_text(&self) -> Option<&str> {
        self.query.last().map(String::as_str)
    }
}

// ── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_expressions() {
        let p = Predicate::parse("seq_num>=5").unwrap();
        assert_eq!(p.column, "seq_num");
        assert_eq!(p.operator, Operator::Ge);
        assert_eq!(p.value, Value::Int(5));

        let p = Predicate::parse(" size < 2048 ").unwrap();
        assert_eq!(p.operator, Operator::Lt);
        assert_eq!(p.value, Value::Int(2048));
    }

    #[test]
    fn parses_text_and_strips_quotes() {
        let p = Predicate::parse("subject='quarterly report'").unwrap();
        assert_eq!(p.operator, Operator::Eq);
        assert_eq!(p.value, Value::Text("quarterly report".into()));

        // Operators inside the value are part of the value.
        let p = Predicate::parse("query=a<b").unwrap();
        assert_eq!(p.value, Value::Text("a<b".into()));
    }

    #[test]
    fn parses_timestamps_and_dates() {
        let p = Predicate::parse("timestamp>2024-03-10T15:30:00+02:00").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 10, 13, 30, 0).unwrap();
        assert_eq!(p.value, Value::Timestamp(expected));

        let p = Predicate::parse("timestamp<=2024-03-10").unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(p.value, Value::Timestamp(midnight));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["seq_num", "=5", "seq_num>five", "timestamp>yesterday", "size=>3"] {
            assert!(
                matches!(Predicate::parse(expr), Err(Error::InvalidFilter { .. })),
                "{} should not parse",
                expr
            );
        }
    }

    #[test]
    fn collect_keeps_every_pair_per_column() {
        let preds = vec![
            Predicate::new("seq_num", Operator::Gt, Value::Int(5)),
            Predicate::new("seq_num", Operator::Le, Value::Int(10)),
            Predicate::new("subject", Operator::Eq, Value::Text("a".into())),
            Predicate::new("subject", Operator::Eq, Value::Text("b".into())),
        ];
        let set = PredicateSet::collect(&preds);
        assert_eq!(set.seq_num, vec![(Operator::Gt, 5), (Operator::Le, 10)]);
        assert_eq!(set.subject, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn collect_ignores_unknown_columns_and_mismatches() {
        let preds = vec![
            Predicate::new("colour", Operator::Eq, Value::Text("red".into())),
            Predicate::new("seq_num", Operator::Eq, Value::Text("5".into())),
            Predicate::new("subject", Operator::Gt, Value::Text("m".into())),
            Predicate::new("size", Operator::Ge, Value::Int(100)),
        ];
        let set = PredicateSet::collect(&preds);
        assert!(set.seq_num.is_empty());
        assert!(set.subject.is_empty());
        assert_eq!(set.size, vec![(Operator::Ge, 100)]);
    }

    #[test]
    fn last_mailbox_clause_wins() {
        let preds = vec![
            Predicate::new("mailbox", Operator::Eq, Value::Text("INBOX".into())),
            Predicate::new("mailbox", Operator::Eq, Value::Text("Archive".into())),
        ];
        let set = PredicateSet::collect(&preds);
        assert_eq!(set.mailbox(), Some("Archive"));
        assert_eq!(PredicateSet::default().mailbox(), None);
    }
}
