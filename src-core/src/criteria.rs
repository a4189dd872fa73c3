//! Translation of grouped predicates into one IMAP SEARCH expression.
//!
//! Sequence-number clauses are intersected with the whole-mailbox range.
//! Timestamps only map onto SENTSINCE/SENTBEFORE, which compare calendar
//! dates, so every timestamp bound is widened by one day in the direction that
//! keeps true matches; exact filtering is left to whoever consumes the rows.
//! Size clauses become the strict LARGER/SMALLER bounds.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Utc};

use crate::predicate::{Operator, PredicateSet};

/// Inclusive `from:to` sequence range. `from > to` means nothing can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub from: u32,
    pub to: u32,
}

impl SequenceRange {
    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub sequence: SequenceRange,
    pub text: Vec<String>,
    pub headers: Vec<HeaderMatch>,
    pub sent_since: Option<DateTime<Utc>>,
    pub sent_before: Option<DateTime<Utc>>,
    /// Matches messages strictly larger than this many bytes.
    pub larger: Option<u32>,
    /// Matches messages strictly smaller than this many bytes.
    pub smaller: Option<u32>,
}

/// Build the criteria for a mailbox holding `message_count` messages.
pub fn build(filters: &PredicateSet, message_count: u32) -> SearchCriteria {
    let mut headers = Vec::new();
    let by_header = [
        ("Subject", &filters.subject),
        ("Message-Id", &filters.message_id),
        ("From", &filters.from_email),
        ("Sender", &filters.sender),
    ];
    for (name, values) in by_header {
        headers.extend(values.iter().map(|v| HeaderMatch {
            name,
            value: v.clone(),
        }));
    }

    let (sent_since, sent_before) = date_window(&filters.timestamp);
    let (larger, smaller) = size_bounds(&filters.size);

    SearchCriteria {
        sequence: fold_sequence(&filters.seq_num, message_count),
        text: filters.query.clone(),
        headers,
        sent_since,
        sent_before,
        larger,
        smaller,
    }
}

/// Intersect every clause with `[1, message_count]`. Each operator only ever
/// tightens a bound, so clause order does not change the result.
fn fold_sequence(clauses: &[(Operator, i64)], message_count: u32) -> SequenceRange {
    let mut from: i64 = 1;
    let mut to = i64::from(message_count);

    for &(op, v) in clauses {
        let (lo, hi) = match op {
            Operator::Eq => (v, v),
            Operator::Gt => (v.saturating_add(1), i64::MAX),
            Operator::Ge => (v, i64::MAX),
            Operator::Lt => (i64::MIN, v.saturating_sub(1)),
            Operator::Le => (i64::MIN, v),
        };
        from = from.max(lo);
        to = to.min(hi);
    }

    if from > to {
        return SequenceRange { from: 1, to: 0 };
    }
    // 1 <= from <= to <= message_count here.
    SequenceRange {
        from: from as u32,
        to: to as u32,
    }
}

fn date_window(
    clauses: &[(Operator, DateTime<Utc>)],
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let day = Duration::days(1);
    // IMAP dates carry a four digit year; a bound outside that is left off.
    let dated = |ts: DateTime<Utc>| (1..=9999).contains(&ts.year()).then_some(ts);
    let back = |ts: DateTime<Utc>| ts.checked_sub_signed(day).and_then(dated);
    let ahead = |ts: DateTime<Utc>| ts.checked_add_signed(day).and_then(dated);

    let mut since = None;
    let mut before = None;
    for &(op, ts) in clauses {
        match op {
            Operator::Gt | Operator::Ge => since = back(ts),
            Operator::Eq => {
                since = back(ts);
                before = ahead(ts);
            }
            Operator::Lt | Operator::Le => before = ahead(ts),
        }
    }
    (since, before)
}

fn size_bounds(clauses: &[(Operator, i64)]) -> (Option<u32>, Option<u32>) {
    let clamp = |v: i64| v.clamp(0, i64::from(u32::MAX)) as u32;
    // LARGER n means size > n; a negative n constrains nothing.
    let larger_than = |v: i64| (v >= 0).then(|| clamp(v));

    let mut larger = None;
    let mut smaller = None;
    for &(op, v) in clauses {
        match op {
            Operator::Eq => {
                larger = larger_than(v.saturating_sub(1));
                smaller = Some(clamp(v.saturating_add(1)));
            }
            Operator::Gt => larger = larger_than(v),
            Operator::Ge => larger = larger_than(v.saturating_sub(1)),
            Operator::Le => smaller = Some(clamp(v.saturating_add(1))),
            Operator::Lt => smaller = Some(clamp(v)),
        }
    }
    (larger, smaller)
}

impl SearchCriteria {
    /// `Some("UTF-8")` when a text or header term is not plain ASCII.
    pub fn charset(&self) -> Option<&'static str> {
        let mut terms = self.text.iter().chain(self.headers.iter().map(|h| &h.value));
        terms.any(|t| !t.is_ascii()).then_some("UTF-8")
    }

    /// Render as the argument of an IMAP `SEARCH` command, every string quoted.
    pub fn to_imap_query(&self) -> String {
        self.render(false)
    }

    /// Like [`to_imap_query`](Self::to_imap_query), but non-ASCII strings go
    /// out as `LITERAL+` literals. Only valid when the server advertises it.
    pub fn to_imap_literal_query(&self) -> String {
        self.render(true)
    }

    fn render(&self, literals: bool) -> String {
        let string = |value: &str| {
            if literals && !value.is_ascii() {
                literal(value)
            } else {
                quote(value)
            }
        };

        let mut parts = Vec::new();
        if let Some(charset) = self.charset() {
            parts.push(format!("CHARSET {}", charset));
        }
        parts.push(format!("{}:{}", self.sequence.from, self.sequence.to));

        for t in &self.text {
            parts.push(format!("TEXT {}", string(t)));
        }
        for h in &self.headers {
            parts.push(format!("HEADER {} {}", h.name, string(&h.value)));
        }
        if let Some(since) = self.sent_since {
            parts.push(format!("SENTSINCE {}", since.format("%d-%b-%Y")));
        }
        if let Some(before) = self.sent_before {
            parts.push(format!("SENTBEFORE {}", before.format("%d-%b-%Y")));
        }
        if let Some(n) = self.larger {
            parts.push(format!("LARGER {}", n));
        }
        if let Some(n) = self.smaller {
            parts.push(format!("SMALLER {}", n));
        }

        parts.join(" ")
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_imap_query())
    }
}

/// Search terms are single-line; line breaks become spaces.
fn one_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    let escaped = one_line(value).replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Non-synchronizing literal, length in bytes.
fn literal(value: &str) -> String {
    let value = one_line(value);
    format!("{{{}+}}\r\n{}", value.len(), value)
}

// ── Unit tests ──────────────────────────────────────────────────────────────
