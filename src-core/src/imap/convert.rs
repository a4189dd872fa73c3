use async_imap::types::{Fetch, Flag, Mailbox, Name, NameAttribute};
use chrono::Utc;
use imap_proto::types::Envelope;

use crate::mailbox::{MailboxInfo, MailboxStatus};
use crate::session::RawMessage;

pub(crate) fn raw_message(fetch: &Fetch) -> RawMessage {
    RawMessage {
        seq_num: fetch.message,
        uid: fetch.uid,
        size: fetch.size,
        flags: fetch.flags().map(|f| flag_name(&f)).collect(),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        envelope_subject: fetch.envelope().and_then(envelope_subject),
        body: fetch.body().map(<[u8]>::to_vec),
    }
}

pub(crate) fn mailbox_info(name: &Name) -> MailboxInfo {
    MailboxInfo {
        name: name.name().to_string(),
        attributes: name.attributes().iter().map(attribute_name).collect(),
        delimiter: name.delimiter().map(str::to_string),
    }
}

pub(crate) fn mailbox_status(mailbox: &Mailbox, read_only: bool) -> MailboxStatus {
    MailboxStatus {
        flags: mailbox.flags.iter().map(flag_name).collect(),
        permanent_flags: mailbox.permanent_flags.iter().map(flag_name).collect(),
        messages: mailbox.exists,
        recent: mailbox.recent,
        unseen: mailbox.unseen,
        read_only,
    }
}

/// Envelope subjects arrive as the raw header text, encoded-words and all.
/// They are decoded by handing them to mailparse as a `Subject` header.
fn envelope_subject(envelope: &Envelope<'_>) -> Option<String> {
    let raw = envelope.subject.as_deref()?;
    let mut header = b"Subject: ".to_vec();
    header.extend_from_slice(raw);
    let decoded = mailparse::parse_header(&header)
        .map(|(subject, _)| subject.get_value())
        .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned());
    Some(decoded)
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(c) => c.to_string(),
        _ => format!("{:?}", flag),
    }
}

fn attribute_name(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::Extension(s) => s.to_string(),
        other => format!("\\{:?}", other),
    }
}

/// Compact IMAP sequence set, e.g. `[1, 2, 3, 7, 9, 10]` -> `1:3,7,9:10`.
/// Runs are only merged when consecutive in the given order.
pub(crate) fn sequence_set(ids: &[u32]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut iter = ids.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if end.checked_add(1) != Some(next) {
                break;
            }
            end = next;
            iter.next();
        }
        if start == end {
            out.push(start.to_string());
        } else {
            out.push(format!("{}:{}", start, end));
        }
    }
    out.join(",")
}
