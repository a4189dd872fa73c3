//! Decoding of fetched messages into rows.
//!
//! Decoding never fails. Whatever the protocol layer already supplied
//! (sequence number, uid, size, flags, mailbox) is always kept; MIME-derived
//! fields are filled in when parsing succeeds and problems are recorded in
//! `errors`. Text that is not valid UTF-8 is dropped rather than passed on.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::Serialize;
use tracing::warn;

use crate::session::RawMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

/// Metadata of an attached or embedded part. Payload bytes are never kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentInfo {
    pub part_id: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub content_type_params: BTreeMap<String, String>,
    pub disposition: Option<String>,
    pub file_name: Option<String>,
    pub content_id: Option<String>,
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedMessage {
    /// Mailbox selected for the list call, not whatever the server echoes.
    pub mailbox: String,
    pub seq_num: u32,
    pub uid: Option<u32>,
    pub size: Option<u32>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    /// Value of the `Date` header.
    pub timestamp: Option<DateTime<Utc>>,
    /// Lower-cased address of the first `From` mailbox.
    pub from_email: Option<String>,
    pub from_addresses: Vec<EmailAddress>,
    pub to_addresses: Vec<EmailAddress>,
    pub cc_addresses: Vec<EmailAddress>,
    pub bcc_addresses: Vec<EmailAddress>,
    pub sender: Option<String>,
    pub subject: String,
    pub message_id: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<AttachmentInfo>,
    pub embedded_files: Vec<AttachmentInfo>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub errors: Vec<String>,
}

/// Decode one fetched message for `mailbox`.
pub fn decode(raw: &RawMessage, mailbox: &str) -> ParsedMessage {
    let mut message = ParsedMessage {
        mailbox: mailbox.to_string(),
        seq_num: raw.seq_num,
        uid: raw.uid,
        size: raw.size,
        flags: raw.flags.clone(),
        internal_date: raw.internal_date,
        ..Default::default()
    };

    let Some(body) = raw.body.as_deref() else {
        warn!("[IMAP] No body section for message seq={}", raw.seq_num);
        message.errors.push("server returned no body section".to_string());
        return message;
    };

    match mailparse::parse_mail(body) {
        Ok(parsed) => fill_from_mime(&mut message, &parsed),
        Err(e) => {
            warn!(
                "[IMAP] Cannot parse message seq={} subject={:?}: {}",
                raw.seq_num, raw.envelope_subject, e
            );
            message.errors.push(format!("cannot parse message: {}", e));
        }
    }
    message
}

fn fill_from_mime(message: &mut ParsedMessage, parsed: &ParsedMail) {
    let headers = &parsed.headers;

    for h in headers {
        message
            .headers
            .entry(h.get_key())
            .or_default()
            .push(h.get_value());
    }

    if let Some(h) = headers.get_first_header("Subject") {
        let value = h.get_value();
        if std::str::from_utf8(h.get_value_raw()).is_ok() && !value.contains('\u{FFFD}') {
            message.subject = value;
        } else {
            message.errors.push("dropped subject with invalid encoding".to_string());
        }
    }

    message.message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    message.in_reply_to = message_id_header(headers, "In-Reply-To", &mut message.errors);
    message.references = message_id_header(headers, "References", &mut message.errors);

    let mut errors = Vec::new();
    message.from_addresses = address_header(headers, "From", &mut errors);
    message.to_addresses = address_header(headers, "To", &mut errors);
    message.cc_addresses = address_header(headers, "Cc", &mut errors);
    message.bcc_addresses = address_header(headers, "Bcc", &mut errors);
    message.sender = address_header(headers, "Sender", &mut errors)
        .into_iter()
        .next()
        .map(|a| a.address.to_lowercase());
    message.from_email = message
        .from_addresses
        .first()
        .map(|a| a.address.to_lowercase());
    message.errors.append(&mut errors);

    if let Some(date) = headers.get_first_value("Date") {
        match mailparse::dateparse(&date) {
            Ok(secs) => message.timestamp = Utc.timestamp_opt(secs, 0).single(),
            Err(e) => message.errors.push(format!("invalid Date header {:?}: {}", date, e)),
        }
    }

    let mut parts = Parts::default();
    walk_mime_parts(parsed, "", &mut parts);
    message.body_text = parts.text.unwrap_or_default();
    message.body_html = parts.html.unwrap_or_default();
    message.attachments = parts.attachments;
    message.embedded_files = parts.embedded;
    message.errors.append(&mut parts.errors);
}

/// Identifiers listed in every `name` header, angle brackets kept.
/// A malformed list contributes nothing but an entry in `errors`.
fn message_id_header(
    headers: &[mailparse::MailHeader],
    name: &str,
    errors: &mut Vec<String>,
) -> Vec<String> {
    let mut ids = Vec::new();
    for value in headers.get_all_values(name) {
        match mailparse::msgidparse(&value) {
            Ok(list) => ids.extend(list.iter().map(|id| {
                format!("<{}>", id.trim().trim_start_matches('<').trim_end_matches('>'))
            })),
            Err(e) => {
                errors.push(format!("invalid {} header: {}", name, e));
                return Vec::new();
            }
        }
    }
    ids
}

fn address_header(
    headers: &[mailparse::MailHeader],
    name: &str,
    errors: &mut Vec<String>,
) -> Vec<EmailAddress> {
    let Some(value) = headers.get_first_value(name) else {
        return Vec::new();
    };
    if value.trim().is_empty() {
        return Vec::new();
    }
    match mailparse::addrparse(&value) {
        Ok(addrs) => addrs
            .iter()
            .flat_map(|a| match a {
                mailparse::MailAddr::Single(info) => vec![EmailAddress {
                    name: info.display_name.clone(),
                    address: info.addr.clone(),
                }],
                mailparse::MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| EmailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(e) => {
            errors.push(format!("invalid {} header: {}", name, e));
            Vec::new()
        }
    }
}

#[derive(Default)]
struct Parts {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentInfo>,
    embedded: Vec<AttachmentInfo>,
    errors: Vec<String>,
}

fn walk_mime_parts(part: &ParsedMail, part_id: &str, parts: &mut Parts) {
    if !part.subparts.is_empty() {
        for (i, sub) in part.subparts.iter().enumerate() {
            let child = if part_id.is_empty() {
                (i + 1).to_string()
            } else {
                format!("{}.{}", part_id, i + 1)
            };
            walk_mime_parts(sub, &child, parts);
        }
        return;
    }

    let part_id = if part_id.is_empty() { "1" } else { part_id };
    let content_type = part.ctype.mimetype.to_lowercase();
    let explicit = part.headers.get_first_value("Content-Disposition").is_some();
    let disposition = part.get_content_disposition();
    let is_attachment = explicit && disposition.disposition == DispositionType::Attachment;
    let content_id = part.headers.get_first_value("Content-ID");

    if !is_attachment && content_type == "text/plain" && parts.text.is_none() {
        parts.text = Some(text_body(part, &mut parts.errors));
    } else if !is_attachment && content_type == "text/html" && parts.html.is_none() {
        parts.html = Some(text_body(part, &mut parts.errors));
    } else if is_attachment || !content_type.starts_with("text/") {
        let info = attachment_info(part, part_id, &content_type, content_id.clone());
        let embedded = !is_attachment
            && (content_id.is_some()
                || (explicit && disposition.disposition == DispositionType::Inline));
        if embedded {
            parts.embedded.push(info);
        } else {
            parts.attachments.push(info);
        }
    }
}

/// Decoded text of a part. UTF-8 labelled content that is not valid UTF-8
/// comes back empty, with the problem noted in `errors`.
fn text_body(part: &ParsedMail, errors: &mut Vec<String>) -> String {
    let charset = part.ctype.charset.to_ascii_lowercase();
    let decoded = if matches!(charset.as_str(), "utf-8" | "utf8" | "us-ascii" | "ascii") {
        part.get_body_raw()
            .map_err(|e| e.to_string())
            .and_then(|raw| String::from_utf8(raw).map_err(|_| "invalid UTF-8".to_string()))
    } else {
        part.get_body().map_err(|e| e.to_string())
    };

    match decoded {
        Ok(text) if !text.contains('\u{FFFD}') => text,
        Ok(_) => {
            errors.push(format!("dropped {} body with undecodable characters", part.ctype.mimetype));
            String::new()
        }
        Err(e) => {
            errors.push(format!("dropped {} body: {}", part.ctype.mimetype, e));
            String::new()
        }
    }
}

fn attachment_info(
    part: &ParsedMail,
    part_id: &str,
    content_type: &str,
    content_id: Option<String>,
) -> AttachmentInfo {
    let disposition = part.get_content_disposition();
    let file_name = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let mut errors = Vec::new();
    // Only checks that the transfer encoding decodes; the bytes are discarded.
    if let Err(e) = part.get_body_raw() {
        errors.push(format!("cannot decode part body: {}", e));
    }

    AttachmentInfo {
        part_id: part_id.to_string(),
        content_type: content_type.to_string(),
        content_type_params: part
            .ctype
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        disposition: part
            .headers
            .get_first_value("Content-Disposition")
            .map(|_| disposition_name(&disposition.disposition)),
        file_name,
        content_id,
        charset: part.ctype.params.get("charset").cloned(),
        errors,
    }
}

fn disposition_name(disposition: &DispositionType) -> String {
    match disposition {
        DispositionType::Inline => "inline".to_string(),
        DispositionType::Attachment => "attachment".to_string(),
        DispositionType::FormData => "form-data".to_string(),
        DispositionType::Extension(other) => other.to_lowercase(),
    }
}

// ── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Fixtures --

    const PLAIN_EMAIL: &[u8] = b"From: Alice Example <Alice@Example.COM>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Cc: dave@example.com\r\n\
Subject: Hello\r\n\
Date: Thu, 19 Feb 2026 10:00:00 +0000\r\n\
Message-ID: <hello-1@example.com>\r\n\
In-Reply-To: <parent@example.com>\r\n\
References: <root@example.com> <parent@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello, World!";

    fn multipart_mixed_and_inline() -> Vec<u8> {
        b"From: dave@example.com\r\n\
Subject: Mixed attachments\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"MIX\"\r\n\
\r\n\
--MIX\r\n\
Content-Type: multipart/alternative; boundary=\"ALT\"\r\n\
\r\n\
--ALT\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--ALT\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>See attached.</p>\r\n\
--ALT--\r\n\
--MIX\r\n\
Content-Type: image/png\r\n\
Content-ID: <logo123>\r\n\
Content-Disposition: inline\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--MIX\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--MIX--\r\n"
            .to_vec()
    }

    fn raw(body: &[u8]) -> RawMessage {
        RawMessage {
            seq_num: 7,
            uid: Some(4107),
            size: Some(body.len() as u32),
            flags: vec!["\\Seen".to_string(), "\\Flagged".to_string()],
            internal_date: None,
            envelope_subject: Some("envelope subject".to_string()),
            body: Some(body.to_vec()),
        }
    }

    #[test]
    fn plain_message_fields() {
        let msg = decode(&raw(PLAIN_EMAIL), "INBOX");
        assert_eq!(msg.mailbox, "INBOX");
        assert_eq!(msg.seq_num, 7);
        assert_eq!(msg.uid, Some(4107));
        assert_eq!(msg.subject, "Hello");
        assert_eq!(msg.body_text, "Hello, World!");
        assert!(msg.body_html.is_empty());
        assert_eq!(msg.message_id.as_deref(), Some("<hello-1@example.com>"));
        assert_eq!(msg.in_reply_to, vec!["<parent@example.com>"]);
        assert_eq!(msg.references, vec!["<root@example.com>", "<parent@example.com>"]);
        assert!(msg.errors.is_empty(), "{:?}", msg.errors);
    }

    #[test]
    fn addresses_and_lowercased_first_from() {
        let msg = decode(&raw(PLAIN_EMAIL), "INBOX");
        assert_eq!(msg.from_email.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.from_addresses[0].name.as_deref(), Some("Alice Example"));
        assert_eq!(msg.from_addresses[0].address, "Alice@Example.COM");
        let to: Vec<&str> = msg.to_addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(msg.cc_addresses.len(), 1);
        assert!(msg.bcc_addresses.is_empty());
    }

    #[test]
    fn date_header_becomes_timestamp() {
        let msg = decode(&raw(PLAIN_EMAIL), "INBOX");
        let expected = Utc.with_ymd_and_hms(2026, 2, 19, 10, 0, 0).unwrap();
        assert_eq!(msg.timestamp, Some(expected));
    }

    #[test]
    fn header_map_keeps_every_value() {
        let msg = decode(&raw(PLAIN_EMAIL), "INBOX");
        assert_eq!(msg.headers["Subject"], vec!["Hello"]);
        assert!(msg.headers.contains_key("References"));
    }

    #[test]
    fn mailbox_comes_from_the_caller() {
        let msg = decode(&raw(PLAIN_EMAIL), "Archive/2024");
        assert_eq!(msg.mailbox, "Archive/2024");
    }

    #[test]
    fn decoding_is_idempotent() {
        let r = raw(&multipart_mixed_and_inline());
        assert_eq!(decode(&r, "INBOX"), decode(&r, "INBOX"));
    }

    #[test]
    fn multipart_bodies_and_parts() {
        let msg = decode(&raw(&multipart_mixed_and_inline()), "INBOX");
        assert_eq!(msg.body_text.trim(), "See attached.");
        assert_eq!(msg.body_html.trim(), "<p>See attached.</p>");

        assert_eq!(msg.attachments.len(), 1);
        let pdf = &msg.attachments[0];
        assert_eq!(pdf.part_id, "3");
        assert_eq!(pdf.content_type, "application/pdf");
        assert_eq!(pdf.file_name.as_deref(), Some("report.pdf"));
        assert_eq!(pdf.disposition.as_deref(), Some("attachment"));

        assert_eq!(msg.embedded_files.len(), 1);
        let logo = &msg.embedded_files[0];
        assert_eq!(logo.part_id, "2");
        assert_eq!(logo.content_id.as_deref(), Some("<logo123>"));
        assert_eq!(logo.disposition.as_deref(), Some("inline"));
    }

    #[test]
    fn attachment_rows_carry_no_payload() {
        let msg = decode(&raw(&multipart_mixed_and_inline()), "INBOX");
        let json = serde_json::to_string(&msg.attachments).unwrap();
        assert!(!json.contains("JVBERi0xLjQK"));
        assert!(!json.contains("%PDF"));
    }

    #[test]
    fn unparseable_message_keeps_protocol_fields() {
        let broken = b" leading whitespace is not a header\r\n\r\nbody";
        let msg = decode(&raw(broken), "INBOX");
        assert_eq!(msg.seq_num, 7);
        assert_eq!(msg.size, Some(broken.len() as u32));
        assert_eq!(msg.flags, vec!["\\Seen", "\\Flagged"]);
        assert_eq!(msg.mailbox, "INBOX");
        assert!(msg.subject.is_empty());
        assert!(msg.body_text.is_empty());
        assert!(msg.from_addresses.is_empty());
        assert_eq!(msg.errors.len(), 1);
    }

    #[test]
    fn missing_body_section_is_a_partial_row() {
        let mut r = raw(PLAIN_EMAIL);
        r.body = None;
        let msg = decode(&r, "INBOX");
        assert_eq!(msg.uid, Some(4107));
        assert!(msg.subject.is_empty());
        assert_eq!(msg.errors.len(), 1);
    }

    #[test]
    fn invalid_utf8_text_is_dropped() {
        let mut body = b"From: a@example.com\r\nSubject: caf\xe9\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nna\xefve \xff text".to_vec();
        body.extend_from_slice(b"\r\n");
        let msg = decode(&raw(&body), "INBOX");
        assert!(msg.subject.is_empty());
        assert!(msg.body_text.is_empty());
        assert_eq!(msg.from_email.as_deref(), Some("a@example.com"));
        assert_eq!(msg.errors.len(), 2, "{:?}", msg.errors);
    }

    #[test]
    fn declared_charsets_are_converted() {
        let body = b"Subject: =?iso-8859-1?q?caf=E9?=\r\nContent-Type: text/plain; charset=iso-8859-1\r\n\r\nna\xefve";
        let msg = decode(&raw(body), "INBOX");
        assert_eq!(msg.subject, "caf\u{e9}");
        assert_eq!(msg.body_text, "na\u{ef}ve");
    }

    #[test]
    fn folded_reference_lists_are_split() {
        let body = b"Subject: thread\r\n\
References: <root@example.com>\r\n <mid@example.com>\r\n\t<parent@example.com>\r\n\
In-Reply-To: <parent@example.com>\r\n\
\r\n\
reply";
        let msg = decode(&raw(body), "INBOX");
        assert_eq!(
            msg.references,
            vec!["<root@example.com>", "<mid@example.com>", "<parent@example.com>"]
        );
        assert_eq!(msg.in_reply_to, vec!["<parent@example.com>"]);
        assert!(msg.errors.is_empty(), "{:?}", msg.errors);
    }

    #[test]
    fn free_text_in_reply_to_is_not_split_into_ids() {
        let body = b"Subject: old style reply\r\n\
In-Reply-To: Your message of Tue, 3 Mar 2020\r\n\
References: <root@example.com>\r\n\
\r\n\
reply";
        let msg = decode(&raw(body), "INBOX");
        assert!(msg.in_reply_to.is_empty());
        assert_eq!(msg.references, vec!["<root@example.com>"]);
        assert_eq!(msg.errors.len(), 1);
        assert!(msg.errors[0].contains("In-Reply-To"), "{:?}", msg.errors);
    }
}
