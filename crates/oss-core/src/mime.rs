use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SNIPPET_LEN: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub email: String,
    pub name: Option<String>,
}

/// Where the original-recipient evidence for an occurrence came from,
/// strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSource {
    WorkspaceHeader,
    DeliveredTo,
    XOriginalTo,
    ToCcScan,
    Unknown,
}

impl RecipientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientSource::WorkspaceHeader => "workspace_header",
            RecipientSource::DeliveredTo => "delivered_to",
            RecipientSource::XOriginalTo => "x_original_to",
            RecipientSource::ToCcScan => "to_cc_scan",
            RecipientSource::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "workspace_header" => Some(RecipientSource::WorkspaceHeader),
            "delivered_to" => Some(RecipientSource::DeliveredTo),
            "x_original_to" => Some(RecipientSource::XOriginalTo),
            "to_cc_scan" => Some(RecipientSource::ToCcScan),
            "unknown" => Some(RecipientSource::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientConfidence {
    High,
    Medium,
    Low,
}

impl RecipientConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientConfidence::High => "high",
            RecipientConfidence::Medium => "medium",
            RecipientConfidence::Low => "low",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "high" => Some(RecipientConfidence::High),
            "medium" => Some(RecipientConfidence::Medium),
            "low" => Some(RecipientConfidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientEvidence {
    pub original_recipient: Option<String>,
    pub source: RecipientSource,
    pub confidence: RecipientConfidence,
}

#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub reply_to: Option<String>,
    pub workspace_original_to: Option<String>,
    pub delivered_to: Option<String>,
    pub x_original_to: Option<String>,
    pub x_oss_ticket_id: Option<String>,
    pub x_oss_message_id: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedEmail {
    /// Plain-text body, falling back to the stripped HTML body.
    pub fn effective_body_text(&self) -> String {
        if let Some(text) = &self.body_text {
            return text.clone();
        }
        self.body_html.as_deref().map(strip_html).unwrap_or_default()
    }

    pub fn has_threading_headers(&self) -> bool {
        !self.in_reply_to.is_empty() || !self.references.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MailParseError {
    #[error("malformed MIME message")]
    Malformed,
}

/// Deterministic HTML sanitizer. The allowlist blocks script execution,
/// event handlers, and remote resource loads (images, stylesheets, fonts,
/// frames); anchors survive because navigation is not a resource load.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    revision: String,
}

/// Tags that trigger remote fetches or embed active content.
const RESOURCE_TAGS: &[&str] = &[
    "img", "picture", "source", "video", "audio", "track", "iframe", "frame", "frameset",
    "object", "embed", "applet", "link", "base", "meta", "form", "input", "button", "select",
    "textarea",
];

impl Sanitizer {
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn clean(&self, html: &str) -> String {
        let mut builder = ammonia::Builder::default();
        builder.rm_tags(RESOURCE_TAGS.iter().copied());
        builder.clean(html).to_string()
    }
}

/// Decode a raw RFC 822 message into normalized fields.
pub fn parse_rfc822(raw: &[u8], sanitizer: &Sanitizer) -> Result<ParsedEmail, MailParseError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(MailParseError::Malformed)?;

    // An empty parse (no headers at all) is treated as malformed rather than
    // producing a canonical row with a degenerate fingerprint.
    if message.headers().is_empty() {
        return Err(MailParseError::Malformed);
    }

    let from = message.from().and_then(|addr| addr.first());
    let from_email = from
        .and_then(|addr| addr.address.as_deref())
        .map(|addr| addr.to_string());
    let from_name = from
        .and_then(|addr| addr.name.as_deref())
        .map(|name| name.to_string())
        .filter(|name| !name.trim().is_empty());

    let date = message
        .date()
        .and_then(|dt| Utc.timestamp_opt(dt.to_timestamp(), 0).single());

    let body_text = message
        .body_text(0)
        .map(|text| text.to_string())
        .filter(|text| !text.is_empty());
    let body_html = message.body_html(0).map(|html| sanitizer.clean(&html));

    let snippet = body_text
        .as_deref()
        .map(str::to_string)
        .or_else(|| body_html.as_deref().map(strip_html))
        .map(|text| make_snippet(&text))
        .filter(|snippet| !snippet.is_empty());

    let mut attachments = Vec::new();
    for part in message.attachments() {
        let content_type = part.content_type().map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        });
        let content_id = part.content_id().map(|id| id.to_string());
        let is_inline = content_id.is_some()
            || part
                .content_disposition()
                .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("inline"));

        attachments.push(ParsedAttachment {
            filename: part.attachment_name().map(|name| name.to_string()),
            content_type,
            data: part.contents().to_vec(),
            is_inline,
            content_id,
        });
    }

    Ok(ParsedEmail {
        subject: message.subject().map(|s| s.to_string()),
        from_email,
        from_name,
        to: collect_addresses(message.to()),
        cc: collect_addresses(message.cc()),
        date,
        message_id: message.message_id().map(|id| id.to_string()),
        in_reply_to: header_id_list(&message, "In-Reply-To"),
        references: header_id_list(&message, "References"),
        reply_to: message
            .reply_to()
            .and_then(|addr| addr.first())
            .and_then(|addr| addr.address.as_deref())
            .map(|addr| addr.to_string()),
        workspace_original_to: header_text(&message, "X-Gm-Original-To"),
        delivered_to: header_text(&message, "Delivered-To"),
        x_original_to: header_text(&message, "X-Original-To"),
        x_oss_ticket_id: header_text(&message, "X-OSS-Ticket-ID"),
        x_oss_message_id: header_text(&message, "X-OSS-Message-ID"),
        body_text,
        body_html,
        snippet,
        attachments,
    })
}

/// Resolve recipient evidence from headers, strongest source first.
pub fn resolve_recipient_evidence(
    parsed: &ParsedEmail,
    org_domains: &[String],
) -> RecipientEvidence {
    if let Some(recipient) = &parsed.workspace_original_to {
        return RecipientEvidence {
            original_recipient: Some(recipient.to_lowercase()),
            source: RecipientSource::WorkspaceHeader,
            confidence: RecipientConfidence::High,
        };
    }
    if let Some(recipient) = &parsed.delivered_to {
        return RecipientEvidence {
            original_recipient: Some(recipient.to_lowercase()),
            source: RecipientSource::DeliveredTo,
            confidence: RecipientConfidence::Medium,
        };
    }
    if let Some(recipient) = &parsed.x_original_to {
        return RecipientEvidence {
            original_recipient: Some(recipient.to_lowercase()),
            source: RecipientSource::XOriginalTo,
            confidence: RecipientConfidence::Medium,
        };
    }

    let scanned = parsed
        .to
        .iter()
        .chain(parsed.cc.iter())
        .map(|addr| addr.email.to_lowercase())
        .find(|email| {
            email_domain(email)
                .is_some_and(|domain| org_domains.iter().any(|d| d.eq_ignore_ascii_case(domain)))
        });
    if let Some(recipient) = scanned {
        return RecipientEvidence {
            original_recipient: Some(recipient),
            source: RecipientSource::ToCcScan,
            confidence: RecipientConfidence::Low,
        };
    }

    RecipientEvidence {
        original_recipient: None,
        source: RecipientSource::Unknown,
        confidence: RecipientConfidence::Low,
    }
}

pub fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

pub fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_snippet(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_LEN).collect()
}

fn collect_addresses(address: Option<&mail_parser::Address<'_>>) -> Vec<EmailAddress> {
    let Some(address) = address else {
        return Vec::new();
    };

    address
        .iter()
        .filter_map(|addr| {
            let email = addr.address.as_deref()?.to_string();
            let name = addr
                .name
                .as_deref()
                .map(|name| name.to_string())
                .filter(|name| !name.trim().is_empty());
            Some(EmailAddress { email, name })
        })
        .collect()
}

fn header_text(message: &mail_parser::Message<'_>, name: &str) -> Option<String> {
    message
        .header(name)
        .and_then(|value| value.as_text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// `In-Reply-To` / `References` carry one or more `<id>` tokens.
fn header_id_list(message: &mail_parser::Message<'_>, name: &str) -> Vec<String> {
    let Some(value) = message.header(name) else {
        return Vec::new();
    };

    let mut ids = Vec::new();
    match value {
        mail_parser::HeaderValue::Text(text) => collect_message_ids(text, &mut ids),
        mail_parser::HeaderValue::TextList(list) => {
            for text in list {
                collect_message_ids(text, &mut ids);
            }
        }
        _ => {}
    }
    ids
}

fn collect_message_ids(text: &str, out: &mut Vec<String>) {
    for token in text.split_whitespace() {
        let id = token.trim_matches(['<', '>', ',']);
        if !id.is_empty() {
            out.push(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new("allowlist-test")
    }

    fn sample_message() -> Vec<u8> {
        concat!(
            "From: Alice <alice@customer.example>\r\n",
            "To: Support <support@example.com>, other@elsewhere.example\r\n",
            "Cc: Carol <carol@example.com>\r\n",
            "Subject: Printer broken\r\n",
            "Date: Mon, 2 Jun 2025 10:20:30 +0000\r\n",
            "Message-ID: <abc-123@customer.example>\r\n",
            "X-Gm-Original-To: Support@Example.com\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "The printer on floor 3 is broken.\r\n",
        )
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn parses_headers_and_body() {
        let parsed = parse_rfc822(&sample_message(), &sanitizer()).expect("parse");

        assert_eq!(parsed.subject.as_deref(), Some("Printer broken"));
        assert_eq!(parsed.from_email.as_deref(), Some("alice@customer.example"));
        assert_eq!(parsed.from_name.as_deref(), Some("Alice"));
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.to[0].email, "support@example.com");
        assert_eq!(parsed.cc.len(), 1);
        assert_eq!(parsed.message_id.as_deref(), Some("abc-123@customer.example"));
        assert!(parsed.body_text.as_deref().unwrap().contains("floor 3"));
        assert!(parsed.date.is_some());
        assert!(parsed.snippet.as_deref().unwrap().starts_with("The printer"));
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let result = parse_rfc822(&[0xff, 0xfe, 0x00, 0x01], &sanitizer());
        assert!(matches!(result, Err(MailParseError::Malformed)));
    }

    #[test]
    fn references_are_split_into_ids() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "Subject: re: thread\r\n",
            "In-Reply-To: <first@x.example>\r\n",
            "References: <first@x.example> <second@x.example>\r\n",
            "\r\n",
            "body\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");

        assert_eq!(parsed.in_reply_to, vec!["first@x.example"]);
        assert_eq!(
            parsed.references,
            vec!["first@x.example", "second@x.example"]
        );
        assert!(parsed.has_threading_headers());
    }

    #[test]
    fn sanitizer_strips_scripts_event_handlers_and_remote_loads() {
        let html = concat!(
            "<p onclick=\"steal()\">Hello</p>",
            "<script>alert(1)</script>",
            "<img src=\"https://evil.example/pixel.png\">",
            "<iframe src=\"https://evil.example\"></iframe>",
            "<link rel=\"stylesheet\" href=\"https://evil.example/a.css\">",
            "<a href=\"https://ok.example\">link</a>",
        );
        let cleaned = sanitizer().clean(html);

        assert!(!cleaned.contains("script"));
        assert!(!cleaned.contains("onclick"));
        assert!(!cleaned.contains("img"));
        assert!(!cleaned.contains("iframe"));
        assert!(!cleaned.contains("stylesheet"));
        assert!(cleaned.contains("Hello"));
        assert!(cleaned.contains("https://ok.example"));
    }

    #[test]
    fn sanitizer_is_deterministic() {
        let html = "<div><p>stable</p><img src=\"x\"></div>";
        assert_eq!(sanitizer().clean(html), sanitizer().clean(html));
    }

    #[test]
    fn evidence_prefers_workspace_header() {
        let parsed = parse_rfc822(&sample_message(), &sanitizer()).expect("parse");
        let evidence = resolve_recipient_evidence(&parsed, &[]);

        assert_eq!(evidence.source, RecipientSource::WorkspaceHeader);
        assert_eq!(evidence.confidence, RecipientConfidence::High);
        assert_eq!(
            evidence.original_recipient.as_deref(),
            Some("support@example.com")
        );
    }

    #[test]
    fn evidence_falls_back_to_delivered_to() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "To: support@example.com\r\n",
            "Delivered-To: helpdesk@example.com\r\n",
            "Subject: s\r\n",
            "\r\n",
            "body\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");
        let evidence = resolve_recipient_evidence(&parsed, &[]);

        assert_eq!(evidence.source, RecipientSource::DeliveredTo);
        assert_eq!(evidence.confidence, RecipientConfidence::Medium);
        assert_eq!(
            evidence.original_recipient.as_deref(),
            Some("helpdesk@example.com")
        );
    }

    #[test]
    fn evidence_scans_to_cc_against_org_domains() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "To: noreply@elsewhere.example, support@example.com\r\n",
            "Subject: s\r\n",
            "\r\n",
            "body\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");
        let evidence = resolve_recipient_evidence(&parsed, &["example.com".to_string()]);

        assert_eq!(evidence.source, RecipientSource::ToCcScan);
        assert_eq!(evidence.confidence, RecipientConfidence::Low);
        assert_eq!(
            evidence.original_recipient.as_deref(),
            Some("support@example.com")
        );
    }

    #[test]
    fn evidence_defaults_to_unknown() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "To: someone@elsewhere.example\r\n",
            "Subject: s\r\n",
            "\r\n",
            "body\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");
        let evidence = resolve_recipient_evidence(&parsed, &["example.com".to_string()]);

        assert_eq!(evidence.source, RecipientSource::Unknown);
        assert_eq!(evidence.confidence, RecipientConfidence::Low);
        assert!(evidence.original_recipient.is_none());
    }

    #[test]
    fn effective_body_text_falls_back_to_html() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "Subject: s\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>Hello <b>world</b></p>\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");

        assert!(parsed.body_text.is_none());
        let text = parsed.effective_body_text();
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
    }

    #[test]
    fn attachments_carry_metadata() {
        let raw = concat!(
            "From: a@x.example\r\n",
            "Subject: with attachment\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--b1\r\n",
            "Content-Type: application/pdf; name=\"report.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--b1--\r\n",
        )
        .as_bytes();
        let parsed = parse_rfc822(raw, &sanitizer()).expect("parse");

        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("report.pdf"));
        assert_eq!(attachment.content_type.as_deref(), Some("application/pdf"));
        assert!(!attachment.is_inline);
        assert_eq!(attachment.data, b"%PDF-1.4");
    }
}
