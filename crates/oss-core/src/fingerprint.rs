use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Bumped whenever normalization or the fingerprint tuple changes shape.
pub const PARSER_VERSION: &str = "v1";

/// Only the first 64 KiB of body text participates in the fingerprint so that
/// trailing quote chains and signatures appended by intermediate hops cannot
/// split otherwise-identical deliveries.
const BODY_HASH_PREFIX: usize = 64 * 1024;

const FIELD_SEPARATOR: &str = "\u{1f}";

/// Strip reply/forward prefixes and collapse whitespace. Used both for the
/// fingerprint and for subject-based stitching, so the two always agree.
pub fn normalize_subject(raw: &str) -> String {
    let mut subject = raw.trim();
    loop {
        let lowered = subject.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find_map(|prefix| lowered.starts_with(prefix).then(|| subject[prefix.len()..].trim_start()));
        match stripped {
            Some(rest) if rest.len() < subject.len() => subject = rest,
            _ => break,
        }
    }

    subject
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().trim_matches(['<', '>']).to_lowercase()
}

/// RFC 3339 at second precision; Workspace rewrites sub-second fields when it
/// re-journals a message.
pub fn normalize_date(date: Option<DateTime<Utc>>) -> String {
    date.map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// SHA-256 of the first 64 KiB of normalized body text, lowercase hex.
pub fn body_text_hash(body_text: &str) -> String {
    let bytes = body_text.as_bytes();
    let prefix = &bytes[..bytes.len().min(BODY_HASH_PREFIX)];
    sha256_hex(prefix)
}

/// Fingerprint v1: hash of ⟨normalized subject, normalized from, date at
/// second precision, sorted normalized to+cc, body-prefix hash⟩.
///
/// `Message-ID` is deliberately absent: Workspace rewrites it on journaled
/// copies, so including it would defeat deduplication across mailboxes.
pub fn fingerprint_v1(
    subject: Option<&str>,
    from: Option<&str>,
    date: Option<DateTime<Utc>>,
    to_and_cc: &[String],
    body_hash: &str,
) -> String {
    let mut recipients: Vec<String> = to_and_cc.iter().map(|addr| normalize_email(addr)).collect();
    recipients.sort();
    recipients.dedup();

    let tuple = [
        normalize_subject(subject.unwrap_or_default()),
        normalize_email(from.unwrap_or_default()),
        normalize_date(date),
        recipients.join(","),
        body_hash.to_string(),
    ]
    .join(FIELD_SEPARATOR);

    sha256_hex(tuple.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
