use chrono::NaiveDateTime;
use rasil_core::types::NormalizedMessage;

use crate::patterns;

/// Minutes within which a same-sender, same-prefix body counts as a repeat.
const DUPLICATE_WINDOW_MINUTES: i64 = 10;
/// Prefix length compared for the duplicate-within-window rule.
const DUPLICATE_PREFIX_CHARS: usize = 100;
/// Spam threshold: 2·keyword + 1·urls + 1·caps.
const SPAM_THRESHOLD: u32 = 3;

/// Sender keywords rejected before anything reaches the inbox table.
const BLOCKED_SENDER_KEYWORDS: &[&str] = &[
    "bot",
    "api",
    "no-reply",
    "noreply",
    "donotreply",
    "newsletter",
    "bulletin",
    "calendly",
    "submagic",
    "iconscout",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Reject(String),
}

/// Per-license filter settings; both lists are empty by default.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    pub blocked_senders: Vec<String>,
    pub blocked_keywords: Vec<String>,
    /// When non-empty, a message must contain one of these to pass.
    pub allowed_keywords: Vec<String>,
}

/// The slice of recent inbox state the duplicate-window rule compares
/// against.
#[derive(Debug, Clone)]
pub struct RecentMessage {
    pub sender_contact: Option<String>,
    pub body: String,
    pub received_at: Option<NaiveDateTime>,
}

/// Run the full chain in order, short-circuiting on the first rejection.
pub fn apply_filters(
    msg: &NormalizedMessage,
    policy: &FilterPolicy,
    recent: &[RecentMessage],
    now: NaiveDateTime,
) -> Verdict {
    if let Some(reason) = filter_empty(msg) {
        return Verdict::Reject(reason);
    }
    if let Some(reason) = filter_spam(msg) {
        return Verdict::Reject(reason);
    }
    if let Some(reason) = filter_automated(msg) {
        return Verdict::Reject(reason);
    }
    if let Some(reason) = filter_duplicate_window(msg, recent, now) {
        return Verdict::Reject(reason);
    }
    if let Some(reason) = filter_blocked_sender(msg, policy) {
        return Verdict::Reject(reason);
    }
    if let Some(reason) = filter_keywords(msg, policy) {
        return Verdict::Reject(reason);
    }
    Verdict::Pass
}

/// Save-time guard against known bots and promotional senders, applied to
/// both the display name and the contact address.
pub fn is_blocked_sender_keyword(sender_name: Option<&str>, sender_contact: Option<&str>) -> bool {
    let hit = |text: &str| {
        let lower = text.to_lowercase();
        BLOCKED_SENDER_KEYWORDS.iter().any(|k| lower.contains(k))
    };
    sender_name.map(hit).unwrap_or(false) || sender_contact.map(hit).unwrap_or(false)
}

fn filter_empty(msg: &NormalizedMessage) -> Option<String> {
    let body = msg.body.trim();
    if body.chars().count() < 3 || !patterns::HAS_LETTER.is_match(body) {
        return Some("Empty message".to_string());
    }
    None
}

fn filter_spam(msg: &NormalizedMessage) -> Option<String> {
    let body = &msg.body;
    let mut score = 0u32;

    if patterns::SPAM_KEYWORDS.is_match(body) {
        score += 2;
    }
    if patterns::URL.find_iter(body).count() > 3 {
        score += 1;
    }
    let letters: Vec<char> = body.chars().filter(|c| c.is_alphabetic()).collect();
    if body.chars().count() > 50 && !letters.is_empty() {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        if upper as f64 / letters.len() as f64 > 0.5 {
            score += 1;
        }
    }

    if score >= SPAM_THRESHOLD {
        Some(format!("Spam score {}", score))
    } else {
        None
    }
}

fn filter_automated(msg: &NormalizedMessage) -> Option<String> {
    if let Some(contact) = &msg.sender_contact {
        if patterns::AUTOMATED_SENDERS.is_match(contact) {
            return Some(format!("Sender pattern: {}", contact));
        }
    }

    let subject = msg.subject.as_deref().unwrap_or("");
    let haystack = format!("{}\n{}", subject, msg.body);
    for (label, pattern) in patterns::AUTOMATED_CONTENT.iter() {
        if pattern.is_match(&haystack) {
            return Some(format!("{} message", label));
        }
    }
    None
}

fn filter_duplicate_window(
    msg: &NormalizedMessage,
    recent: &[RecentMessage],
    now: NaiveDateTime,
) -> Option<String> {
    let sender = msg.sender_contact.as_deref()?;
    let prefix: String = msg.body.chars().take(DUPLICATE_PREFIX_CHARS).collect();

    for candidate in recent {
        if candidate.sender_contact.as_deref() != Some(sender) {
            continue;
        }
        let candidate_prefix: String =
            candidate.body.chars().take(DUPLICATE_PREFIX_CHARS).collect();
        if candidate_prefix != prefix {
            continue;
        }
        if let Some(received) = candidate.received_at {
            let age = now.signed_duration_since(received);
            if age.num_minutes().abs() <= DUPLICATE_WINDOW_MINUTES {
                return Some("Duplicate within window".to_string());
            }
        }
    }
    None
}

fn filter_blocked_sender(msg: &NormalizedMessage, policy: &FilterPolicy) -> Option<String> {
    let contact = msg.sender_contact.as_deref()?;
    if policy
        .blocked_senders
        .iter()
        .any(|b| b.eq_ignore_ascii_case(contact))
    {
        return Some(format!("Blocked sender: {}", contact));
    }
    None
}

fn filter_keywords(msg: &NormalizedMessage, policy: &FilterPolicy) -> Option<String> {
    let body = msg.body.to_lowercase();
    for keyword in &policy.blocked_keywords {
        if body.contains(&keyword.to_lowercase()) {
            return Some(format!("Blocked keyword: {}", keyword));
        }
    }
    if !policy.allowed_keywords.is_empty()
        && !policy
            .allowed_keywords
            .iter()
            .any(|k| body.contains(&k.to_lowercase()))
    {
        return Some("No allowed keyword matched".to_string());
    }
    None
}
