//! Gmail REST adapter. OAuth bearer auth with a single refresh-and-retry on
//! 401; polling via the search query API; replies as RFC 5322 MIME with the
//! original threading headers preserved.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::DateTime;
use rasil_core::types::{Attachment, AttachmentKind, Channel, NormalizedMessage};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{FetchOptions, OutboundEcho, SendReceipt, Transport, WebhookEvent};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Attachments above this are left as metadata only.
const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;
/// Images below this additionally carry a base64 preview.
const PREVIEW_IMAGE_BYTES: u64 = 200 * 1024;

#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
}

pub struct GmailTransport {
    http: reqwest::Client,
    access_token: RwLock<String>,
    refresh_token: Option<String>,
    oauth: Option<OAuthApp>,
    /// Our verified address; mail from it is an outbound echo, never inbox.
    our_address: Option<String>,
    /// Where downloaded attachments land; metadata-only when unset.
    media_dir: Option<PathBuf>,
    /// A token minted by the refresh path, for the caller to persist.
    refreshed_token: RwLock<Option<String>>,
}

impl GmailTransport {
    pub fn new(
        http: reqwest::Client,
        access_token: String,
        refresh_token: Option<String>,
        oauth: Option<OAuthApp>,
        our_address: Option<String>,
        media_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            http,
            access_token: RwLock::new(access_token),
            refresh_token,
            oauth,
            our_address: our_address.map(|a| a.to_lowercase()),
            media_dir,
            refreshed_token: RwLock::new(None),
        }
    }

    /// A new access token produced by the 401-refresh path, if any. Callers
    /// persist it back into the credential record.
    pub async fn take_refreshed_token(&self) -> Option<String> {
        self.refreshed_token.write().await.take()
    }

    async fn refresh_access_token(&self) -> Result<(), TransportError> {
        let (oauth, refresh) = match (&self.oauth, &self.refresh_token) {
            (Some(o), Some(r)) => (o, r),
            _ => return Err(TransportError::auth("401 and no refresh credentials")),
        };

        let resp: Value = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
                ("refresh_token", refresh.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| TransportError::auth(format!("token refresh rejected: {e}")))?
            .json()
            .await?;

        let token = resp
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::auth("refresh response had no access_token"))?;
        *self.access_token.write().await = token.to_string();
        *self.refreshed_token.write().await = Some(token.to_string());
        debug!("gmail access token refreshed");
        Ok(())
    }

    /// One API round-trip with a single refresh-and-retry on 401.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        for attempt in 0..2 {
            let token = self.access_token.read().await.clone();
            let mut req = self.http.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;

            if resp.status().as_u16() == 401 && attempt == 0 {
                self.refresh_access_token().await?;
                continue;
            }
            let resp = resp.error_for_status()?;
            return Ok(resp.json().await?);
        }
        unreachable!("request loop returns inside both arms")
    }

    async fn list_message_ids(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>, TransportError> {
        let url = format!(
            "{API_BASE}/users/me/messages?q={}&maxResults={}",
            urlencode(query),
            limit
        );
        let resp = self.request(reqwest::Method::GET, &url, None).await?;
        Ok(resp
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|m| m.get("id").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn get_message(&self, id: &str, format: &str) -> Result<Value, TransportError> {
        let url = format!("{API_BASE}/users/me/messages/{id}?format={format}");
        self.request(reqwest::Method::GET, &url, None).await
    }

    async fn get_attachment_bytes(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let url =
            format!("{API_BASE}/users/me/messages/{message_id}/attachments/{attachment_id}");
        let resp = self.request(reqwest::Method::GET, &url, None).await?;
        let data = resp
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::api("attachment response had no data"))?;
        URL_SAFE
            .decode(data)
            .or_else(|_| URL_SAFE_NO_PAD.decode(data))
            .map_err(|e| TransportError::payload(format!("attachment base64: {e}")))
    }

    async fn parse_api_message(&self, message: &Value) -> Result<WebhookEvent, TransportError> {
        let id = message
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = &message["payload"];
        let headers = payload.get("headers").and_then(Value::as_array);

        let header = |name: &str| -> Option<String> {
            headers.and_then(|hs| {
                hs.iter()
                    .find(|h| {
                        h.get("name")
                            .and_then(Value::as_str)
                            .map(|n| n.eq_ignore_ascii_case(name))
                            .unwrap_or(false)
                    })
                    .and_then(|h| h.get("value").and_then(Value::as_str))
                    .map(String::from)
            })
        };

        let from = header("From").unwrap_or_default();
        let sender_email = extract_email(&from);
        let sender_name = extract_display_name(&from);
        let subject = header("Subject");

        let received_at = message
            .get("internalDate")
            .and_then(Value::as_str)
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.naive_utc());

        let mut body = extract_body(payload);
        if body.is_empty() {
            body = message
                .get("snippet")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
        }

        // Our own sent mail shows up in the same queries; sync it as an
        // outbound echo so the AI never replies to itself.
        if let Some(ours) = &self.our_address {
            if sender_email.eq_ignore_ascii_case(ours) {
                let to = header("To").unwrap_or_default();
                return Ok(WebhookEvent::OutboundEcho(OutboundEcho {
                    channel: Channel::Email,
                    recipient_contact: Some(extract_email(&to)),
                    recipient_id: None,
                    body,
                    platform_message_id: Some(id),
                    sent_at: received_at,
                }));
            }
        }

        let attachments = self.collect_attachments(&id, payload).await;

        Ok(WebhookEvent::Inbound(NormalizedMessage {
            channel: Channel::Email,
            channel_message_id: Some(id),
            sender_id: None,
            sender_contact: Some(sender_email),
            sender_name,
            subject,
            body,
            received_at,
            attachments,
            reply_to_platform_id: None,
            is_group: false,
            is_channel: false,
        }))
    }

    async fn collect_attachments(&self, message_id: &str, payload: &Value) -> Vec<Attachment> {
        let mut found = Vec::new();
        scan_attachment_parts(payload, &mut found);

        let mut out = Vec::new();
        for (filename, mime, size, attachment_id) in found {
            let mut att = Attachment::new(kind_for_mime(&mime), mime.clone());
            att.size = size;
            att.platform_media_id = Some(attachment_id.clone());

            if size <= MAX_ATTACHMENT_BYTES {
                match self.get_attachment_bytes(message_id, &attachment_id).await {
                    Ok(bytes) => {
                        if let Some(dir) = &self.media_dir {
                            let subdir = dir.join("gmail");
                            let _ = tokio::fs::create_dir_all(&subdir).await;
                            let path = subdir.join(format!("{message_id}_{filename}"));
                            if tokio::fs::write(&path, &bytes).await.is_ok() {
                                att.path = Some(path.to_string_lossy().into_owned());
                            }
                        }
                        if mime.starts_with("image/") && size < PREVIEW_IMAGE_BYTES {
                            att.base64 = Some(STANDARD.encode(&bytes));
                        }
                    }
                    Err(e) => {
                        warn!(message_id, filename = %filename, error = %e, "attachment download failed");
                    }
                }
            }
            out.push(att);
        }
        out
    }

    /// Backfill: threads from the last `days` whose final message is not
    /// ours — finished conversations are not re-imported.
    async fn fetch_unreplied(
        &self,
        days: i64,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>, TransportError> {
        let url = format!(
            "{API_BASE}/users/me/threads?q={}&maxResults={}",
            urlencode(&format!("newer_than:{days}d")),
            limit
        );
        let resp = self.request(reqwest::Method::GET, &url, None).await?;
        let thread_ids: Vec<String> = resp
            .get("threads")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|t| t.get("id").and_then(Value::as_str).map(String::from))
            .collect();

        let mut events = Vec::new();
        for thread_id in thread_ids {
            let url = format!("{API_BASE}/users/me/threads/{thread_id}?format=full");
            let thread = match self.request(reqwest::Method::GET, &url, None).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(thread_id, error = %e, "thread fetch failed, skipping");
                    continue;
                }
            };
            let Some(messages) = thread.get("messages").and_then(Value::as_array) else {
                continue;
            };
            let Some(last) = messages.last() else { continue };

            match self.parse_api_message(last).await {
                // Last word is ours — the thread is already replied.
                Ok(WebhookEvent::OutboundEcho(_)) => continue,
                Ok(event) => events.push(event),
                Err(e) => warn!(thread_id, error = %e, "thread message parse failed"),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl Transport for GmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn fetch_new(&self, opts: &FetchOptions) -> Result<Vec<WebhookEvent>, TransportError> {
        if opts.unreplied_only {
            let days = (opts.since_hours / 24).max(1);
            return self.fetch_unreplied(days, opts.limit).await;
        }

        let query = if opts.since_hours == 24 {
            "is:unread OR newer_than:1d".to_string()
        } else {
            format!("newer_than:{}h", opts.since_hours.max(1))
        };

        let ids = self.list_message_ids(&query, opts.limit).await?;
        let mut events = Vec::new();
        for id in ids {
            if opts.exclude_ids.iter().any(|x| x == &id) {
                continue;
            }
            match self.get_message(&id, "full").await {
                Ok(message) => match self.parse_api_message(&message).await {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(message_id = %id, error = %e, "message parse failed"),
                },
                Err(e) => warn!(message_id = %id, error = %e, "message fetch failed"),
            }
        }
        Ok(events)
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        let mut headers = vec![
            format!("To: {recipient}"),
            "MIME-Version: 1.0".to_string(),
            "Content-Type: text/plain; charset=\"UTF-8\"".to_string(),
            "Content-Transfer-Encoding: base64".to_string(),
        ];
        let mut subject = "رد على رسالتك".to_string();

        if let Some(original_id) = reply_to {
            if let Ok(original) = self.get_message(original_id, "metadata").await {
                let hdrs = original
                    .pointer("/payload/headers")
                    .and_then(Value::as_array);
                let find = |name: &str| -> Option<String> {
                    hdrs.and_then(|hs| {
                        hs.iter()
                            .find(|h| {
                                h.get("name")
                                    .and_then(Value::as_str)
                                    .map(|n| n.eq_ignore_ascii_case(name))
                                    .unwrap_or(false)
                            })
                            .and_then(|h| h.get("value").and_then(Value::as_str))
                            .map(String::from)
                    })
                };
                if let Some(orig_subject) = find("Subject") {
                    subject = if orig_subject.to_lowercase().starts_with("re:") {
                        orig_subject
                    } else {
                        format!("Re: {orig_subject}")
                    };
                }
                if let Some(message_id) = find("Message-ID") {
                    headers.push(format!("In-Reply-To: {message_id}"));
                    match find("References") {
                        Some(refs) => headers.push(format!("References: {refs} {message_id}")),
                        None => headers.push(format!("References: {message_id}")),
                    }
                }
            }
        }

        headers.insert(1, format!("Subject: {}", encode_header_utf8(&subject)));
        let mime = format!(
            "{}\r\n\r\n{}",
            headers.join("\r\n"),
            STANDARD.encode(text.as_bytes())
        );
        let raw = URL_SAFE_NO_PAD.encode(mime.as_bytes());

        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("{API_BASE}/users/me/messages/send"),
                Some(&serde_json::json!({ "raw": raw })),
            )
            .await?;
        Ok(SendReceipt {
            platform_message_id: resp
                .get("id")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    async fn mark_read(
        &self,
        _chat: &str,
        up_to_id: Option<&str>,
    ) -> Result<bool, TransportError> {
        let Some(message_id) = up_to_id else {
            return Ok(false);
        };
        self.request(
            reqwest::Method::POST,
            &format!("{API_BASE}/users/me/messages/{message_id}/modify"),
            Some(&serde_json::json!({ "removeLabelIds": ["UNREAD"] })),
        )
        .await?;
        Ok(true)
    }
}

// ── MIME helpers ──────────────────────────────────────────────────────────────

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// RFC 2047 encoded-word for non-ASCII subjects.
fn encode_header_utf8(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

pub(crate) fn extract_email(from_header: &str) -> String {
    if let (Some(start), Some(end)) = (from_header.find('<'), from_header.rfind('>')) {
        if start < end {
            return from_header[start + 1..end].trim().to_lowercase();
        }
    }
    from_header.trim().to_lowercase()
}

pub(crate) fn extract_display_name(from_header: &str) -> Option<String> {
    let name = match from_header.find('<') {
        Some(idx) => from_header[..idx].trim(),
        None => return None,
    };
    let name = name.trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Depth-first body scan preferring text/plain; text/html is tag-stripped
/// as a fallback.
fn extract_body(payload: &Value) -> String {
    fn decode_data(part: &Value) -> Option<String> {
        let data = part.pointer("/body/data").and_then(Value::as_str)?;
        let bytes = URL_SAFE
            .decode(data)
            .or_else(|_| URL_SAFE_NO_PAD.decode(data))
            .ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn walk(part: &Value, plain: &mut Option<String>, html: &mut Option<String>) {
        let mime = part.get("mimeType").and_then(Value::as_str).unwrap_or("");
        if mime == "text/plain" && plain.is_none() {
            *plain = decode_data(part);
        } else if mime == "text/html" && html.is_none() {
            *html = decode_data(part);
        }
        if let Some(parts) = part.get("parts").and_then(Value::as_array) {
            for child in parts {
                walk(child, plain, html);
            }
        }
    }

    let mut plain = None;
    let mut html = None;
    walk(payload, &mut plain, &mut html);
    plain
        .or_else(|| html.map(|h| strip_tags(&h)))
        .unwrap_or_default()
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// (filename, mime, size, attachment_id) for every named part.
fn scan_attachment_parts(part: &Value, out: &mut Vec<(String, String, u64, String)>) {
    let filename = part.get("filename").and_then(Value::as_str).unwrap_or("");
    if !filename.is_empty() {
        if let Some(attachment_id) = part.pointer("/body/attachmentId").and_then(Value::as_str) {
            let mime = part
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream");
            let size = part
                .pointer("/body/size")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            out.push((
                filename.to_string(),
                mime.to_string(),
                size,
                attachment_id.to_string(),
            ));
        }
    }
    if let Some(parts) = part.get("parts").and_then(Value::as_array) {
        for child in parts {
            scan_attachment_parts(child, out);
        }
    }
}

fn kind_for_mime(mime: &str) -> AttachmentKind {
    if mime.starts_with("image/") {
        AttachmentKind::Image
    } else if mime.starts_with("audio/") {
        AttachmentKind::Audio
    } else if mime.starts_with("video/") {
        AttachmentKind::Video
    } else {
        AttachmentKind::Document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_extraction_handles_display_names() {
        assert_eq!(extract_email("Ahmad <ahmad@example.com>"), "ahmad@example.com");
        assert_eq!(extract_email("plain@example.com"), "plain@example.com");
        assert_eq!(extract_email("\"Doe, Jane\" <Jane@X.COM>"), "jane@x.com");
    }

    #[test]
    fn display_name_extraction() {
        assert_eq!(
            extract_display_name("Ahmad <ahmad@example.com>"),
            Some("Ahmad".to_string())
        );
        assert_eq!(extract_display_name("bare@example.com"), None);
        assert_eq!(
            extract_display_name("\"Doe, Jane\" <j@x.com>"),
            Some("Doe, Jane".to_string())
        );
    }

    #[test]
    fn body_scan_prefers_plain_over_html() {
        let payload = serde_json::json!({
            "mimeType": "multipart/alternative",
            "parts": [
                {"mimeType": "text/html",
                 "body": {"data": URL_SAFE_NO_PAD.encode("<p>hello <b>html</b></p>")}},
                {"mimeType": "text/plain",
                 "body": {"data": URL_SAFE_NO_PAD.encode("hello plain")}}
            ]
        });
        assert_eq!(extract_body(&payload), "hello plain");
    }

    #[test]
    fn html_fallback_strips_tags() {
        let payload = serde_json::json!({
            "mimeType": "text/html",
            "body": {"data": URL_SAFE_NO_PAD.encode("<div>hi <b>there</b></div>")}
        });
        assert_eq!(extract_body(&payload), "hi there");
    }

    #[test]
    fn attachment_scan_collects_named_parts_recursively() {
        let payload = serde_json::json!({
            "mimeType": "multipart/mixed",
            "filename": "",
            "parts": [
                {"mimeType": "text/plain", "filename": "", "body": {}},
                {"mimeType": "application/pdf", "filename": "invoice.pdf",
                 "body": {"attachmentId": "att-1", "size": 51200}},
                {"mimeType": "multipart/related", "filename": "", "parts": [
                    {"mimeType": "image/png", "filename": "logo.png",
                     "body": {"attachmentId": "att-2", "size": 2048}}
                ]}
            ]
        });
        let mut found = Vec::new();
        scan_attachment_parts(&payload, &mut found);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "invoice.pdf");
        assert_eq!(found[1].3, "att-2");
    }

    #[test]
    fn non_ascii_subject_uses_encoded_word() {
        let encoded = encode_header_utf8("رد على رسالتك");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
        assert_eq!(encode_header_utf8("Re: hello"), "Re: hello");
    }

    #[test]
    fn query_urlencoding_preserves_operators() {
        assert_eq!(urlencode("newer_than:3h"), "newer_than%3A3h");
        assert_eq!(urlencode("is:unread OR newer_than:1d"), "is%3Aunread%20OR%20newer_than%3A1d");
    }
}
