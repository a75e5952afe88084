//! Single-URL context scrape: at most one link from the message body, 10 s
//! budget, scripts and chrome stripped, 2000-char cap.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>\)]+").unwrap());

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONTEXT_CHARS: usize = 2000;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub fn first_url(text: &str) -> Option<&str> {
    URL_PATTERN.find(text).map(|m| m.as_str())
}

/// Fetch and clean the first URL in `text`; empty string when there is no
/// URL, the host is local, or the fetch fails. Never errors — link context
/// is optional.
pub async fn scrape_link_context(http: &reqwest::Client, text: &str) -> String {
    let Some(url) = first_url(text) else {
        return String::new();
    };
    if url.contains("localhost") || url.contains("127.0.0.1") {
        return String::new();
    }

    debug!(url, "scraping link for analysis context");
    let resp = match http
        .get(url)
        .header("User-Agent", USER_AGENT)
        .timeout(SCRAPE_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!(url, error = %e, "link scrape failed");
            return String::new();
        }
    };

    let html = match resp.text().await {
        Ok(html) => html,
        Err(e) => {
            warn!(url, error = %e, "link scrape body read failed");
            return String::new();
        }
    };

    let title = extract_title(&html).unwrap_or_else(|| "No Title".to_string());
    let mut clean = clean_html(&html);
    if clean.chars().count() > MAX_CONTEXT_CHARS {
        clean = clean.chars().take(MAX_CONTEXT_CHARS).collect::<String>()
            + "...\n[تم قص باقي المحتوى]";
    }

    format!(
        "--- محتوى الرابط: {url} ---\nالعنوان: {title}\n\n{clean}\n------------------"
    )
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_lowercase();
    let start = lower.find("<title")?;
    let open_end = html[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    let title = html[open_end..close].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Drop script/style/nav/footer/header blocks, then all tags, then collapse
/// whitespace into single-line chunks.
fn clean_html(html: &str) -> String {
    static BLOCK_STRIP: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<(script|style|nav|footer|header)\b.*?</(script|style|nav|footer|header)>")
            .unwrap()
    });
    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

    let without_blocks = BLOCK_STRIP.replace_all(html, " ");
    let without_tags = TAG.replace_all(&without_blocks, "\n");

    without_tags
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_url_finds_http_and_https() {
        assert_eq!(
            first_url("check https://example.com/page?a=1 please"),
            Some("https://example.com/page?a=1")
        );
        assert_eq!(first_url("no links here"), None);
    }

    #[test]
    fn clean_html_drops_scripts_and_tags() {
        let html = r#"<html><head><script>alert(1)</script><style>p{}</style></head>
                      <body><nav>menu</nav><p>الأسعار تبدأ من 100</p><footer>x</footer></body></html>"#;
        let clean = clean_html(html);
        assert!(clean.contains("الأسعار تبدأ من 100"));
        assert!(!clean.contains("alert"));
        assert!(!clean.contains("menu"));
    }

    #[test]
    fn title_extraction_handles_attributes() {
        assert_eq!(
            extract_title(r#"<title lang="ar">متجرنا</title>"#),
            Some("متجرنا".to_string())
        );
        assert_eq!(extract_title("<body>no title</body>"), None);
    }
}
