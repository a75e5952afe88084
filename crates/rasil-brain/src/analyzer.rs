//! The analyzer seam. The rest of the system treats analysis as a black box
//! returning a fixed shape; the provider client behind it is swappable.

use async_trait::async_trait;
use rasil_core::types::Analysis;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// Provider returned 429; the caller sets the global cooldown.
    #[error("provider rate limited")]
    RateLimited,

    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzerInput {
    pub body: String,
    /// `User:` / `Agent:` lines, oldest first.
    pub history: Vec<String>,
    /// Scraped page text from the first URL in the body, if any.
    pub link_context: String,
    pub sender_name: Option<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, input: &AnalyzerInput) -> Result<Analysis, AnalyzerError>;
}

/// OpenAI-compatible chat-completions client. The model is asked for a
/// strict JSON object matching [`Analysis`].
pub struct HttpAnalyzer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpAnalyzer {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }

    pub fn openai(http: reqwest::Client, api_key: String, model: Option<String>) -> Self {
        Self::new(
            http,
            "https://api.openai.com/v1".to_string(),
            api_key,
            model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
        )
    }

    fn build_prompt(input: &AnalyzerInput) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "أنت مساعد خدمة عملاء. حلّل الرسالة التالية وأعد JSON فقط بالحقول: \
             intent, urgency (low|normal|high|urgent), sentiment, language, dialect, \
             summary, draft_response.\n\n",
        );
        if !input.history.is_empty() {
            prompt.push_str("سياق المحادثة السابقة:\n");
            for line in &input.history {
                prompt.push_str(line);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        if !input.link_context.is_empty() {
            prompt.push_str(&input.link_context);
            prompt.push_str("\n\n");
        }
        if let Some(name) = &input.sender_name {
            prompt.push_str(&format!("اسم المرسل: {}\n", name));
        }
        prompt.push_str(&format!("الرسالة:\n{}", input.body));
        prompt
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, input: &AnalyzerInput) -> Result<Analysis, AnalyzerError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "response_format": { "type": "json_object" },
                "messages": [
                    { "role": "user", "content": Self::build_prompt(input) }
                ],
            }))
            .send()
            .await
            .map_err(|e| AnalyzerError::Provider(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(AnalyzerError::RateLimited);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| AnalyzerError::Provider(e.to_string()))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| AnalyzerError::Provider(e.to_string()))?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalyzerError::Provider("response had no content".into()))?;

        parse_analysis_json(content)
    }
}

/// Parse the model's JSON output, tolerating a fenced code block around it.
pub fn parse_analysis_json(content: &str) -> Result<Analysis, AnalyzerError> {
    let trimmed = content.trim();
    let json_str = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    serde_json::from_str(json_str)
        .map_err(|e| AnalyzerError::Provider(format!("unparseable analysis: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_json_parses_plain_and_fenced() {
        let json = r#"{"intent":"inquiry","urgency":"normal","sentiment":"positive",
                       "language":"ar","dialect":"شامي","summary":"سؤال عن السعر",
                       "draft_response":"أهلاً!"}"#;
        let a = parse_analysis_json(json).unwrap();
        assert_eq!(a.intent, "inquiry");
        assert_eq!(a.dialect.as_deref(), Some("شامي"));

        let fenced = format!("```json\n{}\n```", json);
        assert!(parse_analysis_json(&fenced).is_ok());
    }

    #[test]
    fn prompt_includes_history_and_link_context() {
        let input = AnalyzerInput {
            body: "كم السعر؟".into(),
            history: vec!["User: مرحبا".into(), "Agent: أهلاً".into()],
            link_context: "--- محتوى الرابط ---".into(),
            sender_name: Some("أحمد".into()),
        };
        let prompt = HttpAnalyzer::build_prompt(&input);
        assert!(prompt.contains("User: مرحبا"));
        assert!(prompt.contains("محتوى الرابط"));
        assert!(prompt.contains("كم السعر؟"));
        assert!(prompt.contains("أحمد"));
    }
}
