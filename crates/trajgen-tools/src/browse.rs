use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Response};
use serde_json::json;
use trajgen_core::{BrowseConfig, ResearchTool, ToolError, ToolOutput, ToolParams};

use crate::http::{HttpFailure, build_client};

/// Maximum response body size (5MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;
const TEXT_WIDTH: usize = 120;

static MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<[^>]+>")
        .expect("invalid markup regex")
});
static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n\s*").expect("invalid blank line regex"));

/// Fetches a page and returns its leading readable text.
pub struct WebBrowse {
    client: Client,
    name: String,
    max_chars: usize,
}

impl WebBrowse {
    pub fn from_config(config: &BrowseConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            name: config.name.clone(),
            max_chars: config.max_chars,
        })
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with("<!") || head.starts_with("<html") || head.starts_with("<HTML") || {
        head.contains("</") && (head.contains("<head") || head.contains("<body") || head.contains("<p"))
    }
}

/// Readable text of an HTML document, falling back to tag stripping.
fn readable_text(body: &str) -> String {
    let text = if looks_like_html(body) {
        match html2text::from_read(body.as_bytes(), TEXT_WIDTH) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => MARKUP.replace_all(body, " ").into_owned(),
        }
    } else {
        body.to_string()
    };
    BLANK_RUNS.replace_all(text.trim(), "\n\n").into_owned()
}

fn check_size(received: u64, limit: usize) -> Result<(), ToolError> {
    if received > limit as u64 {
        return Err(ToolError::permanent(format!(
            "response too large ({received} bytes, max {limit} bytes)"
        )));
    }
    Ok(())
}

/// Read the body chunk by chunk, giving up as soon as it passes `limit`.
/// Chunked responses carry no content length, so the header alone is not enough.
async fn read_capped(mut response: Response, limit: usize) -> Result<Vec<u8>, ToolError> {
    if let Some(length) = response.content_length() {
        check_size(length, limit)?;
    }
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| ToolError::from(HttpFailure::transport(&err)))?
    {
        body.extend_from_slice(&chunk);
        check_size(body.len() as u64, limit)?;
    }
    Ok(body)
}

fn leading_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl ResearchTool for WebBrowse {
    fn name(&self) -> &str {
        &self.name
    }

    fn usage(&self) -> String {
        format!(
            "<call_tool name=\"{}\">URL</call_tool> reads the first {} characters of a web page",
            self.name, self.max_chars
        )
    }

    async fn invoke(&self, _params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError> {
        let url = query.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::permanent(format!(
                "URL must start with http:// or https://, got: {url}"
            )));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ToolError::from(HttpFailure::transport(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpFailure::status(status, "").into());
        }
        let bytes = read_capped(response, MAX_RESPONSE_SIZE).await?;
        let body = String::from_utf8_lossy(&bytes);
        let text = readable_text(&body);
        let content = leading_chars(&text, self.max_chars);

        tracing::debug!(url, chars = text.chars().count(), "Fetched web page");
        Ok(ToolOutput::new(
            json!({ "url": url, "content": content }),
            format!("<webpage>{content}</webpage>"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_is_reduced_to_text() {
        let page = "<!DOCTYPE html><html><head><style>p{}</style></head>\
                    <body><h1>Trial</h1><p>X improves Y.</p></body></html>";
        let text = readable_text(page);
        assert!(text.contains("Trial"));
        assert!(text.contains("X improves Y."));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(readable_text("  line one\n\n\n\nline two  "), "line one\n\nline two");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(leading_chars("héllo", 2), "hé");
        assert_eq!(leading_chars("short", 2000), "short");
    }

    #[test]
    fn body_size_is_capped() {
        assert!(check_size(MAX_RESPONSE_SIZE as u64, MAX_RESPONSE_SIZE).is_ok());
        assert!(matches!(
            check_size(MAX_RESPONSE_SIZE as u64 + 1, MAX_RESPONSE_SIZE),
            Err(ToolError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn non_http_urls_are_rejected() {
        let browse = WebBrowse::from_config(&BrowseConfig::default()).unwrap();
        let err = browse
            .invoke(&ToolParams::new(), "ftp://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Permanent(_)));
    }
}
