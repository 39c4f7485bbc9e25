use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use trajgen_core::{ResearchTool, SearchConfig, SecretValue, ToolError, ToolOutput, ToolParams};

use crate::http::{HttpFailure, build_client, read_success};

/// Google web search through the Serper API.
pub struct WebSearch {
    client: Client,
    name: String,
    endpoint: String,
    api_key: SecretValue,
    results: usize,
}

#[derive(Debug, Default, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

impl WebSearch {
    pub fn from_config(config: &SearchConfig, api_key: SecretValue) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            name: config.name.clone(),
            endpoint: config.endpoint.clone(),
            api_key,
            results: config.results,
        })
    }
}

fn format_results(value: &Value, results: usize) -> Result<String, ToolError> {
    let response = SerperResponse::deserialize(value)
        .map_err(|err| ToolError::from(HttpFailure::malformed(err)))?;
    if response.organic.is_empty() {
        return Ok("No results found.".to_string());
    }
    let snippets: Vec<String> = response
        .organic
        .iter()
        .take(results)
        .enumerate()
        .map(|(idx, result)| {
            format!(
                "<snippet id=\"G{}\">Title: {}\n{}\nURL: {}</snippet>",
                idx + 1,
                result.title,
                result.snippet,
                result.link
            )
        })
        .collect();
    Ok(snippets.join("\n"))
}

#[async_trait]
impl ResearchTool for WebSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn usage(&self) -> String {
        format!(
            "<call_tool name=\"{}\">query</call_tool> searches the web",
            self.name
        )
    }

    async fn invoke(&self, params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::permanent("search query is empty"));
        }
        let num = params
            .get("num_results")
            .and_then(|value| value.as_i64())
            .map(|num| num.clamp(1, 20) as usize)
            .unwrap_or(self.results);

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", self.api_key.expose())
            .json(&json!({ "q": query, "num": num }))
            .send()
            .await
            .map_err(|err| ToolError::from(HttpFailure::transport(&err)))?;
        let raw = read_success(response).await?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|err| ToolError::from(HttpFailure::malformed(err)))?;
        let formatted = format_results(&value, num.min(self.results))?;
        Ok(ToolOutput::new(value, formatted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organic_results_become_numbered_snippets() {
        let payload = json!({
            "organic": [
                {"title": "Trial results", "snippet": "X improved Y", "link": "https://a.example"},
                {"title": "Review", "snippet": "Mixed evidence", "link": "https://b.example"},
                {"title": "Dropped", "snippet": "", "link": "https://c.example"}
            ]
        });
        assert_eq!(
            format_results(&payload, 2).unwrap(),
            "<snippet id=\"G1\">Title: Trial results\nX improved Y\nURL: https://a.example</snippet>\n\
             <snippet id=\"G2\">Title: Review\nMixed evidence\nURL: https://b.example</snippet>"
        );
    }

    #[test]
    fn empty_results_are_reported() {
        assert_eq!(format_results(&json!({}), 5).unwrap(), "No results found.");
    }
}
