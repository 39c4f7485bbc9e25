//! Literature search over the Semantic Scholar graph API.
//!
//! The unauthenticated endpoint is tried first under its own retry policy.
//! When it keeps failing and an API key is configured, a single
//! authenticated request is made instead.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use trajgen_core::{
    LiteratureConfig, ResearchTool, RetryPolicy, SecretValue, ToolError, ToolOutput, ToolParams,
    with_fallback,
};

use crate::http::{HttpFailure, build_client, read_success};

const SEARCH_FIELDS: &str = "paperId,title,abstract,year,venue,authors,externalIds";
const MAX_LIMIT: i64 = 100;
const SHOWN_AUTHORS: usize = 3;

pub struct LiteratureSearch {
    client: Client,
    name: String,
    endpoint: String,
    api_key: Option<SecretValue>,
    default_limit: u32,
    public_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchRequest {
    query: String,
    limit: i64,
    offset: i64,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    data: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
struct Paper {
    #[serde(rename = "paperId", default)]
    paper_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "abstract", default)]
    summary: Option<String>,
    #[serde(default)]
    year: Option<i64>,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default)]
    authors: Vec<Author>,
    #[serde(rename = "externalIds", default)]
    external_ids: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct Author {
    #[serde(default)]
    name: Option<String>,
}

impl Paper {
    /// PubMed id when the paper has one, the Semantic Scholar id otherwise.
    fn snippet_id(&self) -> String {
        let pubmed = self
            .external_ids
            .as_ref()
            .and_then(|ids| ids.get("PubMed"))
            .and_then(|id| match id {
                Value::String(id) if !id.is_empty() => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            });
        pubmed
            .or_else(|| self.paper_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn render(&self) -> String {
        let mut authors = self
            .authors
            .iter()
            .take(SHOWN_AUTHORS)
            .filter_map(|author| author.name.as_deref())
            .collect::<Vec<_>>()
            .join(", ");
        if self.authors.len() > SHOWN_AUTHORS {
            authors.push_str(" et al.");
        }
        let year = self
            .year
            .map(|year| year.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            "<snippet id=\"{}\">Title: {}\nAuthors: {} | Year: {} | Journal: {}\nAbstract: {}</snippet>",
            self.snippet_id(),
            non_empty(&self.title, "No title"),
            authors,
            year,
            non_empty(&self.venue, "N/A"),
            non_empty(&self.summary, "No abstract"),
        )
    }
}

fn non_empty<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    match value.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => fallback,
    }
}

impl LiteratureSearch {
    pub fn from_config(
        config: &LiteratureConfig,
        api_key: Option<SecretValue>,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            name: config.name.clone(),
            endpoint: format!("{}/paper/search", config.base_url.trim_end_matches('/')),
            api_key,
            default_limit: config.default_limit,
            public_policy: RetryPolicy::new(config.public_attempts, Duration::from_secs(1)),
        })
    }

    fn request(&self, params: &ToolParams, query: &str) -> Result<SearchRequest, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::permanent("search query is empty"));
        }
        let limit = params
            .get("limit")
            .and_then(|value| value.as_i64())
            .unwrap_or(i64::from(self.default_limit))
            .clamp(1, MAX_LIMIT);
        let offset = params
            .get("offset")
            .and_then(|value| value.as_i64())
            .unwrap_or(0)
            .max(0);
        Ok(SearchRequest {
            query: query.to_string(),
            limit,
            offset,
        })
    }

    async fn fetch(
        &self,
        request: &SearchRequest,
        api_key: Option<&SecretValue>,
    ) -> Result<Value, ToolError> {
        let limit = request.limit.to_string();
        let offset = request.offset.to_string();
        let mut builder = self.client.get(&self.endpoint).query(&[
            ("query", request.query.as_str()),
            ("limit", limit.as_str()),
            ("offset", offset.as_str()),
            ("fields", SEARCH_FIELDS),
        ]);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key.expose());
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ToolError::from(HttpFailure::transport(&err)))?;
        let raw = read_success(response).await?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|err| ToolError::from(HttpFailure::malformed(err)))?;
        check_payload(&value)?;
        Ok(value)
    }
}

/// Semantic Scholar reports throttling and failures inside 200 responses.
fn check_payload(value: &Value) -> Result<(), ToolError> {
    let Some(object) = value.as_object() else {
        return Err(ToolError::transient("search response is not an object"));
    };
    if let Some(error) = object.get("error") {
        return Err(ToolError::transient(format!("search backend error: {error}")));
    }
    if object.len() == 1 {
        if let Some(message) = object.get("message") {
            return Err(ToolError::transient(format!("search backend message: {message}")));
        }
    }
    Ok(())
}

fn format_results(value: &Value, limit: usize) -> Result<String, ToolError> {
    let response = SearchResponse::deserialize(value)
        .map_err(|err| ToolError::from(HttpFailure::malformed(err)))?;
    let snippets: Vec<String> = response.data.iter().take(limit).map(Paper::render).collect();
    let total = response.total.unwrap_or(response.data.len() as u64);
    Ok(format!(
        "Found {total} results. Showing top {}:\n{}",
        snippets.len(),
        snippets.join("\n")
    ))
}

#[async_trait]
impl ResearchTool for LiteratureSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn usage(&self) -> String {
        format!(
            "<call_tool name=\"{}\" limit=\"{}\">keywords</call_tool> searches biomedical literature",
            self.name, self.default_limit
        )
    }

    async fn invoke(&self, params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError> {
        let request = self.request(params, query)?;
        let value = match &self.api_key {
            Some(key) => {
                with_fallback(
                    "literature_search",
                    &self.public_policy,
                    |_| self.fetch(&request, None),
                    &RetryPolicy::single(),
                    |_| self.fetch(&request, Some(key)),
                )
                .await?
            }
            None => {
                self.public_policy
                    .run("literature_search", |_| self.fetch(&request, None))
                    .await?
            }
        };
        let formatted = format_results(&value, request.limit as usize)?;
        Ok(ToolOutput::new(value, formatted))
    }
}
