//! HTTP adapters for the trajectory generator: an OpenAI-compatible model
//! client and the research tools the agent can call.

mod browse;
mod http;
mod literature;
mod model;
mod search;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use trajgen_core::{ToolOptions, ToolRegistry, ToolsConfig, optional_env};

pub use browse::WebBrowse;
pub use http::{HttpFailure, is_transient_status};
pub use literature::LiteratureSearch;
pub use model::ChatCompletionsModel;
pub use search::WebSearch;

/// Register every enabled tool. Web search is skipped when its API key is
/// missing; literature search works without a key.
pub fn build_registry(config: &ToolsConfig) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    let literature = &config.literature;
    if literature.enabled {
        let tool = LiteratureSearch::from_config(literature, optional_env(&literature.api_key_env))
            .context("failed to build literature search client")?;
        // Covers every public attempt, the authenticated fallback and backoff.
        let attempts = u64::from(literature.public_attempts.max(1)) + 1;
        let budget = Duration::from_secs(literature.timeout_secs * attempts + 2 * attempts);
        registry = registry.register_with(
            Arc::new(tool),
            ToolOptions {
                max_concurrent: literature.max_concurrent,
                timeout: Some(budget),
                ..ToolOptions::default()
            },
        );
    }

    let browse = &config.browse;
    if browse.enabled {
        let tool = WebBrowse::from_config(browse).context("failed to build browse client")?;
        registry = registry.register_with(
            Arc::new(tool),
            ToolOptions {
                max_concurrent: browse.max_concurrent,
                timeout: Some(Duration::from_secs(browse.timeout_secs)),
                ..ToolOptions::default()
            },
        );
    }

    let search = &config.search;
    if search.enabled {
        match optional_env(&search.api_key_env) {
            Some(key) => {
                let tool =
                    WebSearch::from_config(search, key).context("failed to build search client")?;
                registry = registry.register_with(
                    Arc::new(tool),
                    ToolOptions {
                        max_concurrent: search.max_concurrent,
                        timeout: Some(Duration::from_secs(search.timeout_secs)),
                        ..ToolOptions::default()
                    },
                );
            }
            None => tracing::warn!(
                env = %search.api_key_env,
                tool = %search.name,
                "Web search API key not set, tool disabled"
            ),
        }
    }

    Ok(registry)
}
