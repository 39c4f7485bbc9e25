//! Tool capability trait and the startup-time registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::ToolError;
use crate::markup::{DEFAULT_STOPS, ToolInvocation, ToolParams};

/// Raw payload plus the text shown to the model inside `<tool_output>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub raw: Value,
    pub formatted: String,
}

impl ToolOutput {
    pub fn new(raw: Value, formatted: impl Into<String>) -> Self {
        Self {
            raw,
            formatted: formatted.into(),
        }
    }
}

/// A research tool the agent can invoke.
#[async_trait]
pub trait ResearchTool: Send + Sync {
    /// Name used in `<call_tool name="…">`.
    fn name(&self) -> &str;

    /// One-line usage shown in the system prompt.
    fn usage(&self) -> String {
        format!("<call_tool name=\"{}\">query</call_tool>", self.name())
    }

    fn stop_sequences(&self) -> Vec<String> {
        DEFAULT_STOPS.iter().map(|stop| stop.to_string()).collect()
    }

    async fn invoke(&self, params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError>;
}

pub type Activation = Arc<dyn Fn(&ToolInvocation) -> bool + Send + Sync>;

/// Per-registration knobs.
#[derive(Debug, Clone, Default)]
pub struct ToolOptions {
    pub aliases: Vec<String>,
    /// Caps concurrent invocations of this tool across every running trajectory.
    pub max_concurrent: Option<usize>,
    pub timeout: Option<Duration>,
}

struct Registration {
    activation: Activation,
    tool: Arc<dyn ResearchTool>,
    limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

/// A registration selected for an invocation.
#[derive(Clone)]
pub struct ResolvedTool {
    pub tool: Arc<dyn ResearchTool>,
    pub limiter: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
}

impl ResolvedTool {
    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

/// Ordered list of (activation predicate, tool) pairs.
///
/// Built once at startup and shared read-only afterwards. The first
/// registration whose predicate accepts an invocation handles it.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Registration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool activated by its own name.
    pub fn register(self, tool: Arc<dyn ResearchTool>) -> Self {
        self.register_with(tool, ToolOptions::default())
    }

    /// Register a tool activated by its name or any alias.
    pub fn register_with(self, tool: Arc<dyn ResearchTool>, options: ToolOptions) -> Self {
        let mut names = vec![tool.name().to_string()];
        names.extend(options.aliases.iter().cloned());
        let activation: Activation =
            Arc::new(move |invocation: &ToolInvocation| names.contains(&invocation.name));
        self.register_when(activation, tool, options)
    }

    /// Register a tool behind an arbitrary activation predicate.
    pub fn register_when(
        mut self,
        activation: Activation,
        tool: Arc<dyn ResearchTool>,
        options: ToolOptions,
    ) -> Self {
        self.entries.push(Registration {
            activation,
            limiter: options
                .max_concurrent
                .map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
            timeout: options.timeout,
            tool,
        });
        self
    }

    pub fn resolve(&self, invocation: &ToolInvocation) -> Option<ResolvedTool> {
        self.entries
            .iter()
            .find(|entry| (entry.activation)(invocation))
            .map(|entry| ResolvedTool {
                tool: entry.tool.clone(),
                limiter: entry.limiter.clone(),
                timeout: entry.timeout,
            })
    }

    /// Union of every tool's stop sequences, first occurrence order.
    pub fn stop_sequences(&self) -> Vec<String> {
        let mut stops: Vec<String> = Vec::new();
        for entry in &self.entries {
            for stop in entry.tool.stop_sequences() {
                if !stops.contains(&stop) {
                    stops.push(stop);
                }
            }
        }
        if stops.is_empty() {
            stops = DEFAULT_STOPS.iter().map(|stop| stop.to_string()).collect();
        }
        stops
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<dyn ResearchTool>> {
        self.entries.iter().map(|entry| &entry.tool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl ResearchTool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn stop_sequences(&self) -> Vec<String> {
            vec!["</call_tool>\n".into(), format!("<{}-end>", self.0)]
        }

        async fn invoke(&self, _params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(json!({ "echo": query }), query))
        }
    }

    #[test]
    fn first_matching_registration_wins() {
        let catch_all: Activation = Arc::new(|_: &ToolInvocation| true);
        let registry = ToolRegistry::new()
            .register_with(
                Arc::new(Echo("pubmed_search")),
                ToolOptions {
                    aliases: vec!["pubmed".into()],
                    ..ToolOptions::default()
                },
            )
            .register_when(catch_all, Arc::new(Echo("fallback")), ToolOptions::default());

        let alias = registry.resolve(&ToolInvocation::new("pubmed", "q")).unwrap();
        assert_eq!(alias.name(), "pubmed_search");

        let other = registry.resolve(&ToolInvocation::new("web", "q")).unwrap();
        assert_eq!(other.name(), "fallback");
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = ToolRegistry::new().register(Arc::new(Echo("google_search")));
        assert!(registry.resolve(&ToolInvocation::new("bing", "q")).is_none());
    }

    #[test]
    fn stop_sequences_are_deduplicated() {
        let registry = ToolRegistry::new()
            .register(Arc::new(Echo("a")))
            .register(Arc::new(Echo("b")));
        assert_eq!(
            registry.stop_sequences(),
            vec!["</call_tool>\n", "<a-end>", "<b-end>"]
        );
    }
}
