//! Routes parsed invocations to registered tools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::{Retryable, ToolError};
use crate::logging::{ToolCallEntry, ToolCallLog};
use crate::markup::ToolInvocation;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::tools::{ToolOutput, ToolRegistry};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Aggregate counters for one tool, shared by every running trajectory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retried_attempts: u64,
    pub total_latency_ms: u64,
}

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
    default_timeout: Duration,
    stats: Arc<DashMap<String, ToolStats>>,
    call_log: Option<Arc<ToolCallLog>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
            stats: Arc::new(DashMap::new()),
            call_log: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_call_log(mut self, log: Arc<ToolCallLog>) -> Self {
        self.call_log = Some(log);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Name of the tool that would handle `invocation`, if any.
    pub fn resolve_name(&self, invocation: &ToolInvocation) -> Option<String> {
        self.registry
            .resolve(invocation)
            .map(|resolved| resolved.name().to_string())
    }

    pub fn stats(&self) -> Vec<(String, ToolStats)> {
        let mut rows: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Execute `invocation` with timeout, rate limiting and retry applied.
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let Some(resolved) = self.registry.resolve(invocation) else {
            let err = ToolError::UnknownTool(invocation.name.clone());
            self.observe(&invocation.name, invocation, &Err(err.clone()), 0, 0);
            return Err(err);
        };

        let tool_name = resolved.name().to_string();
        let timeout = resolved.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let (result, attempts) = self
            .retry
            .run_classified(
                &tool_name,
                |err: &ToolError| err.is_retryable(),
                |attempt| {
                    let resolved = resolved.clone();
                    async move {
                        tracing::debug!(
                            tool = resolved.name(),
                            query = %invocation.query,
                            attempt,
                            "Invoking tool"
                        );
                        let _permit = match &resolved.limiter {
                            Some(limiter) => match limiter.clone().acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => return Err(ToolError::transient("tool limiter closed")),
                            },
                            None => None,
                        };
                        match tokio::time::timeout(
                            timeout,
                            resolved.tool.invoke(&invocation.params, &invocation.query),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ToolError::transient(format!(
                                "timed out after {}ms",
                                timeout.as_millis()
                            ))),
                        }
                    }
                },
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        self.observe(&tool_name, invocation, &result, attempts, latency_ms);
        result
    }

    fn observe(
        &self,
        tool_name: &str,
        invocation: &ToolInvocation,
        result: &Result<ToolOutput, ToolError>,
        attempts: u32,
        latency_ms: u64,
    ) {
        let status = match result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };

        {
            let mut stats = self.stats.entry(tool_name.to_string()).or_default();
            stats.calls += 1;
            stats.retried_attempts += u64::from(attempts.saturating_sub(1));
            stats.total_latency_ms += latency_ms;
            match result {
                Ok(_) => stats.successes += 1,
                Err(_) => stats.failures += 1,
            }
        }

        metrics::record_tool_call(tool_name, status, latency_ms, attempts);

        match result {
            Ok(_) => tracing::info!(tool = tool_name, attempts, latency_ms, "Tool call succeeded"),
            Err(err) => {
                tracing::warn!(tool = tool_name, error = %err, attempts, latency_ms, "Tool call failed")
            }
        }

        if let Some(log) = &self.call_log {
            let entry = ToolCallEntry {
                tool: tool_name,
                query: &invocation.query,
                params: &invocation.params,
                status,
                error: result.as_ref().err().map(ToString::to_string),
                result: result.as_ref().ok().map(|output| &output.raw),
                attempts,
                latency_ms,
            };
            if let Err(err) = log.record(&entry) {
                tracing::warn!(error = %err, path = %log.path().display(), "Failed to write tool call log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::ToolParams;
    use crate::tools::{ResearchTool, ToolOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        error: ToolError,
    }

    #[async_trait]
    impl ResearchTool for Flaky {
        fn name(&self) -> &str {
            "pubmed_search"
        }

        async fn invoke(&self, _params: &ToolParams, query: &str) -> Result<ToolOutput, ToolError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(self.error.clone());
            }
            Ok(ToolOutput::new(json!({ "query": query }), format!("results for {query}")))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ResearchTool for Sleepy {
        fn name(&self) -> &str {
            "browse_webpage"
        }

        async fn invoke(&self, _params: &ToolParams, _query: &str) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::new(json!(null), ""))
        }
    }

    fn dispatcher(tool: Arc<dyn ResearchTool>, attempts: u32) -> ToolDispatcher {
        let registry = ToolRegistry::new().register(tool);
        ToolDispatcher::new(Arc::new(registry))
            .with_retry(RetryPolicy::new(attempts, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let tool = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            error: ToolError::transient("timeout"),
        });
        let dispatcher = dispatcher(tool, 3);
        let output = dispatcher
            .dispatch(&ToolInvocation::new("pubmed_search", "X Y Z trial"))
            .await
            .unwrap();

        assert_eq!(output.formatted, "results for X Y Z trial");
        let stats = dispatcher.stats();
        assert_eq!(stats[0].1.calls, 1);
        assert_eq!(stats[0].1.successes, 1);
        assert_eq!(stats[0].1.retried_attempts, 2);
    }

    #[tokio::test]
    async fn permanent_failures_surface_immediately() {
        let tool = Arc::new(Flaky {
            failures_left: AtomicU32::new(1),
            error: ToolError::permanent("401 unauthorized"),
        });
        let dispatcher = dispatcher(tool, 3);
        let err = dispatcher
            .dispatch(&ToolInvocation::new("pubmed_search", "q"))
            .await
            .unwrap_err();

        assert_eq!(err, ToolError::permanent("401 unauthorized"));
        assert_eq!(dispatcher.stats()[0].1.failures, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_permanent_error() {
        let dispatcher = dispatcher(Arc::new(Sleepy), 3);
        let err = dispatcher
            .dispatch(&ToolInvocation::new("web_magic", "q"))
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("web_magic".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn per_tool_timeout_is_transient() {
        let registry = ToolRegistry::new().register_with(
            Arc::new(Sleepy),
            ToolOptions {
                timeout: Some(Duration::from_millis(10)),
                max_concurrent: Some(1),
                ..ToolOptions::default()
            },
        );
        let dispatcher = ToolDispatcher::new(Arc::new(registry))
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));

        let err = dispatcher
            .dispatch(&ToolInvocation::new("browse_webpage", "https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Transient(_)));
        assert_eq!(dispatcher.stats()[0].1.retried_attempts, 1);
    }
}
