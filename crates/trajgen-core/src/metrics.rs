use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

use crate::markup::Repair;

struct TrajgenMetrics {
    tool_calls: Counter<u64>,
    tool_latency_ms: Histogram<f64>,
    trajectories: Counter<u64>,
    trajectory_tool_calls: Histogram<f64>,
    repairs: Counter<u64>,
}

static METRICS: OnceCell<TrajgenMetrics> = OnceCell::new();

fn handles() -> &'static TrajgenMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("trajgen");
        TrajgenMetrics {
            tool_calls: meter
                .u64_counter("tool_calls_total")
                .with_description("Dispatched tool calls by tool and status")
                .init(),
            tool_latency_ms: meter
                .f64_histogram("tool_call_duration_ms")
                .with_description("Tool call latency including retries in milliseconds")
                .init(),
            trajectories: meter
                .u64_counter("trajectories_total")
                .with_description("Assembled trajectories by termination reason")
                .init(),
            trajectory_tool_calls: meter
                .f64_histogram("trajectory_tool_calls")
                .with_description("Tool calls per assembled trajectory")
                .init(),
            repairs: meter
                .u64_counter("markup_repairs_total")
                .with_description("Markup repairs applied to model output by kind")
                .init(),
        }
    })
}

/// Record one dispatched tool call (no-op if no provider installed).
pub fn record_tool_call(tool: &str, status: &str, latency_ms: u64, attempts: u32) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("tool", tool.to_string()),
        KeyValue::new("status", status.to_string()),
        KeyValue::new("attempts", attempts as i64),
    ];
    metrics.tool_calls.add(1, &attrs);
    metrics.tool_latency_ms.record(latency_ms as f64, &attrs);
}

pub fn record_trajectory(termination: &str, tool_calls: usize) {
    let metrics = handles();
    let attrs = [KeyValue::new("termination", termination.to_string())];
    metrics.trajectories.add(1, &attrs);
    metrics
        .trajectory_tool_calls
        .record(tool_calls as f64, &attrs);
}

pub fn record_repairs(repairs: &[Repair]) {
    if repairs.is_empty() {
        return;
    }
    let metrics = handles();
    for repair in repairs {
        metrics
            .repairs
            .add(1, &[KeyValue::new("kind", repair.as_str())]);
    }
}
