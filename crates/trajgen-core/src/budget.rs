use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-tool ceilings plus an optional ceiling over all tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBudget {
    #[serde(default)]
    pub per_tool: BTreeMap<String, u32>,
    #[serde(default)]
    pub total: Option<u32>,
}

/// Which ceiling a check ran into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BudgetScope {
    Tool { name: String, limit: u32 },
    Total { limit: u32 },
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool { name, limit } => write!(f, "{limit} {name} calls"),
            Self::Total { limit } => write!(f, "{limit} tool calls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetCheck {
    Allowed,
    Exhausted(BudgetScope),
}

/// Calls made so far in one trajectory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounter {
    per_tool: BTreeMap<String, u32>,
    total: u32,
}

impl CallCounter {
    pub fn record(&mut self, tool: &str) {
        *self.per_tool.entry(tool.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, tool: &str) -> u32 {
        self.per_tool.get(tool).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

impl CallBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, tool: impl Into<String>, limit: u32) -> Self {
        self.per_tool.insert(tool.into(), limit);
        self
    }

    pub fn with_total(mut self, limit: u32) -> Self {
        self.total = Some(limit);
        self
    }

    pub fn limit_for(&self, tool: &str) -> Option<u32> {
        self.per_tool.get(tool).copied()
    }

    /// Whether one more call to `tool` fits.
    pub fn check(&self, tool: &str, counter: &CallCounter) -> BudgetCheck {
        if let Some(limit) = self.limit_for(tool) {
            if counter.count(tool) >= limit {
                return BudgetCheck::Exhausted(BudgetScope::Tool {
                    name: tool.to_string(),
                    limit,
                });
            }
        }
        if let Some(limit) = self.total {
            if counter.total() >= limit {
                return BudgetCheck::Exhausted(BudgetScope::Total { limit });
            }
        }
        BudgetCheck::Allowed
    }

    /// The ceiling a just-recorded call to `tool` has reached, if any.
    pub fn reached(&self, tool: &str, counter: &CallCounter) -> Option<BudgetScope> {
        match self.check(tool, counter) {
            BudgetCheck::Allowed => None,
            BudgetCheck::Exhausted(scope) => Some(scope),
        }
    }
}
