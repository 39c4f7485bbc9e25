use std::fmt::Write as _;

use crate::budget::{BudgetScope, CallBudget};
use crate::tools::ToolRegistry;

/// Injected after a turn that neither called a tool nor answered.
pub const CONTINUE_PROMPT: &str = "Please continue with tool calls or provide your final answer.";

/// Injected when a budget ceiling was reached or a call was suppressed.
pub fn forced_answer_directive(scope: &BudgetScope) -> String {
    format!(
        "You have reached the maximum limit of {scope}. You MUST provide your final answer now using the <answer> tag."
    )
}

/// Protocol instructions listing every registered tool and the active budgets.
pub fn build_system_prompt(registry: &ToolRegistry, budget: &CallBudget) -> String {
    let mut prompt = String::from(
        "You are a research assistant. Answer the question by searching for evidence with the tools below, then give a final answer with citations.\n\n## Available Tools\n",
    );
    for (idx, tool) in registry.tools().enumerate() {
        let _ = writeln!(prompt, "{}. {}: {}", idx + 1, tool.name(), tool.usage());
    }

    prompt.push_str(
        "\n## Format Rules\n\
         - Reason inside <think>...</think>.\n\
         - Issue at most ONE <call_tool name=\"...\">query</call_tool> per response and stop right after </call_tool>.\n\
         - Always close your tags.\n\
         - Never write <tool_output>; only the system provides tool results.\n\
         - Never fabricate identifiers, titles or results.\n\
         - Give the final answer inside <answer>...</answer>.\n",
    );

    if !budget.per_tool.is_empty() || budget.total.is_some() {
        prompt.push_str("\n## Limits\n");
        for (name, limit) in &budget.per_tool {
            let _ = writeln!(prompt, "- {name} can be called at most {limit} times.");
        }
        if let Some(total) = budget.total {
            let _ = writeln!(prompt, "- At most {total} tool calls in total.");
        }
        prompt.push_str("- Once a limit is reached you must answer immediately.\n");
    }

    prompt.push_str(
        "\n## Citation Format\nUse <cite id=\"ID\">supported claim</cite> with identifiers taken from actual tool results. Separate several identifiers with commas.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::markup::ToolParams;
    use crate::tools::{ResearchTool, ToolOutput};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Search;

    #[async_trait]
    impl ResearchTool for Search {
        fn name(&self) -> &str {
            "pubmed_search"
        }

        fn usage(&self) -> String {
            "<call_tool name=\"pubmed_search\" limit=\"N\">keywords</call_tool>".into()
        }

        async fn invoke(&self, _: &ToolParams, _: &str) -> Result<ToolOutput, ToolError> {
            Err(ToolError::permanent("unused"))
        }
    }

    #[test]
    fn system_prompt_lists_tools_and_limits() {
        let registry = ToolRegistry::new().register(Arc::new(Search));
        let budget = CallBudget::unlimited().with_limit("pubmed_search", 3);
        let prompt = build_system_prompt(&registry, &budget);

        assert!(prompt.contains("1. pubmed_search: <call_tool name=\"pubmed_search\" limit=\"N\">"));
        assert!(prompt.contains("pubmed_search can be called at most 3 times"));
        assert!(prompt.contains("Never write <tool_output>"));
    }

    #[test]
    fn forced_answer_names_the_ceiling() {
        let text = forced_answer_directive(&BudgetScope::Tool {
            name: "pubmed_search".into(),
            limit: 3,
        });
        assert_eq!(
            text,
            "You have reached the maximum limit of 3 pubmed_search calls. You MUST provide your final answer now using the <answer> tag."
        );
    }
}
