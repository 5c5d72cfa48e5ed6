//! Instruction and feedback templates for the reasoning loop.

use std::collections::HashMap;

use serde_json::Value;

use troupe_core::types::ToolDefinition;

use crate::agent_loop::{AgentProfile, TaskBrief};
use crate::parser::stringify;

/// Built-in action that ends the task as blocked.
pub const BLOCK_TASK_ACTION: &str = "block_task";

const OUTPUT_FORMAT: &str = r#"Reply with exactly one JSON object and nothing else. Use one of these shapes:

1. To think about the task:
{"thought": "your reasoning", "action": "self_question", "actionInput": {"question": "what you need to find out next"}}

2. To use a tool:
{"thought": "why this tool helps", "action": "<tool name>", "actionInput": {<tool input>}}

3. To report what a tool result told you:
{"observation": "what you learned", "isFinalAnswerReady": false}

4. When you can answer:
{"finalAnswer": "your complete answer"}"#;

/// System message describing who the agent is and how it must answer.
pub fn system_message(profile: &AgentProfile, tools: &[ToolDefinition]) -> String {
    let mut prompt = format!(
        "You are {name}.\n\nYour role is: {role}.\nYour background is: {background}.\nYour main goal is: {goal}.\n\n\
         You are working on one task as part of a team. Work step by step; \
         each reply is one step.\n",
        name = profile.name,
        role = profile.role,
        background = if profile.background.is_empty() {
            "not specified"
        } else {
            profile.background.as_str()
        },
        goal = if profile.goal.is_empty() {
            "complete the task you are given"
        } else {
            profile.goal.as_str()
        },
    );

    if tools.is_empty() && !profile.allow_blocking {
        prompt.push_str("\nYou have no tools; rely on your own knowledge.\n");
    } else {
        prompt.push_str("\nTools available to you:\n");
        for tool in tools {
            prompt.push_str(&format!(
                "- {}: {} Input schema: {}\n",
                tool.name, tool.description, tool.input_schema
            ));
        }
        if profile.allow_blocking {
            prompt.push_str(&format!(
                "- {BLOCK_TASK_ACTION}: Stop working when the task cannot be completed \
                 (missing information, impossible request). Input schema: \
                 {{\"type\":\"object\",\"properties\":{{\"reason\":{{\"type\":\"string\"}}}}}}\n"
            ));
        }
    }

    prompt.push('\n');
    prompt.push_str(OUTPUT_FORMAT);
    prompt
}

/// First user message for a task attempt.
pub fn initial_message(profile: &AgentProfile, brief: &TaskBrief) -> String {
    let mut message = format!(
        "Hi {}, please complete the following task: {}",
        profile.name, brief.description
    );
    if !brief.expected_output.is_empty() {
        message.push_str(&format!(
            "\n\nYour expected output should be: \"{}\"",
            brief.expected_output
        ));
    }
    if let Some(context) = brief.context.as_deref().filter(|c| !c.is_empty()) {
        message.push_str(&format!(
            "\n\nIncorporate the following findings and insights from previous tasks:\n{context}"
        ));
    }
    if !brief.feedback.is_empty() {
        message.push_str("\n\nYour previous answer was reviewed. Address this feedback:\n");
        for item in &brief.feedback {
            message.push_str(&format!("- {item}\n"));
        }
    }
    message
}

pub fn invalid_json() -> String {
    r#"You returned an invalid JSON object. Reply with only a valid JSON object, no comments or other text, e.g. {"finalAnswer": "The final answer"}"#.to_string()
}

pub fn thought(thought: &str) -> String {
    format!(
        "Your thoughts are great, let's keep going. You thought: \"{thought}\". \
         Continue reasoning, use a tool, or give your finalAnswer if you have enough information."
    )
}

pub fn self_question(question: &str) -> String {
    format!("Awesome, please answer yourself the question: {question}")
}

pub fn tool_result(tool: &str, result: &str) -> String {
    format!("You got this result from the tool {tool}: {result}")
}

pub fn tool_error(tool: &str, error: &str) -> String {
    format!(
        "An error occurred while using the tool {tool}: {error}. \
         Try another approach or a different input."
    )
}

pub fn tool_missing(tool: &str) -> String {
    format!("Hey, the tool {tool} does not exist. Please find another way.")
}

pub fn observation() -> String {
    "Great observation. Keep going, and move toward your finalAnswer.".to_string()
}

pub fn weird_output() -> String {
    "Your latest response does not match the expected output format. \
     Reply with one of the JSON shapes from your instructions."
        .to_string()
}

pub fn force_final_answer() -> String {
    "We don't have more time to keep looking for the answer. Use all the information \
     you have gathered so far and give your finalAnswer right away."
        .to_string()
}

/// Render completed upstream results for the initial message.
pub fn render_context(results: &[(String, Value)]) -> Option<String> {
    if results.is_empty() {
        return None;
    }
    let parts: Vec<String> = results
        .iter()
        .map(|(title, result)| format!("Task: {title}\nResult: {}", stringify(result)))
        .collect();
    Some(parts.join("\n\n"))
}

/// Replace `{name}` placeholders with input values.
///
/// Unknown names and anything that is not a plain identifier in braces
/// are left as-is.
pub fn interpolate(template: &str, inputs: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let name_len = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        match (after[name_len..].starts_with('}'), inputs.get(name)) {
            (true, Some(value)) if !name.is_empty() => {
                out.push_str(&stringify(value));
                rest = &after[name_len + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> HashMap<String, Value> {
        HashMap::from([
            ("topic".to_string(), json!("Rust")),
            ("count".to_string(), json!(3)),
        ])
    }

    #[test]
    fn interpolates_known_names() {
        assert_eq!(
            interpolate("Write {count} posts about {topic}.", &inputs()),
            "Write 3 posts about Rust."
        );
    }

    #[test]
    fn leaves_unknown_and_json_alone() {
        assert_eq!(
            interpolate("{missing} and {\"a\": 1} and {}", &inputs()),
            "{missing} and {\"a\": 1} and {}"
        );
        assert_eq!(interpolate("dangling {topic", &inputs()), "dangling {topic");
    }

    #[test]
    fn initial_message_includes_context_and_feedback() {
        let profile = AgentProfile::new("writer", "Writer");
        let brief = TaskBrief {
            task_id: "draft".into(),
            description: "Write a post".into(),
            expected_output: "Markdown".into(),
            context: render_context(&[("Research".into(), json!("facts"))]),
            feedback: vec!["shorter".into()],
            resume: false,
        };
        let msg = initial_message(&profile, &brief);
        assert!(msg.contains("Write a post"));
        assert!(msg.contains("\"Markdown\""));
        assert!(msg.contains("Task: Research\nResult: facts"));
        assert!(msg.contains("- shorter"));
    }

    #[test]
    fn system_message_lists_block_action_only_when_allowed() {
        let mut profile = AgentProfile::new("writer", "Writer");
        assert!(!system_message(&profile, &[]).contains(BLOCK_TASK_ACTION));
        profile.allow_blocking = true;
        assert!(system_message(&profile, &[]).contains(BLOCK_TASK_ACTION));
    }
}
