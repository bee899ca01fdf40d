//! Prompt assembly and the conversation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::ViewState;

const MAX_TURN_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of the session's conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<ConversationTurn>,
}

impl ConversationLog {
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The last `limit` turns, oldest first.
    pub fn recent(&self, limit: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(limit);
        &self.turns[start..]
    }
}

/// Build the single prompt string sent to the model: instructions, the
/// current view as JSON, recent history, and the user's message last.
pub fn build_prompt(view: &ViewState, history: &[ConversationTurn], user_text: &str) -> String {
    let state_json =
        serde_json::to_string_pretty(view).unwrap_or_else(|_| "{}".to_string());

    let history_block = if history.is_empty() {
        String::new()
    } else {
        let lines = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), clip(&turn.content)))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\nRecent conversation:\n{}\n", lines)
    };

    format!(
        r##"You are the design assistant of a live UI canvas. Answer the user in plain language.
When the user asks for a change, also include exactly ONE JSON object anywhere in your reply:
{{"action": "<action>", "data": {{...}}}}
Supported actions and their data:
- add_component: {{"type": "button", "category": "atomic|composite|complex", "name": "optional", "properties": {{}}, "size": {{"w": 120, "h": 40}}}}
- update_component: {{"id": "<component id>", "properties": {{...}}}}
- replace_theme: {{"colors": {{"primary": "#hex", ...}}, "effects": {{"glow": true, ...}}}}
- update_layout: {{"columns": 12, "row_height": 30, "margin": [10, 10], "container_padding": [10, 10], "show_grid": true, "snap_to_grid": true}}
Leave the JSON out entirely when no change is needed.

Current view state:
{}
{}
User: {}"##,
        state_json, history_block, user_text
    )
}

fn clip(text: &str) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() > MAX_TURN_CHARS {
        let clipped: String = single_line.chars().take(MAX_TURN_CHARS).collect();
        format!("{}...", clipped)
    } else {
        single_line
    }
}
