//! Markdown conventions for checklist items in item bodies.
//!
//! A todo line is an unordered-list checkbox, optionally tagged `(manual)`:
//! `- [ ] Write the parser` / `* [x] Ship it (manual)`.

use std::sync::LazyLock;

use regex::Regex;

static TODO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*+]\s+\[( |x|X)\]\s+(.*?)\s*$").expect("todo regex is valid")
});

static MANUAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\(manual\)$").expect("manual regex is valid"));

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+").expect("bullet regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoLine {
    pub text: String,
    pub checked: bool,
    pub manual: bool,
}

pub fn parse_todo_line(line: &str) -> Option<TodoLine> {
    let caps = TODO_RE.captures(line)?;
    let checked = !caps[1].trim().is_empty();
    let raw = &caps[2];
    let manual = MANUAL_RE.is_match(raw);
    let text = MANUAL_RE.replace(raw, "").trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(TodoLine {
        text,
        checked,
        manual,
    })
}

/// Strip list and checkbox markup from agent-supplied item text.
pub fn clean_item(text: &str) -> String {
    if let Some(todo) = parse_todo_line(text) {
        return todo.text;
    }
    BULLET_RE.replace(text, "").trim().to_string()
}

pub fn render_todo_list(todos: &[TodoLine]) -> String {
    todos
        .iter()
        .map(|todo| {
            let mark = if todo.checked { "x" } else { " " };
            let tag = if todo.manual { " (manual)" } else { "" };
            format!("- [{mark}] {}{tag}", todo.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
