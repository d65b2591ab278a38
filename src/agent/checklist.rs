//! Task checklist carried through a turn.
//!
//! The model declares a checklist with a `<todo>` block (JSON or markdown
//! checkboxes) and patches single items with `<todo_update>` directives.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agent::events::EventKind;

const DEFAULT_TITLE: &str = "Tasks";

static MARKDOWN_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(?:\[(.)\]\s*)?(.+?)\s*$")
        .expect("markdown item pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChecklistStatus {
    /// Accepts the canonical names plus the aliases models tend to produce.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "pending" | "todo" | "open" | "not_started" => Some(Self::Pending),
            "in_progress" | "active" | "running" | "doing" | "started" => Some(Self::InProgress),
            "completed" | "complete" | "done" | "finished" | "success" => Some(Self::Completed),
            "failed" | "fail" | "error" | "blocked" => Some(Self::Failed),
            _ => None,
        }
    }

    fn from_checkbox(mark: Option<char>) -> Self {
        match mark {
            Some('x' | 'X') => Self::Completed,
            Some('~' | '-' | '>') => Self::InProgress,
            Some('!') => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecklistItem {
    pub id: String,
    pub content: String,
    pub status: ChecklistStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checklist {
    pub id: String,
    pub title: String,
    pub items: Vec<ChecklistItem>,
}

/// An item as declared by the model, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftItem {
    pub id: Option<String>,
    pub content: String,
    pub status: ChecklistStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftChecklist {
    pub title: String,
    pub items: Vec<DraftItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub id: String,
    pub status: Option<ChecklistStatus>,
    pub result: Option<String>,
    pub content: Option<String>,
}

/// Parses the body of a `<todo>` block.
pub fn parse_block(raw: &str) -> Option<DraftChecklist> {
    let body = raw.trim();
    if body.starts_with('{') {
        return parse_json_block(body);
    }
    parse_markdown_block(body)
}

fn parse_json_block(body: &str) -> Option<DraftChecklist> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(DEFAULT_TITLE)
        .to_string();

    let items = value
        .get("items")?
        .as_array()?
        .iter()
        .filter_map(|item| match item {
            Value::String(content) => Some(DraftItem {
                id: None,
                content: content.trim().to_string(),
                status: ChecklistStatus::Pending,
            }),
            Value::Object(map) => Some(DraftItem {
                id: map.get("id").and_then(id_text),
                content: map.get("content")?.as_str()?.trim().to_string(),
                status: map
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(ChecklistStatus::parse)
                    .unwrap_or(ChecklistStatus::Pending),
            }),
            _ => None,
        })
        .filter(|item| !item.content.is_empty())
        .collect::<Vec<_>>();

    (!items.is_empty()).then_some(DraftChecklist { title, items })
}

fn parse_markdown_block(body: &str) -> Option<DraftChecklist> {
    let pattern = &*MARKDOWN_ITEM;
    let mut title = None;
    let mut items = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            if title.is_none() {
                title = Some(heading.trim_start_matches('#').trim().to_string());
            }
            continue;
        }
        let Some(captures) = pattern.captures(line) else {
            continue;
        };
        let mark = captures
            .get(1)
            .and_then(|mark| mark.as_str().chars().next());
        let Some(content) = captures.get(2).map(|content| content.as_str().to_string()) else {
            continue;
        };
        items.push(DraftItem {
            id: None,
            content,
            status: ChecklistStatus::from_checkbox(mark),
        });
    }

    let title = title
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    (!items.is_empty()).then_some(DraftChecklist { title, items })
}

/// Parses the body of a `<todo_update>` directive.
pub fn parse_update(raw: &str) -> Option<ItemUpdate> {
    let value = serde_json::from_str::<Value>(raw.trim()).ok()?;
    let id = value.get("id").and_then(id_text)?;
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
    };

    Some(ItemUpdate {
        id,
        status: value
            .get("status")
            .and_then(Value::as_str)
            .and_then(ChecklistStatus::parse),
        result: text("result"),
        content: text("content").filter(|content| !content.is_empty()),
    })
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Turn-scoped checklist state. At most one checklist exists per turn.
#[derive(Debug, Default)]
pub struct ChecklistTracker {
    checklist: Option<Checklist>,
    next_item: u32,
}

impl ChecklistTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checklist(&self) -> Option<&Checklist> {
        self.checklist.as_ref()
    }

    pub fn into_checklist(self) -> Option<Checklist> {
        self.checklist
    }

    /// Parses a raw `<todo>` body and creates the checklist from it.
    pub fn on_block(&mut self, raw: &str) -> Vec<EventKind> {
        match parse_block(raw) {
            Some(draft) => self.create(draft),
            None => {
                debug!("unparseable checklist block");
                Vec::new()
            }
        }
    }

    /// Creates the turn's checklist. A second block in the same turn is ignored.
    pub fn create(&mut self, draft: DraftChecklist) -> Vec<EventKind> {
        if self.checklist.is_some() {
            debug!("ignoring repeated checklist block");
            return Vec::new();
        }

        let checklist_id = "checklist-1".to_string();
        let mut events = vec![EventKind::ChecklistStart {
            checklist_id: checklist_id.clone(),
            title: draft.title.clone(),
        }];

        let mut items: Vec<ChecklistItem> = Vec::with_capacity(draft.items.len());
        for draft_item in draft.items {
            let id = match draft_item.id {
                Some(id) if !items.iter().any(|item| item.id == id) => id,
                _ => self.allocate_id(&items),
            };
            let item = ChecklistItem {
                id,
                content: draft_item.content,
                status: draft_item.status,
                result: None,
            };
            events.push(EventKind::ChecklistItemAdd {
                checklist_id: checklist_id.clone(),
                item: item.clone(),
            });
            items.push(item);
        }

        events.push(EventKind::ChecklistEnd {
            checklist_id: checklist_id.clone(),
            item_count: items.len(),
        });
        self.checklist = Some(Checklist {
            id: checklist_id,
            title: draft.title,
            items,
        });
        events
    }

    /// Parses a raw `<todo_update>` body and applies it.
    pub fn on_update(&mut self, raw: &str) -> Vec<EventKind> {
        match parse_update(raw) {
            Some(update) => self.apply(update),
            None => {
                debug!("unparseable checklist update");
                Vec::new()
            }
        }
    }

    /// Unknown ids that carry content append a new item; other unknown ids and
    /// updates that arrive before any checklist are dropped.
    pub fn apply(&mut self, update: ItemUpdate) -> Vec<EventKind> {
        let Some(checklist) = self.checklist.as_mut() else {
            debug!(item_id = %update.id, "checklist update before checklist");
            return Vec::new();
        };

        if let Some(item) = checklist.items.iter_mut().find(|item| item.id == update.id) {
            if let Some(status) = update.status {
                item.status = status;
            }
            if let Some(result) = update.result {
                item.result = Some(result);
            }
            if let Some(content) = update.content {
                item.content = content;
            }
            return vec![EventKind::ChecklistItemUpdate {
                checklist_id: checklist.id.clone(),
                item: item.clone(),
            }];
        }

        let Some(content) = update.content else {
            debug!(item_id = %update.id, "checklist update for unknown item");
            return Vec::new();
        };
        let item = ChecklistItem {
            id: update.id,
            content,
            status: update.status.unwrap_or(ChecklistStatus::Pending),
            result: update.result,
        };
        checklist.items.push(item.clone());
        vec![EventKind::ChecklistItemAdd {
            checklist_id: checklist.id.clone(),
            item,
        }]
    }

    fn allocate_id(&mut self, taken: &[ChecklistItem]) -> String {
        loop {
            self.next_item += 1;
            let id = self.next_item.to_string();
            if !taken.iter().any(|item| item.id == id) {
                return id;
            }
        }
    }
}
