//! # Conversational Memory
//!
//! Per-device chat history shared by every connection coming from the same
//! device. Histories live for the lifetime of the process.
//!
//! ## Locking:
//! The outer map is guarded by a `std::sync::RwLock` that is only held long
//! enough to look up or insert a device entry. Each device history has its
//! own `tokio::sync::Mutex`; every append-then-trim sequence runs under it so
//! two replies for the same device cannot interleave half-trimmed histories.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation, in chat-completions wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

type History = Arc<Mutex<Vec<Turn>>>;

/// Keyed store of device histories.
///
/// Cheap to clone; clones share the same histories.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    histories: Arc<RwLock<HashMap<String, History>>>,
    system_prompt: String,
    max_turns: usize,
}

impl ConversationStore {
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            histories: Arc::new(RwLock::new(HashMap::new())),
            system_prompt: system_prompt.into(),
            max_turns,
        }
    }

    /// Normalise a device identifier; blank ids share the `default` history.
    pub fn device_key(device_id: &str) -> String {
        let trimmed = device_id.trim();
        if trimmed.is_empty() {
            "default".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn history(&self, device_id: &str) -> History {
        let key = Self::device_key(device_id);

        if let Some(history) = self.read_map().get(&key) {
            return history.clone();
        }

        let mut map = match self.histories.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(vec![Turn::new(Role::System, self.system_prompt.clone())]))
            })
            .clone()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, History>> {
        match self.histories.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a turn, apply the trim policy and return the resulting history.
    pub async fn append(&self, device_id: &str, turn: Turn) -> Vec<Turn> {
        let history = self.history(device_id);
        let mut turns = history.lock().await;
        turns.push(turn);
        trim_history(&mut turns, self.max_turns);
        turns.clone()
    }

    /// Snapshot of a device history (seeded with the system prompt).
    pub async fn snapshot(&self, device_id: &str) -> Vec<Turn> {
        self.history(device_id).lock().await.clone()
    }

    pub fn device_count(&self) -> usize {
        self.read_map().len()
    }
}

/// Keep a leading system turn plus the last `keep` turns.
pub fn trim_history(turns: &mut Vec<Turn>, keep: usize) {
    let has_system = matches!(turns.first(), Some(t) if t.role == Role::System);
    let head = usize::from(has_system);

    if turns.len() <= head + keep {
        return;
    }

    let drop_count = turns.len() - head - keep;
    turns.drain(head..head + drop_count);
}
