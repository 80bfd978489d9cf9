use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use shared::domain::{UserId, UserSummary, ASSISTANT_USER_ID};

use crate::error::ClientResult;

/// The conversation currently shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Direct { partner: UserSummary },
    Assistant,
}

impl Conversation {
    pub fn direct(partner: UserSummary) -> Self {
        Self::Direct { partner }
    }

    pub fn partner_id(&self) -> UserId {
        match self {
            Self::Direct { partner } => partner.id,
            Self::Assistant => ASSISTANT_USER_ID,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Direct { partner } => &partner.username,
            Self::Assistant => shared::domain::ASSISTANT_USERNAME,
        }
    }
}

/// Remembers the last selected conversation across restarts.
pub trait SelectionStore: Send + Sync {
    fn load(&self) -> ClientResult<Option<Conversation>>;
    fn save(&self, selection: Option<&Conversation>) -> ClientResult<()>;
}

#[derive(Default)]
pub struct MemorySelectionStore {
    slot: Mutex<Option<Conversation>>,
}

impl SelectionStore for MemorySelectionStore {
    fn load(&self) -> ClientResult<Option<Conversation>> {
        Ok(self.slot.lock().map(|slot| slot.clone()).unwrap_or_default())
    }

    fn save(&self, selection: Option<&Conversation>) -> ClientResult<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = selection.cloned();
        }
        Ok(())
    }
}

/// JSON file next to the rest of the client's local state.
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SelectionStore for FileSelectionStore {
    fn load(&self) -> ClientResult<Option<Conversation>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        // A corrupt file is treated as no selection.
        Ok(serde_json::from_str(&raw).ok())
    }

    fn save(&self, selection: Option<&Conversation>) -> ClientResult<()> {
        match selection {
            Some(selection) => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::write(&self.path, serde_json::to_vec_pretty(selection)?)?;
            }
            None => {
                if self.path.exists() {
                    fs::remove_file(&self.path)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/selection_tests.rs"]
mod tests;
