//! Dashboard card order and visibility, persisted as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CARDS: [&str; 10] = [
    "cpu", "gpu", "memory", "disk", "network", "process", "charts", "history", "alert", "layout",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardLayout {
    pub card_id: String,
    pub order: u32,
    pub is_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub cards: Vec<CardLayout>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            cards: DEFAULT_CARDS
                .iter()
                .zip(0..)
                .map(|(id, order)| CardLayout {
                    card_id: id.to_string(),
                    order,
                    is_visible: true,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to read layout {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("layout {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write layout {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode layout: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing file or a broken document gives the default.
    pub fn load(&self) -> Layout {
        match self.try_load() {
            Ok(layout) => layout,
            Err(LayoutError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Layout::default()
            }
            Err(err) => {
                warn!(error = %err, "using default layout");
                Layout::default()
            }
        }
    }

    pub fn try_load(&self) -> Result<Layout, LayoutError> {
        let text = fs::read_to_string(&self.path).map_err(|source| LayoutError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| LayoutError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Failures are logged and reported as `false`.
    pub fn save(&self, layout: &Layout) -> bool {
        match self.try_save(layout) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "layout not saved");
                false
            }
        }
    }

    pub fn try_save(&self, layout: &Layout) -> Result<(), LayoutError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LayoutError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(layout)?;
        fs::write(&self.path, text).map_err(|source| LayoutError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
