pub mod disk;
pub mod network;
pub mod process;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to enumerate {what}: {reason}")]
    Enumerate { what: &'static str, reason: String },
    #[error("failed to read {entity}: {reason}")]
    Entity { entity: String, reason: String },
    #[error("access to {entity} denied")]
    PermissionDenied { entity: String },
    #[error("{entity} no longer exists")]
    Gone { entity: String },
}

impl CollectError {
    /// Errors expected during normal churn: processes that exited or that the
    /// current user may not inspect.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::Gone { .. })
    }

    pub(crate) fn from_io(entity: impl Into<String>, err: std::io::Error) -> Self {
        let entity = entity.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::Gone { entity },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { entity },
            _ => Self::Entity {
                entity,
                reason: err.to_string(),
            },
        }
    }
}
