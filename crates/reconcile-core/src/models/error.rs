#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    Timeout,
    Cancelled,
    ProcessFailure,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(
        task: impl Into<String>,
        kind: CoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task: Some(task.into()),
            kind,
            message: message.into(),
        }
    }

    pub fn is_storage_failure(&self) -> bool {
        self.kind == CoreErrorKind::StorageFailure
    }
}
