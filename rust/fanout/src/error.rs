use crate::failure::FailureSummary;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
        .into()
    }

    pub fn unit_failed(index: i64, message: impl Into<String>) -> Error {
        ErrorKind::UnitFailed {
            index,
            message: message.into(),
        }
        .into()
    }

    pub fn unit_failures(failures: Vec<FailureSummary>) -> Error {
        ErrorKind::UnitFailures { failures }.into()
    }

    pub fn spawn(context: impl Into<String>, source: std::io::Error) -> Error {
        ErrorKind::Spawn {
            context: context.into(),
            source,
        }
        .into()
    }

    /// Returns the failures carried by this error, if it is a unit failure.
    pub fn failures(&self) -> Vec<FailureSummary> {
        match self.kind() {
            ErrorKind::UnitFailed { index, message } => vec![FailureSummary {
                index: *index,
                message: message.clone(),
            }],
            ErrorKind::UnitFailures { failures } => failures.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("unit {index} failed: {message}")]
    UnitFailed { index: i64, message: String },

    #[error("{} units failed, first at index {}", .failures.len(), first_index(.failures))]
    UnitFailures { failures: Vec<FailureSummary> },

    #[error("failed to start {context}: {source}")]
    Spawn {
        context: String,
        source: std::io::Error,
    },
}

fn first_index(failures: &[FailureSummary]) -> i64 {
    failures.first().map_or(0, |failure| failure.index)
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}
