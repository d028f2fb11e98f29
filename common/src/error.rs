//! Error taxonomy shared by every descriptor operation.
//!
//! Structural errors (`NotFound`, `AlreadyExists`, `WrongType`, `DirectoryNotEmpty`,
//! `MissingParent`, `Overlapping`) report precondition violations and are raised to the immediate
//! caller, they are never retried. Everything a backend reports about its own transport is carried unmodified
//! in [`Error::Backend`].

/// The two kinds of resources a descriptor can point at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Directory,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResourceKind::File => write!(f, "file"),
            ResourceKind::Directory => write!(f, "directory"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("{0} already exists, did you intend to allow overwrite?")]
    AlreadyExists(String),
    #[error("{resource} is not a {expected}")]
    WrongType {
        resource: String,
        expected: ResourceKind,
    },
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(String),
    #[error("parent directory of {0} does not exist")]
    MissingParent(String),
    #[error("{target} is {resource} itself or lies inside it")]
    Overlapping { resource: String, target: String },
    #[error("{operation} is not supported for {resource}")]
    UnsupportedOperation {
        resource: String,
        operation: &'static str,
    },
    #[error("no backend can handle location {0:?}")]
    UnsupportedLocation(String),
    #[error("{0:#}")]
    Backend(#[from] anyhow::Error),
}

impl Error {
    pub fn wrong_type(resource: impl std::fmt::Display, expected: ResourceKind) -> Self {
        Error::WrongType {
            resource: resource.to_string(),
            expected,
        }
    }

    pub fn unsupported(resource: impl std::fmt::Display, operation: &'static str) -> Self {
        Error::UnsupportedOperation {
            resource: resource.to_string(),
            operation,
        }
    }

    /// True for precondition violations, false for backend and configuration failures.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::WrongType { .. }
                | Error::DirectoryNotEmpty(_)
                | Error::MissingParent(_)
                | Error::Overlapping { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource() {
        let error = Error::wrong_type("/tmp/foo", ResourceKind::Directory);
        assert_eq!(error.to_string(), "/tmp/foo is not a directory");
        assert!(error.is_structural());
        let error = Error::DirectoryNotEmpty("memory://bucket/dir".to_string());
        assert!(error.to_string().contains("memory://bucket/dir"));
    }

    #[test]
    fn backend_errors_keep_their_chain() {
        let source = anyhow::anyhow!("connection reset").context("failed reading chunk");
        let error = Error::from(source);
        assert!(!error.is_structural());
        assert_eq!(error.to_string(), "failed reading chunk: connection reset");
    }
}
