use std::io;

/// A failed interaction with a shared-memory object or semaphore.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The name is not of the form `/name` or contains a NUL byte.
    #[error("`{0}` is not a valid shared memory name")]
    InvalidName(String),
    /// An operation on a named segment failed.
    #[error("{op} of shared memory `{name}` failed: {source}")]
    Segment {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
    /// An operation on a semaphore failed.
    #[error("semaphore {op} failed: {source}")]
    Semaphore {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ShmError {
    pub(crate) fn segment(op: &'static str, name: &str, source: io::Error) -> Self {
        ShmError::Segment {
            op,
            name: name.to_owned(),
            source,
        }
    }

    pub(crate) fn last_semaphore(op: &'static str) -> Self {
        ShmError::Semaphore {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// The named object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShmError::Segment { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// The named object exists where it was expected not to.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ShmError::Segment { source, .. } if source.kind() == io::ErrorKind::AlreadyExists)
    }
}
