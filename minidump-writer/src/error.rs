use std::io;

use crate::source::SourceError;

/// An error writing a minidump.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("process {0} does not exist or could not be attached to")]
    TargetUnreachable(u32),
    #[error("not permitted to attach to process {0}")]
    PermissionDenied(u32),
    #[error("the target process exited during the capture; a partial minidump was written")]
    TargetVanished,
    #[error("failed to write the minidump")]
    Io(#[from] io::Error),
    #[error("failed to serialize a minidump stream")]
    Serialize(#[from] scroll::Error),
}

impl WriteError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            WriteError::TargetUnreachable(_) => "TargetUnreachable",
            WriteError::PermissionDenied(_) => "PermissionDenied",
            WriteError::TargetVanished => "TargetVanished",
            WriteError::Io(_) => "Io",
            WriteError::Serialize(_) => "Serialize",
        }
    }

    pub(crate) fn from_source(pid: u32, err: SourceError) -> WriteError {
        match err {
            SourceError::PermissionDenied => WriteError::PermissionDenied(pid),
            SourceError::Vanished => WriteError::TargetVanished,
            SourceError::NoSuchProcess | SourceError::ThreadGone(_) | SourceError::Io(_) => {
                WriteError::TargetUnreachable(pid)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_source_error_mapping() {
        let err = WriteError::from_source(42, SourceError::PermissionDenied);
        assert!(matches!(err, WriteError::PermissionDenied(42)));
        assert_eq!(err.name(), "PermissionDenied");

        let err = WriteError::from_source(42, SourceError::NoSuchProcess);
        assert!(matches!(err, WriteError::TargetUnreachable(42)));

        let err = WriteError::from_source(42, SourceError::Vanished);
        assert_eq!(err.name(), "TargetVanished");
    }
}
