use crate::utils::aliases::MaybeOwnedString;

/// Failures a session observer can be told about.
///
/// Cancellation is absent: a cancelled session ends with
/// [`SessionOutcome::Cancelled`](crate::models::events::SessionOutcome::Cancelled)
/// and is reported as a status line.
#[derive(Debug, Clone, PartialEq, Eq, ::thiserror::Error)]
pub enum DownloadError {
    #[error("invalid request: {0}")]
    Validation(MaybeOwnedString),

    #[error("required tool is unavailable: {0}")]
    ToolchainMissing(MaybeOwnedString),

    #[error("could not fetch media: {0}")]
    Network(MaybeOwnedString),

    #[error("could not merge or convert media: {0}")]
    MergeConversion(MaybeOwnedString),

    #[error("could not write media: {0}")]
    Filesystem(MaybeOwnedString),

    #[error("another download is already running")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ToolchainMissing,
    Network,
    MergeConversion,
    Filesystem,
    Busy,
}

impl DownloadError {
    pub fn new<Message>(kind: ErrorKind, message: Message) -> Self
    where
        Message: Into<MaybeOwnedString>,
    {
        let message = message.into();

        match kind {
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::ToolchainMissing => Self::ToolchainMissing(message),
            ErrorKind::Network => Self::Network(message),
            ErrorKind::MergeConversion => Self::MergeConversion(message),
            ErrorKind::Filesystem => Self::Filesystem(message),
            ErrorKind::Busy => Self::Busy,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ToolchainMissing(_) => ErrorKind::ToolchainMissing,
            Self::Network(_) => ErrorKind::Network,
            Self::MergeConversion(_) => ErrorKind::MergeConversion,
            Self::Filesystem(_) => ErrorKind::Filesystem,
            Self::Busy => ErrorKind::Busy,
        }
    }
}
