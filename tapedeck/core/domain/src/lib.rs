pub(crate) mod utils;

use crate::utils::aliases::MaybeOwnedPath;
use crate::utils::aliases::MaybeOwnedString;

/// What the user asked for. Immutable once a download starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: MaybeOwnedString,
    pub destination: MaybeOwnedPath,
    pub format: MediaFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    /// Best available video with audio, merged into one container when the
    /// source only offers separate streams.
    VideoContainer,
    /// Audio track only, converted to a standalone audio file.
    AudioOnly,
}

impl ::std::fmt::Display for MediaFormat {
    fn fmt(&self, formatter: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        match self {
            Self::VideoContainer => write!(formatter, "video"),
            Self::AudioOnly => write!(formatter, "audio"),
        }
    }
}

impl ::std::str::FromStr for MediaFormat {
    type Err = UnknownMediaFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "mp4" => Ok(Self::VideoContainer),
            "audio" | "mp3" => Ok(Self::AudioOnly),
            _ => Err(UnknownMediaFormat(value.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMediaFormat(pub String);

impl ::std::fmt::Display for UnknownMediaFormat {
    fn fmt(&self, formatter: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(formatter, "unknown media format `{}` (expected `video` or `audio`)", self.0)
    }
}

impl ::std::error::Error for UnknownMediaFormat {}

/// Named stage of a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Fetching,
    Merging,
    Converting,
    Done,
}

impl Phase {
    /// Position in the pipeline. Merging and converting are alternatives, so
    /// they share a rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Fetching => 0,
            Self::Merging | Self::Converting => 1,
            Self::Done => 2,
        }
    }
}

impl ::std::fmt::Display for Phase {
    fn fmt(&self, formatter: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        match self {
            Self::Fetching => write!(formatter, "fetching"),
            Self::Merging => write!(formatter, "merging"),
            Self::Converting => write!(formatter, "converting"),
            Self::Done => write!(formatter, "done"),
        }
    }
}
