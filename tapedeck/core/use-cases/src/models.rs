pub mod events {
    use ::domain::Phase;

    use crate::errors::DownloadError;
    use crate::errors::ErrorKind;
    use crate::utils::aliases::MaybeOwnedString;

    /// Raw event produced by a toolchain adapter while it runs.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum AdapterEvent {
        /// Percent of the phase most recently announced with `PhaseChanged`
        /// (fetching until told otherwise). Not clamped.
        DownloadProgress(u8),
        PhaseChanged(Phase),
        /// Title of the media being fetched, once it is known.
        TitleResolved(MaybeOwnedString),
        /// A file the run has started writing. Cleanup after a failed or
        /// cancelled run is limited to these and the destination.
        Writing(::std::path::PathBuf),
        LogLine(MaybeOwnedString),
        /// Always the last item of a stream that was not cancelled.
        Outcome(AdapterOutcome),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum AdapterOutcome {
        Succeeded(::std::path::PathBuf),
        Failed(ErrorKind, MaybeOwnedString),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProgressEvent {
        pub phase: Phase,
        pub percent: u8,
        pub raw_message: MaybeOwnedString,
    }

    /// Terminal result of one session. Set exactly once.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SessionOutcome {
        Completed(::std::path::PathBuf),
        Failed(DownloadError),
        Cancelled,
    }
}

pub mod descriptors {
    use ::domain::MediaFormat;
    use ::domain::Phase;

    pub type SessionId = ::uuid::Uuid;

    /// How the toolchain is driven for one [`MediaFormat`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ToolchainProfile {
        pub format: MediaFormat,
        /// Format selector handed to the fetch engine.
        pub selector: &'static str,
        /// Extension of the file the session produces.
        pub extension: &'static str,
        /// Phase entered after fetching.
        pub post_phase: Phase,
    }

    impl ToolchainProfile {
        pub fn resolve(format: MediaFormat) -> Self {
            match format {
                MediaFormat::VideoContainer => Self {
                    format,
                    selector: "bv*+ba/b",
                    extension: "mp4",
                    post_phase: Phase::Merging,
                },
                MediaFormat::AudioOnly => Self {
                    format,
                    selector: "ba/b",
                    extension: "mp3",
                    post_phase: Phase::Converting,
                },
            }
        }

        /// `destination` with this profile's extension.
        pub fn final_path(&self, destination: &::std::path::Path) -> ::std::path::PathBuf {
            destination.with_extension(self.extension)
        }
    }

}
