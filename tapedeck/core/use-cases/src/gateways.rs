use ::async_trait::async_trait;

use crate::models::descriptors::ToolchainProfile;
use crate::models::events::AdapterEvent;
use crate::utils::aliases::BoxedStream;
use crate::utils::aliases::Fallible;
use crate::utils::aliases::MaybeOwnedString;

/// Fetch/merge/convert engine behind the orchestrator.
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    /// Starts one run. The returned stream ends with exactly one
    /// [`AdapterEvent::Outcome`] unless `cancellation` fires first, in which
    /// case the underlying work is stopped and the stream ends early.
    async fn run(
        self: ::std::sync::Arc<Self>, url: MaybeOwnedString, profile: ToolchainProfile,
        destination: ::std::path::PathBuf, cancellation: ::tokio_util::sync::CancellationToken,
    ) -> Fallible<BoxedStream<AdapterEvent>>;

    /// Removes what a failed or cancelled run left behind. `artifacts` holds the
    /// destination and every file the run announced with
    /// [`AdapterEvent::Writing`]; nothing else may be touched.
    async fn discard(self: ::std::sync::Arc<Self>, artifacts: &[::std::path::PathBuf]) -> Fallible<()> {
        for artifact in artifacts {
            match ::tokio::fs::remove_file(artifact).await {
                Ok(()) => {},
                Err(err) if err.kind() == ::std::io::ErrorKind::NotFound => {},
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Asks where the result should be saved. `None` means the user backed out.
#[async_trait]
pub trait DestinationSelector: Send + Sync {
    async fn select(
        self: ::std::sync::Arc<Self>, suggested: &::std::path::Path,
    ) -> Fallible<Option<::std::path::PathBuf>>;
}
