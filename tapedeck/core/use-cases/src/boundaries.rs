use ::async_trait::async_trait;
use ::domain::MediaFormat;

use crate::errors::DownloadError;
use crate::utils::aliases::Fallible;

#[async_trait]
pub trait Accept<Request>: Send + Sync {
    type Response;

    async fn accept(self: ::std::sync::Arc<Self>, request: Request) -> Fallible<Self::Response>;
}

/// Notification surface of a download session.
///
/// Calls for one session never overlap and arrive as
/// `status -> progress* -> (error | complete)`, or end with a single
/// cancellation status.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn status(self: ::std::sync::Arc<Self>, message: &str) -> Fallible<()>;
    async fn progress(self: ::std::sync::Arc<Self>, percent: u8) -> Fallible<()>;
    async fn error(self: ::std::sync::Arc<Self>, error: &DownloadError) -> Fallible<()>;
    async fn complete(self: ::std::sync::Arc<Self>, path: &::std::path::Path) -> Fallible<()>;
}

#[derive(Debug, Clone, ::bon::Builder)]
#[builder(on(_, into))]
pub struct DownloadVideoRequestModel {
    pub url: String,
    pub format: MediaFormat,
    pub suggested_destination: ::std::path::PathBuf,
}
