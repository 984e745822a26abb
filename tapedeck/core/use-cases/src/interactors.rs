use ::async_trait::async_trait;
use ::domain::DownloadRequest;
use ::domain::Phase;
use ::futures_util::FutureExt as _;
use ::futures_util::StreamExt as _;
use ::tracing::Instrument as _;

use crate::boundaries::Accept;
use crate::boundaries::DownloadVideoRequestModel;
use crate::boundaries::SessionObserver;
use crate::errors::DownloadError;
use crate::gateways::DestinationSelector;
use crate::gateways::ToolchainAdapter;
use crate::models::descriptors::SessionId;
use crate::models::descriptors::ToolchainProfile;
use crate::models::events::AdapterEvent;
use crate::models::events::AdapterOutcome;
use crate::models::events::ProgressEvent;
use crate::models::events::SessionOutcome;
use crate::progress::ProgressNormalizer;
use crate::utils::aliases::BoxedStream;
use crate::utils::aliases::Fallible;
use crate::validation;

pub const CANCELLED_STATUS: &str = "Download cancelled";
pub const CANCELLED_BEFORE_START_STATUS: &str = "Download cancelled before it started";

/// How long a cancelled toolchain gets to wind down before it is abandoned.
const DRAIN_TIMEOUT: ::std::time::Duration = ::std::time::Duration::from_secs(5);

/// Runs at most one download at a time on a background task.
///
/// A second [`start`](Self::start) while a session is running is rejected with
/// [`DownloadError::Busy`]; it is never queued.
#[derive(::bon::Builder)]
pub struct DownloadOrchestrator {
    adapter: ::std::sync::Arc<dyn ToolchainAdapter>,

    #[builder(skip)]
    busy: ::std::sync::atomic::AtomicBool,
    #[builder(skip)]
    active: ::std::sync::Mutex<Option<::tokio_util::sync::CancellationToken>>,
}

impl DownloadOrchestrator {
    pub fn is_busy(&self) -> bool {
        self.busy.load(::std::sync::atomic::Ordering::Acquire)
    }

    /// Validates `request` and launches it without waiting for the download.
    ///
    /// A rejected request has already been reported to `observer` when this
    /// returns `Err`, and nothing was spawned.
    pub async fn start(
        self: ::std::sync::Arc<Self>, request: DownloadRequest, observer: ::std::sync::Arc<dyn SessionObserver>,
    ) -> Result<SessionHandle, DownloadError> {
        use ::std::sync::atomic::Ordering;

        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            ::tracing::warn!(url = %request.url, "rejecting download while another session is running");

            return Err(reject(observer, DownloadError::Busy).await);
        }

        if let Err(error) = validation::validate(&request) {
            self.busy.store(false, Ordering::Release);
            ::tracing::info!(url = %request.url, %error, "rejecting download request");

            return Err(reject(observer, error).await);
        }

        let id = SessionId::new_v4();
        let cancellation = ::tokio_util::sync::CancellationToken::new();
        *lock(&self.active) = Some(cancellation.clone());

        let profile = ToolchainProfile::resolve(request.format);
        let destination = profile.final_path(&request.destination);

        let span = ::tracing::info_span!("session", session = %id, format = %request.format);
        ::tracing::info!(parent: &span, url = %request.url, destination = %destination.display(), "starting download");

        let session = DownloadSession {
            adapter: ::std::sync::Arc::clone(&self.adapter),
            observer,
            request,
            profile,
            artifacts: vec![destination.clone()],
            destination,
            cancellation,
            normalizer: ProgressNormalizer::new(),
            phase: Phase::Fetching,
            launched: false,
        };

        let join = ::tokio::spawn(::std::sync::Arc::clone(&self).supervise(session).instrument(span));

        Ok(SessionHandle::new(id, join))
    }

    /// Asks the running session, if any, to stop. Safe to call from any thread
    /// and any number of times.
    pub fn cancel(&self) {
        if let Some(cancellation) = lock(&self.active).as_ref() {
            if !cancellation.is_cancelled() {
                ::tracing::info!("cancellation requested");
                cancellation.cancel();
            }
        }
    }

    async fn supervise(self: ::std::sync::Arc<Self>, mut session: DownloadSession) -> SessionOutcome {
        let outcome = match ::std::panic::AssertUnwindSafe(session.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&*panic);
                ::tracing::error!(%message, "download session panicked");

                SessionOutcome::Failed(session.interrupted(format!("internal failure: {}", message)))
            },
        };

        // `cancel` cannot reach this session past this point.
        let cancelled = lock(&self.active)
            .take()
            .is_some_and(|cancellation| cancellation.is_cancelled());

        let outcome = match outcome {
            SessionOutcome::Completed(_) if cancelled => SessionOutcome::Cancelled,
            outcome => outcome,
        };

        if !matches!(outcome, SessionOutcome::Completed(_)) && session.launched {
            session.discard().await;
        }

        // Released before the terminal notification so that a caller reacting
        // to it can start the next download straight away.
        self.busy.store(false, ::std::sync::atomic::Ordering::Release);

        session.conclude(&outcome).await;

        outcome
    }
}

/// Caller's grip on a launched session. Dropping it does not stop the download.
#[derive(Debug, ::derive_new::new)]
pub struct SessionHandle {
    id: SessionId,
    join: ::tokio::task::JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn wait(self) -> Fallible<SessionOutcome> {
        Ok(self.join.await?)
    }
}

struct DownloadSession {
    adapter: ::std::sync::Arc<dyn ToolchainAdapter>,
    observer: ::std::sync::Arc<dyn SessionObserver>,

    request: DownloadRequest,
    profile: ToolchainProfile,
    destination: ::std::path::PathBuf,
    cancellation: ::tokio_util::sync::CancellationToken,

    normalizer: ProgressNormalizer,
    phase: Phase,
    launched: bool,
    /// Files this session may remove if it does not complete.
    artifacts: Vec<::std::path::PathBuf>,
}

impl DownloadSession {
    /// Drives the adapter up to, but not including, the terminal notification.
    async fn execute(&mut self) -> SessionOutcome {
        if self.cancellation.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        let status = format!("Downloading {}", self.request.url);
        notify(::std::sync::Arc::clone(&self.observer).status(&status)).await;

        self.report(ProgressEvent { phase: Phase::Fetching, percent: 0, raw_message: "".into() }).await;

        if self.cancellation.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        self.launched = true;

        let run = ::std::sync::Arc::clone(&self.adapter).run(
            self.request.url.clone(),
            self.profile,
            self.destination.clone(),
            self.cancellation.clone(),
        );

        let events = ::tokio::select! {
            biased;

            _ = self.cancellation.cancelled() => None,
            events = run => Some(events),
        };

        let mut events = match events {
            None => return SessionOutcome::Cancelled,
            Some(Ok(events)) => events,
            Some(Err(error)) => {
                ::tracing::error!(error = %format!("{:#}", error), "toolchain could not be started");
                return SessionOutcome::Failed(self.unlaunched(&error));
            },
        };

        loop {
            let event = ::tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => None,
                event = events.next() => Some(event),
            };

            let Some(event) = event else {
                self.drain(events).await;
                return SessionOutcome::Cancelled;
            };

            let Some(event) = event else {
                return SessionOutcome::Failed(self.interrupted("the toolchain stopped without reporting a result"));
            };

            match event {
                AdapterEvent::DownloadProgress(percent) => {
                    let raw_message = format!("{} {}%", self.phase, percent).into();
                    self.report(ProgressEvent { phase: self.phase, percent, raw_message }).await;
                },

                AdapterEvent::PhaseChanged(phase @ (Phase::Merging | Phase::Converting))
                    if phase != self.profile.post_phase =>
                {
                    ::tracing::debug!(%phase, expected = %self.profile.post_phase, "ignoring foreign post-processing phase");
                },

                AdapterEvent::PhaseChanged(phase) => {
                    if phase.rank() >= self.phase.rank() {
                        self.phase = phase;
                    }

                    let raw_message = format!("entered {}", phase).into();
                    self.report(ProgressEvent { phase, percent: 0, raw_message }).await;
                },

                AdapterEvent::TitleResolved(title) => {
                    ::tracing::info!(%title, "resolved media title");

                    let status = format!("Downloading \"{}\"", title);
                    notify(::std::sync::Arc::clone(&self.observer).status(&status)).await;
                },

                AdapterEvent::Writing(path) => {
                    ::tracing::debug!(path = %path.display(), "toolchain is writing");
                    self.track(path);
                },

                AdapterEvent::LogLine(line) => {
                    ::tracing::debug!(%line, "toolchain");
                },

                AdapterEvent::Outcome(AdapterOutcome::Succeeded(path)) => {
                    self.track(path.clone());

                    if let Err(error) = verify_output(&path).await {
                        return SessionOutcome::Failed(error);
                    }

                    self.phase = Phase::Done;
                    self.report(ProgressEvent { phase: Phase::Done, percent: 100, raw_message: "done".into() })
                        .await;

                    return SessionOutcome::Completed(path);
                },

                AdapterEvent::Outcome(AdapterOutcome::Failed(kind, detail)) => {
                    return SessionOutcome::Failed(DownloadError::new(kind, detail));
                },
            }
        }
    }

    async fn report(&mut self, event: ProgressEvent) {
        ::tracing::debug!(phase = %event.phase, percent = event.percent, message = %event.raw_message, "progress");

        let update = self.normalizer.feed(&event);

        if let Some(status) = update.status {
            notify(::std::sync::Arc::clone(&self.observer).status(status)).await;
        }

        if let Some(percent) = update.percent {
            notify(::std::sync::Arc::clone(&self.observer).progress(percent)).await;
        }
    }

    /// Lets a cancelled adapter stop its subprocess before cleanup starts.
    async fn drain(&self, mut events: BoxedStream<AdapterEvent>) {
        let drained = ::tokio::time::timeout(DRAIN_TIMEOUT, async {
            while events.next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            ::tracing::warn!("toolchain did not stop within {:?} of cancellation", DRAIN_TIMEOUT);
        }
    }

    fn track(&mut self, path: ::std::path::PathBuf) {
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }

    async fn discard(&self) {
        if let Err(error) = ::std::sync::Arc::clone(&self.adapter).discard(&self.artifacts).await {
            ::tracing::warn!(error = %format!("{:#}", error), destination = %self.destination.display(), "could not remove partial output");
        }
    }

    async fn conclude(&self, outcome: &SessionOutcome) {
        let observer = ::std::sync::Arc::clone(&self.observer);

        match outcome {
            SessionOutcome::Completed(path) => {
                ::tracing::info!(path = %path.display(), "download completed");
                notify(observer.complete(path)).await;
            },
            SessionOutcome::Failed(error) => {
                ::tracing::warn!(%error, "download failed");
                notify(observer.error(error)).await;
            },
            SessionOutcome::Cancelled => {
                ::tracing::info!("download cancelled");
                notify(observer.status(CANCELLED_STATUS)).await;
            },
        }
    }

    /// Failure of a session that stopped without a classified outcome.
    fn interrupted<Detail>(&self, detail: Detail) -> DownloadError
    where
        Detail: Into<String>,
    {
        let detail = detail.into();

        match self.phase {
            Phase::Fetching => DownloadError::Network(detail.into()),
            Phase::Merging | Phase::Converting | Phase::Done => DownloadError::MergeConversion(detail.into()),
        }
    }

    fn unlaunched(&self, error: &::anyhow::Error) -> DownloadError {
        let detail = format!("{:#}", error);

        match error.downcast_ref::<::std::io::Error>().map(::std::io::Error::kind) {
            Some(::std::io::ErrorKind::NotFound) => DownloadError::ToolchainMissing(detail.into()),
            Some(::std::io::ErrorKind::PermissionDenied) => DownloadError::Filesystem(detail.into()),
            _ => self.interrupted(detail),
        }
    }
}

/// Downloads one video, asking a [`DestinationSelector`] where to put it, and
/// waits for the session to end.
#[derive(::bon::Builder)]
pub struct DownloadVideoInteractor {
    observer: ::std::sync::Arc<dyn SessionObserver>,
    selector: ::std::sync::Arc<dyn DestinationSelector>,
    orchestrator: ::std::sync::Arc<DownloadOrchestrator>,
}

#[async_trait]
impl Accept<DownloadVideoRequestModel> for DownloadVideoInteractor {
    type Response = SessionOutcome;

    async fn accept(self: ::std::sync::Arc<Self>, request: DownloadVideoRequestModel) -> Fallible<SessionOutcome> {
        let destination = ::std::sync::Arc::clone(&self.selector)
            .select(&request.suggested_destination)
            .await?;

        let Some(destination) = destination else {
            ::tracing::info!(url = %request.url, "destination selection was cancelled");
            notify(::std::sync::Arc::clone(&self.observer).status(CANCELLED_BEFORE_START_STATUS)).await;

            return Ok(SessionOutcome::Cancelled);
        };

        let request = DownloadRequest {
            url: request.url.into(),
            destination: destination.into(),
            format: request.format,
        };

        match ::std::sync::Arc::clone(&self.orchestrator)
            .start(request, ::std::sync::Arc::clone(&self.observer))
            .await
        {
            Ok(session) => {
                ::tracing::debug!(session = %session.id(), "waiting for the download");
                session.wait().await
            },
            Err(error) => Ok(SessionOutcome::Failed(error)),
        }
    }
}

async fn verify_output(path: &::std::path::Path) -> Result<(), DownloadError> {
    match ::tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(()),
        Ok(_) => Err(DownloadError::Filesystem(format!("`{}` is empty", path.display()).into())),
        Err(err) => Err(DownloadError::Filesystem(format!("`{}` is missing: {}", path.display(), err).into())),
    }
}

async fn notify<Delivery>(delivery: Delivery)
where
    Delivery: ::std::future::Future<Output = Fallible<()>>,
{
    if let Err(error) = delivery.await {
        ::tracing::warn!(error = %format!("{:#}", error), "session observer failed");
    }
}

async fn reject(observer: ::std::sync::Arc<dyn SessionObserver>, error: DownloadError) -> DownloadError {
    notify(observer.error(&error)).await;

    error
}

fn lock<T>(mutex: &::std::sync::Mutex<T>) -> ::std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(::std::sync::PoisonError::into_inner)
}

fn panic_message(panic: &(dyn ::std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use ::domain::MediaFormat;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::utils::aliases::MaybeOwnedString;

    #[derive(Debug, Clone, PartialEq)]
    enum Notification {
        Status(String),
        Progress(u8),
        Error(DownloadError),
        Complete(::std::path::PathBuf),
    }

    #[derive(Default)]
    struct RecordingObserver {
        notifications: ::std::sync::Mutex<Vec<Notification>>,
        progressed: ::tokio::sync::Notify,
    }

    impl RecordingObserver {
        fn notifications(&self) -> Vec<Notification> {
            self.notifications.lock().unwrap().clone()
        }

        fn record(&self, notification: Notification) {
            self.notifications.lock().unwrap().push(notification);
        }

        fn percents(&self) -> Vec<u8> {
            self.notifications()
                .into_iter()
                .filter_map(|notification| match notification {
                    Notification::Progress(percent) => Some(percent),
                    _ => None,
                })
                .collect()
        }

        fn statuses(&self) -> Vec<String> {
            self.notifications()
                .into_iter()
                .filter_map(|notification| match notification {
                    Notification::Status(status) => Some(status),
                    _ => None,
                })
                .collect()
        }

        fn terminals(&self) -> Vec<Notification> {
            self.notifications()
                .into_iter()
                .filter(|notification| {
                    matches!(notification, Notification::Error(_) | Notification::Complete(_))
                        || *notification == Notification::Status(CANCELLED_STATUS.to_owned())
                })
                .collect()
        }
    }

    #[async_trait]
    impl SessionObserver for RecordingObserver {
        async fn status(self: ::std::sync::Arc<Self>, message: &str) -> Fallible<()> {
            self.record(Notification::Status(message.to_owned()));
            Ok(())
        }

        async fn progress(self: ::std::sync::Arc<Self>, percent: u8) -> Fallible<()> {
            self.record(Notification::Progress(percent));
            self.progressed.notify_one();
            Ok(())
        }

        async fn error(self: ::std::sync::Arc<Self>, error: &DownloadError) -> Fallible<()> {
            self.record(Notification::Error(error.clone()));
            Ok(())
        }

        async fn complete(self: ::std::sync::Arc<Self>, path: &::std::path::Path) -> Fallible<()> {
            self.record(Notification::Complete(path.to_path_buf()));
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Emit(AdapterEvent),
        Write(&'static [u8]),
        WriteAt(::std::path::PathBuf, &'static [u8]),
        Succeed,
        Hang,
        Panic,
    }

    #[derive(Default)]
    struct ScriptedToolchain {
        scripts: ::std::sync::Mutex<::std::collections::VecDeque<Vec<Step>>>,
        destinations: ::std::sync::Mutex<Vec<::std::path::PathBuf>>,
    }

    impl ScriptedToolchain {
        fn new<Scripts>(scripts: Scripts) -> ::std::sync::Arc<Self>
        where
            Scripts: IntoIterator<Item = Vec<Step>>,
        {
            ::std::sync::Arc::new(Self {
                scripts: ::std::sync::Mutex::new(scripts.into_iter().collect()),
                destinations: Default::default(),
            })
        }

        fn destinations(&self) -> Vec<::std::path::PathBuf> {
            self.destinations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolchainAdapter for ScriptedToolchain {
        async fn run(
            self: ::std::sync::Arc<Self>, _: MaybeOwnedString, _: ToolchainProfile,
            destination: ::std::path::PathBuf, cancellation: ::tokio_util::sync::CancellationToken,
        ) -> Fallible<BoxedStream<AdapterEvent>> {
            self.destinations.lock().unwrap().push(destination.clone());
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

            Ok(::std::boxed::Box::pin(::async_stream::stream! {
                for step in script {
                    match step {
                        Step::Emit(event) => {
                            yield event;
                        },
                        Step::Write(bytes) => {
                            ::tokio::fs::write(&destination, bytes).await.unwrap();
                        },
                        Step::WriteAt(path, bytes) => {
                            ::tokio::fs::write(&path, bytes).await.unwrap();
                        },
                        Step::Succeed => {
                            yield AdapterEvent::Outcome(AdapterOutcome::Succeeded(destination.clone()));
                        },
                        Step::Hang => {
                            cancellation.cancelled().await;
                            return;
                        },
                        Step::Panic => panic!("toolchain exploded"),
                    }
                }
            }))
        }
    }

    fn orchestrator(toolchain: &::std::sync::Arc<ScriptedToolchain>) -> ::std::sync::Arc<DownloadOrchestrator> {
        ::std::sync::Arc::new(
            DownloadOrchestrator::builder()
                .adapter(::std::sync::Arc::clone(toolchain) as ::std::sync::Arc<dyn ToolchainAdapter>)
                .build(),
        )
    }

    fn request(url: &str, destination: ::std::path::PathBuf, format: MediaFormat) -> DownloadRequest {
        DownloadRequest { url: url.to_owned().into(), destination: destination.into(), format }
    }

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    async fn until<Predicate>(observer: &RecordingObserver, predicate: Predicate)
    where
        Predicate: Fn(&[Notification]) -> bool,
    {
        ::tokio::time::timeout(::std::time::Duration::from_secs(5), async {
            while !predicate(&observer.notifications()) {
                ::tokio::time::sleep(::std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn has_finished_normally(observer: &RecordingObserver) -> bool {
        observer
            .notifications()
            .iter()
            .any(|notification| matches!(notification, Notification::Error(_) | Notification::Complete(_)))
    }

    fn assert_well_formed(observer: &RecordingObserver) {
        let notifications = observer.notifications();

        assert!(matches!(notifications.first(), Some(Notification::Status(_))), "{notifications:?}");

        let percents = observer.percents();
        assert!(percents.iter().all(|&percent| percent <= 100), "{percents:?}");
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]), "{percents:?}");

        let terminals = observer.terminals();
        assert_eq!(terminals.len(), 1, "{notifications:?}");
        assert_eq!(notifications.last(), terminals.last());
    }

    #[tokio::test]
    async fn empty_url_fails_before_anything_is_spawned() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let result = orchestrator(&toolchain)
            .start(
                request("", directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await;

        assert!(matches!(result, Err(DownloadError::Validation(_))));
        assert!(matches!(observer.notifications().as_slice(), [Notification::Error(DownloadError::Validation(_))]));
        assert!(toolchain.destinations().is_empty());
    }

    #[tokio::test]
    async fn video_session_fetches_merges_and_completes() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(0)),
            Step::Emit(AdapterEvent::DownloadProgress(40)),
            Step::Emit(AdapterEvent::DownloadProgress(100)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Merging)),
            Step::Emit(AdapterEvent::LogLine("[Merger] Merging formats".into())),
            Step::Write(b"merged media"),
            Step::Emit(AdapterEvent::DownloadProgress(100)),
            Step::Succeed,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        let expected = directory.path().join("clip.mp4");

        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Completed(expected.clone()));
        assert_well_formed(&observer);
        assert_eq!(observer.notifications().last(), Some(&Notification::Complete(expected.clone())));
        assert!(::std::fs::metadata(&expected).unwrap().len() > 0);
        assert!(observer.statuses().iter().any(|status| status == "Merging audio and video..."));
        assert_eq!(observer.percents().last(), Some(&100));
    }

    #[tokio::test]
    async fn audio_session_converts_into_an_audio_file() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(100)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Merging)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Converting)),
            Step::Write(b"ID3"),
            Step::Succeed,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("song.webm"), MediaFormat::AudioOnly),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        let SessionOutcome::Completed(path) = session.wait().await.unwrap() else {
            panic!("expected completion: {:?}", observer.notifications());
        };

        assert_eq!(path.extension().and_then(|extension| extension.to_str()), Some("mp3"));
        assert_eq!(toolchain.destinations(), vec![directory.path().join("song.mp3")]);
        assert!(observer.statuses().iter().any(|status| status == "Converting to audio..."));
        assert!(!observer.statuses().iter().any(|status| status == "Merging audio and video..."));
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn resolved_title_is_announced() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::TitleResolved("Never Gonna Give You Up".into())),
            Step::Write(b"media"),
            Step::Succeed,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        session.wait().await.unwrap();

        assert!(observer.statuses().contains(&"Downloading \"Never Gonna Give You Up\"".to_owned()));
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn progress_stays_monotonic_across_phase_resets() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(80)),
            Step::Emit(AdapterEvent::DownloadProgress(105)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Merging)),
            Step::Emit(AdapterEvent::DownloadProgress(0)),
            Step::Emit(AdapterEvent::DownloadProgress(30)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Fetching)),
            Step::Emit(AdapterEvent::DownloadProgress(10)),
            Step::Write(b"media"),
            Step::Succeed,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        session.wait().await.unwrap();

        assert_eq!(observer.percents(), vec![0, 56, 70, 79, 100]);
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn cancel_before_any_progress_reports_cancellation_once() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![Step::Hang]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let orchestrator = orchestrator(&toolchain);

        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        orchestrator.cancel();
        orchestrator.cancel();

        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert_eq!(observer.notifications(), vec![Notification::Status(CANCELLED_STATUS.to_owned())]);
        assert!(toolchain.destinations().is_empty());

        orchestrator.cancel();
        assert_eq!(observer.notifications().len(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_download_removes_the_partial_file() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(10)),
            Step::Write(b"partial"),
            Step::Hang,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let orchestrator = orchestrator(&toolchain);
        let destination = directory.path().join("clip.mp4");

        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, destination.clone(), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        observer.progressed.notified().await;
        orchestrator.cancel();

        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert!(!destination.exists());
        assert_well_formed(&observer);
        assert!(!observer
            .notifications()
            .iter()
            .any(|notification| matches!(notification, Notification::Error(_) | Notification::Complete(_))));
    }

    #[tokio::test]
    async fn cancel_while_merging_removes_the_output() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(100)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Merging)),
            Step::Write(b"half merged"),
            Step::Hang,
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let orchestrator = orchestrator(&toolchain);
        let destination = directory.path().join("clip.mp4");

        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, destination.clone(), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        until(&observer, |notifications| {
            notifications.contains(&Notification::Status("Merging audio and video...".to_owned()))
        })
        .await;
        until(&observer, |_| destination.exists()).await;

        orchestrator.cancel();

        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert!(!destination.exists());
        assert!(!has_finished_normally(&observer));
        assert_eq!(
            observer.statuses().iter().filter(|status| *status == CANCELLED_STATUS).count(),
            1,
        );
        assert_well_formed(&observer);
    }

    /// Cancels the orchestrator as soon as the bar reaches 100%, which happens
    /// after the toolchain succeeded but before the session concluded.
    struct CancelAtFull {
        recording: ::std::sync::Arc<RecordingObserver>,
        orchestrator: ::std::sync::OnceLock<::std::sync::Arc<DownloadOrchestrator>>,
    }

    #[async_trait]
    impl SessionObserver for CancelAtFull {
        async fn status(self: ::std::sync::Arc<Self>, message: &str) -> Fallible<()> {
            ::std::sync::Arc::clone(&self.recording).status(message).await
        }

        async fn progress(self: ::std::sync::Arc<Self>, percent: u8) -> Fallible<()> {
            if percent == 100 {
                if let Some(orchestrator) = self.orchestrator.get() {
                    orchestrator.cancel();
                }
            }

            ::std::sync::Arc::clone(&self.recording).progress(percent).await
        }

        async fn error(self: ::std::sync::Arc<Self>, error: &DownloadError) -> Fallible<()> {
            ::std::sync::Arc::clone(&self.recording).error(error).await
        }

        async fn complete(self: ::std::sync::Arc<Self>, path: &::std::path::Path) -> Fallible<()> {
            ::std::sync::Arc::clone(&self.recording).complete(path).await
        }
    }

    #[tokio::test]
    async fn cancel_after_success_but_before_completion_wins() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![Step::Write(b"media"), Step::Succeed]]);
        let orchestrator = orchestrator(&toolchain);
        let destination = directory.path().join("clip.mp4");

        let recording = ::std::sync::Arc::new(RecordingObserver::default());
        let observer = ::std::sync::Arc::new(CancelAtFull {
            recording: ::std::sync::Arc::clone(&recording),
            orchestrator: ::std::sync::OnceLock::new(),
        });
        observer.orchestrator.set(::std::sync::Arc::clone(&orchestrator)).ok().unwrap();

        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(request(URL, destination.clone(), MediaFormat::VideoContainer), observer as _)
            .await
            .unwrap();

        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert!(!destination.exists());
        assert!(!has_finished_normally(&recording));
        assert_eq!(recording.notifications().last(), Some(&Notification::Status(CANCELLED_STATUS.to_owned())));
        assert_well_formed(&recording);
    }

    #[tokio::test]
    async fn failure_removes_announced_files_and_nothing_else() {
        let directory = ::tempfile::tempdir().unwrap();
        let fetched = directory.path().join("song.webm");
        let bystander = directory.path().join("song.flac");
        ::std::fs::write(&bystander, "lossless").unwrap();

        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::Writing(fetched.clone())),
            Step::WriteAt(fetched.clone(), b"partial"),
            Step::Emit(AdapterEvent::Outcome(AdapterOutcome::Failed(ErrorKind::Network, "HTTP Error 404".into()))),
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("song.mp3"), MediaFormat::AudioOnly),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        assert!(matches!(session.wait().await.unwrap(), SessionOutcome::Failed(DownloadError::Network(_))));
        assert!(!fetched.exists());
        assert!(bystander.exists());
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn second_start_while_running_is_busy_and_later_starts_are_accepted() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([
            vec![Step::Hang],
            vec![Step::Write(b"media"), Step::Succeed],
        ]);
        let orchestrator = orchestrator(&toolchain);

        let first = ::std::sync::Arc::new(RecordingObserver::default());
        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, directory.path().join("one.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&first) as _,
            )
            .await
            .unwrap();

        let second = ::std::sync::Arc::new(RecordingObserver::default());
        let rejected = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, directory.path().join("two.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&second) as _,
            )
            .await;

        assert_eq!(rejected.unwrap_err(), DownloadError::Busy);
        assert_eq!(second.notifications(), vec![Notification::Error(DownloadError::Busy)]);
        assert!(orchestrator.is_busy());

        orchestrator.cancel();
        assert_eq!(session.wait().await.unwrap(), SessionOutcome::Cancelled);
        assert!(!orchestrator.is_busy());

        let third = ::std::sync::Arc::new(RecordingObserver::default());
        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, directory.path().join("three.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&third) as _,
            )
            .await
            .unwrap();

        assert_eq!(
            session.wait().await.unwrap(),
            SessionOutcome::Completed(directory.path().join("three.mp4")),
        );
        assert_well_formed(&third);
    }

    #[tokio::test]
    async fn classified_failure_is_reported_and_partial_output_removed() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Write(b"partial"),
            Step::Emit(AdapterEvent::DownloadProgress(30)),
            Step::Emit(AdapterEvent::Outcome(AdapterOutcome::Failed(
                ErrorKind::Network,
                "Video unavailable".into(),
            ))),
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let destination = directory.path().join("clip.mp4");

        let session = orchestrator(&toolchain)
            .start(
                request(URL, destination.clone(), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        assert_eq!(
            session.wait().await.unwrap(),
            SessionOutcome::Failed(DownloadError::Network("Video unavailable".into())),
        );
        assert!(!destination.exists());
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn stream_without_outcome_is_a_failure() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![
            Step::Emit(AdapterEvent::DownloadProgress(100)),
            Step::Emit(AdapterEvent::PhaseChanged(Phase::Merging)),
        ]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        let SessionOutcome::Failed(error) = session.wait().await.unwrap() else {
            panic!("expected failure: {:?}", observer.notifications());
        };

        assert_eq!(error.kind(), ErrorKind::MergeConversion);
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn success_without_an_output_file_is_a_filesystem_failure() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![Step::Succeed]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let session = orchestrator(&toolchain)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        let SessionOutcome::Failed(error) = session.wait().await.unwrap() else {
            panic!("expected failure: {:?}", observer.notifications());
        };

        assert_eq!(error.kind(), ErrorKind::Filesystem);
        assert_well_formed(&observer);
    }

    #[tokio::test]
    async fn panicking_toolchain_is_contained_in_the_session() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![Step::Emit(AdapterEvent::DownloadProgress(5)), Step::Panic]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let orchestrator = orchestrator(&toolchain);

        let session = ::std::sync::Arc::clone(&orchestrator)
            .start(
                request(URL, directory.path().join("clip.mp4"), MediaFormat::VideoContainer),
                ::std::sync::Arc::clone(&observer) as _,
            )
            .await
            .unwrap();

        let SessionOutcome::Failed(error) = session.wait().await.unwrap() else {
            panic!("expected failure: {:?}", observer.notifications());
        };

        assert_eq!(error.kind(), ErrorKind::Network);
        assert!(!orchestrator.is_busy());
        assert_well_formed(&observer);
    }

    struct Answer(Option<::std::path::PathBuf>);

    #[async_trait]
    impl DestinationSelector for Answer {
        async fn select(
            self: ::std::sync::Arc<Self>, _: &::std::path::Path,
        ) -> Fallible<Option<::std::path::PathBuf>> {
            Ok(self.0.clone())
        }
    }

    fn interactor(
        toolchain: &::std::sync::Arc<ScriptedToolchain>, observer: &::std::sync::Arc<RecordingObserver>,
        answer: Option<::std::path::PathBuf>,
    ) -> ::std::sync::Arc<DownloadVideoInteractor> {
        ::std::sync::Arc::new(
            DownloadVideoInteractor::builder()
                .observer(::std::sync::Arc::clone(observer) as ::std::sync::Arc<dyn SessionObserver>)
                .selector(::std::sync::Arc::new(Answer(answer)) as ::std::sync::Arc<dyn DestinationSelector>)
                .orchestrator(orchestrator(toolchain))
                .build(),
        )
    }

    #[tokio::test]
    async fn backing_out_of_destination_selection_is_not_an_error() {
        let toolchain = ScriptedToolchain::new([]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());

        let outcome = interactor(&toolchain, &observer, None)
            .accept(
                DownloadVideoRequestModel::builder()
                    .url(URL)
                    .format(MediaFormat::VideoContainer)
                    .suggested_destination("clip.mp4")
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(observer.notifications(), vec![Notification::Status(CANCELLED_BEFORE_START_STATUS.to_owned())]);
        assert!(toolchain.destinations().is_empty());
    }

    #[tokio::test]
    async fn interactor_downloads_to_the_selected_destination() {
        let directory = ::tempfile::tempdir().unwrap();
        let toolchain = ScriptedToolchain::new([vec![Step::Write(b"media"), Step::Succeed]]);
        let observer = ::std::sync::Arc::new(RecordingObserver::default());
        let chosen = directory.path().join("chosen.mp4");

        let outcome = interactor(&toolchain, &observer, Some(chosen.clone()))
            .accept(
                DownloadVideoRequestModel::builder()
                    .url(URL)
                    .format(MediaFormat::VideoContainer)
                    .suggested_destination(directory.path().join("suggested.mp4"))
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Completed(chosen));
        assert_well_formed(&observer);
    }
}
