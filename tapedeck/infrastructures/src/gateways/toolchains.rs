use ::async_trait::async_trait;
use ::domain::MediaFormat;
use ::domain::Phase;
use ::futures_util::StreamExt as _;
use ::use_cases::errors::ErrorKind;
use ::use_cases::gateways::ToolchainAdapter;
use ::use_cases::models::descriptors::ToolchainProfile;
use ::use_cases::models::events::AdapterEvent;
use ::use_cases::models::events::AdapterOutcome;

use crate::utils::aliases::BoxedStream;
use crate::utils::aliases::Fallible;
use crate::utils::aliases::MaybeOwnedString;
use crate::utils::extensions::OptionExt;

/// Drives `yt-dlp`, which in turn drives `ffmpeg` for merging and audio
/// extraction.
#[derive(Debug, ::bon::Builder)]
#[builder(on(_, into))]
pub struct YtdlpToolchain {
    #[builder(default = ::std::path::PathBuf::from("yt-dlp"))]
    fetch_program: ::std::path::PathBuf,
    #[builder(default = ::std::path::PathBuf::from("ffmpeg"))]
    merge_program: ::std::path::PathBuf,
}

#[async_trait]
impl ToolchainAdapter for YtdlpToolchain {
    async fn run(
        self: ::std::sync::Arc<Self>, url: MaybeOwnedString, profile: ToolchainProfile,
        destination: ::std::path::PathBuf, cancellation: ::tokio_util::sync::CancellationToken,
    ) -> Fallible<BoxedStream<AdapterEvent>> {
        if let Err(outcome) = self.preflight().await {
            return Ok(conclusion(outcome));
        }

        if cancellation.is_cancelled() {
            return Ok(::std::boxed::Box::pin(::futures_util::stream::empty()));
        }

        let arguments = self.arguments(&url, profile, &destination)?;
        ::tracing::debug!(program = %self.fetch_program.display(), ?arguments, "spawning fetch engine");

        let mut command = ::tokio::process::Command::new(&self.fetch_program);
        command
            .args(&arguments)
            .stdin(::std::process::Stdio::null())
            .stdout(::std::process::Stdio::piped())
            .stderr(::std::process::Stdio::piped())
            .kill_on_drop(true);

        // Lets cancellation reach the ffmpeg processes yt-dlp starts.
        #[cfg(unix)]
        command.process_group(0);

        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => return Ok(conclusion(unavailable(&self.fetch_program, &err))),
        };

        let stdout = child.stdout.take().ok()?;
        let stderr = child.stderr.take().ok()?;

        Ok(::std::boxed::Box::pin(::async_stream::stream! {
            use ::tokio::io::AsyncBufReadExt as _;

            let mut stdout = ::tokio_stream::wrappers::LinesStream::new(::tokio::io::BufReader::new(stdout).lines());
            let mut stderr = ::tokio_stream::wrappers::LinesStream::new(::tokio::io::BufReader::new(stderr).lines());
            let (mut stdout_open, mut stderr_open) = (true, true);

            let mut transcript = YtdlpTranscript::new();

            while stdout_open || stderr_open {
                let next = ::tokio::select! {
                    biased;

                    _ = cancellation.cancelled() => Next::Cancelled,
                    line = stdout.next(), if stdout_open => Next::Stdout(line),
                    line = stderr.next(), if stderr_open => Next::Stderr(line),
                };

                let line = match next {
                    Next::Cancelled => {
                        terminate(&mut child).await;
                        return;
                    },
                    Next::Stdout(Some(Ok(line))) | Next::Stderr(Some(Ok(line))) => line,
                    Next::Stdout(closed) => {
                        if let Some(Err(err)) = closed {
                            ::tracing::warn!(%err, "could not read fetch engine stdout");
                        }
                        stdout_open = false;
                        continue;
                    },
                    Next::Stderr(closed) => {
                        if let Some(Err(err)) = closed {
                            ::tracing::warn!(%err, "could not read fetch engine stderr");
                        }
                        stderr_open = false;
                        continue;
                    },
                };

                for event in transcript.observe(&line) {
                    yield event;
                }
            }

            let status = ::tokio::select! {
                biased;

                _ = cancellation.cancelled() => None,
                status = child.wait() => Some(status),
            };

            let outcome = match status {
                None => {
                    terminate(&mut child).await;
                    return;
                },
                Some(Ok(status)) => transcript.finish(status, &destination).await,
                Some(Err(err)) => {
                    let detail = format!("could not wait for the fetch engine: {}", err);
                    AdapterOutcome::Failed(transcript.classify(&detail), detail.into())
                },
            };

            ::tracing::debug!(?outcome, "fetch engine finished");
            yield AdapterEvent::Outcome(outcome);
        }))
    }

    /// Removes each artifact together with the intermediates yt-dlp derives
    /// from its name (`.part`, `.ytdl`, `.part-FragN`, `.temp.<ext>`).
    async fn discard(self: ::std::sync::Arc<Self>, artifacts: &[::std::path::PathBuf]) -> Fallible<()> {
        for artifact in artifacts {
            for leftover in leftovers(artifact).await? {
                match ::tokio::fs::remove_file(&leftover).await {
                    Ok(()) => ::tracing::debug!(path = %leftover.display(), "removed partial output"),
                    Err(err) if err.kind() == ::std::io::ErrorKind::NotFound => {},
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }
}

impl YtdlpToolchain {
    async fn preflight(&self) -> Result<(), AdapterOutcome> {
        for (program, flag) in [(&self.fetch_program, "--version"), (&self.merge_program, "-version")] {
            let checked = ::tokio::process::Command::new(program)
                .arg(flag)
                .stdin(::std::process::Stdio::null())
                .stdout(::std::process::Stdio::null())
                .stderr(::std::process::Stdio::null())
                .kill_on_drop(true)
                .status()
                .await;

            match checked {
                Ok(status) if status.success() => {},
                Ok(status) => {
                    return Err(AdapterOutcome::Failed(
                        ErrorKind::ToolchainMissing,
                        format!("`{} {}` failed with {}", program.display(), flag, status).into(),
                    ))
                },
                Err(err) => return Err(unavailable(program, &err)),
            }
        }

        ::tracing::debug!("toolchain is available");

        Ok(())
    }

    fn arguments(
        &self, url: &str, profile: ToolchainProfile, destination: &::std::path::Path,
    ) -> Fallible<Vec<::std::ffi::OsString>> {
        let output = output_template(destination)?;

        #[rustfmt::skip]
        let mut arguments = [
            "--no-playlist",
            "--no-simulate",
            "--newline",
            "--quiet",
            "--progress",
            "--color", "no_color",
            "--force-overwrites",
            "--format", profile.selector,
            "--output", output.as_str(),
            "--print", "before_dl:[fetch-started]%(format_id)s;%(title)s",
            "--progress-template", "download:[fetch-progress]%(progress.downloaded_bytes)s;%(progress.total_bytes)s;%(progress.total_bytes_estimate)s;%(progress.filename)s",
            "--progress-template", "postprocess:[postprocess]%(progress.status)s;%(progress.postprocessor)s",
            "--print", "after_move:[fetch-completed]%(filepath)s",
        ]
        .map(::std::ffi::OsString::from)
        .to_vec();

        match profile.format {
            // `--remux-video` covers the single-file fallback of the selector.
            MediaFormat::VideoContainer => arguments.extend(
                ["--merge-output-format", profile.extension, "--remux-video", profile.extension]
                    .map(::std::ffi::OsString::from),
            ),
            MediaFormat::AudioOnly => arguments
                .extend(["--extract-audio", "--audio-format", profile.extension].map(::std::ffi::OsString::from)),
        }

        // A bare program name is left to yt-dlp's own PATH lookup.
        if self.merge_program.parent().is_some_and(|parent| !parent.as_os_str().is_empty()) {
            arguments.push("--ffmpeg-location".into());
            arguments.push(self.merge_program.clone().into_os_string());
        }

        arguments.push("--".into());
        arguments.push(url.into());

        Ok(arguments)
    }
}

enum Next {
    Cancelled,
    Stdout(Option<::std::io::Result<String>>),
    Stderr(Option<::std::io::Result<String>>),
}

/// Stops the fetch engine with everything it started, then reaps it.
async fn terminate(child: &mut ::tokio::process::Child) {
    if let Some(id) = child.id() {
        stop_process_tree(id).await;
    }

    if let Err(err) = child.start_kill() {
        ::tracing::debug!(%err, "fetch engine was already gone");
    }

    match child.wait().await {
        Ok(status) => ::tracing::info!(%status, "fetch engine stopped after cancellation"),
        Err(err) => ::tracing::warn!(%err, "could not reap fetch engine"),
    }
}

#[cfg(unix)]
async fn stop_process_tree(id: u32) {
    let Ok(group) = ::libc::pid_t::try_from(id) else {
        return;
    };

    // SAFETY: `kill` takes plain integers and touches no memory of ours.
    if unsafe { ::libc::kill(-group, ::libc::SIGKILL) } != 0 {
        ::tracing::warn!(err = %::std::io::Error::last_os_error(), "could not stop the fetch engine's process group");
    }
}

#[cfg(windows)]
async fn stop_process_tree(id: u32) {
    let stopped = ::tokio::process::Command::new("taskkill")
        .args(["/PID", &id.to_string(), "/T", "/F"])
        .stdin(::std::process::Stdio::null())
        .stdout(::std::process::Stdio::null())
        .stderr(::std::process::Stdio::null())
        .status()
        .await;

    if let Err(err) = stopped {
        ::tracing::warn!(%err, "could not stop the fetch engine's process tree");
    }
}

#[cfg(not(any(unix, windows)))]
async fn stop_process_tree(_: u32) {}

fn conclusion(outcome: AdapterOutcome) -> BoxedStream<AdapterEvent> {
    ::std::boxed::Box::pin(::futures_util::stream::iter([AdapterEvent::Outcome(outcome)]))
}

fn unavailable(program: &::std::path::Path, err: &::std::io::Error) -> AdapterOutcome {
    let detail = match err.kind() {
        ::std::io::ErrorKind::NotFound => format!("`{}` was not found", program.display()),
        _ => format!("`{}` could not be started: {}", program.display(), err),
    };

    AdapterOutcome::Failed(ErrorKind::ToolchainMissing, detail.into())
}

/// `destination` without its extension, as a yt-dlp output template.
fn output_template(destination: &::std::path::Path) -> Fallible<String> {
    let stem = destination.with_extension("");
    let stem = stem.to_str().ok()?;

    Ok(format!("{}.%(ext)s", stem.replace('%', "%%")))
}

static MISSING_TOOL: ::once_cell::sync::Lazy<::regex::Regex> = ::once_cell::sync::Lazy::new(|| {
    ::regex::Regex::new(r"(?i)\b(?:ffmpeg|ffprobe)\b.*\bnot (?:found|installed)\b").unwrap()
});

static FILESYSTEM_FAILURE: ::once_cell::sync::Lazy<::regex::Regex> = ::once_cell::sync::Lazy::new(|| {
    ::regex::Regex::new(r"(?i)no space left|permission denied|read-only file system|disk quota exceeded").unwrap()
});

static POSTPROCESSING_FAILURE: ::once_cell::sync::Lazy<::regex::Regex> = ::once_cell::sync::Lazy::new(|| {
    ::regex::Regex::new(r"(?i)postprocessing|\bffmpeg\b|\bffprobe\b|conversion failed").unwrap()
});

fn classify(detail: &str, phase: Phase) -> ErrorKind {
    if MISSING_TOOL.is_match(detail) {
        ErrorKind::ToolchainMissing
    } else if FILESYSTEM_FAILURE.is_match(detail) {
        ErrorKind::Filesystem
    } else if matches!(phase, Phase::Merging | Phase::Converting) || POSTPROCESSING_FAILURE.is_match(detail) {
        ErrorKind::MergeConversion
    } else {
        ErrorKind::Network
    }
}

static FRAGMENT: ::once_cell::sync::Lazy<::regex::Regex> =
    ::once_cell::sync::Lazy::new(|| ::regex::Regex::new(r"^\.part-Frag\d+(?:\.part)?$").unwrap());

fn is_fragment_of(file_name: &str, name: &str) -> bool {
    name.strip_prefix(file_name).is_some_and(|rest| FRAGMENT.is_match(rest))
}

fn with_suffix(path: &::std::path::Path, suffix: &str) -> ::std::path::PathBuf {
    let mut path = path.as_os_str().to_owned();
    path.push(suffix);

    path.into()
}

/// `artifact` and the files yt-dlp derives from its name.
async fn leftovers(artifact: &::std::path::Path) -> Fallible<Vec<::std::path::PathBuf>> {
    let mut leftovers = vec![
        artifact.to_path_buf(),
        with_suffix(artifact, ".part"),
        with_suffix(artifact, ".ytdl"),
    ];

    if let Some(extension) = artifact.extension().and_then(::std::ffi::OsStr::to_str) {
        leftovers.push(artifact.with_extension(format!("temp.{}", extension)));
    }

    let Some(file_name) = artifact.file_name().and_then(::std::ffi::OsStr::to_str) else {
        return Ok(leftovers);
    };

    let directory = match artifact.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => ::std::path::Path::new("."),
    };

    let mut entries = match ::tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ::std::io::ErrorKind::NotFound => return Ok(leftovers),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_str().is_some_and(|name| is_fragment_of(file_name, name)) {
            leftovers.push(entry.path());
        }
    }

    Ok(leftovers)
}

/// Folds the lines of one yt-dlp run into adapter events.
#[derive(Debug)]
struct YtdlpTranscript {
    phase: Phase,
    streams: usize,
    streams_done: usize,
    current_file: Option<MaybeOwnedString>,
    fetched: Option<u8>,
    output: Option<::std::path::PathBuf>,
    last_error: Option<MaybeOwnedString>,
}

impl YtdlpTranscript {
    fn new() -> Self {
        Self {
            phase: Phase::Fetching,
            streams: 1,
            streams_done: 0,
            current_file: None,
            fetched: None,
            output: None,
            last_error: None,
        }
    }

    fn observe(&mut self, line: &str) -> Vec<AdapterEvent> {
        let Some(parsed) = YtdlpLine::from_line(line) else {
            let line = line.trim();
            return (!line.is_empty())
                .then(|| AdapterEvent::LogLine(line.to_owned().into()))
                .into_iter()
                .collect();
        };

        match parsed {
            YtdlpLine::Started { streams, title } => {
                self.streams = streams.max(1);
                self.streams_done = 0;
                self.current_file = None;

                title.map(AdapterEvent::TitleResolved).into_iter().collect()
            },

            YtdlpLine::Progress { downloaded, total, file } => {
                if self.phase != Phase::Fetching {
                    return Vec::new();
                }

                let mut events = Vec::new();

                if self.current_file.as_ref() != Some(&file) {
                    // yt-dlp fetches the streams of a merged format one after another.
                    if self.current_file.is_some() {
                        self.streams_done = (self.streams_done + 1).min(self.streams - 1);
                    }

                    events.push(AdapterEvent::Writing(::std::path::PathBuf::from(&*file)));
                    self.current_file = Some(file);
                }

                events.extend(self.fetch_progress(downloaded, total));

                events
            },

            YtdlpLine::Postprocess { status, postprocessor } => {
                let phase = if postprocessor.contains("Merger") {
                    Phase::Merging
                } else if postprocessor.contains("ExtractAudio") {
                    Phase::Converting
                } else {
                    return vec![AdapterEvent::LogLine(line.trim().to_owned().into())];
                };

                match &*status {
                    "started" if phase.rank() > self.phase.rank() => {
                        self.phase = phase;
                        vec![AdapterEvent::PhaseChanged(phase)]
                    },
                    "finished" if phase == self.phase => vec![AdapterEvent::DownloadProgress(100)],
                    _ => Vec::new(),
                }
            },

            YtdlpLine::Completed { path } => {
                self.output = Some(path);

                Vec::new()
            },

            YtdlpLine::Diagnostic { level, message } => {
                if level == DiagnosticLevel::Error {
                    self.last_error = Some(message);
                }

                vec![AdapterEvent::LogLine(line.trim().to_owned().into())]
            },
        }
    }

    fn fetch_progress(&mut self, downloaded: u64, total: Option<u64>) -> Option<AdapterEvent> {
        let total = total.filter(|&total| total > 0)?;
        let percent = (downloaded.min(total) * 100 / total) as usize;
        let folded = ((self.streams_done * 100 + percent) / self.streams).min(100) as u8;

        if self.fetched.is_some_and(|fetched| folded <= fetched) {
            return None;
        }

        self.fetched = Some(folded);

        Some(AdapterEvent::DownloadProgress(folded))
    }

    async fn finish(&self, status: ::std::process::ExitStatus, destination: &::std::path::Path) -> AdapterOutcome {
        if !status.success() {
            let detail = self
                .last_error
                .clone()
                .unwrap_or_else(|| format!("yt-dlp failed with {}", status).into());

            return AdapterOutcome::Failed(self.classify(&detail), detail);
        }

        let output = self.output.clone().unwrap_or_else(|| destination.to_path_buf());

        match ::tokio::fs::metadata(&output).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => AdapterOutcome::Succeeded(output),
            Ok(_) => AdapterOutcome::Failed(
                ErrorKind::Filesystem,
                format!("yt-dlp finished but `{}` is empty", output.display()).into(),
            ),
            Err(err) => AdapterOutcome::Failed(
                ErrorKind::Filesystem,
                format!("yt-dlp finished but `{}` is unavailable: {}", output.display(), err).into(),
            ),
        }
    }

    fn classify(&self, detail: &str) -> ErrorKind {
        classify(detail, self.phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiagnosticLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum YtdlpLine {
    Started { streams: usize, title: Option<MaybeOwnedString> },
    Progress { downloaded: u64, total: Option<u64>, file: MaybeOwnedString },
    Postprocess { status: MaybeOwnedString, postprocessor: MaybeOwnedString },
    Completed { path: ::std::path::PathBuf },
    Diagnostic { level: DiagnosticLevel, message: MaybeOwnedString },
}

trait FromYtdlpLine: ::core::marker::Send + ::core::marker::Sync {
    fn from_line<Line>(line: Line) -> Option<Self>
    where
        Line: AsRef<str>,
        Self: Sized;
}

impl FromYtdlpLine for YtdlpLine {
    fn from_line<Line>(line: Line) -> Option<Self>
    where
        Line: AsRef<str>,
        Self: Sized,
    {
        let line = line.as_ref().trim_end();

        Self::started(line)
            .or_else(|| Self::progress(line))
            .or_else(|| Self::postprocess(line))
            .or_else(|| Self::completed(line))
            .or_else(|| Self::diagnostic(line))
    }
}

impl YtdlpLine {
    fn started(line: &str) -> Option<Self> {
        // The title goes last so a `;` inside it stays in one piece.
        let attrs = line.strip_prefix("[fetch-started]")?.splitn(2, ';');
        let [format_id, title] = YtdlpAttributes::parse(attrs)?.into();

        let streams = format_id.singlevalued().map_or(1, |format_id| format_id.split('+').count());

        Some(Self::Started { streams, title: title.singlevalued().filter(|title| !title.is_empty()) })
    }

    fn progress(line: &str) -> Option<Self> {
        // The file name goes last so a `;` inside it stays in one piece.
        let attrs = line.strip_prefix("[fetch-progress]")?.splitn(4, ';');
        let [downloaded, total, estimate, file] = YtdlpAttributes::parse(attrs)?.into();

        Some(Self::Progress {
            downloaded: downloaded.bytes()?,
            total: total.bytes().or_else(|| estimate.bytes()),
            file: file.singlevalued()?,
        })
    }

    fn postprocess(line: &str) -> Option<Self> {
        if let Some(attrs) = line.strip_prefix("[postprocess]") {
            let [status, postprocessor] = YtdlpAttributes::parse(attrs.splitn(2, ';'))?.into();

            return Some(Self::Postprocess {
                status: status.singlevalued()?,
                postprocessor: postprocessor.singlevalued()?,
            });
        }

        // Announcements printed when the templates are not in effect.
        ["Merger", "ExtractAudio"]
            .into_iter()
            .find(|postprocessor| {
                line.strip_prefix('[')
                    .and_then(|line| line.strip_prefix(postprocessor))
                    .is_some_and(|line| line.starts_with(']'))
            })
            .map(|postprocessor| Self::Postprocess { status: "started".into(), postprocessor: postprocessor.into() })
    }

    fn completed(line: &str) -> Option<Self> {
        let path = YtdlpAttribute(line.strip_prefix("[fetch-completed]")?).singlevalued()?;

        (!path.is_empty()).then(|| Self::Completed { path: ::std::path::PathBuf::from(&*path) })
    }

    fn diagnostic(line: &str) -> Option<Self> {
        let attrs = line.splitn(2, ':');
        let [level, message] = YtdlpAttributes::parse(attrs)?.into();

        Some(Self::Diagnostic {
            level: match level.singlevalued()?.as_ref() {
                "WARNING" => DiagnosticLevel::Warning,
                "ERROR" => DiagnosticLevel::Error,
                _ => return None,
            },
            message: message.singlevalued()?,
        })
    }
}

#[derive(Clone)]
struct YtdlpAttribute<'a>(&'a str);

impl<'a> YtdlpAttribute<'a> {
    fn singlevalued(self) -> Option<MaybeOwnedString> {
        match self.0.trim() {
            "NA" | "None" => None,
            attr => Some(attr.to_owned().into()),
        }
    }

    /// Byte counts come out of yt-dlp as integers or floats.
    fn bytes(self) -> Option<u64> {
        self.singlevalued()?
            .parse::<f64>()
            .ok()
            .filter(|bytes| bytes.is_finite() && *bytes >= 0.0)
            .map(|bytes| bytes as u64)
    }
}

struct YtdlpAttributes<'a, const N: usize>([YtdlpAttribute<'a>; N]);

impl<'a, const N: usize> From<YtdlpAttributes<'a, N>> for [YtdlpAttribute<'a>; N] {
    fn from(outer: YtdlpAttributes<'a, N>) -> Self {
        outer.0
    }
}

impl<'a, const N: usize> YtdlpAttributes<'a, N> {
    fn parse<Attrs>(attrs: Attrs) -> Option<Self>
    where
        Attrs: Iterator<Item = &'a str>,
    {
        let attrs = attrs
            .map(YtdlpAttribute)
            .collect::<Vec<_>>()
            .try_into()
            .ok()?;

        Some(Self(attrs))
    }
}
