pub(crate) mod utils;

use ::domain::MediaFormat;
use ::infrastructures::boundaries::TerminalView;
use ::infrastructures::gateways::selectors::FixedDestination;
use ::infrastructures::gateways::selectors::PromptDestination;
use ::infrastructures::gateways::toolchains::YtdlpToolchain;
use ::use_cases::boundaries::Accept;
use ::use_cases::boundaries::DownloadVideoRequestModel;
use ::use_cases::boundaries::SessionObserver;
use ::use_cases::gateways::DestinationSelector;
use ::use_cases::gateways::ToolchainAdapter;
use ::use_cases::interactors::DownloadOrchestrator;
use ::use_cases::interactors::DownloadVideoInteractor;
use ::use_cases::models::events::SessionOutcome;

use crate::utils::aliases::Fallible;
use crate::utils::extensions::OptionExt;
use crate::utils::naming::suggested_file_name;

#[tokio::main]
async fn main() -> Fallible<::std::process::ExitCode> {
    let writer = ::tracing_appender::rolling::daily("logs", "tapedeck.log");
    let (writer, _guard) = ::tracing_appender::non_blocking(writer);

    ::tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(
            ::tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| ::tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let matches = command().get_matches();

    let toolchain = ::std::sync::Arc::new(
        YtdlpToolchain::builder()
            .fetch_program(matches.get_one::<::std::path::PathBuf>("yt-dlp").ok()?.to_owned())
            .merge_program(matches.get_one::<::std::path::PathBuf>("ffmpeg").ok()?.to_owned())
            .build(),
    );

    let orchestrator = ::std::sync::Arc::new(
        DownloadOrchestrator::builder()
            .adapter(::std::sync::Arc::clone(&toolchain) as ::std::sync::Arc<dyn ToolchainAdapter>)
            .build(),
    );

    ::tokio::spawn({
        let orchestrator = ::std::sync::Arc::clone(&orchestrator);

        async move {
            while ::tokio::signal::ctrl_c().await.is_ok() {
                if !orchestrator.is_busy() {
                    ::tracing::info!("interrupted outside of a download");
                    ::std::process::exit(130);
                }

                ::tracing::info!("interrupted, cancelling the download");
                orchestrator.cancel();
            }
        }
    });

    match matches.subcommand() {
        Some(("download", matches)) => {
            let url = matches.get_one::<::std::string::String>("url").ok()?.to_owned();
            let format = *matches.get_one::<MediaFormat>("format").ok()?;

            let selector: ::std::sync::Arc<dyn DestinationSelector> =
                match matches.get_one::<::std::path::PathBuf>("output") {
                    Some(path) => ::std::sync::Arc::new(FixedDestination::new(path.to_owned())),
                    None => ::std::sync::Arc::new(PromptDestination::stdin()),
                };

            let view = ::std::sync::Arc::new(TerminalView::new());

            let download_video_interactor = ::std::sync::Arc::new(
                DownloadVideoInteractor::builder()
                    .observer(::std::sync::Arc::clone(&view) as ::std::sync::Arc<dyn SessionObserver>)
                    .selector(selector)
                    .orchestrator(::std::sync::Arc::clone(&orchestrator))
                    .build(),
            );

            let request = DownloadVideoRequestModel::builder()
                .suggested_destination(suggested_file_name(&url, format))
                .url(url)
                .format(format)
                .build();

            let outcome = download_video_interactor.accept(request).await?;
            ::tracing::info!(?outcome, "download finished");

            Ok(match outcome {
                SessionOutcome::Completed(_) => ::std::process::ExitCode::SUCCESS,
                SessionOutcome::Failed(_) => ::std::process::ExitCode::FAILURE,
                SessionOutcome::Cancelled => ::std::process::ExitCode::from(130),
            })
        },

        _ => unreachable!(),
    }
}

fn command() -> ::clap::Command {
    ::clap::Command::new("tapedeck")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            ::clap::Command::new("download")
                .arg(
                    ::clap::Arg::new("url")
                        .short('i')
                        .required(true)
                        .value_parser(::clap::value_parser!(::std::string::String)),
                )
                .arg(
                    ::clap::Arg::new("output")
                        .short('o')
                        .required(false)
                        .value_parser(::clap::value_parser!(::std::path::PathBuf)),
                )
                .arg(
                    ::clap::Arg::new("format")
                        .short('f')
                        .default_value("video")
                        .value_parser(::clap::value_parser!(MediaFormat)),
                ),
        )
        .arg(
            ::clap::Arg::new("yt-dlp")
                .long("yt-dlp")
                .global(true)
                .env("TAPEDECK_YTDLP")
                .default_value("yt-dlp")
                .value_parser(::clap::value_parser!(::std::path::PathBuf)),
        )
        .arg(
            ::clap::Arg::new("ffmpeg")
                .long("ffmpeg")
                .global(true)
                .env("TAPEDECK_FFMPEG")
                .default_value("ffmpeg")
                .value_parser(::clap::value_parser!(::std::path::PathBuf)),
        )
}
