use ::async_trait::async_trait;
use ::use_cases::boundaries::SessionObserver;
use ::use_cases::errors::DownloadError;
use ::use_cases::interactors::CANCELLED_BEFORE_START_STATUS;
use ::use_cases::interactors::CANCELLED_STATUS;

use crate::utils::aliases::Fallible;

macro_rules! lazy_progress_style {
    ($template:expr) => {
        ::once_cell::sync::Lazy::new(|| ::indicatif::ProgressStyle::with_template($template).unwrap())
    };
}

macro_rules! lazy_color {
    ($color:expr) => {
        ::once_cell::sync::Lazy::new(|| {
            use ::colored::Colorize as _;

            $color
        })
    };
}

/// Single progress bar on stderr, drawn from the first notification onwards.
pub struct TerminalView {
    progress_bar: ::indicatif::ProgressBar,
}

impl TerminalView {
    pub fn new() -> Self {
        static PROGRESS_BAR_STYLE: ::once_cell::sync::Lazy<::indicatif::ProgressStyle> =
            lazy_progress_style!("{prefix:<28} {bar:50} {msg}");

        let progress_bar = ::indicatif::ProgressBar::with_draw_target(Some(100), ::indicatif::ProgressDrawTarget::hidden())
            .with_style(PROGRESS_BAR_STYLE.clone());

        progress_bar.disable_steady_tick();
        progress_bar.set_prefix(PENDING.to_string());
        progress_bar.set_message(format!("{}", FormattedUninitPercentage));

        Self { progress_bar }
    }

    fn activate(&self) {
        if self.progress_bar.is_hidden() {
            self.progress_bar.set_draw_target(::indicatif::ProgressDrawTarget::stderr());
        }
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionObserver for TerminalView {
    async fn status(self: ::std::sync::Arc<Self>, message: &str) -> Fallible<()> {
        use ::colored::Colorize as _;

        static PROGRESS_BAR_CANCELLED_STYLE: ::once_cell::sync::Lazy<::indicatif::ProgressStyle> =
            lazy_progress_style!("{prefix:<28} {bar:50.yellow} {msg}");

        self.activate();

        if message == CANCELLED_STATUS || message == CANCELLED_BEFORE_START_STATUS {
            self.progress_bar.set_style(PROGRESS_BAR_CANCELLED_STYLE.clone());
            self.progress_bar.set_prefix(message.yellow().to_string());
            self.progress_bar.abandon();

            return Ok(());
        }

        self.progress_bar.println(format!("{} {}", BULLET.clone(), message));
        self.progress_bar.set_prefix(message.to_owned());

        Ok(())
    }

    async fn progress(self: ::std::sync::Arc<Self>, percent: u8) -> Fallible<()> {
        self.activate();

        let percentage = FormattedPercentage(percent);

        self.progress_bar.set_position(u64::from(*percentage));
        self.progress_bar.set_message(format!("{}", percentage));

        Ok(())
    }

    async fn error(self: ::std::sync::Arc<Self>, error: &DownloadError) -> Fallible<()> {
        use ::colored::Colorize as _;

        static PROGRESS_BAR_FAILED_STYLE: ::once_cell::sync::Lazy<::indicatif::ProgressStyle> =
            lazy_progress_style!("{prefix:<28} {bar:50.red} {msg}");

        self.activate();

        self.progress_bar.set_style(PROGRESS_BAR_FAILED_STYLE.clone());
        self.progress_bar.set_prefix(self.progress_bar.prefix().red().to_string());
        self.progress_bar.println(format!("{}", error.to_string().red()));
        self.progress_bar.abandon();

        Ok(())
    }

    async fn complete(self: ::std::sync::Arc<Self>, path: &::std::path::Path) -> Fallible<()> {
        use ::colored::Colorize as _;

        static PROGRESS_BAR_FINISH_STYLE: ::once_cell::sync::Lazy<::indicatif::ProgressStyle> =
            lazy_progress_style!("{prefix:<28} {bar:50.green} {msg}");

        self.activate();

        self.progress_bar.set_style(PROGRESS_BAR_FINISH_STYLE.clone());
        self.progress_bar.set_prefix("Done".green().to_string());
        self.progress_bar.set_message(self.progress_bar.message().green().to_string());
        self.progress_bar.println(format!("Saved to {}", path.display().to_string().white().bold()));
        self.progress_bar.finish();

        Ok(())
    }
}

static PENDING: ::once_cell::sync::Lazy<::colored::ColoredString> = lazy_color!("Waiting...".color(GRAY));
static BULLET: ::once_cell::sync::Lazy<::colored::ColoredString> = lazy_color!("::".cyan().bold());

const GRAY: ::colored::Color = ::colored::Color::TrueColor { r: 150, g: 150, b: 150 };

struct FormattedPercentage(u8);

impl ::std::ops::Deref for FormattedPercentage {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ::std::fmt::Display for FormattedPercentage {
    fn fmt(&self, formatter: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(formatter, "{:>3}%", self.0)
    }
}

struct FormattedUninitPercentage;

impl ::std::fmt::Display for FormattedUninitPercentage {
    fn fmt(&self, formatter: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(formatter, "{:>3}%", "??")
    }
}
