use std::fmt::Write as _;

use chrono::Local;
use kiln_run_summary::UI;
use owo_colors::{
    colors::{Black, Default, Red, Yellow},
    Color, OwoColorize,
};
use tracing::{
    field::{Field, Visit},
    metadata::LevelFilter,
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    util::TryInitError,
    EnvFilter, Registry,
};

pub const LOG_VERBOSITY_ENV: &str = "KILN_LOG_VERBOSITY";

pub struct KilnSubscriber {
    level_override: Option<LevelFilter>,
}

impl KilnSubscriber {
    /// Installs the global subscriber. Logs go to stderr so that stdout stays
    /// free for the run report.
    ///
    /// ## Logging behaviour:
    /// - ANSI colors follow `ui`.
    /// - `KILN_LOG_VERBOSITY` takes `EnvFilter` directives, defaulting to
    ///   `warn`.
    /// - A non-zero `verbosity` raises the global level on top of those
    ///   directives: 1 is info, 2 is debug, 3 and above is trace.
    pub fn new_with_verbosity(verbosity: usize, ui: &UI) -> Result<Self, TryInitError> {
        let level_override = level_override(verbosity);
        let directives = std::env::var(LOG_VERBOSITY_ENV).ok();
        let filter = env_filter(directives.as_deref(), level_override);

        let stderr = fmt::layer()
            .with_writer(std::io::stderr)
            .event_format(KilnFormatter::new_with_ansi(!ui.should_strip_ansi))
            .with_filter(filter);

        Registry::default().with(stderr).try_init()?;

        Ok(Self { level_override })
    }

    pub fn level_override(&self) -> Option<LevelFilter> {
        self.level_override
    }
}

pub fn level_override(verbosity: usize) -> Option<LevelFilter> {
    match verbosity {
        0 => None,
        1 => Some(LevelFilter::INFO),
        2 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

fn env_filter(directives: Option<&str>, level_override: Option<LevelFilter>) -> EnvFilter {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives.unwrap_or_default());

    match level_override {
        Some(max_level) => filter.add_directive(max_level.into()),
        None => filter,
    }
}

/// Formats kiln's log lines.
///
/// - Errors are red
/// - Warnings are yellow
/// - Info is default
/// - Debug and trace carry a timestamp, the level and the target
///
/// Span context is not printed. Event fields other than the message follow
/// it as `key=value` pairs, so `debug!(node = %id, "restored")` reads
/// `restored node=compile`.
pub struct KilnFormatter {
    is_ansi: bool,
}

impl KilnFormatter {
    pub fn new_with_ansi(is_ansi: bool) -> Self {
        Self { is_ansi }
    }
}

impl<S, N> FormatEvent<S, N> for KilnFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let level = event.metadata().level();
        let target = event.metadata().target();

        match *level {
            Level::ERROR => {
                write_string::<Red, Black>(writer.by_ref(), self.is_ansi, level.as_str())?;
                write_message::<Red, Default>(writer, self.is_ansi, event)
            }
            Level::WARN => {
                write_string::<Yellow, Black>(writer.by_ref(), self.is_ansi, level.as_str())?;
                write_message::<Yellow, Default>(writer, self.is_ansi, event)
            }
            Level::INFO => write_message::<Default, Default>(writer, self.is_ansi, event),
            _ => {
                write!(
                    writer,
                    "{} [{}] {}: ",
                    Local::now().format("%Y-%m-%dT%H:%M:%S.%3f%z"),
                    level,
                    target,
                )?;
                write_message::<Default, Default>(writer, self.is_ansi, event)
            }
        }
    }
}

/// Splits an event into its message and the rest of its fields.
#[derive(Default)]
struct EventFields {
    message: String,
    extra: String,
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.extra, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.extra, " {}={}", field.name(), value);
        }
    }
}

fn write_string<FG: Color, BG: Color>(
    mut writer: Writer<'_>,
    colorize: bool,
    value: &str,
) -> std::fmt::Result {
    if colorize {
        write!(writer, "{} ", value.fg::<FG>().bg::<BG>())
    } else {
        write!(writer, "{} ", value)
    }
}

fn write_message<FG: Color, BG: Color>(
    mut writer: Writer<'_>,
    colorize: bool,
    event: &Event,
) -> std::fmt::Result {
    let mut fields = EventFields::default();
    event.record(&mut fields);
    let EventFields { message, extra } = fields;

    if colorize {
        writeln!(writer, "{}{}", message.fg::<FG>().bg::<BG>(), extra.dimmed())
    } else {
        writeln!(writer, "{}{}", message, extra)
    }
}
