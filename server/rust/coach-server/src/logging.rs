//! Console formatting for the gateway logs.
//!
//! `GatewayFormatter` renders one line per event with a level icon, the
//! target, the span chain (so `session_id` / `request_id` fields recorded on
//! spans stay visible) and the event fields. File output does not go through
//! this formatter, it uses the plain `tracing-subscriber` format without ANSI.

use owo_colors::OwoColorize;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// Icon and fields only.
    Compact,
    /// Icon, level, target and span names.
    #[default]
    Pretty,
    /// Pretty plus file/line.
    Verbose,
}

impl std::str::FromStr for LogStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogStyle::Compact),
            "pretty" => Ok(LogStyle::Pretty),
            "verbose" => Ok(LogStyle::Verbose),
            _ => Err(format!("invalid log style '{s}', expected compact, pretty or verbose")),
        }
    }
}

fn level_icon(level: Level) -> &'static str {
    match level {
        Level::TRACE => "·",
        Level::DEBUG => "●",
        Level::INFO => "✓",
        Level::WARN => "⚠",
        Level::ERROR => "✕",
    }
}

pub struct GatewayFormatter<T> {
    timer: T,
    use_ansi: bool,
    style: LogStyle,
}

impl<T> GatewayFormatter<T> {
    pub fn new(timer: T, style: LogStyle) -> Self {
        Self { timer, use_ansi: std::io::stdout().is_terminal(), style }
    }

    pub fn with_ansi(mut self, use_ansi: bool) -> Self {
        self.use_ansi = use_ansi;
        self
    }

    fn write_level(&self, writer: &mut format::Writer<'_>, level: Level) -> fmt::Result {
        let label = if self.style == LogStyle::Compact {
            level_icon(level).to_string()
        } else {
            format!("{} {:<5}", level_icon(level), level.as_str())
        };
        if !self.use_ansi {
            return write!(writer, "{label}");
        }
        match level {
            Level::TRACE => write!(writer, "{}", label.dimmed()),
            Level::DEBUG => write!(writer, "{}", label.blue()),
            Level::INFO => write!(writer, "{}", label.green()),
            Level::WARN => write!(writer, "{}", label.yellow()),
            Level::ERROR => write!(writer, "{}", label.red().bold()),
        }
    }
}

impl<S, N, T> FormatEvent<S, N> for GatewayFormatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        self.timer.format_time(&mut writer)?;
        write!(writer, " ")?;
        self.write_level(&mut writer, *meta.level())?;

        if self.style != LogStyle::Compact {
            if self.use_ansi {
                write!(writer, " {}", meta.target().dimmed())?;
            } else {
                write!(writer, " {}", meta.target())?;
            }

            if let Some(scope) = ctx.event_scope() {
                for span in scope.from_root() {
                    let ext = span.extensions();
                    let fields = ext
                        .get::<tracing_subscriber::fmt::FormattedFields<N>>()
                        .map(|f| f.fields.as_str())
                        .unwrap_or("");
                    let name = if fields.is_empty() {
                        format!("{}:", span.name())
                    } else {
                        format!("{}{{{}}}:", span.name(), fields)
                    };
                    if self.use_ansi {
                        write!(writer, " {}", name.cyan())?;
                    } else {
                        write!(writer, " {name}")?;
                    }
                }
            }
        }

        if self.style == LogStyle::Verbose {
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                let short = file.rsplit('/').next().unwrap_or(file);
                write!(writer, " {short}:{line}")?;
            }
        }

        write!(writer, " ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
