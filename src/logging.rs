use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Tags access decisions with `[ALLOW]` / `[DENY]` based on the event message.
pub struct PrefixedFormatter<E> {
    inner: E,
    ansi: bool,
}

impl<E> PrefixedFormatter<E> {
    pub fn new(inner: E, ansi: bool) -> Self {
        Self { inner, ansi }
    }
}

impl<S, N, E> FormatEvent<S, N> for PrefixedFormatter<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        if let Some((tag, color)) = decision_tag(&visitor.message.to_lowercase()) {
            if self.ansi {
                write!(writer, "\x1b[{}m[{}]\x1b[0m ", color, tag)?;
            } else {
                write!(writer, "[{}] ", tag)?;
            }
        }

        if self.ansi {
            let mut buf = String::new();
            let buf_writer = Writer::new(&mut buf);
            self.inner.format_event(ctx, buf_writer, event)?;
            let colorized = colorize_fields(&buf);
            write!(writer, "{}", colorized)?;
            Ok(())
        } else {
            self.inner.format_event(ctx, writer, event)
        }
    }
}

/// Colorize known field names in a log line.
fn colorize_fields(line: &str) -> String {
    let mut result = line.to_string();
    for (field, color) in FIELD_COLORS {
        let pattern = format!("{}=", field);
        if result.contains(&pattern) {
            let colored = format!("\x1b[{}m{}=\x1b[0m", color, field);
            result = result.replace(&pattern, &colored);
        }
    }
    result
}

/// Field name to ANSI color code. Longer names sharing a prefix come first.
const FIELD_COLORS: &[(&str, &str)] = &[
    ("user", "36"),
    ("device", "33"),
    ("argv", "33"),
    ("peer", "35"),
    ("ip", "35"),
    ("session_id", "2"),
    ("pid", "2"),
    ("exit_code", "32"),
    ("duration_ms", "32"),
    ("error", "31"),
    ("reason", "31"),
];

/// Visitor that extracts the message field from a tracing event.
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Tag and ANSI color for a lowercased message, if it records a decision.
fn decision_tag(msg: &str) -> Option<(&'static str, &'static str)> {
    if is_deny_pattern(msg) {
        Some(("DENY", "31"))
    } else if is_allow_pattern(msg) {
        Some(("ALLOW", "34"))
    } else {
        None
    }
}

fn is_deny_pattern(msg: &str) -> bool {
    msg.contains("denied")
        || msg.contains("rejecting")
        || msg.contains("refusing")
        || msg.contains("not authorized")
        || msg.contains("dispatch failed")
        || msg.contains("killed session process")
}

fn is_allow_pattern(msg: &str) -> bool {
    msg.contains("auth accepted") || msg.contains("session closed")
}

/// Install the global subscriber. `level` is an `EnvFilter` directive;
/// an invalid directive falls back to `info`.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            let ansi = std::io::stdout().is_terminal();
            let default_format = tracing_subscriber::fmt::format::Format::default();
            tracing_subscriber::fmt()
                .event_format(PrefixedFormatter::new(default_format, ansi))
                .with_env_filter(filter)
                .init();
        }
    }
}
