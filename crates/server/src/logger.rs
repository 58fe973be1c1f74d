//! Logger initialization.

use jiff::{Timestamp, tz::TimeZone};
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};
use std::{io::IsTerminal, str::FromStr, sync::Once};

static INIT: Once = Once::new();

const ANSI_RESET: &str = "\x1b[0m";

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        // Dim rather than colored; debug output should recede.
        log::Level::Debug | log::Level::Trace => "\x1b[2m",
    }
}

/// One-line layout: UTC timestamp at millisecond precision, right-aligned
/// level, message.
#[derive(Debug)]
struct LineLayout {
    color: bool,
}

impl LineLayout {
    fn detect() -> Self {
        Self {
            color: std::io::stderr().is_terminal(),
        }
    }
}

impl Layout for LineLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let when = Timestamp::now().to_zoned(TimeZone::UTC);
        let level = record.level();

        let line = if self.color {
            format!(
                "{} {}{level:>5}{ANSI_RESET}  {}",
                when.strftime("%FT%T%.3fZ"),
                level_color(level),
                record.args(),
            )
        } else {
            format!("{} {level:>5}  {}", when.strftime("%FT%T%.3fZ"), record.args())
        };

        Ok(line.into_bytes())
    }
}

/// Initialize the logger once. The filter string follows the usual
/// `EnvFilter` grammar, e.g. "info" or "gateway=debug".
pub fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |dispatch| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter is valid"));

                dispatch
                    .filter(filter)
                    .append(Stderr::default().with_layout(LineLayout::detect()))
            })
            .apply();
    });
}
