//! Log multiplexing
//!
//! Every line is written whole under one lock, so lines from different
//! containers never interleave mid-line. The prefix carries the container
//! name in a color picked from the service name.

use super::options::LogFormat;
use crossterm::style::{Color, Stylize};
use crossterm::tty::IsTty;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::LogLine;

const PALETTE: &[Color] = &[
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::DarkCyan,
    Color::DarkYellow,
    Color::DarkGreen,
    Color::DarkMagenta,
    Color::DarkBlue,
];

/// Color of a service's prefix
pub fn color_for(service: &str) -> Color {
    let hash = service
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    PALETTE[hash as usize % PALETTE.len()]
}

/// Output stream shared by every printer of an engine
pub type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Sink on stdout, and whether stdout is a terminal
pub fn stdout_sink() -> (Sink, bool) {
    let tty = std::io::stdout().is_tty();
    let out: Box<dyn Write + Send> = Box::new(std::io::stdout());
    (Arc::new(Mutex::new(out)), tty)
}

/// Write raw text to a sink
pub fn write_raw(sink: &Sink, text: &str) {
    if let Ok(mut out) = sink.lock() {
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

struct Printer {
    out: Sink,
    color: bool,
    prefix: bool,
    timestamps: bool,
    width: AtomicUsize,
}

/// Shared, cloneable log writer
#[derive(Clone)]
pub struct LogPrinter {
    inner: Arc<Printer>,
}

impl LogPrinter {
    /// Printer on a shared sink; `terminal` tells whether colors may be used
    pub fn new(out: Sink, format: LogFormat, terminal: bool) -> Self {
        Self {
            inner: Arc::new(Printer {
                out,
                color: terminal && !format.no_color,
                prefix: !format.no_log_prefix,
                timestamps: format.timestamps,
                width: AtomicUsize::new(0),
            }),
        }
    }

    /// Pad prefixes to the longest of `names`
    pub fn align<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let width = names.into_iter().map(str::len).max().unwrap_or(0);
        self.inner.width.fetch_max(width, Ordering::Relaxed);
    }

    fn prefix(&self, service: &str, container: &str) -> String {
        if !self.inner.prefix {
            return String::new();
        }
        let width = self.inner.width.load(Ordering::Relaxed);
        let text = format!("{:<width$} | ", container, width = width);
        if self.inner.color {
            text.with(color_for(service)).to_string()
        } else {
            text
        }
    }

    fn write(&self, text: &str) {
        write_raw(&self.inner.out, text);
    }

    /// Write one log line of a container
    pub fn line(&self, service: &str, container: &str, line: &LogLine) {
        let mut text = self.prefix(service, container);
        if self.inner.timestamps {
            text.push_str(&line.timestamp.to_rfc3339());
            text.push(' ');
        }
        text.push_str(line.text.trim_end_matches('\n'));
        text.push('\n');
        self.write(&text);
    }

    /// Write a status message attributed to a container
    pub fn event(&self, service: &str, container: &str, message: &str) {
        let mut text = self.prefix(service, container);
        text.push_str(message);
        text.push('\n');
        self.write(&text);
    }

    /// Write a plain line
    pub fn plain(&self, message: &str) {
        self.write(&format!("{}\n", message));
    }
}
