//! Workspace log sink.
//!
//! A minimal `tracing` subscriber shared by the emulator crates: every
//! event is stamped with the time elapsed since [`init_logger`] and
//! written to stdout or a per-session log file. The emulator's structured
//! diagnostics (`tracing::warn!` and friends) and its hot-path [`log`]
//! shim both land on the same sink. Without initialization every event is
//! discarded, which keeps logging free in tests.

use std::fmt;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Metadata, Subscriber};

/// Claimed once by the first `init_logger` call; holds the log-file path
/// when the file sink won.
static ACTIVE: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Where log lines go.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum LogKind {
    /// Log to the console.
    Stdout,
    /// Log to a session file in the temp directory.
    File,
}

/// Installs the workspace subscriber. Only the first call takes effect;
/// the file sink falls back to stdout when the file cannot be created.
pub fn init_logger(kind: LogKind) {
    let (sink, path): (Box<dyn Write + Send>, Option<PathBuf>) = match kind {
        LogKind::Stdout => (Box::new(io::stdout()), None),
        LogKind::File => {
            let filename = format!("mandarine-{}.log", Utc::now().format("%Y%m%d-%H%M%S"));
            let path = std::env::temp_dir().join(filename);
            match File::create(&path) {
                Ok(file) => (Box::new(file), Some(path)),
                Err(_) => (Box::new(io::stdout()), None),
            }
        }
    };

    if ACTIVE.set(path).is_err() {
        return;
    }

    let subscriber = TimedSubscriber {
        sink: Mutex::new(sink),
        start: Instant::now(),
    };
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Path of the active log file, when logging to one.
pub fn log_file() -> Option<PathBuf> {
    ACTIVE.get().cloned().flatten()
}

/// Hot-path logging: emits a TRACE event on the shared sink.
pub fn log<T>(data: T)
where
    T: fmt::Display,
{
    tracing::trace!(target: "emu", "{data}");
}

struct TimedSubscriber {
    sink: Mutex<Box<dyn Write + Send>>,
    start: Instant,
}

impl Subscriber for TimedSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    // The emulator only emits events; spans are accepted and ignored.
    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let elapsed = self.start.elapsed();
        if let Ok(mut sink) = self.sink.lock() {
            writeln!(
                sink,
                "[{}.{:03}s {} {}] {}",
                elapsed.as_secs(),
                elapsed.subsec_millis(),
                event.metadata().level(),
                event.metadata().target(),
                visitor.0
            )
            .ok();
        }
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

/// Collects an event's `message` field and renders any other fields as
/// trailing `name=value` pairs.
#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_receives_stamped_events() {
        init_logger(LogKind::File);

        log("bus idle");
        tracing::warn!(target: "emu", "open bus");

        let path = log_file().expect("file sink should be active");
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(path).ok();

        assert!(contents.contains("TRACE emu] bus idle"), "{contents}");
        assert!(contents.contains("WARN emu] open bus"), "{contents}");
        assert!(contents.starts_with('['));
    }
}
