//! Logging setup and secret redaction.
//!
//! The agent logs through `tracing`. [`init`] installs a `fmt` subscriber
//! whose writer passes every formatted event through the shared
//! [`SecretRegistry`] before it reaches stderr or the log file, so a secret
//! that has been registered once never appears verbatim in later output,
//! whichever call site produced the line.

pub mod secrets;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::{AgentError, Result};
use crate::types::config::{LogFormat, LoggingSettings};

pub use secrets::{SecretRegistry, REDACTED};

/// Destination for formatted log lines.
#[derive(Debug, Clone)]
pub enum LogSink {
    Stderr,
    File(Arc<Mutex<File>>),
    /// In-memory buffer, used to capture output in tests.
    Memory(Arc<Mutex<Vec<u8>>>),
}

impl LogSink {
    /// Open (append) a log file.
    pub fn file(path: &std::path::Path) -> Result<LogSink> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::path(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AgentError::path(path, e))?;
        Ok(LogSink::File(Arc::new(Mutex::new(file))))
    }

    /// A memory sink plus a handle to read back what was written.
    pub fn memory() -> (LogSink, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (LogSink::Memory(Arc::clone(&buf)), buf)
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            LogSink::Stderr => io::stderr().lock().write_all(bytes),
            LogSink::File(file) => file.lock().write_all(bytes),
            LogSink::Memory(buf) => {
                buf.lock().extend_from_slice(bytes);
                Ok(())
            }
        }
    }
}

/// `MakeWriter` that redacts registered secrets from each event.
#[derive(Debug, Clone)]
pub struct RedactingMakeWriter {
    secrets: Arc<SecretRegistry>,
    sink: LogSink,
}

impl RedactingMakeWriter {
    pub fn new(secrets: Arc<SecretRegistry>, sink: LogSink) -> Self {
        RedactingMakeWriter { secrets, sink }
    }
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            secrets: &self.secrets,
            sink: &self.sink,
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event and emits it, redacted, when dropped.
pub struct RedactingWriter<'a> {
    secrets: &'a SecretRegistry,
    sink: &'a LogSink,
    buf: Vec<u8>,
}

impl RedactingWriter<'_> {
    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf);
        let redacted = self.secrets.redact(&text);
        let result = self.sink.write_all(redacted.as_bytes());
        self.buf.clear();
        result
    }
}

impl Write for RedactingWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // A secret may straddle two write calls, so emission waits for drop.
        Ok(())
    }
}

impl Drop for RedactingWriter<'_> {
    fn drop(&mut self) {
        let _ = self.emit();
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(settings: &LoggingSettings, secrets: Arc<SecretRegistry>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
    let sink = match &settings.file {
        Some(path) => LogSink::file(path)?,
        None => LogSink::Stderr,
    };
    let ansi = matches!(sink, LogSink::Stderr) && settings.format == LogFormat::Pretty;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingMakeWriter::new(secrets, sink))
        .with_ansi(ansi)
        .with_thread_names(true);

    let installed = match settings.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| AgentError::config(format!("cannot install log subscriber: {}", e)))
}
