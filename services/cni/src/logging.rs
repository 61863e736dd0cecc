//! Logging initialization for the CNI plugin.
//!
//! stdout carries the CNI result, so logs go to stderr. When
//! `MACVTAP_CNI_LOG_FILE` is set they are also appended to that file as
//! JSON, which survives the runtime discarding stderr.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable naming the optional log file.
pub const LOG_FILE_ENV: &str = "MACVTAP_CNI_LOG_FILE";

/// Stop appending once the log file reaches this size (10 MB).
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Appending writer that goes quiet once the file is full.
struct LogFileWriter {
    file: File,
    size: u64,
    max_bytes: u64,
}

impl LogFileWriter {
    fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            file,
            size,
            max_bytes,
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size >= self.max_bytes {
            return Ok(buf.len());
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SharedWriter(Mutex<LogFileWriter>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Install the global subscriber.
pub fn init() -> anyhow::Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_filter(filter());

    let file_layer = match std::env::var_os(LOG_FILE_ENV) {
        Some(path) if !path.is_empty() => {
            let writer = LogFileWriter::open(Path::new(&path), MAX_LOG_BYTES)?;
            // Lives for the rest of this short process.
            let shared: &'static SharedWriter =
                Box::leak(Box::new(SharedWriter(Mutex::new(writer))));
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(shared)
                    .with_filter(filter()),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
