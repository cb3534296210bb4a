use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log file under the instances directory, activated by `create`/`start`.
pub const LOG_FILE: &str = "machina.log";

type Slot = Arc<Mutex<Option<File>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<File>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards until a file is attached through its
/// [`DeferredFileHandle`]. The subscriber is installed before we know
/// whether the command touches machines at all.
#[derive(Clone)]
pub struct DeferredFileWriter {
    slot: Slot,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    slot: Slot,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let slot = Arc::new(Mutex::new(None));
        (Self { slot: slot.clone() }, DeferredFileHandle { slot })
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`, creating parent directories.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.slot) = Some(file);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

pub struct DeferredWriter {
    slot: Slot,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.slot).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.slot).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            slot: self.slot.clone(),
        }
    }
}

// ── subscriber ───────────────────────────────────────────

fn terminal_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    let filter = EnvFilter::from_default_env();
    match "machina=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the global subscriber: stderr filtered by `--verbose`/`RUST_LOG`,
/// plus a `machina=debug` file layer that stays silent until activated.
pub fn init(verbose: bool) -> DeferredFileHandle {
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter(verbose));

    let (file_writer, handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("machina=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();
    handle
}
