// src/core/events.rs

//! Request event logging and the size-rotating file writer shared with the
//! log-file layer.
//!
//! Events are formatted through a user template and funneled over a bounded
//! channel to a single writer task, so request handlers never block on disk.

use crate::config::{EventLogFileConfig, RotationConfig};
use crate::core::EdgeCacheError;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Buffered events before the logger starts shedding.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

struct RollingInner {
    file: File,
    written: u64,
}

/// A size-rotating append writer. `path` is the live file; rotation shifts
/// it to `path.1`, `path.1` to `path.2`, and so on up to `max_backups`,
/// pruning backups older than `max_age`.
#[derive(Clone)]
pub struct RollingWriter {
    path: PathBuf,
    rotation: RotationConfig,
    inner: Arc<Mutex<RollingInner>>,
}

impl RollingWriter {
    pub fn open(path: impl Into<PathBuf>, rotation: RotationConfig) -> Result<Self, EdgeCacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            rotation,
            inner: Arc::new(Mutex::new(RollingInner { file, written })),
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(format!(".{index}"));
        PathBuf::from(os)
    }

    fn rotate(&self, inner: &mut RollingInner) -> std::io::Result<()> {
        inner.file.flush()?;
        // Shift backups upward, dropping the oldest.
        for index in (1..self.rotation.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        if self.rotation.max_backups > 0 {
            std::fs::rename(&self.path, self.backup_path(1))?;
        } else {
            std::fs::remove_file(&self.path)?;
        }
        self.prune_old_backups();
        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        inner.written = 0;
        Ok(())
    }

    fn prune_old_backups(&self) {
        let cutoff = SystemTime::now()
            .checked_sub(self.rotation.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for index in 1..=self.rotation.max_backups {
            let backup = self.backup_path(index);
            let Ok(meta) = std::fs::metadata(&backup) else {
                continue;
            };
            if meta.modified().is_ok_and(|m| m < cutoff) {
                if let Err(e) = std::fs::remove_file(&backup) {
                    warn!("Failed to prune old log backup {}: {}", backup.display(), e);
                }
            }
        }
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock();
        if self.rotation.max_size > 0 && inner.written + buf.len() as u64 > self.rotation.max_size {
            self.rotate(&mut inner)?;
        }
        let n = inner.file.write(buf)?;
        inner.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// One served public request, as seen by the event log.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub client_ip: String,
    pub host: String,
    pub url: String,
    pub source: String,
    pub cache: String,
    pub status: u16,
    pub duration_ms: u64,
}

/// Substitutes `{placeholder}` tokens in the configured template.
fn format_event(template: &str, event: &RequestEvent) -> String {
    template
        .replace("{time}", &Utc::now().to_rfc3339())
        .replace("{client_ip}", &event.client_ip)
        .replace("{host}", &event.host)
        .replace("{url}", &event.url)
        .replace("{source}", &event.source)
        .replace("{cache}", &event.cache)
        .replace("{status}", &event.status.to_string())
        .replace("{duration_ms}", &event.duration_ms.to_string())
}

/// Cheap handle request handlers use to record events.
#[derive(Clone)]
pub struct EventLogger {
    tx: mpsc::Sender<String>,
    template: String,
}

impl EventLogger {
    /// Opens the event log file and spawns the writer task. Returns `None`
    /// when event logging is disabled.
    pub fn spawn(
        cfg: &EventLogFileConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Option<Self>, EdgeCacheError> {
        if !cfg.enabled {
            return Ok(None);
        }
        if cfg.path.trim().is_empty() {
            return Err(EdgeCacheError::FatalConfig(
                "event_logging.file.path is required when event logging is enabled".to_string(),
            ));
        }
        let writer = RollingWriter::open(Path::new(&cfg.path), cfg.rotation.clone())?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(run_writer(writer, rx, shutdown_rx));
        Ok(Some(Self {
            tx,
            template: cfg.template.clone(),
        }))
    }

    /// Records an event. Never blocks; a full channel sheds the event.
    pub fn record(&self, event: &RequestEvent) {
        let line = format_event(&self.template, event);
        if self.tx.try_send(line).is_err() {
            debug!("Event log channel full; dropping event");
        }
    }
}

async fn run_writer(
    mut writer: RollingWriter,
    mut rx: mpsc::Receiver<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Event log writer started.");
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { return };
                if let Err(e) = writeln!(writer, "{line}") {
                    warn!("Event log write failed: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                // Drain whatever is already queued, then stop.
                while let Ok(line) = rx.try_recv() {
                    let _ = writeln!(writer, "{line}");
                }
                let _ = writer.flush();
                info!("Event log writer shutting down.");
                return;
            }
        }
    }
}
