use anyhow::Result;
use chrono::Utc;
use genapply_core::{ObserveConfig, ProgressEvent, runtime_dir};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Append-only request log under the workspace runtime dir.
pub struct Observer {
    log_path: PathBuf,
    enabled: bool,
    verbose: bool,
    write_lock: Mutex<()>,
}

impl Observer {
    pub fn new(workspace: &Path, cfg: &ObserveConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        if cfg.enabled {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            log_path: dir.join("observe.log"),
            enabled: cfg.enabled,
            verbose: cfg.verbose,
            write_lock: Mutex::new(()),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record_request(&self, request_id: Uuid, route: &str, detail: &str) -> Result<()> {
        self.append_log_line(&format!(
            "{} REQUEST {}",
            Utc::now().to_rfc3339(),
            json!({"request_id": request_id, "route": route, "detail": detail})
        ))
    }

    /// Token-level `stream` events are only kept in verbose mode.
    pub fn record_event(&self, request_id: Uuid, event: &ProgressEvent) -> Result<()> {
        if !self.verbose && matches!(event, ProgressEvent::Stream { .. }) {
            return Ok(());
        }
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            json!({"request_id": request_id, "event": event})
        ))
    }

    /// Log a warning through `tracing`, and to the log file when enabled.
    pub fn warn_log(&self, request_id: Uuid, msg: &str) {
        tracing::warn!(%request_id, "{msg}");
        let line = format!(
            "{} WARN {}",
            Utc::now().to_rfc3339(),
            json!({"request_id": request_id, "message": msg})
        );
        if let Err(err) = self.append_log_line(&line) {
            tracing::warn!(%request_id, error = %err, "observe log write failed");
        }
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        // Concurrent requests share one file; keep lines whole.
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("observe log lock poisoned"))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
