//! Sync progress reporting for the CLI.
//!
//! Reporters consume [`SyncEvent`]s from the engine's broadcast channel and
//! write them to **stderr**, so stdout remains parseable for scripts.

use std::io::Write;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::sync::SyncEvent;

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: &SyncEvent);
}

/// Human-friendly progress: "sync docs  3 / 12 files  synced guide/intro.md (4 chunks)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: &SyncEvent) {
        let line = human_line(event);
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
        let _ = err.flush();
    }
}

fn human_line(event: &SyncEvent) -> String {
    match event {
        SyncEvent::Started {
            collection, total, ..
        } => format!(
            "sync {}  {} changed files",
            collection,
            format_number(*total)
        ),
        SyncEvent::FileSynced {
            collection,
            file_path,
            chunks,
            done,
            total,
            ..
        } => format!(
            "sync {}  {} / {} files  synced {} ({} chunks)",
            collection,
            format_number(*done),
            format_number(*total),
            file_path,
            chunks
        ),
        SyncEvent::FileDeleted {
            collection,
            file_path,
            done,
            total,
            ..
        } => format!(
            "sync {}  {} / {} files  removed {}",
            collection,
            format_number(*done),
            format_number(*total),
            file_path
        ),
        SyncEvent::FileFailed {
            collection,
            file_path,
            error,
            done,
            total,
            ..
        } => format!(
            "sync {}  {} / {} files  FAILED {}: {}",
            collection,
            format_number(*done),
            format_number(*total),
            file_path,
            error
        ),
        SyncEvent::Finished {
            collection,
            outcome,
            files_processed,
            files_failed,
            files_skipped,
            ..
        } => format!(
            "sync {}  {}  processed {}, failed {}, skipped {}",
            collection, outcome, files_processed, files_failed, files_skipped
        ),
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: &SyncEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: &SyncEvent) {}
}

/// Forward events to `reporter` until the channel closes.
pub fn spawn_reporter(
    mut events: broadcast::Receiver<SyncEvent>,
    reporter: Box<dyn SyncProgressReporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = matches!(event, SyncEvent::Finished { .. });
                    reporter.report(&event);
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "progress reporter lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
