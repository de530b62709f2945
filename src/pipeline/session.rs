//! Progress reporting for a running analysis.
//!
//! The pipeline reports through [`ProgressObserver`]. [`AnalysisSession`] is
//! the in-memory implementation: the run appends, a poller drains with a
//! cursor. Appends hold the lock only for a push, so the run never waits on
//! the consumer.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Receives progress from a run.
pub trait ProgressObserver: Send + Sync {
    fn add_log(&self, message: &str, level: LogLevel);
    fn update_step(&self, step: &str);
    fn update_status(&self, status: RunStatus, error: Option<&str>);
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub log_count: usize,
}

#[derive(Debug)]
struct SessionState {
    status: RunStatus,
    current_step: Option<String>,
    error: Option<String>,
    logs: Vec<LogEntry>,
}

/// Per-run progress record, shared between the run and its poller.
#[derive(Debug)]
pub struct AnalysisSession {
    id: Uuid,
    state: Mutex<SessionState>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                status: RunStatus::Queued,
                current_step: None,
                error: None,
                logs: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    // Every mutation is a single push or assignment; a poisoned lock still
    // guards consistent state.
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entries appended since `cursor`, and the cursor to pass next time.
    pub fn logs_since(&self, cursor: usize) -> (Vec<LogEntry>, usize) {
        let state = self.state();
        let start = cursor.min(state.logs.len());
        (state.logs[start..].to_vec(), state.logs.len())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            id: self.id,
            status: state.status,
            current_step: state.current_step.clone(),
            error: state.error.clone(),
            log_count: state.logs.len(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state().status
    }
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for AnalysisSession {
    fn add_log(&self, message: &str, level: LogLevel) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        };
        self.state().logs.push(entry);
    }

    fn update_step(&self, step: &str) {
        self.state().current_step = Some(step.to_string());
    }

    fn update_status(&self, status: RunStatus, error: Option<&str>) {
        let mut state = self.state();
        state.status = status;
        state.error = error.map(str::to_string);
    }
}
