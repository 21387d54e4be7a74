use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::ErrorClass;

/// Identifier of one submitted task, unique per controller
pub type TaskId = u64;

/// Lifecycle state of a download-convert task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// No work started yet
    Idle = 0,
    /// Enumerating the video or playlist entries
    Resolving = 1,
    /// Fetching the raw audio stream of the current item
    Downloading = 2,
    /// Transcoding the current item to MP3
    Converting = 3,
    /// Writing the cover image into the current MP3
    EmbeddingThumbnail = 4,
    /// Every item was saved
    Completed = 5,
    /// Stopped on user request
    Cancelled = 6,
    /// At least one item (or the resolution itself) failed
    Failed = 7,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskState::Resolving,
            2 => TaskState::Downloading,
            3 => TaskState::Converting,
            4 => TaskState::EmbeddingThumbnail,
            5 => TaskState::Completed,
            6 => TaskState::Cancelled,
            7 => TaskState::Failed,
            _ => TaskState::Idle,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskState::Idle => "idle",
            TaskState::Resolving => "resolving",
            TaskState::Downloading => "downloading",
            TaskState::Converting => "converting",
            TaskState::EmbeddingThumbnail => "embedding thumbnail",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Task state shared between the worker (writer) and the UI (reader).
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Cooperative cancellation signal, set by the UI and polled by the adapters.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What to do with the rest of a playlist when one item fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaylistPolicy {
    /// Keep going and report the failures in the summary
    #[default]
    BestEffort,
    /// Skip every item after the first failure
    StopOnError,
}

impl FromStr for PlaylistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "besteffort" | "continue" => Ok(PlaylistPolicy::BestEffort),
            "stop-on-error" | "stoponerror" | "stop" => Ok(PlaylistPolicy::StopOnError),
            other => Err(format!("unknown playlist policy '{other}'")),
        }
    }
}

/// Which part of an item the progress refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Converting,
}

/// Position of the current item inside the task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    /// Zero-based index in source order
    pub index: usize,
    /// Number of items in the task
    pub count: usize,
    /// Title if already known
    pub title: Option<String>,
}

/// Overall progress of a task
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub phase: Phase,
    /// Overall completion, 0.0 to 100.0, never decreasing within a task
    pub percent: f32,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
}

/// A playlist item that did not make it to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Zero-based item index, `None` when resolving the URL failed
    pub index: Option<usize>,
    pub title: Option<String>,
    pub class: ErrorClass,
    /// Human-readable cause
    pub message: String,
}

/// Result of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Saved(PathBuf),
    Failed(ItemFailure),
}

/// End-of-task aggregate reported with the final event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSummary {
    /// Number of items the URL resolved to
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items not attempted or aborted because of a cancel request
    pub cancelled: usize,
    /// Items not attempted because of [`PlaylistPolicy::StopOnError`] or a setup error
    pub skipped: usize,
    /// Final MP3 paths in source order
    pub outputs: Vec<PathBuf>,
    pub failures: Vec<ItemFailure>,
}

impl TaskSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record_saved(&mut self, path: PathBuf) {
        self.succeeded += 1;
        self.outputs.push(path);
    }

    pub(crate) fn record_failure(&mut self, failure: ItemFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    /// One line suitable for the status bar.
    pub fn message(&self) -> String {
        if self.total <= 1 && self.failures.len() == 1 {
            return self.failures[0].message.clone();
        }
        let mut parts = vec![format!("{} of {} saved", self.succeeded, self.total)];
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        if self.cancelled > 0 {
            parts.push(format!("{} cancelled", self.cancelled));
        }
        if self.skipped > 0 {
            parts.push(format!("{} skipped", self.skipped));
        }
        parts.join(", ")
    }
}

/// Messages sent from the worker to the UI
#[derive(Debug, Clone)]
pub enum TaskEvent {
    StateChanged {
        task_id: TaskId,
        state: TaskState,
        item: Option<ItemInfo>,
    },
    Progress(ProgressEvent),
    /// JPEG bytes of the current item's cover art
    Thumbnail {
        task_id: TaskId,
        jpeg: Arc<[u8]>,
    },
    ItemFinished {
        task_id: TaskId,
        index: usize,
        outcome: ItemOutcome,
    },
    /// Always the last event of a task
    Finished {
        task_id: TaskId,
        state: TaskState,
        summary: TaskSummary,
    },
}
