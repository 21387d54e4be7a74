//! Download-and-convert task lifecycle.
//!
//! The controller validates a request, spawns one worker per task on the
//! tokio runtime and hands back a [`TaskHandle`]. The worker resolves the
//! URL, then downloads and converts each item in source order, sending
//! [`TaskEvent`]s back over a channel. Every task owns a scratch directory
//! that is removed when the task ends, however it ends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::converter::{ConvertJob, Ffmpeg, Transcoder};
use crate::error::{ConvertError, ErrorClass, ExtractError, SubmitError, user_message};
use crate::extractor::{Extractor, StreamTarget, YtDlp};
use crate::filename::unique_output_path;
use crate::model::{
    CancelFlag, ItemFailure, ItemInfo, ItemOutcome, Phase, PlaylistPolicy, StateCell, TaskEvent,
    TaskId, TaskState, TaskSummary,
};
use crate::progress::{ByteProgress, ProgressTracker};
use crate::request::DownloadRequest;
use crate::tools::{self, Tool};

/// Prefix of every per-task scratch directory.
const TASK_DIR_PREFIX: &str = "task-";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Parent of the per-task scratch directories
    pub work_root: PathBuf,
    pub bitrate_kbps: u32,
    pub playlist_policy: PlaylistPolicy,
}

impl From<&AppConfig> for ControllerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            work_root: config.work_dir(),
            bitrate_kbps: config.bitrate_kbps,
            playlist_policy: config.playlist_policy,
        }
    }
}

/// Starts tasks; at most one runs at a time.
///
/// A request submitted while a task is active is rejected with
/// [`SubmitError::Busy`]; playlist items are never queued across tasks.
pub struct TaskController {
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    runtime: Handle,
    settings: ControllerSettings,
    next_id: AtomicU64,
    active: Arc<AtomicBool>,
}

impl TaskController {
    pub fn new(
        settings: ControllerSettings,
        extractor: Arc<dyn Extractor>,
        transcoder: Arc<dyn Transcoder>,
        runtime: Handle,
    ) -> Self {
        if let Err(err) = sweep_stale_task_dirs(&settings.work_root) {
            warn!(
                "Could not clean {}: {err}",
                settings.work_root.display()
            );
        }
        Self {
            extractor,
            transcoder,
            runtime,
            settings,
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Controller wired to the real yt-dlp and ffmpeg.
    ///
    /// A tool that cannot be found is logged here and reported as a setup
    /// error when the first task is submitted.
    pub fn from_config(config: &AppConfig, runtime: Handle) -> Self {
        let bin_dir = config.bin_dir();
        let ffmpeg = locate_or_name(Tool::Ffmpeg, config.ffmpeg.as_deref(), &bin_dir);
        let ytdlp = locate_or_name(Tool::YtDlp, config.ytdlp.as_deref(), &bin_dir);
        Self::new(
            ControllerSettings::from(config),
            Arc::new(YtDlp::new(ytdlp).with_ffmpeg(ffmpeg.clone())),
            Arc::new(Ffmpeg::new(ffmpeg)),
            runtime,
        )
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Validates the form input and starts a task for it.
    pub fn submit(&self, url: &str, destination: &Path) -> Result<TaskHandle, SubmitError> {
        let request = DownloadRequest::new(url, destination)?;
        self.start(request)
    }

    /// Spawns the worker for `request`.
    pub fn start(&self, request: DownloadRequest) -> Result<TaskHandle, SubmitError> {
        self.transcoder
            .check_available()
            .map_err(|e| SubmitError::Setup(e.to_string()))?;
        self.extractor
            .check_available()
            .map_err(|e| SubmitError::Setup(e.to_string()))?;

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubmitError::Busy);
        }
        let active = ActiveGuard(self.active.clone());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = unbounded_channel();
        let cancel = CancelFlag::new();
        let state = StateCell::default();

        info!(
            "Task {id}: {} -> {}{}",
            request.url(),
            request.destination().display(),
            if request.is_playlist() { " (playlist)" } else { "" }
        );

        let supervisor = Supervisor {
            id,
            state: state.clone(),
            events: events_tx.clone(),
        };
        let worker = Worker {
            id,
            active: Some(active),
            request,
            extractor: self.extractor.clone(),
            transcoder: self.transcoder.clone(),
            settings: self.settings.clone(),
            cancel: cancel.clone(),
            state: state.clone(),
            events: events_tx,
        };
        let worker = self.runtime.spawn(worker.run());
        self.runtime.spawn(supervisor.watch(worker));

        Ok(TaskHandle {
            id,
            events: events_rx,
            cancel,
            state,
        })
    }
}

/// UI side of a running task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    events: UnboundedReceiver<TaskEvent>,
    cancel: CancelFlag,
    state: StateCell,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Asks the worker to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Latest state written by the worker.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Non-blocking poll for the frame loop.
    pub fn try_next_event(&mut self) -> Option<TaskEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next event; `None` once the task has finished and
    /// every event was received.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }
}

/// Clears the busy flag when the worker ends, even if it panics.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sends the closing events for a worker that panicked.
struct Supervisor {
    id: TaskId,
    state: StateCell,
    events: UnboundedSender<TaskEvent>,
}

impl Supervisor {
    async fn watch(self, worker: JoinHandle<()>) {
        let Err(err) = worker.await else {
            return;
        };
        // the worker's TempDir and busy guard were dropped while unwinding
        error!("Task {}: worker stopped unexpectedly: {err}", self.id);
        let mut summary = TaskSummary::new(0);
        summary.record_failure(ItemFailure {
            index: None,
            title: None,
            class: ErrorClass::Permanent,
            message: "Internal error, see the log for details".to_string(),
        });
        self.state.set(TaskState::Failed);
        let _ = self.events.send(TaskEvent::StateChanged {
            task_id: self.id,
            state: TaskState::Failed,
            item: None,
        });
        let _ = self.events.send(TaskEvent::Finished {
            task_id: self.id,
            state: TaskState::Failed,
            summary,
        });
    }
}

enum ItemError {
    Cancelled,
    Failed(ErrorClass, String),
}

impl From<ExtractError> for ItemError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Cancelled => ItemError::Cancelled,
            other => ItemError::Failed(other.class(), other.to_string()),
        }
    }
}

impl From<ConvertError> for ItemError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Cancelled => ItemError::Cancelled,
            other => ItemError::Failed(other.class(), other.to_string()),
        }
    }
}

struct Worker {
    id: TaskId,
    /// Released right before the final event so the UI can resubmit at once
    active: Option<ActiveGuard>,
    request: DownloadRequest,
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    settings: ControllerSettings,
    cancel: CancelFlag,
    state: StateCell,
    events: UnboundedSender<TaskEvent>,
}

impl Worker {
    async fn run(mut self) {
        let (state, summary) = match self.create_workspace() {
            Ok(workspace) => {
                let outcome = self.execute(workspace.path()).await;
                let dir = workspace.path().to_path_buf();
                if let Err(err) = workspace.close() {
                    error!("Task {}: could not remove {}: {err}", self.id, dir.display());
                }
                outcome
            }
            Err(err) => {
                error!("Task {}: no scratch directory: {err}", self.id);
                let mut summary = TaskSummary::new(0);
                summary.record_failure(ItemFailure {
                    index: None,
                    title: None,
                    class: ErrorClass::Environment,
                    message: format!("Could not create a temporary directory: {err}"),
                });
                (TaskState::Failed, summary)
            }
        };

        info!("Task {} {state}: {}", self.id, summary.message());
        self.transition(state, None);
        drop(self.active.take());
        self.emit(TaskEvent::Finished {
            task_id: self.id,
            state,
            summary,
        });
    }

    fn create_workspace(&self) -> io::Result<TempDir> {
        fs::create_dir_all(&self.settings.work_root)?;
        tempfile::Builder::new()
            .prefix(&format!("{TASK_DIR_PREFIX}{}-", self.id))
            .tempdir_in(&self.settings.work_root)
    }

    async fn execute(&self, workspace: &Path) -> (TaskState, TaskSummary) {
        self.transition(TaskState::Resolving, None);
        let targets = match self.extractor.resolve(self.request.url(), &self.cancel).await {
            Ok(targets) => targets,
            Err(ExtractError::Cancelled) => return (TaskState::Cancelled, TaskSummary::new(0)),
            Err(err) => {
                warn!("Task {}: resolving failed: {err}", self.id);
                let mut summary = TaskSummary::new(0);
                summary.record_failure(ItemFailure {
                    index: None,
                    title: None,
                    class: err.class(),
                    message: user_message(err.class(), &err.to_string()),
                });
                return (TaskState::Failed, summary);
            }
        };

        let count = targets.len();
        let mut summary = TaskSummary::new(count);
        let tracker = Mutex::new(ProgressTracker::new(self.id, count));

        for (index, target) in targets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled += count - index;
                break;
            }

            let item_dir = workspace.join(format!("item-{index:04}"));
            let result = match fs::create_dir(&item_dir) {
                Ok(()) => self.process_item(index, count, target, &item_dir, &tracker).await,
                Err(err) => Err(ItemError::Failed(ErrorClass::Environment, err.to_string())),
            };
            // large playlists must not pile up raw audio
            if let Err(err) = fs::remove_dir_all(&item_dir) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Task {}: could not remove {}: {err}", self.id, item_dir.display());
                }
            }

            match result {
                Ok(path) => {
                    info!("Task {}: saved {}", self.id, path.display());
                    summary.record_saved(path.clone());
                    self.emit(TaskEvent::ItemFinished {
                        task_id: self.id,
                        index,
                        outcome: ItemOutcome::Saved(path),
                    });
                }
                Err(ItemError::Cancelled) => {
                    summary.cancelled += count - index;
                    break;
                }
                Err(ItemError::Failed(class, message)) => {
                    warn!("Task {}: item {index} failed: {message}", self.id);
                    let failure = ItemFailure {
                        index: Some(index),
                        title: target.title.clone(),
                        class,
                        message: user_message(class, &message),
                    };
                    summary.record_failure(failure.clone());
                    self.emit(TaskEvent::ItemFinished {
                        task_id: self.id,
                        index,
                        outcome: ItemOutcome::Failed(failure),
                    });
                    let abort = class == ErrorClass::Environment
                        || self.settings.playlist_policy == PlaylistPolicy::StopOnError;
                    if abort {
                        summary.skipped += count - index - 1;
                        break;
                    }
                }
            }

            tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish_item();
        }

        if summary.cancelled > 0 {
            (TaskState::Cancelled, summary)
        } else if summary.failed > 0 || summary.skipped > 0 {
            (TaskState::Failed, summary)
        } else {
            let done = tracker.lock().unwrap_or_else(PoisonError::into_inner).complete();
            self.emit(TaskEvent::Progress(done));
            (TaskState::Completed, summary)
        }
    }

    async fn process_item(
        &self,
        index: usize,
        count: usize,
        target: &StreamTarget,
        item_dir: &Path,
        tracker: &Mutex<ProgressTracker>,
    ) -> Result<PathBuf, ItemError> {
        let item = |title: Option<String>| ItemInfo {
            index,
            count,
            title,
        };
        self.transition(TaskState::Downloading, Some(item(target.title.clone())));
        self.report(tracker, Phase::Downloading, Some(0.0), None);

        let on_bytes = |bytes: ByteProgress| {
            self.report(tracker, Phase::Downloading, bytes.fraction(), Some(bytes));
        };
        let downloaded = self
            .extractor
            .download(target, item_dir, &on_bytes, &self.cancel)
            .await?;

        if let Some(cover) = &downloaded.thumbnail {
            match tokio::fs::read(cover).await {
                Ok(bytes) => self.emit(TaskEvent::Thumbnail {
                    task_id: self.id,
                    jpeg: bytes.into(),
                }),
                Err(err) => debug!("Task {}: thumbnail preview unavailable: {err}", self.id),
            }
        }

        let output = unique_output_path(self.request.destination(), &downloaded.title);
        let job = ConvertJob {
            input: downloaded.audio.clone(),
            output: output.clone(),
            bitrate_kbps: self.settings.bitrate_kbps,
            cover: downloaded.thumbnail.clone(),
            title: Some(downloaded.title.clone()),
            artist: downloaded.uploader.clone(),
            duration: downloaded.duration,
        };

        let title = Some(downloaded.title.clone());
        self.transition(TaskState::Converting, Some(item(title.clone())));
        self.report(tracker, Phase::Converting, Some(0.0), None);

        // cover and audio go through one ffmpeg run; once the audio is
        // encoded the remaining work is muxing the cover
        let embedding = AtomicBool::new(false);
        let enter_embedding = || {
            if job.cover.is_some() && !embedding.swap(true, Ordering::AcqRel) {
                self.transition(TaskState::EmbeddingThumbnail, Some(item(title.clone())));
            }
        };
        let on_fraction = |fraction: f32| {
            self.report(tracker, Phase::Converting, Some(fraction), None);
            if fraction >= 1.0 {
                enter_embedding();
            }
        };
        self.transcoder.convert(&job, &on_fraction, &self.cancel).await?;
        enter_embedding();

        Ok(output)
    }

    fn report(
        &self,
        tracker: &Mutex<ProgressTracker>,
        phase: Phase,
        fraction: Option<f32>,
        bytes: Option<ByteProgress>,
    ) {
        let event = tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(phase, fraction, bytes);
        if let Some(event) = event {
            self.emit(TaskEvent::Progress(event));
        }
    }

    fn transition(&self, state: TaskState, item: Option<ItemInfo>) {
        debug!("Task {} -> {state}", self.id);
        self.state.set(state);
        self.emit(TaskEvent::StateChanged {
            task_id: self.id,
            state,
            item,
        });
    }

    fn emit(&self, event: TaskEvent) {
        // the UI may have dropped the handle; the task still runs to the end
        let _ = self.events.send(event);
    }
}

fn locate_or_name(tool: Tool, configured: Option<&Path>, bin_dir: &Path) -> PathBuf {
    tools::locate(tool, configured, bin_dir).unwrap_or_else(|err| {
        warn!("{err}");
        configured
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(tool.file_name()))
    })
}

/// Removes scratch directories left behind by a previous run that crashed.
fn sweep_stale_task_dirs(work_root: &Path) -> io::Result<()> {
    fs::create_dir_all(work_root)?;
    for entry in fs::read_dir(work_root)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(TASK_DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => info!("Removed stale {}", path.display()),
            Err(err) => warn!("Could not remove stale {}: {err}", path.display()),
        }
    }
    Ok(())
}
