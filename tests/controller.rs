//! Task lifecycle tests against in-process extractor and transcoder stand-ins.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use url::Url;

use yt2mp3::converter::FractionFn;
use yt2mp3::extractor::ByteProgressFn;
use yt2mp3::{
    ByteProgress, CancelFlag, ControllerSettings, ConvertError, ConvertJob, Downloaded,
    ErrorClass, ExtractError, Extractor, ItemOutcome, PlaylistPolicy, StreamTarget, SubmitError,
    TaskController, TaskEvent, TaskHandle, TaskState, TaskSummary, Transcoder, logging,
};

const CHUNKS: usize = 10;
const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Ok,
    /// Fails permanently after writing part of the download
    Unavailable,
    /// Signals the test after two chunks, then keeps going until cancelled
    GateDownload,
}

#[derive(Default)]
struct FakeExtractor {
    titles: Vec<&'static str>,
    behaviour: HashMap<usize, Behaviour>,
    with_cover: bool,
    /// `resolve` panics instead of returning
    panic_in_resolve: bool,
    /// Held in `resolve` until released
    resolve_gate: Option<Arc<Notify>>,
    reached: Arc<Notify>,
    chunks_sent: AtomicUsize,
    /// Set when a download started in a directory that already held files
    saw_dirty_dir: AtomicBool,
    dirs: Mutex<Vec<PathBuf>>,
}

impl FakeExtractor {
    fn videos(titles: &[&'static str]) -> Self {
        Self {
            titles: titles.to_vec(),
            ..Self::default()
        }
    }

    fn behave(mut self, index: usize, behaviour: Behaviour) -> Self {
        self.behaviour.insert(index, behaviour);
        self
    }

    fn index_of(&self, target: &StreamTarget) -> usize {
        target
            .id
            .as_deref()
            .and_then(|id| id.parse().ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn check_available(&self) -> Result<(), ExtractError> {
        Ok(())
    }

    async fn resolve(&self, _url: &Url, cancel: &CancelFlag) -> Result<Vec<StreamTarget>, ExtractError> {
        if let Some(gate) = &self.resolve_gate {
            gate.notified().await;
        }
        if self.panic_in_resolve {
            panic!("extractor bug");
        }
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        Ok(self
            .titles
            .iter()
            .enumerate()
            .map(|(i, title)| StreamTarget {
                id: Some(i.to_string()),
                url: format!("https://www.youtube.com/watch?v=item{i}"),
                title: Some(title.to_string()),
            })
            .collect())
    }

    async fn download(
        &self,
        target: &StreamTarget,
        workdir: &Path,
        progress: ByteProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<Downloaded, ExtractError> {
        if fs::read_dir(workdir)?.next().is_some() {
            self.saw_dirty_dir.store(true, Ordering::SeqCst);
        }
        self.dirs.lock().unwrap().push(workdir.to_path_buf());

        let index = self.index_of(target);
        let behaviour = self.behaviour.get(&index).copied().unwrap_or(Behaviour::Ok);
        let audio = workdir.join("source.webm");
        fs::write(&audio, b"partial")?;

        for chunk in 1..=CHUNKS {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            self.chunks_sent.fetch_add(1, Ordering::SeqCst);
            progress(ByteProgress {
                done: chunk as u64 * 100,
                total: Some(CHUNKS as u64 * 100),
            });
            match behaviour {
                Behaviour::Unavailable if chunk == 3 => {
                    return Err(ExtractError::Unavailable("Video unavailable".into()));
                }
                Behaviour::GateDownload if chunk == 2 => self.reached.notify_one(),
                _ => {}
            }
            let pause = if behaviour == Behaviour::GateDownload { 20 } else { 1 };
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        if behaviour == Behaviour::GateDownload {
            // never finishes on its own
            while !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Err(ExtractError::Cancelled);
        }

        let thumbnail = if self.with_cover {
            let cover = workdir.join("cover.jpg");
            fs::write(&cover, [0xFF, 0xD8, 0xFF, 0xD9])?;
            Some(cover)
        } else {
            None
        };
        Ok(Downloaded {
            audio,
            thumbnail,
            title: target.title.clone().unwrap_or_default(),
            uploader: Some("Uploader".into()),
            duration: Some(Duration::from_secs(60)),
        })
    }
}

#[derive(Default)]
struct FakeTranscoder {
    unavailable: bool,
    /// Signals the test mid-conversion, then waits for cancellation
    gate: bool,
    reached: Arc<Notify>,
    jobs: Mutex<Vec<ConvertJob>>,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn check_available(&self) -> Result<(), ConvertError> {
        if self.unavailable {
            Err(ConvertError::MissingBinary("ffmpeg".into()))
        } else {
            Ok(())
        }
    }

    async fn convert(
        &self,
        job: &ConvertJob,
        progress: FractionFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ConvertError> {
        self.jobs.lock().unwrap().push(job.clone());
        fs::write(job.partial_output(), b"ID3")?;
        progress(0.5);

        if self.gate {
            self.reached.notify_one();
            while !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            fs::remove_file(job.partial_output())?;
            return Err(ConvertError::Cancelled);
        }

        progress(1.0);
        fs::rename(job.partial_output(), &job.output)?;
        Ok(())
    }
}

struct Fixture {
    controller: TaskController,
    extractor: Arc<FakeExtractor>,
    transcoder: Arc<FakeTranscoder>,
    work_root: TempDir,
    destination: TempDir,
}

impl Fixture {
    fn new(extractor: FakeExtractor, transcoder: FakeTranscoder) -> Self {
        Self::with_policy(extractor, transcoder, PlaylistPolicy::BestEffort)
    }

    fn with_policy(extractor: FakeExtractor, transcoder: FakeTranscoder, policy: PlaylistPolicy) -> Self {
        logging::initialize_for_tests();
        let work_root = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let extractor = Arc::new(extractor);
        let transcoder = Arc::new(transcoder);
        let controller = TaskController::new(
            ControllerSettings {
                work_root: work_root.path().to_path_buf(),
                bitrate_kbps: 320,
                playlist_policy: policy,
            },
            extractor.clone(),
            transcoder.clone(),
            Handle::current(),
        );
        Self {
            controller,
            extractor,
            transcoder,
            work_root,
            destination,
        }
    }

    fn submit(&self, url: &str) -> Result<TaskHandle, SubmitError> {
        self.controller.submit(url, self.destination.path())
    }

    fn saved_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.destination.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn work_root_is_empty(&self) -> bool {
        fs::read_dir(self.work_root.path()).unwrap().next().is_none()
    }
}

/// Every event of the task, up to the channel closing.
async fn drain(mut handle: TaskHandle) -> Vec<TaskEvent> {
    tokio::time::timeout(WAIT, async move {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("task did not finish in time")
}

fn finished(events: &[TaskEvent]) -> (TaskState, TaskSummary) {
    match events.last() {
        Some(TaskEvent::Finished { state, summary, .. }) => (*state, summary.clone()),
        other => panic!("last event is not Finished: {other:?}"),
    }
}

fn states(events: &[TaskEvent]) -> Vec<TaskState> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn percents(events: &[TaskEvent]) -> Vec<f32> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_video_produces_one_mp3_and_no_leftovers() {
    let mut extractor = FakeExtractor::videos(&["Never: Gonna / Give"]);
    extractor.with_cover = true;
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let handle = fx.submit("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
    let events = drain(handle).await;

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Completed);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.saved_files(), vec!["Never_ Gonna _ Give.mp3".to_string()]);
    assert_eq!(
        states(&events),
        vec![
            TaskState::Resolving,
            TaskState::Downloading,
            TaskState::Converting,
            TaskState::EmbeddingThumbnail,
            TaskState::Completed,
        ]
    );
    assert!(events.iter().any(|e| matches!(e, TaskEvent::Thumbnail { .. })));
    assert!(fx.work_root_is_empty());

    let jobs = fx.transcoder.jobs.lock().unwrap();
    assert_eq!(jobs[0].bitrate_kbps, 320);
    assert_eq!(jobs[0].artist.as_deref(), Some("Uploader"));
    assert!(jobs[0].cover.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_never_goes_backwards_and_ends_at_100() {
    let fx = Fixture::new(FakeExtractor::videos(&["a", "b", "c"]), FakeTranscoder::default());

    let events = drain(fx.submit("https://www.youtube.com/playlist?list=PL123").unwrap()).await;

    let percents = percents(&events);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last().copied(), Some(100.0));

    let last_progress = events
        .iter()
        .rposition(|e| matches!(e, TaskEvent::Progress(_)))
        .unwrap();
    let completed = events
        .iter()
        .position(|e| matches!(e, TaskEvent::StateChanged { state: TaskState::Completed, .. }))
        .unwrap();
    assert!(last_progress < completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn playlist_keeps_going_past_a_failed_item() {
    let extractor = FakeExtractor::videos(&["one", "two", "three"]).behave(1, Behaviour::Unavailable);
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let events = drain(fx.submit("https://www.youtube.com/playlist?list=PL123").unwrap()).await;

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Failed);
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 1, 0));
    assert_eq!(summary.failures[0].index, Some(1));
    assert_eq!(summary.failures[0].class, ErrorClass::Permanent);
    assert_eq!(fx.saved_files(), vec!["one.mp3".to_string(), "three.mp3".to_string()]);
    assert!(fx.work_root_is_empty());

    let outcomes: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::ItemFinished { outcome, .. } => Some(matches!(outcome, ItemOutcome::Saved(_))),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![true, false, true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_on_error_skips_the_rest() {
    let extractor = FakeExtractor::videos(&["one", "two", "three", "four"]).behave(1, Behaviour::Unavailable);
    let fx = Fixture::with_policy(extractor, FakeTranscoder::default(), PlaylistPolicy::StopOnError);

    let events = drain(fx.submit("https://www.youtube.com/playlist?list=PL123").unwrap()).await;

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Failed);
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 2));
    assert_eq!(summary.message(), "1 of 4 saved, 1 failed, 2 skipped");
    assert_eq!(fx.saved_files(), vec!["one.mp3".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_download_stops_promptly() {
    let extractor = FakeExtractor::videos(&["slow"]).behave(0, Behaviour::GateDownload);
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let handle = fx.submit("https://youtu.be/abc").unwrap();
    tokio::time::timeout(WAIT, fx.extractor.reached.notified()).await.unwrap();
    let chunks_at_cancel = fx.extractor.chunks_sent.load(Ordering::SeqCst);
    handle.cancel();
    assert!(handle.cancel_requested());
    let events = drain(handle).await;

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Cancelled);
    assert_eq!(summary.cancelled, 1);
    let chunks_after_cancel = fx.extractor.chunks_sent.load(Ordering::SeqCst) - chunks_at_cancel;
    assert!(chunks_after_cancel <= 2, "{chunks_after_cancel} chunks after cancel");
    assert!(fx.transcoder.jobs.lock().unwrap().is_empty());
    assert!(fx.saved_files().is_empty());
    assert!(fx.work_root_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_conversion_leaves_no_output() {
    let transcoder = FakeTranscoder {
        gate: true,
        ..FakeTranscoder::default()
    };
    let fx = Fixture::new(FakeExtractor::videos(&["a", "b"]), transcoder);

    let handle = fx.submit("https://www.youtube.com/playlist?list=PL1").unwrap();
    tokio::time::timeout(WAIT, fx.transcoder.reached.notified()).await.unwrap();
    // the half-written MP3 lives in the task directory, not next to the user's files
    assert!(fx.saved_files().is_empty());
    assert!(!fx.work_root_is_empty());
    handle.cancel();
    let events = drain(handle).await;

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Cancelled);
    assert_eq!((summary.succeeded, summary.cancelled), (0, 2));
    assert!(fx.saved_files().is_empty());
    assert!(fx.work_root_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_submission_is_rejected_while_busy() {
    let gate = Arc::new(Notify::new());
    let extractor = FakeExtractor {
        resolve_gate: Some(gate.clone()),
        ..FakeExtractor::videos(&["a"])
    };
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let first = fx.submit("https://youtu.be/first").unwrap();
    assert!(fx.controller.is_busy());
    assert_matches!(fx.submit("https://youtu.be/second"), Err(SubmitError::Busy));

    gate.notify_one();
    let (state, _) = finished(&drain(first).await);
    assert_eq!(state, TaskState::Completed);
    assert!(!fx.controller.is_busy());

    gate.notify_one();
    let again = fx.submit("https://youtu.be/third").unwrap();
    assert_eq!(finished(&drain(again).await).0, TaskState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_transcoder_is_a_setup_error() {
    let transcoder = FakeTranscoder {
        unavailable: true,
        ..FakeTranscoder::default()
    };
    let fx = Fixture::new(FakeExtractor::videos(&["a"]), transcoder);

    let err = fx.submit("https://youtu.be/abc").unwrap_err();
    assert_matches!(err, SubmitError::Setup(_));
    assert_eq!(err.class(), ErrorClass::Environment);
    assert!(!fx.controller.is_busy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_input_never_starts_a_worker() {
    let fx = Fixture::new(FakeExtractor::videos(&["a"]), FakeTranscoder::default());

    assert_matches!(fx.submit("not a url"), Err(SubmitError::InvalidInput(_)));
    assert_matches!(fx.submit("   "), Err(SubmitError::InvalidInput(_)));
    assert!(!fx.controller.is_busy());
    assert!(fx.work_root_is_empty());

    // ids are only handed out to tasks that actually start
    let handle = fx.submit("https://youtu.be/abc").unwrap();
    assert_eq!(handle.id(), 1);
    drain(handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_after_failure_starts_from_a_clean_directory() {
    let extractor = FakeExtractor::videos(&["broken"]).behave(0, Behaviour::Unavailable);
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let (state, summary) = finished(&drain(fx.submit("https://youtu.be/abc").unwrap()).await);
    assert_eq!(state, TaskState::Failed);
    assert!(summary.message().contains("Video unavailable"), "{}", summary.message());
    assert!(fx.work_root_is_empty());

    drain(fx.submit("https://youtu.be/abc").unwrap()).await;
    assert!(!fx.extractor.saw_dirty_dir.load(Ordering::SeqCst));
    let dirs = fx.extractor.dirs.lock().unwrap();
    assert_eq!(dirs.len(), 2);
    assert_ne!(dirs[0], dirs[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_is_the_last_event_and_the_handle_sees_the_final_state() {
    let fx = Fixture::new(FakeExtractor::videos(&["a"]), FakeTranscoder::default());

    let mut handle = fx.submit("https://youtu.be/abc").unwrap();
    let mut events = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
    })
    .await
    .unwrap();

    assert_eq!(handle.state(), TaskState::Completed);
    assert!(handle.state().is_terminal());
    let finished_at = events
        .iter()
        .position(|e| matches!(e, TaskEvent::Finished { .. }))
        .unwrap();
    assert_eq!(finished_at, events.len() - 1);
    assert!(handle.try_next_event().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_panicking_adapter_still_finishes_the_task() {
    let extractor = FakeExtractor {
        panic_in_resolve: true,
        ..FakeExtractor::videos(&["a"])
    };
    let fx = Fixture::new(extractor, FakeTranscoder::default());

    let mut handle = fx.submit("https://youtu.be/abc").unwrap();
    let mut events = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
    })
    .await
    .unwrap();

    let (state, summary) = finished(&events);
    assert_eq!(state, TaskState::Failed);
    assert_eq!(summary.failed, 1);
    assert_eq!(handle.state(), TaskState::Failed);
    assert!(!fx.controller.is_busy());
    assert!(fx.work_root_is_empty());
}
