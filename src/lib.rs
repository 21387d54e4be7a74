//! YouTube to MP3: download the audio of a video or playlist, transcode it to
//! 320 kbps MP3 with ffmpeg and embed the thumbnail as cover art.
//!
//! The GUI lives in the binary; this library holds the task lifecycle and
//! the adapters around the external yt-dlp and ffmpeg executables.

// Defaults and YT2MP3_* overrides
pub mod config;
// Task lifecycle and the worker
pub mod controller;
// ffmpeg adapter
pub mod converter;
// Error types and their classes
pub mod error;
// yt-dlp adapter
pub mod extractor;
// Output file naming
pub mod filename;
// Terminal and file logger
pub mod logging;
// Task state, events and summary
pub mod model;
// Child processes with cancellation
pub mod process;
// Progress line parsing and overall percent
pub mod progress;
// Form input validation
pub mod request;
// Cover art download
pub mod thumbnail;
// Bundled and installed tool lookup
pub mod tools;

pub use config::AppConfig;
pub use controller::{ControllerSettings, TaskController, TaskHandle};
pub use converter::{ConvertJob, Ffmpeg, Transcoder};
pub use error::{ConvertError, ErrorClass, ExtractError, InputError, SubmitError};
pub use extractor::{Downloaded, Extractor, StreamTarget, YtDlp};
pub use model::{
    CancelFlag, ItemFailure, ItemInfo, ItemOutcome, Phase, PlaylistPolicy, ProgressEvent,
    TaskEvent, TaskId, TaskState, TaskSummary,
};
pub use progress::ByteProgress;
pub use request::DownloadRequest;
