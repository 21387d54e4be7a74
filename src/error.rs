use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// How a failure is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad URL or destination, rejected before a task starts.
    InvalidInput,
    /// Network hiccup; the user may retry the whole task.
    Transient,
    /// Video unavailable, private, region-locked; skipped in playlists.
    Permanent,
    /// Missing or broken external tool.
    Environment,
    /// Stopped on request. Never styled as an error.
    Cancelled,
}

/// Rejections raised while validating a [`crate::DownloadRequest`].
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Please paste a YouTube link.")]
    EmptyUrl,

    #[error("Not a valid link: {0}")]
    MalformedUrl(String),

    #[error("Only http and https links are supported (got {0})")]
    UnsupportedScheme(String),

    #[error("Download path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Download path is not writable: {path}: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reasons [`crate::TaskController::start`] refuses to spawn a worker.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),

    #[error("A download is already running")]
    Busy,

    #[error("Setup error: {0}")]
    Setup(String),
}

impl SubmitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SubmitError::InvalidInput(_) | SubmitError::Busy => ErrorClass::InvalidInput,
            SubmitError::Setup(_) => ErrorClass::Environment,
        }
    }
}

/// Failures surfaced by the extraction adapter.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("yt-dlp is not installed or not executable ({0})")]
    MissingBinary(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Video unavailable: {0}")]
    Unavailable(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("yt-dlp failed: {0}")]
    Tool(String),

    #[error("Unexpected yt-dlp output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ExtractError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractError::MissingBinary(_) => ErrorClass::Environment,
            ExtractError::InvalidUrl(_) => ErrorClass::InvalidInput,
            ExtractError::Network(_) => ErrorClass::Transient,
            ExtractError::Unavailable(_) => ErrorClass::Permanent,
            ExtractError::Cancelled => ErrorClass::Cancelled,
            ExtractError::Tool(_) | ExtractError::Parse(_) | ExtractError::Io(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Failures surfaced by the transcoding adapter.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("ffmpeg is not installed or not executable ({0})")]
    MissingBinary(String),

    #[error("Conversion failed (exit code {code:?}): {diagnostics}")]
    ConversionFailed {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConvertError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConvertError::MissingBinary(_) => ErrorClass::Environment,
            ConvertError::ConversionFailed { .. } | ConvertError::Io(_) => ErrorClass::Permanent,
            ConvertError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Failures while locating or unpacking an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found (looked at {looked_at})")]
    NotFound { tool: &'static str, looked_at: String },

    #[error("Could not unpack bundled {tool}: {source}")]
    Unpack {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Text shown to the user for a failure of the given class.
pub fn user_message(class: ErrorClass, detail: &str) -> String {
    match class {
        ErrorClass::Transient => format!("{detail} (check your connection and try again)"),
        _ => detail.to_string(),
    }
}
