use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

use crate::config::DEFAULT_BITRATE_KBPS;
use crate::error::ConvertError;
use crate::model::CancelFlag;
use crate::process::{RunOutcome, run_streaming};
use crate::progress::{FfmpegProgress, parse_ffmpeg_line};
use crate::tools;

const PARTIAL_FILE: &str = "output.mp3.part";

/// One transcoding run
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertJob {
    /// Raw audio as downloaded
    pub input: PathBuf,
    /// Final MP3 path; only created when the conversion succeeds
    pub output: PathBuf,
    pub bitrate_kbps: u32,
    /// JPEG embedded as front cover
    pub cover: Option<PathBuf>,
    pub title: Option<String>,
    pub artist: Option<String>,
    /// Input length, used to turn ffmpeg timestamps into a fraction
    pub duration: Option<Duration>,
}

impl ConvertJob {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            cover: None,
            title: None,
            artist: None,
            duration: None,
        }
    }

    /// Where ffmpeg writes before the result is moved to `output`. Sits
    /// beside the input in the scratch directory, never in the destination.
    pub fn partial_output(&self) -> PathBuf {
        self.input.with_file_name(PARTIAL_FILE)
    }
}

/// Progress callback taking the finished fraction of the current job.
pub type FractionFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Transcodes downloaded audio to MP3.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Fails with [`ConvertError::MissingBinary`] when the backend cannot run at all.
    fn check_available(&self) -> Result<(), ConvertError>;

    /// Converts `job.input` into `job.output`. On failure or cancellation
    /// no file is left at `job.output`.
    async fn convert(
        &self,
        job: &ConvertJob,
        progress: FractionFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ConvertError>;
}

/// [`Transcoder`] backed by the ffmpeg executable
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Full argument list for `job`, writing to `target`.
    pub fn arguments(job: &ConvertJob, target: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push("-i".into());
        args.push(job.input.clone().into());

        match &job.cover {
            Some(cover) => {
                args.push("-i".into());
                args.push(cover.clone().into());
                for a in [
                    "-map", "0:a:0",
                    "-map", "1:0",
                    "-c:v", "mjpeg",
                    "-disposition:v:0", "attached_pic",
                    "-metadata:s:v", "title=Album cover",
                    "-metadata:s:v", "comment=Cover (front)",
                ] {
                    args.push(a.into());
                }
            }
            None => {
                for a in ["-map", "0:a:0", "-vn"] {
                    args.push(a.into());
                }
            }
        }

        for a in ["-c:a", "libmp3lame", "-b:a"] {
            args.push(a.into());
        }
        args.push(format!("{}k", job.bitrate_kbps).into());
        for a in ["-id3v2_version", "3", "-write_id3v1", "1"] {
            args.push(a.into());
        }
        if let Some(title) = &job.title {
            args.push("-metadata".into());
            args.push(format!("title={title}").into());
        }
        if let Some(artist) = &job.artist {
            args.push("-metadata".into());
            args.push(format!("artist={artist}").into());
        }
        for a in ["-progress", "pipe:1", "-nostats", "-f", "mp3"] {
            args.push(a.into());
        }
        args.push(target.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    fn check_available(&self) -> Result<(), ConvertError> {
        if tools::is_executable(&self.program) {
            Ok(())
        } else {
            Err(ConvertError::MissingBinary(self.program.display().to_string()))
        }
    }

    async fn convert(
        &self,
        job: &ConvertJob,
        progress: FractionFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), ConvertError> {
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        self.check_available()?;

        let partial = job.partial_output();
        let args = Self::arguments(job, &partial);
        debug!("{} {:?}", self.program.display(), args);
        let mut cmd = Command::new(&self.program);
        cmd.args(&args);

        let outcome = run_streaming(cmd, cancel, |line| match parse_ffmpeg_line(line) {
            Some(FfmpegProgress::OutTime(at)) => {
                if let Some(total) = job.duration.filter(|d| !d.is_zero()) {
                    progress((at.as_secs_f64() / total.as_secs_f64()).min(1.0) as f32);
                }
            }
            Some(FfmpegProgress::End) => progress(1.0),
            None => {}
        })
        .await;

        let result = match outcome {
            Ok(RunOutcome::Exited { status, .. }) if status.success() => {
                move_into_place(&partial, &job.output).await.map_err(ConvertError::from)
            }
            Ok(RunOutcome::Exited { status, stderr }) => Err(ConvertError::ConversionFailed {
                code: status.code(),
                diagnostics: stderr,
            }),
            Ok(RunOutcome::Cancelled) => Err(ConvertError::Cancelled),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ConvertError::MissingBinary(self.program.display().to_string()))
            }
            Err(err) => Err(ConvertError::Io(err)),
        };

        if result.is_err() {
            remove_if_present(&partial).await;
        }
        result
    }
}

/// Renames `from` to `to`, copying when they sit on different filesystems.
async fn move_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    let rename_err = match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    debug!("Rename to {} failed ({rename_err}), copying instead", to.display());
    if tokio::fs::copy(from, to).await.is_err() {
        remove_if_present(to).await;
        return Err(rename_err);
    }
    remove_if_present(from).await;
    Ok(())
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("Could not remove partial output {}: {err}", path.display()),
    }
}
