use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;
use url::Url;

use crate::error::ExtractError;
use crate::model::CancelFlag;
use crate::process::{RunOutcome, run_streaming};
use crate::progress::{ByteProgress, DOWNLOAD_TEMPLATE, parse_download_line};
use crate::thumbnail;
use crate::tools;

/// Stem of the raw audio file inside an item's work directory.
const AUDIO_STEM: &str = "source";
const COVER_FILE: &str = "cover.jpg";

/// One downloadable entry of a resolved URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub id: Option<String>,
    /// Page URL handed back to yt-dlp for the actual download
    pub url: String,
    /// Title from the flat listing; may be missing or a placeholder
    pub title: Option<String>,
}

/// Files produced for one target, all inside the work directory
#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub audio: PathBuf,
    pub thumbnail: Option<PathBuf>,
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<Duration>,
}

/// Progress callback invoked from the download loop.
pub type ByteProgressFn<'a> = &'a (dyn Fn(ByteProgress) + Send + Sync);

/// Resolves video-site URLs and downloads their audio.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fails with [`ExtractError::MissingBinary`] when the backend cannot run at all.
    fn check_available(&self) -> Result<(), ExtractError>;

    /// Lists the entries behind `url` in source order: one for a video,
    /// one per item for a playlist.
    async fn resolve(&self, url: &Url, cancel: &CancelFlag) -> Result<Vec<StreamTarget>, ExtractError>;

    /// Downloads the best audio stream of `target` (and its thumbnail, when
    /// there is one) into `workdir`.
    async fn download(
        &self,
        target: &StreamTarget,
        workdir: &Path,
        progress: ByteProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<Downloaded, ExtractError>;
}

/// [`Extractor`] backed by the yt-dlp executable
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ffmpeg_location: None,
        }
    }

    /// Lets yt-dlp use our ffmpeg for container fixups.
    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg_location = Some(ffmpeg.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--ignore-config", "--no-warnings", "--no-color"]);
        if let Some(ffmpeg) = &self.ffmpeg_location {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }
        cmd
    }

    /// Runs yt-dlp to completion and returns its stdout.
    async fn capture(&self, cmd: Command, cancel: &CancelFlag) -> Result<String, ExtractError> {
        let mut stdout = String::new();
        let outcome = run_streaming(cmd, cancel, |line| {
            stdout.push_str(line);
            stdout.push('\n');
        })
        .await
        .map_err(|e| self.spawn_error(e))?;
        match outcome {
            RunOutcome::Cancelled => Err(ExtractError::Cancelled),
            RunOutcome::Exited { status, .. } if status.success() => Ok(stdout),
            RunOutcome::Exited { stderr, .. } => Err(classify_failure(&stderr)),
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> ExtractError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ExtractError::MissingBinary(self.program.display().to_string())
        } else {
            ExtractError::Io(err)
        }
    }

    async fn fetch_item_info(&self, url: &str, cancel: &CancelFlag) -> Result<ItemInfo, ExtractError> {
        let mut cmd = self.command();
        cmd.args(["--no-playlist", "--skip-download", "--dump-single-json"])
            .arg(url);
        let json = self.capture(cmd, cancel).await?;
        serde_json::from_str(json.trim()).map_err(|e| ExtractError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn check_available(&self) -> Result<(), ExtractError> {
        if tools::is_executable(&self.program) {
            Ok(())
        } else {
            Err(ExtractError::MissingBinary(self.program.display().to_string()))
        }
    }

    async fn resolve(&self, url: &Url, cancel: &CancelFlag) -> Result<Vec<StreamTarget>, ExtractError> {
        let mut cmd = self.command();
        cmd.args(["--flat-playlist", "--yes-playlist", "--dump-single-json"])
            .arg(url.as_str());
        debug!("Resolving {url}");
        let json = self.capture(cmd, cancel).await?;
        let targets = parse_targets(&json, url)?;
        info!("{url} resolved to {} item(s)", targets.len());
        Ok(targets)
    }

    async fn download(
        &self,
        target: &StreamTarget,
        workdir: &Path,
        progress: ByteProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<Downloaded, ExtractError> {
        let info = self.fetch_item_info(&target.url, cancel).await?;
        let title = info
            .title
            .clone()
            .or_else(|| target.title.clone())
            .unwrap_or_else(|| "untitled".to_string());

        let mut cmd = self.command();
        cmd.args(["-f", "bestaudio/best", "--no-playlist", "--no-mtime", "--newline"])
            .args(["--progress-template", DOWNLOAD_TEMPLATE])
            .arg("-o")
            .arg(workdir.join(format!("{AUDIO_STEM}.%(ext)s")))
            .arg(&target.url);

        let outcome = run_streaming(cmd, cancel, |line| match parse_download_line(line) {
            Some(bytes) => progress(bytes),
            None => debug!("yt-dlp> {line}"),
        })
        .await
        .map_err(|e| self.spawn_error(e))?;
        match outcome {
            RunOutcome::Cancelled => return Err(ExtractError::Cancelled),
            RunOutcome::Exited { status, stderr } if !status.success() => {
                warn!("yt-dlp exited with {status} for {}", target.url);
                return Err(classify_failure(&stderr));
            }
            RunOutcome::Exited { .. } => {}
        }

        let audio = find_audio_file(workdir)?;
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let thumbnail_url = info.thumbnail.clone().or_else(|| {
            info.id
                .as_deref()
                .or(target.id.as_deref())
                .map(thumbnail::youtube_thumbnail_url)
        });
        let thumbnail = match thumbnail_url {
            Some(url) => fetch_thumbnail(url, workdir.join(COVER_FILE)).await,
            None => None,
        };

        Ok(Downloaded {
            audio,
            thumbnail,
            title,
            uploader: info.uploader,
            duration: info.duration.and_then(item_duration),
        })
    }
}

async fn fetch_thumbnail(url: String, dest: PathBuf) -> Option<PathBuf> {
    let fetched = tokio::task::spawn_blocking(move || thumbnail::fetch_cover(&url, &dest)).await;
    match fetched {
        Ok(Ok(path)) => Some(path),
        Ok(Err(err)) => {
            warn!("No cover art: {err}");
            None
        }
        Err(err) => {
            warn!("Thumbnail fetch task failed: {err}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlatListing {
    id: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    entries: Option<Vec<Option<FlatEntry>>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
}

/// Turns `--flat-playlist --dump-single-json` output into download targets.
pub fn parse_targets(json: &str, requested: &Url) -> Result<Vec<StreamTarget>, ExtractError> {
    let listing: FlatListing =
        serde_json::from_str(json.trim()).map_err(|e| ExtractError::Parse(e.to_string()))?;

    let Some(entries) = listing.entries else {
        return Ok(vec![StreamTarget {
            id: listing.id,
            url: listing
                .webpage_url
                .unwrap_or_else(|| requested.as_str().to_string()),
            title: listing.title,
        }]);
    };

    let targets: Vec<StreamTarget> = entries
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let url = entry
                .webpage_url
                .or(entry.url)
                .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
                .or_else(|| {
                    entry
                        .id
                        .as_ref()
                        .map(|id| format!("https://www.youtube.com/watch?v={id}"))
                });
            match url {
                Some(url) => Some(StreamTarget {
                    id: entry.id,
                    url,
                    title: entry.title,
                }),
                None => {
                    warn!("Skipping playlist entry without a URL: {:?}", entry.title);
                    None
                }
            }
        })
        .collect();

    if targets.is_empty() {
        return Err(ExtractError::Unavailable(
            "the playlist has no downloadable entries".to_string(),
        ));
    }
    Ok(targets)
}

/// Maps yt-dlp's stderr to an error kind.
pub fn classify_failure(stderr: &str) -> ExtractError {
    let detail = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("yt-dlp exited with an error")
        .trim()
        .trim_start_matches("ERROR:")
        .trim()
        .to_string();
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("is not a valid url") || lower.contains("unsupported url") {
        ExtractError::InvalidUrl(detail)
    } else if [
        "video unavailable",
        "private video",
        "confirm your age",
        "age-restricted",
        "not available in your country",
        "members-only",
        "has been removed",
        "this video is not available",
        "premieres in",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        ExtractError::Unavailable(detail)
    } else if [
        "unable to download webpage",
        "unable to download api page",
        "timed out",
        "connection",
        "temporary failure in name resolution",
        "network is unreachable",
        "http error 5",
        "http error 429",
        "getaddrinfo",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        ExtractError::Network(detail)
    } else {
        ExtractError::Tool(detail)
    }
}

/// Item length as reported by yt-dlp; absurd values are treated as unknown.
fn item_duration(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Finds `source.<ext>` left by yt-dlp, ignoring partial-download leftovers.
fn find_audio_file(workdir: &Path) -> Result<PathBuf, ExtractError> {
    for entry in std::fs::read_dir(workdir)? {
        let path = entry?.path();
        let is_source = path.file_stem().and_then(|s| s.to_str()) == Some(AUDIO_STEM);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if is_source && !matches!(ext, "part" | "ytdl" | "json" | "jpg" | "webp" | "png") {
            return Ok(path);
        }
    }
    Err(ExtractError::Tool(
        "yt-dlp finished but no audio file was written".to_string(),
    ))
}
