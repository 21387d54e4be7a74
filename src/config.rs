//! Runtime settings.
//!
//! There is no settings file; defaults can be overridden through `YT2MP3_*`
//! environment variables. Bad values are ignored and reported back so they
//! can be logged once the logger is up.

use std::ffi::OsString;
use std::path::PathBuf;

use log::LevelFilter;

use crate::model::PlaylistPolicy;

pub const DEFAULT_BITRATE_KBPS: u32 = 320;

/// Bitrates accepted by the MP3 encoder.
const MP3_BITRATES: &[u32] = &[32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Directory preselected in the form
    pub output_dir: PathBuf,
    /// Parent of the per-task scratch directories, the unpacked tools and the log
    pub temp_root: PathBuf,
    /// Explicit ffmpeg executable
    pub ffmpeg: Option<PathBuf>,
    /// Explicit yt-dlp executable
    pub ytdlp: Option<PathBuf>,
    pub bitrate_kbps: u32,
    pub playlist_policy: PlaylistPolicy,
    pub log_level: LevelFilter,
}

impl Default for AppConfig {
    fn default() -> Self {
        let output_dir = dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
            .unwrap_or_else(|| PathBuf::from("./downloads"));
        Self {
            output_dir,
            temp_root: std::env::temp_dir().join("yt2mp3"),
            ffmpeg: None,
            ytdlp: None,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            playlist_policy: PlaylistPolicy::default(),
            log_level: LevelFilter::Info,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> (Self, Vec<String>) {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Applies overrides from `lookup` on top of [`AppConfig::default`].
    /// Returns one warning per ignored value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> (Self, Vec<String>) {
        let mut config = Self::default();
        let mut warnings = Vec::new();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.to_string_lossy().trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        if let Some(dir) = path("YT2MP3_OUTPUT_DIR") {
            config.output_dir = dir;
        }
        if let Some(dir) = path("YT2MP3_TEMP_DIR") {
            config.temp_root = dir;
        }
        config.ffmpeg = path("YT2MP3_FFMPEG");
        config.ytdlp = path("YT2MP3_YTDLP");

        if let Some(raw) = text("YT2MP3_BITRATE") {
            match raw.trim_end_matches('k').parse::<u32>() {
                Ok(kbps) if MP3_BITRATES.contains(&kbps) => config.bitrate_kbps = kbps,
                _ => warnings.push(format!(
                    "Ignoring YT2MP3_BITRATE={raw}, keeping {} kbps",
                    config.bitrate_kbps
                )),
            }
        }
        if let Some(raw) = text("YT2MP3_PLAYLIST_POLICY") {
            match raw.parse::<PlaylistPolicy>() {
                Ok(policy) => config.playlist_policy = policy,
                Err(err) => warnings.push(format!("Ignoring YT2MP3_PLAYLIST_POLICY: {err}")),
            }
        }
        if let Some(raw) = text("YT2MP3_LOG") {
            match raw.parse::<LevelFilter>() {
                Ok(level) => config.log_level = level,
                Err(_) => warnings.push(format!("Ignoring YT2MP3_LOG={raw}")),
            }
        }
        (config, warnings)
    }

    /// Where bundled tools get unpacked.
    pub fn bin_dir(&self) -> PathBuf {
        self.temp_root.join("bin")
    }

    /// Parent of the per-task scratch directories.
    pub fn work_dir(&self) -> PathBuf {
        self.temp_root.join("work")
    }
}
