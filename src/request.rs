use std::fs;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::InputError;

/// A validated download job as submitted from the form.
///
/// Construction checks the URL and makes sure the destination exists and
/// accepts new files; after that the request is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    url: Url,
    destination: PathBuf,
    is_playlist: bool,
}

impl DownloadRequest {
    pub fn new(url: &str, destination: impl Into<PathBuf>) -> Result<Self, InputError> {
        let url = parse_url(url)?;
        let destination = destination.into();
        ensure_writable_dir(&destination)?;
        let is_playlist = looks_like_playlist(&url);
        Ok(Self {
            url,
            destination,
            is_playlist,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn is_playlist(&self) -> bool {
        self.is_playlist
    }
}

/// Accepts absolute http(s) URLs with a host.
pub fn parse_url(input: &str) -> Result<Url, InputError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(InputError::EmptyUrl);
    }
    let url = Url::parse(input).map_err(|e| InputError::MalformedUrl(format!("{input} ({e})")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(InputError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(InputError::MalformedUrl(input.to_string()));
    }
    Ok(url)
}

/// Creates the directory if needed and proves it is writable with a probe file.
pub fn ensure_writable_dir(dir: &Path) -> Result<(), InputError> {
    if dir.exists() && !dir.is_dir() {
        return Err(InputError::NotADirectory(dir.to_path_buf()));
    }
    fs::create_dir_all(dir).map_err(|source| InputError::NotWritable {
        path: dir.to_path_buf(),
        source,
    })?;
    tempfile::Builder::new()
        .prefix(".yt2mp3-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|source| InputError::NotWritable {
            path: dir.to_path_buf(),
            source,
        })
}

fn looks_like_playlist(url: &Url) -> bool {
    url.path().trim_end_matches('/').ends_with("/playlist")
        || url.query_pairs().any(|(k, v)| k == "list" && !v.is_empty())
}

/// Finds the first http(s) link in dropped text.
///
/// Handles plain text, Windows `.url` shortcuts (`URL=...`) and macOS
/// `.webloc` plists (`<string>...</string>`).
pub fn url_from_dropped_text(text: &str) -> Option<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\''))
        .map(|token| token.strip_prefix("URL=").unwrap_or(token))
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .find(|token| parse_url(token).is_ok())
        .map(str::to_string)
}
