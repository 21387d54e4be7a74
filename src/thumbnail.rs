use std::path::{Path, PathBuf};
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("thumbnail request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("thumbnail is not a readable image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Standard high-quality thumbnail URL for a YouTube video id.
pub fn youtube_thumbnail_url(video_id: &str) -> String {
    format!("https://img.youtube.com/vi/{}/hqdefault.jpg", video_id)
}

/// Downloads a thumbnail and stores it as a baseline JPEG at `dest`.
///
/// Blocking; run it on the blocking pool. YouTube serves WebP for many
/// videos, which MP3 players do not show as cover art, hence the re-encode.
pub fn fetch_cover(url: &str, dest: &Path) -> Result<PathBuf, ThumbnailError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()?;
    let bytes = client.get(url).send()?.error_for_status()?.bytes()?;
    write_jpeg(&bytes, dest)
}

/// Decodes any supported image format and writes it back as JPEG.
pub fn write_jpeg(encoded: &[u8], dest: &Path) -> Result<PathBuf, ThumbnailError> {
    // JPEG has no alpha channel
    let img = image::load_from_memory(encoded)?.to_rgb8();
    DynamicImage::ImageRgb8(img).save_with_format(dest, ImageFormat::Jpeg)?;
    Ok(dest.to_path_buf())
}
