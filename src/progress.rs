use std::time::Duration;

use crate::model::{Phase, ProgressEvent, TaskId};

/// Marker in front of every progress line yt-dlp prints for us.
pub const PROGRESS_PREFIX: &str = "yt2mp3:";

/// `--progress-template` value producing `yt2mp3:<done>/<total>/<estimate>` lines.
pub const DOWNLOAD_TEMPLATE: &str = "download:yt2mp3:%(progress.downloaded_bytes)s/%(progress.total_bytes)s/%(progress.total_bytes_estimate)s";

/// Share of one item's work taken by the download; the rest is conversion.
const DOWNLOAD_SHARE: f32 = 0.8;

/// Byte counters reported by the extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteProgress {
    pub done: u64,
    pub total: Option<u64>,
}

impl ByteProgress {
    pub fn fraction(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.done as f32 / total as f32).clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

/// Parses one line of yt-dlp output printed through [`DOWNLOAD_TEMPLATE`].
///
/// yt-dlp prints `NA` for unknown counters and may print the size estimate
/// as a float.
pub fn parse_download_line(line: &str) -> Option<ByteProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split('/');
    let done = parse_count(fields.next()?)?;
    let total = fields.next().and_then(parse_count);
    let estimate = fields.next().and_then(parse_count);
    Some(ByteProgress {
        done,
        total: total.or(estimate),
    })
}

fn parse_count(field: &str) -> Option<u64> {
    let field = field.trim();
    if let Ok(v) = field.parse::<u64>() {
        return Some(v);
    }
    match field.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v as u64),
        _ => None,
    }
}

/// One key of ffmpeg's `-progress` output that we care about
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FfmpegProgress {
    /// Position reached in the output stream
    OutTime(Duration),
    /// `progress=end`
    End,
}

/// Parses one `key=value` line of `ffmpeg -progress pipe:1`.
pub fn parse_ffmpeg_line(line: &str) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // out_time_ms is microseconds as well, ffmpeg has always misnamed it
        "out_time_us" | "out_time_ms" => {
            let micros = value.trim().parse::<u64>().ok()?;
            Some(FfmpegProgress::OutTime(Duration::from_micros(micros)))
        }
        "progress" if value.trim() == "end" => Some(FfmpegProgress::End),
        _ => None,
    }
}

/// Turns per-item fractions into overall, non-decreasing task percentages.
///
/// Overall percentage is `(finished_items + item_fraction) / item_count`,
/// where the download fills the first 80 % of an item and conversion the
/// rest.
#[derive(Debug)]
pub struct ProgressTracker {
    task_id: TaskId,
    item_count: usize,
    finished_items: usize,
    last_percent: f32,
    last_phase: Option<Phase>,
}

impl ProgressTracker {
    pub fn new(task_id: TaskId, item_count: usize) -> Self {
        Self {
            task_id,
            item_count: item_count.max(1),
            finished_items: 0,
            last_percent: 0.0,
            last_phase: None,
        }
    }

    /// Progress inside the current item. Returns an event only when it moves
    /// the overall percentage forward or the phase changes.
    pub fn update(
        &mut self,
        phase: Phase,
        fraction: Option<f32>,
        bytes: Option<ByteProgress>,
    ) -> Option<ProgressEvent> {
        let item_fraction = match (phase, fraction) {
            (Phase::Downloading, f) => DOWNLOAD_SHARE * f.unwrap_or(0.0),
            (Phase::Converting, f) => DOWNLOAD_SHARE + (1.0 - DOWNLOAD_SHARE) * f.unwrap_or(0.0),
        };
        let percent = self.overall(item_fraction.clamp(0.0, 1.0));
        let phase_changed = self.last_phase != Some(phase);
        if percent <= self.last_percent && !phase_changed {
            return None;
        }
        self.last_phase = Some(phase);
        self.last_percent = percent.max(self.last_percent);
        Some(ProgressEvent {
            task_id: self.task_id,
            phase,
            percent: self.last_percent,
            bytes_done: bytes.map(|b| b.done),
            bytes_total: bytes.and_then(|b| b.total),
        })
    }

    /// Marks the current item as done, whatever its outcome.
    pub fn finish_item(&mut self) {
        self.finished_items = (self.finished_items + 1).min(self.item_count);
        self.last_percent = self.last_percent.max(self.overall(0.0));
        self.last_phase = None;
    }

    /// The closing 100 % event sent before `Completed`.
    pub fn complete(&mut self) -> ProgressEvent {
        self.finished_items = self.item_count;
        self.last_percent = 100.0;
        ProgressEvent {
            task_id: self.task_id,
            phase: Phase::Converting,
            percent: 100.0,
            bytes_done: None,
            bytes_total: None,
        }
    }

    fn overall(&self, item_fraction: f32) -> f32 {
        let done = self.finished_items as f32 + item_fraction;
        (done / self.item_count as f32 * 100.0).clamp(0.0, 100.0)
    }
}
