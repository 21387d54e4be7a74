//! The window: URL field, download path, start/cancel buttons, status and progress.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eframe::{App, Frame, egui};
use egui::{Color32, ColorImage, DroppedFile, RichText, TextureHandle, TextureOptions};
use log::{debug, info};
use rfd::FileDialog;

use yt2mp3::request::url_from_dropped_text;
use yt2mp3::{
    ItemOutcome, Phase, SubmitError, TaskController, TaskEvent, TaskHandle, TaskState,
};

/// Time the "Done" message stays before the form resets
const RESET_AFTER: Duration = Duration::from_secs(10);
/// Dropped files bigger than this are not scanned for a link
const MAX_DROP_BYTES: u64 = 64 * 1024;

const BLUE: Color32 = Color32::from_rgb(0x42, 0x85, 0xF4);
const RED: Color32 = Color32::from_rgb(0xEA, 0x43, 0x35);
const YELLOW: Color32 = Color32::from_rgb(0xFB, 0xBC, 0x05);
const GREEN: Color32 = Color32::from_rgb(0x34, 0xA8, 0x53);
const MUTED: Color32 = Color32::from_rgb(0xBD, 0xC1, 0xC6);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tone {
    Normal,
    Success,
    Error,
}

/// Application state for the GUI
pub struct Mp3App {
    /// Task launcher shared by every submission
    controller: TaskController,
    /// Input field for the YouTube URL
    url_input: String,
    /// Destination folder for the MP3 files
    output_dir: PathBuf,
    /// The running task, if any
    task: Option<TaskHandle>,
    /// Status line below the buttons
    status: String,
    tone: Tone,
    /// Overall progress, 0.0 to 1.0
    progress: f32,
    /// Title of the item being processed
    current_title: Option<String>,
    /// Cover art of the item being processed
    thumbnail: Option<TextureHandle>,
    /// Folder to offer in "Open Folder" after a finished task
    finished_in: Option<PathBuf>,
    /// When to clear the form after a completed task
    reset_at: Option<Instant>,
}

impl Mp3App {
    pub fn new(controller: TaskController, output_dir: PathBuf) -> Self {
        Self {
            controller,
            url_input: String::new(),
            output_dir,
            task: None,
            status: "Ready".to_string(),
            tone: Tone::Normal,
            progress: 0.0,
            current_title: None,
            thumbnail: None,
            finished_in: None,
            reset_at: None,
        }
    }

    fn set_status(&mut self, text: impl Into<String>, tone: Tone) {
        self.status = text.into();
        self.tone = tone;
    }

    fn start_download(&mut self) {
        self.reset_at = None;
        self.finished_in = None;
        match self.controller.submit(&self.url_input, &self.output_dir) {
            Ok(handle) => {
                info!("Started task {}", handle.id());
                self.task = Some(handle);
                self.progress = 0.0;
                self.current_title = None;
                self.thumbnail = None;
                self.set_status("Queued", Tone::Normal);
            }
            Err(SubmitError::Setup(msg)) => {
                self.set_status(format!("FFmpeg / yt-dlp missing. {msg}"), Tone::Error)
            }
            Err(err) => self.set_status(err.to_string(), Tone::Error),
        }
    }

    fn cancel_download(&mut self) {
        if let Some(task) = &self.task {
            task.cancel();
            self.set_status("Cancelling…", Tone::Normal);
        }
    }

    /// Drains every event the worker sent since the last frame.
    fn poll_task(&mut self, ctx: &egui::Context) {
        while let Some(event) = self.task.as_mut().and_then(TaskHandle::try_next_event) {
            self.apply(ctx, event);
        }
    }

    fn apply(&mut self, ctx: &egui::Context, event: TaskEvent) {
        match event {
            TaskEvent::StateChanged { state, item, .. } => {
                if let Some(title) = item.as_ref().and_then(|i| i.title.clone()) {
                    self.current_title = Some(title);
                }
                let position = item
                    .filter(|i| i.count > 1)
                    .map(|i| format!(" ({}/{})", i.index + 1, i.count))
                    .unwrap_or_default();
                let text = match state {
                    TaskState::Resolving => "Resolving…".to_string(),
                    TaskState::Downloading => format!("Starting download{position}…"),
                    TaskState::Converting => format!("Converting to MP3{position}…"),
                    TaskState::EmbeddingThumbnail => format!("Embedding cover art{position}…"),
                    _ => return,
                };
                self.set_status(text, Tone::Normal);
            }
            TaskEvent::Progress(progress) => {
                self.progress = progress.percent / 100.0;
                if progress.phase == Phase::Downloading {
                    let title = self.current_title.as_deref().unwrap_or("");
                    self.status = format!("Downloading: {:5.1}% - {title}", progress.percent);
                }
            }
            TaskEvent::Thumbnail { jpeg, .. } => {
                if let Some(image) = decode_preview(&jpeg) {
                    self.thumbnail = Some(ctx.load_texture("cover", image, TextureOptions::LINEAR));
                }
            }
            TaskEvent::ItemFinished { index, outcome, .. } => match outcome {
                ItemOutcome::Saved(path) => debug!("Item {index} saved to {}", path.display()),
                ItemOutcome::Failed(failure) => debug!("Item {index} failed: {}", failure.message),
            },
            TaskEvent::Finished { state, summary, .. } => {
                self.task = None;
                self.finished_in = Some(self.output_dir.clone());
                match state {
                    TaskState::Completed => {
                        self.progress = 1.0;
                        let text = if summary.total > 1 {
                            format!("Done - {}", summary.message())
                        } else {
                            "Done".to_string()
                        };
                        self.set_status(text, Tone::Success);
                        self.reset_at = Some(Instant::now() + RESET_AFTER);
                    }
                    TaskState::Cancelled => self.set_status("Cancelled", Tone::Normal),
                    _ => self.set_status(format!("Error: {}", summary.message()), Tone::Error),
                }
            }
        }
    }

    fn reset_form(&mut self) {
        self.url_input.clear();
        self.progress = 0.0;
        self.current_title = None;
        self.thumbnail = None;
        self.reset_at = None;
        self.set_status("Ready", Tone::Normal);
    }

    fn accept_dropped(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        if let Some(url) = dropped.iter().find_map(read_dropped_link) {
            self.url_input = url;
        } else if !dropped.is_empty() {
            self.set_status("No link found in the dropped item", Tone::Error);
        }
    }
}

/// GUI update loop: called each frame to redraw and handle interactions
impl App for Mp3App {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        self.poll_task(ctx);
        self.accept_dropped(ctx);
        if self.reset_at.is_some_and(|at| Instant::now() >= at) {
            self.reset_form();
        }

        egui::TopBottomPanel::bottom("footer").show(ctx, |ui| {
            ui.label(
                RichText::new("MP3 - 320kbps • Playlist Support • Drag & Drop Enabled")
                    .color(MUTED)
                    .size(13.0),
            );
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.add_space(12.0);
                ui.label(title_text());
            });
            ui.add_space(18.0);

            let hovering = ctx.input(|i| !i.raw.hovered_files.is_empty());
            let hint = if hovering {
                "Drop to use this link"
            } else {
                "Paste YouTube link or drag & drop here…"
            };
            let busy = self.task.is_some();
            ui.add_enabled(
                !busy,
                egui::TextEdit::singleline(&mut self.url_input)
                    .hint_text(hint)
                    .font(egui::TextStyle::Heading)
                    .desired_width(f32::INFINITY),
            );
            ui.add_space(6.0);

            // Folder selection
            ui.horizontal(|ui| {
                ui.label(RichText::new("Download Path:").color(MUTED));
                ui.label(self.output_dir.display().to_string());
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let change = ui.add_enabled(!busy, egui::Button::new(RichText::new("Change").color(BLUE)).frame(false));
                    if change.clicked() {
                        if let Some(folder) = FileDialog::new().set_directory(&self.output_dir).pick_folder() {
                            self.output_dir = folder;
                        }
                    }
                });
            });
            ui.add_space(20.0);

            ui.horizontal(|ui| {
                let download = egui::Button::new(RichText::new("Download MP3").size(18.0).strong())
                    .fill(BLUE)
                    .min_size(egui::vec2(220.0, 56.0));
                if ui.add_enabled(!busy, download).clicked() {
                    self.start_download();
                }
                let cancel = egui::Button::new(RichText::new("Cancel").size(18.0).color(BLUE))
                    .min_size(egui::vec2(180.0, 56.0));
                let cancelling = self.task.as_ref().is_some_and(|task| {
                    task.cancel_requested() || task.state().is_terminal()
                });
                if ui.add_enabled(busy && !cancelling, cancel).clicked() {
                    self.cancel_download();
                }
            });
            ui.add_space(12.0);

            let color = match self.tone {
                Tone::Normal => Color32::WHITE,
                Tone::Success => GREEN,
                Tone::Error => RED,
            };
            ui.label(RichText::new(&self.status).color(color).size(15.0));
            ui.add(egui::ProgressBar::new(self.progress).show_percentage());

            ui.add_space(8.0);
            ui.horizontal(|ui| {
                if let Some(tex) = &self.thumbnail {
                    ui.add(egui::Image::new(tex).max_width(160.0));
                }
                if let Some(folder) = self.finished_in.clone() {
                    if ui.button("Open Folder").clicked() {
                        open_folder(&folder);
                    }
                }
            });
        });

        // Progress arrives through the channel, keep polling while busy
        if self.task.is_some() || self.reset_at.is_some() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }
}

fn title_text() -> RichText {
    RichText::new("YOUTUBE TO MP3")
        .size(40.0)
        .strong()
        .color(YELLOW)
}

/// Decodes JPEG bytes into an egui image.
fn decode_preview(bytes: &[u8]) -> Option<ColorImage> {
    let img = image::load_from_memory(bytes).ok()?.to_rgba8();
    let size = [img.width() as usize, img.height() as usize];
    Some(ColorImage::from_rgba_unmultiplied(size, &img))
}

/// winit only delivers file drops, so links arrive as `.url`, `.webloc` or text files.
fn read_dropped_link(file: &DroppedFile) -> Option<String> {
    if let Some(bytes) = &file.bytes {
        return url_from_dropped_text(&String::from_utf8_lossy(bytes));
    }
    let path = file.path.as_ref()?;
    if fs::metadata(path).ok()?.len() > MAX_DROP_BYTES {
        return None;
    }
    let text = fs::read(path).ok()?;
    url_from_dropped_text(&String::from_utf8_lossy(&text))
}

fn open_folder(folder: &Path) {
    let folder = folder.to_path_buf();
    std::thread::spawn(move || {
        #[cfg(target_os = "windows")]
        {
            let _ = std::process::Command::new("explorer").arg(folder).spawn();
        }
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("open").arg(folder).spawn();
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            let _ = std::process::Command::new("xdg-open").arg(folder).spawn();
        }
    });
}
