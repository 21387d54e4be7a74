//! Main application for the YouTube to MP3 GUI

// Window, widgets and event handling
mod ui;

// eframe/egui for GUI application framework
use eframe::egui;
use egui::Visuals;
use log::{error, info, warn};
// OnceCell for single-time runtime initialization
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;

use yt2mp3::{AppConfig, TaskController, logging};

// Global Tokio runtime stored in a OnceCell for lazy init
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Program entry point: initializes logging and runtime, then launches the GUI
fn main() -> eframe::Result<()> {
    let (config, warnings) = AppConfig::from_env();
    logging::initialize(config.log_level, &config.temp_root);
    for warning in &warnings {
        warn!("{warning}");
    }
    info!("Starting yt2mp3, temp root {}", config.temp_root.display());

    // Downloads run as tasks on this runtime, never on the UI thread
    let runtime = match RUNTIME.get_or_try_init(Runtime::new) {
        Ok(rt) => rt,
        Err(err) => {
            error!("Could not start the async runtime: {err}");
            std::process::exit(1);
        }
    };
    let controller = TaskController::from_config(&config, runtime.handle().clone());
    let output_dir = config.output_dir.clone();

    // Window matches the form layout; file drops carry links
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("YouTube to MP3")
            .with_inner_size([850.0, 500.0])
            .with_drag_and_drop(true),
        ..Default::default()
    };
    eframe::run_native(
        "YouTube to MP3",
        options,
        Box::new(move |cc| {
            // Use dark theme visuals
            cc.egui_ctx.set_visuals(Visuals::dark());
            Box::new(ui::Mp3App::new(controller, output_dir))
        }),
    )
}
