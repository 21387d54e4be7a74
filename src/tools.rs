//! Locating the external yt-dlp and ffmpeg executables.
//!
//! Release builds can ship both tools inside the binary (drop them into
//! `assets/` before building). Resolution order: explicit path from the
//! config, bundled copy unpacked into the bin dir, then `PATH`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rust_embed::RustEmbed;

use crate::error::ToolError;

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Asset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    YtDlp,
    Ffmpeg,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    /// Executable file name on this platform.
    pub fn file_name(self) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.exe", self.name())
        } else {
            self.name().to_string()
        }
    }
}

/// Finds an executable for `tool`.
pub fn locate(tool: Tool, configured: Option<&Path>, bin_dir: &Path) -> Result<PathBuf, ToolError> {
    if let Some(path) = configured {
        // an explicit choice never silently falls back to something else
        return which::which(path).map_err(|_| ToolError::NotFound {
            tool: tool.name(),
            looked_at: path.display().to_string(),
        });
    }

    if let Some(path) = unpack_bundled(tool, bin_dir)? {
        return Ok(path);
    }

    which::which(tool.file_name()).map_err(|_| ToolError::NotFound {
        tool: tool.name(),
        looked_at: format!("bundled assets and PATH ({})", tool.file_name()),
    })
}

/// True if `program` names an executable, either a path or a name on `PATH`.
pub fn is_executable(program: &Path) -> bool {
    which::which(program).is_ok()
}

fn unpack_bundled(tool: Tool, bin_dir: &Path) -> Result<Option<PathBuf>, ToolError> {
    let name = tool.file_name();
    let Some(data) = Asset::get(&name) else {
        return Ok(None);
    };
    let unpack_err = |source| ToolError::Unpack {
        tool: tool.name(),
        source,
    };

    let target = bin_dir.join(&name);
    let up_to_date = fs::metadata(&target)
        .map(|m| m.len() == data.data.len() as u64)
        .unwrap_or(false);
    if up_to_date {
        debug!("Using unpacked {} at {}", tool.name(), target.display());
        return Ok(Some(target));
    }

    fs::create_dir_all(bin_dir).map_err(unpack_err)?;
    // write next to the target and rename so a half-written binary is never run
    let staging = bin_dir.join(format!(".{name}.partial"));
    {
        let mut f = File::create(&staging).map_err(unpack_err)?;
        f.write_all(&data.data).map_err(unpack_err)?;
        f.sync_all().map_err(unpack_err)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).map_err(unpack_err)?;
    }
    fs::rename(&staging, &target).map_err(unpack_err)?;
    info!("Unpacked bundled {} to {}", tool.name(), target.display());
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn configured_path_must_exist() {
        let bin = tempfile::tempdir().unwrap();
        let missing = bin.path().join("no-such-ffmpeg");
        let err = locate(Tool::Ffmpeg, Some(&missing), bin.path()).unwrap_err();
        assert_matches!(err, ToolError::NotFound { tool: "ffmpeg", .. });
    }

    #[cfg(unix)]
    #[test]
    fn configured_executable_is_used_as_is() {
        let bin = tempfile::tempdir().unwrap();
        let found = locate(Tool::Ffmpeg, Some(Path::new("/bin/sh")), bin.path()).unwrap();
        assert!(found.ends_with("sh"));
    }

    #[test]
    fn file_names_follow_the_platform() {
        let name = Tool::YtDlp.file_name();
        if cfg!(target_os = "windows") {
            assert_eq!(name, "yt-dlp.exe");
        } else {
            assert_eq!(name, "yt-dlp");
        }
    }
}
