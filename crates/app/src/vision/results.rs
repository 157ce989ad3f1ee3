//! Results directory layout: timestamped artifact names, public URLs and
//! safe lookups for downloads.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Local;

use crate::vision::error::SessionError;

pub const VIDEO_EXTENSIONS: [&str; 4] = [".mp4", ".avi", ".mov", ".mkv"];

#[derive(Clone, Debug)]
pub struct ResultsDir {
    root: PathBuf,
}

impl ResultsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// `<root>/<prefix>_<timestamp><ext>`.
    pub fn artifact_path(&self, prefix: &str, timestamp: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{prefix}_{timestamp}{ext}"))
    }

    /// Resolve a client supplied file name inside the results directory.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, SessionError> {
        let safe = !filename.is_empty()
            && Path::new(filename).file_name().and_then(|name| name.to_str()) == Some(filename)
            && filename != "."
            && filename != "..";
        if !safe {
            return Err(SessionError::InvalidRequest(format!(
                "invalid file name {filename:?}"
            )));
        }
        let path = self.root.join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SessionError::NotFound(filename.to_string()))
        }
    }
}

/// Local wall clock formatted for artifact names.
pub fn artifact_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Public URL under which an artifact is served.
pub fn result_url(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| format!("/results/{name}"))
}

/// Lowercased extension with its leading dot, or an empty string.
pub fn dotted_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

pub fn is_video_extension(ext: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&ext)
}

/// Container extension for an annotated copy of `input`; `.mp4` unless the
/// input already uses a known video container.
pub fn output_extension(input: &Path) -> String {
    let ext = dotted_extension(&input.to_string_lossy());
    if is_video_extension(&ext) {
        ext
    } else {
        ".mp4".to_string()
    }
}
