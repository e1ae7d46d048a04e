use crate::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
pub fn test_env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn parse_file_uri_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if uri.starts_with('/') {
        return Some(PathBuf::from(uri));
    }
    None
}

pub fn preferred_temp_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("SOLARSIGN_TEMP_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir));
    }
    candidates.push(std::env::temp_dir());

    for dir in candidates {
        if let Ok(meta) = std::fs::metadata(&dir) {
            if meta.is_dir() {
                return dir;
            }
        }
    }
    std::env::temp_dir()
}

/// Directory next to the source document, or the temp dir when the source has no parent.
pub fn output_dir_for(source: Option<&str>) -> PathBuf {
    if let Some(uri) = source {
        if let Some(path) = parse_file_uri_path(uri) {
            if let Some(parent) = path.parent() {
                return parent.to_path_buf();
            }
        }
    }
    preferred_temp_dir()
}

/// A merged document written to disk for the duration of one workflow run.
///
/// The file is removed when the value is dropped, on success and error paths alike.
#[derive(Debug)]
pub struct TempPdf {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl TempPdf {
    pub fn write(dir: &Path, prefix: &str, bytes: &[u8]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".pdf")
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        let path = file.path().to_path_buf();
        log::debug!("Wrote temporary document {} ({} bytes)", path.display(), bytes.len());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPdf {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                log::warn!("Failed to remove temporary document {}: {}", self.path.display(), e);
            }
        }
    }
}
