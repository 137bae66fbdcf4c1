//! Screenshot collaborator.
//!
//! The engine asks a [`ScreenCapturer`] for the primary display as a raw
//! image and owns the clipping and PNG encoding itself. The default
//! implementation reads a frame from the file named by
//! `CADENZA_SCREEN_SOURCE`, which keeps headless runs and tests working;
//! a platform capture backend plugs in through the same trait.

use anyhow::{bail, Context, Result};
use image::RgbaImage;
use std::env;
use std::path::PathBuf;

/// Environment variable naming an image file to serve as the captured frame.
pub const SCREEN_SOURCE_VAR: &str = "CADENZA_SCREEN_SOURCE";

pub trait ScreenCapturer: Send + Sync {
    fn capture_primary(&self) -> Result<RgbaImage>;
}

pub struct FileBackedCapturer {
    source: Option<PathBuf>,
}

impl FileBackedCapturer {
    pub fn new() -> Self {
        let source = env::var(SCREEN_SOURCE_VAR).ok().map(PathBuf::from);
        FileBackedCapturer { source }
    }

    pub fn from_path(path: PathBuf) -> Self {
        FileBackedCapturer { source: Some(path) }
    }
}

impl Default for FileBackedCapturer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenCapturer for FileBackedCapturer {
    fn capture_primary(&self) -> Result<RgbaImage> {
        let Some(source) = &self.source else {
            bail!(
                "no screen capture backend configured; set {} to an image file",
                SCREEN_SOURCE_VAR
            );
        };
        let image = image::open(source)
            .with_context(|| format!("failed to read screen source '{}'", source.display()))?;
        Ok(image.to_rgba8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_without_backend_fails() {
        let capturer = FileBackedCapturer { source: None };
        assert!(capturer.capture_primary().is_err());
    }

    #[test]
    fn capture_reads_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let frame = RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
        frame.save(&path).unwrap();

        let capturer = FileBackedCapturer::from_path(path);
        let captured = capturer.capture_primary().unwrap();
        assert_eq!(captured.dimensions(), (4, 4));
    }
}
