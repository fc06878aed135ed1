//! Frame sources: sequential decoders handing out packed RGB frames.

use crate::config::ExtractionConfig;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

/// Errors raised while opening a source. Nothing has been processed yet.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source unreadable: {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Video decoding requires the '{0}' feature")]
    FeatureDisabled(&'static str),
}

impl SourceError {
    pub fn unreadable(path: &Path, reason: impl ToString) -> Self {
        Self::Unreadable {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors on an individual frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Frame buffer has {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// One decoded frame, packed RGB24 with no row padding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, FrameError> {
        let data = data.into();
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// Stream metadata, read once when the source is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    /// Frame count claimed by the container; not authoritative
    pub advertised_frames: Option<u64>,
    pub width: u32,
    pub height: u32,
}

/// Sequential frame decoder.
///
/// `next_frame` yields frames strictly in order and `None` once the stream
/// has ended. A `Some(Err(..))` is a failure on that frame only.
pub trait FrameSource: Send {
    fn info(&self) -> &StreamInfo;

    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn info(&self) -> &StreamInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        (**self).next_frame()
    }
}

/// Open a video file for decoding.
///
/// A missing path fails immediately. Without the `gstreamer` feature every
/// other path fails with [`SourceError::FeatureDisabled`].
pub fn open_video(
    path: &Path,
    config: &ExtractionConfig,
) -> Result<Box<dyn FrameSource>, SourceError> {
    if !path.is_file() {
        return Err(SourceError::unreadable(path, "no such file"));
    }

    #[cfg(feature = "gstreamer")]
    {
        let source = crate::gst_source::GstFrameSource::open(path, config.open_timeout())?;
        Ok(Box::new(source))
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        let _ = config;
        Err(SourceError::FeatureDisabled("gstreamer"))
    }
}
