//! GStreamer-backed frame source for local video files.
//!
//! `decodebin` picks the demuxer and decoder, `videoconvert` produces packed
//! RGB, and frames are pulled synchronously from an `appsink` so the walker
//! sets the pace.

use crate::frame_source::{Frame, FrameError, FrameSource, SourceError, StreamInfo};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub struct GstFrameSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    info: StreamInfo,
    finished: bool,
}

impl GstFrameSource {
    /// Build the pipeline, preroll, and read the stream metadata.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::unreadable(path, e))?;

        let pipeline_str = build_pipeline_string(path);
        debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SourceError::unreadable(path, e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SourceError::unreadable(path, "failed to cast to Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::unreadable(path, "appsink not found"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SourceError::unreadable(path, "could not cast to AppSink"))?;

        let source = Self {
            pipeline,
            appsink,
            info: StreamInfo {
                fps: 0.0,
                advertised_frames: None,
                width: 0,
                height: 0,
            },
            finished: false,
        };
        source.preroll(path, timeout)
    }

    fn preroll(mut self, path: &Path, timeout: Duration) -> Result<Self, SourceError> {
        if self.pipeline.set_state(gst::State::Paused).is_err() {
            return Err(self.bus_error(path, "pipeline refused to pause"));
        }

        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (result, _state, _pending) = self.pipeline.state(timeout);
        match result {
            Ok(gst::StateChangeSuccess::Async) => {
                return Err(SourceError::unreadable(path, "timed out waiting for preroll"))
            }
            Err(_) => return Err(self.bus_error(path, "preroll failed")),
            Ok(_) => {}
        }

        let sample = self
            .appsink
            .pull_preroll()
            .map_err(|_| self.bus_error(path, "no video stream"))?;
        let caps = sample
            .caps()
            .ok_or_else(|| SourceError::unreadable(path, "preroll sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| SourceError::unreadable(path, e))?;

        let fraction = video_info.fps();
        let fps = if fraction.denom() == 0 {
            0.0
        } else {
            fraction.numer() as f64 / fraction.denom() as f64
        };

        let advertised_frames = self
            .pipeline
            .query_duration::<gst::ClockTime>()
            .filter(|_| fps > 0.0)
            .map(|duration| (duration.nseconds() as f64 / 1e9 * fps).round() as u64);

        self.info = StreamInfo {
            fps,
            advertised_frames,
            width: video_info.width(),
            height: video_info.height(),
        };

        debug!(
            path = %path.display(),
            fps,
            advertised_frames = ?advertised_frames,
            width = self.info.width,
            height = self.info.height,
            "Video opened"
        );

        if self.pipeline.set_state(gst::State::Playing).is_err() {
            return Err(self.bus_error(path, "pipeline refused to play"));
        }

        Ok(self)
    }

    /// Prefer the error posted on the bus over a generic reason.
    fn bus_error(&self, path: &Path, fallback: &str) -> SourceError {
        let posted = self.pipeline.bus().and_then(|bus| {
            bus.timed_pop_filtered(gst::ClockTime::ZERO, &[gst::MessageType::Error])
        });

        match posted.as_ref().map(|msg| msg.view()) {
            Some(gst::MessageView::Error(err)) => SourceError::unreadable(path, err.error()),
            _ => SourceError::unreadable(path, fallback),
        }
    }

    fn pull_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) if self.appsink.is_eos() => {
                self.finished = true;
                return None;
            }
            Err(e) => {
                self.finished = true;
                warn!(error = %e, "Decoder stopped before end of stream");
                return Some(Err(FrameError::Decode(e.to_string())));
            }
        };

        Some(copy_rgb(&sample))
    }
}

fn build_pipeline_string(path: &Path) -> String {
    let location = path.display().to_string().replace('"', "\\\"");
    format!(
        "filesrc location=\"{location}\" ! decodebin ! videoconvert \
         ! video/x-raw,format=RGB ! appsink name=sink sync=false"
    )
}

/// Copy a sample into a packed RGB frame, dropping any row padding.
fn copy_rgb(sample: &gst::Sample) -> Result<Frame, FrameError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| FrameError::Decode("sample has no buffer".to_string()))?;
    let caps = sample
        .caps()
        .ok_or_else(|| FrameError::Decode("sample has no caps".to_string()))?;
    let info =
        gst_video::VideoInfo::from_caps(caps).map_err(|e| FrameError::Decode(e.to_string()))?;

    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|e| FrameError::Decode(e.to_string()))?;

    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.plane_stride()[0] as usize;
    let plane = frame
        .plane_data(0)
        .map_err(|e| FrameError::Decode(e.to_string()))?;

    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = plane
            .get(start..start + row_bytes)
            .ok_or_else(|| FrameError::Decode(format!("row {row} outside plane")))?;
        packed.extend_from_slice(line);
    }

    Frame::new(width, height, packed)
}

impl FrameSource for GstFrameSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.finished {
            return None;
        }
        self.pull_frame()
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
