//! Display windows for each segment, derived from measured speech durations.
//!
//! Durations are summed at full precision. Each exposed boundary is that
//! running sum rounded half-up to the nearest frame, independently of its
//! neighbours, so rounding error never accumulates past half a frame.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::speech::AudioClip;

/// Slack for comparing accumulated floats against the cap.
const CAP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub segment_index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub start_frame: u64,
    pub end_frame: u64,
}

impl TimelineEntry {
    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }

    /// How many video frames this window occupies.
    pub fn frame_count(&self) -> u64 {
        self.end_frame - self.start_frame
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    fps: u32,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn end_seconds(&self) -> f64 {
        self.entries.last().map(|e| e.end_seconds).unwrap_or(0.0)
    }

    pub fn total_frames(&self) -> u64 {
        self.entries.last().map(|e| e.end_frame).unwrap_or(0)
    }
}

pub struct TimelineBuilder {
    fps: u32,
    cap: f64,
    floor: f64,
}

impl TimelineBuilder {
    /// `min_segment_seconds` is raised to one frame period if it is smaller.
    pub fn new(fps: u32, cap: f64, min_segment_seconds: f64) -> Self {
        let frame = 1.0 / fps as f64;
        Self {
            fps,
            cap,
            floor: min_segment_seconds.max(frame),
        }
    }

    fn boundary_frame(&self, seconds: f64) -> u64 {
        (seconds * self.fps as f64 + 0.5).floor() as u64
    }

    fn seconds(&self, frame: u64) -> f64 {
        frame as f64 / self.fps as f64
    }

    fn entry(&self, segment_index: usize, start_frame: u64, end_frame: u64) -> TimelineEntry {
        TimelineEntry {
            segment_index,
            start_seconds: self.seconds(start_frame),
            end_seconds: self.seconds(end_frame),
            start_frame,
            end_frame,
        }
    }

    pub fn build(&self, clips: &[AudioClip]) -> Result<Timeline> {
        if clips.is_empty() {
            return Err(PipelineError::EmptyTimeline);
        }

        for (position, clip) in clips.iter().enumerate() {
            if clip.segment_index != position {
                return Err(PipelineError::SyncMismatch(format!(
                    "audio clip at position {} belongs to segment {}",
                    position, clip.segment_index
                )));
            }
            if !(clip.duration_seconds >= self.floor) {
                return Err(PipelineError::SegmentTooShort {
                    segment_index: clip.segment_index,
                    duration: clip.duration_seconds,
                    floor: self.floor,
                });
            }
        }

        let requested: f64 = clips.iter().map(|c| c.duration_seconds).sum();
        let cap_frame = (self.cap * self.fps as f64 + CAP_EPSILON).floor() as u64;

        let mut entries = Vec::with_capacity(clips.len());
        let mut overran = false;
        let mut start = 0.0_f64;

        for clip in clips {
            if start >= self.cap - CAP_EPSILON {
                break;
            }
            let end = start + clip.duration_seconds;
            let start_frame = self.boundary_frame(start);

            if end > self.cap + CAP_EPSILON {
                overran = true;
                if clip.segment_index == 0 {
                    return Err(PipelineError::EmptyTimeline);
                }
                if cap_frame > start_frame {
                    entries.push(self.entry(clip.segment_index, start_frame, cap_frame));
                }
                break;
            }

            // A boundary inside the cap may still round past the last whole frame.
            let end_frame = self.boundary_frame(end).min(cap_frame);
            if end_frame <= start_frame && end_frame == cap_frame {
                overran = true;
                break;
            }
            if end_frame <= start_frame {
                return Err(PipelineError::SegmentTooShort {
                    segment_index: clip.segment_index,
                    duration: clip.duration_seconds,
                    floor: self.floor,
                });
            }
            entries.push(self.entry(clip.segment_index, start_frame, end_frame));
            start = end;
        }

        if entries.is_empty() {
            return Err(PipelineError::EmptyTimeline);
        }

        let timeline = Timeline {
            fps: self.fps,
            entries,
        };
        let dropped = clips.len() - timeline.len();

        if overran || dropped > 0 {
            warn!(cap = self.cap, requested, dropped, "narration overruns the duration cap");
            return Err(PipelineError::DurationCapExceeded {
                cap: self.cap,
                requested,
                dropped,
                truncated: timeline,
            });
        }

        debug!(
            segments = timeline.len(),
            end = timeline.end_seconds(),
            frames = timeline.total_frames(),
            "timeline built"
        );
        Ok(timeline)
    }
}
