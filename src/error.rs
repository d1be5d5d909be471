use thiserror::Error;

use crate::timeline::Timeline;

/// Every way a pipeline run can fail.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Speech engine '{engine}' unavailable for segment {segment_index} after {attempts} attempt(s)")]
    BackendUnavailable {
        engine: String,
        segment_index: usize,
        attempts: u32,
    },

    #[error("Speech engine '{engine}' failed on segment {segment_index}: {message}")]
    Backend {
        engine: String,
        segment_index: usize,
        message: String,
    },

    #[error("Speech engine returned zero-length audio for segment {segment_index}")]
    EmptyOutput { segment_index: usize },

    #[error(
        "Segment {segment_index} lasts {duration:.3}s, shorter than the {floor:.3}s floor"
    )]
    SegmentTooShort {
        segment_index: usize,
        duration: f64,
        floor: f64,
    },

    #[error("Text of segment {segment_index} does not fit the frame even at scale {min_scale:.2}")]
    TextOverflow { segment_index: usize, min_scale: f32 },

    #[error(
        "Narration runs {requested:.2}s, over the {cap:.2}s cap ({dropped} segment(s) dropped)"
    )]
    DurationCapExceeded {
        cap: f64,
        requested: f64,
        dropped: usize,
        truncated: Timeline,
    },

    #[error("Duration cap leaves no complete segment on the timeline")]
    EmptyTimeline,

    #[error("Audio and video tracks disagree: {0}")]
    SyncMismatch(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Segment the failure originated from, when there is one.
    pub fn segment_index(&self) -> Option<usize> {
        match self {
            PipelineError::BackendUnavailable { segment_index, .. }
            | PipelineError::Backend { segment_index, .. }
            | PipelineError::EmptyOutput { segment_index }
            | PipelineError::SegmentTooShort { segment_index, .. }
            | PipelineError::TextOverflow { segment_index, .. } => Some(*segment_index),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::BackendUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_originating_segment() {
        let err = PipelineError::EmptyOutput { segment_index: 3 };
        assert_eq!(err.segment_index(), Some(3));
        assert!(!err.is_retryable());

        let err = PipelineError::EmptyTimeline;
        assert_eq!(err.segment_index(), None);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        let err = PipelineError::BackendUnavailable {
            engine: "espeak-ng".into(),
            segment_index: 0,
            attempts: 3,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("espeak-ng"));
    }
}
