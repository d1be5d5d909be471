mod assembler;
mod audio;
mod cli;
mod compositor;
mod config;
mod error;
mod pipeline;
mod segmenter;
mod speech;
mod timeline;

pub use assembler::Assembler;
pub use audio::measure_duration;
pub use cli::Cli;
pub use compositor::{Compositor, FontCompositor, Frame, TextLayout, TextMeasure, fit_text};
pub use config::{
    BackgroundType, GradientDirection, OutputConfig, OutputFormat, PipelineConfig, Scaling,
    SegmenterConfig, SpeechEngine, VisualConfig, VoiceConfig,
};
pub use error::{PipelineError, Result};
pub use pipeline::{
    FailureReason, Pipeline, PipelineState, RenderJob, RunOutput, RunReport, RunTracker,
};
pub use segmenter::{Segment, Segmenter};
pub use speech::{
    AudioClip, BackendError, CommandBackend, RenderedAudio, SpeechBackend, SpeechRenderer,
};
pub use timeline::{Timeline, TimelineBuilder, TimelineEntry};
