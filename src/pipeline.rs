//! Orchestrates one run: segment, render speech and frames in parallel,
//! build the timeline at the barrier, then assemble.

use std::fmt;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::assembler::Assembler;
use crate::compositor::{Compositor, FontCompositor, Frame};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::segmenter::{Segment, Segmenter};
use crate::speech::{AudioClip, SpeechRenderer};
use crate::timeline::{Timeline, TimelineBuilder};

/// Everything the assembler needs, index-aligned by segment.
#[derive(Debug)]
pub struct RenderJob {
    pub timeline: Timeline,
    pub frames: Vec<Frame>,
    pub clips: Vec<AudioClip>,
    /// Keeps the rendered audio on disk until the job is dropped.
    workspace: Option<TempDir>,
}

impl RenderJob {
    pub fn new(
        timeline: Timeline,
        frames: Vec<Frame>,
        clips: Vec<AudioClip>,
        workspace: Option<TempDir>,
    ) -> Self {
        Self {
            timeline,
            frames,
            clips,
            workspace,
        }
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|dir| dir.path())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Created,
    Segmented { segments: usize },
    Rendered { rendered: usize, total: usize },
    TimelineBuilt,
    Composited,
    Assembled,
    Done,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReason {
    pub message: String,
    pub segment_index: Option<usize>,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Created => write!(f, "created"),
            PipelineState::Segmented { segments } => write!(f, "segmented ({segments})"),
            PipelineState::Rendered { rendered, total } if rendered < total => {
                write!(f, "rendered (partial {rendered}/{total})")
            }
            PipelineState::Rendered { total, .. } => write!(f, "rendered ({total})"),
            PipelineState::TimelineBuilt => write!(f, "timeline built"),
            PipelineState::Composited => write!(f, "composited"),
            PipelineState::Assembled => write!(f, "assembled"),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Failed(reason) => match reason.segment_index {
                Some(index) => write!(f, "failed at segment {index}: {}", reason.message),
                None => write!(f, "failed: {}", reason.message),
            },
        }
    }
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            PipelineState::Created => 0,
            PipelineState::Segmented { .. } => 1,
            PipelineState::Rendered { .. } => 2,
            PipelineState::TimelineBuilt => 3,
            PipelineState::Composited => 4,
            PipelineState::Assembled => 5,
            PipelineState::Done | PipelineState::Failed(_) => 6,
        }
    }

    /// Forward one stage, stay in `Rendered` while it fills up, or fail from anywhere.
    pub fn can_advance_to(&self, next: &PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, PipelineState::Failed(_)) => true,
            (PipelineState::Rendered { rendered, .. }, PipelineState::Rendered { rendered: n, .. }) => {
                n >= rendered
            }
            (PipelineState::Rendered { rendered, total }, PipelineState::TimelineBuilt) => {
                rendered == total
            }
            (PipelineState::Assembled, PipelineState::Done) => true,
            (_, PipelineState::Done) => false,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// State history of a single run.
#[derive(Debug, Clone)]
pub struct RunTracker {
    history: Vec<PipelineState>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self {
            history: vec![PipelineState::Created],
        }
    }
}

impl RunTracker {
    pub fn state(&self) -> &PipelineState {
        // history always holds at least `Created`
        &self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state().can_advance_to(&next),
            "illegal transition {} -> {}",
            self.state(),
            next
        );
        info!(state = %next, "pipeline");
        self.history.push(next);
    }

    fn fail(&mut self, error: &PipelineError) {
        let reason = FailureReason {
            message: error.to_string(),
            segment_index: error.segment_index(),
        };
        self.advance(PipelineState::Failed(reason));
    }
}

/// Outcome of [`Pipeline::run`]: the tracker always ends in a terminal state.
#[derive(Debug)]
pub struct RunReport {
    pub tracker: RunTracker,
    pub result: Result<RunOutput>,
}

#[derive(Debug)]
pub struct RunOutput {
    pub path: PathBuf,
    pub timeline: Timeline,
}

pub struct Pipeline {
    config: PipelineConfig,
    segmenter: Segmenter,
    speech: SpeechRenderer,
    compositor: Box<dyn Compositor>,
    assembler: Assembler,
}

impl Pipeline {
    /// Validates the config and selects the backends it names.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let speech = SpeechRenderer::from_config(&config.voice);
        let compositor = Box::new(FontCompositor::new(&config.visual)?);
        Self::with_backends(config, speech, compositor)
    }

    pub fn with_backends(
        config: PipelineConfig,
        speech: SpeechRenderer,
        compositor: Box<dyn Compositor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            segmenter: Segmenter::new(config.segmenter.clone()),
            assembler: Assembler::new(config.output.clone()),
            config,
            speech,
            compositor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage except assembly.
    pub fn plan(&self, script: &str, tracker: &mut RunTracker) -> Result<RenderJob> {
        let result = self.plan_stages(script, tracker);
        if let Err(e) = &result {
            tracker.fail(e);
        }
        result
    }

    fn plan_stages(&self, script: &str, tracker: &mut RunTracker) -> Result<RenderJob> {
        let config = &self.config;

        let segments = self.segmenter.segment(script, config.total_duration_cap)?;
        tracker.advance(PipelineState::Segmented {
            segments: segments.len(),
        });

        let workspace = tempfile::Builder::new().prefix("scriptreel-").tempdir()?;
        let total = segments.len();
        tracker.advance(PipelineState::Rendered { rendered: 0, total });

        // Fan out; collecting is the barrier.
        let rendered: Vec<Result<AudioClip>> = segments
            .par_iter()
            .map(|segment| self.speech.render(segment, &config.voice, workspace.path()))
            .collect();
        let done = rendered.iter().filter(|r| r.is_ok()).count();
        if done > 0 {
            tracker.advance(PipelineState::Rendered {
                rendered: done,
                total,
            });
        }
        let clips = first_failure(rendered)?;

        let timeline = TimelineBuilder::new(
            config.output.fps,
            config.total_duration_cap,
            config.min_segment_seconds,
        )
        .build(&clips)?;
        tracker.advance(PipelineState::TimelineBuilt);

        let frames = self.composite(&segments)?;
        tracker.advance(PipelineState::Composited);

        Ok(RenderJob::new(timeline, frames, clips, Some(workspace)))
    }

    fn composite(&self, segments: &[Segment]) -> Result<Vec<Frame>> {
        let visual = &self.config.visual;
        let composed: Vec<Result<Frame>> = segments
            .par_iter()
            .map(|segment| self.compositor.compose(segment, visual))
            .collect();
        first_failure(composed)
    }

    /// Full run from script to a muxed file at `destination`.
    pub fn run(&self, script: &str, destination: &Path) -> RunReport {
        let mut tracker = RunTracker::default();

        let result = self.plan(script, &mut tracker).and_then(|job| {
            match self.assembler.assemble(&job, destination) {
                Ok(path) => {
                    tracker.advance(PipelineState::Assembled);
                    tracker.advance(PipelineState::Done);
                    Ok(RunOutput {
                        path,
                        timeline: job.timeline,
                    })
                }
                Err(e) => {
                    tracker.fail(&e);
                    Err(e)
                }
            }
        });

        RunReport { tracker, result }
    }
}

/// Index-ordered results, or the failure of the lowest failing segment.
fn first_failure<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > 1 {
        warn!(failures, "multiple segments failed; reporting the first");
    }
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> PipelineState {
        PipelineState::Failed(FailureReason {
            message: "boom".into(),
            segment_index: Some(2),
        })
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let path = [
            PipelineState::Created,
            PipelineState::Segmented { segments: 3 },
            PipelineState::Rendered {
                rendered: 0,
                total: 3,
            },
            PipelineState::Rendered {
                rendered: 3,
                total: 3,
            },
            PipelineState::TimelineBuilt,
            PipelineState::Composited,
            PipelineState::Assembled,
            PipelineState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn barrier_requires_every_clip() {
        let partial = PipelineState::Rendered {
            rendered: 2,
            total: 3,
        };
        assert!(!partial.can_advance_to(&PipelineState::TimelineBuilt));
        assert!(partial.can_advance_to(&failed()));
        assert_eq!(partial.to_string(), "rendered (partial 2/3)");
    }

    #[test]
    fn terminal_states_do_not_move() {
        assert!(!failed().can_advance_to(&PipelineState::Done));
        assert!(!PipelineState::Done.can_advance_to(&failed()));
        assert!(!PipelineState::Composited.can_advance_to(&PipelineState::Done));
        assert!(!PipelineState::Created.can_advance_to(&PipelineState::TimelineBuilt));
        assert_eq!(failed().to_string(), "failed at segment 2: boom");
    }

    #[test]
    fn first_failure_keeps_index_order() {
        let ok: Vec<Result<usize>> = vec![Ok(0), Ok(1), Ok(2)];
        assert_eq!(first_failure(ok).unwrap(), vec![0, 1, 2]);

        let mixed: Vec<Result<usize>> = vec![
            Ok(0),
            Err(PipelineError::EmptyOutput { segment_index: 1 }),
            Err(PipelineError::EmptyOutput { segment_index: 2 }),
        ];
        let err = first_failure(mixed).unwrap_err();
        assert_eq!(err.segment_index(), Some(1));
    }
}
