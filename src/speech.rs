//! Text to speech, one segment at a time.
//!
//! Backends are external engines driven over the command line. The
//! renderer owns the retry and fallback policy so every backend gets the
//! same treatment, and it never reports a duration the backend did not
//! measure from decoded audio.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audio::measure_duration;
use crate::config::{SpeechEngine, VoiceConfig};
use crate::error::{PipelineError, Result};
use crate::segmenter::Segment;

/// Rendered narration for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    pub segment_index: usize,
    pub path: PathBuf,
    pub duration_seconds: f64,
}

/// What a backend hands back: the audio file and its measured length.
#[derive(Debug, Clone)]
pub struct RenderedAudio {
    pub path: PathBuf,
    pub duration_seconds: f64,
}

#[derive(Error, Debug)]
pub enum BackendError {
    /// Engine missing or unreachable. Worth retrying or falling back.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    fn into_pipeline_error(
        self,
        engine: &str,
        segment_index: usize,
        attempts: u32,
    ) -> PipelineError {
        match self {
            BackendError::Unavailable(_) => PipelineError::BackendUnavailable {
                engine: engine.to_string(),
                segment_index,
                attempts,
            },
            BackendError::Failed(message) => PipelineError::Backend {
                engine: engine.to_string(),
                segment_index,
                message,
            },
        }
    }
}

pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Renders `text` to a file under `work_dir` whose name starts with `stem`.
    fn render(
        &self,
        text: &str,
        voice: &VoiceConfig,
        work_dir: &Path,
        stem: &str,
    ) -> std::result::Result<RenderedAudio, BackendError>;
}

/// Native espeak-ng speaking rate, in words per minute.
const ESPEAK_WPM: f32 = 175.0;
/// Range espeak-ng accepts for `-s`.
const ESPEAK_WPM_RANGE: std::ops::RangeInclusive<f32> = 80.0..=450.0;

/// Fragments of gtts-cli stderr that mean the web service could not be reached.
const GTTS_NETWORK_ERRORS: &[&str] = &[
    "connection",
    "failed to connect",
    "timed out",
    "temporary failure in name resolution",
    "max retries exceeded",
    "429",
    "503",
];

/// Drives one of the supported command-line engines.
pub struct CommandBackend {
    engine: SpeechEngine,
    program: String,
}

impl CommandBackend {
    pub fn new(engine: SpeechEngine) -> Self {
        let program = match engine {
            SpeechEngine::EspeakNg => "espeak-ng",
            SpeechEngine::Pico2Wave => "pico2wave",
            SpeechEngine::Gtts => "gtts-cli",
        };
        Self {
            engine,
            program: program.to_string(),
        }
    }

    /// Runs `program` in place of the engine's usual executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn output_extension(&self) -> &'static str {
        match self.engine {
            SpeechEngine::Gtts => "mp3",
            _ => "wav",
        }
    }

    /// Rate espeak-ng should speak at, when it can honour the speed factor itself.
    fn native_wpm(&self, voice: &VoiceConfig) -> Option<u32> {
        if self.engine != SpeechEngine::EspeakNg {
            return None;
        }
        let wpm = (ESPEAK_WPM * voice.speed_factor).round();
        ESPEAK_WPM_RANGE.contains(&wpm).then_some(wpm as u32)
    }

    /// Whether the rendered file still needs an `atempo` pass.
    fn needs_tempo_pass(&self, voice: &VoiceConfig) -> bool {
        (voice.speed_factor - 1.0).abs() > f32::EPSILON && self.native_wpm(voice).is_none()
    }

    fn args(&self, voice: &VoiceConfig, output: &Path, text: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self.engine {
            SpeechEngine::EspeakNg => {
                let wpm = self.native_wpm(voice).unwrap_or(ESPEAK_WPM as u32);
                push_args(&mut args, &["-v", &voice.language, "-s", &wpm.to_string(), "-w"]);
                args.push(output.as_os_str().to_os_string());
                args.push("--stdin".into());
            }
            SpeechEngine::Pico2Wave => {
                push_args(&mut args, &["-l", pico_language(&voice.language), "-w"]);
                args.push(output.as_os_str().to_os_string());
                args.push(text.into());
            }
            SpeechEngine::Gtts => {
                push_args(&mut args, &["--lang", &voice.language, "--output"]);
                args.push(output.as_os_str().to_os_string());
                args.push("-".into());
            }
        }
        args
    }

    fn reads_stdin(&self) -> bool {
        self.engine != SpeechEngine::Pico2Wave
    }

    /// Classifies a non-zero exit from the engine.
    fn exit_error(&self, stderr: &str) -> BackendError {
        let stderr = stderr.trim().to_string();
        let lowered = stderr.to_lowercase();
        let network = GTTS_NETWORK_ERRORS.iter().any(|m| lowered.contains(m));
        if self.engine == SpeechEngine::Gtts && network {
            BackendError::Unavailable(stderr)
        } else {
            BackendError::Failed(stderr)
        }
    }
}

impl SpeechBackend for CommandBackend {
    fn name(&self) -> &str {
        self.engine.as_str()
    }

    fn render(
        &self,
        text: &str,
        voice: &VoiceConfig,
        work_dir: &Path,
        stem: &str,
    ) -> std::result::Result<RenderedAudio, BackendError> {
        let program = which::which(&self.program)
            .map_err(|_| BackendError::Unavailable(format!("'{}' not found", self.program)))?;

        let raw_path = work_dir.join(format!("{}.{}", stem, self.output_extension()));
        let mut cmd = Command::new(program);
        cmd.args(self.args(voice, &raw_path, text))
            .stdin(if self.reads_stdin() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Unavailable(format!("failed to start: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| BackendError::Failed(format!("failed to send text: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        if !output.status.success() {
            return Err(self.exit_error(&String::from_utf8_lossy(&output.stderr)));
        }

        let path = if self.needs_tempo_pass(voice) {
            let adjusted = work_dir.join(format!("{}.tempo.wav", stem));
            apply_tempo(&raw_path, &adjusted, voice.speed_factor)?;
            adjusted
        } else {
            raw_path
        };

        let duration_seconds = measure_duration(&path)
            .map_err(|e| BackendError::Failed(format!("unreadable audio: {}", e)))?;
        Ok(RenderedAudio {
            path,
            duration_seconds,
        })
    }
}

fn push_args(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(OsString::from));
}

fn pico_language(language: &str) -> &str {
    match language {
        "en" => "en-US",
        "de" => "de-DE",
        "es" => "es-ES",
        "fr" => "fr-FR",
        "it" => "it-IT",
        other => other,
    }
}

/// ffmpeg's `atempo` accepts 0.5..=2.0 per stage, so larger factors are chained.
pub(crate) fn atempo_chain(factor: f32) -> String {
    let mut remaining = factor as f64;
    let mut stages = Vec::new();
    while remaining > 2.0 {
        stages.push("atempo=2.0".to_string());
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        stages.push("atempo=0.5".to_string());
        remaining /= 0.5;
    }
    stages.push(format!("atempo={:.4}", remaining));
    stages.join(",")
}

fn apply_tempo(
    input: &Path,
    output: &Path,
    factor: f32,
) -> std::result::Result<(), BackendError> {
    which::which("ffmpeg").map_err(|_| {
        BackendError::Unavailable("ffmpeg is required to change speech speed".to_string())
    })?;

    let result = Command::new("ffmpeg")
        .args(["-y", "-loglevel", "error", "-i"])
        .arg(input)
        .args(["-filter:a", &atempo_chain(factor)])
        .arg(output)
        .output()
        .map_err(|e| BackendError::Failed(format!("ffmpeg tempo pass: {}", e)))?;

    if !result.status.success() {
        return Err(BackendError::Failed(format!(
            "ffmpeg tempo pass failed: {}",
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    Ok(())
}

/// Renders segments through a primary backend with an optional fallback.
pub struct SpeechRenderer {
    backends: Vec<Box<dyn SpeechBackend>>,
}

impl SpeechRenderer {
    pub fn from_config(voice: &VoiceConfig) -> Self {
        let primary: Box<dyn SpeechBackend> = Box::new(CommandBackend::new(voice.engine));
        let fallback = voice
            .fallback_engine
            .filter(|engine| *engine != voice.engine)
            .map(|engine| Box::new(CommandBackend::new(engine)) as Box<dyn SpeechBackend>);
        Self::with_backends(primary, fallback)
    }

    pub fn with_backends(
        primary: Box<dyn SpeechBackend>,
        fallback: Option<Box<dyn SpeechBackend>>,
    ) -> Self {
        let mut backends = vec![primary];
        backends.extend(fallback);
        Self { backends }
    }

    pub fn engine_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn render(
        &self,
        segment: &Segment,
        voice: &VoiceConfig,
        work_dir: &Path,
    ) -> Result<AudioClip> {
        let stem = format!("segment_{:04}", segment.index);
        let mut attempts = 0;

        for backend in &self.backends {
            for attempt in 1..=voice.max_attempts {
                attempts += 1;
                match backend.render(&segment.text, voice, work_dir, &stem) {
                    Ok(audio) => {
                        if !(audio.duration_seconds > 0.0) {
                            return Err(PipelineError::EmptyOutput {
                                segment_index: segment.index,
                            });
                        }
                        debug!(
                            segment = segment.index,
                            engine = backend.name(),
                            duration = audio.duration_seconds,
                            "speech rendered"
                        );
                        return Ok(AudioClip {
                            segment_index: segment.index,
                            path: audio.path,
                            duration_seconds: audio.duration_seconds,
                        });
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let error = e.into_pipeline_error(backend.name(), segment.index, attempts);
                        if !error.is_retryable() {
                            return Err(error);
                        }
                        warn!(
                            segment = segment.index,
                            engine = backend.name(),
                            attempt,
                            "speech engine {}",
                            reason
                        );
                        if attempt < voice.max_attempts && voice.retry_delay_ms > 0 {
                            std::thread::sleep(Duration::from_millis(voice.retry_delay_ms));
                        }
                    }
                }
            }
        }

        Err(PipelineError::BackendUnavailable {
            engine: self.engine_names().join(", "),
            segment_index: segment.index,
            attempts,
        })
    }
}
