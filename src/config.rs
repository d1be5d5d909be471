use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ceiling on the narrated length of the video, in seconds.
    pub total_duration_cap: f64,
    /// Shortest narration accepted for one segment; never below one frame.
    pub min_segment_seconds: f64,
    pub segmenter: SegmenterConfig,
    pub voice: VoiceConfig,
    pub visual: VisualConfig,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            total_duration_cap: 60.0,
            min_segment_seconds: 0.25,
            segmenter: SegmenterConfig::default(),
            voice: VoiceConfig::default(),
            visual: VisualConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file '{}' does not exist", path.display());
                }
                Self::from_file(path)
            }
            None => Ok(PipelineConfig::default()),
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let file_content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: PipelineConfig = toml::from_str(&file_content).with_context(|| {
            format!(
                "Failed to parse config file '{}' - check TOML syntax",
                path.display()
            )
        })?;

        Ok(config)
    }

    /// Checks every value a stage relies on. Runs once, before any work starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Validation(msg));

        if !(self.total_duration_cap.is_finite() && self.total_duration_cap > 0.0) {
            return invalid(format!(
                "total_duration_cap must be positive, got {}",
                self.total_duration_cap
            ));
        }

        if !(self.min_segment_seconds >= 0.0 && self.min_segment_seconds < self.total_duration_cap)
        {
            return invalid(format!(
                "min_segment_seconds must be in [0, total_duration_cap), got {}",
                self.min_segment_seconds
            ));
        }

        let seg = &self.segmenter;
        if seg.words_per_second <= 0.0 || seg.max_segment_seconds <= 0.0 {
            return invalid("segmenter rates must be positive".to_string());
        }
        if seg.min_words == 0 {
            return invalid("segmenter.min_words must be at least 1".to_string());
        }

        let voice = &self.voice;
        if !(voice.speed_factor > 0.0 && voice.speed_factor <= 4.0) {
            return invalid(format!(
                "voice.speed_factor must be in (0, 4], got {}",
                voice.speed_factor
            ));
        }
        if voice.max_attempts == 0 {
            return invalid("voice.max_attempts must be at least 1".to_string());
        }
        if voice.language.trim().is_empty() {
            return invalid("voice.language must not be empty".to_string());
        }

        let visual = &self.visual;
        if visual.width == 0 || visual.height == 0 {
            return invalid("visual resolution must be non-zero".to_string());
        }
        if visual.width % 2 != 0 || visual.height % 2 != 0 {
            return invalid(format!(
                "visual resolution must be even for yuv420p, got {}x{}",
                visual.width, visual.height
            ));
        }
        if visual.font_size < 1.0 {
            return invalid("visual.font_size must be at least 1".to_string());
        }
        if !(visual.min_font_scale > 0.0 && visual.min_font_scale <= 1.0) {
            return invalid("visual.min_font_scale must be in (0, 1]".to_string());
        }
        if !(visual.font_scale_step > 0.0 && visual.font_scale_step < 1.0) {
            return invalid("visual.font_scale_step must be in (0, 1)".to_string());
        }
        if 2 * visual.padding >= visual.width.min(visual.height) {
            return invalid("visual.padding leaves no room for text".to_string());
        }
        parse_hex_color(&visual.font_color)?;
        if let Some(shadow) = &visual.shadow_color {
            parse_hex_color(shadow)?;
        }
        match &visual.background {
            BackgroundType::Solid { color } => {
                parse_hex_color(color)?;
            }
            BackgroundType::Gradient {
                start_color,
                end_color,
                ..
            } => {
                parse_hex_color(start_color)?;
                parse_hex_color(end_color)?;
            }
            BackgroundType::Image { opacity, .. } => {
                if !(0.0..=1.0).contains(opacity) {
                    return invalid("background opacity must be in [0, 1]".to_string());
                }
            }
        }

        if self.output.fps == 0 {
            return invalid("output.fps must be non-zero".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Pieces with fewer words are merged into a neighbour.
    pub min_words: usize,
    /// Longest narration a single segment should plausibly need.
    pub max_segment_seconds: f64,
    /// Speaking rate used only to bound segment length, never for timing.
    pub words_per_second: f64,
    pub strip_urls: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            min_words: 4,
            max_segment_seconds: 8.0,
            words_per_second: 2.5,
            strip_urls: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeechEngine {
    #[serde(rename = "espeak-ng")]
    EspeakNg,
    #[serde(rename = "pico2wave")]
    Pico2Wave,
    #[serde(rename = "gtts")]
    Gtts,
}

impl SpeechEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechEngine::EspeakNg => "espeak-ng",
            SpeechEngine::Pico2Wave => "pico2wave",
            SpeechEngine::Gtts => "gtts",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    pub engine: SpeechEngine,
    pub fallback_engine: Option<SpeechEngine>,
    pub language: String,
    pub speed_factor: f32,
    /// Attempts per engine before giving up on it.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        VoiceConfig {
            engine: SpeechEngine::EspeakNg,
            fallback_engine: None,
            language: "en".to_string(),
            speed_factor: 1.0,
            max_attempts: 3,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VisualConfig {
    pub width: u32,
    pub height: u32,
    pub background: BackgroundType,
    /// Path to a TTF/OTF file. Common system fonts are tried when unset.
    pub font_family: Option<String>,
    pub font_size: f32,
    pub font_color: String,
    pub shadow_color: Option<String>,
    pub padding: u32,
    /// Line height as a multiple of the font size.
    pub line_spacing: f32,
    pub font_scale_step: f32,
    pub min_font_scale: f32,
}

impl Default for VisualConfig {
    fn default() -> Self {
        VisualConfig {
            width: 1080,
            height: 1920,
            background: BackgroundType::default(),
            font_family: None,
            font_size: 64.0,
            font_color: "#FFFFFF".to_string(),
            shadow_color: Some("#000000".to_string()),
            padding: 60,
            line_spacing: 1.3,
            font_scale_step: 0.1,
            min_font_scale: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub enum BackgroundType {
    Solid {
        color: String,
    },
    Image {
        path: String,
        scaling: Scaling,
        opacity: f32,
    },
    Gradient {
        start_color: String,
        end_color: String,
        direction: GradientDirection,
    },
}

impl Default for BackgroundType {
    fn default() -> Self {
        BackgroundType::Solid {
            color: "#101820".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    Stretch,
    Fit,
    Fill,
    Tile,
    Center,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum GradientDirection {
    Horizontal,
    Vertical,
    Diagonal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "mp4")]
    Mp4,
    #[serde(rename = "mov")]
    Mov,
    #[serde(rename = "mkv")]
    Mkv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mov => "mov",
            OutputFormat::Mkv => "mkv",
        }
    }

    /// Name of the ffmpeg muxer for this container.
    pub fn muxer(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mov => "mov",
            OutputFormat::Mkv => "matroska",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub fps: u32,
    pub format: OutputFormat,
    pub codec: String,
    pub audio_codec: String,
    pub bitrate: String,
    pub preset: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            fps: 30,
            format: OutputFormat::Mp4,
            codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            bitrate: "4M".to_string(),
            preset: "medium".to_string(),
        }
    }
}

pub fn parse_hex_color(hex: &str) -> Result<[u8; 3], PipelineError> {
    let digits = hex.trim_start_matches('#');
    let bad = || PipelineError::Validation(format!("Invalid hex color: {}", hex));
    if digits.len() != 6 || !digits.is_ascii() {
        return Err(bad());
    }

    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16).map_err(|_| bad())
    };
    Ok([channel(0..2)?, channel(2..4)?, channel(4..6)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: PipelineConfig = toml::from_str(
            r##"
            total_duration_cap = 30.0

            [voice]
            engine = "gtts"
            fallback_engine = "espeak-ng"

            [visual.background.Gradient]
            start_color = "#000000"
            end_color = "#336699"
            direction = "Diagonal"

            [output]
            fps = 24
            format = "mkv"
            "##,
        )
        .unwrap();

        assert_eq!(config.total_duration_cap, 30.0);
        assert_eq!(config.voice.engine, SpeechEngine::Gtts);
        assert_eq!(config.voice.fallback_engine, Some(SpeechEngine::EspeakNg));
        assert_eq!(config.voice.max_attempts, 3);
        assert_eq!(config.visual.width, 1080);
        assert_eq!(config.output.fps, 24);
        assert_eq!(config.output.format.muxer(), "matroska");
        config.validate().unwrap();
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = PipelineConfig::load_or_default(Some(Path::new("/nonexistent/reel.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.total_duration_cap = 0.0;
        assert!(matches!(config.validate(), Err(PipelineError::Validation(_))));

        let mut config = PipelineConfig::default();
        config.voice.speed_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.visual.font_color = "#GG0000".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.visual.width = 1081;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.output.fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_hex_colors() {
        assert_eq!(parse_hex_color("#FFD700").unwrap(), [255, 215, 0]);
        assert_eq!(parse_hex_color("00ff7f").unwrap(), [0, 255, 127]);
        assert!(parse_hex_color("#FFF").is_err());
        assert!(parse_hex_color("#ééé").is_err());
    }
}
