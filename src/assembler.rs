use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::RenderJob;
use crate::speech::AudioClip;

/// Encoders tried after the configured one, in order of preference.
const FALLBACK_ENCODERS: &[&str] = &["libx264", "mpeg4"];

/// Muxes the held frames and the concatenated narration into one file.
pub struct Assembler {
    output: OutputConfig,
}

impl Assembler {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    /// Confirms the job's three tracks describe the same segments and length.
    pub fn check_sync(&self, job: &RenderJob) -> Result<()> {
        let timeline = &job.timeline;
        let mismatch = |msg: String| Err(PipelineError::SyncMismatch(msg));

        if timeline.fps() != self.output.fps {
            return mismatch(format!(
                "timeline built for {} fps, output is {} fps",
                timeline.fps(),
                self.output.fps
            ));
        }
        if job.frames.len() != timeline.len() || job.clips.len() != timeline.len() {
            return mismatch(format!(
                "{} timeline entries, {} frames, {} audio clips",
                timeline.len(),
                job.frames.len(),
                job.clips.len()
            ));
        }

        let dimensions = job.frames.first().map(|f| f.image.dimensions());
        for ((entry, frame), clip) in timeline.entries().iter().zip(&job.frames).zip(&job.clips) {
            let aligned = frame.segment_index == entry.segment_index
                && clip.segment_index == entry.segment_index;
            if !aligned {
                return mismatch(format!(
                    "timeline entry for segment {} paired with frame {} and clip {}",
                    entry.segment_index, frame.segment_index, clip.segment_index
                ));
            }
            if Some(frame.image.dimensions()) != dimensions {
                return mismatch(format!(
                    "frame {} is {:?}, expected {:?}",
                    frame.segment_index,
                    frame.image.dimensions(),
                    dimensions
                ));
            }
        }

        let audio_total: f64 = job.clips.iter().map(|c| c.duration_seconds).sum();
        let frame_period = 1.0 / self.output.fps as f64;
        let drift = (audio_total - timeline.end_seconds()).abs();
        if drift > frame_period {
            return mismatch(format!(
                "audio runs {:.3}s but video runs {:.3}s",
                audio_total,
                timeline.end_seconds()
            ));
        }

        Ok(())
    }

    pub fn assemble(&self, job: &RenderJob, destination: &Path) -> Result<PathBuf> {
        self.check_sync(job)?;

        let expected_ext = self.output.format.extension();
        let actual_ext = destination
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if actual_ext.as_deref() != Some(expected_ext) {
            return Err(PipelineError::Validation(format!(
                "Output file must have .{} extension, got: {}",
                expected_ext,
                destination.display()
            )));
        }

        let ffmpeg = which::which("ffmpeg").map_err(|_| {
            PipelineError::Encoder(
                "FFmpeg not found! Please install FFmpeg:\n\
                Fedora: sudo dnf install ffmpeg\n\
                Ubuntu: sudo apt install ffmpeg\n\
                macOS: brew install ffmpeg"
                    .to_string(),
            )
        })?;
        let encoder = self.pick_encoder(&ffmpeg)?;

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".scriptreel-")
            .suffix(&format!(".{}", expected_ext))
            .tempfile_in(parent)?;

        let (width, height) = job
            .frames
            .first()
            .map(|f| f.image.dimensions())
            .unwrap_or((0, 0));
        let args = self.ffmpeg_args(
            &encoder,
            width,
            height,
            &job.clips,
            job.timeline.end_seconds(),
            staging.path(),
        );
        debug!(?args, "spawning ffmpeg");

        let mut ffmpeg_cmd = Command::new(&ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = ffmpeg_cmd
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Encoder("Failed to open FFmpeg stdin".to_string()))?;

        let total_frames = job.timeline.total_frames();
        let report_every = (self.output.fps as u64 * 5).max(1);
        let mut written: u64 = 0;
        for (entry, frame) in job.timeline.entries().iter().zip(&job.frames) {
            let raw = frame.image.as_raw();
            for _ in 0..entry.frame_count() {
                if let Err(e) = stdin.write_all(raw) {
                    let _ = ffmpeg_cmd.kill();
                    let output = ffmpeg_cmd.wait_with_output()?;
                    return Err(PipelineError::Encoder(format!(
                        "FFmpeg write failed: {}\nFFmpeg error: {}",
                        e,
                        String::from_utf8_lossy(&output.stderr)
                    )));
                }
                written += 1;
                if written % report_every == 0 {
                    debug!(written, total_frames, "streaming frames");
                }
            }
        }

        // Close stdin to signal end of video stream
        drop(ffmpeg_cmd.stdin.take());
        let output = ffmpeg_cmd.wait_with_output()?;
        if !output.status.success() {
            return Err(PipelineError::Encoder(format!(
                "FFmpeg failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        staging
            .persist(destination)
            .map_err(|e| PipelineError::Io(e.error))?;
        info!(
            path = %destination.display(),
            frames = written,
            seconds = job.timeline.end_seconds(),
            "video written"
        );
        Ok(destination.to_path_buf())
    }

    fn pick_encoder(&self, ffmpeg: &Path) -> Result<String> {
        let output = Command::new(ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .output()?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let available: Vec<&str> = listing
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .collect();

        let mut candidates = vec![self.output.codec.as_str()];
        candidates.extend(FALLBACK_ENCODERS.iter().filter(|e| **e != self.output.codec));

        for (rank, encoder) in candidates.iter().enumerate() {
            if available.contains(encoder) {
                if rank > 0 {
                    warn!(
                        requested = %self.output.codec,
                        using = encoder,
                        "configured encoder unavailable"
                    );
                }
                return Ok(encoder.to_string());
            }
        }

        Err(PipelineError::Encoder(format!(
            "No suitable video encoder found (tried {})",
            candidates.join(", ")
        )))
    }

    fn ffmpeg_args(
        &self,
        encoder: &str,
        width: u32,
        height: u32,
        clips: &[AudioClip],
        duration: f64,
        destination: &Path,
    ) -> Vec<OsString> {
        let fps = self.output.fps.to_string();
        let mut args: Vec<OsString> = Vec::new();

        push_args(&mut args, &["-y", "-hide_banner", "-loglevel", "error", "-nostats"]);
        push_args(&mut args, &["-f", "rawvideo", "-pix_fmt", "rgb24"]);
        push_args(
            &mut args,
            &["-s", &format!("{}x{}", width, height), "-r", &fps, "-i", "pipe:0"],
        );
        for clip in clips {
            args.push("-i".into());
            args.push(clip.path.clone().into_os_string());
        }

        let inputs: String = (1..=clips.len()).map(|i| format!("[{}:a]", i)).collect();
        let filter = format!("{}concat=n={}:v=0:a=1[narration]", inputs, clips.len());
        push_args(
            &mut args,
            &["-filter_complex", &filter, "-map", "0:v", "-map", "[narration]"],
        );

        push_args(&mut args, &["-c:v", encoder, "-pix_fmt", "yuv420p", "-r", &fps]);
        push_args(&mut args, &["-b:v", &self.output.bitrate]);
        if encoder.starts_with("libx26") {
            push_args(&mut args, &["-preset", &self.output.preset]);
        }
        push_args(&mut args, &["-c:a", &self.output.audio_codec]);
        push_args(&mut args, &["-t", &format!("{:.6}", duration)]);
        if matches!(self.output.format.muxer(), "mp4" | "mov") {
            push_args(&mut args, &["-movflags", "+faststart"]);
        }
        push_args(&mut args, &["-f", self.output.format.muxer()]);
        args.push(destination.as_os_str().to_os_string());
        args
    }
}

fn push_args(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(OsString::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::Frame;
    use crate::timeline::TimelineBuilder;
    use image::RgbImage;

    fn job(durations: &[f64], fps: u32) -> RenderJob {
        let clips: Vec<AudioClip> = durations
            .iter()
            .enumerate()
            .map(|(segment_index, &duration_seconds)| AudioClip {
                segment_index,
                path: PathBuf::from(format!("/work/segment_{segment_index:04}.wav")),
                duration_seconds,
            })
            .collect();
        let timeline = TimelineBuilder::new(fps, 60.0, 0.25).build(&clips).unwrap();
        let frames = (0..durations.len())
            .map(|segment_index| Frame {
                segment_index,
                image: RgbImage::new(8, 16),
                font_scale: 1.0,
            })
            .collect();
        RenderJob::new(timeline, frames, clips, None)
    }

    fn assembler(fps: u32) -> Assembler {
        Assembler::new(OutputConfig {
            fps,
            ..OutputConfig::default()
        })
    }

    #[test]
    fn consistent_job_passes_sync_check() {
        assembler(30).check_sync(&job(&[1.01, 2.345, 0.7], 30)).unwrap();
    }

    #[test]
    fn audio_drift_beyond_a_frame_is_fatal() {
        let mut job = job(&[2.0, 3.0], 30);
        job.clips[1].duration_seconds += 0.1;
        assert!(matches!(
            assembler(30).check_sync(&job),
            Err(PipelineError::SyncMismatch(_))
        ));
    }

    #[test]
    fn misaligned_tracks_are_fatal() {
        let mut job = job(&[2.0, 3.0], 30);
        job.frames.swap(0, 1);
        assert!(matches!(
            assembler(30).check_sync(&job),
            Err(PipelineError::SyncMismatch(_))
        ));

        let mut job = self::job(&[2.0, 3.0], 30);
        job.frames.pop();
        assert!(assembler(30).check_sync(&job).is_err());

        let job = self::job(&[2.0, 3.0], 30);
        assert!(assembler(25).check_sync(&job).is_err());
    }

    #[test]
    fn mismatched_frame_size_is_fatal() {
        let mut job = job(&[2.0, 3.0], 30);
        job.frames[1].image = RgbImage::new(16, 16);
        assert!(assembler(30).check_sync(&job).is_err());
    }

    #[test]
    fn wrong_extension_is_rejected_before_encoding() {
        let job = job(&[2.0], 30);
        let err = assembler(30)
            .assemble(&job, Path::new("/tmp/out.avi"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn ffmpeg_args_concat_every_clip_in_order() {
        let job = job(&[1.0, 2.0, 3.0], 30);
        let args: Vec<String> = assembler(30)
            .ffmpeg_args("libx264", 8, 16, &job.clips, 6.0, Path::new("/out/reel.mp4"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let position = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert!(position("/work/segment_0000.wav") < position("/work/segment_0001.wav"));
        assert!(position("/work/segment_0001.wav") < position("/work/segment_0002.wav"));
        assert!(args.contains(&"[1:a][2:a][3:a]concat=n=3:v=0:a=1[narration]".to_string()));
        assert!(args.contains(&"8x16".to_string()));
        assert!(args.contains(&"-preset".to_string()));
        assert_eq!(args[position("-t") + 1], "6.000000");
        assert_eq!(args.last().unwrap(), "/out/reel.mp4");
    }
}
