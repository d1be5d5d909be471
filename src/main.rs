use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use scriptreel::{Cli, Pipeline, PipelineConfig, PipelineError, RunTracker, Timeline};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match PipelineConfig::load_or_default(cli.config.as_deref()) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("Config Error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(font) = &cli.font {
        config.visual.font_family = Some(font.to_string_lossy().into_owned());
    }
    if let Some(fps) = cli.fps {
        config.output.fps = fps;
    }
    if let Some(cap) = cli.cap {
        config.total_duration_cap = cap;
    }
    println!("✅ Configuration loaded successfully!");

    let script = read_script(&cli.input)?;
    let pipeline = match Pipeline::new(config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize pipeline: {}", e);
            std::process::exit(1);
        }
    };

    if cli.dry_run {
        let mut tracker = RunTracker::default();
        let job = match pipeline.plan(&script, &mut tracker) {
            Ok(job) => job,
            Err(e) => fail(e, cli.timeline.as_deref()),
        };
        print_timeline(&job.timeline);
        if let Some(path) = &cli.timeline {
            write_timeline(&job.timeline, path)?;
        }
        return Ok(());
    }

    let output_path = match cli.output {
        Some(path) => path,
        None => generate_output_path(&cli.input, pipeline.config().output.format.extension())?,
    };

    println!("\n🎬 Generating video...");
    let report = pipeline.run(&script, &output_path);
    match report.result {
        Ok(output) => {
            if let Some(path) = &cli.timeline {
                write_timeline(&output.timeline, path)?;
            }
            println!(
                "\n🎉 {} segments, {:.2}s",
                output.timeline.len(),
                output.timeline.end_seconds()
            );
            println!("📁 Output saved to: {}", output.path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Pipeline {}", report.tracker.state());
            fail(e, cli.timeline.as_deref())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "scriptreel=debug,info"
    } else {
        "scriptreel=info,warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn read_script(input: &Path) -> Result<String> {
    if input == Path::new("-") {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        return Ok(script);
    }
    std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read script '{}'", input.display()))
}

/// Reports a pipeline failure and exits. An overrun still dumps the truncated timeline.
fn fail(error: PipelineError, timeline_path: Option<&Path>) -> ! {
    if let PipelineError::DurationCapExceeded { truncated, .. } = &error {
        print_timeline(truncated);
        if let Some(path) = timeline_path {
            if let Err(e) = write_timeline(truncated, path) {
                eprintln!("{:#}", e);
            }
        }
        eprintln!("Shorten the script or raise total_duration_cap.");
    }
    eprintln!("Video generation failed: {}", error);
    std::process::exit(1);
}

fn print_timeline(timeline: &Timeline) {
    println!("\n📝 Timeline ({} fps):", timeline.fps());
    for entry in timeline.entries() {
        println!(
            "  #{:<3} {:>8.3}s -> {:>8.3}s  ({} frames)",
            entry.segment_index,
            entry.start_seconds,
            entry.end_seconds,
            entry.frame_count()
        );
    }
}

fn write_timeline(timeline: &Timeline, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(timeline)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write timeline '{}'", path.display()))?;
    println!("🗒️  Timeline written to: {}", path.display());
    Ok(())
}

fn generate_output_path(script_path: &Path, extension: &str) -> Result<PathBuf> {
    if script_path == Path::new("-") {
        return Ok(PathBuf::from(format!("reel.{}", extension)));
    }

    // Get the file stem (filename without extension)
    let file_stem = script_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid script file path"))?;

    let parent_dir = script_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."));

    let output_filename = format!("{}_reel.{}", file_stem, extension);
    Ok(parent_dir.join(output_filename))
}
