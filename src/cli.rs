use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(long, value_name = "CONFIG FILE")]
    pub config: Option<PathBuf>,

    /// Narration script, or `-` to read it from stdin
    #[arg(short, long, value_name = "SCRIPT FILE")]
    pub input: PathBuf,

    /// Output video file
    #[arg(short, long, value_name = "OUTPUT PATH")]
    pub output: Option<PathBuf>,

    /// Custom font file (TTF, OTF)
    #[arg(
        short,
        long,
        value_name = "FONT FILE",
        help = "Custom font file to use for text rendering"
    )]
    pub font: Option<PathBuf>,

    /// Override the configured frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Override the configured duration cap, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub cap: Option<f64>,

    /// Write the computed timeline as JSON
    #[arg(long, value_name = "JSON FILE")]
    pub timeline: Option<PathBuf>,

    /// Stop before encoding and print the timeline
    #[arg(long)]
    pub dry_run: bool,

    /// Log per-segment detail
    #[arg(short, long)]
    pub verbose: bool,
}
