//! CLI module for Scenecast.

pub mod commands;
mod output;
pub mod preflight;

pub use output::Output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Scenecast - narrated audio to storyboarded, generated scenes
///
/// Runs captions through a resumable story pipeline, then generates an image
/// (and optionally a video clip) for every scene with a pool of sessions.
#[derive(Parser, Debug)]
#[command(name = "scenecast")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SCENECAST_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run from a caption file and run the story pipeline
    Start {
        /// Identifier of the new run
        run_id: String,

        /// Caption file (.srt or .json)
        captions: PathBuf,
    },

    /// Continue a stopped or failed run from its first missing step
    Resume {
        /// Run to resume
        run_id: String,
    },

    /// Show the status of one run, or list all runs
    Status {
        /// Run to inspect (all runs if omitted)
        run_id: Option<String>,
    },

    /// Generate scene assets for a completed run
    Generate {
        /// Run to generate assets for
        run_id: String,

        /// Also generate a video clip per scene
        #[arg(long)]
        video: bool,

        /// Generate character and location reference portraits first
        #[arg(long)]
        reference_images: bool,

        /// Number of worker sessions (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Copy generated assets into the visual directory with a manifest
    Export {
        /// Run to export
        run_id: String,

        /// Export directory (defaults to <visual_dir>/<run_id>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the story model of a run
    Show {
        /// Run to show
        run_id: String,

        /// Print the raw model as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Open configuration file in editor
    Edit,

    /// Show configuration file path
    Path,
}
