//! Command-line interface definition using clap

use clap::Parser;
use std::path::PathBuf;

// =============================================================================
// CLI Definition
// =============================================================================

/// Open a device stream and relay it to the terminal
#[derive(Parser, Debug, Default)]
#[command(name = "streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file (default: ./devstreams.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Give up connecting after this many seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Print the connection metadata as JSON once connected
    #[arg(long)]
    pub meta: bool,

    /// Target URL, e.g. tcp://localhost:9000 or tty:///dev/ttyUSB0
    pub url: String,
}

// =============================================================================
// Tests
// =============================================================================
