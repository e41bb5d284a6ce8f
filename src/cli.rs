use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pagegov")]
#[command(
    version,
    about = "pagegov - Resource governance for headless rendering workers",
    long_about = "pagegov\n\nOperational commands for the adaptive resource governor:\n- probe: sample host resources once and report pressure and the recommended pool size.\n- sweep-orphans: find and kill leaked rendering-engine processes.\n- clean-temp: remove stale engine profiles and temp artifacts.\n\nUse --help on any subcommand for details."
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Enable verbose (debug) logging on stderr")]
    pub verbose: bool,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Optional config file (TOML); falls back to ~/.config/pagegov/config.toml, then built-in defaults"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "json",
        help = "Output format"
    )]
    pub format: OutputFormat,

    #[arg(long, short, global = true, help = "Output file path (stdout if omitted)")]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Take one resource sample and report pressure and pool sizing
    Probe {
        #[arg(
            long,
            default_value = "0",
            help = "Active requests to assume when computing the recommended pool size"
        )]
        active_requests: usize,
    },

    /// Kill rendering-engine processes left behind by crashed runs
    SweepOrphans {
        #[arg(long, help = "List matching processes without killing them")]
        dry_run: bool,

        #[arg(
            long,
            value_name = "TEXT",
            help = "Only match processes whose command line contains this marker (overrides config)"
        )]
        profile_marker: Option<String>,
    },

    /// Remove stale engine profiles and temp artifacts
    CleanTemp {
        #[arg(
            long,
            help = "Use the short pressure age limit and drop oversized files regardless of age"
        )]
        aggressive: bool,

        #[arg(
            long = "dir",
            value_name = "PATH",
            help = "Directory to scan (repeatable; overrides config)"
        )]
        directories: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Pretty,
}

pub fn parse() -> Cli {
    Cli::parse()
}
