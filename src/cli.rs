use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kui",
    version,
    about = "A block-based terminal shell for kubectl and friends."
)]
pub struct CliArgs {
    /// Shell used to run commands (defaults to $SHELL, then /bin/sh)
    #[arg(long)]
    pub shell: Option<String>,

    /// Constrained display mode: starting a command closes the sidecar
    #[arg(long)]
    pub popup: bool,

    /// Runtime config file (otherwise discovered from KUI_CONFIG or kui.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of tabs opened at startup
    #[arg(long, default_value_t = 1)]
    pub tabs: u8,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Write logs to this file instead of discarding them
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
