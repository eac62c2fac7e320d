use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for the editor-side DAP client.
    #[clap(long, default_value = "127.0.0.1:4711")]
    pub listen: String,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    pub oneshot: bool,

    /// Launch configuration file (JSON) describing the debug session:
    /// program, args, cwd, env, console mode, backend flags.
    #[clap(short, long)]
    pub launch_config: Option<PathBuf>,

    /// Optional log file for proxy diagnostics (no output to stdout).
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    pub trace_dap: bool,
}
