//! Launch configuration and its translation into backend argv/env/cwd.
//!
//! The editor-side collaborator hands the proxy a flat configuration record;
//! this module turns it into the concrete command line for the backend's
//! `dap` subcommand and resolves where the backend executable lives.

use crate::error::ProxyError;
use crate::message::EventSink;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use strum_macros::{Display, EnumString};

/// Marker printed by the backend once its DAP listener is up.
pub const READY_MARKER: &str = "DAP server listening at:";

/// Environment variable through which the debuggee path is communicated to
/// the backend's `dap` subcommand in spawn modes.
pub const PROGRAM_ENV: &str = "DAP_LAUNCH_PROGRAM";

/// Where the editor wants the backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, Display)]
#[serde(rename_all = "camelCase")]
pub enum ConsoleMode {
    #[default]
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "integratedTerminal")]
    IntegratedTerminal,
    #[strum(serialize = "externalTerminal")]
    ExternalTerminal,
}

/// Flat launch configuration consumed by the proxy core.
///
/// This is the editor-facing record described by the debug configuration
/// provider; unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfiguration {
    pub name: String,
    /// `"launch"` or `"attach"`.
    pub request: String,
    /// Path of the debuggee program.
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overrides merged over the inherited process environment.
    pub env: HashMap<String, String>,
    pub host: Option<String>,
    /// An explicit port means the backend is externally launched: connect
    /// only, never spawn.
    pub port: Option<u16>,
    pub show_log: bool,
    pub log_output: Option<String>,
    pub log_dest: Option<PathBuf>,
    /// Extra flags passed through to the backend verbatim. The backend
    /// accepts the last value when flags repeat.
    pub dlv_flags: Vec<String>,
    pub console: ConsoleMode,
    /// Override for locating the backend executable.
    pub dlv_tool_path: Option<PathBuf>,
    /// Build directory determined while resolving the debug config; wins
    /// over `cwd` for launch requests.
    pub build_dir: Option<PathBuf>,
}

impl DebugConfiguration {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn externally_launched(&self) -> bool {
        self.port.is_some()
    }

    pub fn wants_terminal(&self) -> bool {
        matches!(
            self.console,
            ConsoleMode::IntegratedTerminal | ConsoleMode::ExternalTerminal
        )
    }
}

/// Everything needed to spawn the backend, minus the listen/dial flags the
/// supervisor appends once it knows the port.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub tool: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overrides only; the inherited environment is the base and these win
    /// on conflict.
    pub env: HashMap<String, String>,
}

/// Translate a launch configuration into a spawnable command description.
pub fn spawn_config(
    config: &DebugConfiguration,
    sink: &EventSink,
) -> Result<SpawnConfig, ProxyError> {
    let tool = resolve_backend(config.dlv_tool_path.as_deref()).ok_or_else(|| {
        let wanted = config
            .dlv_tool_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "dlv".to_string());
        sink.output(
            "stderr",
            format!(
                "Couldn't find {wanted} in GOROOT, GOPATH, $HOME/go/bin or PATH.\n\
                 Install the debugger backend or set `dlvToolPath` in the launch configuration.\n"
            ),
        );
        ProxyError::BackendNotFound(wanted)
    })?;

    if config.request == "launch" && !config.program.is_empty() {
        validate_program(Path::new(&config.program), sink)?;
    }

    if let Some(dest) = &config.log_dest {
        if !cfg!(unix) {
            sink.output("stderr", "Using `logDest` is not supported on this platform.\n");
            return Err(ProxyError::LogDestUnsupported);
        }
        if !dest.is_absolute() {
            sink.output(
                "stderr",
                format!(
                    "Using a relative path for `logDest` ({}) is not allowed.\n",
                    dest.display()
                ),
            );
            return Err(ProxyError::RelativeLogDest(dest.clone()));
        }
    }

    let mut args = vec!["dap".to_string()];
    args.extend(config.dlv_flags.iter().cloned());
    args.push("--check-go-version=false".to_string());
    if config.show_log {
        args.push("--log=true".to_string());
        // only meaningful together with --log, the backend complains otherwise
        if let Some(output) = &config.log_output {
            args.push(format!("--log-output={output}"));
        }
    }

    let mut env = config.env.clone();
    if config.request == "launch" && !config.program.is_empty() {
        env.insert(PROGRAM_ENV.to_string(), config.program.clone());
    }

    let cwd = config.build_dir.clone().or_else(|| config.cwd.clone());

    Ok(SpawnConfig {
        tool,
        args,
        cwd,
        env,
    })
}

/// Sanity checks on the debuggee binary before spawning the backend.
/// A missing file is fatal; the rest only warns into the debug console.
fn validate_program(program: &Path, sink: &EventSink) -> Result<(), ProxyError> {
    let meta = match std::fs::metadata(program) {
        Ok(meta) => meta,
        Err(_) => {
            sink.output(
                "stderr",
                format!("Binary file does not exist: {}\n", program.display()),
            );
            return Err(ProxyError::ProgramInvalid(format!(
                "no such file: {}",
                program.display()
            )));
        }
    };
    if meta.len() == 0 {
        sink.output(
            "console",
            format!("Warning: binary file is empty: {}\n", program.display()),
        );
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            sink.output(
                "console",
                format!("Warning: binary file is not executable: {}\n", program.display()),
            );
        }
    }
    Ok(())
}

static DEFAULT_TOOL: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Locate the backend executable.
///
/// An explicit override wins. Otherwise `$GOROOT/bin`, `$GOPATH/bin` and
/// `$HOME/go/bin` are probed (preferring `dlv2` over `dlv` within each
/// directory) before falling back to a `PATH` lookup. The default result is
/// cached process-wide; the cache has no teardown.
pub fn resolve_backend(tool_override: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = tool_override {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        // a bare name like "dlv" is resolved through PATH
        if let Ok(found) = which::which(path) {
            return Some(found);
        }
        warn!(target: "proxy", "`dlvToolPath` override {} not found", path.display());
        return None;
    }

    DEFAULT_TOOL
        .get_or_init(|| {
            let mut dirs: Vec<PathBuf> = Vec::new();
            if let Ok(goroot) = std::env::var("GOROOT") {
                dirs.push(PathBuf::from(goroot).join("bin"));
            }
            if let Ok(gopath) = std::env::var("GOPATH") {
                dirs.push(PathBuf::from(gopath).join("bin"));
            }
            if let Some(home) = home::home_dir() {
                dirs.push(home.join("go").join("bin"));
            }
            for dir in dirs {
                for name in ["dlv2", "dlv"] {
                    let candidate = dir.join(name);
                    if candidate.exists() {
                        debug!(target: "proxy", "resolved backend to {}", candidate.display());
                        return Some(candidate);
                    }
                }
            }
            which::which("dlv").ok()
        })
        .clone()
}
