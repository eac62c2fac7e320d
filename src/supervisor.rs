//! Backend process supervision.
//!
//! Spawns the debugger backend (or connects to an externally running one),
//! watches for its ready marker, forwards its stdout/stderr as `output`
//! events, and owns graceful/forced termination. The relay only ever sees
//! the resulting [`TcpStream`], never the raw process.

use crate::error::ProxyError;
use crate::launch::{self, DebugConfiguration, READY_MARKER};
use crate::message::{EventSink, Message};
use crate::rendezvous::Rendezvous;
use crate::{net, trace};
use log::{debug, info, warn};
use std::io::{BufRead, BufReader, Read};
use std::net::TcpStream;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Session timing knobs. Every deadline the session logic uses lives here
/// so tests can shrink them.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Wait for the backend's ready marker.
    pub ready_wait: Duration,
    /// Per-attempt socket connect timeout.
    pub connect_attempt: Duration,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    /// Wait for the dial-back in terminal mode.
    pub rendezvous_accept: Duration,
    /// Grace period between SIGINT and SIGKILL.
    pub kill_grace: Duration,
    /// Age threshold for pending-request eviction.
    pub pending_max_age: Duration,
    pub reap_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready_wait: Duration::from_secs(30),
            connect_attempt: Duration::from_secs(1),
            connect_retries: 5,
            connect_backoff: Duration::from_millis(500),
            rendezvous_accept: Duration::from_secs(30),
            kill_grace: Duration::from_secs(1),
            pending_max_age: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
        }
    }
}

/// A connected backend: the duplex stream plus, when this process spawned
/// the backend itself, the process handle.
#[derive(Debug)]
pub struct BackendConnection {
    pub stream: TcpStream,
    pub process: Option<BackendProcess>,
}

/// Exclusive owner of the spawned backend process.
#[derive(Debug)]
pub struct BackendProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Graceful stop, escalating to SIGKILL after the grace period.
    /// Safe to call more than once and on an already-exited process.
    pub fn shutdown(&self, grace: Duration) {
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            info!(target: "supervisor", "backend ({}) already exited: {status}", self.pid);
            return;
        }
        // SIGINT first: let the backend clean up its own children
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT) {
            debug!(target: "supervisor", "SIGINT to backend ({}) failed: {err}", self.pid);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                info!(target: "supervisor", "backend ({}) exited after SIGINT: {status}", self.pid);
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        warn!(target: "supervisor", "backend ({}) isn't responding, killing", self.pid);
        let _ = child.kill();
        let _ = child.wait();
    }
}

enum StartSignal {
    Ready,
    Exited(ExitStatus),
}

/// Bring up a backend connection for one debug session.
///
/// An explicit port in the configuration means "externally launched":
/// connect only. A terminal console mode selects the rendezvous flow.
/// Otherwise the backend is spawned directly with piped stdio.
pub fn start(
    config: &DebugConfiguration,
    sink: &EventSink,
    timeouts: &Timeouts,
) -> Result<BackendConnection, ProxyError> {
    if let Some(port) = config.port {
        let addr = format!("{}:{port}", config.host());
        info!(target: "supervisor", "attaching to externally launched backend at {addr}");
        let stream = net::connect_retry(
            &addr,
            timeouts.connect_retries,
            timeouts.connect_backoff,
            timeouts.connect_attempt,
        )?;
        return Ok(BackendConnection {
            stream,
            process: None,
        });
    }
    if config.wants_terminal() {
        return start_in_terminal(config, sink, timeouts);
    }
    spawn_backend(config, sink, timeouts)
}

/// Terminal mode: the editor runs the backend command line; the backend
/// dials back to a one-shot listener instead of being spawned here.
fn start_in_terminal(
    config: &DebugConfiguration,
    sink: &EventSink,
    timeouts: &Timeouts,
) -> Result<BackendConnection, ProxyError> {
    let spawn = launch::spawn_config(config, sink)?;

    let mut argv = vec![spawn.tool.display().to_string()];
    argv.extend(spawn.args);
    // in terminal mode the user-specified logDest goes straight on the flag,
    // there is no auxiliary pipe to route through
    if let Some(dest) = &config.log_dest {
        argv.push(format!("--log-dest={}", dest.display()));
    }

    let rendezvous = Rendezvous::bind(0)?;
    let port = rendezvous.port()?;
    argv.push(format!("--client-addr=:{port}"));

    let kind = match config.console {
        crate::launch::ConsoleMode::ExternalTerminal => "external",
        _ => "integrated",
    };
    sink.send(Message::run_in_terminal(
        kind,
        &format!("Debug Terminal ({})", config.name),
        spawn.cwd.as_deref(),
        &argv,
        &spawn.env,
    ));

    let stream = rendezvous.accept(timeouts.rendezvous_accept)?;
    Ok(BackendConnection {
        stream,
        process: None,
    })
}

fn spawn_backend(
    config: &DebugConfiguration,
    sink: &EventSink,
    timeouts: &Timeouts,
) -> Result<BackendConnection, ProxyError> {
    let spawn = launch::spawn_config(config, sink)?;

    let host = config.host().to_string();
    let port = net::free_port()?;
    let mut args = spawn.args;
    args.push(format!("--listen={host}:{port}"));
    #[cfg(unix)]
    args.push("--log-dest=3".to_string());

    sink.output(
        "console",
        format!(
            "Starting: {} {} from {}\n",
            spawn.tool.display(),
            args.join(" "),
            spawn
                .cwd
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".to_string())
        ),
    );

    let mut command = Command::new(&spawn.tool);
    command
        .args(&args)
        .envs(&spawn.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spawn.cwd {
        command.current_dir(cwd);
    }

    // Auxiliary pipe on fd 3: structured backend logs must not share stdout
    // with protocol framing.
    #[cfg(unix)]
    let aux_reader = {
        use std::os::fd::AsRawFd;
        use std::os::unix::process::CommandExt;
        let (reader, writer) = os_pipe::pipe()?;
        let aux_fd = writer.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                if aux_fd == 3 {
                    // dup2 onto itself is a no-op that leaves CLOEXEC set;
                    // clear the flag by hand instead
                    let flags = nix::fcntl::fcntl(3, nix::fcntl::FcntlArg::F_GETFD)
                        .map_err(std::io::Error::from)?;
                    let flags = nix::fcntl::FdFlag::from_bits_retain(flags)
                        .difference(nix::fcntl::FdFlag::FD_CLOEXEC);
                    nix::fcntl::fcntl(3, nix::fcntl::FcntlArg::F_SETFD(flags))
                        .map_err(std::io::Error::from)?;
                } else {
                    // dup2 clears CLOEXEC on the duplicate, so fd 3 survives exec
                    nix::unistd::dup2(aux_fd, 3).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }
        // writer must stay open until after spawn; dropped right below
        Some((reader, writer))
    };

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProxyError::BackendNotFound(spawn.tool.display().to_string())
        } else {
            ProxyError::Spawn {
                tool: spawn.tool.clone(),
                source: err,
            }
        }
    })?;
    let pid = child.id();
    debug!(target: "supervisor", "backend spawned, pid {pid}");

    let (start_tx, start_rx) = channel::<StartSignal>();
    let stderr_tail = Arc::new(Mutex::new(String::new()));

    if let Some(stdout) = child.stdout.take() {
        spawn_marker_scanner(stdout, "stdout", sink.clone(), start_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_scanner(stderr, sink.clone(), stderr_tail.clone());
    }
    #[cfg(unix)]
    if let Some((reader, writer)) = aux_reader {
        spawn_aux_scanner(
            reader,
            config.log_dest.clone(),
            sink.clone(),
            start_tx.clone(),
        );
        drop(writer);
    }

    let process = BackendProcess {
        child: Arc::new(Mutex::new(child)),
        pid,
    };
    spawn_exit_watcher(process.child.clone(), pid, sink.clone(), start_tx);

    match start_rx.recv_timeout(timeouts.ready_wait) {
        Ok(StartSignal::Ready) => {
            debug!(target: "supervisor", "backend ({pid}) printed its ready marker");
        }
        Ok(StartSignal::Exited(status)) => {
            let stderr = stderr_tail
                .lock()
                .map(|tail| tail.clone())
                .unwrap_or_default();
            return Err(ProxyError::EarlyExit {
                status: describe_exit(&status),
                stderr,
            });
        }
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            sink.output("console", format!("Backend ({pid}) is not responding\n"));
            process.shutdown(timeouts.kill_grace);
            return Err(ProxyError::ReadyTimeout);
        }
    }

    let addr = format!("{host}:{port}");
    let stream = match net::connect_retry(
        &addr,
        timeouts.connect_retries,
        timeouts.connect_backoff,
        timeouts.connect_attempt,
    ) {
        Ok(stream) => stream,
        Err(err) => {
            process.shutdown(timeouts.kill_grace);
            return Err(err);
        }
    };

    Ok(BackendConnection {
        stream,
        process: Some(process),
    })
}

/// Forward a pipe line-by-line as `output` events, signalling readiness on
/// the first line starting with the ready marker.
fn spawn_marker_scanner(
    pipe: impl Read + Send + 'static,
    category: &'static str,
    sink: EventSink,
    start_tx: Sender<StartSignal>,
) {
    std::thread::spawn(move || {
        let mut ready_sent = false;
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if !ready_sent && line.starts_with(READY_MARKER) {
                ready_sent = true;
                let _ = start_tx.send(StartSignal::Ready);
            }
            sink.output(category, format!("{line}\n"));
        }
    });
}

fn spawn_stderr_scanner(
    pipe: impl Read + Send + 'static,
    sink: EventSink,
    tail: Arc<Mutex<String>>,
) {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if let Ok(mut tail) = tail.lock() {
                // enough context to distinguish "permission denied",
                // "no such file" or "address already in use" upstream
                tail.push_str(&line);
                tail.push('\n');
            }
            sink.output("stderr", format!("{line}\n"));
        }
    });
}

/// Structured backend logs arrive on the auxiliary pipe; route them to the
/// configured file, or to the debug console when no destination is set.
#[cfg(unix)]
fn spawn_aux_scanner(
    pipe: os_pipe::PipeReader,
    log_dest: Option<std::path::PathBuf>,
    sink: EventSink,
    start_tx: Sender<StartSignal>,
) {
    std::thread::spawn(move || {
        let tracer = log_dest.and_then(|dest| match trace::FileTracer::new(&dest) {
            Ok(tracer) => Some(tracer),
            Err(err) => {
                sink.output("console", format!("Error opening {}: {err:#}\n", dest.display()));
                None
            }
        });
        let mut ready_sent = false;
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if !ready_sent && line.starts_with(READY_MARKER) {
                ready_sent = true;
                let _ = start_tx.send(StartSignal::Ready);
            }
            match &tracer {
                Some(tracer) => tracer.line(&line),
                None => sink.output("console", format!("{line}\n")),
            }
        }
    });
}

fn spawn_exit_watcher(
    child: Arc<Mutex<Child>>,
    pid: u32,
    sink: EventSink,
    start_tx: Sender<StartSignal>,
) {
    std::thread::spawn(move || {
        loop {
            let status = match child.lock() {
                Ok(mut child) => match child.try_wait() {
                    Ok(status) => status,
                    Err(err) => {
                        warn!(target: "supervisor", "wait on backend ({pid}) failed: {err}");
                        break;
                    }
                },
                Err(_) => break,
            };
            if let Some(status) = status {
                sink.output(
                    "console",
                    format!("backend ({pid}) {}\n", describe_exit(&status)),
                );
                let _ = start_tx.send(StartSignal::Exited(status));
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}

fn describe_exit(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was killed by signal: {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exited with code: {code}"),
        None => "terminated".to_string(),
    }
}
