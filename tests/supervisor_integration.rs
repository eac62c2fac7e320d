#![cfg(unix)]

mod proxy_client;

use daprox::error::ProxyError;
use daprox::launch::{ConsoleMode, DebugConfiguration};
use daprox::message::{EventSink, Message};
use daprox::supervisor;
use proxy_client::fast_timeouts;
use serial_test::serial;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

static SCRIPT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Write an executable shell script standing in for the backend binary.
fn fake_backend_script(body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let n = SCRIPT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "daprox-fake-dlv-{}-{n}.sh",
        std::process::id()
    ));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake backend script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake backend script");
    path
}

fn config_for(tool: &Path) -> DebugConfiguration {
    DebugConfiguration {
        name: "test session".to_string(),
        request: "launch".to_string(),
        dlv_tool_path: Some(tool.to_path_buf()),
        ..Default::default()
    }
}

fn collect_output(rx: &Receiver<Message>) -> String {
    let mut text = String::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Event(ev) = message {
            if ev.event == "output" {
                if let Some(line) = ev.body.and_then(|b| {
                    b.get("output").and_then(|o| o.as_str().map(String::from))
                }) {
                    text.push_str(&line);
                }
            }
        }
    }
    text
}

#[test]
#[serial]
fn missing_backend_binary_fails_before_spawn() {
    let (sink, rx) = EventSink::new();
    let config = config_for(Path::new("/nonexistent/tool/dlv"));

    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    assert!(matches!(err, ProxyError::BackendNotFound(_)), "got {err}");

    let output = collect_output(&rx);
    assert!(output.contains("Couldn't find"), "got {output:?}");
}

#[test]
#[serial]
fn silent_backend_times_out_and_is_killed() {
    let script = fake_backend_script("sleep 5");
    let (sink, rx) = EventSink::new();
    let config = config_for(&script);

    let started = std::time::Instant::now();
    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    assert!(matches!(err, ProxyError::ReadyTimeout), "got {err}");
    // fails on the shrunk ready deadline, not on the script's sleep
    assert!(started.elapsed() < Duration::from_secs(3));

    let output = collect_output(&rx);
    assert!(output.contains("not responding"), "got {output:?}");

    let _ = std::fs::remove_file(&script);
}

#[test]
#[serial]
fn early_exit_reports_status_and_stderr_tail() {
    let script = fake_backend_script("echo 'permission denied' >&2\nexit 1");
    let (sink, _rx) = EventSink::new();
    let config = config_for(&script);

    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    match err {
        ProxyError::EarlyExit { status, stderr } => {
            assert!(status.contains("code: 1"), "got {status:?}");
            assert!(stderr.contains("permission denied"), "got {stderr:?}");
        }
        other => panic!("expected EarlyExit, got {other}"),
    }

    let _ = std::fs::remove_file(&script);
}

#[test]
#[serial]
fn ready_marker_without_listener_fails_the_connect() {
    // announces readiness but never binds the port
    let script = fake_backend_script("echo 'DAP server listening at: 127.0.0.1:1'\nsleep 5");
    let (sink, rx) = EventSink::new();
    let config = config_for(&script);

    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    assert!(matches!(err, ProxyError::Connect { .. }), "got {err}");

    let output = collect_output(&rx);
    assert!(output.contains("Starting:"), "got {output:?}");
    assert!(output.contains("DAP server listening at:"), "got {output:?}");

    let _ = std::fs::remove_file(&script);
}

#[test]
#[serial]
fn ready_marker_on_the_aux_pipe_counts() {
    // stdout stays silent; readiness is announced on fd 3 only
    let script =
        fake_backend_script("echo 'DAP server listening at: 127.0.0.1:1' >&3\nsleep 5");
    let (sink, rx) = EventSink::new();
    let config = config_for(&script);

    // getting a connect failure (not a ready timeout) proves the marker
    // was picked up from the auxiliary pipe
    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    assert!(matches!(err, ProxyError::Connect { .. }), "got {err}");

    // without a logDest the aux lines land in the debug console
    let output = collect_output(&rx);
    assert!(output.contains("DAP server listening at:"), "got {output:?}");

    let _ = std::fs::remove_file(&script);
}

#[test]
#[serial]
fn terminal_mode_emits_run_in_terminal_and_accepts_the_dial_back() {
    let (sink, rx) = EventSink::new();
    let log_dest = std::env::temp_dir().join("daprox-terminal-test.log");
    let mut config = config_for(Path::new("/bin/true"));
    config.console = ConsoleMode::IntegratedTerminal;
    config.log_dest = Some(log_dest.clone());

    let mut timeouts = fast_timeouts();
    timeouts.rendezvous_accept = Duration::from_secs(5);
    let starter = std::thread::spawn(move || supervisor::start(&config, &sink, &timeouts));

    // the command line for the editor's terminal arrives as a reverse request
    let message = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no runInTerminal request");
    let Message::Request(req) = message else {
        panic!("expected a reverse request, got {message:?}");
    };
    assert_eq!(req.command, "runInTerminal");
    let arguments = req.arguments.expect("runInTerminal without arguments");
    assert_eq!(arguments["kind"], "integrated");
    assert!(
        arguments["title"].as_str().unwrap().contains("test session"),
        "got {:?}",
        arguments["title"]
    );

    let argv: Vec<String> = arguments["args"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap().to_string())
        .collect();
    assert_eq!(argv[0], "/bin/true");
    assert_eq!(argv[1], "dap");
    assert!(argv.contains(&"--check-go-version=false".to_string()));
    // logDest rides the command line here, there is no fd-3 pipe to route
    assert!(argv.contains(&format!("--log-dest={}", log_dest.display())));
    let port: u16 = argv
        .last()
        .unwrap()
        .strip_prefix("--client-addr=:")
        .expect("--client-addr must come last")
        .parse()
        .unwrap();

    // play the backend: dial back and push some bytes through
    let mut dialer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let connection = starter.join().unwrap().unwrap();
    assert!(connection.process.is_none());

    dialer.write_all(b"ok").unwrap();
    let mut buf = [0u8; 2];
    let mut stream = connection.stream;
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");
}

#[test]
#[serial]
fn explicit_port_connects_without_spawning() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (sink, _rx) = EventSink::new();
    // the tool path is bogus on purpose: attach mode must never resolve it
    let mut config = config_for(Path::new("/nonexistent/tool/dlv"));
    config.request = "attach".to_string();
    config.port = Some(port);

    let connection = supervisor::start(&config, &sink, &fast_timeouts()).unwrap();
    assert!(connection.process.is_none());

    let (accepted, _) = listener.accept().unwrap();
    assert_eq!(
        accepted.local_addr().unwrap().port(),
        connection.stream.peer_addr().unwrap().port()
    );
}

#[test]
#[serial]
fn unreachable_external_backend_reports_connect_error() {
    // bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (sink, _rx) = EventSink::new();
    let mut config = DebugConfiguration::default();
    config.request = "attach".to_string();
    config.port = Some(port);

    let err = supervisor::start(&config, &sink, &fast_timeouts()).unwrap_err();
    assert!(matches!(err, ProxyError::Connect { .. }), "got {err}");
}
