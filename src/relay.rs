//! Bidirectional message pump between the editor channel and the backend
//! stream.
//!
//! One proxy instance serves exactly one debug session: one backend
//! connection, one subprocess. The caller thread drives editor→backend
//! traffic through [`DapProxy::handle_message`]; a dedicated reader thread
//! pumps backend→editor. Shared bookkeeping (pending requests, current
//! thread id) sits behind a mutex so the single-writer invariant is
//! enforced by construction.

use crate::codec::{self, FrameDecoder};
use crate::error::ProxyError;
use crate::launch::DebugConfiguration;
use crate::message::{EventSink, Message};
use crate::pending::{PendingRequests, Reaper};
use crate::supervisor::{self, BackendConnection, BackendProcess, Timeouts};
use log::{debug, error, warn};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Commands the editor may send before the backend connection exists.
/// `initialize` is the canonical trigger; the line/column numbering-base
/// bookkeeping commands are tolerated too.
const PRE_CONNECT_COMMANDS: [&str; 3] = [
    "initialize",
    "setDebugAdapterLinesStartAt1",
    "setDebugAdapterColumnsStartAt1",
];

/// Bookkeeping commands answered locally once connected; they are
/// meaningless to the backend but required by the editor handshake.
const LOCAL_COMMANDS: [&str; 2] = [
    "setDebugAdapterLinesStartAt1",
    "setDebugAdapterColumnsStartAt1",
];

/// Seam between the relay and the process supervisor, so tests can verify
/// the spawn hook is never invoked on a sequencing violation.
pub trait BackendLauncher: Send {
    fn launch(
        &mut self,
        config: &DebugConfiguration,
        sink: &EventSink,
        timeouts: &Timeouts,
    ) -> Result<BackendConnection, ProxyError>;
}

/// The real launcher: defers to [`supervisor::start`].
pub struct SpawnLauncher;

impl BackendLauncher for SpawnLauncher {
    fn launch(
        &mut self,
        config: &DebugConfiguration,
        sink: &EventSink,
        timeouts: &Timeouts,
    ) -> Result<BackendConnection, ProxyError> {
        supervisor::start(config, sink, timeouts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingFirstMessage,
    Connecting,
    Forwarding,
    Terminated,
}

/// State shared between the caller thread, the backend reader thread and
/// the reaper.
struct SharedState {
    pending: Arc<Mutex<PendingRequests>>,
    /// Thread id captured from the last `stopped` event; inspection
    /// requests default to it when the caller supplies none.
    current_thread: AtomicI64,
    /// Set on dispose and on the first stream failure, so `terminated` is
    /// synthesized at most once and never after an explicit dispose.
    terminated: AtomicBool,
}

/// A DAP proxy for one debug session.
pub struct DapProxy {
    config: DebugConfiguration,
    launcher: Box<dyn BackendLauncher>,
    timeouts: Timeouts,
    sink: EventSink,
    state: ConnectionState,
    backend: Option<TcpStream>,
    process: Option<BackendProcess>,
    shared: Arc<SharedState>,
    reaper: Option<Reaper>,
    reader: Option<JoinHandle<()>>,
    disposed: bool,
}

impl DapProxy {
    /// Build a proxy. Messages bound for the editor (forwarded backend
    /// traffic and synthesized events/responses) arrive on the returned
    /// receiver, strictly in emission order.
    pub fn new(
        config: DebugConfiguration,
        launcher: Box<dyn BackendLauncher>,
        timeouts: Timeouts,
    ) -> (DapProxy, Receiver<Message>) {
        let (sink, rx) = EventSink::new();
        let shared = Arc::new(SharedState {
            pending: Arc::new(Mutex::new(PendingRequests::new(timeouts.pending_max_age))),
            current_thread: AtomicI64::new(0),
            terminated: AtomicBool::new(false),
        });
        let proxy = DapProxy {
            config,
            launcher,
            timeouts,
            sink,
            state: ConnectionState::AwaitingFirstMessage,
            backend: None,
            process: None,
            shared,
            reaper: None,
            reader: None,
            disposed: false,
        };
        (proxy, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Accept one message from the editor side. Failures never propagate
    /// into the caller's control flow; they are converted into synthetic
    /// responses and events on the editor channel.
    pub fn handle_message(&mut self, message: Message) {
        // a proxy never forwards reverse responses toward the backend
        if let Message::Response(resp) = &message {
            debug!(
                target: "proxy",
                "dropping reverse response `{}` (request_seq {})",
                resp.command, resp.request_seq
            );
            return;
        }
        match self.state {
            ConnectionState::AwaitingFirstMessage => self.first_message(message),
            ConnectionState::Connecting => {
                // unreachable from the single caller thread; drop defensively
                debug!(target: "proxy", "dropping {} received while connecting", message.describe());
            }
            ConnectionState::Forwarding => self.forward_to_backend(message),
            ConnectionState::Terminated => {
                if let Message::Request(req) = &message {
                    self.sink
                        .send(Message::error_response(req, "debug session is terminated"));
                }
            }
        }
    }

    fn first_message(&mut self, message: Message) {
        let trigger = match &message {
            Message::Request(req) if PRE_CONNECT_COMMANDS.contains(&req.command.as_str()) => {
                req.clone()
            }
            other => {
                warn!(
                    target: "proxy",
                    "sequencing violation: first message was {}",
                    other.describe()
                );
                if let Message::Request(req) = &message {
                    let err = ProxyError::BadFirstMessage(req.command.clone());
                    self.sink.send(Message::error_response(req, err.to_string()));
                }
                self.state = ConnectionState::Terminated;
                return;
            }
        };

        self.state = ConnectionState::Connecting;
        match self
            .launcher
            .launch(&self.config, &self.sink, &self.timeouts)
        {
            Ok(connection) => {
                self.install(connection);
                self.state = ConnectionState::Forwarding;
                // the triggering message was held back; replay it now
                self.forward_to_backend(message);
            }
            Err(err) => {
                error!(target: "proxy", "backend startup failed: {err}");
                self.sink.output(
                    "stderr",
                    format!("Couldn't start the debugger backend:\n{err}\n"),
                );
                self.sink.send(Message::error_response(
                    &trigger,
                    format!("couldn't start the debugger backend: {err}"),
                ));
                self.state = ConnectionState::Terminated;
            }
        }
    }

    fn install(&mut self, connection: BackendConnection) {
        self.process = connection.process;
        let reader_stream = connection.stream.try_clone().ok();
        self.backend = Some(connection.stream);
        match reader_stream {
            Some(stream) => {
                let shared = self.shared.clone();
                let sink = self.sink.clone();
                self.reader = Some(std::thread::spawn(move || {
                    pump_backend(stream, shared, sink);
                }));
            }
            None => {
                // reads are impossible; writes will fail and surface there
                warn!(target: "proxy", "could not clone backend stream for reading");
            }
        }
        self.reaper = Some(Reaper::spawn(
            self.shared.pending.clone(),
            self.timeouts.reap_interval,
        ));
    }

    fn forward_to_backend(&mut self, message: Message) {
        if let Message::Request(req) = &message {
            if LOCAL_COMMANDS.contains(&req.command.as_str()) {
                self.sink.send(Message::local_success(req));
                return;
            }
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.record(req);
            }
        }
        let frame = codec::encode(&message);
        let Some(stream) = self.backend.as_mut() else {
            warn!(target: "proxy", "backend stream is gone; dropping {}", message.describe());
            return;
        };
        if let Err(err) = stream.write_all(&frame).and_then(|()| stream.flush()) {
            error!(target: "proxy", "error sending message to backend: {err}");
            self.sink
                .output("console", format!("error sending message: {err}\n"));
            if !self.shared.terminated.swap(true, Ordering::SeqCst) {
                self.sink.send(Message::terminated());
            }
            self.state = ConnectionState::Terminated;
        }
    }

    /// Tear the session down. Idempotent: repeated calls (and the drop
    /// hook) are no-ops after the first.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        // silence the reader thread before pulling the stream out from
        // under it: dispose must not look like a stream failure
        self.shared.terminated.store(true, Ordering::SeqCst);
        if let Some(stream) = self.backend.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
        if let Some(process) = self.process.take() {
            process.shutdown(self.timeouts.kill_grace);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.state = ConnectionState::Terminated;
    }
}

impl Drop for DapProxy {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Backend→editor pump: decode frames, apply the interception rules, and
/// deliver to the editor channel in arrival order.
fn pump_backend(mut stream: TcpStream, shared: Arc<SharedState>, sink: EventSink) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                stream_closed(&shared, &sink, None);
                break;
            }
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                while let Some(message) = decoder.next_frame() {
                    deliver_to_editor(message, &shared, &sink);
                }
            }
            Err(err) => {
                stream_closed(&shared, &sink, Some(err));
                break;
            }
        }
    }
}

fn deliver_to_editor(message: Message, shared: &SharedState, sink: &EventSink) {
    match message {
        Message::Request(req) => {
            // reverse requests from the backend are not supported in this
            // direction; a known protocol restriction, not a bug
            debug!(
                target: "proxy",
                "dropping reverse request `{}` (seq {}) from backend",
                req.command, req.seq
            );
        }
        Message::Response(resp) => {
            let matched = shared
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.take(resp.request_seq));
            if matched.is_none() {
                // may be a race between reaping and a slow response
                warn!(
                    target: "proxy",
                    "unmatched response `{}` (request_seq {}), forwarding anyway",
                    resp.command, resp.request_seq
                );
            }
            let resumed = matched
                .as_ref()
                .map(|req| req.command == "continue")
                .unwrap_or(false);
            sink.send(Message::Response(resp));
            if resumed {
                // some backends omit the continued event; the editor UI
                // depends on it to flip its run/pause affordances
                let thread_id = shared.current_thread.load(Ordering::SeqCst);
                sink.send(Message::continued(thread_id));
            }
        }
        Message::Event(ev) => {
            if ev.event == "stopped" {
                if let Some(thread_id) = ev
                    .body
                    .as_ref()
                    .and_then(|body| body.get("threadId"))
                    .and_then(Value::as_i64)
                {
                    shared.current_thread.store(thread_id, Ordering::SeqCst);
                }
            }
            sink.send(Message::Event(ev));
        }
    }
}

/// Stream close or error on the backend side ends the session, unless an
/// explicit dispose already did.
fn stream_closed(shared: &SharedState, sink: &EventSink, err: Option<std::io::Error>) {
    if shared.terminated.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(err) = err {
        error!(target: "proxy", "backend connection error: {err}");
        sink.output("console", format!("connection error: {err}\n"));
    }
    sink.send(Message::terminated());
}
