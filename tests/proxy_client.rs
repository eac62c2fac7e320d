//! Shared helpers for proxy integration tests: a scripted fake DAP backend
//! over TCP and a mock launcher that connects to it.

#![allow(dead_code)]

use daprox::error::ProxyError;
use daprox::launch::DebugConfiguration;
use daprox::message::{EventSink, Message, Request};
use daprox::relay::BackendLauncher;
use daprox::supervisor::{BackendConnection, Timeouts};
use daprox::codec::{self, FrameDecoder};
use serde_json::{Map, Value};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts shrunk so failure paths stay fast under test.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        ready_wait: Duration::from_millis(500),
        connect_attempt: Duration::from_millis(200),
        connect_retries: 2,
        connect_backoff: Duration::from_millis(50),
        rendezvous_accept: Duration::from_millis(500),
        kill_grace: Duration::from_millis(200),
        pending_max_age: Duration::from_secs(30),
        reap_interval: Duration::from_secs(5),
    }
}

pub fn request(seq: i64, command: &str, arguments: Value) -> Message {
    Message::Request(Request {
        seq,
        command: command.to_string(),
        arguments: Some(arguments),
        extra: Map::new(),
    })
}

/// Receive the next editor-bound message, failing the test on timeout.
pub fn next_message(rx: &Receiver<Message>) -> Message {
    match rx.recv_timeout(RECV_TIMEOUT) {
        Ok(message) => message,
        Err(err) => panic!("no message from proxy within {RECV_TIMEOUT:?}: {err}"),
    }
}

/// Receive messages until one satisfies the predicate, failing on timeout.
pub fn recv_until(rx: &Receiver<Message>, mut pred: impl FnMut(&Message) -> bool) -> Message {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("expected message never arrived"));
        match rx.recv_timeout(remaining) {
            Ok(message) if pred(&message) => return message,
            Ok(_) => continue,
            Err(err) => panic!("expected message never arrived: {err}"),
        }
    }
}

/// Assert that no message matching the predicate arrives within `window`.
pub fn assert_silent(
    rx: &Receiver<Message>,
    window: Duration,
    mut pred: impl FnMut(&Message) -> bool,
) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => remaining,
            None => return,
        };
        match rx.recv_timeout(remaining) {
            Ok(message) => {
                assert!(!pred(&message), "unexpected message: {message:?}");
            }
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

enum BackendCommand {
    Send(Message),
    Close,
}

/// A scripted DAP backend: accepts one connection, auto-responds to every
/// request with a success response, and can be told to push arbitrary
/// messages or close the stream.
pub struct FakeBackend {
    addr: SocketAddr,
    commands: Sender<BackendCommand>,
    received: Arc<Mutex<Vec<Message>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeBackend {
    pub fn spawn() -> FakeBackend {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake backend");
        let addr = listener.local_addr().unwrap();
        let (commands_tx, commands_rx) = channel::<BackendCommand>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let record = received.clone();

        let handle = std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            drop(listener);
            serve(stream, commands_rx, record);
        });

        FakeBackend {
            addr,
            commands: commands_tx,
            received,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Push a backend→editor message through the proxy.
    pub fn send(&self, message: Message) {
        self.commands
            .send(BackendCommand::Send(message))
            .expect("fake backend is gone");
    }

    /// Close the backend side of the stream.
    pub fn close(&self) {
        let _ = self.commands.send(BackendCommand::Close);
    }

    /// Everything the backend received from the proxy so far.
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until the backend has received a request with this command.
    pub fn wait_for_request(&self, command: &str) -> Request {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some(req) = self
                .received()
                .iter()
                .filter_map(|m| match m {
                    Message::Request(req) if req.command == command => Some(req.clone()),
                    _ => None,
                })
                .next()
            {
                return req;
            }
            assert!(
                Instant::now() < deadline,
                "backend never received `{command}`"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        let _ = self.commands.send(BackendCommand::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(
    mut stream: TcpStream,
    commands: Receiver<BackendCommand>,
    record: Arc<Mutex<Vec<Message>>>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("set fake backend read timeout");
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    let mut next_seq = 1_i64;
    loop {
        // commands from the test body
        loop {
            match commands.try_recv() {
                Ok(BackendCommand::Send(message)) => {
                    if stream.write_all(&codec::encode(&message)).is_err() {
                        return;
                    }
                }
                Ok(BackendCommand::Close) => return,
                Err(_) => break,
            }
        }
        // traffic from the proxy
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                while let Some(message) = decoder.next_frame() {
                    record.lock().unwrap().push(message.clone());
                    if let Message::Request(req) = message {
                        let response = serde_json::json!({
                            "type": "response",
                            "seq": next_seq,
                            "request_seq": req.seq,
                            "success": true,
                            "command": req.command,
                        });
                        next_seq += 1;
                        let response: Message = serde_json::from_value(response).unwrap();
                        if stream.write_all(&codec::encode(&response)).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }
    }
}

/// Launcher that connects to a [`FakeBackend`] (or fails on purpose) and
/// counts how many times the spawn hook was invoked.
pub struct MockLauncher {
    pub addr: Option<SocketAddr>,
    pub fail_with: Option<String>,
    pub launches: Arc<AtomicUsize>,
}

impl MockLauncher {
    pub fn for_backend(backend: &FakeBackend) -> (MockLauncher, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        (
            MockLauncher {
                addr: Some(backend.addr()),
                fail_with: None,
                launches: launches.clone(),
            },
            launches,
        )
    }

    pub fn failing(reason: &str) -> (MockLauncher, Arc<AtomicUsize>) {
        let launches = Arc::new(AtomicUsize::new(0));
        (
            MockLauncher {
                addr: None,
                fail_with: Some(reason.to_string()),
                launches: launches.clone(),
            },
            launches,
        )
    }
}

impl BackendLauncher for MockLauncher {
    fn launch(
        &mut self,
        _config: &DebugConfiguration,
        _sink: &EventSink,
        _timeouts: &Timeouts,
    ) -> Result<BackendConnection, ProxyError> {
        self.launches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(ProxyError::Connect {
                addr: "127.0.0.1:0".to_string(),
                reason: reason.clone(),
            });
        }
        let addr = self.addr.expect("mock launcher has no backend address");
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(BackendConnection {
            stream,
            process: None,
        })
    }
}
