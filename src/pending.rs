//! In-flight request bookkeeping.
//!
//! Requests observed flowing editor→backend are recorded here and removed
//! when the matching response comes back. A background reaper evicts stale
//! entries to bound memory when a backend loses responses.

use crate::message::Request;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct PendingEntry {
    request: Request,
    enqueued_at: Instant,
}

/// Table of requests whose responses have not been observed yet.
///
/// Keyed by `seq`; seq values are supplied by the editor side and assumed
/// unique for the lifetime of a session, so there is at most one entry per
/// seq.
pub struct PendingRequests {
    entries: HashMap<i64, PendingEntry>,
    max_age: Duration,
    /// Entries evicted by age since the session started.
    pub evicted: u64,
}

impl PendingRequests {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
            evicted: 0,
        }
    }

    pub fn record(&mut self, request: &Request) {
        debug!(target: "proxy", "recorded request `{}` (seq {})", request.command, request.seq);
        let entry = PendingEntry {
            request: request.clone(),
            enqueued_at: Instant::now(),
        };
        if self.entries.insert(request.seq, entry).is_some() {
            warn!(target: "proxy", "duplicate request seq {}, replacing the older entry", request.seq);
        }
    }

    /// Remove and return the request matching a response's `request_seq`.
    pub fn take(&mut self, request_seq: i64) -> Option<Request> {
        self.entries.remove(&request_seq).map(|entry| entry.request)
    }

    /// Evict entries older than the max age. Evicted requests are only
    /// dropped from tracking; no failure response is synthesized for them,
    /// so a very late real response will later be logged as unmatched.
    pub fn sweep(&mut self) -> usize {
        let deadline = Instant::now();
        let expired: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, entry)| deadline.duration_since(entry.enqueued_at) > self.max_age)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &expired {
            if let Some(entry) = self.entries.remove(seq) {
                debug!(
                    target: "proxy",
                    "evicting expired request `{}` (seq {seq})",
                    entry.request.command
                );
            }
        }
        self.evicted += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background sweep over a shared [`PendingRequests`] table.
///
/// Stopping is idempotent and also happens on drop.
pub struct Reaper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(table: Arc<Mutex<PendingRequests>>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Ok(mut table) = table.lock() {
                        table.sweep();
                    }
                }
                // explicit stop or the proxy went away
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
