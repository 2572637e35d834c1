// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures: a scriptable in-memory bus link and module builders.
//!
//! Compiled into the library so integration tests and benches can use it;
//! production code never constructs these.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::link::{BusLink, LinkError, LinkFuture, LinkInfo};
use crate::proto::{encode_custom, opcode_of, parse_address_of};
use crate::registry::{ModuleConfig, ModuleType};

/// One scripted reaction of the fake module population.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with these exact bytes.
    Frame(Vec<u8>),
    /// Let the read deadline expire.
    Timeout,
    /// Fail the transaction at the I/O layer.
    IoError,
}

/// A [`BusLink`] over scripted replies.
///
/// Scripted replies are consumed front to back; a scripted frame holds its
/// place until the module it is addressed from gets polled.  When nothing is
/// scripted: with `auto_status` the link answers any frame with a valid
/// empty-status reply from the addressed module, otherwise it times out.
/// Every transmitted frame is recorded.
pub struct FakeLink {
    script: Arc<Mutex<VecDeque<Reply>>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    auto_status: bool,
    open: Arc<AtomicBool>,
    reopen_count: Arc<AtomicU32>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            auto_status: false,
            // Fakes start open; `open()` stays idempotent for supervisor
            // startup tests.
            open: Arc::new(AtomicBool::new(true)),
            reopen_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Answer unscripted polls with a healthy `S0` reply (payload `0x00`).
    pub fn auto_status() -> Self {
        let mut link = Self::new();
        link.auto_status = true;
        link
    }

    /// Handles for inspecting the link after it moves into the scheduler.
    pub fn probes(&self) -> FakeLinkProbes {
        FakeLinkProbes {
            script: Arc::clone(&self.script),
            sent: Arc::clone(&self.sent),
            open: Arc::clone(&self.open),
            reopen_count: Arc::clone(&self.reopen_count),
        }
    }

    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }
}

impl Default for FakeLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Inspection handles that outlive the moved [`FakeLink`].
#[derive(Clone)]
pub struct FakeLinkProbes {
    script: Arc<Mutex<VecDeque<Reply>>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    open: Arc<AtomicBool>,
    reopen_count: Arc<AtomicU32>,
}

impl FakeLinkProbes {
    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Opcodes of every transmitted frame, in order.
    pub fn sent_ops(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| opcode_of(f).map(str::to_owned))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn reopen_count(&self) -> u32 {
        self.reopen_count.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl BusLink for FakeLink {
    fn open(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn reopen(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.reopen_count.fetch_add(1, Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn poll(
        &mut self,
        frame: Bytes,
        _read_timeout: Duration,
        expect_response: bool,
    ) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            if !self.open.load(Ordering::SeqCst) {
                return Err(LinkError::Closed);
            }
            self.sent.lock().push(frame.clone());
            if !expect_response {
                return Ok(Vec::new());
            }
            let polled = parse_address_of(&frame);
            let scripted = {
                let mut script = self.script.lock();
                // A scripted frame waits for its own module's turn; frames
                // without a readable address (garbage fixtures) and
                // timeouts/faults fire on whichever poll comes next.
                let deliverable = match script.front() {
                    Some(Reply::Frame(bytes)) => {
                        parse_address_of(bytes).is_none() || parse_address_of(bytes) == polled
                    }
                    Some(_) => true,
                    None => false,
                };
                if deliverable { script.pop_front() } else { None }
            };
            match scripted {
                Some(Reply::Frame(bytes)) => Ok(bytes),
                Some(Reply::Timeout) => Err(LinkError::Timeout),
                Some(Reply::IoError) => Err(LinkError::Io("injected fault".to_owned())),
                None if self.auto_status => {
                    Ok(status_reply(polled.unwrap_or(0), &[0x00]).to_vec())
                }
                None => Err(LinkError::Timeout),
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn info(&self) -> LinkInfo {
        LinkInfo { port: "fake".to_owned(), baud: 9600, open: self.is_open() }
    }
}

/// A valid `S0` reply frame from `addr` with the given status payload.
pub fn status_reply(addr: u8, payload: &[u8]) -> Bytes {
    encode_custom(addr, "S0", payload)
}

/// A valid `S6` reply frame: status bytes plus novelty bytes.
pub fn novelty_reply(addr: u8, status: &[u8], novelty: &[u8]) -> Bytes {
    let mut payload = status.to_vec();
    payload.extend_from_slice(novelty);
    encode_custom(addr, "S6", &payload)
}

/// Barrier module config with sensible defaults.
pub fn barrier(module_id: i64, address: u8) -> ModuleConfig {
    ModuleConfig {
        module_id,
        address,
        name: format!("barrier-{address:02}"),
        module_type: ModuleType::Barrier,
        polling_order: 0,
        pulse_duration_ms: 1500,
        requires_ticket_validation: false,
        peer_entry_module_id: None,
        peer_exit_module_id: None,
    }
}
