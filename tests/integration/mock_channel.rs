//! Mock channel for integration tests.
//!
//! Records every call the engine makes so tests can assert on the full
//! history without a real transport behind it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rpc_core::config::RpcConfig;
use rpc_core::rpc::channel::{Channel, ChannelEvent, ChannelId};
use rpc_core::rpc::engine::RpcEngine;
use serde_json::Value;

// ── Channel call record ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCall {
    Connect,
    Close,
    Send(Value),
}

// ── MockChannel ───────────────────────────────────────────────

pub struct MockChannel {
    pub calls: RefCell<Vec<ChannelCall>>,
    pub busy: Cell<bool>,
    pub refuse: Cell<bool>,
    pub persistent: bool,
    pub destination: Option<String>,
    pub username: Option<String>,
}

#[allow(dead_code)]
impl MockChannel {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            busy: Cell::new(false),
            refuse: Cell::new(false),
            persistent: true,
            destination: None,
            username: None,
        }
    }

    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::new()
        }
    }

    /// Every frame sent so far, decoded.
    pub fn sent(&self) -> Vec<Value> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                ChannelCall::Send(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_sent(&self) -> Option<Value> {
        self.sent().pop()
    }

    pub fn close_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| **c == ChannelCall::Close)
            .count()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn connect(&self) {
        self.calls.borrow_mut().push(ChannelCall::Connect);
    }

    fn close(&self) {
        self.calls.borrow_mut().push(ChannelCall::Close);
    }

    fn send_frame(&self, frame: &[u8]) -> bool {
        if self.refuse.get() {
            return false;
        }
        let v = serde_json::from_slice(frame).expect("engine sent invalid JSON");
        self.calls.borrow_mut().push(ChannelCall::Send(v));
        true
    }

    fn channel_type(&self) -> &str {
        "mock"
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn is_busy(&self) -> bool {
        self.busy.get()
    }

    fn destination(&self) -> Option<String> {
        self.destination.clone()
    }

    fn authn_username(&self) -> Option<String> {
        self.username.clone()
    }
}

// ── Loopback pair ─────────────────────────────────────────────

/// Delivers every frame straight into a peer engine from inside
/// `send_frame`, exercising re-entrant dispatch.
pub struct Loopback {
    pub peer: RefCell<Option<(RpcEngine, ChannelId)>>,
    pub frames: Cell<usize>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            peer: RefCell::new(None),
            frames: Cell::new(0),
        }
    }
}

impl Channel for Loopback {
    fn connect(&self) {}

    fn close(&self) {}

    fn send_frame(&self, frame: &[u8]) -> bool {
        let peer = self.peer.borrow().clone();
        let Some((engine, id)) = peer else {
            return false;
        };
        self.frames.set(self.frames.get() + 1);
        engine.channel_event(id, ChannelEvent::FrameReceived(frame));
        true
    }

    fn channel_type(&self) -> &str {
        "loopback"
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

// ── Fixtures ──────────────────────────────────────────────────

/// Engine `id` with one open default channel.
#[allow(dead_code)]
pub fn engine_with_default(id: &str) -> (RpcEngine, Rc<MockChannel>, ChannelId) {
    let engine = RpcEngine::new(RpcConfig::with_id(id));
    let ch = Rc::new(MockChannel::new());
    let cid = engine
        .add_channel("*", ch.clone(), true)
        .expect("default channel");
    engine.channel_event(cid, ChannelEvent::Open);
    (engine, ch, cid)
}

/// Feed a JSON frame into the engine as if `cid` had received it.
pub fn deliver(engine: &RpcEngine, cid: ChannelId, frame: &Value) {
    let bytes = serde_json::to_vec(frame).expect("encode test frame");
    engine.channel_event(cid, ChannelEvent::FrameReceived(&bytes));
}
