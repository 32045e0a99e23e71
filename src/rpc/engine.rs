//! RPC engine — routes frames between channels, handlers and callers.
//!
//! **Transport-decoupled**: the engine never reads from a transport. Each
//! registered [`Channel`] pushes its notifications in through
//! [`RpcEngine::channel_event`]; the engine pushes frames out through
//! [`Channel::send_frame`].
//!
//! Every inbound frame passes through this pipeline:
//!
//! 1. **Parse** — malformed frames are dropped and logged.
//! 2. **Destination check** — frames addressed to someone else are dropped.
//! 3. **Learning** — a channel registered without a destination adopts the
//!    frame's `src` and observers hear `ChannelOpen`.
//! 4. **Classification** — no method ⇒ response: matched against the
//!    pending-call table and retired; method ⇒ request: prehandler, then
//!    the method handler with a fresh [`RequestInfo`].
//!
//! ## Threading
//!
//! One owner thread. [`RpcEngine`] is a cheap `Rc` handle and is `!Send`.
//! Channel methods, handlers, prehandlers, observers and result callbacks
//! are always invoked with the engine's interior borrow released, so any of
//! them may call back into the engine (including re-entrant delivery from
//! inside `send_frame`).

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Value, json};

use super::channel::{Channel, ChannelEvent, ChannelId, ChannelState, DST_DEFAULT, FrameInfo};
use super::frame::{
    self, ERR_BAD_REQUEST, ERR_FORBIDDEN, ERR_INTERNAL, ERR_NOT_FOUND, ERR_TIMEOUT, Frame, PROTOCOL_VERSION, decode_payload,
};
use super::handlers::{HandlerEntry, HandlerRegistry};
use super::pending::{PendingCall, PendingCalls, Response, ResultCallback};
use crate::config::RpcConfig;
use crate::error::{Error, RegistryError, Result, RoutingError};

/// Maximum number of simultaneously registered channels.
pub const MAX_CHANNELS: usize = 8;

/// Maximum number of registered observers.
pub const MAX_OBSERVERS: usize = 8;

// ── Observer events ──────────────────────────────────────────

/// Channel lifecycle notifications, each carrying the affected destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcEvent {
    ChannelOpen { dst: String },
    ChannelClosed { dst: String },
}

pub trait Observer {
    fn on_event(&self, ev: &RpcEvent);
}

impl<F: Fn(&RpcEvent)> Observer for F {
    fn on_event(&self, ev: &RpcEvent) {
        self(ev);
    }
}

/// Token returned by [`RpcEngine::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u32);

// ── Outbound call options ────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Destination id. `None` routes through the default channel.
    pub dst: Option<String>,
    /// Opaque tag, echoed back by the peer.
    pub tag: Option<String>,
    /// Auth payload to attach to the request.
    pub auth: Option<Value>,
    /// Retire the call with [`ERR_TIMEOUT`] if no response arrives in time.
    pub timeout_ms: Option<u64>,
}

impl CallOptions {
    pub fn to(dst: impl Into<String>) -> Self {
        Self {
            dst: Some(dst.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

// ── Inbound request bookkeeping ──────────────────────────────

/// Authenticated identity of the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authn {
    pub username: Option<String>,
}

/// An inbound request awaiting its response.
///
/// Owned by exactly one handler at a time. Each of [`send_response`],
/// [`send_error`], [`send_error_json`] and [`free`] consumes the value, so
/// responding twice cannot compile:
///
/// ```compile_fail
/// use rpc_core::rpc::engine::RequestInfo;
///
/// fn respond_twice(ri: RequestInfo) {
///     let _ = ri.send_response(None);
///     let _ = ri.send_error(500, None);
/// }
/// ```
///
/// Dropping an unanswered request-info abandons it like [`free`] does,
/// with a warning in the log.
///
/// [`send_response`]: RequestInfo::send_response
/// [`send_error`]: RequestInfo::send_error
/// [`send_error_json`]: RequestInfo::send_error_json
/// [`free`]: RequestInfo::free
pub struct RequestInfo {
    engine: Weak<RefCell<Inner>>,
    pub id: i64,
    /// Id of the request sender, if provided.
    pub src: String,
    pub tag: String,
    pub method: String,
    pub auth: Option<Box<RawValue>>,
    pub authn: Authn,
    pub args_fmt: String,
    /// Free slot for handler bookkeeping. Not touched by the engine.
    pub user_data: Option<Box<dyn Any>>,
    channel: ChannelId,
    answered: bool,
}

enum Reply<'a> {
    Result(Option<&'a Value>),
    Error { code: i32, message: &'a str },
}

impl RequestInfo {
    /// Channel the request arrived on.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The engine this request belongs to.
    pub fn engine(&self) -> Result<RpcEngine> {
        self.engine
            .upgrade()
            .map(|inner| RpcEngine { inner })
            .ok_or(Error::EngineGone)
    }

    /// Respond with an optional result payload.
    pub fn send_response(mut self, result: Option<Value>) -> Result<()> {
        self.answered = true;
        self.engine()?.reply(&self, &Reply::Result(result.as_ref()))
    }

    /// Respond with an error code and optional plain-text message.
    ///
    /// Code 0 means success on the wire, so it is sent as 500.
    pub fn send_error(mut self, code: i32, message: Option<&str>) -> Result<()> {
        self.answered = true;
        let message = message.unwrap_or("");
        self.engine()?.reply(&self, &Reply::Error { code, message })
    }

    /// Respond with an error whose message is the serialised form of `message`.
    /// The wire `error.message` is still a string.
    pub fn send_error_json(mut self, code: i32, message: &Value) -> Result<()> {
        self.answered = true;
        let message = message.to_string();
        self.engine()?.reply(
            &self,
            &Reply::Error {
                code,
                message: &message,
            },
        )
    }

    /// Abandon the request without responding.
    pub fn free(mut self) {
        self.answered = true;
    }
}

impl Drop for RequestInfo {
    fn drop(&mut self) {
        if !self.answered {
            warn!(
                "RPC[{}]: request {} ({}) dropped without a response",
                self.channel, self.id, self.method
            );
        }
        if let Some(inner) = self.engine.upgrade() {
            if let Ok(mut inner) = inner.try_borrow_mut() {
                inner.inbound_in_flight = inner.inbound_in_flight.saturating_sub(1);
            }
        }
    }
}

impl core::fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestInfo")
            .field("id", &self.id)
            .field("src", &self.src)
            .field("tag", &self.tag)
            .field("method", &self.method)
            .field("authn", &self.authn)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

// ── Engine state ─────────────────────────────────────────────

struct ChannelEntry {
    id: ChannelId,
    /// Empty until learned; [`DST_DEFAULT`] for the default channel.
    dst: String,
    is_trusted: bool,
    state: ChannelState,
    channel: Rc<dyn Channel>,
    idle_remaining_ms: Option<u64>,
}

struct Inner {
    cfg: RpcConfig,
    channels: heapless::Vec<ChannelEntry, MAX_CHANNELS>,
    next_channel_id: u32,
    pending: PendingCalls,
    handlers: HandlerRegistry,
    observers: heapless::Vec<(ObserverId, Rc<dyn Observer>), MAX_OBSERVERS>,
    next_observer_id: u32,
    next_call_id: i64,
    now_ms: u64,
    inbound_in_flight: usize,
}

impl Inner {
    fn entry(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.channels.iter().find(|e| e.id == id)
    }

    fn entry_mut(&mut self, id: ChannelId) -> Option<&mut ChannelEntry> {
        self.channels.iter_mut().find(|e| e.id == id)
    }

    fn find_dst(&self, dst: &str) -> Option<&ChannelEntry> {
        self.channels.iter().find(|e| e.dst == dst)
    }

    fn default_entry(&self) -> Option<&ChannelEntry> {
        self.find_dst(DST_DEFAULT)
    }

    /// Outbound route: explicit destination, else the default channel.
    fn resolve(&self, dst: Option<&str>) -> core::result::Result<&ChannelEntry, RoutingError> {
        let entry = match dst {
            Some(d) if !d.is_empty() && d != DST_DEFAULT => {
                self.find_dst(d).ok_or(RoutingError::NoRoute)?
            }
            _ => self.default_entry().ok_or(RoutingError::NotConnected)?,
        };
        if entry.state != ChannelState::Open {
            return Err(RoutingError::NotConnected);
        }
        Ok(entry)
    }

    /// Response route: the originating channel while it is open, else by
    /// the requester's id, else the default channel.
    fn resolve_reply(
        &self,
        origin: ChannelId,
        src: &str,
    ) -> core::result::Result<&ChannelEntry, RoutingError> {
        match self.entry(origin) {
            Some(e) if e.state == ChannelState::Open => Ok(e),
            _ if !src.is_empty() && self.find_dst(src).is_some() => self.resolve(Some(src)),
            _ => self.resolve(None),
        }
    }

    fn alloc_call_id(&mut self) -> i64 {
        loop {
            let id = self.next_call_id;
            self.next_call_id = if id == i64::MAX { 1 } else { id + 1 };
            if !self.pending.contains(id) {
                return id;
            }
        }
    }

    fn idle_timeout(&self) -> Option<u64> {
        let t = self.cfg.default_out_channel_idle_close_timeout_ms;
        (t > 0).then_some(t)
    }

    /// Restart the idle countdown if `id` is the open default channel.
    fn touch_idle_timer(&mut self, id: ChannelId) {
        let timeout = self.idle_timeout();
        if let Some(e) = self.entry_mut(id) {
            if e.dst == DST_DEFAULT && e.state == ChannelState::Open {
                e.idle_remaining_ms = timeout;
            }
        }
    }
}

/// Seed request ids randomly so a restarted device does not collide with
/// late responses to its previous incarnation.
fn initial_call_id() -> i64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let seed = RandomState::new().build_hasher().finish();
    i64::from((seed & 0x3FFF_FFFF) as u32) + 1
}

fn to_raw(v: &Value) -> Result<Box<RawValue>> {
    serde_json::value::to_raw_value(v).map_err(|_| Error::Encode)
}

fn log_send_failure(method: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("RPC: {} response not sent: {}", method, e);
    }
}

// ── Engine ───────────────────────────────────────────────────

/// The dispatcher. Cloning yields another handle to the same instance.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Rc<RefCell<Inner>>,
}

impl RpcEngine {
    /// Validate `cfg`, then create an instance.
    pub fn try_new(cfg: RpcConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(cfg))
    }

    /// Create an instance. Takes over `cfg`, which is expected to have
    /// passed [`RpcConfig::validate`]; use [`RpcEngine::try_new`] otherwise.
    /// A zero `max_queue_length` makes every `call` fail with `QueueFull`.
    pub fn new(cfg: RpcConfig) -> Self {
        let pending = PendingCalls::new(cfg.max_queue_length);
        info!("RPC: instance '{}' created", cfg.id);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cfg,
                channels: heapless::Vec::new(),
                next_channel_id: 1,
                pending,
                handlers: HandlerRegistry::new(),
                observers: heapless::Vec::new(),
                next_observer_id: 1,
                next_call_id: initial_call_id(),
                now_ms: 0,
                inbound_in_flight: 0,
            })),
        }
    }

    /// Our own id, as configured.
    pub fn id(&self) -> String {
        self.inner.borrow().cfg.id.clone()
    }

    // ── Channels ──────────────────────────────────────────────

    /// Register a channel.
    ///
    /// `dst` is the peer id reachable through it, [`DST_DEFAULT`] for the
    /// fallback route, or empty to learn it from the first inbound frame.
    /// Trusted channels are allowed to invoke privileged methods; the engine
    /// only reports the flag, handlers enforce it.
    pub fn add_channel(
        &self,
        dst: &str,
        channel: Rc<dyn Channel>,
        is_trusted: bool,
    ) -> Result<ChannelId> {
        let dst = if dst.is_empty() {
            channel.destination().unwrap_or_default()
        } else {
            dst.to_owned()
        };
        let channel_type = channel.channel_type().to_owned();
        let detail = channel.info();

        let mut inner = self.inner.borrow_mut();
        if !dst.is_empty() && inner.find_dst(&dst).is_some() {
            warn!("RPC: destination '{}' already has a channel", dst);
            return Err(RegistryError::DuplicateDestination.into());
        }
        if inner.channels.is_full() {
            return Err(RegistryError::ChannelTableFull.into());
        }

        let id = ChannelId(inner.next_channel_id);
        inner.next_channel_id = inner.next_channel_id.wrapping_add(1);
        info!(
            "RPC[{}]: added {} channel {}, dst '{}', trusted={}",
            id, channel_type, detail, dst, is_trusted
        );
        let entry = ChannelEntry {
            id,
            dst,
            is_trusted,
            state: ChannelState::Closed,
            channel,
            idle_remaining_ms: None,
        };
        if inner.channels.push(entry).is_err() {
            return Err(RegistryError::ChannelTableFull.into());
        }
        Ok(id)
    }

    /// Unregister a channel without closing it. Returns the channel so the
    /// caller can dispose of it.
    pub fn remove_channel(&self, id: ChannelId) -> Option<Rc<dyn Channel>> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner.channels.iter().position(|e| e.id == id)?;
        let entry = inner.channels.swap_remove(pos);
        info!("RPC[{}]: removed, dst '{}'", id, entry.dst);
        Some(entry.channel)
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.inner.borrow().entry(id).map(|e| e.state)
    }

    /// Destination currently bound to a channel (empty if not yet learned).
    pub fn channel_destination(&self, id: ChannelId) -> Option<String> {
        self.inner.borrow().entry(id).map(|e| e.dst.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    /// Invoke `connect` on every registered channel.
    pub fn connect(&self) {
        let channels: Vec<Rc<dyn Channel>> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .channels
                .iter_mut()
                .map(|e| {
                    if e.state == ChannelState::Closed {
                        e.state = ChannelState::Connecting;
                    }
                    Rc::clone(&e.channel)
                })
                .collect()
        };
        for ch in channels {
            ch.connect();
        }
    }

    /// Invoke `close` on every registered channel.
    pub fn disconnect(&self) {
        let channels: Vec<Rc<dyn Channel>> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .channels
                .iter_mut()
                .map(|e| {
                    e.state = ChannelState::Closed;
                    e.idle_remaining_ms = None;
                    Rc::clone(&e.channel)
                })
                .collect()
        };
        for ch in channels {
            ch.close();
        }
    }

    /// Entry point for channel notifications.
    pub fn channel_event(&self, id: ChannelId, ev: ChannelEvent<'_>) {
        match ev {
            ChannelEvent::Open => self.on_channel_open(id),
            ChannelEvent::FrameReceived(buf) => self.on_frame(id, buf),
            ChannelEvent::FrameSent { success } => {
                if success {
                    debug!("RPC[{}]: frame sent", id);
                } else {
                    warn!("RPC[{}]: frame send failed", id);
                }
            }
            ChannelEvent::Closed => self.on_channel_closed(id),
        }
    }

    /// `true` if the default channel exists and is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .borrow()
            .default_entry()
            .is_some_and(|e| e.state == ChannelState::Open)
    }

    /// `true` if connected and the default channel is not busy.
    pub fn can_send(&self) -> bool {
        let channel = self
            .inner
            .borrow()
            .default_entry()
            .filter(|e| e.state == ChannelState::Open)
            .map(|e| Rc::clone(&e.channel));
        channel.is_some_and(|ch| !ch.is_busy())
    }

    fn on_channel_open(&self, id: ChannelId) {
        let dst = {
            let mut inner = self.inner.borrow_mut();
            let timeout = inner.idle_timeout();
            let Some(e) = inner.entry_mut(id) else {
                warn!("RPC[{}]: open event for unknown channel", id);
                return;
            };
            e.state = ChannelState::Open;
            if e.dst == DST_DEFAULT {
                e.idle_remaining_ms = timeout;
            }
            e.dst.clone()
        };
        info!("RPC[{}]: open, dst '{}'", id, dst);
        if !dst.is_empty() {
            self.notify(&RpcEvent::ChannelOpen { dst });
        }
    }

    fn on_channel_closed(&self, id: ChannelId) {
        let channel = self.inner.borrow().entry(id).map(|e| Rc::clone(&e.channel));
        let Some(channel) = channel else {
            warn!("RPC[{}]: close event for unknown channel", id);
            return;
        };
        let persistent = channel.is_persistent();

        let dst = {
            let mut inner = self.inner.borrow_mut();
            let Some(pos) = inner.channels.iter().position(|e| e.id == id) else {
                return;
            };
            let e = &mut inner.channels[pos];
            e.state = ChannelState::Closed;
            e.idle_remaining_ms = None;
            let dst = e.dst.clone();
            if !persistent {
                inner.channels.swap_remove(pos);
            }
            dst
        };
        info!("RPC[{}]: closed, dst '{}', persistent={}", id, dst, persistent);
        if !dst.is_empty() {
            self.notify(&RpcEvent::ChannelClosed { dst });
        }
    }

    // ── Inbound ───────────────────────────────────────────────

    fn on_frame(&self, id: ChannelId, buf: &[u8]) {
        let frame = match frame::parse(buf) {
            Ok(f) => f,
            Err(e) => {
                warn!("RPC[{}]: dropping frame: {}", id, e);
                return;
            }
        };

        let (channel, is_trusted, learned) = {
            let mut inner = self.inner.borrow_mut();
            if !frame.dst.is_empty() && !inner.cfg.id.is_empty() && frame.dst != inner.cfg.id {
                warn!(
                    "RPC[{}]: frame for '{}' is not for us ('{}')",
                    id, frame.dst, inner.cfg.id
                );
                return;
            }
            let src_taken = inner.find_dst(&frame.src).is_some_and(|e| e.id != id);
            let Some(entry) = inner.entry_mut(id) else {
                warn!("RPC[{}]: frame from unknown channel", id);
                return;
            };
            if entry.state != ChannelState::Open {
                warn!("RPC[{}]: frame on channel that is not open, dropped", id);
                return;
            }
            let mut learned = None;
            if entry.dst.is_empty() && !frame.src.is_empty() {
                if frame.src == DST_DEFAULT {
                    warn!("RPC[{}]: cannot learn reserved dst '{}'", id, frame.src);
                } else if src_taken {
                    warn!("RPC[{}]: cannot learn dst '{}', already taken", id, frame.src);
                } else {
                    entry.dst = frame.src.to_string();
                    learned = Some(entry.dst.clone());
                }
            }
            (Rc::clone(&entry.channel), entry.is_trusted, learned)
        };

        if let Some(dst) = learned {
            info!("RPC[{}]: learned dst '{}'", id, dst);
            self.notify(&RpcEvent::ChannelOpen { dst });
        }

        let fi = FrameInfo {
            channel_type: channel.channel_type(),
            channel_is_trusted: is_trusted,
        };
        if frame.is_request() {
            self.handle_request(id, &channel, &fi, &frame);
        } else {
            self.handle_response(&fi, &frame);
        }
    }

    fn handle_response(&self, fi: &FrameInfo<'_>, frame: &Frame<'_>) {
        let call = self.inner.borrow_mut().pending.take(frame.id);
        let Some(call) = call else {
            debug!("RPC: stray response id={}, dropped", frame.id);
            return;
        };
        debug!("RPC: response id={} error={}", frame.id, frame.error_code);
        call.complete(
            fi,
            Response {
                result: frame.result,
                error_code: frame.error_code,
                error_msg: &frame.error_msg,
            },
        );
    }

    fn handle_request(
        &self,
        id: ChannelId,
        channel: &Rc<dyn Channel>,
        fi: &FrameInfo<'_>,
        frame: &Frame<'_>,
    ) {
        let (entry, prehandler): (Option<HandlerEntry>, _) = {
            let inner = self.inner.borrow();
            (
                inner.handlers.lookup(&frame.method).cloned(),
                inner.handlers.prehandler(),
            )
        };
        let args_fmt = entry.as_ref().map_or("", |e| e.args_fmt.as_str());
        let ri = self.new_request_info(id, channel, frame, args_fmt);

        let Some(entry) = entry else {
            warn!("RPC[{}]: no handler for {}", id, frame.method);
            let msg = format!("No handler for {}", frame.method);
            log_send_failure(&frame.method, ri.send_error(ERR_NOT_FOUND, Some(&msg)));
            return;
        };

        let ri = match prehandler {
            Some(pre) => match pre.pre_handle(ri, fi, frame.args) {
                Some(ri) => ri,
                None => {
                    debug!("RPC[{}]: {} stopped by prehandler", id, frame.method);
                    return;
                }
            },
            None => ri,
        };

        debug!("RPC[{}]: {} id={}", id, frame.method, frame.id);
        entry.handler.handle(ri, fi, frame.args);
    }

    fn new_request_info(
        &self,
        id: ChannelId,
        channel: &Rc<dyn Channel>,
        frame: &Frame<'_>,
        args_fmt: &str,
    ) -> RequestInfo {
        let username = channel.authn_username();
        self.inner.borrow_mut().inbound_in_flight += 1;
        RequestInfo {
            engine: Rc::downgrade(&self.inner),
            id: frame.id,
            src: frame.src.to_string(),
            tag: frame.tag.to_string(),
            method: frame.method.to_string(),
            auth: frame.auth.map(ToOwned::to_owned),
            authn: Authn { username },
            args_fmt: args_fmt.to_owned(),
            user_data: None,
            channel: id,
            answered: false,
        }
    }

    // ── Outbound ──────────────────────────────────────────────

    /// Send a request.
    ///
    /// With a `callback` the call is tracked until its response (or
    /// timeout) arrives; without one it is fire-and-forget. `Ok` carries
    /// the request id and means the frame was accepted by the channel, not
    /// that the peer will answer.
    pub fn call(
        &self,
        method: &str,
        callback: Option<ResultCallback>,
        opts: &CallOptions,
        args: Option<Value>,
    ) -> Result<i64> {
        if method.is_empty() {
            return Err(RoutingError::EmptyMethod.into());
        }
        let args = args.as_ref().map(to_raw).transpose()?;
        let auth = opts.auth.as_ref().map(to_raw).transpose()?;
        let dst = opts
            .dst
            .as_deref()
            .filter(|d| *d != DST_DEFAULT)
            .unwrap_or("");

        let (id, channel_id, channel, bytes) = {
            let mut inner = self.inner.borrow_mut();
            let (channel_id, channel) = {
                let e = inner.resolve(opts.dst.as_deref())?;
                (e.id, Rc::clone(&e.channel))
            };
            let id = inner.alloc_call_id();
            let bytes = Frame {
                version: PROTOCOL_VERSION,
                id,
                src: Cow::Borrowed(inner.cfg.id.as_str()),
                dst: Cow::Borrowed(dst),
                tag: Cow::Borrowed(opts.tag.as_deref().unwrap_or("")),
                method: Cow::Borrowed(method),
                args: args.as_deref(),
                auth: auth.as_deref(),
                ..Frame::default()
            }
            .encode()?;
            if let Some(cb) = callback {
                let now = inner.now_ms;
                let call = PendingCall::new(id, dst.to_owned(), channel_id, now, opts.timeout_ms, cb);
                inner.pending.insert(call)?;
            }
            (id, channel_id, channel, bytes)
        };

        if let Err(e) = self.transmit(channel_id, &channel, &bytes) {
            self.inner.borrow_mut().pending.take(id);
            warn!("RPC[{}]: {} not sent: {}", channel_id, method, e);
            return Err(e);
        }
        debug!("RPC[{}]: call {} id={}", channel_id, method, id);
        Ok(id)
    }

    fn reply(&self, ri: &RequestInfo, reply: &Reply<'_>) -> Result<()> {
        if ri.id == 0 {
            debug!("RPC: {} is a notification, response suppressed", ri.method);
            return Ok(());
        }
        let (result, error_code, error_msg) = match *reply {
            Reply::Result(v) => (v.map(to_raw).transpose()?, 0, ""),
            Reply::Error { code: 0, message } => {
                warn!("RPC: {} error reply with code 0, sent as {}", ri.method, ERR_INTERNAL);
                (None, ERR_INTERNAL, message)
            }
            Reply::Error { code, message } => (None, code, message),
        };

        let (channel_id, channel, bytes) = {
            let inner = self.inner.borrow();
            let e = inner.resolve_reply(ri.channel, &ri.src)?;
            let bytes = Frame {
                version: PROTOCOL_VERSION,
                id: ri.id,
                error_code,
                src: Cow::Borrowed(inner.cfg.id.as_str()),
                dst: Cow::Borrowed(ri.src.as_str()),
                tag: Cow::Borrowed(ri.tag.as_str()),
                result: result.as_deref(),
                error_msg: Cow::Borrowed(error_msg),
                ..Frame::default()
            }
            .encode()?;
            (e.id, Rc::clone(&e.channel), bytes)
        };

        self.transmit(channel_id, &channel, &bytes)
    }

    fn transmit(&self, id: ChannelId, channel: &Rc<dyn Channel>, bytes: &[u8]) -> Result<()> {
        if channel.is_busy() {
            return Err(RoutingError::Busy.into());
        }
        if !channel.send_frame(bytes) {
            return Err(RoutingError::SendFailed.into());
        }
        self.inner.borrow_mut().touch_idle_timer(id);
        Ok(())
    }

    // ── Handlers ──────────────────────────────────────────────

    /// Register a method handler. `args_fmt` documents the expected
    /// arguments and is reported by `RPC.Describe`; it is not enforced.
    pub fn add_handler<F>(&self, method: &str, args_fmt: &str, handler: F)
    where
        F: Fn(RequestInfo, &FrameInfo<'_>, Option<&RawValue>) + 'static,
    {
        self.inner
            .borrow_mut()
            .handlers
            .add(method, args_fmt, Rc::new(handler));
    }

    /// Install the prehandler, replacing any previous one.
    /// See [`Prehandler`](super::handlers::Prehandler) for the veto contract.
    pub fn set_prehandler<F>(&self, prehandler: F)
    where
        F: Fn(RequestInfo, &FrameInfo<'_>, Option<&RawValue>) -> Option<RequestInfo> + 'static,
    {
        self.inner
            .borrow_mut()
            .handlers
            .set_prehandler(Some(Rc::new(prehandler)));
    }

    pub fn clear_prehandler(&self) {
        self.inner.borrow_mut().handlers.set_prehandler(None);
    }

    /// Names of all registered methods, in registration order.
    pub fn method_names(&self) -> Vec<String> {
        self.inner.borrow().handlers.method_names()
    }

    /// Argument descriptor of a registered method.
    pub fn describe(&self, method: &str) -> Option<String> {
        self.inner
            .borrow()
            .handlers
            .lookup(method)
            .map(|e| e.args_fmt.clone())
    }

    /// Register the introspection methods `RPC.List`, `RPC.Describe` and
    /// `RPC.Ping`. They go through the prehandler like any other method.
    /// Listing and describing are refused with 403 on untrusted channels.
    pub fn add_list_handler(&self) {
        self.add_handler("RPC.List", "", |ri, fi, _args| {
            if !fi.channel_is_trusted {
                log_send_failure("RPC.List", ri.send_error(ERR_FORBIDDEN, Some("Unauthorized")));
                return;
            }
            let names = ri.engine().map(|e| e.method_names()).unwrap_or_default();
            log_send_failure("RPC.List", ri.send_response(Some(json!(names))));
        });

        self.add_handler("RPC.Describe", "{name: %Q}", |ri, fi, args| {
            if !fi.channel_is_trusted {
                log_send_failure("RPC.Describe", ri.send_error(ERR_FORBIDDEN, Some("Unauthorized")));
                return;
            }
            #[derive(Deserialize)]
            struct DescribeArgs {
                name: String,
            }
            let Ok(DescribeArgs { name }) = decode_payload::<DescribeArgs>(args) else {
                log_send_failure(
                    "RPC.Describe",
                    ri.send_error(ERR_BAD_REQUEST, Some("name is required")),
                );
                return;
            };
            let args_fmt = ri.engine().ok().and_then(|e| e.describe(&name));
            let sent = match args_fmt {
                Some(args_fmt) => ri.send_response(Some(json!({
                    "name": name,
                    "args_fmt": args_fmt,
                }))),
                None => {
                    let msg = format!("No handler for {}", name);
                    ri.send_error(ERR_NOT_FOUND, Some(&msg))
                }
            };
            log_send_failure("RPC.Describe", sent);
        });

        self.add_handler("RPC.Ping", "", |ri, _fi, _args| {
            log_send_failure("RPC.Ping", ri.send_response(Some(json!("pong"))));
        });
    }

    // ── Observers ─────────────────────────────────────────────

    pub fn add_observer<F>(&self, observer: F) -> Result<ObserverId>
    where
        F: Fn(&RpcEvent) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = ObserverId(inner.next_observer_id);
        inner.next_observer_id = inner.next_observer_id.wrapping_add(1);
        inner
            .observers
            .push((id, Rc::new(observer)))
            .map_err(|_| RegistryError::ObserverTableFull)?;
        Ok(id)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.observers.iter().position(|(oid, _)| *oid == id) {
            Some(pos) => {
                inner.observers.remove(pos);
                true
            }
            None => false,
        }
    }

    fn notify(&self, ev: &RpcEvent) {
        let observers: Vec<Rc<dyn Observer>> = self
            .inner
            .borrow()
            .observers
            .iter()
            .map(|(_, o)| Rc::clone(o))
            .collect();
        for o in observers {
            o.on_event(ev);
        }
    }

    // ── Time ──────────────────────────────────────────────────

    /// Advance the engine clock. Closes the default channel once its idle
    /// countdown runs out and retires timed-out calls with [`ERR_TIMEOUT`].
    pub fn tick(&self, elapsed_ms: u64) {
        let (idle, expired) = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.now_ms = inner.now_ms.saturating_add(elapsed_ms);

            let mut idle = Vec::new();
            for e in inner.channels.iter_mut() {
                let Some(remaining) = e.idle_remaining_ms else {
                    continue;
                };
                if remaining <= elapsed_ms {
                    e.idle_remaining_ms = None;
                    e.state = ChannelState::Closed;
                    idle.push((e.id, Rc::clone(&e.channel)));
                } else {
                    e.idle_remaining_ms = Some(remaining - elapsed_ms);
                }
            }
            (idle, inner.pending.expire(inner.now_ms))
        };

        for (id, channel) in idle {
            info!("RPC[{}]: idle timeout, closing", id);
            channel.close();
        }

        for call in expired {
            warn!("RPC: call id={} to '{}' timed out", call.id, call.dst);
            let origin = self
                .inner
                .borrow()
                .entry(call.channel)
                .map(|e| (Rc::clone(&e.channel), e.is_trusted));
            let fi = FrameInfo {
                channel_type: origin.as_ref().map_or("", |(ch, _)| ch.channel_type()),
                channel_is_trusted: origin.as_ref().is_some_and(|(_, trusted)| *trusted),
            };
            call.complete(
                &fi,
                Response {
                    result: None,
                    error_code: ERR_TIMEOUT,
                    error_msg: "timed out",
                },
            );
        }
    }

    // ── Diagnostics ───────────────────────────────────────────

    /// Outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Inbound requests handed to handlers and not yet answered or freed.
    pub fn inbound_in_flight(&self) -> usize {
        self.inner.borrow().inbound_in_flight
    }
}

impl core::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("RpcEngine")
                .field("id", &inner.cfg.id)
                .field("channels", &inner.channels.len())
                .field("pending", &inner.pending.len())
                .finish(),
            Err(_) => f.write_str("RpcEngine { <busy> }"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
