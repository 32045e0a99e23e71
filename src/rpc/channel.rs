//! Channel abstraction — any frame-oriented link to a peer.
//!
//! Concrete implementations live outside this crate:
//! - UART serial (USB CDC)
//! - TCP / WebSocket client or server socket
//! - in-process loopback
//!
//! The engine only ever talks to a [`Channel`] through this trait, so adding
//! a new transport requires zero changes to the RPC logic. Channels report
//! back asynchronously by calling
//! [`RpcEngine::channel_event`](super::engine::RpcEngine::channel_event)
//! with the [`ChannelId`] they were registered under.

use core::fmt;

/// Reserved destination that marks the default (fallback) channel.
pub const DST_DEFAULT: &str = "*";

/// Handle assigned by the engine when a channel is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness of a registered channel, as last observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    /// `connect()` issued, `Open` not yet reported.
    Connecting,
    Open,
}

/// Notifications a channel delivers to the engine.
#[derive(Debug, Clone, Copy)]
pub enum ChannelEvent<'a> {
    /// The link is up and can carry frames.
    Open,
    /// One complete wire frame arrived.
    FrameReceived(&'a [u8]),
    /// A previously accepted frame finished transmitting.
    FrameSent { success: bool },
    /// The link went down.
    Closed,
}

/// Auxiliary information about the channel a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo<'a> {
    pub channel_type: &'a str,
    pub channel_is_trusted: bool,
}

/// Frame-oriented transport channel.
///
/// All methods take `&self`: the engine shares channels through `Rc` and
/// calls them without holding any internal borrow, so an implementation is
/// free to call straight back into the engine (a loopback channel delivering
/// a frame from inside `send_frame`, for example). Implementations keep
/// their own mutable state behind `Cell`/`RefCell`.
pub trait Channel {
    /// Start connecting. Completion is reported with [`ChannelEvent::Open`].
    fn connect(&self);

    /// Tear the link down. Completion is reported with [`ChannelEvent::Closed`].
    fn close(&self);

    /// Queue one encoded frame for transmission.
    /// Returns `false` if the channel refused it.
    fn send_frame(&self, frame: &[u8]) -> bool;

    /// Short transport name, e.g. `"UART"` or `"WS_in"`.
    fn channel_type(&self) -> &str;

    /// Persistent channels survive `Closed` and may be reconnected;
    /// others are unregistered when they close.
    fn is_persistent(&self) -> bool;

    /// Backpressure: `true` while the channel cannot accept another frame.
    fn is_busy(&self) -> bool {
        false
    }

    /// Destination id the transport already knows (e.g. from a handshake).
    fn destination(&self) -> Option<String> {
        None
    }

    /// Human-readable detail (peer address, port name).
    fn info(&self) -> String {
        String::new()
    }

    /// Authenticated peer identity established by the transport itself,
    /// e.g. a TLS client certificate subject.
    fn authn_username(&self) -> Option<String> {
        None
    }
}

/// A channel that discards all frames and never opens by itself.
/// Useful as a placeholder when no real link is available yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChannel;

impl Channel for NullChannel {
    fn connect(&self) {}

    fn close(&self) {}

    fn send_frame(&self, _frame: &[u8]) -> bool {
        true
    }

    fn channel_type(&self) -> &str {
        "null"
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
