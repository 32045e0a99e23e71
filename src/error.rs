//! Unified error types for the RPC core.
//!
//! A single `Error` enum that every subsystem converts into, so callers of
//! the engine handle failures uniformly. All variants are `Copy`; they are
//! returned synchronously and never carry borrowed frame data.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An inbound frame could not be decoded.
    Parse(ParseError),
    /// An outbound frame could not be delivered to a channel.
    Routing(RoutingError),
    /// A channel, handler or observer registration was refused.
    Registry(RegistryError),
    /// An outbound frame could not be serialised.
    Encode,
    /// The engine that issued a request-info has been dropped.
    EngineGone,
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "parse: {e}"),
            Self::Routing(e) => write!(f, "routing: {e}"),
            Self::Registry(e) => write!(f, "registry: {e}"),
            Self::Encode => write!(f, "frame encoding failed"),
            Self::EngineGone => write!(f, "rpc engine no longer exists"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not a JSON object, or a field has the wrong type.
    Malformed,
    /// Neither an id nor a method is present.
    MissingIdAndMethod,
    /// Both `result` and `error` are present.
    ConflictingResponse,
    /// A request (method present) also carries `result` or `error`.
    AmbiguousKind,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed frame"),
            Self::MissingIdAndMethod => write!(f, "frame has neither id nor method"),
            Self::ConflictingResponse => write!(f, "frame has both result and error"),
            Self::AmbiguousKind => write!(f, "request frame carries a response field"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// Routing errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    /// No channel is registered for the explicit destination.
    NoRoute,
    /// The default (or selected) channel is missing or not open.
    NotConnected,
    /// The channel reports backpressure.
    Busy,
    /// The channel refused the frame.
    SendFailed,
    /// The pending-call table is at `max_queue_length`.
    QueueFull,
    /// An outbound call was issued with an empty method name.
    EmptyMethod,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no channel for destination"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Busy => write!(f, "channel busy"),
            Self::SendFailed => write!(f, "channel rejected frame"),
            Self::QueueFull => write!(f, "too many outstanding calls"),
            Self::EmptyMethod => write!(f, "method name is empty"),
        }
    }
}

impl std::error::Error for RoutingError {}

impl From<RoutingError> for Error {
    fn from(e: RoutingError) -> Self {
        Self::Routing(e)
    }
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Another channel already owns this destination (or the default slot).
    DuplicateDestination,
    /// The fixed-capacity channel table is full.
    ChannelTableFull,
    /// The fixed-capacity observer table is full.
    ObserverTableFull,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateDestination => write!(f, "destination already registered"),
            Self::ChannelTableFull => write!(f, "channel table full"),
            Self::ObserverTableFull => write!(f, "observer table full"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
