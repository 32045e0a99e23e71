//! Pending-call table — outbound requests awaiting a response.
//!
//! One record per outstanding request id. A record is retired exactly once:
//! by the matching response, by a local timeout, or by the engine dropping
//! it after a failed send. Late responses for retired ids find nothing here
//! and are discarded by the engine.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

use super::channel::{ChannelId, FrameInfo};
use super::frame::decode_payload;
use crate::error::RoutingError;

/// Outcome of an outbound call, as delivered to its callback.
#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    pub result: Option<&'a RawValue>,
    /// 0 = success.
    pub error_code: i32,
    pub error_msg: &'a str,
}

impl Response<'_> {
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Decode the result payload. A missing result decodes as `{}`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_payload(self.result)
    }
}

/// Receives the response to an outbound call. Runs at most once.
pub type ResultCallback = Box<dyn FnOnce(&FrameInfo<'_>, Response<'_>)>;

/// Bookkeeping for one outstanding outbound request.
pub struct PendingCall {
    pub id: i64,
    /// Destination the request was addressed to (empty = default route).
    pub dst: String,
    /// Channel the request left on.
    pub channel: ChannelId,
    /// Engine clock at send time.
    pub sent_at_ms: u64,
    pub timeout_ms: Option<u64>,
    callback: ResultCallback,
}

impl PendingCall {
    pub fn new(
        id: i64,
        dst: String,
        channel: ChannelId,
        sent_at_ms: u64,
        timeout_ms: Option<u64>,
        callback: ResultCallback,
    ) -> Self {
        Self {
            id,
            dst,
            channel,
            sent_at_ms,
            timeout_ms,
            callback,
        }
    }

    /// Deliver the outcome, consuming the record.
    pub fn complete(self, fi: &FrameInfo<'_>, response: Response<'_>) {
        (self.callback)(fi, response);
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.timeout_ms
            .is_some_and(|t| now_ms.saturating_sub(self.sent_at_ms) >= t)
    }
}

impl core::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("dst", &self.dst)
            .field("channel", &self.channel)
            .field("sent_at_ms", &self.sent_at_ms)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Bounded map of outstanding calls keyed by request id.
pub struct PendingCalls {
    calls: HashMap<i64, PendingCall>,
    capacity: usize,
}

impl PendingCalls {
    pub fn new(capacity: usize) -> Self {
        Self {
            calls: HashMap::new(),
            capacity,
        }
    }

    /// Track a new call. Fails when `capacity` calls are already live.
    pub fn insert(&mut self, call: PendingCall) -> Result<(), RoutingError> {
        debug_assert!(!self.calls.contains_key(&call.id), "request id reused while live");
        if self.calls.len() >= self.capacity {
            return Err(RoutingError::QueueFull);
        }
        self.calls.insert(call.id, call);
        Ok(())
    }

    /// Remove and return the record for `id`, if any.
    pub fn take(&mut self, id: i64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Remove every call whose timeout has elapsed, oldest id first.
    pub fn expire(&mut self, now_ms: u64) -> Vec<PendingCall> {
        let mut ids: Vec<i64> = self
            .calls
            .values()
            .filter(|c| c.is_expired(now_ms))
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.calls.remove(&id)).collect()
    }
}
