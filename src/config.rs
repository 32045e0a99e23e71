//! RPC instance configuration
//!
//! Everything an [`RpcEngine`](crate::rpc::engine::RpcEngine) needs at
//! construction time. Values are usually loaded from a JSON document
//! (device config partition, provisioning payload) and handed over whole.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Core RPC configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    // --- Identity ---
    /// Our own id. Written as `src` on outbound frames; inbound frames
    /// addressed to any other non-empty `dst` are dropped.
    pub id: String,
    /// Optional pre-shared key. Binds digest-auth nonces to this device.
    pub psk: Option<String>,

    // --- Limits ---
    /// Maximum number of outbound calls awaiting a response.
    pub max_queue_length: usize,

    // --- Timing ---
    /// Close the default channel after this long without outbound traffic
    /// (milliseconds, 0 = never).
    pub default_out_channel_idle_close_timeout_ms: u64,

    // --- Auth ---
    /// Digest-auth realm.
    pub auth_domain: String,
    /// Maximum age of a digest nonce (seconds).
    pub auth_nonce_ttl_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            psk: None,

            max_queue_length: 25,

            default_out_channel_idle_close_timeout_ms: 0,

            auth_domain: "RPC".into(),
            auth_nonce_ttl_secs: 3600, // 1 hour
        }
    }
}

impl RpcConfig {
    /// Convenience constructor for an instance with the given id and
    /// defaults for everything else.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_queue_length == 0 {
            return Err(Error::Config("max_queue_length must be non-zero"));
        }
        if self.id == crate::rpc::channel::DST_DEFAULT {
            return Err(Error::Config("id must not be the default sentinel"));
        }
        if self.psk.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("psk must not be empty when set"));
        }
        if self.auth_nonce_ttl_secs == 0 {
            return Err(Error::Config("auth_nonce_ttl_secs must be non-zero"));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(text).context("invalid RPC config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading RPC config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("loading RPC config {}", path.display()))
    }
}
