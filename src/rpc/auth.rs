//! Digest authentication for inbound requests.
//!
//! Credentials travel in the frame's `auth` object:
//!
//! ```text
//! {"realm":"RPC", "username":"admin", "nonce":"65f0a1c2.9d3e..",
//!  "cnonce":"x1", "nc":"00000001", "response":"<sha256 hex>"}
//! ```
//!
//! `response = H(HA1:nonce:nc:cnonce:auth:HA2)` with
//! `HA1 = H(user:realm:password)`, `HA2 = H(method:/rpc/<method>)` and
//! `H` = SHA-256 hex (RFC 7616 form, `qop=auth`).
//!
//! There is no MD5 fallback. Clients and htdigest files that hash with MD5
//! will not verify; store SHA-256 HA1 values via [`DigestAuth::add_user_ha1`]
//! or plain passwords via [`DigestAuth::add_user`].
//!
//! Nonces are the issue time in hex. With a PSK configured they carry a
//! truncated `HMAC-SHA256(psk, timestamp)` so only this device can mint them.
//!
//! Crypto is handled by the `hmac-sha256` crate; comparisons of secret
//! material are constant-time.

use std::collections::HashMap;
use std::fmt::Write as _;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::value::RawValue;

use super::engine::RequestInfo;
use crate::config::RpcConfig;

/// `nc` value assumed when the client omits it.
const DEFAULT_NC: &str = "00000001";

/// Hex digits of the nonce MAC (64 bits).
const NONCE_MAC_HEX_LEN: usize = 16;

#[derive(Deserialize)]
struct DigestCredentials {
    realm: String,
    username: String,
    nonce: String,
    cnonce: String,
    response: String,
    #[serde(default)]
    nc: Option<String>,
}

/// Realm-scoped user database plus nonce policy.
#[derive(Clone)]
pub struct DigestAuth {
    realm: String,
    psk: Option<Vec<u8>>,
    /// username → HA1 hex
    users: HashMap<String, String>,
    nonce_ttl_secs: u64,
}

impl DigestAuth {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            psk: None,
            users: HashMap::new(),
            nonce_ttl_secs: 3600,
        }
    }

    /// Realm, PSK and nonce lifetime taken from the instance config.
    pub fn from_config(cfg: &RpcConfig) -> Self {
        let mut auth = Self::new(cfg.auth_domain.clone()).with_nonce_ttl(cfg.auth_nonce_ttl_secs);
        if let Some(psk) = cfg.psk.as_deref() {
            auth = auth.with_psk(psk.as_bytes());
        }
        auth
    }

    #[must_use]
    pub fn with_psk(mut self, psk: &[u8]) -> Self {
        self.psk = Some(psk.to_vec());
        self
    }

    #[must_use]
    pub fn with_nonce_ttl(mut self, secs: u64) -> Self {
        self.nonce_ttl_secs = secs;
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn add_user(&mut self, username: &str, password: &str) {
        let ha1 = ha1(username, &self.realm, password);
        self.users.insert(username.to_owned(), ha1);
    }

    /// Add a user from a precomputed HA1 (htdigest-style storage).
    pub fn add_user_ha1(&mut self, username: &str, ha1_hex: &str) {
        self.users
            .insert(username.to_owned(), ha1_hex.to_ascii_lowercase());
    }

    /// Issue a nonce valid from `now_secs` for the configured lifetime.
    pub fn mint_nonce(&self, now_secs: u64) -> String {
        let ts = format!("{now_secs:x}");
        match &self.psk {
            Some(psk) => {
                let mac = nonce_mac(psk, &ts);
                format!("{ts}.{mac}")
            }
            None => ts,
        }
    }

    /// Validate the request's digest credential.
    ///
    /// Returns `true` and sets `ri.authn.username` on success. An identity
    /// already supplied by the channel is accepted as is. Never responds to
    /// the request; rejecting it is up to the caller.
    pub fn check(&self, ri: &mut RequestInfo, now_secs: u64) -> bool {
        if ri.authn.username.is_some() {
            return true;
        }
        match self.verify(&ri.method, ri.auth.as_deref(), now_secs) {
            Some(username) => {
                ri.authn.username = Some(username);
                true
            }
            None => false,
        }
    }

    /// Verify a raw `auth` payload for `method`. Returns the authenticated
    /// username.
    pub fn verify(&self, method: &str, auth: Option<&RawValue>, now_secs: u64) -> Option<String> {
        let Some(raw) = auth else {
            debug!("auth: {} carries no credentials", method);
            return None;
        };
        let creds: DigestCredentials = match serde_json::from_str(raw.get()) {
            Ok(c) => c,
            Err(e) => {
                warn!("auth: malformed credentials for {}: {}", method, e);
                return None;
            }
        };

        if creds.realm != self.realm {
            warn!("auth: realm mismatch ('{}' != '{}')", creds.realm, self.realm);
            return None;
        }
        if !self.nonce_is_fresh(&creds.nonce, now_secs) {
            warn!("auth: stale or invalid nonce from '{}'", creds.username);
            return None;
        }
        let Some(ha1) = self.users.get(&creds.username) else {
            warn!("auth: unknown user '{}'", creds.username);
            return None;
        };

        let nc = creds.nc.as_deref().unwrap_or(DEFAULT_NC);
        let expected = digest_response(ha1, &creds.nonce, nc, &creds.cnonce, method);
        if !ct_eq(
            expected.as_bytes(),
            creds.response.to_ascii_lowercase().as_bytes(),
        ) {
            warn!("auth: bad digest from '{}'", creds.username);
            return None;
        }

        debug!("auth: '{}' authenticated for {}", creds.username, method);
        Some(creds.username)
    }

    fn nonce_is_fresh(&self, nonce: &str, now_secs: u64) -> bool {
        let (ts_hex, mac) = match nonce.split_once('.') {
            Some((ts, mac)) => (ts, Some(mac)),
            None => (nonce, None),
        };
        match (&self.psk, mac) {
            (Some(psk), Some(mac)) => {
                if !ct_eq(nonce_mac(psk, ts_hex).as_bytes(), mac.as_bytes()) {
                    return false;
                }
            }
            (Some(_), None) | (None, Some(_)) => return false,
            (None, None) => {}
        }
        let Ok(ts) = u64::from_str_radix(ts_hex, 16) else {
            return false;
        };
        ts <= now_secs && now_secs - ts <= self.nonce_ttl_secs
    }
}

impl core::fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DigestAuth")
            .field("realm", &self.realm)
            .field("psk", &self.psk.as_ref().map(|_| "<set>"))
            .field("users", &self.users.len())
            .field("nonce_ttl_secs", &self.nonce_ttl_secs)
            .finish()
    }
}

// ── Digest primitives ────────────────────────────────────────

/// `H(user:realm:password)`.
pub fn ha1(username: &str, realm: &str, password: &str) -> String {
    sha256_hex(format!("{username}:{realm}:{password}").as_bytes())
}

/// Client side of the handshake: the `response` value for calling
/// `method` with the given nonce.
pub fn digest_response(ha1_hex: &str, nonce: &str, nc: &str, cnonce: &str, method: &str) -> String {
    let ha2 = sha256_hex(format!("{method}:/rpc/{method}").as_bytes());
    sha256_hex(format!("{ha1_hex}:{nonce}:{nc}:{cnonce}:auth:{ha2}").as_bytes())
}

fn sha256_hex(input: &[u8]) -> String {
    to_hex(&hmac_sha256::Hash::hash(input))
}

fn nonce_mac(psk: &[u8], ts_hex: &str) -> String {
    let mut mac = to_hex(&hmac_sha256::HMAC::mac(ts_hex.as_bytes(), psk));
    mac.truncate(NONCE_MAC_HEX_LEN);
    mac
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Tests ────────────────────────────────────────────────────
