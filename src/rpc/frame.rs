//! Frame model — one parsed RPC message.
//!
//! Wire format is a single JSON object per frame:
//!
//! ```text
//! {"v":2, "src":"dev1", "dst":"cloud", "tag":"t1", "id":7,
//!  "method":"Math.Add", "args":{..}}                       ← request
//! {"v":2, "src":"cloud", "dst":"dev1", "id":7, "result":{..}}  ← response
//! {"v":2, "id":7, "error":{"code":404, "message":".."}}   ← error response
//! ```
//!
//! A frame with a non-empty `method` is a request; anything else is a
//! response. Parsing borrows from the input buffer: string fields are
//! `Cow::Borrowed` unless the JSON escapes them, and `args` / `result` /
//! `auth` are raw slices of the input left for the handler to decode.

use std::borrow::Cow;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, ParseError};

/// Protocol version written on every outbound frame.
pub const PROTOCOL_VERSION: i32 = 2;

// ── Error codes carried in response frames ───────────────────

pub const ERR_BAD_REQUEST: i32 = 400;
pub const ERR_UNAUTHORIZED: i32 = 401;
pub const ERR_FORBIDDEN: i32 = 403;
/// No handler is registered for the requested method.
pub const ERR_NOT_FOUND: i32 = 404;
/// Synthesised locally when a pending call expires.
pub const ERR_TIMEOUT: i32 = 408;
pub const ERR_INTERNAL: i32 = 500;

/// One parsed RPC message. Borrows from the buffer it was parsed from.
#[derive(Debug, Clone, Default)]
pub struct Frame<'a> {
    pub version: i32,
    /// Request id; 0 when absent.
    pub id: i64,
    /// 0 = success / no error.
    pub error_code: i32,
    pub src: Cow<'a, str>,
    pub dst: Cow<'a, str>,
    /// Opaque correlation token, echoed back unchanged in the response.
    pub tag: Cow<'a, str>,
    pub method: Cow<'a, str>,
    pub args: Option<&'a RawValue>,
    pub result: Option<&'a RawValue>,
    pub error_msg: Cow<'a, str>,
    pub auth: Option<&'a RawValue>,
}

impl PartialEq for Frame<'_> {
    fn eq(&self, other: &Self) -> bool {
        fn raw(v: Option<&RawValue>) -> Option<&str> {
            v.map(RawValue::get)
        }
        self.version == other.version
            && self.id == other.id
            && self.error_code == other.error_code
            && self.src == other.src
            && self.dst == other.dst
            && self.tag == other.tag
            && self.method == other.method
            && raw(self.args) == raw(other.args)
            && raw(self.result) == raw(other.result)
            && self.error_msg == other.error_msg
            && raw(self.auth) == raw(other.auth)
    }
}

impl Frame<'_> {
    /// `true` if this frame is a request (method present).
    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// `true` if this frame carries an error instead of a result.
    pub fn is_error(&self) -> bool {
        self.error_code != 0 || !self.error_msg.is_empty()
    }

    /// Decode the argument payload. Missing args decode as `{}`.
    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_payload(self.args)
    }

    /// Serialise this frame into its wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let error = (self.error_code != 0 || !self.error_msg.is_empty()).then(|| WireErrorOut {
            code: self.error_code,
            message: &self.error_msg,
        });
        let wire = WireFrameOut {
            v: self.version,
            src: &self.src,
            dst: &self.dst,
            tag: &self.tag,
            id: self.id,
            method: &self.method,
            args: self.args,
            result: self.result,
            error,
            auth: self.auth,
        };
        serde_json::to_vec(&wire).map_err(|_| Error::Encode)
    }
}

/// Decode an optional raw payload into `T`; a missing payload decodes as
/// an empty object so handlers with all-optional fields work unchanged.
pub fn decode_payload<T: DeserializeOwned>(raw: Option<&RawValue>) -> Result<T, serde_json::Error> {
    serde_json::from_str(raw.map_or("{}", RawValue::get))
}

/// Parse one wire frame.
///
/// Rejects anything but a JSON object, frames with neither id nor method,
/// responses carrying both `result` and `error`, and requests carrying
/// either.
pub fn parse(buf: &[u8]) -> Result<Frame<'_>, ParseError> {
    // Derived structs also deserialize from sequences.
    if buf.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
        return Err(ParseError::Malformed);
    }
    let wire: WireFrame<'_> = serde_json::from_slice(buf).map_err(|_| ParseError::Malformed)?;

    if wire.id == 0 && wire.method.is_empty() {
        return Err(ParseError::MissingIdAndMethod);
    }
    if wire.result.is_some() && wire.error.is_some() {
        return Err(ParseError::ConflictingResponse);
    }
    if !wire.method.is_empty() && (wire.result.is_some() || wire.error.is_some()) {
        return Err(ParseError::AmbiguousKind);
    }

    let (error_code, error_msg) = match wire.error {
        Some(e) => (e.code, e.message),
        None => (0, Cow::Borrowed("")),
    };

    Ok(Frame {
        version: wire.v,
        id: wire.id,
        error_code,
        src: wire.src,
        dst: wire.dst,
        tag: wire.tag,
        method: wire.method,
        args: wire.args,
        result: wire.result,
        error_msg,
        auth: wire.auth,
    })
}

// ── Wire mirrors ─────────────────────────────────────────────

#[derive(Deserialize)]
struct WireFrame<'a> {
    #[serde(default)]
    v: i32,
    #[serde(default)]
    id: i64,
    #[serde(default, borrow)]
    src: Cow<'a, str>,
    #[serde(default, borrow)]
    dst: Cow<'a, str>,
    #[serde(default, borrow)]
    tag: Cow<'a, str>,
    #[serde(default, borrow)]
    method: Cow<'a, str>,
    #[serde(default, borrow)]
    args: Option<&'a RawValue>,
    #[serde(default, borrow)]
    result: Option<&'a RawValue>,
    #[serde(default, borrow)]
    error: Option<WireError<'a>>,
    #[serde(default, borrow)]
    auth: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct WireError<'a> {
    #[serde(default)]
    code: i32,
    #[serde(default, borrow)]
    message: Cow<'a, str>,
}

#[derive(Serialize)]
struct WireFrameOut<'a> {
    v: i32,
    #[serde(skip_serializing_if = "str::is_empty")]
    src: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    dst: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    tag: &'a str,
    id: i64,
    #[serde(skip_serializing_if = "str::is_empty")]
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireErrorOut<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a RawValue>,
}

#[derive(Serialize)]
struct WireErrorOut<'a> {
    code: i32,
    #[serde(skip_serializing_if = "str::is_empty")]
    message: &'a str,
}

// ── Tests ────────────────────────────────────────────────────
