//! Transport-agnostic RPC subsystem.
//!
//! JSON request/response dispatch between any number of frame-oriented
//! channels, with learned peer routing and per-request ownership.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RPC Stack                             │
//! │                                                            │
//! │  ┌──────────┐   ┌──────────┐   ┌───────────────────────┐   │
//! │  │ Channel  │──▶│  Frame   │──▶│  Engine (dispatcher)  │   │
//! │  │ (trait)  │   │ (parse)  │   │  → Handler registry   │   │
//! │  └──────────┘   └──────────┘   └───────────────────────┘   │
//! │       ▲                                    │               │
//! │       │              ┌─────────────────────┘               │
//! │       │              ▼                                     │
//! │  ┌──────────┐   ┌──────────┐                               │
//! │  │ Channel  │◀──│ Pending  │   (outbound calls awaiting    │
//! │  │ (send)   │   │  calls   │    their responses)           │
//! │  └──────────┘   └──────────┘                               │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod engine;
pub mod frame;
pub mod handlers;
pub mod pending;
