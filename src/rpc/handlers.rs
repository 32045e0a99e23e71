//! Handler registry — method name → handler, plus the global prehandler.

use std::rc::Rc;

use log::info;
use serde_json::value::RawValue;

use super::channel::FrameInfo;
use super::engine::RequestInfo;

/// Services one inbound request.
///
/// The handler owns `ri` and must eventually consume it with one of the
/// `send_*` methods, or with [`RequestInfo::free`] for fire-and-forget
/// methods. It may also stash `ri` and respond later on the same thread.
/// `fi` and `args` are only valid for the duration of the call.
pub trait Handler {
    fn handle(&self, ri: RequestInfo, fi: &FrameInfo<'_>, args: Option<&RawValue>);
}

impl<F> Handler for F
where
    F: Fn(RequestInfo, &FrameInfo<'_>, Option<&RawValue>),
{
    fn handle(&self, ri: RequestInfo, fi: &FrameInfo<'_>, args: Option<&RawValue>) {
        self(ri, fi, args);
    }
}

/// Runs before every registered handler.
///
/// Returning `Some(ri)` hands the request on to the method handler.
/// Returning `None` stops processing: the prehandler has taken ownership
/// of the request-info and is responsible for answering, keeping or
/// dropping it. The engine sends nothing on its behalf.
pub trait Prehandler {
    fn pre_handle(
        &self,
        ri: RequestInfo,
        fi: &FrameInfo<'_>,
        args: Option<&RawValue>,
    ) -> Option<RequestInfo>;
}

impl<F> Prehandler for F
where
    F: Fn(RequestInfo, &FrameInfo<'_>, Option<&RawValue>) -> Option<RequestInfo>,
{
    fn pre_handle(
        &self,
        ri: RequestInfo,
        fi: &FrameInfo<'_>,
        args: Option<&RawValue>,
    ) -> Option<RequestInfo> {
        self(ri, fi, args)
    }
}

/// One registered method.
#[derive(Clone)]
pub struct HandlerEntry {
    pub method: String,
    /// Describes the expected argument shape. Informational only.
    pub args_fmt: String,
    pub handler: Rc<dyn Handler>,
}

/// Methods in registration order, plus the single prehandler slot.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    prehandler: Option<Rc<dyn Prehandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`. A second registration for the same
    /// method replaces the first; returns `true` when that happened.
    pub fn add(&mut self, method: &str, args_fmt: &str, handler: Rc<dyn Handler>) -> bool {
        let entry = HandlerEntry {
            method: method.to_owned(),
            args_fmt: args_fmt.to_owned(),
            handler,
        };
        if let Some(existing) = self.entries.iter_mut().find(|e| e.method == method) {
            info!("RPC: replacing handler for {}", method);
            *existing = entry;
            true
        } else {
            self.entries.push(entry);
            false
        }
    }

    pub fn lookup(&self, method: &str) -> Option<&HandlerEntry> {
        self.entries.iter().find(|e| e.method == method)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.method.clone()).collect()
    }

    /// Install (or with `None`, clear) the prehandler. Last one wins.
    pub fn set_prehandler(&mut self, prehandler: Option<Rc<dyn Prehandler>>) {
        self.prehandler = prehandler;
    }

    pub fn prehandler(&self) -> Option<Rc<dyn Prehandler>> {
        self.prehandler.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
