//! The request proxy: an in-process interceptor that can rewrite an
//! outgoing message or answer it locally, preserving the illusion of an
//! ordinary kernel round trip.
//!
//! Handlers are pure with respect to the socket core: they see the
//! decoded request and return a [`Verdict`]; injecting synthetic
//! responses into the right backlog is the socket's job.

use crate::core::msg::Msg;
use crate::{KernelError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler decided about one outgoing message.
pub enum Verdict {
    /// Send the original bytes to the kernel.
    Forward,
    /// Send these bytes instead.
    Rewrite(Vec<u8>),
    /// Do not touch the kernel; feed these messages into the backlog
    /// under the request's sequence number.
    Respond(Vec<Msg>),
    /// Fail the request as if the kernel had returned this error.
    Fail(KernelError),
}

/// An interception routine for one message type. Returning `Ok(None)`
/// declines the message and lets other handlers (or the kernel) have it.
pub trait ProxyHandler: Send + Sync {
    fn handle(&self, msg: &Msg) -> Result<Option<Verdict>>;
}

/// A registry of handlers keyed by message type.
#[derive(Default)]
pub struct Proxy {
    handlers: HashMap<u16, Vec<Arc<dyn ProxyHandler>>>,
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, msg_type: u16, handler: Arc<dyn ProxyHandler>) {
        self.handlers.entry(msg_type).or_default().push(handler);
    }

    /// Offer `msg` to the handlers registered for its type; the first
    /// one that accepts it decides.
    pub fn intercept(&self, msg: &Msg) -> Result<Option<Verdict>> {
        let Some(handlers) = self.handlers.get(&msg.header.typ) else {
            return Ok(None);
        };
        for handler in handlers {
            if let Some(verdict) = handler.handle(msg)? {
                return Ok(Some(verdict));
            }
        }
        Ok(None)
    }
}
