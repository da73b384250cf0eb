use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::platform::ChatSink;
use crate::protocol::{Envelope, PolychatMessage};
use crate::registry::{OnlineServer, OnlineServerRegistry, ServerUpdate};
use crate::transport::{ConnectionId, Frame, Transport};

/// Everything a handler may touch while processing one message.
pub struct HandlerContext<'a> {
    pub registry: &'a mut OnlineServerRegistry,
    pub chat: &'a dyn ChatSink,
    pub transport: &'a mut dyn Transport,
    pub general_channel: u64,
    /// Connection the message arrived on
    pub origin: ConnectionId,
    pub tick: u64,
}

impl HandlerContext<'_> {
    /// Upsert a registry entry and stamp it with the current tick.
    pub fn upsert(&mut self, server_id: &str, update: ServerUpdate) -> &OnlineServer {
        let update = ServerUpdate {
            last_seen_tick: Some(self.tick),
            ..update
        };
        let server = self.registry.upsert(server_id, update);
        debug!("Server {} seen at tick {}", server.id, server.last_seen_tick);
        server
    }

    /// Record that `server_id` was heard from without changing anything else.
    pub fn touch(&mut self, server_id: &str) -> &OnlineServer {
        self.upsert(server_id, ServerUpdate::default())
    }

    pub fn post_general(&self, text: &str) -> Result<()> {
        self.chat.post(self.general_channel, text)
    }
}

/// Handles one message type.
pub trait MessageHandler: Send {
    type Message: PolychatMessage;

    fn handle(&mut self, message: &Self::Message, ctx: &mut HandlerContext<'_>) -> Result<()>;
}

type Decoder = fn(&Envelope) -> Result<Box<dyn Any>>;
type ErasedHandler = Box<dyn FnMut(&dyn Any, &mut HandlerContext<'_>) -> Result<()> + Send>;

fn decode<M: PolychatMessage>(envelope: &Envelope) -> Result<Box<dyn Any>> {
    Ok(Box::new(envelope.unpack::<M>()?))
}

struct Route {
    decode: Decoder,
    handlers: Vec<(&'static str, ErasedHandler)>,
}

/// Collects handlers during startup. Registration order is invocation order.
#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<String, Route>,
}

impl DispatcherBuilder {
    pub fn register<H>(mut self, mut handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        let name = std::any::type_name::<H>();
        let erased: ErasedHandler = Box::new(
            move |message: &dyn Any, ctx: &mut HandlerContext<'_>| {
                let message = message
                    .downcast_ref::<H::Message>()
                    .with_context(|| format!("{} received a foreign message type", name))?;
                handler.handle(message, ctx)
            },
        );

        self.routes
            .entry(H::Message::TYPE.to_string())
            .or_insert_with(|| Route {
                decode: decode::<H::Message>,
                handlers: Vec::new(),
            })
            .handlers
            .push((name, erased));
        debug!("Registered {} for '{}'", name, H::Message::TYPE);
        self
    }

    pub fn build(self) -> MessageDispatcher {
        MessageDispatcher {
            routes: self.routes,
        }
    }
}

/// Routes frames to handlers by envelope type tag. Fixed once built.
pub struct MessageDispatcher {
    routes: HashMap<String, Route>,
}

impl MessageDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    #[cfg(test)]
    pub fn handler_count(&self, type_tag: &str) -> usize {
        self.routes
            .get(type_tag)
            .map(|route| route.handlers.len())
            .unwrap_or(0)
    }

    /// Decode `frame` and run every handler registered for its type.
    ///
    /// Returns the number of handlers invoked. A decode failure is returned as
    /// an error; a handler that fails or panics is logged and the remaining
    /// ones still run.
    pub fn dispatch(&mut self, frame: &Frame, ctx: &mut HandlerContext<'_>) -> Result<usize> {
        let envelope = Envelope::from_bytes(&frame.bytes)?;

        let route = match self.routes.get_mut(&envelope.type_tag) {
            Some(route) => route,
            None => {
                debug!(
                    "No handler for '{}' from connection {}, dropping",
                    envelope.type_tag, frame.connection
                );
                return Ok(0);
            }
        };

        let message = (route.decode)(&envelope)?;
        for (name, handler) in route.handlers.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&*message, &mut *ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} failed on '{}': {:#}", name, envelope.type_tag, e),
                Err(_) => error!("{} panicked on '{}'", name, envelope.type_tag),
            }
        }
        Ok(route.handlers.len())
    }
}
