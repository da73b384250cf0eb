use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::commands::CommandProcessor;
use crate::config::Config;
use crate::dispatcher::{HandlerContext, MessageDispatcher};
use crate::platform::{ChatSink, InboundEventQueue};
use crate::registry::OnlineServerRegistry;
use crate::relay::{self, EventFilter, Route};
use crate::transport::Transport;

/// How long to sleep after a pass that took `elapsed`. Never negative; an
/// overrun starts the next pass immediately.
pub fn sleep_duration(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Resolved settings the loop needs from the configuration
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub general_channel: u64,
    pub command_prefix: String,
    pub owner_id: Option<u64>,
    pub tick_period: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            general_channel: config.discord.general_channel_id,
            command_prefix: config.discord.command_prefix.clone(),
            owner_id: config.discord.owner_id,
            tick_period: config.relay.tick_period(),
        }
    }
}

/// The relay core. Owns all state except the inbound queue's producers and
/// runs every pass on one thread.
pub struct EventLoop<T: Transport> {
    transport: T,
    dispatcher: MessageDispatcher,
    registry: OnlineServerRegistry,
    queue: InboundEventQueue,
    chat: Box<dyn ChatSink>,
    filter: EventFilter,
    commands: CommandProcessor,
    general_channel: u64,
    tick_period: Duration,
    tick: u64,
}

impl<T: Transport + 'static> EventLoop<T> {
    pub fn new(
        transport: T,
        dispatcher: MessageDispatcher,
        queue: InboundEventQueue,
        chat: Box<dyn ChatSink>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            registry: OnlineServerRegistry::new(),
            queue,
            chat,
            filter: EventFilter::new(settings.general_channel, settings.command_prefix.clone()),
            commands: CommandProcessor::new(settings.command_prefix, settings.owner_id),
            general_channel: settings.general_channel,
            tick_period: settings.tick_period,
            tick: 0,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &OnlineServerRegistry {
        &self.registry
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("relay-tick".to_string())
            .spawn(move || self.run())
            .context("Failed to spawn relay thread")
    }

    /// Tick forever at a fixed period.
    pub fn run(mut self) {
        info!("Relay loop running every {:?}", self.tick_period);
        loop {
            let start = Instant::now();
            self.spin_once();
            let pause = sleep_duration(self.tick_period, start.elapsed());
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }

    /// One full pass. Errors and panics are logged, never propagated.
    pub fn spin_once(&mut self) {
        self.tick += 1;
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_pass())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error in relay event loop: {:#}", e),
            Err(_) => error!("Relay pass {} panicked", self.tick),
        }
    }

    fn process_pass(&mut self) -> Result<()> {
        self.drain_network()?;
        self.drain_platform()
    }

    fn drain_network(&mut self) -> Result<()> {
        let frames = self
            .transport
            .poll()
            .context("Failed to poll game servers")?;

        for frame in &frames {
            let mut ctx = HandlerContext {
                registry: &mut self.registry,
                chat: self.chat.as_ref(),
                transport: &mut self.transport,
                general_channel: self.general_channel,
                origin: frame.connection,
                tick: self.tick,
            };
            if let Err(e) = self.dispatcher.dispatch(frame, &mut ctx) {
                warn!(
                    "Dropping message from connection {}: {:#}",
                    frame.connection, e
                );
            }
        }
        Ok(())
    }

    fn drain_platform(&mut self) -> Result<()> {
        for event in self.queue.drain_all() {
            match self.filter.route(event) {
                Route::Relay(chat) => {
                    relay::broadcast_chat(&mut self.transport, &chat)
                        .context("Failed to relay Discord message")?;
                }
                Route::Command(message) => {
                    if let Err(e) = self.commands.handle(
                        &message,
                        &self.registry,
                        self.chat.as_ref(),
                        &mut self.transport,
                    ) {
                        warn!("Command '{}' failed: {:#}", message.content, e);
                    }
                }
                Route::Drop(reason) => debug!("Not relaying Discord event: {:?}", reason),
            }
        }
        Ok(())
    }
}
