//! Dispatch loop.
//!
//! Pulls events from the source, wraps each in a handler built by the
//! factory, and hands the handler to the configured strategy. Runs until the
//! alive flag clears (or an optional event budget is spent), then shuts the
//! strategy and the source down in that order.

use crate::config::Config;
use crate::protocols::http::{DropHandlerFactory, PathResolver};
use crate::runtime::{
    EventSource, HandlerFactory, SourceKind, SourceOptions, Strategy, TaskHandle,
};
use crate::sync::AliveFlag;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Server instance
pub struct Server {
    source: EventSource,
    strategy: Strategy,
    factory: Box<dyn HandlerFactory>,
    alive: AliveFlag,
    drain_timeout: Duration,
    in_flight: Vec<TaskHandle>,
}

impl Server {
    pub fn new(
        source: EventSource,
        strategy: Strategy,
        factory: Box<dyn HandlerFactory>,
        drain_timeout: Duration,
    ) -> Self {
        let alive = source.context().alive.clone();
        Self {
            source,
            strategy,
            factory,
            alive,
            drain_timeout,
            in_flight: Vec::new(),
        }
    }

    /// Bind the listener, start the strategy and build the drop handler
    /// factory from `config`.
    pub fn from_config(config: &Config, alive: AliveFlag) -> io::Result<Self> {
        let source = EventSource::bind(
            SourceOptions {
                name: "sdrop".to_string(),
                kind: SourceKind::Stream,
                address: config.listen,
                backlog: config.backlog,
                timeout: config.accept_timeout,
                conn_timeout: config.conn_timeout,
                ..SourceOptions::default()
            },
            alive.clone(),
        )?;

        let strategy = Strategy::new(config.scheduler.into(), config.threads, alive)?;

        let resolver = Arc::new(PathResolver::new(&config.root, config.isolate));
        let factory = DropHandlerFactory::new(resolver, config.idle_timeout);

        Ok(Self::new(
            source,
            strategy,
            Box::new(factory),
            config.drain_timeout,
        ))
    }

    pub fn alive(&self) -> AliveFlag {
        self.alive.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.source.local_addr()
    }

    /// Serve until interrupted, or until `max_events` events have been
    /// dispatched and finished. Returns the number of events dispatched.
    pub fn run(mut self, max_events: Option<usize>) -> usize {
        let name = self.source.context().name.clone();
        match self.local_addr() {
            Some(addr) => info!(
                name = %name,
                addr = %addr,
                strategy = self.strategy.name(),
                "Started server"
            ),
            None => info!(name = %name, strategy = self.strategy.name(), "Started server"),
        }

        let mut dispatched = 0;
        loop {
            if max_events.is_some_and(|max| dispatched >= max) {
                self.wait_in_flight();
                break;
            }
            let Some(event) = self.source.next() else {
                break;
            };

            if let Some(peer) = event.remote() {
                debug!(peer = %peer, "Dispatching event");
            }
            let handler = self.factory.handler(event);

            self.in_flight.retain(|handle| !handle.is_finished());
            self.in_flight.push(self.strategy.dispatch(handler, &self.alive));
            dispatched += 1;
        }

        info!(name = %name, dispatched, "Closing server");
        self.shutdown();
        dispatched
    }

    /// Give dispatched work up to the drain timeout to finish on its own.
    fn wait_in_flight(&mut self) {
        let deadline = Instant::now().checked_add(self.drain_timeout);
        for handle in self.in_flight.drain(..) {
            let left = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if handle.wait(left).is_none() {
                warn!("In-flight work still running after drain timeout");
                break;
            }
        }
    }

    fn shutdown(self) {
        self.alive.kill();
        self.strategy.shutdown(self.drain_timeout);
        self.source.shutdown();
    }
}
