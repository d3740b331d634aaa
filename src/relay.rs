//! Sequences startup and shutdown of the relay and runs its event loop.

use crate::{
    bus::{Connection, Connector, Events, Inbound, RemoteError},
    catalog::Catalog,
    config::ProxyConfig,
    error::{Error, Result},
    forward::Forwarder,
    name::{NameOwner, NameState},
    registration::Registrations,
    subscription::Subscriptions,
};
use futures::{
    channel::mpsc::{self, UnboundedReceiver},
    pin_mut,
    prelude::*,
    select_biased,
};
use log::{debug, error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Connected,
    Introspected,
    Registered,
    Subscribed,
    /// The name was requested. Whether it was granted does not matter here.
    NamedOrDegraded,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Relay {
    config: ProxyConfig,
    state: State,
    events_tx: Events,
    events: Option<UnboundedReceiver<Inbound>>,
    source: Option<Arc<dyn Connection>>,
    target: Option<Arc<dyn Connection>>,
    catalog: Option<Arc<Catalog>>,
    registrations: Option<Registrations>,
    subscriptions: Option<Subscriptions>,
    name: Option<NameOwner>,
    forwarder: Option<Forwarder>,
}

impl Relay {
    pub fn new(config: ProxyConfig) -> Self {
        let (events_tx, events) = mpsc::unbounded();
        Relay {
            config,
            state: State::Created,
            events_tx,
            events: Some(events),
            source: None,
            target: None,
            catalog: None,
            registrations: None,
            subscriptions: None,
            name: None,
            forwarder: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_deref()
    }

    pub fn registrations(&self) -> Option<&Registrations> {
        self.registrations.as_ref()
    }

    pub fn subscriptions(&self) -> Option<&Subscriptions> {
        self.subscriptions.as_ref()
    }

    pub fn name_state(&self) -> Option<&NameState> {
        self.name.as_ref().map(|n| n.state())
    }

    /// Connect both buses, introspect the source, register, subscribe and
    /// request the proxy name, in that order.
    ///
    /// If any step before the name request fails, whatever was already set
    /// up is torn down again and the error returned.
    pub async fn start<C: Connector + ?Sized>(&mut self, connector: &C) -> Result<()> {
        if self.state != State::Created {
            return Err(Error::Config(format!(
                "relay can not be started in state {:?}",
                self.state
            )));
        }
        match self.startup(connector).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("startup failed in state {:?}: {}", self.state, e);
                self.shutdown();
                Err(e)
            }
        }
    }

    async fn startup<C: Connector + ?Sized>(&mut self, connector: &C) -> Result<()> {
        let service = self.config.source_bus_name().to_owned();
        let path = self.config.source_object_path().to_owned();

        let source = connector
            .connect(self.config.source_bus(), self.events_tx.clone())
            .await?;
        info!(
            "connected to source bus ({}) as {:?}",
            self.config.source_bus(),
            source.unique_name()
        );
        self.source = Some(Arc::clone(&source));
        let target = connector
            .connect(self.config.target_bus(), self.events_tx.clone())
            .await?;
        info!(
            "connected to target bus ({}) as {:?}",
            self.config.target_bus(),
            target.unique_name()
        );
        self.target = Some(Arc::clone(&target));
        self.state = State::Connected;

        let catalog = Arc::new(
            Catalog::introspect(&*source, &service, &path, self.config.call_timeout()).await?,
        );
        info!("{} interfaces found on {} {}", catalog.len(), service, path);
        self.catalog = Some(Arc::clone(&catalog));
        self.state = State::Introspected;

        let mut registrations = Registrations::new(Arc::clone(&target), path.as_str());
        registrations.register_catalog(&catalog, &self.events_tx)?;
        self.registrations = Some(registrations);
        self.forwarder = Some(Forwarder::new(
            &self.config,
            Arc::clone(&source),
            Arc::clone(&target),
            Arc::clone(&catalog),
        ));
        self.state = State::Registered;

        let mut subscriptions = Subscriptions::new(Arc::clone(&source), service.as_str(), path.as_str());
        subscriptions.subscribe_catalog(&catalog, &self.events_tx).await;
        self.subscriptions = Some(subscriptions);
        self.state = State::Subscribed;

        let mut name = NameOwner::new(Arc::clone(&target), self.config.proxy_bus_name());
        if let Err(e) = name.request(&self.events_tx) {
            error!("{}, serving as {:?} only", e, target.unique_name());
        }
        self.name = Some(name);
        self.state = State::NamedOrDegraded;
        info!(
            "relaying {} {} from the {} bus to the {} bus as {}",
            service,
            path,
            self.config.source_bus(),
            self.config.target_bus(),
            self.config.proxy_bus_name()
        );
        Ok(())
    }

    /// Handle one event from either connection.
    pub async fn handle(&mut self, event: Inbound) {
        match event {
            Inbound::Call(inv) => match &self.forwarder {
                Some(forwarder) => forwarder.dispatch(inv).await,
                None => inv.return_error(RemoteError::failed("the relay is not running")),
            },
            Inbound::Signal(signal) => match &self.forwarder {
                Some(forwarder) => forwarder.signal_received(signal),
                None => debug!("dropping signal {}.{}", signal.interface, signal.member),
            },
            Inbound::NameAcquired(name) => {
                if let Some(owner) = self.name.as_mut() {
                    owner.acquired(&name)
                }
            }
            Inbound::NameLost { name, reason } => {
                if let Some(owner) = self.name.as_mut() {
                    owner.lost(&name, &reason)
                }
            }
            Inbound::ConnectionLost { bus, reason } => {
                warn!("connection to {} bus lost: {}", bus, reason)
            }
        }
    }

    /// Dispatch events until `shutdown` completes or a bus connection is
    /// lost, then shut down. Losing a connection is returned as an error.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        if self.state != State::NamedOrDegraded {
            return Err(Error::Config(format!(
                "relay can not run in state {:?}",
                self.state
            )));
        }
        let mut events = match self.events.take() {
            Some(events) => events,
            None => return Ok(()),
        };
        self.state = State::Running;
        info!("relay running");
        let shutdown = shutdown.fuse();
        pin_mut!(shutdown);
        let result = loop {
            let event = select_biased! {
                () = shutdown => break Ok(()),
                event = events.next() => event,
            };
            match event {
                None => break Ok(()),
                Some(Inbound::ConnectionLost { bus, reason }) => {
                    break Err(Error::Connection { bus, reason })
                }
                Some(event) => self.handle(event).await,
            }
        };
        if let Err(e) = &result {
            error!("{}", e);
        }
        self.shutdown();
        result
    }

    /// Unsubscribe, unregister, release the name and disconnect. Every step
    /// runs even if an earlier one failed. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        match self.state {
            State::Stopped => return,
            State::Created if self.source.is_none() => {
                self.state = State::Stopped;
                return;
            }
            _ => (),
        }
        info!("shutting down");
        self.state = State::ShuttingDown;
        if let Some(mut subscriptions) = self.subscriptions.take() {
            let n = subscriptions.clear();
            debug!("dropped {} signal subscriptions", n);
        }
        if let Some(mut registrations) = self.registrations.take() {
            let n = registrations.clear();
            debug!("unregistered {} interfaces", n);
        }
        if let Some(mut name) = self.name.take() {
            name.release();
        }
        self.forwarder = None;
        for con in [self.source.take(), self.target.take()].into_iter().flatten() {
            con.close();
        }
        self.state = State::Stopped;
        info!("stopped");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown()
    }
}
