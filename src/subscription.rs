//! Subscribes to the relayed object's signals on the source connection.

use crate::{
    bus::{Connection, Events, SignalFilter, SubscriptionId, PROPERTIES_CHANGED, PROPERTIES_INTERFACE},
    catalog::Catalog,
    error::{Error, Result},
};
use log::{debug, info, warn};
use std::sync::Arc;

/// One live signal subscription. Unsubscribed on drop.
pub struct SubscriptionRecord {
    label: String,
    id: SubscriptionId,
    con: Option<Arc<dyn Connection>>,
}

impl SubscriptionRecord {
    /// `interface.signal`
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn release(mut self) -> bool {
        self.unsubscribe()
    }

    fn unsubscribe(&mut self) -> bool {
        match self.con.take() {
            None => true,
            Some(con) => match con.unsubscribe_signal(self.id) {
                Ok(()) => {
                    debug!("unsubscribed {}", self.label);
                    true
                }
                Err(e) => {
                    warn!("failed to unsubscribe {}: {}", self.label, e);
                    false
                }
            },
        }
    }
}

impl Drop for SubscriptionRecord {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

pub struct Subscriptions {
    con: Arc<dyn Connection>,
    service: String,
    path: String,
    records: Vec<SubscriptionRecord>,
}

impl Subscriptions {
    pub fn new(con: Arc<dyn Connection>, service: impl Into<String>, path: impl Into<String>) -> Self {
        Subscriptions {
            con,
            service: service.into(),
            path: path.into(),
            records: Vec::new(),
        }
    }

    fn filter(&self, interface: &str, member: &str) -> SignalFilter {
        SignalFilter {
            sender: self.service.clone(),
            path: self.path.clone(),
            interface: interface.to_owned(),
            member: member.to_owned(),
        }
    }

    /// Subscribe to one signal. A previous subscription with the same label
    /// is dropped first.
    pub async fn subscribe(
        &mut self,
        interface: &str,
        member: &str,
        events: &Events,
    ) -> Result<SubscriptionId> {
        let filter = self.filter(interface, member);
        let label = filter.label();
        if let Some(i) = self.records.iter().position(|r| r.label == label) {
            debug!("replacing subscription to {}", label);
            self.records.remove(i).release();
        }
        let id = self
            .con
            .subscribe_signal(&filter, events.clone())
            .await
            .map_err(|source| Error::Subscription {
                label: label.clone(),
                source,
            })?;
        self.records.push(SubscriptionRecord {
            label,
            id,
            con: Some(Arc::clone(&self.con)),
        });
        Ok(id)
    }

    /// Subscribe to every signal in `catalog` and to `PropertiesChanged`.
    ///
    /// A rejected subscription is logged and skipped. Returns the number of
    /// live subscriptions.
    pub async fn subscribe_catalog(&mut self, catalog: &Catalog, events: &Events) -> usize {
        let wanted = catalog
            .interfaces()
            .iter()
            .filter(|i| i.name != PROPERTIES_INTERFACE)
            .flat_map(|i| i.signals.iter().map(move |s| (i.name.as_str(), s.name.as_str())))
            .chain(std::iter::once((PROPERTIES_INTERFACE, PROPERTIES_CHANGED)));
        for (interface, member) in wanted {
            debug!("subscribing to {}.{}", interface, member);
            if let Err(e) = self.subscribe(interface, member, events).await {
                warn!("{}, signal will not be relayed", e);
            }
        }
        info!("{} signal subscriptions on {}", self.records.len(), self.service);
        self.records.len()
    }

    /// Drop every subscription. Safe to call more than once.
    pub fn clear(&mut self) -> usize {
        self.records
            .drain(..)
            .map(SubscriptionRecord::release)
            .filter(|ok| *ok)
            .count()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.label())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}
