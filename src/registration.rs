//! Registers the relayed interfaces on the target connection.

use crate::{
    bus::{Connection, Events, RegistrationId, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE},
    catalog::Catalog,
    error::{Error, Result},
};
use fxhash::FxHashMap;
use log::{debug, info, warn};
use std::sync::Arc;

/// One interface registered at the relayed path. Unregistered on drop.
pub struct RegistrationRecord {
    interface: String,
    id: RegistrationId,
    con: Option<Arc<dyn Connection>>,
}

impl RegistrationRecord {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Unregister now. Returns false if the connection refused.
    pub fn release(mut self) -> bool {
        self.unregister()
    }

    fn unregister(&mut self) -> bool {
        match self.con.take() {
            None => true,
            Some(con) => match con.unregister_object(self.id) {
                Ok(()) => {
                    debug!("unregistered {}", self.interface);
                    true
                }
                Err(e) => {
                    warn!("failed to unregister {}: {}", self.interface, e);
                    false
                }
            },
        }
    }
}

impl Drop for RegistrationRecord {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// The registration table, one record per interface name.
pub struct Registrations {
    con: Arc<dyn Connection>,
    path: String,
    records: FxHashMap<String, RegistrationRecord>,
}

impl Registrations {
    pub fn new(con: Arc<dyn Connection>, path: impl Into<String>) -> Self {
        Registrations {
            con,
            path: path.into(),
            records: FxHashMap::default(),
        }
    }

    /// Register `interface`, replacing any earlier registration of it.
    pub fn register(&mut self, interface: &str, events: &Events) -> Result<RegistrationId> {
        if let Some(stale) = self.records.remove(interface) {
            debug!("replacing registration of {}", interface);
            stale.release();
        }
        let id = self
            .con
            .register_object(&self.path, interface, events.clone())
            .map_err(|source| Error::Registration {
                interface: interface.to_owned(),
                source,
            })?;
        self.records.insert(
            interface.to_owned(),
            RegistrationRecord {
                interface: interface.to_owned(),
                id,
                con: Some(Arc::clone(&self.con)),
            },
        );
        Ok(id)
    }

    /// Register every interface of `catalog`, plus the properties and
    /// introspection interfaces the relay always answers.
    ///
    /// Any failure is fatal: everything registered so far is unregistered
    /// again and the error returned.
    pub fn register_catalog(&mut self, catalog: &Catalog, events: &Events) -> Result<usize> {
        let mut names: Vec<&str> = catalog.interfaces().iter().map(|i| i.name.as_str()).collect();
        for standard in [PROPERTIES_INTERFACE, INTROSPECTABLE_INTERFACE] {
            if !names.contains(&standard) {
                names.push(standard);
            }
        }
        for name in names {
            info!("registering interface {} at {}", name, self.path);
            if let Err(e) = self.register(name, events) {
                self.clear();
                return Err(e);
            }
        }
        Ok(self.records.len())
    }

    /// Unregister everything. Failures are logged, the rest still proceeds.
    /// Returns the number of interfaces that unregistered cleanly.
    pub fn clear(&mut self) -> usize {
        self.records
            .drain()
            .map(|(_, record)| record.release())
            .filter(|ok| *ok)
            .count()
    }

    pub fn get(&self, interface: &str) -> Option<&RegistrationRecord> {
        self.records.get(interface)
    }

    pub fn contains(&self, interface: &str) -> bool {
        self.records.contains_key(interface)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Drop for Registrations {
    fn drop(&mut self) {
        self.clear();
    }
}
