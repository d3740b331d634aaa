use crate::{
    bus::{Connection, Events, NameRequestId},
    error::{Error, Result},
};
use log::{error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameState {
    /// Not requested yet, or released.
    Idle,
    /// Requested, no answer yet.
    Pending,
    Acquired,
    /// Denied or taken away. The relay keeps serving under its unique name.
    Lost(String),
}

/// Owns the proxy name on the target connection.
pub struct NameOwner {
    con: Arc<dyn Connection>,
    name: String,
    request: Option<NameRequestId>,
    state: NameState,
}

impl NameOwner {
    pub fn new(con: Arc<dyn Connection>, name: impl Into<String>) -> Self {
        NameOwner {
            con,
            name: name.into(),
            request: None,
            state: NameState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &NameState {
        &self.state
    }

    /// Start owning the name. The outcome is reported through `events`.
    pub fn request(&mut self, events: &Events) -> Result<()> {
        if self.request.is_some() {
            return Ok(());
        }
        info!("acquiring bus name {}", self.name);
        let id = self
            .con
            .own_name(&self.name, events.clone())
            .map_err(|e| Error::NameOwnership {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        self.request = Some(id);
        self.state = NameState::Pending;
        Ok(())
    }

    pub fn acquired(&mut self, name: &str) {
        if name != self.name || self.request.is_none() {
            return;
        }
        if self.state != NameState::Acquired {
            info!("acquired bus name {}", name);
            self.state = NameState::Acquired;
        }
    }

    pub fn lost(&mut self, name: &str, reason: &str) {
        if name != self.name || self.request.is_none() {
            return;
        }
        let e = Error::NameOwnership {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };
        match &self.state {
            NameState::Lost(_) => warn!("{}", e),
            _ => error!(
                "{}, still serving as {:?}",
                e,
                self.con.unique_name()
            ),
        }
        self.state = NameState::Lost(reason.to_owned());
    }

    /// Give the name back. Does nothing if it was never requested.
    pub fn release(&mut self) {
        if let Some(id) = self.request.take() {
            info!("releasing bus name {}", self.name);
            if let Err(e) = self.con.release_name(id) {
                warn!("failed to release {}: {}", self.name, e);
            }
            self.state = NameState::Idle;
        }
    }
}

impl Drop for NameOwner {
    fn drop(&mut self) {
        self.release()
    }
}
