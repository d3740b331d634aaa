//! Error types for the relay.

use crate::bus::{BusError, RemoteError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A bus could not be reached or dropped while running.
    #[error("connection to {bus} bus failed: {reason}")]
    Connection { bus: String, reason: String },

    /// The source service could not be introspected, or returned garbage.
    #[error("introspection of {service} at {path} failed: {reason}")]
    Introspection {
        service: String,
        path: String,
        reason: String,
    },

    #[error("failed to register interface {interface}: {source}")]
    Registration {
        interface: String,
        #[source]
        source: BusError,
    },

    #[error("failed to subscribe to {label}: {source}")]
    Subscription {
        label: String,
        #[source]
        source: BusError,
    },

    #[error("forwarded call {interface}.{method} failed: {source}")]
    ForwardCall {
        interface: String,
        method: String,
        #[source]
        source: RemoteError,
    },

    #[error("property {interface}.{property}: {source}")]
    Property {
        interface: String,
        property: String,
        #[source]
        source: RemoteError,
    },

    #[error("failed to emit {interface}.{signal}: {source}")]
    SignalEmit {
        interface: String,
        signal: String,
        #[source]
        source: BusError,
    },

    #[error("could not own {name}: {reason}")]
    NameOwnership { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that must stop the relay during startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::Introspection { .. }
                | Error::Registration { .. }
                | Error::Config(_)
        )
    }
}
