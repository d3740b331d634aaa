//! Re-expose one object of a D-Bus service, living on one bus, under a
//! well known name on another bus.
//!
//! Method calls and property accesses made on the target bus are forwarded
//! to the source service and the replies relayed back. Signals the source
//! object emits are re-emitted on the target bus.
#[macro_use]
extern crate serde_derive;

pub mod backend;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod error;
pub mod forward;
pub mod name;
pub mod registration;
pub mod relay;
pub mod subscription;
pub mod xml;

pub use backend::{DBusConnection, DBusConnector};
pub use catalog::Catalog;
pub use config::{BusSelector, ErrorPolicy, Params, ProxyConfig, Settings};
pub use error::{Error, Result};
pub use relay::{Relay, State};
