//! The connection capability the relay is built on.
//!
//! Everything the relay needs from a bus session is expressed by the
//! [`Connection`] trait: calls, signal emission, object registration,
//! signal subscription and name ownership. Inbound traffic (method calls
//! addressed to registered objects, subscribed signals, name ownership
//! changes) is delivered as [`Inbound`] events on a channel handed to the
//! connection when the registration or subscription is made.

use crate::{config::BusSelector, error::Result};
use dbus::arg::messageitem::MessageItem;
use futures::{channel::mpsc::UnboundedSender, future::BoxFuture};
use log::warn;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";

/// The arguments of a message, in order.
pub type Body = Vec<MessageItem>;

/// Signature string of a message body, e.g. `"si"`.
pub fn body_signature(body: &[MessageItem]) -> String {
    body.iter().map(|item| item.signature().to_string()).collect()
}

/// An error returned by (or on behalf of) the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ERROR_FAILED, message)
    }
}

/// Local failures of a connection.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("invalid {kind} {value:?}: {reason}")]
    InvalidName {
        kind: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown handle {0}")]
    UnknownHandle(u64),
    #[error("message could not be sent")]
    Send,
    #[error("rejected by the bus: {0}")]
    Rejected(#[from] RemoteError),
}

/// An outbound method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Body,
}

/// A signal, either received from a bus or about to be emitted on one.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    /// Unique name of the emitter. Ignored when emitting.
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Body,
}

/// Selects which signals a subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl SignalFilter {
    /// `interface.signal`
    pub fn label(&self) -> String {
        format!("{}.{}", self.interface, self.member)
    }

    pub fn matches(&self, path: &str, interface: &str, member: &str) -> bool {
        self.path == path && self.interface == interface && self.member == member
    }
}

/// Sends the reply to an inbound method call.
pub trait Responder: Send {
    fn respond(self: Box<Self>, outcome: std::result::Result<Body, RemoteError>);
}

/// One inbound method call waiting for its reply.
///
/// The token is resolved by value, so it can be resolved only once. If it is
/// dropped unresolved the caller receives a `Failed` error.
pub struct Invocation {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Body,
    responder: Option<Box<dyn Responder>>,
}

impl Invocation {
    pub fn new(
        sender: Option<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Body,
        responder: Box<dyn Responder>,
    ) -> Self {
        Invocation {
            sender,
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body,
            responder: Some(responder),
        }
    }

    pub fn resolve(mut self, outcome: std::result::Result<Body, RemoteError>) {
        if let Some(responder) = self.responder.take() {
            responder.respond(outcome)
        }
    }

    pub fn return_value(self, body: Body) {
        self.resolve(Ok(body))
    }

    pub fn return_error(self, error: RemoteError) {
        self.resolve(Err(error))
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            warn!(
                "call {}.{} from {:?} dropped without a reply",
                self.interface, self.member, self.sender
            );
            responder.respond(Err(RemoteError::failed("the relay abandoned this call")))
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("sender", &self.sender)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("member", &self.member)
            .field("body", &self.body)
            .field("resolved", &self.responder.is_none())
            .finish()
    }
}

/// Events a connection pushes into the relay's event loop.
#[derive(Debug)]
pub enum Inbound {
    /// A method call addressed to a registered object.
    Call(Invocation),
    /// A signal matching one of the subscriptions.
    Signal(SignalMessage),
    NameAcquired(String),
    NameLost { name: String, reason: String },
    /// The connection to a bus went away.
    ConnectionLost { bus: String, reason: String },
}

pub type Events = UnboundedSender<Inbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameRequestId(pub u64);

/// One live bus session.
pub trait Connection: Send + Sync {
    /// The unique name the bus assigned to this session.
    fn unique_name(&self) -> Option<String>;

    /// Call a method and wait for the reply, at most `timeout` if given.
    fn call(
        &self,
        call: MethodCall,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, std::result::Result<Body, RemoteError>>;

    /// Emit a signal. Broadcast, there is no destination.
    fn emit(&self, signal: SignalMessage) -> std::result::Result<(), BusError>;

    /// Route method calls on `interface` at `path` to `events`.
    fn register_object(
        &self,
        path: &str,
        interface: &str,
        events: Events,
    ) -> std::result::Result<RegistrationId, BusError>;

    fn unregister_object(&self, id: RegistrationId) -> std::result::Result<(), BusError>;

    /// Deliver signals matching `filter` to `events`.
    fn subscribe_signal(
        &self,
        filter: &SignalFilter,
        events: Events,
    ) -> BoxFuture<'static, std::result::Result<SubscriptionId, BusError>>;

    fn unsubscribe_signal(&self, id: SubscriptionId) -> std::result::Result<(), BusError>;

    /// Ask the bus for `name`. The outcome arrives later as
    /// [`Inbound::NameAcquired`] or [`Inbound::NameLost`].
    fn own_name(&self, name: &str, events: Events)
        -> std::result::Result<NameRequestId, BusError>;

    fn release_name(&self, id: NameRequestId) -> std::result::Result<(), BusError>;

    /// Stop servicing the bus. Further operations may fail.
    fn close(&self);
}

/// Opens connections. The relay asks for one per side at startup.
pub trait Connector {
    fn connect(
        &self,
        bus: &BusSelector,
        events: Events,
    ) -> BoxFuture<'static, Result<Arc<dyn Connection>>>;
}
