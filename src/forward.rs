//! The dispatch table of the relayed object.
//!
//! Method calls arriving on the target connection are forwarded to the
//! source service without blocking the event loop: the outbound call runs
//! in its own task, which owns the caller's [`Invocation`] and resolves it
//! when the source replies. Property reads and writes are forwarded inline,
//! the event loop waits for them. Signals from the source are re-emitted on
//! the target in the order they arrive.

use crate::{
    bus::{
        body_signature, Body, Connection, Invocation, MethodCall, RemoteError, SignalMessage,
        ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_PROPERTY_READ_ONLY, ERROR_UNKNOWN_METHOD,
        INTROSPECTABLE_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
    },
    catalog::Catalog,
    config::{ErrorPolicy, ProxyConfig},
    error::{Error, Result},
};
use dbus::arg::messageitem::MessageItem;
use log::{debug, error, warn};
use std::{mem, sync::Arc, time::Duration};

#[derive(Clone)]
pub struct Forwarder {
    source: Arc<dyn Connection>,
    target: Arc<dyn Connection>,
    catalog: Arc<Catalog>,
    service: String,
    path: String,
    timeout: Option<Duration>,
    errors: ErrorPolicy,
}

impl Forwarder {
    pub fn new(
        config: &ProxyConfig,
        source: Arc<dyn Connection>,
        target: Arc<dyn Connection>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Forwarder {
            source,
            target,
            catalog,
            service: config.source_bus_name().to_owned(),
            path: config.source_object_path().to_owned(),
            timeout: config.call_timeout(),
            errors: config.error_policy(),
        }
    }

    fn source_call(&self, interface: &str, member: &str, body: Body) -> MethodCall {
        MethodCall {
            destination: self.service.clone(),
            path: self.path.clone(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            body,
        }
    }

    /// Route one inbound call on the registered object.
    pub async fn dispatch(&self, inv: Invocation) {
        let interface = inv.interface.clone();
        let member = inv.member.clone();
        match (interface.as_str(), member.as_str()) {
            (PROPERTIES_INTERFACE, "Get") => self.dispatch_get(inv).await,
            (PROPERTIES_INTERFACE, "Set") => self.dispatch_set(inv).await,
            (PROPERTIES_INTERFACE, "GetAll") => self.method_call(inv),
            (INTROSPECTABLE_INTERFACE, "Introspect") => {
                inv.return_value(vec![MessageItem::Str(self.catalog.xml().to_owned())])
            }
            (interface, member) => match self.catalog.get(interface) {
                None => self.method_call(inv),
                Some(desc) => match desc.method(member) {
                    None => {
                        let msg = format!("no method {} on interface {}", member, interface);
                        inv.return_error(RemoteError::new(ERROR_UNKNOWN_METHOD, msg))
                    }
                    Some(m) => {
                        let expected = m.input_signature();
                        let got = body_signature(&inv.body);
                        if expected == got {
                            self.method_call(inv)
                        } else {
                            let msg = format!(
                                "type of message, '({})', does not match expected type '({})'",
                                got, expected
                            );
                            inv.return_error(RemoteError::new(ERROR_INVALID_ARGS, msg))
                        }
                    }
                },
            },
        }
    }

    /// Forward `inv` to the source. Returns immediately; `inv` is resolved
    /// by a separate task once the source replies.
    pub fn method_call(&self, mut inv: Invocation) {
        debug!(
            "forwarding call {}.{} from {:?}",
            inv.interface, inv.member, inv.sender
        );
        let call = self.source_call(&inv.interface, &inv.member, mem::take(&mut inv.body));
        let reply = self.source.call(call, self.timeout);
        let policy = self.errors;
        tokio::spawn(async move {
            match reply.await {
                Ok(body) => {
                    debug!("call {}.{} succeeded", inv.interface, inv.member);
                    inv.return_value(body)
                }
                Err(e) => {
                    let failure = Error::ForwardCall {
                        interface: inv.interface.clone(),
                        method: inv.member.clone(),
                        source: e.clone(),
                    };
                    warn!("{}", failure);
                    inv.return_error(relayed_error(policy, e))
                }
            }
        });
    }

    /// Read a property of the source object, waiting for the answer.
    pub async fn get_property(
        &self,
        interface: &str,
        property: &str,
        sender: Option<&str>,
    ) -> Result<MessageItem> {
        debug!("getting {}.{} for {:?}", interface, property, sender);
        let fail = |source| Error::Property {
            interface: interface.to_owned(),
            property: property.to_owned(),
            source,
        };
        let call = self.source_call(
            PROPERTIES_INTERFACE,
            "Get",
            vec![
                MessageItem::Str(interface.to_owned()),
                MessageItem::Str(property.to_owned()),
            ],
        );
        let mut reply = self.source.call(call, self.timeout).await.map_err(fail)?;
        match reply.pop() {
            Some(MessageItem::Variant(value)) if reply.is_empty() => Ok(*value),
            _ => Err(fail(RemoteError::failed(
                "Properties.Get did not return a variant",
            ))),
        }
    }

    /// Write a property of the source object, waiting for the answer.
    pub async fn set_property(
        &self,
        interface: &str,
        property: &str,
        value: MessageItem,
        sender: Option<&str>,
    ) -> Result<()> {
        debug!("setting {}.{} for {:?}", interface, property, sender);
        let call = self.source_call(
            PROPERTIES_INTERFACE,
            "Set",
            vec![
                MessageItem::Str(interface.to_owned()),
                MessageItem::Str(property.to_owned()),
                MessageItem::Variant(Box::new(value)),
            ],
        );
        self.source
            .call(call, self.timeout)
            .await
            .map(|_| ())
            .map_err(|source| Error::Property {
                interface: interface.to_owned(),
                property: property.to_owned(),
                source,
            })
    }

    /// Re-emit a signal of the source object on the target bus. Failures
    /// are logged and the signal is dropped.
    pub fn signal_received(&self, signal: SignalMessage) {
        debug!(
            "relaying signal {}.{} from {:?}",
            signal.interface, signal.member, signal.sender
        );
        if signal.interface == PROPERTIES_INTERFACE && signal.member == PROPERTIES_CHANGED {
            if let Some(MessageItem::Str(changed)) = signal.body.first() {
                debug!("properties of {} changed", changed);
            }
        }
        let interface = signal.interface.clone();
        let member = signal.member.clone();
        let out = SignalMessage {
            sender: None,
            path: self.path.clone(),
            ..signal
        };
        if let Err(source) = self.target.emit(out) {
            let e = Error::SignalEmit {
                interface,
                signal: member,
                source,
            };
            error!("{}", e)
        }
    }

    async fn dispatch_get(&self, inv: Invocation) {
        let (interface, property) = match inv.body.as_slice() {
            [MessageItem::Str(i), MessageItem::Str(p)] => (i.clone(), p.clone()),
            body => {
                let e = invalid_args(body, "ss");
                return inv.return_error(e);
            }
        };
        if let Some(desc) = self.catalog.get(&interface) {
            match desc.property(&property) {
                None => return inv.return_error(no_such_property(&interface, &property)),
                Some(p) if !p.access.readable() => {
                    let msg = format!("property {}.{} is not readable", interface, property);
                    return inv.return_error(RemoteError::new(ERROR_INVALID_ARGS, msg));
                }
                Some(_) => (),
            }
        }
        let sender = inv.sender.clone();
        match self.get_property(&interface, &property, sender.as_deref()).await {
            Ok(value) => inv.return_value(vec![MessageItem::Variant(Box::new(value))]),
            Err(e) => {
                warn!("{}", e);
                inv.return_error(self.property_error(e))
            }
        }
    }

    async fn dispatch_set(&self, mut inv: Invocation) {
        let body = mem::take(&mut inv.body);
        let e = invalid_args(&body, "ssv");
        let mut args = body.into_iter();
        let (interface, property, value) = match (args.next(), args.next(), args.next(), args.next()) {
            (
                Some(MessageItem::Str(i)),
                Some(MessageItem::Str(p)),
                Some(MessageItem::Variant(v)),
                None,
            ) => (i, p, *v),
            _ => return inv.return_error(e),
        };
        if let Some(desc) = self.catalog.get(&interface) {
            match desc.property(&property) {
                None => return inv.return_error(no_such_property(&interface, &property)),
                Some(p) if !p.access.writable() => {
                    let msg = format!("property {}.{} is read-only", interface, property);
                    return inv.return_error(RemoteError::new(ERROR_PROPERTY_READ_ONLY, msg));
                }
                Some(_) => (),
            }
        }
        let sender = inv.sender.clone();
        match self
            .set_property(&interface, &property, value, sender.as_deref())
            .await
        {
            Ok(()) => inv.return_value(vec![]),
            Err(e) => {
                warn!("{}", e);
                inv.return_error(self.property_error(e))
            }
        }
    }

    fn property_error(&self, e: Error) -> RemoteError {
        match e {
            Error::Property { source, .. } => relayed_error(self.errors, source),
            e => RemoteError::failed(e.to_string()),
        }
    }
}

fn relayed_error(policy: ErrorPolicy, e: RemoteError) -> RemoteError {
    match policy {
        ErrorPolicy::Preserve => e,
        ErrorPolicy::Normalize => RemoteError::new(ERROR_FAILED, e.message),
    }
}

fn invalid_args(body: &[MessageItem], expected: &str) -> RemoteError {
    RemoteError::new(
        ERROR_INVALID_ARGS,
        format!(
            "type of message, '({})', does not match expected type '({})'",
            body_signature(body),
            expected
        ),
    )
}

fn no_such_property(interface: &str, property: &str) -> RemoteError {
    RemoteError::new(
        ERROR_INVALID_ARGS,
        format!("no such property {} on interface {}", property, interface),
    )
}
