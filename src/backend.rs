//! [`Connection`] over a real bus, using dbus-rs driven by tokio.
//!
//! Registered objects and signal subscriptions are receivers installed on
//! the connection's dispatcher; their callbacks only turn the message into
//! an [`Inbound`] event and push it into the relay's channel.

use crate::{
    bus::{
        Body, BusError, Connection, Connector, Events, Inbound, Invocation, MethodCall,
        NameRequestId, RegistrationId, RemoteError, Responder, SignalFilter, SignalMessage,
        SubscriptionId, ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_NO_REPLY,
    },
    config::BusSelector,
    error::{Error, Result},
};
use dbus::{
    channel::{BusType, Channel, MatchingReceiver, Sender, Token},
    message::MatchRule,
    nonblock::{NonblockReply, Proxy, SyncConnection},
    strings::{BusName, ErrorName, Interface, Member, Path},
    Message,
};
use futures::{channel::oneshot, future::BoxFuture, prelude::*};
use fxhash::FxHashMap;
use log::{debug, info, warn};
use std::{
    ffi::CString,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

const BUS_SERVICE: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const ERROR_OBJECT_PATH_IN_USE: &str = "org.freedesktop.DBus.Error.ObjectPathInUse";

// RequestName replies
const PRIMARY_OWNER: u32 = 1;
const IN_QUEUE: u32 = 2;
const EXISTS: u32 = 3;
const ALREADY_OWNER: u32 = 4;

fn bus_name(s: &str) -> std::result::Result<BusName<'static>, BusError> {
    BusName::new(s.to_owned()).map_err(|reason| BusError::InvalidName {
        kind: "bus name",
        value: s.to_owned(),
        reason,
    })
}

fn object_path(s: &str) -> std::result::Result<Path<'static>, BusError> {
    Path::new(s.to_owned()).map_err(|reason| BusError::InvalidName {
        kind: "object path",
        value: s.to_owned(),
        reason,
    })
}

fn interface(s: &str) -> std::result::Result<Interface<'static>, BusError> {
    Interface::new(s.to_owned()).map_err(|reason| BusError::InvalidName {
        kind: "interface",
        value: s.to_owned(),
        reason,
    })
}

fn member(s: &str) -> std::result::Result<Member<'static>, BusError> {
    Member::new(s.to_owned()).map_err(|reason| BusError::InvalidName {
        kind: "member",
        value: s.to_owned(),
        reason,
    })
}

fn remote_error(e: &dbus::Error) -> RemoteError {
    RemoteError::new(
        e.name().unwrap_or(ERROR_FAILED),
        e.message().unwrap_or_default(),
    )
}

fn reply_body(mut reply: Message) -> std::result::Result<Body, RemoteError> {
    match reply.as_result() {
        Ok(reply) => Ok(reply.get_items()),
        Err(e) => Err(remote_error(&e)),
    }
}

fn signal_message(msg: &Message) -> SignalMessage {
    SignalMessage {
        sender: msg.sender().map(|s| s.to_string()),
        path: msg.path().map(|p| p.to_string()).unwrap_or_default(),
        interface: msg.interface().map(|i| i.to_string()).unwrap_or_default(),
        member: msg.member().map(|m| m.to_string()).unwrap_or_default(),
        body: msg.get_items(),
    }
}

/// Replies to a method call received on a registered object.
struct DBusResponder {
    con: Weak<SyncConnection>,
    call: Message,
}

impl Responder for DBusResponder {
    fn respond(self: Box<Self>, outcome: std::result::Result<Body, RemoteError>) {
        if self.call.get_no_reply() {
            return;
        }
        let con = match self.con.upgrade() {
            Some(con) => con,
            None => return,
        };
        let reply = match outcome {
            Ok(body) => {
                let mut reply = self.call.method_return();
                reply.append_items(&body);
                reply
            }
            Err(e) => {
                let name = ErrorName::new(e.name.clone()).unwrap_or_else(|_| ErrorName::from(ERROR_FAILED));
                let text = CString::new(e.message.replace('\0', " ")).unwrap_or_default();
                self.call.error(&name, &text)
            }
        };
        if con.send(reply).is_err() {
            warn!("could not send reply to {:?}", self.call.sender());
        }
    }
}

fn invocation(msg: Message, con: Weak<SyncConnection>) -> Invocation {
    let SignalMessage {
        sender,
        path,
        interface,
        member,
        body,
    } = signal_message(&msg);
    Invocation::new(
        sender,
        path,
        interface,
        member,
        body,
        Box::new(DBusResponder { con, call: msg }),
    )
}

#[derive(Default)]
struct Handles {
    objects: FxHashMap<u64, (String, String, Token)>,
    signals: FxHashMap<u64, (String, Token)>,
    names: FxHashMap<u64, (String, Vec<Token>)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct DBusConnection {
    bus: String,
    con: Arc<SyncConnection>,
    io: Mutex<Option<JoinHandle<()>>>,
    handles: Arc<Mutex<Handles>>,
    next_id: AtomicU64,
}

impl DBusConnection {
    /// Connect and authenticate. Must be called within a tokio runtime,
    /// the connection is serviced by a task spawned on it.
    pub fn open(bus: &BusSelector, events: Events) -> Result<DBusConnection> {
        let fail = |e: dbus::Error| Error::Connection {
            bus: bus.to_string(),
            reason: e.message().unwrap_or("unknown error").to_owned(),
        };
        let channel = match bus {
            BusSelector::System => Channel::get_private(BusType::System),
            BusSelector::Session => Channel::get_private(BusType::Session),
            BusSelector::Address(addr) => Channel::open_private(addr).and_then(|mut c| {
                c.register()?;
                Ok(c)
            }),
        }
        .map_err(fail)?;
        let (resource, con) =
            dbus_tokio::connection::from_channel::<SyncConnection>(channel).map_err(fail)?;
        let label = bus.to_string();
        let io = tokio::spawn(async move {
            let err = resource.await;
            let _ = events.unbounded_send(Inbound::ConnectionLost {
                bus: label,
                reason: err.to_string(),
            });
        });
        info!("connected to {} bus as {}", bus, con.unique_name());
        Ok(DBusConnection {
            bus: bus.to_string(),
            con,
            io: Mutex::new(Some(io)),
            handles: Arc::new(Mutex::new(Handles::default())),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire and forget a call to the bus daemon.
    fn notify_bus(&self, method: &'static str, arg: String) -> std::result::Result<(), BusError> {
        let mut msg = Message::new_method_call(BUS_SERVICE, BUS_PATH, BUS_SERVICE, method)
            .map_err(|reason| BusError::InvalidName {
                kind: "member",
                value: method.to_owned(),
                reason,
            })?
            .append1(arg);
        msg.set_no_reply(true);
        self.con.send(msg).map(|_| ()).map_err(|()| BusError::Send)
    }
}

impl Connection for DBusConnection {
    fn unique_name(&self) -> Option<String> {
        Some(self.con.unique_name().to_string())
    }

    fn call(
        &self,
        call: MethodCall,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, std::result::Result<Body, RemoteError>> {
        let con = Arc::clone(&self.con);
        async move {
            let invalid = |e: BusError| RemoteError::new(ERROR_INVALID_ARGS, e.to_string());
            let mut msg = Message::method_call(
                &bus_name(&call.destination).map_err(invalid)?,
                &object_path(&call.path).map_err(invalid)?,
                &interface(&call.interface).map_err(invalid)?,
                &member(&call.member).map_err(invalid)?,
            );
            msg.append_items(&call.body);
            let (tx, rx) = oneshot::channel();
            let token = con
                .send_with_reply(
                    msg,
                    SyncConnection::make_f(move |reply: Message, _: &SyncConnection| {
                        let _ = tx.send(reply);
                    }),
                )
                .map_err(|()| RemoteError::failed("message could not be sent"))?;
            let reply = match timeout {
                None => rx.await,
                Some(t) => match tokio::time::timeout(t, rx).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        con.cancel_reply(token);
                        return Err(RemoteError::new(
                            ERROR_NO_REPLY,
                            format!(
                                "{}.{} did not reply within {:?}",
                                call.interface, call.member, t
                            ),
                        ));
                    }
                },
            };
            match reply {
                Ok(reply) => reply_body(reply),
                Err(oneshot::Canceled) => Err(RemoteError::failed(
                    "the connection closed before the reply arrived",
                )),
            }
        }
        .boxed()
    }

    fn emit(&self, signal: SignalMessage) -> std::result::Result<(), BusError> {
        let mut msg = Message::signal(
            &object_path(&signal.path)?,
            &interface(&signal.interface)?,
            &member(&signal.member)?,
        );
        msg.append_items(&signal.body);
        self.con.send(msg).map(|_| ()).map_err(|()| BusError::Send)
    }

    fn register_object(
        &self,
        path: &str,
        iface: &str,
        events: Events,
    ) -> std::result::Result<RegistrationId, BusError> {
        let rule = MatchRule::new_method_call()
            .with_path(object_path(path)?)
            .with_interface(interface(iface)?);
        let mut handles = lock(&self.handles);
        if handles
            .objects
            .values()
            .any(|(p, i, _)| p == path && i == iface)
        {
            return Err(BusError::Rejected(RemoteError::new(
                ERROR_OBJECT_PATH_IN_USE,
                format!("{} is already exported at {}", iface, path),
            )));
        }
        let weak = Arc::downgrade(&self.con);
        let token = self.con.start_receive(
            rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                events
                    .unbounded_send(Inbound::Call(invocation(msg, weak.clone())))
                    .is_ok()
            }),
        );
        let id = self.next_id();
        handles
            .objects
            .insert(id, (path.to_owned(), iface.to_owned(), token));
        debug!("{}: exported {} at {}", self.bus, iface, path);
        Ok(RegistrationId(id))
    }

    fn unregister_object(&self, id: RegistrationId) -> std::result::Result<(), BusError> {
        let (_, _, token) = lock(&self.handles)
            .objects
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        self.con
            .stop_receive(token)
            .map(|_| ())
            .ok_or(BusError::UnknownHandle(id.0))
    }

    fn subscribe_signal(
        &self,
        filter: &SignalFilter,
        events: Events,
    ) -> BoxFuture<'static, std::result::Result<SubscriptionId, BusError>> {
        let con = Arc::clone(&self.con);
        let handles = Arc::clone(&self.handles);
        let id = self.next_id();
        let filter = filter.clone();
        async move {
            // The daemon resolves the well known sender name; messages carry
            // the unique name, so the local receiver matches without it.
            let local = MatchRule::new_signal(interface(&filter.interface)?, member(&filter.member)?)
                .with_path(object_path(&filter.path)?);
            let on_bus = local
                .clone()
                .with_sender(bus_name(&filter.sender)?)
                .match_str();
            con.add_match_no_cb(&on_bus)
                .await
                .map_err(|e| BusError::Rejected(remote_error(&e)))?;
            let token = con.start_receive(
                local,
                Box::new(move |msg: Message, _: &SyncConnection| {
                    events
                        .unbounded_send(Inbound::Signal(signal_message(&msg)))
                        .is_ok()
                }),
            );
            lock(&handles).signals.insert(id, (on_bus, token));
            Ok(SubscriptionId(id))
        }
        .boxed()
    }

    fn unsubscribe_signal(&self, id: SubscriptionId) -> std::result::Result<(), BusError> {
        let (rule, token) = lock(&self.handles)
            .signals
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        self.con.stop_receive(token);
        self.notify_bus("RemoveMatch", rule)
    }

    fn own_name(&self, name: &str, events: Events) -> std::result::Result<NameRequestId, BusError> {
        bus_name(name)?;
        // NameAcquired and NameLost are sent to us directly, no match needed.
        let mut tokens = Vec::new();
        for (signal, acquired) in [("NameAcquired", true), ("NameLost", false)] {
            let rule = MatchRule::new_signal(BUS_SERVICE, signal)
                .with_sender(BUS_SERVICE)
                .with_path(BUS_PATH);
            let events = events.clone();
            let name = name.to_owned();
            tokens.push(self.con.start_receive(
                rule,
                Box::new(move |msg: Message, _: &SyncConnection| {
                    if msg.get1::<String>().as_deref() != Some(name.as_str()) {
                        return true;
                    }
                    let event = if acquired {
                        Inbound::NameAcquired(name.clone())
                    } else {
                        Inbound::NameLost {
                            name: name.clone(),
                            reason: "taken over by another connection".into(),
                        }
                    };
                    events.unbounded_send(event).is_ok()
                }),
            ));
        }
        let id = self.next_id();
        lock(&self.handles)
            .names
            .insert(id, (name.to_owned(), tokens));
        let proxy = Proxy::new(
            BUS_SERVICE,
            BUS_PATH,
            Duration::from_secs(25),
            Arc::clone(&self.con),
        );
        let name = name.to_owned();
        tokio::spawn(async move {
            let reply: std::result::Result<(u32,), dbus::Error> = proxy
                .method_call(BUS_SERVICE, "RequestName", (name.as_str(), 0u32))
                .await;
            let lost = |reason: String| Inbound::NameLost {
                name: name.clone(),
                reason,
            };
            let event = match reply {
                Ok((PRIMARY_OWNER,)) | Ok((ALREADY_OWNER,)) => Inbound::NameAcquired(name.clone()),
                Ok((IN_QUEUE,)) => lost("owned by another connection, queued for it".into()),
                Ok((EXISTS,)) => lost("owned by another connection".into()),
                Ok((code,)) => lost(format!("unexpected RequestName reply {}", code)),
                Err(e) => lost(remote_error(&e).to_string()),
            };
            let _ = events.unbounded_send(event);
        });
        Ok(NameRequestId(id))
    }

    fn release_name(&self, id: NameRequestId) -> std::result::Result<(), BusError> {
        let (name, tokens) = lock(&self.handles)
            .names
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        for token in tokens {
            self.con.stop_receive(token);
        }
        self.notify_bus("ReleaseName", name)
    }

    fn close(&self) {
        if let Some(io) = lock(&self.io).take() {
            debug!("disconnecting from {} bus", self.bus);
            io.abort();
        }
    }
}

impl Drop for DBusConnection {
    fn drop(&mut self) {
        self.close()
    }
}

/// Opens real bus connections.
pub struct DBusConnector;

impl Connector for DBusConnector {
    fn connect(&self, bus: &BusSelector, events: Events) -> BoxFuture<'static, Result<Arc<dyn Connection>>> {
        let bus = bus.clone();
        async move {
            let con: Arc<dyn Connection> = Arc::new(DBusConnection::open(&bus, events)?);
            Ok(con)
        }
        .boxed()
    }
}
