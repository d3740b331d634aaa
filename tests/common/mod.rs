//! An in-memory bus for driving the relay in tests.
//!
//! `MockBus` implements `Connection` and records every operation the relay
//! performs on it. Calls made by the relay are answered from configured
//! replies, a property store and the configured introspection document.
#![allow(dead_code)]

use dbus::arg::messageitem::MessageItem;
use dbus_relay::{
    bus::{
        Body, BusError, Connection, Connector, Events, Inbound, Invocation, MethodCall,
        NameRequestId, RegistrationId, RemoteError, Responder, SignalFilter, SignalMessage,
        SubscriptionId, ERROR_INVALID_ARGS, ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD,
        INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE,
    },
    BusSelector, Error, ProxyConfig, Relay, Result, Settings,
};
use futures::{
    channel::{mpsc, oneshot},
    future::{BoxFuture, Shared},
    prelude::*,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

pub const SERVICE: &str = "com.example.Counter";
pub const PATH: &str = "/com/example/Counter";
pub const PROXY_NAME: &str = "com.example.CounterProxy";
pub const COUNTER: &str = "com.example.Counter";
pub const SOURCE_BUS: &str = "unix:path=/tmp/source_bus";
pub const TARGET_BUS: &str = "unix:path=/tmp/target_bus";
pub const SOURCE_UNIQUE: &str = ":1.10";

pub const COUNTER_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="properties" type="a{sv}" direction="out"/>
    </method>
    <method name="Set">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="in"/>
    </method>
    <signal name="PropertiesChanged">
      <arg name="interface_name" type="s"/>
      <arg name="changed_properties" type="a{sv}"/>
      <arg name="invalidated_properties" type="as"/>
    </signal>
  </interface>
  <interface name="com.example.Counter">
    <method name="Increment"/>
    <method name="Add">
      <arg name="amount" type="i" direction="in"/>
      <arg name="total" type="i" direction="out"/>
    </method>
    <method name="Slow">
      <arg name="tag" type="s" direction="in"/>
      <arg name="tag" type="s" direction="out"/>
    </method>
    <method name="Fast">
      <arg name="tag" type="s" direction="out"/>
    </method>
    <signal name="Changed">
      <arg name="value" type="i"/>
    </signal>
    <signal name="Reset"/>
    <property name="Value" type="i" access="read"/>
    <property name="Step" type="i" access="readwrite"/>
  </interface>
</node>"#;

/// Everything a relay did to a bus, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Call(MethodCall),
    Emit(SignalMessage),
    Register { path: String, interface: String },
    Unregister(String),
    Subscribe(String),
    Unsubscribe(String),
    OwnName(String),
    ReleaseName(String),
    Close,
}

#[derive(Clone)]
pub enum NameOutcome {
    Acquired,
    Lost(String),
    Silent,
}

#[derive(Default)]
struct Inner {
    unique: String,
    ops: Vec<Op>,
    xml: Option<String>,
    replies: HashMap<(String, String), std::result::Result<Body, RemoteError>>,
    gates: HashMap<(String, String), Shared<oneshot::Receiver<()>>>,
    properties: HashMap<(String, String), MessageItem>,
    objects: HashMap<u64, (String, String, Events)>,
    signals: HashMap<u64, (SignalFilter, Events)>,
    names: HashMap<u64, String>,
    reject_register: Option<String>,
    reject_subscribe: Option<String>,
    name_outcome: Option<NameOutcome>,
    events: Option<Events>,
    emitted: Vec<mpsc::UnboundedSender<SignalMessage>>,
    next_id: u64,
}

pub struct MockBus {
    inner: Mutex<Inner>,
}

fn key(interface: &str, member: &str) -> (String, String) {
    (interface.to_owned(), member.to_owned())
}

struct MockResponder(oneshot::Sender<std::result::Result<Body, RemoteError>>);

impl Responder for MockResponder {
    fn respond(self: Box<Self>, outcome: std::result::Result<Body, RemoteError>) {
        let _ = self.0.send(outcome);
    }
}

impl MockBus {
    pub fn new(unique: &str) -> Arc<MockBus> {
        Arc::new(MockBus {
            inner: Mutex::new(Inner {
                unique: unique.to_owned(),
                name_outcome: Some(NameOutcome::Acquired),
                next_id: 1,
                ..Inner::default()
            }),
        })
    }

    /// A source bus serving the counter object.
    pub fn counter_source() -> Arc<MockBus> {
        let bus = MockBus::new(SOURCE_UNIQUE);
        bus.set_xml(COUNTER_XML);
        bus.set_property(COUNTER, "Value", MessageItem::Int32(0));
        bus.set_property(COUNTER, "Step", MessageItem::Int32(1));
        bus
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_xml(&self, xml: &str) {
        self.lock().xml = Some(xml.to_owned());
    }

    pub fn reply(&self, interface: &str, member: &str, body: Body) {
        self.lock().replies.insert(key(interface, member), Ok(body));
    }

    pub fn reply_error(&self, interface: &str, member: &str, error: RemoteError) {
        self.lock().replies.insert(key(interface, member), Err(error));
    }

    /// Hold replies to `member` until the returned sender fires or drops.
    pub fn gate(&self, interface: &str, member: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().gates.insert(key(interface, member), rx.shared());
        tx
    }

    pub fn set_property(&self, interface: &str, property: &str, value: MessageItem) {
        self.lock().properties.insert(key(interface, property), value);
    }

    pub fn property(&self, interface: &str, property: &str) -> Option<MessageItem> {
        self.lock().properties.get(&key(interface, property)).cloned()
    }

    pub fn reject_register(&self, interface: &str) {
        self.lock().reject_register = Some(interface.to_owned());
    }

    pub fn reject_subscribe(&self, label: &str) {
        self.lock().reject_subscribe = Some(label.to_owned());
    }

    pub fn name_outcome(&self, outcome: NameOutcome) {
        self.lock().name_outcome = Some(outcome);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear()
    }

    pub fn calls(&self, interface: &str, member: &str) -> Vec<MethodCall> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Call(c) if c.interface == interface && c.member == member => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn emitted(&self) -> Vec<SignalMessage> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Emit(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// A stream of every signal emitted from now on.
    pub fn watch_emitted(&self) -> mpsc::UnboundedReceiver<SignalMessage> {
        let (tx, rx) = mpsc::unbounded();
        self.lock().emitted.push(tx);
        rx
    }

    pub fn registered(&self) -> Vec<(String, String)> {
        let mut objects: Vec<_> = self
            .lock()
            .objects
            .values()
            .map(|(p, i, _)| (p.clone(), i.clone()))
            .collect();
        objects.sort();
        objects
    }

    pub fn subscribed(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.lock().signals.values().map(|(f, _)| f.label()).collect();
        labels.sort();
        labels
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.lock().names.values().cloned().collect()
    }

    /// Make a call to the object registered at `path`, as a client of this
    /// bus would. The receiver yields the reply.
    pub fn invoke(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Body,
    ) -> oneshot::Receiver<std::result::Result<Body, RemoteError>> {
        let (tx, rx) = oneshot::channel();
        let events = self
            .lock()
            .objects
            .values()
            .find(|(p, i, _)| p == path && i == interface)
            .map(|(_, _, events)| events.clone());
        let inv = Invocation::new(
            Some(":1.99".to_owned()),
            path,
            interface,
            member,
            body,
            Box::new(MockResponder(tx)),
        );
        match events {
            Some(events) => {
                let _ = events.unbounded_send(Inbound::Call(inv));
            }
            None => inv.return_error(RemoteError::new(
                "org.freedesktop.DBus.Error.UnknownObject",
                format!("no object at {} implementing {}", path, interface),
            )),
        }
        rx
    }

    /// Emit a signal from the source object, delivered to every matching
    /// subscription.
    pub fn signal(&self, interface: &str, member: &str, body: Body) {
        let msg = SignalMessage {
            sender: Some(self.lock().unique.clone()),
            path: PATH.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            body,
        };
        let inner = self.lock();
        for (filter, events) in inner.signals.values() {
            if filter.matches(&msg.path, &msg.interface, &msg.member) {
                let _ = events.unbounded_send(Inbound::Signal(msg.clone()));
            }
        }
    }

    /// Report the connection as lost to whoever connected.
    pub fn lose_connection(&self, reason: &str) {
        if let Some(events) = self.lock().events.clone() {
            let _ = events.unbounded_send(Inbound::ConnectionLost {
                bus: "mock".to_owned(),
                reason: reason.to_owned(),
            });
        }
    }

    fn answer(inner: &mut Inner, call: &MethodCall) -> std::result::Result<Body, RemoteError> {
        if let Some(reply) = inner.replies.get(&key(&call.interface, &call.member)) {
            return reply.clone();
        }
        let invalid = || RemoteError::new(ERROR_INVALID_ARGS, "bad arguments");
        match (call.interface.as_str(), call.member.as_str(), call.body.as_slice()) {
            (INTROSPECTABLE_INTERFACE, "Introspect", []) => match &inner.xml {
                Some(xml) => Ok(vec![MessageItem::Str(xml.clone())]),
                None => Err(RemoteError::new(
                    "org.freedesktop.DBus.Error.ServiceUnknown",
                    format!("{} is not running", call.destination),
                )),
            },
            (PROPERTIES_INTERFACE, "Get", [MessageItem::Str(i), MessageItem::Str(p)]) => inner
                .properties
                .get(&key(i, p))
                .map(|v| vec![MessageItem::Variant(Box::new(v.clone()))])
                .ok_or_else(invalid),
            (
                PROPERTIES_INTERFACE,
                "Set",
                [MessageItem::Str(i), MessageItem::Str(p), MessageItem::Variant(v)],
            ) => {
                inner.properties.insert(key(i, p), (**v).clone());
                Ok(vec![])
            }
            (i, m, _) => Err(RemoteError::new(
                ERROR_UNKNOWN_METHOD,
                format!("no method {} on {}", m, i),
            )),
        }
    }
}

impl Connection for MockBus {
    fn unique_name(&self) -> Option<String> {
        Some(self.lock().unique.clone())
    }

    fn call(
        &self,
        call: MethodCall,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, std::result::Result<Body, RemoteError>> {
        let mut inner = self.lock();
        inner.ops.push(Op::Call(call.clone()));
        let gate = inner.gates.get(&key(&call.interface, &call.member)).cloned();
        let reply = MockBus::answer(&mut inner, &call);
        drop(inner);
        async move {
            if let Some(gate) = gate {
                match timeout {
                    None => {
                        let _ = gate.await;
                    }
                    Some(t) => {
                        if tokio::time::timeout(t, gate).await.is_err() {
                            return Err(RemoteError::new(ERROR_NO_REPLY, "timed out"));
                        }
                    }
                }
            }
            reply
        }
        .boxed()
    }

    fn emit(&self, signal: SignalMessage) -> std::result::Result<(), BusError> {
        let mut inner = self.lock();
        inner.ops.push(Op::Emit(signal.clone()));
        inner
            .emitted
            .retain(|tx| tx.unbounded_send(signal.clone()).is_ok());
        Ok(())
    }

    fn register_object(
        &self,
        path: &str,
        interface: &str,
        events: Events,
    ) -> std::result::Result<RegistrationId, BusError> {
        let mut inner = self.lock();
        inner.ops.push(Op::Register {
            path: path.to_owned(),
            interface: interface.to_owned(),
        });
        if inner.reject_register.as_deref() == Some(interface)
            || inner
                .objects
                .values()
                .any(|(p, i, _)| p == path && i == interface)
        {
            return Err(BusError::Rejected(RemoteError::new(
                "org.freedesktop.DBus.Error.ObjectPathInUse",
                format!("{} already exported at {}", interface, path),
            )));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .objects
            .insert(id, (path.to_owned(), interface.to_owned(), events));
        Ok(RegistrationId(id))
    }

    fn unregister_object(&self, id: RegistrationId) -> std::result::Result<(), BusError> {
        let mut inner = self.lock();
        let (_, interface, _) = inner
            .objects
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        inner.ops.push(Op::Unregister(interface));
        Ok(())
    }

    fn subscribe_signal(
        &self,
        filter: &SignalFilter,
        events: Events,
    ) -> BoxFuture<'static, std::result::Result<SubscriptionId, BusError>> {
        let mut inner = self.lock();
        let label = filter.label();
        inner.ops.push(Op::Subscribe(label.clone()));
        let result = if inner.reject_subscribe.as_deref() == Some(label.as_str()) {
            Err(BusError::Rejected(RemoteError::new(
                "org.freedesktop.DBus.Error.AccessDenied",
                "match rule rejected",
            )))
        } else {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.signals.insert(id, (filter.clone(), events));
            Ok(SubscriptionId(id))
        };
        future::ready(result).boxed()
    }

    fn unsubscribe_signal(&self, id: SubscriptionId) -> std::result::Result<(), BusError> {
        let mut inner = self.lock();
        let (filter, _) = inner
            .signals
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        inner.ops.push(Op::Unsubscribe(filter.label()));
        Ok(())
    }

    fn own_name(&self, name: &str, events: Events) -> std::result::Result<NameRequestId, BusError> {
        let mut inner = self.lock();
        inner.ops.push(Op::OwnName(name.to_owned()));
        let id = inner.next_id;
        inner.next_id += 1;
        inner.names.insert(id, name.to_owned());
        let event = match inner.name_outcome.clone() {
            Some(NameOutcome::Acquired) | None => Some(Inbound::NameAcquired(name.to_owned())),
            Some(NameOutcome::Lost(reason)) => Some(Inbound::NameLost {
                name: name.to_owned(),
                reason,
            }),
            Some(NameOutcome::Silent) => None,
        };
        if let Some(event) = event {
            let _ = events.unbounded_send(event);
        }
        Ok(NameRequestId(id))
    }

    fn release_name(&self, id: NameRequestId) -> std::result::Result<(), BusError> {
        let mut inner = self.lock();
        let name = inner
            .names
            .remove(&id.0)
            .ok_or(BusError::UnknownHandle(id.0))?;
        inner.ops.push(Op::ReleaseName(name));
        Ok(())
    }

    fn close(&self) {
        self.lock().ops.push(Op::Close);
    }
}

/// Hands out the mock buses by selector.
pub struct MockConnector {
    buses: HashMap<BusSelector, Arc<MockBus>>,
}

impl MockConnector {
    pub fn new(source: &Arc<MockBus>, target: &Arc<MockBus>) -> Self {
        let mut buses = HashMap::new();
        buses.insert(BusSelector::Address(SOURCE_BUS.to_owned()), Arc::clone(source));
        buses.insert(BusSelector::Address(TARGET_BUS.to_owned()), Arc::clone(target));
        MockConnector { buses }
    }

    pub fn without(mut self, bus: &str) -> Self {
        self.buses.remove(&BusSelector::Address(bus.to_owned()));
        self
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        bus: &BusSelector,
        events: Events,
    ) -> BoxFuture<'static, Result<Arc<dyn Connection>>> {
        let result = match self.buses.get(bus) {
            Some(mock) => {
                mock.lock().events = Some(events);
                let con: Arc<dyn Connection> = Arc::clone(mock) as Arc<dyn Connection>;
                Ok(con)
            }
            None => Err(Error::Connection {
                bus: bus.to_string(),
                reason: "connection refused".to_owned(),
            }),
        };
        future::ready(result).boxed()
    }
}

pub fn settings() -> Settings {
    Settings {
        source_bus_name: Some(SERVICE.to_owned()),
        source_object_path: Some(PATH.to_owned()),
        proxy_bus_name: Some(PROXY_NAME.to_owned()),
        source_bus: Some(SOURCE_BUS.to_owned()),
        target_bus: Some(TARGET_BUS.to_owned()),
        timeout_ms: Some(5_000),
        ..Settings::default()
    }
}

pub fn config() -> ProxyConfig {
    settings().validate().unwrap()
}

/// Let the relay's event loop and spawned forwarding tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// A started relay running its event loop in a task.
pub struct Harness {
    pub source: Arc<MockBus>,
    pub target: Arc<MockBus>,
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<(Relay, Result<()>)>,
}

impl Harness {
    pub async fn start(config: ProxyConfig) -> Harness {
        let source = MockBus::counter_source();
        let target = MockBus::new(":1.20");
        Harness::start_with(config, source, target).await
    }

    pub async fn start_with(
        config: ProxyConfig,
        source: Arc<MockBus>,
        target: Arc<MockBus>,
    ) -> Harness {
        let mut relay = Relay::new(config);
        relay
            .start(&MockConnector::new(&source, &target))
            .await
            .unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = relay.run(stopped.map(|_| ())).await;
            (relay, result)
        });
        settle().await;
        Harness {
            source,
            target,
            stop,
            task,
        }
    }

    pub fn invoke(
        &self,
        interface: &str,
        member: &str,
        body: Body,
    ) -> oneshot::Receiver<std::result::Result<Body, RemoteError>> {
        self.target.invoke(PATH, interface, member, body)
    }

    /// Invoke and wait for the reply.
    pub async fn call(
        &self,
        interface: &str,
        member: &str,
        body: Body,
    ) -> std::result::Result<Body, RemoteError> {
        self.invoke(interface, member, body).await.unwrap()
    }

    pub async fn stop(self) -> (Relay, Result<()>) {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }

    /// Wait for the relay to stop by itself.
    pub async fn join(self) -> (Relay, Result<()>) {
        let Harness { stop, task, .. } = self;
        let (relay, result) = task.await.unwrap();
        drop(stop);
        (relay, result)
    }
}
