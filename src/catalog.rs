//! The interfaces of the relayed object, as introspected once at startup.

use crate::{
    bus::{Connection, MethodCall, INTROSPECTABLE_INTERFACE},
    error::{Error, Result},
    xml,
};
use dbus::arg::messageitem::MessageItem;
use log::{debug, info};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSignature {
    pub name: Option<String>,
    pub signature: String,
    pub direction: Direction,
}

/// A method or signal and its arguments in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSignature {
    pub name: String,
    pub args: Vec<ArgSignature>,
}

impl MemberSignature {
    fn from_xml(m: &xml::Member, default: Direction) -> Result<Self> {
        let args = m
            .args()
            .into_iter()
            .map(|a| {
                let direction = match a.direction.as_deref() {
                    None => default,
                    Some("in") => Direction::In,
                    Some("out") => Direction::Out,
                    Some(d) => {
                        return Err(format!("argument of {} has direction {:?}", m.name, d))
                    }
                };
                Ok(ArgSignature {
                    name: a.name.clone(),
                    signature: a.typ.clone(),
                    direction,
                })
            })
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|reason| Error::Introspection {
                service: String::new(),
                path: String::new(),
                reason,
            })?;
        Ok(MemberSignature {
            name: m.name.clone(),
            args,
        })
    }

    fn signature(&self, direction: Direction) -> String {
        self.args
            .iter()
            .filter(|a| a.direction == direction)
            .map(|a| a.signature.as_str())
            .collect()
    }

    /// Concatenated signature of the in arguments.
    pub fn input_signature(&self) -> String {
        self.signature(Direction::In)
    }

    pub fn output_signature(&self) -> String {
        self.signature(Direction::Out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        self != Access::Write
    }

    pub fn writable(self) -> bool {
        self != Access::Read
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySignature {
    pub name: String,
    pub signature: String,
    pub access: Access,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MemberSignature>,
    pub signals: Vec<MemberSignature>,
    pub properties: Vec<PropertySignature>,
}

impl InterfaceDescriptor {
    fn from_xml(i: &xml::Interface) -> Result<Self> {
        let methods = i
            .methods()
            .into_iter()
            .map(|m| MemberSignature::from_xml(m, Direction::In))
            .collect::<Result<Vec<_>>>()?;
        let signals = i
            .signals()
            .into_iter()
            .map(|s| MemberSignature::from_xml(s, Direction::Out))
            .collect::<Result<Vec<_>>>()?;
        let properties = i
            .properties()
            .into_iter()
            .map(|p| {
                let access = match p.access.as_str() {
                    "read" => Access::Read,
                    "write" => Access::Write,
                    "readwrite" => Access::ReadWrite,
                    a => {
                        return Err(Error::Introspection {
                            service: String::new(),
                            path: String::new(),
                            reason: format!("property {} has access {:?}", p.name, a),
                        })
                    }
                };
                Ok(PropertySignature {
                    name: p.name.clone(),
                    signature: p.typ.clone(),
                    access,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(InterfaceDescriptor {
            name: i.name.clone(),
            methods,
            signals,
            properties,
        })
    }

    pub fn method(&self, name: &str) -> Option<&MemberSignature> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&MemberSignature> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertySignature> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// The interfaces of one object, in the order the source declared them.
#[derive(Debug, Clone)]
pub struct Catalog {
    xml: String,
    interfaces: Vec<InterfaceDescriptor>,
}

impl Catalog {
    /// Build a catalog from an introspection document.
    pub fn from_xml(xml: &str) -> Result<Catalog> {
        let node = xml::Node::parse(xml).map_err(|e| Error::Introspection {
            service: String::new(),
            path: String::new(),
            reason: format!("malformed introspection data: {}", e),
        })?;
        let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();
        for i in node.interfaces() {
            if interfaces.iter().any(|d| d.name == i.name) {
                return Err(Error::Introspection {
                    service: String::new(),
                    path: String::new(),
                    reason: format!("interface {} declared twice", i.name),
                });
            }
            interfaces.push(InterfaceDescriptor::from_xml(i)?);
        }
        Ok(Catalog {
            xml: xml.to_owned(),
            interfaces,
        })
    }

    /// Introspect `path` of `service` over `con` and parse the result.
    pub async fn introspect(
        con: &dyn Connection,
        service: &str,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Catalog> {
        let fail = |reason: String| Error::Introspection {
            service: service.to_owned(),
            path: path.to_owned(),
            reason,
        };
        info!("introspecting {} at {}", service, path);
        let reply = con
            .call(
                MethodCall {
                    destination: service.to_owned(),
                    path: path.to_owned(),
                    interface: INTROSPECTABLE_INTERFACE.to_owned(),
                    member: "Introspect".to_owned(),
                    body: vec![],
                },
                timeout,
            )
            .await
            .map_err(|e| fail(e.to_string()))?;
        let xml = match reply.as_slice() {
            [MessageItem::Str(xml)] => xml,
            _ => return Err(fail("Introspect did not return a string".into())),
        };
        debug!("introspection data received ({} bytes)", xml.len());
        let catalog = Catalog::from_xml(xml).map_err(|e| match e {
            Error::Introspection { reason, .. } => fail(reason),
            e => e,
        })?;
        if catalog.is_empty() {
            return Err(fail("the object implements no interfaces".into()));
        }
        Ok(catalog)
    }

    /// The introspection document the catalog was built from.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    pub fn get(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}
