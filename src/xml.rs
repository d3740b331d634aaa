// The element layout follows zbus::xml, trimmed to what the relay
// reads out of an introspection document.

use anyhow::Result;
use serde_xml_rs::from_str;
use std::borrow::Cow;

macro_rules! get_vec {
    ($vec:expr, $kind:path) => {
        $vec.iter()
            .filter_map(|e| if let $kind(m) = e { Some(m) } else { None })
            .collect()
    };
}

/// Annotations are generic key/value pairs of metadata.
#[derive(Debug, Deserialize, Clone)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Arg {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    pub direction: Option<String>,
    #[serde(rename = "annotation", default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum MemberElement {
    Arg(Arg),
    Annotation(Annotation),
}

/// A method or a signal, they share the same shape.
#[derive(Debug, Deserialize, Clone)]
pub struct Member {
    pub name: String,

    #[serde(rename = "$value", default)]
    elems: Vec<MemberElement>,
}

impl Member {
    pub fn args(&self) -> Vec<&Arg> {
        get_vec!(self.elems, MemberElement::Arg)
    }

    pub fn annotations(&self) -> Vec<&Annotation> {
        get_vec!(self.elems, MemberElement::Annotation)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub access: String,
    #[serde(rename = "annotation", default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum InterfaceElement {
    Method(Member),
    Signal(Member),
    Property(Property),
    Annotation(Annotation),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Interface {
    pub name: String,

    #[serde(rename = "$value", default)]
    elems: Vec<InterfaceElement>,
}

impl Interface {
    pub fn methods(&self) -> Vec<&Member> {
        get_vec!(self.elems, InterfaceElement::Method)
    }

    pub fn signals(&self) -> Vec<&Member> {
        get_vec!(self.elems, InterfaceElement::Signal)
    }

    pub fn properties(&self) -> Vec<&Property> {
        get_vec!(self.elems, InterfaceElement::Property)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum NodeElement {
    Node(Node),
    Interface(Interface),
}

/// A node in the introspection tree
#[derive(Debug, Deserialize, Clone)]
pub struct Node {
    pub name: Option<String>,

    #[serde(rename = "$value", default)]
    elems: Vec<NodeElement>,
}

impl Node {
    /// Parse an introspection document. The DOCTYPE header that bus
    /// implementations put in front of it is skipped.
    pub fn parse(xml: &str) -> Result<Node> {
        Ok(from_str(&strip_doctype(xml))?)
    }

    pub fn nodes(&self) -> Vec<&Node> {
        get_vec!(self.elems, NodeElement::Node)
    }

    pub fn interfaces(&self) -> Vec<&Interface> {
        get_vec!(self.elems, NodeElement::Interface)
    }
}

fn strip_doctype(xml: &str) -> Cow<'_, str> {
    match xml.find("<!DOCTYPE") {
        None => Cow::Borrowed(xml),
        Some(start) => match xml[start..].find('>') {
            None => Cow::Borrowed(xml),
            Some(len) => {
                let mut s = String::with_capacity(xml.len());
                s.push_str(&xml[..start]);
                s.push_str(&xml[start + len + 1..]);
                Cow::Owned(s)
            }
        },
    }
}
