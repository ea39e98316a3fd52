//! The node tree that all stanzas are built from.
//!
//! A node is a tag, a string-keyed attribute map and an optional body that
//! is either raw bytes or a list of child nodes. Equality is structural.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::JID;

/// Attributes of a node. A sorted map keeps the wire encoding deterministic.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Possible values for node attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    JID(JID),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<u64> for AttrValue {
    fn from(n: u64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::String(if b { "true" } else { "false" }.to_string())
    }
}

impl From<JID> for AttrValue {
    fn from(jid: JID) -> Self {
        AttrValue::JID(jid)
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            AttrValue::JID(_) => None,
        }
    }

    pub fn as_jid(&self) -> Option<&JID> {
        match self {
            AttrValue::JID(jid) => Some(jid),
            AttrValue::String(_) => None,
        }
    }
}

/// Body of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    None,
    Children(Vec<Node>),
    Bytes(Vec<u8>),
}

/// One element of the stanza tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    pub fn with_attrs<K, V>(tag: impl Into<String>, attrs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<AttrValue>,
    {
        Self {
            tag: tag.into(),
            attrs: attrs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            content: NodeContent::None,
        }
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style child list setter.
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Builder-style byte body setter.
    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attr_str(key).and_then(|s| s.parse().ok())
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attr_str(key).and_then(|s| s.parse().ok())
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        match self.attr_str(key) {
            Some("true") | Some("1") => Some(true),
            Some("false") | Some("0") => Some(false),
            _ => None,
        }
    }

    /// Attribute as a JID, accepting both the packed and text encodings.
    pub fn attr_jid(&self, key: &str) -> Option<JID> {
        match self.attrs.get(key)? {
            AttrValue::JID(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
        }
    }

    pub fn add_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Children(children) => children.push(child),
            _ => self.content = NodeContent::Children(vec![child]),
        }
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    pub fn child_by_tag<'a>(&'a self, tag: &'a str) -> Option<&'a Node> {
        self.children_by_tag(tag).next()
    }

    /// Walks nested tags, returning the innermost node if every hop exists.
    pub fn child_by_path<'a>(&'a self, tags: &[&'a str]) -> Option<&'a Node> {
        let mut current = self;
        for tag in tags {
            current = current.child_by_tag(tag)?;
        }
        Some(current)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    /// XML-ish rendering for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attrs {
            match v {
                AttrValue::String(s) => write!(f, " {k}={s:?}")?,
                AttrValue::JID(j) => write!(f, " {k}=\"{j}\"")?,
            }
        }
        match &self.content {
            NodeContent::None => write!(f, "/>"),
            NodeContent::Bytes(b) => write!(f, ">[{} bytes]</{}>", b.len(), self.tag),
            NodeContent::Children(children) => {
                write!(f, ">")?;
                for c in children {
                    write!(f, "{c}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_attrs() {
        let node = Node::new("message").attr("id", "123").attr("type", "text");
        assert_eq!(node.tag, "message");
        assert_eq!(node.attr_str("id"), Some("123"));
        assert_eq!(node.attr_str("type"), Some("text"));
        assert_eq!(node.attr_str("missing"), None);
    }

    #[test]
    fn node_children() {
        let mut parent = Node::new("iq");
        parent.add_child(Node::new("query"));
        parent.add_child(Node::new("result"));
        assert_eq!(parent.get_children().len(), 2);
        assert!(parent.child_by_tag("query").is_some());
        assert!(parent.child_by_tag("nope").is_none());
    }

    #[test]
    fn node_path_lookup() {
        let node = Node::new("iq").children(vec![
            Node::new("usync").children(vec![Node::new("list")]),
        ]);
        assert!(node.child_by_path(&["usync", "list"]).is_some());
        assert!(node.child_by_path(&["usync", "missing"]).is_none());
    }

    #[test]
    fn structural_equality() {
        let a = Node::new("presence").attr("type", "available");
        let b = Node::new("presence").attr("type", "available");
        assert_eq!(a, b);
        let c = Node::new("presence").attr("type", "unavailable");
        assert_ne!(a, c);
    }

    #[test]
    fn jid_attr_accessor() {
        let jid: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        let node = Node::new("message").attr("from", jid.clone());
        assert_eq!(node.attr_jid("from"), Some(jid));
    }
}
