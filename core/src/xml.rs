/*
 * xml.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Minimal XML tree addressed by dotted path ("Phineas.Sender.MapInfo.Map[2].Name").
//! All read/write uses the quick_xml parser/writer; no regex or hand parsing.
//! Element names are kept verbatim, prefixes included ("eb:MessageHeader");
//! there is no namespace processing.

use std::fmt;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

/// Error from XML parse or path operations.
#[derive(Debug)]
pub struct XmlError(String);

impl XmlError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for XmlError {}

/// One element: name, attributes in document order, concatenated text, children.
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_string();
            return;
        }
        self.attributes.push((name.to_string(), value.to_string()));
    }

    /// Index of the n'th child with this name, if present.
    fn child_pos(&self, name: &str, index: usize) -> Option<usize> {
        let mut seen = 0;
        for (i, c) in self.children.iter().enumerate() {
            if c.name == name {
                if seen == index {
                    return Some(i);
                }
                seen += 1;
            }
        }
        None
    }
}

/// A parsed document. The root element name is significant ("Phineas",
/// "soap-env:Envelope", "EncryptedData").
#[derive(Debug, Clone)]
pub struct Xml {
    root: XmlNode,
}

/// One step of a dotted path: element name plus optional [index].
fn split_segment(seg: &str) -> Result<(&str, usize), XmlError> {
    match seg.find('[') {
        None => Ok((seg, 0)),
        Some(b) => {
            let close = seg
                .rfind(']')
                .ok_or_else(|| XmlError::new(format!("unterminated index in '{}'", seg)))?;
            let idx = seg[b + 1..close]
                .parse::<usize>()
                .map_err(|_| XmlError::new(format!("bad index in '{}'", seg)))?;
            Ok((&seg[..b], idx))
        }
    }
}

impl Xml {
    pub fn with_root(name: &str) -> Self {
        Self {
            root: XmlNode::new(name),
        }
    }

    pub fn from_node(root: XmlNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &XmlNode {
        &self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root.name
    }

    /// Parse a document. Comments, PIs and the declaration are dropped;
    /// CDATA and text are concatenated per element.
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;
        loop {
            match reader
                .read_event()
                .map_err(|e| XmlError::new(format!("xml parse: {}", e)))?
            {
                Event::Start(start) => {
                    stack.push(node_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                Event::Text(t) => {
                    if let Some(top) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| XmlError::new(format!("xml text: {}", e)))?;
                        top.text.push_str(&text);
                    }
                }
                Event::CData(c) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| XmlError::new("unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        match root {
            Some(r) if stack.is_empty() => Ok(Self { root: r }),
            _ => Err(XmlError::new("document has no complete root element")),
        }
    }

    pub fn load(path: &Path) -> Result<Self, XmlError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| XmlError::new(format!("read {}: {}", path.display(), e)))?;
        Self::parse(&data)
    }

    /// Serialize with an XML declaration, no indentation.
    pub fn format(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
        write_node(&mut writer, &self.root);
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }

    /// Serialize one subtree without a declaration.
    pub fn format_node(node: &XmlNode) -> String {
        let mut writer = Writer::new(Vec::new());
        write_node(&mut writer, node);
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }

    /// Walk a dotted path to a node. The first segment must name the root.
    pub fn node(&self, path: &str) -> Option<&XmlNode> {
        let mut segs = path.split('.');
        let (name, _) = split_segment(segs.next()?).ok()?;
        if name != self.root.name {
            return None;
        }
        let mut cur = &self.root;
        for seg in segs {
            let (name, idx) = split_segment(seg).ok()?;
            let pos = cur.child_pos(name, idx)?;
            cur = &cur.children[pos];
        }
        Some(cur)
    }

    /// Text at a path; None if the path does not resolve.
    pub fn get_text(&self, path: &str) -> Option<&str> {
        self.node(path).map(|n| n.text.as_str())
    }

    /// Text at a path, or "" when absent. Mirrors how the configuration
    /// tree is consumed everywhere: a missing element reads as empty.
    pub fn get(&self, path: &str) -> &str {
        self.get_text(path).unwrap_or("")
    }

    pub fn get_int(&self, path: &str) -> i64 {
        self.get(path).trim().parse().unwrap_or(0)
    }

    pub fn attribute(&self, path: &str, name: &str) -> Option<&str> {
        self.node(path).and_then(|n| n.attribute(name))
    }

    /// Number of siblings matching the last path segment.
    pub fn count(&self, path: &str) -> usize {
        let Some(dot) = path.rfind('.') else {
            return if self.root.name == path { 1 } else { 0 };
        };
        let (parent_path, leaf) = (&path[..dot], &path[dot + 1..]);
        let Some(parent) = self.node(parent_path) else {
            return 0;
        };
        parent.children.iter().filter(|c| c.name == leaf).count()
    }

    /// Walk to a node, creating missing elements (and missing indexed
    /// siblings) along the way.
    fn force_node(&mut self, path: &str) -> Result<&mut XmlNode, XmlError> {
        let mut segs = path.split('.');
        let first = segs
            .next()
            .ok_or_else(|| XmlError::new("empty xml path"))?;
        let (name, _) = split_segment(first)?;
        if name != self.root.name {
            return Err(XmlError::new(format!(
                "path root '{}' does not match document root '{}'",
                name, self.root.name
            )));
        }
        let mut cur = &mut self.root;
        for seg in segs {
            let (name, idx) = split_segment(seg)?;
            while cur.child_pos(name, idx).is_none() {
                cur.children.push(XmlNode::new(name));
            }
            let pos = cur.child_pos(name, idx).expect("just created");
            cur = &mut cur.children[pos];
        }
        Ok(cur)
    }

    pub fn set_text(&mut self, path: &str, value: &str) -> Result<(), XmlError> {
        self.force_node(path)?.text = value.to_string();
        Ok(())
    }

    pub fn set_attribute(&mut self, path: &str, name: &str, value: &str) -> Result<(), XmlError> {
        self.force_node(path)?.set_attribute(name, value);
        Ok(())
    }

    /// Remove a node (and its subtree). No-op when the path does not resolve.
    pub fn remove(&mut self, path: &str) {
        let Some(dot) = path.rfind('.') else { return };
        let (parent_path, leaf) = (&path[..dot], &path[dot + 1..]);
        let Ok((name, idx)) = split_segment(leaf) else {
            return;
        };
        let mut segs = parent_path.split('.');
        let Some(first) = segs.next() else { return };
        let Ok((root_name, _)) = split_segment(first) else {
            return;
        };
        if root_name != self.root.name {
            return;
        }
        let mut cur = &mut self.root;
        for seg in segs {
            let Ok((name, idx)) = split_segment(seg) else {
                return;
            };
            let Some(pos) = cur.child_pos(name, idx) else {
                return;
            };
            cur = &mut cur.children[pos];
        }
        if let Some(pos) = cur.child_pos(name, idx) {
            cur.children.remove(pos);
        }
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::new(format!("xml attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::new(format!("xml attribute value: {}", e)))?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) {
    let mut start = BytesStart::new(node.name.as_str());
    for (k, v) in &node.attributes {
        start.push_attribute((k.as_str(), v.as_str()));
    }
    if node.text.is_empty() && node.children.is_empty() {
        let _ = writer.write_event(Event::Empty(start));
        return;
    }
    let _ = writer.write_event(Event::Start(start));
    if !node.text.is_empty() {
        let _ = writer.write_event(Event::Text(BytesText::new(&node.text)));
    }
    for child in &node.children {
        write_node(writer, child);
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(node.name.as_str())));
}
