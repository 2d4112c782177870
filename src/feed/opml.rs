use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Maximum nesting depth for `<outline>` elements. Deeper documents are
/// rejected before the tree is built.
const MAX_OPML_DEPTH: usize = 50;

const DEFAULT_TITLE: &str = "feedsync subscriptions";

/// Errors that can occur while reading an OPML document.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed OPML document: the `<head>` title plus the `<body>` outline tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpmlDocument {
    pub title: Option<String>,
    pub date_created: Option<String>,
    pub outlines: Vec<Outline>,
}

/// One `<outline>` element. Feeds carry an `xmlUrl`; folders carry children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outline {
    pub text: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// The `type` attribute
    pub kind: Option<String>,
    pub version: Option<String>,
    pub html_url: Option<String>,
    pub xml_url: Option<String>,
    pub children: Vec<Outline>,
}

impl Outline {
    /// `title`, falling back to `text`.
    pub fn display_name(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or(self.text.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn is_feed(&self) -> bool {
        self.xml_url.is_some()
    }

    fn set_attribute(&mut self, key: &[u8], value: String) {
        let value = Some(value).filter(|v| !v.trim().is_empty());
        match key {
            b"text" => self.text = value,
            b"title" => self.title = value,
            b"description" => self.description = value,
            b"type" => self.kind = value,
            b"version" => self.version = value,
            b"htmlUrl" => self.html_url = value,
            b"xmlUrl" => self.xml_url = value,
            _ => {}
        }
    }

    fn attributes(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("text", &self.text),
            ("title", &self.title),
            ("description", &self.description),
            ("type", &self.kind),
            ("version", &self.version),
            ("htmlUrl", &self.html_url),
            ("xmlUrl", &self.xml_url),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
    }
}

impl OpmlDocument {
    /// Every outline in document order: a node first, then its descendants.
    /// Each node comes with its parent (`None` for top-level outlines).
    pub fn flatten(&self) -> Flatten<'_> {
        Flatten {
            stack: self.outlines.iter().rev().map(|o| (o, None)).collect(),
        }
    }

    /// Serialize as an OPML 2.0 document.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .context("Failed to write XML declaration")?;

        let mut opml = BytesStart::new("opml");
        opml.push_attribute(("version", "2.0"));
        writer
            .write_event(Event::Start(opml))
            .context("Failed to write opml element")?;

        writer
            .write_event(Event::Start(BytesStart::new("head")))
            .context("Failed to write head element")?;
        write_text_element(
            &mut writer,
            "title",
            self.title.as_deref().unwrap_or(DEFAULT_TITLE),
        )?;
        if let Some(date) = &self.date_created {
            write_text_element(&mut writer, "dateCreated", date)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("head")))
            .context("Failed to write head end")?;

        writer
            .write_event(Event::Start(BytesStart::new("body")))
            .context("Failed to write body element")?;
        for outline in &self.outlines {
            write_outline(&mut writer, outline)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("body")))
            .context("Failed to write body end")?;
        writer
            .write_event(Event::End(BytesEnd::new("opml")))
            .context("Failed to write opml end")?;

        String::from_utf8(writer.into_inner().into_inner())
            .context("OPML output was not valid UTF-8")
    }
}

/// Preorder iterator returned by [`OpmlDocument::flatten`].
pub struct Flatten<'a> {
    stack: Vec<(&'a Outline, Option<&'a Outline>)>,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = (&'a Outline, Option<&'a Outline>);

    fn next(&mut self) -> Option<Self::Item> {
        let (node, parent) = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().map(|child| (child, Some(node))));
        Some((node, parent))
    }
}

/// Parse OPML text into an outline tree.
///
/// Custom entities are never expanded: quick-xml 0.37 does not read
/// `<!ENTITY>` declarations, so a reference like `&xxe;` fails to unescape
/// and the whole document is rejected. Only the five XML builtins resolve.
pub fn parse_opml(content: &str) -> Result<OpmlDocument, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);
    let decoder = reader.decoder();

    let mut doc = OpmlDocument::default();
    let mut open: Vec<Outline> = Vec::new();
    let mut saw_root = false;
    let mut in_head = false;
    let mut head_field: Option<&'static str> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"opml" => saw_root = true,
                b"head" => in_head = true,
                b"title" if in_head => head_field = Some("title"),
                b"dateCreated" if in_head => head_field = Some("dateCreated"),
                b"outline" => {
                    if open.len() >= MAX_OPML_DEPTH {
                        return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                    }
                    open.push(read_outline(&e, decoder)?);
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"opml" => saw_root = true,
                b"outline" => {
                    let outline = read_outline(&e, decoder)?;
                    attach(&mut doc, &mut open, outline);
                }
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"head" => in_head = false,
                b"title" | b"dateCreated" => head_field = None,
                b"outline" => {
                    if let Some(outline) = open.pop() {
                        attach(&mut doc, &mut open, outline);
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if let Some(field) = head_field {
                    let text = t
                        .unescape()
                        .map_err(|e| OpmlError::XmlParse(e.to_string()))?
                        .trim()
                        .to_string();
                    match field {
                        "title" => doc.title = Some(text),
                        _ => doc.date_created = Some(text),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(OpmlError::XmlParse("missing <opml> root element".into()));
    }
    if !open.is_empty() {
        return Err(OpmlError::XmlParse("unclosed <outline> element".into()));
    }
    Ok(doc)
}

/// Read and parse an OPML file.
pub async fn read_opml_file(path: impl AsRef<Path>) -> Result<OpmlDocument, OpmlError> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_opml(&content)
}

/// Write `doc` to `path` through a temp file and rename, so readers never
/// see a half-written export.
pub async fn write_opml_file(doc: &OpmlDocument, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let xml = doc.to_xml()?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, xml)
        .await
        .with_context(|| format!("Failed to write OPML file: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move OPML file into place: {}", path.display()))?;
    Ok(())
}

fn attach(doc: &mut OpmlDocument, open: &mut [Outline], outline: Outline) {
    match open.last_mut() {
        Some(parent) => parent.children.push(outline),
        None => doc.outlines.push(outline),
    }
}

fn read_outline(
    e: &BytesStart<'_>,
    decoder: quick_xml::encoding::Decoder,
) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;
        outline.set_attribute(attr.key.as_ref(), value.into_owned());
    }
    Ok(outline)
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

fn write_outline(writer: &mut Writer<Cursor<Vec<u8>>>, outline: &Outline) -> Result<()> {
    let mut element = BytesStart::new("outline");
    for attribute in outline.attributes() {
        element.push_attribute(attribute);
    }

    if outline.children.is_empty() {
        writer
            .write_event(Event::Empty(element))
            .context("Failed to write outline")?;
        return Ok(());
    }

    writer
        .write_event(Event::Start(element))
        .context("Failed to write outline")?;
    for child in &outline.children {
        write_outline(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("outline")))
        .context("Failed to write outline end")?;
    Ok(())
}
