//! Minimal inline document: a flat run of text, image and hard-break nodes
//! with a cursor between them.
//!
//! Images always sit on their own line. Inserting one next to text adds a
//! hard break on that side, and typing right next to an image does the same.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAttrs {
    pub src: String,
    pub title: Option<String>,
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Text { text: String },
    Image(ImageAttrs),
    HardBreak,
}

impl Node {
    pub fn text(s: impl Into<String>) -> Self {
        Node::Text { text: s.into() }
    }

    fn is_text(&self) -> bool {
        matches!(self, Node::Text { .. })
    }

    fn is_image(&self) -> bool {
        matches!(self, Node::Image(_))
    }
}

/// A single document edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Insert an image at the cursor
    InsertImage(ImageAttrs),
    /// Type text at the cursor
    InsertText(String),
    /// Replace the `src` of the image whose title is `title`
    SetImageSrc { title: String, src: String },
    /// Set the final `src` of the image whose title is `title` and clear the title
    FinalizeImage { title: String, src: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Document {
    nodes: Vec<Node>,
    /// Position between nodes, `0..=nodes.len()`
    cursor: usize,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from nodes with the cursor at the end.
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let cursor = nodes.len();
        Self { nodes, cursor }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.nodes.len());
    }

    pub fn find_image(&self, title: &str) -> Option<&ImageAttrs> {
        self.nodes.iter().find_map(|n| match n {
            Node::Image(attrs) if attrs.title.as_deref() == Some(title) => Some(attrs),
            _ => None,
        })
    }

    fn find_image_mut(&mut self, title: &str) -> Option<&mut ImageAttrs> {
        self.nodes.iter_mut().find_map(|n| match n {
            Node::Image(attrs) if attrs.title.as_deref() == Some(title) => Some(attrs),
            _ => None,
        })
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageAttrs> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Image(attrs) => Some(attrs),
            _ => None,
        })
    }

    fn before_cursor(&self) -> Option<&Node> {
        self.cursor.checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    fn after_cursor(&self) -> Option<&Node> {
        self.nodes.get(self.cursor)
    }

    fn insert_at_cursor(&mut self, node: Node) {
        self.nodes.insert(self.cursor, node);
        self.cursor += 1;
    }

    /// True when the cursor touches an image node on either side.
    pub fn cursor_adjacent_to_image(&self) -> bool {
        self.before_cursor().is_some_and(Node::is_image) || self.after_cursor().is_some_and(Node::is_image)
    }

    /// Inserts an image at the cursor, breaking the line against neighbouring
    /// text. The cursor ends up directly after the image.
    pub fn insert_image(&mut self, attrs: ImageAttrs) {
        if self.before_cursor().is_some_and(Node::is_text) {
            self.insert_at_cursor(Node::HardBreak);
        }
        self.insert_at_cursor(Node::Image(attrs));
        if self.after_cursor().is_some_and(Node::is_text) {
            self.nodes.insert(self.cursor, Node::HardBreak);
        }
    }

    /// Types `text` at the cursor. Next to an image a hard break is added
    /// first so the text starts (or ends) on its own line.
    pub fn type_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.before_cursor().is_some_and(Node::is_image) {
            self.insert_at_cursor(Node::HardBreak);
        }
        let image_follows = self.after_cursor().is_some_and(Node::is_image);

        match self.cursor.checked_sub(1).and_then(|i| self.nodes.get_mut(i)) {
            Some(Node::Text { text: existing }) => existing.push_str(text),
            _ => self.insert_at_cursor(Node::text(text)),
        }

        if image_follows {
            self.nodes.insert(self.cursor, Node::HardBreak);
        }
    }

    /// Applies a transaction. Returns false when it targets an image that is
    /// no longer in the document.
    pub fn apply(&mut self, tx: Transaction) -> bool {
        match tx {
            Transaction::InsertImage(attrs) => {
                self.insert_image(attrs);
                true
            }
            Transaction::InsertText(text) => {
                self.type_text(&text);
                true
            }
            Transaction::SetImageSrc { title, src } => match self.find_image_mut(&title) {
                Some(img) => {
                    img.src = src;
                    true
                }
                None => false,
            },
            Transaction::FinalizeImage { title, src } => match self.find_image_mut(&title) {
                Some(img) => {
                    img.src = src;
                    img.title = None;
                    true
                }
                None => false,
            },
        }
    }
}

/// Document shared between the editor and the mutation dispatcher.
#[derive(Debug, Clone, Default)]
pub struct SharedDocument(Arc<Mutex<Document>>);

impl SharedDocument {
    pub fn new(doc: Document) -> Self {
        Self(Arc::new(Mutex::new(doc)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Document> {
        // A panicking writer leaves a structurally valid document behind
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Document {
        self.lock().clone()
    }
}
