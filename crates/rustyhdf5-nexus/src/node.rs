//! Node core shared by fields, groups and links.
//!
//! A [`Node`] is a cheap handle onto one tree item. Parents own their
//! children and children keep a weak back-reference, so dropping the root
//! releases the whole tree. Only a root (or an item read through an external
//! link) carries a [`File`]; every other node finds its storage location by
//! walking up to one, which is how file name, path and mode are inherited.
//!
//! ```text
//!   root:NXroot ── File("scan.nxs", rw)
//!     └─ entry:NXentry          path /entry, mode rw (inherited)
//!          └─ data:NXdata       path /entry/data
//!               └─ counts = int32(100)
//! ```

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::array::Array;
use crate::attrs::{normalize, AttrDict, AttrLine};
use crate::classes::{self, ClassKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::field::{Field, FieldData};
use crate::file::{File, Mode};
use crate::group::{self, Group, GroupData};
use crate::link::{Link, LinkData, LinkState};
use crate::storage::join;
use crate::text;

pub(crate) type NodeRef = Rc<RefCell<NodeInner>>;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Field,
    Group,
    Link,
}

pub(crate) enum Kind {
    Field(FieldData),
    Group(GroupData),
    Link(LinkData),
}

pub(crate) struct NodeInner {
    pub(crate) name: String,
    pub(crate) class: String,
    pub(crate) attrs: AttrDict,
    pub(crate) changed: bool,
    pub(crate) parent: Weak<RefCell<NodeInner>>,
    pub(crate) file: Option<File>,
    /// Path inside `file` for items read through an external link.
    pub(crate) origin: Option<String>,
    pub(crate) kind: Kind,
}

/// Shared handle onto a field, group or link.
#[derive(Clone)]
pub struct Node(pub(crate) NodeRef);

impl Node {
    pub(crate) fn from_parts(
        name: impl Into<String>,
        class: impl Into<String>,
        attrs: AttrDict,
        kind: Kind,
    ) -> Node {
        Node(Rc::new(RefCell::new(NodeInner {
            name: name.into(),
            class: class.into(),
            attrs,
            changed: true,
            parent: Weak::new(),
            file: None,
            origin: None,
            kind,
        })))
    }

    pub(crate) fn inner(&self) -> Ref<'_, NodeInner> {
        self.0.borrow()
    }

    pub(crate) fn inner_mut(&self) -> RefMut<'_, NodeInner> {
        self.0.borrow_mut()
    }

    /// True if both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn name(&self) -> String {
        self.inner().name.clone()
    }

    /// NeXus class: `NXfield` for fields, `NXlink` for links.
    pub fn class(&self) -> String {
        self.inner().class.clone()
    }

    pub(crate) fn set_class(&self, class: &str) {
        self.inner_mut().class = class.to_string();
    }

    pub fn kind(&self) -> NodeKind {
        match self.inner().kind {
            Kind::Field(_) => NodeKind::Field,
            Kind::Group(_) => NodeKind::Group,
            Kind::Link(_) => NodeKind::Link,
        }
    }

    pub fn is_field(&self) -> bool {
        self.kind() == NodeKind::Field
    }

    pub fn is_group(&self) -> bool {
        self.kind() == NodeKind::Group
    }

    pub fn is_link(&self) -> bool {
        self.kind() == NodeKind::Link
    }

    pub fn as_field(&self) -> Option<Field> {
        self.is_field().then(|| Field(self.clone()))
    }

    pub fn as_group(&self) -> Option<Group> {
        self.is_group().then(|| Group(self.clone()))
    }

    pub fn as_link(&self) -> Option<Link> {
        self.is_link().then(|| Link(self.clone()))
    }

    /// The field this node is, or the field an internal or external link
    /// points at.
    pub fn to_field(&self) -> Result<Field> {
        match self.kind() {
            NodeKind::Field => Ok(Field(self.clone())),
            NodeKind::Link => match Link(self.clone()).resolve() {
                LinkState::Field(field) => Ok(field),
                LinkState::Broken => Err(Error::BrokenLink(Link(self.clone()).target())),
                _ => Err(Error::InvalidOperation(format!("'{}' is not a field", self.name()))),
            },
            NodeKind::Group => Err(Error::InvalidOperation(format!("'{}' is not a field", self.name()))),
        }
    }

    /// The group this node is, or the group a link points at.
    pub fn to_group(&self) -> Result<Group> {
        match self.kind() {
            NodeKind::Group => Ok(Group(self.clone())),
            NodeKind::Link => match Link(self.clone()).resolve() {
                LinkState::Group(group) => Ok(group),
                LinkState::Broken => Err(Error::BrokenLink(Link(self.clone()).target())),
                _ => Err(Error::InvalidOperation(format!("'{}' is not a group", self.name()))),
            },
            NodeKind::Field => Err(Error::InvalidOperation(format!("'{}' is not a group", self.name()))),
        }
    }

    pub(crate) fn class_kind(&self) -> ClassKind {
        classes::kind_of(&self.inner().class)
    }

    /// Owning group, or the link a linked item was reached through.
    pub fn parent(&self) -> Option<Node> {
        self.inner().parent.upgrade().map(Node)
    }

    pub fn parent_group(&self) -> Option<Group> {
        self.parent().and_then(|p| p.as_group())
    }

    pub(crate) fn set_parent(&self, parent: Option<&Node>) {
        self.inner_mut().parent = parent.map(|p| Rc::downgrade(&p.0)).unwrap_or_default();
    }

    /// Topmost ancestor.
    pub fn root(&self) -> Node {
        let mut node = self.clone();
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// Nearest `NXentry` (or `NXsubentry`) at or above this node.
    pub fn entry(&self) -> Option<Group> {
        let mut node = Some(self.clone());
        while let Some(n) = node {
            if matches!(n.class_kind(), ClassKind::Entry | ClassKind::Subentry) && n.is_group() {
                return n.as_group();
            }
            node = n.parent();
        }
        None
    }

    /// Path within the tree: `/` for a root, the bare name for a detached
    /// node.
    pub fn path(&self) -> String {
        let (name, class, parent) = {
            let inner = self.inner();
            (inner.name.clone(), inner.class.clone(), inner.parent.upgrade())
        };
        if class == "NXroot" {
            return "/".into();
        }
        match parent.map(Node) {
            None => name,
            Some(p) if p.inner().class == "NXroot" => format!("/{name}"),
            Some(p) => join(&p.path(), &name),
        }
    }

    /// Path inside the file holding this node's data.
    pub fn file_path(&self) -> String {
        let (name, class, origin, parent) = {
            let inner = self.inner();
            (inner.name.clone(), inner.class.clone(), inner.origin.clone(), inner.parent.upgrade())
        };
        if class == "NXroot" {
            return "/".into();
        }
        if let Some(origin) = origin {
            return origin;
        }
        match parent.map(Node) {
            None => String::new(),
            Some(p) if p.inner().class == "NXroot" => format!("/{name}"),
            Some(p) => match p.as_link() {
                Some(link) => join(&link.target(), &name),
                None => join(&p.file_path(), &name),
            },
        }
    }

    /// File and path holding this node's storage, if any.
    pub(crate) fn locate(&self) -> Option<(File, String)> {
        let (name, parent) = {
            let inner = self.inner();
            if let Some(file) = &inner.file {
                return Some((file.clone(), inner.origin.clone().unwrap_or_else(|| "/".into())));
            }
            (inner.name.clone(), inner.parent.upgrade().map(Node)?)
        };
        if let Some(link) = parent.as_link() {
            let file = link.storage()?;
            return Some((file, join(&link.target(), &name)));
        }
        let (file, path) = parent.locate()?;
        Some((file, join(&path, &name)))
    }

    /// File bound to this node's root.
    pub fn file(&self) -> Option<File> {
        self.locate().map(|(file, _)| file)
    }

    /// Absolute name of the file holding this node. External link names
    /// resolve against the directory of the referencing file.
    pub fn file_name(&self) -> Option<PathBuf> {
        if let Some(link) = self.as_link() {
            if let Some(name) = link.external_file() {
                return Some(name);
            }
        }
        if let Some(file) = &self.inner().file {
            return Some(file.filename());
        }
        self.parent().and_then(|p| p.file_name())
    }

    /// Access mode inherited from the bound file. Items reached through an
    /// external link are always read-only.
    pub fn file_mode(&self) -> Option<Mode> {
        if let Some(link) = self.as_link() {
            if link.is_external() {
                return Some(Mode::Read);
            }
        }
        if let Some(file) = &self.inner().file {
            return Some(file.mode());
        }
        self.parent().and_then(|p| p.file_mode())
    }

    /// Configuration of the bound file, or the defaults for detached trees.
    pub fn config(&self) -> Config {
        self.file().map(|f| f.config()).unwrap_or_default()
    }

    /// True if this node was reached through a link to a group.
    pub fn is_linked(&self) -> bool {
        match self.parent() {
            Some(parent) => parent.is_link() || parent.is_linked(),
            None => false,
        }
    }

    /// True if this node's data lives in a file other than its root's.
    pub fn is_external(&self) -> bool {
        if let Some(link) = self.as_link() {
            if link.is_external() {
                return true;
            }
        }
        self.file_name() != self.root().file_name()
    }

    pub fn is_modifiable(&self) -> bool {
        match self.file_mode() {
            None => true,
            Some(Mode::ReadWrite) => !self.is_linked(),
            Some(Mode::Read) => false,
        }
    }

    pub(crate) fn check_modifiable(&self) -> Result<()> {
        if self.file_mode() == Some(Mode::Read) {
            return Err(Error::ReadOnlyViolation(format!(
                "NeXus file opened as readonly ({})",
                self.path()
            )));
        }
        if self.is_linked() {
            return Err(Error::LinkedItemImmutable(self.path()));
        }
        Ok(())
    }

    /// False only when a named file is missing.
    pub fn file_exists(&self) -> bool {
        self.file_name().map_or(true, |f| f.exists())
    }

    /// True if the node is detached or present in its file.
    pub fn path_exists(&self) -> bool {
        match self.locate() {
            Some((file, path)) => {
                file.filename().exists() && file.with(|engine, _| Ok(engine.exists(&path))).unwrap_or(false)
            }
            None => true,
        }
    }

    /// For a link, whether its target can be reached.
    pub fn exists(&self) -> bool {
        if let Some(link) = self.as_link() {
            return link.exists();
        }
        self.file_exists() && self.path_exists()
    }

    /// Attributes as stored. A link reports its target's attributes.
    pub fn attrs(&self) -> AttrDict {
        if let Some(link) = self.as_link() {
            return link.attrs();
        }
        self.inner().attrs.clone()
    }

    /// Normalised attribute value.
    pub fn attr(&self, name: &str) -> Option<Array> {
        if self.is_link() {
            return self.attrs().get(name);
        }
        self.inner().attrs.raw(name).map(normalize)
    }

    pub fn attr_str(&self, name: &str) -> Option<String> {
        self.attrs().get_str(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        if self.is_link() {
            return self.attrs().contains(name);
        }
        self.inner().attrs.contains(name)
    }

    /// Set an attribute, writing it through to a read-write file. Empty
    /// text values are ignored.
    pub fn set_attr(&self, name: &str, value: impl Into<Array>) -> Result<()> {
        let value = value.into();
        if let Some(link) = self.as_link() {
            link.check_writable()?;
            return link.target_node()?.set_attr(name, value);
        }
        self.check_modifiable()?;
        if !self.inner_mut().attrs.insert(name, value.clone()) {
            return Ok(());
        }
        self.set_changed();
        self.write_attr(name, Some(&value))
    }

    pub fn delete_attr(&self, name: &str) -> Result<()> {
        if let Some(link) = self.as_link() {
            link.check_writable()?;
            return link.target_node()?.delete_attr(name);
        }
        self.check_modifiable()?;
        if self.inner_mut().attrs.remove(name).is_none() {
            return Err(Error::NotFound(format!("{}@{name}", self.path())));
        }
        self.set_changed();
        self.write_attr(name, None)
    }

    fn write_attr(&self, name: &str, value: Option<&Array>) -> Result<()> {
        if self.file_mode() != Some(Mode::ReadWrite) {
            return Ok(());
        }
        let Some((file, path)) = self.locate() else {
            return Ok(());
        };
        file.with(|engine, cx| {
            if !engine.exists(&path) {
                return Ok(());
            }
            match value {
                Some(value) => cx.check(&path, engine.set_attr(&path, name, value)),
                None => cx.check(&path, engine.delete_attr(&path, name)),
            }
        })
    }

    pub fn changed(&self) -> bool {
        self.inner().changed
    }

    /// Mark this node and every ancestor as changed.
    pub fn set_changed(&self) {
        let mut node = Some(self.clone());
        while let Some(n) = node {
            n.inner_mut().changed = true;
            node = n.parent();
        }
    }

    pub fn set_unchanged(&self, recursive: bool) {
        if recursive {
            for node in self.walk_loaded() {
                node.inner_mut().changed = false;
            }
        } else {
            self.inner_mut().changed = false;
        }
    }

    /// Children of a group, or of the group a link points at.
    pub fn children(&self) -> Result<Vec<(String, Node)>> {
        match self.kind() {
            NodeKind::Group => group::entries(self),
            NodeKind::Link => Link(self.clone()).children(),
            NodeKind::Field => Ok(Vec::new()),
        }
    }

    /// This node followed by every descendant, reading lazily loaded groups.
    pub fn walk(&self) -> Result<Vec<Node>> {
        let mut out = vec![self.clone()];
        if self.is_group() {
            for (_, child) in self.children()? {
                out.extend(child.walk()?);
            }
        }
        Ok(out)
    }

    /// Like [`Node::walk`] but never touches the file.
    pub(crate) fn walk_loaded(&self) -> Vec<Node> {
        let mut out = vec![self.clone()];
        let children: Vec<Node> = match &self.inner().kind {
            Kind::Group(data) => data.entries.values().cloned().collect(),
            _ => Vec::new(),
        };
        for child in children {
            out.extend(child.walk_loaded());
        }
        out
    }

    /// Rename the node, keeping data-group bindings and moving the object in
    /// a read-write file.
    pub fn rename(&self, name: &str) -> Result<()> {
        let name = name.trim().to_string();
        let old = self.name();
        if name == old {
            return Ok(());
        }
        let Some(parent) = self.parent() else {
            self.inner_mut().name = name;
            self.set_changed();
            return Ok(());
        };
        if parent.file_mode() == Some(Mode::Read) {
            return Err(Error::ReadOnlyViolation("NeXus parent group is readonly".into()));
        }
        if parent.is_link() || parent.is_linked() {
            return Err(Error::LinkedItemImmutable(self.path()));
        }
        let parent = Group(parent);
        if parent.contains(&name) {
            return Err(Error::InvalidOperation(format!("'{name}' already exists in '{}'", parent.path())));
        }
        let old_path = self.path();
        if parent.file_mode() == Some(Mode::ReadWrite) {
            if let Some(file) = parent.file() {
                let new_path = join(&parent.path(), &name);
                file.rename(&old_path, &new_path)?;
            }
        }
        parent.rekey(&old, &name);
        self.inner_mut().name = name.clone();
        if matches!(parent.class_kind(), ClassKind::Data | ClassKind::Monitor) {
            parent.rename_binding(&old, &name)?;
        }
        self.set_changed();
        Ok(())
    }

    /// Write the node and its ancestors' pending state to a read-write file.
    pub fn update(&self) -> Result<()> {
        if self.file_mode() == Some(Mode::ReadWrite) || self.is_link() {
            let root = self.root();
            let file = root.inner().file.clone();
            if let Some(file) = file {
                if file.mode() == Mode::ReadWrite && file.filename().exists() {
                    file.update(self)?;
                }
            }
        }
        self.set_changed();
        Ok(())
    }

    /// Independent copy with no parent. Stored data is not read: copied
    /// fields remember where their values live and fetch them on demand.
    pub fn deep_copy(&self) -> Result<Node> {
        let (name, class, mut attrs) = {
            let inner = self.inner();
            (inner.name.clone(), inner.class.clone(), inner.attrs.clone())
        };
        attrs.remove("target");
        let location = if self.is_field() { self.locate() } else { None };
        let copied = match &self.inner().kind {
            Kind::Field(data) => Some(Kind::Field(data.deep_copy(location)?)),
            Kind::Link(data) => Some(Kind::Link(data.unresolved_copy())),
            Kind::Group(_) => None,
        };
        match copied {
            Some(Kind::Link(mut data)) => {
                if let Some(file) = Link(self.clone()).external_file() {
                    data.filename = Some(file);
                }
                Ok(Node::from_parts(name, class, AttrDict::new(), Kind::Link(data)))
            }
            Some(kind) => Ok(Node::from_parts(name, class, attrs, kind)),
            None => {
                let copy = Node::from_parts(name, class, attrs, Kind::Group(GroupData::loaded()));
                for (key, child) in self.children()? {
                    let child_copy = match child.as_link().map(|l| l.resolve()) {
                        Some(LinkState::Field(field)) => field.deep_copy()?,
                        Some(LinkState::Group(group)) => group.deep_copy()?.into(),
                        _ => child.deep_copy()?,
                    };
                    child_copy.inner_mut().name = key.clone();
                    group::attach(&copy, &key, &child_copy);
                }
                Ok(copy)
            }
        }
    }

    /// Full tree with attributes.
    pub fn tree(&self) -> String {
        self.tree_lines(0, true, None).join("\n")
    }

    /// This node and the names of its children.
    pub fn short_tree(&self) -> String {
        self.tree_lines(0, false, Some(1)).join("\n")
    }

    pub(crate) fn name_line(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        match self.kind() {
            NodeKind::Field => format!("{pad}{} = {}", self.name(), Field(self.clone()).display_value()),
            NodeKind::Group => format!("{pad}{}:{}", self.name(), self.class()),
            NodeKind::Link => format!("{pad}{}", Link(self.clone()).display_line()),
        }
    }

    fn tree_lines(&self, indent: usize, attrs: bool, recursive: Option<usize>) -> Vec<String> {
        let mut lines = vec![self.name_line(indent)];
        if self.is_link() {
            return lines;
        }
        let own = self.inner().attrs.clone();
        if !own.is_empty() && (attrs || indent == 0) {
            let pad = " ".repeat(indent + 2);
            lines.extend(own.iter().map(|(k, v)| format!("{pad}{}", AttrLine(k, v))));
        }
        if self.is_group() {
            let mut children = self.children().unwrap_or_default();
            children.sort_by(|a, b| text::natural_cmp(&a.0, &b.0));
            for (_, child) in children {
                if recursive.map_or(true, |depth| depth >= indent) {
                    lines.extend(child.tree_lines(indent + 2, attrs, recursive));
                } else {
                    lines.push(child.name_line(indent + 2));
                }
            }
        }
        lines
    }

    /// Save to a new file, wrapping the node in `NXroot`/`NXentry` groups as
    /// needed. Any mode other than `w` refuses to overwrite.
    pub fn save(&self, path: impl AsRef<Path>, mode: &str) -> Result<Group> {
        self.save_with(path, mode, &self.config())
    }

    pub fn save_with(&self, path: impl AsRef<Path>, mode: &str, config: &Config) -> Result<Group> {
        let mut path = path.as_ref().to_path_buf();
        if path.extension().is_none() {
            path.set_extension("nxs");
        }
        let root = match self.class_kind() {
            ClassKind::Root if self.is_group() => Group(self.clone()),
            ClassKind::Entry if self.is_group() => {
                let root = Group::root();
                root.set(&self.name(), self.clone())?;
                root
            }
            _ => {
                let entry = Group::entry();
                entry.set(&self.name(), self.clone())?;
                let root = Group::root();
                root.set("entry", entry)?;
                root
            }
        };
        let mode = if mode == "w" { "w" } else { "w-" };
        let file = File::open_with(&path, mode, config)?;
        file.write_tree(&root)?;
        {
            let mut inner = root.inner_mut();
            inner.file = Some(file.clone());
            inner.origin = None;
        }
        file.bind_root(&root);
        root.set_unchanged(true);
        Ok(root)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            NodeKind::Field => f.write_str(&Field(self.clone()).display_value()),
            _ => f.write_str(&self.name()),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}('{}')", self.class(), self.path())
    }
}
