//! Links to fields and groups in the same tree or in another file.
//!
//! A link stores a target path and, for external links, the file holding
//! it. Resolution is lazy: internal targets are looked up by path from the
//! tree root every time, so a deleted target reads as [`LinkState::Broken`]
//! immediately. External targets are read once from a read-only [`File`]
//! and cached.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::array::Array;
use crate::attrs::AttrDict;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::file::File;
use crate::group::Group;
use crate::lock;
use crate::node::{Kind, Node, NodeKind};
use crate::selection::Selection;

/// Longest chain of links followed before a target counts as broken.
const MAX_CHAIN: usize = 16;

pub(crate) struct LinkData {
    pub(crate) target: String,
    /// External file as given, possibly relative.
    pub(crate) filename: Option<PathBuf>,
    pub(crate) abspath: bool,
    pub(crate) soft: bool,
    resolved: bool,
    external: Option<Node>,
}

impl LinkData {
    pub(crate) fn new(target: impl Into<String>, filename: Option<PathBuf>, abspath: bool, soft: bool) -> Self {
        Self {
            target: target.into(),
            filename,
            abspath,
            soft,
            resolved: false,
            external: None,
        }
    }

    /// Same target, nothing resolved.
    pub(crate) fn unresolved_copy(&self) -> Self {
        Self::new(self.target.clone(), self.filename.clone(), self.abspath, self.soft)
    }
}

/// Result of resolving a link.
#[derive(Debug, Clone)]
pub enum LinkState {
    /// Not yet dereferenced.
    Unresolved,
    Field(Field),
    Group(Group),
    /// Target path or external file is missing.
    Broken,
}

/// Handle onto a link node.
#[derive(Debug, Clone)]
pub struct Link(pub(crate) Node);

impl std::ops::Deref for Link {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl From<Link> for Node {
    fn from(link: Link) -> Node {
        link.0
    }
}

impl Link {
    /// Link to `target` in the same tree, named after its last segment.
    pub fn new(target: &str) -> Link {
        Self::build(target, None)
    }

    /// Link to `target` inside another file.
    pub fn external(target: &str, file: impl AsRef<Path>) -> Link {
        Self::build(target, Some(file.as_ref().to_path_buf()))
    }

    /// Link to an existing node, which must not itself be a link.
    pub fn to(node: &Node) -> Result<Link> {
        if node.is_link() {
            return Err(Error::InvalidOperation("cannot link to another link".into()));
        }
        let link = Self::build(&node.path(), None);
        link.inner_mut().name = node.name();
        Ok(link)
    }

    fn build(target: &str, filename: Option<PathBuf>) -> Link {
        let name = target.rsplit('/').next().unwrap_or(target).to_string();
        let data = LinkData::new(target, filename, false, false);
        Link(Node::from_parts(name, "NXlink", AttrDict::new(), Kind::Link(data)))
    }

    /// Store the external file name as an absolute path when written.
    pub fn with_abspath(self, abspath: bool) -> Link {
        self.data_mut(|d| d.abspath = abspath);
        self
    }

    /// Write as a soft link instead of a hard link.
    pub fn with_soft(self, soft: bool) -> Link {
        self.data_mut(|d| d.soft = soft);
        self
    }

    fn data<T>(&self, f: impl FnOnce(&LinkData) -> T) -> Option<T> {
        match &self.0.inner().kind {
            Kind::Link(data) => Some(f(data)),
            _ => None,
        }
    }

    fn data_mut<T>(&self, f: impl FnOnce(&mut LinkData) -> T) -> Option<T> {
        match &mut self.0.inner_mut().kind {
            Kind::Link(data) => Some(f(data)),
            _ => None,
        }
    }

    pub fn target(&self) -> String {
        self.data(|d| d.target.clone()).unwrap_or_default()
    }

    pub fn abspath(&self) -> bool {
        self.data(|d| d.abspath).unwrap_or(false)
    }

    pub fn is_soft(&self) -> bool {
        self.data(|d| d.soft).unwrap_or(false)
    }

    pub fn is_external(&self) -> bool {
        self.data(|d| d.filename.is_some()).unwrap_or(false)
    }

    /// Absolute name of the external file. Relative names are taken from the
    /// directory of the file holding the link.
    pub fn external_file(&self) -> Option<PathBuf> {
        let stored = self.data(|d| d.filename.clone()).flatten()?;
        if stored.is_absolute() {
            return Some(stored);
        }
        let base = self.0.parent().and_then(|p| p.file_name());
        let joined = match base.as_deref().and_then(Path::parent) {
            Some(dir) => dir.join(&stored),
            None => stored,
        };
        Some(lock::absolute(&joined))
    }

    /// File holding the target: the external file, or the tree's own file.
    pub(crate) fn storage(&self) -> Option<File> {
        if self.is_external() {
            return self.external_node().and_then(|n| n.inner().file.clone());
        }
        self.0.parent().and_then(|p| p.file())
    }

    fn external_node(&self) -> Option<Node> {
        if let Some(node) = self.data(|d| d.external.clone()).flatten() {
            return Some(node);
        }
        let filename = self.external_file()?;
        if !filename.exists() {
            return None;
        }
        let config = self.0.config();
        let node = File::open_with(&filename, "r", &config)
            .and_then(|file| file.read_path(&self.target()))
            .map_err(|e| debug!(file = %filename.display(), target = %self.target(), error = %e, "external link unresolved"))
            .ok()?;
        self.data_mut(|d| d.external = Some(node.clone()));
        Some(node)
    }

    fn internal_node(&self) -> Option<Node> {
        let target = self.target();
        let root = self.0.root().as_group()?;
        if target.starts_with('/') {
            return root.get(&target).ok();
        }
        self.0
            .parent_group()
            .and_then(|g| g.get(&target).ok())
            .or_else(|| root.get(&target).ok())
    }

    /// Resolve the target, following chains of links. Never fails: a
    /// missing target or file gives [`LinkState::Broken`].
    pub fn resolve(&self) -> LinkState {
        self.data_mut(|d| d.resolved = true);
        let mut link = self.clone();
        for _ in 0..MAX_CHAIN {
            let found = if link.is_external() { link.external_node() } else { link.internal_node() };
            let Some(node) = found else {
                return LinkState::Broken;
            };
            match node.kind() {
                NodeKind::Field => return LinkState::Field(Field(node)),
                NodeKind::Group => return LinkState::Group(Group(node)),
                NodeKind::Link => link = Link(node),
            }
        }
        LinkState::Broken
    }

    /// [`LinkState::Unresolved`] until the link is first resolved; after
    /// that, the target as it stands now.
    pub fn state(&self) -> LinkState {
        if self.data(|d| d.resolved).unwrap_or(false) {
            self.resolve()
        } else {
            LinkState::Unresolved
        }
    }

    /// True if the target can be reached. Never fails.
    pub fn exists(&self) -> bool {
        !matches!(self.resolve(), LinkState::Broken)
    }

    pub fn target_node(&self) -> Result<Node> {
        match self.resolve() {
            LinkState::Field(field) => Ok(field.0),
            LinkState::Group(group) => Ok(group.0),
            _ => Err(Error::BrokenLink(self.target())),
        }
    }

    /// Attributes of the target, empty when broken.
    pub fn attrs(&self) -> AttrDict {
        self.target_node().map(|n| n.attrs()).unwrap_or_default()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_external() {
            return Err(Error::ReadOnlyLink(self.0.name()));
        }
        Ok(())
    }

    /// Children of a linked group, rebuilt from the target on every call.
    /// Internal targets are copied so the originals stay untouched; both
    /// kinds are parented to the link, which makes them immutable.
    pub fn children(&self) -> Result<Vec<(String, Node)>> {
        let Some(group) = self.target_group()? else {
            return Ok(Vec::new());
        };
        group
            .children()?
            .into_iter()
            .map(|(name, child)| Ok((name.clone(), self.adopt(&name, child)?)))
            .collect()
    }

    /// One child of a linked group.
    pub(crate) fn child(&self, name: &str) -> Result<Option<Node>> {
        let Some(group) = self.target_group()? else {
            return Ok(None);
        };
        match group.children()?.into_iter().find(|(k, _)| k == name) {
            Some((_, child)) => Ok(Some(self.adopt(name, child)?)),
            None => Ok(None),
        }
    }

    fn target_group(&self) -> Result<Option<Group>> {
        match self.resolve() {
            LinkState::Group(group) => Ok(Some(group)),
            LinkState::Field(_) => Ok(None),
            _ => Err(Error::BrokenLink(self.target())),
        }
    }

    fn adopt(&self, name: &str, child: Node) -> Result<Node> {
        let child = if self.is_external() { child } else { child.deep_copy()? };
        child.inner_mut().name = name.to_string();
        child.set_parent(Some(&self.0));
        Ok(child)
    }

    /// Target field, or an error for groups and broken links.
    pub fn field(&self) -> Result<Field> {
        self.0.to_field()
    }

    pub fn value(&self) -> Result<Array> {
        self.field()?.value()
    }

    /// Slab of the target field, renamed after the link.
    pub fn get(&self, selection: impl Into<Selection>) -> Result<Field> {
        let result = self.field()?.get(selection)?;
        result.inner_mut().name = self.0.name();
        Ok(result)
    }

    /// Write through to an internal target field.
    pub fn set(&self, selection: impl Into<Selection>, value: impl Into<Array>) -> Result<()> {
        self.check_writable()?;
        self.field()?.set(selection, value)
    }

    /// Tree line: `name -> target`, `name -> file['target']`, with the
    /// class after the name for group targets.
    pub(crate) fn display_line(&self) -> String {
        let name = match self.resolve() {
            LinkState::Group(group) => format!("{}:{}", self.0.name(), group.class()),
            _ => self.0.name(),
        };
        match self.data(|d| d.filename.clone()).flatten() {
            Some(file) => format!("{name} -> {}['{}']", file.display(), self.target()),
            None => format!("{name} -> {}", self.target()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Group {
        let root = Group::root();
        let entry = Group::entry();
        root.set("entry", entry.clone()).unwrap();
        let data = Group::new("NXdata").unwrap();
        entry.set("data", data.clone()).unwrap();
        data.set("x", Field::new(vec![1.0, 2.0, 3.0])).unwrap();
        root
    }

    #[test]
    fn name_from_target() {
        let link = Link::new("/entry/data/x");
        assert_eq!(link.name(), "x");
        assert!(matches!(link.state(), LinkState::Unresolved));
    }

    #[test]
    fn resolves_internal_field() {
        let root = tree();
        let entry = root.group("entry").unwrap();
        entry.set("x_link", Link::new("/entry/data/x")).unwrap();
        let link = entry.get("x_link").unwrap().as_link().unwrap();
        match link.resolve() {
            LinkState::Field(field) => assert_eq!(field.shape(), vec![3]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(link.value().unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(link.display_line(), "x_link -> /entry/data/x");
    }

    #[test]
    fn deleted_target_breaks_link() {
        let root = tree();
        let entry = root.group("entry").unwrap();
        entry.set("x_link", Link::new("/entry/data/x")).unwrap();
        let link = entry.get("x_link").unwrap().as_link().unwrap();
        assert!(link.exists());
        root.group("entry/data").unwrap().delete("x").unwrap();
        assert!(!link.exists());
        assert!(matches!(link.value(), Err(Error::BrokenLink(_))));
    }

    #[test]
    fn group_link_children_are_immutable() {
        let root = tree();
        root.set("alias", Link::new("/entry/data")).unwrap();
        let link = root.get("alias").unwrap().as_link().unwrap();
        assert!(link.display_line().starts_with("alias:NXdata -> "));
        let children = link.children().unwrap();
        assert_eq!(children.len(), 1);
        let x = root.get("alias/x").unwrap();
        assert!(x.is_linked());
        assert!(matches!(x.set_attr("units", "mm"), Err(Error::LinkedItemImmutable(_))));
    }

    #[test]
    fn group_link_follows_target_changes() {
        let root = tree();
        let entry = root.group("entry").unwrap();
        entry.set("alias", Link::new("/entry/data")).unwrap();
        assert_eq!(root.get("entry/alias/x").unwrap().name(), "x");

        let data = root.group("entry/data").unwrap();
        data.set("y", Field::new(vec![4.0])).unwrap();
        data.field("x").unwrap().set(0, 99.0).unwrap();
        let x = root.field("entry/alias/x").unwrap();
        assert_eq!(x.value().unwrap().to_f64_vec().unwrap()[0], 99.0);
        assert!(root.get("entry/alias/y").is_ok());

        entry.delete("data").unwrap();
        assert!(matches!(root.get("entry/alias/x"), Err(Error::BrokenLink(_))));
        let link = entry.get("alias").unwrap().as_link().unwrap();
        assert!(matches!(link.state(), LinkState::Broken));
    }

    #[test]
    fn writes_through_internal_link() {
        let root = tree();
        root.set("x", Link::new("/entry/data/x")).unwrap();
        let link = root.get("x").unwrap().as_link().unwrap();
        link.set(0, 10.0).unwrap();
        link.set_attr("units", "eV").unwrap();
        let x = root.field("entry/data/x").unwrap();
        assert_eq!(x.value().unwrap().to_f64_vec().unwrap()[0], 10.0);
        assert_eq!(x.attr_str("units").as_deref(), Some("eV"));
    }

    #[test]
    fn missing_external_file_is_broken() {
        let root = tree();
        root.set("ext", Link::external("/entry/data", "/no/such/file.nxs")).unwrap();
        let link = root.get("ext").unwrap().as_link().unwrap();
        assert!(matches!(link.resolve(), LinkState::Broken));
        assert!(!link.exists());
        assert!(matches!(link.set(0, 1.0), Err(Error::ReadOnlyLink(_))));
        assert_eq!(link.display_line(), "ext -> /no/such/file.nxs['/entry/data']");
    }

    #[test]
    fn links_to_links_are_refused() {
        let link = Link::new("/a");
        assert!(Link::to(&link).is_err());
    }
}
