//! Groups: named children, path traversal and summation.
//!
//! Children of a group read from a file are loaded on first access. Every
//! mutation loads the group first, so a partially read group is never
//! written back.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::Rc;

use crate::array::{Array, BinaryOp, DType, Scalar};
use crate::attrs::AttrDict;
use crate::classes::{self, ClassKind};
use crate::error::{Error, Result};
use crate::field::{Field, FieldData, FieldState};
use crate::file::Mode;
use crate::link::Link;
use crate::node::{Kind, Node};
use crate::selection::Selection;
use crate::storage::join;
use crate::text;

pub(crate) struct GroupData {
    pub(crate) entries: BTreeMap<String, Node>,
    /// False until the children of a file-backed group have been read.
    pub(crate) loaded: bool,
}

impl GroupData {
    pub(crate) fn loaded() -> Self {
        Self { entries: BTreeMap::new(), loaded: true }
    }

    pub(crate) fn unloaded() -> Self {
        Self { entries: BTreeMap::new(), loaded: false }
    }
}

/// Read the children of a file-backed group if that has not happened yet.
pub(crate) fn load(node: &Node) -> Result<()> {
    let pending = matches!(&node.inner().kind, Kind::Group(data) if !data.loaded);
    if !pending {
        return Ok(());
    }
    let children = match node.locate() {
        Some((file, path)) => file.read_entries(&path)?,
        None => Vec::new(),
    };
    for (name, child) in children {
        attach(node, &name, &child);
    }
    if let Kind::Group(data) = &mut node.inner_mut().kind {
        data.loaded = true;
    }
    Ok(())
}

/// Children of a group node, loading them if necessary.
pub(crate) fn entries(node: &Node) -> Result<Vec<(String, Node)>> {
    load(node)?;
    Ok(match &node.inner().kind {
        Kind::Group(data) => data.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Vec::new(),
    })
}

/// Make `child` the entry `name` of `parent`, detaching whatever it replaces.
pub(crate) fn attach(parent: &Node, name: &str, child: &Node) {
    {
        let mut inner = child.inner_mut();
        inner.name = name.to_string();
        inner.parent = Rc::downgrade(&parent.0);
    }
    if let Kind::Group(data) = &mut parent.inner_mut().kind {
        if let Some(old) = data.entries.insert(name.to_string(), child.clone()) {
            if !old.ptr_eq(child) {
                old.set_parent(None);
            }
        }
    }
}

fn lookup(node: &Node, name: &str) -> Result<Option<Node>> {
    if node.is_link() {
        return Link(node.clone()).child(name);
    }
    load(node)?;
    Ok(match &node.inner().kind {
        Kind::Group(data) => data.entries.get(name).cloned(),
        _ => None,
    })
}

/// Anything that can be stored in a group: a node, or a value that becomes
/// a new field.
#[derive(Debug, Clone)]
pub enum Item {
    Node(Node),
    Value(Array),
    /// A value with a mask of the same shape.
    Masked { value: Array, mask: Array },
}

impl Item {
    pub fn masked(value: impl Into<Array>, mask: impl Into<Array>) -> Item {
        Item::Masked { value: value.into(), mask: mask.into() }
    }
}

impl From<Node> for Item {
    fn from(node: Node) -> Self {
        Item::Node(node)
    }
}

impl From<Field> for Item {
    fn from(field: Field) -> Self {
        Item::Node(field.0)
    }
}

impl From<Group> for Item {
    fn from(group: Group) -> Self {
        Item::Node(group.0)
    }
}

impl From<Link> for Item {
    fn from(link: Link) -> Self {
        Item::Node(link.0)
    }
}

impl From<Array> for Item {
    fn from(value: Array) -> Self {
        Item::Value(value)
    }
}

macro_rules! item_from_value {
    ($($t:ty),* $(,)?) => {$(
        impl From<$t> for Item {
            fn from(v: $t) -> Self {
                Item::Value(Array::from(v))
            }
        }
    )*};
}

item_from_value!(
    i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, &str, String, Scalar,
    Vec<i8>, Vec<i16>, Vec<i32>, Vec<i64>, Vec<u8>, Vec<u16>, Vec<u32>, Vec<u64>,
    Vec<f32>, Vec<f64>, Vec<bool>, Vec<&str>, Vec<String>,
);

/// Build a detached field for a value, carrying any mask in memory.
fn field_for(name: &str, value: Array, mask: Option<Array>) -> Result<Field> {
    let mask = match mask {
        Some(mask) => Some(mask.astype(DType::Bool)?.broadcast_to(value.shape())?.to_bool_vec()?),
        None => None,
    };
    let mut data = FieldData::from_value(value);
    if let FieldState::Value { mask: slot, .. } = &mut data.state {
        *slot = mask;
    }
    Ok(Field::from_data(name, AttrDict::new(), data))
}

/// Handle onto a group node.
#[derive(Debug, Clone)]
pub struct Group(pub(crate) Node);

impl Deref for Group {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl From<Group> for Node {
    fn from(group: Group) -> Node {
        group.0
    }
}

impl Group {
    fn bare(name: &str, class: &str) -> Group {
        Group(Node::from_parts(name, class, AttrDict::new(), Kind::Group(GroupData::loaded())))
    }

    /// Empty `NXroot` named `root`.
    pub fn root() -> Group {
        Self::bare("root", "NXroot")
    }

    /// Empty `NXentry` named `entry`.
    pub fn entry() -> Group {
        Self::bare("entry", "NXentry")
    }

    /// Group of `class`, named after the class without its `NX` prefix.
    pub fn new(class: &str) -> Result<Group> {
        Self::named("", class)
    }

    /// Group of `class` named `name`. An empty name or `unknown` takes the
    /// class's default name; process and note groups get a `date` field.
    pub fn named(name: &str, class: &str) -> Result<Group> {
        classes::validate(class)?;
        let name = match name.trim() {
            "" | "unknown" => classes::default_name(class),
            name => name.to_string(),
        };
        let group = Self::bare(&name, class);
        if classes::is_dated(class) {
            let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
            let date = Field::new(now);
            attach(&group.0, "date", &date.0);
        }
        Ok(group)
    }

    // Lookup

    /// Item at `path`. Absolute paths start at the tree root, `..` moves to
    /// the parent and links to groups are followed.
    pub fn get(&self, path: &str) -> Result<Node> {
        let (mut node, rest) = match path.strip_prefix('/') {
            Some(rest) => (self.0.root(), rest),
            None => (self.0.clone(), path),
        };
        for name in rest.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if name == ".." {
                node = node
                    .parent()
                    .ok_or_else(|| Error::NotFound(format!("'{}' has no parent", node.path())))?;
                continue;
            }
            node = lookup(&node, name)?
                .ok_or_else(|| Error::NotFound(format!("'{name}' not in '{}'", node.path())))?;
        }
        Ok(node)
    }

    /// Field at `path`, following links.
    pub fn field(&self, path: &str) -> Result<Field> {
        self.get(path)?.to_field()
    }

    /// Group at `path`, following links.
    pub fn group(&self, path: &str) -> Result<Group> {
        self.get(path)?.to_group()
    }

    pub fn link(&self, path: &str) -> Result<Link> {
        let node = self.get(path)?;
        node.as_link()
            .ok_or_else(|| Error::InvalidOperation(format!("'{}' is not a link", node.path())))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Child names in sorted order.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.0.children()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&self) -> Result<Vec<Node>> {
        Ok(self.0.children()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn len(&self) -> usize {
        self.0.children().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Children of `class`, in natural name order.
    pub fn component(&self, class: &str) -> Result<Vec<Node>> {
        let mut found: Vec<(String, Node)> =
            self.0.children()?.into_iter().filter(|(_, n)| n.class() == class).collect();
        found.sort_by(|a, b| text::natural_cmp(&a.0, &b.0));
        Ok(found.into_iter().map(|(_, n)| n).collect())
    }

    /// Parent group and final name of `path`.
    fn split_path(&self, path: &str) -> Result<(Node, String)> {
        let path = path.trim().trim_end_matches('/');
        let (parent, key) = match path.rsplit_once('/') {
            Some(("", key)) => (self.get("/")?, key),
            Some((parent, key)) => (self.get(parent)?, key),
            None => (self.0.clone(), path),
        };
        if key.is_empty() {
            return Err(Error::InvalidOperation("invalid key".into()));
        }
        Ok((parent, key.to_string()))
    }

    // Mutation

    /// Store `item` at `path`.
    ///
    /// A node that already belongs to a tree is deep-copied first. In a
    /// file-backed tree, a value assigned to an existing field is written
    /// into it when shape and type agree; otherwise the field is replaced.
    /// An embedded mask becomes a sibling `<name>_mask` field.
    pub fn set(&self, path: &str, item: impl Into<Item>) -> Result<()> {
        let (parent, key) = self.split_path(path)?;
        if parent.is_link() || parent.is_linked() {
            return Err(Error::LinkedItemImmutable(parent.path()));
        }
        let group = parent
            .as_group()
            .ok_or_else(|| Error::InvalidOperation(format!("'{}' is not a group", parent.path())))?;
        group.set_child(&key, item.into())
    }

    fn set_child(&self, key: &str, item: Item) -> Result<()> {
        if self.file_mode() == Some(Mode::Read) {
            return Err(Error::ReadOnlyViolation("NeXus group marked as readonly".into()));
        }
        if let Item::Node(node) = &item {
            if node.is_group() && node.class_kind() == ClassKind::Root {
                return Err(Error::InvalidOperation("cannot assign an NXroot group to another group".into()));
            }
        }
        let existing = lookup(&self.0, key)?;
        let item = match existing {
            Some(existing) if self.file_mode().is_some() => match self.assign_existing(&existing, item)? {
                Some(item) => item,
                None => return Ok(()),
            },
            _ => item,
        };
        let node = match item {
            Item::Node(node) => {
                let bound = node.parent().is_some() || node.inner().file.is_some();
                if bound {
                    node.deep_copy()?
                } else {
                    node
                }
            }
            Item::Value(value) => field_for(key, value, None)?.0,
            Item::Masked { value, mask } => field_for(key, value, Some(mask))?.0,
        };
        attach(&self.0, key, &node);
        if let Some(field) = node.as_field() {
            field.promote_mask()?;
        } else if node.is_group() && node.class_kind() == ClassKind::Entry && self.class_kind() != ClassKind::Root {
            node.set_class("NXsubentry");
        }
        node.update()
    }

    /// Assignment to an existing entry of a file-backed group. Returns the
    /// item when it should replace the entry.
    fn assign_existing(&self, existing: &Node, item: Item) -> Result<Option<Item>> {
        if let Item::Node(node) = &item {
            if node.is_group() {
                return Err(Error::InvalidOperation("cannot assign a group to an existing group entry".into()));
            }
            if node.is_link() {
                return Err(Error::InvalidOperation("cannot assign a link to an existing group entry".into()));
            }
        }
        if existing.is_link() {
            return Err(Error::InvalidOperation(format!("cannot assign values to the link '{}'", existing.name())));
        }
        if existing.is_linked() {
            return Err(Error::LinkedItemImmutable(existing.path()));
        }
        let Some(field) = existing.as_field() else {
            return Ok(Some(item));
        };
        let (value, mask, attrs) = match &item {
            Item::Node(node) => {
                let source = Field(node.clone());
                (source.value()?, source.mask()?, source.attrs())
            }
            Item::Value(value) => (value.clone(), None, AttrDict::new()),
            Item::Masked { value, mask } => (value.clone(), Some(mask.clone()), AttrDict::new()),
        };
        let compatible = field.dtype().is_some_and(|dtype| {
            dtype.is_text() == value.dtype().is_text() && (dtype.is_bool() || !value.dtype().is_bool())
        }) && field.shape() == value.shape();
        if !compatible {
            self.delete_child(&existing.name())?;
            return Ok(Some(item));
        }
        field.set(Selection::all(), value)?;
        for (name, attr) in attrs.iter() {
            field.set_attr(name, attr.clone())?;
        }
        if let Some(mask) = mask {
            field.set_mask(Some(mask))?;
        }
        Ok(None)
    }

    /// Remove the item at `path`, together with its mask field, from the
    /// tree and from a read-write file.
    pub fn delete(&self, path: &str) -> Result<()> {
        let (parent, key) = self.split_path(path)?;
        if parent.file_mode() == Some(Mode::Read) {
            return Err(Error::ReadOnlyViolation("NeXus file opened as readonly".into()));
        }
        if parent.is_link() || parent.is_linked() {
            return Err(Error::LinkedItemImmutable(format!("cannot delete an item in a linked group ({})", parent.path())));
        }
        let group = parent
            .as_group()
            .ok_or_else(|| Error::InvalidOperation(format!("'{}' is not a group", parent.path())))?;
        group.delete_child(&key)
    }

    fn delete_child(&self, key: &str) -> Result<()> {
        let child = lookup(&self.0, key)?
            .ok_or_else(|| Error::NotFound(format!("'{key}' not in '{}'", self.path())))?;
        let mask = if child.is_field() { child.inner().attrs.get_str("mask") } else { None };
        let mask = mask.filter(|m| lookup(&self.0, m).ok().flatten().is_some());
        if self.file_mode() == Some(Mode::ReadWrite) {
            if let Some((file, path)) = self.0.locate() {
                if let Some(mask) = &mask {
                    file.delete(&join(&path, mask))?;
                }
                file.delete(&join(&path, key))?;
            }
        }
        if let Kind::Group(data) = &mut self.0.inner_mut().kind {
            for name in mask.iter().map(String::as_str).chain([key]) {
                if let Some(old) = data.entries.remove(name) {
                    old.set_parent(None);
                }
            }
        }
        if matches!(self.class_kind(), ClassKind::Data | ClassKind::Monitor) {
            if self.attr_str("signal").as_deref() == Some(key) {
                self.0.delete_attr("signal")?;
            } else if let Some(axes) = self.attrs().get_names("axes") {
                let axes: Vec<String> = axes
                    .into_iter()
                    .map(|a| if a == key { ".".to_string() } else { a })
                    .collect();
                self.0.set_attr("axes", axes)?;
            }
        }
        self.0.set_changed();
        Ok(())
    }

    /// Move the entry `old` to `new` in the child map.
    pub(crate) fn rekey(&self, old: &str, new: &str) {
        if let Kind::Group(data) = &mut self.0.inner_mut().kind {
            if let Some(node) = data.entries.remove(old) {
                data.entries.insert(new.to_string(), node);
            }
        }
    }

    /// Follow a renamed child in the `signal` and `axes` attributes.
    pub(crate) fn rename_binding(&self, old: &str, new: &str) -> Result<()> {
        if self.attr_str("signal").as_deref() == Some(old) {
            self.0.set_attr("signal", new)?;
        }
        if let Some(names) = self.attrs().get_names("axes") {
            if names.iter().any(|a| a == old) {
                let names: Vec<String> =
                    names.into_iter().map(|a| if a == old { new.to_string() } else { a }).collect();
                self.0.set_attr("axes", names)?;
            }
        }
        Ok(())
    }

    /// Move a child to another group of the same tree, optionally renaming
    /// it.
    pub fn move_item(&self, item: &str, destination: &str, name: Option<&str>) -> Result<()> {
        let node = self
            .get(item)
            .map_err(|_| Error::NotFound(format!("'{item}' not in group")))?;
        let dest = match self.get(destination) {
            Ok(dest) => dest,
            Err(_) => self
                .0
                .root()
                .as_group()
                .and_then(|root| root.get(destination).ok())
                .ok_or_else(|| Error::NotFound(format!("'{destination}' not in tree")))?,
        };
        let dest = dest
            .as_group()
            .ok_or_else(|| Error::InvalidOperation("destination must be a valid NeXus group".into()))?;
        if !node.root().ptr_eq(&dest.root()) {
            return Err(Error::InvalidOperation("the item can only be moved within the same tree".into()));
        }
        let name = name.map(str::to_string).unwrap_or_else(|| node.name());
        if dest.contains(&name) {
            return Err(Error::InvalidOperation(format!("'{name}' already in the destination group")));
        }
        let source = node
            .parent_group()
            .ok_or_else(|| Error::InvalidOperation("cannot move an unattached item".into()))?;
        dest.set(&name, node.clone())?;
        source.delete(&node.name())
    }

    /// Add a new child; fails if the name is taken. Nodes keep their own
    /// name unless one is given, plain values are named `unknown`.
    pub fn insert(&self, item: impl Into<Item>, name: Option<&str>) -> Result<()> {
        let item = item.into();
        let name = match (name, &item) {
            (Some(name), _) if name != "unknown" => name.to_string(),
            (_, Item::Node(node)) => node.name(),
            _ => "unknown".to_string(),
        };
        if lookup(&self.0, &name)?.is_some() {
            return Err(Error::InvalidOperation(format!("'{name}' already exists in group")));
        }
        self.set(&name, item)
    }

    /// Link to `target`. Targets in another tree become external links to
    /// the file holding them.
    pub fn make_link(&self, target: &Node, name: Option<&str>, abspath: bool) -> Result<()> {
        if target.is_link() {
            return Err(Error::InvalidOperation("cannot link to a link".into()));
        }
        if self.0.root().class_kind() != ClassKind::Root {
            return Err(Error::InvalidOperation("the group must have a root object of class NXroot".into()));
        }
        if target.is_external() {
            return Err(Error::InvalidOperation("cannot link to an object in an externally linked group".into()));
        }
        let name = name.map(str::to_string).unwrap_or_else(|| target.name());
        if self.contains(&name) {
            return Err(Error::InvalidOperation(format!(
                "object with the same name already exists in '{}'",
                self.path()
            )));
        }
        let link = if target.root().ptr_eq(&self.0.root()) {
            Link::to(target)?
        } else {
            let file = target.file_name().ok_or_else(|| {
                Error::InvalidOperation("an external link target must be saved in a file".into())
            })?;
            Link::external(&target.file_path(), file).with_abspath(abspath)
        };
        self.set(&name, link)
    }

    pub fn deep_copy(&self) -> Result<Group> {
        Ok(Group(self.0.deep_copy()?))
    }

    // Summation

    /// Sum the signal over `axes` (all when `None`). Summed axes are kept as
    /// scalar fields at their midpoint carrying `minimum`, `maximum` and
    /// `summed_bins`.
    pub fn sum(&self, axes: Option<&[usize]>) -> Result<Group> {
        self.summed(axes, false)
    }

    /// Like [`Group::sum`] divided by the number of summed bins.
    pub fn average(&self, axes: Option<&[usize]>) -> Result<Group> {
        self.summed(axes, true)
    }

    fn summed(&self, axes: Option<&[usize]>, averaged: bool) -> Result<Group> {
        if self.class_kind() == ClassKind::Generic && self.class() == "NXgroup" {
            return Err(Error::InvalidOperation("summing not allowed for groups of unknown class".into()));
        }
        let signal = self.signal()?.ok_or_else(|| Error::InvalidOperation("no signal to sum".into()))?;
        let axes: Vec<usize> = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..signal.ndim()).collect(),
        };
        let all_axes = self.axes()?.unwrap_or_default();
        if let Some(&bad) = axes.iter().find(|&&a| a >= all_axes.len()) {
            return Err(Error::InvalidOperation(format!("invalid axis {bad}")));
        }
        let summed = Field::from_array(&signal.name(), signal.value()?.sum_axes(&axes)?, signal.attrs().safe());
        let mut averages = Vec::with_capacity(axes.len());
        let mut summed_bins: i64 = 1;
        for &a in &axes {
            let axis = &all_axes[a];
            let values = axis.to_f64_vec()?;
            let (first, last) = match (values.first(), values.last()) {
                (Some(&f), Some(&l)) => (f, l),
                _ => (0.0, 0.0),
            };
            let mut attrs = axis.attrs();
            attrs.insert("minimum", first);
            attrs.insert("maximum", last);
            attrs.insert("summed_bins", axis.size() as i64);
            summed_bins *= axis.size() as i64;
            averages.push(Field::from_array(&axis.name(), Array::scalar(0.5 * (first + last)), attrs));
        }
        let kept: Vec<Field> = all_axes
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, a)| a.clone())
            .collect();
        let result = Group::data_with(Some(summed), kept, None, None)?;
        for average in averages {
            result.insert(average, None)?;
        }
        let bins = summed_bins as f64;
        if averaged {
            let signal = result.signal()?.ok_or_else(|| Error::InvalidOperation("no signal".into()))?;
            result.set(&signal.name(), (&signal / bins)?)?;
            result.set_attr("averaged_bins", summed_bins)?;
        } else {
            result.set_attr("summed_bins", summed_bins)?;
        }
        if let Some(errors) = self.errors()? {
            let squared = errors.value()?.binary(&Array::scalar(2.0), BinaryOp::Pow)?;
            let mut summed = squared.sum_axes(&axes)?.sqrt()?;
            if averaged {
                summed = summed.binary(&Array::scalar(bins), BinaryOp::Div)?;
            }
            result.set_errors(Field::new(summed))?;
        }
        if let Some(weights) = self.weights()? {
            let mut summed = weights.value()?.sum_axes(&axes)?;
            if averaged {
                summed = summed.binary(&Array::scalar(bins), BinaryOp::Div)?;
            }
            result.set_weights(Field::new(summed))?;
        }
        result.set("title", self.title())?;
        Ok(result)
    }

    /// Moment of the one-dimensional signal about `center`, or about its
    /// mean, using axis bin centers.
    pub fn moment(&self, order: i32, center: Option<f64>) -> Result<f64> {
        let signal = self
            .signal()?
            .ok_or_else(|| Error::InvalidOperation("no signal to calculate".into()))?;
        if signal.ndim() > 1 {
            return Err(Error::InvalidOperation("operation only possible on one-dimensional signals".into()));
        }
        let values = signal.to_f64_vec()?;
        let total: f64 = values.iter().sum();
        let y: Vec<f64> = values.iter().map(|v| v / total).collect();
        let axes = self.axes()?.unwrap_or_default();
        let x = match axes.first() {
            Some(axis) => centers(&axis.to_f64_vec()?, y.len()),
            None => (0..y.len()).map(|i| i as f64).collect(),
        };
        let c = center.unwrap_or_else(|| y.iter().zip(&x).map(|(y, x)| y * x).sum());
        if order == 1 {
            return Ok(c);
        }
        Ok(y.iter().zip(&x).map(|(y, x)| y * (x - c).powi(order)).sum())
    }

    pub fn mean(&self) -> Result<f64> {
        self.moment(1, None)
    }

    pub fn var(&self) -> Result<f64> {
        Ok(self.moment(2, None)?.abs())
    }

    pub fn std(&self) -> Result<f64> {
        Ok(self.var()?.sqrt())
    }

    // Defaults and titles

    /// Data group named by the chain of `default` attributes.
    pub fn get_default(&self) -> Result<Option<Group>> {
        if matches!(self.class_kind(), ClassKind::Data | ClassKind::Monitor) {
            return Ok(Some(self.clone()));
        }
        let Some(name) = self.attr_str("default") else {
            return Ok(None);
        };
        match self.get(&name).ok().and_then(|n| n.to_group().ok()) {
            Some(group) => group.get_default(),
            None => Ok(None),
        }
    }

    /// Make this entry or data group its parent's default, and the parent
    /// its own parent's default unless one is set already or `over` is true.
    pub fn set_default(&self, over: bool) -> Result<()> {
        match self.class_kind() {
            ClassKind::Root => return Ok(()),
            ClassKind::Data | ClassKind::Entry | ClassKind::Subentry => {}
            _ => {
                return Err(Error::InvalidOperation(
                    "can only set the default for NXentry and NXdata groups".into(),
                ))
            }
        }
        let parent = self.parent_group().ok_or_else(|| {
            Error::InvalidOperation("the default cannot be defined without a parent group".into())
        })?;
        if !matches!(parent.class_kind(), ClassKind::Entry | ClassKind::Subentry | ClassKind::Root) {
            return Err(Error::InvalidOperation(
                "the default can only be defined in a NXentry or NXroot group".into(),
            ));
        }
        parent.set_attr("default", self.name())?;
        if let Some(grandparent) = parent.parent_group() {
            if over || grandparent.get_default()?.is_none() {
                parent.set_default(over)?;
            }
        }
        Ok(())
    }

    /// Children flagged with a `signal` attribute, keyed by its value.
    pub fn signals(&self) -> Result<BTreeMap<String, Field>> {
        let mut signals = BTreeMap::new();
        for (_, child) in self.0.children()? {
            let key = child.attr("signal").and_then(|a| a.item()).map(|s| match s {
                Scalar::Text(text) => text,
                other => other.as_i64().map(|i| i.to_string()).unwrap_or_default(),
            });
            if let Some(key) = key {
                if let Ok(field) = child.to_field() {
                    signals.insert(key, field);
                }
            }
        }
        Ok(signals)
    }

    /// Text of a `title` field here or in the parent, else a name built
    /// from the tree or file and the path.
    pub fn title(&self) -> String {
        let title_of = |group: &Group| -> Option<String> {
            let node = lookup(&group.0, "title").ok().flatten()?;
            node.to_field().ok()?.text().ok()
        };
        if let Some(title) = title_of(self) {
            return title;
        }
        if let Some(title) = self.parent_group().as_ref().and_then(title_of) {
            return title;
        }
        let root = self.0.root();
        let root_name = root.name();
        let path = self.path();
        if !root_name.is_empty() && root_name != "root" {
            return format!("{root_name}/{}", path.trim_start_matches('/')).trim_end_matches('/').to_string();
        }
        match self.file_name() {
            Some(file) => {
                let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                format!("{name}:{path}")
            }
            None => path,
        }
    }
}

/// Bin centers: midpoints when `axis` holds boundaries, else the values.
pub(crate) fn centers(axis: &[f64], n: usize) -> Vec<f64> {
    if axis.len() == n + 1 {
        axis.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
    } else {
        axis.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Group {
        let root = Group::root();
        let entry = Group::entry();
        root.set("entry", entry).unwrap();
        root.set("entry/sample", Group::new("NXsample").unwrap()).unwrap();
        root.set("entry/sample/temperature", 40.0).unwrap();
        root
    }

    #[test]
    fn multi_segment_paths() {
        let root = sample();
        let t = root.field("entry/sample/temperature").unwrap();
        assert_eq!(t.item().unwrap(), Scalar::Float(40.0));
        let sample = root.group("entry/sample").unwrap();
        assert!(sample.get("/entry").unwrap().ptr_eq(&root.get("entry").unwrap()));
        assert_eq!(sample.get("..").unwrap().name(), "entry");
        assert!(matches!(root.get("entry/missing"), Err(Error::NotFound(_))));
        assert!(root.contains("/entry/sample"));
        assert!(root.get("/").unwrap().ptr_eq(&root));
    }

    #[test]
    fn default_names_and_dates() {
        let group = Group::new("NXmonitor").unwrap();
        assert_eq!(group.name(), "monitor");
        assert_eq!(Group::named("unknown", "NXsample").unwrap().name(), "sample");
        let process = Group::new("NXprocess").unwrap();
        assert!(process.contains("date"));
        assert!(Group::new("sample").is_err());
    }

    #[test]
    fn attached_nodes_are_copied() {
        let root = sample();
        let t = root.get("entry/sample/temperature").unwrap();
        root.set("entry/copy", t.clone()).unwrap();
        let copy = root.get("entry/copy").unwrap();
        assert!(!copy.ptr_eq(&t));
        assert_eq!(copy.name(), "copy");
        assert!(t.parent().is_some());
    }

    #[test]
    fn nested_entries_become_subentries() {
        let root = Group::root();
        root.set("entry", Group::entry()).unwrap();
        root.set("entry/sub", Group::entry()).unwrap();
        assert_eq!(root.get("entry").unwrap().class(), "NXentry");
        assert_eq!(root.get("entry/sub").unwrap().class(), "NXsubentry");
    }

    #[test]
    fn roots_cannot_be_nested() {
        let entry = Group::entry();
        let err = entry.set("root", Group::root()).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn masked_values_promote_to_sibling() {
        let data = Group::new("NXdata").unwrap();
        data.set("counts", Item::masked(vec![1.0, 2.0, 3.0], vec![false, true, false])).unwrap();
        let counts = data.field("counts").unwrap();
        assert_eq!(counts.attr_str("mask").as_deref(), Some("counts_mask"));
        let mask = data.field("counts_mask").unwrap();
        assert_eq!(mask.value().unwrap().to_bool_vec().unwrap(), vec![false, true, false]);
        data.delete("counts").unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn delete_updates_bindings() {
        let data = Group::new("NXdata").unwrap();
        data.set("x", vec![1.0, 2.0]).unwrap();
        data.set("y", vec![1.0, 2.0]).unwrap();
        data.set("z", vec![3.0, 4.0]).unwrap();
        data.set_attr("signal", "z").unwrap();
        data.set_attr("axes", vec!["x", "y"]).unwrap();
        data.delete("x").unwrap();
        assert_eq!(data.attrs().get_strings("axes").unwrap(), vec![".", "y"]);
        data.delete("z").unwrap();
        assert!(!data.has_attr("signal"));
        assert!(matches!(data.delete("z"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rename_follows_bindings() {
        let data = Group::new("NXdata").unwrap();
        data.set("x", vec![1.0, 2.0]).unwrap();
        data.set("v", vec![1.0, 2.0]).unwrap();
        data.set_attr("signal", "v").unwrap();
        data.set_attr("axes", "x").unwrap();
        data.get("x").unwrap().rename("q").unwrap();
        data.get("v").unwrap().rename("counts").unwrap();
        assert_eq!(data.attr_str("signal").as_deref(), Some("counts"));
        assert_eq!(data.attrs().get_strings("axes").unwrap(), vec!["q"]);
    }

    #[test]
    fn move_and_insert() {
        let root = sample();
        root.set("entry/instrument", Group::new("NXinstrument").unwrap()).unwrap();
        let entry = root.group("entry").unwrap();
        entry.move_item("sample/temperature", "instrument", Some("t")).unwrap();
        assert!(root.contains("entry/instrument/t"));
        assert!(!root.contains("entry/sample/temperature"));
        entry.insert(Field::new(1i32), Some("run")).unwrap();
        assert!(entry.insert(2i32, Some("run")).is_err());
        entry.insert(Group::new("NXuser").unwrap(), None).unwrap();
        assert!(entry.contains("user"));
    }

    #[test]
    fn components_in_natural_order() {
        let entry = Group::entry();
        for name in ["data10", "data2", "data1"] {
            entry.set(name, Group::new("NXdata").unwrap()).unwrap();
        }
        entry.set("sample", Group::new("NXsample").unwrap()).unwrap();
        let names: Vec<String> = entry.component("NXdata").unwrap().iter().map(Node::name).collect();
        assert_eq!(names, vec!["data1", "data2", "data10"]);
    }

    #[test]
    fn internal_links_from_make_link() {
        let root = sample();
        let t = root.get("entry/sample/temperature").unwrap();
        let entry = root.group("entry").unwrap();
        entry.make_link(&t, Some("temp"), false).unwrap();
        let link = entry.link("temp").unwrap();
        assert_eq!(link.target(), "/entry/sample/temperature");
        assert!(entry.make_link(&link, None, false).is_err());
        let detached = Group::entry();
        assert!(detached.make_link(&t, None, false).is_err());
    }

    #[test]
    fn defaults_chain_upwards() {
        let root = Group::root();
        root.set("entry", Group::entry()).unwrap();
        root.set("entry/data", Group::new("NXdata").unwrap()).unwrap();
        let data = root.group("entry/data").unwrap();
        data.set_default(false).unwrap();
        assert_eq!(root.group("entry").unwrap().attr_str("default").as_deref(), Some("data"));
        assert_eq!(root.attr_str("default").as_deref(), Some("entry"));
        assert!(root.get_default().unwrap().unwrap().ptr_eq(&data));
        assert!(Group::new("NXsample").unwrap().set_default(false).is_err());
    }

    #[test]
    fn titles() {
        let root = sample();
        let sample = root.group("entry/sample").unwrap();
        assert_eq!(sample.title(), "/entry/sample");
        root.set("entry/title", "Run 12").unwrap();
        assert_eq!(sample.title(), "Run 12");
        assert_eq!(root.group("entry").unwrap().title(), "Run 12");
    }

    #[test]
    fn signals_by_attribute() {
        let data = Group::new("NXdata").unwrap();
        data.set("a", vec![1.0]).unwrap();
        data.set("b", vec![2.0]).unwrap();
        data.field("a").unwrap().set_attr("signal", 1).unwrap();
        data.field("b").unwrap().set_attr("signal", 2).unwrap();
        let signals = data.signals().unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals["2"].name(), "b");
    }

    #[test]
    fn centers_of_boundaries() {
        assert_eq!(centers(&[0.0, 1.0, 2.0], 2), vec![0.5, 1.5]);
        assert_eq!(centers(&[0.0, 1.0], 2), vec![0.0, 1.0]);
    }
}
