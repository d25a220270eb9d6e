//! In-memory engine.
//!
//! Objects live in an arena indexed by id, with the root group at 0. The
//! engine never touches the filesystem: it serves as the scratch store for
//! large unattached fields and as the staging area for copies.

use std::collections::BTreeMap;

use super::filters::Pipeline;
use super::{
    split, DatasetLayout, Entry, LinkSpec, ObjectKind, StorageEngine, StorageError,
    StorageResult,
};
use crate::array::Array;
use crate::attrs::AttrDict;
use crate::selection::{Hyperslab, SlabDim};

/// Soft links may point at soft links; give up after this many hops.
const MAX_LINK_DEPTH: usize = 32;

#[derive(Debug, Clone)]
enum LinkEntry {
    Hard(usize),
    Soft(String),
    External { file: String, path: String },
}

#[derive(Debug, Clone)]
enum Object {
    Group {
        links: BTreeMap<String, LinkEntry>,
        attrs: AttrDict,
    },
    Dataset {
        layout: DatasetLayout,
        value: Array,
        attrs: AttrDict,
    },
}

impl Object {
    fn empty_group() -> Object {
        Object::Group { links: BTreeMap::new(), attrs: AttrDict::new() }
    }

    fn kind(&self) -> ObjectKind {
        match self {
            Object::Group { .. } => ObjectKind::Group,
            Object::Dataset { .. } => ObjectKind::Dataset,
        }
    }

    fn attrs(&self) -> &AttrDict {
        match self {
            Object::Group { attrs, .. } | Object::Dataset { attrs, .. } => attrs,
        }
    }

    fn attrs_mut(&mut self) -> &mut AttrDict {
        match self {
            Object::Group { attrs, .. } | Object::Dataset { attrs, .. } => attrs,
        }
    }
}

#[derive(Debug)]
pub struct NativeEngine {
    objects: Vec<Object>,
}

impl Default for NativeEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl NativeEngine {
    /// Empty engine holding only the root group.
    pub fn in_memory() -> Self {
        Self { objects: vec![Object::empty_group()] }
    }

    fn object(&self, id: usize) -> StorageResult<&Object> {
        self.objects.get(id).ok_or_else(|| StorageError::Corrupt(format!("dangling object {id}")))
    }

    fn object_mut(&mut self, id: usize) -> StorageResult<&mut Object> {
        self.objects.get_mut(id).ok_or_else(|| StorageError::Corrupt(format!("dangling object {id}")))
    }

    /// Object id at `path`, following every link.
    fn resolve(&self, path: &str) -> StorageResult<usize> {
        self.resolve_depth(path, 0)
    }

    fn resolve_depth(&self, path: &str, depth: usize) -> StorageResult<usize> {
        if depth > MAX_LINK_DEPTH {
            return Err(StorageError::Invalid(format!("too many levels of links at '{path}'")));
        }
        let mut id = 0;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let Object::Group { links, .. } = self.object(id)? else {
                return Err(StorageError::NotFound(path.to_string()));
            };
            id = match links.get(name) {
                Some(LinkEntry::Hard(target)) => *target,
                Some(LinkEntry::Soft(target)) => self.resolve_depth(target, depth + 1)?,
                Some(LinkEntry::External { file, .. }) => {
                    return Err(StorageError::Invalid(format!(
                        "'{path}' passes through an external link to '{file}'"
                    )));
                }
                None => return Err(StorageError::NotFound(path.to_string())),
            };
        }
        Ok(id)
    }

    /// Group id of the parent of `path` and the final name.
    fn parent_of(&self, path: &str) -> StorageResult<(usize, String)> {
        let (parent, name) = split(path);
        if name.is_empty() {
            return Err(StorageError::Invalid("the root has no parent".into()));
        }
        let id = self.resolve(&parent)?;
        match self.object(id)? {
            Object::Group { .. } => Ok((id, name)),
            Object::Dataset { .. } => Err(StorageError::Invalid(format!("'{parent}' is not a group"))),
        }
    }

    fn links_mut(&mut self, id: usize) -> StorageResult<&mut BTreeMap<String, LinkEntry>> {
        match self.object_mut(id)? {
            Object::Group { links, .. } => Ok(links),
            Object::Dataset { .. } => Err(StorageError::Invalid("not a group".into())),
        }
    }

    /// Insert a new link, refusing to overwrite.
    fn add_link(&mut self, path: &str, link: LinkEntry) -> StorageResult<()> {
        let (parent, name) = self.parent_of(path)?;
        let links = self.links_mut(parent)?;
        if links.contains_key(&name) {
            return Err(StorageError::Exists(path.to_string()));
        }
        links.insert(name, link);
        Ok(())
    }

    fn add_object(&mut self, path: &str, object: Object) -> StorageResult<()> {
        let id = self.objects.len();
        self.objects.push(object);
        if let Err(e) = self.add_link(path, LinkEntry::Hard(id)) {
            self.objects.pop();
            return Err(e);
        }
        Ok(())
    }

    fn dataset(&self, path: &str) -> StorageResult<(&DatasetLayout, &Array)> {
        match self.object(self.resolve(path)?)? {
            Object::Dataset { layout, value, .. } => Ok((layout, value)),
            Object::Group { .. } => Err(StorageError::Invalid(format!("'{path}' is a group"))),
        }
    }

    fn dataset_mut(&mut self, path: &str) -> StorageResult<(&mut DatasetLayout, &mut Array)> {
        let id = self.resolve(path)?;
        match self.object_mut(id)? {
            Object::Dataset { layout, value, .. } => Ok((layout, value)),
            Object::Group { .. } => Err(StorageError::Invalid(format!("'{path}' is a group"))),
        }
    }
}

impl StorageEngine for NativeEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn writable(&self) -> bool {
        true
    }

    fn entry(&self, path: &str) -> StorageResult<Entry> {
        if path.split('/').all(str::is_empty) {
            return Ok(Entry::Group);
        }
        let (parent, name) = self.parent_of(path)?;
        let Object::Group { links, .. } = self.object(parent)? else {
            return Err(StorageError::NotFound(path.to_string()));
        };
        match links.get(&name) {
            Some(LinkEntry::Hard(id)) => Ok(match self.object(*id)?.kind() {
                ObjectKind::Group => Entry::Group,
                ObjectKind::Dataset => Entry::Dataset,
            }),
            Some(LinkEntry::Soft(target)) => Ok(Entry::Soft(target.clone())),
            Some(LinkEntry::External { file, path }) => {
                Ok(Entry::External { file: file.clone(), path: path.clone() })
            }
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn kind(&self, path: &str) -> StorageResult<ObjectKind> {
        Ok(self.object(self.resolve(path)?)?.kind())
    }

    fn members(&self, path: &str) -> StorageResult<Vec<String>> {
        match self.object(self.resolve(path)?)? {
            Object::Group { links, .. } => Ok(links.keys().cloned().collect()),
            Object::Dataset { .. } => Err(StorageError::Invalid(format!("'{path}' is not a group"))),
        }
    }

    fn create_group(&mut self, path: &str) -> StorageResult<()> {
        self.add_object(path, Object::empty_group())
    }

    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> StorageResult<()> {
        Pipeline::for_layout(layout)?;
        if let Some(max) = &layout.maxshape {
            if !layout.allows(&layout.shape) {
                return Err(StorageError::Invalid(format!(
                    "shape {:?} exceeds maximum {max:?}",
                    layout.shape
                )));
            }
        }
        let value = Array::filled(layout.dtype, &layout.shape, &layout.fill())
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        self.add_object(path, Object::Dataset { layout: layout.clone(), value, attrs: AttrDict::new() })
    }

    fn layout(&self, path: &str) -> StorageResult<DatasetLayout> {
        Ok(self.dataset(path)?.0.clone())
    }

    fn read(&self, path: &str, slab: &Hyperslab) -> StorageResult<Array> {
        let (_, value) = self.dataset(path)?;
        value.slab(slab).map_err(|e| StorageError::Invalid(e.to_string()))
    }

    fn read_all(&self, path: &str) -> StorageResult<Array> {
        Ok(self.dataset(path)?.1.clone())
    }

    fn write(&mut self, path: &str, slab: &Hyperslab, value: &Array) -> StorageResult<()> {
        let (_, data) = self.dataset_mut(path)?;
        data.assign(slab, value).map_err(|e| StorageError::Invalid(e.to_string()))
    }

    fn resize(&mut self, path: &str, shape: &[usize]) -> StorageResult<()> {
        let (layout, data) = self.dataset_mut(path)?;
        if layout.maxshape.is_none() || !layout.allows(shape) {
            return Err(StorageError::Invalid(format!(
                "cannot resize '{path}' to {shape:?} (maximum {:?})",
                layout.maxshape
            )));
        }
        let mut resized = Array::filled(layout.dtype, shape, &layout.fill())
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        let overlap = Hyperslab::new(
            layout
                .shape
                .iter()
                .zip(shape)
                .map(|(&old, &new)| SlabDim::whole(old.min(new)))
                .collect(),
        );
        let kept = data.slab(&overlap).map_err(|e| StorageError::Invalid(e.to_string()))?;
        resized
            .assign(&overlap, &kept)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        *data = resized;
        layout.shape = shape.to_vec();
        Ok(())
    }

    fn attrs(&self, path: &str) -> StorageResult<AttrDict> {
        Ok(self.object(self.resolve(path)?)?.attrs().clone())
    }

    fn set_attr(&mut self, path: &str, name: &str, value: &Array) -> StorageResult<()> {
        let id = self.resolve(path)?;
        self.object_mut(id)?.attrs_mut().insert(name, value.clone());
        Ok(())
    }

    fn delete_attr(&mut self, path: &str, name: &str) -> StorageResult<()> {
        let id = self.resolve(path)?;
        if self.object_mut(id)?.attrs_mut().remove(name).is_none() {
            return Err(StorageError::NotFound(format!("{path}@{name}")));
        }
        Ok(())
    }

    fn link(&mut self, path: &str, spec: &LinkSpec) -> StorageResult<()> {
        let link = match spec {
            LinkSpec::Hard(target) => LinkEntry::Hard(self.resolve(target)?),
            LinkSpec::Soft(target) => LinkEntry::Soft(target.clone()),
            LinkSpec::External { file, path } => {
                LinkEntry::External { file: file.clone(), path: path.clone() }
            }
        };
        self.add_link(path, link)
    }

    fn delete(&mut self, path: &str) -> StorageResult<()> {
        let (parent, name) = self.parent_of(path)?;
        if self.links_mut(parent)?.remove(&name).is_none() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> StorageResult<()> {
        let (old_parent, old_name) = self.parent_of(from)?;
        let (new_parent, new_name) = self.parent_of(to)?;
        if self.links_mut(new_parent)?.contains_key(&new_name) {
            return Err(StorageError::Exists(to.to_string()));
        }
        let link = self
            .links_mut(old_parent)?
            .remove(&old_name)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        self.links_mut(new_parent)?.insert(new_name, link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{DType, Scalar};
    use crate::selection::Selection;

    fn engine_with_data() -> NativeEngine {
        let mut e = NativeEngine::in_memory();
        e.create_group("/entry").unwrap();
        let mut layout = DatasetLayout::new(DType::F64, &[2, 3]);
        layout.maxshape = Some(vec![None, Some(3)]);
        layout.fillvalue = Some(Scalar::Float(-1.0));
        e.create_dataset("/entry/counts", &layout).unwrap();
        e
    }

    #[test]
    fn datasets_start_with_fill_value() {
        let e = engine_with_data();
        let value = e.read_all("/entry/counts").unwrap();
        assert_eq!(value.to_f64_vec().unwrap(), vec![-1.0; 6]);
    }

    #[test]
    fn slab_write_then_read() {
        let mut e = engine_with_data();
        let slab = Selection::from((1, 0..2)).resolve(&[2, 3]).unwrap();
        e.write("/entry/counts", &slab, &Array::from(vec![5.0, 6.0])).unwrap();
        let row = e.read("/entry/counts", &Selection::from(1).resolve(&[2, 3]).unwrap()).unwrap();
        assert_eq!(row.to_f64_vec().unwrap(), vec![5.0, 6.0, -1.0]);
    }

    #[test]
    fn resize_respects_maxshape() {
        let mut e = engine_with_data();
        e.resize("/entry/counts", &[4, 3]).unwrap();
        assert_eq!(e.layout("/entry/counts").unwrap().shape, vec![4, 3]);
        assert!(e.resize("/entry/counts", &[4, 4]).is_err());
    }

    #[test]
    fn soft_links_resolve() {
        let mut e = engine_with_data();
        e.link("/alias", &LinkSpec::Soft("/entry/counts".into())).unwrap();
        assert_eq!(e.entry("/alias").unwrap(), Entry::Soft("/entry/counts".into()));
        assert_eq!(e.kind("/alias").unwrap(), ObjectKind::Dataset);
        e.delete("/entry/counts").unwrap();
        assert!(matches!(e.kind("/alias"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn hard_links_share_objects() {
        let mut e = engine_with_data();
        e.link("/entry/same", &LinkSpec::Hard("/entry/counts".into())).unwrap();
        e.write("/entry/same", &Hyperslab::full(&[2, 3]), &Array::from(0.0)).unwrap();
        assert_eq!(e.read_all("/entry/counts").unwrap().sum_all().unwrap(), 0.0);
    }

    #[test]
    fn existing_names_are_refused() {
        let mut e = engine_with_data();
        assert!(matches!(e.create_group("/entry"), Err(StorageError::Exists(_))));
        assert!(matches!(e.create_group("/missing/child"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn rename_moves_link() {
        let mut e = engine_with_data();
        e.rename("/entry/counts", "/entry/data").unwrap();
        assert_eq!(e.members("/entry").unwrap(), vec!["data".to_string()]);
    }
}
