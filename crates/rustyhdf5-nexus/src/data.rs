//! Data, entry and root behaviour of [`Group`].
//!
//! A data group binds one signal field and its axes through the `signal`
//! and `axes` attributes. Errors and weights are found by name next to the
//! signal. Slicing a data group slices the signal, its axes and its errors
//! together, converting axis values to positions where needed.

use std::ops::{Add, Div, Mul, Sub};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::array::{Array, BinaryOp};
use crate::classes::ClassKind;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::file::{File, Mode};
use crate::group::Group;
use crate::selection::{convert_index, Coord, Index, Selection};

fn no_signal() -> Error {
    Error::InvalidOperation("no signal defined for the NXdata group".into())
}

/// Make a range stop inclusive of the matched element.
fn inclusive(index: Index) -> Index {
    match index {
        Index::Range { start, stop: Some(Coord::Int(stop)), step } => {
            Index::Range { start, stop: Some(Coord::Int(stop - 1)), step }
        }
        other => other,
    }
}

/// Extend a range stop by one, for axes holding bin boundaries.
fn extended(index: &Index) -> Index {
    match index {
        Index::Range { start, stop: Some(Coord::Int(stop)), step } => {
            Index::Range { start: *start, stop: Some(Coord::Int(stop + 1)), step: *step }
        }
        other => other.clone(),
    }
}

/// Axis values to convert a real index against: bin boundaries when the
/// axis holds one value per signal element.
fn reference_axis(axis: &Field, len: usize) -> Result<Array> {
    if axis.len() == len && axis.len() > 1 {
        axis.boundaries()?.value()
    } else {
        axis.value()
    }
}

fn is_collapsed(axis: &Field) -> bool {
    axis.ndim() == 0 || (axis.ndim() == 1 && axis.size() <= 1)
}

impl Group {
    // Construction

    /// `NXdata` group holding `signal` and one axis per dimension.
    pub fn data(signal: impl Into<Array>, axes: Vec<Array>) -> Result<Group> {
        let axes = axes.into_iter().map(Field::new).collect();
        Self::data_with(Some(Field::new(signal)), axes, None, None)
    }

    /// `NXdata` group from fields. Unnamed or clashing axes are called
    /// `axis1`, `axis2`, ...; an unnamed signal is called `signal`, and
    /// errors and weights take the signal's name with `_errors` and
    /// `_weights` appended.
    pub fn data_with(
        signal: Option<Field>,
        axes: Vec<Field>,
        errors: Option<Field>,
        weights: Option<Field>,
    ) -> Result<Group> {
        let group = Group::new("NXdata")?;
        if !axes.is_empty() {
            let mut names = Vec::with_capacity(axes.len());
            for (i, axis) in axes.into_iter().enumerate() {
                let name = axis.name();
                let name = if name == "unknown" || group.contains(&name) { format!("axis{}", i + 1) } else { name };
                group.set(&name, axis)?;
                names.push(name);
            }
            group.set_attr("axes", names)?;
        }
        if let Some(signal) = signal {
            let name = signal.name();
            let name = if name == "unknown" || group.contains(&name) { "signal".to_string() } else { name };
            group.set(&name, signal)?;
            group.set_attr("signal", name.as_str())?;
            if let Some(errors) = errors {
                group.set(&format!("{name}_errors"), errors)?;
            }
            if let Some(weights) = weights {
                group.set(&format!("{name}_weights"), weights)?;
            }
        }
        Ok(group)
    }

    // Bindings

    /// The signal: a lone field, the child named by the `signal` attribute,
    /// or a child whose own `signal` attribute is 1.
    pub fn signal(&self) -> Result<Option<Field>> {
        let children = self.0.children()?;
        if children.len() == 1 {
            if let Some(field) = children[0].1.as_field() {
                return Ok(Some(field));
            }
        }
        if let Some(name) = self.attr_str("signal") {
            if let Some((_, node)) = children.iter().find(|(k, _)| *k == name) {
                return Ok(Some(node.to_field()?));
            }
        }
        for (_, node) in &children {
            let flagged = node.attrs().get_i64("signal") == Some(1);
            if flagged {
                return Ok(Some(node.to_field()?));
            }
        }
        Ok(None)
    }

    fn require_signal(&self) -> Result<Field> {
        self.signal()?.ok_or_else(no_signal)
    }

    /// Make `signal` the signal, adding it to the group if it is not a
    /// member.
    pub fn set_signal(&self, signal: Field) -> Result<()> {
        let name = signal.name();
        let member = self.get(&name).map(|n| n.ptr_eq(&signal)).unwrap_or(false);
        if !member {
            self.set(&name, signal)?;
        }
        self.0.set_attr("signal", name.as_str())
    }

    /// Name the signal without checking the child exists.
    pub fn set_signal_name(&self, name: &str) -> Result<()> {
        self.0.set_attr("signal", name)
    }

    /// Plot axes as detached copies, from the group's or the signal's
    /// `axes` attribute. Unset entries become `Axis{i}` index ranges.
    pub fn axes(&self) -> Result<Option<Vec<Field>>> {
        let signal = self.signal()?;
        let placeholder = |i: usize, signal: &Field| {
            let len = signal.shape().get(i).copied().unwrap_or(0);
            let axis = Field::new(Array::arange(len));
            axis.inner_mut().name = format!("Axis{i}");
            axis
        };
        let copy = |axis: &Field| -> Result<Field> { Ok(Field::from_array(&axis.name(), axis.value()?, axis.attrs())) };
        let names = self
            .attrs()
            .get_names("axes")
            .or_else(|| signal.as_ref().and_then(|s| s.attrs().get_names("axes")));
        if let Some(names) = names {
            let resolved: Option<Vec<Field>> = names
                .iter()
                .enumerate()
                .map(|(i, name)| match name.trim() {
                    "" | "." => signal.as_ref().map(|s| Ok(placeholder(i, s))),
                    name => self.field(name).ok().map(|axis| copy(&axis)),
                })
                .collect::<Option<Vec<Result<Field>>>>()
                .map(|axes| axes.into_iter().collect::<Result<Vec<Field>>>())
                .transpose()?;
            if let Some(axes) = resolved {
                return Ok(Some(axes));
            }
        }
        let mut numbered: Vec<(i64, Field)> = Vec::new();
        for (_, node) in self.0.children()? {
            let Some(position) = node.attrs().get_i64("axis") else {
                continue;
            };
            let is_signal = signal.as_ref().is_some_and(|s| s.ptr_eq(&node));
            if is_signal || numbered.iter().any(|(p, _)| *p == position) {
                return Ok(None);
            }
            numbered.push((position, node.to_field()?));
        }
        if !numbered.is_empty() {
            numbered.sort_by_key(|(p, _)| *p);
            return numbered.iter().map(|(_, axis)| copy(axis)).collect::<Result<Vec<_>>>().map(Some);
        }
        Ok(signal.map(|s| (0..s.ndim()).map(|i| placeholder(i, &s)).collect()))
    }

    /// Bind `axes` in order, adding any that are not members.
    pub fn set_axes(&self, axes: Vec<Field>) -> Result<()> {
        let mut names = Vec::with_capacity(axes.len());
        for axis in axes {
            let name = axis.name();
            let member = self.get(&name).map(|n| n.ptr_eq(&axis)).unwrap_or(false);
            if !member {
                self.set(&name, axis)?;
            }
            names.push(name);
        }
        self.0.set_attr("axes", names)
    }

    /// Bind axes by name; `.` marks an unset axis.
    pub fn set_axes_names(&self, names: &[&str]) -> Result<()> {
        self.0.set_attr("axes", names.to_vec())
    }

    /// Standard deviations of the signal: `<signal>_errors`, the field named
    /// by the signal's `uncertainties` attribute, or `errors`. Only a field
    /// shaped like the signal counts.
    pub fn errors(&self) -> Result<Option<Field>> {
        self.companion("_errors", "uncertainties", "errors")
    }

    pub fn set_errors(&self, errors: Field) -> Result<()> {
        self.set_companion("_errors", errors)
    }

    /// Signal weights, found like [`Group::errors`].
    pub fn weights(&self) -> Result<Option<Field>> {
        self.companion("_weights", "weights", "weights")
    }

    pub fn set_weights(&self, weights: Field) -> Result<()> {
        self.set_companion("_weights", weights)
    }

    fn companion(&self, suffix: &str, attr: &str, fallback: &str) -> Result<Option<Field>> {
        let signal = self.require_signal()?;
        let mut candidates = vec![format!("{}{suffix}", signal.name())];
        if let Some(name) = signal.attr_str(attr) {
            candidates.push(name);
        }
        candidates.push(fallback.to_string());
        for name in candidates {
            if let Ok(field) = self.field(&name) {
                return Ok((field.shape() == signal.shape()).then_some(field));
            }
        }
        Ok(None)
    }

    fn set_companion(&self, suffix: &str, field: Field) -> Result<()> {
        let signal = self.require_signal()?;
        if field.shape() != signal.shape() {
            return Err(Error::ShapeMismatch(format!(
                "{} shape incompatible with the signal",
                suffix.trim_start_matches('_')
            )));
        }
        self.set(&format!("{}{suffix}", signal.name()), field)
    }

    /// Viewing angles between axes, from the `angles` attribute.
    pub fn angles(&self) -> Option<Vec<f64>> {
        self.attr("angles")?.to_f64_vec().ok()
    }

    /// One angle for two-dimensional data, three for three-dimensional.
    pub fn set_angles(&self, angles: &[f64]) -> Result<()> {
        match (self.ndim()?, angles.len()) {
            (2, 1) => self.0.set_attr("angles", angles[0]),
            (2, _) => Err(Error::InvalidOperation("specify a single number for 2D data".into())),
            (3, 3) => self.0.set_attr("angles", angles.to_vec()),
            (3, _) => Err(Error::InvalidOperation("specify three numbers for 3D data".into())),
            _ => Err(Error::InvalidOperation("angles only supported for 2D and 3D data".into())),
        }
    }

    // Masks

    /// The signal's mask.
    pub fn mask(&self) -> Result<Option<Array>> {
        match self.signal()? {
            Some(signal) => signal.mask(),
            None => Ok(None),
        }
    }

    pub fn set_mask(&self, mask: Array) -> Result<()> {
        self.require_signal()?.set_mask(Some(mask))
    }

    /// Remove the signal's mask together with its mask field.
    pub fn clear_mask(&self) -> Result<()> {
        let Some(signal) = self.signal()? else {
            return Ok(());
        };
        let sibling = signal.attr_str("mask");
        match sibling {
            Some(name) if self.contains(&name) => {
                self.delete(&name)?;
                signal.delete_attr("mask")
            }
            Some(_) => signal.delete_attr("mask"),
            None => signal.set_mask(None),
        }
    }

    // Shape

    pub fn ndim(&self) -> Result<usize> {
        Ok(self.require_signal()?.ndim())
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.require_signal()?.shape())
    }

    pub fn plot_shape(&self) -> Result<Option<Vec<usize>>> {
        Ok(self.signal()?.map(|s| s.plot_shape()))
    }

    /// Axes of the dimensions longer than one.
    pub fn plot_axes(&self) -> Result<Option<Vec<Field>>> {
        let Some(signal) = self.signal()? else {
            return Ok(None);
        };
        let axes = self.axes()?.unwrap_or_default();
        if signal.ndim() > signal.plot_shape().len() {
            let shape = signal.shape();
            return Ok(Some(
                axes.into_iter().enumerate().filter(|(i, _)| shape.get(*i).is_some_and(|&n| n > 1)).map(|(_, a)| a).collect(),
            ));
        }
        Ok(Some(axes))
    }

    pub fn is_image(&self) -> Result<bool> {
        Ok(self.signal()?.is_some_and(|s| s.is_image()))
    }

    // Slabs

    /// Integer selection of the signal for `selection`, with the axes
    /// sliced to match. Real-valued indices select by axis value, against
    /// bin boundaries when the axis has one value per signal element.
    pub fn slab(&self, selection: impl Into<Selection>) -> Result<(Selection, Vec<Field>)> {
        let selection = selection.into();
        let signal = self.require_signal()?;
        let shape = signal.shape();
        let mut axes = self.axes()?.unwrap_or_default();
        let mut slices = Vec::with_capacity(selection.len());
        for (i, index) in selection.indices().iter().enumerate() {
            let (Some(axis), Some(&len)) = (axes.get(i).cloned(), shape.get(i)) else {
                slices.push(index.clone());
                continue;
            };
            if index.is_real() {
                let mut converted = convert_index(index, &reference_axis(&axis, len)?)?;
                if len < axis.len() {
                    axes[i] = axis.get(converted.clone())?;
                    converted = inclusive(converted);
                } else if len == axis.len() {
                    converted = inclusive(converted);
                    axes[i] = axis.get(converted.clone())?;
                }
                slices.push(converted);
            } else {
                let converted = convert_index(index, &axis.value()?)?;
                let along_axis = if len < axis.len() { extended(&converted) } else { converted.clone() };
                axes[i] = axis.get(along_axis)?;
                slices.push(converted);
            }
        }
        Ok((Selection::new(slices), axes))
    }

    /// New data group holding the selected slab. Axes reduced to a single
    /// value are kept as plain members rather than bound axes.
    pub fn get_slab(&self, selection: impl Into<Selection>) -> Result<Group> {
        let signal = self.require_signal()?;
        let (index, axes) = self.slab(selection)?;
        let (removed, kept): (Vec<Field>, Vec<Field>) = axes.into_iter().partition(is_collapsed);
        let sliced = signal.get(index.clone())?;
        let errors = self.errors()?.map(|e| e.get(index.clone())).transpose()?;
        let weights = self.weights()?.map(|w| w.get(index.clone())).transpose()?;
        let result = Group::data_with(Some(sliced), kept, errors, weights)?;
        for axis in removed {
            let name = axis.name();
            if !result.contains(&name) {
                result.set(&name, axis)?;
            }
        }
        result.set("title", self.title())?;
        Ok(result)
    }

    /// Assign `value` to the selected slab of the signal.
    pub fn set_slab(&self, selection: impl Into<Selection>, value: impl Into<Array>) -> Result<()> {
        let selection = selection.into();
        let signal = self.require_signal()?;
        let shape = signal.shape();
        let axes = self.axes()?.unwrap_or_default();
        let mut slices = Vec::with_capacity(selection.len());
        for (i, index) in selection.indices().iter().enumerate() {
            let (Some(axis), Some(&len)) = (axes.get(i), shape.get(i)) else {
                slices.push(index.clone());
                continue;
            };
            if index.is_real() {
                slices.push(inclusive(convert_index(index, &reference_axis(axis, len)?)?));
            } else {
                slices.push(convert_index(index, &axis.value()?)?);
            }
        }
        signal.set(Selection::new(slices), value)
    }

    // Transforms

    /// Data group with the signal's dimensions permuted by `order`, or
    /// reversed when `None`.
    pub fn transpose(&self, order: Option<&[usize]>) -> Result<Group> {
        let signal = self.require_signal()?;
        let ndim = signal.ndim();
        let order: Vec<usize> = match order {
            Some(order) => order.to_vec(),
            None => (0..ndim).rev().collect(),
        };
        let axes = self.axes()?.unwrap_or_default();
        let permuted = order
            .iter()
            .map(|&i| axes.get(i).cloned().ok_or_else(|| Error::InvalidOperation(format!("invalid axis {i}"))))
            .collect::<Result<Vec<_>>>()?;
        let result = Group::data_with(Some(signal.transpose(Some(&order))?), permuted, None, None)?;
        result.set("title", self.title())?;
        if let Some(angles) = self.angles() {
            let angles = if ndim == 3 && angles.len() == 3 {
                order.iter().map(|&i| angles[i]).collect()
            } else {
                angles
            };
            result.set_attr("angles", angles)?;
        }
        Ok(result)
    }

    /// Project onto one or two `axes` within per-dimension `limits`, summing
    /// (or averaging) over the other dimensions. Empty limits select
    /// everything.
    pub fn project(&self, axes: &[usize], limits: &[(Option<f64>, Option<f64>)], summed: bool) -> Result<Group> {
        let rank = self.ndim()?;
        let limits = if limits.is_empty() { vec![(None, None); rank] } else { limits.to_vec() };
        if limits.len() < rank {
            return Err(Error::InvalidOperation("too few limits specified".into()));
        }
        if axes.len() > 2 {
            return Err(Error::InvalidOperation("projections to more than two dimensions not supported".into()));
        }
        for &axis in axes {
            match limits.get(axis) {
                Some((Some(lo), Some(hi))) if (hi - lo).abs() <= 1e-8 => {
                    return Err(Error::InvalidOperation("one of the projection axes has zero range".into()))
                }
                Some(_) => {}
                None => return Err(Error::InvalidOperation(format!("invalid axis {axis}"))),
            }
        }
        let mut projection: Vec<usize> = (0..limits.len()).filter(|i| !axes.contains(i)).rev().collect();
        let selection = Selection::new(
            limits
                .iter()
                .map(|(lo, hi)| Index::range(lo.map(Coord::Real), hi.map(Coord::Real)))
                .collect(),
        );
        let (index, _) = self.slab(selection)?;
        let mut result = self.get_slab(index.clone())?;
        for slab_axis in projection.clone() {
            if matches!(index.indices().get(slab_axis), Some(Index::At(_))) {
                projection.retain(|&a| a != slab_axis);
                for axis in projection.iter_mut() {
                    if *axis > slab_axis {
                        *axis -= 1;
                    }
                }
            }
        }
        if !projection.is_empty() {
            result = if summed { result.sum(Some(&projection))? } else { result.average(Some(&projection))? };
        }
        if axes.len() > 1 && axes[0] > axes[1] {
            let signal = result.require_signal()?;
            let errors = result.errors()?;
            let weights = result.weights()?;
            for field in [Some(signal), errors, weights].into_iter().flatten() {
                result.set(&field.name(), field.transpose(None)?)?;
            }
            if let Some(mut names) = result.attrs().get_names("axes") {
                names.reverse();
                result.set_attr("axes", names)?;
            }
        }
        Ok(result)
    }

    /// Copy with the signal and errors divided by the weights, zero where a
    /// weight is not positive. The weights field is dropped.
    pub fn weighted_data(&self) -> Result<Group> {
        let signal = self.require_signal()?;
        let weights = self
            .weights()?
            .ok_or_else(|| Error::InvalidOperation("no weights defined for this NXdata group".into()))?;
        let w = weights.to_f64_vec()?;
        let shape = signal.shape();
        let weigh = |field: &Field| -> Result<Field> {
            let values: Vec<f64> = field
                .to_f64_vec()?
                .iter()
                .zip(&w)
                .map(|(v, w)| if *w > 0.0 { v / w } else { 0.0 })
                .collect();
            Ok(Field::from_array(&field.name(), Array::from_f64(&shape, values)?, field.attrs()))
        };
        let result = self.deep_copy()?;
        result.set(&signal.name(), weigh(&signal)?)?;
        if let Some(errors) = self.errors()? {
            result.set(&errors.name(), weigh(&errors)?)?;
        }
        result.delete(&weights.name())?;
        Ok(result)
    }

    // Arithmetic

    fn combine(&self, other: &Group, op: BinaryOp) -> Result<Group> {
        match self.class_kind() {
            ClassKind::Data | ClassKind::Monitor => self.combine_data(other, op),
            ClassKind::Entry | ClassKind::Subentry if matches!(op, BinaryOp::Add | BinaryOp::Sub) => {
                self.combine_entries(other, op)
            }
            _ => Err(Error::InvalidOperation(format!("cannot combine two arbitrary groups with '{op}'"))),
        }
    }

    fn combine_data(&self, other: &Group, op: BinaryOp) -> Result<Group> {
        if !matches!(other.class_kind(), ClassKind::Data | ClassKind::Monitor) {
            return Err(Error::InvalidOperation(format!("cannot combine two arbitrary groups with '{op}'")));
        }
        let s1 = self.require_signal()?;
        let s2 = other.require_signal()?;
        if s1.shape() != s2.shape() {
            return Err(Error::InconsistentGroups(self.class()));
        }
        let (v1, v2) = (s1.value()?, s2.value()?);
        let value = v1.binary(&v2, op)?;
        let result = self.deep_copy()?;
        result.set(&s1.name(), Field::from_array(&s1.name(), value.clone(), s1.attrs()))?;
        if let Some(e1) = self.errors()? {
            let e1 = e1.value()?;
            let errors = match other.errors()? {
                Some(e2) => {
                    let e2 = e2.value()?;
                    let square = |a: &Array| a.binary(&Array::scalar(2.0), BinaryOp::Pow);
                    match op {
                        BinaryOp::Mul => {
                            square(&e1.binary(&v2, BinaryOp::Mul)?)?.binary(&square(&e2.binary(&v1, BinaryOp::Mul)?)?, BinaryOp::Add)?.sqrt()?
                        }
                        BinaryOp::Div => square(&e1)?
                            .binary(&square(&value.binary(&e2, BinaryOp::Mul)?)?, BinaryOp::Add)?
                            .sqrt()?
                            .binary(&v2, BinaryOp::Div)?,
                        _ => square(&e1)?.binary(&square(&e2)?, BinaryOp::Add)?.sqrt()?,
                    }
                }
                None => e1,
            };
            result.set_errors(Field::new(errors))?;
        }
        if op != BinaryOp::Div {
            if let (Some(w1), Some(w2)) = (self.weights()?, other.weights()?) {
                result.set_weights(Field::new(w1.value()?.binary(&w2.value()?, op)?))?;
            }
        }
        Ok(result)
    }

    fn combine_entries(&self, other: &Group, op: BinaryOp) -> Result<Group> {
        let inconsistent = || Error::InconsistentGroups(self.class());
        let result = Group::named(&self.name(), &self.class())?;
        result.inner_mut().attrs = self.attrs();
        for (name, child) in self.0.children()? {
            let combined = match child.class_kind() {
                ClassKind::Data => true,
                ClassKind::Monitor => op == BinaryOp::Add,
                _ => false,
            };
            if combined && child.is_group() {
                let other_child = other.group(&name).map_err(|_| inconsistent())?;
                if other_child.class_kind() != ClassKind::Data {
                    return Err(inconsistent());
                }
                let mine = child.to_group()?;
                result.set(&name, mine.combine(&other_child, op)?)?;
            } else {
                result.set(&name, child)?;
            }
        }
        Ok(result)
    }

    fn combine_scalar(&self, value: f64, op: BinaryOp) -> Result<Group> {
        if !matches!(self.class_kind(), ClassKind::Data | ClassKind::Monitor) {
            return Err(Error::InvalidOperation(format!("cannot apply '{op}' to a {} group", self.class())));
        }
        let scalar = Array::scalar(value);
        let apply = |a: &Array| a.binary(&scalar, op);
        let signal = self.require_signal()?;
        let result = self.deep_copy()?;
        result.set(&signal.name(), Field::from_array(&signal.name(), apply(&signal.value()?)?, signal.attrs()))?;
        if matches!(op, BinaryOp::Mul | BinaryOp::Div) {
            if let Some(errors) = self.errors()? {
                result.set_errors(Field::new(apply(&errors.value()?)?))?;
            }
            if let Some(weights) = self.weights()? {
                result.set_weights(Field::new(apply(&weights.value()?)?))?;
            }
        }
        Ok(result)
    }

    // Root

    fn root_file(&self) -> Result<File> {
        if self.class_kind() != ClassKind::Root {
            return Err(Error::InvalidOperation(format!("'{}' is not an NXroot group", self.name())));
        }
        self.0
            .inner()
            .file
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("'{}' has no associated file", self.name())))
    }

    /// Re-read the tree from its file.
    pub fn reload(&self) -> Result<()> {
        self.root_file()?.reload()
    }

    /// True if another process changed the file since it was read.
    pub fn is_modified(&self) -> bool {
        self.root_file().map(|f| f.is_modified()).unwrap_or(false)
    }

    pub fn mtime(&self) -> Option<std::time::SystemTime> {
        self.root_file().ok()?.mtime()
    }

    /// Make the tree read-only.
    pub fn lock(&self) -> Result<()> {
        let file = self.root_file()?;
        if !file.filename().exists() {
            return Err(Error::NotFound(file.filename().display().to_string()));
        }
        file.set_mode(Mode::Read);
        self.0.set_changed();
        Ok(())
    }

    /// Make the tree writable again. Refused if the file is not writable or
    /// was changed by another process since it was read.
    pub fn unlock(&self) -> Result<()> {
        let file = self.root_file()?;
        let path = file.filename();
        let metadata = std::fs::metadata(&path).map_err(|_| Error::NotFound(path.display().to_string()))?;
        if metadata.permissions().readonly() {
            file.set_mode(Mode::Read);
            return Err(Error::ReadOnlyViolation(format!("not permitted to write to '{}'", path.display())));
        }
        if file.is_modified() {
            return Err(Error::InvalidOperation("file modified; reload before unlocking".into()));
        }
        file.set_mode(Mode::ReadWrite);
        self.0.set_changed();
        Ok(())
    }

    /// Copy the file to `filename` (inside `dir` if given), or to a new
    /// `<stem>_backup_<time>` file in `dir` or the working directory.
    pub fn backup(&self, filename: Option<&Path>, dir: Option<&Path>) -> Result<PathBuf> {
        let file = self
            .root_file()
            .map_err(|_| Error::InvalidOperation("only data saved to a NeXus file can be backed up".into()))?;
        let source = file.filename();
        let backup = match filename {
            Some(name) => {
                let path = match dir {
                    Some(dir) => dir.join(name),
                    None => name.to_path_buf(),
                };
                if path.exists() {
                    return Err(Error::InvalidOperation(format!("'{}' already exists", path.display())));
                }
                path
            }
            None => {
                let dir = match dir {
                    Some(dir) => dir.to_path_buf(),
                    None => std::env::current_dir().map_err(|e| io_error(&source, e))?,
                };
                let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%f");
                let name = match source.extension() {
                    Some(ext) => format!("{stem}_backup_{stamp}.{}", ext.to_string_lossy()),
                    None => format!("{stem}_backup_{stamp}"),
                };
                dir.join(name)
            }
        };
        let mut target = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&backup)
            .map_err(|e| io_error(&backup, e))?;
        let mut input = std::fs::File::open(&source).map_err(|e| io_error(&source, e))?;
        std::io::copy(&mut input, &mut target).map_err(|e| io_error(&backup, e))?;
        debug!(file = %source.display(), backup = %backup.display(), "backed up file");
        file.set_backup(backup.clone());
        Ok(backup)
    }

    /// Copy the last backup over `filename` (the tree's own file when
    /// `None`) and reload.
    pub fn restore(&self, filename: Option<&Path>, overwrite: bool) -> Result<()> {
        let file = self.root_file()?;
        if file.mode() != Mode::ReadWrite {
            return Err(Error::ReadOnlyViolation("NeXus file must be opened read/write".into()));
        }
        let backup = file.backup().ok_or_else(|| Error::InvalidOperation("no backup exists".into()))?;
        let target = filename.map(Path::to_path_buf).unwrap_or_else(|| file.filename());
        if target.exists() && !overwrite {
            return Err(Error::InvalidOperation(format!(
                "to overwrite '{}', set 'overwrite' to true",
                target.display()
            )));
        }
        std::fs::copy(&backup, &target).map_err(|e| io_error(&target, e))?;
        debug!(file = %target.display(), backup = %backup.display(), "restored backup");
        self.reload()
    }

    /// Leave any open scopes on the file.
    pub fn close(&self) -> Result<()> {
        match self.root_file() {
            Ok(file) => file.close(),
            Err(_) => Ok(()),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> Error {
    Error::StorageAccess { path: path.display().to_string(), mode: "rw".into(), message: err.to_string() }
}

macro_rules! group_ops {
    ($($trait:ident $method:ident $op:ident),*) => {$(
        impl $trait<&Group> for &Group {
            type Output = Result<Group>;

            fn $method(self, other: &Group) -> Result<Group> {
                self.combine(other, BinaryOp::$op)
            }
        }

        impl $trait<f64> for &Group {
            type Output = Result<Group>;

            fn $method(self, other: f64) -> Result<Group> {
                self.combine_scalar(other, BinaryOp::$op)
            }
        }
    )*};
}

group_ops!(Add add Add, Sub sub Sub, Mul mul Mul, Div div Div);

impl Mul<&Group> for f64 {
    type Output = Result<Group>;

    fn mul(self, other: &Group) -> Result<Group> {
        other.combine_scalar(self, BinaryOp::Mul)
    }
}
