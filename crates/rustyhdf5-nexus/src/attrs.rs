//! Attribute values and the per-node attribute dictionary.
//!
//! Values are kept exactly as stored. Reads through [`AttrDict::get`] are
//! normalised: size-one arrays collapse to scalars and text is cleaned of
//! NUL padding and trailing whitespace. Guarded writes (read-only files,
//! linked items, write-through) live on [`crate::Node`]; this type is the
//! plain container.

use std::collections::BTreeMap;
use std::fmt;

use crate::array::{Array, Data, Scalar};
use crate::text;

/// Attributes never copied onto values derived from a field.
pub const BINDING_ATTRS: [&str; 3] = ["target", "signal", "axes"];

/// Normalise an attribute value for use: size-one arrays become scalars and
/// text is cleaned.
pub fn normalize(value: &Array) -> Array {
    let value = match value.data() {
        Data::Text(items) => {
            let cleaned: Vec<String> = items.iter().map(|s| text::clean(s)).collect();
            Array::from(cleaned).reshape(value.shape()).unwrap_or_else(|_| value.clone())
        }
        _ => value.clone(),
    };
    if value.ndim() > 0 && value.size() == 1 {
        value.reshape(&[]).unwrap_or(value)
    } else {
        value
    }
}

/// Ordered map of attribute name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrDict {
    map: BTreeMap<String, Array>,
}

impl AttrDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalised value of `name`.
    pub fn get(&self, name: &str) -> Option<Array> {
        self.map.get(name).map(normalize)
    }

    /// Value as stored.
    pub fn raw(&self, name: &str) -> Option<&Array> {
        self.map.get(name)
    }

    /// Text of a scalar string attribute.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)?.item()? {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a string attribute, scalar or list.
    pub fn get_strings(&self, name: &str) -> Option<Vec<String>> {
        self.get(name)?.as_text().map(|v| v.to_vec())
    }

    /// Names in an `axes`-style attribute, stored as a list or as one
    /// delimited string.
    pub fn get_names(&self, name: &str) -> Option<Vec<String>> {
        let names = self.get_strings(name)?;
        Some(match names.as_slice() {
            [one] => text::read_axes(one),
            _ => names.iter().map(|s| s.trim().to_string()).collect(),
        })
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name)?.item()?.as_f64()
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)?.item()? {
            Scalar::Text(s) => s.trim().parse().ok(),
            other => other.as_i64(),
        }
    }

    /// Store a value. Empty text arrays are ignored, matching a `None` value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Array>) -> bool {
        let value = value.into();
        if value.dtype().is_text() && value.size() == 0 {
            return false;
        }
        self.map.insert(name.into(), value);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Array> {
        self.map.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Copy of every attribute except the signal, axes and target bindings.
    pub fn safe(&self) -> AttrDict {
        AttrDict {
            map: self
                .map
                .iter()
                .filter(|(k, _)| !BINDING_ATTRS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Add every attribute of `other`, replacing existing names.
    pub fn extend(&mut self, other: &AttrDict) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, Array)> for AttrDict {
    fn from_iter<I: IntoIterator<Item = (String, Array)>>(iter: I) -> Self {
        AttrDict { map: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a AttrDict {
    type Item = (&'a String, &'a Array);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Array>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

/// Attribute rendering for tree output: `@name = value`.
pub(crate) struct AttrLine<'a>(pub &'a str, pub &'a Array);

impl fmt::Display for AttrLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = normalize(self.1);
        let (mut text, quoted) = match value.item() {
            Some(Scalar::Text(s)) => (s, true),
            Some(v) => (v.to_string(), false),
            None => (value.to_string(), false),
        };
        if text.chars().count() > 50 {
            text = format!("{}...", text.chars().take(46).collect::<String>());
        }
        if quoted {
            text = format!("'{text}'");
        }
        if let Some(i) = text.find('\n') {
            text = format!("{}...", &text[..i]);
        }
        write!(f, "@{} = {}", self.0, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    #[test]
    fn size_one_arrays_read_as_scalars() {
        let mut attrs = AttrDict::new();
        attrs.insert("count", Array::from(vec![7i32]));
        let v = attrs.get("count").unwrap();
        assert_eq!(v.ndim(), 0);
        assert_eq!(v.dtype(), DType::I32);
        assert_eq!(attrs.raw("count").unwrap().shape(), &[1]);
    }

    #[test]
    fn text_is_cleaned() {
        let mut attrs = AttrDict::new();
        attrs.insert("units", "mm\0\0  ");
        assert_eq!(attrs.get_str("units").as_deref(), Some("mm"));
    }

    #[test]
    fn empty_text_is_ignored() {
        let mut attrs = AttrDict::new();
        assert!(!attrs.insert("axes", Vec::<String>::new()));
        assert!(!attrs.contains("axes"));
    }

    #[test]
    fn safe_drops_bindings() {
        let mut attrs = AttrDict::new();
        attrs.insert("signal", 1i32);
        attrs.insert("axes", "x");
        attrs.insert("units", "counts");
        let safe = attrs.safe();
        assert_eq!(safe.keys().collect::<Vec<_>>(), vec!["units"]);
    }

    #[test]
    fn integer_from_text() {
        let mut attrs = AttrDict::new();
        attrs.insert("signal", "1");
        assert_eq!(attrs.get_i64("signal"), Some(1));
    }

    #[test]
    fn renders_attribute_lines() {
        let a = Array::from("K");
        assert_eq!(AttrLine("units", &a).to_string(), "@units = 'K'");
        let b = Array::from(vec![1i64, 2]);
        assert_eq!(AttrLine("shape", &b).to_string(), "@shape = [1 2]");
    }
}
