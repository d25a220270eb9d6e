//! NeXus base class registry.
//!
//! Group behaviour depends on a handful of classes; every other base class
//! behaves as a plain group. Unknown `NX` names are accepted as generic
//! groups so files written against newer definitions still load.

use crate::error::{Error, Result};

/// Behaviour family of a group class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Root,
    Entry,
    Subentry,
    Data,
    Monitor,
    Log,
    Process,
    Note,
    Generic,
}

/// Base classes, sorted for binary search.
pub const BASE_CLASSES: [&str; 58] = [
    "NXaperture",
    "NXattenuator",
    "NXbeam",
    "NXbeam_stop",
    "NXbending_magnet",
    "NXcapillary",
    "NXcite",
    "NXcollection",
    "NXcollimator",
    "NXcrystal",
    "NXcylindrical_geometry",
    "NXdata",
    "NXdetector",
    "NXdetector_group",
    "NXdetector_module",
    "NXdisk_chopper",
    "NXentry",
    "NXenvironment",
    "NXevent_data",
    "NXfermi_chopper",
    "NXfilter",
    "NXflipper",
    "NXfresnel_zone_plate",
    "NXgeometry",
    "NXgrating",
    "NXgroup",
    "NXguide",
    "NXinsertion_device",
    "NXinstrument",
    "NXlog",
    "NXmirror",
    "NXmoderator",
    "NXmonitor",
    "NXmonochromator",
    "NXnote",
    "NXobject",
    "NXoff_geometry",
    "NXorientation",
    "NXparameters",
    "NXpdb",
    "NXpinhole",
    "NXpolarizer",
    "NXpositioner",
    "NXprocess",
    "NXreflections",
    "NXroot",
    "NXsample",
    "NXsample_component",
    "NXsensor",
    "NXshape",
    "NXslit",
    "NXsource",
    "NXsubentry",
    "NXtransformations",
    "NXtranslation",
    "NXuser",
    "NXvelocity_selector",
    "NXxraylens",
];

pub fn is_base_class(name: &str) -> bool {
    BASE_CLASSES.binary_search(&name).is_ok()
}

pub fn kind_of(class: &str) -> ClassKind {
    match class {
        "NXroot" => ClassKind::Root,
        "NXentry" => ClassKind::Entry,
        "NXsubentry" => ClassKind::Subentry,
        "NXdata" => ClassKind::Data,
        "NXmonitor" => ClassKind::Monitor,
        "NXlog" => ClassKind::Log,
        "NXprocess" => ClassKind::Process,
        "NXnote" => ClassKind::Note,
        _ => ClassKind::Generic,
    }
}

/// Accept any `NX` class name.
pub fn validate(class: &str) -> Result<()> {
    if class.len() > 2 && class.starts_with("NX") && class[2..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::Configuration(format!("'{class}' is not a valid NeXus class")))
    }
}

/// Name given to an unnamed group: the class without its `NX` prefix.
pub fn default_name(class: &str) -> String {
    class.strip_prefix("NX").unwrap_or(class).to_string()
}

/// Classes that get a creation `date` field.
pub fn is_dated(class: &str) -> bool {
    matches!(kind_of(class), ClassKind::Process | ClassKind::Note)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        let mut sorted = BASE_CLASSES;
        sorted.sort_unstable();
        assert_eq!(sorted, BASE_CLASSES);
        assert!(is_base_class("NXsample"));
        assert!(!is_base_class("NXwidget"));
    }

    #[test]
    fn kinds() {
        assert_eq!(kind_of("NXdata"), ClassKind::Data);
        assert_eq!(kind_of("NXsample"), ClassKind::Generic);
        assert_eq!(kind_of("NXwidget"), ClassKind::Generic);
    }

    #[test]
    fn unknown_nx_names_are_valid() {
        assert!(validate("NXwidget").is_ok());
        assert!(validate("widget").is_err());
        assert!(validate("NX").is_err());
        assert!(validate("NXbad name").is_err());
    }

    #[test]
    fn default_names() {
        assert_eq!(default_name("NXmonitor"), "monitor");
        assert!(is_dated("NXprocess"));
        assert!(!is_dated("NXdata"));
    }
}
