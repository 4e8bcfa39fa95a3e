/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Validation of bus names, interface and member names, and object paths.

use std::borrow::Borrow;
use std::fmt;

use crate::error::BusError;

/// Longest bus, interface, member or error name accepted.
pub const MAX_NAME_LENGTH: usize = 255;

/// Well-known name of the bus daemon itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// Object path of the bus daemon.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// Interface of the bus daemon.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
/// Standard introspection interface.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
/// Standard peer interface.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
/// Interface of locally generated signals.
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";
/// Path of locally generated signals.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";

fn is_element_char(c: u8, allow_dash: bool) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || (allow_dash && c == b'-')
}

fn dotted_elements_valid(name: &str, allow_dash: bool, allow_leading_digit: bool) -> bool {
    let mut count = 0;
    for element in name.split('.') {
        let bytes = element.as_bytes();
        let Some(first) = bytes.first() else {
            return false;
        };
        if !allow_leading_digit && first.is_ascii_digit() {
            return false;
        }
        if !bytes.iter().all(|&c| is_element_char(c, allow_dash)) {
            return false;
        }
        count += 1;
    }
    count >= 2
}

/// Whether `name` is a valid interface name (also used for error names).
#[must_use]
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH && dotted_elements_valid(name, false, false)
}

/// Whether `name` is a valid error name.
#[must_use]
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// Whether `name` is a valid member (method or signal) name.
#[must_use]
pub fn is_valid_member_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.first() {
        Some(first) if !first.is_ascii_digit() => {
            name.len() <= MAX_NAME_LENGTH && bytes.iter().all(|&c| is_element_char(c, false))
        }
        _ => false,
    }
}

/// Whether `name` is a unique connection name such as `:1.42`.
#[must_use]
pub fn is_unique_name(name: &str) -> bool {
    name.strip_prefix(':').is_some_and(|rest| {
        name.len() <= MAX_NAME_LENGTH && dotted_elements_valid(rest, true, true)
    })
}

/// Whether `name` is a valid well-known bus name such as `com.example.Service`.
#[must_use]
pub fn is_valid_well_known_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH && dotted_elements_valid(name, true, false)
}

/// Whether `name` is a valid bus name, unique or well-known.
#[must_use]
pub fn is_valid_bus_name(name: &str) -> bool {
    is_unique_name(name) || is_valid_well_known_name(name)
}

/// Whether `path` is a valid object path.
#[must_use]
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty() && segment.bytes().all(|c| is_element_char(c, false))
    })
}

/// Fail with [`BusError::Parse`] unless `name` is a valid interface name.
pub fn check_interface_name(name: &str) -> Result<(), BusError> {
    if is_valid_interface_name(name) {
        Ok(())
    } else {
        Err(BusError::Parse(format!("invalid interface name `{name}'")))
    }
}

/// Fail with [`BusError::Parse`] unless `name` is a valid member name.
pub fn check_member_name(name: &str) -> Result<(), BusError> {
    if is_valid_member_name(name) {
        Ok(())
    } else {
        Err(BusError::Parse(format!("invalid member name `{name}'")))
    }
}

/// Fail with [`BusError::Parse`] unless `name` is a valid bus name.
pub fn check_bus_name(name: &str) -> Result<(), BusError> {
    if is_valid_bus_name(name) {
        Ok(())
    } else {
        Err(BusError::Parse(format!("invalid bus name `{name}'")))
    }
}

/// A validated object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validate and wrap `path`.
    pub fn new(path: impl Into<String>) -> Result<Self, BusError> {
        let path = path.into();
        if is_valid_object_path(&path) {
            Ok(Self(path))
        } else {
            Err(BusError::Parse(format!("invalid object path `{path}'")))
        }
    }

    /// The root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the path and return the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Non-empty path segments, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether `prefix` is a component-wise prefix of this path.
    ///
    /// `/a/b` is a prefix of `/a/b` and `/a/b/c` but not of `/a/bc`.
    /// The root path is a prefix of every path.
    #[must_use]
    pub fn has_prefix(&self, prefix: &Self) -> bool {
        let mut ours = self.segments();
        prefix.segments().all(|segment| ours.next() == Some(segment))
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(index) => Some(Self(self.0[..index].to_string())),
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/Test"));
        assert!(is_valid_object_path("/org/freedesktop/DBus"));
        assert!(is_valid_object_path("/a_b/c1"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("Test"));
        assert!(!is_valid_object_path("/Test/"));
        assert!(!is_valid_object_path("/a//b"));
        assert!(!is_valid_object_path("/a-b"));
    }

    #[test]
    fn test_bus_names() {
        assert!(is_valid_bus_name("org.freedesktop.DBus"));
        assert!(is_valid_bus_name("com.example-app.Service"));
        assert!(is_valid_bus_name(":1.42"));
        assert!(is_unique_name(":1.42"));
        assert!(!is_unique_name("org.foo"));
        assert!(!is_valid_bus_name("org"));
        assert!(!is_valid_bus_name("org..foo"));
        assert!(!is_valid_bus_name("1org.foo"));
        assert!(!is_valid_bus_name(&format!("a.{}", "b".repeat(MAX_NAME_LENGTH))));
    }

    #[test]
    fn test_interface_and_member_names() {
        assert!(is_valid_interface_name("org.example.Test"));
        assert!(!is_valid_interface_name("org.example-x.Test"));
        assert!(!is_valid_interface_name("Test"));
        assert!(is_valid_member_name("Echo"));
        assert!(is_valid_member_name("_private2"));
        assert!(!is_valid_member_name("2Echo"));
        assert!(!is_valid_member_name("Echo.Now"));
        assert!(!is_valid_member_name(""));
    }

    #[test]
    fn test_component_wise_prefix() {
        let path = ObjectPath::new("/a/b/c").unwrap();
        assert!(path.has_prefix(&ObjectPath::new("/a/b").unwrap()));
        assert!(path.has_prefix(&ObjectPath::new("/a/b/c").unwrap()));
        assert!(path.has_prefix(&ObjectPath::root()));
        assert!(!path.has_prefix(&ObjectPath::new("/a/bc").unwrap()));
        assert!(!ObjectPath::new("/a/bc")
            .unwrap()
            .has_prefix(&ObjectPath::new("/a/b").unwrap()));
    }

    #[test]
    fn test_parent() {
        let path = ObjectPath::new("/a/b").unwrap();
        assert_eq!(path.parent().unwrap().as_str(), "/a");
        assert_eq!(path.parent().unwrap().parent().unwrap().as_str(), "/");
        assert!(ObjectPath::root().parent().is_none());
    }
}
