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

//! Constants of the `org.freedesktop.DBus` daemon interface.

use std::path::Path;

use crate::address::generate_guid;

/// `RequestName` flag: let a later requester take the name over.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
/// `RequestName` flag: take the name from an owner that allows replacement.
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
/// `RequestName` flag: fail instead of waiting in the queue.
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

/// Reply code of `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    /// The caller now owns the name.
    PrimaryOwner = 1,
    /// The caller was queued behind the current owner.
    InQueue = 2,
    /// Someone else owns the name.
    Exists = 3,
    /// The caller already owned the name.
    AlreadyOwner = 4,
}

impl RequestNameReply {
    /// Parse a wire reply code.
    #[must_use]
    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// Reply code of `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    /// The caller owned the name and released it.
    Released = 1,
    /// The caller did not own the name.
    NonExistent = 2,
}

impl ReleaseNameReply {
    /// Parse a wire reply code.
    #[must_use]
    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            _ => None,
        }
    }
}

/// Signal sent to a connection that gained a name.
pub const NAME_ACQUIRED: &str = "NameAcquired";
/// Signal sent to a connection that lost a name.
pub const NAME_LOST: &str = "NameLost";
/// Signal broadcast when a name changes owner.
pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
/// Local signal delivered when a connection goes away.
pub const DISCONNECTED: &str = "Disconnected";

/// Identifier of this machine.
///
/// Read from `/etc/machine-id` or `/var/lib/dbus/machine-id`; a random id
/// is generated when neither exists.
#[must_use]
pub fn machine_id() -> String {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(Path::new(path)).ok())
        .map(|text| text.trim().to_string())
        .find(|id| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or_else(generate_guid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_codes() {
        assert_eq!(RequestNameReply::from_u32(1), Some(RequestNameReply::PrimaryOwner));
        assert_eq!(RequestNameReply::Exists as u32, 3);
        assert_eq!(RequestNameReply::from_u32(9), None);
        assert_eq!(ReleaseNameReply::from_u32(2), Some(ReleaseNameReply::NonExistent));
    }

    #[test]
    fn test_machine_id_shape() {
        let id = machine_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
