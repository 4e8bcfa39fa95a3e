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

//! Ownership of bus names.
//!
//! Every owned name, unique or well-known, maps to exactly one peer. The
//! first requester owns a name until it releases it or disconnects; later
//! requesters are refused and never queued.

use std::collections::BTreeMap;

use tracing::trace;

use crate::peer::PeerId;

/// Result of a name request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquisition {
    /// The requester now owns the name.
    Acquired,
    /// The requester already owned the name.
    AlreadyOwner,
    /// Another peer owns the name.
    Exists,
}

#[derive(Debug, Default)]
pub(crate) struct NameRegistry {
    owners: BTreeMap<String, PeerId>,
}

impl NameRegistry {
    /// Register the unique name assigned to `peer`.
    pub(crate) fn insert_unique(&mut self, name: &str, peer: PeerId) {
        self.owners.insert(name.to_string(), peer);
    }

    pub(crate) fn request(&mut self, name: &str, peer: PeerId) -> Acquisition {
        match self.owners.get(name) {
            Some(owner) if *owner == peer => Acquisition::AlreadyOwner,
            Some(owner) => {
                trace!(name, peer, owner = *owner, "name already owned");
                Acquisition::Exists
            }
            None => {
                self.owners.insert(name.to_string(), peer);
                Acquisition::Acquired
            }
        }
    }

    /// Release `name` if `peer` owns it.
    pub(crate) fn release(&mut self, name: &str, peer: PeerId) -> bool {
        if self.owner(name) != Some(peer) {
            return false;
        }
        self.owners.remove(name);
        true
    }

    pub(crate) fn owner(&self, name: &str) -> Option<PeerId> {
        self.owners.get(name).copied()
    }

    /// Every owned name, sorted.
    pub(crate) fn names(&self) -> Vec<String> {
        self.owners.keys().cloned().collect()
    }

    pub(crate) fn owned_by(&self, peer: PeerId) -> Vec<String> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == peer)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop every name owned by `peer` and return them.
    pub(crate) fn release_all(&mut self, peer: PeerId) -> Vec<String> {
        let released = self.owned_by(peer);
        for name in &released {
            self.owners.remove(name);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_requester_gets_exists() {
        let mut names = NameRegistry::default();
        assert_eq!(names.request("org.example.Service", 1), Acquisition::Acquired);
        assert_eq!(names.request("org.example.Service", 2), Acquisition::Exists);
        assert_eq!(names.request("org.example.Service", 1), Acquisition::AlreadyOwner);
        assert_eq!(names.owner("org.example.Service"), Some(1));
    }

    #[test]
    fn test_release_then_reacquire() {
        let mut names = NameRegistry::default();
        names.request("org.example.Service", 1);
        assert!(!names.release("org.example.Service", 2));
        assert!(names.release("org.example.Service", 1));
        assert!(!names.release("org.example.Service", 1));
        assert_eq!(names.request("org.example.Service", 2), Acquisition::Acquired);
        assert_eq!(names.owner("org.example.Service"), Some(2));
    }

    #[test]
    fn test_unique_names_cannot_be_taken() {
        let mut names = NameRegistry::default();
        names.insert_unique(":1.1", 1);
        assert_eq!(names.request(":1.1", 2), Acquisition::Exists);
        assert_eq!(names.owner(":1.1"), Some(1));
    }

    #[test]
    fn test_release_all_drops_every_name_of_a_peer() {
        let mut names = NameRegistry::default();
        names.insert_unique(":1.1", 1);
        names.request("org.example.A", 1);
        names.request("org.example.B", 2);
        assert_eq!(names.release_all(1), vec![":1.1".to_string(), "org.example.A".to_string()]);
        assert_eq!(names.names(), vec!["org.example.B".to_string()]);
    }
}
