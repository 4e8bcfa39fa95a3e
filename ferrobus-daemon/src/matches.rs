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

//! Match rules registered by peers.
//!
//! Tracks which peers asked for which broadcasts so the dispatcher can fan
//! signals out to interested peers only.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use ferrobus_core::{MatchPolicy, MatchRule, Message};

use crate::peer::PeerId;

/// Statistics for the match registry.
#[derive(Debug, Default)]
pub struct MatchStats {
    /// Total rules added.
    pub rules_added: AtomicUsize,
    /// Total rules removed, including those dropped with their peer.
    pub rules_removed: AtomicUsize,
    /// Total signal deliveries selected by rules.
    pub signals_matched: AtomicUsize,
}

impl MatchStats {
    /// Get the number of rules added.
    #[must_use]
    pub fn rules_added(&self) -> usize {
        self.rules_added.load(Ordering::Relaxed)
    }

    /// Get the number of rules removed.
    #[must_use]
    pub fn rules_removed(&self) -> usize {
        self.rules_removed.load(Ordering::Relaxed)
    }

    /// Get the number of signal deliveries selected by rules.
    #[must_use]
    pub fn signals_matched(&self) -> usize {
        self.signals_matched.load(Ordering::Relaxed)
    }
}

/// Rules per peer.
///
/// A peer may add the same rule more than once; each `RemoveMatch` drops one
/// copy.
#[derive(Default)]
pub(crate) struct MatchRegistry {
    rules: DashMap<PeerId, Vec<MatchRule>>,
    stats: MatchStats,
}

impl std::fmt::Debug for MatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchRegistry")
            .field("peer_count", &self.rules.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl MatchRegistry {
    pub(crate) const fn stats(&self) -> &MatchStats {
        &self.stats
    }

    pub(crate) fn add(&self, peer: PeerId, rule: MatchRule) {
        trace!(peer, ?rule, "Adding match rule");
        self.rules.entry(peer).or_default().push(rule);
        self.stats.rules_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one copy of `rule`. Returns whether the peer held it.
    pub(crate) fn remove(&self, peer: PeerId, rule: &MatchRule) -> bool {
        let Some(mut rules) = self.rules.get_mut(&peer) else {
            return false;
        };
        let Some(index) = rules.iter().position(|held| held == rule) else {
            return false;
        };
        rules.remove(index);
        if rules.is_empty() {
            drop(rules);
            self.rules.remove_if(&peer, |_, rules| rules.is_empty());
        }
        self.stats.rules_removed.fetch_add(1, Ordering::Relaxed);
        trace!(peer, "Removed match rule");
        true
    }

    /// Drop every rule of `peer`. Returns how many there were.
    pub(crate) fn remove_peer(&self, peer: PeerId) -> usize {
        let removed = self
            .rules
            .remove(&peer)
            .map_or(0, |(_, rules)| rules.len());
        if removed > 0 {
            self.stats.rules_removed.fetch_add(removed, Ordering::Relaxed);
            debug!(peer, removed, "Dropped match rules of departed peer");
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn rule_count(&self, peer: PeerId) -> usize {
        self.rules.get(&peer).map_or(0, |rules| rules.len())
    }

    /// Peers that should receive the broadcast `message`.
    ///
    /// `sender_names` are the names owned by the sender, so rules naming a
    /// well-known sender select its messages.
    pub(crate) fn recipients(
        &self,
        message: &Message,
        policy: MatchPolicy,
        sender_names: &HashSet<String>,
    ) -> Vec<PeerId> {
        let recipients: Vec<PeerId> = self
            .rules
            .iter()
            .filter(|entry| match policy {
                MatchPolicy::Presence => !entry.value().is_empty(),
                MatchPolicy::Evaluate => entry
                    .value()
                    .iter()
                    .any(|rule| rule.matches(message, |name| sender_names.contains(name))),
            })
            .map(|entry| *entry.key())
            .collect();
        self.stats
            .signals_matched
            .fetch_add(recipients.len(), Ordering::Relaxed);
        recipients
    }
}
