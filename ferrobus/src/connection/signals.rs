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

//! Local signal subscriptions.
//!
//! Handlers are indexed by [`SignalKey`]. A received signal is looked up
//! under four keys: exact path and source, any path, any source, and both
//! wildcards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use ferrobus_core::error::BusError;
use ferrobus_core::names::{
    check_interface_name, check_member_name, is_unique_name, ObjectPath,
};
use ferrobus_core::{MatchRule, Message};

/// Callback run for each matching signal.
pub type SignalHandler = Arc<dyn Fn(Message) + Send + Sync + 'static>;

/// Identifies one registered signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What a signal handler listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    interface: String,
    member: String,
    path: Option<ObjectPath>,
    source: Option<String>,
}

impl SignalKey {
    /// Signals `interface.member` from any path and any source.
    pub fn new(interface: &str, member: &str) -> Result<Self, BusError> {
        check_interface_name(interface)?;
        check_member_name(member)?;
        Ok(Self {
            interface: interface.to_string(),
            member: member.to_string(),
            path: None,
            source: None,
        })
    }

    /// Only signals emitted from `path`.
    #[must_use]
    pub fn with_path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Only signals sent by the connection with unique name `source`.
    ///
    /// Well-known names are rejected: the sender field of a signal always
    /// carries the unique name.
    pub fn with_source(mut self, source: &str) -> Result<Self, BusError> {
        if !is_unique_name(source) {
            return Err(BusError::InvalidArgs(format!(
                "signal source `{source}' is not a unique name"
            )));
        }
        self.source = Some(source.to_string());
        Ok(self)
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Match rule asking the daemon for these signals.
    #[must_use]
    pub fn match_rule(&self) -> MatchRule {
        let mut rule = MatchRule::signal(&self.interface, &self.member);
        if let Some(path) = &self.path {
            rule = rule.with_path(path.clone());
        }
        if let Some(source) = &self.source {
            rule = rule.with_sender(source);
        }
        rule
    }

    fn lookup_keys(message: &Message) -> Vec<Self> {
        let (Some(interface), Some(member)) = (message.interface(), message.member()) else {
            return Vec::new();
        };
        let exact = Self {
            interface: interface.to_string(),
            member: member.to_string(),
            path: message.path().cloned(),
            source: message.sender().map(str::to_string),
        };
        let mut keys = Vec::with_capacity(4);
        for path in [exact.path.clone(), None] {
            for source in [exact.source.clone(), None] {
                let key = Self {
                    interface: exact.interface.clone(),
                    member: exact.member.clone(),
                    path: path.clone(),
                    source,
                };
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

/// Registered handlers by key.
#[derive(Default)]
pub(crate) struct SignalTable {
    handlers: DashMap<SignalKey, Vec<(HandlerId, SignalHandler)>>,
    keys: DashMap<HandlerId, SignalKey>,
    next_id: AtomicU64,
}

impl SignalTable {
    /// Register a handler. Returns its id and whether it is the first for the key.
    pub(crate) fn add(&self, key: SignalKey, handler: SignalHandler) -> (HandlerId, bool) {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.handlers.entry(key.clone()).or_default();
        let first = entry.is_empty();
        entry.push((id, handler));
        drop(entry);
        self.keys.insert(id, key);
        (id, first)
    }

    /// Remove a handler. Returns its key and whether it was the last for the key.
    pub(crate) fn remove(&self, id: HandlerId) -> Option<(SignalKey, bool)> {
        let (_, key) = self.keys.remove(&id)?;
        let mut last = false;
        if let Some(mut entry) = self.handlers.get_mut(&key) {
            entry.retain(|(handler_id, _)| *handler_id != id);
            last = entry.is_empty();
        }
        if last {
            self.handlers.remove_if(&key, |_, handlers| handlers.is_empty());
        }
        Some((key, last))
    }

    /// Handlers interested in `message`.
    pub(crate) fn matching(&self, message: &Message) -> Vec<SignalHandler> {
        let mut found = Vec::new();
        for key in SignalKey::lookup_keys(message) {
            if let Some(entry) = self.handlers.get(&key) {
                found.extend(entry.iter().map(|(_, handler)| Arc::clone(handler)));
            }
        }
        trace!(handlers = found.len(), member = ?message.member(), "signal lookup");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(path: &str, sender: Option<&str>) -> Message {
        let mut message = Message::signal(path, "org.example.Sensor", "Changed")
            .unwrap()
            .build()
            .unwrap();
        if let Some(sender) = sender {
            message.set_sender(sender);
        }
        message
    }

    fn noop() -> SignalHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn test_four_way_lookup() {
        let table = SignalTable::default();
        let base = SignalKey::new("org.example.Sensor", "Changed").unwrap();
        let path = ObjectPath::new("/s/1").unwrap();
        table.add(base.clone(), noop());
        table.add(base.clone().with_path(path.clone()), noop());
        table.add(base.clone().with_source(":1.7").unwrap(), noop());
        table.add(
            base.clone().with_path(path).with_source(":1.7").unwrap(),
            noop(),
        );
        table.add(base.with_source(":1.8").unwrap(), noop());

        assert_eq!(table.matching(&changed("/s/1", Some(":1.7"))).len(), 4);
        assert_eq!(table.matching(&changed("/s/2", Some(":1.7"))).len(), 2);
        assert_eq!(table.matching(&changed("/s/1", None)).len(), 2);
    }

    #[test]
    fn test_remove_reports_last_handler() {
        let table = SignalTable::default();
        let key = SignalKey::new("org.example.Sensor", "Changed").unwrap();
        let (first, is_first) = table.add(key.clone(), noop());
        let (second, is_second_first) = table.add(key, noop());
        assert!(is_first);
        assert!(!is_second_first);
        assert_eq!(table.remove(first).map(|(_, last)| last), Some(false));
        assert_eq!(table.remove(second).map(|(_, last)| last), Some(true));
        assert!(table.remove(second).is_none());
    }

    #[test]
    fn test_well_known_source_is_rejected() {
        let key = SignalKey::new("org.example.Sensor", "Changed").unwrap();
        assert!(matches!(
            key.with_source("org.example.Service"),
            Err(BusError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_match_rule_for_key() {
        let key = SignalKey::new("org.example.Sensor", "Changed")
            .unwrap()
            .with_source(":1.3")
            .unwrap();
        assert_eq!(
            key.match_rule().to_string(),
            "type='signal',sender=':1.3',interface='org.example.Sensor',member='Changed'"
        );
    }
}
