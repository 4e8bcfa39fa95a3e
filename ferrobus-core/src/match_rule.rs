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

//! Match rules, as passed to `AddMatch`.
//!
//! A rule is a comma separated list of `key='value'` pairs. Every key given
//! must match for the rule to match; absent keys match anything.

use std::fmt;

use crate::error::BusError;
use crate::message::{Message, MessageType};
use crate::names::ObjectPath;
use crate::value::Value;

/// Highest `argN` index accepted.
pub const MAX_ARG_INDEX: u8 = 63;

/// A parsed match rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// `type`
    pub message_type: Option<MessageType>,
    /// `sender`
    pub sender: Option<String>,
    /// `interface`
    pub interface: Option<String>,
    /// `member`
    pub member: Option<String>,
    /// `path`
    pub path: Option<ObjectPath>,
    /// `path_namespace`
    pub path_namespace: Option<ObjectPath>,
    /// `destination`
    pub destination: Option<String>,
    /// `argN` string comparisons, sorted by index.
    pub args: Vec<(u8, String)>,
}

impl MatchRule {
    /// Rule matching signals `interface.member`.
    #[must_use]
    pub fn signal(interface: &str, member: &str) -> Self {
        Self {
            message_type: Some(MessageType::Signal),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::default()
        }
    }

    /// Restrict to one object path.
    #[must_use]
    pub fn with_path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Restrict to one sender.
    #[must_use]
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    /// Parse rule text.
    pub fn parse(text: &str) -> Result<Self, BusError> {
        let mut rule = Self::default();
        for (key, value) in split_pairs(text)? {
            rule.set(&key, value)?;
        }
        if rule.path.is_some() && rule.path_namespace.is_some() {
            return Err(BusError::Parse(
                "path and path_namespace cannot be combined".to_string(),
            ));
        }
        rule.args.sort_by_key(|(index, _)| *index);
        Ok(rule)
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), BusError> {
        match key {
            "type" => {
                self.message_type = Some(match value.as_str() {
                    "method_call" => MessageType::MethodCall,
                    "method_return" => MessageType::MethodReturn,
                    "error" => MessageType::Error,
                    "signal" => MessageType::Signal,
                    other => {
                        return Err(BusError::Parse(format!("Unknown message type `{other}'")))
                    }
                });
            }
            "sender" => self.sender = Some(value),
            "interface" => self.interface = Some(value),
            "member" => self.member = Some(value),
            "path" => self.path = Some(ObjectPath::new(value)?),
            "path_namespace" => self.path_namespace = Some(ObjectPath::new(value)?),
            "destination" => self.destination = Some(value),
            _ => {
                let index = key
                    .strip_prefix("arg")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n <= MAX_ARG_INDEX)
                    .ok_or_else(|| BusError::Parse(format!("Unknown match rule key `{key}'")))?;
                if self.args.iter().any(|(i, _)| *i == index) {
                    return Err(BusError::Parse(format!("Match rule key `{key}' given twice")));
                }
                self.args.push((index, value));
            }
        }
        Ok(())
    }

    /// Whether `message` satisfies the rule.
    ///
    /// `sender_owns` answers whether the sending connection owns a given bus
    /// name, so rules naming a well-known sender match its owner.
    pub fn matches(&self, message: &Message, sender_owns: impl Fn(&str) -> bool) -> bool {
        if self
            .message_type
            .is_some_and(|ty| ty != message.message_type())
        {
            return false;
        }
        if let Some(sender) = &self.sender {
            if message.sender() != Some(sender.as_str()) && !sender_owns(sender) {
                return false;
            }
        }
        if !field_matches(&self.interface, message.interface())
            || !field_matches(&self.member, message.member())
            || !field_matches(&self.destination, message.destination())
        {
            return false;
        }
        if let Some(path) = &self.path {
            if message.path() != Some(path) {
                return false;
            }
        }
        if let Some(namespace) = &self.path_namespace {
            match message.path() {
                Some(path) if path.has_prefix(namespace) => {}
                _ => return false,
            }
        }
        self.args.iter().all(|(index, expected)| {
            matches!(
                message.body().get(usize::from(*index)),
                Some(Value::String(actual)) if actual == expected
            )
        })
    }
}

fn field_matches(expected: &Option<String>, actual: Option<&str>) -> bool {
    expected.as_deref().map_or(true, |e| actual == Some(e))
}

/// Split `key='value',key=value` into pairs.
///
/// Inside quotes every character is literal; outside, `\'` is an apostrophe.
fn split_pairs(text: &str) -> Result<Vec<(String, String)>, BusError> {
    let mut pairs = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(BusError::Parse(format!("Match rule `{text}' has an empty key")));
        }
        let mut value = String::new();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            match c {
                '\'' => quoted = !quoted,
                '\\' if !quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                ',' if !quoted => break,
                c => value.push(c),
            }
        }
        if quoted {
            return Err(BusError::Parse(format!("Unterminated quote in match rule `{text}'")));
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn quote(value: &str) -> String {
    // An apostrophe ends the quoted run, is escaped, and a new run starts.
    format!("'{}'", value.replace('\'', "'\\''"))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ty) = self.message_type {
            parts.push(format!("type={}", quote(&ty.to_string())));
        }
        let strings = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                parts.push(format!("{key}={}", quote(value)));
            }
        }
        if let Some(path) = &self.path {
            parts.push(format!("path={}", quote(path.as_str())));
        }
        if let Some(namespace) = &self.path_namespace {
            parts.push(format!("path_namespace={}", quote(namespace.as_str())));
        }
        if let Some(destination) = &self.destination {
            parts.push(format!("destination={}", quote(destination)));
        }
        for (index, value) in &self.args {
            parts.push(format!("arg{index}={}", quote(value)));
        }
        f.write_str(&parts.join(","))
    }
}

impl std::str::FromStr for MatchRule {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
