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

//! Bus addresses.
//!
//! An address string holds one or more alternatives separated by `;`, each
//! of the form `transport:key=value,key=value`. Values may be %-escaped.

use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::error::BusError;

/// Environment variable naming the session bus.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Environment variable naming the system bus.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// Address of the system bus when the environment does not name one.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// One alternative of a bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    params: Vec<(String, String)>,
}

/// Where a transport connects or listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
    /// TCP socket.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port, zero to let the listener choose.
        port: u16,
    },
}

impl BusAddress {
    /// Address with no parameters.
    #[must_use]
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            params: Vec::new(),
        }
    }

    /// `unix:path=<path>`
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        Self::new("unix").with_param("path", path.to_string_lossy())
    }

    /// `tcp:host=<host>,port=<port>`
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new("tcp")
            .with_param("host", host)
            .with_param("port", port.to_string())
    }

    /// Parse a single alternative.
    pub fn parse(address: &str) -> Result<Self, BusError> {
        let (transport, rest) = address
            .split_once(':')
            .ok_or_else(|| BusError::Parse(format!("Address `{address}' has no transport")))?;
        if transport.is_empty() {
            return Err(BusError::Parse(format!(
                "Address `{address}' has an empty transport"
            )));
        }
        let mut params = Vec::new();
        for pair in rest.split(',').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                BusError::Parse(format!("Address parameter `{pair}' has no value"))
            })?;
            if key.is_empty() {
                return Err(BusError::Parse(format!(
                    "Address parameter `{pair}' has no key"
                )));
            }
            if params.iter().any(|(k, _): &(String, String)| k == key) {
                return Err(BusError::Parse(format!(
                    "Address parameter `{key}' given twice"
                )));
            }
            params.push((key.to_string(), unescape(value)?));
        }
        Ok(Self {
            transport: transport.to_string(),
            params,
        })
    }

    /// Parse every `;`-separated alternative.
    pub fn parse_list(addresses: &str) -> Result<Vec<Self>, BusError> {
        let list = addresses
            .split(';')
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if list.is_empty() {
            return Err(BusError::Parse("Empty bus address".to_string()));
        }
        Ok(list)
    }

    /// Alternatives for the session bus.
    ///
    /// Reads `DBUS_SESSION_BUS_ADDRESS`, falling back to
    /// `$XDG_RUNTIME_DIR/bus`.
    pub fn session() -> Result<Vec<Self>, BusError> {
        if let Ok(address) = std::env::var(SESSION_BUS_ENV) {
            return Self::parse_list(&address);
        }
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| {
            BusError::Parse(format!(
                "{SESSION_BUS_ENV} and XDG_RUNTIME_DIR are both unset"
            ))
        })?;
        Ok(vec![Self::unix(PathBuf::from(runtime_dir).join("bus"))])
    }

    /// Alternatives for the system bus.
    pub fn system() -> Result<Vec<Self>, BusError> {
        let address = std::env::var(SYSTEM_BUS_ENV)
            .unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_string());
        Self::parse_list(&address)
    }

    /// Transport name.
    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Unescaped value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing an existing value.
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    /// Server GUID, if present.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    /// Add a freshly generated `guid` unless one is already present.
    #[must_use]
    pub fn ensure_guid(self) -> Self {
        if self.guid().is_some() {
            self
        } else {
            self.with_param("guid", generate_guid())
        }
    }

    /// Resolve the transport to an [`Endpoint`].
    ///
    /// Only `unix:path=` and `tcp:` are supported.
    pub fn endpoint(&self) -> Result<Endpoint, BusError> {
        match self.transport.as_str() {
            "unix" => {
                if self.get("abstract").is_some() {
                    return Err(BusError::Parse(
                        "Abstract unix sockets are not supported".to_string(),
                    ));
                }
                self.get("path")
                    .map(|path| Endpoint::Unix(PathBuf::from(path)))
                    .ok_or_else(|| {
                        BusError::Parse(format!("Address `{self}' has no path"))
                    })
            }
            "tcp" => {
                let host = self.get("host").unwrap_or("localhost").to_string();
                let port = match self.get("port") {
                    Some(port) => port.parse::<u16>().map_err(|_| {
                        BusError::Parse(format!("Invalid tcp port `{port}'"))
                    })?,
                    None => 0,
                };
                Ok(Endpoint::Tcp { host, port })
            }
            other => Err(BusError::Parse(format!("Unsupported transport `{other}'"))),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            write!(f, "{key}={}", escape(value))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for BusAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 16 random bytes as 32 lowercase hex characters.
#[must_use]
pub fn generate_guid() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().fold(String::with_capacity(32), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

const fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*')
}

/// %-escape an address value.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if is_optionally_escaped(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02x}");
        }
    }
    out
}

/// Reverse [`escape`].
pub fn unescape(value: &str) -> Result<String, BusError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .ok_or_else(|| BusError::Parse(format!("Truncated escape in `{value}'")))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| BusError::Parse(format!("Invalid escape `%{hex}'")))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| BusError::Parse(format!("Escaped value `{value}' is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_address() {
        let address = BusAddress::parse("unix:path=/tmp/ferrobus-test,guid=0123").unwrap();
        assert_eq!(address.transport(), "unix");
        assert_eq!(address.guid(), Some("0123"));
        assert_eq!(
            address.endpoint().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/ferrobus-test"))
        );
    }

    #[test]
    fn test_parse_alternatives() {
        let list =
            BusAddress::parse_list("unix:abstract=/tmp/x;tcp:host=127.0.0.1,port=4242").unwrap();
        assert_eq!(list.len(), 2);
        assert!(matches!(list[0].endpoint(), Err(BusError::Parse(_))));
        assert_eq!(
            list[1].endpoint().unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 4242
            }
        );
    }

    #[test]
    fn test_escaping_round_trip() {
        let address = BusAddress::unix("/tmp/with space,comma");
        let text = address.to_string();
        assert_eq!(text, "unix:path=/tmp/with%20space%2ccomma");
        assert_eq!(BusAddress::parse(&text).unwrap(), address);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!(BusAddress::parse("no-colon").is_err());
        assert!(BusAddress::parse(":path=/x").is_err());
        assert!(BusAddress::parse("unix:path").is_err());
        assert!(BusAddress::parse("unix:path=/a,path=/b").is_err());
        assert!(BusAddress::parse("unix:path=%zz").is_err());
        assert!(BusAddress::parse_list(";;").is_err());
        assert!(BusAddress::parse("tcp:port=99999").unwrap().endpoint().is_err());
    }

    #[test]
    fn test_ensure_guid() {
        let address = BusAddress::tcp("localhost", 0).ensure_guid();
        let guid = address.guid().unwrap().to_string();
        assert_eq!(guid.len(), 32);
        assert!(guid.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(address.ensure_guid().guid(), Some(guid.as_str()));
    }
}
