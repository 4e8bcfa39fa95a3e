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

//! Introspection XML.

use std::fmt::Write as _;

use lazy_static::lazy_static;
use regex::Regex;

use ferrobus_core::names::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE};

use crate::object::{Annotation, ArgDescriptor, InterfaceDescriptor};

/// Document type declaration opening every introspection document.
pub const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

/// Annotation listing an error a method may return.
pub const METHOD_ERROR_ANNOTATION: &str = "org.freedesktop.DBus.Method.Error";

lazy_static! {
    static ref INTERFACE_ELEMENT: Option<Regex> =
        Regex::new(r#"<interface\s+name\s*=\s*"([^"]+)""#).ok();
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn write_annotations(out: &mut String, annotations: &[Annotation], indent: &str) {
    for annotation in annotations {
        let _ = writeln!(
            out,
            "{indent}<annotation name=\"{}\" value=\"{}\"/>",
            escape(&annotation.name),
            escape(&annotation.value)
        );
    }
}

fn write_args(out: &mut String, args: &[ArgDescriptor], direction: Option<&str>) {
    for arg in args {
        out.push_str("      <arg");
        if let Some(name) = &arg.name {
            let _ = write!(out, " name=\"{}\"", escape(name));
        }
        let _ = write!(out, " type=\"{}\"", escape(&arg.ty.to_string()));
        if let Some(direction) = direction {
            let _ = write!(out, " direction=\"{direction}\"");
        }
        out.push_str("/>\n");
    }
}

/// XML of one interface.
#[must_use]
pub fn interface_xml(interface: &InterfaceDescriptor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  <interface name=\"{}\">", escape(interface.name()));
    for method in interface.methods() {
        let _ = writeln!(out, "    <method name=\"{}\">", escape(method.name()));
        write_args(&mut out, method.inputs(), Some("in"));
        write_args(&mut out, method.outputs(), Some("out"));
        for error in method.errors() {
            let _ = writeln!(
                out,
                "      <annotation name=\"{METHOD_ERROR_ANNOTATION}\" value=\"{}\"/>",
                escape(error)
            );
        }
        write_annotations(&mut out, method.annotations(), "      ");
        out.push_str("    </method>\n");
    }
    for signal in interface.signals() {
        let _ = writeln!(out, "    <signal name=\"{}\">", escape(signal.name()));
        write_args(&mut out, signal.args(), None);
        write_annotations(&mut out, signal.annotations(), "      ");
        out.push_str("    </signal>\n");
    }
    write_annotations(&mut out, interface.annotations(), "    ");
    out.push_str("  </interface>\n");
    out
}

/// XML of the Introspectable and Peer interfaces every node implements.
#[must_use]
pub fn standard_interfaces_xml() -> String {
    format!(
        "  <interface name=\"{INTROSPECTABLE_INTERFACE}\">\n    <method name=\"Introspect\">\n      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n    </method>\n  </interface>\n  <interface name=\"{PEER_INTERFACE}\">\n    <method name=\"Ping\">\n    </method>\n    <method name=\"GetMachineId\">\n      <arg name=\"machine_uuid\" type=\"s\" direction=\"out\"/>\n    </method>\n  </interface>\n"
    )
}

/// Complete document for a node with the given interface XML and children.
#[must_use]
pub fn node_xml(interfaces: &str, children: &[String]) -> String {
    let mut out = String::from(DOCTYPE);
    out.push_str("\n<node>\n");
    out.push_str(interfaces);
    for child in children {
        let _ = writeln!(out, "  <node name=\"{}\"/>", escape(child));
    }
    out.push_str("</node>\n");
    out
}

/// Names of the interfaces declared in an introspection document.
#[must_use]
pub fn interface_names(xml: &str) -> Vec<String> {
    let Some(pattern) = INTERFACE_ELEMENT.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(xml)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
        .collect()
}
