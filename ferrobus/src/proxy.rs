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

//! Client-side proxies for remote objects.
//!
//! Every call funnels through one primitive that builds a method call from
//! `(method, args)`; the typed and asynchronous variants wrap it.

use std::time::Duration;

use tracing::{debug, trace};

use ferrobus_core::error::BusError;
use ferrobus_core::message::Flags;
use ferrobus_core::names::{check_bus_name, check_interface_name, ObjectPath, INTROSPECTABLE_INTERFACE};
use ferrobus_core::{FromReply, IntoArgs, Message, Signature, Value};

use crate::connection::{Connection, PendingReply};
use crate::introspect::interface_names;
use crate::object::InterfaceDescriptor;

/// Handle for calling methods of one remote object.
#[derive(Debug, Clone)]
pub struct Proxy {
    connection: Connection,
    destination: Option<String>,
    path: ObjectPath,
    interface: Option<String>,
    descriptor: Option<InterfaceDescriptor>,
    timeout: Option<Duration>,
}

impl Proxy {
    pub(crate) fn new(
        connection: Connection,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
    ) -> Result<Self, BusError> {
        if let Some(destination) = destination {
            check_bus_name(destination)?;
        }
        if let Some(interface) = interface {
            check_interface_name(interface)?;
        }
        let descriptor = interface.and_then(|name| connection.registered_interface(name));
        Ok(Self {
            destination: destination.map(str::to_string),
            path: ObjectPath::new(path)?,
            interface: interface.map(str::to_string),
            descriptor,
            timeout: None,
            connection,
        })
    }

    /// Introspect the remote object and bind the first interface it
    /// reports that has a registered descriptor.
    pub(crate) async fn resolve(
        connection: Connection,
        destination: Option<&str>,
        path: &str,
    ) -> Result<Self, BusError> {
        let introspectable = Self::new(
            connection.clone(),
            destination,
            path,
            Some(INTROSPECTABLE_INTERFACE),
        )?;
        let xml: String = introspectable.call_typed("Introspect", ()).await?;
        for name in interface_names(&xml) {
            if let Some(descriptor) = connection.registered_interface(&name) {
                debug!(path, interface = %name, "dynamic proxy resolved");
                return Ok(Self::new(connection, destination, path, Some(&name))?
                    .with_descriptor(descriptor));
            }
        }
        Err(BusError::UnknownInterface(format!(
            "none of the interfaces of {path} has been registered"
        )))
    }

    /// Bind `descriptor`: unknown methods are rejected locally and
    /// arguments are converted to the declared types before sending.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: InterfaceDescriptor) -> Self {
        self.interface = Some(descriptor.name().to_string());
        self.descriptor = Some(descriptor);
        self
    }

    /// Timeout for awaited calls made through this proxy.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bus name the calls are addressed to.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Path of the remote object.
    #[must_use]
    pub const fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Interface of the calls.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Bound descriptor, if any.
    #[must_use]
    pub const fn descriptor(&self) -> Option<&InterfaceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Connection the proxy calls through.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    fn check_args(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, BusError> {
        let Some(descriptor) = &self.descriptor else {
            return Ok(args);
        };
        let overloads: Vec<_> = descriptor.methods_named(method).collect();
        if overloads.is_empty() {
            return Err(BusError::UnknownMethod(format!(
                "The method `{}.{method}' does not exist on this object.",
                descriptor.name()
            )));
        }
        let signature = Signature::from_types(args.iter().map(Value::value_type).collect())?;
        if overloads
            .iter()
            .any(|overload| *overload.in_signature() == signature)
        {
            return Ok(args);
        }
        let mut last_error = None;
        for overload in overloads
            .iter()
            .filter(|overload| overload.inputs().len() == args.len())
        {
            let coerced: Result<Vec<Value>, BusError> = args
                .iter()
                .zip(overload.inputs())
                .map(|(value, input)| value.clone().coerce(&input.ty))
                .collect();
            match coerced {
                Ok(coerced) => {
                    trace!(method, signature = %overload.in_signature(), "arguments coerced");
                    return Ok(coerced);
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            BusError::InvalidArgs(format!(
                "`{method}' does not take {} argument(s) of signature `{signature}'",
                args.len()
            ))
        }))
    }

    fn message(&self, method: &str, args: Vec<Value>, flags: Flags) -> Result<Message, BusError> {
        let args = self.check_args(method, args)?;
        let mut builder = Message::method_call(self.path.as_str(), method)?.flags(flags);
        if let Some(interface) = &self.interface {
            builder = builder.interface(interface)?;
        }
        if let Some(destination) = &self.destination {
            builder = builder.destination(destination)?;
        }
        builder.body(args).build()
    }

    /// Call `method` and wait for its reply body.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, BusError> {
        let message = self.message(method, args, Flags::empty())?;
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.connection.config().call_timeout());
        let reply = self.connection.call_with_timeout(message, timeout).await?;
        Ok(reply.into_body())
    }

    /// Call `method` with native arguments and convert the reply.
    pub async fn call_typed<A, R>(&self, method: &str, args: A) -> Result<R, BusError>
    where
        A: IntoArgs,
        R: FromReply,
    {
        R::from_reply(self.call(method, args.into_args()).await?)
    }

    /// Start a call and return a handle to its reply.
    pub fn call_async(&self, method: &str, args: Vec<Value>) -> Result<PendingReply, BusError> {
        let message = self.message(method, args, Flags::empty())?;
        self.connection.call_async(message)
    }

    /// Start a call; `on_reply` receives the reply body on a worker, or
    /// `on_error` the failure.
    pub fn call_with_callback<R, E>(
        &self,
        method: &str,
        args: Vec<Value>,
        on_reply: R,
        on_error: E,
    ) -> Result<u32, BusError>
    where
        R: FnOnce(Vec<Value>) + Send + 'static,
        E: FnOnce(BusError) + Send + 'static,
    {
        let message = self.message(method, args, Flags::empty())?;
        self.connection
            .call_with_callback(message, move |reply| on_reply(reply.into_body()), on_error)
    }

    /// Call `method` without asking for a reply.
    pub fn call_no_reply(&self, method: &str, args: Vec<Value>) -> Result<(), BusError> {
        let message = self.message(method, args, Flags::NO_REPLY_EXPECTED)?;
        self.connection.send_no_reply(message).map(|_| ())
    }
}
