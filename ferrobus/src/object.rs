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

//! Objects that can be exported on a connection.
//!
//! An exported object declares its surface through [`InterfaceDescriptor`]s
//! and answers calls through [`BusObject::invoke`]. Objects built from
//! closures come from [`ObjectBuilder`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use ferrobus_core::error::BusError;
use ferrobus_core::names::{
    check_interface_name, check_member_name, is_valid_error_name, ObjectPath,
};
use ferrobus_core::signature::{Signature, Type};
use ferrobus_core::{FromReply, IntoArgs, MethodError, Value, WireArgs};

use crate::connection::Connection;

/// Details of the call being served, passed to every handler.
#[derive(Clone)]
pub struct CallContext {
    /// Unique name of the caller, absent on peer-to-peer connections.
    pub sender: Option<String>,
    /// Path the call was addressed to.
    pub path: ObjectPath,
    /// Interface named by the caller, if any.
    pub interface: Option<String>,
    /// Method name.
    pub member: String,
    /// Serial of the call.
    pub serial: u32,
    /// Whether the caller asked for no reply.
    pub no_reply_expected: bool,
    /// Connection the call arrived on.
    pub connection: Connection,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("sender", &self.sender)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("member", &self.member)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// A named, typed argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDescriptor {
    /// Argument name shown in introspection.
    pub name: Option<String>,
    /// Wire type.
    pub ty: Type,
}

/// A `name = value` annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Annotation name, e.g. `org.freedesktop.DBus.Deprecated`.
    pub name: String,
    /// Annotation value.
    pub value: String,
}

fn parse_single(signature: &str) -> Result<Type, BusError> {
    Type::parse(signature)
}

fn append_type(types: &[ArgDescriptor], ty: &Type) -> Result<Signature, BusError> {
    let mut all: Vec<Type> = types.iter().map(|arg| arg.ty.clone()).collect();
    all.push(ty.clone());
    Signature::from_types(all)
}

/// Declared shape of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    inputs: Vec<ArgDescriptor>,
    outputs: Vec<ArgDescriptor>,
    in_signature: Signature,
    out_signature: Signature,
    errors: Vec<String>,
    annotations: Vec<Annotation>,
}

impl MethodDescriptor {
    /// Method without arguments.
    pub fn new(name: &str) -> Result<Self, BusError> {
        check_member_name(name)?;
        Ok(Self {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            in_signature: Signature::empty(),
            out_signature: Signature::empty(),
            errors: Vec::new(),
            annotations: Vec::new(),
        })
    }

    /// Method whose arguments and results are given by static types.
    pub fn typed<A: WireArgs, R: WireArgs>(name: &str) -> Result<Self, BusError> {
        let mut method = Self::new(name)?;
        for ty in A::arg_types() {
            method = method.input(None, ty)?;
        }
        for ty in R::arg_types() {
            method = method.output(None, ty)?;
        }
        Ok(method)
    }

    /// Append an input argument given as a single complete signature.
    pub fn arg(self, name: &str, signature: &str) -> Result<Self, BusError> {
        self.input(Some(name), parse_single(signature)?)
    }

    /// Append an output argument given as a single complete signature.
    pub fn returns(self, name: &str, signature: &str) -> Result<Self, BusError> {
        self.output(Some(name), parse_single(signature)?)
    }

    fn input(mut self, name: Option<&str>, ty: Type) -> Result<Self, BusError> {
        self.in_signature = append_type(&self.inputs, &ty)?;
        self.inputs.push(ArgDescriptor {
            name: name.map(str::to_string),
            ty,
        });
        Ok(self)
    }

    fn output(mut self, name: Option<&str>, ty: Type) -> Result<Self, BusError> {
        self.out_signature = append_type(&self.outputs, &ty)?;
        self.outputs.push(ArgDescriptor {
            name: name.map(str::to_string),
            ty,
        });
        Ok(self)
    }

    /// Declare an error the method may return.
    pub fn error(mut self, error_name: &str) -> Result<Self, BusError> {
        if !is_valid_error_name(error_name) {
            return Err(BusError::Parse(format!("invalid error name `{error_name}'")));
        }
        self.errors.push(error_name.to_string());
        Ok(self)
    }

    /// Attach an annotation.
    #[must_use]
    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push(Annotation {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input arguments.
    #[must_use]
    pub fn inputs(&self) -> &[ArgDescriptor] {
        &self.inputs
    }

    /// Output arguments.
    #[must_use]
    pub fn outputs(&self) -> &[ArgDescriptor] {
        &self.outputs
    }

    /// Signature of the input arguments.
    #[must_use]
    pub const fn in_signature(&self) -> &Signature {
        &self.in_signature
    }

    /// Signature of the output arguments.
    #[must_use]
    pub const fn out_signature(&self) -> &Signature {
        &self.out_signature
    }

    /// Declared error names.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Annotations.
    #[must_use]
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }
}

/// Declared shape of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDescriptor {
    name: String,
    args: Vec<ArgDescriptor>,
    signature: Signature,
    annotations: Vec<Annotation>,
}

impl SignalDescriptor {
    /// Signal without arguments.
    pub fn new(name: &str) -> Result<Self, BusError> {
        check_member_name(name)?;
        Ok(Self {
            name: name.to_string(),
            args: Vec::new(),
            signature: Signature::empty(),
            annotations: Vec::new(),
        })
    }

    /// Append an argument given as a single complete signature.
    pub fn arg(mut self, name: &str, signature: &str) -> Result<Self, BusError> {
        let ty = parse_single(signature)?;
        self.signature = append_type(&self.args, &ty)?;
        self.args.push(ArgDescriptor {
            name: Some(name.to_string()),
            ty,
        });
        Ok(self)
    }

    /// Attach an annotation.
    #[must_use]
    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push(Annotation {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Signal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments.
    #[must_use]
    pub fn args(&self) -> &[ArgDescriptor] {
        &self.args
    }

    /// Signature of the arguments.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Annotations.
    #[must_use]
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }
}

/// Declared surface of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
    signals: Vec<SignalDescriptor>,
    annotations: Vec<Annotation>,
}

impl InterfaceDescriptor {
    /// Empty interface.
    pub fn new(name: &str) -> Result<Self, BusError> {
        check_interface_name(name)?;
        Ok(Self {
            name: name.to_string(),
            methods: Vec::new(),
            signals: Vec::new(),
            annotations: Vec::new(),
        })
    }

    /// Add a method.
    #[must_use]
    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Add a signal.
    #[must_use]
    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signals.push(signal);
        self
    }

    /// Attach an annotation.
    #[must_use]
    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push(Annotation {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods.
    #[must_use]
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Signals.
    #[must_use]
    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }

    /// Annotations.
    #[must_use]
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Overloads of the method `name`.
    pub fn methods_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a MethodDescriptor> + 'a {
        self.methods.iter().filter(move |m| m.name == name)
    }
}

/// An object that can be exported on a connection.
///
/// `invoke` only sees calls that matched one of the declared methods, with
/// arguments already converted to the declared input types.
#[async_trait]
pub trait BusObject: Send + Sync + 'static {
    /// Interfaces implemented by the object.
    fn interfaces(&self) -> Vec<InterfaceDescriptor>;

    /// Run `interface.member`.
    async fn invoke(
        &self,
        ctx: CallContext,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, MethodError>;
}

/// Closure backing one method of a built object.
pub type MethodHandler = Arc<
    dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>, MethodError>>
        + Send
        + Sync,
>;

/// Builder of one interface of a closure-backed object.
pub struct InterfaceBuilder {
    descriptor: InterfaceDescriptor,
    handlers: HashMap<(String, String), MethodHandler>,
}

impl fmt::Debug for InterfaceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceBuilder")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl InterfaceBuilder {
    /// Start an interface.
    pub fn new(name: &str) -> Result<Self, BusError> {
        Ok(Self {
            descriptor: InterfaceDescriptor::new(name)?,
            handlers: HashMap::new(),
        })
    }

    /// Add a method working on raw values.
    ///
    /// The arguments passed to `handler` already have the declared types.
    #[must_use]
    pub fn method<F, Fut>(mut self, method: MethodDescriptor, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, MethodError>> + Send + 'static,
    {
        let key = (
            method.name().to_string(),
            method.in_signature().as_str().to_string(),
        );
        let handler: MethodHandler = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.handlers.insert(key, handler);
        self.descriptor = self.descriptor.with_method(method);
        self
    }

    /// Add a method with native argument and result tuples.
    pub fn typed_method<A, R, F, Fut>(self, name: &str, handler: F) -> Result<Self, BusError>
    where
        A: WireArgs + FromReply + Send + 'static,
        R: WireArgs + IntoArgs + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let descriptor = MethodDescriptor::typed::<A, R>(name)?;
        let handler = Arc::new(handler);
        Ok(self.method(descriptor, move |ctx, args| {
            let handler = Arc::clone(&handler);
            async move {
                let args = A::from_reply(args).map_err(MethodError::from)?;
                handler(ctx, args).await.map(IntoArgs::into_args)
            }
        }))
    }

    /// Declare a signal.
    #[must_use]
    pub fn signal(mut self, signal: SignalDescriptor) -> Self {
        self.descriptor = self.descriptor.with_signal(signal);
        self
    }

    /// Attach an annotation to the interface.
    #[must_use]
    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.descriptor = self.descriptor.annotate(name, value);
        self
    }
}

/// Builder of a closure-backed [`BusObject`].
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    interfaces: Vec<InterfaceBuilder>,
}

impl ObjectBuilder {
    /// Empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface.
    #[must_use]
    pub fn interface(mut self, interface: InterfaceBuilder) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Finish the object.
    #[must_use]
    pub fn build(self) -> Arc<dyn BusObject> {
        let mut descriptors = Vec::with_capacity(self.interfaces.len());
        let mut handlers = HashMap::new();
        for builder in self.interfaces {
            let interface = builder.descriptor.name().to_string();
            for ((member, signature), handler) in builder.handlers {
                handlers.insert((interface.clone(), member, signature), handler);
            }
            descriptors.push(builder.descriptor);
        }
        Arc::new(ClosureObject {
            descriptors,
            handlers,
        })
    }
}

struct ClosureObject {
    descriptors: Vec<InterfaceDescriptor>,
    handlers: HashMap<(String, String, String), MethodHandler>,
}

#[async_trait]
impl BusObject for ClosureObject {
    fn interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.descriptors.clone()
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, MethodError> {
        let signature = Signature::from_types(args.iter().map(Value::value_type).collect())
            .map_err(MethodError::from)?;
        let key = (
            interface.to_string(),
            member.to_string(),
            signature.as_str().to_string(),
        );
        let Some(handler) = self.handlers.get(&key) else {
            return Err(MethodError::from(BusError::UnknownMethod(format!(
                "The method `{interface}.{member}' does not exist on this object."
            ))));
        };
        handler(ctx, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_descriptor_signatures() {
        let method = MethodDescriptor::new("Frob")
            .unwrap()
            .arg("name", "s")
            .unwrap()
            .arg("options", "a{sv}")
            .unwrap()
            .returns("ok", "b")
            .unwrap()
            .error("org.example.Error.Busy")
            .unwrap();
        assert_eq!(method.in_signature().as_str(), "sa{sv}");
        assert_eq!(method.out_signature().as_str(), "b");
        assert_eq!(method.errors(), ["org.example.Error.Busy".to_string()]);
    }

    #[test]
    fn test_typed_descriptor() {
        let method = MethodDescriptor::typed::<(i32, i32), (i64,)>("Add").unwrap();
        assert_eq!(method.in_signature().as_str(), "ii");
        assert_eq!(method.out_signature().as_str(), "x");
        assert!(method.inputs().iter().all(|arg| arg.name.is_none()));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        assert!(MethodDescriptor::new("not.valid").is_err());
        assert!(MethodDescriptor::new("Ok").unwrap().arg("x", "ii").is_err());
        assert!(MethodDescriptor::new("Ok").unwrap().error("Bad").is_err());
        assert!(InterfaceDescriptor::new("nodots").is_err());
        assert!(SignalDescriptor::new("").is_err());
    }

    #[test]
    fn test_builder_collects_descriptors() {
        let object = ObjectBuilder::new()
            .interface(
                InterfaceBuilder::new("org.example.Calc")
                    .unwrap()
                    .typed_method("Add", |_ctx, (a, b): (i32, i32)| async move {
                        Ok::<_, MethodError>((a + b,))
                    })
                    .unwrap()
                    .signal(SignalDescriptor::new("Overflow").unwrap()),
            )
            .build();
        let interfaces = object.interfaces();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].methods_named("Add").count(), 1);
        assert_eq!(interfaces[0].signals()[0].name(), "Overflow");
    }
}
