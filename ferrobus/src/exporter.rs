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

//! Registry of objects exported on a connection.
//!
//! Every export precomputes a dispatch table keyed by method name and input
//! signature, and the interface part of its introspection document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use ferrobus_core::error::BusError;
use ferrobus_core::names::ObjectPath;
use ferrobus_core::signature::{Signature, Type};
use ferrobus_core::Value;

use crate::introspect::{interface_xml, node_xml, standard_interfaces_xml};
use crate::object::BusObject;

struct MethodEntry {
    interface: String,
    in_signature: Signature,
}

/// An object together with its dispatch table.
pub(crate) struct ExportedObject {
    pub(crate) object: Arc<dyn BusObject>,
    methods: HashMap<String, Vec<MethodEntry>>,
    interfaces_xml: String,
}

/// A method call resolved against a dispatch table.
#[derive(Debug)]
pub(crate) struct ResolvedCall {
    pub(crate) interface: String,
    pub(crate) args: Vec<Value>,
}

impl ExportedObject {
    fn new(object: Arc<dyn BusObject>) -> Self {
        let mut methods: HashMap<String, Vec<MethodEntry>> = HashMap::new();
        let mut interfaces_xml = String::new();
        for interface in object.interfaces() {
            for method in interface.methods() {
                methods
                    .entry(method.name().to_string())
                    .or_default()
                    .push(MethodEntry {
                        interface: interface.name().to_string(),
                        in_signature: method.in_signature().clone(),
                    });
            }
            interfaces_xml.push_str(&interface_xml(&interface));
        }
        interfaces_xml.push_str(&standard_interfaces_xml());
        Self {
            object,
            methods,
            interfaces_xml,
        }
    }

    /// Find the method a call addresses and convert its arguments.
    ///
    /// An exact signature match wins; otherwise the first overload of the
    /// same arity whose types the arguments coerce to is used.
    pub(crate) fn resolve(
        &self,
        interface: Option<&str>,
        member: &str,
        signature: &Signature,
        args: Vec<Value>,
    ) -> Result<ResolvedCall, BusError> {
        let unknown = || {
            let qualified = interface.map_or_else(|| member.to_string(), |i| format!("{i}.{member}"));
            BusError::UnknownMethod(format!(
                "The method `{qualified}' does not exist on this object."
            ))
        };
        let candidates: Vec<&MethodEntry> = self
            .methods
            .get(member)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| interface.map_or(true, |i| entry.interface == i))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(entry) = candidates
            .iter()
            .find(|entry| entry.in_signature == *signature)
        {
            return Ok(ResolvedCall {
                interface: entry.interface.clone(),
                args,
            });
        }

        let same_arity: Vec<&&MethodEntry> = candidates
            .iter()
            .filter(|entry| entry.in_signature.types().len() == args.len())
            .collect();
        if same_arity.is_empty() {
            return Err(unknown());
        }
        for entry in same_arity {
            if let Ok(coerced) = coerce_all(&args, entry.in_signature.types()) {
                trace!(member, signature = %entry.in_signature, "arguments coerced");
                return Ok(ResolvedCall {
                    interface: entry.interface.clone(),
                    args: coerced,
                });
            }
        }
        Err(BusError::UnknownMethod(
            "Failure in de-serializing message".to_string(),
        ))
    }

    /// Whether any interface of the object has a method `member`.
    pub(crate) fn declares(&self, member: &str) -> bool {
        self.methods.contains_key(member)
    }
}

fn coerce_all(args: &[Value], types: &[Type]) -> Result<Vec<Value>, BusError> {
    args.iter()
        .zip(types)
        .map(|(value, ty)| value.clone().coerce(ty))
        .collect()
}

/// Objects and fallbacks exported on one connection.
#[derive(Default)]
pub(crate) struct ObjectRegistry {
    objects: RwLock<BTreeMap<ObjectPath, Arc<ExportedObject>>>,
    fallbacks: RwLock<BTreeMap<ObjectPath, Arc<ExportedObject>>>,
}

impl ObjectRegistry {
    pub(crate) fn export(&self, path: ObjectPath, object: Arc<dyn BusObject>) -> Result<(), BusError> {
        self.export_entry(path, object).map(|_| ())
    }

    /// Export and hand back a handle identifying this particular entry.
    pub(crate) fn export_entry(
        &self,
        path: ObjectPath,
        object: Arc<dyn BusObject>,
    ) -> Result<Weak<ExportedObject>, BusError> {
        let exported = Arc::new(ExportedObject::new(object));
        let mut objects = self.objects.write();
        if objects.contains_key(&path) {
            return Err(BusError::AlreadyExported(path.into_string()));
        }
        debug!(%path, "object exported");
        let entry = Arc::downgrade(&exported);
        objects.insert(path, exported);
        Ok(entry)
    }

    pub(crate) fn unexport(&self, path: &ObjectPath) -> bool {
        let removed = self.objects.write().remove(path).is_some();
        if removed {
            debug!(%path, "object unexported");
        }
        removed
    }

    /// Unexport `path` only while `entry` is still what is exported there.
    fn unexport_entry(&self, path: &ObjectPath, entry: &Weak<ExportedObject>) -> bool {
        let mut objects = self.objects.write();
        match objects.get(path) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), entry.as_ptr()) => {
                objects.remove(path);
                debug!(%path, "leased object unexported");
                true
            }
            Some(_) => {
                trace!(%path, "lease outlived its export, path left alone");
                false
            }
            None => false,
        }
    }

    pub(crate) fn add_fallback(
        &self,
        prefix: ObjectPath,
        object: Arc<dyn BusObject>,
    ) -> Result<(), BusError> {
        let exported = Arc::new(ExportedObject::new(object));
        let mut fallbacks = self.fallbacks.write();
        if fallbacks.contains_key(&prefix) {
            return Err(BusError::AlreadyExported(prefix.into_string()));
        }
        debug!(%prefix, "fallback added");
        fallbacks.insert(prefix, exported);
        Ok(())
    }

    pub(crate) fn remove_fallback(&self, prefix: &ObjectPath) -> bool {
        self.fallbacks.write().remove(prefix).is_some()
    }

    /// Exact export at `path`, else the fallback with the longest prefix.
    pub(crate) fn lookup(&self, path: &ObjectPath) -> Option<Arc<ExportedObject>> {
        if let Some(object) = self.objects.read().get(path) {
            return Some(Arc::clone(object));
        }
        let fallbacks = self.fallbacks.read();
        let mut current = Some(path.clone());
        while let Some(candidate) = current {
            if let Some(object) = fallbacks.get(&candidate) {
                return Some(Arc::clone(object));
            }
            current = candidate.parent();
        }
        None
    }

    /// Names of the immediate child nodes of `path`.
    pub(crate) fn children(&self, path: &ObjectPath) -> Vec<String> {
        let depth = path.segments().count();
        let mut names = BTreeSet::new();
        let objects = self.objects.read();
        let fallbacks = self.fallbacks.read();
        for exported in objects.keys().chain(fallbacks.keys()) {
            if exported != path && exported.has_prefix(path) {
                if let Some(name) = exported.segments().nth(depth) {
                    names.insert(name.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Introspection document for `path`, or `None` when nothing lives there.
    pub(crate) fn introspect(&self, path: &ObjectPath) -> Option<String> {
        let children = self.children(path);
        match self.lookup(path) {
            Some(object) => Some(node_xml(&object.interfaces_xml, &children)),
            None if !children.is_empty() => Some(node_xml(&standard_interfaces_xml(), &children)),
            None => None,
        }
    }
}

/// Keeps an object exported for as long as the lease lives.
#[derive(Debug)]
#[must_use = "dropping the lease unexports the object"]
pub struct ExportLease {
    registry: Weak<ObjectRegistry>,
    path: ObjectPath,
    entry: Weak<ExportedObject>,
}

impl ExportLease {
    pub(crate) fn new(
        registry: &Arc<ObjectRegistry>,
        path: ObjectPath,
        entry: Weak<ExportedObject>,
    ) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            path,
            entry,
        }
    }

    /// Path of the leased object.
    #[must_use]
    pub const fn path(&self) -> &ObjectPath {
        &self.path
    }
}

impl Drop for ExportLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unexport_entry(&self.path, &self.entry);
        }
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.objects.read().len())
            .field("fallbacks", &self.fallbacks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ferrobus_core::MethodError;

    use super::*;
    use crate::object::{InterfaceBuilder, MethodDescriptor, ObjectBuilder};

    fn path(text: &str) -> ObjectPath {
        ObjectPath::new(text).unwrap()
    }

    fn calculator() -> Arc<dyn BusObject> {
        ObjectBuilder::new()
            .interface(
                InterfaceBuilder::new("org.example.Calc")
                    .unwrap()
                    .typed_method("Add", |_ctx, (a, b): (i32, i32)| async move {
                        Ok::<_, MethodError>((a + b,))
                    })
                    .unwrap()
                    .method(
                        MethodDescriptor::new("Add")
                            .unwrap()
                            .arg("a", "d")
                            .unwrap()
                            .arg("b", "d")
                            .unwrap()
                            .arg("c", "d")
                            .unwrap(),
                        |_ctx, _args| async move { Ok(Vec::new()) },
                    ),
            )
            .build()
    }

    #[test]
    fn test_duplicate_export_is_rejected() {
        let registry = ObjectRegistry::default();
        registry.export(path("/calc"), calculator()).unwrap();
        assert!(matches!(
            registry.export(path("/calc"), calculator()),
            Err(BusError::AlreadyExported(_))
        ));
        assert!(registry.unexport(&path("/calc")));
        assert!(registry.export(path("/calc"), calculator()).is_ok());
    }

    #[test]
    fn test_fallback_longest_prefix() {
        let registry = ObjectRegistry::default();
        let shallow = calculator();
        let deep = calculator();
        registry.add_fallback(path("/a"), Arc::clone(&shallow)).unwrap();
        registry.add_fallback(path("/a/b"), Arc::clone(&deep)).unwrap();

        let found = registry.lookup(&path("/a/b/c/d")).unwrap();
        assert!(Arc::ptr_eq(&found.object, &deep));
        let found = registry.lookup(&path("/a/bc")).unwrap();
        assert!(Arc::ptr_eq(&found.object, &shallow));
        assert!(registry.lookup(&path("/z")).is_none());

        registry.export(path("/a/b/c"), calculator()).unwrap();
        let found = registry.lookup(&path("/a/b/c")).unwrap();
        assert!(!Arc::ptr_eq(&found.object, &deep));
    }

    #[test]
    fn test_resolution_by_signature_and_coercion() {
        let exported = ExportedObject::new(calculator());
        let ii = Signature::parse("ii").unwrap();
        let resolved = exported
            .resolve(
                Some("org.example.Calc"),
                "Add",
                &ii,
                vec![Value::Int32(1), Value::Int32(2)],
            )
            .unwrap();
        assert_eq!(resolved.interface, "org.example.Calc");

        let xx = Signature::parse("xx").unwrap();
        let resolved = exported
            .resolve(None, "Add", &xx, vec![Value::Int64(1), Value::Int64(2)])
            .unwrap_err();
        assert!(matches!(resolved, BusError::UnknownMethod(m) if m == "Failure in de-serializing message"));

        let error = exported
            .resolve(Some("org.example.Calc"), "Mul", &ii, Vec::new())
            .unwrap_err();
        assert!(matches!(
            error,
            BusError::UnknownMethod(m) if m == "The method `org.example.Calc.Mul' does not exist on this object."
        ));
    }

    #[test]
    fn test_introspection_of_inner_nodes() {
        let registry = ObjectRegistry::default();
        registry.export(path("/org/example/calc"), calculator()).unwrap();
        registry.export(path("/org/example/other"), calculator()).unwrap();

        assert_eq!(
            registry.children(&path("/org")),
            vec!["example".to_string()]
        );
        assert_eq!(
            registry.children(&path("/org/example")),
            vec!["calc".to_string(), "other".to_string()]
        );
        let inner = registry.introspect(&path("/org/example")).unwrap();
        assert!(inner.contains("<node name=\"calc\"/>"));
        assert!(!inner.contains("org.example.Calc"));
        let leaf = registry.introspect(&path("/org/example/calc")).unwrap();
        assert!(leaf.contains("<interface name=\"org.example.Calc\">"));
        assert!(registry.introspect(&path("/elsewhere")).is_none());
        assert!(registry.introspect(&path("/")).is_some());
    }

    #[test]
    fn test_lease_unexports_on_drop() {
        let registry = Arc::new(ObjectRegistry::default());
        let entry = registry.export_entry(path("/leased"), calculator()).unwrap();
        let lease = ExportLease::new(&registry, path("/leased"), entry);
        assert!(registry.lookup(&path("/leased")).is_some());
        drop(lease);
        assert!(registry.lookup(&path("/leased")).is_none());
    }

    #[test]
    fn test_stale_lease_leaves_new_export_alone() {
        let registry = Arc::new(ObjectRegistry::default());
        let entry = registry.export_entry(path("/leased"), calculator()).unwrap();
        let lease = ExportLease::new(&registry, path("/leased"), entry);
        assert!(registry.unexport(&path("/leased")));
        let replacement = calculator();
        registry.export(path("/leased"), Arc::clone(&replacement)).unwrap();
        drop(lease);
        let current = registry.lookup(&path("/leased")).expect("replacement still exported");
        assert!(Arc::ptr_eq(&current.object, &replacement));
    }
}
