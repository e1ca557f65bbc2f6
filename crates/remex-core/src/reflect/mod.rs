//! Registration-based reflection.
//!
//! Remote commands name types and members as strings. Instead of looking them
//! up in the ambient runtime, every remotely usable type is registered up
//! front in a `TypeCatalog`; anything not registered cannot be constructed or
//! invoked from the wire.
//!
//! Build a catalog with `TypeCatalog::builder()`, add the built-in vocabulary
//! with `with_prelude()`, and describe your own types with `TypeDef`.

mod prelude;
mod typedef;

pub use typedef::TypeDef;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::descriptor::{names, TypeDescriptor};
use crate::error::{RemexError, Result};
use crate::value::Value;

/// A server-resident object.
pub type Instance = Box<dyn Any + Send>;

pub(crate) type ConstructFn = Box<dyn Fn(Vec<Value>) -> Result<Instance> + Send + Sync>;
pub(crate) type InvokeFn =
    Box<dyn Fn(Option<&mut (dyn Any + Send)>, Vec<Value>) -> Result<Value> + Send + Sync>;
pub(crate) type GetFn = Box<dyn Fn(Option<&mut (dyn Any + Send)>) -> Result<Value> + Send + Sync>;
pub(crate) type SetFn = Box<dyn Fn(Option<&mut (dyn Any + Send)>, Value) -> Result<()> + Send + Sync>;

/// The lookup capability the dispatcher works against.
pub trait Reflection: Send + Sync {
    /// Resolve a type by its descriptor.
    fn resolve_type(&self, descriptor: &TypeDescriptor) -> Result<Arc<TypeEntry>>;
}

/// Whether a member lookup happens on a type or on an instance of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberScope {
    /// Only static members.
    Static,
    /// Instance members, falling back to statics of the same name.
    Instance,
}

/// A registered constructor.
pub struct Constructor {
    pub(crate) params: Vec<TypeDescriptor>,
    pub(crate) call: ConstructFn,
}

impl Constructor {
    pub fn params(&self) -> &[TypeDescriptor] {
        &self.params
    }

    /// Run the constructor; panics surface as construction faults.
    pub fn construct(&self, type_name: &str, args: Vec<Value>) -> Result<Instance> {
        guarded(type_name, || (self.call)(args)).map_err(|e| match e {
            RemexError::Invocation { message, .. } => RemexError::Construction {
                type_name: type_name.to_string(),
                message,
            },
            other => other,
        })
    }
}

/// A registered method.
pub struct Method {
    pub(crate) name: String,
    pub(crate) params: Vec<TypeDescriptor>,
    pub(crate) is_static: bool,
    pub(crate) call: InvokeFn,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("is_static", &self.is_static)
            .finish()
    }
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[TypeDescriptor] {
        &self.params
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Invoke the method. Instance methods need `target`; statics ignore it.
    pub fn invoke(&self, target: Option<&mut (dyn Any + Send)>, args: Vec<Value>) -> Result<Value> {
        let target = if self.is_static { None } else { target };
        guarded(&self.name, || (self.call)(target, args))
    }
}

/// A registered property.
pub struct Property {
    pub(crate) name: String,
    pub(crate) ty: TypeDescriptor,
    pub(crate) is_static: bool,
    pub(crate) get: GetFn,
    pub(crate) set: Option<SetFn>,
}

impl Property {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type, used to coerce assigned values.
    pub fn ty(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }

    pub fn get_value(&self, target: Option<&mut (dyn Any + Send)>) -> Result<Value> {
        let target = if self.is_static { None } else { target };
        guarded(&self.name, || (self.get)(target))
    }

    pub fn set_value(&self, target: Option<&mut (dyn Any + Send)>, value: Value) -> Result<()> {
        let set = self
            .set
            .as_ref()
            .ok_or_else(|| RemexError::invocation(&self.name, "property is read-only"))?;
        let target = if self.is_static { None } else { target };
        guarded(&self.name, || set(target, value))
    }
}

/// Everything the catalog knows about one type.
pub struct TypeEntry {
    pub(crate) descriptor: TypeDescriptor,
    pub(crate) is_value_type: bool,
    pub(crate) constructors: Vec<Constructor>,
    pub(crate) methods: Vec<Method>,
    pub(crate) properties: Vec<Property>,
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("descriptor", &self.descriptor)
            .field("is_value_type", &self.is_value_type)
            .field("constructors", &self.constructors.len())
            .field("methods", &self.methods.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl TypeEntry {
    pub(crate) fn new(descriptor: TypeDescriptor) -> Self {
        Self {
            descriptor,
            is_value_type: false,
            constructors: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn is_value_type(&self) -> bool {
        self.is_value_type
    }

    /// Whether the type can be constructed without arguments.
    pub fn has_parameterless_constructor(&self) -> bool {
        self.constructors.iter().any(|c| c.params.is_empty())
    }

    pub fn resolve_constructor(&self, arg_types: &[TypeDescriptor]) -> Result<&Constructor> {
        select_overload(self.constructors.iter(), |c| c.params.as_slice(), arg_types)
            .ok_or_else(|| self.not_found(".ctor", arg_types))
    }

    pub fn resolve_method(
        &self,
        name: &str,
        arg_types: &[TypeDescriptor],
        scope: MemberScope,
    ) -> Result<&Method> {
        let candidates = self
            .methods
            .iter()
            .filter(|m| m.name == name && (scope == MemberScope::Instance || m.is_static));
        select_overload(candidates, |m| m.params.as_slice(), arg_types)
            .ok_or_else(|| self.not_found(name, arg_types))
    }

    pub fn resolve_property(&self, name: &str, scope: MemberScope) -> Result<&Property> {
        self.properties
            .iter()
            .find(|p| p.name == name && (scope == MemberScope::Instance || p.is_static))
            .ok_or_else(|| self.not_found(name, &[]))
    }

    fn not_found(&self, member: &str, arg_types: &[TypeDescriptor]) -> RemexError {
        RemexError::MemberNotFound {
            type_name: self.descriptor.to_string(),
            member: member.to_string(),
            signature: arg_types
                .iter()
                .map(TypeDescriptor::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Pick the overload for `arg_types`.
///
/// An exact signature wins; otherwise the first overload whose parameters
/// accept the arguments (`System.Object` accepts anything, and a null argument
/// fits any parameter); otherwise the only overload of matching arity.
fn select_overload<'a, M>(
    candidates: impl Iterator<Item = &'a M> + Clone,
    params: impl Fn(&M) -> &[TypeDescriptor],
    arg_types: &[TypeDescriptor],
) -> Option<&'a M> {
    if let Some(exact) = candidates.clone().find(|m| params(m) == arg_types) {
        return Some(exact);
    }

    let same_arity: Vec<&M> = candidates.filter(|m| params(m).len() == arg_types.len()).collect();
    let compatible = same_arity.iter().copied().find(|m| {
        params(m)
            .iter()
            .zip(arg_types)
            .all(|(param, arg)| param == arg || param.as_str() == names::OBJECT || arg.as_str() == names::OBJECT)
    });
    match compatible {
        Some(m) => Some(m),
        None if same_arity.len() == 1 => Some(same_arity[0]),
        None => None,
    }
}

/// Run member code, turning a panic into an invocation fault.
fn guarded<T>(member: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "member panicked".to_string());
        Err(RemexError::invocation(member, message))
    })
}

/// Immutable table of every remotely usable type.
pub struct TypeCatalog {
    types: HashMap<TypeDescriptor, Arc<TypeEntry>>,
    /// Bare full names; `None` marks a name shared by several modules.
    by_full_name: HashMap<String, Option<Arc<TypeEntry>>>,
}

impl TypeCatalog {
    pub fn builder() -> TypeCatalogBuilder {
        TypeCatalogBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn contains(&self, descriptor: &TypeDescriptor) -> bool {
        self.resolve_type(descriptor).is_ok()
    }
}

impl Reflection for TypeCatalog {
    fn resolve_type(&self, descriptor: &TypeDescriptor) -> Result<Arc<TypeEntry>> {
        if let Some(entry) = self.types.get(descriptor) {
            return Ok(Arc::clone(entry));
        }
        match self.by_full_name.get(descriptor.full_name()) {
            Some(Some(entry)) => Ok(Arc::clone(entry)),
            _ => Err(RemexError::TypeResolution {
                descriptor: descriptor.to_string(),
            }),
        }
    }
}

/// Builder for `TypeCatalog`.
#[derive(Default)]
pub struct TypeCatalogBuilder {
    entries: Vec<TypeEntry>,
}

impl TypeCatalogBuilder {
    /// Register the built-in vocabulary (primitives, strings, lists, math).
    pub fn with_prelude(mut self) -> Self {
        self.entries.extend(prelude::entries());
        self
    }

    /// Register one type. A later registration of the same descriptor
    /// replaces an earlier one.
    pub fn register<T: Any + Send>(mut self, def: TypeDef<T>) -> Self {
        self.entries.push(def.into_entry());
        self
    }

    pub fn build(self) -> TypeCatalog {
        let mut types = HashMap::new();
        for entry in self.entries {
            if types.contains_key(&entry.descriptor) {
                warn!("Type {} registered twice; keeping the later definition", entry.descriptor);
            }
            types.insert(entry.descriptor.clone(), Arc::new(entry));
        }

        let mut by_full_name: HashMap<String, Option<Arc<TypeEntry>>> = HashMap::new();
        for entry in types.values() {
            by_full_name
                .entry(entry.descriptor.full_name().to_string())
                .and_modify(|slot| *slot = None)
                .or_insert_with(|| Some(Arc::clone(entry)));
        }

        TypeCatalog { types, by_full_name }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_args;

    #[derive(Default)]
    struct Counter {
        count: i32,
    }

    fn catalog() -> TypeCatalog {
        TypeCatalog::builder()
            .with_prelude()
            .register(
                TypeDef::<Counter>::new("Tests.Counter, Tests")
                    .constructor0(|| Ok(Counter::default()))
                    .constructor1(|start: i32| Ok(Counter { count: start }))
                    .method0("Increment", |c: &mut Counter| {
                        c.count += 1;
                        Ok(c.count)
                    })
                    .method1("Add", |c: &mut Counter, n: i32| {
                        c.count += n;
                        Ok(())
                    })
                    .method1("Add", |c: &mut Counter, n: i64| {
                        c.count += n as i32 * 2;
                        Ok(())
                    })
                    .method0("Explode", |_: &mut Counter| -> Result<()> { panic!("boom") })
                    .property("Count", |c: &Counter| c.count)
                    .static_method0("Zero", || Ok(0)),
            )
            .build()
    }

    fn ty(s: &str) -> TypeDescriptor {
        TypeDescriptor::new(s)
    }

    #[test]
    fn test_resolve_by_descriptor_and_bare_name() {
        let catalog = catalog();
        assert!(catalog.resolve_type(&ty("Tests.Counter, Tests")).is_ok());
        assert!(catalog.resolve_type(&ty("Tests.Counter")).is_ok());
        assert!(catalog
            .resolve_type(&ty("Tests.Counter, Tests, Version=2.0.0.0"))
            .is_ok());
        assert!(matches!(
            catalog.resolve_type(&ty("Tests.Missing")),
            Err(RemexError::TypeResolution { .. })
        ));
    }

    #[test]
    fn test_ambiguous_bare_names_do_not_resolve() {
        let catalog = TypeCatalog::builder()
            .register(TypeDef::<Counter>::new("Dup.Thing, A"))
            .register(TypeDef::<Counter>::new("Dup.Thing, B"))
            .build();
        assert!(catalog.resolve_type(&ty("Dup.Thing, A")).is_ok());
        assert!(catalog.resolve_type(&ty("Dup.Thing")).is_err());
    }

    #[test]
    fn test_overloads_resolve_by_signature() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter, Tests")).unwrap();
        let mut instance: Instance = Box::new(Counter::default());

        let add64 = entry
            .resolve_method("Add", &[ty(names::INT64)], MemberScope::Instance)
            .unwrap();
        add64.invoke(Some(instance.as_mut()), remote_args![5i64]).unwrap();

        let add32 = entry
            .resolve_method("Add", &[ty(names::INT32)], MemberScope::Instance)
            .unwrap();
        add32.invoke(Some(instance.as_mut()), remote_args![1]).unwrap();

        let count = entry.resolve_property("Count", MemberScope::Instance).unwrap();
        assert_eq!(count.get_value(Some(instance.as_mut())).unwrap(), Value::I32(11));
        assert!(!count.is_writable());
    }

    #[test]
    fn test_static_scope_hides_instance_members() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter")).unwrap();

        assert!(entry.resolve_method("Zero", &[], MemberScope::Static).is_ok());
        assert!(entry.resolve_method("Zero", &[], MemberScope::Instance).is_ok());
        assert!(matches!(
            entry.resolve_method("Increment", &[], MemberScope::Static),
            Err(RemexError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_member_reports_signature() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter")).unwrap();
        let err = entry
            .resolve_method("Add", &[ty(names::STRING), ty(names::STRING)], MemberScope::Instance)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Member Add(System.String, System.String) not found on Tests.Counter, Tests"
        );
    }

    #[test]
    fn test_panics_become_invocation_faults() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter")).unwrap();
        let mut instance: Instance = Box::new(Counter::default());
        let explode = entry.resolve_method("Explode", &[], MemberScope::Instance).unwrap();

        let err = explode.invoke(Some(instance.as_mut()), vec![]).unwrap_err();
        match err {
            RemexError::Invocation { member, message } => {
                assert_eq!(member, "Explode");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_constructor_selection() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter")).unwrap();
        assert!(entry.has_parameterless_constructor());
        assert!(!entry.is_value_type());

        let ctor = entry.resolve_constructor(&[ty(names::INT32)]).unwrap();
        let mut instance = ctor.construct("Tests.Counter", remote_args![7]).unwrap();
        let count = entry.resolve_property("Count", MemberScope::Instance).unwrap();
        assert_eq!(count.get_value(Some(instance.as_mut())).unwrap(), Value::I32(7));
    }

    #[test]
    fn test_object_and_null_arguments_are_compatible() {
        let catalog = catalog();
        let entry = catalog.resolve_type(&ty("Tests.Counter")).unwrap();
        // A single-arity constructor accepts a differently typed argument for coercion.
        assert!(entry.resolve_constructor(&[ty(names::INT16)]).is_ok());
        // Two overloads of Add: a null argument picks the first compatible one.
        let add = entry
            .resolve_method("Add", &[ty(names::OBJECT)], MemberScope::Instance)
            .unwrap();
        assert_eq!(add.params(), &[ty(names::INT32)]);
    }
}
