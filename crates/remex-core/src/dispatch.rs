//! Command dispatcher.
//!
//! Interprets a decoded `CommandEnvelope` against the object registry and the
//! type catalog. Faults never leave the dispatcher: they are logged and the
//! command is answered with an empty response, leaving the connection usable.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::coerce::Coercion;
use crate::descriptor::{names, TypeDescriptor};
use crate::error::{RemexError, Result};
use crate::handle::ObjectHandle;
use crate::ipc::protocol::{CommandEnvelope, CommandKind};
use crate::ipc::server::{CommandDispatch, DispatchOutcome};
use crate::reflect::{MemberScope, Reflection, TypeCatalog, TypeEntry};
use crate::registry::{ObjectRegistry, RegisteredObject, ReleaseOutcome};
use crate::value::{IntoValue, Value};

/// Where an instance or static command is aimed.
enum Target {
    Type(Arc<TypeEntry>),
    Object(RegisteredObject),
}

impl Target {
    fn entry(&self) -> &TypeEntry {
        match self {
            Target::Type(entry) => entry,
            Target::Object(object) => object.type_entry(),
        }
    }

    fn scope(&self) -> MemberScope {
        match self {
            Target::Type(_) => MemberScope::Static,
            Target::Object(_) => MemberScope::Instance,
        }
    }
}

/// Executes commands for one server.
#[derive(Clone)]
pub struct Dispatcher {
    reflection: Arc<dyn Reflection>,
    registry: Arc<ObjectRegistry>,
}

impl Dispatcher {
    pub fn new(reflection: Arc<dyn Reflection>) -> Self {
        Self::with_registry(reflection, Arc::new(ObjectRegistry::new()))
    }

    pub fn with_registry(reflection: Arc<dyn Reflection>, registry: Arc<ObjectRegistry>) -> Self {
        Self {
            reflection,
            registry,
        }
    }

    /// A dispatcher over `catalog` with a fresh registry.
    pub fn from_catalog(catalog: TypeCatalog) -> Self {
        Self::new(Arc::new(catalog))
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Run one command, returning its fault instead of logging it.
    pub fn execute(&self, envelope: CommandEnvelope) -> Result<DispatchOutcome> {
        match envelope.kind {
            CommandKind::NewObject => self.new_object(envelope),
            CommandKind::RetrieveObject => self.retrieve_object(envelope.target_handle),
            CommandKind::Invoke => self.invoke(envelope),
            CommandKind::GetProperty => self.get_property(envelope),
            CommandKind::SetProperty => self.set_property(envelope),
            CommandKind::CloseConnection => Ok(self.close_connection(envelope.target_handle)),
        }
    }

    fn new_object(&self, envelope: CommandEnvelope) -> Result<DispatchOutcome> {
        let descriptor = envelope.target_type.ok_or_else(|| RemexError::Protocol {
            message: "NewObject requires a target type".to_string(),
        })?;
        let entry = self.reflection.resolve_type(&descriptor)?;

        if envelope.parameters.is_empty()
            && !entry.is_value_type()
            && !entry.has_parameterless_constructor()
        {
            warn!("{} has no parameterless constructor", descriptor);
            return Ok(DispatchOutcome::empty());
        }

        let ctor = entry.resolve_constructor(&envelope.parameter_types)?;
        let args = self.coerce_args(ctor.params(), envelope.parameters, &envelope.parameter_types)?;

        let response = match self.registry.create(&entry, ctor, args) {
            Some(handle) => {
                debug!("Created {} as {}", descriptor, handle);
                handle.into_value()
            }
            None => Value::Null,
        };
        Ok(DispatchOutcome::respond(response))
    }

    fn retrieve_object(&self, handle: ObjectHandle) -> Result<DispatchOutcome> {
        let descriptor = self
            .registry
            .retain(handle)
            .ok_or(RemexError::ObjectNotFound(handle))?;
        Ok(DispatchOutcome::respond(Value::Type(descriptor)))
    }

    fn invoke(&self, envelope: CommandEnvelope) -> Result<DispatchOutcome> {
        let name = member_name(&envelope)?.to_string();
        let target = self.target(&envelope)?;
        let method = target
            .entry()
            .resolve_method(&name, &envelope.parameter_types, target.scope())?;
        let args = self.coerce_args(method.params(), envelope.parameters, &envelope.parameter_types)?;

        let result = match &target {
            Target::Type(_) => method.invoke(None, args)?,
            Target::Object(object) => {
                object.with_instance(|instance| method.invoke(Some(instance), args))?
            }
        };
        Ok(DispatchOutcome::respond(result))
    }

    fn get_property(&self, envelope: CommandEnvelope) -> Result<DispatchOutcome> {
        let name = member_name(&envelope)?;
        let target = self.target(&envelope)?;
        let property = target.entry().resolve_property(name, target.scope())?;

        let value = match &target {
            Target::Type(_) => property.get_value(None)?,
            Target::Object(object) => object.with_instance(|instance| property.get_value(Some(instance)))?,
        };
        Ok(DispatchOutcome::respond(value))
    }

    fn set_property(&self, envelope: CommandEnvelope) -> Result<DispatchOutcome> {
        let name = member_name(&envelope)?.to_string();
        let target = self.target(&envelope)?;
        let property = target.entry().resolve_property(&name, target.scope())?;

        let raw = match <[serde_json::Value; 1]>::try_from(envelope.parameters) {
            Ok([raw]) => raw,
            Err(parameters) => {
                return Err(RemexError::Protocol {
                    message: format!("SetProperty takes one parameter, got {}", parameters.len()),
                })
            }
        };
        let value = Coercion::with_reflection(&*self.reflection).coerce(raw, property.ty())?;

        match &target {
            Target::Type(_) => property.set_value(None, value)?,
            Target::Object(object) => {
                object.with_instance(|instance| property.set_value(Some(instance), value))?
            }
        }
        Ok(DispatchOutcome::empty())
    }

    fn close_connection(&self, handle: ObjectHandle) -> DispatchOutcome {
        match self.registry.release(handle) {
            ReleaseOutcome::Removed => debug!("Object {} released", handle),
            ReleaseOutcome::Decremented(remaining) => {
                debug!("Object {} still has {} reference(s)", handle, remaining)
            }
            ReleaseOutcome::Missing if handle.is_sentinel() => {}
            ReleaseOutcome::Missing => debug!("Close for unknown object {}", handle),
        }
        DispatchOutcome::close()
    }

    /// Static commands target their type; the rest target a live object.
    fn target(&self, envelope: &CommandEnvelope) -> Result<Target> {
        match &envelope.target_type {
            Some(descriptor) => Ok(Target::Type(self.reflection.resolve_type(descriptor)?)),
            None => self
                .registry
                .get(envelope.target_handle)
                .map(Target::Object)
                .ok_or(RemexError::ObjectNotFound(envelope.target_handle)),
        }
    }

    /// Coerce raw parameters for a resolved member.
    ///
    /// Each value converts to the member's declared parameter type; a
    /// `System.Object` parameter keeps the type the client declared.
    fn coerce_args(
        &self,
        params: &[TypeDescriptor],
        raw: Vec<serde_json::Value>,
        declared: &[TypeDescriptor],
    ) -> Result<Vec<Value>> {
        let coercion = Coercion::with_reflection(&*self.reflection);
        raw.into_iter()
            .zip(params.iter().zip(declared))
            .map(|(raw, (param, declared))| {
                let target = if param.as_str() == names::OBJECT { declared } else { param };
                coercion.coerce(raw, target)
            })
            .collect()
    }
}

fn member_name(envelope: &CommandEnvelope) -> Result<&str> {
    envelope
        .member_name
        .as_deref()
        .ok_or_else(|| RemexError::Protocol {
            message: format!("{:?} requires a member name", envelope.kind),
        })
}

/// Member code is synchronous, so commands run on the blocking pool and a
/// slow member never holds up the async workers serving other connections.
#[async_trait::async_trait]
impl CommandDispatch for Dispatcher {
    async fn dispatch(&self, envelope: CommandEnvelope) -> DispatchOutcome {
        let kind = envelope.kind;
        let member = envelope.member_name.clone().unwrap_or_default();
        let dispatcher = self.clone();

        match tokio::task::spawn_blocking(move || dispatcher.execute(envelope)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("{:?} {} failed: {}", kind, member, e);
                DispatchOutcome::empty()
            }
            Err(e) => {
                error!("{:?} {} task failed: {}", kind, member, e);
                DispatchOutcome::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeDef;
    use crate::remote_args;

    struct Thermostat {
        target: f64,
    }

    struct Tagged(&'static str);

    fn dispatcher() -> Dispatcher {
        let catalog = TypeCatalog::builder()
            .with_prelude()
            .register(
                TypeDef::<Thermostat>::new("Home.Thermostat, Home")
                    .constructor1(|target: f64| Ok(Thermostat { target }))
                    .property_mut(
                        "Target",
                        |t: &Thermostat| t.target,
                        |t: &mut Thermostat, value: f64| {
                            if value.is_nan() {
                                return Err(RemexError::invocation("Target", "NaN"));
                            }
                            t.target = value;
                            Ok(())
                        },
                    )
                    .method1("Describe", |t: &mut Thermostat, label: Value| {
                        Ok(format!("{:?}@{}", label, t.target))
                    }),
            )
            .register(
                TypeDef::<Tagged>::new("Home.Tagged, Home")
                    .constructor1(|_: Value| Ok(Tagged("object")))
                    .constructor1(|_: i32| Ok(Tagged("int")))
                    .property("Kind", |t: &Tagged| t.0.to_string()),
            )
            .build();
        Dispatcher::from_catalog(catalog)
    }

    fn int_list() -> TypeDescriptor {
        TypeDescriptor::list_of(&TypeDescriptor::new(names::INT32))
    }

    fn create(dispatcher: &Dispatcher, ty: TypeDescriptor, args: Vec<Value>) -> ObjectHandle {
        let outcome = dispatcher
            .execute(CommandEnvelope::new_object(ty, args))
            .unwrap();
        match outcome.response {
            Value::Guid(id) => ObjectHandle::from_uuid(id),
            other => panic!("expected a handle, got {:?}", other),
        }
    }

    #[test]
    fn test_list_scenario() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, int_list(), remote_args![5]);

        for n in [3, 5] {
            let outcome = dispatcher
                .execute(CommandEnvelope::invoke(handle, "Add", remote_args![n]))
                .unwrap();
            assert_eq!(outcome.response, Value::Null);
        }
        let index = dispatcher
            .execute(CommandEnvelope::invoke(handle, "IndexOf", remote_args![5]))
            .unwrap();
        assert_eq!(index.response, Value::I32(1));
        let count = dispatcher
            .execute(CommandEnvelope::get_property(handle, "Count"))
            .unwrap();
        assert_eq!(count.response, Value::I32(2));
    }

    #[test]
    fn test_arguments_coerce_to_declared_parameter_types() {
        let dispatcher = dispatcher();
        // A JSON integer with an Int32 tag still reaches an f64 constructor.
        let handle = create(
            &dispatcher,
            TypeDescriptor::new("Home.Thermostat"),
            remote_args![21],
        );
        let target = dispatcher
            .execute(CommandEnvelope::get_property(handle, "Target"))
            .unwrap();
        assert_eq!(target.response, Value::F64(21.0));

        let set = CommandEnvelope::set_property(handle, "Target", Value::I64(19));
        assert_eq!(dispatcher.execute(set).unwrap(), DispatchOutcome::empty());
        let target = dispatcher
            .execute(CommandEnvelope::get_property(handle, "Target"))
            .unwrap();
        assert_eq!(target.response, Value::F64(19.0));
    }

    #[test]
    fn test_object_parameters_keep_declared_type() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, TypeDescriptor::new("Home.Thermostat"), remote_args![1.5]);
        let described = dispatcher
            .execute(CommandEnvelope::invoke(handle, "Describe", remote_args![7u8]))
            .unwrap();
        assert_eq!(described.response, Value::String("U8(7)@1.5".into()));
    }

    #[test]
    fn test_value_type_without_arguments() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, TypeDescriptor::new(names::INT64), vec![]);
        let text = dispatcher
            .execute(CommandEnvelope::invoke(handle, "ToString", vec![]))
            .unwrap();
        assert_eq!(text.response, Value::String("0".into()));
    }

    #[test]
    fn test_static_members() {
        let dispatcher = dispatcher();
        let max = dispatcher
            .execute(CommandEnvelope::invoke_static(
                TypeDescriptor::new(names::MATH),
                "Max",
                remote_args![4, 11],
            ))
            .unwrap();
        assert_eq!(max.response, Value::I32(11));

        let now = dispatcher
            .execute(CommandEnvelope::get_static_property(
                TypeDescriptor::new(names::DATE_TIME),
                "UtcNow",
            ))
            .unwrap();
        assert!(matches!(now.response, Value::DateTime(_)));
    }

    #[tokio::test]
    async fn test_faults_become_empty_responses() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, int_list(), vec![]);

        let faulty = [
            CommandEnvelope::new_object(TypeDescriptor::new("Nope.Missing"), vec![]),
            CommandEnvelope::invoke(handle, "Frobnicate", vec![]),
            CommandEnvelope::invoke(ObjectHandle::generate(), "Add", remote_args![1]),
            CommandEnvelope::invoke(handle, "RemoveAt", remote_args![10]),
            CommandEnvelope::invoke(handle, "Add", remote_args!["not a number"]),
            CommandEnvelope::new(CommandKind::Invoke).with_target(handle),
            CommandEnvelope::set_property(handle, "Count", Value::I32(3)),
        ];
        for envelope in faulty {
            let outcome = dispatcher.dispatch(envelope).await;
            assert_eq!(outcome, DispatchOutcome::empty());
        }
    }

    #[test]
    fn test_failed_construction_yields_no_handle() {
        let dispatcher = dispatcher();
        let outcome = dispatcher
            .execute(CommandEnvelope::new_object(int_list(), remote_args![-1]))
            .unwrap();
        assert_eq!(outcome.response, Value::Null);
        assert!(dispatcher.registry().is_empty());

        // No parameterless constructor.
        let outcome = dispatcher
            .execute(CommandEnvelope::new_object(TypeDescriptor::new("Home.Thermostat"), vec![]))
            .unwrap();
        assert_eq!(outcome.response, Value::Null);
    }

    #[test]
    fn test_construction_uses_constructor_chosen_from_declared_types() {
        let dispatcher = dispatcher();
        // Declared as System.Object; the coerced value is an Int32.
        let mut envelope =
            CommandEnvelope::new_object(TypeDescriptor::new("Home.Tagged"), remote_args![5]);
        envelope.parameter_types = vec![TypeDescriptor::new(names::OBJECT)];
        let handle = match dispatcher.execute(envelope).unwrap().response {
            Value::Guid(id) => ObjectHandle::from_uuid(id),
            other => panic!("expected a handle, got {:?}", other),
        };

        let kind = dispatcher
            .execute(CommandEnvelope::get_property(handle, "Kind"))
            .unwrap();
        assert_eq!(kind.response, Value::String("object".into()));

        let handle = create(&dispatcher, TypeDescriptor::new("Home.Tagged"), remote_args![5]);
        let kind = dispatcher
            .execute(CommandEnvelope::get_property(handle, "Kind"))
            .unwrap();
        assert_eq!(kind.response, Value::String("int".into()));
    }

    #[test]
    fn test_retrieve_and_close_reference_counting() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, int_list(), vec![]);

        let retrieved = dispatcher
            .execute(CommandEnvelope::retrieve_object(handle))
            .unwrap();
        assert_eq!(retrieved.response, Value::Type(int_list()));
        assert_eq!(dispatcher.registry().ref_count(handle), Some(2));

        let close = dispatcher
            .execute(CommandEnvelope::close_connection(handle))
            .unwrap();
        assert!(close.close_connection);
        assert!(dispatcher.registry().contains(handle));

        dispatcher.execute(CommandEnvelope::close_connection(handle)).unwrap();
        assert!(!dispatcher.registry().contains(handle));

        // Closing again is a no-op.
        let again = dispatcher.execute(CommandEnvelope::close_connection(handle)).unwrap();
        assert_eq!(again, DispatchOutcome::close());

        assert!(dispatcher.execute(CommandEnvelope::retrieve_object(handle)).is_err());
    }

    #[test]
    fn test_set_property_requires_single_parameter() {
        let dispatcher = dispatcher();
        let handle = create(&dispatcher, TypeDescriptor::new("Home.Thermostat"), remote_args![1.0]);
        let envelope = CommandEnvelope::new(CommandKind::SetProperty)
            .with_target(handle)
            .with_member("Target")
            .with_arguments(remote_args![1.0, 2.0]);
        assert!(matches!(
            dispatcher.execute(envelope),
            Err(RemexError::Protocol { .. })
        ));
    }
}
