//! Typed registration of remotely usable types.

use std::any::Any;
use std::marker::PhantomData;

use super::{Constructor, GetFn, Instance, Method, Property, SetFn, TypeEntry};
use crate::descriptor::TypeDescriptor;
use crate::error::{RemexError, Result};
use crate::value::{FromValue, IntoValue, RemoteType, Value};

/// Describes how the server may construct and drive values of `T`.
///
/// Members are registered with ordinary closures; argument conversion and
/// receiver downcasting are generated here.
///
/// ```
/// use remex_core::reflect::{TypeCatalog, TypeDef};
///
/// #[derive(Default)]
/// struct Greeter {
///     greeting: String,
/// }
///
/// let catalog = TypeCatalog::builder()
///     .register(
///         TypeDef::<Greeter>::new("Demo.Greeter, Demo")
///             .constructor1(|greeting: String| Ok(Greeter { greeting }))
///             .method1("Greet", |g: &mut Greeter, name: String| {
///                 Ok(format!("{}, {}!", g.greeting, name))
///             })
///             .property_mut(
///                 "Greeting",
///                 |g: &Greeter| g.greeting.clone(),
///                 |g: &mut Greeter, value: String| {
///                     g.greeting = value;
///                     Ok(())
///                 },
///             ),
///     )
///     .build();
/// assert_eq!(catalog.len(), 1);
/// ```
pub struct TypeDef<T> {
    entry: TypeEntry,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send> TypeDef<T> {
    pub fn new(descriptor: impl Into<TypeDescriptor>) -> Self {
        Self {
            entry: TypeEntry::new(descriptor.into()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_entry(self) -> TypeEntry {
        self.entry
    }

    /// Mark `T` as a value type, constructible from its default value.
    pub fn value_type(mut self) -> Self
    where
        T: Default,
    {
        self.entry.is_value_type = true;
        self.constructor0(|| Ok(T::default()))
    }

    pub fn constructor0<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.push_constructor(Vec::new(), move |_| f().map(boxed))
    }

    pub fn constructor1<A, F>(self, f: F) -> Self
    where
        A: RemoteType + FromValue,
        F: Fn(A) -> Result<T> + Send + Sync + 'static,
    {
        let member = self.ctor_name();
        self.push_constructor(vec![A::descriptor()], move |args| {
            let mut args = args.into_iter();
            let a = next_arg(&mut args, &member)?;
            f(a).map(boxed)
        })
    }

    pub fn constructor2<A, B, F>(self, f: F) -> Self
    where
        A: RemoteType + FromValue,
        B: RemoteType + FromValue,
        F: Fn(A, B) -> Result<T> + Send + Sync + 'static,
    {
        let member = self.ctor_name();
        self.push_constructor(vec![A::descriptor(), B::descriptor()], move |args| {
            let mut args = args.into_iter();
            let a = next_arg(&mut args, &member)?;
            let b = next_arg(&mut args, &member)?;
            f(a, b).map(boxed)
        })
    }

    pub fn method0<R, F>(self, name: &str, f: F) -> Self
    where
        R: IntoValue,
        F: Fn(&mut T) -> Result<R> + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.push_method(name, Vec::new(), false, move |target, _| {
            let this = receiver::<T>(target, &member)?;
            f(this).map(IntoValue::into_value)
        })
    }

    pub fn method1<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: RemoteType + FromValue,
        R: IntoValue,
        F: Fn(&mut T, A) -> Result<R> + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.push_method(name, vec![A::descriptor()], false, move |target, args| {
            let this = receiver::<T>(target, &member)?;
            let mut args = args.into_iter();
            let a = next_arg(&mut args, &member)?;
            f(this, a).map(IntoValue::into_value)
        })
    }

    pub fn method2<A, B, R, F>(self, name: &str, f: F) -> Self
    where
        A: RemoteType + FromValue,
        B: RemoteType + FromValue,
        R: IntoValue,
        F: Fn(&mut T, A, B) -> Result<R> + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.push_method(
            name,
            vec![A::descriptor(), B::descriptor()],
            false,
            move |target, args| {
                let this = receiver::<T>(target, &member)?;
                let mut args = args.into_iter();
                let a = next_arg(&mut args, &member)?;
                let b = next_arg(&mut args, &member)?;
                f(this, a, b).map(IntoValue::into_value)
            },
        )
    }

    pub fn static_method0<R, F>(self, name: &str, f: F) -> Self
    where
        R: IntoValue,
        F: Fn() -> Result<R> + Send + Sync + 'static,
    {
        self.push_method(name, Vec::new(), true, move |_, _| f().map(IntoValue::into_value))
    }

    pub fn static_method1<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: RemoteType + FromValue,
        R: IntoValue,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.push_method(name, vec![A::descriptor()], true, move |_, args| {
            let mut args = args.into_iter();
            let a = next_arg(&mut args, &member)?;
            f(a).map(IntoValue::into_value)
        })
    }

    pub fn static_method2<A, B, R, F>(self, name: &str, f: F) -> Self
    where
        A: RemoteType + FromValue,
        B: RemoteType + FromValue,
        R: IntoValue,
        F: Fn(A, B) -> Result<R> + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.push_method(
            name,
            vec![A::descriptor(), B::descriptor()],
            true,
            move |_, args| {
                let mut args = args.into_iter();
                let a = next_arg(&mut args, &member)?;
                let b = next_arg(&mut args, &member)?;
                f(a, b).map(IntoValue::into_value)
            },
        )
    }

    /// A read-only instance property.
    pub fn property<R, G>(mut self, name: &str, get: G) -> Self
    where
        R: RemoteType + IntoValue,
        G: Fn(&T) -> R + Send + Sync + 'static,
    {
        let member = name.to_string();
        self.entry.properties.push(Property {
            name: name.to_string(),
            ty: R::descriptor(),
            is_static: false,
            get: getter(move |target| {
                let this = receiver::<T>(target, &member)?;
                Ok(get(this).into_value())
            }),
            set: None,
        });
        self
    }

    /// A read-write instance property.
    pub fn property_mut<R, G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        R: RemoteType + IntoValue + FromValue,
        G: Fn(&T) -> R + Send + Sync + 'static,
        S: Fn(&mut T, R) -> Result<()> + Send + Sync + 'static,
    {
        let get_member = name.to_string();
        let set_member = name.to_string();
        self.entry.properties.push(Property {
            name: name.to_string(),
            ty: R::descriptor(),
            is_static: false,
            get: getter(move |target| {
                let this = receiver::<T>(target, &get_member)?;
                Ok(get(this).into_value())
            }),
            set: Some(setter(move |target, value| {
                let this = receiver::<T>(target, &set_member)?;
                let value = convert_arg(value, &set_member)?;
                set(this, value)
            })),
        });
        self
    }

    /// A read-only static property.
    pub fn static_property<R, G>(mut self, name: &str, get: G) -> Self
    where
        R: RemoteType + IntoValue,
        G: Fn() -> R + Send + Sync + 'static,
    {
        self.entry.properties.push(Property {
            name: name.to_string(),
            ty: R::descriptor(),
            is_static: true,
            get: getter(move |_| Ok(get().into_value())),
            set: None,
        });
        self
    }

    fn ctor_name(&self) -> String {
        format!("{}..ctor", self.entry.descriptor.full_name())
    }

    fn push_constructor(
        mut self,
        params: Vec<TypeDescriptor>,
        call: impl Fn(Vec<Value>) -> Result<Instance> + Send + Sync + 'static,
    ) -> Self {
        self.entry.constructors.push(Constructor {
            params,
            call: Box::new(call),
        });
        self
    }

    fn push_method(
        mut self,
        name: &str,
        params: Vec<TypeDescriptor>,
        is_static: bool,
        call: impl Fn(Option<&mut (dyn Any + Send)>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.entry.methods.push(Method {
            name: name.to_string(),
            params,
            is_static,
            call: Box::new(call),
        });
        self
    }
}

fn getter(
    f: impl Fn(Option<&mut (dyn Any + Send)>) -> Result<Value> + Send + Sync + 'static,
) -> GetFn {
    Box::new(f)
}

fn setter(
    f: impl Fn(Option<&mut (dyn Any + Send)>, Value) -> Result<()> + Send + Sync + 'static,
) -> SetFn {
    Box::new(f)
}

fn boxed<T: Any + Send>(value: T) -> Instance {
    Box::new(value)
}

fn receiver<'a, T: Any>(target: Option<&'a mut (dyn Any + Send)>, member: &str) -> Result<&'a mut T> {
    let target = target.ok_or_else(|| RemexError::invocation(member, "instance member called without a target"))?;
    target.downcast_mut::<T>().ok_or_else(|| {
        RemexError::invocation(
            member,
            format!("target is not a {}", std::any::type_name::<T>()),
        )
    })
}

fn next_arg<A: FromValue>(args: &mut std::vec::IntoIter<Value>, member: &str) -> Result<A> {
    let value = args
        .next()
        .ok_or_else(|| RemexError::invocation(member, "too few arguments"))?;
    convert_arg(value, member)
}

fn convert_arg<A: FromValue>(value: Value, member: &str) -> Result<A> {
    let descriptor = value.descriptor();
    A::from_value(value).map_err(|e| match e {
        RemexError::EmptyResponse => RemexError::invocation(member, "null argument"),
        coercion @ RemexError::Coercion { .. } => coercion,
        other => RemexError::coercion(descriptor, other.to_string()),
    })
}
