//! Value coercion.
//!
//! Turns a deserialized argument (a `serde_json::Value`) into a `Value` of the
//! declared parameter type. The JSON layer only knows numbers, strings,
//! arrays, and maps; the descriptor says which of the richer types was meant.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::descriptor::{names, TypeDescriptor};
use crate::error::{RemexError, Result};
use crate::reflect::Reflection;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    Object,
    Bool,
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    String,
    Guid,
    DateTime,
    Type,
}

impl Primitive {
    fn of(descriptor: &TypeDescriptor) -> Option<Self> {
        Some(match descriptor.as_str() {
            names::OBJECT => Primitive::Object,
            names::BOOLEAN => Primitive::Bool,
            names::BYTE => Primitive::U8,
            names::SBYTE => Primitive::I8,
            names::INT16 => Primitive::I16,
            names::UINT16 => Primitive::U16,
            names::INT32 => Primitive::I32,
            names::UINT32 => Primitive::U32,
            names::INT64 => Primitive::I64,
            names::UINT64 => Primitive::U64,
            names::SINGLE => Primitive::F32,
            names::DOUBLE => Primitive::F64,
            names::CHAR => Primitive::Char,
            names::STRING => Primitive::String,
            names::GUID => Primitive::Guid,
            names::DATE_TIME => Primitive::DateTime,
            names::TYPE => Primitive::Type,
            _ => return None,
        })
    }
}

/// Coerces serializer-form values into typed `Value`s.
///
/// With a `Reflection` attached, `System.Type` arguments are checked against
/// the catalog; the client side coerces responses without one.
#[derive(Clone, Copy, Default)]
pub struct Coercion<'a> {
    reflection: Option<&'a dyn Reflection>,
}

impl<'a> Coercion<'a> {
    pub fn new() -> Self {
        Self { reflection: None }
    }

    pub fn with_reflection(reflection: &'a dyn Reflection) -> Self {
        Self {
            reflection: Some(reflection),
        }
    }

    /// Produce a value of type `target` from `raw`.
    ///
    /// A null input always coerces to `Value::Null`.
    pub fn coerce(&self, raw: Json, target: &TypeDescriptor) -> Result<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }

        if let Some(element) = target.element_type() {
            return self.coerce_array(raw, target, element);
        }

        match Primitive::of(target) {
            Some(primitive) => self.coerce_primitive(raw, target, primitive),
            None => match raw {
                Json::Object(_) | Json::Array(_) => Ok(Value::Object {
                    ty: target.clone(),
                    fields: raw,
                }),
                other => Err(RemexError::coercion(
                    target,
                    format!("expected structured data, found {}", json_kind(&other)),
                )),
            },
        }
    }

    fn coerce_array(&self, raw: Json, target: &TypeDescriptor, element: TypeDescriptor) -> Result<Value> {
        let items = match raw {
            Json::String(encoded) if element.as_str() == names::BYTE => general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| RemexError::coercion(target, format!("invalid base64: {}", e)))?
                .into_iter()
                .map(Value::U8)
                .collect(),
            Json::Array(items) => items
                .into_iter()
                .map(|item| self.coerce(item, &element))
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(RemexError::coercion(
                    target,
                    format!("expected an array, found {}", json_kind(&other)),
                ))
            }
        };
        Ok(Value::Array { element, items })
    }

    fn coerce_primitive(&self, raw: Json, target: &TypeDescriptor, primitive: Primitive) -> Result<Value> {
        let fail = |found: &Json| {
            RemexError::coercion(target, format!("cannot convert {}", json_kind(found)))
        };

        match primitive {
            Primitive::Object => Ok(natural_value(raw)),
            Primitive::Bool => match raw {
                Json::Bool(b) => Ok(Value::Bool(b)),
                Json::String(ref s) => match s.to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(fail(&raw)),
                },
                other => Err(fail(&other)),
            },
            Primitive::U8 => integer(&raw, target).and_then(|n| narrow(n, target, Value::U8)),
            Primitive::I8 => integer(&raw, target).and_then(|n| narrow(n, target, Value::I8)),
            Primitive::I16 => integer(&raw, target).and_then(|n| narrow(n, target, Value::I16)),
            Primitive::U16 => integer(&raw, target).and_then(|n| narrow(n, target, Value::U16)),
            Primitive::I32 => integer(&raw, target).and_then(|n| narrow(n, target, Value::I32)),
            Primitive::U32 => integer(&raw, target).and_then(|n| narrow(n, target, Value::U32)),
            Primitive::I64 => integer(&raw, target).and_then(|n| narrow(n, target, Value::I64)),
            Primitive::U64 => integer(&raw, target).and_then(|n| narrow(n, target, Value::U64)),
            Primitive::F32 => float(&raw).map(|f| Value::F32(f as f32)).ok_or_else(|| fail(&raw)),
            Primitive::F64 => float(&raw).map(Value::F64).ok_or_else(|| fail(&raw)),
            Primitive::Char => match raw {
                Json::String(ref s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Ok(Value::Char(c)),
                        _ => Err(RemexError::coercion(
                            target,
                            format!("expected a single character, found {:?}", s),
                        )),
                    }
                }
                Json::Number(ref n) => n
                    .as_u64()
                    .and_then(|code| u32::try_from(code).ok())
                    .and_then(char::from_u32)
                    .map(Value::Char)
                    .ok_or_else(|| fail(&raw)),
                other => Err(fail(&other)),
            },
            Primitive::String => match raw {
                Json::String(s) => Ok(Value::String(s)),
                Json::Number(n) => Ok(Value::String(n.to_string())),
                Json::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(fail(&other)),
            },
            Primitive::Guid => match raw {
                Json::String(ref s) => Uuid::parse_str(s)
                    .map(Value::Guid)
                    .map_err(|e| RemexError::coercion(target, e.to_string())),
                other => Err(fail(&other)),
            },
            Primitive::DateTime => match raw {
                Json::String(ref s) => DateTime::parse_from_rfc3339(s)
                    .map(|t| Value::DateTime(t.with_timezone(&Utc)))
                    .map_err(|e| RemexError::coercion(target, e.to_string())),
                other => Err(fail(&other)),
            },
            Primitive::Type => match raw {
                Json::String(s) => {
                    let descriptor = TypeDescriptor::new(&s);
                    if let Some(reflection) = self.reflection {
                        reflection.resolve_type(&descriptor)?;
                    }
                    Ok(Value::Type(descriptor))
                }
                other => Err(fail(&other)),
            },
        }
    }
}

/// Integral value of `raw`, rounding fractional input half to even.
fn integer(raw: &Json, target: &TypeDescriptor) -> Result<i128> {
    let parsed = match raw {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(i128::from(u))
            } else {
                n.as_f64().and_then(round_float)
            }
        }
        Json::String(s) => s
            .trim()
            .parse::<i128>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().and_then(round_float)),
        _ => None,
    };
    parsed.ok_or_else(|| {
        RemexError::coercion(target, format!("cannot convert {} to an integer", json_kind(raw)))
    })
}

fn round_float(f: f64) -> Option<i128> {
    if !f.is_finite() {
        return None;
    }
    let rounded = f.round_ties_even();
    if rounded.abs() > 1e38 {
        return None;
    }
    Some(rounded as i128)
}

fn narrow<T: TryFrom<i128>>(n: i128, target: &TypeDescriptor, wrap: fn(T) -> Value) -> Result<Value> {
    T::try_from(n)
        .map(wrap)
        .map_err(|_| RemexError::coercion(target, format!("{} is out of range", n)))
}

fn float(raw: &Json) -> Option<f64> {
    match raw {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// The value a `System.Object` parameter receives: the nearest natural type.
fn natural_value(raw: Json) -> Value {
    match raw {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i).map(Value::I32).unwrap_or(Value::I64(i))
            } else if let Some(u) = n.as_u64() {
                Value::U64(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array {
            element: TypeDescriptor::new(names::OBJECT),
            items: items.into_iter().map(natural_value).collect(),
        },
        fields @ Json::Object(_) => Value::Object {
            ty: TypeDescriptor::new(names::OBJECT),
            fields,
        },
    }
}

fn json_kind(raw: &Json) -> &'static str {
    match raw {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeCatalog;
    use serde_json::json;

    fn coerce(raw: Json, target: &str) -> Result<Value> {
        Coercion::new().coerce(raw, &TypeDescriptor::new(target))
    }

    #[test]
    fn test_null_coerces_to_null_for_any_target() {
        for target in [names::INT32, names::STRING, "TestTypes.Anything, Elsewhere", "System.Byte[]"] {
            assert_eq!(coerce(Json::Null, target).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_integer_width_from_descriptor() {
        assert_eq!(coerce(json!(5), names::BYTE).unwrap(), Value::U8(5));
        assert_eq!(coerce(json!(5), names::INT64).unwrap(), Value::I64(5));
        assert_eq!(coerce(json!(-5), names::INT16).unwrap(), Value::I16(-5));
        assert_eq!(coerce(json!("42"), names::UINT32).unwrap(), Value::U32(42));
    }

    #[test]
    fn test_integer_out_of_range_fails() {
        assert!(matches!(
            coerce(json!(256), names::BYTE),
            Err(RemexError::Coercion { .. })
        ));
        assert!(coerce(json!(-1), names::UINT64).is_err());
    }

    #[test]
    fn test_fractional_integers_round_half_to_even() {
        assert_eq!(coerce(json!(2.5), names::INT32).unwrap(), Value::I32(2));
        assert_eq!(coerce(json!(3.5), names::INT32).unwrap(), Value::I32(4));
        assert_eq!(coerce(json!(-0.5), names::INT32).unwrap(), Value::I32(0));
    }

    #[test]
    fn test_floats() {
        assert_eq!(coerce(json!(7), names::DOUBLE).unwrap(), Value::F64(7.0));
        assert_eq!(coerce(json!(0.25), names::SINGLE).unwrap(), Value::F32(0.25));
        assert_eq!(coerce(json!("NaN"), names::DOUBLE).unwrap().to_json(), json!("NaN"));
    }

    #[test]
    fn test_char_requires_single_character() {
        assert_eq!(coerce(json!("H"), names::CHAR).unwrap(), Value::Char('H'));
        assert_eq!(coerce(json!(72), names::CHAR).unwrap(), Value::Char('H'));
        assert!(coerce(json!("He"), names::CHAR).is_err());
        assert!(coerce(json!(""), names::CHAR).is_err());
    }

    #[test]
    fn test_char_arrays_coerce_elementwise() {
        let value = coerce(json!(["H", "i"]), "System.Char[]").unwrap();
        assert_eq!(
            value,
            Value::Array {
                element: TypeDescriptor::new(names::CHAR),
                items: vec![Value::Char('H'), Value::Char('i')],
            }
        );
    }

    #[test]
    fn test_byte_arrays_accept_base64() {
        let value = coerce(json!("AQID/w=="), "System.Byte[]").unwrap();
        match value {
            Value::Array { items, .. } => assert_eq!(
                items,
                vec![Value::U8(1), Value::U8(2), Value::U8(3), Value::U8(255)]
            ),
            other => panic!("expected array, got {:?}", other),
        }
        assert!(coerce(json!("not base64!"), "System.Byte[]").is_err());
    }

    #[test]
    fn test_guid_and_timestamp() {
        let id = Uuid::new_v4();
        assert_eq!(coerce(json!(id.to_string()), names::GUID).unwrap(), Value::Guid(id));
        assert!(coerce(json!("nope"), names::GUID).is_err());

        let value = coerce(json!("2024-05-06T09:08:09+02:00"), names::DATE_TIME).unwrap();
        assert_eq!(value.to_json(), json!("2024-05-06T07:08:09Z"));
    }

    #[test]
    fn test_type_arguments_checked_against_catalog() {
        let catalog = TypeCatalog::builder().with_prelude().build();
        let coercion = Coercion::with_reflection(&catalog);
        let ty = TypeDescriptor::new(names::TYPE);

        assert_eq!(
            coercion.coerce(json!("System.Int32"), &ty).unwrap(),
            Value::Type(TypeDescriptor::new(names::INT32))
        );
        assert!(matches!(
            coercion.coerce(json!("Nope.Missing"), &ty),
            Err(RemexError::TypeResolution { .. })
        ));
    }

    #[test]
    fn test_object_parameters_take_natural_values() {
        assert_eq!(coerce(json!(3), names::OBJECT).unwrap(), Value::I32(3));
        assert_eq!(coerce(json!(1.5), names::OBJECT).unwrap(), Value::F64(1.5));
        assert_eq!(coerce(json!("s"), names::OBJECT).unwrap(), Value::String("s".into()));
    }

    #[test]
    fn test_user_types_keep_structured_fields() {
        let value = coerce(json!({"x": 1}), "Geometry.Point, Geometry").unwrap();
        assert_eq!(value.descriptor().as_str(), "Geometry.Point, Geometry");
        assert_eq!(value.to_json(), json!({"x": 1}));

        assert!(coerce(json!(1), "Geometry.Point, Geometry").is_err());
    }
}
