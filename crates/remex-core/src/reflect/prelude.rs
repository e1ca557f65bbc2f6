//! Built-in types every catalog can offer.

use std::any::Any;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use super::{TypeDef, TypeEntry};
use crate::descriptor::{names, TypeDescriptor};
use crate::error::{RemexError, Result};
use crate::value::{FromValue, IntoValue, RemoteType};

/// Upper bound on the storage a list constructor reserves up front.
const MAX_INITIAL_CAPACITY: usize = 64 * 1024;

/// Marker for types that only carry static members.
struct StaticOnly;

pub(super) fn entries() -> Vec<TypeEntry> {
    vec![
        primitive::<bool>().into_entry(),
        primitive::<u8>().into_entry(),
        primitive::<i8>().into_entry(),
        primitive::<i16>().into_entry(),
        primitive::<u16>().into_entry(),
        primitive::<i32>().into_entry(),
        primitive::<u32>().into_entry(),
        primitive::<i64>().into_entry(),
        primitive::<u64>().into_entry(),
        primitive::<f32>().into_entry(),
        primitive::<f64>().into_entry(),
        primitive::<char>().into_entry(),
        guid().into_entry(),
        date_time().into_entry(),
        string().into_entry(),
        list::<i32>().into_entry(),
        list::<i64>().into_entry(),
        list::<f64>().into_entry(),
        list::<String>().into_entry(),
        list::<bool>().into_entry(),
        math().into_entry(),
    ]
}

fn primitive<T>() -> TypeDef<T>
where
    T: RemoteType + IntoValue + FromValue + Default + Display + FromStr + Clone + Any + Send,
{
    TypeDef::<T>::new(T::descriptor())
        .value_type()
        .method0("ToString", |v: &mut T| Ok(v.to_string()))
        .static_method1("Parse", |s: String| {
            s.trim().parse::<T>().map_err(|_| {
                RemexError::invocation("Parse", format!("{:?} is not a valid {}", s, T::descriptor()))
            })
        })
}

fn guid() -> TypeDef<Uuid> {
    primitive::<Uuid>().static_method0("NewGuid", || Ok(Uuid::new_v4()))
}

fn date_time() -> TypeDef<DateTime<Utc>> {
    TypeDef::<DateTime<Utc>>::new(names::DATE_TIME)
        .value_type()
        .method0("ToString", |t: &mut DateTime<Utc>| {
            Ok(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        })
        .static_method1("Parse", |s: String| {
            DateTime::parse_from_rfc3339(s.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| RemexError::invocation("Parse", e.to_string()))
        })
        .static_property("UtcNow", Utc::now)
}

fn char_index(haystack: &str, byte_index: Option<usize>) -> i32 {
    byte_index
        .map(|i| haystack[..i].chars().count() as i32)
        .unwrap_or(-1)
}

fn string() -> TypeDef<String> {
    TypeDef::<String>::new(names::STRING)
        .constructor1(|chars: Vec<char>| Ok(chars.into_iter().collect::<String>()))
        .constructor2(|c: char, count: i32| {
            let count = usize::try_from(count)
                .map_err(|_| RemexError::invocation("String..ctor", "count must not be negative"))?;
            Ok(std::iter::repeat(c).take(count).collect::<String>())
        })
        .property("Length", |s: &String| s.chars().count() as i32)
        .method0("ToString", |s: &mut String| Ok(s.clone()))
        .method0("ToUpper", |s: &mut String| Ok(s.to_uppercase()))
        .method0("ToLower", |s: &mut String| Ok(s.to_lowercase()))
        .method0("ToCharArray", |s: &mut String| Ok(s.chars().collect::<Vec<char>>()))
        .method1("Contains", |s: &mut String, needle: String| Ok(s.contains(needle.as_str())))
        .method1("IndexOf", |s: &mut String, needle: String| {
            Ok(char_index(s, s.find(needle.as_str())))
        })
        .method1("IndexOf", |s: &mut String, needle: char| Ok(char_index(s, s.find(needle))))
        .method1("Substring", |s: &mut String, start: i32| substring(s, start, None))
        .method2("Substring", |s: &mut String, start: i32, length: i32| {
            substring(s, start, Some(length))
        })
}

fn substring(s: &str, start: i32, length: Option<i32>) -> Result<String> {
    let out_of_range = || RemexError::invocation("Substring", "index and length must refer to a location within the string");
    let total = s.chars().count();
    let start = usize::try_from(start).map_err(|_| out_of_range())?;
    let length = match length {
        Some(length) => usize::try_from(length).map_err(|_| out_of_range())?,
        None => total.checked_sub(start).ok_or_else(out_of_range)?,
    };
    if start.checked_add(length).map_or(true, |end| end > total) {
        return Err(out_of_range());
    }
    Ok(s.chars().skip(start).take(length).collect())
}

fn list_index(index: i32, len: usize, inclusive: bool) -> Result<usize> {
    let limit = if inclusive { len } else { len.saturating_sub(1) };
    usize::try_from(index)
        .ok()
        .filter(|&i| i <= limit && (inclusive || len > 0))
        .ok_or_else(|| RemexError::invocation("List", format!("index {} is out of range", index)))
}

fn list<T>() -> TypeDef<Vec<T>>
where
    T: RemoteType + IntoValue + FromValue + PartialEq + Clone + Any + Send,
{
    TypeDef::<Vec<T>>::new(TypeDescriptor::list_of(&T::descriptor()))
        .constructor0(|| Ok(Vec::new()))
        .constructor1(|capacity: i32| {
            let capacity = usize::try_from(capacity).map_err(|_| {
                RemexError::invocation("List..ctor", "capacity must not be negative")
            })?;
            // Only a hint; the list still grows past it.
            Ok(Vec::with_capacity(capacity.min(MAX_INITIAL_CAPACITY)))
        })
        .property("Count", |v: &Vec<T>| v.len() as i32)
        .property("Capacity", |v: &Vec<T>| v.capacity() as i32)
        .method1("Add", |v: &mut Vec<T>, item: T| {
            v.push(item);
            Ok(())
        })
        .method2("Insert", |v: &mut Vec<T>, index: i32, item: T| {
            let index = list_index(index, v.len(), true)?;
            v.insert(index, item);
            Ok(())
        })
        .method1("Remove", |v: &mut Vec<T>, item: T| {
            Ok(match v.iter().position(|x| *x == item) {
                Some(i) => {
                    v.remove(i);
                    true
                }
                None => false,
            })
        })
        .method1("RemoveAt", |v: &mut Vec<T>, index: i32| {
            let index = list_index(index, v.len(), false)?;
            v.remove(index);
            Ok(())
        })
        .method1("Contains", |v: &mut Vec<T>, item: T| Ok(v.contains(&item)))
        .method1("IndexOf", |v: &mut Vec<T>, item: T| {
            Ok(v.iter().position(|x| *x == item).map_or(-1, |i| i as i32))
        })
        .method0("Clear", |v: &mut Vec<T>| {
            v.clear();
            Ok(())
        })
        .method0("ToArray", |v: &mut Vec<T>| Ok(v.clone()))
}

fn math() -> TypeDef<StaticOnly> {
    TypeDef::<StaticOnly>::new(names::MATH)
        .static_property("PI", || std::f64::consts::PI)
        .static_property("E", || std::f64::consts::E)
        .static_method1("Abs", |x: f64| Ok(x.abs()))
        .static_method1("Abs", |x: i32| {
            x.checked_abs()
                .ok_or_else(|| RemexError::invocation("Abs", "negating the minimum value overflows"))
        })
        .static_method1("Sqrt", |x: f64| Ok(x.sqrt()))
        .static_method1("Floor", |x: f64| Ok(x.floor()))
        .static_method1("Ceiling", |x: f64| Ok(x.ceil()))
        .static_method1("Round", |x: f64| Ok(x.round_ties_even()))
        .static_method2("Pow", |x: f64, y: f64| Ok(x.powf(y)))
        .static_method2("Max", |a: f64, b: f64| Ok(a.max(b)))
        .static_method2("Max", |a: i32, b: i32| Ok(a.max(b)))
        .static_method2("Min", |a: f64, b: f64| Ok(a.min(b)))
        .static_method2("Min", |a: i32, b: i32| Ok(a.min(b)))
}
