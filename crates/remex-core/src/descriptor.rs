//! Type descriptor codec.
//!
//! A type descriptor is the cross-process name of a type, in assembly-qualified
//! form: `Full.Type.Name, Module, Version=..., Culture=..., PublicKeyToken=...`.
//! Core-library qualifiers differ between runtime variants, so they are
//! stripped everywhere they occur, including inside generic arguments:
//!
//! ```text
//! System.Collections.Generic.List`1[[System.Int32, System.Private.CoreLib, Version=4.0.0.0]]
//!     => System.Collections.Generic.List`1[[System.Int32]]
//! ```
//!
//! Every `TypeDescriptor` value is normalized on construction, so two
//! descriptors compare equal exactly when their normalized forms do.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::reflect::{Reflection, TypeEntry};

/// Descriptors of the built-in vocabulary.
pub mod names {
    pub const OBJECT: &str = "System.Object";
    pub const BOOLEAN: &str = "System.Boolean";
    pub const BYTE: &str = "System.Byte";
    pub const SBYTE: &str = "System.SByte";
    pub const INT16: &str = "System.Int16";
    pub const UINT16: &str = "System.UInt16";
    pub const INT32: &str = "System.Int32";
    pub const UINT32: &str = "System.UInt32";
    pub const INT64: &str = "System.Int64";
    pub const UINT64: &str = "System.UInt64";
    pub const SINGLE: &str = "System.Single";
    pub const DOUBLE: &str = "System.Double";
    pub const CHAR: &str = "System.Char";
    pub const STRING: &str = "System.String";
    pub const GUID: &str = "System.Guid";
    pub const DATE_TIME: &str = "System.DateTime";
    pub const TYPE: &str = "System.Type";
    pub const MATH: &str = "System.Math";
    pub const LIST: &str = "System.Collections.Generic.List`1";
}

/// Module qualifiers that never survive encoding.
const CORE_LIBRARY_MODULES: &[&str] = &["System.Private.CoreLib", "mscorlib"];

/// Assembly attributes that trail a module name.
const MODULE_ATTRIBUTES: &[&str] = &[
    "version=",
    "culture=",
    "publickeytoken=",
    "processorarchitecture=",
];

/// Normalizing encoder for type descriptors.
///
/// Immutable once built; the standard codec skips the core libraries of both
/// runtime variants.
#[derive(Debug, Clone)]
pub struct DescriptorCodec {
    /// Lowercased module names, longest first.
    skipped_modules: Vec<String>,
}

impl Default for DescriptorCodec {
    fn default() -> Self {
        Self::with_skipped_modules(CORE_LIBRARY_MODULES.iter().copied())
    }
}

impl DescriptorCodec {
    /// A codec that strips exactly the given module qualifiers.
    pub fn with_skipped_modules<'a>(modules: impl IntoIterator<Item = &'a str>) -> Self {
        let mut skipped_modules: Vec<String> = modules
            .into_iter()
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        skipped_modules.sort_by(|a, b| b.len().cmp(&a.len()));
        Self { skipped_modules }
    }

    /// Produce the descriptor for a type living in `module`.
    ///
    /// Skipped modules contribute no qualifier; any skipped qualifier nested in
    /// `full_name` (generic arguments) is stripped as well.
    pub fn encode(&self, full_name: &str, module: Option<&str>) -> TypeDescriptor {
        let raw = match module.map(str::trim).filter(|m| !m.is_empty()) {
            Some(module) if !self.is_skipped(module) => format!("{}, {}", full_name, module),
            _ => full_name.to_string(),
        };
        TypeDescriptor(Arc::from(self.normalize(&raw)))
    }

    /// Resolve a descriptor string against the local type catalog.
    pub fn decode(&self, descriptor: &str, reflection: &dyn Reflection) -> Result<Arc<TypeEntry>> {
        let descriptor = TypeDescriptor(Arc::from(self.normalize(descriptor)));
        reflection.resolve_type(&descriptor)
    }

    /// Strip every skipped qualifier from a descriptor string.
    ///
    /// Runs to a fixpoint, so `normalize(normalize(s)) == normalize(s)`.
    pub fn normalize(&self, descriptor: &str) -> String {
        let mut current = descriptor.trim().to_string();
        loop {
            let next = self.strip_pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn is_skipped(&self, module: &str) -> bool {
        let lower = module.to_ascii_lowercase();
        let name = lower.split(',').next().unwrap_or("").trim();
        self.skipped_modules.iter().any(|m| m == name)
    }

    fn strip_pass(&self, s: &str) -> String {
        // ASCII lowercasing keeps byte offsets aligned with `s`.
        let lower = s.to_ascii_lowercase();
        let mut out = String::with_capacity(s.len());
        let mut i = 0;
        while i < s.len() {
            if s.as_bytes()[i] == b',' {
                if let Some(end) = self.skipped_qualifier_end(&lower, i) {
                    i = end;
                    continue;
                }
            }
            let ch = s[i..].chars().next().unwrap_or_default();
            out.push(ch);
            i += ch.len_utf8();
        }
        out
    }

    /// If a skipped qualifier starts at the comma at `comma`, return the
    /// offset just past it and its trailing assembly attributes.
    fn skipped_qualifier_end(&self, lower: &str, comma: usize) -> Option<usize> {
        let start = skip_spaces(lower, comma + 1);
        let rest = &lower[start..];
        let module = self
            .skipped_modules
            .iter()
            .find(|m| rest.starts_with(m.as_str()) && is_boundary(lower, start + m.len()))?;

        let mut end = start + module.len();
        loop {
            if !lower[end..].starts_with(',') {
                break;
            }
            let attr = skip_spaces(lower, end + 1);
            if !MODULE_ATTRIBUTES.iter().any(|a| lower[attr..].starts_with(a)) {
                break;
            }
            end = lower[attr..]
                .find([',', ']'])
                .map(|offset| attr + offset)
                .unwrap_or(lower.len());
        }
        Some(end)
    }
}

fn skip_spaces(s: &str, mut i: usize) -> usize {
    while i < s.len() && s.as_bytes()[i] == b' ' {
        i += 1;
    }
    i
}

fn is_boundary(s: &str, i: usize) -> bool {
    matches!(s.as_bytes().get(i), None | Some(b',') | Some(b']') | Some(b' '))
}

/// A normalized, runtime-resolvable type name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TypeDescriptor(Arc<str>);

impl TypeDescriptor {
    /// Normalize `descriptor` with the standard codec.
    pub fn new(descriptor: &str) -> Self {
        Self(Arc::from(standard_codec().normalize(descriptor)))
    }

    /// Descriptor of a one-dimensional array of `element`.
    pub fn array_of(element: &TypeDescriptor) -> Self {
        match element.qualifier() {
            Some(qualifier) => Self::new(&format!("{}[], {}", element.full_name(), qualifier)),
            None => Self::new(&format!("{}[]", element.full_name())),
        }
    }

    /// Descriptor of `System.Collections.Generic.List<element>`.
    pub fn list_of(element: &TypeDescriptor) -> Self {
        Self::new(&format!("{}[[{}]]", names::LIST, element))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type name without its module qualifier.
    pub fn full_name(&self) -> &str {
        match self.top_level_comma() {
            Some(i) => self.0[..i].trim_end(),
            None => &self.0,
        }
    }

    /// The module qualifier, if the descriptor carries one.
    pub fn qualifier(&self) -> Option<&str> {
        self.top_level_comma().map(|i| self.0[i + 1..].trim())
    }

    /// Element type when this descriptor names a one-dimensional array.
    pub fn element_type(&self) -> Option<TypeDescriptor> {
        let element = self.full_name().strip_suffix("[]")?;
        Some(match self.qualifier() {
            Some(qualifier) => Self::new(&format!("{}, {}", element, qualifier)),
            None => Self::new(element),
        })
    }

    fn top_level_comma(&self) -> Option<usize> {
        let mut depth = 0usize;
        for (i, b) in self.0.bytes().enumerate() {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => return Some(i),
                _ => {}
            }
        }
        None
    }
}

fn standard_codec() -> &'static DescriptorCodec {
    static CODEC: std::sync::OnceLock<DescriptorCodec> = std::sync::OnceLock::new();
    CODEC.get_or_init(DescriptorCodec::default)
}

impl From<String> for TypeDescriptor {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<&str> for TypeDescriptor {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<TypeDescriptor> for String {
    fn from(d: TypeDescriptor) -> Self {
        d.0.to_string()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescriptor({:?})", &*self.0)
    }
}
