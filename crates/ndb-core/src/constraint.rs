//! Typed metadata values and the filter predicates that match them.
//!
//! Chunk metadata and query constraints share one closed type system:
//! `bool`, `int`, `float`, and `string`. The HTTP transport is loosely
//! typed JSON, so every constraint carries an explicit `dtype` and its
//! `value` is decoded strictly as that type before it ever reaches an engine.
//!
//! Matching never coerces. An `EqualTo(Int(7))` does not match a stored
//! `Float(7.0)`, and ordering predicates only compare values of the same
//! type. A type mismatch is simply a non-match.
//!
//! # Wire format
//!
//! ```json
//! { "constraint_type": "GreaterThan", "value": 3.0, "dtype": "float" }
//! { "constraint_type": "AnyOf", "value": ["apple", "kiwi"], "dtype": "string" }
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Per-chunk metadata, keyed by column name.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// The declared type of a metadata column or constraint value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Bool,
    Int,
    Float,
    Str,
}

impl Dtype {
    /// Parses a dtype name as sent by clients.
    ///
    /// Accepts both the long names (`boolean`, `integer`, `float`, `string`)
    /// and the short aliases (`bool`, `int`, `str`).
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "boolean" | "bool" => Ok(Dtype::Bool),
            "integer" | "int" => Ok(Dtype::Int),
            "float" => Ok(Dtype::Float),
            "string" | "str" => Ok(Dtype::Str),
            other => bail!(
                "unknown dtype: '{}'. Must be one of string, integer, float, boolean",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Bool => "boolean",
            Dtype::Int => "integer",
            Dtype::Float => "float",
            Dtype::Str => "string",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed metadata value.
///
/// Serialized untagged, so `true`, `7`, `7.5`, and `"kiwi"` round-trip
/// to `Bool`, `Int`, `Float`, and `Str` respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn dtype(&self) -> Dtype {
        match self {
            MetadataValue::Bool(_) => Dtype::Bool,
            MetadataValue::Int(_) => Dtype::Int,
            MetadataValue::Float(_) => Dtype::Float,
            MetadataValue::Str(_) => Dtype::Str,
        }
    }

    /// Decodes a JSON value strictly as `dtype`.
    ///
    /// Integers are accepted where a float is declared; nothing else is
    /// widened or narrowed. Floats must be finite.
    pub fn decode(dtype: Dtype, value: &serde_json::Value) -> Result<Self> {
        let decoded = match dtype {
            Dtype::Bool => value.as_bool().map(MetadataValue::Bool),
            Dtype::Int => value.as_i64().map(MetadataValue::Int),
            Dtype::Float => value
                .as_f64()
                .filter(|f| f.is_finite())
                .map(MetadataValue::Float),
            Dtype::Str => value.as_str().map(|s| MetadataValue::Str(s.to_string())),
        };
        decoded.ok_or_else(|| anyhow!("value {} is not a valid {}", value, dtype))
    }

    /// Compares two values of the same type. Returns `None` across types
    /// and for NaN floats.
    fn compare(&self, other: &MetadataValue) -> Option<Ordering> {
        match (self, other) {
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => Some(a.cmp(b)),
            (MetadataValue::Int(a), MetadataValue::Int(b)) => Some(a.cmp(b)),
            (MetadataValue::Float(a), MetadataValue::Float(b)) => a.partial_cmp(b),
            (MetadataValue::Str(a), MetadataValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => write!(f, "{}", v),
            MetadataValue::Int(v) => write!(f, "{}", v),
            MetadataValue::Float(v) => write!(f, "{}", v),
            MetadataValue::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// A predicate over one stored metadata value.
///
/// `LessThan(v)` matches a stored `x` when `x < v`; `GreaterThan(v)` when
/// `x > v`. `Substring(s)` matches stored strings containing `s`.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    EqualTo(MetadataValue),
    LessThan(MetadataValue),
    GreaterThan(MetadataValue),
    Substring(String),
    AnyOf(Vec<MetadataValue>),
}

impl Constraint {
    pub fn matches(&self, stored: &MetadataValue) -> bool {
        match self {
            Constraint::EqualTo(v) => stored.compare(v) == Some(Ordering::Equal),
            Constraint::LessThan(v) => stored.compare(v) == Some(Ordering::Less),
            Constraint::GreaterThan(v) => stored.compare(v) == Some(Ordering::Greater),
            Constraint::Substring(needle) => match stored {
                MetadataValue::Str(s) => s.contains(needle.as_str()),
                _ => false,
            },
            Constraint::AnyOf(values) => values
                .iter()
                .any(|v| stored.compare(v) == Some(Ordering::Equal)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Constraint::EqualTo(_) => "EqualTo",
            Constraint::LessThan(_) => "LessThan",
            Constraint::GreaterThan(_) => "GreaterThan",
            Constraint::Substring(_) => "Substring",
            Constraint::AnyOf(_) => "AnyOf",
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::EqualTo(v) | Constraint::LessThan(v) | Constraint::GreaterThan(v) => {
                write!(f, "{}({})", self.name(), v)
            }
            Constraint::Substring(s) => write!(f, "Substring({:?})", s),
            Constraint::AnyOf(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "AnyOf([{}])", parts.join(", "))
            }
        }
    }
}

/// A constraint as it appears on the wire, before type checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub constraint_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    pub dtype: String,
}

impl ConstraintSpec {
    /// Type-checks the wire form and builds a [`Constraint`].
    pub fn into_constraint(self) -> Result<Constraint> {
        let dtype = Dtype::parse(&self.dtype)?;

        if self.value.is_null() {
            bail!(
                "missing or invalid 'value' argument for {} constraint",
                self.constraint_type
            );
        }

        match self.constraint_type.as_str() {
            "EqualTo" => Ok(Constraint::EqualTo(MetadataValue::decode(dtype, &self.value)?)),
            "LessThan" => Ok(Constraint::LessThan(MetadataValue::decode(dtype, &self.value)?)),
            "GreaterThan" => Ok(Constraint::GreaterThan(MetadataValue::decode(
                dtype,
                &self.value,
            )?)),
            "Substring" => {
                if dtype != Dtype::Str {
                    bail!("Substring constraint requires dtype string, got {}", dtype);
                }
                match MetadataValue::decode(dtype, &self.value)? {
                    MetadataValue::Str(s) => Ok(Constraint::Substring(s)),
                    _ => unreachable!("string dtype always decodes to Str"),
                }
            }
            "AnyOf" => {
                let items = self
                    .value
                    .as_array()
                    .ok_or_else(|| anyhow!("AnyOf constraint requires a list value"))?;
                if items.is_empty() {
                    bail!("AnyOf constraint requires at least one value");
                }
                let values = items
                    .iter()
                    .map(|item| MetadataValue::decode(dtype, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Constraint::AnyOf(values))
            }
            other => bail!("unknown constraint_type: '{}'", other),
        }
    }
}

/// A conjunction of per-key constraints. A chunk matches when every key is
/// present in its metadata and every constraint matches the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryConstraints {
    constraints: BTreeMap<String, Constraint>,
}

impl QueryConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, constraint: Constraint) {
        self.constraints.insert(key.into(), constraint);
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.constraints.iter().all(|(key, constraint)| {
            metadata
                .get(key)
                .map(|stored| constraint.matches(stored))
                .unwrap_or(false)
        })
    }

    /// Builds constraints from their wire form, naming the offending key on
    /// the first error.
    pub fn from_specs(specs: HashMap<String, ConstraintSpec>) -> Result<Self> {
        let mut out = Self::new();
        for (key, spec) in specs {
            let constraint = spec
                .into_constraint()
                .map_err(|e| anyhow!("unable to parse constraint {}: {}", key, e))?;
            out.insert(key, constraint);
        }
        Ok(out)
    }
}

impl FromIterator<(String, Constraint)> for QueryConstraints {
    fn from_iter<I: IntoIterator<Item = (String, Constraint)>>(iter: I) -> Self {
        Self {
            constraints: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for QueryConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .constraints
            .iter()
            .map(|(k, c)| format!("{}: {}", k, c))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
