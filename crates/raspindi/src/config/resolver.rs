//! Named setting lookups with type coercion and bounds checks
//!
//! Lookups never fail. A missing key resolves to the caller's default; a key
//! of the wrong type logs a warning and also resolves to the default.

use std::fmt;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A value type the resolver can read out of a setting.
pub trait Setting: Sized {
    /// Human readable type name for diagnostics.
    const KIND: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl Setting for i64 {
    const KIND: &'static str = "integer";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_integer()
    }
}

impl Setting for f64 {
    const KIND: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl Setting for String {
    const KIND: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl Setting for bool {
    const KIND: &'static str = "boolean";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

/// Outcome of a bounded integer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bounded {
    /// The stored value, the default, or the lower bound after clamping.
    Value(i64),
    /// The stored value exceeded the upper bound and must not be used.
    OverRange,
}

impl Bounded {
    /// Resolve the over-range sentinel to `default`.
    pub fn or(self, default: i64) -> i64 {
        match self {
            Bounded::Value(v) => v,
            Bounded::OverRange => default,
        }
    }
}

/// Reads named configuration values out of a TOML document.
///
/// Names may be dotted paths (`camera.width`) into nested tables.
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    table: Table,
    origin: Option<PathBuf>,
}

impl ParameterResolver {
    /// A resolver with no settings; every lookup yields its default.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_table(table: Table) -> Self {
        Self {
            table,
            origin: None,
        }
    }

    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mut resolver = Self::parse(&text, path)?;
        resolver.origin = Some(path.to_path_buf());
        debug!(path = %path.display(), keys = resolver.table.len(), "Loaded config");
        Ok(resolver)
    }

    /// Parse settings from TOML text. `origin` is only used in error messages.
    pub fn parse(text: &str, origin: impl AsRef<Path>) -> Result<Self> {
        let table = text.parse::<Table>().map_err(|e| {
            let (line, column) = match e.span() {
                Some(span) => {
                    let (line, column) = line_column(text, span.start);
                    (Some(line), Some(column))
                }
                None => (None, None),
            };
            Error::ConfigParse {
                path: origin.as_ref().to_path_buf(),
                line,
                column,
                message: e.message().trim().to_string(),
            }
        })?;
        Ok(Self::from_table(table))
    }

    /// Path of the file the settings came from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Look up `name`, falling back to `default` when absent or mistyped.
    pub fn get<T: Setting>(&self, name: &str, default: T) -> T {
        match self.lookup(name) {
            None => default,
            Some(value) => match T::from_value(value) {
                Some(v) => v,
                None => {
                    warn!(
                        "Invalid value for {}: expected {}, found {}",
                        name,
                        T::KIND,
                        value.type_str()
                    );
                    default
                }
            },
        }
    }

    /// Integer lookup limited to `min..=max`.
    ///
    /// Values above `max` yield [`Bounded::OverRange`]; values below `min`
    /// are clamped to `min`. Both cases log a warning.
    pub fn get_bounded(&self, name: &str, default: i64, min: i64, max: i64) -> Bounded {
        let Some(value) = self.lookup(name) else {
            return Bounded::Value(default);
        };
        let Some(v) = value.as_integer() else {
            warn!(
                "Invalid value for {}: expected integer, found {}",
                name,
                value.type_str()
            );
            return Bounded::Value(default);
        };
        if v > max {
            warn!("Invalid value for {}: {} (max {})", name, v, max);
            return Bounded::OverRange;
        }
        if v < min {
            warn!("Invalid value for {}: {} (min {})", name, v, min);
            return Bounded::Value(min);
        }
        Bounded::Value(v)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let mut parts = name.split('.');
        let mut value = self.table.get(parts.next()?)?;
        for part in parts {
            value = value.as_table()?.get(part)?;
        }
        Some(value)
    }
}

impl fmt::Display for ParameterResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(path) => write!(f, "{}", path.display()),
            None => write!(f, "<defaults>"),
        }
    }
}

/// 1-based line and column of a byte offset.
fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    (line, column)
}
