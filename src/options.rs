//! Named, typed configuration values.
//!
//! Tasks and services declare their options as a table of [`OptionSpec`]s.
//! Before a service is created every declared option is registered into one
//! [`Options`] namespace together with its evaluated default. Reads and writes
//! go through that namespace and re-apply the declared coercion.
//!
//! Task options are namespaced as `<prefix>_<name>`, where the prefix is the
//! task's `OPT_PREFIX` or its name. On the command line the same option is
//! spelled `--<prefix>-<name>`.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::error::{ConfigError, OptionError};

/// The type an option value is coerced to on every read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Str,
    Int,
    Float,
    Bool,
    List,
}

impl OptionKind {
    /// Short name used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            OptionKind::Str => "str",
            OptionKind::Int => "int",
            OptionKind::Float => "float",
            OptionKind::Bool => "bool",
            OptionKind::List => "list",
        }
    }

    /// Converts `value` to this kind.
    ///
    /// Strings are parsed, integers widen to floats, integral floats narrow to
    /// integers. Anything else is an [`OptionError::Coerce`].
    pub fn coerce(&self, name: &str, value: OptionValue) -> Result<OptionValue, OptionError> {
        let fail = |shown: String| OptionError::Coerce {
            name: name.to_string(),
            kind: self.label(),
            value: shown,
        };

        let coerced = match (self, value) {
            (OptionKind::Str, OptionValue::Str(s)) => OptionValue::Str(s),
            (OptionKind::Str, other) => OptionValue::Str(other.to_string()),

            (OptionKind::Int, OptionValue::Int(i)) => OptionValue::Int(i),
            (OptionKind::Int, OptionValue::Float(f)) if f.fract() == 0.0 => {
                OptionValue::Int(f as i64)
            }
            (OptionKind::Int, OptionValue::Str(s)) => {
                OptionValue::Int(s.trim().parse().map_err(|_| fail(s.clone()))?)
            }

            (OptionKind::Float, OptionValue::Float(f)) => OptionValue::Float(f),
            (OptionKind::Float, OptionValue::Int(i)) => OptionValue::Float(i as f64),
            (OptionKind::Float, OptionValue::Str(s)) => {
                OptionValue::Float(s.trim().parse().map_err(|_| fail(s.clone()))?)
            }

            (OptionKind::Bool, OptionValue::Bool(b)) => OptionValue::Bool(b),
            (OptionKind::Bool, OptionValue::Int(0)) => OptionValue::Bool(false),
            (OptionKind::Bool, OptionValue::Int(1)) => OptionValue::Bool(true),
            (OptionKind::Bool, OptionValue::Str(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => OptionValue::Bool(true),
                    "false" | "0" | "no" | "off" => OptionValue::Bool(false),
                    _ => return Err(fail(s)),
                }
            }

            (OptionKind::List, OptionValue::List(l)) => OptionValue::List(l),
            (OptionKind::List, OptionValue::Str(s)) if s.trim().is_empty() => {
                OptionValue::List(Vec::new())
            }
            (OptionKind::List, OptionValue::Str(s)) => {
                OptionValue::List(s.split(',').map(|p| p.trim().to_string()).collect())
            }

            (_, other) => return Err(fail(other.to_string())),
        };
        Ok(coerced)
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A raw or coerced option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            OptionValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Str(s) => f.write_str(s),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(v) => write!(f, "{v:?}"),
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::List(l) => f.write_str(&l.join(",")),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<usize> for OptionValue {
    fn from(value: usize) -> Self {
        OptionValue::Int(value as i64)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        OptionValue::List(value)
    }
}

type LateDefault = Arc<dyn Fn() -> Option<OptionValue> + Send + Sync>;

#[derive(Clone)]
enum OptionDefault {
    None,
    Value(OptionValue),
    /// Evaluated once, when the owning task's options are registered.
    Late(LateDefault),
}

/// Declaration of one option on a task or a service.
///
/// The option's name is the attribute name given to the constructor unless
/// [`OptionSpec::named`] overrides it.
///
/// ```
/// use taskhost::OptionSpec;
///
/// const INTERVAL: f64 = 2.5;
///
/// let spec = OptionSpec::float("interval")
///     .with_late_default(|| Some(INTERVAL.into()))
///     .with_help("How often this task should run (s)");
/// assert_eq!(spec.name(), "interval");
/// ```
#[derive(Clone)]
pub struct OptionSpec {
    attr: String,
    name: Option<String>,
    kind: OptionKind,
    default: OptionDefault,
    help: Option<String>,
}

impl OptionSpec {
    pub fn new(attr: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            attr: attr.into(),
            name: None,
            kind,
            default: OptionDefault::None,
            help: None,
        }
    }

    pub fn str(attr: impl Into<String>) -> Self {
        Self::new(attr, OptionKind::Str)
    }

    pub fn int(attr: impl Into<String>) -> Self {
        Self::new(attr, OptionKind::Int)
    }

    pub fn float(attr: impl Into<String>) -> Self {
        Self::new(attr, OptionKind::Float)
    }

    pub fn bool(attr: impl Into<String>) -> Self {
        Self::new(attr, OptionKind::Bool)
    }

    pub fn list(attr: impl Into<String>) -> Self {
        Self::new(attr, OptionKind::List)
    }

    /// Overrides the external name derived from the attribute name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_default(mut self, value: impl Into<OptionValue>) -> Self {
        self.default = OptionDefault::Value(value.into());
        self
    }

    /// Sets a default computed when the option is registered, so generic
    /// tasks can derive it from their type parameters' constants.
    pub fn with_late_default<F>(mut self, default: F) -> Self
    where
        F: Fn() -> Option<OptionValue> + Send + Sync + 'static,
    {
        self.default = OptionDefault::Late(Arc::new(default));
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// The attribute name this option was declared under.
    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.attr)
    }

    pub fn kind(&self) -> OptionKind {
        self.kind
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub(crate) fn evaluate_default(&self) -> Option<OptionValue> {
        match &self.default {
            OptionDefault::None => None,
            OptionDefault::Value(v) => Some(v.clone()),
            OptionDefault::Late(f) => f(),
        }
    }
}

impl fmt::Debug for OptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionSpec")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Namespaced key of option `name` owned by a task with the given prefix.
///
/// Hyphens in `name` are normalised to underscores; case is preserved.
pub fn option_key(prefix: Option<&str>, name: &str) -> String {
    let name = name.replace('-', "_");
    match prefix {
        Some(prefix) => format!("{prefix}_{name}"),
        None => name,
    }
}

/// Command-line spelling of an option key: `Task_opt_name` → `--Task-opt-name`.
pub fn flag_name(key: &str) -> String {
    format!("--{}", key.replace('_', "-"))
}

#[derive(Debug, Clone)]
struct Entry {
    kind: OptionKind,
    help: Option<String>,
    value: Option<OptionValue>,
}

/// Describes one registered option, e.g. for building a help text.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionInfo {
    pub key: String,
    pub flag: String,
    pub kind: OptionKind,
    pub help: Option<String>,
    pub value: Option<OptionValue>,
}

/// The parsed options namespace shared by a service and all of its tasks.
///
/// Cloning is cheap; clones refer to the same values. A restarted service
/// keeps using the same `Options`.
#[derive(Clone, Default)]
pub struct Options {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec` under `key` with its evaluated default.
    ///
    /// Registering the same key twice fails: two tasks (or a task and the
    /// service) would otherwise fight over one command-line flag.
    pub fn register(&self, key: impl Into<String>, spec: &OptionSpec) -> Result<(), ConfigError> {
        let key = key.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return Err(ConfigError::DuplicateOption(flag_name(&key)));
        }
        entries.insert(
            key,
            Entry {
                kind: spec.kind(),
                help: spec.help().map(str::to_string),
                value: spec.evaluate_default(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Returns the coerced value of `key`, `None` if it has no value.
    pub fn get(&self, key: &str) -> Result<Option<OptionValue>, OptionError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(key)
            .ok_or_else(|| OptionError::Unknown(key.to_string()))?;
        match &entry.value {
            None => Ok(None),
            Some(value) => entry.kind.coerce(key, value.clone()).map(Some),
        }
    }

    /// Coerces `value` to the registered kind of `key` and stores it.
    pub fn set(&self, key: &str, value: impl Into<OptionValue>) -> Result<(), OptionError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| OptionError::Unknown(key.to_string()))?;
        entry.value = Some(entry.kind.coerce(key, value.into())?);
        Ok(())
    }

    /// Stores a value given in its textual form, as read from a flag.
    pub fn set_str(&self, key: &str, text: &str) -> Result<(), OptionError> {
        self.set(key, OptionValue::Str(text.to_string()))
    }

    /// Removes the value of `key`, leaving it registered.
    pub fn clear(&self, key: &str) -> Result<(), OptionError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| OptionError::Unknown(key.to_string()))?;
        entry.value = None;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Option<OptionValue>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn describe(&self) -> Vec<OptionInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, e)| OptionInfo {
                key: k.clone(),
                flag: flag_name(k),
                kind: e.kind,
                help: e.help.clone(),
                value: e.value.clone(),
            })
            .collect()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
