//! Tagged value variants and the named-variable store of a script run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;

use crate::lang::random_variable::{Filter, RandomVariable};

/// Discriminant of a [`Value`], used in diagnostics and type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Condition,
    Event,
    Currency,
    Index,
    DayCounter,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "NUMBER",
            Self::Condition => "CONDITION",
            Self::Event => "EVENT",
            Self::Currency => "CURRENCY",
            Self::Index => "INDEX",
            Self::DayCounter => "DAYCOUNTER",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script-level value: a closed sum over the kinds the engine understands.
///
/// Arithmetic is defined only on `Number`; comparisons only between equal
/// kinds. The engine branches on the discriminant before touching payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(RandomVariable),
    Condition(Filter),
    Event(NaiveDate),
    Currency(String),
    Index(String),
    DayCounter(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Number(_) => ValueKind::Number,
            Self::Condition(_) => ValueKind::Condition,
            Self::Event(_) => ValueKind::Event,
            Self::Currency(_) => ValueKind::Currency,
            Self::Index(_) => ValueKind::Index,
            Self::DayCounter(_) => ValueKind::DayCounter,
        }
    }

    /// Equality between same-kind constants, used by type-safe assignment
    /// and `DATEINDEX` lookups. Numbers compare lane-wise.
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.close_enough_all(b),
            (Self::Event(a), Self::Event(b)) => a == b,
            (Self::Currency(a), Self::Currency(b)) => a == b,
            (Self::Index(a), Self::Index(b)) => a == b,
            (Self::DayCounter(a), Self::DayCounter(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(rv) if rv.deterministic() => write!(f, "{}", rv.at(0)),
            Self::Number(rv) => write!(f, "E[{}]", rv.expectation()),
            Self::Condition(c) if c.deterministic() => write!(f, "{}", c.at(0)),
            Self::Condition(_) => write!(f, "<condition>"),
            Self::Event(d) => write!(f, "{d}"),
            Self::Currency(s) | Self::Index(s) | Self::DayCounter(s) => f.write_str(s),
        }
    }
}

/// Named variable store for one evaluation.
///
/// Scalars and arrays live in separate maps; `constants` may not be assigned
/// to and assignments/declarations of `ignore_assignments` names are silently
/// discarded. Externally injected bindings (trade terms, schedules) are
/// loaded before the run and read back out by reporting afterwards.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub scalars: BTreeMap<String, Value>,
    pub arrays: BTreeMap<String, Vec<Value>>,
    pub constants: BTreeSet<String>,
    pub ignore_assignments: BTreeSet<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.scalars.contains_key(name) || self.arrays.contains_key(name)
    }

    /// Injects a scalar binding and marks it constant.
    pub fn bind_constant(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.constants.insert(name.clone());
        self.scalars.insert(name, value);
    }

    /// Injects an array binding and marks it constant.
    pub fn bind_constant_array(&mut self, name: impl Into<String>, values: Vec<Value>) {
        let name = name.into();
        self.constants.insert(name.clone());
        self.arrays.insert(name, values);
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.scalars {
            writeln!(f, "{name} = {value}")?;
        }
        for (name, values) in &self.arrays {
            write!(f, "{name}[{}] = [", values.len())?;
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{v}")?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
