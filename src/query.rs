//! Mutation Queries
//!
//! Structured match / insert patterns produced by the statement generator and
//! executed by a graph store. Every query renders to TypeQL text for logs.

use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Value type of an attribute concept type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueType {
    String,
    Long,
    Double,
    Boolean,
    DateTime,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => write!(f, "string"),
            ValueType::Long => write!(f, "long"),
            ValueType::Double => write!(f, "double"),
            ValueType::Boolean => write!(f, "boolean"),
            ValueType::DateTime => write!(f, "datetime"),
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(ValueType::String),
            "long" => Ok(ValueType::Long),
            "double" => Ok(ValueType::Double),
            "boolean" => Ok(ValueType::Boolean),
            "datetime" => Ok(ValueType::DateTime),
            other => Err(format!("unknown value type '{}'", other)),
        }
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Long(_) => ValueType::Long,
            Value::Double(_) => ValueType::Double,
            Value::Boolean(_) => ValueType::Boolean,
            Value::DateTime(_) => ValueType::DateTime,
        }
    }

    /// Stable key used to deduplicate attribute instances of one type.
    pub fn key(&self) -> String {
        match self {
            Value::Double(d) => format!("{:?}", d),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Value::Long(l) => write!(f, "{}", l),
            Value::Double(d) => {
                let text = d.to_string();
                if text.contains(['.', 'e', 'E']) || !d.is_finite() {
                    write!(f, "{}", text)
                } else {
                    write!(f, "{}.0", text)
                }
            }
            Value::Boolean(b) => write!(f, "{}", b),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3f")),
        }
    }
}

/// Query variable, rendered with a leading `$`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Var(String);

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Fresh variable one level below this one
    pub fn child(&self, index: usize) -> Var {
        Var(format!("{}-{}", self.0, index))
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePlayer {
    pub role: String,
    pub player: Var,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Has {
    pub attribute: String,
    pub value: Value,
}

/// One `$var ... isa type, has ...` statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingPattern {
    pub var: Var,
    /// `None` for statements that only add ownerships to an already bound variable
    pub type_label: Option<String>,
    /// Set for attribute instances, which are identified by their own value
    pub value: Option<Value>,
    pub role_players: Vec<RolePlayer>,
    pub has: Vec<Has>,
}

impl ThingPattern {
    pub fn isa(var: Var, type_label: impl Into<String>) -> Self {
        Self {
            var,
            type_label: Some(type_label.into()),
            value: None,
            role_players: Vec::new(),
            has: Vec::new(),
        }
    }

    pub fn attribute(var: Var, type_label: impl Into<String>, value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::isa(var, type_label)
        }
    }

    /// Ownerships added to a variable bound elsewhere
    pub fn bound(var: Var) -> Self {
        Self {
            var,
            type_label: None,
            value: None,
            role_players: Vec::new(),
            has: Vec::new(),
        }
    }

    pub fn with_has(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.push_has(attribute, value);
        self
    }

    pub fn push_has(&mut self, attribute: impl Into<String>, value: Value) {
        self.has.push(Has {
            attribute: attribute.into(),
            value,
        });
    }

    pub fn push_role_player(&mut self, role: impl Into<String>, player: Var) {
        self.role_players.push(RolePlayer {
            role: role.into(),
            player,
        });
    }
}

impl fmt::Display for ThingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.var)?;
        if !self.role_players.is_empty() {
            let players = self
                .role_players
                .iter()
                .map(|rp| format!("{}: {}", rp.role, rp.player))
                .join(", ");
            write!(f, " ({})", players)?;
        }
        if let Some(value) = &self.value {
            write!(f, " {}", value)?;
        }
        let mut clauses = Vec::new();
        if let Some(label) = &self.type_label {
            clauses.push(format!("isa {}", label));
        }
        clauses.extend(self.has.iter().map(|h| format!("has {} {}", h.attribute, h.value)));
        if !clauses.is_empty() {
            write!(f, " {}", clauses.join(", "))?;
        }
        Ok(())
    }
}

fn write_patterns(f: &mut fmt::Formatter<'_>, keyword: &str, patterns: &[ThingPattern]) -> fmt::Result {
    write!(f, "{}", keyword)?;
    for pattern in patterns {
        write!(f, " {};", pattern)?;
    }
    Ok(())
}

/// Unconditional insert
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsertQuery {
    pub insert: Vec<ThingPattern>,
}

impl fmt::Display for InsertQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_patterns(f, "insert", &self.insert)
    }
}

/// Insert bound to the answers of a match
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchInsertQuery {
    pub matches: Vec<ThingPattern>,
    pub insert: Vec<ThingPattern>,
}

impl fmt::Display for MatchInsertQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_patterns(f, "match", &self.matches)?;
        write!(f, " ")?;
        write_patterns(f, "insert", &self.insert)
    }
}
