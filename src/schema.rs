//! Schema Model
//!
//! Reads TypeQL `define` files into a type hierarchy that answers the
//! questions the loader asks: does a type exist, what kind is it, which value
//! type does an attribute carry, and which ownerships / roles are declared.

use crate::error::{LoaderError, Result};
use crate::query::ValueType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConceptKind {
    Entity,
    Relation,
    Attribute,
}

impl fmt::Display for ConceptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConceptKind::Entity => write!(f, "entity"),
            ConceptKind::Relation => write!(f, "relation"),
            ConceptKind::Attribute => write!(f, "attribute"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeDef {
    pub label: String,
    pub parent: String,
    pub is_abstract: bool,
    pub value_type: Option<ValueType>,
    pub owns: BTreeSet<String>,
    /// (relation, role)
    pub plays: BTreeSet<(String, String)>,
    pub relates: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    types: BTreeMap<String, TypeDef>,
}

const ROOTS: [(&str, ConceptKind); 3] = [
    ("entity", ConceptKind::Entity),
    ("relation", ConceptKind::Relation),
    ("attribute", ConceptKind::Attribute),
];

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut schema = Self::new();
        schema.define(text)?;
        Ok(schema)
    }

    /// Add the statements of a `define` block. Redefining a type merges its clauses.
    pub fn define(&mut self, text: &str) -> Result<()> {
        for statement in split_statements(&strip_comments(text)) {
            let mut statement = statement.trim();
            if let Some(("define", rest)) = statement.split_once(char::is_whitespace) {
                statement = rest.trim();
            } else if statement == "define" {
                continue;
            }
            if statement.is_empty() || statement.starts_with("rule ") {
                continue;
            }
            self.define_statement(statement)?;
        }
        for def in self.types.values() {
            if self.kind(&def.label).is_none() {
                return Err(LoaderError::Schema(format!(
                    "type '{}' does not descend from entity, relation or attribute",
                    def.label
                )));
            }
        }
        Ok(())
    }

    fn define_statement(&mut self, statement: &str) -> Result<()> {
        let mut clauses = statement.split(',').map(str::trim);
        let head = clauses.next().unwrap_or_default();
        let mut words = head.split_whitespace();
        let (label, keyword, parent) = (words.next(), words.next(), words.next());
        let (Some(label), Some("sub"), Some(parent)) = (label, keyword, parent) else {
            return Err(LoaderError::Schema(format!(
                "expected '<label> sub <parent>' in '{}'",
                statement
            )));
        };

        let def = self.types.entry(label.to_string()).or_insert_with(|| TypeDef {
            label: label.to_string(),
            ..TypeDef::default()
        });
        def.parent = parent.to_string();

        for clause in clauses {
            let mut words = clause.split_whitespace().filter(|w| !w.starts_with('@'));
            match (words.next(), words.next()) {
                (Some("abstract"), None) => def.is_abstract = true,
                (Some("value"), Some(vt)) => {
                    def.value_type = Some(vt.parse().map_err(LoaderError::Schema)?);
                }
                (Some("owns"), Some(attr)) => {
                    def.owns.insert(attr.to_string());
                }
                (Some("relates"), Some(role)) => {
                    def.relates.insert(role.to_string());
                }
                (Some("plays"), Some(scoped)) => {
                    let (rel, role) = scoped.split_once(':').ok_or_else(|| {
                        LoaderError::Schema(format!("role '{}' must be written relation:role", scoped))
                    })?;
                    def.plays.insert((rel.to_string(), role.to_string()));
                }
                (None, _) => {}
                _ => {
                    return Err(LoaderError::Schema(format!(
                        "unsupported clause '{}' for type '{}'",
                        clause, label
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.types.contains_key(label)
    }

    pub fn get(&self, label: &str) -> Option<&TypeDef> {
        self.types.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Supertypes starting with the type itself, ending with a root label
    fn lineage<'a>(&'a self, label: &'a str) -> Vec<&'a str> {
        let mut chain = vec![label];
        let mut current = label;
        while let Some(def) = self.types.get(current) {
            if chain.len() > self.types.len() + 1 {
                break;
            }
            current = def.parent.as_str();
            chain.push(current);
        }
        chain
    }

    pub fn kind(&self, label: &str) -> Option<ConceptKind> {
        let root = *self.lineage(label).last()?;
        ROOTS.iter().find(|(name, _)| *name == root).map(|(_, kind)| *kind)
    }

    pub fn is_subtype(&self, label: &str, ancestor: &str) -> bool {
        self.lineage(label).contains(&ancestor)
    }

    pub fn value_type(&self, label: &str) -> Option<ValueType> {
        self.lineage(label)
            .into_iter()
            .find_map(|l| self.types.get(l).and_then(|d| d.value_type))
    }

    pub fn owns(&self, label: &str, attribute: &str) -> bool {
        self.lineage(label)
            .into_iter()
            .filter_map(|l| self.types.get(l))
            .any(|d| d.owns.contains(attribute))
    }

    pub fn relates(&self, relation: &str, role: &str) -> bool {
        self.lineage(relation)
            .into_iter()
            .filter_map(|l| self.types.get(l))
            .any(|d| d.relates.contains(role))
    }

    pub fn plays(&self, label: &str, relation: &str, role: &str) -> bool {
        let relations = self.lineage(relation);
        self.lineage(label)
            .into_iter()
            .filter_map(|l| self.types.get(l))
            .any(|d| {
                d.plays
                    .iter()
                    .any(|(rel, r)| r == role && relations.contains(&rel.as_str()))
            })
    }
}

fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split at `;` outside of braces, so rule bodies stay in one statement
fn split_statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ';' if depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}
