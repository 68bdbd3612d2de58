//! Statement Generator
//!
//! Pure mapping from one tokenized row plus a mutation definition to the
//! mutation statement for that row. Nothing here talks to the store.

pub mod append;
pub mod coerce;
pub mod insert;
pub mod resolve;

use crate::config::MutationDefinition;
use crate::query::{InsertQuery, MatchInsertQuery, ValueType};
use crate::reader::{Field, HeaderIndex};
use std::fmt;

/// One row of one data file while its statement is generated
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub file: &'a str,
    /// 1-based line number in the source file
    pub line_no: usize,
    pub fields: &'a [Field],
    pub header: &'a HeaderIndex,
}

impl<'a> RowContext<'a> {
    pub fn new(file: &'a str, line_no: usize, fields: &'a [Field], header: &'a HeaderIndex) -> Self {
        Self {
            file,
            line_no,
            fields,
            header,
        }
    }

    /// Raw cell of `column`; `None` for null tokens, short rows and unknown columns
    pub fn cell(&self, column: &str) -> Option<&'a str> {
        let idx = *self.header.get(column)?;
        self.fields.get(idx)?.as_deref()
    }
}

/// A cell that could not be coerced to its attribute's value type
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnTypeIssue {
    pub column: String,
    pub attribute: String,
    pub value_type: ValueType,
    pub token: String,
}

impl fmt::Display for ColumnTypeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column '{}': '{}' is not a valid {} value for attribute '{}'",
            self.column, self.token, self.value_type, self.attribute
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(InsertQuery),
    MatchInsert(MatchInsertQuery),
    /// Append to an existing thing, else insert it. `append` is `None` when the
    /// identifying columns are empty and only the insert form can be built; its
    /// insert part is empty when the row has nothing to append.
    AppendOrInsert {
        append: Option<MatchInsertQuery>,
        insert: InsertQuery,
    },
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Insert(q) => write!(f, "{}", q),
            Mutation::MatchInsert(q) => write!(f, "{}", q),
            Mutation::AppendOrInsert {
                append: Some(append),
                insert,
            } => write!(f, "{} | {}", append, insert),
            Mutation::AppendOrInsert { append: None, insert } => write!(f, "{}", insert),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedStatement {
    pub mutation: Mutation,
    pub validity: Validity,
}

impl GeneratedStatement {
    fn new(mutation: Mutation, invalid: Option<String>) -> Self {
        let validity = match invalid {
            Some(reason) => Validity::Invalid(reason),
            None => Validity::Valid,
        };
        Self { mutation, validity }
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        match &self.validity {
            Validity::Valid => None,
            Validity::Invalid(reason) => Some(reason),
        }
    }
}

/// Build the statement for one row. Column-type problems are pushed to `issues`
/// and never stop the row.
pub fn generate(
    definition: &MutationDefinition,
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    match definition {
        MutationDefinition::Attribute(spec) => insert::attribute_statement(spec, row, issues),
        MutationDefinition::Entity { entity, ownerships } => {
            insert::entity_statement(entity, ownerships, row, issues)
        }
        MutationDefinition::Relation {
            relation,
            ownerships,
            players,
        } => insert::relation_statement(relation, ownerships, players, row, issues),
        MutationDefinition::AppendAttribute { target, ownerships } => {
            append::append_statement(target, ownerships, row, issues)
        }
        MutationDefinition::AppendOrInsert { target, ownerships } => {
            append::append_or_insert_statement(target, ownerships, row, issues)
        }
    }
}
