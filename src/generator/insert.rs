//! Attribute, entity and relation insert statements.

use crate::config::{OwnershipSpec, PlayerSpec};
use crate::generator::coerce::ownership_values;
use crate::generator::resolve::resolve_getter;
use crate::generator::{ColumnTypeIssue, GeneratedStatement, Mutation, RowContext};
use crate::query::{InsertQuery, MatchInsertQuery, ThingPattern, Var};

/// Adds the ownerships to `pattern`; returns the first problem that makes the row invalid
pub(crate) fn push_ownerships(
    pattern: &mut ThingPattern,
    ownerships: &[OwnershipSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> Option<String> {
    let mut invalid = None;
    for spec in ownerships {
        let values = ownership_values(spec, row, issues);
        if values.is_empty() && spec.required && invalid.is_none() {
            invalid = Some(format!(
                "missing required ownership '{}' (column '{}')",
                spec.attribute, spec.column
            ));
        }
        for value in values {
            pattern.push_has(spec.attribute.clone(), value);
        }
    }
    invalid
}

pub fn attribute_statement(
    spec: &OwnershipSpec,
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    let values = ownership_values(spec, row, issues);
    let base = Var::new("a");
    let single = values.len() == 1;
    let insert = values
        .into_iter()
        .enumerate()
        .map(|(k, value)| {
            let var = if single { base.clone() } else { base.child(k) };
            ThingPattern::attribute(var, spec.attribute.clone(), value)
        })
        .collect::<Vec<_>>();
    let invalid = insert
        .is_empty()
        .then(|| format!("no value for attribute '{}' in column '{}'", spec.attribute, spec.column));
    GeneratedStatement::new(Mutation::Insert(InsertQuery { insert }), invalid)
}

pub fn entity_statement(
    entity: &str,
    ownerships: &[OwnershipSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    let mut pattern = ThingPattern::isa(Var::new("e"), entity);
    let mut invalid = push_ownerships(&mut pattern, ownerships, row, issues);
    if invalid.is_none() && pattern.has.is_empty() {
        invalid = Some(format!("no ownership of '{}' has a value", entity));
    }
    GeneratedStatement::new(Mutation::Insert(InsertQuery { insert: vec![pattern] }), invalid)
}

pub fn relation_statement(
    relation: &str,
    ownerships: &[OwnershipSpec],
    players: &[PlayerSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    let mut rel = ThingPattern::isa(Var::new("rel"), relation);
    let mut matches = Vec::new();
    let mut invalid = None;

    for (i, player) in players.iter().enumerate() {
        let var = Var::new(format!("player-{}", i));
        match resolve_getter(&player.getter, &var, row, issues) {
            Ok(resolved) => {
                for v in resolved.vars {
                    rel.push_role_player(player.role.clone(), v);
                }
                matches.extend(resolved.patterns);
            }
            Err(reason) if player.required && invalid.is_none() => {
                invalid = Some(format!("missing required player '{}': {}", player.role, reason));
            }
            Err(_) => {}
        }
    }
    let ownership_problem = push_ownerships(&mut rel, ownerships, row, issues);
    if invalid.is_none() {
        invalid = ownership_problem;
    }
    if invalid.is_none() && rel.role_players.is_empty() {
        invalid = Some(format!("no role player of '{}' could be resolved", relation));
    }

    let query = MatchInsertQuery {
        matches,
        insert: vec![rel],
    };
    GeneratedStatement::new(Mutation::MatchInsert(query), invalid)
}
