//! Append statements: add ownerships to a thing located by its own ownerships,
//! optionally falling back to inserting that thing.

use crate::config::{OwnershipSpec, ThingMatch};
use crate::generator::insert::push_ownerships;
use crate::generator::{ColumnTypeIssue, GeneratedStatement, Mutation, RowContext};
use crate::query::{InsertQuery, MatchInsertQuery, ThingPattern, Var};

fn thing_var() -> Var {
    Var::new("thing")
}

/// Match clause locating the append target, or why it cannot be built
fn target_pattern(
    target: &ThingMatch,
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> Result<ThingPattern, String> {
    let mut pattern = ThingPattern::isa(thing_var(), target.type_label.clone());
    if let Some(problem) = push_ownerships(&mut pattern, &target.ownerships, row, issues) {
        return Err(problem);
    }
    if pattern.has.is_empty() {
        return Err(format!("no identifying ownership value for '{}'", target.type_label));
    }
    Ok(pattern)
}

fn appended_ownerships(
    ownerships: &[OwnershipSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> (ThingPattern, Option<String>) {
    let mut pattern = ThingPattern::bound(thing_var());
    let mut invalid = push_ownerships(&mut pattern, ownerships, row, issues);
    if invalid.is_none() && pattern.has.is_empty() {
        invalid = Some("no ownership to append has a value".to_string());
    }
    (pattern, invalid)
}

pub fn append_statement(
    target: &ThingMatch,
    ownerships: &[OwnershipSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    let (matched, target_problem) = match target_pattern(target, row, issues) {
        Ok(pattern) => (pattern, None),
        Err(problem) => (ThingPattern::isa(thing_var(), target.type_label.clone()), Some(problem)),
    };
    let (appended, append_problem) = appended_ownerships(ownerships, row, issues);
    let query = MatchInsertQuery {
        matches: vec![matched],
        insert: vec![appended],
    };
    GeneratedStatement::new(Mutation::MatchInsert(query), target_problem.or(append_problem))
}

pub fn append_or_insert_statement(
    target: &ThingMatch,
    ownerships: &[OwnershipSpec],
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> GeneratedStatement {
    // issues are collected once, from the insert form, which reads every column
    let mut scratch = Vec::new();
    let append = target_pattern(target, row, &mut scratch).ok().map(|matched| {
        // matched even when the row has nothing to append
        let (appended, _) = appended_ownerships(ownerships, row, &mut scratch);
        MatchInsertQuery {
            matches: vec![matched],
            insert: if appended.has.is_empty() { Vec::new() } else { vec![appended] },
        }
    });

    let mut thing = ThingPattern::isa(thing_var(), target.type_label.clone());
    let mut identifying = target.ownerships.clone();
    for spec in identifying.iter_mut() {
        // an empty identifying column sends the row to the insert path instead of failing it
        spec.required = false;
    }
    push_ownerships(&mut thing, &identifying, row, issues);
    let mut invalid = push_ownerships(&mut thing, ownerships, row, issues);
    if invalid.is_none() && thing.has.is_empty() {
        invalid = Some(format!("no ownership of '{}' has a value", target.type_label));
    }

    let mutation = Mutation::AppendOrInsert {
        append,
        insert: InsertQuery { insert: vec![thing] },
    };
    GeneratedStatement::new(mutation, invalid)
}
