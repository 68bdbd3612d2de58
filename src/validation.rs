//! Pre-flight Validation
//!
//! Checks a mapping against the schema and the data files before anything is
//! written. Errors block the load, warnings are only reported.

use crate::config::{ConceptGetter, GeneratorUnit, LoaderConfig, MutationDefinition, OwnershipSpec, PlayerSpec};
use crate::reader::{get_header, header_index};
use crate::schema::{ConceptKind, Schema};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, unit: &str, message: impl fmt::Display) {
        self.errors.push(format!("[{}] {}", unit, message));
    }

    fn warning(&mut self, unit: &str, message: impl fmt::Display) {
        self.warnings.push(format!("[{}] {}", unit, message));
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for w in &self.warnings {
            writeln!(f, "WARNING {}", w)?;
        }
        for e in &self.errors {
            writeln!(f, "ERROR   {}", e)?;
        }
        write!(f, "{} error(s), {} warning(s)", self.errors.len(), self.warnings.len())
    }
}

pub fn validate(config: &LoaderConfig, schema: &Schema) -> ValidationReport {
    let mut report = ValidationReport::default();
    match config.schema_path() {
        Some(path) if !path.exists() => report.error("globalConfig", format!("schema file {} not found", path.display())),
        None => report.error("globalConfig", "no schema file configured"),
        _ => {}
    }
    if config.units.is_empty() {
        report.warning("globalConfig", "no generators configured");
    }
    for unit in &config.units {
        if config.global.ignore_generators.contains(&unit.key) {
            continue;
        }
        check_files(config, unit, &mut report);
        check_definition(schema, unit, &mut report);
    }
    report
}

fn check_files(config: &LoaderConfig, unit: &GeneratorUnit, report: &mut ValidationReport) {
    if let Err(e) = config.rows_per_commit_for(unit) {
        report.error(&unit.key, e);
    }
    let separator = match config.separator_for(unit) {
        Ok(sep) => sep,
        Err(e) => {
            report.error(&unit.key, e);
            return;
        }
    };
    if unit.data_paths.is_empty() {
        report.warning(&unit.key, "no data files");
    }
    let columns = unit.definition.columns();
    for path in &unit.data_paths {
        if !path.exists() {
            report.error(&unit.key, format!("data file {} not found", path.display()));
            continue;
        }
        match get_header(path, separator) {
            Ok(header) => {
                let index = header_index(&header);
                for column in columns.iter().filter(|c| !index.contains_key(**c)) {
                    report.error(
                        &unit.key,
                        format!("column '{}' is not in the header of {}", column, path.display()),
                    );
                }
            }
            Err(e) => report.error(&unit.key, e),
        }
    }
}

fn expect_kind(schema: &Schema, unit: &str, label: &str, allowed: &[ConceptKind], report: &mut ValidationReport) -> bool {
    match schema.kind(label) {
        None => {
            report.error(unit, format!("type '{}' is not defined in the schema", label));
            false
        }
        Some(kind) if !allowed.contains(&kind) => {
            let expected: Vec<String> = allowed.iter().map(|k| k.to_string()).collect();
            report.error(
                unit,
                format!("type '{}' is a {}, expected {}", label, kind, expected.join(" or ")),
            );
            false
        }
        Some(_) => true,
    }
}

fn check_ownerships(
    schema: &Schema,
    unit: &str,
    owner: Option<&str>,
    ownerships: &[OwnershipSpec],
    report: &mut ValidationReport,
) {
    for spec in ownerships {
        if !expect_kind(schema, unit, &spec.attribute, &[ConceptKind::Attribute], report) {
            continue;
        }
        if let Some(owner) = owner {
            if schema.contains(owner) && !schema.owns(owner, &spec.attribute) {
                report.warning(unit, format!("'{}' does not declare ownership of '{}'", owner, spec.attribute));
            }
        }
    }
}

fn check_definition(schema: &Schema, unit: &GeneratorUnit, report: &mut ValidationReport) {
    let key = unit.key.as_str();
    match &unit.definition {
        MutationDefinition::Attribute(spec) => {
            check_ownerships(schema, key, None, std::slice::from_ref(spec), report);
        }
        MutationDefinition::Entity { entity, ownerships } => {
            expect_kind(schema, key, entity, &[ConceptKind::Entity], report);
            if ownerships.is_empty() {
                report.error(key, format!("entity '{}' has no ownerships to insert", entity));
            }
            check_ownerships(schema, key, Some(entity), ownerships, report);
        }
        MutationDefinition::Relation {
            relation,
            ownerships,
            players,
        } => {
            expect_kind(schema, key, relation, &[ConceptKind::Relation], report);
            if players.is_empty() {
                report.error(key, format!("relation '{}' has no players", relation));
            }
            check_ownerships(schema, key, Some(relation), ownerships, report);
            check_players(schema, key, relation, players, report);
        }
        MutationDefinition::AppendAttribute { target, ownerships } => {
            expect_kind(schema, key, &target.type_label, &[ConceptKind::Entity, ConceptKind::Relation], report);
            check_ownerships(schema, key, Some(&target.type_label), &target.ownerships, report);
            check_ownerships(schema, key, Some(&target.type_label), ownerships, report);
        }
        MutationDefinition::AppendOrInsert { target, ownerships } => {
            // the insert fallback creates the thing without role players
            expect_kind(schema, key, &target.type_label, &[ConceptKind::Entity], report);
            check_ownerships(schema, key, Some(&target.type_label), &target.ownerships, report);
            check_ownerships(schema, key, Some(&target.type_label), ownerships, report);
        }
    }
}

fn check_players(schema: &Schema, unit: &str, relation: &str, players: &[PlayerSpec], report: &mut ValidationReport) {
    for player in players {
        if schema.contains(relation) && !schema.relates(relation, &player.role) {
            report.error(unit, format!("relation '{}' does not relate role '{}'", relation, player.role));
        }
        let label = player.getter.type_label();
        if schema.contains(label) && schema.contains(relation) && !schema.plays(label, relation, &player.role) {
            report.warning(unit, format!("'{}' does not declare that it plays {}:{}", label, relation, player.role));
        }
        check_getter(schema, unit, &player.getter, report);
    }
}

fn check_getter(schema: &Schema, unit: &str, getter: &ConceptGetter, report: &mut ValidationReport) {
    match getter {
        ConceptGetter::Attribute { spec } => {
            expect_kind(schema, unit, &spec.attribute, &[ConceptKind::Attribute], report);
        }
        ConceptGetter::Ownerships {
            type_label,
            ownerships,
        } => {
            expect_kind(schema, unit, type_label, &[ConceptKind::Entity, ConceptKind::Relation], report);
            check_ownerships(schema, unit, Some(type_label), ownerships, report);
        }
        ConceptGetter::Players { type_label, players } => {
            if expect_kind(schema, unit, type_label, &[ConceptKind::Relation], report) {
                check_players(schema, unit, type_label, players, report);
            }
        }
    }
}
