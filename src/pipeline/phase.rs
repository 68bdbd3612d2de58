//! Load phases and the stage plan derived from the mapping's override lists.

use crate::config::{GeneratorKind, LoaderConfig};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    OrderedBefore,
    Attributes,
    Entities,
    Relations,
    AppendAttribute,
    AppendOrInsert,
    OrderedAfter,
    Done,
}

impl Phase {
    fn for_kind(kind: GeneratorKind) -> Self {
        match kind {
            GeneratorKind::Attribute => Phase::Attributes,
            GeneratorKind::Entity => Phase::Entities,
            GeneratorKind::Relation => Phase::Relations,
            GeneratorKind::AppendAttribute => Phase::AppendAttribute,
            GeneratorKind::AppendOrInsert => Phase::AppendOrInsert,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "PENDING",
            Phase::OrderedBefore => "ORDERED_BEFORE",
            Phase::Attributes => "ATTRIBUTES",
            Phase::Entities => "ENTITIES",
            Phase::Relations => "RELATIONS",
            Phase::AppendAttribute => "APPEND_ATTRIBUTE",
            Phase::AppendOrInsert => "APPEND_OR_INSERT",
            Phase::OrderedAfter => "ORDERED_AFTER",
            Phase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Units that complete together before the next stage starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub phase: Phase,
    pub unit_keys: Vec<String>,
}

/// Ordered-before units (one stage each), the five kind phases, then ordered-after units
pub fn plan(config: &LoaderConfig) -> Vec<Stage> {
    let global = &config.global;
    let moved: HashSet<&str> = global
        .ordered_before_generators
        .iter()
        .chain(&global.ordered_after_generators)
        .chain(&global.ignore_generators)
        .map(String::as_str)
        .collect();
    let ignored: HashSet<&str> = global.ignore_generators.iter().map(String::as_str).collect();

    let single = |phase: Phase, key: &String| Stage {
        phase,
        unit_keys: vec![key.clone()],
    };
    let mut stages: Vec<Stage> = global
        .ordered_before_generators
        .iter()
        .filter(|k| !ignored.contains(k.as_str()))
        .map(|k| single(Phase::OrderedBefore, k))
        .collect();

    for kind in GeneratorKind::ALL {
        let unit_keys: Vec<String> = config
            .units
            .iter()
            .filter(|u| u.kind() == kind && !moved.contains(u.key.as_str()))
            .map(|u| u.key.clone())
            .collect();
        if !unit_keys.is_empty() {
            stages.push(Stage {
                phase: Phase::for_kind(kind),
                unit_keys,
            });
        }
    }

    stages.extend(
        global
            .ordered_after_generators
            .iter()
            .filter(|k| !ignored.contains(k.as_str()))
            .map(|k| single(Phase::OrderedAfter, k)),
    );
    stages
}
