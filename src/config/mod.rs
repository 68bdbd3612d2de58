//! Mapping Model
//!
//! Loads the JSON mapping file: global defaults plus one map per generator kind.
//! Every unit is normalized into a [`GeneratorUnit`] carrying exactly one of
//! five mutation definitions.

pub mod getter;

pub use getter::{ConceptGetter, OwnershipSpec, PlayerSpec, Preprocessor};

use crate::error::{LoaderError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry settings for batches that retry on transient store errors
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 20,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub rows_per_commit: Option<usize>,
    #[serde(default, alias = "parallelisation")]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub queue_multiplier: Option<usize>,
    #[serde(default)]
    pub ordered_before_generators: Vec<String>,
    #[serde(default)]
    pub ordered_after_generators: Vec<String>,
    #[serde(default)]
    pub ignore_generators: Vec<String>,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub progress_interval: Option<usize>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-unit overrides of the global batching settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOverrides {
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub rows_per_commit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UnitJson<I, M = ()> {
    data: Vec<String>,
    #[serde(default)]
    config: Option<UnitOverrides>,
    insert: I,
    #[serde(rename = "match")]
    match_spec: Option<M>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityInsertJson {
    entity: String,
    #[serde(default)]
    ownerships: Vec<OwnershipSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationInsertJson {
    relation: String,
    #[serde(default)]
    ownerships: Vec<OwnershipSpec>,
    #[serde(default)]
    players: Vec<PlayerSpec>,
}

#[derive(Debug, Deserialize)]
struct AppendMatchJson {
    #[serde(rename = "type")]
    type_label: String,
    #[serde(default)]
    ownerships: Vec<OwnershipSpec>,
}

#[derive(Debug, Deserialize)]
struct AppendInsertJson {
    #[serde(default)]
    ownerships: Vec<OwnershipSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    global_config: GlobalConfig,
    #[serde(default)]
    attributes: BTreeMap<String, UnitJson<OwnershipSpec>>,
    #[serde(default)]
    entities: BTreeMap<String, UnitJson<EntityInsertJson>>,
    #[serde(default)]
    relations: BTreeMap<String, UnitJson<RelationInsertJson>>,
    #[serde(default)]
    append_attribute: BTreeMap<String, UnitJson<AppendInsertJson, AppendMatchJson>>,
    #[serde(default)]
    append_attribute_or_insert_thing: BTreeMap<String, UnitJson<AppendInsertJson, AppendMatchJson>>,
}

/// Generator kinds, in default load order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GeneratorKind {
    Attribute,
    Entity,
    Relation,
    AppendAttribute,
    AppendOrInsert,
}

impl GeneratorKind {
    pub const ALL: [GeneratorKind; 5] = [
        GeneratorKind::Attribute,
        GeneratorKind::Entity,
        GeneratorKind::Relation,
        GeneratorKind::AppendAttribute,
        GeneratorKind::AppendOrInsert,
    ];
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeneratorKind::Attribute => "attributes",
            GeneratorKind::Entity => "entities",
            GeneratorKind::Relation => "relations",
            GeneratorKind::AppendAttribute => "appendAttribute",
            GeneratorKind::AppendOrInsert => "appendAttributeOrInsertThing",
        };
        write!(f, "{}", name)
    }
}

/// Match part of append generators: the owning thing and its identifying ownerships
#[derive(Debug, Clone)]
pub struct ThingMatch {
    pub type_label: String,
    pub ownerships: Vec<OwnershipSpec>,
}

/// The five mutation shapes
#[derive(Debug, Clone)]
pub enum MutationDefinition {
    Attribute(OwnershipSpec),
    Entity {
        entity: String,
        ownerships: Vec<OwnershipSpec>,
    },
    Relation {
        relation: String,
        ownerships: Vec<OwnershipSpec>,
        players: Vec<PlayerSpec>,
    },
    AppendAttribute {
        target: ThingMatch,
        ownerships: Vec<OwnershipSpec>,
    },
    AppendOrInsert {
        target: ThingMatch,
        ownerships: Vec<OwnershipSpec>,
    },
}

impl MutationDefinition {
    pub fn kind(&self) -> GeneratorKind {
        match self {
            MutationDefinition::Attribute(_) => GeneratorKind::Attribute,
            MutationDefinition::Entity { .. } => GeneratorKind::Entity,
            MutationDefinition::Relation { .. } => GeneratorKind::Relation,
            MutationDefinition::AppendAttribute { .. } => GeneratorKind::AppendAttribute,
            MutationDefinition::AppendOrInsert { .. } => GeneratorKind::AppendOrInsert,
        }
    }

    /// Every ownership spec the definition reads, including those nested in player getters
    pub fn ownership_specs(&self) -> Vec<&OwnershipSpec> {
        match self {
            MutationDefinition::Attribute(spec) => vec![spec],
            MutationDefinition::Entity { ownerships, .. } => ownerships.iter().collect(),
            MutationDefinition::Relation {
                ownerships, players, ..
            } => {
                let mut specs: Vec<&OwnershipSpec> = ownerships.iter().collect();
                for player in players {
                    specs.extend(player.getter.ownership_specs());
                }
                specs
            }
            MutationDefinition::AppendAttribute { target, ownerships }
            | MutationDefinition::AppendOrInsert { target, ownerships } => {
                target.ownerships.iter().chain(ownerships.iter()).collect()
            }
        }
    }

    /// Columns the definition reads, deduplicated, in first-use order
    pub fn columns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.ownership_specs()
            .into_iter()
            .map(|spec| spec.column.as_str())
            .filter(|column| seen.insert(*column))
            .collect()
    }
}

/// One named unit of work
#[derive(Debug, Clone)]
pub struct GeneratorUnit {
    pub key: String,
    pub data_paths: Vec<PathBuf>,
    pub overrides: UnitOverrides,
    pub definition: MutationDefinition,
}

impl GeneratorUnit {
    pub fn kind(&self) -> GeneratorKind {
        self.definition.kind()
    }
}

/// Parsed mapping configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub global: GlobalConfig,
    pub units: Vec<GeneratorUnit>,
    /// Directory relative paths resolve against
    pub base_dir: PathBuf,
}

impl LoaderConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoaderError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_json(&text, base_dir)
    }

    pub fn from_json(json: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)
            .map_err(|e| LoaderError::Config(format!("Failed to parse mapping config: {}", e)))?;
        let base_dir = base_dir.into();
        let resolve = |paths: Vec<String>| -> Vec<PathBuf> {
            paths.into_iter().map(|p| resolve_path(&base_dir, &p)).collect()
        };

        let mut units = Vec::new();
        for (key, unit) in file.attributes {
            units.push(GeneratorUnit {
                key,
                data_paths: resolve(unit.data),
                overrides: unit.config.unwrap_or_default(),
                definition: MutationDefinition::Attribute(unit.insert),
            });
        }
        for (key, unit) in file.entities {
            units.push(GeneratorUnit {
                key,
                data_paths: resolve(unit.data),
                overrides: unit.config.unwrap_or_default(),
                definition: MutationDefinition::Entity {
                    entity: unit.insert.entity,
                    ownerships: unit.insert.ownerships,
                },
            });
        }
        for (key, unit) in file.relations {
            units.push(GeneratorUnit {
                key,
                data_paths: resolve(unit.data),
                overrides: unit.config.unwrap_or_default(),
                definition: MutationDefinition::Relation {
                    relation: unit.insert.relation,
                    ownerships: unit.insert.ownerships,
                    players: unit.insert.players,
                },
            });
        }
        for (append_kind, map) in [
            (GeneratorKind::AppendAttribute, file.append_attribute),
            (GeneratorKind::AppendOrInsert, file.append_attribute_or_insert_thing),
        ] {
            for (key, unit) in map {
                let target = unit.match_spec.ok_or_else(|| {
                    LoaderError::Config(format!("generator '{}' has no 'match' block", key))
                })?;
                if target.ownerships.is_empty() {
                    return Err(LoaderError::Config(format!(
                        "generator '{}' must match on at least one ownership",
                        key
                    )));
                }
                let target = ThingMatch {
                    type_label: target.type_label,
                    ownerships: target.ownerships,
                };
                let ownerships = unit.insert.ownerships;
                let definition = if append_kind == GeneratorKind::AppendAttribute {
                    MutationDefinition::AppendAttribute { target, ownerships }
                } else {
                    MutationDefinition::AppendOrInsert { target, ownerships }
                };
                units.push(GeneratorUnit {
                    key,
                    data_paths: resolve(unit.data),
                    overrides: unit.config.unwrap_or_default(),
                    definition,
                });
            }
        }

        let config = Self {
            global: file.global_config,
            units,
            base_dir,
        };
        config.check_generator_names()?;
        Ok(config)
    }

    fn check_generator_names(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for unit in &self.units {
            if !keys.insert(unit.key.as_str()) {
                return Err(LoaderError::Config(format!(
                    "generator key '{}' is used more than once",
                    unit.key
                )));
            }
        }
        let lists = [
            ("orderedBeforeGenerators", &self.global.ordered_before_generators),
            ("orderedAfterGenerators", &self.global.ordered_after_generators),
            ("ignoreGenerators", &self.global.ignore_generators),
        ];
        for (list_name, names) in lists {
            for name in names {
                if !keys.contains(name.as_str()) {
                    return Err(LoaderError::Config(format!(
                        "{} names unknown generator '{}'",
                        list_name, name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn unit(&self, key: &str) -> Option<&GeneratorUnit> {
        self.units.iter().find(|u| u.key == key)
    }

    pub fn schema_path(&self) -> Option<PathBuf> {
        self.global.schema.as_deref().map(|p| resolve_path(&self.base_dir, p))
    }

    pub fn log_directory(&self) -> PathBuf {
        match &self.global.log_directory {
            Some(dir) => resolve_path(&self.base_dir, dir),
            None => self.base_dir.join("loader-logs"),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.global
            .parallelism
            .filter(|w| *w > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    pub fn queue_capacity(&self) -> usize {
        self.parallelism() * self.global.queue_multiplier.filter(|m| *m > 0).unwrap_or(4)
    }

    pub fn progress_interval(&self) -> usize {
        self.global.progress_interval.filter(|n| *n > 0).unwrap_or(50_000)
    }

    /// Separator for a unit: unit override, else the global default
    pub fn separator_for(&self, unit: &GeneratorUnit) -> Result<char> {
        let raw = unit
            .overrides
            .separator
            .as_deref()
            .or(self.global.separator.as_deref())
            .ok_or_else(|| {
                LoaderError::Config(format!("no separator configured for generator '{}'", unit.key))
            })?;
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => Ok(c),
            _ => Err(LoaderError::Config(format!(
                "separator '{}' of generator '{}' must be a single ASCII character",
                raw.escape_default(),
                unit.key
            ))),
        }
    }

    /// Rows per transaction for a unit: unit override, else the global default
    pub fn rows_per_commit_for(&self, unit: &GeneratorUnit) -> Result<usize> {
        match unit.overrides.rows_per_commit.or(self.global.rows_per_commit) {
            Some(0) => Err(LoaderError::Config(format!(
                "rowsPerCommit of generator '{}' must be positive",
                unit.key
            ))),
            Some(n) => Ok(n),
            None => Err(LoaderError::Config(format!(
                "no rowsPerCommit configured for generator '{}'",
                unit.key
            ))),
        }
    }
}

fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r####"{
        "globalConfig": {
            "separator": ",",
            "rowsPerCommit": 50,
            "parallelisation": 3,
            "schema": "schema.gql",
            "orderedAfterGenerators": ["in-use"]
        },
        "attributes": {
            "is-in-use": {
                "data": ["is-in-use.csv"],
                "insert": {"attribute": "is-in-use", "column": "values", "required": true}
            }
        },
        "entities": {
            "person": {
                "data": ["person.csv", "/abs/person2.csv.gz"],
                "config": {"separator": "\t", "rowsPerCommit": 10},
                "insert": {
                    "entity": "person",
                    "ownerships": [
                        {"attribute": "phone-number", "column": "phone_number", "required": true},
                        {"attribute": "nick-name", "column": "nick_name", "listSeparator": "###"}
                    ]
                }
            }
        },
        "relations": {
            "in-use": {
                "data": ["in-use.csv"],
                "insert": {
                    "relation": "in-use",
                    "players": [
                        {"role": "status", "required": true,
                         "match": {"type": "is-in-use", "attribute": {"column": "in_use"}}},
                        {"role": "account", "required": true,
                         "match": {"type": "phone-number", "attribute": {"column": "phone_number"}}}
                    ]
                }
            }
        },
        "appendAttribute": {
            "append-twitter": {
                "data": ["twitter.csv"],
                "match": {"type": "person", "ownerships": [
                    {"attribute": "phone-number", "column": "phone_number", "required": true}]},
                "insert": {"ownerships": [
                    {"attribute": "twitter-username", "column": "twitter", "required": true}]}
            }
        }
    }"####;

    #[test]
    fn test_load_units() {
        let config = LoaderConfig::from_json(CONFIG, "/data").unwrap();
        assert_eq!(config.units.len(), 4);
        assert_eq!(config.parallelism(), 3);
        assert_eq!(config.queue_capacity(), 12);
        assert_eq!(config.schema_path(), Some(PathBuf::from("/data/schema.gql")));

        let person = config.unit("person").unwrap();
        assert_eq!(person.kind(), GeneratorKind::Entity);
        assert_eq!(
            person.data_paths,
            vec![PathBuf::from("/data/person.csv"), PathBuf::from("/abs/person2.csv.gz")]
        );
        assert_eq!(config.separator_for(person).unwrap(), '\t');
        assert_eq!(config.rows_per_commit_for(person).unwrap(), 10);

        let attr = config.unit("is-in-use").unwrap();
        assert_eq!(config.separator_for(attr).unwrap(), ',');
        assert_eq!(config.rows_per_commit_for(attr).unwrap(), 50);

        let in_use = config.unit("in-use").unwrap();
        assert_eq!(in_use.definition.columns(), vec!["in_use", "phone_number"]);
    }

    #[test]
    fn test_unresolved_separator_is_config_error() {
        let json = CONFIG.replace("\"separator\": \",\",", "");
        let config = LoaderConfig::from_json(&json, "/data").unwrap();
        let attr = config.unit("is-in-use").unwrap();
        let err = config.separator_for(attr).unwrap_err();
        assert!(err.is_configuration());
        // the unit override still resolves
        assert_eq!(config.separator_for(config.unit("person").unwrap()).unwrap(), '\t');
    }

    #[test]
    fn test_unknown_ordered_generator_is_rejected() {
        let json = CONFIG.replace("\"orderedAfterGenerators\": [\"in-use\"]", "\"ignoreGenerators\": [\"nope\"]");
        let err = LoaderConfig::from_json(&json, "/data").unwrap_err();
        assert!(err.to_string().contains("unknown generator 'nope'"));
    }

    #[test]
    fn test_append_without_match_is_rejected() {
        let json = r#"{"globalConfig": {}, "appendAttribute": {
            "a": {"data": ["x.csv"], "insert": {"ownerships": []}}}}"#;
        assert!(LoaderConfig::from_json(json, ".").is_err());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 500,
            max_attempts: 5,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for(4), Duration::from_millis(500));
    }
}
