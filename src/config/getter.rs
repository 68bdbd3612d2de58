//! Concept Resolver Tree
//!
//! Configuration describing how a row locates an existing concept: by the
//! value of an attribute, by the ownerships of an entity / relation, or by the
//! role players of a relation, which are located the same way recursively.

use crate::query::ValueType;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Regex rewrite applied to each exploded cell value before coercion
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "PreprocessorJson")]
pub struct Preprocessor {
    pattern: Regex,
    replacement: String,
}

#[derive(Debug, Deserialize)]
struct PreprocessorJson {
    pattern: String,
    #[serde(default)]
    replacement: String,
}

impl TryFrom<PreprocessorJson> for Preprocessor {
    type Error = String;

    fn try_from(json: PreprocessorJson) -> Result<Self, Self::Error> {
        let pattern = Regex::new(&json.pattern)
            .map_err(|e| format!("invalid preprocessor pattern '{}': {}", json.pattern, e))?;
        Ok(Self {
            pattern,
            replacement: json.replacement,
        })
    }
}

impl Preprocessor {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, String> {
        Self::try_from(PreprocessorJson {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        })
    }

    pub fn apply(&self, token: &str) -> String {
        self.pattern.replace_all(token, self.replacement.as_str()).into_owned()
    }
}

/// Maps one column onto one attribute type
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipSpec {
    pub attribute: String,
    pub column: String,
    #[serde(default)]
    pub list_separator: Option<String>,
    #[serde(default, alias = "preprocessorConfig")]
    pub preprocessor: Option<Preprocessor>,
    #[serde(default)]
    pub required: bool,
    /// Filled once from the store schema before loading starts
    #[serde(skip)]
    value_type: OnceLock<ValueType>,
}

impl OwnershipSpec {
    pub fn new(attribute: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            column: column.into(),
            list_separator: None,
            preprocessor: None,
            required: false,
            value_type: OnceLock::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_list_separator(mut self, separator: impl Into<String>) -> Self {
        self.list_separator = Some(separator.into());
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.value_type.get().copied()
    }

    /// Record the resolved value type. A second call keeps the first value.
    pub fn set_value_type(&self, value_type: ValueType) {
        let _ = self.value_type.set(value_type);
    }

    pub fn with_value_type(self, value_type: ValueType) -> Self {
        self.set_value_type(value_type);
        self
    }
}

/// `attribute` block of an attribute getter; the attribute type is the getter's `type`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeColumnJson {
    column: String,
    #[serde(default)]
    list_separator: Option<String>,
    #[serde(default, alias = "preprocessorConfig")]
    preprocessor: Option<Preprocessor>,
}

#[derive(Debug, Deserialize)]
struct GetterJson {
    #[serde(rename = "type")]
    type_label: String,
    #[serde(default)]
    attribute: Option<AttributeColumnJson>,
    #[serde(default)]
    ownerships: Option<Vec<OwnershipSpec>>,
    #[serde(default)]
    players: Option<Vec<PlayerSpec>>,
}

/// How a concept instance is located
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "GetterJson")]
pub enum ConceptGetter {
    /// An attribute instance identified by its own value
    Attribute { spec: OwnershipSpec },
    /// An entity or relation identified by the values it owns
    Ownerships {
        type_label: String,
        ownerships: Vec<OwnershipSpec>,
    },
    /// A relation identified by its role players
    Players {
        type_label: String,
        players: Vec<PlayerSpec>,
    },
}

impl TryFrom<GetterJson> for ConceptGetter {
    type Error = String;

    fn try_from(json: GetterJson) -> Result<Self, Self::Error> {
        let GetterJson {
            type_label,
            attribute,
            ownerships,
            players,
        } = json;
        match (attribute, ownerships, players) {
            (Some(attr), None, None) => {
                let mut spec = OwnershipSpec::new(type_label, attr.column);
                spec.list_separator = attr.list_separator;
                spec.preprocessor = attr.preprocessor;
                spec.required = true;
                Ok(ConceptGetter::Attribute { spec })
            }
            (None, Some(ownerships), None) if !ownerships.is_empty() => Ok(ConceptGetter::Ownerships {
                type_label,
                ownerships,
            }),
            (None, None, Some(players)) if !players.is_empty() => {
                Ok(ConceptGetter::Players { type_label, players })
            }
            (None, None, None) => Err(format!(
                "match on '{}' needs one of 'attribute', 'ownerships' or 'players'",
                type_label
            )),
            (None, Some(_), None) | (None, None, Some(_)) => Err(format!(
                "match on '{}' has an empty ownership / player list",
                type_label
            )),
            _ => Err(format!(
                "match on '{}' may only use one of 'attribute', 'ownerships' or 'players'",
                type_label
            )),
        }
    }
}

impl ConceptGetter {
    pub fn type_label(&self) -> &str {
        match self {
            ConceptGetter::Attribute { spec } => &spec.attribute,
            ConceptGetter::Ownerships { type_label, .. } => type_label,
            ConceptGetter::Players { type_label, .. } => type_label,
        }
    }

    /// Every ownership spec in this getter subtree, depth first
    pub fn ownership_specs(&self) -> Vec<&OwnershipSpec> {
        let mut out = Vec::new();
        self.collect_specs(&mut out);
        out
    }

    fn collect_specs<'a>(&'a self, out: &mut Vec<&'a OwnershipSpec>) {
        match self {
            ConceptGetter::Attribute { spec } => out.push(spec),
            ConceptGetter::Ownerships { ownerships, .. } => out.extend(ownerships.iter()),
            ConceptGetter::Players { players, .. } => {
                for player in players {
                    player.getter.collect_specs(out);
                }
            }
        }
    }
}

/// A role of a relation and how its player is found
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSpec {
    pub role: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "match")]
    pub getter: ConceptGetter,
}
