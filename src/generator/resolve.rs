//! Recursive getter resolution into match clauses.

use crate::config::ConceptGetter;
use crate::generator::coerce::ownership_values;
use crate::generator::{ColumnTypeIssue, RowContext};
use crate::query::{ThingPattern, Var};

/// Match clauses locating one concept, and the variables standing for it
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMatch {
    pub patterns: Vec<ThingPattern>,
    /// Several when an attribute getter's cell explodes into several values
    pub vars: Vec<Var>,
}

/// Resolve `getter` for one row, binding `var` (and variables below it) to the located concept.
/// `Err` carries the reason the getter stays unresolved.
pub fn resolve_getter(
    getter: &ConceptGetter,
    var: &Var,
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> Result<ResolvedMatch, String> {
    match getter {
        ConceptGetter::Attribute { spec } => {
            let values = ownership_values(spec, row, issues);
            if values.is_empty() {
                return Err(format!(
                    "no value for attribute '{}' in column '{}'",
                    spec.attribute, spec.column
                ));
            }
            let single = values.len() == 1;
            let mut resolved = ResolvedMatch {
                patterns: Vec::with_capacity(values.len()),
                vars: Vec::with_capacity(values.len()),
            };
            for (k, value) in values.into_iter().enumerate() {
                let v = if single {
                    var.clone()
                } else {
                    Var::new(format!("{}-v{}", var.name(), k))
                };
                resolved
                    .patterns
                    .push(ThingPattern::attribute(v.clone(), spec.attribute.clone(), value));
                resolved.vars.push(v);
            }
            Ok(resolved)
        }
        ConceptGetter::Ownerships {
            type_label,
            ownerships,
        } => {
            let mut pattern = ThingPattern::isa(var.clone(), type_label.clone());
            for spec in ownerships {
                let values = ownership_values(spec, row, issues);
                if values.is_empty() && spec.required {
                    return Err(format!(
                        "missing required ownership '{}' (column '{}') of '{}'",
                        spec.attribute, spec.column, type_label
                    ));
                }
                for value in values {
                    pattern.push_has(spec.attribute.clone(), value);
                }
            }
            if pattern.has.is_empty() {
                return Err(format!("no identifying ownership value for '{}'", type_label));
            }
            Ok(ResolvedMatch {
                patterns: vec![pattern],
                vars: vec![var.clone()],
            })
        }
        ConceptGetter::Players { type_label, players } => {
            let mut relation = ThingPattern::isa(var.clone(), type_label.clone());
            let mut patterns = Vec::new();
            for (i, player) in players.iter().enumerate() {
                match resolve_getter(&player.getter, &var.child(i), row, issues) {
                    Ok(child) => {
                        for v in child.vars {
                            relation.push_role_player(player.role.clone(), v);
                        }
                        patterns.extend(child.patterns);
                    }
                    Err(reason) if player.required => {
                        return Err(format!(
                            "missing required player '{}' of '{}': {}",
                            player.role, type_label, reason
                        ));
                    }
                    Err(_) => {}
                }
            }
            if relation.role_players.is_empty() {
                return Err(format!("no role player of '{}' could be resolved", type_label));
            }
            patterns.push(relation);
            Ok(ResolvedMatch {
                patterns,
                vars: vec![var.clone()],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OwnershipSpec, PlayerSpec};
    use crate::query::{Value, ValueType};
    use crate::reader::header_index;

    fn attr(label: &str, column: &str) -> ConceptGetter {
        ConceptGetter::Attribute {
            spec: OwnershipSpec::new(label, column)
                .required()
                .with_value_type(ValueType::String),
        }
    }

    fn person(column: &str) -> ConceptGetter {
        ConceptGetter::Ownerships {
            type_label: "person".into(),
            ownerships: vec![OwnershipSpec::new("phone-number", column)
                .required()
                .with_value_type(ValueType::String)],
        }
    }

    fn player(role: &str, required: bool, getter: ConceptGetter) -> PlayerSpec {
        PlayerSpec {
            role: role.into(),
            required,
            getter,
        }
    }

    #[test]
    fn test_nested_players_use_distinct_vars() {
        let header = header_index(&["caller".into(), "callee".into(), "tag".into()]);
        let fields = vec![Some("1".into()), Some("2".into()), Some("a;b".into())];
        let row = RowContext::new("f.csv", 2, &fields, &header);

        let mut tags = OwnershipSpec::new("tag", "tag")
            .with_list_separator(";")
            .with_value_type(ValueType::String);
        tags.required = true;
        let call = ConceptGetter::Players {
            type_label: "call".into(),
            players: vec![
                player("caller", true, person("caller")),
                player("callee", true, person("callee")),
                player("tag", false, ConceptGetter::Attribute { spec: tags }),
            ],
        };
        let resolved = resolve_getter(&call, &Var::new("player-0"), &row, &mut Vec::new()).unwrap();
        assert_eq!(resolved.vars, vec![Var::new("player-0")]);

        let vars: Vec<String> = resolved.patterns.iter().map(|p| p.var.to_string()).collect();
        assert_eq!(
            vars,
            vec!["$player-0-0", "$player-0-1", "$player-0-2-v0", "$player-0-2-v1", "$player-0"]
        );
        let relation = resolved.patterns.last().unwrap();
        assert_eq!(relation.role_players.len(), 4);
        assert_eq!(
            relation.to_string(),
            "$player-0 (caller: $player-0-0, callee: $player-0-1, tag: $player-0-2-v0, tag: $player-0-2-v1) isa call"
        );
    }

    #[test]
    fn test_optional_player_is_omitted_and_required_fails() {
        let header = header_index(&["caller".into(), "callee".into()]);
        let fields = vec![Some("1".into()), None];
        let row = RowContext::new("f.csv", 2, &fields, &header);

        let optional = ConceptGetter::Players {
            type_label: "call".into(),
            players: vec![player("caller", true, person("caller")), player("callee", false, person("callee"))],
        };
        let resolved = resolve_getter(&optional, &Var::new("player-1"), &row, &mut Vec::new()).unwrap();
        assert_eq!(resolved.patterns.len(), 2);

        let required = ConceptGetter::Players {
            type_label: "call".into(),
            players: vec![player("caller", true, person("caller")), player("callee", true, person("callee"))],
        };
        let err = resolve_getter(&required, &Var::new("player-1"), &row, &mut Vec::new()).unwrap_err();
        assert!(err.contains("callee"));
    }

    #[test]
    fn test_attribute_getter_binds_value() {
        let header = header_index(&["in_use".into()]);
        let fields = vec![Some("yes".into())];
        let row = RowContext::new("f.csv", 2, &fields, &header);
        let resolved = resolve_getter(&attr("is-in-use", "in_use"), &Var::new("player-0"), &row, &mut Vec::new())
            .unwrap();
        assert_eq!(
            resolved.patterns,
            vec![ThingPattern::attribute(
                Var::new("player-0"),
                "is-in-use",
                Value::String("yes".into())
            )]
        );
    }
}
