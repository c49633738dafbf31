use crate::errors::AuthzError;
use kdl::KdlDocument;

/// A single rule parsed from a KDL policy document, before compilation.
#[derive(Debug, Clone, Default)]
pub struct ParsedRule {
    pub name: String,
    /// Actor patterns; empty matches any actor.
    pub actors: Vec<String>,
    /// Actions the rule grants; empty matches any action.
    pub actions: Vec<String>,
    /// Registered resource type the rule applies to.
    pub resource_type: String,
    /// Optional condition expression (raw string, compiled on load).
    pub condition: Option<String>,
}

/// Parse a KDL policy document into rules.
///
/// ```kdl
/// rule "fooey-readers" {
///     actors {
///         - "steve"
///     }
///     actions {
///         - "get"
///     }
///     resource "Foo"
///     condition "resource.is_fooey == true"
/// }
/// ```
pub fn parse_kdl_document(source: &str) -> Result<Vec<ParsedRule>, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut rules = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "rule" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "rule node requires a string argument (e.g. rule \"fooey-readers\")"
                            .into(),
                    )
                })?;

                let mut actors = Vec::new();
                let mut actions = Vec::new();
                let mut resource_type = None;
                let mut condition = None;

                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "actors" => {
                                actors = dash_list(child);
                            }
                            "actions" => {
                                actions = dash_list(child);
                            }
                            "resource" => {
                                resource_type = first_string_arg(child);
                            }
                            "condition" => {
                                condition = first_string_arg(child);
                            }
                            other => {
                                return Err(AuthzError::InvalidPolicy(format!(
                                    "unexpected child `{other}` in rule `{name}` (expected `actors`, `actions`, `resource` or `condition`)"
                                )));
                            }
                        }
                    }
                }

                let resource_type = resource_type.ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!(
                        "rule `{name}` missing `resource` node (e.g. resource \"Foo\")"
                    ))
                })?;

                rules.push(ParsedRule {
                    name,
                    actors,
                    actions,
                    resource_type,
                    condition,
                });
            }
            other => {
                // Ignore comments and unknown top-level nodes with a warning
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(rules)
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &kdl::KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_rule() {
        let kdl = r#"
rule "fooey-readers" {
    actors {
        - "steve"
    }
    actions {
        - "get"
    }
    resource "Foo"
    condition "resource.is_fooey == true"
}
"#;
        let rules = parse_kdl_document(kdl).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "fooey-readers");
        assert_eq!(rule.actors, vec!["steve"]);
        assert_eq!(rule.actions, vec!["get"]);
        assert_eq!(rule.resource_type, "Foo");
        assert_eq!(
            rule.condition.as_deref(),
            Some("resource.is_fooey == true")
        );
    }

    #[test]
    fn test_parse_rule_defaults() {
        let kdl = r#"
rule "anyone-anything" {
    resource "Foo"
}
"#;
        let rules = parse_kdl_document(kdl).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert!(rule.actors.is_empty());
        assert!(rule.actions.is_empty());
        assert!(rule.condition.is_none());
    }

    #[test]
    fn test_parse_multiple_rules() {
        let kdl = r#"
rule "a" {
    resource "Foo"
    condition "resource.is_fooey == true"
}

rule "b" {
    resource "Bar"
}
"#;
        let rules = parse_kdl_document(kdl).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "a");
        assert_eq!(rules[1].resource_type, "Bar");
    }

    #[test]
    fn test_parse_missing_resource() {
        let kdl = r#"
rule "incomplete" {
    actions {
        - "get"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_parse_unexpected_child() {
        let kdl = r#"
rule "bad" {
    resource "Foo"
    widgets {
        - "x"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unknown_top_level_node_ignored() {
        let kdl = r#"
metadata "whatever"

rule "a" {
    resource "Foo"
}
"#;
        let rules = parse_kdl_document(kdl).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_invalid_kdl_syntax() {
        let err = parse_kdl_document(r#"rule "a" { unclosed"#).unwrap_err();
        assert!(matches!(err, AuthzError::KdlParse(_)));
    }
}
