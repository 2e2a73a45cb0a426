//! Graph ID grammar: parsing, classification, and subgraph construction.
//!
//! A graph ID is one of three shapes: a user graph (`kg` + 16 or more lowercase
//! hex characters), a shared repository (one of a fixed closed set of short
//! names), or a subgraph (`<parent>_<name>`, underscore-joined, where the
//! parent is itself a valid user graph and the name is 1-20 alphanumeric
//! characters). Shared repositories can never have subgraphs, and the closed
//! set always wins precedence over the underscore split.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref USER_GRAPH_PATTERN: Regex = Regex::new(r"^kg[a-f0-9]{16,}$").unwrap();
    static ref SUBGRAPH_NAME_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9]{1,20}$").unwrap();
    static ref FULL_SUBGRAPH_PATTERN: Regex =
        Regex::new(r"^(kg[a-f0-9]{16,})_([a-zA-Z0-9]{1,20})$").unwrap();
}

/// Shared repositories are a closed set; no new entries appear at runtime.
pub const SHARED_REPOSITORIES: &[&str] = &[
    "sec",
    "industry",
    "economic",
    "regulatory",
    "market",
    "esg",
    "stock",
    "reference",
];

/// Reserved literal IDs that never resolve as a user graph even when they
/// would otherwise be syntactically plausible.
const RESERVED_NAMES: &[&str] = &["system", "default"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphId {
    Parent(String),
    Subgraph { parent: String, name: String },
    Shared(String),
    Invalid,
}

impl GraphId {
    pub fn is_shared(&self) -> bool {
        matches!(self, GraphId::Shared(_))
    }

    pub fn is_subgraph(&self) -> bool {
        matches!(self, GraphId::Subgraph { .. })
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, GraphId::Parent(_))
    }
}

/// Parse a raw graph ID string. Precedence: the shared-repository closed set
/// wins first (so `sec_anything` is `Invalid`, never a subgraph of `sec`);
/// then the underscore split into parent/name; otherwise the whole string
/// must match the user-graph pattern.
pub fn parse(raw: &str) -> GraphId {
    if raw.is_empty() {
        return GraphId::Invalid;
    }
    if SHARED_REPOSITORIES.contains(&raw) {
        return GraphId::Shared(raw.to_string());
    }
    if let Some(captures) = FULL_SUBGRAPH_PATTERN.captures(raw) {
        let parent = captures[1].to_string();
        let name = captures[2].to_string();
        return GraphId::Subgraph { parent, name };
    }
    if RESERVED_NAMES.contains(&raw) {
        return GraphId::Invalid;
    }
    if USER_GRAPH_PATTERN.is_match(raw) {
        return GraphId::Parent(raw.to_string());
    }
    GraphId::Invalid
}

/// The database name on disk equals the logical graph ID, subgraphs
/// included (the underscore form is the actual file/database name).
pub fn database_name(graph_id: &str) -> &str {
    graph_id
}

pub fn is_shared(graph_id: &str) -> bool {
    parse(graph_id).is_shared()
}

pub fn is_subgraph(graph_id: &str) -> bool {
    parse(graph_id).is_subgraph()
}

pub fn is_parent(graph_id: &str) -> bool {
    parse(graph_id).is_parent()
}

pub fn validate_parent_graph_id(graph_id: &str) -> bool {
    matches!(parse(graph_id), GraphId::Parent(_))
}

pub fn validate_subgraph_name(name: &str) -> bool {
    SUBGRAPH_NAME_PATTERN.is_match(name)
}

/// Construct and validate a subgraph ID from its parts. Fails if the parent
/// isn't a valid parent graph ID or the name isn't a valid subgraph name.
pub fn construct_subgraph(parent: &str, name: &str) -> Result<String, crate::errors::Error> {
    if !validate_parent_graph_id(parent) {
        return Err(crate::errors::Error::client(
            format!("invalid parent graph id: {parent}"),
            None,
        ));
    }
    if !validate_subgraph_name(name) {
        return Err(crate::errors::Error::client(
            format!("invalid subgraph name: {name} (must be alphanumeric, 1-20 characters)"),
            None,
        ));
    }
    Ok(format!("{parent}_{name}"))
}

/// Generate a subgraph name unique among `existing`, derived from
/// `base_name`: strip non-alphanumeric characters, truncate to 17 to leave
/// room for a numeric suffix, then try the bare name followed by `name1`,
/// `name2`, ... up to 99 attempts.
pub fn generate_unique_name(base_name: &str, existing: &[String]) -> Result<String, crate::errors::Error> {
    let mut clean: String = base_name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    clean.truncate(17);
    if clean.is_empty() {
        clean = "subgraph".to_string();
    }

    if !existing.iter().any(|n| n == &clean) && validate_subgraph_name(&clean) {
        return Ok(clean);
    }

    for i in 1..100 {
        let candidate = format!("{clean}{i}");
        if candidate.len() <= 20 && !existing.iter().any(|n| n == &candidate) {
            return Ok(candidate);
        }
    }

    Err(crate::errors::Error::Subgraph(format!(
        "unable to generate a unique subgraph name for base '{base_name}'"
    )))
}

/// Category a parsed graph ID belongs to, for routing/permission/credit
/// decisions that only care about the coarse shape, not the exact parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphCategory {
    User,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    ReadWrite,
    ReadOnly,
    Restricted,
}

/// A parsed graph ID enriched with the category and access pattern callers
/// need for routing and permission decisions, computed once instead of
/// re-derived at every call site that needs more than the bare `GraphId`.
#[derive(Debug, Clone)]
pub struct GraphIdentity {
    pub graph_id: String,
    pub category: GraphCategory,
    pub access_pattern: AccessPattern,
    /// For subgraphs, the parent's ID; `None` for parents and shared repos.
    pub parent_graph_id: Option<String>,
}

impl GraphIdentity {
    /// The ID credit/permission operations should actually operate on:
    /// the parent for subgraphs, the ID itself otherwise.
    pub fn billing_graph_id(&self) -> &str {
        self.parent_graph_id.as_deref().unwrap_or(&self.graph_id)
    }
}

pub fn identify(raw: &str, shared_write_allowlisted: bool) -> Result<GraphIdentity, crate::errors::Error> {
    match parse(raw) {
        GraphId::Invalid => Err(crate::errors::Error::client(
            format!("invalid graph id: {raw}"),
            None,
        )),
        GraphId::Shared(id) => Ok(GraphIdentity {
            graph_id: id,
            category: GraphCategory::Shared,
            access_pattern: if shared_write_allowlisted {
                AccessPattern::ReadWrite
            } else {
                AccessPattern::ReadOnly
            },
            parent_graph_id: None,
        }),
        GraphId::Parent(id) => Ok(GraphIdentity {
            graph_id: id,
            category: GraphCategory::User,
            access_pattern: AccessPattern::ReadWrite,
            parent_graph_id: None,
        }),
        GraphId::Subgraph { parent, name } => {
            let graph_id = format!("{parent}_{name}");
            Ok(GraphIdentity {
                graph_id,
                category: GraphCategory::User,
                access_pattern: AccessPattern::ReadWrite,
                parent_graph_id: Some(parent),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_graph() {
        assert_eq!(
            parse("kg0123456789abcdef"),
            GraphId::Parent("kg0123456789abcdef".to_string())
        );
    }

    #[test]
    fn parses_shared_repository() {
        assert_eq!(parse("sec"), GraphId::Shared("sec".to_string()));
    }

    #[test]
    fn shared_repositories_never_decompose_into_subgraphs() {
        // "sec" is not in the kg pattern, so even with an underscore it must
        // stay Invalid rather than being treated as a subgraph of anything.
        assert_eq!(parse("sec_extra"), GraphId::Invalid);
    }

    #[test]
    fn parses_subgraph() {
        assert_eq!(
            parse("kg0123456789abcdef_dev"),
            GraphId::Subgraph {
                parent: "kg0123456789abcdef".to_string(),
                name: "dev".to_string(),
            }
        );
    }

    #[test]
    fn rejects_multiple_underscores() {
        assert_eq!(parse("kg0123456789abcdef_dev_extra"), GraphId::Invalid);
    }

    #[test]
    fn rejects_empty_and_reserved() {
        assert_eq!(parse(""), GraphId::Invalid);
        assert_eq!(parse("system"), GraphId::Invalid);
        assert_eq!(parse("default"), GraphId::Invalid);
    }

    #[test]
    fn construct_then_parse_round_trips() {
        let id = construct_subgraph("kg0123456789abcdef", "dev").unwrap();
        assert_eq!(
            parse(&id),
            GraphId::Subgraph {
                parent: "kg0123456789abcdef".to_string(),
                name: "dev".to_string(),
            }
        );
    }

    #[test]
    fn generate_unique_name_strips_and_truncates() {
        let name = generate_unique_name("My Cool Env!!", &[]).unwrap();
        assert_eq!(name, "MyCoolEnv");
    }

    #[test]
    fn generate_unique_name_appends_numbers_on_collision() {
        let existing = vec!["dev".to_string(), "dev1".to_string()];
        let name = generate_unique_name("dev", &existing).unwrap();
        assert_eq!(name, "dev2");
    }

    #[test]
    fn generate_unique_name_falls_back_when_base_is_empty_after_cleaning() {
        let name = generate_unique_name("!!!", &[]).unwrap();
        assert_eq!(name, "subgraph");
    }

    #[test]
    fn identify_substitutes_parent_for_billing() {
        let identity = identify("kg0123456789abcdef_dev", false).unwrap();
        assert_eq!(identity.billing_graph_id(), "kg0123456789abcdef");
    }
}
