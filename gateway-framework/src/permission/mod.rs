//! Permission inheritance: a subgraph has no grants of its own, so any
//! permission check on a subgraph id resolves to the parent before asking
//! the authorization layer.
//!
//! Grounded on `middleware/graph/utils/identity.py`'s `validate_graph_access`,
//! which performs the same parent-substitution before calling into the
//! authorization store. The authorization store itself (role storage, role
//! comparison) is an external collaborator, stated here as a narrow trait
//! per the same no-cycles discipline as [`crate::allocation::registry::GraphRegistry`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;
use crate::identity::{self, GraphId};

/// Role storage and comparison live outside this crate; the control plane's
/// only job is resolving *which* graph id the check should apply to.
#[async_trait]
pub trait RoleAuthority: Send + Sync {
    async fn has_role(&self, user_id: &str, graph_id: &str, role: &str) -> Result<bool, Error>;
}

/// Grants every check. For deployments (or embeddings) that haven't wired a
/// real authorization store — the control plane still performs the parent
/// resolution, it just never denies.
pub struct AllowAllAuthority;

#[async_trait]
impl RoleAuthority for AllowAllAuthority {
    async fn has_role(&self, _user_id: &str, _graph_id: &str, _role: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

pub struct PermissionResolver {
    authority: Arc<dyn RoleAuthority>,
}

impl PermissionResolver {
    pub fn new(authority: Arc<dyn RoleAuthority>) -> Self {
        PermissionResolver { authority }
    }

    /// The graph id a permission check against `graph_id` actually applies
    /// to: the parent for a subgraph, the id itself otherwise.
    pub fn resolve_for_permission(graph_id: &str) -> String {
        match identity::parse(graph_id) {
            GraphId::Subgraph { parent, .. } => parent,
            _ => graph_id.to_string(),
        }
    }

    pub async fn check(&self, user_id: &str, graph_id: &str, role: &str) -> Result<bool, Error> {
        let resolved = Self::resolve_for_permission(graph_id);
        let granted = self.authority.has_role(user_id, &resolved, role).await?;

        if granted {
            tracing::debug!(user_id, graph_id, resolved_graph_id = %resolved, role, "permission granted");
        } else {
            tracing::warn!(user_id, graph_id, resolved_graph_id = %resolved, role, "permission denied");
        }

        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct StaticAuthority {
        grants: HashSet<(String, String, String)>,
    }

    #[async_trait]
    impl RoleAuthority for StaticAuthority {
        async fn has_role(&self, user_id: &str, graph_id: &str, role: &str) -> Result<bool, Error> {
            Ok(self.grants.contains(&(user_id.to_string(), graph_id.to_string(), role.to_string())))
        }
    }

    fn authority_with(grant: (&str, &str, &str)) -> Arc<StaticAuthority> {
        let mut grants = HashSet::new();
        grants.insert((grant.0.to_string(), grant.1.to_string(), grant.2.to_string()));
        Arc::new(StaticAuthority { grants })
    }

    #[test]
    fn resolve_for_permission_substitutes_parent_for_subgraph() {
        assert_eq!(
            PermissionResolver::resolve_for_permission("kg0123456789abcdef_dev"),
            "kg0123456789abcdef"
        );
        assert_eq!(PermissionResolver::resolve_for_permission("kg0123456789abcdef"), "kg0123456789abcdef");
        assert_eq!(PermissionResolver::resolve_for_permission("sec"), "sec");
    }

    #[tokio::test]
    async fn admin_on_parent_grants_access_to_subgraph() {
        let authority = authority_with(("user-u", "kg0123456789abcdef", "admin"));
        let resolver = PermissionResolver::new(authority);

        assert!(resolver.check("user-u", "kg0123456789abcdef_dev", "admin").await.unwrap());
    }

    #[tokio::test]
    async fn no_grant_on_parent_denies_subgraph_access() {
        let authority = authority_with(("user-u", "kg0123456789abcdef", "admin"));
        let resolver = PermissionResolver::new(authority);

        assert!(!resolver.check("user-v", "kg0123456789abcdef_dev", "admin").await.unwrap());
    }
}
