//! Role storage, transitive resolution and the TTL'd permission cache.

use crate::permissions::evaluate;
use bastion_events::ServerId;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Maximum depth of the role-inheritance walk. Bounds cyclic role data.
pub const ROLE_DEPTH_CAP: usize = 5;

/// How long a resolved `(principal, server)` set stays cached.
pub const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(300);

/// A named role: a set of permission strings plus inherited roles.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

/// Source of role data. The persistence layer loads into an implementation
/// of this at boot; mutation goes through it so the service can invalidate.
pub trait RoleStore: Send + Sync {
    /// Role ids directly assigned to a principal on a server.
    fn assigned_roles(&self, principal: &str, server_id: ServerId) -> Vec<String>;

    /// Looks up one role definition.
    fn role(&self, role_id: &str) -> Option<Role>;
}

/// In-memory role store backing the service; doubles as the test fixture.
#[derive(Debug, Default)]
pub struct InMemoryRoleStore {
    roles: DashMap<String, Role>,
    // (principal, server) -> assigned role ids
    assignments: DashMap<(String, ServerId), Vec<String>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_role(&self, role: Role) {
        self.roles.insert(role.id.clone(), role);
    }

    pub fn assign(&self, principal: &str, server_id: ServerId, role_id: &str) {
        self.assignments
            .entry((principal.to_string(), server_id))
            .or_default()
            .push(role_id.to_string());
    }

    pub fn roles(&self) -> Vec<Role> {
        self.roles.iter().map(|r| r.value().clone()).collect()
    }
}

impl RoleStore for InMemoryRoleStore {
    fn assigned_roles(&self, principal: &str, server_id: ServerId) -> Vec<String> {
        self.assignments
            .get(&(principal.to_string(), server_id))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn role(&self, role_id: &str) -> Option<Role> {
        self.roles.get(role_id).map(|r| r.clone())
    }
}

/// Authorization failures.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Permission denied: {principal} lacks '{required}' on server {server_id}")]
    Denied {
        principal: String,
        server_id: ServerId,
        required: String,
    },
}

struct CachedSet {
    permissions: Arc<HashSet<String>>,
    resolved_at: Instant,
}

/// The permission service: transitive role resolution with a TTL cache.
pub struct PermissionService {
    store: Arc<dyn RoleStore>,
    cache: DashMap<(String, ServerId), CachedSet>,
    ttl: Duration,
}

impl std::fmt::Debug for PermissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService")
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

impl PermissionService {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self::with_ttl(store, PERMISSION_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RoleStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// The transitive union of permissions for a principal on a server,
    /// cached for the TTL.
    pub fn effective_permissions(
        &self,
        principal: &str,
        server_id: ServerId,
    ) -> Arc<HashSet<String>> {
        let key = (principal.to_string(), server_id);
        if let Some(cached) = self.cache.get(&key) {
            if cached.resolved_at.elapsed() < self.ttl {
                return Arc::clone(&cached.permissions);
            }
        }

        let resolved = Arc::new(self.resolve(principal, server_id));
        self.cache.insert(
            key,
            CachedSet {
                permissions: Arc::clone(&resolved),
                resolved_at: Instant::now(),
            },
        );
        resolved
    }

    /// Breadth-first walk over assigned roles and their inheritance, bounded
    /// to [`ROLE_DEPTH_CAP`] levels.
    fn resolve(&self, principal: &str, server_id: ServerId) -> HashSet<String> {
        let mut permissions = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> = self
            .store
            .assigned_roles(principal, server_id)
            .into_iter()
            .map(|id| (id, 0))
            .collect();

        while let Some((role_id, depth)) = frontier.pop_front() {
            if depth >= ROLE_DEPTH_CAP || !visited.insert(role_id.clone()) {
                continue;
            }
            let Some(role) = self.store.role(&role_id) else {
                debug!("Assigned role '{role_id}' has no definition");
                continue;
            };
            permissions.extend(role.permissions.iter().cloned());
            for parent in role.inherits {
                frontier.push_back((parent, depth + 1));
            }
        }
        permissions
    }

    /// Boolean check against the wildcard rules.
    pub fn check(&self, principal: &str, server_id: ServerId, required: &str) -> bool {
        evaluate(&self.effective_permissions(principal, server_id), required)
    }

    /// Check that surfaces a typed authorization error, for call sites that
    /// propagate with `?`.
    pub fn require(
        &self,
        principal: &str,
        server_id: ServerId,
        required: &str,
    ) -> Result<(), AccessError> {
        if self.check(principal, server_id, required) {
            Ok(())
        } else {
            Err(AccessError::Denied {
                principal: principal.to_string(),
                server_id,
                required: required.to_string(),
            })
        }
    }

    /// Drops the cached set for one principal/server pair. Call on any role
    /// or assignment mutation affecting them.
    pub fn invalidate(&self, principal: &str, server_id: ServerId) {
        self.cache.remove(&(principal.to_string(), server_id));
    }

    /// Drops the whole cache. Call on bulk role mutations.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(store: InMemoryRoleStore) -> PermissionService {
        PermissionService::new(Arc::new(store))
    }

    fn role(id: &str, permissions: &[&str], inherits: &[&str]) -> Role {
        Role {
            id: id.to_string(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            inherits: inherits.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn inherited_permissions_union_transitively() {
        let store = InMemoryRoleStore::new();
        store.upsert_role(role("viewer", &["ui:bans:view"], &[]));
        store.upsert_role(role("moderator", &["rcon:warn"], &["viewer"]));
        store.upsert_role(role("admin", &["rcon:kick"], &["moderator"]));
        let server = ServerId::new();
        store.assign("alice", server, "admin");

        let service = service_with(store);
        assert!(service.check("alice", server, "rcon:kick"));
        assert!(service.check("alice", server, "rcon:warn"));
        assert!(service.check("alice", server, "ui:bans:view"));
        assert!(!service.check("alice", server, "rcon:ban"));
    }

    #[test]
    fn cyclic_inheritance_terminates_at_the_depth_cap() {
        let store = InMemoryRoleStore::new();
        store.upsert_role(role("a", &["perm:a"], &["b"]));
        store.upsert_role(role("b", &["perm:b"], &["a"]));
        let server = ServerId::new();
        store.assign("bob", server, "a");

        let service = service_with(store);
        assert!(service.check("bob", server, "perm:a"));
        assert!(service.check("bob", server, "perm:b"));
    }

    #[test]
    fn depth_cap_cuts_off_deep_chains() {
        let store = InMemoryRoleStore::new();
        // Chain r0 -> r1 -> ... -> r6; depth cap 5 keeps r0..=r4.
        for i in 0..7 {
            let inherits = if i < 6 {
                vec![format!("r{}", i + 1)]
            } else {
                vec![]
            };
            store.upsert_role(Role {
                id: format!("r{i}"),
                permissions: [format!("perm:{i}")].into_iter().collect(),
                inherits,
            });
        }
        let server = ServerId::new();
        store.assign("carol", server, "r0");

        let service = service_with(store);
        assert!(service.check("carol", server, "perm:4"));
        assert!(!service.check("carol", server, "perm:5"));
    }

    #[test]
    fn cache_serves_until_invalidated() {
        let store = Arc::new(InMemoryRoleStore::new());
        store.upsert_role(role("admin", &["rcon:kick"], &[]));
        let server = ServerId::new();
        store.assign("dave", server, "admin");

        let service = PermissionService::new(Arc::clone(&store) as Arc<dyn RoleStore>);
        assert!(service.check("dave", server, "rcon:kick"));

        // Mutate the underlying role; cached set still answers the old way.
        store.upsert_role(role("admin", &[], &[]));
        assert!(service.check("dave", server, "rcon:kick"));

        service.invalidate("dave", server);
        assert!(!service.check("dave", server, "rcon:kick"));
    }

    #[test]
    fn require_surfaces_a_typed_denial() {
        let service = service_with(InMemoryRoleStore::new());
        let server = ServerId::new();
        let err = service.require("eve", server, "rcon:ban").unwrap_err();
        assert!(matches!(err, AccessError::Denied { .. }));
        assert!(err.to_string().contains("rcon:ban"));
    }
}
