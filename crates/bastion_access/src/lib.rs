//! # Bastion Access Control
//!
//! The policy layer gating which plugin and workflow actions are allowed on
//! which server by which principal. A principal (admin user, plugin
//! instance, workflow) carries roles per server; roles carry dotted
//! permission strings and may inherit other roles.
//!
//! Evaluation follows three rules, in order: a literal `*` in the effective
//! set grants everything; an exact match grants; a `prefix:*` entry grants
//! any permission starting with `prefix:`. Effective sets are the transitive
//! union over the role-inheritance graph, walked breadth-first to a fixed
//! depth of 5 so cyclic role data cannot loop the resolver.
//!
//! Resolved sets are cached per `(principal, server)` with a 5 minute TTL and
//! invalidated explicitly whenever roles or assignments mutate.

pub mod export;
pub mod permissions;
pub mod roles;

pub use export::{render_admin_file, AdminFileEntry};
pub use permissions::evaluate;
pub use roles::{
    AccessError, InMemoryRoleStore, PermissionService, Role, RoleStore, PERMISSION_CACHE_TTL,
    ROLE_DEPTH_CAP,
};
