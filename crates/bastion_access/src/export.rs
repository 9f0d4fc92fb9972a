//! Export of the internal permission model to the game server's own
//! admin-configuration file format, for out-of-band provisioning.
//!
//! The target format is line oriented:
//!
//! ```text
//! Group=GroupName:perm1,perm2
//! Admin=76561198000000001:GroupName // display name
//! ```
//!
//! Only the console-facing (`rcon:`) permission segment is meaningful to the
//! game server, so group rendering strips the `rcon:` prefix and skips roles
//! with no console permissions at all.

use crate::roles::Role;

/// One admin line: a platform identifier bound to a group.
#[derive(Debug, Clone)]
pub struct AdminFileEntry {
    /// Steam id (or other platform id) the game server keys admins by.
    pub platform_id: String,
    /// Group name; must match a rendered `Group=` line.
    pub group: String,
    /// Optional display name rendered as a trailing comment.
    pub display_name: Option<String>,
}

/// Renders roles and admin assignments into the admin-file format.
///
/// Output ordering is deterministic (roles sorted by id, admins in input
/// order) so repeated exports diff cleanly.
pub fn render_admin_file(roles: &[Role], admins: &[AdminFileEntry]) -> String {
    let mut out = String::new();

    let mut sorted: Vec<&Role> = roles.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    for role in sorted {
        let mut console_perms: Vec<&str> = role
            .permissions
            .iter()
            .filter_map(|p| p.strip_prefix("rcon:"))
            .collect();
        if console_perms.is_empty() {
            continue;
        }
        console_perms.sort_unstable();
        out.push_str(&format!("Group={}:{}\n", role.id, console_perms.join(",")));
    }

    if !out.is_empty() && !admins.is_empty() {
        out.push('\n');
    }

    for admin in admins {
        match &admin.display_name {
            Some(name) => out.push_str(&format!(
                "Admin={}:{} // {}\n",
                admin.platform_id, admin.group, name
            )),
            None => out.push_str(&format!("Admin={}:{}\n", admin.platform_id, admin.group)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_render_console_permissions_only() {
        let roles = vec![
            Role {
                id: "moderator".into(),
                permissions: ["rcon:kick", "rcon:chat", "ui:bans:view"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                inherits: vec![],
            },
            Role {
                id: "viewer".into(),
                permissions: ["ui:dashboard:view"].into_iter().map(String::from).collect(),
                inherits: vec![],
            },
        ];
        let rendered = render_admin_file(&roles, &[]);
        assert_eq!(rendered, "Group=moderator:chat,kick\n");
    }

    #[test]
    fn admins_render_with_optional_display_name() {
        let admins = vec![
            AdminFileEntry {
                platform_id: "76561198000000001".into(),
                group: "moderator".into(),
                display_name: Some("Alice".into()),
            },
            AdminFileEntry {
                platform_id: "76561198000000002".into(),
                group: "moderator".into(),
                display_name: None,
            },
        ];
        let roles = vec![Role {
            id: "moderator".into(),
            permissions: ["rcon:kick"].into_iter().map(String::from).collect(),
            inherits: vec![],
        }];
        let rendered = render_admin_file(&roles, &admins);
        assert!(rendered.contains("Group=moderator:kick\n"));
        assert!(rendered.contains("Admin=76561198000000001:moderator // Alice\n"));
        assert!(rendered.contains("Admin=76561198000000002:moderator\n"));
    }
}
