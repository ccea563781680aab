//! Group membership roles
//!
//! Roles are owned by the external CRUD service; this server only reads
//! them. A connection caches its role for the lifetime of its session
//! membership, so an external demotion is not observed until the next join.

use serde::{Deserialize, Serialize};

/// Authorization level within a group: Owner > Admin > Member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

impl GroupRole {
    /// Whether this role may issue play/pause/seek commands.
    ///
    /// Owner outranks Admin everywhere else in the product (group
    /// management), so it is granted playback control as well.
    pub fn can_control_playback(&self) -> bool {
        matches!(self, GroupRole::Owner | GroupRole::Admin)
    }
}

impl std::fmt::Display for GroupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupRole::Owner => write!(f, "OWNER"),
            GroupRole::Admin => write!(f, "ADMIN"),
            GroupRole::Member => write!(f, "MEMBER"),
        }
    }
}

impl std::str::FromStr for GroupRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OWNER" => Ok(GroupRole::Owner),
            "ADMIN" => Ok(GroupRole::Admin),
            "MEMBER" => Ok(GroupRole::Member),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [GroupRole::Owner, GroupRole::Admin, GroupRole::Member] {
            assert_eq!(role.to_string().parse::<GroupRole>().unwrap(), role);
        }
    }

    #[test]
    fn test_role_parse_rejects_unknown() {
        assert!("MODERATOR".parse::<GroupRole>().is_err());
        assert!("".parse::<GroupRole>().is_err());
    }

    #[test]
    fn test_playback_control_authorization() {
        assert!(GroupRole::Owner.can_control_playback());
        assert!(GroupRole::Admin.can_control_playback());
        assert!(!GroupRole::Member.can_control_playback());
    }

    #[test]
    fn test_role_serde_uppercase() {
        assert_eq!(serde_json::to_string(&GroupRole::Admin).unwrap(), "\"ADMIN\"");
        let parsed: GroupRole = serde_json::from_str("\"OWNER\"").unwrap();
        assert_eq!(parsed, GroupRole::Owner);
    }
}
