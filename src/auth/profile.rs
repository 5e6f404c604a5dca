//! Profile claim merging
//!
//! Two sources describe a user: the profile pushed by the user-management
//! service and the claims carried in a token. The stored profile is
//! authoritative; token claims only fill fields it does not have.

use crate::model::{ProfileClaims, UserProfile};
use serde::Serialize;

/// The `/oauth/userinfo` document and the identity seen by guarded handlers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergedProfile {
    pub sub: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
}

impl MergedProfile {
    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Claims form, for embedding in codes and tokens
    pub fn to_claims(&self) -> ProfileClaims {
        ProfileClaims {
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            permissions: Some(self.permissions.clone()),
        }
    }
}

pub fn merge_profile(sub: &str, stored: Option<&UserProfile>, claims: &ProfileClaims) -> MergedProfile {
    let Some(stored) = stored else {
        return MergedProfile {
            sub: sub.to_string(),
            name: claims.name.clone(),
            email: claims.email.clone(),
            role: claims.role.clone(),
            permissions: claims.permissions.clone().unwrap_or_default(),
        };
    };

    // An empty stored permission list is a real value, not a gap
    MergedProfile {
        sub: sub.to_string(),
        name: stored.name.clone().or_else(|| claims.name.clone()),
        email: stored.email.clone().or_else(|| claims.email.clone()),
        role: stored.role.clone().or_else(|| claims.role.clone()),
        permissions: stored.permissions.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> ProfileClaims {
        ProfileClaims {
            name: Some("Token Name".to_string()),
            email: Some("token@example.com".to_string()),
            role: Some("admin".to_string()),
            permissions: Some(vec!["clients:write".to_string()]),
        }
    }

    #[test]
    fn test_stored_profile_wins() {
        let stored = UserProfile {
            id: "u1".to_string(),
            name: Some("Stored Name".to_string()),
            email: None,
            role: Some("member".to_string()),
            permissions: vec![],
            ..Default::default()
        };

        let merged = merge_profile("u1", Some(&stored), &claims());
        assert_eq!(merged.name.as_deref(), Some("Stored Name"));
        // Gap filled from the token
        assert_eq!(merged.email.as_deref(), Some("token@example.com"));
        // A demotion in the stored profile is not undone by a stale token
        assert_eq!(merged.role.as_deref(), Some("member"));
        assert!(merged.permissions.is_empty());
        assert!(!merged.has_role("admin"));
    }

    #[test]
    fn test_claims_used_without_stored_profile() {
        let merged = merge_profile("u1", None, &claims());
        assert_eq!(merged.sub, "u1");
        assert!(merged.has_role("admin"));
        assert!(merged.has_permission("clients:write"));
    }

    #[test]
    fn test_userinfo_shape() {
        let merged = merge_profile("u1", None, &ProfileClaims::default());
        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["sub"], "u1");
        assert!(json["name"].is_null());
        assert_eq!(json["permissions"], serde_json::json!([]));
    }
}
