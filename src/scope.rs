//! Scope registry
//!
//! The static table of scopes this authority knows about and which downstream
//! services honour each one. Built once at startup and shared read-only.

use crate::constants::{SCOPE_OPENID, SCOPE_WILDCARD};
use crate::error::OAuthError;
use crate::{AuthorityError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A named permission a client may request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Services that honour this scope; `"*"` means all of them
    #[serde(default = "wildcard_services")]
    pub services: Vec<String>,
}

fn wildcard_services() -> Vec<String> {
    vec![SCOPE_WILDCARD.to_string()]
}

impl ScopeDefinition {
    pub fn new(name: &str, description: &str, services: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.services.iter().any(|s| s == SCOPE_WILDCARD)
    }
}

/// Built-in scopes used when configuration does not provide any
pub fn default_scopes() -> Vec<ScopeDefinition> {
    vec![
        ScopeDefinition::new(SCOPE_OPENID, "Verify your identity", &[SCOPE_WILDCARD]),
        ScopeDefinition::new("profile", "Read your name and role", &[SCOPE_WILDCARD]),
        ScopeDefinition::new("email", "Read your email address", &[SCOPE_WILDCARD]),
        ScopeDefinition::new("admin", "Administer registered clients", &["authority"]),
    ]
}

/// Read-only scope lookup table
#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    // Declaration order is kept for discovery output.
    ordered: Vec<ScopeDefinition>,
    by_name: HashMap<String, usize>,
}

impl ScopeRegistry {
    /// Build the registry, rejecting duplicate or empty names
    pub fn new(definitions: Vec<ScopeDefinition>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            if def.name.is_empty() || def.name.contains(char::is_whitespace) {
                return Err(AuthorityError::config(format!(
                    "invalid scope name '{}'",
                    def.name
                )));
            }
            if def.services.is_empty() {
                return Err(AuthorityError::config(format!(
                    "scope '{}' must name at least one service",
                    def.name
                )));
            }
            if by_name.insert(def.name.clone(), idx).is_some() {
                return Err(AuthorityError::config(format!(
                    "duplicate scope '{}'",
                    def.name
                )));
            }
        }

        Ok(Self {
            ordered: definitions,
            by_name,
        })
    }

    /// Registry with the built-in scope set
    pub fn with_defaults() -> Self {
        let ordered = default_scopes();
        let by_name = ordered
            .iter()
            .enumerate()
            .map(|(idx, def)| (def.name.clone(), idx))
            .collect();
        Self { ordered, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ScopeDefinition> {
        self.by_name.get(name).map(|&idx| &self.ordered[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.ordered.iter().map(|d| d.name.clone()).collect()
    }

    pub fn definitions(&self) -> &[ScopeDefinition] {
        &self.ordered
    }

    /// Split a space-delimited scope parameter, dropping duplicates
    pub fn parse(scope_param: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        scope_param
            .split_whitespace()
            .filter(|s| seen.insert(*s))
            .map(str::to_string)
            .collect()
    }

    /// Fail with `InvalidScope` naming the first unknown scope
    pub fn ensure_known<S: AsRef<str>>(&self, scopes: &[S]) -> std::result::Result<(), OAuthError> {
        match scopes.iter().find(|s| !self.contains(s.as_ref())) {
            Some(unknown) => Err(OAuthError::InvalidScope(format!(
                "unknown scope '{}'",
                unknown.as_ref()
            ))),
            None => Ok(()),
        }
    }

    /// Services that honour any of the given scopes, used as token audience
    pub fn audiences<S: AsRef<str>>(&self, scopes: &[S]) -> Vec<String> {
        let mut services = BTreeSet::new();
        for scope in scopes {
            if let Some(def) = self.get(scope.as_ref()) {
                if def.is_wildcard() {
                    return vec![SCOPE_WILDCARD.to_string()];
                }
                services.extend(def.services.iter().cloned());
            }
        }
        services.into_iter().collect()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ScopeRegistry {
        ScopeRegistry::new(vec![
            ScopeDefinition::new("openid", "", &["*"]),
            ScopeDefinition::new("documents:read", "", &["documents"]),
            ScopeDefinition::new("billing", "", &["billing", "reports"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_dedupes_and_keeps_order() {
        assert_eq!(
            ScopeRegistry::parse("openid  profile openid\temail"),
            vec!["openid", "profile", "email"]
        );
        assert!(ScopeRegistry::parse("   ").is_empty());
    }

    #[test]
    fn test_ensure_known() {
        let reg = registry();
        assert!(reg.ensure_known(&["openid", "billing"]).is_ok());
        let err = reg.ensure_known(&["openid", "wat"]).unwrap_err();
        assert_eq!(err.error_code(), "invalid_scope");
    }

    #[test]
    fn test_audiences_union_and_wildcard() {
        let reg = registry();
        assert_eq!(
            reg.audiences(&["documents:read", "billing"]),
            vec!["billing", "documents", "reports"]
        );
        assert_eq!(reg.audiences(&["openid", "billing"]), vec!["*"]);
        assert!(reg.audiences(&["unknown"]).is_empty());
    }

    #[test]
    fn test_rejects_duplicates_and_bad_names() {
        assert!(
            ScopeRegistry::new(vec![
                ScopeDefinition::new("a", "", &["*"]),
                ScopeDefinition::new("a", "", &["*"]),
            ])
            .is_err()
        );
        assert!(ScopeRegistry::new(vec![ScopeDefinition::new("a b", "", &["*"])]).is_err());
        assert!(ScopeRegistry::new(vec![ScopeDefinition::new("a", "", &[])]).is_err());
    }

    #[test]
    fn test_defaults_include_openid() {
        let reg = ScopeRegistry::default();
        assert!(reg.contains("openid"));
        assert_eq!(reg.names()[0], "openid");
    }
}
