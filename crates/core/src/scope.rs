//! Authorization scopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Actions that can be granted on a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Delete,
    Pull,
    Push,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delete" => Some(Self::Delete),
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single access scope: a resource plus the actions granted on it.
///
/// The string form is `<type>:<name>:<action>,<action>,...`, as used in
/// `?scope=` query parameters and inside tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "name")]
    pub resource_name: String,
    pub actions: Vec<Action>,
}

impl Scope {
    pub fn new(resource_type: &str, resource_name: &str, actions: &[Action]) -> Self {
        let mut scope = Self {
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            actions: actions.to_vec(),
        };
        scope.normalize();
        scope
    }

    /// Parse the `type:name:actions` string form.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let resource_type = parts.next()?;
        let resource_name = parts.next()?;
        let actions = parts
            .next()?
            .split(',')
            .map(Action::parse)
            .collect::<Option<Vec<_>>>()?;
        if resource_name.is_empty() || actions.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, resource_name, &actions))
    }

    pub fn contains(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    fn normalize(&mut self) {
        self.actions.sort();
        self.actions.dedup();
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(Action::as_str).collect();
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            actions.join(",")
        )
    }
}

/// A deduplicated set of scopes.
///
/// Adding a scope whose `(type, name)` pair already exists merges the action
/// lists instead of producing a duplicate entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scope, merging actions into an existing entry for the same resource.
    pub fn add(&mut self, scope: Scope) {
        for existing in &mut self.scopes {
            if existing.resource_type == scope.resource_type
                && existing.resource_name == scope.resource_name
            {
                existing.actions.extend_from_slice(&scope.actions);
                existing.normalize();
                return;
            }
        }
        self.scopes.push(scope);
    }

    /// Whether this set grants `action` on the named resource.
    pub fn grants(&self, resource_type: &str, resource_name: &str, action: Action) -> bool {
        self.scopes.iter().any(|s| {
            s.resource_type == resource_type
                && s.resource_name == resource_name
                && s.contains(action)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    /// The normalized scope list, for embedding into a token.
    pub fn flatten(&self) -> Vec<Scope> {
        self.scopes.clone()
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        let mut set = Self::new();
        for scope in iter {
            set.add(scope);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let scope = Scope::parse("repository:lib/app:pull,push").unwrap();
        assert_eq!(scope.resource_type, "repository");
        assert_eq!(scope.resource_name, "lib/app");
        assert_eq!(scope.actions, vec![Action::Pull, Action::Push]);
        assert_eq!(scope.to_string(), "repository:lib/app:pull,push");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Scope::parse("repository:lib/app").is_none());
        assert!(Scope::parse("repository:lib/app:fly").is_none());
        assert!(Scope::parse("repository::pull").is_none());
    }

    #[test]
    fn test_scope_set_merges_actions() {
        let mut set = ScopeSet::new();
        set.add(Scope::new("repository", "lib/app", &[Action::Pull]));
        set.add(Scope::new("repository", "lib/app", &[Action::Push, Action::Pull]));
        set.add(Scope::new("repository", "lib/other", &[Action::Pull]));

        let flat = set.flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].actions, vec![Action::Pull, Action::Push]);
        assert!(set.grants("repository", "lib/app", Action::Push));
        assert!(!set.grants("repository", "lib/other", Action::Push));
    }
}
