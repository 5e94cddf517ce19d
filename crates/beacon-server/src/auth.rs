//! Static token and directory implementations. Token issuance belongs to
//! the surrounding service; these satisfy the core's contracts for
//! single-process deployments and tests.

use beacon_types::{AuthProvider, AuthenticatedUser, UserDirectory};
use std::collections::HashMap;

/// Fixed token table: token → (user id, admin flag).
#[derive(Default)]
pub struct StaticAuthProvider {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        is_admin: bool,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id: user_id.into(),
                is_admin,
            },
        );
        self
    }

    /// Parse the `BEACON_TOKENS` format: comma-separated
    /// `token=user` or `token=user:admin` entries.
    pub fn from_spec(spec: &str) -> Self {
        let mut provider = Self::new();
        for entry in spec.split(',').filter(|entry| !entry.trim().is_empty()) {
            let Some((token, rest)) = entry.trim().split_once('=') else {
                continue;
            };
            let (user_id, is_admin) = match rest.split_once(':') {
                Some((user_id, flags)) => (user_id, flags == "admin"),
                None => (rest, false),
            };
            provider = provider.with_token(token, user_id, is_admin);
        }
        provider
    }
}

impl AuthProvider for StaticAuthProvider {
    fn verify(&self, token: &str) -> Option<AuthenticatedUser> {
        self.tokens.get(token).cloned()
    }
}

/// Fixed admin list.
#[derive(Default)]
pub struct StaticDirectory {
    admins: Vec<String>,
}

impl StaticDirectory {
    pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

impl UserDirectory for StaticDirectory {
    fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|admin| admin == user_id)
    }

    fn admin_user_ids(&self) -> Vec<String> {
        self.admins.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_verification() {
        let provider = StaticAuthProvider::new()
            .with_token("t1", "u1", false)
            .with_token("root-token", "root", true);

        assert_eq!(provider.verify("t1").unwrap().user_id, "u1");
        assert!(provider.verify("root-token").unwrap().is_admin);
        assert!(provider.verify("nope").is_none());
    }

    #[test]
    fn spec_parsing() {
        let provider = StaticAuthProvider::from_spec("t1=u1,root-token=root:admin, ,bad");
        assert_eq!(provider.verify("t1").unwrap().user_id, "u1");
        assert!(!provider.verify("t1").unwrap().is_admin);
        let root = provider.verify("root-token").unwrap();
        assert_eq!(root.user_id, "root");
        assert!(root.is_admin);
        assert!(provider.verify("bad").is_none());
    }

    #[test]
    fn directory_admins() {
        let directory = StaticDirectory::new(["root".to_string()]);
        assert!(directory.is_admin("root"));
        assert!(!directory.is_admin("u1"));
        assert_eq!(directory.admin_user_ids(), vec!["root"]);
    }
}
