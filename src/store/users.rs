//! User profile management

use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::game::UserId;

use super::{read_json, StoreError};

/// User profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

/// Lookup of known users
pub trait UserDirectory: Send + Sync {
    fn find(&self, user_id: UserId) -> Option<UserProfile>;
}

/// Profile store operations
#[derive(Default)]
pub struct UserStore {
    profiles: DashMap<UserId, UserProfile>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from a JSON array of profiles
    pub fn load_json(&self, path: &Path) -> Result<usize, StoreError> {
        let profiles: Vec<UserProfile> = read_json(path)?;
        let count = profiles.len();
        for profile in profiles {
            self.insert(profile);
        }
        info!(count, path = %path.display(), "Loaded user profiles");
        Ok(count)
    }

    /// Create a profile with a fresh id
    pub fn register(&self, username: &str) -> UserProfile {
        let profile = UserProfile {
            id: UserId::new(),
            username: username.to_string(),
        };
        self.insert(profile.clone());
        info!(user_id = %profile.id, username, "User registered");
        profile
    }

    pub fn insert(&self, profile: UserProfile) {
        self.profiles.insert(profile.id, profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }
}

impl UserDirectory for UserStore {
    fn find(&self, user_id: UserId) -> Option<UserProfile> {
        self.profiles.get(&user_id).map(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_find() {
        let store = UserStore::new();
        let profile = store.register("alice");

        assert_eq!(store.find(profile.id), Some(profile));
        assert_eq!(store.find(UserId::new()), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_json_reports_missing_file() {
        let store = UserStore::new();
        let result = store.load_json(Path::new("/nonexistent/users.json"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }
}
