//! Authentication table: username → salt, password hash and content blob

use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;

/// A registered account
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
    pub salt: [u8; SALT_LEN],
    pub pass_hash: [u8; HASH_LEN],
    pub content: Bytes,
}

impl User {
    /// Create a user with a fresh random salt and empty content
    pub fn new(name: &str, password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            name: name.to_string(),
            salt,
            pass_hash: hash_password(password, &salt),
            content: Bytes::new(),
        }
    }

    pub fn verify(&self, password: &str) -> bool {
        hash_password(password, &self.salt) == self.pass_hash
    }
}

/// SHA-256 over `password || salt`
pub fn hash_password(password: &str, salt: &[u8; SALT_LEN]) -> [u8; HASH_LEN] {
    let digest = Sha256::new()
        .chain_update(password.as_bytes())
        .chain_update(salt)
        .finalize();
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest);
    hash
}

/// Thread-safe table of users
///
/// Mutating calls take a `commit` closure that runs under the table's write
/// lock after validation and before the change is applied, so the caller can
/// persist the change in the same order it becomes visible. If `commit`
/// fails the table is left untouched.
#[derive(Default)]
pub struct AuthTable {
    users: RwLock<HashMap<String, User>>,
}

impl AuthTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new user. Returns `Ok(false)` if the name is taken.
    pub fn register_with<F>(&self, name: &str, password: &str, commit: F) -> Result<bool>
    where
        F: FnOnce(&User) -> Result<()>,
    {
        let mut users = self.users.write();
        if users.contains_key(name) {
            return Ok(false);
        }
        let user = User::new(name, password);
        commit(&user)?;
        users.insert(user.name.clone(), user);
        Ok(true)
    }

    pub fn authenticate(&self, name: &str, password: &str) -> bool {
        self.users
            .read()
            .get(name)
            .map_or(false, |user| user.verify(password))
    }

    /// Replace a user's content. Returns `Ok(false)` for an unknown user.
    pub fn set_content_with<F>(&self, name: &str, content: Bytes, commit: F) -> Result<bool>
    where
        F: FnOnce(&str, &[u8]) -> Result<()>,
    {
        let mut users = self.users.write();
        match users.get_mut(name) {
            Some(user) => {
                commit(&user.name, &content)?;
                user.content = content;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn content(&self, name: &str) -> Option<Bytes> {
        self.users.read().get(name).map(|user| user.content.clone())
    }

    /// Registered usernames, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Run `f` over every user while holding the read lock
    pub fn with_users<R>(&self, f: impl FnOnce(&mut dyn Iterator<Item = &User>) -> R) -> R {
        let users = self.users.read();
        let mut iter = users.values();
        f(&mut iter)
    }

    /// Install a user read back from the log, replacing any earlier record
    pub fn restore(&self, user: User) {
        self.users.write().insert(user.name.clone(), user);
    }

    /// Apply a logged content change. Returns false if the user is unknown.
    pub fn restore_content(&self, name: &str, content: Bytes) -> bool {
        match self.users.write().get_mut(name) {
            Some(user) => {
                user.content = content;
                true
            }
            None => false,
        }
    }
}
