//! API key records
//!
//! Keys are stored by token; names are unique and used by operators to
//! rotate or delete them.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::info;

use shepherd_api::Key;

use crate::error::CoreError;
use crate::store::Collection;

/// Key management over the key collection
#[derive(Clone)]
pub struct KeyRing {
    keys: Arc<dyn Collection<Key>>,
}

impl KeyRing {
    pub fn new(keys: Arc<dyn Collection<Key>>) -> Self {
        Self { keys }
    }

    /// Issue a new key for `name`
    ///
    /// # Errors
    /// Returns [`CoreError::KeyExists`] if `name` is taken, or a store error
    pub async fn create(&self, name: &str) -> Result<Key, CoreError> {
        if self.find_by_name(name).await?.is_some() {
            return Err(CoreError::KeyExists(name.to_string()));
        }

        let key = Key {
            name: name.to_string(),
            token: make_token(),
            created_at: Utc::now(),
            created_by: local_user(),
        };
        self.keys.save(&key).await?;

        info!(key = %name, created_by = %key.created_by, "key created");
        Ok(key)
    }

    /// Every key, ordered by name
    ///
    /// # Errors
    /// Returns a store error if the collection cannot be read
    pub async fn list(&self) -> Result<Vec<Key>, CoreError> {
        let mut keys = self.keys.find_all().await?;
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }

    /// Replace the token of `name`, keeping its name and provenance
    ///
    /// # Errors
    /// Returns [`CoreError::KeyNotFound`] if no key has this name
    pub async fn rotate(&self, name: &str) -> Result<Key, CoreError> {
        let old = self
            .find_by_name(name)
            .await?
            .ok_or_else(|| CoreError::KeyNotFound(name.to_string()))?;

        let key = Key {
            token: make_token(),
            ..old.clone()
        };
        self.keys.save(&key).await?;
        self.keys.delete(&old.token).await?;

        info!(key = %name, "key rotated");
        Ok(key)
    }

    /// Delete the key called `name`; returns whether it existed
    ///
    /// # Errors
    /// Returns a store error if the collection cannot be updated
    pub async fn delete(&self, name: &str) -> Result<bool, CoreError> {
        let Some(key) = self.find_by_name(name).await? else {
            return Ok(false);
        };

        let existed = self.keys.delete(&key.token).await?;
        if existed {
            info!(key = %name, "key deleted");
        }
        Ok(existed)
    }

    /// Resolve a presented token to its key
    ///
    /// # Errors
    /// Returns a store error if the collection cannot be read
    pub async fn authenticate(&self, token: &str) -> Result<Option<Key>, CoreError> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self.keys.find(token).await?)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Key>, CoreError> {
        Ok(self
            .keys
            .find_all()
            .await?
            .into_iter()
            .find(|k| k.name == name))
    }
}

/// 32 random bytes, hex encoded
fn make_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

fn local_user() -> String {
    let user = std::env::var("USER").unwrap_or_default();
    format!("{user}@localhost")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;

    fn ring() -> KeyRing {
        KeyRing::new(Arc::new(MemoryCollection::<Key>::new()))
    }

    #[test]
    fn test_token_shape() {
        let a = make_token();
        let b = make_token();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let keys = ring();
        let key = keys.create("ci").await.unwrap();

        assert!(key.created_by.ends_with("@localhost"));
        assert_eq!(keys.authenticate(&key.token).await.unwrap(), Some(key));
        assert!(keys.authenticate("").await.unwrap().is_none());
        assert!(keys.authenticate("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let keys = ring();
        keys.create("ci").await.unwrap();

        let err = keys.create("ci").await.unwrap_err();
        assert!(matches!(err, CoreError::KeyExists(_)));
    }

    #[tokio::test]
    async fn test_rotate_invalidates_old_token() {
        let keys = ring();
        let old = keys.create("ci").await.unwrap();
        let new = keys.rotate("ci").await.unwrap();

        assert_ne!(old.token, new.token);
        assert_eq!(new.name, "ci");
        assert_eq!(new.created_at, old.created_at);
        assert!(keys.authenticate(&old.token).await.unwrap().is_none());
        assert_eq!(keys.list().await.unwrap(), vec![new]);
    }

    #[tokio::test]
    async fn test_rotate_unknown() {
        let err = ring().rotate("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_by_name() {
        let keys = ring();
        keys.create("a").await.unwrap();
        keys.create("b").await.unwrap();

        assert!(keys.delete("a").await.unwrap());
        assert!(!keys.delete("a").await.unwrap());

        let names: Vec<_> = keys.list().await.unwrap().into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["b"]);
    }
}
