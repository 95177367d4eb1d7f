//! Playbook and group records

use tracing::{debug, info};

use shepherd_api::{Group, Playbook};

use crate::error::CoreError;
use crate::store::Db;

/// Playbook and group management over the store
#[derive(Clone)]
pub struct Inventory {
    db: Db,
}

impl Inventory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or replace a playbook
    ///
    /// # Errors
    /// Returns a store error if the record cannot be saved
    pub async fn save_playbook(&self, playbook: &Playbook) -> Result<(), CoreError> {
        self.db.playbooks.save(playbook).await?;
        info!(playbook = %playbook.id, checksum = %playbook.checksum(), "playbook saved");
        Ok(())
    }

    /// Insert or replace a group
    ///
    /// # Errors
    /// Returns [`CoreError::PlaybookNotFound`] if the group names an unknown playbook
    pub async fn save_group(&self, group: &Group) -> Result<(), CoreError> {
        if let Some(playbook) = &group.playbook {
            self.require_playbook(playbook).await?;
        }
        self.db.groups.save(group).await?;
        info!(group = %group.name, hosts = group.hosts.len(), "group saved");
        Ok(())
    }

    /// Add `host` to `group`; returns whether it was newly added
    ///
    /// # Errors
    /// Returns [`CoreError::GroupNotFound`] if the group does not exist
    pub async fn add_host(&self, group: &str, host: &str) -> Result<bool, CoreError> {
        let mut record = self.require_group(group).await?;
        let added = record.add_host(host);
        if added {
            self.db.groups.save(&record).await?;
            info!(group = %group, host = %host, "host added to group");
        }
        Ok(added)
    }

    /// Remove `host` from `group`; returns whether it was a member
    ///
    /// # Errors
    /// Returns [`CoreError::GroupNotFound`] if the group does not exist
    pub async fn remove_host(&self, group: &str, host: &str) -> Result<bool, CoreError> {
        let mut record = self.require_group(group).await?;
        let removed = record.remove_host(host);
        if removed {
            self.db.groups.save(&record).await?;
            info!(group = %group, host = %host, "host removed from group");
        }
        Ok(removed)
    }

    /// Point `group` at `playbook`
    ///
    /// # Errors
    /// Returns [`CoreError::GroupNotFound`] or [`CoreError::PlaybookNotFound`]
    pub async fn assign_playbook(&self, group: &str, playbook: &str) -> Result<(), CoreError> {
        let mut record = self.require_group(group).await?;
        self.require_playbook(playbook).await?;

        record.playbook = Some(playbook.to_string());
        self.db.groups.save_fields(&["playbook"], &record).await?;
        info!(group = %group, playbook = %playbook, "playbook assigned");
        Ok(())
    }

    /// Load configured playbooks and groups, playbooks first
    ///
    /// Playbooks are overwritten. Groups already in the store are left
    /// alone so membership edits survive a restart.
    ///
    /// # Errors
    /// Returns the first record that fails to save
    pub async fn seed(&self, playbooks: &[Playbook], groups: &[Group]) -> Result<(), CoreError> {
        for playbook in playbooks {
            self.save_playbook(playbook).await?;
        }
        for group in groups {
            if self.db.groups.exists(&group.name).await? {
                debug!(group = %group.name, "group already stored, not seeding");
                continue;
            }
            self.save_group(group).await?;
        }
        Ok(())
    }

    async fn require_group(&self, name: &str) -> Result<Group, CoreError> {
        self.db
            .groups
            .find(name)
            .await?
            .ok_or_else(|| CoreError::GroupNotFound(name.to_string()))
    }

    async fn require_playbook(&self, id: &str) -> Result<(), CoreError> {
        if self.db.playbooks.exists(id).await? {
            Ok(())
        } else {
            Err(CoreError::PlaybookNotFound(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn inventory() -> Inventory {
        let inv = Inventory::new(Db::in_memory());
        inv.seed(
            &[Playbook::new("base", "- hosts: all")],
            &[Group::new("web")],
        )
        .await
        .unwrap();
        inv
    }

    #[tokio::test]
    async fn test_membership() {
        let inv = inventory().await;

        assert!(inv.add_host("web", "web1").await.unwrap());
        assert!(!inv.add_host("web", "web1").await.unwrap());
        assert!(inv.add_host("web", "web2").await.unwrap());
        assert!(inv.remove_host("web", "web1").await.unwrap());
        assert!(!inv.remove_host("web", "web1").await.unwrap());

        let group = inv.db.groups.find("web").await.unwrap().unwrap();
        assert_eq!(group.hosts, vec!["web2"]);
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let inv = inventory().await;
        let err = inv.add_host("db", "db1").await.unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn test_assign_playbook() {
        let inv = inventory().await;

        let err = inv.assign_playbook("web", "missing").await.unwrap_err();
        assert!(matches!(err, CoreError::PlaybookNotFound(_)));

        inv.assign_playbook("web", "base").await.unwrap();
        let group = inv.db.groups.find("web").await.unwrap().unwrap();
        assert_eq!(group.playbook.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn test_reseed_keeps_membership() {
        let inv = inventory().await;
        inv.add_host("web", "web1").await.unwrap();

        inv.seed(
            &[Playbook::new("base", "- hosts: web")],
            &[Group::new("web")],
        )
        .await
        .unwrap();

        let group = inv.db.groups.find("web").await.unwrap().unwrap();
        assert_eq!(group.hosts, vec!["web1"]);
        let playbook = inv.db.playbooks.find("base").await.unwrap().unwrap();
        assert_eq!(playbook.data, "- hosts: web");
    }

    #[tokio::test]
    async fn test_seed_rejects_dangling_playbook() {
        let inv = Inventory::new(Db::in_memory());
        let mut group = Group::new("web");
        group.playbook = Some("base".to_string());

        let err = inv.seed(&[], &[group]).await.unwrap_err();
        assert!(matches!(err, CoreError::PlaybookNotFound(_)));
    }
}
