//! Site directory: which sites a workspace publishes to, and what kind of
//! workspace it is.
//!
//! The directory is owned by the host application. The dispatcher asks it
//! for base URLs at send time, so a site that leaves after an event was
//! created is noticed on the next round.

use async_trait::async_trait;
use sitesync_core::{SiteId, WorkspaceId, WorkspaceKind};

use crate::error::DirectoryError;

/// An active site and where its webhook endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSite {
    pub site_id: SiteId,
    pub base_url: String,
}

impl TargetSite {
    pub fn new(site_id: impl Into<SiteId>, base_url: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            base_url: base_url.into(),
        }
    }
}

/// Source of active sites per workspace.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    /// Sites currently receiving webhooks for `workspace_id`.
    async fn active_sites(
        &self,
        workspace_id: &WorkspaceId,
    ) -> std::result::Result<Vec<TargetSite>, DirectoryError>;

    /// Kind of `workspace_id`, or `None` if the directory does not know it.
    async fn workspace_kind(
        &self,
        workspace_id: &WorkspaceId,
    ) -> std::result::Result<Option<WorkspaceKind>, DirectoryError>;
}

/// In-memory directory for tests and embedded use.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Debug, Default)]
    pub struct MemoryDirectory {
        sites: RwLock<HashMap<WorkspaceId, Vec<TargetSite>>>,
        kinds: RwLock<HashMap<WorkspaceId, WorkspaceKind>>,
        failing: RwLock<Option<String>>,
    }

    impl MemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add or replace a site.
        pub fn add_site(&self, workspace_id: &WorkspaceId, site: TargetSite) {
            let mut sites = self.sites.write().unwrap();
            let entry = sites.entry(workspace_id.clone()).or_default();
            entry.retain(|s| s.site_id != site.site_id);
            entry.push(site);
        }

        pub fn set_kind(&self, workspace_id: &WorkspaceId, kind: WorkspaceKind) {
            self.kinds.write().unwrap().insert(workspace_id.clone(), kind);
        }

        /// Make every lookup fail with `message` until cleared with `None`.
        pub fn set_failing(&self, message: Option<&str>) {
            *self.failing.write().unwrap() = message.map(str::to_string);
        }

        fn check(&self) -> std::result::Result<(), DirectoryError> {
            match self.failing.read().unwrap().as_ref() {
                Some(message) => Err(DirectoryError(message.clone())),
                None => Ok(()),
            }
        }

        pub fn remove_site(&self, workspace_id: &WorkspaceId, site_id: &SiteId) {
            let mut sites = self.sites.write().unwrap();
            if let Some(entry) = sites.get_mut(workspace_id) {
                entry.retain(|s| &s.site_id != site_id);
            }
        }
    }

    #[async_trait]
    impl SiteDirectory for MemoryDirectory {
        async fn active_sites(
            &self,
            workspace_id: &WorkspaceId,
        ) -> std::result::Result<Vec<TargetSite>, DirectoryError> {
            self.check()?;
            let sites = self.sites.read().unwrap();
            Ok(sites.get(workspace_id).cloned().unwrap_or_default())
        }

        async fn workspace_kind(
            &self,
            workspace_id: &WorkspaceId,
        ) -> std::result::Result<Option<WorkspaceKind>, DirectoryError> {
            self.check()?;
            Ok(self.kinds.read().unwrap().get(workspace_id).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryDirectory;
    use super::*;

    #[tokio::test]
    async fn test_add_replace_remove() {
        let dir = MemoryDirectory::new();
        let ws = WorkspaceId::new("ws");
        dir.add_site(&ws, TargetSite::new("a", "https://a.example"));
        dir.add_site(&ws, TargetSite::new("a", "https://a2.example"));
        dir.add_site(&ws, TargetSite::new("b", "https://b.example"));

        let sites = dir.active_sites(&ws).await.unwrap();
        assert_eq!(sites.len(), 2);
        assert!(sites.iter().any(|s| s.base_url == "https://a2.example"));

        dir.remove_site(&ws, &SiteId::new("a"));
        let sites = dir.active_sites(&ws).await.unwrap();
        assert_eq!(sites, vec![TargetSite::new("b", "https://b.example")]);

        assert!(dir
            .active_sites(&WorkspaceId::new("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failing_directory() {
        let dir = MemoryDirectory::new();
        let ws = WorkspaceId::new("ws");
        dir.set_failing(Some("directory offline"));
        assert_eq!(
            dir.active_sites(&ws).await.unwrap_err(),
            DirectoryError("directory offline".into())
        );
        dir.set_failing(None);
        assert!(dir.active_sites(&ws).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workspace_kind() {
        let dir = MemoryDirectory::new();
        let ws = WorkspaceId::new("ws");
        assert_eq!(dir.workspace_kind(&ws).await.unwrap(), None);
        dir.set_kind(&ws, WorkspaceKind::Blog);
        assert_eq!(dir.workspace_kind(&ws).await.unwrap(), Some(WorkspaceKind::Blog));
    }
}
