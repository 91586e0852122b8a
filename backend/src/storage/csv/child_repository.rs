use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;

use super::connection::CsvConnection;
use crate::domain::models::Child as DomainChild;
use crate::io::rest::mappers::child_mapper::ChildMapper;
use crate::storage::traits::ChildStorage;
use shared::Child as SharedChild;

/// File-based child repository: one `child.yaml` per child directory
#[derive(Clone)]
pub struct ChildRepository {
    connection: CsvConnection,
}

impl ChildRepository {
    pub fn new(connection: CsvConnection) -> Self {
        Self { connection }
    }

    fn child_yaml_path(&self, child_id: &str) -> PathBuf {
        self.connection.child_directory(child_id).join("child.yaml")
    }

    fn load_child(&self, child_id: &str) -> Result<Option<DomainChild>> {
        let yaml_path = self.child_yaml_path(child_id);
        if !yaml_path.exists() {
            return Ok(None);
        }

        let yaml_content = fs::read_to_string(&yaml_path)?;
        let shared_child: SharedChild = serde_yaml::from_str(&yaml_content)
            .with_context(|| format!("Failed to parse {}", yaml_path.display()))?;
        let child = ChildMapper::to_domain(shared_child)
            .context("Failed to map shared child to domain child")?;
        Ok(Some(child))
    }
}

#[async_trait]
impl ChildStorage for ChildRepository {
    async fn store_child(&self, child: &DomainChild) -> Result<()> {
        self.connection.ensure_child_directory(&child.id)?;

        let yaml_content = serde_yaml::to_string(&ChildMapper::to_dto(child.clone()))?;
        self.connection
            .write_atomic(&self.child_yaml_path(&child.id), &yaml_content)?;

        info!("Stored child {} ({})", child.name, child.id);
        Ok(())
    }

    async fn get_child(&self, child_id: &str) -> Result<Option<DomainChild>> {
        // Ids come from URLs; never let one walk out of the children directory
        if child_id.is_empty() || child_id.contains(['/', '\\']) || child_id.starts_with('.') {
            return Ok(None);
        }
        self.load_child(child_id)
    }

    async fn list_children(&self) -> Result<Vec<DomainChild>> {
        let children_dir = self.connection.children_directory();
        if !children_dir.exists() {
            debug!("Children directory doesn't exist, returning empty list");
            return Ok(Vec::new());
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&children_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            let dir_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    warn!("Skipping directory with invalid name: {:?}", path);
                    continue;
                }
            };

            match self.load_child(&dir_name) {
                Ok(Some(child)) => children.push(child),
                Ok(None) => debug!("Directory {} doesn't contain a child", dir_name),
                Err(e) => warn!("Error loading child from directory {}: {}", dir_name, e),
            }
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Discovered {} children", children.len());
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::csv::test_utils::{sample_child, TestEnvironment};

    #[tokio::test]
    async fn test_store_and_get_child() {
        let env = TestEnvironment::new().await.unwrap();
        let repo = ChildRepository::new(env.connection.clone());

        let child = sample_child("child_1000", "Amani Okello");
        repo.store_child(&child).await.unwrap();

        let loaded = repo.get_child("child_1000").await.unwrap();
        assert_eq!(loaded, Some(child));
        assert!(env.base_path.join("children/child_1000/child.yaml").exists());
    }

    #[tokio::test]
    async fn test_missing_child_is_none() {
        let env = TestEnvironment::new().await.unwrap();
        let repo = ChildRepository::new(env.connection.clone());
        assert_eq!(repo.get_child("child_404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_path_like_ids_are_not_found() {
        let env = TestEnvironment::new().await.unwrap();
        let repo = ChildRepository::new(env.connection.clone());
        for id in ["", "../secret", "a/b", "..", ".hidden"] {
            assert_eq!(repo.get_child(id).await.unwrap(), None, "id {:?}", id);
        }
    }

    #[tokio::test]
    async fn test_list_children_sorted_by_name() {
        let env = TestEnvironment::new().await.unwrap();
        let repo = ChildRepository::new(env.connection.clone());
        assert!(repo.list_children().await.unwrap().is_empty());

        repo.store_child(&sample_child("child_2", "Zawadi")).await.unwrap();
        repo.store_child(&sample_child("child_1", "Amani")).await.unwrap();
        // Stray directory without child.yaml is skipped
        fs::create_dir_all(env.base_path.join("children/empty")).unwrap();

        let names: Vec<String> = repo
            .list_children()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Amani", "Zawadi"]);
    }
}
