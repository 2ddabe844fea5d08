//! In-memory [`RegistryClient`] double shared by copier/worker/orchestrator
//! tests. Not part of the public API; compiled only under `#[cfg(test)]`.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::registry::RegistryClient;
use crate::types::ManifestRecord;

#[derive(Default)]
pub(crate) struct MockRegistry {
    pub manifests: Mutex<HashMap<(String, String), ManifestRecord>>,
    pub blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub repositories: Vec<String>,
    pub tags: Mutex<HashMap<String, Vec<String>>>,
}

impl RegistryClient for MockRegistry {
    fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .repositories
            .iter()
            .filter(|repo| prefix.is_empty() || repo.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        Ok(self
            .tags
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    fn get_manifest(&self, repo: &str, reference: &str) -> Result<ManifestRecord> {
        self.manifests
            .lock()
            .unwrap()
            .get(&(repo.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(crate::error::RegistryError::NotFound(format!(
                    "{repo}:{reference}"
                )))
            })
    }

    fn put_manifest(&self, repo: &str, reference: &str, record: &ManifestRecord) -> Result<()> {
        self.manifests
            .lock()
            .unwrap()
            .insert((repo.to_string(), reference.to_string()), record.clone());
        Ok(())
    }

    fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .contains_key(&(repo.to_string(), digest.to_string())))
    }

    fn get_blob(&self, repo: &str, digest: &str) -> Result<Box<dyn Read + Send>> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&(repo.to_string(), digest.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!(crate::error::RegistryError::NotFound(format!("blob {digest}"))))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn put_blob(&self, repo: &str, digest: &str, _size: u64, mut reader: Box<dyn Read + Send>) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).context("failed to read blob body")?;
        self.blobs
            .lock()
            .unwrap()
            .insert((repo.to_string(), digest.to_string()), data);
        Ok(())
    }
}
