//! Component resource bundles sent to agents on deployment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::DmError;

/// Reads resource bundles from `<root>/<component name>/`.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    root: Option<PathBuf>,
}

impl ResourceStore {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Files of a component's bundle, base64 encoded and keyed by their
    /// `/`-separated path relative to the bundle directory.
    ///
    /// A missing root or bundle directory yields an empty bundle.
    pub async fn bundle(&self, component: &str) -> Result<BTreeMap<String, String>, DmError> {
        let mut files = BTreeMap::new();
        let Some(root) = &self.root else {
            return Ok(files);
        };
        let dir = root.join(component);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(files);
        }

        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| io_error(&current, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&current, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let content = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;
                    files.insert(relative_name(&dir, &path), STANDARD.encode(content));
                }
            }
        }
        Ok(files)
    }
}

fn relative_name(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(path: &Path, e: std::io::Error) -> DmError {
    DmError::Resources(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundle_reads_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let bundle = root.path().join("Tomcat");
        std::fs::create_dir_all(bundle.join("conf")).unwrap();
        std::fs::write(bundle.join("deploy.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::write(bundle.join("conf").join("server.xml"), b"<Server/>").unwrap();

        let store = ResourceStore::new(Some(root.path().to_path_buf()));
        let files = store.bundle("Tomcat").await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files["deploy.sh"], STANDARD.encode(b"#!/bin/sh\n"));
        assert_eq!(files["conf/server.xml"], STANDARD.encode(b"<Server/>"));
    }

    #[tokio::test]
    async fn test_missing_bundle_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = ResourceStore::new(Some(root.path().to_path_buf()));
        assert!(store.bundle("MySQL").await.unwrap().is_empty());
        assert!(ResourceStore::default().bundle("MySQL").await.unwrap().is_empty());
    }
}
