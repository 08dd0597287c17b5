use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheKey, CasFileCache};
use crate::digest::Digest;
use crate::error::{Result, WorkerError};
use crate::instance::Instance;
use crate::messages::Directory;

/// Materializes an action's declared input tree into its execution
/// directory by hard-linking pinned cache entries.
pub struct InputMaterializer {
    instance: Arc<dyn Instance>,
    cache: Arc<CasFileCache>,
    tree_page_size: u32,
}

impl InputMaterializer {
    pub fn new(instance: Arc<dyn Instance>, cache: Arc<CasFileCache>, tree_page_size: u32) -> Self {
        Self {
            instance,
            cache,
            tree_page_size,
        }
    }

    /// Mirror the input tree under `exec_dir`. Every linked cache entry's
    /// key is appended to `pins`; the caller releases them as a group in
    /// the action's cleanup phase, whether or not this call succeeds.
    pub async fn fetch_inputs(
        &self,
        exec_dir: &Path,
        input_root: &Digest,
        pins: &mut Vec<CacheKey>,
    ) -> Result<()> {
        let index = self.fetch_tree_index(input_root).await?;
        self.link_inputs(exec_dir, input_root, &index, pins).await
    }

    /// Page through `get_tree` and index directories by digest. The first
    /// occurrence of a digest wins; duplicates are discarded.
    async fn fetch_tree_index(&self, input_root: &Digest) -> Result<HashMap<Digest, Directory>> {
        let mut directories = Vec::new();
        let mut page_token = String::new();
        loop {
            let (page, next_token) = self
                .instance
                .get_tree(input_root, self.tree_page_size, &page_token)
                .await?;
            directories.extend(page);
            if next_token.is_empty() {
                break;
            }
            page_token = next_token;
        }

        let mut index = HashMap::new();
        for directory in directories {
            let digest = directory.digest()?;
            index.entry(digest).or_insert(directory);
        }
        Ok(index)
    }

    /// Depth-first link pass. A directory absent from the index or a cache
    /// miss aborts the whole materialization.
    async fn link_inputs(
        &self,
        exec_dir: &Path,
        input_root: &Digest,
        index: &HashMap<Digest, Directory>,
        pins: &mut Vec<CacheKey>,
    ) -> Result<()> {
        let mut stack = vec![(exec_dir.to_path_buf(), input_root.clone())];
        while let Some((dir_path, digest)) = stack.pop() {
            let directory = index
                .get(&digest)
                .ok_or_else(|| WorkerError::MissingDirectory(digest.clone()))?;

            for file in &directory.files {
                let key = self.cache.put(&file.digest, file.is_executable).await?;
                pins.push(key.clone());
                tokio::fs::hard_link(self.cache.path(&key), dir_path.join(&file.name)).await?;
            }

            for subdir in &directory.directories {
                let child = dir_path.join(&subdir.name);
                tokio::fs::create_dir(&child).await?;
                stack.push((child, subdir.digest.clone()));
            }
        }
        Ok(())
    }

    /// Create parent directories for each declared output file. Declared
    /// output directories are not supported and abort the action before
    /// it executes.
    pub async fn verify_output_locations(
        &self,
        exec_dir: &Path,
        output_files: &[String],
        output_directories: &[String],
    ) -> Result<()> {
        for output_file in output_files {
            let path = exec_dir.join(output_file);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if let Some(output_directory) = output_directories.first() {
            tracing::warn!(
                output_directory = %output_directory,
                "Declared output directory is not supported"
            );
            return Err(WorkerError::OutputDirectoryUnsupported(
                output_directory.clone(),
            ));
        }

        Ok(())
    }
}
