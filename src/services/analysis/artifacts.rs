use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const MAX_JOB_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Store-relative `<job_id>/<name>` locator.
    pub locator: String,
    pub sha256: String,
    pub size: u64,
}

/// Write-once local blob store. Each artifact lands with a temp file + rename, so readers
/// see either the previous complete blob or the new complete blob.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locator(job_id: &str, name: &str) -> String {
        format!("{job_id}/{name}")
    }

    pub fn resolve(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }

    pub async fn exists(&self, locator: &str) -> bool {
        tokio::fs::try_exists(self.resolve(locator))
            .await
            .unwrap_or(false)
    }

    pub async fn write_json<T: Serialize>(
        &self,
        job_id: &str,
        name: &str,
        value: &T,
    ) -> Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("failed to encode artifact JSON")?;
        self.write_bytes(job_id, name, &bytes).await
    }

    pub async fn write_bytes(&self, job_id: &str, name: &str, bytes: &[u8]) -> Result<StoredArtifact> {
        let locator = Self::locator(job_id, name);
        let path = self.resolve(&locator);
        let dir = self.root.join(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;

        let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("failed to publish {}", path.display()));
        }

        Ok(StoredArtifact {
            locator,
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
        })
    }

    pub async fn read(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.resolve(locator);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest;
    use std::fmt::Write;
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Job ids double as directory names in the blob store.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= MAX_JOB_ID_LEN
        && job_id != "."
        && job_id != ".."
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Strips characters that are unsafe in file names (`\ / * ? : " < > |`).
pub fn sanitize_file_component(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect()
}
