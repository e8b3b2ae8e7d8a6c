//! Content-addressed artifact store.
//!
//! Workers attach files to task results; each bundle lands under
//! `data/artifacts/<cid>/` as a `manifest.json` plus a `files/` directory.
//! The cid is the hex sha-256 over the sorted per-file digests, so equal
//! bundles collapse to the same address.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use sos_types::{SosError, SosResult};

/// One file inside an artifact bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// File name inside `files/`.
    pub name: String,
    /// Hex sha-256 of the contents.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
}

/// The manifest written next to the payload files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Content id of the bundle.
    pub cid: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Per-file records, sorted by name.
    pub files: Vec<ArtifactFile>,
}

/// The on-disk artifact store.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if absent) the store rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> SosResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SosError::Internal(format!("create artifact root: {e}")))?;
        Ok(Self { root })
    }

    fn bundle_dir(&self, cid: &str) -> PathBuf {
        self.root.join(cid)
    }

    /// Store a bundle of named files; returns its content id.
    ///
    /// Storing the same contents twice is a no-op returning the same cid.
    pub async fn store(&self, files: &[(&str, &[u8])]) -> SosResult<String> {
        if files.is_empty() {
            return Err(SosError::Validation("artifact bundle cannot be empty".into()));
        }
        let mut records: Vec<(String, &[u8], String)> = files
            .iter()
            .map(|(name, bytes)| {
                if name.contains('/') || name.contains("..") {
                    return Err(SosError::Validation(format!(
                        "artifact name {name:?} must be a bare file name"
                    )));
                }
                let digest = hex::encode(Sha256::digest(bytes));
                Ok(((*name).to_owned(), *bytes, digest))
            })
            .collect::<SosResult<_>>()?;
        records.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (name, _, digest) in &records {
            hasher.update(name.as_bytes());
            hasher.update(digest.as_bytes());
        }
        let cid = hex::encode(hasher.finalize());

        let dir = self.bundle_dir(&cid);
        if tokio::fs::try_exists(dir.join("manifest.json"))
            .await
            .unwrap_or(false)
        {
            return Ok(cid);
        }

        let files_dir = dir.join("files");
        tokio::fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| SosError::Internal(format!("create bundle dir: {e}")))?;
        let mut manifest_files = Vec::with_capacity(records.len());
        for (name, bytes, digest) in &records {
            tokio::fs::write(files_dir.join(name), bytes)
                .await
                .map_err(|e| SosError::Internal(format!("write artifact {name}: {e}")))?;
            manifest_files.push(ArtifactFile {
                name: name.clone(),
                sha256: digest.clone(),
                size: bytes.len() as u64,
            });
        }
        let manifest = ArtifactManifest {
            cid: cid.clone(),
            created_at: Utc::now(),
            files: manifest_files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SosError::Internal(format!("serialize manifest: {e}")))?;
        // Manifest lands last, via rename: a bundle without a manifest is
        // invisible, never half-valid.
        let tmp = dir.join(".manifest.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SosError::Internal(format!("write manifest temp: {e}")))?;
        tokio::fs::rename(&tmp, dir.join("manifest.json"))
            .await
            .map_err(|e| SosError::Internal(format!("rename manifest: {e}")))?;
        debug!(cid = %cid, files = manifest.files.len(), "artifact bundle stored");
        Ok(cid)
    }

    /// Read a bundle's manifest.
    pub async fn manifest(&self, cid: &str) -> SosResult<ArtifactManifest> {
        let path = self.bundle_dir(cid).join("manifest.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SosError::NotFound(format!("artifact {cid}")))
            }
            Err(e) => return Err(SosError::Internal(format!("read manifest: {e}"))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SosError::Internal(format!("corrupt manifest {cid}: {e}")))
    }

    /// Read one file out of a bundle.
    pub async fn read_file(&self, cid: &str, name: &str) -> SosResult<Vec<u8>> {
        let manifest = self.manifest(cid).await?;
        if !manifest.files.iter().any(|f| f.name == name) {
            return Err(SosError::NotFound(format!("file {name} in artifact {cid}")));
        }
        tokio::fs::read(self.bundle_dir(cid).join("files").join(name))
            .await
            .map_err(|e| SosError::Internal(format!("read artifact file: {e}")))
    }
}
