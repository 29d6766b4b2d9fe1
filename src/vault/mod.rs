//! On-disk profile vault: backup, restore, and active-profile detection.
//!
//! Layout under the vault root:
//!
//! ```text
//! <root>/<provider>/<name>/<auth-file>...
//! <root>/<provider>/<name>/meta.json
//! ```
//!
//! The vault is single-writer. Every operation re-derives the profile
//! directory from validated components and refuses anything that would
//! resolve outside the root, without following symlinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::provider::{is_system_profile, validate_profile_name, FileSet, Provider};

pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    User,
    Auto,
}

/// Sidecar metadata written next to the backed-up auth files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMeta {
    pub tool: Provider,
    pub profile: String,
    pub backed_up_at: DateTime<Utc>,
    /// File names (not paths) captured by the backup, in copy order.
    pub files: Vec<String>,
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    pub created_by: CreatedBy,
}

/// One `(provider, name)` pair present in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEntry {
    pub provider: Provider,
    pub name: String,
    pub kind: ProfileKind,
}

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    cancel: CancellationToken,
}

impl Vault {
    /// Open a vault rooted at `root`. The directory is created lazily by the
    /// first backup; opening never touches the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self {
            root,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie every operation of this handle to `token`: once cancelled, I/O
    /// entry points and per-file steps return [`Error::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.root
    }

    /// Absolute directory for `(provider, name)`, after component validation
    /// and the escape check. This is the only way paths are derived; every
    /// operation funnels through it.
    pub fn profile_path(&self, provider: Provider, name: &str) -> Result<PathBuf> {
        validate_profile_name(name)?;
        let path = self.root.join(provider.as_str()).join(name);
        if path != self.root && !path.starts_with(&self.root) {
            return Err(Error::PathEscape(name.to_string()));
        }
        Ok(path)
    }

    /// Capture every present file of `set` into the profile directory.
    ///
    /// Fails without leaving a partial directory behind if a required source
    /// is missing, and fails if nothing at all was copied.
    pub async fn backup(&self, set: &FileSet, profile: &str) -> Result<ProfileMeta> {
        self.backup_as(set, profile, CreatedBy::User).await
    }

    /// Like [`Vault::backup`], with an explicit origin recorded in meta.json.
    /// Automatic safety snapshots pass [`CreatedBy::Auto`].
    pub async fn backup_as(
        &self,
        set: &FileSet,
        profile: &str,
        created_by: CreatedBy,
    ) -> Result<ProfileMeta> {
        self.ensure_live()?;
        let dir = self.profile_path(set.tool, profile)?;
        let existed = fs::try_exists(&dir).await.unwrap_or(false);

        create_dir_private(&dir).await?;

        let result = self.copy_sources(set, &dir).await;
        let copied = match result {
            Ok(copied) => copied,
            Err(e) => {
                if !existed {
                    let _ = fs::remove_dir_all(&dir).await;
                }
                return Err(e);
            }
        };

        if copied.is_empty() {
            if !existed {
                let _ = fs::remove_dir_all(&dir).await;
            }
            return Err(Error::NothingToBackup(set.tool.key(profile)));
        }

        let meta = ProfileMeta {
            tool: set.tool,
            profile: profile.to_string(),
            backed_up_at: Utc::now(),
            files: copied,
            kind: if is_system_profile(profile) {
                ProfileKind::System
            } else {
                ProfileKind::User
            },
            created_by,
        };

        let payload = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::parse(format!("meta.json for {profile}"), e))?;
        write_file_atomic(&dir.join(META_FILE), &payload).await?;

        tracing::info!(
            provider = %set.tool,
            profile = profile,
            files = meta.files.len(),
            "Backed up auth files"
        );
        Ok(meta)
    }

    async fn copy_sources(&self, set: &FileSet, dir: &Path) -> Result<Vec<String>> {
        let mut copied = Vec::new();
        for file in &set.files {
            self.ensure_live()?;
            let present = fs::try_exists(&file.path).await.unwrap_or(false);
            if !present {
                if file.required {
                    return Err(Error::MissingAuthFile(file.path.clone()));
                }
                continue;
            }
            let name = file_name(&file.path)?;
            let bytes = fs::read(&file.path)
                .await
                .map_err(|e| Error::io(format!("reading {}", file.path.display()), e))?;
            write_file_atomic(&dir.join(&name), &bytes).await?;
            copied.push(name);
        }
        Ok(copied)
    }

    /// Write the vault copies back to each source's canonical path.
    ///
    /// Parent directories are created as needed; existing files are
    /// overwritten in place, nothing else at the target is touched.
    pub async fn restore(&self, set: &FileSet, profile: &str) -> Result<()> {
        self.ensure_live()?;
        let dir = self.profile_path(set.tool, profile)?;
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::NotFound(format!(
                "profile {}",
                set.tool.key(profile)
            )));
        }

        for file in &set.files {
            self.ensure_live()?;
            let name = file_name(&file.path)?;
            let stored = dir.join(&name);
            if !fs::try_exists(&stored).await.unwrap_or(false) {
                if file.required {
                    return Err(Error::MissingAuthFile(stored));
                }
                continue;
            }
            if let Some(parent) = file.path.parent() {
                create_dir_private(parent).await?;
            }
            let bytes = fs::read(&stored)
                .await
                .map_err(|e| Error::io(format!("reading {}", stored.display()), e))?;
            write_file_atomic(&file.path, &bytes).await?;
        }

        tracing::info!(provider = %set.tool, profile = profile, "Restored auth files");
        Ok(())
    }

    /// Profile names stored for one provider, sorted.
    pub async fn list(&self, provider: Provider) -> Result<Vec<String>> {
        self.ensure_live()?;
        let dir = self.root.join(provider.as_str());
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Error::io(format!("listing {}", dir.display()), e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("listing {}", dir.display()), e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_profile_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every `(provider, name)` in the vault, sorted by provider then name.
    pub async fn list_all(&self) -> Result<Vec<VaultEntry>> {
        let mut out = Vec::new();
        for provider in Provider::ALL {
            for name in self.list(provider).await? {
                let kind = match self.meta(provider, &name).await {
                    Ok(meta) => meta.kind,
                    Err(_) => {
                        if is_system_profile(&name) {
                            ProfileKind::System
                        } else {
                            ProfileKind::User
                        }
                    }
                };
                out.push(VaultEntry {
                    provider,
                    name,
                    kind,
                });
            }
        }
        Ok(out)
    }

    /// Parsed meta.json for a stored profile.
    pub async fn meta(&self, provider: Provider, profile: &str) -> Result<ProfileMeta> {
        self.ensure_live()?;
        let path = self.profile_path(provider, profile)?.join(META_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "meta for {}",
                    provider.key(profile)
                )))
            }
            Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::parse(format!("meta.json for {}", provider.key(profile)), e))
    }

    /// Delete a stored profile. Refuses system profiles.
    pub async fn delete(&self, provider: Provider, profile: &str) -> Result<()> {
        if is_system_profile(profile) {
            return Err(Error::Protected(profile.to_string()));
        }
        self.delete_force(provider, profile).await
    }

    /// Delete a stored profile, system profiles included.
    pub async fn delete_force(&self, provider: Provider, profile: &str) -> Result<()> {
        self.ensure_live()?;
        let dir = self.profile_path(provider, profile)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(provider = %provider, profile = profile, "Deleted vault profile");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "profile {}",
                provider.key(profile)
            ))),
            Err(e) => Err(Error::io(format!("deleting {}", dir.display()), e)),
        }
    }

    /// Which stored profile, if any, matches the live auth files.
    ///
    /// A profile matches iff every currently-present source file has a
    /// byte-identical counterpart in its directory. With no source files
    /// present there is nothing to compare and the answer is `None`.
    pub async fn active_profile(&self, set: &FileSet) -> Result<Option<String>> {
        self.ensure_live()?;
        let mut live = BTreeMap::new();
        for file in &set.files {
            if fs::try_exists(&file.path).await.unwrap_or(false) {
                let name = file_name(&file.path)?;
                live.insert(name, hash_file(&file.path).await?);
            }
        }
        if live.is_empty() {
            return Ok(None);
        }

        for candidate in self.list(set.tool).await? {
            self.ensure_live()?;
            let dir = self.profile_path(set.tool, &candidate)?;
            let mut matches = true;
            for (name, live_hash) in &live {
                let stored = dir.join(name);
                if !fs::try_exists(&stored).await.unwrap_or(false) {
                    matches = false;
                    break;
                }
                if &hash_file(&stored).await? != live_hash {
                    matches = false;
                    break;
                }
            }
            if matches {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))
}

async fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| Error::io(format!("hashing {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

async fn create_dir_private(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await;
    }
    Ok(())
}

/// Write via a temp file in the destination directory, then rename over the
/// target. Readers never observe a torn file.
async fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = file_name(path)?;
    let tmp = path.with_file_name(format!(
        "{}.{}.{}.tmp",
        name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    if let Err(e) = fs::write(&tmp, bytes).await {
        return Err(Error::io(format!("writing {}", tmp.display()), e));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await;
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(Error::io(format!("replacing {}", path.display()), e));
    }
    Ok(())
}
