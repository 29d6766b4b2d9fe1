//! Versioned on-disk snapshot of the pool.
//!
//! One JSON document, written via temp file + fsync + rename so a crashed
//! writer never leaves a torn snapshot. The `version` field is the compat
//! gate: a file written by a newer release is a hard error, never a best
//! guess.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::pool::profile::{PooledProfile, ProfileStatus};
use crate::provider::Provider;

/// Highest snapshot schema this build reads and the version it writes.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    profiles: BTreeMap<String, PersistedProfile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedProfile {
    provider: Provider,
    profile_name: String,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refresh: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    error_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    error_message: String,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    priority: i32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

impl From<&PooledProfile> for PersistedProfile {
    fn from(p: &PooledProfile) -> Self {
        Self {
            provider: p.provider,
            profile_name: p.name.clone(),
            status: p.status.as_str().to_string(),
            token_expiry: p.token_expiry,
            last_refresh: p.last_refresh,
            last_check: p.last_check,
            last_used: p.last_used,
            cooldown_until: p.cooldown_until,
            error_count: p.error_count,
            error_message: p.error_message.clone(),
            priority: p.priority,
        }
    }
}

impl PersistedProfile {
    fn into_profile(self, key: &str) -> PooledProfile {
        let status = match ProfileStatus::from_tag(&self.status) {
            Some(status) => status,
            None => {
                tracing::warn!(
                    key = key,
                    tag = self.status.as_str(),
                    "Unrecognized status tag in state file; treating as unknown"
                );
                ProfileStatus::Unknown
            }
        };
        PooledProfile {
            provider: self.provider,
            name: self.profile_name,
            status,
            token_expiry: self.token_expiry,
            last_refresh: self.last_refresh,
            last_check: self.last_check,
            last_used: self.last_used,
            cooldown_until: self.cooldown_until,
            error_count: self.error_count,
            error_message: self.error_message,
            priority: self.priority,
        }
    }
}

/// Serialize `profiles` and atomically replace the snapshot at `path`.
pub async fn save(path: &Path, profiles: &BTreeMap<String, PooledProfile>) -> Result<()> {
    let state = PersistedState {
        version: STATE_VERSION,
        updated_at: Utc::now(),
        profiles: profiles
            .iter()
            .map(|(key, profile)| (key.clone(), PersistedProfile::from(profile)))
            .collect(),
    };
    let payload = serde_json::to_vec_pretty(&state).map_err(|e| Error::parse("state file", e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ =
                tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await;
        }
    }

    let tmp = path.with_file_name(format!(
        "auth_pool_state.{}.{}.tmp",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let write_result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io(format!("creating {}", tmp.display()), e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(format!("syncing {}", tmp.display()), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await;
        }
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::io(format!("replacing {}", path.display()), e))
    }
    .await;

    if write_result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    write_result
}

/// Load the snapshot at `path`. A missing file is an empty pool; malformed
/// JSON and newer-versioned files are errors.
pub async fn load(path: &Path) -> Result<BTreeMap<String, PooledProfile>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
    };
    parse(&bytes)
}

/// Parse snapshot bytes from any reader-shaped source.
pub fn load_from_slice(bytes: &[u8]) -> Result<BTreeMap<String, PooledProfile>> {
    parse(bytes)
}

fn parse(bytes: &[u8]) -> Result<BTreeMap<String, PooledProfile>> {
    let state: PersistedState =
        serde_json::from_slice(bytes).map_err(|e| Error::parse("state file", e))?;
    if state.version > STATE_VERSION {
        return Err(Error::VersionNewer {
            found: state.version,
            supported: STATE_VERSION,
        });
    }
    Ok(state
        .profiles
        .into_iter()
        .map(|(key, persisted)| {
            let profile = persisted.into_profile(&key);
            (key, profile)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn sample() -> BTreeMap<String, PooledProfile> {
        let mut alice = PooledProfile::new(Provider::Claude, "alice");
        alice.status = ProfileStatus::Ready;
        alice.token_expiry = Some(Utc::now() + ChronoDuration::hours(1));
        alice.priority = 2;

        let mut bob = PooledProfile::new(Provider::Codex, "bob");
        bob.status = ProfileStatus::Cooldown;
        bob.cooldown_until = Some(Utc::now() + ChronoDuration::minutes(30));

        let mut charlie = PooledProfile::new(Provider::Gemini, "charlie");
        charlie.status = ProfileStatus::Error;
        charlie.error_count = 3;
        charlie.error_message = "test error".to_string();

        [alice, bob, charlie]
            .into_iter()
            .map(|p| (p.key(), p))
            .collect()
    }

    #[tokio::test]
    async fn save_load_roundtrip_preserves_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("auth_pool_state.json");
        let original = sample();

        save(&path, &original).await.unwrap();
        let loaded = load(&path).await.unwrap();

        assert_eq!(loaded.len(), original.len());
        for (key, profile) in &original {
            let got = loaded.get(key).unwrap();
            assert_eq!(got.status, profile.status, "{key}");
            assert_eq!(got.priority, profile.priority);
            assert_eq!(got.error_count, profile.error_count);
            assert_eq!(got.error_message, profile.error_message);
            assert_eq!(got.token_expiry, profile.token_expiry);
            assert_eq!(got.cooldown_until, profile.cooldown_until);
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let loaded = load(&tmp.path().join("nope.json")).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_pool_state.json");
        tokio::fs::write(&path, b"{invalid json").await.unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parsing state file"), "{err}");
    }

    #[tokio::test]
    async fn newer_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_pool_state.json");
        tokio::fs::write(
            &path,
            br#"{"version": 999, "updated_at": "2025-01-01T00:00:00Z", "profiles": {}}"#,
        )
        .await
        .unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, Error::VersionNewer { found: 999, .. }));
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn unknown_status_tag_maps_to_unknown() {
        let raw = br#"{
            "version": 1,
            "updated_at": "2025-01-01T00:00:00Z",
            "profiles": {
                "claude:alice": {
                    "provider": "claude",
                    "profile_name": "alice",
                    "status": "hibernating"
                }
            }
        }"#;
        let loaded = load_from_slice(raw).unwrap();
        assert_eq!(
            loaded.get("claude:alice").unwrap().status,
            ProfileStatus::Unknown
        );
    }

    #[test]
    fn omitted_fields_map_to_zero_values() {
        let raw = br#"{
            "version": 1,
            "updated_at": "2025-01-01T00:00:00Z",
            "profiles": {
                "codex:bob": {
                    "provider": "codex",
                    "profile_name": "bob",
                    "status": "ready"
                }
            }
        }"#;
        let loaded = load_from_slice(raw).unwrap();
        let bob = loaded.get("codex:bob").unwrap();
        assert_eq!(bob.error_count, 0);
        assert_eq!(bob.priority, 0);
        assert!(bob.token_expiry.is_none());
        assert!(bob.last_used.is_none());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_pool_state.json");
        save(&path, &sample()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
