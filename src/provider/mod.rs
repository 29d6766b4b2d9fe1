//! The fixed provider set and each provider's on-disk auth file layout.
//!
//! Every supported coding CLI keeps its bearer/refresh tokens in a small,
//! well-known set of files under the user's home directory. The [`FileSet`]
//! for a provider is the authoritative list of those paths, resolved with
//! the same environment overrides the provider's own CLI honors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// One of the supported coding-tool providers. The set is fixed; adding a
/// provider is a code change, not configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// `(provider, name)` rendered as the canonical `provider:name` key used
    /// by the pool snapshot and the health store.
    pub fn key(self, name: &str) -> String {
        format!("{}:{}", self.as_str(), name)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            "gemini" => Ok(Provider::Gemini),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// A single auth file a provider reads. Optional files are skipped when
/// absent; a missing required file fails backup and restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFile {
    pub path: PathBuf,
    pub required: bool,
}

impl AuthFile {
    fn required(path: PathBuf) -> Self {
        Self {
            path,
            required: true,
        }
    }

    fn optional(path: PathBuf) -> Self {
        Self {
            path,
            required: false,
        }
    }
}

/// The tool-specific list of absolute paths where a provider keeps its auth
/// state, in the order the vault copies them.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub tool: Provider,
    pub files: Vec<AuthFile>,
}

impl FileSet {
    /// Resolve the file set for `provider` against the current environment.
    ///
    /// Overrides honored: `CLAUDE_CONFIG_DIR` and `XDG_CONFIG_HOME` for
    /// Claude's secondary auth file, `CODEX_HOME` for Codex, `GEMINI_HOME`
    /// for Gemini.
    pub fn for_provider(provider: Provider) -> FileSet {
        let home = home_dir();
        let files = match provider {
            Provider::Claude => {
                let config_dir = env_path("CLAUDE_CONFIG_DIR")
                    .or_else(|| env_path("XDG_CONFIG_HOME").map(|p| p.join("claude-code")))
                    .unwrap_or_else(|| home.join(".config").join("claude-code"));
                vec![
                    AuthFile::required(home.join(".claude.json")),
                    AuthFile::optional(config_dir.join("auth.json")),
                ]
            }
            Provider::Codex => {
                let codex_home = env_path("CODEX_HOME").unwrap_or_else(|| home.join(".codex"));
                vec![AuthFile::required(codex_home.join("auth.json"))]
            }
            Provider::Gemini => {
                let gemini_home = env_path("GEMINI_HOME").unwrap_or_else(|| home.join(".gemini"));
                vec![
                    AuthFile::required(gemini_home.join("settings.json")),
                    AuthFile::optional(gemini_home.join("oauth_credentials.json")),
                ]
            }
        };
        FileSet {
            tool: provider,
            files,
        }
    }

    /// A file set rooted somewhere other than the real home directory.
    /// Integration tests use this to operate on a scratch tree.
    pub fn with_files(provider: Provider, files: Vec<(PathBuf, bool)>) -> FileSet {
        FileSet {
            tool: provider,
            files: files
                .into_iter()
                .map(|(path, required)| AuthFile { path, required })
                .collect(),
        }
    }

    pub fn required_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().filter(|f| f.required).map(|f| &f.path)
    }
}

/// Names beginning with `_` are system profiles: reserved for automatic
/// safety backups, excluded from rotation, and protected from deletion.
pub fn is_system_profile(name: &str) -> bool {
    name.starts_with('_')
}

/// Reject names that are empty, dotted, absolute, or contain a path
/// separator or NUL. Applied to profile names everywhere and to each vault
/// path component.
pub fn validate_profile_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || std::path::Path::new(name).is_absolute()
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
}
