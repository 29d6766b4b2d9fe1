//! Typed errors surfaced by the core.
//!
//! The CLI layer decides how these map to exit codes; the core only
//! classifies. Best-effort pool mutators (`mark_used`, `set_error`, ...)
//! never construct these; they silently no-op on missing profiles.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A profile, pane, or auth request the operation refers to does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A refresh is already running for this profile.
    #[error("refresh already in progress for {0}")]
    AlreadyInProgress(String),

    /// Delete on a system profile without the force flag.
    #[error("profile {0:?} is a system profile; deletion requires force")]
    Protected(String),

    /// Snapshot file written by a newer release.
    #[error("state file version {found} is newer than supported version {supported}")]
    VersionNewer { found: u32, supported: u32 },

    /// Malformed snapshot / meta.json / JSON payload.
    #[error("parsing {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed TOML config file.
    #[error("parsing {path}: {message}")]
    Config { path: String, message: String },

    /// Profile or path component that is empty, dotted, absolute, or
    /// contains a separator or NUL.
    #[error("invalid profile name {0:?}")]
    InvalidName(String),

    /// Resolved path left the vault root.
    #[error("path for {0:?} escapes base directory")]
    PathEscape(String),

    /// A required provider auth file is absent.
    #[error("required auth file missing: {}", .0.display())]
    MissingAuthFile(PathBuf),

    /// Backup matched nothing: every source file was optional and absent.
    #[error("no auth files copied for {0}")]
    NothingToBackup(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The injected refresher reported failure; wrapped with the profile key.
    #[error("refresh failed for {key}: {message}")]
    RefreshFailed { key: String, message: String },

    /// Auth or state timeout in the coordinator, or a deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Rotation input was empty.
    #[error("no profiles to select from")]
    NoProfiles,

    /// Rotation input contained only `_`-prefixed system profiles.
    #[error("no user profiles to select from")]
    NoUserProfiles,

    #[error("unknown rotation algorithm {0:?}")]
    UnknownAlgorithm(String),

    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    /// A caller-supplied detector pattern failed to compile.
    #[error("invalid rate-limit pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// No terminal multiplexer backend responded to probing.
    #[error("no pane backend available (tried wezterm, tmux)")]
    NoPaneBackend,

    /// The pane backend binary returned a non-zero exit status.
    #[error("{backend} command failed: {detail}")]
    PaneCommand { backend: &'static str, detail: String },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            what: what.into(),
            source,
        }
    }

    /// True for errors a scheduler may retry without operator input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RefreshFailed { .. }
                | Self::Timeout(_)
                | Self::Io { .. }
                | Self::PaneCommand { .. }
        )
    }
}
