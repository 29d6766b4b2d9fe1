//! Terminal-multiplexer abstraction.
//!
//! The coordinator drives panes through the [`PaneClient`] capability; the
//! two concrete clients shell out to the `wezterm` and `tmux` binaries.
//! Auto-selection probes WezTerm first, then tmux, and the chosen client is
//! held for the life of the coordinator.

mod tmux;
mod wezterm;

pub use tmux::TmuxClient;
pub use wezterm::WezTermClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// One pane of the driven multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pane {
    pub pane_id: u64,
    #[serde(default)]
    pub title: String,
}

#[async_trait]
pub trait PaneClient: Send + Sync {
    async fn list_panes(&self) -> Result<Vec<Pane>>;

    /// Pane scrollback text. A negative `start_line` means the last `n`
    /// lines, mirroring both multiplexers' CLI conventions.
    async fn get_text(&self, pane_id: u64, start_line: i64) -> Result<String>;

    /// Type `text` into the pane. `no_paste` asks the backend to send plain
    /// keystrokes rather than a bracketed paste.
    async fn send_text(&self, pane_id: u64, text: &str, no_paste: bool) -> Result<()>;

    async fn is_available(&self) -> bool;

    fn backend(&self) -> &'static str;
}

/// Which multiplexer to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneBackend {
    #[default]
    Auto,
    Wezterm,
    Tmux,
}

impl FromStr for PaneBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PaneBackend::Auto),
            "wezterm" => Ok(PaneBackend::Wezterm),
            "tmux" => Ok(PaneBackend::Tmux),
            other => Err(Error::NotFound(format!("pane backend {other:?}"))),
        }
    }
}

/// Resolve `backend` to a live client. Auto probes WezTerm, then tmux; a
/// backend counts as live only when its binary exists and answers.
pub async fn connect(backend: PaneBackend) -> Result<Arc<dyn PaneClient>> {
    match backend {
        PaneBackend::Wezterm => Ok(Arc::new(WezTermClient::new())),
        PaneBackend::Tmux => Ok(Arc::new(TmuxClient::new())),
        PaneBackend::Auto => {
            if which::which("wezterm").is_ok() {
                let client = WezTermClient::new();
                if client.is_available().await {
                    tracing::info!(backend = "wezterm", "Pane backend selected");
                    return Ok(Arc::new(client));
                }
            }
            if which::which("tmux").is_ok() {
                let client = TmuxClient::new();
                if client.is_available().await {
                    tracing::info!(backend = "tmux", "Pane backend selected");
                    return Ok(Arc::new(client));
                }
            }
            Err(Error::NoPaneBackend)
        }
    }
}

/// Run a backend binary and capture stdout, mapping non-zero exits to a
/// pane-command error.
pub(crate) async fn run_backend(
    backend: &'static str,
    binary: &str,
    args: &[String],
) -> Result<String> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::io(format!("running {binary}"), e))?;

    if !output.status.success() {
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::PaneCommand {
            backend,
            detail: if detail.is_empty() {
                format!("exit status {}", output.status)
            } else {
                detail
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_from_config_strings() {
        assert_eq!("auto".parse::<PaneBackend>().unwrap(), PaneBackend::Auto);
        assert_eq!(
            "WezTerm".parse::<PaneBackend>().unwrap(),
            PaneBackend::Wezterm
        );
        assert_eq!("tmux".parse::<PaneBackend>().unwrap(), PaneBackend::Tmux);
        assert!("screen".parse::<PaneBackend>().is_err());
    }

    #[test]
    fn pane_serializes_with_stable_field_names() {
        let pane = Pane {
            pane_id: 7,
            title: "codex".to_string(),
        };
        let json = serde_json::to_value(&pane).unwrap();
        assert_eq!(json["pane_id"], 7);
        assert_eq!(json["title"], "codex");
    }
}
