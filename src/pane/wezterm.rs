//! WezTerm client: drives `wezterm cli`.

use async_trait::async_trait;
use serde::Deserialize;

use super::{run_backend, Pane, PaneClient};
use crate::error::{Error, Result};

const BACKEND: &str = "wezterm";

/// Shape of one entry in `wezterm cli list --format json`. Fields we do not
/// use are simply not declared.
#[derive(Debug, Deserialize)]
struct WezTermPane {
    pane_id: u64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default)]
pub struct WezTermClient {
    binary: String,
}

impl WezTermClient {
    pub fn new() -> Self {
        Self {
            binary: "wezterm".to_string(),
        }
    }

    /// Point at a non-PATH binary. Tests use this with a stub script.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl PaneClient for WezTermClient {
    async fn list_panes(&self) -> Result<Vec<Pane>> {
        let stdout = run_backend(
            BACKEND,
            &self.binary,
            &["cli".into(), "list".into(), "--format".into(), "json".into()],
        )
        .await?;
        let panes: Vec<WezTermPane> = serde_json::from_str(&stdout)
            .map_err(|e| Error::parse("wezterm cli list output", e))?;
        Ok(panes
            .into_iter()
            .map(|p| Pane {
                pane_id: p.pane_id,
                title: p.title,
            })
            .collect())
    }

    async fn get_text(&self, pane_id: u64, start_line: i64) -> Result<String> {
        run_backend(
            BACKEND,
            &self.binary,
            &[
                "cli".into(),
                "get-text".into(),
                "--pane-id".into(),
                pane_id.to_string(),
                "--start-line".into(),
                start_line.to_string(),
            ],
        )
        .await
    }

    async fn send_text(&self, pane_id: u64, text: &str, no_paste: bool) -> Result<()> {
        let mut args = vec![
            "cli".into(),
            "send-text".into(),
            "--pane-id".into(),
            pane_id.to_string(),
        ];
        if no_paste {
            args.push("--no-paste".into());
        }
        args.push("--".into());
        args.push(text.to_string());
        run_backend(BACKEND, &self.binary, &args).await.map(|_| ())
    }

    async fn is_available(&self) -> bool {
        run_backend(BACKEND, &self.binary, &["cli".into(), "list".into()])
            .await
            .is_ok()
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_output_parses_and_tolerates_extra_fields() {
        let raw = r#"[
            {"window_id": 0, "tab_id": 1, "pane_id": 3, "workspace": "default",
             "size": {"rows": 24, "cols": 80}, "title": "codex", "cwd": "file:///home"},
            {"window_id": 0, "tab_id": 1, "pane_id": 4, "title": ""}
        ]"#;
        let panes: Vec<WezTermPane> = serde_json::from_str(raw).unwrap();
        assert_eq!(panes.len(), 2);
        assert_eq!(panes[0].pane_id, 3);
        assert_eq!(panes[0].title, "codex");
        assert_eq!(panes[1].title, "");
    }
}
