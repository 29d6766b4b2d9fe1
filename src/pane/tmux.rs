//! tmux client: drives the `tmux` binary.
//!
//! tmux addresses panes as `%<n>`; this client exposes the numeric part so
//! pane ids stay backend-neutral.

use async_trait::async_trait;

use super::{run_backend, Pane, PaneClient};
use crate::error::Result;

const BACKEND: &str = "tmux";

#[derive(Debug, Default)]
pub struct TmuxClient {
    binary: String,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn target(pane_id: u64) -> String {
        format!("%{pane_id}")
    }
}

fn parse_pane_line(line: &str) -> Option<Pane> {
    let (id, title) = line.split_once('|')?;
    let pane_id = id.trim().strip_prefix('%')?.parse().ok()?;
    Some(Pane {
        pane_id,
        title: title.trim().to_string(),
    })
}

#[async_trait]
impl PaneClient for TmuxClient {
    async fn list_panes(&self) -> Result<Vec<Pane>> {
        let stdout = run_backend(
            BACKEND,
            &self.binary,
            &[
                "list-panes".into(),
                "-a".into(),
                "-F".into(),
                "#{pane_id}|#{pane_title}".into(),
            ],
        )
        .await?;
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    async fn get_text(&self, pane_id: u64, start_line: i64) -> Result<String> {
        run_backend(
            BACKEND,
            &self.binary,
            &[
                "capture-pane".into(),
                "-p".into(),
                "-t".into(),
                Self::target(pane_id),
                "-S".into(),
                start_line.to_string(),
            ],
        )
        .await
    }

    async fn send_text(&self, pane_id: u64, text: &str, _no_paste: bool) -> Result<()> {
        // send-keys -l types literally; a trailing newline becomes an
        // explicit Enter so the driven CLI sees a submit, not a raw 0x0a.
        let (body, submit) = match text.strip_suffix('\n') {
            Some(body) => (body, true),
            None => (text, false),
        };

        if !body.is_empty() {
            run_backend(
                BACKEND,
                &self.binary,
                &[
                    "send-keys".into(),
                    "-t".into(),
                    Self::target(pane_id),
                    "-l".into(),
                    "--".into(),
                    body.to_string(),
                ],
            )
            .await?;
        }
        if submit {
            run_backend(
                BACKEND,
                &self.binary,
                &[
                    "send-keys".into(),
                    "-t".into(),
                    Self::target(pane_id),
                    "Enter".into(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        run_backend(
            BACKEND,
            &self.binary,
            &["display-message".into(), "-p".into(), "ok".into()],
        )
        .await
        .is_ok()
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
