#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss
)]

//! caam: coding-agent account manager.
//!
//! Pools OAuth-backed auth profiles for the Claude, Codex and Gemini CLIs:
//! captures each tool's auth files into a content-addressed vault, swaps
//! them atomically to switch accounts, refreshes expiring tokens in the
//! background, watches terminal panes for rate-limit events and drives the
//! re-login flow on the user's behalf.

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod health;
pub mod pane;
pub mod pool;
pub mod provider;
pub mod rotation;
pub mod util;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};
pub use provider::Provider;
