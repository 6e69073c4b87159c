//! Verify command (re-check prepared records in staging).

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use sigstage_record::{RecordStore, Stage};

use crate::error::CliError;

use super::{scope, CommandContext};

/// Verify command - push prepared records to a fresh staging registry and
/// verify them there. Nothing on disk changes.
#[derive(Debug, Args)]
pub struct VerifyCommand {
    /// Signatures root to check.
    #[arg(long, env = "SIGSTAGE_SIGNATURES_DIR")]
    pub(super) source_dir: Option<PathBuf>,

    /// Check every batch, not only the newest.
    #[arg(long)]
    pub(super) all: bool,

    /// Records sit directly under the root, without batches.
    #[arg(long)]
    flat: bool,
}

impl VerifyCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let root = ctx.config.signatures_dir.clone();
        let store = if self.flat {
            RecordStore::flat(root, Stage::Prepared)
        } else {
            RecordStore::batched(root, Stage::Prepared)
        };

        let pipeline = ctx.pipeline()?;
        let report = pipeline
            .verify(&store, scope(self.all))
            .await
            .map_err(CliError::from)?;

        ctx.finish(report)
    }
}
