//! Publish command (push to the real repositories and move records).

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use sigstage_record::{RecordStore, Stage};

use crate::error::CliError;
use crate::output::{print_info, OutputFormat};

use super::{scope, CommandContext};

/// Publish command - push prepared records to their repositories, verify them
/// there, and move them to the published root.
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Signatures root to publish from.
    #[arg(long, env = "SIGSTAGE_SIGNATURES_DIR")]
    pub(super) source_dir: Option<PathBuf>,

    /// Published root records are moved into.
    #[arg(long, env = "SIGSTAGE_PUBLISHED_DIR")]
    pub(super) destination_dir: Option<PathBuf>,

    /// Publish every batch, not only the newest. `latest` is still only
    /// moved for the newest batch.
    #[arg(long)]
    pub(super) all: bool,

    /// Both roots hold records directly, without batches.
    #[arg(long)]
    flat: bool,
}

impl PublishCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let (source, destination) = if self.flat {
            (
                RecordStore::flat(&ctx.config.signatures_dir, Stage::Prepared),
                RecordStore::flat(&ctx.config.published_dir, Stage::Published),
            )
        } else {
            (
                RecordStore::batched(&ctx.config.signatures_dir, Stage::Prepared),
                RecordStore::batched(&ctx.config.published_dir, Stage::Published),
            )
        };

        if ctx.format == OutputFormat::Table {
            print_info(&format!(
                "Publishing {} -> {}",
                source.root().display(),
                destination.root().display()
            ));
        }

        let pipeline = ctx.pipeline()?;
        let report = pipeline
            .publish(&source, &destination, scope(self.all))
            .await
            .map_err(CliError::from)?;

        ctx.finish(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Cli, Commands};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn directories_are_optional() {
        let cli = Cli::try_parse_from(["sigstage", "publish"]).unwrap();
        let Commands::Publish(cmd) = cli.command else {
            panic!("expected publish");
        };
        assert!(!cmd.all);
        assert!(!cmd.flat);
    }

    #[test]
    fn explicit_directories_are_kept() {
        let cli = Cli::try_parse_from([
            "sigstage",
            "publish",
            "--source-dir",
            "/data/SIGNATURES",
            "--destination-dir",
            "/data/PUBLISHED",
            "--flat",
        ])
        .unwrap();
        let Commands::Publish(cmd) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(cmd.source_dir, Some(PathBuf::from("/data/SIGNATURES")));
        assert_eq!(cmd.destination_dir, Some(PathBuf::from("/data/PUBLISHED")));
        assert!(cmd.flat);
    }
}
