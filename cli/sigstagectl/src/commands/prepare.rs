//! Prepare command (sign into the signatures root).

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use sigstage_pipeline::{KeySelector, PrepareRequest, SigningMode};
use sigstage_record::{BatchId, RecordStore, RootImage, Stage};

use crate::error::CliError;
use crate::output::{print_info, OutputFormat};

use super::CommandContext;

/// Prepare command - sign an image through the staging registry and keep the
/// verified signature on disk.
#[derive(Debug, Args)]
pub struct PrepareCommand {
    /// Image to sign, as repository@sha256:<digest>.
    image: RootImage,

    /// Private key file to sign with.
    #[arg(long, conflicts_with = "sk")]
    key: Option<PathBuf>,

    /// Sign with a hardware security key.
    #[arg(long)]
    sk: bool,

    /// Sign only the given image, not the platform images of a manifest list.
    #[arg(long)]
    no_recursive: bool,

    /// Produce payload, signature, and certificate files instead of a
    /// registry signature manifest.
    #[arg(long)]
    detached: bool,

    /// Batch to create or resume (defaults to a new timestamped batch).
    #[arg(long, conflicts_with = "flat", value_parser = parse_batch)]
    batch: Option<BatchId>,

    /// Store records directly under the signatures root, without batches.
    #[arg(long)]
    flat: bool,

    /// Signatures root.
    #[arg(long, env = "SIGSTAGE_SIGNATURES_DIR")]
    pub(super) signatures_dir: Option<PathBuf>,
}

fn parse_batch(value: &str) -> Result<BatchId, String> {
    BatchId::parse(value).map_err(|e| e.to_string())
}

impl PrepareCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let key = KeySelector::from_flags(self.key, self.sk).map_err(CliError::from)?;

        let mut request = PrepareRequest::new(self.image, key);
        request.recursive = !self.no_recursive;
        request.batch = self.batch;
        if self.detached {
            request.mode = SigningMode::Detached;
        }

        let root = ctx.config.signatures_dir.clone();
        let store = if self.flat {
            RecordStore::flat(root, Stage::Prepared)
        } else {
            RecordStore::batched(root, Stage::Prepared)
        };

        if ctx.format == OutputFormat::Table {
            print_info(&format!(
                "Signing {} into {}",
                request.image,
                store.root().display()
            ));
        }

        let pipeline = ctx.pipeline()?;
        let report = pipeline
            .prepare(&request, &store)
            .await
            .map_err(CliError::from)?;

        ctx.finish(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Cli;
    use super::super::Commands;
    use clap::Parser;

    const IMAGE: &str =
        "registry.example/app@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    fn parse(args: &[&str]) -> Result<super::PrepareCommand, clap::Error> {
        let mut full = vec!["sigstage", "prepare"];
        full.extend_from_slice(args);
        match Cli::try_parse_from(full)?.command {
            Commands::Prepare(cmd) => Ok(cmd),
            _ => panic!("expected prepare"),
        }
    }

    #[test]
    fn defaults_are_recursive_attached_and_batched() {
        let cmd = parse(&[IMAGE, "--key", "cosign.key"]).unwrap();
        assert!(!cmd.no_recursive);
        assert!(!cmd.detached);
        assert!(!cmd.flat);
        assert!(cmd.batch.is_none());
        assert_eq!(cmd.image.to_string(), IMAGE);
    }

    #[test]
    fn tagged_reference_is_rejected() {
        assert!(parse(&["registry.example/app:latest", "--sk"]).is_err());
    }

    #[test]
    fn batch_and_flat_conflict() {
        assert!(parse(&[IMAGE, "--sk", "--flat", "--batch", "20250101T000000Z"]).is_err());
    }

    #[test]
    fn batch_is_parsed() {
        let cmd = parse(&[IMAGE, "--sk", "--batch", "20250101T000000Z"]).unwrap();
        assert_eq!(cmd.batch.unwrap().as_str(), "20250101T000000Z");
    }
}
