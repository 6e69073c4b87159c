//! CLI commands.

mod config;
mod prepare;
mod publish;
mod verify;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sigstage_pipeline::{
    CosignCli, CraneLauncher, PublishPipeline, RegistryCli, RunReport, StagingRegistryConfig,
    Toolchain,
};
use sigstage_record::BatchScope;

use crate::config::{Config, Settings};
use crate::error::CliError;
use crate::logging::{self, LogFormat};
use crate::output::{print_report, OutputFormat};

/// sigstage - sign container images through a local staging registry.
#[derive(Debug, Parser)]
#[command(name = "sigstage")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Log line format (text or json).
    #[arg(long, global = true, default_value = "text", env = "SIGSTAGE_LOG_FORMAT")]
    log_format: String,

    /// Config file (defaults to config.json in the platform config directory).
    #[arg(long, global = true, env = "SIGSTAGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: GlobalSettings,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that may also come from the config file.
#[derive(Debug, Args)]
struct GlobalSettings {
    /// Directory holding cosign, oras/oras, and crane/crane.
    #[arg(long, global = true, env = "SIGSTAGE_TOOLS_DIR")]
    tools_dir: Option<PathBuf>,

    /// Path to the cosign binary.
    #[arg(long, global = true, env = "SIGSTAGE_COSIGN")]
    cosign: Option<PathBuf>,

    /// Path to the oras binary.
    #[arg(long, global = true, env = "SIGSTAGE_ORAS")]
    oras: Option<PathBuf>,

    /// Path to the crane binary.
    #[arg(long, global = true, env = "SIGSTAGE_CRANE")]
    crane: Option<PathBuf>,

    /// Public key signatures are verified against.
    #[arg(long, global = true, env = "SIGSTAGE_TRUSTED_KEY")]
    trusted_key: Option<PathBuf>,

    /// Loopback address of the staging registry.
    #[arg(long, global = true, env = "SIGSTAGE_STAGING_ADDRESS")]
    staging_address: Option<String>,

    /// Repository name inside the staging registry.
    #[arg(long, global = true, env = "SIGSTAGE_STAGING_REPOSITORY")]
    staging_repository: Option<String>,

    /// Seconds to wait for the staging registry to answer.
    #[arg(long, global = true, env = "SIGSTAGE_READINESS_TIMEOUT")]
    readiness_timeout: Option<u64>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, env = "SIGSTAGE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl GlobalSettings {
    fn into_settings(self) -> Settings {
        Settings {
            tools_dir: self.tools_dir,
            cosign: self.cosign,
            oras: self.oras,
            crane: self.crane,
            trusted_key: self.trusted_key,
            staging_address: self.staging_address,
            staging_repository: self.staging_repository,
            readiness_timeout_secs: self.readiness_timeout,
            signatures_dir: None,
            published_dir: None,
            log_level: self.log_level,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sign an image (and its platform images) into the signatures root.
    Prepare(prepare::PrepareCommand),

    /// Re-verify prepared records against a fresh staging registry.
    Verify(verify::VerifyCommand),

    /// Push prepared records to their repositories and move them to the published root.
    Publish(publish::PublishCommand),

    /// Print the effective configuration.
    Config(config::ConfigCommand),
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = OutputFormat::parse(&self.format);

        let mut settings = self.settings.into_settings();
        match &self.command {
            Commands::Prepare(cmd) => settings.signatures_dir = cmd.signatures_dir.clone(),
            Commands::Verify(cmd) => settings.signatures_dir = cmd.source_dir.clone(),
            Commands::Publish(cmd) => {
                settings.signatures_dir = cmd.source_dir.clone();
                settings.published_dir = cmd.destination_dir.clone();
            }
            Commands::Config(_) => {}
        }

        let config = Config::load(self.config.as_deref(), settings)?;
        logging::init(&config.log_level, LogFormat::parse(&self.log_format));

        let ctx = CommandContext { config, format };

        match self.command {
            Commands::Prepare(cmd) => cmd.run(ctx).await,
            Commands::Verify(cmd) => cmd.run(ctx).await,
            Commands::Publish(cmd) => cmd.run(ctx).await,
            Commands::Config(cmd) => cmd.run(ctx),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Build a pipeline backed by the configured tools.
    pub fn pipeline(&self) -> Result<PublishPipeline, CliError> {
        let cosign = Arc::new(CosignCli::new(&self.config.cosign));
        let transfer = Arc::new(RegistryCli::new(&self.config.oras, &self.config.crane));

        let mut staging = StagingRegistryConfig::new(&self.config.crane, self.config.staging_address);
        staging.repository_name = self.config.staging_repository.clone();
        staging.readiness_timeout = self.config.readiness_timeout;
        let launcher = CraneLauncher::new(staging).map_err(|e| CliError::Config(e.to_string()))?;

        let toolchain = Toolchain {
            signer: cosign.clone(),
            verifier: cosign,
            transfer,
            staging: Arc::new(launcher),
        };
        Ok(PublishPipeline::new(toolchain, &self.config.trusted_key))
    }

    /// Print the report and turn record failures into a non-zero exit.
    pub fn finish(&self, report: RunReport) -> Result<()> {
        print_report(&report, self.format);

        if report.is_success() {
            Ok(())
        } else {
            Err(CliError::RecordsFailed {
                operation: report.operation,
                failed: report.failed_count(),
                total: report.outcomes.len(),
            }
            .into())
        }
    }
}

fn scope(all: bool) -> BatchScope {
    if all {
        BatchScope::All
    } else {
        BatchScope::Newest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn prepare_requires_an_image() {
        assert!(Cli::try_parse_from(["sigstage", "prepare", "--sk"]).is_err());
    }

    #[test]
    fn key_and_sk_conflict() {
        let result = Cli::try_parse_from([
            "sigstage",
            "prepare",
            "registry.example/app@sha256:aa",
            "--key",
            "cosign.key",
            "--sk",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "sigstage",
            "publish",
            "--all",
            "--format",
            "json",
            "--crane",
            "/usr/bin/crane",
        ])
        .unwrap();

        assert_eq!(cli.format, "json");
        assert_eq!(cli.settings.crane, Some(PathBuf::from("/usr/bin/crane")));
        assert!(matches!(cli.command, Commands::Publish(ref cmd) if cmd.all));
    }

    #[rstest]
    #[case(&["sigstage", "verify"], false)]
    #[case(&["sigstage", "verify", "--all"], true)]
    fn verify_scope_follows_all_flag(#[case] args: &[&str], #[case] all: bool) {
        let cli = Cli::try_parse_from(args).unwrap();
        let Commands::Verify(cmd) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(cmd.all, all);
        assert_eq!(
            scope(cmd.all),
            if all { BatchScope::All } else { BatchScope::Newest }
        );
    }

    #[rstest]
    #[case("0.0.0.0:7777")]
    #[case("10.0.0.1:7777")]
    fn pipeline_refuses_non_loopback_staging(#[case] address: &str) {
        let mut config = Config::resolve(Settings::default()).unwrap();
        config.staging_address = address.parse().unwrap();
        let ctx = CommandContext {
            config,
            format: OutputFormat::Table,
        };
        assert!(matches!(ctx.pipeline(), Err(CliError::Config(_))));
    }

    #[test]
    fn failed_records_produce_an_error() {
        use sigstage_pipeline::{Operation, RecordOutcome, RecordState};

        let ctx = CommandContext {
            config: Config::resolve(Settings::default()).unwrap(),
            format: OutputFormat::Json,
        };
        let mut report = RunReport::new(Operation::Verify);
        report.push(RecordOutcome::new(
            "registry.example/app@sha256:aa",
            None,
            RecordState::Failed("tampered".to_string()),
        ));

        let err = ctx.finish(report).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::RecordsFailed { failed: 1, total: 1, .. })
        ));
    }
}
