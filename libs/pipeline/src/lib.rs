//! # sigstage-pipeline
//!
//! Staged signing of container images.
//!
//! A run signs images into a throwaway loopback registry, verifies the
//! signatures there, and keeps them as records on disk. A later run pushes
//! those records to the real repositories, verifies them again, and only
//! then moves them into the published root.
//!
//! ```text
//! prepare:  resolve -> sign (staging) -> verify (staging) -> commit record
//! verify:   push (staging) -> verify (staging)
//! publish:  push (target) -> verify (target) -> [tag latest] -> move record
//! ```
//!
//! External capabilities sit behind the traits in [`tools`]; production
//! runs use `cosign`, `oras`, and `crane`, tests use [`mock::MockToolchain`].

pub mod error;
pub mod mock;
pub mod pipeline;
pub mod resolver;
pub mod signing;
pub mod staging;
pub mod state;
pub mod tool;
pub mod tools;
pub mod verification;

pub use error::PipelineError;
pub use pipeline::{PrepareRequest, PublishPipeline, LATEST_TAG};
pub use resolver::ManifestResolver;
pub use signing::SigningGateway;
pub use staging::{
    CraneLauncher, StagingError, StagingLauncher, StagingRegistry, StagingRegistryConfig,
    DEFAULT_STAGING_ADDRESS, DEFAULT_STAGING_REPOSITORY,
};
pub use state::{Operation, RecordOutcome, RecordState, RunReport};
pub use tool::{ToolCommand, ToolError};
pub use tools::{
    CosignCli, KeySelector, Namespace, RegistryCli, SigningMode, SigningTool, Toolchain,
    TransferTool, VerifyingTool,
};
pub use verification::VerificationGateway;
