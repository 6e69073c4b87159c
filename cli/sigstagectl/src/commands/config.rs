//! Config command.

use anyhow::Result;
use clap::Args;

use crate::output::print_single;

use super::CommandContext;

/// Config command - print the effective configuration.
#[derive(Debug, Args)]
pub struct ConfigCommand {}

impl ConfigCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        print_single(&ctx.config, ctx.format);
        Ok(())
    }
}
