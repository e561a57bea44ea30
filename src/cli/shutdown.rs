//! Shutdown command implementation.

use clap::Args;

use super::Context;

/// Forget every disk, detach everything and stop the VM.
#[derive(Args, Debug)]
pub struct ShutdownCmd {}

impl ShutdownCmd {
    /// Execute the shutdown command.
    pub fn run(&self, ctx: &Context) -> vmdisk::Result<()> {
        let runtime = super::runtime()?;
        match runtime.block_on(super::running_service(ctx))? {
            Some(client) => runtime.block_on(client.shutdown())?,
            None => super::with_manager(&ctx.config, |m| m.shutdown_sweep())?,
        }
        println!("All disks released");
        Ok(())
    }
}
