//! Unmount command implementation.

use clap::Args;
use std::path::PathBuf;
use vmdisk::api::types::UnmountRequest;

use super::Context;

/// Unmount and detach a disk, or every disk when none is given.
#[derive(Args, Debug)]
pub struct UnmountCmd {
    /// Disk image path or pass-through device path.
    pub disk: Option<PathBuf>,
}

impl UnmountCmd {
    /// Execute the unmount command.
    pub fn run(&self, ctx: &Context) -> vmdisk::Result<()> {
        let req = UnmountRequest {
            disk: self.disk.as_deref().map(super::disk_arg).transpose()?,
        };

        let runtime = super::runtime()?;
        match runtime.block_on(super::running_service(ctx))? {
            Some(client) => runtime.block_on(client.unmount(&req))?,
            // No service means no VM: only persisted records are left.
            None => super::with_manager(&ctx.config, |m| match &req.disk {
                Some(disk) => m.unmount(disk),
                None => m.unmount_all(),
            })?,
        }

        match &self.disk {
            Some(disk) => println!("Unmounted {}", disk.display()),
            None => println!("Unmounted all disks"),
        }
        Ok(())
    }
}
