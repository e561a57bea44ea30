//! Attach command implementation.

use clap::Args;
use std::path::PathBuf;
use vmdisk::api::types::AttachRequest;

use super::parsers::disk_kind;
use super::Context;

/// Attach a disk to the utility VM without mounting it.
#[derive(Args, Debug)]
pub struct AttachCmd {
    /// Disk image path or pass-through device path.
    pub disk: PathBuf,

    /// The disk is a virtual disk image file.
    #[arg(long)]
    pub vhd: bool,
}

impl AttachCmd {
    /// Execute the attach command.
    pub fn run(&self, ctx: &Context) -> vmdisk::Result<()> {
        let req = AttachRequest {
            disk: super::disk_arg(&self.disk)?,
            kind: disk_kind(self.vhd),
        };
        let attached = super::runtime()?.block_on(async {
            let client = super::service(ctx).await?;
            client.attach(&req).await
        })?;
        println!(
            "Attached {} at LUN {} ({})",
            attached.disk, attached.lun, attached.device
        );
        Ok(())
    }
}
