//! Mount command implementation.

use clap::Args;
use std::path::PathBuf;
use vmdisk::api::types::{AttachRequest, MountRequest};
use vmdisk::Error;

use super::parsers::disk_kind;
use super::Context;

/// Attach a disk and mount one of its partitions inside the VM.
#[derive(Args, Debug)]
#[command(after_long_help = "\
EXAMPLES:
  vmdisk mount /dev/disk/by-id/ata-WDC_1234 -p 1
  vmdisk mount --vhd ./data.vhdx -t ext4 -o ro,noatime -n data
  vmdisk mount --vhd ./data.vhdx --bare")]
pub struct MountCmd {
    /// Disk image path or pass-through device path.
    pub disk: PathBuf,

    /// The disk is a virtual disk image file.
    #[arg(long)]
    pub vhd: bool,

    /// Attach the disk without mounting anything.
    #[arg(long, conflicts_with_all = ["partition", "fstype", "options", "name"])]
    pub bare: bool,

    /// Partition to mount; 0 mounts the whole disk.
    #[arg(short, long, default_value_t = 0)]
    pub partition: u32,

    /// Filesystem type. Detected when omitted.
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub fstype: Option<String>,

    /// Comma-separated mount options.
    #[arg(short, long)]
    pub options: Option<String>,

    /// Mount name replacing the default.
    #[arg(short, long)]
    pub name: Option<String>,
}

impl MountCmd {
    /// Execute the mount command.
    pub fn run(&self, ctx: &Context) -> vmdisk::Result<()> {
        let disk = super::disk_arg(&self.disk)?;
        let kind = disk_kind(self.vhd);
        let runtime = super::runtime()?;

        if self.bare {
            let req = AttachRequest { disk, kind };
            let attached = runtime.block_on(async {
                let client = super::service(ctx).await?;
                client.attach(&req).await
            })?;
            println!("Attached {} at {}", attached.disk, attached.device);
            return Ok(());
        }

        let req = MountRequest {
            disk,
            kind,
            partition: self.partition,
            filesystem: self.fstype.clone(),
            options: self.options.clone(),
            name: self.name.clone(),
        };

        let mounted = runtime.block_on(async {
            let client = super::service(ctx).await?;
            client.mount(&req).await
        });
        match mounted {
            Ok(resp) => {
                println!("Mounted {} at {}", resp.filesystem, resp.path);
                Ok(())
            }
            Err(e @ Error::MountFailed(_)) => {
                let status = e.status();
                eprintln!(
                    "Mount failed at step {} with {}. The disk remains attached; \
                     run 'vmdisk unmount {}' to release it.",
                    status.step.code(),
                    status.result,
                    self.disk.display()
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
