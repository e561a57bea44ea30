//! List command implementation.

use clap::Args;
use vmdisk::manager::DiskStatus;

use super::Context;

/// List persisted and attached disks.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Show requested mount options too.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, ctx: &Context) -> vmdisk::Result<()> {
        // Listing never starts the service or the VM.
        let runtime = super::runtime()?;
        let disks = match runtime.block_on(super::running_service(ctx))? {
            Some(client) => runtime.block_on(client.list())?,
            None => super::with_manager(&ctx.config, |m| m.list())?,
        };

        if self.json {
            let json = serde_json::to_string_pretty(&disks)
                .map_err(|e| vmdisk::Error::Config(format!("serialize disk list: {}", e)))?;
            println!("{}", json);
            return Ok(());
        }

        if disks.is_empty() {
            println!("No disks found");
            return Ok(());
        }

        println!(
            "{:<40} {:<13} {:<6} {:<10} {:<30}",
            "DISK", "KIND", "PART", "TYPE", "MOUNTPOINT"
        );
        println!("{}", "-".repeat(100));
        for disk in &disks {
            print_disk(disk, self.verbose);
        }
        Ok(())
    }
}

fn print_disk(disk: &DiskStatus, verbose: bool) {
    let name = truncate(&disk.disk, 38);
    if disk.partitions.is_empty() {
        println!(
            "{:<40} {:<13} {:<6} {:<10} {:<30}",
            name,
            disk.kind.as_str(),
            "-",
            "-",
            "-"
        );
        return;
    }

    for partition in &disk.partitions {
        let (fstype, mountpoint) = match &partition.mounted {
            Some(info) => (info.filesystem.clone(), info.path.clone()),
            None => (
                partition.requested.filesystem.clone().unwrap_or_else(|| "auto".to_string()),
                "(not mounted)".to_string(),
            ),
        };
        println!(
            "{:<40} {:<13} {:<6} {:<10} {:<30}",
            name, disk.kind.as_str(), partition.partition, fstype, mountpoint
        );
        if verbose {
            if let Some(options) = &partition.requested.options {
                println!("  Options: {}", options);
            }
            if let Some(name) = &partition.requested.name {
                println!("  Name: {}", name);
            }
        }
    }
}

/// Keep the tail of long paths, which is the part that tells disks apart.
fn truncate(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        let tail: String = s.chars().skip(count - (max - 3)).collect();
        format!("...{}", tail)
    }
}
