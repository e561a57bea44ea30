//! Configuration CLI commands.

use clap::{Args, Subcommand};
use std::path::Path;
use vmdisk::config::VmdiskConfig;
use vmdisk::{Error, Result};

use super::Context;

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the path to the configuration file
    Path,

    /// Show the effective configuration
    Show(ShowCmd),

    /// Write the effective configuration to the configuration file
    Init(InitCmd),
}

impl ConfigCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        match self {
            ConfigCmd::Path => {
                println!("{}", ctx.config_file()?.display());
                Ok(())
            }
            ConfigCmd::Show(cmd) => cmd.run(ctx),
            ConfigCmd::Init(cmd) => cmd.run(ctx),
        }
    }
}

// ============================================================================
// Show Command
// ============================================================================

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let path = ctx.config_file()?;
        println!("# Config file: {}", path.display());
        if !path.exists() {
            println!("# Status: not configured (using defaults)");
        }
        println!();
        print!("{}", render(&ctx.config)?);
        Ok(())
    }
}

// ============================================================================
// Init Command
// ============================================================================

/// Write the effective configuration to the configuration file
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

impl InitCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let path = ctx.config_file()?;
        write_config(&ctx.config, &path, self.force)?;
        println!("Wrote configuration to {}", path.display());
        if ctx.config.vm.is_none() {
            println!();
            println!("Add a [vm] table with the runtime commands before mounting disks.");
        }
        Ok(())
    }
}

fn render(config: &VmdiskConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| Error::Config(format!("render config: {}", e)))
}

/// Save `config` at `path`, refusing to replace a file unless `force`.
fn write_config(config: &VmdiskConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config.save_to(path)
}
