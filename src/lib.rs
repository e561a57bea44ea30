//! vmdisk - attach host disks to a utility VM and mount them in the guest.
//!
//! Host disks (physical pass-through disks or virtual disk images) are
//! hot-added to a lightweight utility VM and their partitions mounted
//! inside the guest. What the user asked for is recorded in a state store,
//! so mounts come back by themselves when the VM is torn down for being
//! idle and started again later. Only an explicit shutdown sweep discards
//! that state.
//!
//! # Architecture
//!
//! - [`manager::DiskMountManager`] is the entry point. It starts the VM on
//!   demand and serializes work per disk.
//! - [`attach`], [`mount`], [`unmount`] and [`recovery`] hold the
//!   coordinators for each step of a disk's life.
//! - [`store`] keeps the durable record in an embedded database.
//! - [`vm`] and [`agent`] talk to the VM runtime and the guest agent.
//! - [`api`] serves the manager over HTTP, and [`api::client`] is how the
//!   CLI reaches that service.
//!
//! # Example
//!
//! ```no_run
//! use vmdisk::config::VmdiskConfig;
//! use vmdisk::disk::{DiskKind, MountRecord};
//! use vmdisk::manager::DiskMountManager;
//!
//! # fn main() -> vmdisk::Result<()> {
//! let config = VmdiskConfig::load()?;
//! let manager = DiskMountManager::from_config(&config)?;
//! let info = manager.mount("/srv/images/data.vhdx", DiskKind::Virtual, MountRecord::partition(1))?;
//! println!("mounted at {}", info.path);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod api;
pub mod attach;
pub mod config;
pub mod disk;
pub mod error;
pub mod host;
pub mod manager;
pub mod mount;
pub mod recovery;
pub mod registry;
pub mod simulated;
pub mod store;
pub mod unmount;
pub mod vm;

pub use api::ApiDoc;
pub use disk::{DiskId, DiskKind, MountInfo, MountRecord};
pub use error::{Error, Result};
pub use manager::DiskMountManager;
pub use mount::MountFailure;
pub use vmdisk_protocol::{MountStatus, MountStep};

/// Version of vmdisk.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
