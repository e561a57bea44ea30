//! API request handlers.

pub mod disks;
pub mod health;
