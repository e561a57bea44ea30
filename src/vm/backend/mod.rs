//! VM backend implementations.

mod external;

use crate::config::VmdiskConfig;
use crate::error::{Error, Result};
use crate::vm::VmBackend;
use std::sync::Arc;

pub use external::ExternalBackend;

/// Create the backend described by `config`.
///
/// Without a `[vm]` table no runtime is registered.
pub fn from_config(config: &VmdiskConfig) -> Result<Arc<dyn VmBackend>> {
    let Some(runtime) = &config.vm else {
        return Err(Error::UnsupportedHostConfiguration(
            "no vm runtime configured".into(),
        ));
    };

    let backend = ExternalBackend::new(runtime.clone());
    if backend.is_available() {
        return Ok(Arc::new(backend));
    }

    Err(Error::UnsupportedHostConfiguration(
        "vm runtime is missing start, attach or detach commands".into(),
    ))
}
