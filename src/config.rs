//! Core configuration
//!
//! Selects interpreter vs recompiler per CPU role and controls the threaded
//! vector-unit bridge. Selection only takes effect through
//! `CpuProviderPack::apply_config`; nothing reads these flags at execution
//! time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Use the recompiler for the main CPU when its reservation succeeded.
    pub enable_rec_main: bool,
    /// Use the recompiler for the I/O CPU when its reservation succeeded.
    pub enable_rec_iop: bool,
    /// Use the recompiler for the vector-unit microprograms.
    pub enable_rec_vu: bool,
    /// Run vector-unit microprograms on a dedicated worker thread.
    pub thread_vu: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            enable_rec_main: true,
            enable_rec_iop: true,
            enable_rec_vu: true,
            thread_vu: false,
        }
    }
}
