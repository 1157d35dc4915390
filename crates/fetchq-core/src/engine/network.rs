//! Network gate
//!
//! Decides whether a download may transfer right now, given its own network
//! requirement, the engine-wide override and what the connectivity provider
//! reports.

use fetchq_types::NetworkType;
use std::sync::Arc;

/// Answers "is network type X currently available"
pub trait Connectivity: Send + Sync {
    fn is_available(&self, network_type: NetworkType) -> bool;
}

/// Connectivity provider that reports every network as available
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl Connectivity for AlwaysConnected {
    fn is_available(&self, _network_type: NetworkType) -> bool {
        true
    }
}

pub(crate) struct NetworkGate {
    global: Option<NetworkType>,
    connectivity: Arc<dyn Connectivity>,
}

impl NetworkGate {
    pub fn new(global: Option<NetworkType>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            global,
            connectivity,
        }
    }

    /// Replace the override. Stored requirements on downloads are untouched.
    pub fn set_global(&mut self, global: Option<NetworkType>) {
        self.global = global;
    }

    pub fn effective(&self, requested: NetworkType) -> NetworkType {
        self.global.unwrap_or(requested)
    }

    pub fn permits(&self, requested: NetworkType) -> bool {
        self.connectivity.is_available(self.effective(requested))
    }
}
