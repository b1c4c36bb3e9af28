//! Per-VM transfer plan: which disk lands on which storage repository and
//! which network each interface attaches to. Built fresh per planning
//! session with sensible defaults, edited locally by the user, and only
//! read by the orchestrator at execution time.

use crate::cache::SnapshotCache;
use crate::objects::*;
use crate::{PoolError, Result};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlanTarget {
    Host(HostRef),
    Pool(PoolRef),
}

#[derive(Debug, Clone, Serialize)]
pub struct VmMapping {
    pub vm: VmRef,
    pub target: PlanTarget,
    /// Display only; never used for resolution.
    pub target_name: String,
    /// Disk -> destination storage. Absent disks keep their repository.
    pub storage: HashMap<VdiRef, SrRef>,
    /// Interface -> destination network. Absent interfaces stay put.
    pub networks: HashMap<VifRef, NetworkRef>,
    /// Required when the transfer crosses pools while the VM is running.
    pub transfer_network: Option<NetworkRef>,
}

impl VmMapping {
    pub fn set_storage(&mut self, vdi: VdiRef, sr: SrRef) {
        self.storage.insert(vdi, sr);
    }

    pub fn set_network(&mut self, vif: VifRef, network: NetworkRef) {
        self.networks.insert(vif, network);
    }

    pub fn set_transfer_network(&mut self, network: Option<NetworkRef>) {
        self.transfer_network = network;
    }

    /// Whether any mapped disk actually changes storage repository.
    pub fn requires_storage_motion(&self, source_cache: &SnapshotCache) -> bool {
        self.storage.iter().any(|(vdi, dest)| {
            source_cache
                .vdi(vdi)
                .map(|v| &v.sr != dest)
                .unwrap_or(true)
        })
    }

    /// Whether any mapped interface actually changes network.
    pub fn requires_network_motion(&self, source_cache: &SnapshotCache) -> bool {
        self.networks.iter().any(|(vif, dest)| {
            source_cache
                .vif(vif)
                .map(|v| &v.network != dest)
                .unwrap_or(true)
        })
    }
}

/// Builds the default plan for a chosen destination: disks follow the
/// target pool's default SR (unless already visible from the target),
/// interfaces default to no remap.
pub struct MappingBuilder<'a> {
    vm: &'a Vm,
    source_cache: &'a SnapshotCache,
    target_cache: &'a SnapshotCache,
    cross_connection: bool,
    plan_target: PlanTarget,
    target_name: String,
}

impl<'a> MappingBuilder<'a> {
    pub fn new(
        vm: &'a Vm,
        source_cache: &'a SnapshotCache,
        target_cache: &'a SnapshotCache,
        cross_connection: bool,
        plan_target: PlanTarget,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            vm,
            source_cache,
            target_cache,
            cross_connection,
            plan_target,
            target_name: target_name.into(),
        }
    }

    pub fn build(self) -> Result<VmMapping> {
        let mut storage = HashMap::new();

        if self.cross_connection {
            let pool = self.target_cache.the_pool().ok_or_else(|| {
                PoolError::InvalidInput("destination connection has no pool cached yet".into())
            })?;
            let default_sr = pool.default_sr.ok_or_else(|| {
                PoolError::InvalidInput(format!(
                    "pool '{}' has no default storage repository",
                    pool.name_label
                ))
            })?;

            for (_vbd, vdi) in self.source_cache.vm_disks(self.vm) {
                let Some(current) = self.source_cache.sr(&vdi.sr) else {
                    continue;
                };
                if current.is_iso() {
                    continue;
                }
                if self.target_cache.sr_with_uuid(&current.uuid).is_some() {
                    // Visible from both ends, leave in place.
                    continue;
                }
                storage.insert(vdi.reference, default_sr.clone());
            }
        }

        let transfer_network = if self.cross_connection {
            self.default_transfer_network()
        } else {
            None
        };

        Ok(VmMapping {
            vm: self.vm.reference.clone(),
            target: self.plan_target,
            target_name: self.target_name,
            storage,
            networks: HashMap::new(),
            transfer_network,
        })
    }

    fn default_transfer_network(&self) -> Option<NetworkRef> {
        let host = match &self.plan_target {
            PlanTarget::Host(h) => h.clone(),
            PlanTarget::Pool(p) => self.target_cache.pool(p)?.master,
        };
        self.target_cache
            .management_network_of(&host)
            .or_else(|| self.target_cache.any_network_of(&host))
            .map(|n| n.reference)
    }
}
