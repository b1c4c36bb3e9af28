//! Connection-scoped snapshot store for remote objects.
//!
//! The cache is populated by an external event/poll collaborator and read
//! concurrently by the planner and running operations. Reads hand out cloned
//! snapshots; the core never mutates cache state as a side effect of an
//! operation, it only triggers remote mutations and lets the event layer
//! catch up. Acting on a stale-but-valid reference is fine: the remote call
//! fails with a classified error if the object has since disappeared.

use crate::objects::*;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct SnapshotCache {
    vms: RwLock<HashMap<VmRef, Vm>>,
    hosts: RwLock<HashMap<HostRef, Host>>,
    pools: RwLock<HashMap<PoolRef, Pool>>,
    srs: RwLock<HashMap<SrRef, Sr>>,
    networks: RwLock<HashMap<NetworkRef, Network>>,
    vdis: RwLock<HashMap<VdiRef, Vdi>>,
    vbds: RwLock<HashMap<VbdRef, Vbd>>,
    vifs: RwLock<HashMap<VifRef, Vif>>,
    pbds: RwLock<HashMap<PbdRef, Pbd>>,
}

macro_rules! accessors {
    ($get:ident, $all:ident, $put:ident, $field:ident, $ref_ty:ty, $obj_ty:ty) => {
        pub fn $get(&self, r: &$ref_ty) -> Option<$obj_ty> {
            self.$field.read().unwrap().get(r).cloned()
        }

        pub fn $all(&self) -> Vec<$obj_ty> {
            self.$field.read().unwrap().values().cloned().collect()
        }

        pub fn $put(&self, obj: $obj_ty) {
            self.$field
                .write()
                .unwrap()
                .insert(obj.reference.clone(), obj);
        }
    };
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    accessors!(vm, all_vms, put_vm, vms, VmRef, Vm);
    accessors!(host, all_hosts, put_host, hosts, HostRef, Host);
    accessors!(pool, all_pools, put_pool, pools, PoolRef, Pool);
    accessors!(sr, all_srs, put_sr, srs, SrRef, Sr);
    accessors!(network, all_networks, put_network, networks, NetworkRef, Network);
    accessors!(vdi, all_vdis, put_vdi, vdis, VdiRef, Vdi);
    accessors!(vbd, all_vbds, put_vbd, vbds, VbdRef, Vbd);
    accessors!(vif, all_vifs, put_vif, vifs, VifRef, Vif);
    accessors!(pbd, all_pbds, put_pbd, pbds, PbdRef, Pbd);

    /// The pool this connection manages. A connection mirrors exactly one
    /// pool; with none cached yet, planning cannot proceed.
    pub fn the_pool(&self) -> Option<Pool> {
        self.pools.read().unwrap().values().next().cloned()
    }

    pub fn hosts_in_pool(&self, pool: &PoolRef) -> Vec<Host> {
        let mut hosts: Vec<Host> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| &h.pool == pool)
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.name_label.cmp(&b.name_label));
        hosts
    }

    /// The VM's block devices joined with their disk images, CD drives and
    /// detached devices skipped.
    pub fn vm_disks(&self, vm: &Vm) -> Vec<(Vbd, Vdi)> {
        let vbds = self.vbds.read().unwrap();
        let vdis = self.vdis.read().unwrap();
        vm.vbds
            .iter()
            .filter_map(|r| vbds.get(r))
            .filter(|vbd| vbd.vbd_type == VbdType::Disk)
            .filter_map(|vbd| {
                let vdi = vbd.vdi.as_ref().and_then(|v| vdis.get(v))?;
                Some((vbd.clone(), vdi.clone()))
            })
            .collect()
    }

    pub fn vm_vifs(&self, vm: &Vm) -> Vec<Vif> {
        let vifs = self.vifs.read().unwrap();
        vm.vifs.iter().filter_map(|r| vifs.get(r).cloned()).collect()
    }

    /// Snapshots taken of the given VM.
    pub fn snapshots_of(&self, vm: &VmRef) -> Vec<Vm> {
        self.vms
            .read()
            .unwrap()
            .values()
            .filter(|v| v.is_a_snapshot && v.snapshot_of.as_ref() == Some(vm))
            .cloned()
            .collect()
    }

    pub fn management_network_of(&self, host: &HostRef) -> Option<Network> {
        self.networks
            .read()
            .unwrap()
            .values()
            .find(|n| n.is_management && n.reachable_from(host))
            .cloned()
    }

    pub fn any_network_of(&self, host: &HostRef) -> Option<Network> {
        let networks = self.networks.read().unwrap();
        let mut reachable: Vec<&Network> =
            networks.values().filter(|n| n.reachable_from(host)).collect();
        reachable.sort_by(|a, b| a.name_label.cmp(&b.name_label));
        reachable.first().map(|n| (*n).clone())
    }

    /// Whether an SR with this UUID is attached on this connection, i.e.
    /// the same repository is visible from both ends of a migration.
    pub fn sr_with_uuid(&self, uuid: &str) -> Option<Sr> {
        self.srs
            .read()
            .unwrap()
            .values()
            .find(|s| s.uuid == uuid)
            .cloned()
    }

    pub fn pbds_of_sr(&self, sr: &Sr) -> Vec<Pbd> {
        let pbds = self.pbds.read().unwrap();
        sr.pbds.iter().filter_map(|r| pbds.get(r).cloned()).collect()
    }
}
