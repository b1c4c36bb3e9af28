//! Remote storage/network-motion feasibility probe: a dry-run of the whole
//! cross-pool transfer, issued against a short-lived duplicate session so a
//! probe failure never poisons the primary one. Each candidate host is
//! probed independently; a failure here is captured per candidate and never
//! aborts evaluation of its siblings.

use crate::objects::*;
use crate::rpc::{Connection, ReceiveData, RpcSession};
use crate::{PoolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a successful probe learned, reusable at execution time.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub receive_data: ReceiveData,
    pub vdi_map: HashMap<VdiRef, SrRef>,
    pub vif_map: HashMap<VifRef, NetworkRef>,
    /// The network the transfer will stream over on the receiving side.
    pub transfer_network: NetworkRef,
}

pub async fn probe_storage_migration(
    vm: &Vm,
    source: &Arc<Connection>,
    target: &Arc<Connection>,
    host: &Host,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome> {
    check(cancel)?;

    // The candidate's management network carries the transfer; fall back to
    // any network the host can reach.
    let transfer_network = target
        .cache
        .management_network_of(&host.reference)
        .or_else(|| target.cache.any_network_of(&host.reference))
        .ok_or_else(|| {
            PoolError::InvalidInput(format!(
                "no network reachable from server '{}'",
                host.name_label
            ))
        })?;

    let probe_session = target.session()?.duplicate().await?;

    check(cancel)?;
    let receive_data = probe_session
        .migrate_receive(&host.reference, &transfer_network.reference)
        .await?;

    let vdi_map = build_vdi_map(vm, source, target)?;
    let vif_map = if source.same_as(target) {
        // No network remapping within one connection.
        HashMap::new()
    } else {
        build_vif_map(vm, source, target, host)?
    };

    check(cancel)?;
    let assert = probe_session
        .assert_can_migrate(
            &vm.reference,
            &receive_data,
            vm.is_running(),
            &vdi_map,
            &vif_map,
        )
        .await;

    match assert {
        Ok(()) => {}
        Err(e) if is_tolerated_snapshot_vif(&e, vm, source) => {
            debug!(vm = %vm.reference, "unmapped interface exists only on a snapshot, tolerated");
        }
        Err(e) => return Err(e),
    }

    Ok(ProbeOutcome {
        receive_data,
        vdi_map,
        vif_map,
        transfer_network: transfer_network.reference,
    })
}

/// For every non-ISO disk, pick a destination SR on the target that supports
/// storage motion and differs from the current one. A disk already on an SR
/// visible from both ends stays unmapped and keeps its repository.
fn build_vdi_map(
    vm: &Vm,
    source: &Arc<Connection>,
    target: &Arc<Connection>,
) -> Result<HashMap<VdiRef, SrRef>> {
    let mut map = HashMap::new();

    let mut candidates: Vec<Sr> = target
        .cache
        .all_srs()
        .into_iter()
        .filter(|sr| sr.supports_storage_motion && !sr.is_iso())
        .collect();
    candidates.sort_by(|a, b| a.name_label.cmp(&b.name_label));

    for (_vbd, vdi) in source.cache.vm_disks(vm) {
        let Some(current) = source.cache.sr(&vdi.sr) else {
            continue;
        };
        if current.is_iso() {
            continue;
        }
        if target.cache.sr_with_uuid(&current.uuid).is_some() {
            // Same repository visible from both ends, no motion needed.
            continue;
        }
        let dest = candidates
            .iter()
            .find(|sr| sr.uuid != current.uuid)
            .ok_or_else(|| {
                PoolError::InvalidInput(format!(
                    "no storage on '{}' supports storage motion for disk '{}'",
                    target.address, vdi.name_label
                ))
            })?;
        map.insert(vdi.reference.clone(), dest.reference.clone());
    }

    Ok(map)
}

/// A destination network reachable from the candidate host, per interface.
fn build_vif_map(
    vm: &Vm,
    source: &Arc<Connection>,
    target: &Arc<Connection>,
    host: &Host,
) -> Result<HashMap<VifRef, NetworkRef>> {
    let mut map = HashMap::new();
    let dest = target.cache.any_network_of(&host.reference).ok_or_else(|| {
        PoolError::InvalidInput(format!(
            "no network reachable from server '{}'",
            host.name_label
        ))
    })?;

    for vif in source.cache.vm_vifs(vm) {
        map.insert(vif.reference, dest.reference.clone());
    }
    Ok(map)
}

/// The deliberate leniency: an interface-not-in-map failure is accepted iff
/// the named interface belongs to a snapshot of the VM, not the live VM.
/// Nothing broader is forgiven.
fn is_tolerated_snapshot_vif(err: &PoolError, vm: &Vm, source: &Arc<Connection>) -> bool {
    let Some(failure) = err.failure() else {
        return false;
    };
    if failure.code != "VIF_NOT_IN_MAP" {
        return false;
    }
    let Some(vif_ref) = failure.params.get(1).map(|r| VifRef::new(r.clone())) else {
        return false;
    };
    if vm.vifs.contains(&vif_ref) {
        return false;
    }
    let Some(vif) = source.cache.vif(&vif_ref) else {
        return false;
    };
    source
        .cache
        .vm(&vif.vm)
        .map(|owner| owner.is_a_snapshot && owner.snapshot_of.as_ref() == Some(&vm.reference))
        .unwrap_or(false)
}

/// Boot-here probe used for start/resume placement and for local live
/// migration feasibility. No storage or network remapping is involved.
pub async fn probe_can_boot_here(
    session: &Arc<dyn RpcSession>,
    vm: &VmRef,
    host: &HostRef,
    cancel: &CancellationToken,
) -> Result<()> {
    check(cancel)?;
    session.assert_can_boot_here(vm, host).await
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PoolError::Cancelled)
    } else {
        Ok(())
    }
}
