//! Migration target evaluation: for a VM and a candidate host, decide
//! whether the transfer can happen and which mechanism it needs. The checks
//! run cheapest-first and short-circuit on the first disqualifier; remote
//! probes come last.

use crate::objects::*;
use crate::probe::{self, ProbeOutcome};
use crate::rpc::{Connection, ConnectionRegistry};
use crate::version::is_older_than;
use crate::{PoolError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What the user asked for. Selected once, consumed by the orchestrator's
/// exhaustive dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Start,
    Resume,
    Migrate,
    Move,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationMechanism {
    Start,
    LocalMigrate,
    IntraPoolStorageMove,
    CrossPoolMigrate,
    CrossPoolCopy,
    CrossPoolMove,
}

/// Per (VM, candidate) verdict. Plain data: rendering is the UI's problem.
#[derive(Debug, Clone, Serialize)]
pub struct EligibilityResult {
    pub eligible: bool,
    pub reason: Option<String>,
    pub mechanism: Option<MigrationMechanism>,
}

impl EligibilityResult {
    fn ok(mechanism: MigrationMechanism) -> Self {
        Self {
            eligible: true,
            reason: None,
            mechanism: Some(mechanism),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
            mechanism: None,
        }
    }
}

/// Pool-level verdict: eligible when any member host is.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEligibility {
    pub pool: PoolRef,
    pub pool_name: String,
    pub result: EligibilityResult,
    /// Hosts found individually eligible, evaluation order.
    pub eligible_hosts: Vec<HostRef>,
}

pub struct MigrationEvaluator {
    connections: Arc<ConnectionRegistry>,
}

impl MigrationEvaluator {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    /// Evaluate one candidate host. Probe failures are contained here: the
    /// caller always gets a verdict, never an error, so sibling candidates
    /// are unaffected.
    pub async fn can_migrate(
        &self,
        vm: &Vm,
        source: &Arc<Connection>,
        target: &Arc<Connection>,
        host_ref: &HostRef,
        kind: OperationKind,
        cancel: &CancellationToken,
    ) -> EligibilityResult {
        let Some(host) = target.cache.host(host_ref) else {
            return EligibilityResult::rejected("The selected server is no longer available");
        };

        // Intra-pool move: storage relocation within one pool is always
        // possible in principle; whether any disk actually crosses storage
        // is the mapping builder's call.
        if kind == OperationKind::Move && source.same_as(target) {
            return EligibilityResult::ok(MigrationMechanism::IntraPoolStorageMove);
        }

        if vm.home() == Some(host_ref) {
            return EligibilityResult::rejected("The VM is already on the selected host");
        }

        if let Some(src_host) = vm.home().and_then(|h| source.cache.host(h)) {
            if is_older_than(&host.software_version, &src_host.software_version) {
                return EligibilityResult::rejected(format!(
                    "Server '{}' runs an older version than the VM's current server",
                    host.name_label
                ));
            }
        }

        if host.restrict_dmc && vm.power_state.is_active() && !vm.memory.is_fixed() {
            return EligibilityResult::rejected(
                "The VM uses dynamic memory control, which is not available on the destination server",
            );
        }

        // Full storage-motion probe first; it covers the general case.
        let probe_err = match probe::probe_storage_migration(vm, source, target, &host, cancel).await
        {
            Ok(_) => {
                let mechanism = match kind {
                    OperationKind::Copy => MigrationMechanism::CrossPoolCopy,
                    OperationKind::Move => MigrationMechanism::CrossPoolMove,
                    _ => MigrationMechanism::CrossPoolMigrate,
                };
                return EligibilityResult::ok(mechanism);
            }
            Err(e) => e,
        };
        debug!(vm = %vm.reference, host = %host_ref, error = %probe_err,
               "storage migration probe rejected candidate");

        // Live migration within one connection can still go the plain
        // pool-migrate route.
        if source.same_as(target) && vm.is_running() {
            if let Ok(session) = source.session() {
                match probe::probe_can_boot_here(&session, &vm.reference, host_ref, cancel).await {
                    Ok(()) => return EligibilityResult::ok(MigrationMechanism::LocalMigrate),
                    Err(e) => return EligibilityResult::rejected(reason_text(&e)),
                }
            }
        }

        EligibilityResult::rejected(reason_text(&probe_err))
    }

    /// Evaluate one candidate host for starting or resuming a VM on it. A
    /// known failure mode gets remapped: a storage requirement pointing at
    /// an ISO library means a CD is still inserted.
    pub async fn can_start(
        &self,
        vm: &Vm,
        connection: &Arc<Connection>,
        host_ref: &HostRef,
        cancel: &CancellationToken,
    ) -> EligibilityResult {
        let session = match connection.session() {
            Ok(s) => s,
            Err(e) => return EligibilityResult::rejected(e.to_string()),
        };
        match probe::probe_can_boot_here(&session, &vm.reference, host_ref, cancel).await {
            Ok(()) => EligibilityResult::ok(MigrationMechanism::Start),
            Err(e) => {
                if let Some(failure) = e.failure() {
                    if failure.code == "VM_REQUIRES_SR" {
                        let sr = failure
                            .params
                            .get(2)
                            .map(|r| SrRef::new(r.clone()))
                            .and_then(|r| connection.cache.sr(&r));
                        if sr.map(|s| s.is_iso()).unwrap_or(false) {
                            return EligibilityResult::rejected(
                                "Eject the CD/DVD from the VM's drive and try again",
                            );
                        }
                    }
                }
                EligibilityResult::rejected(reason_text(&e))
            }
        }
    }

    /// Aggregate over a pool: eligible when any member host is; when none
    /// is, the displayed reason comes from the first host's failure.
    pub async fn can_migrate_to_pool(
        &self,
        vm: &Vm,
        source: &Arc<Connection>,
        target: &Arc<Connection>,
        pool: &Pool,
        kind: OperationKind,
        cancel: &CancellationToken,
    ) -> PoolEligibility {
        let hosts = target.cache.hosts_in_pool(&pool.reference);
        let mut eligible_hosts = Vec::new();
        let mut first_rejection: Option<EligibilityResult> = None;
        let mut mechanism = None;

        for host in &hosts {
            let result = self
                .can_migrate(vm, source, target, &host.reference, kind, cancel)
                .await;
            if result.eligible {
                mechanism = mechanism.or(result.mechanism);
                eligible_hosts.push(host.reference.clone());
            } else if first_rejection.is_none() {
                first_rejection = Some(result);
            }
        }

        let result = if !eligible_hosts.is_empty() {
            EligibilityResult {
                eligible: true,
                reason: None,
                mechanism,
            }
        } else {
            first_rejection.unwrap_or_else(|| {
                EligibilityResult::rejected("The pool has no servers available")
            })
        };

        PoolEligibility {
            pool: pool.reference.clone(),
            pool_name: pool.name_label.clone(),
            result,
            eligible_hosts,
        }
    }

    /// Annotate every registered connection's pool with its eligibility for
    /// this VM. Destinations are evaluated independently; one broken pool
    /// never hides the others.
    pub async fn evaluate_destinations(
        &self,
        vm: &Vm,
        source: &Arc<Connection>,
        kind: OperationKind,
        cancel: &CancellationToken,
    ) -> Vec<PoolEligibility> {
        let mut results = Vec::new();
        for target in self.connections.all() {
            let Some(pool) = target.cache.the_pool() else {
                continue;
            };
            results.push(
                self.can_migrate_to_pool(vm, source, &target, &pool, kind, cancel)
                    .await,
            );
        }
        results
    }

    /// Re-run the probe for a chosen destination to materialize the maps the
    /// orchestrator will execute with.
    pub async fn probe_outcome(
        &self,
        vm: &Vm,
        source: &Arc<Connection>,
        target: &Arc<Connection>,
        host: &Host,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome> {
        probe::probe_storage_migration(vm, source, target, host, cancel).await
    }
}

/// Human-readable rejection reason from a probe error. RBAC denials are
/// shortened to their first line; everything else shows the full decoded
/// message.
fn reason_text(err: &PoolError) -> String {
    match err {
        PoolError::Remote(f) if f.code.starts_with("RBAC") => f.first_line().to_string(),
        PoolError::Remote(f) => f.message.clone(),
        PoolError::Cancelled => "The check was cancelled".to_string(),
        other => other.to_string(),
    }
}
