//! Turns an eligibility verdict plus a mapping into the concrete operation
//! that performs it. The mechanism enum is matched exhaustively in one
//! place, so every execution path is auditable.

use crate::evaluator::MigrationMechanism;
use crate::mapping::VmMapping;
use crate::objects::*;
use crate::operation::{Engine, OpContext, Operation, OperationHandle, SequenceOperation};
use crate::rpc::Connection;
use crate::{PoolError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct MigrationOrchestrator {
    engine: Arc<Engine>,
}

impl MigrationOrchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Execute the planned transfer for one VM. The mapping is consumed
    /// here: later edits to the planning session do not affect a transfer
    /// already underway.
    pub fn execute(
        &self,
        vm: &Vm,
        source: &Arc<Connection>,
        target: &Arc<Connection>,
        host: &HostRef,
        mapping: VmMapping,
        mechanism: MigrationMechanism,
        resume_after: bool,
    ) -> Result<OperationHandle> {
        let storage_motion = mapping.requires_storage_motion(&source.cache);
        let network_motion = mapping.requires_network_motion(&source.cache);
        let motionless = !storage_motion && !network_motion;
        let same_connection = source.same_as(target);

        let main: Arc<dyn Operation> = match mechanism {
            MigrationMechanism::Start => Arc::new(StartOnOperation {
                vm: vm.clone(),
                connection: source.clone(),
                host: host.clone(),
                resume: vm.power_state == PowerState::Suspended,
            }),
            MigrationMechanism::LocalMigrate => Arc::new(PoolMigrateOperation {
                vm: vm.clone(),
                connection: source.clone(),
                host: host.clone(),
            }),
            MigrationMechanism::IntraPoolStorageMove => Arc::new(MoveVmOperation {
                vm: vm.clone(),
                connection: source.clone(),
                mapping: mapping.clone(),
            }),
            MigrationMechanism::CrossPoolMigrate
            | MigrationMechanism::CrossPoolMove
            | MigrationMechanism::CrossPoolCopy => {
                let copy = mechanism == MigrationMechanism::CrossPoolCopy;
                // A cross-pool mechanism whose mapping moves nothing within
                // one connection degenerates to the cheaper local paths.
                if motionless && same_connection && !copy && vm.can_be_moved() {
                    Arc::new(MoveVmOperation {
                        vm: vm.clone(),
                        connection: source.clone(),
                        mapping: mapping.clone(),
                    })
                } else if motionless && same_connection && !copy && vm.is_running() {
                    Arc::new(PoolMigrateOperation {
                        vm: vm.clone(),
                        connection: source.clone(),
                        host: host.clone(),
                    })
                } else {
                    Arc::new(CrossPoolTransferOperation {
                        vm: vm.clone(),
                        source: source.clone(),
                        target: target.clone(),
                        host: host.clone(),
                        mapping: mapping.clone(),
                        copy,
                    })
                }
            }
        };

        let op: Arc<dyn Operation> = if resume_after {
            info!(vm = %vm.reference, "chaining resume-and-start after transfer");
            let follow_up = Arc::new(StartOnOperation {
                vm: vm.clone(),
                connection: target.clone(),
                host: host.clone(),
                resume: vm.power_state == PowerState::Suspended,
            });
            Arc::new(SequenceOperation::new(
                format!("Migrate and start '{}'", vm.name_label),
                vec![main, follow_up],
            ))
        } else {
            main
        };

        self.engine.start(op)
    }

    pub fn clone_vm(
        &self,
        vm: &Vm,
        connection: &Arc<Connection>,
        new_name: &str,
    ) -> Result<OperationHandle> {
        self.engine.start(Arc::new(CloneVmOperation {
            vm: vm.clone(),
            connection: connection.clone(),
            new_name: new_name.to_string(),
        }))
    }

    pub fn copy_vm(
        &self,
        vm: &Vm,
        connection: &Arc<Connection>,
        new_name: &str,
        sr: &SrRef,
    ) -> Result<OperationHandle> {
        self.engine.start(Arc::new(CopyVmOperation {
            vm: vm.clone(),
            connection: connection.clone(),
            new_name: new_name.to_string(),
            sr: sr.clone(),
        }))
    }
}

/// Live migration within one pool, no storage or network motion.
pub struct PoolMigrateOperation {
    pub vm: Vm,
    pub connection: Arc<Connection>,
    pub host: HostRef,
}

#[async_trait]
impl Operation for PoolMigrateOperation {
    fn title(&self) -> String {
        format!("Migrate '{}'", self.vm.name_label)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["vm.pool_migrate".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone(), self.host.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(format!("Migrating '{}'", self.vm.name_label));
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session.pool_migrate(&self.vm.reference, &self.host).await?;
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}

/// Lightweight intra-pool storage move of a halted VM's disks.
pub struct MoveVmOperation {
    pub vm: Vm,
    pub connection: Arc<Connection>,
    pub mapping: VmMapping,
}

#[async_trait]
impl Operation for MoveVmOperation {
    fn title(&self) -> String {
        format!("Move '{}'", self.vm.name_label)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["vm.move".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(format!(
            "Moving '{}' to '{}'",
            self.vm.name_label, self.mapping.target_name
        ));
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session.vm_move(&self.vm.reference, &self.mapping.storage).await?;
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}

/// Cross-pool migrate, move or copy carrying the full disk and interface
/// mapping. Receive preparation occupies the first tenth of the progress
/// scale, the transfer itself the rest.
pub struct CrossPoolTransferOperation {
    pub vm: Vm,
    pub source: Arc<Connection>,
    pub target: Arc<Connection>,
    pub host: HostRef,
    pub mapping: VmMapping,
    pub copy: bool,
}

#[async_trait]
impl Operation for CrossPoolTransferOperation {
    fn title(&self) -> String {
        if self.copy {
            format!("Copy '{}' to '{}'", self.vm.name_label, self.mapping.target_name)
        } else {
            format!(
                "Migrate '{}' to '{}'",
                self.vm.name_label, self.mapping.target_name
            )
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["vm.migrate_send".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.source.clone())
    }

    fn safe_to_exit(&self) -> bool {
        // The client drives two sessions; exiting mid-transfer strands it.
        false
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone(), self.host.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        let transfer_network = self.mapping.transfer_network.clone().ok_or_else(|| {
            PoolError::InvalidInput(format!(
                "no transfer network selected for '{}'",
                self.vm.name_label
            ))
        })?;

        ctx.set_description(format!(
            "Preparing '{}' to receive '{}'",
            self.mapping.target_name, self.vm.name_label
        ));
        ctx.check_cancelled()?;
        let target_session = self.target.session()?;
        let receive_data = target_session
            .migrate_receive(&self.host, &transfer_network)
            .await?;
        ctx.set_percent(10.0);

        ctx.set_description(format!("Transferring '{}'", self.vm.name_label));
        ctx.check_cancelled()?;
        let source_session = self.source.session()?;
        let task = source_session
            .migrate_send(
                &self.vm.reference,
                &receive_data,
                self.vm.is_running(),
                &self.mapping.storage,
                &self.mapping.networks,
                self.copy,
            )
            .await?;
        ctx.poll_task(&source_session, &task, 10.0, 100.0).await?;
        Ok(())
    }
}

/// Start or resume a VM on a specific host, used standalone and as the
/// follow-up step of a resume-after-migrate chain.
pub struct StartOnOperation {
    pub vm: Vm,
    pub connection: Arc<Connection>,
    pub host: HostRef,
    pub resume: bool,
}

#[async_trait]
impl Operation for StartOnOperation {
    fn title(&self) -> String {
        if self.resume {
            format!("Resume '{}'", self.vm.name_label)
        } else {
            format!("Start '{}'", self.vm.name_label)
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        if self.resume {
            vec!["vm.resume_on".into()]
        } else {
            vec!["vm.start_on".into()]
        }
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone(), self.host.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(self.title());
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = if self.resume {
            session.vm_resume_on(&self.vm.reference, &self.host).await?
        } else {
            session.vm_start_on(&self.vm.reference, &self.host).await?
        };
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}

pub struct CloneVmOperation {
    pub vm: Vm,
    pub connection: Arc<Connection>,
    pub new_name: String,
}

#[async_trait]
impl Operation for CloneVmOperation {
    fn title(&self) -> String {
        format!("Clone '{}' as '{}'", self.vm.name_label, self.new_name)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["vm.clone".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(self.title());
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session.vm_clone(&self.vm.reference, &self.new_name).await?;
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}

pub struct CopyVmOperation {
    pub vm: Vm,
    pub connection: Arc<Connection>,
    pub new_name: String,
    pub sr: SrRef,
}

#[async_trait]
impl Operation for CopyVmOperation {
    fn title(&self) -> String {
        format!("Copy '{}' as '{}'", self.vm.name_label, self.new_name)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["vm.copy".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.vm.reference.0.clone(), self.sr.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(self.title());
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session
            .vm_copy(&self.vm.reference, &self.new_name, &self.sr)
            .await?;
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}
