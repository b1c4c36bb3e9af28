//! Host maintenance: disable the host so nothing new lands on it, then
//! shut down each resident VM. If any later phase fails, the disable is
//! rolled back by re-enabling the host; a rollback failure is logged and
//! the original error is always what surfaces.

use crate::objects::*;
use crate::operation::{OpContext, Operation};
use crate::rpc::{Connection, RpcSession};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct EnterMaintenanceOperation {
    pub connection: Arc<Connection>,
    pub host: Host,
}

#[async_trait]
impl Operation for EnterMaintenanceOperation {
    fn title(&self) -> String {
        format!("Enter maintenance mode on '{}'", self.host.name_label)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["host.disable".into(), "vm.clean_shutdown".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn safe_to_exit(&self) -> bool {
        false
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.host.reference.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        let session = self.connection.session()?;

        ctx.set_description(format!("Disabling '{}'", self.host.name_label));
        ctx.check_cancelled()?;
        session.host_disable(&self.host.reference).await?;
        ctx.set_percent(10.0);

        match self.shut_down_residents(ctx, &session).await {
            Ok(()) => {
                ctx.set_percent(100.0);
                info!(host = %self.host.reference, "host entered maintenance mode");
                Ok(())
            }
            Err(original) => {
                // Best-effort rollback; the original error is what surfaces.
                if let Err(e) = session.host_enable(&self.host.reference).await {
                    warn!(host = %self.host.reference, error = %e,
                          "failed to re-enable host after maintenance failure");
                }
                Err(original)
            }
        }
    }
}

impl EnterMaintenanceOperation {
    /// Shut down the host's resident VMs one at a time. Cancellation is
    /// checked between VMs: shutdowns already issued cannot be undone, but
    /// the remaining ones are skipped.
    async fn shut_down_residents(
        &self,
        ctx: &OpContext,
        session: &Arc<dyn RpcSession>,
    ) -> Result<()> {
        let residents = &self.host.resident_vms;
        if residents.is_empty() {
            return Ok(());
        }

        let span_lo = 10.0;
        let span_hi = 100.0;
        let n = residents.len() as f64;
        for (i, vm_ref) in residents.iter().enumerate() {
            ctx.check_cancelled()?;
            let name = self
                .connection
                .cache
                .vm(vm_ref)
                .map(|v| v.name_label)
                .unwrap_or_else(|| vm_ref.0.clone());
            ctx.set_description(format!("Shutting down '{name}'"));

            let lo = span_lo + i as f64 / n * (span_hi - span_lo);
            let hi = span_lo + (i + 1) as f64 / n * (span_hi - span_lo);
            let task = session.vm_clean_shutdown(vm_ref).await?;
            ctx.poll_task(session, &task, lo, hi).await?;
        }
        Ok(())
    }
}
