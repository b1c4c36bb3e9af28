//! Storage repository operations. Creation is single-target and fail-fast;
//! repair is a best-effort batch: a failure on one SR is remembered and
//! surfaced at the end without blocking the remaining items. Rescans are
//! one operation per SR, with a call-site cap on how many run at once.

use crate::objects::*;
use crate::operation::{Engine, OpContext, Operation, OperationHandle};
use crate::rpc::{Connection, RpcSession};
use crate::{PoolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Create a new SR on a host and scan it once attached.
pub struct SrCreateOperation {
    pub connection: Arc<Connection>,
    pub host: HostRef,
    pub name: String,
    pub kind: String,
    pub shared: bool,
    pub device_config: HashMap<String, String>,
}

#[async_trait]
impl Operation for SrCreateOperation {
    fn title(&self) -> String {
        format!("Create SR '{}'", self.name)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["sr.create".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.host.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.set_description(format!("Creating SR '{}'", self.name));
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session
            .sr_create(
                &self.host,
                &self.name,
                &self.kind,
                self.shared,
                &self.device_config,
            )
            .await?;
        let created = ctx.poll_task(&session, &task, 0.0, 85.0).await?;

        // The create task's result names the new repository.
        let Some(sr_ref) = created.map(SrRef::new) else {
            ctx.set_percent(100.0);
            return Ok(());
        };
        ctx.set_description(format!("Scanning SR '{}'", self.name));
        ctx.check_cancelled()?;
        let scan = session.sr_scan(&sr_ref).await?;
        ctx.poll_task(&session, &scan, 85.0, 100.0).await?;
        Ok(())
    }
}

/// Repair one or more SRs by plugging their detached PBDs, then rescanning.
/// Best-effort across the batch: SR 2 failing never stops SR 3.
pub struct SrRepairOperation {
    pub connection: Arc<Connection>,
    pub srs: Vec<SrRef>,
}

#[async_trait]
impl Operation for SrRepairOperation {
    fn title(&self) -> String {
        match self.srs.len() {
            1 => "Repair SR".to_string(),
            n => format!("Repair {n} SRs"),
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["pbd.plug".into(), "sr.scan".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn safe_to_exit(&self) -> bool {
        false
    }

    fn applies_to(&self) -> Vec<String> {
        self.srs.iter().map(|s| s.0.clone()).collect()
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        let session = self.connection.session()?;
        let n = self.srs.len().max(1) as f64;
        let mut last_error: Option<PoolError> = None;

        for (i, sr_ref) in self.srs.iter().enumerate() {
            ctx.check_cancelled()?;
            let sub = ctx.subrange(i as f64 / n * 100.0, (i + 1) as f64 / n * 100.0);

            let Some(sr) = self.connection.cache.sr(sr_ref) else {
                last_error = Some(PoolError::ObjectNotFound {
                    kind: "SR",
                    reference: sr_ref.0.clone(),
                });
                continue;
            };
            sub.set_description(format!("Repairing SR '{}'", sr.name_label));

            match self.repair_one(&sub, &session, &sr).await {
                Ok(()) => info!(sr = %sr_ref, "SR repaired"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(sr = %sr_ref, error = %e, "SR repair failed, continuing with remaining SRs");
                    last_error = Some(e);
                }
            }
            sub.set_percent(100.0);
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl SrRepairOperation {
    async fn repair_one(
        &self,
        ctx: &OpContext,
        session: &Arc<dyn RpcSession>,
        sr: &Sr,
    ) -> Result<()> {
        let pbds = self.connection.cache.pbds_of_sr(sr);
        let detached: Vec<_> = pbds.iter().filter(|p| !p.currently_attached).collect();

        let plug_span = 70.0;
        let steps = detached.len().max(1) as f64;
        for (i, pbd) in detached.iter().enumerate() {
            ctx.check_cancelled()?;
            session.pbd_plug(&pbd.reference).await?;
            ctx.set_percent((i + 1) as f64 / steps * plug_span);
        }

        ctx.check_cancelled()?;
        let scan = session.sr_scan(&sr.reference).await?;
        ctx.poll_task(session, &scan, plug_span, 100.0).await?;
        Ok(())
    }
}

/// Rescan a single SR.
pub struct SrScanOperation {
    pub connection: Arc<Connection>,
    pub sr: Sr,
}

#[async_trait]
impl Operation for SrScanOperation {
    fn title(&self) -> String {
        format!("Rescan SR '{}'", self.sr.name_label)
    }

    fn required_permissions(&self) -> Vec<String> {
        vec!["sr.scan".into()]
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    fn suppress_history(&self) -> bool {
        // Routine refreshes would drown the history view.
        true
    }

    fn applies_to(&self) -> Vec<String> {
        vec![self.sr.reference.0.clone()]
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        ctx.check_cancelled()?;
        let session = self.connection.session()?;
        let task = session.sr_scan(&self.sr.reference).await?;
        ctx.poll_task(&session, &task, 0.0, 100.0).await?;
        Ok(())
    }
}

/// Start a rescan operation per SR, at most `concurrency` in flight at
/// once. Returns once every rescan has finished; failures are contained
/// per SR and the last one is returned.
pub async fn rescan_srs(
    engine: &Arc<Engine>,
    connection: &Arc<Connection>,
    srs: Vec<Sr>,
    concurrency: usize,
) -> Result<Vec<OperationHandle>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(srs.len());
    let mut last_error: Option<PoolError> = None;

    for sr in srs {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let handle = engine.start(Arc::new(SrScanOperation {
            connection: connection.clone(),
            sr,
        }))?;
        handles.push(handle.clone());
        tokio::spawn(async move {
            handle.wait().await;
            drop(permit);
        });
    }

    for handle in &handles {
        handle.wait().await;
        if let Some(message) = handle.error_message() {
            warn!(operation = %handle.title(), error = %message, "SR rescan failed");
            last_error = Some(PoolError::Transport(message));
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(handles),
    }
}
