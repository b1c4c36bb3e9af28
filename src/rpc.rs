//! The RPC boundary. The control plane's wire protocol is owned elsewhere;
//! this crate consumes it through the [`RpcSession`] trait and treats every
//! declared error as a (code, params) pair to be classified by the failure
//! decoder.

use crate::cache::SnapshotCache;
use crate::objects::*;
use crate::{PoolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteTaskStatus {
    Pending,
    Success,
    Failure,
    Cancelled,
}

/// Snapshot of a server-side long-running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    pub reference: TaskRef,
    pub status: RemoteTaskStatus,
    /// Fraction complete in [0, 1].
    pub progress: f64,
    /// Error description on failure: code at index 0, parameters after.
    pub error_info: Vec<String>,
    /// Result payload on success, usually a new object reference.
    pub result: Option<String>,
}

/// Receive-side token handed out by a migrate-receive call; passed back
/// verbatim to the sending side.
pub type ReceiveData = HashMap<String, String>;

/// One authenticated session against a connection's control plane.
///
/// Calls are synchronous RPCs from the caller's point of view; methods
/// returning a [`TaskRef`] start a remote job to be driven by the
/// operation engine's task polling.
#[async_trait]
pub trait RpcSession: Send + Sync {
    // Feasibility probes (dry-run, no state change)
    async fn assert_can_boot_here(&self, vm: &VmRef, host: &HostRef) -> Result<()>;
    async fn migrate_receive(&self, host: &HostRef, network: &NetworkRef) -> Result<ReceiveData>;
    async fn assert_can_migrate(
        &self,
        vm: &VmRef,
        receive_data: &ReceiveData,
        live: bool,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
    ) -> Result<()>;

    // Async-task-returning mutations
    async fn migrate_send(
        &self,
        vm: &VmRef,
        receive_data: &ReceiveData,
        live: bool,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        copy: bool,
    ) -> Result<TaskRef>;
    async fn pool_migrate(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef>;
    async fn vm_move(&self, vm: &VmRef, vdi_map: &HashMap<VdiRef, SrRef>) -> Result<TaskRef>;
    async fn vm_copy(&self, vm: &VmRef, new_name: &str, sr: &SrRef) -> Result<TaskRef>;
    async fn vm_clone(&self, vm: &VmRef, new_name: &str) -> Result<TaskRef>;
    async fn vm_start_on(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef>;
    async fn vm_resume_on(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef>;
    async fn vm_clean_shutdown(&self, vm: &VmRef) -> Result<TaskRef>;
    async fn sr_create(
        &self,
        host: &HostRef,
        name: &str,
        kind: &str,
        shared: bool,
        device_config: &HashMap<String, String>,
    ) -> Result<TaskRef>;
    async fn sr_scan(&self, sr: &SrRef) -> Result<TaskRef>;

    // Synchronous mutations
    async fn host_disable(&self, host: &HostRef) -> Result<()>;
    async fn host_enable(&self, host: &HostRef) -> Result<()>;
    async fn pbd_plug(&self, pbd: &PbdRef) -> Result<()>;

    // Remote task plumbing
    async fn task_status(&self, task: &TaskRef) -> Result<RemoteTask>;
    async fn task_cancel(&self, task: &TaskRef) -> Result<()>;
    async fn task_destroy(&self, task: &TaskRef) -> Result<()>;

    /// Open a short-lived duplicate of this session. Probes run on a
    /// duplicate so their failures never poison the primary session.
    async fn duplicate(&self) -> Result<Arc<dyn RpcSession>>;

    // RBAC
    fn is_superuser(&self) -> bool {
        true
    }

    /// The calls this session's role may make, or `None` when the server
    /// does not advertise a permission list.
    fn permissions(&self) -> Option<Vec<String>> {
        None
    }

    fn has_permission(&self, permission: &str) -> bool {
        if self.is_superuser() {
            return true;
        }
        match self.permissions() {
            Some(perms) => perms.iter().any(|p| p == permission),
            None => true,
        }
    }
}

/// One managed pool: its session plus the snapshot cache mirroring it.
pub struct Connection {
    pub id: String,
    pub address: String,
    session: Mutex<Option<Arc<dyn RpcSession>>>,
    pub cache: Arc<SnapshotCache>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        session: Arc<dyn RpcSession>,
        cache: Arc<SnapshotCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            address: address.into(),
            session: Mutex::new(Some(session)),
            cache,
        })
    }

    pub fn session(&self) -> Result<Arc<dyn RpcSession>> {
        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PoolError::SessionLost(self.address.clone()))
    }

    pub fn set_session(&self, session: Option<Arc<dyn RpcSession>>) {
        *self.session.lock().unwrap() = session;
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

/// All active connections. Injected into the evaluator and orchestrator;
/// single-instance-per-process semantics live at the wiring layer, not here.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| c.id != connection.id);
        connections.push(connection);
    }

    pub fn remove(&self, id: &str) {
        self.connections.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn resolve(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.address == address)
            .cloned()
    }
}
