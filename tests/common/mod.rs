//! Shared test harness: a scripted in-memory RPC session plus cache
//! fixtures for a two-pool setup.

#![allow(dead_code)]

use async_trait::async_trait;
use poolctl::cache::SnapshotCache;
use poolctl::failure::Failure;
use poolctl::objects::*;
use poolctl::rpc::{Connection, ReceiveData, RemoteTask, RemoteTaskStatus, RpcSession};
use poolctl::{PoolError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// One scripted step of a remote task's lifecycle. The last step repeats.
#[derive(Debug, Clone)]
pub enum TaskStep {
    Pending(f64),
    Success(Option<String>),
    Fail(Vec<String>),
    Vanish,
}

#[derive(Default)]
struct MockState {
    task_seq: usize,
    scripts: HashMap<TaskRef, VecDeque<TaskStep>>,
    pending_scripts: VecDeque<Vec<TaskStep>>,
    cancelled_tasks: Vec<TaskRef>,
    boot_failures: HashMap<(String, String), Vec<String>>,
    assert_failures: HashMap<String, Vec<String>>,
    pbd_failures: HashMap<String, Vec<String>>,
    last_receive_host: Option<String>,
    recorded_vdi_maps: Vec<HashMap<VdiRef, SrRef>>,
    recorded_vif_maps: Vec<HashMap<VifRef, NetworkRef>>,
    calls: Vec<String>,
    superuser: bool,
    permissions: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState {
                superuser: true,
                ..Default::default()
            })),
        })
    }

    /// Queue the lifecycle script for the next task-returning call.
    pub fn script_next_task(&self, steps: Vec<TaskStep>) {
        self.state.lock().unwrap().pending_scripts.push_back(steps);
    }

    pub fn fail_boot(&self, vm: &str, host: &str, info: &[&str]) {
        self.state.lock().unwrap().boot_failures.insert(
            (vm.to_string(), host.to_string()),
            info.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make `assert_can_migrate` fail for probes prepared against `host`.
    pub fn fail_assert_for_host(&self, host: &str, info: &[&str]) {
        self.state.lock().unwrap().assert_failures.insert(
            host.to_string(),
            info.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail_pbd(&self, pbd: &str, info: &[&str]) {
        self.state.lock().unwrap().pbd_failures.insert(
            pbd.to_string(),
            info.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_permissions(&self, superuser: bool, permissions: Option<Vec<String>>) {
        let mut st = self.state.lock().unwrap();
        st.superuser = superuser;
        st.permissions = permissions;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn recorded_vdi_maps(&self) -> Vec<HashMap<VdiRef, SrRef>> {
        self.state.lock().unwrap().recorded_vdi_maps.clone()
    }

    pub fn recorded_vif_maps(&self) -> Vec<HashMap<VifRef, NetworkRef>> {
        self.state.lock().unwrap().recorded_vif_maps.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn mint_task(&self, call: String) -> TaskRef {
        let mut st = self.state.lock().unwrap();
        st.calls.push(call);
        st.task_seq += 1;
        let task = TaskRef::new(format!("task-{}", st.task_seq));
        let script = st
            .pending_scripts
            .pop_front()
            .unwrap_or_else(|| vec![TaskStep::Success(None)]);
        st.scripts.insert(task.clone(), script.into());
        task
    }

    fn remote_err(info: &[String]) -> PoolError {
        PoolError::Remote(Failure::from_error_info(info))
    }
}

#[async_trait]
impl RpcSession for MockSession {
    async fn assert_can_boot_here(&self, vm: &VmRef, host: &HostRef) -> Result<()> {
        self.record(format!("assert_can_boot_here {vm} {host}"));
        let st = self.state.lock().unwrap();
        match st.boot_failures.get(&(vm.0.clone(), host.0.clone())) {
            Some(info) => Err(Self::remote_err(info)),
            None => Ok(()),
        }
    }

    async fn migrate_receive(&self, host: &HostRef, network: &NetworkRef) -> Result<ReceiveData> {
        self.record(format!("migrate_receive {host} {network}"));
        self.state.lock().unwrap().last_receive_host = Some(host.0.clone());
        let mut data = ReceiveData::new();
        data.insert("host".into(), host.0.clone());
        data.insert("network".into(), network.0.clone());
        Ok(data)
    }

    async fn assert_can_migrate(
        &self,
        vm: &VmRef,
        receive_data: &ReceiveData,
        _live: bool,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
    ) -> Result<()> {
        self.record(format!("assert_can_migrate {vm}"));
        let mut st = self.state.lock().unwrap();
        st.recorded_vdi_maps.push(vdi_map.clone());
        st.recorded_vif_maps.push(vif_map.clone());
        let host = receive_data
            .get("host")
            .cloned()
            .or_else(|| st.last_receive_host.clone());
        if let Some(host) = host {
            if let Some(info) = st.assert_failures.get(&host) {
                return Err(Self::remote_err(info));
            }
        }
        Ok(())
    }

    async fn migrate_send(
        &self,
        vm: &VmRef,
        receive_data: &ReceiveData,
        _live: bool,
        vdi_map: &HashMap<VdiRef, SrRef>,
        vif_map: &HashMap<VifRef, NetworkRef>,
        copy: bool,
    ) -> Result<TaskRef> {
        {
            let mut st = self.state.lock().unwrap();
            st.recorded_vdi_maps.push(vdi_map.clone());
            st.recorded_vif_maps.push(vif_map.clone());
        }
        let host = receive_data.get("host").cloned().unwrap_or_default();
        Ok(self.mint_task(format!("migrate_send {vm} {host} copy={copy}")))
    }

    async fn pool_migrate(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("pool_migrate {vm} {host}")))
    }

    async fn vm_move(&self, vm: &VmRef, vdi_map: &HashMap<VdiRef, SrRef>) -> Result<TaskRef> {
        self.state
            .lock()
            .unwrap()
            .recorded_vdi_maps
            .push(vdi_map.clone());
        Ok(self.mint_task(format!("vm_move {vm}")))
    }

    async fn vm_copy(&self, vm: &VmRef, new_name: &str, sr: &SrRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("vm_copy {vm} {new_name} {sr}")))
    }

    async fn vm_clone(&self, vm: &VmRef, new_name: &str) -> Result<TaskRef> {
        Ok(self.mint_task(format!("vm_clone {vm} {new_name}")))
    }

    async fn vm_start_on(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("vm_start_on {vm} {host}")))
    }

    async fn vm_resume_on(&self, vm: &VmRef, host: &HostRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("vm_resume_on {vm} {host}")))
    }

    async fn vm_clean_shutdown(&self, vm: &VmRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("vm_clean_shutdown {vm}")))
    }

    async fn sr_create(
        &self,
        host: &HostRef,
        name: &str,
        _kind: &str,
        _shared: bool,
        _device_config: &HashMap<String, String>,
    ) -> Result<TaskRef> {
        Ok(self.mint_task(format!("sr_create {host} {name}")))
    }

    async fn sr_scan(&self, sr: &SrRef) -> Result<TaskRef> {
        Ok(self.mint_task(format!("sr_scan {sr}")))
    }

    async fn host_disable(&self, host: &HostRef) -> Result<()> {
        self.record(format!("host_disable {host}"));
        Ok(())
    }

    async fn host_enable(&self, host: &HostRef) -> Result<()> {
        self.record(format!("host_enable {host}"));
        Ok(())
    }

    async fn pbd_plug(&self, pbd: &PbdRef) -> Result<()> {
        self.record(format!("pbd_plug {pbd}"));
        let st = self.state.lock().unwrap();
        match st.pbd_failures.get(&pbd.0) {
            Some(info) => Err(Self::remote_err(info)),
            None => Ok(()),
        }
    }

    async fn task_status(&self, task: &TaskRef) -> Result<RemoteTask> {
        let mut st = self.state.lock().unwrap();
        if st.cancelled_tasks.contains(task) {
            return Ok(RemoteTask {
                reference: task.clone(),
                status: RemoteTaskStatus::Cancelled,
                progress: 0.0,
                error_info: vec![],
                result: None,
            });
        }
        let script = st.scripts.get_mut(task).ok_or(PoolError::ObjectNotFound {
            kind: "task",
            reference: task.0.clone(),
        })?;
        let step = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(TaskStep::Success(None))
        };
        match step {
            TaskStep::Pending(progress) => Ok(RemoteTask {
                reference: task.clone(),
                status: RemoteTaskStatus::Pending,
                progress,
                error_info: vec![],
                result: None,
            }),
            TaskStep::Success(result) => Ok(RemoteTask {
                reference: task.clone(),
                status: RemoteTaskStatus::Success,
                progress: 1.0,
                error_info: vec![],
                result,
            }),
            TaskStep::Fail(info) => Ok(RemoteTask {
                reference: task.clone(),
                status: RemoteTaskStatus::Failure,
                progress: 0.0,
                error_info: info,
                result: None,
            }),
            TaskStep::Vanish => Err(Self::remote_err(&[
                "HANDLE_INVALID".to_string(),
                "task".to_string(),
                task.0.clone(),
            ])),
        }
    }

    async fn task_cancel(&self, task: &TaskRef) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("task_cancel {task}"));
        st.cancelled_tasks.push(task.clone());
        Ok(())
    }

    async fn task_destroy(&self, task: &TaskRef) -> Result<()> {
        self.record(format!("task_destroy {task}"));
        Ok(())
    }

    async fn duplicate(&self) -> Result<Arc<dyn RpcSession>> {
        self.record("duplicate".to_string());
        Ok(Arc::new(self.clone()))
    }

    fn is_superuser(&self) -> bool {
        self.state.lock().unwrap().superuser
    }

    fn permissions(&self) -> Option<Vec<String>> {
        self.state.lock().unwrap().permissions.clone()
    }
}

// ---- cache fixture helpers ----

pub fn mk_host(reference: &str, name: &str, pool: &str, version: &str) -> Host {
    Host {
        reference: HostRef::new(reference),
        uuid: format!("uuid-{reference}"),
        name_label: name.into(),
        enabled: true,
        software_version: version.into(),
        pool: PoolRef::new(pool),
        restrict_dmc: false,
        resident_vms: vec![],
    }
}

pub fn mk_vm(reference: &str, name: &str, power_state: PowerState) -> Vm {
    Vm {
        reference: VmRef::new(reference),
        uuid: format!("uuid-{reference}"),
        name_label: name.into(),
        power_state,
        resident_on: None,
        affinity: None,
        is_a_template: false,
        is_a_snapshot: false,
        snapshot_of: None,
        memory: MemoryConstraints::fixed(2 << 30),
        vbds: vec![],
        vifs: vec![],
        allowed_operations: vec![],
    }
}

pub fn mk_sr(reference: &str, uuid: &str, name: &str, motion: bool) -> Sr {
    Sr {
        reference: SrRef::new(reference),
        uuid: uuid.into(),
        name_label: name.into(),
        shared: true,
        content_type: "user".into(),
        supports_storage_motion: motion,
        pbds: vec![],
    }
}

pub fn mk_network(reference: &str, name: &str, management: bool, hosts: &[&str]) -> Network {
    Network {
        reference: NetworkRef::new(reference),
        uuid: format!("uuid-{reference}"),
        name_label: name.into(),
        is_management: management,
        host_refs: hosts.iter().map(|h| HostRef::new(*h)).collect(),
    }
}

pub fn attach_disk(cache: &SnapshotCache, vm: &mut Vm, vdi: &str, sr: &str) {
    cache.put_vdi(Vdi {
        reference: VdiRef::new(vdi),
        uuid: format!("uuid-{vdi}"),
        name_label: vdi.into(),
        sr: SrRef::new(sr),
        virtual_size: 8 << 30,
    });
    let vbd = format!("vbd-{vdi}");
    cache.put_vbd(Vbd {
        reference: VbdRef::new(&vbd),
        uuid: format!("uuid-{vbd}"),
        vm: vm.reference.clone(),
        vdi: Some(VdiRef::new(vdi)),
        vbd_type: VbdType::Disk,
    });
    vm.vbds.push(VbdRef::new(vbd));
}

pub fn attach_vif(cache: &SnapshotCache, vm: &mut Vm, vif: &str, network: &str) {
    cache.put_vif(Vif {
        reference: VifRef::new(vif),
        uuid: format!("uuid-{vif}"),
        vm: vm.reference.clone(),
        network: NetworkRef::new(network),
        device: "0".into(),
    });
    vm.vifs.push(VifRef::new(vif));
}

pub struct Fixture {
    pub source: Arc<Connection>,
    pub target: Arc<Connection>,
    pub source_session: Arc<MockSession>,
    pub target_session: Arc<MockSession>,
    pub vm: Vm,
}

/// Two pools: the VM runs on pool A's host a1 with one disk on a
/// source-only SR; pool B has two hosts, a default motion-capable SR and a
/// management network reaching both hosts.
pub fn two_pool_fixture() -> Fixture {
    let source_session = MockSession::new();
    let source_cache = Arc::new(SnapshotCache::new());
    let target_session = MockSession::new();
    let target_cache = Arc::new(SnapshotCache::new());

    let host_a1 = mk_host("host-a1", "alpha-1", "pool-a", "8.2.1");
    source_cache.put_host(host_a1.clone());
    source_cache.put_pool(Pool {
        reference: PoolRef::new("pool-a"),
        uuid: "uuid-pool-a".into(),
        name_label: "Pool A".into(),
        master: host_a1.reference.clone(),
        default_sr: Some(SrRef::new("sr-a")),
    });
    source_cache.put_sr(mk_sr("sr-a", "uuid-sr-a", "A local", true));
    source_cache.put_network(mk_network("net-a", "Pool A mgmt", true, &["host-a1"]));

    let mut vm = mk_vm("vm-1", "web", PowerState::Running);
    vm.resident_on = Some(HostRef::new("host-a1"));
    attach_disk(&source_cache, &mut vm, "vdi-1", "sr-a");
    attach_vif(&source_cache, &mut vm, "vif-1", "net-a");
    source_cache.put_vm(vm.clone());

    for (r, name) in [("host-b1", "bravo-1"), ("host-b2", "bravo-2")] {
        target_cache.put_host(mk_host(r, name, "pool-b", "8.2.1"));
    }
    target_cache.put_pool(Pool {
        reference: PoolRef::new("pool-b"),
        uuid: "uuid-pool-b".into(),
        name_label: "Pool B".into(),
        master: HostRef::new("host-b1"),
        default_sr: Some(SrRef::new("sr-b")),
    });
    target_cache.put_sr(mk_sr("sr-b", "uuid-sr-b", "B shared", true));
    target_cache.put_network(mk_network(
        "net-b",
        "Pool B mgmt",
        true,
        &["host-b1", "host-b2"],
    ));

    let source = Connection::new("conn-a", "a.example", source_session.clone(), source_cache);
    let target = Connection::new("conn-b", "b.example", target_session.clone(), target_cache);

    Fixture {
        source,
        target,
        source_session,
        target_session,
        vm,
    }
}
