mod common;

use common::two_pool_fixture;
use poolctl::evaluator::MigrationMechanism;
use poolctl::mapping::{MappingBuilder, PlanTarget};
use poolctl::objects::*;
use poolctl::operation::Engine;
use poolctl::orchestrator::MigrationOrchestrator;
use poolctl::{EngineConfig, OperationState};
use std::sync::Arc;

fn orchestrator() -> (Arc<Engine>, MigrationOrchestrator) {
    let engine = Engine::new(EngineConfig::default());
    let orchestrator = MigrationOrchestrator::new(engine.clone());
    (engine, orchestrator)
}

#[tokio::test(start_paused = true)]
async fn cross_pool_transfer_prepares_receive_then_sends() {
    let fx = two_pool_fixture();
    let mapping = MappingBuilder::new(
        &fx.vm,
        &fx.source.cache,
        &fx.target.cache,
        true,
        PlanTarget::Host(HostRef::new("host-b1")),
        "bravo-1",
    )
    .build()
    .unwrap();
    assert_eq!(mapping.transfer_network, Some(NetworkRef::new("net-b")));

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &fx.vm,
            &fx.source,
            &fx.target,
            &HostRef::new("host-b1"),
            mapping,
            MigrationMechanism::CrossPoolMigrate,
            false,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Completed);
    assert_eq!(fx.target_session.count_calls("migrate_receive host-b1"), 1);
    assert_eq!(
        fx.source_session
            .count_calls("migrate_send vm-1 host-b1 copy=false"),
        1
    );

    // The sending side carries the disk map the builder produced.
    let maps = fx.source_session.recorded_vdi_maps();
    assert_eq!(
        maps.last().unwrap().get(&VdiRef::new("vdi-1")),
        Some(&SrRef::new("sr-b"))
    );
}

#[tokio::test(start_paused = true)]
async fn motionless_same_connection_transfer_degrades_to_move() {
    let fx = two_pool_fixture();
    let mut vm = fx.vm.clone();
    vm.power_state = PowerState::Halted;
    vm.resident_on = None;

    let mapping = MappingBuilder::new(
        &vm,
        &fx.source.cache,
        &fx.source.cache,
        false,
        PlanTarget::Host(HostRef::new("host-a1")),
        "alpha-1",
    )
    .build()
    .unwrap();

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &vm,
            &fx.source,
            &fx.source,
            &HostRef::new("host-a1"),
            mapping,
            MigrationMechanism::CrossPoolMigrate,
            false,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Completed);
    assert_eq!(fx.source_session.count_calls("vm_move"), 1);
    assert_eq!(fx.source_session.count_calls("migrate_send"), 0);
}

#[tokio::test(start_paused = true)]
async fn motionless_same_connection_running_vm_degrades_to_pool_migrate() {
    let fx = two_pool_fixture();
    let mapping = MappingBuilder::new(
        &fx.vm,
        &fx.source.cache,
        &fx.source.cache,
        false,
        PlanTarget::Host(HostRef::new("host-a2")),
        "alpha-2",
    )
    .build()
    .unwrap();

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &fx.vm,
            &fx.source,
            &fx.source,
            &HostRef::new("host-a2"),
            mapping,
            MigrationMechanism::CrossPoolMigrate,
            false,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Completed);
    assert_eq!(fx.source_session.count_calls("pool_migrate vm-1 host-a2"), 1);
    assert_eq!(fx.source_session.count_calls("migrate_send"), 0);
}

#[tokio::test(start_paused = true)]
async fn resume_after_chains_a_start_on_the_destination() {
    let fx = two_pool_fixture();
    let mut vm = fx.vm.clone();
    vm.power_state = PowerState::Suspended;

    let mapping = MappingBuilder::new(
        &vm,
        &fx.source.cache,
        &fx.target.cache,
        true,
        PlanTarget::Host(HostRef::new("host-b1")),
        "bravo-1",
    )
    .build()
    .unwrap();

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &vm,
            &fx.source,
            &fx.target,
            &HostRef::new("host-b1"),
            mapping,
            MigrationMechanism::CrossPoolMigrate,
            true,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Completed);

    let target_calls = fx.target_session.calls();
    let receive_at = target_calls
        .iter()
        .position(|c| c.starts_with("migrate_receive"))
        .unwrap();
    let resume_at = target_calls
        .iter()
        .position(|c| c.starts_with("vm_resume_on vm-1 host-b1"))
        .unwrap();
    assert!(receive_at < resume_at);
    assert_eq!(fx.source_session.count_calls("migrate_send"), 1);
}

#[tokio::test(start_paused = true)]
async fn cross_pool_transfer_without_network_fails_cleanly() {
    let fx = two_pool_fixture();
    let mut mapping = MappingBuilder::new(
        &fx.vm,
        &fx.source.cache,
        &fx.target.cache,
        true,
        PlanTarget::Host(HostRef::new("host-b1")),
        "bravo-1",
    )
    .build()
    .unwrap();
    mapping.set_transfer_network(None);

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &fx.vm,
            &fx.source,
            &fx.target,
            &HostRef::new("host-b1"),
            mapping,
            MigrationMechanism::CrossPoolMigrate,
            false,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Failed);
    assert!(handle
        .error_message()
        .unwrap()
        .contains("no transfer network"));
    assert_eq!(fx.target_session.count_calls("migrate_receive"), 0);
}

#[tokio::test(start_paused = true)]
async fn copy_mechanism_sets_the_copy_flag() {
    let fx = two_pool_fixture();
    let mapping = MappingBuilder::new(
        &fx.vm,
        &fx.source.cache,
        &fx.target.cache,
        true,
        PlanTarget::Host(HostRef::new("host-b1")),
        "bravo-1",
    )
    .build()
    .unwrap();

    let (_engine, orch) = orchestrator();
    let handle = orch
        .execute(
            &fx.vm,
            &fx.source,
            &fx.target,
            &HostRef::new("host-b1"),
            mapping,
            MigrationMechanism::CrossPoolCopy,
            false,
        )
        .unwrap();

    assert_eq!(handle.wait().await, OperationState::Completed);
    assert_eq!(
        fx.source_session
            .count_calls("migrate_send vm-1 host-b1 copy=true"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn clone_and_copy_run_as_plain_operations() {
    let fx = two_pool_fixture();
    let (_engine, orch) = orchestrator();

    let cloned = orch.clone_vm(&fx.vm, &fx.source, "web-clone").unwrap();
    assert_eq!(cloned.wait().await, OperationState::Completed);
    assert_eq!(fx.source_session.count_calls("vm_clone vm-1 web-clone"), 1);

    let copied = orch
        .copy_vm(&fx.vm, &fx.source, "web-copy", &SrRef::new("sr-a"))
        .unwrap();
    assert_eq!(copied.wait().await, OperationState::Completed);
    assert_eq!(
        fx.source_session.count_calls("vm_copy vm-1 web-copy sr-a"),
        1
    );
}
