pub mod cache;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod failure;
pub mod host_ops;
pub mod mapping;
pub mod objects;
pub mod operation;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod rpc;
pub mod sr_ops;
pub mod version;

pub use error::PoolError;
pub use failure::Failure;

pub type Result<T> = std::result::Result<T, PoolError>;

// Convenience re-exports for the planning and execution surface
pub use cache::SnapshotCache;
pub use config::EngineConfig;
pub use evaluator::{EligibilityResult, MigrationEvaluator, MigrationMechanism, OperationKind};
pub use mapping::{MappingBuilder, PlanTarget, VmMapping};
pub use operation::{Engine, OperationHandle, OperationSnapshot, OperationState};
pub use orchestrator::MigrationOrchestrator;
pub use registry::OperationRegistry;
pub use rpc::{Connection, ConnectionRegistry, RpcSession};

/// Install a default tracing subscriber honouring `RUST_LOG`. Embedders
/// with their own subscriber skip this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
