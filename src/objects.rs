//! Read-mostly snapshots of remote objects. Each record mirrors the
//! server-reported fields the planner needs; the cache may refresh them
//! concurrently, so the core only ever works on cloned snapshots.

use serde::{Deserialize, Serialize};

macro_rules! opaque_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(r: impl Into<String>) -> Self {
                Self(r.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_ref!(VmRef);
opaque_ref!(HostRef);
opaque_ref!(PoolRef);
opaque_ref!(SrRef);
opaque_ref!(NetworkRef);
opaque_ref!(VdiRef);
opaque_ref!(VbdRef);
opaque_ref!(VifRef);
opaque_ref!(PbdRef);
opaque_ref!(
    /// Handle of a server-side long-running job.
    TaskRef
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Running,
    Paused,
    Suspended,
}

impl PowerState {
    /// States where the VM holds memory on a host, live or frozen.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PowerState::Running | PowerState::Paused | PowerState::Suspended
        )
    }
}

/// The four memory bounds reported for a VM. Dynamic memory control is in
/// play whenever the dynamic range is not pinned to the static maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConstraints {
    pub static_min: i64,
    pub dynamic_min: i64,
    pub dynamic_max: i64,
    pub static_max: i64,
}

impl MemoryConstraints {
    pub fn fixed(size: i64) -> Self {
        Self {
            static_min: size,
            dynamic_min: size,
            dynamic_max: size,
            static_max: size,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.static_min <= self.dynamic_min
            && self.dynamic_min == self.dynamic_max
            && self.dynamic_max == self.static_max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub reference: VmRef,
    pub uuid: String,
    pub name_label: String,
    pub power_state: PowerState,
    pub resident_on: Option<HostRef>,
    pub affinity: Option<HostRef>,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub snapshot_of: Option<VmRef>,
    pub memory: MemoryConstraints,
    pub vbds: Vec<VbdRef>,
    pub vifs: Vec<VifRef>,
    pub allowed_operations: Vec<String>,
}

impl Vm {
    /// The host this VM currently belongs to: where it is resident, or its
    /// placement affinity when halted.
    pub fn home(&self) -> Option<&HostRef> {
        self.resident_on.as_ref().or(self.affinity.as_ref())
    }

    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }

    /// Whether the lightweight intra-pool storage move applies.
    pub fn can_be_moved(&self) -> bool {
        self.power_state == PowerState::Halted && !self.is_a_template && !self.is_a_snapshot
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub reference: HostRef,
    pub uuid: String,
    pub name_label: String,
    pub enabled: bool,
    /// Dot-separated product version as reported by the server.
    pub software_version: String,
    pub pool: PoolRef,
    /// Licence restriction: dynamic memory control unavailable.
    pub restrict_dmc: bool,
    pub resident_vms: Vec<VmRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub reference: PoolRef,
    pub uuid: String,
    pub name_label: String,
    pub master: HostRef,
    pub default_sr: Option<SrRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sr {
    pub reference: SrRef,
    pub uuid: String,
    pub name_label: String,
    pub shared: bool,
    /// "iso" for ISO libraries, "user" or "" for disk storage.
    pub content_type: String,
    pub supports_storage_motion: bool,
    pub pbds: Vec<PbdRef>,
}

impl Sr {
    pub fn is_iso(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("iso")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub reference: NetworkRef,
    pub uuid: String,
    pub name_label: String,
    /// Carries the pool's management traffic.
    pub is_management: bool,
    /// Hosts with an attached interface on this network.
    pub host_refs: Vec<HostRef>,
}

impl Network {
    pub fn reachable_from(&self, host: &HostRef) -> bool {
        self.host_refs.contains(host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vdi {
    pub reference: VdiRef,
    pub uuid: String,
    pub name_label: String,
    pub sr: SrRef,
    pub virtual_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdType {
    Cd,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vbd {
    pub reference: VbdRef,
    pub uuid: String,
    pub vm: VmRef,
    pub vdi: Option<VdiRef>,
    pub vbd_type: VbdType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vif {
    pub reference: VifRef,
    pub uuid: String,
    pub vm: VmRef,
    pub network: NetworkRef,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pbd {
    pub reference: PbdRef,
    pub uuid: String,
    pub host: HostRef,
    pub sr: SrRef,
    pub currently_attached: bool,
}
