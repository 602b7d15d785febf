//! Abstract hardware topology contract (the "Topology Adapter").
//!
//! The engine is never coupled to a specific hardware-discovery library; it
//! only depends on the narrow set of operations declared by the
//! [`Topology`] trait. The real backend ([`real::RealTopology`], gated
//! behind the `hwloc` feature) wraps the `hwlocality` crate; tests build
//! synthetic trees with [`mock::MockTopology`].

#[cfg(feature = "hwloc")]
pub mod real;

pub mod mock;

use crate::bitmap::Bitset;
use crate::error::{MpibindError, Result};

/// Opaque identity of a normal (non-I/O) topology object. Stable for the
/// lifetime of a given `Topology` value; never dereferenced by the engine,
/// only compared and used to look other objects up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Normal-object type tags the engine distinguishes. Anything the topology
/// reports that doesn't matter to the engine collapses to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Machine,
    Package,
    NumaNode,
    Core,
    Pu,
    Other,
}

/// Classification of an attached I/O device, mirroring the three OS-device
/// kinds the device inventory cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// Application-visible GPU handle (CUDA/OpenCL-style "coprocessor").
    Coprocessor,
    /// Vendor management view of a GPU (NVML/RSMI-style).
    GpuManagement,
    /// Open-fabrics NIC (InfiniBand/RoCE/OmniPath-style).
    OpenFabricsNic,
    /// Anything else; never consumed by the device inventory.
    Other,
}

/// A read-only snapshot of one attached I/O (OS) device as the device
/// inventory needs to see it.
#[derive(Debug, Clone)]
pub struct IoDeviceView {
    pub kind: IoKind,
    pub name: String,
    pub infos: Vec<(String, String)>,
    /// PCI bus id of the device's PCI parent, formatted `dddd:bb:dd.f`.
    /// `None` when the device has no PCI parent (skipped by the inventory
    /// with a warning).
    pub pci_busid: Option<String>,
    pub vendor_id: Option<u32>,
    /// Nearest non-I/O ancestor, i.e. the object the device hangs off of
    /// for NUMA/CPU-affinity purposes.
    pub ancestor: ObjectId,
}

impl IoDeviceView {
    /// Reads a named info key, e.g. `"AMDUUID"`, `"NodeGUID"`.
    pub fn info(&self, key: &str) -> Option<&str> {
        self.infos
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// The abstract hardware topology the engine consumes. See spec §4.1 for
/// the exact operation list; every method here is named after one bullet
/// there.
pub trait Topology {
    fn root(&self) -> ObjectId;

    fn object_type(&self, id: ObjectId) -> ObjectType;

    /// The kernel/topology-provider's own os-index for this object, when
    /// it has one (cores and PUs always do; Machine typically doesn't).
    fn os_index(&self, id: ObjectId) -> Option<usize>;

    fn depth(&self, id: ObjectId) -> usize;

    /// Deepest depth at which `Core` objects would be found, or the
    /// nearest shallower type if no `Core` objects exist in this topology
    /// ("canonical core depth", spec §4.1).
    fn core_depth(&self) -> usize;

    fn cpuset(&self, id: ObjectId) -> Bitset;

    fn nodeset(&self, id: ObjectId) -> Bitset;

    fn parent(&self, id: ObjectId) -> Option<ObjectId>;

    fn children(&self, id: ObjectId) -> Vec<ObjectId>;

    /// All normal objects at exactly `depth`, in enumeration order.
    fn objects_at_depth(&self, depth: usize) -> Vec<ObjectId>;

    /// All normal objects of `depth` that lie within `within`'s cpuset,
    /// i.e. the objects a matcher rooted at `within` should see.
    fn objects_at_depth_within(&self, depth: usize, within: ObjectId) -> Vec<ObjectId> {
        let bound = self.cpuset(within);
        self.objects_at_depth(depth)
            .into_iter()
            .filter(|id| {
                let set = self.cpuset(*id);
                !set.is_empty() && Bitset::intersection(&set, &bound) == set
            })
            .collect()
    }

    fn numa_domains(&self) -> Vec<ObjectId>;

    /// All attached I/O devices, in topology enumeration order.
    fn io_devices(&self) -> Vec<IoDeviceView>;

    /// Restricts the topology in place to `cpuset`, removing now-cpuless
    /// objects (spec §4.8, CPU-kind restriction).
    fn restrict_by_cpuset(&mut self, cpuset: &Bitset) -> Result<()>;

    /// Restricts the topology in place to `nodeset`, removing now-memless
    /// objects (spec §4.8, MEM-kind restriction).
    fn restrict_by_nodeset(&mut self, nodeset: &Bitset) -> Result<()>;

    /// Binds the calling process/thread's CPU affinity to `cpuset`.
    fn set_cpubind(&self, cpuset: &Bitset) -> std::io::Result<()>;

    /// Loads a topology when the caller bound none to the handle (spec
    /// §6.1's source-selection order: `MPIBIND_TOPOFILE` if set, else live
    /// system discovery). The default implementation refuses, since most
    /// `Topology` implementations (e.g. [`mock::MockTopology`]) have no
    /// notion of "the current machine"; only [`real::RealTopology`]
    /// overrides this.
    fn load_default() -> Result<Self>
    where
        Self: Sized,
    {
        Err(MpibindError::TopologyUnusable(
            "no topology bound to this handle and this Topology implementation cannot discover a default one".to_string(),
        ))
    }
}

/// Hardware SMT level: the arity (child PU count) of a representative core
/// object at `core_depth`, or 1 if the topology has no core-level objects
/// at all.
pub fn hardware_smt_level<T: Topology + ?Sized>(topo: &T) -> usize {
    let core_depth = topo.core_depth();
    topo.objects_at_depth(core_depth)
        .into_iter()
        .find_map(|core| {
            let n = topo.children(core).len();
            if n > 0 {
                Some(n)
            } else {
                None
            }
        })
        .unwrap_or(1)
}

/// Validates `smt` against the topology's hardware SMT level (spec §3
/// invariant 5 / §4.6 failure modes).
pub fn validate_smt<T: Topology + ?Sized>(topo: &T, smt: usize) -> Result<()> {
    let hw = hardware_smt_level(topo);
    if smt > hw {
        return Err(MpibindError::InvalidInput(format!(
            "smt={smt} exceeds hardware SMT level {hw}"
        )));
    }
    Ok(())
}
