//! Handle & Environment Projection: the opaque mapping job object.
//!
//! Configuration mirrors the teacher's `Builder`/`freeze()` construction
//! idiom: a consuming builder accumulates `with_*` settings, and a
//! terminal call turns it into a handle whose inputs are then frozen
//! until `run()` materializes outputs.

use tracing::{debug, info, warn};

use crate::bitmap::Bitset;
use crate::device::DeviceTable;
use crate::distributor::{distribute, DistributeInputs, Mapping};
use crate::env::{self, EnvVar, GpuIdKind};
use crate::error::{MpibindError, Result};
use crate::restrict::{self, RestrictKind};
use crate::topology::{validate_smt, Topology};

pub struct Builder<T> {
    ntasks: usize,
    nthreads: usize,
    greedy: bool,
    gpu_optim: bool,
    smt: usize,
    restrict_ids: Option<String>,
    restrict_kind: RestrictKind,
    topology: Option<T>,
}

impl<T: Topology> Default for Builder<T> {
    fn default() -> Self {
        Builder {
            ntasks: 0,
            nthreads: 0,
            greedy: true,
            gpu_optim: true,
            smt: 0,
            restrict_ids: None,
            restrict_kind: RestrictKind::Cpu,
            topology: None,
        }
    }
}

impl<T: Topology> Builder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ntasks(self, ntasks: usize) -> Self {
        Builder { ntasks, ..self }
    }

    pub fn with_nthreads(self, nthreads: usize) -> Self {
        Builder { nthreads, ..self }
    }

    pub fn with_greedy(self, greedy: bool) -> Self {
        Builder { greedy, ..self }
    }

    pub fn with_gpu_optim(self, gpu_optim: bool) -> Self {
        Builder { gpu_optim, ..self }
    }

    pub fn with_smt(self, smt: usize) -> Self {
        Builder { smt, ..self }
    }

    pub fn with_restriction(self, ids: impl Into<String>, kind: RestrictKind) -> Self {
        Builder { restrict_ids: Some(ids.into()), restrict_kind: kind, ..self }
    }

    pub fn with_topology(self, topology: T) -> Self {
        Builder { topology: Some(topology), ..self }
    }

    /// Freezes the builder into a `Handle`. No discovery or distribution
    /// happens here; that's `Handle::run`'s job.
    pub fn freeze(self) -> Result<Handle<T>> {
        if self.ntasks == 0 {
            return Err(MpibindError::InvalidInput("ntasks must be >= 1".to_string()));
        }
        Ok(Handle {
            ntasks: self.ntasks,
            nthreads: self.nthreads,
            greedy: self.greedy,
            gpu_optim: self.gpu_optim,
            smt: self.smt,
            restrict_ids: self.restrict_ids,
            restrict_kind: self.restrict_kind,
            caller_supplied_topology: self.topology.is_some(),
            topology: self.topology,
            gpu_id_kind: GpuIdKind::default(),
            devices: None,
            mapping: None,
        })
    }
}

/// The mutable mapping job. Inputs are set through [`Builder`]; calling
/// [`Handle::run`] exactly once materializes outputs. After that, only
/// read accessors, environment projection, and [`Handle::apply`] are
/// valid.
pub struct Handle<T> {
    ntasks: usize,
    nthreads: usize,
    greedy: bool,
    gpu_optim: bool,
    smt: usize,
    restrict_ids: Option<String>,
    restrict_kind: RestrictKind,
    topology: Option<T>,
    /// Whether `topology` came from the caller (`with_topology`) rather
    /// than from `Topology::load_default` inside `run()`. Per spec §6.1: a
    /// caller-supplied topology (e.g. a launcher's own already-restricted
    /// XML snapshot) is used as-is and never further restricted; a
    /// topology the engine loaded itself still gets `restrict_ids`
    /// applied.
    caller_supplied_topology: bool,
    gpu_id_kind: GpuIdKind,
    devices: Option<DeviceTable>,
    mapping: Option<Mapping>,
}

impl<T: Topology> Handle<T> {
    pub fn builder() -> Builder<T> {
        Builder::new()
    }

    pub fn set_gpu_id_kind(&mut self, kind: GpuIdKind) {
        self.gpu_id_kind = kind;
    }

    pub fn ntasks(&self) -> usize {
        self.ntasks
    }

    pub fn greedy(&self) -> bool {
        self.greedy
    }

    pub fn gpu_optim(&self) -> bool {
        self.gpu_optim
    }

    pub fn smt(&self) -> usize {
        self.smt
    }

    /// Echoes the restriction spec configured on this handle, if any
    /// (`mpibind_get_restrict_ids`'s counterpart).
    pub fn restrict_ids(&self) -> Option<&str> {
        self.restrict_ids.as_deref()
    }

    /// Echoes the restriction kind configured on this handle
    /// (`mpibind_get_restrict_type`'s counterpart).
    pub fn restrict_kind(&self) -> RestrictKind {
        self.restrict_kind
    }

    /// Gives back a reference to the bound topology, mirroring
    /// `mpibind_get_topology`: callers that passed their own topology in
    /// via `with_topology` retain ownership of it regardless, but this
    /// lets a caller inspect the (possibly engine-loaded) topology this
    /// handle ended up using, e.g. to serialize it for a child task.
    pub fn topology(&self) -> Option<&T> {
        self.topology.as_ref()
    }

    /// Applies any configured restriction, discovers devices, computes
    /// the distribution, and stores the outputs. Must be called exactly
    /// once; a second call is rejected.
    pub fn run(&mut self) -> Result<()> {
        if self.mapping.is_some() {
            return Err(MpibindError::InvalidInput("run() already called on this handle".to_string()));
        }
        if self.topology.is_none() {
            debug!("no topology bound, falling back to this Topology implementation's default source");
            self.topology = Some(T::load_default()?);
        }
        let topo = self.topology.as_mut().expect("just populated if absent");

        validate_smt(topo, self.smt)?;

        if let Some(spec) = self.restrict_ids.clone() {
            let ids = restrict::parse_restrict_ids(&spec)?;
            if ids.is_empty() {
                return Err(MpibindError::InvalidInput("restriction resolved to an empty set".to_string()));
            }
            if self.caller_supplied_topology {
                debug!("caller supplied a topology directly; using it as-is without further restriction (spec §6.1)");
            } else {
                debug!(kind = ?self.restrict_kind, %spec, "applying restriction");
                restrict::apply_restriction(topo, &ids, self.restrict_kind)?;
            }
        }

        let devices = DeviceTable::discover(topo);
        for warning in &devices.warnings {
            warn!(%warning, "device enumeration anomaly");
        }

        let inputs = DistributeInputs {
            ntasks: self.ntasks,
            nthreads_in: self.nthreads,
            greedy: self.greedy,
            gpu_optim: self.gpu_optim,
            smt: self.smt,
        };
        let mapping = distribute(topo, &devices, &inputs)?;
        info!(ntasks = self.ntasks, num_gpus = devices.num_gpus(), "mapping computed");

        self.devices = Some(devices);
        self.mapping = Some(mapping);
        Ok(())
    }

    fn mapping(&self) -> &Mapping {
        self.mapping.as_ref().expect("run() must be called before reading outputs")
    }

    fn devices(&self) -> &DeviceTable {
        self.devices.as_ref().expect("run() must be called before reading outputs")
    }

    pub fn cpuset(&self, task: usize) -> &Bitset {
        &self.mapping().cpusets[task]
    }

    pub fn gpuset(&self, task: usize) -> &[usize] {
        &self.mapping().gpusets[task]
    }

    pub fn thread_count(&self, task: usize) -> usize {
        self.mapping().nthreads[task]
    }

    pub fn num_gpus(&self) -> usize {
        self.devices().num_gpus()
    }

    pub fn gpu_vendor(&self) -> Option<GpuVendor> {
        match self.devices().gpu_vendor() {
            Some(0x1002) => Some(GpuVendor::Amd),
            Some(0x10de) => Some(GpuVendor::Nvidia),
            _ => None,
        }
    }

    /// Per-task identifiers for the mapped GPUs in the handle's selected
    /// id space, as a launcher would read them off before building its
    /// own visibility variable.
    pub fn gpu_ids_for_task(&self, task: usize) -> Vec<String> {
        let vars = env::project(self.mapping(), self.devices(), self.gpu_id_kind);
        vars.into_iter()
            .find(|v| v.name.ends_with("VISIBLE_DEVICES"))
            .map(|v| v.values[task].split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Projects the standard environment variables for the completed
    /// mapping (`OMP_NUM_THREADS`, `OMP_PLACES`, `OMP_PROC_BIND`, and the
    /// vendor visibility variable when GPUs are present).
    pub fn env_vars(&self) -> Vec<EnvVar> {
        env::project(self.mapping(), self.devices(), self.gpu_id_kind)
    }

    /// Binds the calling execution context's CPU affinity to `task`'s
    /// cpuset.
    pub fn apply(&self, task: usize) -> Result<()> {
        let topo = self
            .topology
            .as_ref()
            .ok_or_else(|| MpibindError::TopologyUnusable("no topology bound to this handle".to_string()))?;
        topo.set_cpubind(self.cpuset(task)).map_err(|source| MpibindError::Apply { task, source })
    }

    pub fn task_mapping_report(&self, task: usize) -> String {
        format!(
            "task {task} nthreads {} cpus {} gpus {}",
            self.thread_count(task),
            self.cpuset(task).to_range_list(),
            self.gpuset(task).iter().map(|g| g.to_string()).collect::<Vec<_>>().join(",")
        )
    }

    pub fn mapping_report(&self) -> String {
        (0..self.ntasks).map(|t| self.task_mapping_report(t)).collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Amd,
    Nvidia,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mock::MockTopology;

    #[test]
    fn run_twice_is_rejected() {
        let t = MockTopology::grid(1, 2, 2, 1);
        let mut h = Handle::builder().with_ntasks(2).with_topology(t).freeze().unwrap();
        h.run().unwrap();
        assert!(h.run().is_err());
    }

    #[test]
    fn caller_supplied_topology_is_not_further_restricted() {
        // A caller-supplied topology is used as-is per spec §6.1, even if
        // a restriction was also configured on the handle: the engine
        // must not prune it further, so the full 16-PU cpuset survives.
        let t = MockTopology::grid(1, 1, 8, 2);
        let mut h = Handle::builder()
            .with_ntasks(1)
            .with_restriction("0-3", RestrictKind::Cpu)
            .with_topology(t)
            .freeze()
            .unwrap();
        h.run().unwrap();
        assert_eq!(h.cpuset(0).weight(), 16);
    }

    #[test]
    fn invalid_restriction_spec_still_errors_even_with_caller_topology() {
        let t = MockTopology::grid(1, 1, 1, 1);
        let mut h = Handle::builder()
            .with_ntasks(1)
            .with_restriction("not-a-range", RestrictKind::Cpu)
            .with_topology(t)
            .freeze()
            .unwrap();
        assert!(h.run().is_err());
    }

    #[test]
    fn config_getters_echo_builder_inputs() {
        let t = MockTopology::grid(1, 1, 1, 1);
        let h = Handle::builder()
            .with_ntasks(3)
            .with_greedy(false)
            .with_gpu_optim(false)
            .with_smt(1)
            .with_restriction("0-1", RestrictKind::Mem)
            .with_topology(t)
            .freeze()
            .unwrap();
        assert_eq!(h.ntasks(), 3);
        assert!(!h.greedy());
        assert!(!h.gpu_optim());
        assert_eq!(h.smt(), 1);
        assert_eq!(h.restrict_ids(), Some("0-1"));
        assert_eq!(h.restrict_kind(), RestrictKind::Mem);
        assert!(h.topology().is_some());
    }

    #[test]
    fn builder_rejects_zero_tasks() {
        let t = MockTopology::grid(1, 1, 1, 1);
        let err = Builder::new().with_ntasks(0).with_topology(t).freeze().unwrap_err();
        assert!(matches!(err, MpibindError::InvalidInput(_)));
    }

    #[test]
    fn end_to_end_s1_scenario() {
        let t = MockTopology::grid(2, 1, 4, 2);
        let mut h = Handle::builder().with_ntasks(2).with_gpu_optim(false).with_topology(t).freeze().unwrap();
        h.run().unwrap();
        assert_eq!(h.cpuset(0).to_vec(), vec![0, 2, 4, 6]);
        assert_eq!(h.cpuset(1).to_vec(), vec![8, 10, 12, 14]);
        assert_eq!(h.thread_count(0), 4);
        let vars = h.env_vars();
        let threads = vars.iter().find(|v| v.name == "OMP_NUM_THREADS").unwrap();
        assert_eq!(threads.values, vec!["4", "4"]);
    }

    #[test]
    fn mapping_report_lists_every_task() {
        let t = MockTopology::grid(1, 2, 2, 1);
        let mut h = Handle::builder().with_ntasks(2).with_topology(t).freeze().unwrap();
        h.run().unwrap();
        let report = h.mapping_report();
        assert_eq!(report.lines().count(), 2);
        assert!(report.contains("task 0"));
        assert!(report.contains("task 1"));
    }

    #[test]
    fn run_without_bound_topology_reports_topology_unusable() {
        // MockTopology has no notion of "the current machine", so it
        // inherits Topology::load_default's refusal; Handle::run must
        // surface that as a TopologyUnusable error rather than panicking.
        let mut h: Handle<MockTopology> = Handle::builder().with_ntasks(1).freeze().unwrap();
        let err = h.run().unwrap_err();
        assert!(matches!(err, MpibindError::TopologyUnusable(_)));
    }

    #[test]
    fn gpu_vendor_reports_none_without_gpus() {
        let t = MockTopology::grid(1, 1, 1, 1);
        let mut h = Handle::builder().with_ntasks(1).with_topology(t).freeze().unwrap();
        h.run().unwrap();
        assert_eq!(h.gpu_vendor(), None);
        assert_eq!(h.num_gpus(), 0);
    }
}
