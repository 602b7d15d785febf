//! Distributor: the top-level strategy that splits tasks across NUMA
//! domains (greedy or per-NUMA "memory-hierarchy" mode), invoking the CPU
//! and GPU matchers and assembling the full per-task mapping.
//!
//! Matchers are rooted directly at each NUMA domain object rather than at
//! its non-I/O parent: a `Topology` implementation is expected to expose
//! NUMA objects that already carry the cpuset/cores local to that memory
//! domain (the adapter's job, not the distributor's), so the distributor
//! itself never needs to special-case how cores attach to NUMA nodes.

use crate::bitmap::Bitset;
use crate::cpu_match::cpu_match;
use crate::device::DeviceTable;
use crate::distrib::distrib;
use crate::error::{MpibindError, Result};
use crate::gpu_match::gpu_match;
use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct Mapping {
    pub cpusets: Vec<Bitset>,
    pub gpusets: Vec<Vec<usize>>,
    pub nthreads: Vec<usize>,
}

pub struct DistributeInputs {
    pub ntasks: usize,
    pub nthreads_in: usize,
    pub greedy: bool,
    pub gpu_optim: bool,
    pub smt: usize,
}

/// Top-level dispatcher: greedy mode when `greedy` is set and there are
/// fewer tasks than NUMA domains, memory-hierarchy mode otherwise.
pub fn distribute<T: Topology + ?Sized>(topo: &T, devices: &DeviceTable, inputs: &DistributeInputs) -> Result<Mapping> {
    if inputs.ntasks == 0 {
        return Err(MpibindError::InvalidInput("ntasks must be >= 1".to_string()));
    }
    let numas = topo.numa_domains();
    if numas.is_empty() {
        return Err(MpibindError::TopologyUnusable("topology has no NUMA domains".to_string()));
    }

    if inputs.greedy && inputs.ntasks < numas.len() {
        distribute_greedy(topo, devices, &numas, inputs.ntasks)
    } else {
        distribute_mem_hierarchy(topo, devices, &numas, inputs)
    }
}

fn distribute_greedy<T: Topology + ?Sized>(topo: &T, devices: &DeviceTable, numas: &[crate::topology::ObjectId], ntasks: usize) -> Result<Mapping> {
    let numas_per_task = distrib(numas.len(), ntasks);
    let mut cursor = 0;
    let mut cpusets = Vec::with_capacity(ntasks);
    let mut gpusets = Vec::with_capacity(ntasks);
    let mut nthreads = Vec::with_capacity(ntasks);

    for count in numas_per_task {
        let mut cpuset = Bitset::new();
        let mut gpus: Vec<usize> = Vec::new();
        for numa in &numas[cursor..cursor + count] {
            cpuset.union_with(&topo.cpuset(*numa));
            gpus.extend(devices.gpu_indices().filter(|&i| devices.devices()[i].ancestor == *numa));
        }
        gpus.sort_unstable();
        gpus.dedup();
        nthreads.push(cpuset.weight().max(1));
        cpusets.push(cpuset);
        gpusets.push(gpus);
        cursor += count;
    }

    Ok(Mapping { cpusets, gpusets, nthreads })
}

fn distribute_mem_hierarchy<T: Topology + ?Sized>(
    topo: &T,
    devices: &DeviceTable,
    numas: &[crate::topology::ObjectId],
    inputs: &DistributeInputs,
) -> Result<Mapping> {
    let candidates: Vec<crate::topology::ObjectId> = if inputs.gpu_optim && devices.num_gpus() > 0 {
        numas
            .iter()
            .copied()
            .filter(|&numa| {
                devices.gpu_indices().any(|i| devices.devices()[i].ancestor == numa)
            })
            .collect()
    } else {
        numas.to_vec()
    };
    if candidates.is_empty() {
        return Err(MpibindError::TopologyUnusable("no candidate NUMA domains for distribution".to_string()));
    }

    let tasks_per_candidate = distrib(inputs.ntasks, candidates.len());

    let mut cpusets = Vec::with_capacity(inputs.ntasks);
    let mut gpusets = Vec::with_capacity(inputs.ntasks);
    let mut nthreads = Vec::with_capacity(inputs.ntasks);

    for (&numa, n_d) in candidates.iter().zip(tasks_per_candidate) {
        if n_d == 0 {
            continue;
        }
        let cpu = cpu_match(topo, numa, n_d, inputs.nthreads_in, inputs.smt)?;
        let gpus = gpu_match(devices, numa, n_d);
        for (cpuset, gpuset) in cpu.cpusets.into_iter().zip(gpus) {
            cpusets.push(cpuset);
            gpusets.push(gpuset);
            nthreads.push(cpu.nthreads);
        }
    }

    Ok(Mapping { cpusets, gpusets, nthreads })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mock::MockTopology;

    fn inputs(ntasks: usize, greedy: bool, gpu_optim: bool, smt: usize) -> DistributeInputs {
        DistributeInputs { ntasks, nthreads_in: 0, greedy, gpu_optim, smt }
    }

    #[test]
    fn s1_two_tasks_two_numas() {
        let t = MockTopology::grid(2, 1, 4, 2);
        let devices = DeviceTable::discover(&t);
        let m = distribute(&t, &devices, &inputs(2, true, false, 0)).unwrap();
        assert_eq!(m.cpusets[0].to_vec(), vec![0, 2, 4, 6]);
        assert_eq!(m.cpusets[1].to_vec(), vec![8, 10, 12, 14]);
        assert_eq!(m.nthreads, vec![4, 4]);
        assert!(m.gpusets.iter().all(Vec::is_empty));
    }

    #[test]
    fn s2_greedy_single_task() {
        let t = MockTopology::grid(2, 1, 4, 2);
        let devices = DeviceTable::discover(&t);
        let m = distribute(&t, &devices, &inputs(1, true, false, 0)).unwrap();
        assert_eq!(m.cpusets[0].weight(), 16);
        assert_eq!(m.nthreads, vec![16]);
    }

    /// S4: GPU-optim restricts candidate NUMAs to the GPU-bearing ones.
    #[test]
    fn s4_gpu_optim_restricts_candidates() {
        let mut t = MockTopology::grid(1, 4, 2, 1);
        let numa1 = t.numa_by_os_index(1).unwrap();
        let numa3 = t.numa_by_os_index(3).unwrap();
        t.add_gpu(numa1, 0x1002, 0, "0000:01:00.0");
        t.add_gpu(numa3, 0x1002, 1, "0000:02:00.0");
        let devices = DeviceTable::discover(&t);
        let m = distribute(&t, &devices, &inputs(2, false, true, 0)).unwrap();

        let numa1_cpus = t.cpuset(numa1);
        let numa3_cpus = t.cpuset(numa3);
        for cpuset in &m.cpusets {
            let in_numa1 = Bitset::intersection(cpuset, &numa1_cpus) == *cpuset;
            let in_numa3 = Bitset::intersection(cpuset, &numa3_cpus) == *cpuset;
            assert!(in_numa1 || in_numa3, "task cpuset must land in a GPU-bearing NUMA");
        }
    }

    #[test]
    fn zero_numas_is_topology_error() {
        let t = MockTopology::grid(0, 0, 0, 0);
        let devices = DeviceTable::discover(&t);
        let err = distribute(&t, &devices, &inputs(1, true, false, 0)).unwrap_err();
        assert!(matches!(err, MpibindError::TopologyUnusable(_)));
    }
}
