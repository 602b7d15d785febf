//! GPU Matcher: distributes the GPUs reachable from a NUMA (or machine)
//! parent across the tasks assigned to that parent.

use crate::device::DeviceTable;
use crate::distrib::fill_in_buckets;
use crate::topology::ObjectId;

/// Distributes the GPU devices whose `ancestor` is `root` across `ntasks`
/// task slots, using the same fill-in-buckets policy the CPU Matcher uses
/// for PUs: if there are fewer GPUs than tasks, tasks share GPUs in runs.
pub fn gpu_match(devices: &DeviceTable, root: ObjectId, ntasks: usize) -> Vec<Vec<usize>> {
    let gpu_indices: Vec<usize> = devices
        .gpu_indices()
        .filter(|&i| devices.devices()[i].ancestor == root)
        .collect();
    fill_in_buckets(&gpu_indices, ntasks)
}
