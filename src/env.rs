//! Environment Variable Projection: turns a completed mapping into the
//! per-task environment variables a launcher plugin sets before exec'ing
//! the task image.

use crate::device::{Device, DeviceTable};
use crate::distributor::Mapping;

/// Which identifier space a GPU is named by in the visibility variable.
/// Default is `Visdevs`, matching the engine default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuIdKind {
    /// mpibind's own dense internal device-table index.
    Internal,
    #[default]
    Visdevs,
    PciBus,
    Name,
    Uuid,
}

#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: String,
    pub values: Vec<String>,
}

const AMD_VENDOR_ID: u32 = 0x1002;
const NVIDIA_VENDOR_ID: u32 = 0x10de;

fn visibility_var_name(vendor_id: Option<u32>) -> Option<&'static str> {
    match vendor_id {
        Some(AMD_VENDOR_ID) => Some("ROCR_VISIBLE_DEVICES"),
        Some(NVIDIA_VENDOR_ID) => Some("CUDA_VISIBLE_DEVICES"),
        _ => None,
    }
}

/// Renders one device's identifier in the requested id space, matching the
/// original's `device_key_snprint` switch.
fn device_key(device: &Device, index: usize, kind: GpuIdKind) -> String {
    match kind {
        GpuIdKind::Internal => index.to_string(),
        GpuIdKind::Visdevs => device
            .visdevs_id
            .map(|v| v.to_string())
            .unwrap_or_else(|| index.to_string()),
        GpuIdKind::PciBus => device.pci_busid.clone(),
        GpuIdKind::Name => device.name.clone(),
        GpuIdKind::Uuid => device.uuid.clone(),
    }
}

/// Projects the four standard environment variables for a completed
/// mapping. `OMP_NUM_THREADS`/`OMP_PLACES`/`OMP_PROC_BIND` are always
/// present; the visibility variable is omitted entirely when the mapping
/// has no GPUs at all.
pub fn project(mapping: &Mapping, devices: &DeviceTable, gpu_id_kind: GpuIdKind) -> Vec<EnvVar> {
    let ntasks = mapping.cpusets.len();

    let omp_num_threads = EnvVar {
        name: "OMP_NUM_THREADS".to_string(),
        values: mapping.nthreads.iter().map(|n| n.to_string()).collect(),
    };

    let omp_places = EnvVar {
        name: "OMP_PLACES".to_string(),
        values: mapping
            .cpusets
            .iter()
            .map(|cpuset| {
                cpuset
                    .iter()
                    .map(|pu| format!("{{{pu}}}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect(),
    };

    let omp_proc_bind = EnvVar {
        name: "OMP_PROC_BIND".to_string(),
        values: vec!["spread".to_string(); ntasks],
    };

    let mut out = vec![omp_num_threads, omp_places, omp_proc_bind];

    if devices.num_gpus() > 0 {
        let vendor = devices.gpu_vendor();
        if let Some(name) = visibility_var_name(vendor) {
            let values = mapping
                .gpusets
                .iter()
                .map(|gpuset| {
                    gpuset
                        .iter()
                        .map(|&idx| device_key(&devices.devices()[idx], idx, gpu_id_kind))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .collect();
            out.push(EnvVar { name: name.to_string(), values });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTable;
    use crate::distributor::{distribute, DistributeInputs};
    use crate::topology::mock::MockTopology;

    /// S5: OMP_PLACES for a restricted 6-PU task.
    #[test]
    fn s5_omp_places_after_restriction() {
        let mut t = MockTopology::grid(1, 1, 16, 1);
        let ids = crate::restrict::parse_restrict_ids("6-11").unwrap();
        crate::restrict::apply_restriction(&mut t, &ids, crate::restrict::RestrictKind::Cpu).unwrap();
        let devices = DeviceTable::discover(&t);
        let inputs = DistributeInputs { ntasks: 1, nthreads_in: 0, greedy: true, gpu_optim: false, smt: 1 };
        let mapping = distribute(&t, &devices, &inputs).unwrap();
        let vars = project(&mapping, &devices, GpuIdKind::default());
        let places = vars.iter().find(|v| v.name == "OMP_PLACES").unwrap();
        assert_eq!(places.values[0], "{6},{7},{8},{9},{10},{11}");
    }

    /// S6: AMD visibility variable name and complementary values.
    #[test]
    fn s6_amd_visibility_variable() {
        let mut t = MockTopology::grid(1, 1, 1, 1);
        let root = t.root();
        t.add_gpu(root, 0x1002, 0, "0000:01:00.0");
        t.add_gpu(root, 0x1002, 1, "0000:02:00.0");
        t.add_gpu(root, 0x1002, 2, "0000:03:00.0");
        t.add_gpu(root, 0x1002, 3, "0000:04:00.0");
        let devices = DeviceTable::discover(&t);
        let inputs = DistributeInputs { ntasks: 2, nthreads_in: 1, greedy: true, gpu_optim: true, smt: 0 };
        let mapping = distribute(&t, &devices, &inputs).unwrap();
        let vars = project(&mapping, &devices, GpuIdKind::default());
        let visdevs = vars.iter().find(|v| v.name == "ROCR_VISIBLE_DEVICES").unwrap();
        let mut all_ids: Vec<String> = visdevs.values[0].split(',').chain(visdevs.values[1].split(',')).map(String::from).collect();
        all_ids.sort();
        assert_eq!(all_ids, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn no_gpus_omits_visibility_variable() {
        let t = MockTopology::grid(1, 1, 1, 1);
        let devices = DeviceTable::discover(&t);
        let inputs = DistributeInputs { ntasks: 1, nthreads_in: 0, greedy: true, gpu_optim: true, smt: 0 };
        let mapping = distribute(&t, &devices, &inputs).unwrap();
        let vars = project(&mapping, &devices, GpuIdKind::default());
        assert!(vars.iter().all(|v| !v.name.ends_with("VISIBLE_DEVICES")));
    }
}
