//! Device Inventory: builds the dense table of unique I/O devices (GPUs and
//! fabric NICs) from a topology's raw OS-device list, in the two-pass
//! scheme described for the engine: pass 1 creates entries from
//! application-visible (coprocessor) and NIC devices, pass 2 fills in
//! vendor-management ids/UUIDs onto existing entries without creating new
//! ones.

use crate::topology::{IoDeviceView, IoKind, ObjectId, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    Nic,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub pci_busid: String,
    pub kind: DeviceKind,
    pub vendor_id: Option<u32>,
    pub ancestor: ObjectId,
    pub visdevs_id: Option<usize>,
    pub smi_id: Option<usize>,
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<Device>,
    /// Non-fatal anomalies encountered during discovery (missing PCI
    /// parent, capacity exceeded); never fails the run.
    pub warnings: Vec<String>,
}

/// Enumeration/table capacity limit, mirroring the original's fixed-size
/// `MAX_IO_DEVICES` array: beyond this many distinct devices, further
/// pass-1 entries are dropped with a warning rather than growing without
/// bound.
pub const MAX_DEVICES: usize = 1024;

impl DeviceTable {
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn gpu_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind == DeviceKind::Gpu)
            .map(|(i, _)| i)
    }

    pub fn num_gpus(&self) -> usize {
        self.gpu_indices().count()
    }

    /// PCI vendor id of the first GPU found, if any (used to pick the
    /// visibility environment variable name).
    pub fn gpu_vendor(&self) -> Option<u32> {
        self.devices.iter().find(|d| d.kind == DeviceKind::Gpu).and_then(|d| d.vendor_id)
    }

    fn find_by_busid(&self, busid: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.pci_busid == busid)
    }

    /// Builds the inventory from a topology's raw OS-device list.
    pub fn discover<T: Topology + ?Sized>(topo: &T) -> DeviceTable {
        let mut table = DeviceTable::default();
        let raw = topo.io_devices();

        // Pass 1: coprocessor and open-fabrics NIC devices create entries.
        for dev in &raw {
            match dev.kind {
                IoKind::Coprocessor | IoKind::OpenFabricsNic => {}
                _ => continue,
            }
            let Some(busid) = dev.pci_busid.clone() else {
                table.warnings.push(format!("device '{}' has no PCI parent, skipped", dev.name));
                continue;
            };
            if table.find_by_busid(&busid).is_some() {
                continue;
            }
            if table.devices.len() >= MAX_DEVICES {
                table.warnings.push(format!("device inventory capacity ({MAX_DEVICES}) exceeded, '{}' dropped", dev.name));
                continue;
            }
            let kind = match dev.kind {
                IoKind::Coprocessor => DeviceKind::Gpu,
                IoKind::OpenFabricsNic => DeviceKind::Nic,
                _ => unreachable!(),
            };
            let visdevs_id = parse_visdevs_id(&dev.name);
            let uuid = if kind == DeviceKind::Nic {
                dev.info("NodeGUID").unwrap_or_default().to_string()
            } else {
                String::new()
            };
            table.devices.push(Device {
                pci_busid: busid,
                kind,
                vendor_id: dev.vendor_id,
                ancestor: dev.ancestor,
                visdevs_id,
                smi_id: None,
                uuid,
                name: dev.name.clone(),
            });
        }

        // Pass 2: GPU-management devices fill in smi_id/uuid on existing
        // entries; they never create new ones.
        for dev in &raw {
            if dev.kind != IoKind::GpuManagement {
                continue;
            }
            let Some(busid) = dev.pci_busid.as_deref() else {
                table.warnings.push(format!("management device '{}' has no PCI parent, skipped", dev.name));
                continue;
            };
            let Some(idx) = table.find_by_busid(busid) else {
                table.warnings.push(format!(
                    "management device '{}' at {busid} has no matching coprocessor entry",
                    dev.name
                ));
                continue;
            };
            let smi_id = parse_smi_id(&dev.name);
            let uuid = dev.info("AMDUUID").or_else(|| dev.info("NVIDIAUUID")).map(str::to_string);
            let entry = &mut table.devices[idx];
            if entry.smi_id.is_none() {
                entry.smi_id = smi_id;
            }
            if entry.uuid.is_empty() {
                if let Some(uuid) = uuid {
                    entry.uuid = uuid;
                }
            }
        }

        table
    }
}

/// Extracts the visdevs index from a coprocessor device name: `cuda<N>` ->
/// N, `opencl<P>d<D>` -> D.
fn parse_visdevs_id(name: &str) -> Option<usize> {
    if let Some(rest) = name.strip_prefix("cuda") {
        return rest.parse().ok();
    }
    if let Some(rest) = name.strip_prefix("opencl") {
        let d_pos = rest.find('d')?;
        return rest[d_pos + 1..].parse().ok();
    }
    None
}

/// Extracts the vendor-management index from a device name: `rsmi<N>` or
/// `nvml<N>` -> N.
fn parse_smi_id(name: &str) -> Option<usize> {
    for prefix in ["rsmi", "nvml"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return rest.parse().ok();
        }
    }
    None
}
