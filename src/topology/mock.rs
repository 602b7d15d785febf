//! Synthetic in-memory topology used only by unit tests. Builds the exact
//! grid shapes the testable-property scenarios describe (N sockets × M
//! NUMAs-per-socket × C cores-per-NUMA × S PUs-per-core), plus attached
//! GPU I/O devices, without depending on any real discovery library.

use std::collections::HashMap;

use super::{IoDeviceView, IoKind, ObjectId, ObjectType, Topology};
use crate::bitmap::Bitset;
use crate::error::Result;

struct Node {
    ty: ObjectType,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    os_index: Option<usize>,
    cpuset: Bitset,
    nodeset: Bitset,
    depth: usize,
}

pub struct MockTopology {
    nodes: HashMap<ObjectId, Node>,
    root: ObjectId,
    next_id: u64,
    core_depth: usize,
    io_devices: Vec<IoDeviceView>,
}

const MACHINE_DEPTH: usize = 0;
const PACKAGE_DEPTH: usize = 1;
const NUMA_DEPTH: usize = 2;
const CORE_DEPTH: usize = 3;
const PU_DEPTH: usize = 4;

impl MockTopology {
    fn fresh_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, ty: ObjectType, parent: Option<ObjectId>, depth: usize, os_index: Option<usize>) -> ObjectId {
        let id = self.fresh_id();
        self.nodes.insert(
            id,
            Node {
                ty,
                parent,
                children: Vec::new(),
                os_index,
                cpuset: Bitset::new(),
                nodeset: Bitset::new(),
                depth,
            },
        );
        if let Some(p) = parent {
            self.nodes.get_mut(&p).unwrap().children.push(id);
        }
        id
    }

    /// Builds a symmetric `sockets × numas_per_socket × cores_per_numa ×
    /// pus_per_core` grid. PU os-indices are assigned sequentially in
    /// depth-first (socket, numa, core) order, matching the enumeration
    /// order the CPU Matcher scenarios assume.
    pub fn grid(sockets: usize, numas_per_socket: usize, cores_per_numa: usize, pus_per_core: usize) -> Self {
        let mut t = MockTopology {
            nodes: HashMap::new(),
            root: ObjectId(0),
            next_id: 0,
            core_depth: CORE_DEPTH,
            io_devices: Vec::new(),
        };
        let root = t.insert(ObjectType::Machine, None, MACHINE_DEPTH, None);
        t.root = root;

        let mut numa_os_index = 0usize;
        let mut core_os_index = 0usize;
        let mut pu_os_index = 0usize;
        for s in 0..sockets {
            let pkg = t.insert(ObjectType::Package, Some(root), PACKAGE_DEPTH, Some(s));
            for _ in 0..numas_per_socket {
                let numa = t.insert(ObjectType::NumaNode, Some(pkg), NUMA_DEPTH, Some(numa_os_index));
                numa_os_index += 1;
                for _ in 0..cores_per_numa {
                    let core = t.insert(ObjectType::Core, Some(numa), CORE_DEPTH, Some(core_os_index));
                    core_os_index += 1;
                    for _ in 0..pus_per_core {
                        let pu = t.insert(ObjectType::Pu, Some(core), PU_DEPTH, Some(pu_os_index));
                        t.nodes.get_mut(&pu).unwrap().cpuset.set(pu_os_index);
                        pu_os_index += 1;
                    }
                }
            }
        }
        t.propagate_sets();
        t
    }

    /// Recomputes every ancestor's cpuset/nodeset as the union of its
    /// descendants', bottom-up.
    fn propagate_sets(&mut self) {
        let mut ids: Vec<ObjectId> = self.nodes.keys().copied().collect();
        ids.sort_by_key(|id| std::cmp::Reverse(self.nodes[id].depth));
        for id in ids {
            let children = self.nodes[&id].children.clone();
            if children.is_empty() {
                continue;
            }
            let mut cpuset = Bitset::new();
            let mut nodeset = Bitset::new();
            for c in &children {
                cpuset.union_with(&self.nodes[c].cpuset);
                nodeset.union_with(&self.nodes[c].nodeset);
            }
            let node = self.nodes.get_mut(&id).unwrap();
            node.cpuset.union_with(&cpuset);
            node.nodeset.union_with(&nodeset);
        }
        // NUMA nodes carry their own os-index in their nodeset.
        let numa_ids: Vec<ObjectId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ty == ObjectType::NumaNode)
            .map(|(id, _)| *id)
            .collect();
        for id in numa_ids {
            if let Some(os) = self.nodes[&id].os_index {
                self.nodes.get_mut(&id).unwrap().nodeset.set(os);
            }
        }
        // propagate the now-complete NUMA nodesets upward again.
        let mut ids: Vec<ObjectId> = self.nodes.keys().copied().collect();
        ids.sort_by_key(|id| std::cmp::Reverse(self.nodes[id].depth));
        for id in ids {
            let children = self.nodes[&id].children.clone();
            let mut nodeset = self.nodes[&id].nodeset.clone();
            for c in &children {
                nodeset.union_with(&self.nodes[c].nodeset);
            }
            self.nodes.get_mut(&id).unwrap().nodeset = nodeset;
        }
    }

    /// Attaches a GPU (one `coprocessor` device plus its `GPU-management`
    /// sibling) under `ancestor`, with the given PCI vendor id, visdevs
    /// index, and bus id.
    pub fn add_gpu(&mut self, ancestor: ObjectId, vendor_id: u32, visdevs_id: usize, busid: &str) {
        self.io_devices.push(IoDeviceView {
            kind: IoKind::Coprocessor,
            name: format!("cuda{visdevs_id}"),
            infos: vec![("GPUVendor".to_string(), format!("{vendor_id:#06x}"))],
            pci_busid: Some(busid.to_string()),
            vendor_id: Some(vendor_id),
            ancestor,
        });
        self.io_devices.push(IoDeviceView {
            kind: IoKind::GpuManagement,
            name: format!("nvml{visdevs_id}"),
            infos: vec![("NVIDIAUUID".to_string(), format!("GPU-{visdevs_id:08x}"))],
            pci_busid: Some(busid.to_string()),
            vendor_id: Some(vendor_id),
            ancestor,
        });
    }

    /// Attaches a fabric NIC (no counterpart device, so no `ancestor`
    /// reuse concerns) for device-inventory tests that need a non-GPU
    /// entry in the mix.
    pub fn add_nic(&mut self, ancestor: ObjectId, node_guid: &str, busid: &str) {
        self.io_devices.push(IoDeviceView {
            kind: IoKind::OpenFabricsNic,
            name: "mlx5_0".to_string(),
            infos: vec![("NodeGUID".to_string(), node_guid.to_string())],
            pci_busid: Some(busid.to_string()),
            vendor_id: Some(0x15b3),
            ancestor,
        });
    }

    pub fn numa_by_os_index(&self, os_index: usize) -> Option<ObjectId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.ty == ObjectType::NumaNode && n.os_index == Some(os_index))
            .map(|(id, _)| *id)
    }
}

impl Topology for MockTopology {
    fn root(&self) -> ObjectId {
        self.root
    }

    fn object_type(&self, id: ObjectId) -> ObjectType {
        self.nodes[&id].ty
    }

    fn os_index(&self, id: ObjectId) -> Option<usize> {
        self.nodes[&id].os_index
    }

    fn depth(&self, id: ObjectId) -> usize {
        self.nodes[&id].depth
    }

    fn core_depth(&self) -> usize {
        self.core_depth
    }

    fn cpuset(&self, id: ObjectId) -> Bitset {
        self.nodes[&id].cpuset.clone()
    }

    fn nodeset(&self, id: ObjectId) -> Bitset {
        self.nodes[&id].nodeset.clone()
    }

    fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.nodes[&id].parent
    }

    fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        self.nodes[&id].children.clone()
    }

    fn objects_at_depth(&self, depth: usize) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.depth == depth)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn numa_domains(&self) -> Vec<ObjectId> {
        self.objects_at_depth(NUMA_DEPTH)
    }

    fn io_devices(&self) -> Vec<IoDeviceView> {
        self.io_devices.clone()
    }

    fn restrict_by_cpuset(&mut self, cpuset: &Bitset) -> Result<()> {
        let root = self.root;
        for node in self.nodes.values_mut() {
            node.cpuset = Bitset::intersection(&node.cpuset, cpuset);
        }
        self.nodes.retain(|id, node| *id == root || !node.cpuset.is_empty());
        let live: std::collections::HashSet<ObjectId> = self.nodes.keys().copied().collect();
        for node in self.nodes.values_mut() {
            node.children.retain(|c| live.contains(c));
        }
        Ok(())
    }

    fn restrict_by_nodeset(&mut self, nodeset: &Bitset) -> Result<()> {
        let root = self.root;
        for node in self.nodes.values_mut() {
            node.nodeset = Bitset::intersection(&node.nodeset, nodeset);
        }
        self.nodes.retain(|id, node| *id == root || !node.nodeset.is_empty());
        let live: std::collections::HashSet<ObjectId> = self.nodes.keys().copied().collect();
        for node in self.nodes.values_mut() {
            node.children.retain(|c| live.contains(c));
        }
        Ok(())
    }

    fn set_cpubind(&self, _cpuset: &Bitset) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_s1_shape() {
        let t = MockTopology::grid(2, 1, 4, 2);
        assert_eq!(t.numa_domains().len(), 2);
        assert_eq!(super::super::hardware_smt_level(&t), 2);
        let numa0 = t.numa_by_os_index(0).unwrap();
        assert_eq!(t.cpuset(numa0).to_vec(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        let numa1 = t.numa_by_os_index(1).unwrap();
        assert_eq!(t.cpuset(numa1).to_vec(), vec![8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(t.cpuset(t.root()).weight(), 16);
    }

    #[test]
    fn gpu_attachment_is_visible_in_io_devices() {
        let mut t = MockTopology::grid(1, 4, 1, 1);
        let numa1 = t.numa_by_os_index(1).unwrap();
        let numa3 = t.numa_by_os_index(3).unwrap();
        t.add_gpu(numa1, 0x1002, 0, "0000:01:00.0");
        t.add_gpu(numa1, 0x1002, 1, "0000:02:00.0");
        t.add_gpu(numa3, 0x1002, 2, "0000:03:00.0");
        t.add_gpu(numa3, 0x1002, 3, "0000:04:00.0");
        assert_eq!(t.io_devices().len(), 8);
    }
}
