//! Restriction & Validation: apply a user-supplied CPU or memory
//! restriction to a topology before distribution, and the small parsing
//! helpers launcher integrations need around it.

use std::fs;
use std::path::Path;

use crate::bitmap::Bitset;
use crate::error::{MpibindError, Result};
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictKind {
    Cpu,
    Mem,
}

/// Parses a restriction specification: either an inline range list
/// (`"0-7,16-23"`) or a path to a file whose first parseable line is such
/// a range list.
pub fn parse_restrict_ids(spec: &str) -> Result<Bitset> {
    if let Some(set) = Bitset::parse_range_list(spec) {
        return Ok(set);
    }
    let path = Path::new(spec);
    let contents = fs::read_to_string(path)
        .map_err(|e| MpibindError::InvalidInput(format!("restriction '{spec}' is neither a valid range list nor a readable file: {e}")))?;
    for line in contents.lines() {
        if let Some(set) = Bitset::parse_range_list(line.trim()) {
            return Ok(set);
        }
    }
    Err(MpibindError::InvalidInput(format!("no valid range list found in restriction file '{spec}'")))
}

/// Applies a parsed restriction to the topology in place.
pub fn apply_restriction<T: Topology + ?Sized>(topo: &mut T, ids: &Bitset, kind: RestrictKind) -> Result<()> {
    match kind {
        RestrictKind::Cpu => topo.restrict_by_cpuset(ids),
        RestrictKind::Mem => topo.restrict_by_nodeset(ids),
    }
}

/// Converts a logical-core range (positional indices at canonical core
/// depth, not os-indices) into the union of PU indices across those cores.
/// Named directly after the "cores-to-PUs" helper launchers use when they
/// speak core indices but must hand PU sets to the engine. Core objects are
/// addressed by their logical position at `core_depth`, matching callers
/// like `mpibind_calc_restrict_cpus` that hand in resource-manager-assigned
/// logical core numbers rather than hardware os-indices; this also makes
/// the helper correct when `core_depth` stands in for a structurally
/// absent `Core` type, where the objects at that depth aren't `Core` at
/// all.
pub fn cores_to_pus<T: Topology + ?Sized>(topo: &T, cores: &Bitset) -> Bitset {
    let core_depth = topo.core_depth();
    let mut out = Bitset::new();
    for (i, core) in topo.objects_at_depth(core_depth).into_iter().enumerate() {
        if cores.is_set(i) {
            out.union_with(&topo.cpuset(core));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mock::MockTopology;

    #[test]
    fn parses_inline_range_list() {
        let set = parse_restrict_ids("6-11").unwrap();
        assert_eq!(set.to_vec(), vec![6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn parses_range_list_from_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mpibind-restrict-test-{}.txt", std::process::id()));
        fs::write(&path, "# a comment line first, ignored below\n0-3,8\n").unwrap();
        // The first line is not a valid range, so parsing should fall
        // through to the second.
        let set = parse_restrict_ids(path.to_str().unwrap()).unwrap();
        assert_eq!(set.to_vec(), vec![0, 1, 2, 3, 8]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rejects_unreadable_spec() {
        assert!(parse_restrict_ids("/nonexistent/path/for/sure").is_err());
    }

    /// S5: restriction by CPU list on a 16-PU topology.
    #[test]
    fn s5_restrict_by_cpu_list() {
        let mut t = MockTopology::grid(1, 1, 8, 2);
        let ids = parse_restrict_ids("6-11").unwrap();
        apply_restriction(&mut t, &ids, RestrictKind::Cpu).unwrap();
        assert_eq!(t.cpuset(t.root()).to_vec(), vec![6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn cores_to_pus_unions_selected_cores() {
        let t = MockTopology::grid(1, 1, 4, 2);
        // Cores 0 and 2 (PUs 0,1 and 4,5).
        let cores = Bitset::from_iter([0, 2]);
        let pus = cores_to_pus(&t, &cores);
        assert_eq!(pus.to_vec(), vec![0, 1, 4, 5]);
    }

    /// `cores_to_pus` must address cores by logical position at
    /// `core_depth`, not by os-index: a resource manager hands in logical
    /// core numbers, and os-index can diverge from logical order (e.g.
    /// after CPU offlining or hyperthread-sibling renumbering).
    #[test]
    fn cores_to_pus_uses_logical_position_not_os_index() {
        let t = ScrambledOsIndexCores(MockTopology::grid(1, 1, 4, 2));
        // Logical positions 0 and 2, same cores as the test above, despite
        // their os-indices being scrambled below.
        let cores = Bitset::from_iter([0, 2]);
        let pus = cores_to_pus(&t, &cores);
        assert_eq!(pus.to_vec(), vec![0, 1, 4, 5]);
    }

    /// Wraps a `MockTopology`, scrambling `Core` objects' os-indices away
    /// from their logical position, so a test can tell positional
    /// addressing apart from os-index addressing.
    struct ScrambledOsIndexCores(MockTopology);

    impl Topology for ScrambledOsIndexCores {
        fn root(&self) -> crate::topology::ObjectId {
            self.0.root()
        }
        fn object_type(&self, id: crate::topology::ObjectId) -> crate::topology::ObjectType {
            self.0.object_type(id)
        }
        fn os_index(&self, id: crate::topology::ObjectId) -> Option<usize> {
            let base = self.0.os_index(id)?;
            if self.0.object_type(id) == crate::topology::ObjectType::Core {
                Some(1000 - base)
            } else {
                Some(base)
            }
        }
        fn depth(&self, id: crate::topology::ObjectId) -> usize {
            self.0.depth(id)
        }
        fn core_depth(&self) -> usize {
            self.0.core_depth()
        }
        fn cpuset(&self, id: crate::topology::ObjectId) -> Bitset {
            self.0.cpuset(id)
        }
        fn nodeset(&self, id: crate::topology::ObjectId) -> Bitset {
            self.0.nodeset(id)
        }
        fn parent(&self, id: crate::topology::ObjectId) -> Option<crate::topology::ObjectId> {
            self.0.parent(id)
        }
        fn children(&self, id: crate::topology::ObjectId) -> Vec<crate::topology::ObjectId> {
            self.0.children(id)
        }
        fn objects_at_depth(&self, depth: usize) -> Vec<crate::topology::ObjectId> {
            self.0.objects_at_depth(depth)
        }
        fn numa_domains(&self) -> Vec<crate::topology::ObjectId> {
            self.0.numa_domains()
        }
        fn io_devices(&self) -> Vec<crate::topology::IoDeviceView> {
            self.0.io_devices()
        }
        fn restrict_by_cpuset(&mut self, ids: &Bitset) -> Result<()> {
            self.0.restrict_by_cpuset(ids)
        }
        fn restrict_by_nodeset(&mut self, ids: &Bitset) -> Result<()> {
            self.0.restrict_by_nodeset(ids)
        }
        fn set_cpubind(&self, cpuset: &Bitset) -> std::io::Result<()> {
            self.0.set_cpubind(cpuset)
        }
    }
}
