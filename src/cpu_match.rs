//! CPU Matcher: for one NUMA domain (or the whole machine), produce a
//! per-task CPU set and thread count honoring SMT policy.
//!
//! Ported from the original `cpu_match` / `distrib_and_assign_pus` pair;
//! the depth walk, `pus_per_obj` selection, and the "avoid identical
//! cpusets" recursive-split branch are all faithful translations.

use crate::bitmap::Bitset;
use crate::distrib::{distrib, fill_in_buckets};
use crate::error::{MpibindError, Result};
use crate::topology::{hardware_smt_level, ObjectId, Topology};

#[derive(Debug, Clone)]
pub struct CpuMatch {
    pub cpusets: Vec<Bitset>,
    pub nthreads: usize,
}

/// Runs the CPU Matcher rooted at `root` for `ntasks` tasks.
///
/// `nthreads_in == 0` means "let the engine choose"; `usr_smt == 0` means
/// "let the engine choose the PUs-per-core count".
pub fn cpu_match<T: Topology + ?Sized>(topo: &T, root: ObjectId, ntasks: usize, nthreads_in: usize, usr_smt: usize) -> Result<CpuMatch> {
    assert!(ntasks >= 1);
    let hw_smt = hardware_smt_level(topo);
    if usr_smt > hw_smt {
        return Err(MpibindError::InvalidInput(format!("smt={usr_smt} exceeds hardware SMT level {hw_smt}")));
    }
    let core_depth = topo.core_depth();
    let intermediate_smt = (1..hw_smt).contains(&usr_smt).then_some(usr_smt);

    let nthreads_out = if nthreads_in > 0 {
        nthreads_in
    } else {
        let count_depth = if usr_smt >= hw_smt && hw_smt > 0 { pu_depth(topo, core_depth) } else { core_depth };
        let mut count = topo.objects_at_depth_within(count_depth, root).len();
        if let Some(smt) = intermediate_smt {
            count *= smt;
        }
        (count / ntasks).max(1)
    };
    let workers = nthreads_out * ntasks;

    // Walk from root's depth down to core_depth, looking for the
    // shallowest depth with enough objects; force core_depth if the
    // caller pinned an explicit smt value.
    let root_depth = topo.depth(root);
    let mut chosen_depth = core_depth;
    if usr_smt == 0 {
        for d in root_depth..=core_depth {
            let nobjs = topo.objects_at_depth_within(d, root).len();
            if nobjs >= workers {
                chosen_depth = d;
                break;
            }
        }
    }

    let objs = topo.objects_at_depth_within(chosen_depth, root);
    let nobjs = objs.len();
    if nobjs == 0 {
        return Err(MpibindError::TopologyUnusable("no objects available under root for CPU matching".to_string()));
    }

    let pus_per_obj = if usr_smt > 0 {
        usr_smt
    } else if chosen_depth == core_depth {
        (1..=hw_smt.max(1)).find(|k| nobjs * k >= workers).unwrap_or(hw_smt.max(1))
    } else {
        1
    };

    let restricted: Vec<Bitset> = objs
        .iter()
        .map(|&obj| {
            let mut set = Bitset::new();
            for (i, pu) in topo.cpuset(obj).iter().enumerate() {
                if i >= pus_per_obj {
                    break;
                }
                set.set(pu);
            }
            set
        })
        .collect();

    let cpusets = distrib_and_assign_pus(&restricted, ntasks);
    if has_duplicate(&cpusets) {
        tracing::warn!(
            ntasks,
            nobjs,
            pus_per_obj,
            "oversubscription left at least two tasks with identical cpusets under this root"
        );
    }
    Ok(CpuMatch { cpusets, nthreads: nthreads_out })
}

/// Depth at which PUs actually live, for counting purposes. Usually
/// `core_depth + 1`, but when `Core` objects are structurally absent,
/// `core_depth` already names the deepest normal depth present (the PUs
/// themselves) and there is nothing at `core_depth + 1` to count — see
/// `RealTopology::from_hwloc`'s no-Core fallback.
fn pu_depth<T: Topology + ?Sized>(topo: &T, core_depth: usize) -> usize {
    if topo.objects_at_depth(core_depth + 1).is_empty() {
        core_depth
    } else {
        core_depth + 1
    }
}

/// True when any two cpusets in `sets` are identical, i.e. the
/// oversubscription case spec §9 calls out: `ntasks` so far exceeds
/// available PUs that even the disjoint-slice branch of
/// `distrib_and_assign_pus` ran out of PUs to differentiate tasks with.
fn has_duplicate(sets: &[Bitset]) -> bool {
    (0..sets.len()).any(|i| sets[i + 1..].contains(&sets[i]))
}

/// Assigns each of `nobjs` restricted per-object PU sets to `ntasks`
/// tasks. When there are at least as many objects as tasks, whole objects
/// are packed into tasks via fill-in-buckets. When there are fewer
/// objects than tasks, every object is shared by several tasks, each
/// getting a disjoint slice of that object's PUs (so no two tasks sharing
/// an object end up with identical cpusets whenever any PU is available
/// to differentiate them).
fn distrib_and_assign_pus(restricted: &[Bitset], ntasks: usize) -> Vec<Bitset> {
    let nobjs = restricted.len();
    if nobjs >= ntasks {
        let buckets = fill_in_buckets(restricted, ntasks);
        buckets
            .into_iter()
            .map(|objs| {
                let mut set = Bitset::new();
                for o in objs {
                    set.union_with(&o);
                }
                set
            })
            .collect()
    } else {
        let tasks_per_obj = distrib(ntasks, nobjs);
        let mut out = Vec::with_capacity(ntasks);
        for (obj, ntasks_here) in restricted.iter().zip(tasks_per_obj) {
            if ntasks_here == 0 {
                continue;
            }
            let pus: Vec<usize> = obj.to_vec();
            let buckets = fill_in_buckets(&pus, ntasks_here);
            for bucket in buckets {
                out.push(Bitset::from_iter(bucket));
            }
        }
        out
    }
}
