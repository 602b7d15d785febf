//! Topology-aware CPU/GPU/thread placement engine for HPC job launchers.
//!
//! A launcher plugin builds a [`handle::Handle`] over a [`topology::Topology`]
//! implementation, calls [`handle::Handle::run`] once, and reads back
//! per-task cpusets, GPU sets, thread counts, and the environment variables
//! a task's exec environment should carry.

pub mod bitmap;
pub mod cpu_match;
pub mod device;
pub mod distrib;
pub mod distributor;
pub mod env;
pub mod error;
pub mod gpu_match;
pub mod handle;
pub mod restrict;
pub mod topology;

pub use device::{Device, DeviceKind, DeviceTable};
pub use distributor::Mapping;
pub use env::{EnvVar, GpuIdKind};
pub use error::{MpibindError, Result};
pub use handle::{Builder, GpuVendor, Handle};
pub use restrict::RestrictKind;
pub use topology::Topology;

#[cfg(feature = "hwloc")]
pub use topology::real::RealTopology;
pub use topology::mock::MockTopology;
