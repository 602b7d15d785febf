use thiserror::Error;

/// The four fault categories a launcher plugin must be able to distinguish
/// between (see the error handling design): bad caller input, a topology
/// that cannot be mapped at all, a non-fatal device enumeration anomaly,
/// and a failure while actually applying a computed binding.
#[derive(Debug, Error)]
pub enum MpibindError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("topology unusable: {0}")]
    TopologyUnusable(String),

    /// Device enumeration found something it couldn't fully resolve (e.g. a
    /// GPU-management OS device with no matching coprocessor entry). This
    /// never aborts a run; the warnings are folded into the result so a
    /// caller can log them.
    #[error("{} device enumeration warning(s)", .0.len())]
    DeviceEnumeration(Vec<String>),

    #[error("failed to apply binding for task {task}: {source}")]
    Apply {
        task: usize,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MpibindError>;
