//! Error types for tilecore.
//!
//! Every failure here is a configuration or protocol error detected at
//! kernel-invocation time. Numeric edge cases are not errors: they propagate
//! as IEEE values.

use crate::barrier::Checkpoint;
use crate::cluster::CoreId;
use crate::precision::Precision;
use crate::scratchpad::BufferRole;

/// Errors reported by kernel entry points and the cluster runtime.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("{what} ({value}) is not a multiple of {divisor}")]
    NotDivisible {
        what: &'static str,
        value: usize,
        divisor: usize,
    },

    #[error("{what} must be non-zero")]
    ZeroDimension { what: &'static str },

    #[error(
        "scratchpad overflow allocating {role}: requested {requested} bytes, \
         {available} of {capacity} bytes available"
    )]
    ScratchpadOverflow {
        role: BufferRole,
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("unsupported precision: {0}")]
    UnsupportedPrecision(Precision),

    #[error("precision mismatch: layer declares {expected}, tensors hold {got}")]
    PrecisionMismatch { expected: Precision, got: Precision },

    #[error("tensor '{tensor}' has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0} panicked")]
    CorePanicked(CoreId),
}

impl TileError {
    /// Whether this error is only a consequence of another core failing.
    ///
    /// When several cores fail, the runtime reports the root cause rather
    /// than the barrier poisoning it triggered in the other cores.
    pub fn is_secondary(&self) -> bool {
        matches!(self, TileError::Sync(SyncError::ParticipantExited { .. }))
    }
}

/// Barrier protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("checkpoint mismatch: cluster is at {expected}, {core} arrived at {got}")]
    CheckpointMismatch {
        expected: Checkpoint,
        got: Checkpoint,
        core: CoreId,
    },

    #[error("{core} left the cluster while others wait at {checkpoint}")]
    ParticipantExited { core: CoreId, checkpoint: Checkpoint },
}

/// Fail with [`TileError::NotDivisible`] unless `value` is a multiple of `divisor`.
pub fn ensure_multiple(what: &'static str, value: usize, divisor: usize) -> crate::Result<()> {
    if divisor == 0 || value % divisor != 0 {
        return Err(TileError::NotDivisible { what, value, divisor });
    }
    Ok(())
}

/// Fail with [`TileError::ZeroDimension`] if `value` is zero.
pub fn ensure_nonzero(what: &'static str, value: usize) -> crate::Result<()> {
    if value == 0 {
        return Err(TileError::ZeroDimension { what });
    }
    Ok(())
}

/// Product of `factors`, failing with [`TileError::InvalidConfig`] if it
/// does not fit in `usize`.
pub fn checked_product(what: &'static str, factors: &[usize]) -> crate::Result<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| TileError::InvalidConfig(format!("{what} {factors:?} overflows usize")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_multiple() {
        assert!(ensure_multiple("N", 64, 16).is_ok());
        let err = ensure_multiple("N", 65, 16).unwrap_err();
        assert_eq!(err.to_string(), "N (65) is not a multiple of 16");
        assert!(ensure_multiple("N", 8, 0).is_err());
    }

    #[test]
    fn test_ensure_nonzero() {
        assert!(ensure_nonzero("d", 1).is_ok());
        assert!(matches!(
            ensure_nonzero("d", 0),
            Err(TileError::ZeroDimension { what: "d" })
        ));
    }

    #[test]
    fn test_checked_product() {
        assert_eq!(checked_product("tile", &[16, 8, 4]).unwrap(), 512);
        let err = checked_product("tile", &[1 << 40, 1 << 30]).unwrap_err();
        assert!(matches!(err, TileError::InvalidConfig(_)));
        assert!(err.to_string().contains("tile"));
    }
}
