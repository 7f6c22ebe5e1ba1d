//! # tilecore-core
//!
//! Tiling, memory and synchronization machinery shared by every tilecore kernel.
//!
//! Provides:
//! - Precision tags and the `Element` trait (f32, f16)
//! - Main-memory tensors and a capacity-bounded scratchpad arena with typed handles
//! - Tile planning with explicit divisibility validation
//! - A strided transfer engine with `wait`/`wait_all` completion semantics
//! - A checkpoint-checked cluster barrier and row partitioning
//! - The cluster runtime: mover/calculator roles on scoped threads

pub mod error;
pub mod precision;
pub mod tensor;
pub mod scratchpad;
pub mod tiling;
pub mod transfer;
pub mod barrier;
pub mod partition;
pub mod cluster;
pub mod report;
pub mod serde_flag;

pub use barrier::{Checkpoint, ClusterBarrier};
pub use cluster::{
    launch, CalculatorCtx, ClusterConfig, ClusterKernel, CoreId, CoreRole, MoverCtx,
};
pub use error::{SyncError, TileError};
pub use partition::{RowAssignment, RowPartition};
pub use precision::{Element, Precision};
pub use report::{CoreStats, KernelReport, Phase};
pub use scratchpad::{BufferId, BufferRole, Scratchpad, ScratchpadLayout};
pub use tensor::DramTensor;
pub use tiling::{AttentionTiling, LayerNormTiling, TileDesc};
pub use transfer::{TransferEngine, TransferId, TransferStats};

pub type Result<T> = std::result::Result<T, TileError>;
