//! Convenience re-exports for common update types

pub use crate::commit::{RestartFlag, RestartHandle};
pub use crate::config::UpdateConfig;
pub use crate::engine::UpdateEngine;
pub use crate::error::{UpdateError, UpdateErrorKind};
pub use crate::image::{
    AppDescriptor, FirmwareVersion, HeaderMode, HeaderOutcome, HeaderState, ImageBuilder, extract,
};
pub use crate::memory::{FaultPlan, MemoryFlash};
pub use crate::partition::{
    FlashLayout, Partition, PartitionInfo, PartitionRegistry, PartitionRole, StagingWriter,
    describe_partitions,
};
pub use crate::policy::{VersionDecision, VersionMode};
pub use crate::progress::{UpdatePhase, UpdateProgress};
pub use crate::session::{SessionReport, SessionState, UpdateSession};
pub use crate::transport::{ChunkError, ChunkSource, ReaderSource, SliceSource};
