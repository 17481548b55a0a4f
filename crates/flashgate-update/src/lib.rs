//! Firmware update session engine for A/B flash layouts
//!
//! This crate receives a firmware image as a byte stream of declared length
//! and turns it into a new boot target without ever leaving the device
//! unbootable:
//! - Single-session admission guard with fail-fast rejection
//! - Header extraction over arbitrary chunk boundaries
//! - Advisory or enforcing version policy against running and failed images
//! - Strictly sequential staging writes with overrun, timeout and cancel handling
//! - Seal-then-activate commit that never points the boot pointer at a partial image
//!
//! # Architecture
//!
//! - [`engine`]: Admission, write loop and commit wired together
//! - [`session`]: State of one admitted upload
//! - [`guard`]: Single-session guard
//! - [`image`]: Image header and descriptor decoding
//! - [`policy`]: Version policy
//! - [`commit`]: Commit controller and restart collaborator
//! - [`partition`]: Partition layout and the registry trait
//! - [`memory`]: In-memory registry
//! - [`transport`]: Chunk sources
//! - [`progress`]: Progress snapshots
//! - [`config`]: Engine configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use flashgate_update::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), UpdateError> {
//! let flash = MemoryFlash::new(0x10_0000);
//! let restart = Arc::new(RestartFlag::new());
//! let engine = UpdateEngine::new(UpdateConfig::default(), Arc::new(flash.clone()), restart.clone())?;
//!
//! let image = ImageBuilder::new("v1.2.0").build();
//! let mut source = SliceSource::new(image.clone(), 1024);
//! let report = engine.upload(image.len() as u64, "/spiffs", &mut source).await?;
//!
//! assert_eq!(report.state, SessionState::RestartRequested);
//! assert!(restart.is_requested());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod image;
pub mod memory;
pub mod partition;
pub mod policy;
pub mod prelude;
pub mod progress;
pub mod session;
pub mod transport;

pub use commit::{CommitController, RestartFlag, RestartHandle};
pub use config::UpdateConfig;
pub use engine::UpdateEngine;
pub use error::{Result, UpdateError, UpdateErrorKind};
pub use guard::{GuardToken, SessionGuard};
pub use image::{
    AppDescriptor, FirmwareVersion, HEADER_WINDOW, HeaderMode, HeaderOutcome, HeaderState,
    ImageBuilder, ImageDescriptor, MalformedHeader, extract,
};
pub use memory::{FaultPlan, MemoryFlash};
pub use partition::{
    FlashLayout, Partition, PartitionInfo, PartitionKind, PartitionRegistry, PartitionRole,
    StagingWriter, describe_partitions,
};
pub use policy::{VersionDecision, VersionHistory, VersionMode, decide};
pub use progress::{UpdatePhase, UpdateProgress};
pub use session::{SessionReport, SessionState, UpdateSession};
pub use transport::{ChunkError, ChunkSource, ReaderSource, SliceSource};
