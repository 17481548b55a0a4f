//! Command implementations for the flashgate CLI

pub mod flash;
pub mod image;

use clap::Args;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Default size of each simulated partition (1 MiB)
pub const DEFAULT_SLOT_SIZE: u64 = 0x10_0000;

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Flash directory created by `flashgate init`
    pub dir: PathBuf,

    /// Image file to stream
    pub image: PathBuf,

    /// Serve the image in chunks of this many bytes instead of reading the file directly
    #[arg(long)]
    pub chunk_size: Option<NonZeroUsize>,

    /// Engine configuration (JSON)
    #[arg(long, env = "FLASHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage root named by the upload; defaults to the configured root
    #[arg(long)]
    pub base_path: Option<String>,

    /// Abort the session when the header window cannot be validated
    #[arg(long)]
    pub strict_header: bool,

    /// Refuse images matching the running or last failed version
    #[arg(long)]
    pub reject_known_bad: bool,
}
