//! Firmware image header decoding
//!
//! An application image opens with a fixed 24-byte image header, the header of
//! its first segment (8 bytes) and the 256-byte application descriptor that
//! carries the version string. These 288 bytes form the header window. The
//! extractor only ever looks at that window; everything after it is opaque
//! payload that the session writes verbatim.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// First byte of every application image
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Magic word opening the application descriptor
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Size of the image header
pub const IMAGE_HEADER_LEN: usize = 24;

/// Size of a segment header
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Size of the application descriptor
pub const APP_DESC_LEN: usize = 256;

/// Bytes needed before the descriptor can be decoded
pub const HEADER_WINDOW: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + APP_DESC_LEN;

/// Width of the version field in the descriptor
pub const VERSION_LEN: usize = 32;

// Descriptor field offsets, relative to the start of the descriptor.
const DESC_SECURE_VERSION: usize = 4;
const DESC_VERSION: usize = 16;
const DESC_PROJECT_NAME: usize = 48;
const DESC_TIME: usize = 80;
const DESC_DATE: usize = 96;
const DESC_SDK_VERSION: usize = 112;
const DESC_ELF_SHA256: usize = 144;

fn field<const N: usize>(bytes: &[u8], at: usize) -> Option<[u8; N]> {
    bytes.get(at..at.checked_add(N)?)?.try_into().ok()
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    field::<2>(bytes, at).map(u16::from_le_bytes)
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    field::<4>(bytes, at).map(u32::from_le_bytes)
}

/// NUL-terminated fixed-width text field
fn c_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(raw.get(..end).unwrap_or_default()).into_owned()
}

fn put_c_str(dst: &mut [u8], text: &str) {
    // Keep the last byte as terminator.
    let room = dst.len().saturating_sub(1);
    for (d, s) in dst.iter_mut().zip(text.as_bytes().iter().take(room)) {
        *d = *s;
    }
}

fn put(dst: &mut [u8], at: usize, src: &[u8]) {
    if let Some(slot) = at
        .checked_add(src.len())
        .and_then(|end| dst.get_mut(at..end))
    {
        slot.copy_from_slice(src);
    }
}

/// Fixed-width version field, compared byte for byte
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FirmwareVersion([u8; VERSION_LEN]);

impl FirmwareVersion {
    /// Wrap a raw version field
    pub const fn from_raw(raw: [u8; VERSION_LEN]) -> Self {
        Self(raw)
    }

    /// Build a version field from text, truncated to leave a terminator
    pub fn new(version: &str) -> Self {
        let mut raw = [0u8; VERSION_LEN];
        put_c_str(&mut raw, version);
        Self(raw)
    }

    /// Raw field bytes
    pub fn as_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.0
    }

    /// Text up to the first NUL
    pub fn as_text(&self) -> String {
        c_str(&self.0)
    }
}

impl From<String> for FirmwareVersion {
    fn from(s: String) -> Self {
        FirmwareVersion::new(&s)
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.as_text()
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl std::fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FirmwareVersion").field(&self.as_text()).finish()
    }
}

/// Why a header window failed structural checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedHeader {
    /// First byte is not [`IMAGE_MAGIC`]
    #[error("bad image magic 0x{0:02x}")]
    ImageMagic(u8),

    /// Image header declares no segments
    #[error("image declares no segments")]
    NoSegments,

    /// Descriptor does not open with [`APP_DESC_MAGIC`]
    #[error("bad descriptor magic 0x{0:08x}")]
    DescriptorMagic(u32),

    /// A field could not be read from the window
    #[error("header truncated at offset {0}")]
    Truncated(usize),
}

/// Fixed image header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Number of segments following the header
    pub segment_count: u8,
    /// Flash access mode
    pub spi_mode: u8,
    /// Packed flash speed (low nibble) and size (high nibble)
    pub spi_speed_size: u8,
    /// Entry point address
    pub entry_addr: u32,
    /// Target chip identifier
    pub chip_id: u16,
    /// Whether a SHA-256 digest follows the image
    pub hash_appended: bool,
}

impl ImageHeader {
    /// Decode and check the image header
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedHeader> {
        let truncated = || MalformedHeader::Truncated(bytes.len());
        let magic = *bytes.first().ok_or_else(truncated)?;
        if magic != IMAGE_MAGIC {
            return Err(MalformedHeader::ImageMagic(magic));
        }
        let header = Self {
            segment_count: *bytes.get(1).ok_or_else(truncated)?,
            spi_mode: *bytes.get(2).ok_or_else(truncated)?,
            spi_speed_size: *bytes.get(3).ok_or_else(truncated)?,
            entry_addr: le_u32(bytes, 4).ok_or_else(truncated)?,
            chip_id: le_u16(bytes, 12).ok_or_else(truncated)?,
            hash_appended: *bytes.get(23).ok_or_else(truncated)? != 0,
        };
        if header.segment_count == 0 {
            return Err(MalformedHeader::NoSegments);
        }
        Ok(header)
    }

    /// Encode to the on-flash layout
    pub fn encode(&self) -> [u8; IMAGE_HEADER_LEN] {
        let mut out = [0u8; IMAGE_HEADER_LEN];
        put(&mut out, 0, &[IMAGE_MAGIC, self.segment_count, self.spi_mode, self.spi_speed_size]);
        put(&mut out, 4, &self.entry_addr.to_le_bytes());
        // wp_pin: disabled
        put(&mut out, 8, &[0xEE]);
        put(&mut out, 12, &self.chip_id.to_le_bytes());
        put(&mut out, 23, &[u8::from(self.hash_appended)]);
        out
    }
}

/// Header of one image segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Load address of the segment
    pub load_addr: u32,
    /// Length of segment data in bytes
    pub data_len: u32,
}

impl SegmentHeader {
    /// Decode a segment header
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedHeader> {
        let truncated = || MalformedHeader::Truncated(bytes.len());
        Ok(Self {
            load_addr: le_u32(bytes, 0).ok_or_else(truncated)?,
            data_len: le_u32(bytes, 4).ok_or_else(truncated)?,
        })
    }

    /// Encode to the on-flash layout
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut out = [0u8; SEGMENT_HEADER_LEN];
        put(&mut out, 0, &self.load_addr.to_le_bytes());
        put(&mut out, 4, &self.data_len.to_le_bytes());
        out
    }
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(digest: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(text, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

/// Application descriptor embedded in the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Anti-rollback counter
    pub secure_version: u32,
    /// Application version
    pub version: FirmwareVersion,
    /// Project name
    pub project_name: String,
    /// Build time
    pub build_time: String,
    /// Build date
    pub build_date: String,
    /// SDK version the image was built with
    pub sdk_version: String,
    /// SHA-256 of the application ELF
    #[serde(with = "hex_digest")]
    pub elf_sha256: [u8; 32],
}

impl AppDescriptor {
    /// Decode and check a descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedHeader> {
        let truncated = || MalformedHeader::Truncated(bytes.len());
        let magic = le_u32(bytes, 0).ok_or_else(truncated)?;
        if magic != APP_DESC_MAGIC {
            return Err(MalformedHeader::DescriptorMagic(magic));
        }
        Ok(Self {
            secure_version: le_u32(bytes, DESC_SECURE_VERSION).ok_or_else(truncated)?,
            version: FirmwareVersion::from_raw(
                field::<VERSION_LEN>(bytes, DESC_VERSION).ok_or_else(truncated)?,
            ),
            project_name: c_str(&field::<32>(bytes, DESC_PROJECT_NAME).ok_or_else(truncated)?),
            build_time: c_str(&field::<16>(bytes, DESC_TIME).ok_or_else(truncated)?),
            build_date: c_str(&field::<16>(bytes, DESC_DATE).ok_or_else(truncated)?),
            sdk_version: c_str(&field::<32>(bytes, DESC_SDK_VERSION).ok_or_else(truncated)?),
            elf_sha256: field::<32>(bytes, DESC_ELF_SHA256).ok_or_else(truncated)?,
        })
    }

    /// Encode to the on-flash layout
    pub fn encode(&self) -> [u8; APP_DESC_LEN] {
        let mut out = [0u8; APP_DESC_LEN];
        put(&mut out, 0, &APP_DESC_MAGIC.to_le_bytes());
        put(&mut out, DESC_SECURE_VERSION, &self.secure_version.to_le_bytes());
        put(&mut out, DESC_VERSION, self.version.as_bytes());
        if let Some(dst) = out.get_mut(DESC_PROJECT_NAME..DESC_TIME) {
            put_c_str(dst, &self.project_name);
        }
        if let Some(dst) = out.get_mut(DESC_TIME..DESC_DATE) {
            put_c_str(dst, &self.build_time);
        }
        if let Some(dst) = out.get_mut(DESC_DATE..DESC_SDK_VERSION) {
            put_c_str(dst, &self.build_date);
        }
        if let Some(dst) = out.get_mut(DESC_SDK_VERSION..DESC_ELF_SHA256) {
            put_c_str(dst, &self.sdk_version);
        }
        put(&mut out, DESC_ELF_SHA256, &self.elf_sha256);
        out
    }
}

/// Everything decoded from a header window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Image header
    pub header: ImageHeader,
    /// First segment header
    pub segment: SegmentHeader,
    /// Application descriptor
    pub app: AppDescriptor,
}

/// Result of running the extractor over a byte prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// Header window decoded and passed structural checks
    Decoded(Box<ImageDescriptor>),

    /// Not enough bytes to cover the header window
    Incomplete {
        /// Bytes available to the extractor
        available: usize,
        /// Bytes the window needs
        required: usize,
    },

    /// Header window failed structural checks
    Malformed(MalformedHeader),
}

impl HeaderOutcome {
    /// The decoded descriptor, if any
    pub fn descriptor(&self) -> Option<&ImageDescriptor> {
        match self {
            HeaderOutcome::Decoded(desc) => Some(desc),
            _ => None,
        }
    }
}

/// Decode the header window at the start of `prefix`
pub fn extract(prefix: &[u8]) -> HeaderOutcome {
    let Some(window) = prefix.get(..HEADER_WINDOW) else {
        return HeaderOutcome::Incomplete {
            available: prefix.len(),
            required: HEADER_WINDOW,
        };
    };
    let (header_bytes, rest) = window.split_at(IMAGE_HEADER_LEN);
    let (segment_bytes, desc_bytes) = rest.split_at(SEGMENT_HEADER_LEN);

    let decoded = ImageHeader::parse(header_bytes).and_then(|header| {
        Ok(ImageDescriptor {
            header,
            segment: SegmentHeader::parse(segment_bytes)?,
            app: AppDescriptor::parse(desc_bytes)?,
        })
    });
    match decoded {
        Ok(desc) => HeaderOutcome::Decoded(Box::new(desc)),
        Err(reason) => HeaderOutcome::Malformed(reason),
    }
}

/// When and how strictly the header window is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMode {
    /// Evaluate the first chunk only; a short first chunk skips validation
    FirstChunk,

    /// Buffer leading bytes until the window is complete, then evaluate once
    #[default]
    Accumulate,

    /// As `Accumulate`, but a malformed or missing header aborts the session
    Strict,
}

impl HeaderMode {
    /// Whether header failures abort the session
    pub fn is_strict(self) -> bool {
        self == HeaderMode::Strict
    }
}

/// Header validation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderState {
    /// Extraction has not run yet
    Pending,
    /// Descriptor decoded
    Validated,
    /// Extraction ran and failed, or never had enough bytes
    Rejected,
}

/// Feeds stream chunks to the extractor and runs it exactly once
#[derive(Debug)]
pub struct HeaderProbe {
    mode: HeaderMode,
    prefix: Vec<u8>,
    state: HeaderState,
    evaluated: bool,
}

impl HeaderProbe {
    /// Create a probe for the given mode
    pub fn new(mode: HeaderMode) -> Self {
        let capacity = match mode {
            HeaderMode::FirstChunk => 0,
            HeaderMode::Accumulate | HeaderMode::Strict => HEADER_WINDOW,
        };
        Self {
            mode,
            prefix: Vec::with_capacity(capacity),
            state: HeaderState::Pending,
            evaluated: false,
        }
    }

    /// Current header state
    pub fn state(&self) -> HeaderState {
        self.state
    }

    /// Mode the probe was created with
    pub fn mode(&self) -> HeaderMode {
        self.mode
    }

    /// Observe the next chunk; returns the outcome if extraction ran on this call
    pub fn observe(&mut self, chunk: &[u8]) -> Option<HeaderOutcome> {
        if self.evaluated {
            return None;
        }
        match self.mode {
            HeaderMode::FirstChunk => Some(self.evaluate(chunk)),
            HeaderMode::Accumulate | HeaderMode::Strict => {
                let missing = HEADER_WINDOW.saturating_sub(self.prefix.len());
                let take = missing.min(chunk.len());
                self.prefix.extend_from_slice(chunk.get(..take).unwrap_or(chunk));
                if self.prefix.len() < HEADER_WINDOW {
                    return None;
                }
                let prefix = std::mem::take(&mut self.prefix);
                Some(self.evaluate(&prefix))
            }
        }
    }

    /// Stream ended; evaluate whatever was buffered if extraction never ran
    pub fn finish(&mut self) -> Option<HeaderOutcome> {
        if self.evaluated {
            return None;
        }
        let prefix = std::mem::take(&mut self.prefix);
        Some(self.evaluate(&prefix))
    }

    fn evaluate(&mut self, bytes: &[u8]) -> HeaderOutcome {
        self.evaluated = true;
        let outcome = extract(bytes);
        self.state = match outcome {
            HeaderOutcome::Decoded(_) => HeaderState::Validated,
            HeaderOutcome::Incomplete { .. } | HeaderOutcome::Malformed(_) => {
                HeaderState::Rejected
            }
        };
        outcome
    }
}

/// Builds well-formed synthetic application images
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    version: FirmwareVersion,
    project_name: String,
    sdk_version: String,
    secure_version: u32,
    total_len: usize,
}

impl ImageBuilder {
    /// Start an image carrying `version`
    pub fn new(version: &str) -> Self {
        Self {
            version: FirmwareVersion::new(version),
            project_name: "flashgate-app".to_string(),
            sdk_version: "v5.1".to_string(),
            secure_version: 0,
            total_len: 4096,
        }
    }

    /// Set the project name
    pub fn project_name(mut self, name: &str) -> Self {
        self.project_name = name.to_string();
        self
    }

    /// Set the anti-rollback counter
    pub fn secure_version(mut self, secure_version: u32) -> Self {
        self.secure_version = secure_version;
        self
    }

    /// Set the total image length; never shorter than the header window
    pub fn total_len(mut self, len: usize) -> Self {
        self.total_len = len.max(HEADER_WINDOW);
        self
    }

    /// Descriptor the built image will carry
    pub fn descriptor(&self) -> AppDescriptor {
        let mut hasher = Sha256::new();
        hasher.update(self.version.as_bytes());
        hasher.update(self.project_name.as_bytes());
        AppDescriptor {
            secure_version: self.secure_version,
            version: self.version,
            project_name: self.project_name.clone(),
            build_time: "12:00:00".to_string(),
            build_date: "Jan  1 2025".to_string(),
            sdk_version: self.sdk_version.clone(),
            elf_sha256: hasher.finalize().into(),
        }
    }

    /// Produce the image bytes
    pub fn build(&self) -> Vec<u8> {
        let header = ImageHeader {
            segment_count: 1,
            spi_mode: 2,
            spi_speed_size: 0x20,
            entry_addr: 0x4008_1000,
            chip_id: 0,
            hash_appended: false,
        };
        let payload_len = self.total_len.saturating_sub(IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN);
        let segment = SegmentHeader {
            load_addr: 0x3F40_0020,
            data_len: u32::try_from(payload_len).unwrap_or(u32::MAX),
        };

        let mut image = Vec::with_capacity(self.total_len);
        image.extend_from_slice(&header.encode());
        image.extend_from_slice(&segment.encode());
        image.extend_from_slice(&self.descriptor().encode());
        let seed = self.version.as_bytes().iter().fold(0u8, |acc, b| acc ^ b);
        image.extend((image.len()..self.total_len).map(|i| (i % 251) as u8 ^ seed));
        image
    }
}
