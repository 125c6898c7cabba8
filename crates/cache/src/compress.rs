//! In-memory compression for cold artifacts.
//!
//! Cold WAV artifacts compress well (silence, repeated frames), so the sweep
//! trades CPU for a multiple of cache capacity. Gzip is always available;
//! zstd is the default for its speed at decompression time, which sits on
//! the lookup path.

use crate::error::{ErrorKind, Result};
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::Path;

/// A supported compression format for cached artifacts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// Zstd compression (.zst)
    Zstd,
}

impl Compression {
    /// Detect format from a file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Self::Gzip,
            Some("zst") => Self::Zstd,
            _ => Self::None,
        }
    }

    /// Extension suffix appended to an artifact name, including the dot.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
        }
    }

    /// Compress a byte slice in memory. `level` is clamped to the format's
    /// valid range; `None` copies.
    pub fn compress(self, input: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Gzip => {
                let level = u32::try_from(level.clamp(1, 9)).unwrap_or(6);
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::new(level));
                encoder.write_all(input).map_err(ErrorKind::Io)?;
                Ok(encoder.finish().map_err(ErrorKind::Io)?)
            },
            Self::Zstd => Ok(zstd::encode_all(input, level.clamp(1, 21)).map_err(ErrorKind::Io)?),
        }
    }

    /// Decompress a byte slice in memory.
    pub fn decompress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Gzip => {
                let mut output = Vec::new();
                GzDecoder::new(input).read_to_end(&mut output).map_err(ErrorKind::Io)?;
                Ok(output)
            },
            Self::Zstd => Ok(zstd::decode_all(input).map_err(ErrorKind::Io)?),
        }
    }
}
