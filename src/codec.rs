//! Stream codecs for file-backed content
//!
//! Stream-sourced documents may sit on disk compressed. This module picks the
//! matching decoder so the writer can read them either fully (buffered mode)
//! or lazily through the connection (streaming mode).

use std::io::{Read, Write};

use lz4::{Decoder as Lz4Decoder, EncoderBuilder as Lz4EncoderBuilder};
use serde::{Serialize, Deserialize};
use zstd::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

use crate::error::{Result, Error};

/// Compression codecs a stream source may be encoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamCodec {
    /// Plain file
    None,
    /// LZ4 frame format
    Lz4,
    /// Zstandard
    Zstd,
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for StreamCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl StreamCodec {
    /// Parse a codec from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(Error::config(format!("Unsupported stream codec: {}", s))),
        }
    }

    /// Guess the codec from a file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "lz4" => Self::Lz4,
            "zst" | "zstd" => Self::Zstd,
            _ => Self::None,
        }
    }

    /// Get the name of the codec
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Wrap `reader` in the decoder for `codec`
pub fn decoder<R>(codec: StreamCodec, reader: R) -> Result<Box<dyn Read + Send>>
where
    R: Read + Send + 'static,
{
    match codec {
        StreamCodec::None => Ok(Box::new(reader)),
        StreamCodec::Lz4 => {
            let decoder = Lz4Decoder::new(reader)
                .map_err(|e| Error::content(format!("LZ4 error: {}", e)))?;
            Ok(Box::new(decoder))
        }
        StreamCodec::Zstd => {
            let decoder = ZstdDecoder::new(reader)
                .map_err(|e| Error::content(format!("Zstd error: {}", e)))?;
            Ok(Box::new(decoder))
        }
    }
}

/// Encode `data` with `codec`, for producing stream-source files
pub fn encode(data: &[u8], codec: StreamCodec, level: i32) -> Result<Vec<u8>> {
    match codec {
        StreamCodec::None => Ok(data.to_vec()),
        StreamCodec::Lz4 => {
            let mut encoder = Lz4EncoderBuilder::new()
                .level(level.clamp(0, 9) as u32)
                .build(Vec::new())?;
            encoder.write_all(data)?;
            let (compressed, result) = encoder.finish();
            result?;
            Ok(compressed)
        }
        StreamCodec::Zstd => {
            let mut compressed = Vec::new();
            let mut encoder = ZstdEncoder::new(&mut compressed, level.clamp(1, 22))?;
            encoder.write_all(data)?;
            encoder.finish()?;
            Ok(compressed)
        }
    }
}
