//! Pluggable chunk compression, keyed by the short name stored in each
//! Chunk record.
//!
//! The format identifies compression by name: the empty string means the
//! chunk records are stored verbatim, and `"lz4"` / `"zstd"` are the
//! well-known schemes. A [`CompressionRegistry`] maps those names to codecs
//! and can be extended with custom ones before handing it to a reader or
//! writer.

use std::{collections::HashMap, sync::Arc};

use crate::{McapError, McapResult};

/// A compression scheme usable for chunk records.
pub trait CompressionCodec: Send + Sync {
    /// The name stored in `Chunk.compression`.
    fn name(&self) -> &str;

    /// Compress an entire uncompressed record stream.
    fn compress(&self, data: &[u8]) -> McapResult<Vec<u8>>;

    /// Decompress `data`, which must expand to exactly `uncompressed_size`
    /// bytes. Producing any other length is an error: the caller's offsets
    /// into the result would be meaningless.
    fn decompress(&self, data: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>>;
}

/// Looks up [codecs](CompressionCodec) by name.
///
/// [`CompressionRegistry::default`] registers the built-in schemes: the
/// identity codec for `""`, plus `"lz4"` and `"zstd"` when the corresponding
/// features are enabled. Cloning the registry shares the codecs.
#[derive(Clone)]
pub struct CompressionRegistry {
    codecs: HashMap<String, Arc<dyn CompressionCodec>>,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        let mut registry = Self::bare();
        #[cfg(feature = "lz4")]
        registry.register(Arc::new(Lz4Codec));
        #[cfg(feature = "zstd")]
        registry.register(Arc::new(ZstdCodec));
        registry
    }
}

impl CompressionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with only the identity codec, which every reader and
    /// writer must support.
    pub fn bare() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(NullCodec));
        registry
    }

    /// Add a codec, replacing any previous codec with the same name.
    pub fn register(&mut self, codec: Arc<dyn CompressionCodec>) {
        self.codecs.insert(codec.name().to_owned(), codec);
    }

    pub fn get(&self, name: &str) -> McapResult<&Arc<dyn CompressionCodec>> {
        self.codecs
            .get(name)
            .ok_or_else(|| McapError::UnsupportedCompression(name.to_owned()))
    }
}

fn check_size(data: Vec<u8>, expected: u64) -> McapResult<Vec<u8>> {
    if data.len() as u64 != expected {
        return Err(McapError::BadUncompressedSize {
            expected,
            actual: data.len() as u64,
        });
    }
    Ok(data)
}

/// The empty compression name: chunk records are stored as-is.
struct NullCodec;

impl CompressionCodec for NullCodec {
    fn name(&self) -> &str {
        ""
    }

    fn compress(&self, data: &[u8]) -> McapResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>> {
        check_size(data.to_vec(), uncompressed_size)
    }
}

#[cfg(feature = "lz4")]
struct Lz4Codec;

#[cfg(feature = "lz4")]
impl CompressionCodec for Lz4Codec {
    fn name(&self) -> &str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> McapResult<Vec<u8>> {
        use std::io::Write;

        // Block checksums are disabled for wider compatibility with MCAP
        // tooling that includes a faulty block checksum calculation. The
        // chunk CRC already covers the same bytes.
        let mut encoder = lz4::EncoderBuilder::new()
            .block_checksum(lz4::liblz4::BlockChecksum::NoBlockChecksum)
            .build(Vec::new())?;
        encoder.write_all(data)?;
        let (compressed, result) = encoder.finish();
        result?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>> {
        use std::io::Read;

        let mut out = Vec::with_capacity(uncompressed_size as usize);
        lz4::Decoder::new(std::io::Cursor::new(data))?.read_to_end(&mut out)?;
        check_size(out, uncompressed_size)
    }
}

#[cfg(feature = "zstd")]
struct ZstdCodec;

#[cfg(feature = "zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> McapResult<Vec<u8>> {
        use std::io::Write;

        #[allow(unused_mut)]
        let mut encoder = zstd::Encoder::new(Vec::new(), 0)?;
        #[cfg(not(target_arch = "wasm32"))]
        encoder.multithread(num_cpus::get_physical() as u32)?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>> {
        let mut out = vec![0; uncompressed_size as usize];
        let n = zstd::zstd_safe::decompress(&mut out[..], data)
            .map_err(|err| McapError::Decompression(zstd::zstd_safe::get_error_name(err).into()))?;
        out.truncate(n);
        check_size(out, uncompressed_size)
    }
}
