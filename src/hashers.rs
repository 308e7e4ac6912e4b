use crate::error::HashError;
use crate::models::Algorithm;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};

/// Minimum number of bytes between two progress callbacks.
pub const PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One running hash state.
enum Accumulator {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Accumulator {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => Accumulator::Md5(md5::Context::new()),
            Algorithm::Sha1 => {
                use sha1::Digest;
                Accumulator::Sha1(sha1::Sha1::new())
            }
            Algorithm::Sha256 => {
                use sha2::Digest;
                Accumulator::Sha256(sha2::Sha256::new())
            }
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Accumulator::Md5(ctx) => ctx.consume(chunk),
            Accumulator::Sha1(hasher) => {
                use sha1::Digest;
                hasher.update(chunk);
            }
            Accumulator::Sha256(hasher) => {
                use sha2::Digest;
                hasher.update(chunk);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Accumulator::Md5(ctx) => format!("{:x}", ctx.finalize()),
            Accumulator::Sha1(hasher) => {
                use sha1::Digest;
                hex::encode(hasher.finalize())
            }
            Accumulator::Sha256(hasher) => {
                use sha2::Digest;
                hex::encode(hasher.finalize())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOutput {
    /// Hex digests, same order as the requested algorithms.
    pub digests: Vec<String>,
    pub byte_count: u64,
}

/// Streams a reader once through every requested algorithm.
#[derive(Debug, Clone, Copy)]
pub struct DigestEngine {
    chunk_size: usize,
    progress_interval: u64,
}

impl Default for DigestEngine {
    fn default() -> Self {
        Self::new(CHUNK_SIZE, PROGRESS_INTERVAL)
    }
}

impl DigestEngine {
    pub fn new(chunk_size: usize, progress_interval: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            progress_interval,
        }
    }

    /// Hashes `reader` with every algorithm in a single pass.
    ///
    /// `on_progress` receives the cumulative byte count each time more than
    /// `progress_interval` bytes have been read since the previous call. The
    /// `abort` flag is polled at every chunk boundary.
    pub fn compute<R: Read>(
        &self,
        name: &str,
        mut reader: R,
        algorithms: &[Algorithm],
        abort: &AtomicBool,
        mut on_progress: impl FnMut(u64),
    ) -> Result<DigestOutput, HashError> {
        let mut accumulators: Vec<Accumulator> =
            algorithms.iter().copied().map(Accumulator::new).collect();
        let mut buf = vec![0u8; self.chunk_size];
        let mut byte_count: u64 = 0;
        let mut last_sent: u64 = 0;

        loop {
            if abort.load(Ordering::Relaxed) {
                return Err(HashError::Aborted);
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(HashError::Read {
                        name: name.to_string(),
                        offset: byte_count,
                        source,
                    })
                }
            };
            // Every accumulator sees this chunk before the next read.
            for accumulator in accumulators.iter_mut() {
                accumulator.update(&buf[..n]);
            }
            byte_count += n as u64;
            if byte_count > last_sent + self.progress_interval {
                on_progress(byte_count);
                last_sent = byte_count;
            }
        }

        Ok(DigestOutput {
            digests: accumulators.into_iter().map(Accumulator::finalize_hex).collect(),
            byte_count,
        })
    }
}
