//! Streaming I/O wrappers used by blob transfer (§4.3/§4.4/§9 of the design
//! doc): a digest-verifying reader that hashes bytes as they pass through
//! instead of buffering the whole blob, and a cancelable reader that turns a
//! flipped cancellation flag into an `Interrupted` error at the next read.
//! Both wrap anything that implements `Read`, so the same HTTP response body
//! that streams a blob down from the source can stream it straight into the
//! destination's upload body without ever landing in a `Vec<u8>`.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest as _, Sha256};

/// Hashes every byte read through it and compares the final digest against
/// `expected` once the inner reader reports EOF. A mismatch surfaces as an
/// `InvalidData` io error on that last read rather than a silent pass.
pub struct DigestVerifyingReader<R> {
    inner: R,
    hasher: Sha256,
    expected: String,
    finished: bool,
}

impl<R: Read> DigestVerifyingReader<R> {
    pub fn new(inner: R, expected: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: expected.into(),
            finished: false,
        }
    }
}

impl<R: Read> Read for DigestVerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !self.finished {
                self.finished = true;
                let hasher = std::mem::replace(&mut self.hasher, Sha256::new());
                let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                if actual != self.expected {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("digest mismatch: expected {}, got {actual}", self.expected),
                    ));
                }
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Raises `Interrupted` at the next read once `cancelled` is flipped,
/// wrapped around both the source (download) and destination (upload body)
/// side of a blob transfer so a cancellation aborts the stream in both
/// directions instead of letting one side run to completion.
pub struct CancelableReader<R> {
    inner: R,
    cancelled: Arc<AtomicBool>,
}

impl<R: Read> CancelableReader<R> {
    pub fn new(inner: R, cancelled: Arc<AtomicBool>) -> Self {
        Self { inner, cancelled }
    }
}

impl<R: Read> Read for CancelableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
        }
        self.inner.read(buf)
    }
}
