//! Read Limiter
//!
//! A counting semaphore bounding the number of concurrent `read_at` calls
//! across the whole process. Every block read, local file or remote object,
//! acquires a permit first, which keeps a search fan-out from starving the
//! disk (or hammering the object store) with unbounded random reads.
//!
//! The limiter is blocking on purpose: block reads happen on blocking search
//! threads where an async semaphore cannot be awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use seqdb_core::Result;

use crate::remote::ImmutableFile;

pub struct ReadLimiter {
    available: Mutex<usize>,
    cond: Condvar,
    bytes_read: AtomicU64,
}

impl ReadLimiter {
    pub fn new(max_reads: usize) -> Self {
        ReadLimiter {
            available: Mutex::new(max_reads.max(1)),
            cond: Condvar::new(),
            bytes_read: AtomicU64::new(0),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.cond.wait(available).unwrap();
        }
        *available -= 1;
        Permit { limiter: self }
    }

    /// Read exactly `buf.len()` bytes at `offset`, holding a permit for the
    /// duration of the read.
    pub fn read_at(&self, file: &dyn ImmutableFile, buf: &mut [u8], offset: u64) -> Result<()> {
        let _permit = self.acquire();
        file.read_exact_at(buf, offset)?;
        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Total bytes read through this limiter.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

struct Permit<'a> {
    limiter: &'a ReadLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.limiter.available.lock().unwrap();
        *available += 1;
        self.limiter.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalFile;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_read_at_through_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let limiter = ReadLimiter::new(2);
        let file = LocalFile::open(&path).unwrap();

        let mut buf = [0u8; 4];
        limiter.read_at(&file, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");
        assert_eq!(limiter.bytes_read(), 4);
    }

    #[test]
    fn test_concurrent_reads_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![7u8; 4096])
            .unwrap();

        let limiter = Arc::new(ReadLimiter::new(2));
        let file = Arc::new(LocalFile::open(&path).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let file = file.clone();
            handles.push(std::thread::spawn(move || {
                let mut buf = [0u8; 128];
                for i in 0..16u64 {
                    limiter.read_at(file.as_ref(), &mut buf, i * 128).unwrap();
                    assert!(buf.iter().all(|&b| b == 7));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.bytes_read(), 8 * 16 * 128);
    }

    #[test]
    fn test_short_read_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::File::create(&path).unwrap().write_all(b"ab").unwrap();

        let limiter = ReadLimiter::new(1);
        let file = LocalFile::open(&path).unwrap();

        let mut buf = [0u8; 10];
        assert!(limiter.read_at(&file, &mut buf, 0).is_err());
    }
}
