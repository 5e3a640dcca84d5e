//! # Sample Source
//!
//! Bounded buffer the kernel module fills with [`PmcSample`] records.
//!
//! Two backings, chosen once at acquisition time:
//!
//! - **Shared**: the monitor entry mapped with `mmap(2)`, sized by the kernel
//!   module. Used unless an explicit kernel buffer size of at least
//!   [`SHARED_REGION_THRESHOLD`] bytes was requested.
//! - **Heap**: a private buffer of `kernel_buffer_size / PmcSample::SIZE`
//!   records (at least one).
//!
//! Either way a drain is one `read(2)` on the monitor entry into the buffer;
//! the byte count returned tells how many records are ready.

#![allow(unsafe_code)] // mmap/munmap/read and record decoding

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use log::{debug, warn};
use pmctrack_common::PmcSample;

use crate::domain::MeasurementError;
use crate::pmc::Measurement;

/// Explicit kernel buffer sizes below this use the shared mapping
pub const SHARED_REGION_THRESHOLD: usize = 4096;

/// Something the control loop can drain samples from
pub trait SampleSource {
    /// Replace the contents of `out` with the samples available now
    ///
    /// Returns the number of samples, 0 if none are ready.
    ///
    /// # Errors
    /// Any read failure; the control loop stops on it.
    fn read_batch(&mut self, out: &mut Vec<PmcSample>) -> Result<usize, MeasurementError>;
}

/// Shared memory mapping of the monitor entry
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedRegion {
    /// Map `len` bytes of `fd`, shared with the kernel module
    ///
    /// # Errors
    /// `len` is zero or `mmap` failed.
    pub fn map(fd: &OwnedFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty shared region"));
        }
        // SAFETY: fresh mapping chosen by the kernel, fd is open for the call
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { ptr, len })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is valid for len bytes until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `map`
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

#[derive(Debug)]
enum SampleBuffer {
    Shared(SharedRegion),
    Heap(Vec<u8>),
}

impl SampleBuffer {
    fn as_mut_ptr_len(&mut self) -> (*mut u8, usize) {
        match self {
            Self::Shared(region) => (region.ptr.as_ptr(), region.len),
            Self::Heap(buf) => (buf.as_mut_ptr(), buf.len()),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Shared(region) => region.bytes(),
            Self::Heap(buf) => buf,
        }
    }
}

/// [`SampleSource`] over the kernel module's monitor entry
#[derive(Debug)]
pub struct MonitorSource {
    fd: OwnedFd,
    buffer: SampleBuffer,
}

impl MonitorSource {
    /// Open the monitor entry and set up the buffer
    ///
    /// # Errors
    /// The entry cannot be opened or the shared region cannot be mapped.
    pub fn acquire<M: Measurement + ?Sized>(
        measurement: &mut M,
        kernel_buffer_size: Option<usize>,
    ) -> Result<Self, MeasurementError> {
        let fd = measurement.open_monitor()?;

        let buffer = match kernel_buffer_size {
            Some(size) if size >= SHARED_REGION_THRESHOLD => {
                let records = (size / PmcSample::SIZE).max(1);
                debug!("Using a private buffer of {records} samples");
                SampleBuffer::Heap(vec![0; records * PmcSample::SIZE])
            }
            _ => {
                let region = measurement.request_shared_region(&fd)?;
                debug!("Using a shared buffer of {} bytes", region.len());
                SampleBuffer::Shared(region)
            }
        };

        Ok(Self { fd, buffer })
    }

    /// Maximum number of samples one drain can return
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.bytes().len() / PmcSample::SIZE
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.buffer, SampleBuffer::Shared(_))
    }

    fn read_bytes(&mut self) -> io::Result<usize> {
        let (ptr, len) = self.buffer.as_mut_ptr_len();
        loop {
            // SAFETY: ptr is valid for len writable bytes owned by self.buffer
            let n = unsafe { libc::read(self.fd.as_raw_fd(), ptr.cast(), len) };
            if n >= 0 {
                return Ok(n.unsigned_abs());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl SampleSource for MonitorSource {
    fn read_batch(&mut self, out: &mut Vec<PmcSample>) -> Result<usize, MeasurementError> {
        out.clear();
        let nbytes = self.read_bytes().map_err(MeasurementError::Read)?;
        let bytes = &self.buffer.bytes()[..nbytes.min(self.buffer.bytes().len())];

        let chunks = bytes.chunks_exact(PmcSample::SIZE);
        if !chunks.remainder().is_empty() {
            warn!("Ignoring {} trailing bytes of a partial sample", chunks.remainder().len());
        }
        out.extend(chunks.map(|chunk| {
            // SAFETY: chunk is exactly PmcSample::SIZE bytes and PmcSample is plain old data
            unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<PmcSample>()) }
        }));
        Ok(out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmc::{ConfigPlan, ConfigScope, CounterInfo, CounterRequest};
    use crate::domain::Pid;
    use std::fs::File;
    use std::io::Write;

    /// Measurement double whose monitor entry is a plain file
    ///
    /// The shared region maps a separate scratch file so reads never target
    /// a mapping of the file being read.
    struct FileMonitor {
        path: std::path::PathBuf,
        scratch: std::path::PathBuf,
        region_bytes: usize,
    }

    impl Measurement for FileMonitor {
        fn check_counter_config(&self, _: &[String]) -> Result<CounterInfo, MeasurementError> {
            Ok(CounterInfo::default())
        }
        fn virtual_counters(&self) -> Result<Vec<(u32, String)>, MeasurementError> {
            Ok(Vec::new())
        }
        fn configuration_plan(&self, _: &CounterRequest<'_>, _: ConfigScope) -> Result<ConfigPlan, MeasurementError> {
            Ok(ConfigPlan::new())
        }
        fn attach_process(&mut self, _: Pid) -> Result<(), MeasurementError> {
            Ok(())
        }
        fn open_monitor(&mut self) -> Result<OwnedFd, MeasurementError> {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&self.path).unwrap();
            Ok(OwnedFd::from(file))
        }
        fn request_shared_region(&self, _: &OwnedFd) -> Result<SharedRegion, MeasurementError> {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&self.scratch).unwrap();
            file.set_len(self.region_bytes as u64).unwrap();
            SharedRegion::map(&OwnedFd::from(file), self.region_bytes).map_err(MeasurementError::SharedRegion)
        }
    }

    fn record(pid: i32, value: u64) -> PmcSample {
        let mut s = PmcSample { pid, pmc_mask: 1, nr_counters: 1, ..PmcSample::default() };
        s.pmc_counts[0] = value;
        s
    }

    fn as_bytes(samples: &[PmcSample]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|s| {
                // SAFETY: PmcSample is repr(C) without padding
                unsafe { std::slice::from_raw_parts(std::ptr::from_ref(s).cast::<u8>(), PmcSample::SIZE) }.to_vec()
            })
            .collect()
    }

    fn monitor_file(samples: &[PmcSample]) -> (tempfile::TempDir, FileMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor");
        let scratch = dir.path().join("region");
        File::create(&path).unwrap().write_all(&as_bytes(samples)).unwrap();
        File::create(&scratch).unwrap();
        (dir, FileMonitor { path, scratch, region_bytes: 8 * PmcSample::SIZE })
    }

    #[test]
    fn test_heap_buffer_above_threshold() {
        let samples = [record(1, 10), record(2, 20), record(1, 30)];
        let (_dir, mut monitor) = monitor_file(&samples);

        let mut source = MonitorSource::acquire(&mut monitor, Some(8192)).unwrap();
        assert!(!source.is_shared());
        assert_eq!(source.capacity(), 8192 / PmcSample::SIZE);

        let mut out = Vec::new();
        assert_eq!(source.read_batch(&mut out).unwrap(), 3);
        assert_eq!(out, samples);

        // file offset is at EOF now
        assert_eq!(source.read_batch(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_small_heap_buffer_holds_one_sample() {
        let (_dir, mut monitor) = monitor_file(&[record(1, 1), record(1, 2)]);
        let mut source = MonitorSource::acquire(&mut monitor, Some(SHARED_REGION_THRESHOLD)).unwrap();
        assert_eq!(source.capacity(), SHARED_REGION_THRESHOLD / PmcSample::SIZE);

        let mut out = Vec::new();
        source.read_batch(&mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_shared_region_below_threshold() {
        let samples = [record(5, 1), record(6, 2)];
        let (_dir, mut monitor) = monitor_file(&samples);

        for size in [None, Some(1024)] {
            let mut source = MonitorSource::acquire(&mut monitor, size).unwrap();
            assert!(source.is_shared());
            assert_eq!(source.capacity(), 8);

            let mut out = Vec::new();
            assert_eq!(source.read_batch(&mut out).unwrap(), 2);
            assert_eq!(out, samples);
        }
    }

    #[test]
    fn test_zero_length_region_rejected() {
        let (_dir, mut monitor) = monitor_file(&[]);
        let fd = monitor.open_monitor().unwrap();
        assert!(SharedRegion::map(&fd, 0).is_err());
    }
}
