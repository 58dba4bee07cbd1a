use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

use memmap2::{MmapOptions, MmapRaw};

use crate::ShmError;

/// A named POSIX shared-memory object.
///
/// The descriptor is closed when the segment is dropped. Mappings created from it stay valid
/// after that, and so does the object itself until somebody calls [`Segment::unlink`].
pub struct Segment {
    name: String,
    file: File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

/// A shared mapping of (a prefix of) a segment. Unmapped on drop.
pub struct Mapping {
    map: MmapRaw,
    protection: Protection,
}

impl Segment {
    /// Create a new object with the given size. Fails if the name is already taken.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        let segment = Self::shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, "create")?;

        if let Err(err) = segment.resize(len) {
            // Do not leave a zero-sized object behind under a name others may wait for.
            Segment::unlink_quiet(name);
            return Err(err);
        }

        Ok(segment)
    }

    /// Replace whatever object is currently published under `name` with a fresh one.
    pub fn recreate(name: &str, len: usize) -> Result<Self, ShmError> {
        Segment::unlink_stale(name);
        Segment::create(name, len)
    }

    /// Open an existing object for reading and writing.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Self::shm_open(name, libc::O_RDWR, "open")
    }

    fn shm_open(name: &str, flags: libc::c_int, op: &'static str) -> Result<Self, ShmError> {
        let c_name = c_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::mode_t) };

        if fd < 0 {
            return Err(ShmError::segment(op, name, io::Error::last_os_error()));
        }

        // Safety: `fd` is a fresh descriptor owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        Ok(Segment {
            name: name.to_owned(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current size of the object in bytes.
    pub fn len(&self) -> Result<usize, ShmError> {
        let meta = self
            .file
            .metadata()
            .map_err(|err| ShmError::segment("fstat", &self.name, err))?;

        usize::try_from(meta.len()).map_err(|_| {
            ShmError::segment(
                "fstat",
                &self.name,
                io::Error::new(io::ErrorKind::InvalidData, "size exceeds the address space"),
            )
        })
    }

    pub fn is_empty(&self) -> Result<bool, ShmError> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the object.
    pub fn resize(&self, len: usize) -> Result<(), ShmError> {
        self.file
            .set_len(len as u64)
            .map_err(|err| ShmError::segment("ftruncate", &self.name, err))
    }

    /// Map the first `len` bytes of the object.
    pub fn map(&self, len: usize, protection: Protection) -> Result<Mapping, ShmError> {
        let mut options = MmapOptions::new();
        options.len(len);

        let map = match protection {
            Protection::ReadOnly => options.map_raw_read_only(&self.file),
            Protection::ReadWrite => options.map_raw(&self.file),
        }
        .map_err(|err| ShmError::segment("mmap", &self.name, err))?;

        Ok(Mapping { map, protection })
    }

    /// Remove the name. Existing mappings and descriptors are unaffected.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        let c_name = c_name(name)?;

        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(ShmError::segment("unlink", name, io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Unlink, logging instead of failing. Returns whether a name was removed.
    pub fn unlink_quiet(name: &str) -> bool {
        match Segment::unlink(name) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "maybe no shared memory to unlink");
                false
            }
        }
    }

    /// Unlink a name that may legitimately be absent, e.g. left over from a crashed process.
    pub fn unlink_stale(name: &str) -> bool {
        match Segment::unlink(name) {
            Ok(()) => {
                tracing::debug!(name, "removed stale shared memory");
                true
            }
            Err(err) if err.is_not_found() => false,
            Err(err) => {
                tracing::warn!(%err, "could not remove stale shared memory");
                false
            }
        }
    }
}

fn c_name(name: &str) -> Result<CString, ShmError> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');

    if !valid {
        return Err(ShmError::InvalidName(name.to_owned()));
    }

    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_owned()))
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Writing through this pointer is only allowed for [`Protection::ReadWrite`] mappings.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// View the mapped bytes.
    ///
    /// # Safety
    ///
    /// No other process or thread may write to the mapping while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.map.as_ptr(), self.map.len())
    }

    /// Mutably view the mapped bytes.
    ///
    /// # Safety
    ///
    /// The mapping must be writable and nobody else may access it while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        debug_assert_eq!(self.protection, Protection::ReadWrite);
        core::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        format!("/kvshm-test-{tag}-{}-{n}", std::process::id())
    }

    #[test]
    fn create_map_open() {
        let name = unique("cmo");
        let segment = Segment::create(&name, 4096).unwrap();
        assert_eq!(segment.len().unwrap(), 4096);

        let writer = segment.map(4096, Protection::ReadWrite).unwrap();
        unsafe { writer.as_mut_slice()[..5].copy_from_slice(b"hello") };
        drop(segment);

        let other = Segment::open(&name).unwrap();
        let reader = other.map(4096, Protection::ReadOnly).unwrap();
        assert_eq!(unsafe { &reader.as_slice()[..5] }, b"hello");

        Segment::unlink(&name).unwrap();
        // Mappings outlive the name.
        assert_eq!(unsafe { &reader.as_slice()[..5] }, b"hello");
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique("excl");
        let _first = Segment::create(&name, 64).unwrap();
        let err = Segment::create(&name, 64).err().unwrap();
        assert!(err.is_already_exists(), "{err}");

        let again = Segment::recreate(&name, 128).unwrap();
        assert_eq!(again.len().unwrap(), 128);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing() {
        let err = Segment::open(&unique("missing")).err().unwrap();
        assert!(err.is_not_found(), "{err}");
        assert!(!Segment::unlink_stale(&unique("missing")));
    }

    #[test]
    fn resize() {
        let name = unique("resize");
        let segment = Segment::create(&name, 16).unwrap();
        segment.resize(8192).unwrap();
        assert_eq!(segment.len().unwrap(), 8192);
        assert!(Segment::unlink_quiet(&name));
    }

    #[test]
    fn invalid_names() {
        for name in ["", "/", "noslash", "/a/b", "/nul\0"] {
            assert!(matches!(
                Segment::open(name),
                Err(ShmError::InvalidName(_))
            ));
        }
    }
}
