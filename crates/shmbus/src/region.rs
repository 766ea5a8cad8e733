//! File-backed shared memory regions.
//!
//! A [`MappedFile`] is the storage primitive underneath the cyclic buffer: a
//! regular file mapped shared and writable, so that every process mapping the
//! same path observes the same bytes. The *initiator* creates and sizes the
//! file; attachers map whatever size the initiator left behind.

use std::fs::{File, OpenOptions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Default permission bits for freshly created regions: read/write for user,
/// group and others, so unrelated processes can attach.
pub const DEFAULT_PERMISSIONS: u32 = 0o666;

/// A shared, writable memory mapping over a regular file.
pub struct MappedFile {
    path: PathBuf,
    map: MmapMut,
    base: *mut u8,
    len: usize,
    // Keeps the descriptor alive for the lifetime of the mapping.
    _file: File,
}

// SAFETY: the mapping is plain shared memory; all concurrent access to it is
// mediated by the atomics and the process-shared lock that live inside it.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Creates (or truncates) the backing file, sizes it to exactly `size`
    /// bytes and maps it shared. The kernel page-aligns the mapping upward
    /// on its own; the file length stays exact so capacity arithmetic does.
    pub fn create(path: &Path, size: usize, permissions: Option<u32>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(size as u64)?;
        file.set_permissions(Permissions::from_mode(
            permissions.unwrap_or(DEFAULT_PERMISSIONS),
        ))?;

        Self::map(path.to_path_buf(), file, size)
    }

    /// Attaches to an existing region. Fails when the file does not exist
    /// yet; callers that race the initiator simply retry.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            return Err(Error::IllegalState);
        }

        Self::map(path.to_path_buf(), file, len)
    }

    fn map(path: PathBuf, file: File, len: usize) -> Result<Self> {
        // SAFETY: the file stays open (and the mapping valid) for as long as
        // this struct lives; the mapping is MAP_SHARED so peers see updates.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        Ok(Self {
            path,
            map,
            base,
            len,
            _file: file,
        })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is mapped. Kept for API completeness; a constructed
    /// region is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the backing file. The mapping itself stays valid until drop.
    pub fn destroy(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Read-only view of the whole mapping.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}
