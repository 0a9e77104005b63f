//! Shared-memory arena for zero-copy tensor transport.
//!
//! The client process creates a named POSIX shared-memory region and
//! hands the name to the emulator in HELLO; the emulator attaches
//! read-write for the lifetime of the session. Tensor payloads live in
//! the arena so only small control messages cross the socket.
//!
//! Allocation is a monotonic bump pointer: individual blocks are never
//! freed, only the whole arena is reset. The creator owns the named
//! object and unlinks it on drop; attachers only unmap.

use crate::error::{NpmError, Result};
use rustix::fs::{ftruncate, Mode};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{self, OFlags};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default allocation alignment — one cache line.
pub const SHM_ALIGN: usize = 64;

/// Per-process sequence number so several arenas (sequential sessions,
/// tests) never collide on the shm name.
static ARENA_SEQ: AtomicU64 = AtomicU64::new(0);

/// A named, mmap-backed shared-memory region with a bump allocator.
///
/// Owner/attacher roles are tracked explicitly: only the creating
/// process unlinks the named object on teardown.
pub struct ShmArena {
    name: String,
    base: NonNull<u8>,
    size: usize,
    allocated: usize,
    is_owner: bool,
}

impl std::fmt::Debug for ShmArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmArena")
            .field("name", &self.name)
            .field("base", &format_args!("{:p}", self.base))
            .field("size", &self.size)
            .field("allocated", &self.allocated)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

// SAFETY: the arena owns its mapping exclusively within this process;
// all access goes through bounds-checked methods taking &self/&mut self.
// Moving it between threads does not invalidate the mapping.
unsafe impl Send for ShmArena {}

impl ShmArena {
    /// Create a new region named `/npm-shm-<pid>-<seq>` and map it
    /// read-write.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be created, sized, or
    /// mapped (surfaced as [`NpmError::Io`] / [`NpmError::OutOfMemory`]).
    pub fn create(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(NpmError::invalid_params("shm region size must be nonzero"));
        }
        let name = format!(
            "/npm-shm-{}-{}",
            std::process::id(),
            ARENA_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let fd = shm::open(
            name.as_str(),
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(std::io::Error::from)?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm::unlink(name.as_str());
            return Err(NpmError::out_of_memory(format!(
                "cannot size shm region {name} to {size} bytes: {e}"
            )));
        }

        // SAFETY: fd was just opened and sized; size is nonzero; the
        // mapping is unmapped in Drop with the same length.
        let base = unsafe {
            match mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            ) {
                Ok(addr) => NonNull::new(addr.cast::<u8>())
                    .expect("mmap returns a non-null pointer on success"),
                Err(e) => {
                    let _ = shm::unlink(name.as_str());
                    return Err(NpmError::out_of_memory(format!(
                        "cannot map shm region {name} ({size} bytes): {e}"
                    )));
                }
            }
        };

        tracing::debug!("created shm arena {name} ({size} bytes at {base:p})");

        Ok(Self {
            name,
            base,
            size,
            allocated: 0,
            is_owner: true,
        })
    }

    /// Attach to an existing region by name, read-write.
    ///
    /// The attacher never unlinks; it only unmaps on drop.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::Io`] if the named object does not exist or
    /// cannot be mapped.
    pub fn attach(name: &str, size: usize) -> Result<Self> {
        if name.is_empty() || size == 0 {
            return Err(NpmError::invalid_params(
                "shm attach requires a name and a nonzero size",
            ));
        }

        let fd = shm::open(name, OFlags::RDWR, Mode::empty()).map_err(std::io::Error::from)?;

        // SAFETY: fd refers to an existing region at least `size` bytes
        // long (the creator sized it); unmapped in Drop with the same
        // length.
        let base = unsafe {
            let addr = mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(std::io::Error::from)?;
            NonNull::new(addr.cast::<u8>()).expect("mmap returns a non-null pointer on success")
        };

        tracing::debug!("attached shm arena {name} ({size} bytes at {base:p})");

        Ok(Self {
            name: name.to_owned(),
            base,
            size,
            allocated: 0,
            is_owner: false,
        })
    }

    /// Region name (e.g. `/npm-shm-12345-0`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total region size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Current bump-allocator high-water mark.
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    /// Whether this process created (and will unlink) the region.
    pub const fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Allocate `size` bytes with the given alignment.
    ///
    /// Allocation is total: it either returns an offset with
    /// `offset % align == 0` and `offset + size <= self.size()`, or
    /// fails without changing any state.
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidParams`] for a zero size or non-power-of-two
    /// alignment, [`NpmError::OutOfMemory`] when the region is full.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<usize> {
        if size == 0 {
            return Err(NpmError::invalid_params("zero-size shm allocation"));
        }
        if !align.is_power_of_two() {
            return Err(NpmError::invalid_params(format!(
                "shm alignment {align} is not a power of two"
            )));
        }

        let offset = (self.allocated + align - 1) & !(align - 1);
        let end = offset
            .checked_add(size)
            .ok_or_else(|| NpmError::out_of_memory("shm allocation size overflow"))?;
        if end > self.size {
            return Err(NpmError::out_of_memory(format!(
                "shm arena exhausted: need {size} bytes, {} of {} in use",
                self.allocated, self.size
            )));
        }

        self.allocated = end;
        Ok(offset)
    }

    /// Bounds-checked pointer to an offset within the region.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::InvalidParams`] if `offset` is past the end.
    pub fn ptr_at(&self, offset: usize) -> Result<NonNull<u8>> {
        if offset >= self.size {
            return Err(NpmError::invalid_params(format!(
                "shm offset {offset} out of bounds (size {})",
                self.size
            )));
        }
        // SAFETY: offset < size, so the pointer stays inside the mapping
        // and cannot wrap.
        unsafe { Ok(NonNull::new_unchecked(self.base.as_ptr().add(offset))) }
    }

    /// Bounds-checked immutable byte view.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::InvalidParams`] if the span leaves the region.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_span(offset, len)?;
        // SAFETY: span verified in-bounds; the mapping lives as long as
        // `self`, and &self prevents concurrent &mut access through the
        // arena API.
        unsafe { Ok(std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)) }
    }

    /// Bounds-checked mutable byte view.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::InvalidParams`] if the span leaves the region.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_span(offset, len)?;
        // SAFETY: span verified in-bounds; &mut self guarantees
        // exclusive access through the arena API.
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(offset),
                len,
            ))
        }
    }

    /// Reset the bump allocator to empty.
    ///
    /// Only safe to call when no outstanding offsets are referenced
    /// elsewhere; the memory content is left untouched.
    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| NpmError::invalid_params("shm span overflows"))?;
        if end > self.size {
            return Err(NpmError::invalid_params(format!(
                "shm span {offset}+{len} out of bounds (size {})",
                self.size
            )));
        }
        Ok(())
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        // SAFETY: base/size are exactly what mmap returned in
        // create()/attach(); Drop runs at most once.
        unsafe {
            if let Err(e) = munmap(self.base.as_ptr().cast(), self.size) {
                tracing::error!("munmap of {} failed during drop: {e}", self.name);
            }
        }
        if self.is_owner {
            if let Err(e) = shm::unlink(self.name.as_str()) {
                tracing::error!("shm_unlink of {} failed during drop: {e}", self.name);
            }
            tracing::debug!("destroyed shm arena {}", self.name);
        } else {
            tracing::debug!("detached shm arena {}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment_and_bounds() {
        let mut arena = ShmArena::create(4096).unwrap();
        let a = arena.alloc(10, 64).unwrap();
        assert_eq!(a % 64, 0);
        let b = arena.alloc(1, 64).unwrap();
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        let c = arena.alloc(100, 256).unwrap();
        assert_eq!(c % 256, 0);
        assert!(c + 100 <= arena.size());
    }

    #[test]
    fn alloc_exactly_fills_then_fails() {
        let mut arena = ShmArena::create(4096).unwrap();
        let off = arena.alloc(4096, 64).unwrap();
        assert_eq!(off, 0);
        assert_eq!(arena.allocated(), 4096);
        assert!(matches!(
            arena.alloc(1, 1),
            Err(NpmError::OutOfMemory { .. })
        ));
        // failure left no partial state behind
        assert_eq!(arena.allocated(), 4096);
    }

    #[test]
    fn alloc_rejects_bad_alignment() {
        let mut arena = ShmArena::create(1024).unwrap();
        assert!(matches!(
            arena.alloc(8, 3),
            Err(NpmError::InvalidParams { .. })
        ));
        assert!(matches!(
            arena.alloc(0, 64),
            Err(NpmError::InvalidParams { .. })
        ));
    }

    #[test]
    fn reset_rewinds_the_bump_pointer() {
        let mut arena = ShmArena::create(1024).unwrap();
        arena.alloc(512, 64).unwrap();
        arena.reset();
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.alloc(1024, 1).unwrap(), 0);
    }

    #[test]
    fn attacher_sees_creator_writes() {
        let mut owner = ShmArena::create(256).unwrap();
        let off = owner.alloc(4, 64).unwrap();
        owner.bytes_mut(off, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);

        let peer = ShmArena::attach(owner.name(), owner.size()).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.bytes(off, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn attach_to_missing_region_fails() {
        assert!(ShmArena::attach("/npm-shm-does-not-exist", 4096).is_err());
    }

    #[test]
    fn spans_are_bounds_checked() {
        let arena = ShmArena::create(128).unwrap();
        assert!(arena.bytes(0, 128).is_ok());
        assert!(arena.bytes(1, 128).is_err());
        assert!(arena.ptr_at(128).is_err());
    }
}
