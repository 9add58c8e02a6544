//! Page-aligned, mappable backing allocations

use crate::Error;

/// Size of a physical page
pub const PAGE_SIZE: usize = 0x1000;

/// An anonymous, zero-filled, page-aligned allocation that can be handed out
/// to a memory mapping. Freed exactly once on drop.
pub(crate) struct MmapBuffer {
    /// Address of the allocation
    ptr: *mut u8,

    /// Size of the allocation in bytes
    len: usize,
}

// The buffer is plain memory; all mutation after setup goes through atomic
// operations on the underlying words.
unsafe impl Send for MmapBuffer {}
unsafe impl Sync for MmapBuffer {}

impl MmapBuffer {
    /// Allocate `len` bytes of zeroed, page-aligned memory
    ///
    /// # Errors
    ///
    /// * [`Error::AllocationFailed`] if the host refuses the mapping
    pub fn new(len: usize) -> Result<Self, Error> {
        assert!(len > 0 && len % PAGE_SIZE == 0);

        // Anonymous mappings are zero-filled by the host
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::AllocationFailed(std::io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }

    /// Address of the allocation
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the allocation in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// View the allocation as bytes
    ///
    /// Concurrent writers may be racing this view; the caller gets no
    /// snapshot consistency over the contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Write a single byte at `offset`.
    ///
    /// Volatile and through a shared reference: the buffer is a mapped
    /// surface that concurrent readers may be observing.
    ///
    /// # Panics
    ///
    /// * If `offset` is out of bounds
    pub fn write_byte(&self, offset: usize, val: u8) {
        assert!(offset < self.len);
        unsafe { self.ptr.add(offset).write_volatile(val) };
    }
}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}
