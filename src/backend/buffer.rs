//! Destination buffers for copy-based capture
//!
//! Screencopy and ext-image-copy-capture need a client allocated buffer to copy into. Those are
//! either shared memory ([`ShmBuffer`]) or dmabufs ([`DmabufBuffer`]). Both wrap the `wl_buffer`
//! handed to the compositor and destroy it when dropped.
//!
//! Backends keep at most one buffer of each kind alive, enforced by [`BufferSlot`].

use std::{
    os::unix::io::{AsFd, OwnedFd},
    ptr::NonNull,
};

use drm_fourcc::DrmFourcc as Fourcc;
use rustix::{
    fs::{ftruncate, memfd_create, MemfdFlags},
    mm::{mmap, munmap, MapFlags, ProtFlags},
};
use tracing::{debug, trace};
use wayland_client::{
    protocol::{wl_buffer::WlBuffer, wl_shm, wl_shm::WlShm, wl_shm_pool::WlShmPool},
    QueueHandle,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::Flags as DmabufParamsFlags, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
};

use super::{
    dmabuf::Dmabuf,
    format::{fourcc_from_shm, format_info},
};
use crate::state::MirrorState;

/// Errors creating destination buffers
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// A buffer of this kind is still alive
    #[error("a buffer is already allocated")]
    AlreadyAllocated,
    /// Creating or mapping the shared memory failed
    #[error("shared memory allocation failed")]
    Shm(#[source] rustix::io::Errno),
    /// The requested size is empty or overflows
    #[error("invalid buffer size {width}x{height} (stride {stride})")]
    InvalidSize {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Bytes per row
        stride: u32,
    },
    /// The format cannot be used
    #[error("unsupported format {0:#x}")]
    UnsupportedFormat(u32),
}

/// Parameters of a shm destination buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmParams {
    /// `wl_shm` format
    pub format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
}

impl ShmParams {
    /// Derive the stride for a tightly packed buffer of the given shm format
    pub fn packed(format: u32, width: u32, height: u32) -> Option<ShmParams> {
        let bpp = fourcc_from_shm(format).and_then(format_info)?.bytes_per_pixel;
        Some(ShmParams {
            format,
            width,
            height,
            stride: width.checked_mul(bpp)?,
        })
    }

    fn len(&self) -> Option<usize> {
        if self.width == 0 || self.height == 0 || self.stride == 0 {
            return None;
        }
        (self.stride as usize).checked_mul(self.height as usize)
    }
}

/// A memfd mapped into our address space
#[derive(Debug)]
pub struct ShmMapping {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl ShmMapping {
    /// Create and map a new shared memory file of `len` bytes
    pub fn new(len: usize) -> Result<ShmMapping, BufferError> {
        let fd = memfd_create("smithay-mirror-shm", MemfdFlags::CLOEXEC).map_err(BufferError::Shm)?;
        ftruncate(&fd, len as u64).map_err(BufferError::Shm)?;
        // SAFETY: a fresh shared mapping of a file we own, not aliased anywhere else in our process
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(BufferError::Shm)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(BufferError::Shm(rustix::io::Errno::NOMEM))?;
        Ok(ShmMapping { fd, ptr, len })
    }

    /// Contents of the mapping
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr points to a live mapping of len bytes until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsFd for ShmMapping {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `new` with exactly this length and is not borrowed anymore
        if let Err(err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            debug!(?err, "Failed to unmap shm buffer");
        }
    }
}

/// A shm backed `wl_buffer`
#[derive(Debug)]
pub struct ShmBuffer {
    mapping: ShmMapping,
    pool: WlShmPool,
    buffer: WlBuffer,
    params: ShmParams,
}

impl ShmBuffer {
    /// Allocate a buffer matching `params`
    pub fn new(shm: &WlShm, qh: &QueueHandle<MirrorState>, params: ShmParams) -> Result<ShmBuffer, BufferError> {
        let invalid = || BufferError::InvalidSize {
            width: params.width,
            height: params.height,
            stride: params.stride,
        };
        let len = params.len().ok_or_else(invalid)?;
        let pool_size = i32::try_from(len).map_err(|_| invalid())?;
        let format =
            wl_shm::Format::try_from(params.format).map_err(|_| BufferError::UnsupportedFormat(params.format))?;

        let mapping = ShmMapping::new(len)?;
        let pool = shm.create_pool(mapping.as_fd(), pool_size, qh, ());
        let buffer = pool.create_buffer(
            0,
            params.width as i32,
            params.height as i32,
            params.stride as i32,
            format,
            qh,
            (),
        );
        trace!(?params, "Allocated shm buffer");

        Ok(ShmBuffer {
            mapping,
            pool,
            buffer,
            params,
        })
    }

    /// The `wl_buffer` to hand to the compositor
    pub fn wl_buffer(&self) -> &WlBuffer {
        &self.buffer
    }

    /// Parameters the buffer was allocated with
    pub fn params(&self) -> &ShmParams {
        &self.params
    }

    /// Pixel contents
    pub fn data(&self) -> &[u8] {
        self.mapping.as_slice()
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
        self.pool.destroy();
    }
}

/// Parameters of a dmabuf destination buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DmabufParams {
    /// Pixel format
    pub format: Fourcc,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Acceptable modifiers, empty for implicit
    pub modifiers: Vec<u64>,
}

/// A dmabuf backed `wl_buffer`
#[derive(Debug)]
pub struct DmabufBuffer {
    dmabuf: Dmabuf,
    buffer: WlBuffer,
    params: DmabufParams,
}

impl DmabufBuffer {
    /// Wrap an allocated dmabuf into a `wl_buffer`
    pub fn new(
        linux_dmabuf: &ZwpLinuxDmabufV1,
        qh: &QueueHandle<MirrorState>,
        dmabuf: Dmabuf,
        params: DmabufParams,
    ) -> DmabufBuffer {
        let modifier: u64 = dmabuf.modifier().into();
        let buffer_params = linux_dmabuf.create_params(qh, ());
        for plane in dmabuf.planes() {
            buffer_params.add(
                plane.borrow_fd(),
                plane.plane_idx,
                plane.offset,
                plane.stride,
                (modifier >> 32) as u32,
                (modifier & 0xffff_ffff) as u32,
            );
        }
        let (width, height) = dmabuf.size();
        let buffer = buffer_params.create_immed(
            width as i32,
            height as i32,
            dmabuf.format() as u32,
            DmabufParamsFlags::empty(),
            qh,
            (),
        );
        buffer_params.destroy();
        trace!(?params, "Allocated dmabuf buffer");

        DmabufBuffer { dmabuf, buffer, params }
    }

    /// The `wl_buffer` to hand to the compositor
    pub fn wl_buffer(&self) -> &WlBuffer {
        &self.buffer
    }

    /// The underlying dmabuf
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }

    /// Parameters the buffer was allocated for
    pub fn params(&self) -> &DmabufParams {
        &self.params
    }
}

impl Drop for DmabufBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

/// Holds at most one live buffer
#[derive(Debug)]
pub struct BufferSlot<T> {
    inner: Option<T>,
}

impl<T> Default for BufferSlot<T> {
    fn default() -> Self {
        BufferSlot { inner: None }
    }
}

impl<T> BufferSlot<T> {
    /// Allocate a buffer into the slot
    ///
    /// Fails with [`BufferError::AlreadyAllocated`] if the slot is occupied; the previous buffer
    /// has to be [released](BufferSlot::release) first.
    pub fn allocate(&mut self, alloc: impl FnOnce() -> Result<T, BufferError>) -> Result<&mut T, BufferError> {
        if self.inner.is_some() {
            return Err(BufferError::AlreadyAllocated);
        }
        Ok(self.inner.insert(alloc()?))
    }

    /// Drop the buffer held, if any
    pub fn release(&mut self) {
        self.inner = None;
    }

    /// The buffer held
    pub fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    /// Whether a buffer is held
    pub fn is_allocated(&self) -> bool {
        self.inner.is_some()
    }

    /// Keep the buffer only if it satisfies `keep`
    pub fn retain(&mut self, keep: impl FnOnce(&T) -> bool) {
        if self.inner.as_ref().is_some_and(|inner| !keep(inner)) {
            self.inner = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_rejects_reentry() {
        let mut slot = BufferSlot::default();
        assert_eq!(*slot.allocate(|| Ok(1)).unwrap(), 1);
        assert!(matches!(slot.allocate(|| Ok(2)), Err(BufferError::AlreadyAllocated)));
        slot.release();
        assert_eq!(*slot.allocate(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn slot_keeps_state_on_failed_allocation() {
        let mut slot = BufferSlot::<u32>::default();
        assert!(slot
            .allocate(|| Err(BufferError::UnsupportedFormat(0)))
            .is_err());
        assert!(!slot.is_allocated());
    }

    #[test]
    fn retain_drops_mismatching_buffers() {
        let mut slot = BufferSlot::default();
        slot.allocate(|| Ok(4u32)).unwrap();
        slot.retain(|size| *size == 4);
        assert!(slot.is_allocated());
        slot.retain(|size| *size == 8);
        assert!(!slot.is_allocated());
    }

    #[test]
    fn packed_shm_params() {
        let params = ShmParams::packed(1, 1920, 1080).unwrap();
        assert_eq!(params.stride, 1920 * 4);
        assert_eq!(params.len(), Some(1920 * 4 * 1080));
        assert!(ShmParams::packed(0xdead_beef, 1, 1).is_none());
        assert_eq!(
            ShmParams {
                format: 1,
                width: 0,
                height: 10,
                stride: 0
            }
            .len(),
            None
        );
    }

    #[test]
    fn shm_mapping_is_zeroed_and_sized() {
        let mapping = ShmMapping::new(4096).unwrap();
        assert_eq!(mapping.len(), 4096);
        assert!(mapping.as_slice().iter().all(|byte| *byte == 0));
    }
}
