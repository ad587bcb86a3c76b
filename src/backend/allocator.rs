//! Allocation of dmabuf destination buffers
//!
//! The dmabuf variants of the copy based backends need buffers the compositor can render into.
//! Those are allocated through a [`DmabufAllocator`]; with the `backend_gbm` feature a
//! [`GbmDmabufAllocator`] working on a DRM render node is available.

use std::fmt;

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

use super::dmabuf::Dmabuf;

/// Errors of a [`DmabufAllocator`]
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// Opening the allocation device failed
    #[error("failed to open allocation device")]
    Device(#[source] std::io::Error),
    /// The buffer object could not be created
    #[error("failed to allocate a {format:?} buffer of {width}x{height}")]
    Allocation {
        /// Requested format
        format: Fourcc,
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The buffer object could not be exported as a dmabuf
    #[error("failed to export buffer as dmabuf: {0}")]
    Export(String),
}

/// Allocates dmabufs
pub trait DmabufAllocator: fmt::Debug {
    /// Allocate a buffer of the given size and format, using one of `modifiers`
    ///
    /// An empty modifier list lets the allocator pick an implicit layout.
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Dmabuf, AllocatorError>;

    /// `dev_t` of the device buffers are allocated on, if known
    fn device(&self) -> Option<u64> {
        None
    }
}

#[cfg(feature = "backend_gbm")]
pub use self::gbm_alloc::GbmDmabufAllocator;

#[cfg(feature = "backend_gbm")]
mod gbm_alloc {
    use std::{fs::File, os::unix::io::OwnedFd, path::Path};

    use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
    use gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice};
    use tracing::{debug, instrument};

    use super::{AllocatorError, DmabufAllocator};
    use crate::backend::dmabuf::{Dmabuf, DmabufFlags};

    /// Dmabuf allocator using GBM on a DRM render node
    #[derive(Debug)]
    pub struct GbmDmabufAllocator {
        device: GbmDevice<File>,
        dev: Option<u64>,
    }

    impl GbmDmabufAllocator {
        /// Open the given render node
        pub fn open(node: &Path) -> Result<Self, AllocatorError> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(node)
                .map_err(AllocatorError::Device)?;
            let dev = rustix::fs::fstat(&file).ok().map(|stat| stat.st_rdev as u64);
            let device = GbmDevice::new(file).map_err(AllocatorError::Device)?;
            debug!(node = %node.display(), backend = ?device.backend_name(), ?dev, "Opened gbm device");
            Ok(GbmDmabufAllocator { device, dev })
        }

        fn create_bo(
            &self,
            width: u32,
            height: u32,
            format: Fourcc,
            modifiers: &[Modifier],
        ) -> std::io::Result<(BufferObject<()>, bool)> {
            let flags = BufferObjectFlags::RENDERING;
            let explicit: Vec<Modifier> = modifiers
                .iter()
                .copied()
                .filter(|modifier| *modifier != Modifier::Invalid)
                .collect();

            if !explicit.is_empty() {
                match self
                    .device
                    .create_buffer_object_with_modifiers(width, height, format, explicit.iter().copied())
                {
                    Ok(bo) => return Ok((bo, false)),
                    Err(err) if !modifiers.contains(&Modifier::Invalid) && !modifiers.contains(&Modifier::Linear) => {
                        return Err(err)
                    }
                    Err(err) => debug!(?err, "Allocation with modifiers failed, retrying implicit"),
                }
            }
            let flags = if modifiers.contains(&Modifier::Linear) && !modifiers.contains(&Modifier::Invalid) {
                flags | BufferObjectFlags::LINEAR
            } else {
                flags
            };
            self.device
                .create_buffer_object(width, height, format, flags)
                .map(|bo| (bo, true))
        }
    }

    impl DmabufAllocator for GbmDmabufAllocator {
        #[instrument(level = "trace", skip(self))]
        fn allocate(
            &mut self,
            width: u32,
            height: u32,
            format: Fourcc,
            modifiers: &[Modifier],
        ) -> Result<Dmabuf, AllocatorError> {
            let (bo, implicit) =
                self.create_bo(width, height, format, modifiers)
                    .map_err(|source| AllocatorError::Allocation {
                        format,
                        width,
                        height,
                        source,
                    })?;

            let planes = bo.plane_count() as i32;
            let mut iter = (0i32..planes).map(|i| bo.handle_for_plane(i));
            let first = iter
                .next()
                .ok_or_else(|| AllocatorError::Export("buffer without planes".into()))?;
            // check that all handles are the same
            // SAFETY: gbm handles are plain integers, reading the u64 variant is always valid
            if !iter.all(|next| unsafe { next.u64_ == first.u64_ }) {
                // GBM is lacking a function to get a FD for a given plane. Instead,
                // check all planes have the same handle.
                return Err(AllocatorError::Export("planes use different buffer objects".into()));
            }

            let modifier = if implicit { Modifier::Invalid } else { bo.modifier() };
            let mut builder = Dmabuf::builder(width, height, format, modifier, DmabufFlags::empty());
            for idx in 0..planes {
                let fd: OwnedFd = bo.fd().map_err(|err| AllocatorError::Export(err.to_string()))?;
                builder.add_plane(fd, idx as u32, bo.offset(idx), bo.stride_for_plane(idx));
            }

            builder
                .build()
                .ok_or_else(|| AllocatorError::Export("buffer without planes".into()))
        }

        fn device(&self) -> Option<u64> {
            self.dev
        }
    }
}
