//! Module for [dmabuf](https://01.org/linuxgraphics/gfx-docs/drm/driver-api/dma-buf.html) buffers.
//!
//! A [`Dmabuf`] owns the file descriptors of its planes. Dropping it closes every one of them
//! exactly once, whichever path (import, cancellation, protocol error) the frame took.
//!
//! `Dmabuf` is generic over the descriptor type so the ownership rules can be exercised in tests
//! without real file descriptors; everywhere else it is used with [`OwnedFd`].

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Possible flags for a DMA buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is Y-inverted
        const Y_INVERT = 1;
        /// The buffer content is interlaced
        const INTERLACED = 2;
        /// The buffer content if interlaced is bottom-field first
        const BOTTOM_FIRST = 4;
    }
}

/// A single plane of a [`Dmabuf`]
#[derive(Debug)]
pub struct Plane<F = OwnedFd> {
    fd: F,
    /// The plane index
    pub plane_idx: u32,
    /// Offset from the start of the Fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
}

impl<F> Plane<F> {
    /// File descriptor of this plane
    pub fn fd(&self) -> &F {
        &self.fd
    }
}

impl Plane<OwnedFd> {
    /// Borrow the file descriptor of this plane
    pub fn borrow_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A dmabuf with up to [`MAX_PLANES`] planes
#[derive(Debug)]
pub struct Dmabuf<F = OwnedFd> {
    planes: Vec<Plane<F>>,
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    flags: DmabufFlags,
}

impl<F> Dmabuf<F> {
    /// Create a new Dmabuf builder
    pub fn builder(width: u32, height: u32, format: Fourcc, modifier: Modifier, flags: DmabufFlags) -> DmabufBuilder<F> {
        DmabufBuilder {
            internal: Dmabuf {
                planes: Vec::with_capacity(MAX_PLANES),
                width,
                height,
                format,
                modifier,
                flags,
            },
        }
    }

    /// The amount of planes this Dmabuf has
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Planes of this buffer, sorted by plane index
    pub fn planes(&self) -> &[Plane<F>] {
        &self.planes
    }

    /// Size of the buffer in pixels
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel format
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Format modifier shared by all planes
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Flags of the buffer
    pub fn flags(&self) -> DmabufFlags {
        self.flags
    }

    /// Returns if this buffer format has any vendor-specific modifiers set or is implicit/linear
    pub fn has_modifier(&self) -> bool {
        self.modifier != Modifier::Invalid && self.modifier != Modifier::Linear
    }
}

/// Builder for Dmabufs
#[derive(Debug)]
pub struct DmabufBuilder<F = OwnedFd> {
    internal: Dmabuf<F>,
}

impl<F> DmabufBuilder<F> {
    /// Add a plane to the constructed Dmabuf
    ///
    /// *Note*: Each Dmabuf needs at least one plane.
    /// MAX_PLANES notes the maximum amount of planes any format may use with this implementation.
    /// If the limit is reached the plane is rejected and its descriptor closed.
    pub fn add_plane(&mut self, fd: F, idx: u32, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane {
            fd,
            plane_idx: idx,
            offset,
            stride,
        });

        true
    }

    /// Number of planes added so far
    pub fn num_planes(&self) -> usize {
        self.internal.planes.len()
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(mut self) -> Option<Dmabuf<F>> {
        if self.internal.planes.is_empty() {
            return None;
        }

        self.internal.planes.sort_by_key(|plane| plane.plane_idx);
        Some(self.internal)
    }
}
