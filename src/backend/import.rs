//! The GPU boundary
//!
//! Captured frames leave the backends through a [`TextureImporter`], which turns them into a
//! texture ready for presentation. The importer is provided by the embedder (the renderer of the
//! mirror window); importing failures are treated by the backends exactly like a cancelled frame.

use std::fmt;

use drm_fourcc::DrmFourcc as Fourcc;

use super::dmabuf::Dmabuf;
use crate::utils::Transform;

/// Errors importing a frame
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The pixel format cannot be imported
    #[error("unsupported format {0:?}")]
    UnsupportedFormat(Fourcc),
    /// The importer failed
    #[error("texture import failed: {0}")]
    Failed(String),
}

/// How a frame has to be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportParams {
    /// The frame is stored bottom-up
    pub invert_y: bool,
    /// The frame only contains the configured capture region instead of the whole target
    pub region_aware: bool,
    /// Transform needed to present the frame upright
    pub transform: Transform,
}

/// A frame in CPU accessible memory
#[derive(Debug, Clone, Copy)]
pub struct ShmFrame<'a> {
    /// Pixel contents, `stride * height` bytes
    pub data: &'a [u8],
    /// Pixel format
    pub format: Fourcc,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
}

/// Turns captured frames into textures
pub trait TextureImporter: fmt::Debug {
    /// Import a frame from mapped memory
    fn import_shm(&mut self, frame: &ShmFrame<'_>, params: &ImportParams) -> Result<(), ImportError>;

    /// Import a dmabuf
    fn import_dmabuf(&mut self, dmabuf: &Dmabuf, params: &ImportParams) -> Result<(), ImportError>;
}

/// An importer dropping every frame, useful when only the capture path is of interest
#[derive(Debug, Default, Clone, Copy)]
pub struct NullImporter;

impl TextureImporter for NullImporter {
    fn import_shm(&mut self, _frame: &ShmFrame<'_>, _params: &ImportParams) -> Result<(), ImportError> {
        Ok(())
    }

    fn import_dmabuf(&mut self, _dmabuf: &Dmabuf, _params: &ImportParams) -> Result<(), ImportError> {
        Ok(())
    }
}
