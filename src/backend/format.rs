//! Pixel format mapping
//!
//! Frames arrive tagged with one of three format namespaces: `wl_shm` formats (screencopy,
//! ext-image-copy-capture shm), DRM fourccs (dmabufs) and SPA video formats (PipeWire streams of the
//! portal). They are all mapped onto [`Fourcc`] through a single table.

use drm_fourcc::DrmFourcc as Fourcc;

/// `WL_SHM_FORMAT_ARGB8888`, the only shm format not equal to its fourcc (besides XRGB8888)
pub const WL_SHM_ARGB8888: u32 = 0;
/// `WL_SHM_FORMAT_XRGB8888`
pub const WL_SHM_XRGB8888: u32 = 1;

/// Known properties of a supported pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// DRM fourcc
    pub fourcc: Fourcc,
    /// SPA video format, for formats PipeWire can describe
    pub spa: Option<u32>,
    /// Bytes per pixel of the single plane
    pub bytes_per_pixel: u32,
    /// Whether the alpha channel is meaningful
    pub has_alpha: bool,
}

const fn info(fourcc: Fourcc, spa: Option<u32>, bytes_per_pixel: u32, has_alpha: bool) -> FormatInfo {
    FormatInfo {
        fourcc,
        spa,
        bytes_per_pixel,
        has_alpha,
    }
}

// SPA_VIDEO_FORMAT_* values
const SPA_RGBX: u32 = 7;
const SPA_BGRX: u32 = 8;
const SPA_XRGB: u32 = 9;
const SPA_XBGR: u32 = 10;
const SPA_RGBA: u32 = 11;
const SPA_BGRA: u32 = 12;
const SPA_ARGB: u32 = 13;
const SPA_ABGR: u32 = 14;
const SPA_RGB: u32 = 15;
const SPA_BGR: u32 = 16;

/// Every format frames can be imported in.
///
/// SPA names byte order in memory while DRM names a little-endian word, hence the inversion.
pub static FORMATS: &[FormatInfo] = &[
    info(Fourcc::Argb8888, Some(SPA_BGRA), 4, true),
    info(Fourcc::Xrgb8888, Some(SPA_BGRX), 4, false),
    info(Fourcc::Abgr8888, Some(SPA_RGBA), 4, true),
    info(Fourcc::Xbgr8888, Some(SPA_RGBX), 4, false),
    info(Fourcc::Bgra8888, Some(SPA_ARGB), 4, true),
    info(Fourcc::Bgrx8888, Some(SPA_XRGB), 4, false),
    info(Fourcc::Rgba8888, Some(SPA_ABGR), 4, true),
    info(Fourcc::Rgbx8888, Some(SPA_XBGR), 4, false),
    info(Fourcc::Bgr888, Some(SPA_RGB), 3, false),
    info(Fourcc::Rgb888, Some(SPA_BGR), 3, false),
    info(Fourcc::Argb2101010, None, 4, true),
    info(Fourcc::Xrgb2101010, None, 4, false),
    info(Fourcc::Abgr2101010, None, 4, true),
    info(Fourcc::Xbgr2101010, None, 4, false),
    info(Fourcc::Rgb565, None, 2, false),
];

/// Look up a fourcc
pub fn format_info(fourcc: Fourcc) -> Option<&'static FormatInfo> {
    FORMATS.iter().find(|info| info.fourcc == fourcc)
}

/// Look up a raw fourcc code
pub fn format_info_raw(code: u32) -> Option<&'static FormatInfo> {
    Fourcc::try_from(code).ok().and_then(format_info)
}

/// Map a `wl_shm` format onto its fourcc
pub fn fourcc_from_shm(format: u32) -> Option<Fourcc> {
    let code = match format {
        WL_SHM_ARGB8888 => Fourcc::Argb8888 as u32,
        WL_SHM_XRGB8888 => Fourcc::Xrgb8888 as u32,
        code => code,
    };
    format_info_raw(code).map(|info| info.fourcc)
}

/// Map a fourcc onto its `wl_shm` format
pub fn shm_from_fourcc(fourcc: Fourcc) -> u32 {
    match fourcc {
        Fourcc::Argb8888 => WL_SHM_ARGB8888,
        Fourcc::Xrgb8888 => WL_SHM_XRGB8888,
        other => other as u32,
    }
}

/// Map an SPA video format onto its fourcc
pub fn fourcc_from_spa(format: u32) -> Option<Fourcc> {
    FORMATS
        .iter()
        .find(|info| info.spa == Some(format))
        .map(|info| info.fourcc)
}

/// Map a fourcc onto its SPA video format
pub fn spa_from_fourcc(fourcc: Fourcc) -> Option<u32> {
    format_info(fourcc).and_then(|info| info.spa)
}
