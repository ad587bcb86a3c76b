//! Options controlling a mirroring session
//!
//! [`MirrorOptions`] is the only configuration surface of the library. Front-ends (like the
//! `mirror` binary) map their command line onto it and may hand an updated copy to
//! [`MirrorState::update_options`](crate::state::MirrorState::update_options) at any time.

use std::{fmt, path::PathBuf, str::FromStr};

use crate::{backend::BackendKind, target::TargetSpec, utils::Region};

/// Number of consecutive counted failures after which a backend gives up.
pub const DEFAULT_FATAL_FAIL_COUNT: u32 = 10;

/// Render node used for allocating dmabuf destination buffers, unless configured otherwise.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Which capture transport(s) to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendMode {
    /// Try every transport in preference order, falling back on failure
    #[default]
    Auto,
    /// `wlr-export-dmabuf-unstable-v1`
    ExportDmabuf,
    /// `wlr-screencopy-unstable-v1`, dmabuf destination first, shm otherwise
    Screencopy,
    /// `wlr-screencopy-unstable-v1` into shm buffers
    ScreencopyShm,
    /// `wlr-screencopy-unstable-v1` into dmabufs
    ScreencopyDmabuf,
    /// `ext-image-copy-capture-v1`, dmabuf destination first, shm otherwise
    ExtCopy,
    /// `ext-image-copy-capture-v1` into shm buffers
    ExtCopyShm,
    /// `ext-image-copy-capture-v1` into dmabufs
    ExtCopyDmabuf,
    /// `org.freedesktop.portal.ScreenCast`
    XdgPortal,
}

impl BackendMode {
    /// Initializers to attempt for this mode, in order of preference
    pub fn candidates(&self) -> &'static [BackendKind] {
        match self {
            BackendMode::Auto => &[
                BackendKind::ExtCopyDmabuf,
                BackendKind::ExtCopyShm,
                BackendKind::ScreencopyDmabuf,
                BackendKind::ScreencopyShm,
                BackendKind::ExportDmabuf,
                BackendKind::XdgPortal,
            ],
            BackendMode::ExportDmabuf => &[BackendKind::ExportDmabuf],
            BackendMode::Screencopy => &[BackendKind::ScreencopyDmabuf, BackendKind::ScreencopyShm],
            BackendMode::ScreencopyShm => &[BackendKind::ScreencopyShm],
            BackendMode::ScreencopyDmabuf => &[BackendKind::ScreencopyDmabuf],
            BackendMode::ExtCopy => &[BackendKind::ExtCopyDmabuf, BackendKind::ExtCopyShm],
            BackendMode::ExtCopyShm => &[BackendKind::ExtCopyShm],
            BackendMode::ExtCopyDmabuf => &[BackendKind::ExtCopyDmabuf],
            BackendMode::XdgPortal => &[BackendKind::XdgPortal],
        }
    }

    /// Whether an active backend exhausting its failure budget may be replaced by the next candidate
    pub fn allows_fallback(&self) -> bool {
        *self == BackendMode::Auto
    }

    fn name(&self) -> &'static str {
        match self {
            BackendMode::Auto => "auto",
            BackendMode::ExportDmabuf => "export-dmabuf",
            BackendMode::Screencopy => "screencopy",
            BackendMode::ScreencopyShm => "screencopy-shm",
            BackendMode::ScreencopyDmabuf => "screencopy-dmabuf",
            BackendMode::ExtCopy => "extcopy",
            BackendMode::ExtCopyShm => "extcopy-shm",
            BackendMode::ExtCopyDmabuf => "extcopy-dmabuf",
            BackendMode::XdgPortal => "xdg-portal",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned for an unknown backend name
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown backend `{0}`")]
pub struct UnknownBackendMode(pub String);

impl FromStr for BackendMode {
    type Err = UnknownBackendMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => BackendMode::Auto,
            "dmabuf" | "export-dmabuf" => BackendMode::ExportDmabuf,
            "screencopy" => BackendMode::Screencopy,
            "screencopy-shm" => BackendMode::ScreencopyShm,
            "screencopy-dmabuf" => BackendMode::ScreencopyDmabuf,
            "extcopy" => BackendMode::ExtCopy,
            "extcopy-shm" => BackendMode::ExtCopyShm,
            "extcopy-dmabuf" => BackendMode::ExtCopyDmabuf,
            "xdg-portal" | "portal" => BackendMode::XdgPortal,
            other => return Err(UnknownBackendMode(other.to_owned())),
        })
    }
}

/// Options of a mirroring session
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorOptions {
    /// What to mirror
    pub target: TargetSpec,
    /// Which transport(s) to capture with
    pub backend: BackendMode,
    /// Whether the cursor is painted into captured frames
    pub show_cursor: bool,
    /// Restrict mirroring to a sub-area of the target
    pub region: Option<Region>,
    /// Consecutive counted failures after which a backend is abandoned
    pub fatal_fail_count: u32,
    /// Device used to allocate dmabuf destination buffers
    pub render_node: PathBuf,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            target: TargetSpec::Null,
            backend: BackendMode::Auto,
            show_cursor: true,
            region: None,
            fatal_fail_count: DEFAULT_FATAL_FAIL_COUNT,
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_round_trip_through_display() {
        for mode in [
            BackendMode::Auto,
            BackendMode::ExportDmabuf,
            BackendMode::Screencopy,
            BackendMode::ScreencopyShm,
            BackendMode::ScreencopyDmabuf,
            BackendMode::ExtCopy,
            BackendMode::ExtCopyShm,
            BackendMode::ExtCopyDmabuf,
            BackendMode::XdgPortal,
        ] {
            assert_eq!(mode.to_string().parse::<BackendMode>(), Ok(mode));
        }
        assert_eq!("dmabuf".parse::<BackendMode>(), Ok(BackendMode::ExportDmabuf));
        assert!("vnc".parse::<BackendMode>().is_err());
    }

    #[test]
    fn only_auto_falls_back() {
        assert!(BackendMode::Auto.allows_fallback());
        assert!(!BackendMode::Screencopy.allows_fallback());
        assert!(!BackendMode::ExtCopyShm.allows_fallback());
    }

    #[test]
    fn explicit_modes_never_leave_their_transport() {
        assert!(BackendMode::Screencopy
            .candidates()
            .iter()
            .all(|kind| matches!(kind, BackendKind::ScreencopyDmabuf | BackendKind::ScreencopyShm)));
        assert_eq!(BackendMode::XdgPortal.candidates(), &[BackendKind::XdgPortal]);
    }

    #[test]
    fn default_threshold_is_ten() {
        assert_eq!(MirrorOptions::default().fatal_fail_count, 10);
    }
}
