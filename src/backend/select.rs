//! Backend selection and fallback
//!
//! A [`BackendSelector`] walks the candidates of a [`BackendMode`] in preference order. Candidates
//! whose compositor capabilities are missing are skipped without being constructed; the first
//! candidate constructing successfully is used. When that backend is later abandoned,
//! [`BackendSelector::select`] continues with the remaining candidates, but only in
//! [`BackendMode::Auto`]: an explicitly requested transport is never replaced by another one.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use super::{BackendError, BackendKind};
use crate::{config::BackendMode, wayland::registry::Globals};

/// What kind of target a backend is selected for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetClass {
    /// Nothing is captured
    Null,
    /// A whole output
    Output,
    /// A single toplevel
    Toplevel,
}

/// Capabilities available for capturing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `wl_shm`
    pub shm: bool,
    /// `zwp_linux_dmabuf_v1`
    pub linux_dmabuf: bool,
    /// `zwlr_export_dmabuf_manager_v1`
    pub export_dmabuf: bool,
    /// `zwlr_screencopy_manager_v1`
    pub screencopy: bool,
    /// `ext_image_copy_capture_manager_v1`
    pub image_copy_capture: bool,
    /// `ext_output_image_capture_source_manager_v1`
    pub output_source: bool,
    /// `ext_foreign_toplevel_image_capture_source_manager_v1`
    pub toplevel_source: bool,
    /// A dmabuf allocator is available
    pub allocator: bool,
    /// A media transport for the portal is available
    pub media_transport: bool,
}

impl Capabilities {
    /// Collect the capabilities from the bound globals and the local facilities
    pub fn new(globals: &Globals, allocator: bool, media_transport: bool) -> Capabilities {
        Capabilities {
            shm: globals.shm.is_some(),
            linux_dmabuf: globals.linux_dmabuf.is_some(),
            export_dmabuf: globals.export_dmabuf_manager.is_some(),
            screencopy: globals.screencopy_manager.is_some(),
            image_copy_capture: globals.image_copy_capture_manager.is_some(),
            output_source: globals.output_source_manager.is_some(),
            toplevel_source: globals.toplevel_source_manager.is_some(),
            allocator,
            media_transport,
        }
    }

    /// Whether a backend of `kind` could possibly capture a target of `class`
    pub fn supports(&self, kind: BackendKind, class: TargetClass) -> bool {
        let dmabuf_destination = self.linux_dmabuf && self.allocator;
        let ext_source = match class {
            TargetClass::Output => self.output_source,
            TargetClass::Toplevel => self.toplevel_source,
            TargetClass::Null => false,
        };
        match kind {
            BackendKind::ExportDmabuf => self.export_dmabuf && class == TargetClass::Output,
            BackendKind::ScreencopyShm => self.screencopy && self.shm && class == TargetClass::Output,
            BackendKind::ScreencopyDmabuf => {
                self.screencopy && dmabuf_destination && class == TargetClass::Output
            }
            BackendKind::ExtCopyShm => self.image_copy_capture && self.shm && ext_source,
            BackendKind::ExtCopyDmabuf => self.image_copy_capture && dmabuf_destination && ext_source,
            BackendKind::XdgPortal => self.media_transport && class != TargetClass::Null,
        }
    }
}

/// Errors selecting a backend
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// No candidate is left
    #[error("no usable capture backend left for mode {0}")]
    Exhausted(BackendMode),
}

/// Preference ordered walk over the candidates of a [`BackendMode`]
#[derive(Debug, Clone)]
pub struct BackendSelector {
    mode: BackendMode,
    remaining: VecDeque<BackendKind>,
    tried: Vec<BackendKind>,
}

impl BackendSelector {
    /// Start a fresh walk over the candidates of `mode`
    pub fn new(mode: BackendMode) -> BackendSelector {
        BackendSelector {
            mode,
            remaining: mode.candidates().iter().copied().collect(),
            tried: Vec::new(),
        }
    }

    /// The mode candidates are taken from
    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Candidates not tried yet
    pub fn remaining(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.remaining.iter().copied()
    }

    /// Candidates construction was attempted for, in order
    pub fn tried(&self) -> &[BackendKind] {
        &self.tried
    }

    /// Construct the first usable candidate
    ///
    /// `init` is only called for candidates `caps` supports. Candidates are consumed, so a
    /// subsequent call continues after the last one returned.
    pub fn select<B>(
        &mut self,
        caps: &Capabilities,
        class: TargetClass,
        mut init: impl FnMut(BackendKind) -> Result<B, BackendError>,
    ) -> Result<B, SelectError> {
        while let Some(kind) = self.remaining.pop_front() {
            if !caps.supports(kind, class) {
                debug!(backend = %kind, "Skipping backend, capability missing");
                continue;
            }
            self.tried.push(kind);
            match init(kind) {
                Ok(backend) => {
                    info!(backend = %kind, "Using capture backend");
                    return Ok(backend);
                }
                Err(err) => warn!(backend = %kind, %err, "Failed to initialize backend"),
            }
        }
        Err(SelectError::Exhausted(self.mode))
    }

    /// Continue after the active backend was abandoned
    ///
    /// Only [`BackendMode::Auto`] falls back; otherwise this reports exhaustion right away.
    pub fn fallback<B>(
        &mut self,
        caps: &Capabilities,
        class: TargetClass,
        init: impl FnMut(BackendKind) -> Result<B, BackendError>,
    ) -> Result<B, SelectError> {
        if !self.mode.allows_fallback() {
            self.remaining.clear();
            return Err(SelectError::Exhausted(self.mode));
        }
        self.select(caps, class, init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            shm: true,
            ..Capabilities::default()
        }
    }

    #[test]
    fn missing_capabilities_are_never_attempted() {
        let caps = Capabilities {
            screencopy: true,
            ..caps()
        };
        let mut selector = BackendSelector::new(BackendMode::Auto);
        let mut attempted = Vec::new();
        let chosen = selector
            .select(&caps, TargetClass::Output, |kind| {
                attempted.push(kind);
                Ok(kind)
            })
            .unwrap();
        assert_eq!(chosen, BackendKind::ScreencopyShm);
        assert_eq!(attempted, vec![BackendKind::ScreencopyShm]);
    }

    #[test]
    fn failing_candidates_fall_through() {
        let caps = Capabilities {
            screencopy: true,
            export_dmabuf: true,
            ..caps()
        };
        let mut selector = BackendSelector::new(BackendMode::Auto);
        let chosen = selector.select(&caps, TargetClass::Output, |kind| match kind {
            BackendKind::ScreencopyShm => Err(BackendError::Setup("nope".into())),
            kind => Ok(kind),
        });
        assert_eq!(chosen.unwrap(), BackendKind::ExportDmabuf);
        assert_eq!(
            selector.tried(),
            &[BackendKind::ScreencopyShm, BackendKind::ExportDmabuf]
        );
    }

    #[test]
    fn fallback_continues_after_the_abandoned_backend() {
        let caps = Capabilities {
            screencopy: true,
            export_dmabuf: true,
            ..caps()
        };
        let mut selector = BackendSelector::new(BackendMode::Auto);
        let first = selector.select(&caps, TargetClass::Output, Ok).unwrap();
        let second = selector.fallback(&caps, TargetClass::Output, Ok).unwrap();
        assert_eq!((first, second), (BackendKind::ScreencopyShm, BackendKind::ExportDmabuf));
        assert!(matches!(
            selector.fallback(&caps, TargetClass::Output, Ok::<_, BackendError>),
            Err(SelectError::Exhausted(BackendMode::Auto))
        ));
    }

    #[test]
    fn explicit_mode_never_falls_back() {
        let caps = Capabilities {
            screencopy: true,
            export_dmabuf: true,
            ..caps()
        };
        let mut selector = BackendSelector::new(BackendMode::Screencopy);
        assert_eq!(
            selector.select(&caps, TargetClass::Output, Ok).unwrap(),
            BackendKind::ScreencopyShm
        );
        assert!(selector
            .fallback(&caps, TargetClass::Output, Ok::<_, BackendError>)
            .is_err());
    }

    #[test]
    fn toplevels_need_ext_sources_or_the_portal() {
        let caps = Capabilities {
            screencopy: true,
            export_dmabuf: true,
            image_copy_capture: true,
            output_source: true,
            ..caps()
        };
        assert!(!caps.supports(BackendKind::ScreencopyShm, TargetClass::Toplevel));
        assert!(!caps.supports(BackendKind::ExtCopyShm, TargetClass::Toplevel));
        assert!(caps.supports(BackendKind::ExtCopyShm, TargetClass::Output));
        let caps = Capabilities {
            toplevel_source: true,
            ..caps
        };
        assert!(caps.supports(BackendKind::ExtCopyShm, TargetClass::Toplevel));
    }

    #[test]
    fn dmabuf_variants_need_an_allocator() {
        let caps = Capabilities {
            screencopy: true,
            linux_dmabuf: true,
            ..caps()
        };
        assert!(!caps.supports(BackendKind::ScreencopyDmabuf, TargetClass::Output));
        let caps = Capabilities {
            allocator: true,
            ..caps
        };
        assert!(caps.supports(BackendKind::ScreencopyDmabuf, TargetClass::Output));
    }

    #[test]
    fn nothing_supported_is_exhaustion() {
        let mut selector = BackendSelector::new(BackendMode::Auto);
        assert!(matches!(
            selector.select(&Capabilities::default(), TargetClass::Output, Ok::<_, BackendError>),
            Err(SelectError::Exhausted(BackendMode::Auto))
        ));
    }
}
