//! Capture backends
//!
//! A capture backend obtains one frame at a time from the compositor through one specific
//! transport and hands it to the [`TextureImporter`](import::TextureImporter). The supported
//! transports are:
//!
//! - [`export_dmabuf`]: `wlr-export-dmabuf-unstable-v1`, the compositor pushes its own dmabufs
//! - [`screencopy`]: `wlr-screencopy-unstable-v1`, the compositor copies into a client buffer
//! - [`ext_copy`]: `ext-image-copy-capture-v1`, like screencopy with a long-lived session
//! - [`portal`]: the `org.freedesktop.portal.ScreenCast` DBus interface plus a media stream
//!
//! Each transport is split into a sans-IO state machine, only consuming typed events and returning
//! steps, and a backend type forwarding protocol objects to it. The machines enforce the exact
//! transition tables of their protocols: any event arriving in a state not expecting it cancels the
//! current frame and counts as a failure.
//!
//! Failures are tracked by a [`FailCounter`]. A successfully imported frame resets it, benign
//! cancellations (the compositor asking for a recapture after a resize, for example) are not
//! counted. Once the counter reaches its threshold the backend is abandoned by the
//! [`Mirror`](crate::mirror::Mirror), which may fall back to another one, see [`select`].

use std::fmt;

use calloop::LoopHandle;
use wayland_client::QueueHandle;

use crate::{
    config::MirrorOptions, state::MirrorState, target::CaptureTarget, wayland::registry::Globals,
};

pub mod allocator;
pub mod buffer;
pub mod dmabuf;
pub mod export_dmabuf;
pub mod ext_copy;
pub mod format;
pub mod import;
pub mod portal;
pub mod screencopy;
pub mod select;

use self::{
    allocator::DmabufAllocator, export_dmabuf::ExportDmabufBackend, ext_copy::ExtCopyBackend,
    import::TextureImporter, portal::{MediaTransport, PortalBackend}, screencopy::ScreencopyBackend,
    select::TargetClass,
};

/// The concrete capture transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// `wlr-export-dmabuf-unstable-v1`
    ExportDmabuf,
    /// `wlr-screencopy-unstable-v1` into shm buffers
    ScreencopyShm,
    /// `wlr-screencopy-unstable-v1` into dmabufs
    ScreencopyDmabuf,
    /// `ext-image-copy-capture-v1` into shm buffers
    ExtCopyShm,
    /// `ext-image-copy-capture-v1` into dmabufs
    ExtCopyDmabuf,
    /// The ScreenCast desktop portal
    XdgPortal,
}

impl BackendKind {
    /// Whether the destination buffer is a dmabuf allocated by us
    pub fn allocates_dmabufs(&self) -> bool {
        matches!(self, BackendKind::ScreencopyDmabuf | BackendKind::ExtCopyDmabuf)
    }

    /// Whether this kind of backend, capturing a target of `class`, depends on the given
    /// compositor interface
    pub fn uses_interface(&self, interface: &str, class: TargetClass) -> bool {
        let dmabuf = self.allocates_dmabufs() && interface == "zwp_linux_dmabuf_v1";
        let source_manager = match class {
            TargetClass::Output => "ext_output_image_capture_source_manager_v1",
            TargetClass::Toplevel => "ext_foreign_toplevel_image_capture_source_manager_v1",
            TargetClass::Null => "",
        };
        dmabuf
            || match self {
                BackendKind::ExportDmabuf => interface == "zwlr_export_dmabuf_manager_v1",
                BackendKind::ScreencopyShm | BackendKind::ScreencopyDmabuf => {
                    interface == "zwlr_screencopy_manager_v1"
                }
                BackendKind::ExtCopyShm | BackendKind::ExtCopyDmabuf => {
                    interface == "ext_image_copy_capture_manager_v1" || interface == source_manager
                }
                BackendKind::XdgPortal => false,
            }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::ExportDmabuf => "export-dmabuf",
            BackendKind::ScreencopyShm => "screencopy-shm",
            BackendKind::ScreencopyDmabuf => "screencopy-dmabuf",
            BackendKind::ExtCopyShm => "extcopy-shm",
            BackendKind::ExtCopyDmabuf => "extcopy-dmabuf",
            BackendKind::XdgPortal => "xdg-portal",
        })
    }
}

/// Why a frame attempt ended without an imported frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Expected steady-state condition, like a resize; a recapture is all that is needed
    Benign,
    /// The compositor reported the frame as failed or permanently canceled
    Failed,
    /// An event arrived that the current state does not expect, or carried invalid values
    ProtocolViolation,
    /// The destination buffer could not be allocated
    Allocation,
    /// The frame could not be imported as a texture
    Import,
}

impl CancelReason {
    /// Whether this cancellation counts against the failure budget
    pub fn is_counted(&self) -> bool {
        !matches!(self, CancelReason::Benign)
    }
}

/// Consecutive failure tracking of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailCounter {
    count: u32,
    threshold: u32,
}

impl FailCounter {
    /// Create a counter giving up after `threshold` consecutive counted failures
    pub fn new(threshold: u32) -> FailCounter {
        FailCounter { count: 0, threshold }
    }

    /// Record a cancelled frame, returns whether it was counted
    pub fn record(&mut self, reason: CancelReason) -> bool {
        if reason.is_counted() {
            self.count = self.count.saturating_add(1);
        }
        reason.is_counted()
    }

    /// Record a successfully imported frame
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Current number of consecutive counted failures
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Mark the backend as failed regardless of the current streak
    pub fn give_up(&mut self) {
        self.count = self.count.max(self.threshold);
    }

    /// Whether the threshold was reached
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.threshold
    }
}

/// Errors constructing a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A compositor interface (or local facility) the backend needs is missing
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    /// The backend cannot capture this kind of target
    #[error("backend cannot capture this target")]
    UnsupportedTarget,
    /// Setting up the backend failed
    #[error("backend setup failed: {0}")]
    Setup(String),
}

/// Everything a backend may touch while running
///
/// Borrowed from [`MirrorState`] for the duration of a single call.
pub struct CaptureContext<'a> {
    /// Queue new protocol objects are created on
    pub qh: &'a QueueHandle<MirrorState>,
    /// Bound compositor globals
    pub globals: &'a Globals,
    /// Handle to the event loop, for backends with their own event sources
    pub loop_handle: &'a LoopHandle<'static, MirrorState>,
    /// What is captured
    pub target: &'a mut CaptureTarget,
    /// Current options
    pub options: &'a MirrorOptions,
    /// Consumer of captured frames
    pub importer: &'a mut dyn TextureImporter,
    /// Allocator for dmabuf destination buffers
    pub allocator: &'a mut Option<Box<dyn DmabufAllocator>>,
    /// Media stream consumer of the portal backend
    pub transport: &'a mut Option<Box<dyn MediaTransport>>,
}

impl fmt::Debug for CaptureContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureContext")
            .field("target", &self.target)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Common interface of all capture backends
pub trait CaptureBackend {
    /// Which transport this is
    fn kind(&self) -> BackendKind;

    /// Request the next frame
    ///
    /// Never blocks: either starts the next asynchronous step or does nothing if one is in flight.
    fn capture(&mut self, ctx: &mut CaptureContext<'_>);

    /// Release every protocol object and buffer held by the backend
    fn cleanup(&mut self, ctx: &mut CaptureContext<'_>);

    /// Options changed without changing the target or the backend mode
    ///
    /// Returns `true` if the backend adapted itself, `false` if it has to be recreated.
    fn on_options_updated(&mut self, ctx: &mut CaptureContext<'_>) -> bool {
        let _ = ctx;
        false
    }

    /// Failure tracking of this backend
    fn fail_count(&self) -> &FailCounter;
}

/// The closed set of capture backends
#[derive(Debug)]
pub enum Backend {
    /// `wlr-export-dmabuf-unstable-v1`
    ExportDmabuf(ExportDmabufBackend),
    /// `wlr-screencopy-unstable-v1`
    Screencopy(ScreencopyBackend),
    /// `ext-image-copy-capture-v1`
    ExtCopy(ExtCopyBackend),
    /// ScreenCast portal
    Portal(PortalBackend),
    #[cfg(test)]
    Fake(tests::FakeBackend),
}

impl Backend {
    /// Construct the backend of the given kind
    pub fn new(kind: BackendKind, ctx: &mut CaptureContext<'_>) -> Result<Backend, BackendError> {
        match kind {
            BackendKind::ExportDmabuf => ExportDmabufBackend::new(ctx).map(Backend::ExportDmabuf),
            BackendKind::ScreencopyShm | BackendKind::ScreencopyDmabuf => {
                ScreencopyBackend::new(kind, ctx).map(Backend::Screencopy)
            }
            BackendKind::ExtCopyShm | BackendKind::ExtCopyDmabuf => {
                ExtCopyBackend::new(kind, ctx).map(Backend::ExtCopy)
            }
            BackendKind::XdgPortal => PortalBackend::new(ctx).map(Backend::Portal),
        }
    }

    fn inner(&mut self) -> &mut dyn CaptureBackend {
        match self {
            Backend::ExportDmabuf(backend) => backend,
            Backend::Screencopy(backend) => backend,
            Backend::ExtCopy(backend) => backend,
            Backend::Portal(backend) => backend,
            #[cfg(test)]
            Backend::Fake(backend) => backend,
        }
    }

    fn inner_ref(&self) -> &dyn CaptureBackend {
        match self {
            Backend::ExportDmabuf(backend) => backend,
            Backend::Screencopy(backend) => backend,
            Backend::ExtCopy(backend) => backend,
            Backend::Portal(backend) => backend,
            #[cfg(test)]
            Backend::Fake(backend) => backend,
        }
    }
}

impl CaptureBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner_ref().kind()
    }

    fn capture(&mut self, ctx: &mut CaptureContext<'_>) {
        self.inner().capture(ctx)
    }

    fn cleanup(&mut self, ctx: &mut CaptureContext<'_>) {
        self.inner().cleanup(ctx)
    }

    fn on_options_updated(&mut self, ctx: &mut CaptureContext<'_>) -> bool {
        self.inner().on_options_updated(ctx)
    }

    fn fail_count(&self) -> &FailCounter {
        self.inner_ref().fail_count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;

    use super::{
        Backend, BackendError, BackendKind, CancelReason, CaptureBackend, CaptureContext, FailCounter,
        TargetClass,
    };

    thread_local! {
        static CALLS: RefCell<Vec<(BackendKind, &'static str)>> = RefCell::new(Vec::new());
        static BROKEN: RefCell<Vec<BackendKind>> = RefCell::new(Vec::new());
    }

    fn record(kind: BackendKind, call: &'static str) {
        CALLS.with(|calls| calls.borrow_mut().push((kind, call)));
    }

    /// Forget recorded calls and broken kinds of this thread
    pub(crate) fn reset_fakes() {
        CALLS.with(|calls| calls.borrow_mut().clear());
        BROKEN.with(|broken| broken.borrow_mut().clear());
    }

    /// Calls made to fake backends on this thread since the last call
    pub(crate) fn take_calls() -> Vec<(BackendKind, &'static str)> {
        CALLS.with(|calls| calls.take())
    }

    /// Make [`fake_backend`] refuse to construct backends of `kind` on this thread
    pub(crate) fn break_kind(kind: BackendKind) {
        BROKEN.with(|broken| broken.borrow_mut().push(kind));
    }

    /// Backend without any protocol traffic, failing every capture on demand
    #[derive(Debug)]
    pub(crate) struct FakeBackend {
        pub kind: BackendKind,
        pub fail: FailCounter,
        pub failing: bool,
        pub adapts: bool,
    }

    /// Drop-in for [`Backend::new`] constructing a [`FakeBackend`] of any kind
    pub(crate) fn fake_backend(kind: BackendKind, ctx: &mut CaptureContext<'_>) -> Result<Backend, BackendError> {
        record(kind, "new");
        if BROKEN.with(|broken| broken.borrow().contains(&kind)) {
            return Err(BackendError::Setup("broken".into()));
        }
        Ok(Backend::Fake(FakeBackend {
            kind,
            fail: FailCounter::new(ctx.options.fatal_fail_count),
            failing: false,
            adapts: true,
        }))
    }

    impl CaptureBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn capture(&mut self, _ctx: &mut CaptureContext<'_>) {
            record(self.kind, "capture");
            if self.failing {
                self.fail.record(CancelReason::Failed);
            } else {
                self.fail.reset();
            }
        }

        fn cleanup(&mut self, _ctx: &mut CaptureContext<'_>) {
            record(self.kind, "cleanup");
        }

        fn on_options_updated(&mut self, _ctx: &mut CaptureContext<'_>) -> bool {
            record(self.kind, "options");
            self.adapts
        }

        fn fail_count(&self) -> &FailCounter {
            &self.fail
        }
    }

    #[test]
    fn benign_cancellations_never_count() {
        let mut counter = FailCounter::new(10);
        for _ in 0..1000 {
            assert!(!counter.record(CancelReason::Benign));
        }
        assert_eq!(counter.count(), 0);
        assert!(!counter.is_exhausted());
    }

    #[test]
    fn nine_failures_are_tolerated_ten_are_not() {
        let mut counter = FailCounter::new(10);
        for _ in 0..9 {
            assert!(counter.record(CancelReason::Failed));
        }
        assert!(!counter.is_exhausted());
        counter.record(CancelReason::ProtocolViolation);
        assert!(counter.is_exhausted());
    }

    #[test]
    fn success_resets_the_streak() {
        let mut counter = FailCounter::new(10);
        for _ in 0..9 {
            counter.record(CancelReason::Import);
        }
        counter.reset();
        for _ in 0..9 {
            counter.record(CancelReason::Allocation);
        }
        assert!(!counter.is_exhausted());
    }

    #[test]
    fn giving_up_exhausts_immediately() {
        let mut counter = FailCounter::new(10);
        counter.record(CancelReason::Failed);
        counter.give_up();
        assert!(counter.is_exhausted());
        assert_eq!(counter.count(), 10);
    }

    #[test]
    fn interface_dependencies() {
        let output = TargetClass::Output;
        assert!(BackendKind::ScreencopyDmabuf.uses_interface("zwp_linux_dmabuf_v1", output));
        assert!(!BackendKind::ScreencopyShm.uses_interface("zwp_linux_dmabuf_v1", output));
        assert!(BackendKind::ExtCopyShm.uses_interface("ext_image_copy_capture_manager_v1", output));
        assert!(!BackendKind::XdgPortal.uses_interface("zwlr_screencopy_manager_v1", output));
    }

    #[test]
    fn ext_copy_only_depends_on_the_source_manager_of_its_target() {
        const OUTPUT_SOURCES: &str = "ext_output_image_capture_source_manager_v1";
        const TOPLEVEL_SOURCES: &str = "ext_foreign_toplevel_image_capture_source_manager_v1";
        for kind in [BackendKind::ExtCopyShm, BackendKind::ExtCopyDmabuf] {
            assert!(kind.uses_interface(OUTPUT_SOURCES, TargetClass::Output));
            assert!(!kind.uses_interface(TOPLEVEL_SOURCES, TargetClass::Output));
            assert!(kind.uses_interface(TOPLEVEL_SOURCES, TargetClass::Toplevel));
            assert!(!kind.uses_interface(OUTPUT_SOURCES, TargetClass::Toplevel));
        }
    }
}
