//! Capture through `wlr-export-dmabuf-unstable-v1`
//!
//! The compositor exports the buffer it scans out as a dmabuf: a `frame` event describes it, one
//! `object` event per plane carries the file descriptors, `ready` completes it. There is no client
//! side destination buffer; the planes are imported directly and released by dropping them.
//!
//! ```text
//! Idle/Canceled --capture--> WaitFrame --frame--> WaitObjects --last object--> WaitReady --ready--> Idle
//! ```

use std::os::unix::io::OwnedFd;

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use tracing::{debug, error, trace, warn};
use wayland_client::{Proxy, WEnum};
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1::{self, CancelReason as WlrCancelReason, ZwlrExportDmabufFrameV1},
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
};

use super::{
    dmabuf::{Dmabuf, DmabufBuilder, DmabufFlags, MAX_PLANES},
    import::ImportParams,
    BackendError, BackendKind, CancelReason, CaptureBackend, CaptureContext, FailCounter,
};

/// States of an export-dmabuf frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportState {
    /// No frame requested yet, or the last one completed
    Idle,
    /// Waiting for the frame description
    WaitFrame,
    /// Waiting for the plane objects
    WaitObjects,
    /// Waiting for the ready signal
    WaitReady,
    /// The last frame was cancelled
    Canceled,
}

/// Reason given by the compositor for cancelling a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportCancel {
    /// Temporary error, the source may produce frames again
    Temporary,
    /// The source will not produce frames anymore
    Permanent,
    /// The source is being resized
    Resizing,
    /// A reason unknown to us
    Unknown(u32),
}

impl ExportCancel {
    fn classify(&self) -> CancelReason {
        match self {
            ExportCancel::Temporary | ExportCancel::Resizing => CancelReason::Benign,
            ExportCancel::Permanent | ExportCancel::Unknown(_) => CancelReason::Failed,
        }
    }
}

/// Description of an exported frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescription {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// DRM fourcc code
    pub format: u32,
    /// Format modifier
    pub modifier: u64,
    /// Buffer flags (`zwp_linux_buffer_params_v1` flags)
    pub buffer_flags: u32,
    /// Number of plane objects that follow
    pub num_objects: u32,
}

/// Input of the [`ExportDmabufMachine`]
#[derive(Debug)]
pub enum ExportEvent<F> {
    /// `frame`
    Frame(FrameDescription),
    /// `object`
    Object {
        /// Object index, `0..num_objects`
        index: u32,
        /// Plane file descriptor
        fd: F,
        /// Offset of the plane in the fd
        offset: u32,
        /// Stride of the plane
        stride: u32,
        /// Plane index
        plane_index: u32,
    },
    /// `ready`
    Ready,
    /// `cancel`
    Cancel(ExportCancel),
}

/// Output of the [`ExportDmabufMachine`]
#[derive(Debug)]
pub enum ExportStep<F> {
    /// Nothing to do
    Continue,
    /// The frame is complete and can be imported
    Complete(Dmabuf<F>),
    /// The frame ended without a result
    Canceled(CancelReason),
}

/// Sans-IO state machine of the export-dmabuf transport
#[derive(Debug)]
pub struct ExportDmabufMachine<F = OwnedFd> {
    state: ExportState,
    num_objects: u32,
    received: u8,
    builder: Option<DmabufBuilder<F>>,
    fail: FailCounter,
}

impl<F> ExportDmabufMachine<F> {
    /// Create a machine giving up after `threshold` consecutive failures
    pub fn new(threshold: u32) -> Self {
        ExportDmabufMachine {
            state: ExportState::Idle,
            num_objects: 0,
            received: 0,
            builder: None,
            fail: FailCounter::new(threshold),
        }
    }

    /// Current state
    pub fn state(&self) -> ExportState {
        self.state
    }

    /// Failure tracking
    pub fn fail_count(&self) -> &FailCounter {
        &self.fail
    }

    /// Request a new frame
    ///
    /// Returns `true` if the frame has to be requested from the compositor, `false` if one is
    /// already in flight.
    pub fn begin_capture(&mut self) -> bool {
        match self.state {
            ExportState::Idle | ExportState::Canceled => {
                self.state = ExportState::WaitFrame;
                true
            }
            _ => false,
        }
    }

    /// Feed an event of the current frame
    pub fn handle_event(&mut self, event: ExportEvent<F>) -> ExportStep<F> {
        match (self.state, event) {
            (ExportState::WaitFrame, ExportEvent::Frame(desc)) => {
                if desc.num_objects == 0 || desc.num_objects as usize > MAX_PLANES {
                    error!(num_objects = desc.num_objects, "Frame with invalid number of planes");
                    return self.cancel(CancelReason::ProtocolViolation);
                }
                let Ok(format) = Fourcc::try_from(desc.format) else {
                    warn!(format = desc.format, "Frame with unknown format");
                    return self.cancel(CancelReason::Failed);
                };
                trace!(?desc, "Export frame");
                self.num_objects = desc.num_objects;
                self.received = 0;
                self.builder = Some(Dmabuf::builder(
                    desc.width,
                    desc.height,
                    format,
                    Modifier::from(desc.modifier),
                    DmabufFlags::from_bits_truncate(desc.buffer_flags),
                ));
                self.state = ExportState::WaitObjects;
                ExportStep::Continue
            }
            (
                ExportState::WaitObjects,
                ExportEvent::Object {
                    index,
                    fd,
                    offset,
                    stride,
                    plane_index,
                },
            ) => {
                let bit = 1u8.checked_shl(index).unwrap_or(0);
                if index >= self.num_objects || self.received & bit != 0 {
                    error!(index, num_objects = self.num_objects, "Invalid or duplicate plane object");
                    drop(fd);
                    return self.cancel(CancelReason::ProtocolViolation);
                }
                let Some(builder) = self.builder.as_mut() else {
                    return self.cancel(CancelReason::ProtocolViolation);
                };
                if !builder.add_plane(fd, plane_index, offset, stride) {
                    return self.cancel(CancelReason::ProtocolViolation);
                }
                self.received |= bit;
                if self.received.count_ones() == self.num_objects {
                    self.state = ExportState::WaitReady;
                }
                ExportStep::Continue
            }
            (ExportState::WaitReady, ExportEvent::Ready) => {
                self.state = ExportState::Idle;
                match self.builder.take().and_then(DmabufBuilder::build) {
                    Some(dmabuf) => ExportStep::Complete(dmabuf),
                    None => self.cancel(CancelReason::ProtocolViolation),
                }
            }
            (ExportState::WaitFrame | ExportState::WaitObjects | ExportState::WaitReady, ExportEvent::Cancel(reason)) => {
                debug!(?reason, "Export frame cancelled");
                self.cancel(reason.classify())
            }
            (state, event) => {
                error!(?state, event = event_name(&event), "Unexpected export-dmabuf event");
                drop(event);
                self.cancel(CancelReason::ProtocolViolation)
            }
        }
    }

    /// Report the outcome of importing a completed frame
    pub fn finish_frame(&mut self, imported: bool) {
        if imported {
            self.fail.reset();
        } else {
            self.state = ExportState::Canceled;
            self.fail.record(CancelReason::Import);
        }
    }

    /// Hand a completed frame to `import`, then let the compositor reuse its buffer
    ///
    /// The planes stay open while `import` runs; they are closed before `release` destroys the
    /// frame object.
    pub fn deliver(&mut self, dmabuf: Dmabuf<F>, import: impl FnOnce(&Dmabuf<F>) -> bool, release: impl FnOnce()) {
        let imported = import(&dmabuf);
        self.finish_frame(imported);
        drop(dmabuf);
        release();
    }

    fn cancel(&mut self, reason: CancelReason) -> ExportStep<F> {
        // dropping the builder closes every plane received so far
        self.builder = None;
        self.state = ExportState::Canceled;
        if self.fail.record(reason) {
            warn!(?reason, failures = self.fail.count(), "Export frame failed");
        }
        ExportStep::Canceled(reason)
    }
}

fn event_name<F>(event: &ExportEvent<F>) -> &'static str {
    match event {
        ExportEvent::Frame(_) => "frame",
        ExportEvent::Object { .. } => "object",
        ExportEvent::Ready => "ready",
        ExportEvent::Cancel(_) => "cancel",
    }
}

/// Raw value of an argument generated either as plain integer or as enum
pub(crate) trait RawArg {
    fn raw(self) -> u32;
}

impl RawArg for u32 {
    fn raw(self) -> u32 {
        self
    }
}

impl<T: Into<u32>> RawArg for WEnum<T> {
    fn raw(self) -> u32 {
        match self {
            WEnum::Value(value) => value.into(),
            WEnum::Unknown(raw) => raw,
        }
    }
}

/// Capture backend using `wlr-export-dmabuf-unstable-v1`
#[derive(Debug)]
pub struct ExportDmabufBackend {
    machine: ExportDmabufMachine,
    manager: ZwlrExportDmabufManagerV1,
    frame: Option<ZwlrExportDmabufFrameV1>,
}

impl ExportDmabufBackend {
    /// Create the backend, requires the export-dmabuf manager and an output target
    pub fn new(ctx: &mut CaptureContext<'_>) -> Result<Self, BackendError> {
        let manager = ctx
            .globals
            .export_dmabuf_manager
            .clone()
            .ok_or(BackendError::MissingCapability("zwlr_export_dmabuf_manager_v1"))?;
        if ctx.target.output().is_none() {
            return Err(BackendError::UnsupportedTarget);
        }
        Ok(ExportDmabufBackend {
            machine: ExportDmabufMachine::new(ctx.options.fatal_fail_count),
            manager,
            frame: None,
        })
    }

    /// Handle an event of a frame object
    pub fn handle_frame_event(
        &mut self,
        ctx: &mut CaptureContext<'_>,
        frame: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
    ) {
        if self.frame.as_ref() != Some(frame) {
            trace!(frame = ?frame.id(), "Event for stale export frame");
            return;
        }

        use zwlr_export_dmabuf_frame_v1::Event;
        let event = match event {
            Event::Frame {
                width,
                height,
                buffer_flags,
                format,
                mod_high,
                mod_low,
                num_objects,
                ..
            } => ExportEvent::Frame(FrameDescription {
                width,
                height,
                format,
                modifier: (u64::from(mod_high) << 32) | u64::from(mod_low),
                buffer_flags: buffer_flags.raw(),
                num_objects,
            }),
            Event::Object {
                index,
                fd,
                offset,
                stride,
                plane_index,
                ..
            } => ExportEvent::Object {
                index,
                fd,
                offset,
                stride,
                plane_index,
            },
            Event::Ready { .. } => ExportEvent::Ready,
            Event::Cancel { reason } => ExportEvent::Cancel(match reason {
                WEnum::Value(WlrCancelReason::Temporary) => ExportCancel::Temporary,
                WEnum::Value(WlrCancelReason::Permanent) => ExportCancel::Permanent,
                WEnum::Value(WlrCancelReason::Resizing) => ExportCancel::Resizing,
                other => ExportCancel::Unknown(other.raw()),
            }),
            _ => return,
        };

        match self.machine.handle_event(event) {
            ExportStep::Continue => {}
            ExportStep::Complete(dmabuf) => {
                let frame = self.frame.take();
                let transform = ctx.target.transform;
                self.machine.deliver(
                    dmabuf,
                    |dmabuf| {
                        let params = ImportParams {
                            invert_y: dmabuf.flags().contains(DmabufFlags::Y_INVERT),
                            region_aware: false,
                            transform,
                        };
                        match ctx.importer.import_dmabuf(dmabuf, &params) {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(%err, "Failed to import exported dmabuf");
                                false
                            }
                        }
                    },
                    || {
                        if let Some(frame) = frame {
                            frame.destroy();
                        }
                    },
                );
            }
            ExportStep::Canceled(_) => self.release_frame(),
        }
    }

    fn release_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }
}

impl CaptureBackend for ExportDmabufBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ExportDmabuf
    }

    fn capture(&mut self, ctx: &mut CaptureContext<'_>) {
        let Some(output) = ctx.target.output() else {
            return;
        };
        if !self.machine.begin_capture() {
            return;
        }
        let overlay_cursor = i32::from(ctx.options.show_cursor);
        self.frame = Some(self.manager.capture_output(overlay_cursor, output, ctx.qh, ()));
    }

    fn cleanup(&mut self, _ctx: &mut CaptureContext<'_>) {
        self.release_frame();
    }

    fn fail_count(&self) -> &FailCounter {
        self.machine.fail_count()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::backend::dmabuf::tests::{CountingFd, FdLedger};

    const ALL_STATES: [ExportState; 5] = [
        ExportState::Idle,
        ExportState::WaitFrame,
        ExportState::WaitObjects,
        ExportState::WaitReady,
        ExportState::Canceled,
    ];

    fn desc(num_objects: u32) -> FrameDescription {
        FrameDescription {
            width: 1920,
            height: 1080,
            format: Fourcc::Xrgb8888 as u32,
            modifier: 0,
            buffer_flags: 0,
            num_objects,
        }
    }

    fn object(ledger: &Rc<FdLedger>, index: u32) -> ExportEvent<CountingFd> {
        ExportEvent::Object {
            index,
            fd: ledger.open(),
            offset: 0,
            stride: 7680,
            plane_index: index,
        }
    }

    fn machine_in(state: ExportState, ledger: &Rc<FdLedger>) -> ExportDmabufMachine<CountingFd> {
        let mut machine = ExportDmabufMachine::new(10);
        if state == ExportState::Idle {
            return machine;
        }
        if state == ExportState::Canceled {
            machine.begin_capture();
            machine.handle_event(ExportEvent::Cancel(ExportCancel::Resizing));
            return machine;
        }
        assert!(machine.begin_capture());
        if state == ExportState::WaitFrame {
            return machine;
        }
        machine.handle_event(ExportEvent::Frame(desc(2)));
        if state == ExportState::WaitObjects {
            return machine;
        }
        machine.handle_event(object(ledger, 0));
        machine.handle_event(object(ledger, 1));
        assert_eq!(machine.state(), ExportState::WaitReady);
        machine
    }

    fn all_events(ledger: &Rc<FdLedger>) -> Vec<ExportEvent<CountingFd>> {
        vec![
            ExportEvent::Frame(desc(1)),
            object(ledger, 0),
            ExportEvent::Ready,
            ExportEvent::Cancel(ExportCancel::Permanent),
        ]
    }

    fn expected(state: ExportState, event: &ExportEvent<CountingFd>) -> bool {
        matches!(
            (state, event),
            (ExportState::WaitFrame, ExportEvent::Frame(_))
                | (ExportState::WaitObjects, ExportEvent::Object { .. })
                | (ExportState::WaitReady, ExportEvent::Ready)
                | (
                    ExportState::WaitFrame | ExportState::WaitObjects | ExportState::WaitReady,
                    ExportEvent::Cancel(_)
                )
        )
    }

    #[test]
    fn unexpected_events_cancel_and_count() {
        let ledger = Rc::new(FdLedger::default());
        for state in ALL_STATES {
            for (i, event) in all_events(&ledger).into_iter().enumerate() {
                let mut machine = machine_in(state, &ledger);
                let accepted = expected(state, &event);
                let before = machine.fail_count().count();
                let step = machine.handle_event(event);

                if accepted && i != 3 {
                    assert!(
                        !matches!(step, ExportStep::Canceled(_)),
                        "{:?} should accept event {}",
                        state,
                        i
                    );
                    assert_eq!(machine.fail_count().count(), before);
                } else if accepted {
                    assert!(matches!(step, ExportStep::Canceled(CancelReason::Failed)));
                    assert_eq!(machine.fail_count().count(), before + 1);
                } else {
                    assert!(
                        matches!(step, ExportStep::Canceled(CancelReason::ProtocolViolation)),
                        "{:?} should reject event {}",
                        state,
                        i
                    );
                    assert_eq!(machine.state(), ExportState::Canceled);
                    assert_eq!(machine.fail_count().count(), before + 1);
                }
            }
        }
        assert_eq!(ledger.opened(), ledger.closed());
    }

    #[test]
    fn complete_frame_keeps_planes_until_dropped() {
        let ledger = Rc::new(FdLedger::default());
        let mut machine = machine_in(ExportState::WaitReady, &ledger);
        let ExportStep::Complete(dmabuf) = machine.handle_event(ExportEvent::Ready) else {
            panic!("frame did not complete");
        };
        assert_eq!(dmabuf.num_planes(), 2);
        assert_eq!(dmabuf.size(), (1920, 1080));
        assert_eq!(ledger.closed(), 0);
        machine.finish_frame(true);
        drop(dmabuf);
        assert_eq!(ledger.opened(), 2);
        assert_eq!(ledger.closed(), 2);
        assert_eq!(machine.state(), ExportState::Idle);
    }

    #[test]
    fn frame_is_released_only_after_import() {
        let ledger = Rc::new(FdLedger::default());
        let mut machine = machine_in(ExportState::WaitReady, &ledger);
        let ExportStep::Complete(dmabuf) = machine.handle_event(ExportEvent::Ready) else {
            panic!("frame did not complete");
        };
        let order = RefCell::new(Vec::new());
        machine.deliver(
            dmabuf,
            |dmabuf| {
                assert_eq!(dmabuf.num_planes(), 2);
                assert_eq!(ledger.closed(), 0, "planes closed before the import");
                order.borrow_mut().push("import");
                true
            },
            || {
                assert_eq!(ledger.closed(), 2, "planes still open when the frame is released");
                order.borrow_mut().push("release");
            },
        );
        assert_eq!(*order.borrow(), ["import", "release"]);
        assert_eq!(machine.state(), ExportState::Idle);
        assert_eq!(machine.fail_count().count(), 0);
    }

    #[test]
    fn planes_are_closed_on_cancellation() {
        let ledger = Rc::new(FdLedger::default());
        let mut machine = ExportDmabufMachine::new(10);
        machine.begin_capture();
        machine.handle_event(ExportEvent::Frame(desc(3)));
        machine.handle_event(object(&ledger, 0));
        machine.handle_event(object(&ledger, 2));
        assert_eq!(ledger.closed(), 0);
        machine.handle_event(ExportEvent::Cancel(ExportCancel::Temporary));
        assert_eq!(ledger.opened(), 2);
        assert_eq!(ledger.closed(), 2);
    }

    #[test]
    fn too_many_planes_are_rejected() {
        let mut machine = ExportDmabufMachine::<CountingFd>::new(10);
        machine.begin_capture();
        let step = machine.handle_event(ExportEvent::Frame(desc(MAX_PLANES as u32 + 1)));
        assert!(matches!(step, ExportStep::Canceled(CancelReason::ProtocolViolation)));
        assert_eq!(machine.fail_count().count(), 1);

        machine.begin_capture();
        let step = machine.handle_event(ExportEvent::Frame(desc(0)));
        assert!(matches!(step, ExportStep::Canceled(CancelReason::ProtocolViolation)));
    }

    #[test]
    fn out_of_range_and_duplicate_objects_are_violations() {
        let ledger = Rc::new(FdLedger::default());
        for bad in [vec![5], vec![0, 0], vec![40]] {
            let mut machine = ExportDmabufMachine::new(10);
            machine.begin_capture();
            machine.handle_event(ExportEvent::Frame(desc(2)));
            let mut last = None;
            for index in bad {
                last = Some(machine.handle_event(object(&ledger, index)));
            }
            assert!(matches!(
                last,
                Some(ExportStep::Canceled(CancelReason::ProtocolViolation))
            ));
        }
        assert_eq!(ledger.opened(), ledger.closed());
    }

    #[test]
    fn ready_before_all_objects_is_a_violation() {
        let ledger = Rc::new(FdLedger::default());
        let mut machine = ExportDmabufMachine::new(10);
        machine.begin_capture();
        machine.handle_event(ExportEvent::Frame(desc(2)));
        machine.handle_event(object(&ledger, 0));
        let step = machine.handle_event(ExportEvent::Ready);
        assert!(matches!(step, ExportStep::Canceled(CancelReason::ProtocolViolation)));
        assert_eq!(ledger.opened(), ledger.closed());
    }

    #[test]
    fn resizes_never_exhaust_the_backend() {
        let mut machine = ExportDmabufMachine::<CountingFd>::new(10);
        for _ in 0..100 {
            assert!(machine.begin_capture());
            machine.handle_event(ExportEvent::Cancel(ExportCancel::Resizing));
        }
        assert_eq!(machine.fail_count().count(), 0);
    }

    #[test]
    fn ten_permanent_cancellations_exhaust() {
        let mut machine = ExportDmabufMachine::<CountingFd>::new(10);
        for _ in 0..9 {
            machine.begin_capture();
            machine.handle_event(ExportEvent::Cancel(ExportCancel::Permanent));
        }
        assert!(!machine.fail_count().is_exhausted());
        machine.begin_capture();
        machine.handle_event(ExportEvent::Cancel(ExportCancel::Unknown(7)));
        assert!(machine.fail_count().is_exhausted());
    }

    #[test]
    fn capture_is_a_noop_while_in_flight() {
        let mut machine = ExportDmabufMachine::<CountingFd>::new(10);
        assert!(machine.begin_capture());
        assert!(!machine.begin_capture());
        assert_eq!(machine.state(), ExportState::WaitFrame);
    }

    #[test]
    fn failed_import_counts() {
        let ledger = Rc::new(FdLedger::default());
        let mut machine = machine_in(ExportState::WaitReady, &ledger);
        let step = machine.handle_event(ExportEvent::Ready);
        drop(step);
        machine.finish_frame(false);
        assert_eq!(machine.fail_count().count(), 1);
        assert_eq!(machine.state(), ExportState::Canceled);
    }
}
