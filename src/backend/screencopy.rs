//! Capture through `wlr-screencopy-unstable-v1`
//!
//! The compositor announces the buffer it can copy into, the client allocates a matching one and
//! requests the copy, then receives `flags` followed by `ready` (or `failed`).
//!
//! Before version 3 only a shm `buffer` event is sent and the copy is requested right away.
//! Starting with version 3 the compositor may additionally offer a `linux_dmabuf` destination and
//! terminates the list with `buffer_done`; the copy is only requested then.
//!
//! ```text
//! Idle/Canceled --capture--> WaitBufferInfo --buffer(v<3)/buffer_done--> WaitFlags --flags--> WaitReady --ready--> Idle
//! ```

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use tracing::{debug, error, trace, warn};
use wayland_client::{Proxy, WEnum};
use wayland_protocols_wlr::screencopy::v1::client::{
    zwlr_screencopy_frame_v1::{self, Flags as ScreencopyFlags, ZwlrScreencopyFrameV1},
    zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
};

use super::{
    buffer::{BufferError, BufferSlot, DmabufBuffer, DmabufParams, ShmBuffer, ShmParams},
    export_dmabuf::RawArg,
    format::fourcc_from_shm,
    import::{ImportError, ImportParams, ShmFrame},
    BackendError, BackendKind, CancelReason, CaptureBackend, CaptureContext, FailCounter,
};

/// First version offering `buffer_done` and `linux_dmabuf`
pub const SCREENCOPY_BUFFER_DONE_SINCE: u32 = 3;

/// States of a screencopy frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreencopyState {
    /// No frame requested yet, or the last one completed
    Idle,
    /// Waiting for the buffer announcements
    WaitBufferInfo,
    /// Copy requested, waiting for the flags
    WaitFlags,
    /// Waiting for the ready signal
    WaitReady,
    /// The last frame was cancelled
    Canceled,
}

/// Kind of destination buffer a screencopy backend uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Shared memory
    Shm,
    /// Dmabuf
    Dmabuf,
}

/// Dmabuf destination offered by the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmabufOffer {
    /// DRM fourcc
    pub format: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Input of the [`ScreencopyMachine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreencopyEvent {
    /// `buffer`
    Buffer(ShmParams),
    /// `linux_dmabuf`
    LinuxDmabuf(DmabufOffer),
    /// `buffer_done`
    BufferDone,
    /// `flags`
    Flags {
        /// Content is stored bottom-up
        y_invert: bool,
    },
    /// `damage`
    Damage,
    /// `ready`
    Ready,
    /// `failed`
    Failed,
}

/// Destination buffer to allocate before copying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRequest {
    /// A shm buffer with these parameters
    Shm(ShmParams),
    /// A dmabuf of this format and size
    Dmabuf(DmabufOffer),
}

/// Output of the [`ScreencopyMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreencopyStep {
    /// Nothing to do
    Continue,
    /// Provide a buffer matching the request and issue the copy
    Copy(BufferRequest),
    /// The copy is complete and can be imported
    Complete {
        /// Content is stored bottom-up
        y_invert: bool,
    },
    /// The frame ended without a result
    Canceled(CancelReason),
}

/// Sans-IO state machine of the screencopy transport
#[derive(Debug)]
pub struct ScreencopyMachine {
    state: ScreencopyState,
    kind: BufferKind,
    version: u32,
    shm: Option<ShmParams>,
    dmabuf: Option<DmabufOffer>,
    y_invert: bool,
    fail: FailCounter,
}

impl ScreencopyMachine {
    /// Create a machine for a manager bound with `version`
    pub fn new(kind: BufferKind, version: u32, threshold: u32) -> Self {
        ScreencopyMachine {
            state: ScreencopyState::Idle,
            kind,
            version,
            shm: None,
            dmabuf: None,
            y_invert: false,
            fail: FailCounter::new(threshold),
        }
    }

    /// Current state
    pub fn state(&self) -> ScreencopyState {
        self.state
    }

    /// Failure tracking
    pub fn fail_count(&self) -> &FailCounter {
        &self.fail
    }

    /// Request a new frame, returns `false` if one is already in flight
    pub fn begin_capture(&mut self) -> bool {
        match self.state {
            ScreencopyState::Idle | ScreencopyState::Canceled => {
                self.shm = None;
                self.dmabuf = None;
                self.y_invert = false;
                self.state = ScreencopyState::WaitBufferInfo;
                true
            }
            _ => false,
        }
    }

    /// Feed an event of the current frame
    pub fn handle_event(&mut self, event: ScreencopyEvent) -> ScreencopyStep {
        let has_buffer_done = self.version >= SCREENCOPY_BUFFER_DONE_SINCE;
        match (self.state, event) {
            (ScreencopyState::WaitBufferInfo, ScreencopyEvent::Buffer(params)) => {
                trace!(?params, "Screencopy shm buffer offered");
                self.shm = Some(params);
                if has_buffer_done {
                    return ScreencopyStep::Continue;
                }
                self.state = ScreencopyState::WaitFlags;
                ScreencopyStep::Copy(BufferRequest::Shm(params))
            }
            (ScreencopyState::WaitBufferInfo, ScreencopyEvent::LinuxDmabuf(offer)) if has_buffer_done => {
                trace!(?offer, "Screencopy dmabuf offered");
                self.dmabuf = Some(offer);
                ScreencopyStep::Continue
            }
            (ScreencopyState::WaitBufferInfo, ScreencopyEvent::BufferDone) if has_buffer_done => {
                let request = match self.kind {
                    BufferKind::Shm => self.shm.map(BufferRequest::Shm),
                    BufferKind::Dmabuf => self.dmabuf.map(BufferRequest::Dmabuf),
                };
                match request {
                    Some(request) => {
                        self.state = ScreencopyState::WaitFlags;
                        ScreencopyStep::Copy(request)
                    }
                    None => {
                        warn!(kind = ?self.kind, "Compositor offered no usable buffer type");
                        self.cancel(CancelReason::Failed)
                    }
                }
            }
            (ScreencopyState::WaitFlags, ScreencopyEvent::Flags { y_invert }) => {
                self.y_invert = y_invert;
                self.state = ScreencopyState::WaitReady;
                ScreencopyStep::Continue
            }
            (ScreencopyState::WaitReady, ScreencopyEvent::Damage) => ScreencopyStep::Continue,
            (ScreencopyState::WaitReady, ScreencopyEvent::Ready) => {
                self.state = ScreencopyState::Idle;
                ScreencopyStep::Complete {
                    y_invert: self.y_invert,
                }
            }
            (
                ScreencopyState::WaitBufferInfo | ScreencopyState::WaitFlags | ScreencopyState::WaitReady,
                ScreencopyEvent::Failed,
            ) => {
                debug!("Screencopy frame failed");
                self.cancel(CancelReason::Failed)
            }
            (state, event) => {
                error!(?state, ?event, "Unexpected screencopy event");
                self.cancel(CancelReason::ProtocolViolation)
            }
        }
    }

    /// The destination buffer for the requested copy could not be provided
    pub fn allocation_failed(&mut self) -> ScreencopyStep {
        self.cancel(CancelReason::Allocation)
    }

    /// Report the outcome of importing a completed frame
    pub fn finish_frame(&mut self, imported: bool) {
        if imported {
            self.fail.reset();
        } else {
            self.state = ScreencopyState::Canceled;
            self.fail.record(CancelReason::Import);
        }
    }

    fn cancel(&mut self, reason: CancelReason) -> ScreencopyStep {
        self.state = ScreencopyState::Canceled;
        if self.fail.record(reason) {
            warn!(?reason, failures = self.fail.count(), "Screencopy frame failed");
        }
        ScreencopyStep::Canceled(reason)
    }
}

/// Capture backend using `wlr-screencopy-unstable-v1`
#[derive(Debug)]
pub struct ScreencopyBackend {
    machine: ScreencopyMachine,
    kind: BufferKind,
    manager: ZwlrScreencopyManagerV1,
    frame: Option<ZwlrScreencopyFrameV1>,
    shm: BufferSlot<ShmBuffer>,
    dmabuf: BufferSlot<DmabufBuffer>,
    region_aware: bool,
}

impl ScreencopyBackend {
    /// Create the backend for either the shm or the dmabuf variant
    pub fn new(kind: BackendKind, ctx: &mut CaptureContext<'_>) -> Result<Self, BackendError> {
        let manager = ctx
            .globals
            .screencopy_manager
            .clone()
            .ok_or(BackendError::MissingCapability("zwlr_screencopy_manager_v1"))?;
        if ctx.target.output().is_none() {
            return Err(BackendError::UnsupportedTarget);
        }
        let version = manager.version();
        let buffer_kind = if kind == BackendKind::ScreencopyDmabuf {
            if version < SCREENCOPY_BUFFER_DONE_SINCE {
                return Err(BackendError::MissingCapability("zwlr_screencopy_manager_v1 version 3"));
            }
            if ctx.globals.linux_dmabuf.is_none() {
                return Err(BackendError::MissingCapability("zwp_linux_dmabuf_v1"));
            }
            if ctx.allocator.is_none() {
                return Err(BackendError::MissingCapability("dmabuf allocator"));
            }
            BufferKind::Dmabuf
        } else {
            BufferKind::Shm
        };
        debug!(version, kind = ?buffer_kind, "Using screencopy");

        Ok(ScreencopyBackend {
            machine: ScreencopyMachine::new(buffer_kind, version, ctx.options.fatal_fail_count),
            kind: buffer_kind,
            manager,
            frame: None,
            shm: BufferSlot::default(),
            dmabuf: BufferSlot::default(),
            region_aware: false,
        })
    }

    /// Handle an event of a frame object
    pub fn handle_frame_event(
        &mut self,
        ctx: &mut CaptureContext<'_>,
        frame: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
    ) {
        if self.frame.as_ref() != Some(frame) {
            trace!(frame = ?frame.id(), "Event for stale screencopy frame");
            return;
        }

        use zwlr_screencopy_frame_v1::Event;
        let event = match event {
            Event::Buffer {
                format,
                width,
                height,
                stride,
            } => ScreencopyEvent::Buffer(ShmParams {
                format: format.raw(),
                width,
                height,
                stride,
            }),
            Event::LinuxDmabuf { format, width, height } => {
                ScreencopyEvent::LinuxDmabuf(DmabufOffer { format, width, height })
            }
            Event::BufferDone => ScreencopyEvent::BufferDone,
            Event::Flags { flags } => ScreencopyEvent::Flags {
                y_invert: matches!(flags, WEnum::Value(flags) if flags.contains(ScreencopyFlags::YInvert)),
            },
            Event::Damage { .. } => ScreencopyEvent::Damage,
            Event::Ready { .. } => ScreencopyEvent::Ready,
            Event::Failed => ScreencopyEvent::Failed,
            _ => return,
        };

        match self.machine.handle_event(event) {
            ScreencopyStep::Continue => {}
            ScreencopyStep::Copy(request) => self.copy(ctx, request),
            ScreencopyStep::Complete { y_invert } => {
                self.release_frame();
                let params = ImportParams {
                    invert_y: y_invert,
                    region_aware: self.region_aware,
                    transform: ctx.target.transform,
                };
                let result = match self.kind {
                    BufferKind::Shm => match self.shm.get() {
                        Some(buffer) => import_shm(ctx, buffer, &params),
                        None => Err(ImportError::Failed("no shm buffer".into())),
                    },
                    BufferKind::Dmabuf => match self.dmabuf.get() {
                        Some(buffer) => ctx.importer.import_dmabuf(buffer.dmabuf(), &params),
                        None => Err(ImportError::Failed("no dmabuf".into())),
                    },
                };
                if let Err(err) = &result {
                    warn!(%err, "Failed to import screencopy frame");
                }
                self.machine.finish_frame(result.is_ok());
            }
            ScreencopyStep::Canceled(_) => self.release_frame(),
        }
    }

    fn copy(&mut self, ctx: &mut CaptureContext<'_>, request: BufferRequest) {
        let Some(frame) = self.frame.clone() else {
            return;
        };
        let buffer = match request {
            BufferRequest::Shm(params) => {
                self.shm.retain(|buffer| *buffer.params() == params);
                if !self.shm.is_allocated() {
                    let Some(shm) = ctx.globals.shm.as_ref() else {
                        self.allocation_failed();
                        return;
                    };
                    if let Err(err) = self.shm.allocate(|| ShmBuffer::new(shm, ctx.qh, params)) {
                        warn!(%err, "Failed to allocate shm buffer");
                        self.allocation_failed();
                        return;
                    }
                }
                self.shm.get().map(|buffer| buffer.wl_buffer().clone())
            }
            BufferRequest::Dmabuf(offer) => {
                let Ok(format) = Fourcc::try_from(offer.format) else {
                    warn!(format = offer.format, "Unknown dmabuf format offered");
                    self.allocation_failed();
                    return;
                };
                let params = DmabufParams {
                    format,
                    width: offer.width,
                    height: offer.height,
                    modifiers: Vec::new(),
                };
                self.dmabuf.retain(|buffer| *buffer.params() == params);
                if !self.dmabuf.is_allocated() {
                    let (Some(linux_dmabuf), Some(allocator)) = (ctx.globals.linux_dmabuf.as_ref(), ctx.allocator.as_mut())
                    else {
                        self.allocation_failed();
                        return;
                    };
                    let allocated = self.dmabuf.allocate(|| {
                        let dmabuf = allocator
                            .allocate(offer.width, offer.height, format, &[Modifier::Invalid, Modifier::Linear])
                            .map_err(|err| {
                                warn!(%err, "Failed to allocate dmabuf");
                                BufferError::UnsupportedFormat(offer.format)
                            })?;
                        Ok(DmabufBuffer::new(linux_dmabuf, ctx.qh, dmabuf, params.clone()))
                    });
                    if allocated.is_err() {
                        self.allocation_failed();
                        return;
                    }
                }
                self.dmabuf.get().map(|buffer| buffer.wl_buffer().clone())
            }
        };

        match buffer {
            Some(buffer) => frame.copy(&buffer),
            None => self.allocation_failed(),
        }
    }

    fn allocation_failed(&mut self) {
        self.machine.allocation_failed();
        self.release_frame();
    }

    fn release_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }
}

fn import_shm(ctx: &mut CaptureContext<'_>, buffer: &ShmBuffer, params: &ImportParams) -> Result<(), ImportError> {
    let shm = buffer.params();
    let format = fourcc_from_shm(shm.format)
        .ok_or_else(|| ImportError::Failed(format!("unknown shm format {:#x}", shm.format)))?;
    let frame = ShmFrame {
        data: buffer.data(),
        format,
        width: shm.width,
        height: shm.height,
        stride: shm.stride,
    };
    ctx.importer.import_shm(&frame, params)
}

impl CaptureBackend for ScreencopyBackend {
    fn kind(&self) -> BackendKind {
        match self.kind {
            BufferKind::Shm => BackendKind::ScreencopyShm,
            BufferKind::Dmabuf => BackendKind::ScreencopyDmabuf,
        }
    }

    fn capture(&mut self, ctx: &mut CaptureContext<'_>) {
        let Some(output) = ctx.target.output() else {
            return;
        };
        if !self.machine.begin_capture() {
            return;
        }
        let overlay_cursor = i32::from(ctx.options.show_cursor);
        let frame = match ctx.options.region {
            Some(region) => {
                self.region_aware = true;
                self.manager.capture_output_region(
                    overlay_cursor,
                    output,
                    region.x,
                    region.y,
                    region.width,
                    region.height,
                    ctx.qh,
                    (),
                )
            }
            None => {
                self.region_aware = false;
                self.manager.capture_output(overlay_cursor, output, ctx.qh, ())
            }
        };
        self.frame = Some(frame);
    }

    fn cleanup(&mut self, _ctx: &mut CaptureContext<'_>) {
        self.release_frame();
        self.shm.release();
        self.dmabuf.release();
    }

    fn on_options_updated(&mut self, _ctx: &mut CaptureContext<'_>) -> bool {
        // cursor and region are per frame parameters, the next capture picks them up
        true
    }

    fn fail_count(&self) -> &FailCounter {
        self.machine.fail_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHM: ShmParams = ShmParams {
        format: 1,
        width: 640,
        height: 480,
        stride: 2560,
    };
    const DMABUF: DmabufOffer = DmabufOffer {
        format: Fourcc::Xrgb8888 as u32,
        width: 640,
        height: 480,
    };

    fn all_events() -> Vec<ScreencopyEvent> {
        vec![
            ScreencopyEvent::Buffer(SHM),
            ScreencopyEvent::LinuxDmabuf(DMABUF),
            ScreencopyEvent::BufferDone,
            ScreencopyEvent::Flags { y_invert: true },
            ScreencopyEvent::Damage,
            ScreencopyEvent::Ready,
            ScreencopyEvent::Failed,
        ]
    }

    fn machine_in(state: ScreencopyState, version: u32) -> ScreencopyMachine {
        let mut machine = ScreencopyMachine::new(BufferKind::Shm, version, 10);
        match state {
            ScreencopyState::Idle => {}
            ScreencopyState::Canceled => {
                machine.begin_capture();
                machine.handle_event(ScreencopyEvent::Failed);
                machine.fail.reset();
            }
            _ => {
                machine.begin_capture();
                if state == ScreencopyState::WaitBufferInfo {
                    return machine;
                }
                machine.handle_event(ScreencopyEvent::Buffer(SHM));
                if version >= 3 {
                    machine.handle_event(ScreencopyEvent::BufferDone);
                }
                if state == ScreencopyState::WaitFlags {
                    return machine;
                }
                machine.handle_event(ScreencopyEvent::Flags { y_invert: false });
            }
        }
        assert_eq!(machine.state(), state);
        machine
    }

    fn expected(state: ScreencopyState, event: &ScreencopyEvent, version: u32) -> bool {
        let v3 = version >= 3;
        match (state, event) {
            (ScreencopyState::WaitBufferInfo, ScreencopyEvent::Buffer(_)) => true,
            (ScreencopyState::WaitBufferInfo, ScreencopyEvent::LinuxDmabuf(_) | ScreencopyEvent::BufferDone) => v3,
            (ScreencopyState::WaitFlags, ScreencopyEvent::Flags { .. }) => true,
            (ScreencopyState::WaitReady, ScreencopyEvent::Damage | ScreencopyEvent::Ready) => true,
            (
                ScreencopyState::WaitBufferInfo | ScreencopyState::WaitFlags | ScreencopyState::WaitReady,
                ScreencopyEvent::Failed,
            ) => true,
            _ => false,
        }
    }

    #[test]
    fn transition_table_is_enforced() {
        let states = [
            ScreencopyState::Idle,
            ScreencopyState::WaitBufferInfo,
            ScreencopyState::WaitFlags,
            ScreencopyState::WaitReady,
            ScreencopyState::Canceled,
        ];
        for version in [1, 2, 3] {
            for state in states {
                for event in all_events() {
                    let mut machine = machine_in(state, version);
                    let accepted = expected(state, &event, version);
                    let step = machine.handle_event(event.clone());
                    match step {
                        ScreencopyStep::Canceled(CancelReason::ProtocolViolation) => {
                            assert!(!accepted, "v{} {:?} rejected {:?}", version, state, event)
                        }
                        ScreencopyStep::Canceled(CancelReason::Failed) => {
                            // buffer_done without any offer fails like a compositor side failure
                            assert!(matches!(event, ScreencopyEvent::Failed | ScreencopyEvent::BufferDone));
                            assert!(accepted);
                        }
                        _ => assert!(accepted, "v{} {:?} accepted {:?}", version, state, event),
                    }
                    if !accepted {
                        assert_eq!(machine.fail_count().count(), 1);
                        assert_eq!(machine.state(), ScreencopyState::Canceled);
                    }
                }
            }
        }
    }

    #[test]
    fn legacy_copies_right_after_buffer() {
        let mut machine = ScreencopyMachine::new(BufferKind::Shm, 2, 10);
        machine.begin_capture();
        assert_eq!(
            machine.handle_event(ScreencopyEvent::Buffer(SHM)),
            ScreencopyStep::Copy(BufferRequest::Shm(SHM))
        );
        assert_eq!(machine.state(), ScreencopyState::WaitFlags);
    }

    #[test]
    fn v3_waits_for_buffer_done_and_picks_by_kind() {
        let mut machine = ScreencopyMachine::new(BufferKind::Dmabuf, 3, 10);
        machine.begin_capture();
        assert_eq!(
            machine.handle_event(ScreencopyEvent::Buffer(SHM)),
            ScreencopyStep::Continue
        );
        assert_eq!(
            machine.handle_event(ScreencopyEvent::LinuxDmabuf(DMABUF)),
            ScreencopyStep::Continue
        );
        assert_eq!(
            machine.handle_event(ScreencopyEvent::BufferDone),
            ScreencopyStep::Copy(BufferRequest::Dmabuf(DMABUF))
        );
        machine.handle_event(ScreencopyEvent::Flags { y_invert: true });
        machine.handle_event(ScreencopyEvent::Damage);
        assert_eq!(
            machine.handle_event(ScreencopyEvent::Ready),
            ScreencopyStep::Complete { y_invert: true }
        );
        machine.finish_frame(true);
        assert_eq!(machine.state(), ScreencopyState::Idle);
        assert_eq!(machine.fail_count().count(), 0);
    }

    #[test]
    fn missing_offer_for_kind_fails_the_frame() {
        let mut machine = ScreencopyMachine::new(BufferKind::Dmabuf, 3, 10);
        machine.begin_capture();
        machine.handle_event(ScreencopyEvent::Buffer(SHM));
        assert_eq!(
            machine.handle_event(ScreencopyEvent::BufferDone),
            ScreencopyStep::Canceled(CancelReason::Failed)
        );
        assert_eq!(machine.fail_count().count(), 1);
    }

    #[test]
    fn allocation_failures_count_towards_exhaustion() {
        let mut machine = ScreencopyMachine::new(BufferKind::Shm, 1, 10);
        for _ in 0..10 {
            machine.begin_capture();
            machine.handle_event(ScreencopyEvent::Buffer(SHM));
            machine.allocation_failed();
        }
        assert!(machine.fail_count().is_exhausted());
    }

    #[test]
    fn success_resets_failures() {
        let mut machine = ScreencopyMachine::new(BufferKind::Shm, 1, 10);
        for _ in 0..9 {
            machine.begin_capture();
            machine.handle_event(ScreencopyEvent::Failed);
        }
        machine.begin_capture();
        machine.handle_event(ScreencopyEvent::Buffer(SHM));
        machine.handle_event(ScreencopyEvent::Flags { y_invert: false });
        machine.handle_event(ScreencopyEvent::Ready);
        machine.finish_frame(true);
        assert_eq!(machine.fail_count().count(), 0);
    }
}
