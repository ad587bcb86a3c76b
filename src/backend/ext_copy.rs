//! Capture through `ext-image-copy-capture-v1`
//!
//! Unlike screencopy, buffer constraints are negotiated once per *session* instead of once per
//! frame. The session sends `buffer_size`, `shm_format`, `dmabuf_device` and `dmabuf_format`
//! followed by `done`; the constraints stay valid until another batch is committed by `done`.
//! Each frame then only attaches a matching buffer and waits for `ready` or `failed`.
//!
//! The destination buffer is reused as long as the committed constraints do not change. A capture
//! requested before the first `done` is remembered and issued as soon as the constraints arrive.
//! A `stopped` session is recreated on the next capture.

use std::mem;

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use tracing::{debug, error, info, trace, warn};
use wayland_client::{protocol::wl_buffer::WlBuffer, Proxy, WEnum};
use wayland_protocols::ext::image_copy_capture::v1::client::{
    ext_image_copy_capture_frame_v1::{self, ExtImageCopyCaptureFrameV1, FailureReason},
    ext_image_copy_capture_manager_v1::{ExtImageCopyCaptureManagerV1, Options},
    ext_image_copy_capture_session_v1::{self, ExtImageCopyCaptureSessionV1},
};

use super::{
    buffer::{BufferError, BufferSlot, DmabufBuffer, DmabufParams, ShmBuffer, ShmParams},
    export_dmabuf::RawArg,
    format::{fourcc_from_shm, WL_SHM_ARGB8888, WL_SHM_XRGB8888},
    import::{ImportError, ImportParams, ShmFrame},
    screencopy::BufferKind,
    BackendError, BackendKind, CancelReason, CaptureBackend, CaptureContext, FailCounter,
};
use crate::{target::TargetKind, utils::Transform};

/// State of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the first batch of buffer constraints
    WaitConstraints,
    /// Constraints are known, frames can be captured
    Ready,
    /// The session ended and has to be recreated
    Stopped,
}

/// State of the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// No frame in flight
    Idle,
    /// Capture requested, waiting for `ready`
    WaitReady,
    /// The last frame was cancelled
    Canceled,
}

/// Why the compositor failed a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFailure {
    /// No reason given
    Unknown,
    /// The attached buffer does not match the current constraints
    BufferConstraints,
    /// The session was stopped
    Stopped,
}

/// Buffer constraints of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Required buffer size
    pub size: Option<(u32, u32)>,
    /// Supported `wl_shm` formats
    pub shm_formats: Vec<u32>,
    /// `dev_t` of the device dmabufs should be allocated on
    pub dmabuf_device: Option<u64>,
    /// Supported dmabuf formats, each with its modifiers
    pub dmabuf_formats: Vec<(u32, Vec<u64>)>,
}

impl Constraints {
    /// Parameters of a shm buffer satisfying the constraints
    ///
    /// Prefers the 8-bit RGB formats every compositor supports.
    pub fn shm_params(&self) -> Option<ShmParams> {
        let (width, height) = self.size?;
        let preferred = [WL_SHM_XRGB8888, WL_SHM_ARGB8888]
            .into_iter()
            .filter(|format| self.shm_formats.contains(format));
        preferred
            .chain(self.shm_formats.iter().copied())
            .find_map(|format| ShmParams::packed(format, width, height))
    }

    /// Parameters of a dmabuf satisfying the constraints
    pub fn dmabuf_params(&self) -> Option<DmabufParams> {
        let (width, height) = self.size?;
        self.dmabuf_formats.iter().find_map(|(format, modifiers)| {
            Some(DmabufParams {
                format: Fourcc::try_from(*format).ok()?,
                width,
                height,
                modifiers: modifiers.clone(),
            })
        })
    }

    /// Whether dmabufs allocated on `device` are usable
    ///
    /// Only a known device differing from the advertised one is a mismatch.
    pub fn device_matches(&self, device: Option<u64>) -> bool {
        match (self.dmabuf_device, device) {
            (Some(wanted), Some(device)) => wanted == device,
            _ => true,
        }
    }

    fn satisfiable(&self, kind: BufferKind) -> bool {
        match kind {
            BufferKind::Shm => self.shm_params().is_some(),
            BufferKind::Dmabuf => self.dmabuf_params().is_some(),
        }
    }
}

/// Input of the [`ExtCopyMachine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtCopyEvent {
    /// session `buffer_size`
    BufferSize {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
    /// session `shm_format`
    ShmFormat(u32),
    /// session `dmabuf_device`, a native endian `dev_t`
    DmabufDevice(Vec<u8>),
    /// session `dmabuf_format`
    DmabufFormat {
        /// DRM fourcc
        format: u32,
        /// Native endian array of 64-bit modifiers
        modifiers: Vec<u8>,
    },
    /// session `done`
    SessionDone,
    /// session `stopped`
    SessionStopped,
    /// frame `transform`
    Transform(Transform),
    /// frame `damage`
    Damage,
    /// frame `presentation_time`
    PresentationTime,
    /// frame `ready`
    Ready,
    /// frame `failed`
    Failed(FrameFailure),
}

impl ExtCopyEvent {
    fn is_session_event(&self) -> bool {
        matches!(
            self,
            ExtCopyEvent::BufferSize { .. }
                | ExtCopyEvent::ShmFormat(_)
                | ExtCopyEvent::DmabufDevice(_)
                | ExtCopyEvent::DmabufFormat { .. }
                | ExtCopyEvent::SessionDone
                | ExtCopyEvent::SessionStopped
        )
    }
}

/// Outcome of requesting a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStart {
    /// Attach a buffer and capture a frame now
    Start,
    /// The constraints are not known yet, the frame starts on `done`
    Deferred,
    /// A frame is already in flight
    Busy,
    /// The session has to be recreated first
    SessionLost,
}

/// Output of the [`ExtCopyMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtCopyStep {
    /// Nothing to do
    Continue,
    /// New constraints were committed
    Configured {
        /// The committed constraints differ from the previous ones and no frame is in flight
        ///
        /// With a frame in flight the reallocation is postponed, see
        /// [`ExtCopyMachine::take_realloc`].
        realloc: bool,
        /// A deferred capture has to be started now
        start_frame: bool,
    },
    /// The frame is ready to be imported
    Complete {
        /// Transform sent with the frame, overriding the target transform
        transform: Option<Transform>,
    },
    /// The frame, or the session, ended without a result
    Canceled(CancelReason),
}

/// Sans-IO state machine of the image copy capture transport
#[derive(Debug)]
pub struct ExtCopyMachine {
    session: SessionState,
    frame: FrameState,
    kind: BufferKind,
    pending: Constraints,
    committed: Option<Constraints>,
    capture_pending: bool,
    realloc_pending: bool,
    frame_transform: Option<Transform>,
    fail: FailCounter,
}

impl ExtCopyMachine {
    /// Create a machine for a freshly created session
    pub fn new(kind: BufferKind, threshold: u32) -> Self {
        ExtCopyMachine {
            session: SessionState::WaitConstraints,
            frame: FrameState::Idle,
            kind,
            pending: Constraints::default(),
            committed: None,
            capture_pending: false,
            realloc_pending: false,
            frame_transform: None,
            fail: FailCounter::new(threshold),
        }
    }

    /// State of the session
    pub fn session_state(&self) -> SessionState {
        self.session
    }

    /// State of the current frame
    pub fn frame_state(&self) -> FrameState {
        self.frame
    }

    /// Committed constraints
    pub fn constraints(&self) -> Option<&Constraints> {
        self.committed.as_ref()
    }

    /// Failure tracking
    pub fn fail_count(&self) -> &FailCounter {
        &self.fail
    }

    /// A new session object replaced the previous one
    ///
    /// Committed constraints are kept, so the buffer survives if the new session agrees with them.
    pub fn session_created(&mut self) {
        self.session = SessionState::WaitConstraints;
        self.pending = Constraints::default();
        self.capture_pending = false;
        if self.frame == FrameState::WaitReady {
            self.frame = FrameState::Idle;
        }
    }

    /// Request a new frame
    pub fn begin_capture(&mut self) -> CaptureStart {
        match (self.session, self.frame) {
            (_, FrameState::WaitReady) => CaptureStart::Busy,
            (SessionState::Stopped, _) => CaptureStart::SessionLost,
            (SessionState::WaitConstraints, _) => {
                self.capture_pending = true;
                CaptureStart::Deferred
            }
            (SessionState::Ready, _) => {
                self.start_frame();
                CaptureStart::Start
            }
        }
    }

    /// Feed a session or frame event
    pub fn handle_event(&mut self, event: ExtCopyEvent) -> ExtCopyStep {
        let session_alive = matches!(self.session, SessionState::WaitConstraints | SessionState::Ready);
        let frame_alive = self.frame == FrameState::WaitReady;
        match event {
            ExtCopyEvent::BufferSize { width, height } if session_alive && width > 0 && height > 0 => {
                self.pending.size = Some((width, height));
                ExtCopyStep::Continue
            }
            ExtCopyEvent::ShmFormat(format) if session_alive => {
                self.pending.shm_formats.push(format);
                ExtCopyStep::Continue
            }
            ExtCopyEvent::DmabufDevice(ref device) if session_alive => match parse_dev(device) {
                Some(dev) => {
                    self.pending.dmabuf_device = Some(dev);
                    ExtCopyStep::Continue
                }
                None => self.violation(event),
            },
            ExtCopyEvent::DmabufFormat { format, ref modifiers } if session_alive => {
                match parse_modifiers(modifiers) {
                    Some(modifiers) => {
                        self.pending.dmabuf_formats.push((format, modifiers));
                        ExtCopyStep::Continue
                    }
                    None => self.violation(event),
                }
            }
            ExtCopyEvent::SessionDone if session_alive => self.commit(),
            ExtCopyEvent::SessionStopped if session_alive => {
                debug!("Capture session stopped");
                self.session = SessionState::Stopped;
                self.capture_pending = false;
                self.cancel(CancelReason::Failed)
            }
            ExtCopyEvent::Transform(transform) if frame_alive => {
                self.frame_transform = Some(transform);
                ExtCopyStep::Continue
            }
            ExtCopyEvent::Damage | ExtCopyEvent::PresentationTime if frame_alive => ExtCopyStep::Continue,
            ExtCopyEvent::Ready if frame_alive => {
                self.frame = FrameState::Idle;
                ExtCopyStep::Complete {
                    transform: self.frame_transform.take(),
                }
            }
            ExtCopyEvent::Failed(failure) if frame_alive => {
                debug!(?failure, "Capture frame failed");
                self.cancel(match failure {
                    FrameFailure::BufferConstraints | FrameFailure::Stopped => CancelReason::Benign,
                    FrameFailure::Unknown => CancelReason::Failed,
                })
            }
            event => self.violation(event),
        }
    }

    /// Whether buffers made stale by a commit during the last frame can be released now
    ///
    /// The buffer attached to a frame in flight stays alive until the frame ended.
    pub fn take_realloc(&mut self) -> bool {
        if self.frame == FrameState::WaitReady {
            return false;
        }
        mem::take(&mut self.realloc_pending)
    }

    /// The destination buffer for a started frame could not be provided
    pub fn allocation_failed(&mut self) -> ExtCopyStep {
        self.cancel(CancelReason::Allocation)
    }

    /// Report the outcome of importing a completed frame
    pub fn finish_frame(&mut self, imported: bool) {
        if imported {
            self.fail.reset();
        } else {
            self.frame = FrameState::Canceled;
            self.fail.record(CancelReason::Import);
        }
    }

    fn start_frame(&mut self) {
        self.frame = FrameState::WaitReady;
        self.frame_transform = None;
    }

    fn commit(&mut self) -> ExtCopyStep {
        let constraints = mem::take(&mut self.pending);
        if constraints.size.is_none() {
            error!("Capture session committed constraints without a buffer size");
            self.session = SessionState::Stopped;
            return self.cancel(CancelReason::ProtocolViolation);
        }
        if !constraints.satisfiable(self.kind) {
            warn!(kind = ?self.kind, ?constraints, "No usable buffer format offered");
            self.session = SessionState::Stopped;
            return self.cancel(CancelReason::Failed);
        }

        trace!(?constraints, "Capture constraints committed");
        let mut realloc = self.committed.as_ref() != Some(&constraints);
        if realloc && self.frame == FrameState::WaitReady {
            trace!("Constraints changed with a frame in flight, keeping its buffer");
            self.realloc_pending = true;
            realloc = false;
        }
        self.committed = Some(constraints);
        self.session = SessionState::Ready;
        let start_frame = mem::take(&mut self.capture_pending) && self.frame != FrameState::WaitReady;
        if start_frame {
            self.start_frame();
        }
        ExtCopyStep::Configured { realloc, start_frame }
    }

    fn violation(&mut self, event: ExtCopyEvent) -> ExtCopyStep {
        error!(session = ?self.session, frame = ?self.frame, ?event, "Unexpected image copy capture event");
        if event.is_session_event() {
            self.session = SessionState::Stopped;
        }
        self.cancel(CancelReason::ProtocolViolation)
    }

    fn cancel(&mut self, reason: CancelReason) -> ExtCopyStep {
        self.frame = FrameState::Canceled;
        if self.fail.record(reason) {
            warn!(?reason, failures = self.fail.count(), "Image copy capture failed");
        }
        ExtCopyStep::Canceled(reason)
    }
}

fn parse_dev(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_ne_bytes)
}

fn parse_modifiers(bytes: &[u8]) -> Option<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return None;
    }
    bytes
        .chunks_exact(8)
        .map(|chunk| <[u8; 8]>::try_from(chunk).ok().map(u64::from_ne_bytes))
        .collect()
}

/// Capture backend using `ext-image-copy-capture-v1`
#[derive(Debug)]
pub struct ExtCopyBackend {
    machine: ExtCopyMachine,
    kind: BufferKind,
    manager: ExtImageCopyCaptureManagerV1,
    session: Option<ExtImageCopyCaptureSessionV1>,
    frame: Option<ExtImageCopyCaptureFrameV1>,
    paint_cursors: bool,
    shm: BufferSlot<ShmBuffer>,
    dmabuf: BufferSlot<DmabufBuffer>,
}

impl ExtCopyBackend {
    /// Create the backend and its capture session
    pub fn new(kind: BackendKind, ctx: &mut CaptureContext<'_>) -> Result<Self, BackendError> {
        let manager = ctx
            .globals
            .image_copy_capture_manager
            .clone()
            .ok_or(BackendError::MissingCapability("ext_image_copy_capture_manager_v1"))?;
        match ctx.target.kind {
            TargetKind::Null => return Err(BackendError::UnsupportedTarget),
            TargetKind::Output { .. } if ctx.globals.output_source_manager.is_none() => {
                return Err(BackendError::MissingCapability(
                    "ext_output_image_capture_source_manager_v1",
                ))
            }
            TargetKind::Toplevel { .. } if ctx.globals.toplevel_source_manager.is_none() => {
                return Err(BackendError::MissingCapability(
                    "ext_foreign_toplevel_image_capture_source_manager_v1",
                ))
            }
            _ => {}
        }
        let buffer_kind = if kind == BackendKind::ExtCopyDmabuf {
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

        let mut backend = ExtCopyBackend {
            machine: ExtCopyMachine::new(buffer_kind, ctx.options.fatal_fail_count),
            kind: buffer_kind,
            manager,
            session: None,
            frame: None,
            paint_cursors: ctx.options.show_cursor,
            shm: BufferSlot::default(),
            dmabuf: BufferSlot::default(),
        };
        backend.create_session(ctx)?;
        Ok(backend)
    }

    fn create_session(&mut self, ctx: &mut CaptureContext<'_>) -> Result<(), BackendError> {
        self.destroy_session();

        if ctx.target.source.is_none() {
            let source = match &ctx.target.kind {
                TargetKind::Output { output, .. } => ctx
                    .globals
                    .output_source_manager
                    .as_ref()
                    .map(|manager| manager.create_source(output, ctx.qh, ())),
                TargetKind::Toplevel { handle } => ctx
                    .globals
                    .toplevel_source_manager
                    .as_ref()
                    .map(|manager| manager.create_source(handle, ctx.qh, ())),
                TargetKind::Null => None,
            };
            ctx.target.source = source;
        }
        let source = ctx
            .target
            .source
            .as_ref()
            .ok_or(BackendError::Setup("no image capture source".into()))?;

        self.paint_cursors = ctx.options.show_cursor;
        let options = if self.paint_cursors {
            Options::PaintCursors
        } else {
            Options::empty()
        };
        self.session = Some(self.manager.create_session(source, options, ctx.qh, ()));
        self.machine.session_created();
        debug!(paint_cursors = self.paint_cursors, "Created capture session");
        Ok(())
    }

    fn destroy_session(&mut self) {
        self.destroy_frame();
        if let Some(session) = self.session.take() {
            session.destroy();
        }
    }

    fn destroy_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }

    /// Handle an event of the session object
    pub fn handle_session_event(
        &mut self,
        ctx: &mut CaptureContext<'_>,
        session: &ExtImageCopyCaptureSessionV1,
        event: ext_image_copy_capture_session_v1::Event,
    ) {
        if self.session.as_ref() != Some(session) {
            trace!(session = ?session.id(), "Event for stale capture session");
            return;
        }

        use ext_image_copy_capture_session_v1::Event;
        let event = match event {
            Event::BufferSize { width, height } => ExtCopyEvent::BufferSize { width, height },
            Event::ShmFormat { format } => ExtCopyEvent::ShmFormat(format.raw()),
            Event::DmabufDevice { device } => ExtCopyEvent::DmabufDevice(device),
            Event::DmabufFormat { format, modifiers } => ExtCopyEvent::DmabufFormat { format, modifiers },
            Event::Done => ExtCopyEvent::SessionDone,
            Event::Stopped => ExtCopyEvent::SessionStopped,
            _ => return,
        };

        match self.machine.handle_event(event) {
            ExtCopyStep::Configured { realloc, start_frame } => {
                if realloc {
                    self.shm.release();
                    self.dmabuf.release();
                }
                if start_frame {
                    self.start_frame(ctx);
                }
            }
            ExtCopyStep::Canceled(_) => {
                if self.machine.session_state() == SessionState::Stopped {
                    self.destroy_session();
                } else {
                    self.destroy_frame();
                }
                self.release_stale_buffers();
            }
            ExtCopyStep::Continue | ExtCopyStep::Complete { .. } => {}
        }
    }

    /// Handle an event of a frame object
    pub fn handle_frame_event(
        &mut self,
        ctx: &mut CaptureContext<'_>,
        frame: &ExtImageCopyCaptureFrameV1,
        event: ext_image_copy_capture_frame_v1::Event,
    ) {
        if self.frame.as_ref() != Some(frame) {
            trace!(frame = ?frame.id(), "Event for stale capture frame");
            return;
        }

        use ext_image_copy_capture_frame_v1::Event;
        let event = match event {
            Event::Transform { transform } => ExtCopyEvent::Transform(Transform::from(transform)),
            Event::Damage { .. } => ExtCopyEvent::Damage,
            Event::PresentationTime { .. } => ExtCopyEvent::PresentationTime,
            Event::Ready => ExtCopyEvent::Ready,
            Event::Failed { reason } => ExtCopyEvent::Failed(match reason {
                WEnum::Value(FailureReason::BufferConstraints) => FrameFailure::BufferConstraints,
                WEnum::Value(FailureReason::Stopped) => FrameFailure::Stopped,
                _ => FrameFailure::Unknown,
            }),
            _ => return,
        };

        match self.machine.handle_event(event) {
            ExtCopyStep::Complete { transform } => {
                self.destroy_frame();
                let params = ImportParams {
                    invert_y: false,
                    region_aware: false,
                    transform: transform.unwrap_or(ctx.target.transform),
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
                    warn!(%err, "Failed to import captured frame");
                }
                self.machine.finish_frame(result.is_ok());
                self.release_stale_buffers();
            }
            ExtCopyStep::Canceled(_) => {
                if self.machine.session_state() == SessionState::Stopped {
                    self.destroy_session();
                } else {
                    self.destroy_frame();
                }
                self.release_stale_buffers();
            }
            ExtCopyStep::Continue | ExtCopyStep::Configured { .. } => {}
        }
    }

    fn release_stale_buffers(&mut self) {
        if self.machine.take_realloc() {
            self.shm.release();
            self.dmabuf.release();
        }
    }

    fn start_frame(&mut self, ctx: &mut CaptureContext<'_>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some((buffer, (width, height))) = self.ensure_buffer(ctx) else {
            self.machine.allocation_failed();
            return;
        };

        let frame = session.create_frame(ctx.qh, ());
        frame.attach_buffer(&buffer);
        frame.damage_buffer(0, 0, width as i32, height as i32);
        frame.capture();
        self.frame = Some(frame);
    }

    fn ensure_buffer(&mut self, ctx: &mut CaptureContext<'_>) -> Option<(WlBuffer, (u32, u32))> {
        let constraints = self.machine.constraints()?;
        match self.kind {
            BufferKind::Shm => {
                let params = constraints.shm_params()?;
                self.shm.retain(|buffer| *buffer.params() == params);
                if !self.shm.is_allocated() {
                    let shm = ctx.globals.shm.as_ref()?;
                    if let Err(err) = self.shm.allocate(|| ShmBuffer::new(shm, ctx.qh, params)) {
                        warn!(%err, "Failed to allocate shm buffer");
                        return None;
                    }
                }
                self.shm
                    .get()
                    .map(|buffer| (buffer.wl_buffer().clone(), (params.width, params.height)))
            }
            BufferKind::Dmabuf => {
                let params = constraints.dmabuf_params()?;
                self.dmabuf.retain(|buffer| *buffer.params() == params);
                if !self.dmabuf.is_allocated() {
                    let linux_dmabuf = ctx.globals.linux_dmabuf.as_ref()?;
                    let allocator = ctx.allocator.as_mut()?;
                    if !constraints.device_matches(allocator.device()) {
                        warn!(
                            wanted = ?constraints.dmabuf_device,
                            render_node = %ctx.options.render_node.display(),
                            "Allocating dmabufs on a different device than the compositor asked for"
                        );
                    }
                    let modifiers: Vec<Modifier> = params.modifiers.iter().copied().map(Modifier::from).collect();
                    let allocated = self.dmabuf.allocate(|| {
                        let dmabuf = allocator
                            .allocate(params.width, params.height, params.format, &modifiers)
                            .map_err(|err| {
                                warn!(%err, "Failed to allocate dmabuf");
                                BufferError::UnsupportedFormat(params.format as u32)
                            })?;
                        Ok(DmabufBuffer::new(linux_dmabuf, ctx.qh, dmabuf, params.clone()))
                    });
                    if allocated.is_err() {
                        return None;
                    }
                }
                self.dmabuf
                    .get()
                    .map(|buffer| (buffer.wl_buffer().clone(), (params.width, params.height)))
            }
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

impl CaptureBackend for ExtCopyBackend {
    fn kind(&self) -> BackendKind {
        match self.kind {
            BufferKind::Shm => BackendKind::ExtCopyShm,
            BufferKind::Dmabuf => BackendKind::ExtCopyDmabuf,
        }
    }

    fn capture(&mut self, ctx: &mut CaptureContext<'_>) {
        match self.machine.begin_capture() {
            CaptureStart::Start => self.start_frame(ctx),
            CaptureStart::Deferred | CaptureStart::Busy => {}
            CaptureStart::SessionLost => {
                info!("Recreating stopped capture session");
                if let Err(err) = self.create_session(ctx) {
                    warn!(%err, "Failed to recreate capture session");
                    return;
                }
                self.machine.begin_capture();
            }
        }
    }

    fn cleanup(&mut self, ctx: &mut CaptureContext<'_>) {
        self.destroy_session();
        self.shm.release();
        self.dmabuf.release();
        ctx.target.release_source();
    }

    fn on_options_updated(&mut self, ctx: &mut CaptureContext<'_>) -> bool {
        if ctx.options.show_cursor == self.paint_cursors {
            return true;
        }
        match self.create_session(ctx) {
            Ok(()) => {
                self.machine.begin_capture();
                true
            }
            Err(err) => {
                warn!(%err, "Failed to recreate capture session");
                false
            }
        }
    }

    fn fail_count(&self) -> &FailCounter {
        self.machine.fail_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modifiers_bytes(modifiers: &[u64]) -> Vec<u8> {
        modifiers.iter().flat_map(|modifier| modifier.to_ne_bytes()).collect()
    }

    fn all_events() -> Vec<ExtCopyEvent> {
        vec![
            ExtCopyEvent::BufferSize {
                width: 800,
                height: 600,
            },
            ExtCopyEvent::ShmFormat(WL_SHM_XRGB8888),
            ExtCopyEvent::DmabufDevice(0xe280u64.to_ne_bytes().to_vec()),
            ExtCopyEvent::DmabufFormat {
                format: Fourcc::Xrgb8888 as u32,
                modifiers: modifiers_bytes(&[0]),
            },
            ExtCopyEvent::SessionDone,
            ExtCopyEvent::SessionStopped,
            ExtCopyEvent::Transform(Transform::_90),
            ExtCopyEvent::Damage,
            ExtCopyEvent::PresentationTime,
            ExtCopyEvent::Ready,
            ExtCopyEvent::Failed(FrameFailure::Unknown),
        ]
    }

    fn offer(machine: &mut ExtCopyMachine, width: u32) {
        machine.handle_event(ExtCopyEvent::BufferSize { width, height: 600 });
        machine.handle_event(ExtCopyEvent::ShmFormat(WL_SHM_XRGB8888));
    }

    fn ready_machine() -> ExtCopyMachine {
        let mut machine = ExtCopyMachine::new(BufferKind::Shm, 10);
        offer(&mut machine, 800);
        machine.handle_event(ExtCopyEvent::SessionDone);
        machine
    }

    fn machine_in(session: SessionState, frame: FrameState) -> ExtCopyMachine {
        let mut machine = match (session, frame) {
            (SessionState::WaitConstraints, FrameState::Idle) => ExtCopyMachine::new(BufferKind::Shm, 10),
            (SessionState::Ready, FrameState::Idle) => ready_machine(),
            (SessionState::Ready, FrameState::WaitReady) => {
                let mut machine = ready_machine();
                machine.begin_capture();
                machine
            }
            (SessionState::Ready, FrameState::Canceled) => {
                let mut machine = ready_machine();
                machine.begin_capture();
                machine.handle_event(ExtCopyEvent::Failed(FrameFailure::BufferConstraints));
                machine
            }
            (SessionState::Stopped, FrameState::Canceled) => {
                let mut machine = ready_machine();
                machine.handle_event(ExtCopyEvent::SessionStopped);
                machine
            }
            (SessionState::WaitConstraints, FrameState::Canceled) => {
                let mut machine = ready_machine();
                machine.handle_event(ExtCopyEvent::SessionStopped);
                machine.session_created();
                machine
            }
            other => unreachable!("{:?}", other),
        };
        if session != SessionState::Stopped {
            offer(&mut machine, 800);
        }
        machine.fail.reset();
        assert_eq!((machine.session_state(), machine.frame_state()), (session, frame));
        machine
    }

    #[test]
    fn transition_table_is_enforced() {
        let states = [
            (SessionState::WaitConstraints, FrameState::Idle),
            (SessionState::WaitConstraints, FrameState::Canceled),
            (SessionState::Ready, FrameState::Idle),
            (SessionState::Ready, FrameState::WaitReady),
            (SessionState::Ready, FrameState::Canceled),
            (SessionState::Stopped, FrameState::Canceled),
        ];
        for (session, frame) in states {
            for event in all_events() {
                let mut machine = machine_in(session, frame);
                let accepted = if event.is_session_event() {
                    session != SessionState::Stopped
                } else {
                    frame == FrameState::WaitReady
                };
                let step = machine.handle_event(event.clone());
                let rejected = step == ExtCopyStep::Canceled(CancelReason::ProtocolViolation);
                assert_eq!(
                    accepted, !rejected,
                    "{:?}/{:?} handling {:?} gave {:?}",
                    session, frame, event, step
                );
                if rejected {
                    assert_eq!(machine.fail_count().count(), 1);
                    assert_eq!(machine.frame_state(), FrameState::Canceled);
                }
            }
        }
    }

    #[test]
    fn capture_before_constraints_is_deferred() {
        let mut machine = ExtCopyMachine::new(BufferKind::Shm, 10);
        assert_eq!(machine.begin_capture(), CaptureStart::Deferred);
        offer(&mut machine, 800);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Configured {
                realloc: true,
                start_frame: true
            }
        );
        assert_eq!(machine.frame_state(), FrameState::WaitReady);
        assert_eq!(machine.begin_capture(), CaptureStart::Busy);
    }

    #[test]
    fn buffer_is_reallocated_only_on_change() {
        let mut machine = ready_machine();
        offer(&mut machine, 800);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Configured {
                realloc: false,
                start_frame: false
            }
        );
        offer(&mut machine, 1024);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Configured {
                realloc: true,
                start_frame: false
            }
        );
        assert_eq!(machine.constraints().and_then(|c| c.size), Some((1024, 600)));
    }

    #[test]
    fn buffer_of_a_frame_in_flight_outlives_new_constraints() {
        let mut machine = ready_machine();
        assert_eq!(machine.begin_capture(), CaptureStart::Start);
        offer(&mut machine, 1024);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Configured {
                realloc: false,
                start_frame: false
            }
        );
        assert!(!machine.take_realloc());
        assert_eq!(
            machine.handle_event(ExtCopyEvent::Ready),
            ExtCopyStep::Complete { transform: None }
        );
        machine.finish_frame(true);
        assert!(machine.take_realloc());
        assert!(!machine.take_realloc());
        assert_eq!(machine.constraints().and_then(|c| c.size), Some((1024, 600)));
    }

    #[test]
    fn postponed_realloc_happens_after_a_failed_frame() {
        let mut machine = ready_machine();
        machine.begin_capture();
        offer(&mut machine, 640);
        machine.handle_event(ExtCopyEvent::SessionDone);
        assert!(!machine.take_realloc());
        machine.handle_event(ExtCopyEvent::Failed(FrameFailure::BufferConstraints));
        assert!(machine.take_realloc());
    }

    #[test]
    fn resize_failures_are_benign() {
        let mut machine = ready_machine();
        for _ in 0..100 {
            assert_eq!(machine.begin_capture(), CaptureStart::Start);
            assert_eq!(
                machine.handle_event(ExtCopyEvent::Failed(FrameFailure::BufferConstraints)),
                ExtCopyStep::Canceled(CancelReason::Benign)
            );
        }
        assert_eq!(machine.fail_count().count(), 0);
    }

    #[test]
    fn stopped_session_is_recreated_and_counted() {
        let mut machine = ready_machine();
        for _ in 0..10 {
            machine.handle_event(ExtCopyEvent::SessionStopped);
            assert_eq!(machine.begin_capture(), CaptureStart::SessionLost);
            machine.session_created();
            assert_eq!(machine.begin_capture(), CaptureStart::Deferred);
            offer(&mut machine, 800);
            machine.handle_event(ExtCopyEvent::SessionDone);
            assert_eq!(machine.frame_state(), FrameState::WaitReady);
            machine.handle_event(ExtCopyEvent::Failed(FrameFailure::Stopped));
        }
        assert!(machine.fail_count().is_exhausted());
    }

    #[test]
    fn frame_transform_overrides_for_one_frame() {
        let mut machine = ready_machine();
        machine.begin_capture();
        machine.handle_event(ExtCopyEvent::Transform(Transform::_180));
        machine.handle_event(ExtCopyEvent::Damage);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::Ready),
            ExtCopyStep::Complete {
                transform: Some(Transform::_180)
            }
        );
        machine.finish_frame(true);
        machine.begin_capture();
        assert_eq!(
            machine.handle_event(ExtCopyEvent::Ready),
            ExtCopyStep::Complete { transform: None }
        );
    }

    #[test]
    fn malformed_dmabuf_constraints_are_violations() {
        let mut machine = ExtCopyMachine::new(BufferKind::Dmabuf, 10);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::DmabufFormat {
                format: Fourcc::Xrgb8888 as u32,
                modifiers: vec![0; 7],
            }),
            ExtCopyStep::Canceled(CancelReason::ProtocolViolation)
        );
        assert_eq!(machine.session_state(), SessionState::Stopped);

        let mut machine = ExtCopyMachine::new(BufferKind::Dmabuf, 10);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::DmabufDevice(vec![1, 2, 3])),
            ExtCopyStep::Canceled(CancelReason::ProtocolViolation)
        );
    }

    #[test]
    fn unusable_constraints_fail_the_session() {
        let mut machine = ExtCopyMachine::new(BufferKind::Dmabuf, 10);
        offer(&mut machine, 800);
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Canceled(CancelReason::Failed)
        );
        assert_eq!(machine.session_state(), SessionState::Stopped);

        let mut machine = ExtCopyMachine::new(BufferKind::Shm, 10);
        machine.handle_event(ExtCopyEvent::ShmFormat(WL_SHM_XRGB8888));
        assert_eq!(
            machine.handle_event(ExtCopyEvent::SessionDone),
            ExtCopyStep::Canceled(CancelReason::ProtocolViolation)
        );
    }

    #[test]
    fn constraints_pick_preferred_formats() {
        let constraints = Constraints {
            size: Some((10, 10)),
            shm_formats: vec![0x3432_4258, WL_SHM_ARGB8888, WL_SHM_XRGB8888],
            dmabuf_device: None,
            dmabuf_formats: vec![
                (0xdead_beef, vec![]),
                (Fourcc::Argb8888 as u32, vec![0, 1]),
            ],
        };
        assert_eq!(constraints.shm_params().map(|p| p.format), Some(WL_SHM_XRGB8888));
        let dmabuf = constraints.dmabuf_params().unwrap();
        assert_eq!(dmabuf.format, Fourcc::Argb8888);
        assert_eq!(dmabuf.modifiers, vec![0, 1]);
    }

    #[test]
    fn dmabuf_device_is_compared_when_both_are_known() {
        let mut machine = ExtCopyMachine::new(BufferKind::Dmabuf, 10);
        machine.handle_event(ExtCopyEvent::BufferSize { width: 64, height: 64 });
        machine.handle_event(ExtCopyEvent::DmabufDevice(0xe280u64.to_ne_bytes().to_vec()));
        machine.handle_event(ExtCopyEvent::DmabufFormat {
            format: Fourcc::Xrgb8888 as u32,
            modifiers: modifiers_bytes(&[0]),
        });
        machine.handle_event(ExtCopyEvent::SessionDone);
        let constraints = machine.constraints().unwrap();
        assert_eq!(constraints.dmabuf_device, Some(0xe280));
        assert!(constraints.device_matches(Some(0xe280)));
        assert!(!constraints.device_matches(Some(0xe281)));
        assert!(constraints.device_matches(None));
        assert!(Constraints::default().device_matches(Some(0xe281)));
    }

    #[test]
    fn modifier_arrays_are_native_endian_u64s() {
        assert_eq!(parse_modifiers(&modifiers_bytes(&[1, u64::MAX])), Some(vec![1, u64::MAX]));
        assert_eq!(parse_modifiers(&[]), Some(vec![]));
        assert_eq!(parse_modifiers(&[0; 9]), None);
        assert_eq!(parse_dev(&7u64.to_ne_bytes()), Some(7));
    }
}
