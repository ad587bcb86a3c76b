//! The runtime state
//!
//! [`MirrorState`] is the data every calloop and wayland-client callback receives. It is composed of
//! small sub-states, each only handed to the code that needs it: the registry, the output and
//! toplevel lists, the window association and the [`Mirror`] controller. Backends never see the
//! whole state, they get a [`CaptureContext`](crate::backend::CaptureContext) assembled from the
//! pieces they are allowed to touch.

use calloop::LoopHandle;
use tracing::{debug, error, info, trace};
use wayland_client::{
    delegate_noop, event_created_child,
    protocol::{
        wl_buffer::WlBuffer,
        wl_callback::{self, WlCallback},
        wl_compositor::WlCompositor,
        wl_output::{self, WlOutput},
        wl_registry::{self, WlRegistry},
        wl_shm::WlShm,
        wl_shm_pool::WlShmPool,
    },
    Connection, Dispatch, Proxy, QueueHandle, WEnum,
};
use wayland_protocols::{
    ext::{
        foreign_toplevel_list::v1::client::{
            ext_foreign_toplevel_handle_v1::{self, ExtForeignToplevelHandleV1},
            ext_foreign_toplevel_list_v1::{self, ExtForeignToplevelListV1},
        },
        image_capture_source::v1::client::{
            ext_foreign_toplevel_image_capture_source_manager_v1::ExtForeignToplevelImageCaptureSourceManagerV1,
            ext_image_capture_source_v1::ExtImageCaptureSourceV1,
            ext_output_image_capture_source_manager_v1::ExtOutputImageCaptureSourceManagerV1,
        },
        image_copy_capture::v1::client::{
            ext_image_copy_capture_frame_v1::{self, ExtImageCopyCaptureFrameV1},
            ext_image_copy_capture_manager_v1::ExtImageCopyCaptureManagerV1,
            ext_image_copy_capture_session_v1::{self, ExtImageCopyCaptureSessionV1},
        },
    },
    wp::linux_dmabuf::zv1::client::{
        zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
    },
    xdg::xdg_output::zv1::client::{
        zxdg_output_manager_v1::ZxdgOutputManagerV1,
        zxdg_output_v1::{self, ZxdgOutputV1},
    },
};
use wayland_protocols_wlr::{
    export_dmabuf::v1::client::{
        zwlr_export_dmabuf_frame_v1::{self, ZwlrExportDmabufFrameV1},
        zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
    },
    screencopy::v1::client::{
        zwlr_screencopy_frame_v1::{self, ZwlrScreencopyFrameV1},
        zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
    },
};

use crate::{
    backend::{
        allocator::DmabufAllocator, import::TextureImporter, portal::MediaTransport, Backend, CaptureContext,
    },
    config::MirrorOptions,
    mirror::{Mirror, MirrorEnv, MirrorError},
    utils::Transform,
    wayland::{
        output::{OutputChanges, OutputEvent, OutputList, OutputNotification},
        registry::{self, RegistryState},
        toplevel::ToplevelList,
        window::WindowOutputs,
    },
};

/// Protocol objects of one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHandles {
    /// The `wl_output`
    pub wl: WlOutput,
    /// Its `zxdg_output_v1`, if the manager is available
    pub xdg: Option<ZxdgOutputV1>,
}

/// User data of the initial `wl_display.sync` callback
#[derive(Debug, Clone, Copy)]
pub struct InitialSync;

/// Collaborators provided by the embedder
#[derive(Debug)]
pub struct Collaborators {
    /// Consumer of captured frames
    pub importer: Box<dyn TextureImporter>,
    /// Allocator for dmabuf destination buffers
    pub allocator: Option<Box<dyn DmabufAllocator>>,
    /// Media stream consumer of the portal backend
    pub transport: Option<Box<dyn MediaTransport>>,
}

/// State shared by every callback
#[derive(Debug)]
pub struct MirrorState {
    /// Registry and bound globals
    pub registry: RegistryState,
    /// Advertised outputs
    pub outputs: OutputList<OutputHandles>,
    /// Advertised toplevels
    pub toplevels: ToplevelList<ExtForeignToplevelHandleV1>,
    /// Outputs the mirror window is shown on
    pub window: WindowOutputs,
    /// The mirroring session
    pub mirror: Mirror,
    importer: Box<dyn TextureImporter>,
    allocator: Option<Box<dyn DmabufAllocator>>,
    transport: Option<Box<dyn MediaTransport>>,
    loop_handle: LoopHandle<'static, MirrorState>,
    qh: QueueHandle<MirrorState>,
    connection: Connection,
    /// Set once the event loop should stop
    pub closing: bool,
    fatal: Option<MirrorError>,
}

impl MirrorState {
    /// Create the state for a fresh connection
    pub fn new(
        connection: Connection,
        registry: WlRegistry,
        qh: QueueHandle<MirrorState>,
        loop_handle: LoopHandle<'static, MirrorState>,
        options: MirrorOptions,
        collaborators: Collaborators,
    ) -> MirrorState {
        MirrorState {
            registry: RegistryState::new(registry),
            outputs: OutputList::new(None),
            toplevels: ToplevelList::default(),
            window: WindowOutputs::default(),
            mirror: Mirror::new(options),
            importer: collaborators.importer,
            allocator: collaborators.allocator,
            transport: collaborators.transport,
            loop_handle,
            qh,
            connection,
            closing: false,
            fatal: None,
        }
    }

    /// The wayland connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Queue handle of the main event queue
    pub fn queue_handle(&self) -> &QueueHandle<MirrorState> {
        &self.qh
    }

    /// Terminate the session with `err`
    ///
    /// Only the first error is kept.
    pub fn fatal(&mut self, err: MirrorError) {
        error!("Fatal: {}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        self.closing = true;
    }

    /// Take the error that ended the session, if any
    pub fn take_error(&mut self) -> Option<MirrorError> {
        self.fatal.take()
    }

    fn with_mirror<R>(
        &mut self,
        f: impl FnOnce(
            &mut Mirror,
            &mut MirrorEnv<'_>,
            &OutputList<OutputHandles>,
            Option<&ToplevelList<ExtForeignToplevelHandleV1>>,
        ) -> Result<R, MirrorError>,
    ) -> Option<R> {
        let MirrorState {
            registry,
            outputs,
            toplevels,
            mirror,
            importer,
            allocator,
            transport,
            loop_handle,
            qh,
            ..
        } = self;
        let toplevels = registry.globals.toplevel_list.as_ref().map(|_| &*toplevels);
        let mut env = MirrorEnv {
            qh,
            globals: &registry.globals,
            loop_handle,
            importer: importer.as_mut(),
            allocator,
            transport,
        };
        match f(mirror, &mut env, outputs, toplevels) {
            Ok(result) => Some(result),
            Err(err) => {
                self.fatal(err);
                None
            }
        }
    }

    fn backend_event(&mut self, f: impl FnOnce(&mut Backend, &mut CaptureContext<'_>)) {
        self.with_mirror(|mirror, env, _, _| mirror.dispatch(env, f));
    }

    /// Request the next frame
    ///
    /// Called by the frame clock; legal from within any callback.
    pub fn request_frame(&mut self) {
        if self.closing {
            return;
        }
        self.with_mirror(|mirror, env, _, _| mirror.request_frame(env));
    }

    /// Apply new options to the running session
    pub fn update_options(&mut self, options: MirrorOptions) {
        self.with_mirror(|mirror, env, outputs, toplevels| {
            mirror.update_options(env, outputs, toplevels, options)
        });
    }

    /// Stop mirroring and ask the event loop to exit
    pub fn close(&mut self) {
        info!("Closing mirror");
        self.with_mirror(|mirror, env, _, _| {
            mirror.stop(env);
            Ok(())
        });
        self.closing = true;
    }

    /// The mirror window entered an output
    pub fn window_entered(&mut self, output: &WlOutput) {
        if let Some(global) = self.output_global(output) {
            self.window.enter(global);
        }
    }

    /// The mirror window left an output
    pub fn window_left(&mut self, output: &WlOutput) {
        if let Some(global) = self.output_global(output) {
            self.window.leave(global);
        }
    }

    /// Scale and transform the mirror window is presented with
    pub fn window_presentation(&self) -> (i32, Transform) {
        self.window.presentation(&self.outputs)
    }

    fn output_global(&self, output: &WlOutput) -> Option<u32> {
        self.outputs
            .iter()
            .find(|entry| &entry.handle().wl == output)
            .map(|entry| entry.global())
    }

    pub(crate) fn output_added(&mut self, global: u32, output: WlOutput, qh: &QueueHandle<MirrorState>) {
        let xdg = self
            .registry
            .globals
            .xdg_output_manager
            .as_ref()
            .map(|manager| manager.get_xdg_output(&output, qh, global));
        self.outputs.add(global, OutputHandles { wl: output, xdg });
    }

    pub(crate) fn output_removed(&mut self, global: u32) {
        self.window.leave(global);
        if let Some(entry) = self.outputs.remove(global) {
            let handles = entry.handle();
            if let Some(xdg) = &handles.xdg {
                xdg.destroy();
            }
            if handles.wl.version() >= 3 {
                handles.wl.release();
            }
        }
        self.with_mirror(|mirror, env, _, _| mirror.output_removed(env, global));
        // a vanished incomplete output may have been the last one blocking the barrier
        self.check_outputs_ready();
    }

    pub(crate) fn capability_removed(&mut self, interface: &str) {
        self.with_mirror(|mirror, env, _, _| mirror.capability_removed(env, interface));
    }

    /// Start mirroring once the registry is synced and every output is complete
    pub(crate) fn check_outputs_ready(&mut self) {
        if self.closing || !self.outputs.take_initial_ready(self.registry.ledger.is_synced()) {
            return;
        }
        self.with_mirror(|mirror, env, outputs, toplevels| mirror.start(env, outputs, toplevels));
    }

    fn output_event(&mut self, global: u32, event: OutputEvent) {
        match self.outputs.handle_event(global, event) {
            Some(OutputNotification::Completed(_)) => self.check_outputs_ready(),
            Some(OutputNotification::Changed(global, _)) => {
                let changes = self.outputs.take_changes(global);
                trace!(global, ?changes, "Consumed output changes");
                if !changes.contains(OutputChanges::TRANSFORM) {
                    return;
                }
                if let Some(entry) = self.outputs.get(global) {
                    let transform = entry.info().transform;
                    self.mirror.output_transform_changed(global, transform);
                }
            }
            None => {}
        }
    }

    #[cfg(feature = "xdg_portal")]
    pub(crate) fn portal_message(&mut self, message: dbus::Message) {
        self.backend_event(|backend, ctx| {
            if let Backend::Portal(portal) = backend {
                portal.handle_message(ctx, message);
            }
        });
    }
}

impl Dispatch<WlRegistry, ()> for MirrorState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => registry::global_added(state, registry, name, &interface, version, qh),
            wl_registry::Event::GlobalRemove { name } => registry::global_removed(state, name),
            _ => {}
        }
    }
}

impl Dispatch<WlCallback, InitialSync> for MirrorState {
    fn event(
        state: &mut Self,
        _: &WlCallback,
        event: wl_callback::Event,
        _: &InitialSync,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            registry::initial_sync_done(state);
        }
    }
}

impl Dispatch<WlOutput, u32> for MirrorState {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        global: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let event = match event {
            wl_output::Event::Geometry { transform, .. } => OutputEvent::Transform(transform.into()),
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                ..
            } if flags.contains(wl_output::Mode::Current) => OutputEvent::Mode(width, height),
            wl_output::Event::Scale { factor } => OutputEvent::Scale(factor),
            wl_output::Event::Name { name } => OutputEvent::Name(name),
            wl_output::Event::Done => OutputEvent::WlDone,
            _ => return,
        };
        state.output_event(*global, event);
    }
}

impl Dispatch<ZxdgOutputV1, u32> for MirrorState {
    fn event(
        state: &mut Self,
        _: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        global: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let event = match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => OutputEvent::LogicalPosition(x, y),
            zxdg_output_v1::Event::LogicalSize { width, height } => OutputEvent::LogicalSize(width, height),
            zxdg_output_v1::Event::Name { name } => OutputEvent::Name(name),
            zxdg_output_v1::Event::Done => OutputEvent::XdgDone,
            _ => return,
        };
        state.output_event(*global, event);
    }
}

impl Dispatch<ExtForeignToplevelListV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        _: &ExtForeignToplevelListV1,
        event: ext_foreign_toplevel_list_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            ext_foreign_toplevel_list_v1::Event::Toplevel { toplevel } => state.toplevels.add(toplevel),
            ext_foreign_toplevel_list_v1::Event::Finished => debug!("Toplevel list finished"),
            _ => {}
        }
    }

    event_created_child!(MirrorState, ExtForeignToplevelListV1, [
        ext_foreign_toplevel_list_v1::EVT_TOPLEVEL_OPCODE => (ExtForeignToplevelHandleV1, ()),
    ]);
}

impl Dispatch<ExtForeignToplevelHandleV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        handle: &ExtForeignToplevelHandleV1,
        event: ext_foreign_toplevel_handle_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        use ext_foreign_toplevel_handle_v1::Event;
        match event {
            Event::Identifier { identifier } => state.toplevels.set_identifier(handle, identifier),
            Event::Title { title } => state.toplevels.set_title(handle, title),
            Event::AppId { app_id } => state.toplevels.set_app_id(handle, app_id),
            Event::Done => {
                state.toplevels.done(handle);
                if state.mirror.is_pending() {
                    state.with_mirror(|mirror, env, outputs, toplevels| {
                        mirror.resolve_pending(env, outputs, toplevels)
                    });
                }
            }
            Event::Closed => {
                state.toplevels.remove(handle);
                state.with_mirror(|mirror, env, _, _| mirror.toplevel_closed(env, handle));
                handle.destroy();
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        frame: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        state.backend_event(|backend, ctx| match backend {
            Backend::ExportDmabuf(backend) => backend.handle_frame_event(ctx, frame, event),
            _ => trace!("Export frame event without export backend"),
        });
    }
}

impl Dispatch<ZwlrScreencopyFrameV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        frame: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        state.backend_event(|backend, ctx| match backend {
            Backend::Screencopy(backend) => backend.handle_frame_event(ctx, frame, event),
            _ => trace!("Screencopy frame event without screencopy backend"),
        });
    }
}

impl Dispatch<ExtImageCopyCaptureSessionV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        session: &ExtImageCopyCaptureSessionV1,
        event: ext_image_copy_capture_session_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        state.backend_event(|backend, ctx| match backend {
            Backend::ExtCopy(backend) => backend.handle_session_event(ctx, session, event),
            _ => trace!("Capture session event without extcopy backend"),
        });
    }
}

impl Dispatch<ExtImageCopyCaptureFrameV1, ()> for MirrorState {
    fn event(
        state: &mut Self,
        frame: &ExtImageCopyCaptureFrameV1,
        event: ext_image_copy_capture_frame_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        state.backend_event(|backend, ctx| match backend {
            Backend::ExtCopy(backend) => backend.handle_frame_event(ctx, frame, event),
            _ => trace!("Capture frame event without extcopy backend"),
        });
    }
}

delegate_noop!(MirrorState: WlCompositor);
delegate_noop!(MirrorState: ignore WlShm);
delegate_noop!(MirrorState: WlShmPool);
delegate_noop!(MirrorState: ignore WlBuffer);
delegate_noop!(MirrorState: ignore ZwpLinuxDmabufV1);
delegate_noop!(MirrorState: ignore ZwpLinuxBufferParamsV1);
delegate_noop!(MirrorState: ZxdgOutputManagerV1);
delegate_noop!(MirrorState: ZwlrExportDmabufManagerV1);
delegate_noop!(MirrorState: ZwlrScreencopyManagerV1);
delegate_noop!(MirrorState: ExtImageCopyCaptureManagerV1);
delegate_noop!(MirrorState: ExtOutputImageCaptureSourceManagerV1);
delegate_noop!(MirrorState: ExtForeignToplevelImageCaptureSourceManagerV1);
delegate_noop!(MirrorState: ExtImageCaptureSourceV1);
