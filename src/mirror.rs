//! The mirror controller
//!
//! A [`Mirror`] owns everything belonging to one mirroring session: the options, the resolved
//! [`CaptureTarget`], the active [`Backend`] and the [`BackendSelector`] it was obtained from.
//! Backends only ever borrow the target through a [`CaptureContext`].
//!
//! After every call into the active backend the controller checks its [`FailCounter`]. Once
//! exhausted, the backend is torn down and, in [`BackendMode::Auto`], replaced by the next
//! candidate. Running out of candidates is fatal and reported as [`MirrorError::BackendExhausted`].
//!
//! [`FailCounter`]: crate::backend::FailCounter

use calloop::LoopHandle;
use tracing::{debug, error, info, instrument, warn};
use wayland_client::{protocol::wl_output::WlOutput, QueueHandle};
use wayland_protocols::ext::foreign_toplevel_list::v1::client::ext_foreign_toplevel_handle_v1::ExtForeignToplevelHandleV1;

use crate::{
    backend::{
        allocator::{AllocatorError, DmabufAllocator},
        import::TextureImporter,
        portal::MediaTransport,
        select::{BackendSelector, Capabilities, SelectError, TargetClass},
        Backend, BackendError, BackendKind, CaptureBackend, CaptureContext,
    },
    config::{BackendMode, MirrorOptions},
    state::{MirrorState, OutputHandles},
    target::{CaptureTarget, Resolution, TargetError, TargetKind, TargetSpec},
    utils::Transform,
    wayland::{output::OutputList, registry::Globals, registry::RegistryError, toplevel::ToplevelList},
};

/// Errors ending a mirroring session
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Connecting to the compositor failed
    #[error("failed to connect to the wayland compositor")]
    Connect(#[from] wayland_client::ConnectError),
    /// The wayland connection broke
    #[error("wayland connection error")]
    Dispatch(#[from] wayland_client::DispatchError),
    /// The event loop failed
    #[error("event loop error")]
    EventLoop(#[from] calloop::Error),
    /// A required compositor interface is unusable
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The target could not be resolved
    #[error(transparent)]
    Target(#[from] TargetError),
    /// No capture backend could be started
    #[error(transparent)]
    Select(#[from] SelectError),
    /// Every candidate backend failed too often
    #[error("capture backend {0} failed too often and no fallback is left")]
    BackendExhausted(BackendKind),
    /// The output or toplevel being mirrored went away
    #[error("the mirrored {0} disappeared")]
    TargetLost(&'static str),
    /// The dmabuf allocator could not be set up
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}

/// The parts of [`MirrorState`] a [`Mirror`] needs besides itself
pub struct MirrorEnv<'a> {
    /// Queue new protocol objects are created on
    pub qh: &'a QueueHandle<MirrorState>,
    /// Bound compositor globals
    pub globals: &'a Globals,
    /// Handle to the event loop
    pub loop_handle: &'a LoopHandle<'static, MirrorState>,
    /// Consumer of captured frames
    pub importer: &'a mut dyn TextureImporter,
    /// Allocator for dmabuf destination buffers
    pub allocator: &'a mut Option<Box<dyn DmabufAllocator>>,
    /// Media stream consumer of the portal backend
    pub transport: &'a mut Option<Box<dyn MediaTransport>>,
}

impl std::fmt::Debug for MirrorEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorEnv")
            .field("globals", &self.globals)
            .field("importer", &self.importer)
            .finish_non_exhaustive()
    }
}

impl MirrorEnv<'_> {
    /// Capabilities currently available for capturing
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(self.globals, self.allocator.is_some(), self.transport.is_some())
    }

    fn context<'b>(&'b mut self, target: &'b mut CaptureTarget, options: &'b MirrorOptions) -> CaptureContext<'b> {
        CaptureContext {
            qh: self.qh,
            globals: self.globals,
            loop_handle: self.loop_handle,
            target,
            options,
            importer: &mut *self.importer,
            allocator: &mut *self.allocator,
            transport: &mut *self.transport,
        }
    }
}

/// Class of a resolved target, as far as backend selection is concerned
pub fn target_class(target: &CaptureTarget) -> TargetClass {
    match target.kind {
        TargetKind::Null => TargetClass::Null,
        TargetKind::Output { .. } => TargetClass::Output,
        TargetKind::Toplevel { .. } => TargetClass::Toplevel,
    }
}

/// Resolve `spec` against the live outputs and toplevels
///
/// Toplevels are only considered if the compositor advertises the foreign toplevel list.
pub fn resolve_target(
    spec: &TargetSpec,
    outputs: &OutputList<OutputHandles>,
    toplevels: Option<&ToplevelList<ExtForeignToplevelHandleV1>>,
) -> Result<Option<CaptureTarget>, TargetError> {
    let resolution = match spec.resolve(outputs, toplevels)? {
        Resolution::Null => Resolution::Null,
        Resolution::Pending => Resolution::Pending,
        Resolution::Toplevel(handle) => Resolution::Toplevel(handle),
        Resolution::Output {
            global,
            output,
            transform,
        } => Resolution::Output {
            global,
            output: output.wl,
            transform,
        },
    };
    Ok(CaptureTarget::from_resolution(resolution))
}

/// Constructor for backends of a given kind
pub type BackendFactory = fn(BackendKind, &mut CaptureContext<'_>) -> Result<Backend, BackendError>;

/// A mirroring session
#[derive(Debug)]
pub struct Mirror {
    options: MirrorOptions,
    target: Option<CaptureTarget>,
    backend: Option<Backend>,
    selector: BackendSelector,
    started: bool,
    factory: BackendFactory,
}

impl Mirror {
    /// Create a session that is not started yet
    pub fn new(options: MirrorOptions) -> Mirror {
        Mirror::with_factory(options, Backend::new)
    }

    /// Create a session constructing its backends with `factory`
    pub fn with_factory(options: MirrorOptions, factory: BackendFactory) -> Mirror {
        let selector = BackendSelector::new(options.backend);
        Mirror {
            options,
            target: None,
            backend: None,
            selector,
            started: false,
            factory,
        }
    }

    /// Current options
    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    /// The resolved target, `None` while not started or waiting for a toplevel to appear
    pub fn target(&self) -> Option<&CaptureTarget> {
        self.target.as_ref()
    }

    /// Kind of the active backend
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(CaptureBackend::kind)
    }

    /// Whether [`Mirror::start`] was called
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the target still has to be resolved
    pub fn is_pending(&self) -> bool {
        self.started && self.target.is_none()
    }

    /// Resolve the target and select a backend for it
    ///
    /// A toplevel target that is not advertised yet leaves the session pending, see
    /// [`Mirror::resolve_pending`].
    #[instrument(level = "debug", skip_all, fields(target = %self.options.target, mode = %self.options.backend))]
    pub fn start(
        &mut self,
        env: &mut MirrorEnv<'_>,
        outputs: &OutputList<OutputHandles>,
        toplevels: Option<&ToplevelList<ExtForeignToplevelHandleV1>>,
    ) -> Result<(), MirrorError> {
        self.started = true;
        self.selector = BackendSelector::new(self.options.backend);
        self.resolve_pending(env, outputs, toplevels)
    }

    /// Retry resolving a pending target
    pub fn resolve_pending(
        &mut self,
        env: &mut MirrorEnv<'_>,
        outputs: &OutputList<OutputHandles>,
        toplevels: Option<&ToplevelList<ExtForeignToplevelHandleV1>>,
    ) -> Result<(), MirrorError> {
        if !self.is_pending() {
            return Ok(());
        }
        let Some(target) = resolve_target(&self.options.target, outputs, toplevels)? else {
            return Ok(());
        };
        info!(target = %self.options.target, "Mirror target resolved");
        let class = target_class(&target);
        let target = self.target.insert(target);
        if class == TargetClass::Null {
            return Ok(());
        }

        let caps = env.capabilities();
        let options = &self.options;
        let factory = self.factory;
        let backend = self
            .selector
            .select(&caps, class, |kind| factory(kind, &mut env.context(target, options)))?;
        self.backend = Some(backend);
        Ok(())
    }

    /// Request the next frame from the active backend
    pub fn request_frame(&mut self, env: &mut MirrorEnv<'_>) -> Result<(), MirrorError> {
        self.dispatch(env, |backend, ctx| backend.capture(ctx))?;
        Ok(())
    }

    /// Run `f` against the active backend, then enforce the failure policy
    ///
    /// Returns `None` if no backend is active.
    pub fn dispatch<R>(
        &mut self,
        env: &mut MirrorEnv<'_>,
        f: impl FnOnce(&mut Backend, &mut CaptureContext<'_>) -> R,
    ) -> Result<Option<R>, MirrorError> {
        let (Some(backend), Some(target)) = (self.backend.as_mut(), self.target.as_mut()) else {
            return Ok(None);
        };
        let result = f(backend, &mut env.context(target, &self.options));
        self.check_failures(env)?;
        Ok(Some(result))
    }

    /// Replace the active backend if it exhausted its failure budget
    pub fn check_failures(&mut self, env: &mut MirrorEnv<'_>) -> Result<(), MirrorError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(());
        };
        if !backend.fail_count().is_exhausted() {
            return Ok(());
        }
        let kind = backend.kind();
        warn!(
            backend = %kind,
            failures = backend.fail_count().count(),
            "Capture backend failed too often"
        );
        self.abandon_backend(env, kind)
    }

    fn teardown_backend(&mut self, env: &mut MirrorEnv<'_>) -> Option<BackendKind> {
        let mut backend = self.backend.take()?;
        let kind = backend.kind();
        if let Some(target) = self.target.as_mut() {
            backend.cleanup(&mut env.context(target, &self.options));
            target.release_source();
        }
        debug!(backend = %kind, "Capture backend torn down");
        Some(kind)
    }

    fn abandon_backend(&mut self, env: &mut MirrorEnv<'_>, kind: BackendKind) -> Result<(), MirrorError> {
        self.teardown_backend(env);
        let Some(target) = self.target.as_mut() else {
            return Ok(());
        };
        let class = target_class(target);
        let caps = env.capabilities();
        let options = &self.options;
        let factory = self.factory;
        match self
            .selector
            .fallback(&caps, class, |kind| factory(kind, &mut env.context(target, options)))
        {
            Ok(backend) => {
                warn!(from = %kind, to = %backend.kind(), "Switched capture backend");
                self.backend = Some(backend);
                Ok(())
            }
            Err(SelectError::Exhausted(mode)) => {
                error!(backend = %kind, %mode, "No capture backend left");
                Err(MirrorError::BackendExhausted(kind))
            }
        }
    }

    /// Apply new options
    ///
    /// A different target or backend mode restarts the session. Otherwise the active backend is
    /// asked to adapt itself and recreated if it cannot.
    pub fn update_options(
        &mut self,
        env: &mut MirrorEnv<'_>,
        outputs: &OutputList<OutputHandles>,
        toplevels: Option<&ToplevelList<ExtForeignToplevelHandleV1>>,
        options: MirrorOptions,
    ) -> Result<(), MirrorError> {
        if options == self.options {
            return Ok(());
        }
        let restart = options.target != self.options.target || options.backend != self.options.backend;
        self.options = options;

        if restart || self.backend.is_none() {
            debug!("Restarting mirror with new options");
            let started = self.started;
            self.stop(env);
            if started {
                self.start(env, outputs, toplevels)?;
            }
            return Ok(());
        }

        let Some(adapted) = self.dispatch(env, |backend, ctx| backend.on_options_updated(ctx))? else {
            return Ok(());
        };
        if adapted {
            return Ok(());
        }

        let Some(kind) = self.teardown_backend(env) else {
            return Ok(());
        };
        let Some(target) = self.target.as_mut() else {
            return Ok(());
        };
        debug!(backend = %kind, "Recreating backend for new options");
        match (self.factory)(kind, &mut env.context(target, &self.options)) {
            Ok(backend) => {
                self.backend = Some(backend);
                Ok(())
            }
            Err(err) => {
                warn!(backend = %kind, %err, "Failed to recreate backend");
                self.abandon_backend(env, kind)
            }
        }
    }

    /// A live output changed its transform
    pub fn output_transform_changed(&mut self, global: u32, transform: Transform) {
        if let Some(target) = self.target.as_mut().filter(|target| target.uses_output_global(global)) {
            debug!(global, ?transform, "Mirrored output transform changed");
            target.transform = transform;
        }
    }

    /// An output global was removed
    #[instrument(level = "debug", skip(self, env))]
    pub fn output_removed(&mut self, env: &mut MirrorEnv<'_>, global: u32) -> Result<(), MirrorError> {
        if !self.target.as_ref().is_some_and(|target| target.uses_output_global(global)) {
            return Ok(());
        }
        self.stop(env);
        Err(MirrorError::TargetLost("output"))
    }

    /// A toplevel was closed
    pub fn toplevel_closed(
        &mut self,
        env: &mut MirrorEnv<'_>,
        handle: &ExtForeignToplevelHandleV1,
    ) -> Result<(), MirrorError> {
        if !self.target.as_ref().is_some_and(|target| target.is_toplevel(handle)) {
            return Ok(());
        }
        self.stop(env);
        Err(MirrorError::TargetLost("toplevel"))
    }

    /// A compositor interface went away
    ///
    /// If the active backend depends on it, it is treated as failed.
    pub fn capability_removed(&mut self, env: &mut MirrorEnv<'_>, interface: &str) -> Result<(), MirrorError> {
        let class = self.target.as_ref().map_or(TargetClass::Null, target_class);
        let Some(kind) = self.backend_kind().filter(|kind| kind.uses_interface(interface, class)) else {
            return Ok(());
        };
        warn!(backend = %kind, interface, "Interface used by the capture backend was removed");
        self.abandon_backend(env, kind)
    }

    /// Tear the session down
    pub fn stop(&mut self, env: &mut MirrorEnv<'_>) {
        self.teardown_backend(env);
        self.target = None;
        self.started = false;
    }

    /// Output the mirrored output is, for presenting frames
    pub fn mirrored_output(&self) -> Option<&WlOutput> {
        self.target.as_ref().and_then(CaptureTarget::output)
    }

    /// Mode the session selects backends from
    pub fn backend_mode(&self) -> BackendMode {
        self.selector.mode()
    }
}
