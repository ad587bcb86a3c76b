//! Registry handling
//!
//! Globals are matched against two declarative tables: [`SINGLETONS`], bound at most once into a
//! fixed slot of [`Globals`], and [`MULTIPLE`], of which any number of instances may exist (outputs).
//! Every entry carries a version range and a required flag.
//!
//! Binding problems are collected by a [`RegistryLedger`]. Until the initial `wl_display.sync`
//! round trip completes the compositor may still race advertisements, so errors are only recorded.
//! They become fatal once the barrier is reached, and any later failure of a required binding is
//! fatal immediately.

use std::ops::RangeInclusive;

use tracing::{debug, error, info, instrument, warn};
use wayland_client::{
    protocol::{wl_compositor::WlCompositor, wl_output::WlOutput, wl_registry::WlRegistry, wl_shm::WlShm},
    QueueHandle,
};
use wayland_protocols::{
    ext::{
        foreign_toplevel_list::v1::client::ext_foreign_toplevel_list_v1::ExtForeignToplevelListV1,
        image_capture_source::v1::client::{
            ext_foreign_toplevel_image_capture_source_manager_v1::ExtForeignToplevelImageCaptureSourceManagerV1,
            ext_output_image_capture_source_manager_v1::ExtOutputImageCaptureSourceManagerV1,
        },
        image_copy_capture::v1::client::ext_image_copy_capture_manager_v1::ExtImageCopyCaptureManagerV1,
    },
    wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
    xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1,
};
use wayland_protocols_wlr::{
    export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
    screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
};

use crate::state::MirrorState;

/// Errors while binding compositor globals
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A required global was never advertised
    #[error("compositor does not support required interface `{0}`")]
    MissingGlobal(&'static str),
    /// A required global is only offered in a version we cannot use
    #[error("interface `{interface}` offered in version {offered}, need at least {min}")]
    VersionTooLow {
        /// Interface name
        interface: &'static str,
        /// Version advertised by the compositor
        offered: u32,
        /// Minimal supported version
        min: u32,
    },
    /// A required global went away
    #[error("required interface `{0}` was removed")]
    RequiredGlobalRemoved(&'static str),
}

/// Description of a bindable interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSpec {
    /// Interface name as advertised by `wl_registry.global`
    pub interface: &'static str,
    /// Acceptable versions
    pub versions: RangeInclusive<u32>,
    /// Whether the client cannot work without it
    pub required: bool,
}

impl GlobalSpec {
    /// Negotiate the version to bind, given the version offered by the compositor
    ///
    /// Returns `None` if the offer is below the minimum, otherwise the offer clamped to the maximum.
    pub fn negotiate(&self, offered: u32) -> Option<u32> {
        if offered < *self.versions.start() {
            None
        } else {
            Some(offered.min(*self.versions.end()))
        }
    }
}

/// Bookkeeping of binding outcomes around the initial synchronization barrier
#[derive(Debug, Default)]
pub struct RegistryLedger {
    synced: bool,
    deferred: Vec<RegistryError>,
    bound: Vec<&'static str>,
}

impl RegistryLedger {
    /// Process an offer for `spec`
    ///
    /// Returns the version to bind with, `Ok(None)` if the global has to be skipped, or an error if
    /// the failure is fatal right away.
    pub fn offer(&mut self, spec: &GlobalSpec, offered: u32) -> Result<Option<u32>, RegistryError> {
        if let Some(version) = spec.negotiate(offered) {
            return Ok(Some(version));
        }

        let err = RegistryError::VersionTooLow {
            interface: spec.interface,
            offered,
            min: *spec.versions.start(),
        };
        if !spec.required {
            warn!("Skipping optional global: {}", err);
            Ok(None)
        } else if self.synced {
            Err(err)
        } else {
            debug!("Deferring binding error until initial sync: {}", err);
            self.deferred.push(err);
            Ok(None)
        }
    }

    /// Whether a singleton interface is already bound
    pub fn is_bound(&self, interface: &str) -> bool {
        self.bound.iter().any(|bound| *bound == interface)
    }

    /// Record a successful singleton binding
    pub fn mark_bound(&mut self, interface: &'static str) {
        self.bound.push(interface);
    }

    /// Record the removal of a singleton
    ///
    /// Returns an error if the singleton is required.
    pub fn mark_removed(&mut self, spec: &GlobalSpec) -> Result<(), RegistryError> {
        self.bound.retain(|bound| *bound != spec.interface);
        if spec.required {
            return Err(RegistryError::RequiredGlobalRemoved(spec.interface));
        }
        Ok(())
    }

    /// Whether the initial synchronization barrier was reached
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Reach the initial synchronization barrier
    ///
    /// All deferred errors and every required singleton that was not bound are reported; the first
    /// of them is returned.
    pub fn finish_initial_sync<'a>(
        &mut self,
        singletons: impl IntoIterator<Item = &'a GlobalSpec>,
    ) -> Result<(), RegistryError> {
        self.synced = true;
        let mut errors = std::mem::take(&mut self.deferred);
        let missing = singletons
            .into_iter()
            .filter(|spec| spec.required && !self.is_bound(spec.interface))
            .filter(|spec| {
                !errors.iter().any(
                    |err| matches!(err, RegistryError::VersionTooLow { interface, .. } if *interface == spec.interface),
                )
            })
            .map(|spec| RegistryError::MissingGlobal(spec.interface))
            .collect::<Vec<_>>();
        errors.extend(missing);
        for err in &errors {
            error!("{}", err);
        }
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Compositor globals bound into fixed slots
#[derive(Debug, Default)]
pub struct Globals {
    /// `wl_compositor`
    pub compositor: Option<WlCompositor>,
    /// `wl_shm`
    pub shm: Option<WlShm>,
    /// `zwp_linux_dmabuf_v1`
    pub linux_dmabuf: Option<ZwpLinuxDmabufV1>,
    /// `zxdg_output_manager_v1`
    pub xdg_output_manager: Option<ZxdgOutputManagerV1>,
    /// `zwlr_export_dmabuf_manager_v1`
    pub export_dmabuf_manager: Option<ZwlrExportDmabufManagerV1>,
    /// `zwlr_screencopy_manager_v1`
    pub screencopy_manager: Option<ZwlrScreencopyManagerV1>,
    /// `ext_image_copy_capture_manager_v1`
    pub image_copy_capture_manager: Option<ExtImageCopyCaptureManagerV1>,
    /// `ext_output_image_capture_source_manager_v1`
    pub output_source_manager: Option<ExtOutputImageCaptureSourceManagerV1>,
    /// `ext_foreign_toplevel_image_capture_source_manager_v1`
    pub toplevel_source_manager: Option<ExtForeignToplevelImageCaptureSourceManagerV1>,
    /// `ext_foreign_toplevel_list_v1`
    pub toplevel_list: Option<ExtForeignToplevelListV1>,
}

/// Binds a global and stores it, called with the negotiated version
pub type BindFn = fn(&mut MirrorState, &WlRegistry, u32, u32, &QueueHandle<MirrorState>);
/// Called when a bound global is removed by the compositor
pub type RemoveFn = fn(&mut MirrorState, u32, &GlobalSpec);

/// An entry of the binding tables
pub struct BindEntry {
    /// What to bind
    pub spec: GlobalSpec,
    /// How to bind it
    pub bind: BindFn,
    /// What to do when it goes away
    pub on_remove: Option<RemoveFn>,
}

impl std::fmt::Debug for BindEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindEntry")
            .field("spec", &self.spec)
            .field("on_remove", &self.on_remove.is_some())
            .finish_non_exhaustive()
    }
}

/// A bound global, used to route `wl_registry.global_remove`
#[derive(Debug)]
pub struct RegisteredGlobal {
    /// Registry name
    pub name: u32,
    /// Table entry it was bound by
    pub entry: &'static BindEntry,
}

/// Registry sub-state of [`MirrorState`]
#[derive(Debug)]
pub struct RegistryState {
    /// The `wl_registry` object
    pub registry: WlRegistry,
    /// Binding outcomes
    pub ledger: RegistryLedger,
    /// Bound singletons
    pub globals: Globals,
    /// Every bound global
    pub registered: Vec<RegisteredGlobal>,
}

impl RegistryState {
    /// Wrap a freshly created registry
    pub fn new(registry: WlRegistry) -> Self {
        RegistryState {
            registry,
            ledger: RegistryLedger::default(),
            globals: Globals::default(),
            registered: Vec::new(),
        }
    }
}

fn manager_removed(state: &mut MirrorState, _name: u32, spec: &GlobalSpec) {
    let globals = &mut state.registry.globals;
    match spec.interface {
        "zwp_linux_dmabuf_v1" => {
            if let Some(dmabuf) = globals.linux_dmabuf.take() {
                dmabuf.destroy();
            }
        }
        "zxdg_output_manager_v1" => {
            if let Some(manager) = globals.xdg_output_manager.take() {
                manager.destroy();
            }
            state.outputs.set_xdg_manager_version(None);
        }
        "zwlr_export_dmabuf_manager_v1" => {
            if let Some(manager) = globals.export_dmabuf_manager.take() {
                manager.destroy();
            }
        }
        "zwlr_screencopy_manager_v1" => {
            if let Some(manager) = globals.screencopy_manager.take() {
                manager.destroy();
            }
        }
        "ext_image_copy_capture_manager_v1" => {
            if let Some(manager) = globals.image_copy_capture_manager.take() {
                manager.destroy();
            }
        }
        "ext_output_image_capture_source_manager_v1" => {
            if let Some(manager) = globals.output_source_manager.take() {
                manager.destroy();
            }
        }
        "ext_foreign_toplevel_image_capture_source_manager_v1" => {
            if let Some(manager) = globals.toplevel_source_manager.take() {
                manager.destroy();
            }
        }
        "ext_foreign_toplevel_list_v1" => {
            if let Some(list) = globals.toplevel_list.take() {
                list.stop();
            }
        }
        _ => {}
    }
    state.capability_removed(spec.interface);
}

fn output_removed(state: &mut MirrorState, name: u32, _spec: &GlobalSpec) {
    state.output_removed(name);
}

/// Interfaces bound at most once
pub static SINGLETONS: &[BindEntry] = &[
    BindEntry {
        spec: GlobalSpec {
            interface: "wl_compositor",
            versions: 4..=6,
            required: true,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.compositor = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: None,
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "wl_shm",
            versions: 1..=1,
            required: true,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.shm = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: None,
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "zwp_linux_dmabuf_v1",
            versions: 3..=4,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.linux_dmabuf = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "zxdg_output_manager_v1",
            versions: 2..=3,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            let manager: ZxdgOutputManagerV1 = registry.bind(name, version, qh, ());
            state.outputs.set_xdg_manager_version(Some(version));
            // outputs announced before the manager still need their xdg-output
            for entry in state.outputs.iter_mut() {
                let global = entry.global();
                let handles = entry.handle_mut();
                if handles.xdg.is_none() {
                    handles.xdg = Some(manager.get_xdg_output(&handles.wl, qh, global));
                }
            }
            state.registry.globals.xdg_output_manager = Some(manager);
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "zwlr_export_dmabuf_manager_v1",
            versions: 1..=1,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.export_dmabuf_manager = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "zwlr_screencopy_manager_v1",
            versions: 1..=3,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.screencopy_manager = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "ext_image_copy_capture_manager_v1",
            versions: 1..=1,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.image_copy_capture_manager = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "ext_output_image_capture_source_manager_v1",
            versions: 1..=1,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.output_source_manager = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "ext_foreign_toplevel_image_capture_source_manager_v1",
            versions: 1..=1,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.toplevel_source_manager = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
    BindEntry {
        spec: GlobalSpec {
            interface: "ext_foreign_toplevel_list_v1",
            versions: 1..=1,
            required: false,
        },
        bind: |state, registry, name, version, qh| {
            state.registry.globals.toplevel_list = Some(registry.bind(name, version, qh, ()));
        },
        on_remove: Some(manager_removed),
    },
];

/// Interfaces of which any number of instances may exist
pub static MULTIPLE: &[BindEntry] = &[BindEntry {
    spec: GlobalSpec {
        interface: "wl_output",
        versions: 2..=4,
        required: false,
    },
    bind: |state, registry, name, version, qh| {
        let output: WlOutput = registry.bind(name, version, qh, name);
        state.output_added(name, output, qh);
    },
    on_remove: Some(output_removed),
}];

/// Handle `wl_registry.global`
pub(crate) fn global_added(
    state: &mut MirrorState,
    registry: &WlRegistry,
    name: u32,
    interface: &str,
    version: u32,
    qh: &QueueHandle<MirrorState>,
) {
    let (entry, singleton) = match SINGLETONS.iter().find(|entry| entry.spec.interface == interface) {
        Some(entry) => (entry, true),
        None => match MULTIPLE.iter().find(|entry| entry.spec.interface == interface) {
            Some(entry) => (entry, false),
            None => return,
        },
    };

    if singleton && state.registry.ledger.is_bound(entry.spec.interface) {
        warn!(interface, name, "Ignoring duplicate singleton global");
        return;
    }

    match state.registry.ledger.offer(&entry.spec, version) {
        Ok(Some(version)) => {
            debug!(interface, name, version, "Binding global");
            (entry.bind)(state, registry, name, version, qh);
            if singleton {
                state.registry.ledger.mark_bound(entry.spec.interface);
            }
            state.registry.registered.push(RegisteredGlobal { name, entry });
        }
        Ok(None) => {}
        Err(err) => state.fatal(err.into()),
    }
}

/// Handle `wl_registry.global_remove`
#[instrument(level = "debug", skip(state))]
pub(crate) fn global_removed(state: &mut MirrorState, name: u32) {
    let Some(idx) = state.registry.registered.iter().position(|global| global.name == name) else {
        return;
    };
    let global = state.registry.registered.remove(idx);
    info!(interface = global.entry.spec.interface, "Global removed");

    if SINGLETONS.iter().any(|entry| std::ptr::eq(entry, global.entry)) {
        if let Err(err) = state.registry.ledger.mark_removed(&global.entry.spec) {
            state.fatal(err.into());
            return;
        }
    }
    if let Some(on_remove) = global.entry.on_remove {
        on_remove(state, name, &global.entry.spec);
    }
}

/// Handle the initial `wl_display.sync` callback
pub(crate) fn initial_sync_done(state: &mut MirrorState) {
    let specs = SINGLETONS.iter().map(|entry| &entry.spec);
    if let Err(err) = state.registry.ledger.finish_initial_sync(specs) {
        state.fatal(err.into());
        return;
    }
    debug!(
        globals = state.registry.registered.len(),
        "Initial registry round trip done"
    );
    state.check_outputs_ready();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(interface: &'static str, versions: RangeInclusive<u32>, required: bool) -> GlobalSpec {
        GlobalSpec {
            interface,
            versions,
            required,
        }
    }

    #[test]
    fn negotiation_clamps_and_rejects() {
        let spec = spec("wl_compositor", 4..=6, true);
        assert_eq!(spec.negotiate(3), None);
        assert_eq!(spec.negotiate(4), Some(4));
        assert_eq!(spec.negotiate(5), Some(5));
        assert_eq!(spec.negotiate(9), Some(6));
    }

    #[test]
    fn errors_are_deferred_until_initial_sync() {
        let compositor = spec("wl_compositor", 4..=6, true);
        let shm = spec("wl_shm", 1..=1, true);
        let mut ledger = RegistryLedger::default();

        assert_eq!(ledger.offer(&compositor, 3), Ok(None));
        assert_eq!(ledger.offer(&shm, 1), Ok(Some(1)));
        ledger.mark_bound("wl_shm");

        assert_eq!(
            ledger.finish_initial_sync([&compositor, &shm]),
            Err(RegistryError::VersionTooLow {
                interface: "wl_compositor",
                offered: 3,
                min: 4
            })
        );
    }

    #[test]
    fn late_version_mismatch_is_fatal_immediately() {
        let compositor = spec("wl_compositor", 4..=6, true);
        let mut ledger = RegistryLedger::default();
        assert_eq!(ledger.offer(&compositor, 5), Ok(Some(5)));
        ledger.mark_bound("wl_compositor");
        assert_eq!(ledger.finish_initial_sync([&compositor]), Ok(()));

        assert!(ledger.offer(&compositor, 2).is_err());
    }

    #[test]
    fn optional_globals_never_fail() {
        let screencopy = spec("zwlr_screencopy_manager_v1", 1..=3, false);
        let mut ledger = RegistryLedger::default();
        assert_eq!(ledger.finish_initial_sync([&screencopy]), Ok(()));
        assert_eq!(ledger.offer(&screencopy, 0), Ok(None));
        assert_eq!(ledger.mark_removed(&screencopy), Ok(()));
    }

    #[test]
    fn missing_required_singleton_fails_the_barrier() {
        let shm = spec("wl_shm", 1..=1, true);
        let mut ledger = RegistryLedger::default();
        assert_eq!(
            ledger.finish_initial_sync([&shm]),
            Err(RegistryError::MissingGlobal("wl_shm"))
        );
    }

    #[test]
    fn singleton_table_is_consistent() {
        for entry in SINGLETONS.iter().chain(MULTIPLE) {
            assert!(entry.spec.versions.start() <= entry.spec.versions.end());
        }
        let required: Vec<_> = SINGLETONS
            .iter()
            .filter(|entry| entry.spec.required)
            .map(|entry| entry.spec.interface)
            .collect();
        assert_eq!(required, ["wl_compositor", "wl_shm"]);
    }
}
