//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
#[cfg(feature = "xdg_portal")]
pub use dbus;
pub use drm_fourcc;
#[cfg(feature = "backend_gbm")]
pub use gbm;
pub use wayland_client;
pub use wayland_protocols;
pub use wayland_protocols_wlr;
