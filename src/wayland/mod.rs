//! Wayland protocol plumbing
//!
//! - [`registry`] binds the compositor globals the capture backends rely on
//! - [`output`] tracks outputs until both of their property streams completed
//! - [`toplevel`] tracks foreign toplevels, the alternative capture target
//! - [`window`] follows which output the mirror window is shown on

pub mod output;
pub mod registry;
pub mod toplevel;
pub mod window;
