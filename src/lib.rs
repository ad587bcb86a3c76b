#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like SHM
#![allow(clippy::upper_case_acronyms)]

//! # smithay-mirror: mirroring wayland outputs and toplevels
//!
//! This crate contains the client-side machinery needed to mirror the contents of a wayland output
//! (or a single toplevel window) into another surface: discovering and binding the capture protocols
//! the compositor advertises, tracking outputs as they come and go, and driving one of several
//! capture transports to obtain a frame at a time, ready to be imported as a texture.
//!
//! ## Structure of the crate
//!
//! - [`wayland`] contains the registry handling, output/toplevel tracking and the bookkeeping for the
//!   output the mirror window is shown on.
//! - [`backend`] contains the capture backends. Each transport is split into a state machine that
//!   only consumes events and produces steps, and a thin layer forwarding protocol objects to it.
//!   The [`backend::select`] module picks a transport and falls back to the next one when a backend
//!   keeps failing.
//! - [`mirror`] ties a capture target to the active backend and enforces the failure policy.
//! - [`state`] and [`event_loop`] provide the [`calloop`] based runtime driving everything.
//!
//! ## The event loop and state handling
//!
//! Like Smithay itself, everything is built around [`calloop`]. All protocol callbacks receive a
//! mutable reference to one [`state::MirrorState`], which is composed of small explicit sub-states.
//! Callback invocation is always sequential, so no synchronization is needed anywhere.
//!
//! ## Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//! Frame-level chatter is emitted at the `trace` level, state transitions at `debug`.

pub mod backend;
pub mod config;
pub mod event_loop;
pub mod mirror;
pub mod state;
pub mod target;
pub mod utils;
pub mod wayland;

pub mod reexports;
