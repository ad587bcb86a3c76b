//! Connection setup and the main loop
//!
//! Everything runs on a single [`calloop`] event loop. The wayland connection is inserted through
//! [`calloop_wayland_source::WaylandSource`]; backends may add sources of their own (the portal
//! backend inserts its bus connection) through the [`LoopHandle`] found in the capture context.
//!
//! [`run`] dispatches until [`MirrorState::closing`] is set. Outgoing requests are flushed after
//! every iteration, before blocking again.

use std::time::Duration;

use calloop::{
    timer::{TimeoutAction, Timer},
    EventLoop, LoopHandle, RegistrationToken,
};
use calloop_wayland_source::WaylandSource;
use tracing::{debug, info, trace};
use wayland_client::{Connection, DispatchError};

use crate::{
    config::MirrorOptions,
    mirror::MirrorError,
    state::{Collaborators, InitialSync, MirrorState},
};

/// Connect to the compositor and set up the event loop
///
/// The registry is requested right away and followed by a `wl_display.sync`, whose completion is
/// the initial synchronization barrier. Nothing is dispatched yet.
pub fn init(
    options: MirrorOptions,
    collaborators: Collaborators,
) -> Result<(EventLoop<'static, MirrorState>, MirrorState), MirrorError> {
    let connection = Connection::connect_to_env()?;
    let event_queue = connection.new_event_queue();
    let qh = event_queue.handle();

    let display = connection.display();
    let registry = display.get_registry(&qh, ());
    display.sync(&qh, InitialSync);

    let event_loop: EventLoop<'static, MirrorState> = EventLoop::try_new()?;
    let loop_handle = event_loop.handle();
    WaylandSource::new(connection.clone(), event_queue)
        .insert(loop_handle.clone())
        .map_err(|err| err.error)?;
    debug!("Connected to the compositor");

    let state = MirrorState::new(connection, registry, qh, loop_handle, options, collaborators);
    Ok((event_loop, state))
}

/// Request a frame every `interval`
///
/// Frames may also be requested by other means through [`MirrorState::request_frame`], for
/// example from the frame callbacks of the window presenting them.
pub fn insert_frame_clock(
    loop_handle: &LoopHandle<'static, MirrorState>,
    interval: Duration,
) -> Result<RegistrationToken, MirrorError> {
    let token = loop_handle
        .insert_source(Timer::from_duration(interval), move |_, _, state| {
            if state.closing {
                return TimeoutAction::Drop;
            }
            trace!("Frame clock tick");
            state.request_frame();
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|err| err.error)?;
    Ok(token)
}

/// Dispatch until the session is closed
///
/// Returns the error that ended the session, if any. The mirror is torn down before returning.
pub fn run(event_loop: &mut EventLoop<'static, MirrorState>, state: &mut MirrorState) -> Result<(), MirrorError> {
    while !state.closing {
        if let Err(err) = event_loop.dispatch(None, state) {
            state.fatal(err.into());
            break;
        }
        if let Err(err) = state.connection().flush() {
            state.fatal(DispatchError::Backend(err).into());
        }
    }

    state.close();
    // best effort, the connection may already be gone
    let _ = state.connection().flush();
    info!("Mirror stopped");

    match state.take_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
