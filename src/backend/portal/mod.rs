//! Capture through the ScreenCast desktop portal
//!
//! The portal is driven over the session bus (the `xdg_portal` feature) and hands out a connection
//! to a media stream once the user started the cast. Consuming that stream is delegated to a
//! [`MediaTransport`]; without one the backend cannot be used.
//!
//! The handshake itself lives in [`machine`]. Once it is [broken](PortalState::Broken) the backend
//! reports itself as failed on the next capture instead of retrying, leaving the decision to the
//! backend selection.

use std::{fmt, os::unix::io::OwnedFd};

use tracing::{debug, trace, warn};

use super::{
    dmabuf::Dmabuf,
    format::fourcc_from_spa,
    import::{ImportError, ImportParams, ShmFrame},
    BackendError, BackendKind, CancelReason, CaptureBackend, CaptureContext, FailCounter,
};
use crate::target::TargetKind;

#[cfg(feature = "xdg_portal")]
mod dbus;
pub mod machine;

pub use self::machine::{PortalMachine, PortalState, SourceType};

/// Connection to the media stream of a started cast
#[derive(Debug)]
pub struct PipeWireRemote {
    /// Connection to the media server
    pub fd: OwnedFd,
    /// Node of the stream
    pub node_id: u32,
}

/// A frame received from the media stream
#[derive(Debug)]
pub enum MediaFrame {
    /// Frame in memory
    Memory {
        /// Pixel contents
        data: Vec<u8>,
        /// SPA video format
        spa_format: u32,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Bytes per row
        stride: u32,
    },
    /// Frame shared as a dmabuf
    Dmabuf(Dmabuf),
}

/// Errors of a [`MediaTransport`]
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The stream could not be connected
    #[error("failed to connect to the media stream: {0}")]
    Connect(String),
}

/// Consumer of the media stream of a portal cast
pub trait MediaTransport: fmt::Debug {
    /// Connect to the stream
    fn open(&mut self, remote: PipeWireRemote) -> Result<(), TransportError>;

    /// The latest frame received since the last call, if any
    fn next_frame(&mut self) -> Option<MediaFrame>;

    /// Disconnect from the stream
    fn close(&mut self);
}

/// Capture backend using the ScreenCast portal
#[derive(Debug)]
pub struct PortalBackend {
    machine: PortalMachine,
    fail: FailCounter,
    stream_open: bool,
    #[cfg(feature = "xdg_portal")]
    bus: dbus::PortalBus,
}

impl PortalBackend {
    /// Connect to the portal and start the handshake
    pub fn new(ctx: &mut CaptureContext<'_>) -> Result<Self, BackendError> {
        let source = match ctx.target.kind {
            TargetKind::Output { .. } => SourceType::Monitor,
            TargetKind::Toplevel { .. } => SourceType::Window,
            TargetKind::Null => return Err(BackendError::UnsupportedTarget),
        };
        if ctx.transport.is_none() {
            return Err(BackendError::MissingCapability("media transport"));
        }

        #[cfg(feature = "xdg_portal")]
        {
            let bus = dbus::PortalBus::connect(ctx.loop_handle)?;
            let mut backend = PortalBackend {
                machine: PortalMachine::new(source, ctx.options.show_cursor),
                fail: FailCounter::new(ctx.options.fatal_fail_count),
                stream_open: false,
                bus,
            };
            let step = backend.machine.begin(backend.bus.unique_name());
            backend.apply(ctx, step);
            Ok(backend)
        }
        #[cfg(not(feature = "xdg_portal"))]
        {
            let _ = source;
            Err(BackendError::MissingCapability("session bus support"))
        }
    }

    /// State of the handshake
    pub fn state(&self) -> PortalState {
        self.machine.state()
    }

    #[cfg_attr(not(feature = "xdg_portal"), allow(dead_code))]
    fn open_remote(&mut self, ctx: &mut CaptureContext<'_>, fd: OwnedFd, node_id: u32) {
        let Some(transport) = ctx.transport.as_mut() else {
            self.fail.give_up();
            return;
        };
        match transport.open(PipeWireRemote { fd, node_id }) {
            Ok(()) => {
                debug!(node_id, "Connected to portal stream");
                self.stream_open = true;
            }
            Err(err) => {
                warn!(%err, "Failed to connect to portal stream");
                self.fail.give_up();
            }
        }
    }

    fn pull_frame(&mut self, ctx: &mut CaptureContext<'_>) {
        let Some(frame) = ctx.transport.as_mut().and_then(|transport| transport.next_frame()) else {
            return;
        };
        let params = ImportParams::default();
        let result = match &frame {
            MediaFrame::Memory {
                data,
                spa_format,
                width,
                height,
                stride,
            } => match fourcc_from_spa(*spa_format) {
                Some(format) => ctx.importer.import_shm(
                    &ShmFrame {
                        data,
                        format,
                        width: *width,
                        height: *height,
                        stride: *stride,
                    },
                    &params,
                ),
                None => Err(ImportError::Failed(format!("unknown video format {}", spa_format))),
            },
            MediaFrame::Dmabuf(dmabuf) => ctx.importer.import_dmabuf(dmabuf, &params),
        };
        match result {
            Ok(()) => self.fail.reset(),
            Err(err) => {
                warn!(%err, "Failed to import portal frame");
                self.fail.record(CancelReason::Import);
            }
        }
    }
}

impl CaptureBackend for PortalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::XdgPortal
    }

    fn capture(&mut self, ctx: &mut CaptureContext<'_>) {
        match self.machine.state() {
            PortalState::Streaming => self.pull_frame(ctx),
            PortalState::Broken => {
                if !self.fail.is_exhausted() {
                    warn!("Portal handshake broken, giving up on the portal");
                    self.fail.give_up();
                }
            }
            state => trace!(?state, "Portal handshake in progress"),
        }
    }

    fn cleanup(&mut self, ctx: &mut CaptureContext<'_>) {
        #[cfg(feature = "xdg_portal")]
        self.bus.close(ctx.loop_handle, self.machine.session());
        if std::mem::take(&mut self.stream_open) {
            if let Some(transport) = ctx.transport.as_mut() {
                transport.close();
            }
        }
    }

    fn fail_count(&self) -> &FailCounter {
        &self.fail
    }
}
