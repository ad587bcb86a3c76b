//! Session bus glue of the portal backend
//!
//! The bus connection is a calloop event source: whenever its socket is readable the pending
//! messages are popped and routed to [`MirrorState::portal_message`]. The socket libdbus wants
//! polled may change over the lifetime of the connection, so the registration is refreshed after
//! every dispatch if the watch changed.

use std::{
    fmt, io,
    os::unix::io::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    rc::Rc,
    time::Duration,
};

use calloop::{
    generic::Generic, EventSource, Interest, LoopHandle, Mode, Poll, PostAction, Readiness, RegistrationToken,
    Token, TokenFactory,
};
use dbus::{
    arg::{PropMap, RefArg, Variant},
    channel::{BusType, Channel},
    message::MessageType,
    Message, Path,
};
use tracing::{debug, trace, warn};

use super::{
    machine::{PortalReply, PortalRequest, PortalStep, ReplyKind, ResponseResults},
    PortalBackend,
};
use crate::{
    backend::{BackendError, CaptureContext},
    state::MirrorState,
};

const PORTAL_DEST: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

const MATCH_RULES: [&str; 2] = [
    "type='signal',interface='org.freedesktop.portal.Request',member='Response'",
    "type='signal',interface='org.freedesktop.portal.Session',member='Closed'",
];

/// The socket of a bus connection, owned by the connection
struct WatchFd {
    fd: RawFd,
    _channel: Rc<Channel>,
}

impl AsFd for WatchFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd is owned by the channel, which outlives self
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

/// A bus connection as an event source
pub(crate) struct DBusSource {
    channel: Rc<Channel>,
    watch: (RawFd, bool, bool),
    source: Option<Generic<WatchFd>>,
}

impl fmt::Debug for DBusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DBusSource").field("watch", &self.watch).finish_non_exhaustive()
    }
}

impl DBusSource {
    fn new(channel: Rc<Channel>) -> DBusSource {
        DBusSource {
            channel,
            watch: (-1, false, false),
            source: None,
        }
    }

    fn current_watch(&self) -> (RawFd, bool, bool) {
        let watch = self.channel.watch();
        (watch.fd, watch.read, watch.write)
    }
}

impl EventSource for DBusSource {
    type Event = Message;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Message, &mut ()),
    {
        let channel = &self.channel;
        if let Some(source) = self.source.as_mut() {
            source.process_events(readiness, token, |_, _| {
                channel
                    .read_write(Some(Duration::ZERO))
                    .map_err(|()| io::Error::new(io::ErrorKind::NotConnected, "DBus connection is closed"))?;
                while let Some(message) = channel.pop_message() {
                    callback(message, &mut ());
                }
                channel.flush();
                Ok(PostAction::Continue)
            })?;
        }

        if self.current_watch() != self.watch {
            Ok(PostAction::Reregister)
        } else {
            Ok(PostAction::Continue)
        }
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        let watch = self.current_watch();
        let (fd, readable, writable) = watch;
        let mut source = Generic::new(
            WatchFd {
                fd,
                _channel: self.channel.clone(),
            },
            Interest { readable, writable },
            Mode::Level,
        );
        source.register(poll, token_factory)?;
        self.watch = watch;
        self.source = Some(source);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        let watch = self.current_watch();
        match self.source.as_mut() {
            Some(source) if source.get_ref().fd == watch.0 => {
                source.interest = Interest {
                    readable: watch.1,
                    writable: watch.2,
                };
                source.reregister(poll, token_factory)?;
                self.watch = watch;
                Ok(())
            }
            _ => {
                // the connection switched sockets
                self.unregister(poll)?;
                self.register(poll, token_factory)
            }
        }
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if let Some(mut source) = self.source.take() {
            source.unregister(poll)?;
        }
        self.watch = (-1, false, false);
        Ok(())
    }
}

/// Connection to the session bus used to talk to the portal
pub(crate) struct PortalBus {
    channel: Rc<Channel>,
    unique_name: String,
    token: Option<RegistrationToken>,
}

impl fmt::Debug for PortalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalBus")
            .field("unique_name", &self.unique_name)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl PortalBus {
    /// Connect to the session bus and route its messages into the event loop
    pub fn connect(loop_handle: &LoopHandle<'static, MirrorState>) -> Result<PortalBus, BackendError> {
        let mut channel = Channel::get_private(BusType::Session)
            .map_err(|err| BackendError::Setup(format!("cannot connect to the session bus: {}", err)))?;
        channel.set_watch_enabled(true);
        let unique_name = channel
            .unique_name()
            .map(|name| name.to_string())
            .ok_or_else(|| BackendError::Setup("session bus connection without a unique name".into()))?;
        let channel = Rc::new(channel);

        let token = loop_handle
            .insert_source(DBusSource::new(channel.clone()), |message, _, state| {
                state.portal_message(message)
            })
            .map_err(|err| BackendError::Setup(err.error.to_string()))?;
        let bus = PortalBus {
            channel,
            unique_name,
            token: Some(token),
        };

        for rule in MATCH_RULES {
            let message = Message::new_method_call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "AddMatch",
            )
            .map_err(BackendError::Setup)?
            .append1(rule);
            bus.channel
                .send(message)
                .map_err(|()| BackendError::Setup("session bus connection closed".into()))?;
        }
        debug!(unique_name = %bus.unique_name, "Connected to the session bus");
        Ok(bus)
    }

    /// Unique name of the connection
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn send(&self, request: &PortalRequest) -> Result<u32, String> {
        let message = request_message(request)?;
        let serial = self
            .channel
            .send(message)
            .map_err(|()| String::from("session bus connection closed"))?;
        self.channel.flush();
        trace!(serial, ?request, "Sent portal call");
        Ok(serial)
    }

    /// Close the session, if any, and stop listening on the bus
    pub fn close(&mut self, loop_handle: &LoopHandle<'static, MirrorState>, session: Option<&str>) {
        if let Some(session) = session {
            let message = session_path(session)
                .and_then(|path| Message::new_method_call(PORTAL_DEST, path, SESSION_INTERFACE, "Close"));
            match message {
                Ok(message) => {
                    if self.channel.send(message).is_err() {
                        debug!("Session bus gone before closing the portal session");
                    }
                    self.channel.flush();
                }
                Err(err) => warn!(%err, "Invalid portal session path"),
            }
        }
        if let Some(token) = self.token.take() {
            // the source may be dispatching right now
            let handle = loop_handle.clone();
            loop_handle.insert_idle(move |_| handle.remove(token));
        }
    }
}

fn options(entries: impl IntoIterator<Item = (&'static str, Box<dyn RefArg>)>) -> PropMap {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), Variant(value)))
        .collect()
}

fn session_path(session: &str) -> Result<Path<'static>, String> {
    Path::new(session.to_owned())
}

fn request_message(request: &PortalRequest) -> Result<Message, String> {
    let call = |method: &str| Message::new_method_call(PORTAL_DEST, PORTAL_PATH, SCREENCAST_INTERFACE, method);
    Ok(match request {
        PortalRequest::GetProperties => {
            Message::new_method_call(PORTAL_DEST, PORTAL_PATH, "org.freedesktop.DBus.Properties", "GetAll")?
                .append1(SCREENCAST_INTERFACE)
        }
        PortalRequest::CreateSession {
            handle_token,
            session_token,
        } => call("CreateSession")?.append1(options([
            ("handle_token", Box::new(handle_token.clone()) as Box<dyn RefArg>),
            ("session_handle_token", Box::new(session_token.clone()) as Box<dyn RefArg>),
        ])),
        PortalRequest::SelectSources {
            session,
            handle_token,
            source_types,
            cursor_mode,
        } => {
            let mut entries: Vec<(&'static str, Box<dyn RefArg>)> = vec![
                ("handle_token", Box::new(handle_token.clone()) as Box<dyn RefArg>),
                ("types", Box::new(*source_types) as Box<dyn RefArg>),
                ("multiple", Box::new(false) as Box<dyn RefArg>),
            ];
            if let Some(cursor_mode) = cursor_mode {
                entries.push(("cursor_mode", Box::new(*cursor_mode) as Box<dyn RefArg>));
            }
            call("SelectSources")?.append2(session_path(session)?, options(entries))
        }
        PortalRequest::Start { session, handle_token } => call("Start")?.append3(
            session_path(session)?,
            "",
            options([("handle_token", Box::new(handle_token.clone()) as Box<dyn RefArg>)]),
        ),
        PortalRequest::OpenPipeWireRemote { session } => {
            call("OpenPipeWireRemote")?.append2(session_path(session)?, PropMap::new())
        }
    })
}

fn prop_u32(props: &PropMap, key: &str) -> u32 {
    props
        .get(key)
        .and_then(|value| value.0.as_u64())
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0)
}

fn parse_reply(message: &Message, kind: ReplyKind) -> PortalReply {
    if message.msg_type() == MessageType::Error {
        let err = message
            .read1::<&str>()
            .map(str::to_owned)
            .unwrap_or_else(|_| String::from("unknown error"));
        return PortalReply::Error(err);
    }
    match kind {
        ReplyKind::Properties => match message.read1::<PropMap>() {
            Ok(props) => PortalReply::Properties {
                source_types: prop_u32(&props, "AvailableSourceTypes"),
                cursor_modes: prop_u32(&props, "AvailableCursorModes"),
                version: prop_u32(&props, "version"),
            },
            Err(err) => PortalReply::Error(err.to_string()),
        },
        ReplyKind::RequestHandle => match message.read1::<Path>() {
            Ok(path) => PortalReply::RequestHandle(path.to_string()),
            Err(err) => PortalReply::Error(err.to_string()),
        },
        ReplyKind::RemoteFd => match message.read1::<dbus::arg::OwnedFd>() {
            // SAFETY: into_fd hands over ownership of a valid fd
            Ok(fd) => PortalReply::RemoteFd(unsafe { OwnedFd::from_raw_fd(fd.into_fd()) }),
            Err(err) => PortalReply::Error(err.to_string()),
        },
    }
}

fn parse_results(results: &PropMap) -> ResponseResults {
    let session_handle = results
        .get("session_handle")
        .and_then(|value| value.0.as_str())
        .map(str::to_owned);
    // a(ua{sv}), the node id leads every entry
    let streams = results
        .get("streams")
        .and_then(|value| value.0.as_iter())
        .map(|streams| {
            streams
                .filter_map(|stream| stream.as_iter()?.next()?.as_u64())
                .filter_map(|node_id| u32::try_from(node_id).ok())
                .collect()
        })
        .unwrap_or_default();
    ResponseResults {
        session_handle,
        streams,
    }
}

impl PortalBackend {
    /// Handle a message received on the session bus
    pub fn handle_message(&mut self, ctx: &mut CaptureContext<'_>, message: Message) {
        let step = match message.msg_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let Some(serial) = message.get_reply_serial() else {
                    return;
                };
                let Some(kind) = self.machine.expected_reply(serial) else {
                    return;
                };
                self.machine.on_reply(serial, parse_reply(&message, kind))
            }
            MessageType::Signal => {
                let Some(path) = message.path().map(|path| path.to_string()) else {
                    return;
                };
                let interface = message.interface();
                let member = message.member();
                match (interface.as_deref(), member.as_deref()) {
                    (Some(REQUEST_INTERFACE), Some("Response")) => match message.read2::<u32, PropMap>() {
                        Ok((code, results)) => self.machine.on_response(&path, code, parse_results(&results)),
                        Err(err) => {
                            warn!(%err, %path, "Malformed portal response");
                            return;
                        }
                    },
                    (Some(SESSION_INTERFACE), Some("Closed")) => self.machine.on_session_closed(&path),
                    _ => return,
                }
            }
            _ => return,
        };
        self.apply(ctx, step);
    }

    pub(super) fn apply(&mut self, ctx: &mut CaptureContext<'_>, step: PortalStep) {
        match step {
            PortalStep::Continue | PortalStep::Broken => {}
            PortalStep::Send(request) => match self.bus.send(&request) {
                Ok(serial) => self.machine.sent(serial),
                Err(err) => {
                    warn!(%err, ?request, "Failed to send portal call");
                    self.machine.send_failed();
                }
            },
            PortalStep::Remote { fd, node_id } => self.open_remote(ctx, fd, node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_messages_target_the_screencast_interface() {
        let message = request_message(&PortalRequest::CreateSession {
            handle_token: "smithay_mirror2".into(),
            session_token: "smithay_mirror1".into(),
        })
        .unwrap();
        assert_eq!(message.interface().as_deref(), Some(SCREENCAST_INTERFACE));
        assert_eq!(message.member().as_deref(), Some("CreateSession"));
        let options: PropMap = message.read1().unwrap();
        assert_eq!(
            options.get("handle_token").and_then(|value| value.0.as_str()),
            Some("smithay_mirror2")
        );
    }

    #[test]
    fn invalid_session_paths_are_rejected() {
        assert!(request_message(&PortalRequest::OpenPipeWireRemote {
            session: "not a path".into()
        })
        .is_err());
    }

    #[test]
    fn stream_node_ids_are_extracted() {
        let stream: (u32, PropMap) = (57, PropMap::new());
        let mut results = PropMap::new();
        results.insert("streams".into(), Variant(Box::new(vec![stream]) as Box<dyn RefArg>));
        results.insert(
            "session_handle".into(),
            Variant(Box::new(String::from("/org/freedesktop/portal/desktop/session/1_42/a")) as Box<dyn RefArg>),
        );
        let parsed = parse_results(&results);
        assert_eq!(parsed.streams, vec![57]);
        assert_eq!(
            parsed.session_handle.as_deref(),
            Some("/org/freedesktop/portal/desktop/session/1_42/a")
        );
    }
}
