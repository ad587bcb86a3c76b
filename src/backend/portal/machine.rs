//! Handshake of the ScreenCast portal
//!
//! ```text
//! Init --begin--> WaitProperties --GetAll reply--> WaitSession --Response--> WaitSources
//!      --Response--> WaitStart --Response--> WaitRemote --OpenPipeWireRemote reply--> Streaming
//! ```
//!
//! Every step is a method call answered twice: the method reply carries the object path of a
//! `Request`, the actual result arrives later as the `Response` signal of that request. Pending
//! steps are kept in a table of continuations keyed by reply serial or request path. Anything
//! unexpected, a non-zero response code or the session closing moves to [`PortalState::Broken`],
//! which is terminal.

use std::{collections::HashMap, marker::PhantomData, os::unix::io::OwnedFd};

use tracing::{debug, trace, warn};

/// `AvailableSourceTypes` bit of monitors
pub const SOURCE_TYPE_MONITOR: u32 = 1;
/// `AvailableSourceTypes` bit of windows
pub const SOURCE_TYPE_WINDOW: u32 = 2;
/// `AvailableCursorModes` bit of a hidden cursor
pub const CURSOR_MODE_HIDDEN: u32 = 1;
/// `AvailableCursorModes` bit of a cursor embedded into frames
pub const CURSOR_MODE_EMBEDDED: u32 = 2;
/// First interface version supporting `cursor_mode`
pub const CURSOR_MODE_SINCE: u32 = 2;

const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";

/// What the portal should offer the user to pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// A whole monitor
    Monitor,
    /// A single window
    Window,
}

impl SourceType {
    fn bits(self) -> u32 {
        match self {
            SourceType::Monitor => SOURCE_TYPE_MONITOR,
            SourceType::Window => SOURCE_TYPE_WINDOW,
        }
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalState {
    /// Nothing sent yet
    Init,
    /// Waiting for the interface properties
    WaitProperties,
    /// Waiting for the session to be created
    WaitSession,
    /// Waiting for the source selection
    WaitSources,
    /// Waiting for the user to start the cast
    WaitStart,
    /// Waiting for the media transport fd
    WaitRemote,
    /// The media stream is set up
    Streaming,
    /// The handshake failed, terminal
    Broken,
}

/// A method call to issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalRequest {
    /// `org.freedesktop.DBus.Properties.GetAll` of the ScreenCast interface
    GetProperties,
    /// `CreateSession`
    CreateSession {
        /// `handle_token` option
        handle_token: String,
        /// `session_handle_token` option
        session_token: String,
    },
    /// `SelectSources`
    SelectSources {
        /// Session object path
        session: String,
        /// `handle_token` option
        handle_token: String,
        /// `types` option
        source_types: u32,
        /// `cursor_mode` option, if supported
        cursor_mode: Option<u32>,
    },
    /// `Start`
    Start {
        /// Session object path
        session: String,
        /// `handle_token` option
        handle_token: String,
    },
    /// `OpenPipeWireRemote`
    OpenPipeWireRemote {
        /// Session object path
        session: String,
    },
}

/// How the reply to a serial has to be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// `a{sv}` of properties
    Properties,
    /// Object path of a `Request`
    RequestHandle,
    /// A unix fd
    RemoteFd,
}

/// A decoded method reply
#[derive(Debug)]
pub enum PortalReply<F = OwnedFd> {
    /// Properties of the ScreenCast interface
    Properties {
        /// `AvailableSourceTypes`
        source_types: u32,
        /// `AvailableCursorModes`, zero if absent
        cursor_modes: u32,
        /// `version`
        version: u32,
    },
    /// Path of the `Request` object answering the call
    RequestHandle(String),
    /// The media transport fd
    RemoteFd(F),
    /// The call failed
    Error(String),
}

/// Decoded results of a `Response` signal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseResults {
    /// `session_handle`
    pub session_handle: Option<String>,
    /// Node ids of `streams`
    pub streams: Vec<u32>,
}

/// Output of the [`PortalMachine`]
#[derive(Debug)]
pub enum PortalStep<F = OwnedFd> {
    /// Nothing to do
    Continue,
    /// Issue this call, then report its serial with [`PortalMachine::sent`]
    Send(PortalRequest),
    /// The media stream can be connected
    Remote {
        /// Media transport connection
        fd: F,
        /// Node of the stream to consume
        node_id: u32,
    },
    /// The handshake just failed
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Correlation {
    Reply(u32),
    Response(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Continuation {
    Properties,
    RequestHandle { expected: String },
    SessionCreated,
    SourcesSelected,
    Started,
    RemoteOpened,
}

/// Sans-IO state machine of the portal handshake
#[derive(Debug)]
pub struct PortalMachine<F = OwnedFd> {
    state: PortalState,
    source: SourceType,
    show_cursor: bool,
    sender: String,
    tokens: u32,
    session: Option<String>,
    cursor_mode: Option<u32>,
    node_id: Option<u32>,
    pending: HashMap<Correlation, Continuation>,
    outgoing: Option<Continuation>,
    _fd: PhantomData<F>,
}

impl<F> PortalMachine<F> {
    /// Create a machine asking for the given kind of source
    pub fn new(source: SourceType, show_cursor: bool) -> Self {
        PortalMachine {
            state: PortalState::Init,
            source,
            show_cursor,
            sender: String::new(),
            tokens: 0,
            session: None,
            cursor_mode: None,
            node_id: None,
            pending: HashMap::new(),
            outgoing: None,
            _fd: PhantomData,
        }
    }

    /// Current state
    pub fn state(&self) -> PortalState {
        self.state
    }

    /// Object path of the session, once created
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Node id of the stream, once started
    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    /// Start the handshake on a connection with the given unique bus name
    pub fn begin(&mut self, unique_name: &str) -> PortalStep<F> {
        if self.state != PortalState::Init {
            return PortalStep::Continue;
        }
        self.sender = unique_name.trim_start_matches(':').replace('.', "_");
        self.state = PortalState::WaitProperties;
        self.outgoing = Some(Continuation::Properties);
        PortalStep::Send(PortalRequest::GetProperties)
    }

    /// The last requested call was sent with `serial`
    pub fn sent(&mut self, serial: u32) {
        if let Some(continuation) = self.outgoing.take() {
            trace!(serial, ?continuation, "Portal call sent");
            self.pending.insert(Correlation::Reply(serial), continuation);
        }
    }

    /// The last requested call could not be sent
    pub fn send_failed(&mut self) -> PortalStep<F> {
        self.broken("failed to send portal call")
    }

    /// How to decode the reply to `serial`, `None` if no reply is expected
    pub fn expected_reply(&self, serial: u32) -> Option<ReplyKind> {
        match self.pending.get(&Correlation::Reply(serial))? {
            Continuation::Properties => Some(ReplyKind::Properties),
            Continuation::RequestHandle { .. } => Some(ReplyKind::RequestHandle),
            Continuation::RemoteOpened => Some(ReplyKind::RemoteFd),
            _ => None,
        }
    }

    /// Feed the reply to an earlier call
    pub fn on_reply(&mut self, serial: u32, reply: PortalReply<F>) -> PortalStep<F> {
        let Some(continuation) = self.pending.remove(&Correlation::Reply(serial)) else {
            trace!(serial, "Ignoring unrelated reply");
            return PortalStep::Continue;
        };

        match (self.state, continuation, reply) {
            (_, _, PortalReply::Error(err)) => self.broken(&err),
            (
                PortalState::WaitProperties,
                Continuation::Properties,
                PortalReply::Properties {
                    source_types,
                    cursor_modes,
                    version,
                },
            ) => self.properties(source_types, cursor_modes, version),
            (_, Continuation::RequestHandle { expected }, PortalReply::RequestHandle(path)) => {
                if path != expected {
                    // older portals do not derive the path from the handle token
                    debug!(%expected, %path, "Portal request path differs from the expected one");
                    match self.pending.remove(&Correlation::Response(expected)) {
                        Some(continuation) => {
                            self.pending.insert(Correlation::Response(path), continuation);
                        }
                        None => return self.broken("request handle for an unknown request"),
                    }
                }
                PortalStep::Continue
            }
            (PortalState::WaitRemote, Continuation::RemoteOpened, PortalReply::RemoteFd(fd)) => {
                let Some(node_id) = self.node_id else {
                    return self.broken("no stream to connect to");
                };
                debug!(node_id, "Portal cast started");
                self.state = PortalState::Streaming;
                PortalStep::Remote { fd, node_id }
            }
            (state, continuation, _) => {
                warn!(?state, ?continuation, "Unexpected portal reply");
                self.broken("unexpected reply")
            }
        }
    }

    /// Feed a `Response` signal of a request object
    pub fn on_response(&mut self, path: &str, code: u32, results: ResponseResults) -> PortalStep<F> {
        let Some(continuation) = self.pending.remove(&Correlation::Response(path.to_owned())) else {
            trace!(path, "Ignoring unrelated portal response");
            return PortalStep::Continue;
        };
        if code != 0 {
            let reason = if code == 1 {
                "cancelled by the user"
            } else {
                "request failed"
            };
            return self.broken(reason);
        }

        match (self.state, continuation) {
            (PortalState::WaitSession, Continuation::SessionCreated) => {
                let Some(session) = results.session_handle else {
                    return self.broken("no session handle");
                };
                debug!(%session, "Portal session created");
                self.session = Some(session.clone());
                self.state = PortalState::WaitSources;
                let handle_token = self.request(Continuation::SourcesSelected);
                PortalStep::Send(PortalRequest::SelectSources {
                    session,
                    handle_token,
                    source_types: self.source.bits(),
                    cursor_mode: self.cursor_mode,
                })
            }
            (PortalState::WaitSources, Continuation::SourcesSelected) => {
                let Some(session) = self.session.clone() else {
                    return self.broken("no session");
                };
                self.state = PortalState::WaitStart;
                let handle_token = self.request(Continuation::Started);
                PortalStep::Send(PortalRequest::Start { session, handle_token })
            }
            (PortalState::WaitStart, Continuation::Started) => {
                let (Some(session), Some(&node_id)) = (self.session.clone(), results.streams.first()) else {
                    return self.broken("no stream started");
                };
                self.node_id = Some(node_id);
                self.state = PortalState::WaitRemote;
                self.outgoing = Some(Continuation::RemoteOpened);
                PortalStep::Send(PortalRequest::OpenPipeWireRemote { session })
            }
            (state, continuation) => {
                warn!(?state, ?continuation, "Unexpected portal response");
                self.broken("unexpected response")
            }
        }
    }

    /// Feed a `Closed` signal of a session object
    pub fn on_session_closed(&mut self, path: &str) -> PortalStep<F> {
        if self.session.as_deref() != Some(path) {
            return PortalStep::Continue;
        }
        self.broken("session closed")
    }

    fn properties(&mut self, source_types: u32, cursor_modes: u32, version: u32) -> PortalStep<F> {
        if source_types & self.source.bits() == 0 {
            return self.broken("source type not available");
        }
        self.cursor_mode = (version >= CURSOR_MODE_SINCE).then(|| self.pick_cursor_mode(cursor_modes));

        self.state = PortalState::WaitSession;
        let session_token = self.token();
        let handle_token = self.request(Continuation::SessionCreated);
        PortalStep::Send(PortalRequest::CreateSession {
            handle_token,
            session_token,
        })
    }

    fn pick_cursor_mode(&self, available: u32) -> u32 {
        let wanted = if self.show_cursor {
            CURSOR_MODE_EMBEDDED
        } else {
            CURSOR_MODE_HIDDEN
        };
        if available & wanted != 0 {
            wanted
        } else if available & CURSOR_MODE_EMBEDDED != 0 {
            CURSOR_MODE_EMBEDDED
        } else {
            CURSOR_MODE_HIDDEN
        }
    }

    fn token(&mut self) -> String {
        self.tokens += 1;
        format!("smithay_mirror{}", self.tokens)
    }

    /// Register the continuations of a call answered through a `Request` object
    fn request(&mut self, continuation: Continuation) -> String {
        let token = self.token();
        let expected = format!("{}/{}/{}", REQUEST_PATH_PREFIX, self.sender, token);
        self.pending
            .insert(Correlation::Response(expected.clone()), continuation);
        self.outgoing = Some(Continuation::RequestHandle { expected });
        token
    }

    fn broken(&mut self, reason: &str) -> PortalStep<F> {
        warn!(state = ?self.state, reason, "Portal handshake failed");
        self.state = PortalState::Broken;
        self.pending.clear();
        self.outgoing = None;
        PortalStep::Broken
    }
}
