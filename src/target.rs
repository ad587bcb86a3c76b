//! What is being mirrored
//!
//! A [`TargetSpec`] is the user-facing description of a capture target (`null:`, `output:NAME`,
//! `toplevel:ID` or a bare output name). It is resolved against the live output and toplevel lists
//! into a [`CaptureTarget`], which capture backends hold on to while they run.

use std::{fmt, str::FromStr};

use tracing::debug;
use wayland_client::protocol::wl_output::WlOutput;
use wayland_protocols::ext::{
    foreign_toplevel_list::v1::client::ext_foreign_toplevel_handle_v1::ExtForeignToplevelHandleV1,
    image_capture_source::v1::client::ext_image_capture_source_v1::ExtImageCaptureSourceV1,
};

use crate::{
    utils::Transform,
    wayland::{output::OutputList, toplevel::ToplevelList},
};

/// Parsed target description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TargetSpec {
    /// Mirror nothing
    #[default]
    Null,
    /// Mirror the output with the given name
    Output(String),
    /// Mirror the toplevel with the given identifier (or title)
    Toplevel(String),
}

/// Error returned when a target string cannot be parsed
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetParseError {
    /// The prefix before `:` is not known
    #[error("unknown target type `{0}`")]
    UnknownPrefix(String),
    /// An output or toplevel target without a name
    #[error("target `{0}:` needs a name")]
    MissingName(&'static str),
}

impl FromStr for TargetSpec {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((prefix, name)) = s.split_once(':') else {
            if s.is_empty() {
                return Err(TargetParseError::MissingName("output"));
            }
            return Ok(TargetSpec::Output(s.to_owned()));
        };

        match prefix {
            "null" => Ok(TargetSpec::Null),
            "output" if name.is_empty() => Err(TargetParseError::MissingName("output")),
            "output" => Ok(TargetSpec::Output(name.to_owned())),
            "toplevel" if name.is_empty() => Err(TargetParseError::MissingName("toplevel")),
            "toplevel" => Ok(TargetSpec::Toplevel(name.to_owned())),
            other => Err(TargetParseError::UnknownPrefix(other.to_owned())),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Null => f.write_str("null:"),
            TargetSpec::Output(name) => write!(f, "output:{}", name),
            TargetSpec::Toplevel(id) => write!(f, "toplevel:{}", id),
        }
    }
}

/// Errors resolving a [`TargetSpec`] against the compositor state
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    /// No output with this name is advertised
    #[error("no output named `{0}`")]
    OutputNotFound(String),
    /// The compositor offers no way to enumerate or capture toplevels
    #[error("compositor does not support capturing toplevels")]
    ToplevelsUnsupported,
}

/// Outcome of resolving a target against the live compositor state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<O, T> {
    /// Nothing to capture
    Null,
    /// A known output
    Output {
        /// Registry name of the output global
        global: u32,
        /// Handle of the output
        output: O,
        /// Transform the compositor applies to the output
        transform: Transform,
    },
    /// A known toplevel
    Toplevel(T),
    /// The toplevel is not known yet; resolution has to be retried once it appears
    Pending,
}

impl TargetSpec {
    /// Resolve this spec against the outputs and, if supported, toplevels known so far
    pub fn resolve<O: Clone, T: Clone>(
        &self,
        outputs: &OutputList<O>,
        toplevels: Option<&ToplevelList<T>>,
    ) -> Result<Resolution<O, T>, TargetError> {
        match self {
            TargetSpec::Null => Ok(Resolution::Null),
            TargetSpec::Output(name) => {
                let entry = outputs
                    .find_by_name(name)
                    .ok_or_else(|| TargetError::OutputNotFound(name.clone()))?;
                Ok(Resolution::Output {
                    global: entry.global(),
                    output: entry.handle().clone(),
                    transform: entry.info().transform,
                })
            }
            TargetSpec::Toplevel(id) => {
                let toplevels = toplevels.ok_or(TargetError::ToplevelsUnsupported)?;
                match toplevels.find(id) {
                    Some(entry) => Ok(Resolution::Toplevel(entry.handle().clone())),
                    None => {
                        debug!(toplevel = %id, "Toplevel not advertised yet, waiting");
                        Ok(Resolution::Pending)
                    }
                }
            }
        }
    }
}

/// Kind of a resolved capture target
#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    /// Nothing is captured
    Null,
    /// A whole output
    Output {
        /// Registry name of the output global, used to notice its removal
        global: u32,
        /// The output itself
        output: WlOutput,
    },
    /// A single toplevel window
    Toplevel {
        /// Handle from the foreign toplevel list
        handle: ExtForeignToplevelHandleV1,
    },
}

/// A resolved capture target
///
/// The mirror controller owns the target; backends only borrow it for the duration of a call.
#[derive(Debug)]
pub struct CaptureTarget {
    /// What is captured
    pub kind: TargetKind,
    /// Transform needed to present captured frames upright
    pub transform: Transform,
    /// Capture source for `ext-image-copy-capture`, created lazily by the backend needing it
    pub source: Option<ExtImageCaptureSourceV1>,
}

impl CaptureTarget {
    /// A target capturing nothing
    pub fn null() -> CaptureTarget {
        CaptureTarget {
            kind: TargetKind::Null,
            transform: Transform::Normal,
            source: None,
        }
    }

    /// Build a target out of a resolved spec
    ///
    /// Returns `None` for [`Resolution::Pending`].
    pub fn from_resolution(resolution: Resolution<WlOutput, ExtForeignToplevelHandleV1>) -> Option<Self> {
        let kind = match resolution {
            Resolution::Null => return Some(CaptureTarget::null()),
            Resolution::Pending => return None,
            Resolution::Output {
                global,
                output,
                transform,
            } => {
                return Some(CaptureTarget {
                    kind: TargetKind::Output { global, output },
                    transform,
                    source: None,
                })
            }
            Resolution::Toplevel(handle) => TargetKind::Toplevel { handle },
        };
        Some(CaptureTarget {
            kind,
            transform: Transform::Normal,
            source: None,
        })
    }

    /// Whether nothing is captured
    pub fn is_null(&self) -> bool {
        matches!(self.kind, TargetKind::Null)
    }

    /// The output being captured, if this is an output target
    pub fn output(&self) -> Option<&WlOutput> {
        match &self.kind {
            TargetKind::Output { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Whether the target depends on the output global with the given name
    pub fn uses_output_global(&self, name: u32) -> bool {
        matches!(self.kind, TargetKind::Output { global, .. } if global == name)
    }

    /// Whether the target is the given toplevel
    pub fn is_toplevel(&self, toplevel: &ExtForeignToplevelHandleV1) -> bool {
        matches!(&self.kind, TargetKind::Toplevel { handle } if handle == toplevel)
    }

    /// Destroy the capture source, if one was created
    pub fn release_source(&mut self) {
        if let Some(source) = self.source.take() {
            source.destroy();
        }
    }
}

impl Drop for CaptureTarget {
    fn drop(&mut self) {
        self.release_source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wayland::output::OutputEvent;

    #[test]
    fn parse_prefixed_targets() {
        assert_eq!("null:".parse(), Ok(TargetSpec::Null));
        assert_eq!("output:eDP-1".parse(), Ok(TargetSpec::Output("eDP-1".into())));
        assert_eq!("toplevel:xyz".parse(), Ok(TargetSpec::Toplevel("xyz".into())));
    }

    #[test]
    fn bare_name_is_an_output() {
        assert_eq!("eDP-1".parse::<TargetSpec>(), "output:eDP-1".parse::<TargetSpec>());
    }

    #[test]
    fn parse_rejects_unknown_prefix_and_missing_names() {
        assert_eq!(
            "bogus:xyz".parse::<TargetSpec>(),
            Err(TargetParseError::UnknownPrefix("bogus".into()))
        );
        assert_eq!(
            "output:".parse::<TargetSpec>(),
            Err(TargetParseError::MissingName("output"))
        );
        assert!("toplevel:".parse::<TargetSpec>().is_err());
        assert!("".parse::<TargetSpec>().is_err());
    }

    #[test]
    fn display_uses_canonical_form() {
        assert_eq!(TargetSpec::Output("HDMI-A-1".into()).to_string(), "output:HDMI-A-1");
        assert_eq!(TargetSpec::Null.to_string(), "null:");
    }

    #[test]
    fn resolve_output_by_name() {
        let mut outputs = OutputList::new(None);
        outputs.add(7, "first");
        outputs.add(9, "second");
        outputs.handle_event(9, OutputEvent::Name("DP-2".into()));
        outputs.handle_event(9, OutputEvent::Transform(Transform::_90));
        outputs.handle_event(9, OutputEvent::WlDone);

        let resolved = TargetSpec::Output("DP-2".into())
            .resolve::<_, ()>(&outputs, None)
            .unwrap();
        assert_eq!(
            resolved,
            Resolution::Output {
                global: 9,
                output: "second",
                transform: Transform::_90,
            }
        );
        assert_eq!(
            TargetSpec::Output("DP-3".into()).resolve::<_, ()>(&outputs, None),
            Err(TargetError::OutputNotFound("DP-3".into()))
        );
    }

    #[test]
    fn resolve_toplevel_waits_until_it_appears() {
        let outputs = OutputList::<()>::new(None);
        let mut toplevels = ToplevelList::default();
        let spec = TargetSpec::Toplevel("term".into());

        assert_eq!(
            spec.resolve::<(), u32>(&outputs, None),
            Err(TargetError::ToplevelsUnsupported)
        );
        assert_eq!(spec.resolve(&outputs, Some(&toplevels)), Ok(Resolution::Pending));

        toplevels.add(1u32);
        toplevels.set_title(&1, "term".into());
        toplevels.done(&1);
        assert_eq!(spec.resolve(&outputs, Some(&toplevels)), Ok(Resolution::Toplevel(1)));
    }
}
