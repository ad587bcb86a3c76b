//! Output association of the mirror window
//!
//! The window presenting the mirrored frames is provided by the embedder, we only follow its
//! `wl_surface.enter`/`leave` events to know which output it is shown on. The scale and transform of
//! that output decide how frames have to be presented.

use tracing::debug;

use super::output::OutputList;
use crate::utils::Transform;

/// Outputs the mirror window currently overlaps, most recently entered last
#[derive(Debug, Default)]
pub struct WindowOutputs {
    entered: Vec<u32>,
}

impl WindowOutputs {
    /// The surface entered the output with the given global name
    ///
    /// Returns `true` if the output the window is considered to be on changed.
    pub fn enter(&mut self, global: u32) -> bool {
        let before = self.current();
        self.entered.retain(|name| *name != global);
        self.entered.push(global);
        self.changed_from(before)
    }

    /// The surface left the output with the given global name
    ///
    /// Returns `true` if the output the window is considered to be on changed.
    pub fn leave(&mut self, global: u32) -> bool {
        let before = self.current();
        self.entered.retain(|name| *name != global);
        self.changed_from(before)
    }

    fn changed_from(&self, before: Option<u32>) -> bool {
        let changed = before != self.current();
        if changed {
            debug!(output = ?self.current(), "Mirror window moved");
        }
        changed
    }

    /// The output the window is considered to be shown on
    pub fn current(&self) -> Option<u32> {
        self.entered.last().copied()
    }

    /// Scale and transform of the output the window is shown on
    pub fn presentation<H>(&self, outputs: &OutputList<H>) -> (i32, Transform) {
        self.current()
            .and_then(|global| outputs.get(global))
            .map(|entry| (entry.info().scale, entry.info().transform))
            .unwrap_or((1, Transform::Normal))
    }
}

#[cfg(test)]
mod tests {
    use super::WindowOutputs;
    use crate::{
        utils::Transform,
        wayland::output::{OutputEvent, OutputList},
    };

    #[test]
    fn follows_last_entered_output() {
        let mut outputs = OutputList::new(None);
        outputs.add(1, ());
        outputs.add(2, ());
        outputs.handle_event(2, OutputEvent::Scale(2));
        outputs.handle_event(2, OutputEvent::Transform(Transform::Flipped));
        outputs.handle_event(2, OutputEvent::WlDone);

        let mut window = WindowOutputs::default();
        assert_eq!(window.presentation(&outputs), (1, Transform::Normal));
        assert!(window.enter(1));
        assert!(window.enter(2));
        assert!(!window.enter(2));
        assert_eq!(window.presentation(&outputs), (2, Transform::Flipped));
        assert!(window.leave(2));
        assert_eq!(window.current(), Some(1));
        assert!(!window.leave(7));
    }
}
