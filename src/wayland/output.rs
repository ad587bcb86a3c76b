//! Output tracking
//!
//! Every `wl_output` advertised by the compositor gets an [`OutputEntry`]. Its properties arrive in
//! two independent streams: the core `wl_output` events (name, mode, scale, transform) and the
//! logical geometry from `zxdg_output_v1`. Each stream terminates with its own `done` event and an
//! entry only becomes usable once both have been seen at least once.
//!
//! Starting with version 3 of `zxdg_output_manager_v1` the `zxdg_output_v1.done` event is
//! deprecated and `wl_output.done` covers both streams. The same applies when the compositor has no
//! xdg-output support at all. [`OutputList`] handles this rule internally, see
//! [`XDG_OUTPUT_DONE_DEPRECATED_SINCE`].
//!
//! Once the initial registry round trip is done and every output is complete, the list fires a
//! single "all outputs ready" notification (see [`OutputList::take_initial_ready`]). Everything
//! happening after that is treated as a live change: the properties are merged into the existing
//! entry and the changed fields are accumulated as [`OutputChanges`] until somebody takes them.

use tracing::{debug, trace};

use crate::utils::Transform;

/// Version of `zxdg_output_manager_v1` from which on `wl_output.done` implies `zxdg_output_v1.done`
pub const XDG_OUTPUT_DONE_DEPRECATED_SINCE: u32 = 3;

bitflags::bitflags! {
    /// Which of the two property streams of an output have completed at least once
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OutputDone: u8 {
        /// `wl_output.done` was received
        const WL = 1;
        /// `zxdg_output_v1.done` was received (or implied)
        const XDG = 2;
    }
}

bitflags::bitflags! {
    /// Properties of an output that changed after the initial population
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OutputChanges: u8 {
        /// The name changed
        const NAME = 1;
        /// The logical position changed
        const POSITION = 2;
        /// The logical size changed
        const SIZE = 4;
        /// The integer scale changed
        const SCALE = 8;
        /// The transform changed
        const TRANSFORM = 16;
        /// The current mode changed
        const MODE = 32;
    }
}

/// Properties of an output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    /// Connector name, like `eDP-1`
    pub name: Option<String>,
    /// Logical position in the global compositor space
    pub position: (i32, i32),
    /// Logical size
    pub logical_size: (i32, i32),
    /// Integer scale factor
    pub scale: i32,
    /// Transform applied to the output
    pub transform: Transform,
    /// Size of the current mode in pixels
    pub mode: (i32, i32),
}

impl Default for OutputInfo {
    fn default() -> Self {
        OutputInfo {
            name: None,
            position: (0, 0),
            logical_size: (0, 0),
            scale: 1,
            transform: Transform::Normal,
            mode: (0, 0),
        }
    }
}

impl OutputInfo {
    fn diff(&self, other: &OutputInfo) -> OutputChanges {
        let mut changes = OutputChanges::empty();
        changes.set(OutputChanges::NAME, self.name != other.name);
        changes.set(OutputChanges::POSITION, self.position != other.position);
        changes.set(OutputChanges::SIZE, self.logical_size != other.logical_size);
        changes.set(OutputChanges::SCALE, self.scale != other.scale);
        changes.set(OutputChanges::TRANSFORM, self.transform != other.transform);
        changes.set(OutputChanges::MODE, self.mode != other.mode);
        changes
    }
}

/// A single property update of an output, as received from either stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// `wl_output.name` or `zxdg_output_v1.name`
    Name(String),
    /// `zxdg_output_v1.logical_position`
    LogicalPosition(i32, i32),
    /// `zxdg_output_v1.logical_size`
    LogicalSize(i32, i32),
    /// `wl_output.scale`
    Scale(i32),
    /// `wl_output.geometry` transform
    Transform(Transform),
    /// `wl_output.mode` flagged as current
    Mode(i32, i32),
    /// `wl_output.done`
    WlDone,
    /// `zxdg_output_v1.done`
    XdgDone,
}

/// Notification produced by [`OutputList::handle_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputNotification {
    /// The output became complete for the first time
    Completed(u32),
    /// A live change of an already complete output, after the initial population
    Changed(u32, OutputChanges),
}

/// One tracked output
#[derive(Debug)]
pub struct OutputEntry<H> {
    global: u32,
    handle: H,
    current: OutputInfo,
    pending: OutputInfo,
    done: OutputDone,
    changes: OutputChanges,
}

impl<H> OutputEntry<H> {
    /// Registry name of the output global
    pub fn global(&self) -> u32 {
        self.global
    }

    /// Handle(s) associated with this output
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Mutable access to the handle(s), e.g. to attach the xdg-output object later on
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Committed properties of the output
    pub fn info(&self) -> &OutputInfo {
        &self.current
    }

    /// Whether both property streams completed at least once
    pub fn is_complete(&self) -> bool {
        self.done.is_all()
    }

    /// Streams that completed so far
    pub fn done(&self) -> OutputDone {
        self.done
    }
}

/// The live set of outputs
#[derive(Debug)]
pub struct OutputList<H> {
    entries: Vec<OutputEntry<H>>,
    xdg_manager_version: Option<u32>,
    initial_ready: bool,
}

impl<H> OutputList<H> {
    /// Create a new list
    ///
    /// `xdg_manager_version` is the bound version of `zxdg_output_manager_v1`, if any.
    pub fn new(xdg_manager_version: Option<u32>) -> Self {
        OutputList {
            entries: Vec::new(),
            xdg_manager_version,
            initial_ready: false,
        }
    }

    /// Update the bound version of `zxdg_output_manager_v1`
    ///
    /// The manager may be announced after the first outputs during the initial round trip.
    pub fn set_xdg_manager_version(&mut self, version: Option<u32>) {
        self.xdg_manager_version = version;
    }

    /// Whether `wl_output.done` also completes the logical geometry stream
    pub fn wl_done_implies_xdg(&self) -> bool {
        match self.xdg_manager_version {
            None => true,
            Some(version) => version >= XDG_OUTPUT_DONE_DEPRECATED_SINCE,
        }
    }

    /// Track a newly advertised output
    pub fn add(&mut self, global: u32, handle: H) {
        trace!(global, "New output");
        self.entries.push(OutputEntry {
            global,
            handle,
            current: OutputInfo::default(),
            pending: OutputInfo::default(),
            done: OutputDone::empty(),
            changes: OutputChanges::empty(),
        });
    }

    /// Stop tracking an output, returning its entry
    pub fn remove(&mut self, global: u32) -> Option<OutputEntry<H>> {
        let idx = self.entries.iter().position(|entry| entry.global == global)?;
        debug!(global, "Output removed");
        Some(self.entries.remove(idx))
    }

    /// Feed a property update of the output `global` into the list
    pub fn handle_event(&mut self, global: u32, event: OutputEvent) -> Option<OutputNotification> {
        let implied = self.wl_done_implies_xdg();
        let initial_ready = self.initial_ready;
        let entry = self.entries.iter_mut().find(|entry| entry.global == global)?;

        let signal = match event {
            OutputEvent::Name(name) => {
                entry.pending.name = Some(name);
                return None;
            }
            OutputEvent::LogicalPosition(x, y) => {
                entry.pending.position = (x, y);
                return None;
            }
            OutputEvent::LogicalSize(w, h) => {
                entry.pending.logical_size = (w, h);
                return None;
            }
            OutputEvent::Scale(scale) => {
                entry.pending.scale = scale;
                return None;
            }
            OutputEvent::Transform(transform) => {
                entry.pending.transform = transform;
                return None;
            }
            OutputEvent::Mode(w, h) => {
                entry.pending.mode = (w, h);
                return None;
            }
            OutputEvent::WlDone if implied => OutputDone::all(),
            OutputEvent::WlDone => OutputDone::WL,
            OutputEvent::XdgDone => OutputDone::XDG,
        };

        let was_complete = entry.is_complete();
        entry.done |= signal;
        let changes = entry.current.diff(&entry.pending);
        entry.current = entry.pending.clone();

        if !entry.is_complete() {
            return None;
        }
        if !was_complete {
            trace!(global, info = ?entry.current, "Output complete");
            return Some(OutputNotification::Completed(global));
        }
        if initial_ready && !changes.is_empty() {
            entry.changes |= changes;
            debug!(global, ?changes, "Output changed");
            return Some(OutputNotification::Changed(global, changes));
        }
        None
    }

    /// Number of outputs still waiting on one of their property streams
    pub fn incomplete(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_complete()).count()
    }

    /// Returns `true` exactly once: the first time it is called with the initial registry
    /// round trip done and no incomplete outputs left.
    pub fn take_initial_ready(&mut self, registry_synced: bool) -> bool {
        if self.initial_ready || !registry_synced || self.incomplete() != 0 {
            return false;
        }
        self.initial_ready = true;
        debug!(outputs = self.entries.len(), "All outputs ready");
        true
    }

    /// Whether the "all outputs ready" notification already fired
    pub fn is_initial_ready(&self) -> bool {
        self.initial_ready
    }

    /// Take the accumulated changes of an output
    pub fn take_changes(&mut self, global: u32) -> OutputChanges {
        self.entries
            .iter_mut()
            .find(|entry| entry.global == global)
            .map(|entry| std::mem::replace(&mut entry.changes, OutputChanges::empty()))
            .unwrap_or_else(OutputChanges::empty)
    }

    /// Look up an output by its registry name
    pub fn get(&self, global: u32) -> Option<&OutputEntry<H>> {
        self.entries.iter().find(|entry| entry.global == global)
    }

    /// Look up an output by its registry name
    pub fn get_mut(&mut self, global: u32) -> Option<&mut OutputEntry<H>> {
        self.entries.iter_mut().find(|entry| entry.global == global)
    }

    /// Look up a complete output by its connector name
    pub fn find_by_name(&self, name: &str) -> Option<&OutputEntry<H>> {
        self.entries
            .iter()
            .find(|entry| entry.is_complete() && entry.current.name.as_deref() == Some(name))
    }

    /// Iterate over all tracked outputs
    pub fn iter(&self) -> impl Iterator<Item = &OutputEntry<H>> {
        self.entries.iter()
    }

    /// Iterate mutably over all tracked outputs
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputEntry<H>> {
        self.entries.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(list: &mut OutputList<()>, global: u32, name: &str) {
        list.handle_event(global, OutputEvent::Name(name.into()));
        list.handle_event(global, OutputEvent::Mode(1920, 1080));
        list.handle_event(global, OutputEvent::LogicalSize(1920, 1080));
    }

    #[test]
    fn wl_done_alone_is_not_enough_for_old_xdg_output() {
        let mut list = OutputList::new(Some(2));
        list.add(1, ());
        describe(&mut list, 1, "eDP-1");

        assert_eq!(list.handle_event(1, OutputEvent::WlDone), None);
        assert_eq!(list.get(1).unwrap().done(), OutputDone::WL);
        assert!(list.find_by_name("eDP-1").is_none());
        assert_eq!(
            list.handle_event(1, OutputEvent::XdgDone),
            Some(OutputNotification::Completed(1))
        );
        assert!(list.find_by_name("eDP-1").is_some());
    }

    #[test]
    fn wl_done_implies_xdg_done_from_version_three_or_without_manager() {
        for version in [None, Some(3)] {
            let mut list = OutputList::new(version);
            list.add(1, ());
            assert_eq!(
                list.handle_event(1, OutputEvent::WlDone),
                Some(OutputNotification::Completed(1))
            );
            assert!(list.get(1).unwrap().is_complete());
        }
    }

    #[test]
    fn readiness_barrier_fires_once_regardless_of_order() {
        let orders: [&[(u32, OutputEvent)]; 3] = [
            &[
                (1, OutputEvent::WlDone),
                (1, OutputEvent::XdgDone),
                (2, OutputEvent::WlDone),
                (2, OutputEvent::XdgDone),
            ],
            &[
                (2, OutputEvent::XdgDone),
                (1, OutputEvent::WlDone),
                (2, OutputEvent::WlDone),
                (1, OutputEvent::XdgDone),
            ],
            &[
                (1, OutputEvent::XdgDone),
                (2, OutputEvent::XdgDone),
                (2, OutputEvent::WlDone),
                (1, OutputEvent::WlDone),
            ],
        ];

        for order in orders {
            for sync_first in [true, false] {
                let mut list = OutputList::new(Some(2));
                list.add(1, ());
                list.add(2, ());
                let mut fired = 0;

                if sync_first && list.take_initial_ready(true) {
                    fired += 1;
                }
                for (global, event) in order {
                    list.handle_event(*global, event.clone());
                    if list.take_initial_ready(sync_first) {
                        fired += 1;
                    }
                }
                assert_eq!(list.incomplete(), 0);
                if !sync_first {
                    assert_eq!(fired, 0);
                    if list.take_initial_ready(true) {
                        fired += 1;
                    }
                }
                assert!(!list.take_initial_ready(true));
                assert_eq!(fired, 1);
            }
        }
    }

    #[test]
    fn removing_an_incomplete_output_unblocks_the_barrier() {
        let mut list = OutputList::new(None);
        list.add(1, ());
        list.add(2, ());
        list.handle_event(1, OutputEvent::WlDone);
        assert!(!list.take_initial_ready(true));
        assert!(list.remove(2).is_some());
        assert!(list.take_initial_ready(true));
    }

    #[test]
    fn live_changes_accumulate_until_taken() {
        let mut list = OutputList::new(None);
        list.add(1, ());
        describe(&mut list, 1, "DP-1");
        list.handle_event(1, OutputEvent::WlDone);
        assert!(list.take_initial_ready(true));

        // unchanged properties do not notify
        list.handle_event(1, OutputEvent::Mode(1920, 1080));
        assert_eq!(list.handle_event(1, OutputEvent::WlDone), None);

        list.handle_event(1, OutputEvent::Scale(2));
        assert_eq!(
            list.handle_event(1, OutputEvent::WlDone),
            Some(OutputNotification::Changed(1, OutputChanges::SCALE))
        );
        list.handle_event(1, OutputEvent::Transform(Transform::_270));
        list.handle_event(1, OutputEvent::WlDone);

        assert_eq!(
            list.take_changes(1),
            OutputChanges::SCALE | OutputChanges::TRANSFORM
        );
        assert_eq!(list.take_changes(1), OutputChanges::empty());
        assert_eq!(list.get(1).unwrap().info().scale, 2);
    }

    #[test]
    fn events_for_unknown_outputs_are_ignored() {
        let mut list = OutputList::<()>::new(None);
        assert_eq!(list.handle_event(4, OutputEvent::WlDone), None);
        assert!(list.remove(4).is_none());
    }
}
