//! Tracking of foreign toplevels
//!
//! Fed by `ext-foreign-toplevel-list-v1`, used to resolve `toplevel:` capture targets.

use tracing::trace;

/// A toplevel advertised by the compositor
#[derive(Debug)]
pub struct ToplevelEntry<H> {
    handle: H,
    identifier: Option<String>,
    title: Option<String>,
    app_id: Option<String>,
    done: bool,
}

impl<H> ToplevelEntry<H> {
    /// Protocol handle of this toplevel
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Stable identifier, if already received
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Window title, if already received
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Application id, if already received
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }
}

/// The live set of toplevels
#[derive(Debug)]
pub struct ToplevelList<H> {
    entries: Vec<ToplevelEntry<H>>,
}

impl<H> Default for ToplevelList<H> {
    fn default() -> Self {
        ToplevelList { entries: Vec::new() }
    }
}

impl<H> ToplevelList<H> {
    /// Find a toplevel by identifier, falling back to an exact title match
    pub fn find(&self, id: &str) -> Option<&ToplevelEntry<H>> {
        let mut complete = self.entries.iter().filter(|entry| entry.done);
        complete
            .clone()
            .find(|entry| entry.identifier.as_deref() == Some(id))
            .or_else(|| complete.find(|entry| entry.title.as_deref() == Some(id)))
    }

    /// Iterate over all known toplevels
    pub fn iter(&self) -> impl Iterator<Item = &ToplevelEntry<H>> {
        self.entries.iter()
    }
}

impl<H: PartialEq> ToplevelList<H> {
    /// Track a new toplevel
    pub fn add(&mut self, handle: H) {
        self.entries.push(ToplevelEntry {
            handle,
            identifier: None,
            title: None,
            app_id: None,
            done: false,
        });
    }

    fn entry_mut(&mut self, handle: &H) -> Option<&mut ToplevelEntry<H>> {
        self.entries.iter_mut().find(|entry| &entry.handle == handle)
    }

    /// Set the identifier of a toplevel
    pub fn set_identifier(&mut self, handle: &H, identifier: String) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.identifier = Some(identifier);
        }
    }

    /// Set the title of a toplevel
    pub fn set_title(&mut self, handle: &H, title: String) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.title = Some(title);
        }
    }

    /// Set the app id of a toplevel
    pub fn set_app_id(&mut self, handle: &H, app_id: String) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.app_id = Some(app_id);
        }
    }

    /// Mark the pending properties of a toplevel as complete
    pub fn done(&mut self, handle: &H) {
        if let Some(entry) = self.entry_mut(handle) {
            trace!(identifier = ?entry.identifier, title = ?entry.title, "Toplevel done");
            entry.done = true;
        }
    }

    /// Remove a closed toplevel, returning its entry
    pub fn remove(&mut self, handle: &H) -> Option<ToplevelEntry<H>> {
        let idx = self.entries.iter().position(|entry| &entry.handle == handle)?;
        Some(self.entries.remove(idx))
    }

}
