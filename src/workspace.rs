//! # Workspace Synchronization
//!
//! Keeps the shared workspace document in step between the local editor and
//! the lab server without feedback loops.
//!
//! ## Two directions:
//! - **Server → editor**: `apply_server_content` writes into the editor with
//!   `suppress_echo` raised. The editor reports that write as a change like any
//!   other; while the flag is up those reports are ignored. Each server write
//!   counts one pending echo, and the console releases one echo per write a
//!   loop turn later, after that write's notification has been drained. Pushes
//!   that arrive back to back therefore stay suppressed until the last one
//!   has been released.
//! - **Editor → server**: `on_local_edit` snapshots the content and restarts a
//!   single debounce deadline. Only when the deadline passes without another
//!   edit does one `workspace_save` go out, so typing never turns into a save
//!   per keystroke.
//!
//! Timer state is just an `Option<Instant>`; the console's event loop sleeps
//! until it and then calls [`WorkspaceSync::take_due_save`].

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::WorkspaceConfig;
use crate::protocol::{CabinetListing, Envelope};

/// The document currently shown in the workspace editor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceDocument {
    /// `None` means no file is open (a valid state)
    pub filename: Option<String>,
    pub content: String,
    pub dirty: bool,
    pub suppress_echo: bool,
}

/// The server's listing of archived years and workspace files.
///
/// Rebuilt wholesale from each `cabinet` message, never patched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCabinet {
    archive_years: Vec<String>,
    workspace_files: BTreeSet<String>,
}

impl FileCabinet {
    pub fn from_listing(listing: &CabinetListing) -> Self {
        let mut archive_years = listing.archive.clone();
        archive_years.sort_unstable_by(|a, b| b.cmp(a));
        archive_years.dedup();

        Self {
            archive_years,
            workspace_files: listing.workspace_files.iter().cloned().collect(),
        }
    }

    /// Archive years, newest first.
    pub fn archive_years(&self) -> &[String] {
        &self.archive_years
    }

    pub fn recent_years(&self, limit: usize) -> &[String] {
        &self.archive_years[..limit.min(self.archive_years.len())]
    }

    pub fn workspace_files(&self) -> impl Iterator<Item = &String> {
        self.workspace_files.iter()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.workspace_files.contains(filename)
    }
}

/// Active document, echo suppression and the autosave debounce.
#[derive(Debug)]
pub struct WorkspaceSync {
    document: WorkspaceDocument,
    cabinet: FileCabinet,
    debounce: Duration,
    default_filename: String,
    save_deadline: Option<Instant>,
    /// Server writes whose editor notification has not been released yet
    pending_echoes: u32,
}

impl WorkspaceSync {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            document: WorkspaceDocument::default(),
            cabinet: FileCabinet::default(),
            debounce: config.autosave_debounce(),
            default_filename: config.default_filename.clone(),
            save_deadline: None,
            pending_echoes: 0,
        }
    }

    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    pub fn active_file(&self) -> Option<&str> {
        self.document.filename.as_deref()
    }

    pub fn cabinet(&self) -> &FileCabinet {
        &self.cabinet
    }

    pub fn replace_cabinet(&mut self, cabinet: FileCabinet) {
        self.cabinet = cabinet;
    }

    /// Make `filename` the active document and build the read request for it.
    pub fn select_file(&mut self, filename: &str) -> Envelope {
        self.document.filename = Some(filename.to_string());
        Envelope::SelectFile {
            filename: filename.to_string(),
        }
    }

    /// Take server-pushed content. Raises `suppress_echo`; the caller writes
    /// `content` into the editor and calls [`release_echo`](Self::release_echo)
    /// once for this write, on the next loop turn.
    ///
    /// A server push is the newest state of the document, so any pending
    /// autosave of older local edits is dropped.
    pub fn apply_server_content(&mut self, filename: Option<&str>, content: &str) {
        if let Some(name) = filename {
            self.document.filename = Some(name.to_string());
        }
        self.document.content = content.to_string();
        self.document.dirty = false;
        self.pending_echoes += 1;
        self.document.suppress_echo = true;
        if self.save_deadline.take().is_some() {
            debug!("Pending autosave superseded by server content");
        }
    }

    /// Release the echo of one server write. Suppression stays up while
    /// other writes are still pending.
    pub fn release_echo(&mut self) {
        self.pending_echoes = self.pending_echoes.saturating_sub(1);
        self.document.suppress_echo = self.pending_echoes > 0;
    }

    /// Editor changed. Ignored while an echo is suppressed; otherwise the
    /// content is captured and the debounce deadline restarts.
    ///
    /// Returns whether the edit was accepted.
    pub fn on_local_edit(&mut self, content: String, now: Instant) -> bool {
        if self.document.suppress_echo {
            debug!("Ignoring editor change caused by server content");
            return false;
        }
        self.document.content = content;
        self.document.dirty = true;
        self.save_deadline = Some(now + self.debounce);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.save_deadline
    }

    /// The autosave envelope, once the debounce deadline has passed.
    pub fn take_due_save(&mut self, now: Instant) -> Option<Envelope> {
        match self.save_deadline {
            Some(deadline) if deadline <= now => {
                self.save_deadline = None;
                Some(self.save_envelope())
            }
            _ => None,
        }
    }

    /// Save right away, cancelling any pending autosave.
    pub fn save_now(&mut self) -> Envelope {
        self.save_deadline = None;
        self.save_envelope()
    }

    fn save_envelope(&mut self) -> Envelope {
        self.document.dirty = false;
        Envelope::WorkspaceSave {
            filename: self
                .document
                .filename
                .clone()
                .unwrap_or_else(|| self.default_filename.clone()),
            content: self.document.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn sync() -> WorkspaceSync {
        WorkspaceSync::new(&ClientConfig::default().workspace)
    }

    const WINDOW: Duration = Duration::from_millis(1500);

    #[test]
    fn test_edits_within_window_coalesce_into_one_save() {
        let mut ws = sync();
        ws.select_file("notes.md");
        let start = Instant::now();

        for i in 0..10u64 {
            let at = start + Duration::from_millis(i * 100);
            assert!(ws.on_local_edit(format!("draft {}", i), at));
            assert!(ws.take_due_save(at).is_none());
        }

        let last_edit = start + Duration::from_millis(900);
        assert!(ws.take_due_save(last_edit + WINDOW - Duration::from_millis(1)).is_none());

        let save = ws.take_due_save(last_edit + WINDOW).expect("save after quiet period");
        assert_eq!(
            save,
            Envelope::WorkspaceSave {
                filename: "notes.md".to_string(),
                content: "draft 9".to_string(),
            }
        );
        assert!(ws.take_due_save(last_edit + WINDOW * 4).is_none());
        assert!(!ws.document().dirty);
    }

    #[test]
    fn test_server_content_suppresses_echo() {
        let mut ws = sync();
        let now = Instant::now();
        ws.apply_server_content(Some("a.md"), "hello");
        assert!(ws.document().suppress_echo);

        // The editor's own notification for that write
        assert!(!ws.on_local_edit("hello".to_string(), now));
        assert!(ws.next_deadline().is_none());
        assert!(ws.take_due_save(now + WINDOW * 2).is_none());

        ws.release_echo();
        assert!(ws.on_local_edit("hello!".to_string(), now));
        assert!(ws.next_deadline().is_some());
    }

    #[test]
    fn test_back_to_back_pushes_stay_suppressed_until_last_release() {
        let mut ws = sync();
        let now = Instant::now();

        ws.apply_server_content(Some("a.md"), "one");
        ws.apply_server_content(Some("a.md"), "two");

        // Notification for "one", then its release, then the notification for "two"
        assert!(!ws.on_local_edit("one".to_string(), now));
        ws.release_echo();
        assert!(ws.document().suppress_echo);
        assert!(!ws.on_local_edit("two".to_string(), now));
        ws.release_echo();

        assert!(!ws.document().suppress_echo);
        assert!(ws.take_due_save(now + WINDOW * 2).is_none());

        // Extra releases never underflow into a suppressed state
        ws.release_echo();
        assert!(ws.on_local_edit("mine".to_string(), now));
    }

    #[test]
    fn test_server_content_cancels_pending_save() {
        let mut ws = sync();
        let now = Instant::now();
        ws.on_local_edit("local".to_string(), now);
        ws.apply_server_content(Some("b.md"), "remote");
        assert!(ws.take_due_save(now + WINDOW).is_none());
        assert_eq!(ws.document().content, "remote");
        assert_eq!(ws.active_file(), Some("b.md"));
    }

    #[test]
    fn test_save_without_file_uses_scratchpad() {
        let mut ws = sync();
        let now = Instant::now();
        ws.on_local_edit("loose thought".to_string(), now);
        match ws.take_due_save(now + WINDOW) {
            Some(Envelope::WorkspaceSave { filename, content }) => {
                assert_eq!(filename, "scratchpad.md");
                assert_eq!(content, "loose thought");
            }
            other => panic!("expected save, got {:?}", other),
        }
    }

    #[test]
    fn test_select_file_emits_read_request() {
        let mut ws = sync();
        assert_eq!(
            ws.select_file("2024-plan.md"),
            Envelope::SelectFile {
                filename: "2024-plan.md".to_string()
            }
        );
        assert_eq!(ws.active_file(), Some("2024-plan.md"));
    }

    #[test]
    fn test_save_now_cancels_pending_autosave() {
        let mut ws = sync();
        let now = Instant::now();
        ws.on_local_edit("x".to_string(), now);
        assert!(matches!(ws.save_now(), Envelope::WorkspaceSave { .. }));
        assert!(ws.next_deadline().is_none());
    }

    #[test]
    fn test_cabinet_is_sorted_and_deduplicated() {
        let listing = CabinetListing {
            archive: vec!["2019".into(), "2024".into(), "2021".into(), "2024".into()],
            workspace_files: vec!["b.md".into(), "a.md".into(), "b.md".into()],
        };
        let cabinet = FileCabinet::from_listing(&listing);
        assert_eq!(cabinet.archive_years(), &["2024", "2021", "2019"]);
        assert_eq!(cabinet.recent_years(2), &["2024", "2021"]);
        assert_eq!(cabinet.recent_years(10).len(), 3);
        assert_eq!(cabinet.workspace_files().collect::<Vec<_>>(), vec!["a.md", "b.md"]);
        assert!(cabinet.contains("a.md"));
    }
}
