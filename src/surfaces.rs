//! # Console Surfaces
//!
//! The console core never draws anything itself. Everything the user sees or
//! types into is an external collaborator behind one of these traits:
//!
//! - [`RenderSink`]: a scrolling log (chat or insight)
//! - [`FileTreeSink`]: the cabinet listing
//! - [`StatusIndicator`]: connection dot and server version
//! - [`Editor`]: the workspace text buffer
//!
//! Terminal implementations used by the `lab-console` binary live here too.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::console::Command;
use crate::workspace::FileCabinet;

/// Visual class of a rendered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    System,
    User,
    Brain,
    Debug,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::System => "system-msg",
            Style::User => "user-msg",
            Style::Brain => "brain-msg",
            Style::Debug => "debug-msg",
        }
    }
}

/// One line handed to a render sink: (text, style, source label, timestamp).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderLine {
    pub text: String,
    pub style: Style,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl RenderLine {
    pub fn new(text: impl Into<String>, style: Style, source: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            style,
            source: source.into(),
            timestamp,
        }
    }

    /// Console-generated note (connection changes, file opened, errors).
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(text, Style::System, "System", Utc::now())
    }

    /// `[SOURCE]: text`, the way the lab logs have always looked.
    pub fn display(&self) -> String {
        if self.source.is_empty() {
            self.text.clone()
        } else {
            format!("[{}]: {}", self.source.to_uppercase(), self.text)
        }
    }
}

pub trait RenderSink: Send {
    fn render(&mut self, line: RenderLine);

    /// Drop everything shown so far (brain replies with `clear`).
    fn clear(&mut self) {}
}

pub trait FileTreeSink: Send {
    fn show(&mut self, cabinet: &FileCabinet, active: Option<&str>);
}

pub trait StatusIndicator: Send {
    fn set_state(&mut self, state: ConnectionState);

    fn set_version(&mut self, _version: &str) {}

    /// Microphone meter, once per encoded frame.
    fn set_level(&mut self, _level: f32) {}
}

/// The workspace editing widget, seen as an opaque text buffer.
///
/// Implementations must report every content change, including the ones
/// caused by `set_content`, through the [`ChangeNotifier`] they were built
/// with. The console relies on that to suppress echoes.
pub trait Editor: Send {
    fn content(&self) -> String;
    fn set_content(&mut self, content: &str);
}

/// Editor → console change notifications.
///
/// Delivered on the console's command channel so a notification always queues
/// behind whatever the console was doing when the editor changed.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl ChangeNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn notify(&self) {
        let _ = self.tx.send(Command::EditorChanged);
    }
}

/// Everything the console draws into.
pub struct Surfaces {
    pub chat: Box<dyn RenderSink>,
    pub insight: Box<dyn RenderSink>,
    pub files: Box<dyn FileTreeSink>,
    pub status: Box<dyn StatusIndicator>,
    pub editor: Box<dyn Editor>,
}

/// Plain string buffer editor. Notifies on every `set_content`, like a real
/// editing widget does when its value is replaced programmatically.
#[derive(Debug)]
pub struct MemoryEditor {
    buffer: Arc<Mutex<String>>,
    notifier: ChangeNotifier,
}

impl MemoryEditor {
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(String::new())),
            notifier,
        }
    }

    /// Shared view of the buffer, for callers that type into it directly.
    pub fn buffer(&self) -> Arc<Mutex<String>> {
        self.buffer.clone()
    }
}

impl Editor for MemoryEditor {
    fn content(&self) -> String {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    fn set_content(&mut self, content: &str) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
            buffer.push_str(content);
        }
        self.notifier.notify();
    }
}

/// Prints log lines to stdout with a channel prefix.
pub struct TerminalLog {
    label: &'static str,
}

impl TerminalLog {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl RenderSink for TerminalLog {
    fn render(&mut self, line: RenderLine) {
        println!(
            "{} {:<7} {}",
            line.timestamp.format("%H:%M:%S"),
            self.label,
            line.display()
        );
    }

    fn clear(&mut self) {
        println!("{:-^40}", format!(" {} cleared ", self.label));
    }
}

/// Prints the cabinet: the five most recent archive years, then workspace files.
#[derive(Debug, Default)]
pub struct TerminalFileTree;

impl FileTreeSink for TerminalFileTree {
    fn show(&mut self, cabinet: &FileCabinet, active: Option<&str>) {
        println!("Archives");
        for year in cabinet.recent_years(5) {
            println!("  {}", year);
        }
        println!("Workspace");
        for file in cabinet.workspace_files() {
            let tag = if Some(file.as_str()) == active { "  [OPEN]" } else { "" };
            println!("  {}{}", file, tag);
        }
    }
}

/// Writes connection changes to stdout.
#[derive(Debug, Default)]
pub struct TerminalStatus;

impl StatusIndicator for TerminalStatus {
    fn set_state(&mut self, state: ConnectionState) {
        println!("* link {}", state.as_str());
    }

    fn set_version(&mut self, version: &str) {
        println!("* lab v{}", version);
    }
}
