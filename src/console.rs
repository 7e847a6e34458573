//! # Lab Console
//!
//! Wires the connection, router, workspace sync and audio capture into one
//! cooperative event loop running on a single tokio task.
//!
//! ## Event Sources:
//! - **Socket events**: open / text frame / close from the current socket
//! - **Commands**: user actions and editor change notifications
//! - **Audio**: captured buffers from the microphone, and capture failures
//! - **Deadlines**: the pending reconnect and the pending autosave
//!
//! All core state lives inside the loop, so nothing needs a lock. The only
//! shared data is the statistics handle, which the loop writes and
//! [`ConsoleHandle::stats`] reads.
//!
//! ## Rust Concepts:
//! - **tokio::select!**: waits on every source at once and runs the first
//!   branch that is ready; a branch whose pattern fails (a closed channel)
//!   is disabled for that turn
//! - **Ownership**: `initialize` consumes the `LabConsole` and moves its parts
//!   into the spawned task, so only the handle is left outside
//!
//! ## Usage:
//! ```rust,ignore
//! let console = LabConsole::new(config, Box::new(WsDialer), Box::new(UnavailableDevice));
//! let editor = MemoryEditor::new(console.change_notifier());
//! let handle = console.initialize(Surfaces { editor: Box::new(editor), .. });
//! handle.send_text("Are you pondering what I'm pondering?");
//! handle.teardown().await?;
//! ```

use std::future::pending;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::audio::{
    AudioEncoder, CaptureController, CaptureDevice, CaptureFailure, CapturedBuffer, MicTransition,
    AUDIO_QUEUE_DEPTH,
};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Dialer, LinkUpdate, SocketEvent};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{self, ControlCommand, Envelope};
use crate::router::{MessageRouter, Route};
use crate::state::{ConsoleStats, StatsSnapshot};
use crate::surfaces::{ChangeNotifier, RenderLine, Style, Surfaces};
use crate::workspace::WorkspaceSync;

/// Source label for the user's own typed lines.
const SELF_SOURCE: &str = "Me";

/// Everything the loop can be asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Typed user input for the lab
    SendText(String),
    /// Open a workspace file from the cabinet
    SelectFile(String),
    /// Replace the editor buffer, as if the user retyped it
    ReplaceEditor(String),
    /// Add a line to the end of the editor buffer
    AppendEditor(String),
    /// Flush the workspace document now
    Save,
    ToggleMic,
    /// The editor's content changed (sent by [`ChangeNotifier`])
    EditorChanged,
    /// Release the echo of one server write once its notification has drained
    ReleaseEcho,
    Shutdown,
}

/// A console that has not been started yet.
pub struct LabConsole {
    config: ClientConfig,
    dialer: Box<dyn Dialer>,
    device: Box<dyn CaptureDevice>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    stats: ConsoleStats,
}

impl LabConsole {
    pub fn new(config: ClientConfig, dialer: Box<dyn Dialer>, device: Box<dyn CaptureDevice>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            dialer,
            device,
            commands_tx,
            commands_rx,
            stats: ConsoleStats::new(),
        }
    }

    /// Notifier an [`Editor`](crate::surfaces::Editor) implementation reports
    /// its changes through. Build the editor with this before `initialize`.
    pub fn change_notifier(&self) -> ChangeNotifier {
        ChangeNotifier::new(self.commands_tx.clone())
    }

    /// Attach the surfaces, open the connection and start the event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(self, surfaces: Surfaces) -> ConsoleHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            connection: ConnectionManager::new(&self.config, self.dialer, events_tx),
            router: MessageRouter::from_config(&self.config.routing),
            workspace: WorkspaceSync::new(&self.config.workspace),
            capture: CaptureController::new(self.device, frames_tx, failures_tx),
            encoder: AudioEncoder::from_config(&self.config.audio),
            surfaces,
            stats: self.stats.clone(),
            commands_tx: self.commands_tx.clone(),
            commands_rx: self.commands_rx,
            events_rx,
            frames_rx,
            failures_rx,
        };

        info!(endpoint = %self.config.endpoint(), "Starting lab console");
        ConsoleHandle {
            commands_tx: self.commands_tx,
            stats: self.stats,
            task: tokio::spawn(event_loop.run()),
        }
    }
}

/// Handle to a running console.
pub struct ConsoleHandle {
    commands_tx: mpsc::UnboundedSender<Command>,
    stats: ConsoleStats,
    task: JoinHandle<()>,
}

impl ConsoleHandle {
    /// Queue a command. Returns `false` once the console has stopped.
    pub fn command(&self, command: Command) -> bool {
        self.commands_tx.send(command).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.command(Command::SendText(text.into()))
    }

    pub fn select_file(&self, filename: impl Into<String>) -> bool {
        self.command(Command::SelectFile(filename.into()))
    }

    pub fn replace_editor(&self, content: impl Into<String>) -> bool {
        self.command(Command::ReplaceEditor(content.into()))
    }

    pub fn append_editor(&self, line: impl Into<String>) -> bool {
        self.command(Command::AppendEditor(line.into()))
    }

    pub fn save(&self) -> bool {
        self.command(Command::Save)
    }

    pub fn toggle_mic(&self) -> bool {
        self.command(Command::ToggleMic)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the loop: release the microphone, close the socket, cancel timers.
    pub async fn teardown(self) -> ClientResult<()> {
        let _ = self.commands_tx.send(Command::Shutdown);
        self.task
            .await
            .map_err(|err| ClientError::Internal(format!("console task failed: {}", err)))
    }
}

/// Sleep until `deadline`; without one, never wake.
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

struct EventLoop {
    connection: ConnectionManager,
    router: MessageRouter,
    workspace: WorkspaceSync,
    capture: CaptureController,
    encoder: AudioEncoder,
    surfaces: Surfaces,
    stats: ConsoleStats,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    frames_rx: mpsc::Receiver<CapturedBuffer>,
    failures_rx: mpsc::UnboundedReceiver<CaptureFailure>,
}

impl EventLoop {
    async fn run(mut self) {
        self.connect();

        loop {
            let reconnect_at = self.connection.next_reconnect();
            let autosave_at = self.workspace.next_deadline();

            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_socket_event(event),
                command = self.commands_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(buffer) = self.frames_rx.recv() => self.on_audio(buffer),
                Some(failure) = self.failures_rx.recv() => self.on_capture_failure(failure),
                _ = sleep_until_some(reconnect_at) => {
                    if self.connection.reconnect_due(Instant::now()) {
                        self.stats.record_reconnect();
                        self.connect();
                    }
                }
                _ = sleep_until_some(autosave_at) => {
                    if let Some(save) = self.workspace.take_due_save(Instant::now()) {
                        self.send_save(save);
                    }
                }
            }
        }

        self.capture.stop();
        self.connection.shutdown().await;
        self.surfaces.status.set_state(ConnectionState::Closed);
        info!("Lab console stopped");
    }

    fn connect(&mut self) {
        let note = self.connection.connect();
        self.surfaces.status.set_state(self.connection.state());
        self.surfaces.chat.render(note);
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match self.connection.handle_event(event, Instant::now()) {
            None => {}
            Some(LinkUpdate::Opened { note }) => {
                self.stats.record_frame_sent();
                self.surfaces.status.set_state(ConnectionState::Open);
                self.surfaces.chat.render(note);
            }
            Some(LinkUpdate::Closed { note }) => {
                self.surfaces.status.set_state(ConnectionState::Closed);
                self.surfaces.chat.render(note);
            }
            Some(LinkUpdate::Message(text)) => match protocol::decode(&text) {
                Some(inbound) => {
                    self.stats.record_received();
                    let route = self.router.route(inbound);
                    self.apply(route);
                }
                None => {
                    self.stats.record_dropped();
                    debug!(len = text.len(), "Dropped unrecognized server message");
                }
            },
        }
    }

    fn apply(&mut self, route: Route) {
        match route {
            Route::Status { update, note } => {
                if let Some(version) = &update.version {
                    self.surfaces.status.set_version(version);
                }
                if let Some(message) = &update.message {
                    info!(state = %update.state, message = %message, "Lab status");
                }
                if let Some(note) = note {
                    self.surfaces.chat.render(note);
                }
            }
            Route::FetchFile { filename } => {
                self.send(&Envelope::ReadFile { filename });
            }
            Route::FileTree(cabinet) => {
                self.workspace.replace_cabinet(cabinet);
                self.show_files();
            }
            Route::OpenFile { filename, content } => {
                self.apply_server_content(Some(&filename), &content);
            }
            Route::Workspace { content } => {
                self.apply_server_content(None, &content);
            }
            Route::Chat { line, clear } => {
                if clear {
                    self.surfaces.chat.clear();
                }
                self.surfaces.chat.render(line);
            }
            Route::Insight { line, clear } => {
                if clear {
                    self.surfaces.insight.clear();
                }
                self.surfaces.insight.render(line);
            }
            Route::Control(ControlCommand::StopAudio) => {
                if self.stop_capture() {
                    self.surfaces
                        .chat
                        .render(RenderLine::system("Microphone stopped by the lab."));
                }
            }
            Route::Control(ControlCommand::Other(command)) => {
                warn!(command = %command, "Ignoring unknown control command");
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendText(text) => self.send_text(text),
            Command::SelectFile(filename) => {
                let request = self.workspace.select_file(&filename);
                self.send(&request);
                self.surfaces
                    .chat
                    .render(RenderLine::system(format!("Opened {} for editing.", filename)));
                self.show_files();
            }
            Command::ReplaceEditor(content) => self.surfaces.editor.set_content(&content),
            Command::AppendEditor(line) => {
                let mut content = self.surfaces.editor.content();
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&line);
                self.surfaces.editor.set_content(&content);
            }
            Command::EditorChanged => {
                let content = self.surfaces.editor.content();
                self.workspace.on_local_edit(content, Instant::now());
            }
            Command::ReleaseEcho => self.workspace.release_echo(),
            Command::Save => self.save_now(),
            Command::ToggleMic => self.toggle_mic(),
            // Handled by the loop itself
            Command::Shutdown => {}
        }
    }

    fn send_text(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let envelope = Envelope::TextInput {
            content: text.to_string(),
        };
        if self.send(&envelope) {
            self.surfaces.chat.render(RenderLine::new(
                text,
                Style::User,
                SELF_SOURCE,
                chrono::Utc::now(),
            ));
        }
    }

    /// Server content goes into the editor with echo suppression raised.
    /// `ReleaseEcho` queues behind the editor's own change notification, so
    /// that notification is seen, and ignored, first.
    fn apply_server_content(&mut self, filename: Option<&str>, content: &str) {
        self.workspace.apply_server_content(filename, content);
        self.surfaces.editor.set_content(content);
        let _ = self.commands_tx.send(Command::ReleaseEcho);
        debug!(filename = ?self.workspace.active_file(), len = content.len(), "Workspace updated from server");
    }

    fn save_now(&mut self) {
        if self.connection.state() != ConnectionState::Open {
            self.surfaces
                .chat
                .render(RenderLine::system("Nothing saved: no destination while offline."));
            return;
        }
        let save = self.workspace.save_now();
        if let Envelope::WorkspaceSave { filename, .. } = &save {
            let note = format!("Saved {}.", filename);
            if self.send_save(save) {
                self.surfaces.chat.render(RenderLine::system(note));
            }
        }
    }

    fn send_save(&mut self, save: Envelope) -> bool {
        let sent = self.send(&save);
        if sent {
            self.stats.record_save();
        }
        sent
    }

    fn send(&mut self, envelope: &Envelope) -> bool {
        let sent = self.connection.send(envelope);
        if sent {
            self.stats.record_frame_sent();
        }
        sent
    }

    fn toggle_mic(&mut self) {
        match self.capture.toggle() {
            Ok(MicTransition::Started) => {
                self.send(&Envelope::MicState { active: true });
                self.surfaces.chat.render(RenderLine::system("Microphone live."));
            }
            Ok(MicTransition::Stopped) => {
                self.send(&Envelope::MicState { active: false });
                self.surfaces.status.set_level(0.0);
                self.surfaces.chat.render(RenderLine::system("Microphone off."));
            }
            Err(err) => {
                self.surfaces
                    .chat
                    .render(RenderLine::system(format!("Microphone unavailable: {}", err)));
            }
        }
    }

    fn stop_capture(&mut self) -> bool {
        if !self.capture.stop() {
            return false;
        }
        self.send(&Envelope::MicState { active: false });
        self.surfaces.status.set_level(0.0);
        true
    }

    /// The device died mid-session: stop as if the user had toggled off.
    fn on_capture_failure(&mut self, failure: CaptureFailure) {
        if !self.capture.is_current(failure.generation) {
            debug!(generation = failure.generation, "Ignoring failure of a released capture session");
            return;
        }
        warn!(reason = %failure.reason, "Microphone capture failed");
        self.stop_capture();
        self.surfaces
            .chat
            .render(RenderLine::system(format!("Microphone unavailable: {}", failure.reason)));
    }

    fn on_audio(&mut self, buffer: CapturedBuffer) {
        if !self.capture.accepts(&buffer) {
            return;
        }
        let frame = self.encoder.encode(&buffer.samples);
        self.surfaces.status.set_level(frame.level);

        let bytes = frame.to_le_bytes();
        let len = bytes.len();
        if self.connection.send_binary(bytes) {
            self.stats.record_audio_sent(len);
        }
    }

    fn show_files(&mut self) {
        self.surfaces
            .files
            .show(self.workspace.cabinet(), self.workspace.active_file());
    }
}
