//! # Lab Console - Terminal Entry Point
//!
//! Runs the console against the lab server with stdout as the chat and
//! insight logs and stdin as the input line. Logs go to stderr.
//!
//! ## Input:
//! - plain text: sent to the lab as `text_input`
//! - `/open <file>`: open a workspace file
//! - `/edit <text>`: replace the workspace document
//! - `/append <text>`: add a line to the workspace document
//! - `/save`: save the workspace document now
//! - `/mic`: toggle the microphone
//! - `/quit`: leave (as does Ctrl+C)
//!
//! `lab-console --print-config` prints the effective configuration and exits.

use anyhow::Result;
use lab_console::audio::CaptureDevice;
use lab_console::connection::WsDialer;
use lab_console::surfaces::{MemoryEditor, Surfaces, TerminalFileTree, TerminalLog, TerminalStatus};
use lab_console::{ClientConfig, Command, LabConsole};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// What one input line asks for.
enum Input {
    Command(Command),
    Quit,
    Unknown(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = ClientConfig::load()?;
    config.validate()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting lab-console v{}", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %config.endpoint(), protocol = %config.protocol.version, "Configuration loaded");

    let device = capture_device(&config);
    let console = LabConsole::new(config, Box::new(WsDialer), device);
    let editor = MemoryEditor::new(console.change_notifier());

    let handle = console.initialize(Surfaces {
        chat: Box::new(TerminalLog::new("chat")),
        insight: Box::new(TerminalLog::new("insight")),
        files: Box::new(TerminalFileTree),
        status: Box::new(TerminalStatus),
        editor: Box::new(editor),
    });

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => match parse_input(&line) {
                    Input::Command(command) => {
                        handle.command(command);
                    }
                    Input::Quit => break,
                    Input::Unknown(verb) => warn!(command = %verb, "Unknown command"),
                },
                Some(Err(err)) => {
                    warn!(error = %err, "Could not read stdin");
                    break;
                }
                // stdin closed
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stats = handle.stats();
    handle.teardown().await?;
    info!(
        frames_sent = stats.frames_sent,
        audio_frames_sent = stats.audio_frames_sent,
        saves_sent = stats.saves_sent,
        messages_received = stats.messages_received,
        messages_dropped = stats.messages_dropped,
        drop_rate = stats.drop_rate(),
        reconnects = stats.reconnects,
        "Lab console closed"
    );
    Ok(())
}

/// Logging goes to stderr so stdout stays the chat surface.
///
/// `RUST_LOG` overrides the default of `lab_console=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lab_console=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(feature = "microphone")]
fn capture_device(config: &ClientConfig) -> Box<dyn CaptureDevice> {
    Box::new(lab_console::audio::MicrophoneDevice::new(&config.audio))
}

#[cfg(not(feature = "microphone"))]
fn capture_device(_config: &ClientConfig) -> Box<dyn CaptureDevice> {
    Box::new(lab_console::audio::UnavailableDevice)
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(Command::SendText(line.to_string()));
    };

    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };

    match verb {
        "open" if !arg.is_empty() => Input::Command(Command::SelectFile(arg.to_string())),
        "edit" => Input::Command(Command::ReplaceEditor(arg.to_string())),
        "append" => Input::Command(Command::AppendEditor(arg.to_string())),
        "save" => Input::Command(Command::Save),
        "mic" => Input::Command(Command::ToggleMic),
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(verb.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        match parse_input(line) {
            Input::Command(command) => command,
            _ => panic!("expected a command for {:?}", line),
        }
    }

    #[test]
    fn test_plain_text_is_sent() {
        assert_eq!(command("  Narf!  "), Command::SendText("Narf!".to_string()));
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(command("/open plan.md"), Command::SelectFile("plan.md".to_string()));
        assert_eq!(command("/edit # Plan"), Command::ReplaceEditor("# Plan".to_string()));
        assert_eq!(command("/append - world"), Command::AppendEditor("- world".to_string()));
        assert_eq!(command("/save"), Command::Save);
        assert_eq!(command("/mic"), Command::ToggleMic);
        assert!(matches!(parse_input("/quit"), Input::Quit));
        assert!(matches!(parse_input("/open"), Input::Unknown(_)));
        assert!(matches!(parse_input("/dance"), Input::Unknown(_)));
    }
}
