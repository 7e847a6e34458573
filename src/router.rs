//! # Message Routing
//!
//! Turns a classified [`Inbound`] message into exactly one [`Route`]: the
//! destination plus whatever that destination needs to render it. The router
//! does no I/O; the console applies the route to its surfaces.
//!
//! Brain replies need a second decision, chat versus insight, made by an
//! ordered policy table over `(channel, source label, text)`. Keeping it as a
//! table makes the content sniffing auditable in one place.

use chrono::Utc;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::protocol::{BrainReply, ControlCommand, Inbound, StatusUpdate};
use crate::surfaces::{RenderLine, Style};
use crate::workspace::FileCabinet;

/// Label used when a brain reply does not name its source.
const DEFAULT_BRAIN_SOURCE: &str = "Brain";

/// Label shown next to live transcriptions.
const TRANSCRIPTION_SOURCE: &str = "Hearing...";

/// Where a brain reply is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Chat,
    Insight,
    /// Replaces the workspace document instead of being rendered
    Workspace,
}

/// One row of the brain-reply policy table.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteRule {
    /// Explicit channel field equals `channel` (case-insensitive)
    Channel { channel: String, destination: Destination },
    /// Source label contains `needle` (case-insensitive)
    SourceContains { needle: String, destination: Destination },
    /// Source label equals `source` and the text mentions any keyword
    SourceKeyword {
        source: String,
        keywords: Vec<String>,
        destination: Destination,
    },
}

impl RouteRule {
    fn matches(&self, channel: Option<&str>, source: &str, text: &str) -> Option<Destination> {
        match self {
            RouteRule::Channel { channel: want, destination } => channel
                .filter(|c| c.eq_ignore_ascii_case(want))
                .map(|_| *destination),
            RouteRule::SourceContains { needle, destination } => {
                if source.to_lowercase().contains(&needle.to_lowercase()) {
                    Some(*destination)
                } else {
                    None
                }
            }
            RouteRule::SourceKeyword {
                source: want,
                keywords,
                destination,
            } => {
                if !source.eq_ignore_ascii_case(want) {
                    return None;
                }
                let text = text.to_lowercase();
                keywords
                    .iter()
                    .any(|k| text.contains(&k.to_lowercase()))
                    .then_some(*destination)
            }
        }
    }
}

/// Ordered brain-reply routing rules; first match wins, chat otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    rules: Vec<RouteRule>,
}

impl RoutingPolicy {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// The lab's standard table.
    ///
    /// 1. `whiteboard` / `workspace` channels replace the document
    /// 2. `insight` channel goes to insight
    /// 3. any source containing "brain" goes to insight
    /// 4. `system` replies mentioning a strategic keyword go to insight
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(vec![
            RouteRule::Channel {
                channel: "whiteboard".to_string(),
                destination: Destination::Workspace,
            },
            RouteRule::Channel {
                channel: "workspace".to_string(),
                destination: Destination::Workspace,
            },
            RouteRule::Channel {
                channel: "insight".to_string(),
                destination: Destination::Insight,
            },
            RouteRule::SourceContains {
                needle: "brain".to_string(),
                destination: Destination::Insight,
            },
            RouteRule::SourceKeyword {
                source: "system".to_string(),
                keywords: config.insight_keywords.clone(),
                destination: Destination::Insight,
            },
        ])
    }

    /// Pure classification of one brain reply.
    pub fn destination(&self, channel: Option<&str>, source: &str, text: &str) -> Destination {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(channel, source, text))
            .unwrap_or(Destination::Chat)
    }
}

/// What the console should do with one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Status indicator / version display, plus an optional chat note
    Status { update: StatusUpdate, note: Option<RenderLine> },
    /// Server asks us to fetch a file
    FetchFile { filename: String },
    /// Rebuild the file tree
    FileTree(FileCabinet),
    /// Open a file's content in the workspace
    OpenFile { filename: String, content: String },
    /// Replace the workspace buffer without changing the active file
    Workspace { content: String },
    /// Append to the chat log
    Chat { line: RenderLine, clear: bool },
    /// Append to the insight log
    Insight { line: RenderLine, clear: bool },
    /// Server-issued control command
    Control(ControlCommand),
}

/// Maps classified messages to routes.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    policy: RoutingPolicy,
}

impl MessageRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(RoutingPolicy::from_config(config))
    }

    pub fn route(&self, inbound: Inbound) -> Route {
        let route = match inbound {
            Inbound::Status(update) => {
                let note = (update.state == "ready")
                    .then(|| RenderLine::system("Lab is open. Pinky is listening."));
                Route::Status { update, note }
            }
            Inbound::FileRequest(request) => Route::FetchFile {
                filename: request.filename,
            },
            Inbound::Cabinet(listing) => Route::FileTree(FileCabinet::from_listing(&listing)),
            Inbound::FileContent(file) => Route::OpenFile {
                filename: file.filename,
                content: file.content,
            },
            Inbound::Control(command) => Route::Control(command),
            Inbound::Debug(event) => Route::Chat {
                line: RenderLine::new(
                    format!("{}: {}", event.event, event.data),
                    Style::Debug,
                    "Debug",
                    Utc::now(),
                ),
                clear: false,
            },
            Inbound::Brain(reply) => self.route_brain(reply),
            Inbound::Transcription(transcription) => Route::Chat {
                line: RenderLine::new(transcription.text, Style::User, TRANSCRIPTION_SOURCE, Utc::now()),
                clear: false,
            },
        };
        debug!(route = route_name(&route), "Routed inbound message");
        route
    }

    fn route_brain(&self, reply: BrainReply) -> Route {
        let source = reply
            .source_label
            .clone()
            .unwrap_or_else(|| DEFAULT_BRAIN_SOURCE.to_string());

        match self
            .policy
            .destination(reply.channel.as_deref(), &source, &reply.text)
        {
            Destination::Workspace => Route::Workspace { content: reply.text },
            Destination::Insight => Route::Insight {
                line: RenderLine::new(reply.text, Style::Brain, source, Utc::now()),
                clear: reply.clear,
            },
            Destination::Chat => Route::Chat {
                line: RenderLine::new(reply.text, Style::Brain, source, Utc::now()),
                clear: reply.clear,
            },
        }
    }
}

fn route_name(route: &Route) -> &'static str {
    match route {
        Route::Status { .. } => "status",
        Route::FetchFile { .. } => "fetch_file",
        Route::FileTree(_) => "file_tree",
        Route::OpenFile { .. } => "open_file",
        Route::Workspace { .. } => "workspace",
        Route::Chat { .. } => "chat",
        Route::Insight { .. } => "insight",
        Route::Control(_) => "control",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::classify;
    use serde_json::json;

    fn router() -> MessageRouter {
        MessageRouter::from_config(&ClientConfig::default().routing)
    }

    fn policy() -> RoutingPolicy {
        RoutingPolicy::from_config(&ClientConfig::default().routing)
    }

    #[test]
    fn test_explicit_channel_forces_insight() {
        assert_eq!(policy().destination(Some("insight"), "Pinky", "Narf!"), Destination::Insight);
        assert_eq!(policy().destination(Some("INSIGHT"), "Pinky", "Narf!"), Destination::Insight);
    }

    #[test]
    fn test_brain_sources_go_to_insight() {
        let p = policy();
        assert_eq!(p.destination(None, "The Brain", "Plans."), Destination::Insight);
        assert_eq!(p.destination(None, "BRAIN (shadow)", "Plans."), Destination::Insight);
        assert_eq!(p.destination(Some("chat"), "brain", "Plans."), Destination::Insight);
    }

    #[test]
    fn test_system_keyword_carve_out() {
        let p = policy();
        assert_eq!(
            p.destination(None, "system", "...the sovereign stack is ready..."),
            Destination::Insight
        );
        assert_eq!(p.destination(None, "System", "A STRATEGIC pivot"), Destination::Insight);
        assert_eq!(p.destination(None, "system", "Connection restored."), Destination::Chat);
        // Keyword without the system label stays in chat
        assert_eq!(p.destination(None, "Pinky", "sovereign"), Destination::Chat);
    }

    #[test]
    fn test_everything_else_is_chat() {
        assert_eq!(policy().destination(None, "Pinky", "Narf!"), Destination::Chat);
        assert_eq!(policy().destination(Some("chat"), "Pinky", "Zort!"), Destination::Chat);
    }

    #[test]
    fn test_whiteboard_replaces_workspace() {
        let value = json!({"brain": "# Plan\n- world", "brain_source": "Brain", "channel": "whiteboard"});
        let route = router().route(classify(&value).unwrap());
        assert_eq!(
            route,
            Route::Workspace {
                content: "# Plan\n- world".to_string()
            }
        );
    }

    #[test]
    fn test_workspace_channel_is_a_whiteboard_alias() {
        let value = json!({"brain": "- item", "brain_source": "Brain", "channel": "workspace"});
        assert_eq!(
            router().route(classify(&value).unwrap()),
            Route::Workspace {
                content: "- item".to_string()
            }
        );
        assert_eq!(
            policy().destination(Some("Workspace"), "Pinky", "- item"),
            Destination::Workspace
        );
    }

    #[test]
    fn test_missing_source_defaults_to_brain_label() {
        let route = router().route(classify(&json!({"brain": "Yes."})).unwrap());
        match route {
            Route::Insight { line, clear } => {
                assert_eq!(line.source, "Brain");
                assert_eq!(line.style, Style::Brain);
                assert!(!clear);
            }
            other => panic!("expected insight, got {:?}", other),
        }
    }

    #[test]
    fn test_ten_envelopes_route_to_documented_destinations() {
        let cases = vec![
            (json!({"type": "status", "state": "ready", "version": "3.4.0"}), "status"),
            (json!({"type": "file_content_request", "filename": "x.md"}), "fetch_file"),
            (json!({"type": "cabinet", "files": {"archive": {}, "drafts": []}}), "file_tree"),
            (json!({"type": "file_content", "filename": "a.md", "content": "hello"}), "open_file"),
            (json!({"type": "control", "command": "stop_audio"}), "control"),
            (json!({"brain": "Narf!", "brain_source": "Pinky"}), "chat"),
            (json!({"brain": "Tonight we plan.", "brain_source": "The Brain"}), "insight"),
            (json!({"brain": "...sovereign...", "brain_source": "system"}), "insight"),
            (json!({"brain": "draft", "channel": "whiteboard"}), "workspace"),
            (json!({"type": "transcription", "text": "hello"}), "chat"),
        ];

        let router = router();
        for (value, expected) in cases {
            let route = router.route(classify(&value).unwrap());
            assert_eq!(route_name(&route), expected, "for {}", value);
        }
    }

    #[test]
    fn test_ready_status_adds_note() {
        let route = router().route(classify(&json!({"type": "status", "state": "ready"})).unwrap());
        match route {
            Route::Status { note: Some(line), .. } => assert_eq!(line.style, Style::System),
            other => panic!("expected status with note, got {:?}", other),
        }

        let busy = router().route(classify(&json!({"type": "status", "state": "busy"})).unwrap());
        assert!(matches!(busy, Route::Status { note: None, .. }));
    }

    #[test]
    fn test_transcription_renders_as_heard_user_text() {
        let route = router().route(classify(&json!({"text": "turn left"})).unwrap());
        match route {
            Route::Chat { line, .. } => {
                assert_eq!(line.source, "Hearing...");
                assert_eq!(line.style, Style::User);
                assert_eq!(line.text, "turn left");
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }
}
