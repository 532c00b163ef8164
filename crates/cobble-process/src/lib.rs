use std::fmt;

use specta::Type;

/// Stable identifier of one managed server.
///
/// NOTE: Chosen by the boundary layer. The agent never derives it from paths.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Offline,
    Starting,
    Online,
    Stopping,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Offline => "offline",
            ServerState::Starting => "starting",
            ServerState::Online => "online",
            ServerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most important.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Input,
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Input => "input",
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Line {
        text: String,
    },
    StatusChange {
        state: ServerState,
    },
    Progress {
        task: String,
        percent: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    pub severity: Severity,
    pub at_unix_ms: u64,
    pub body: EventBody,
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl LogEvent {
    pub fn line(server_id: Option<ServerId>, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            server_id,
            severity,
            at_unix_ms: now_unix_ms(),
            body: EventBody::Line { text: text.into() },
        }
    }

    pub fn status_change(server_id: Option<ServerId>, state: ServerState) -> Self {
        Self {
            server_id,
            severity: Severity::Info,
            at_unix_ms: now_unix_ms(),
            body: EventBody::StatusChange { state },
        }
    }

    pub fn progress(
        server_id: Option<ServerId>,
        task: impl Into<String>,
        percent: u8,
        error: Option<String>,
    ) -> Self {
        let severity = if error.is_some() {
            Severity::Error
        } else {
            Severity::Info
        };
        Self {
            server_id,
            severity,
            at_unix_ms: now_unix_ms(),
            body: EventBody::Progress {
                task: task.into(),
                percent: percent.min(100),
                error,
            },
        }
    }

    /// Whether the event may be discarded when the log pipeline is saturated.
    ///
    /// Plain console/info chatter and in-flight progress ticks are expendable;
    /// state changes, failed progress and anything at warning or above are not.
    pub fn is_droppable(&self) -> bool {
        match &self.body {
            EventBody::StatusChange { .. } => false,
            EventBody::Progress { error, .. } => error.is_none(),
            EventBody::Line { .. } => matches!(self.severity, Severity::Normal | Severity::Info),
        }
    }

    /// Flattened text for line-oriented sinks.
    pub fn message(&self) -> String {
        match &self.body {
            EventBody::Line { text } => text.clone(),
            EventBody::StatusChange { state } => format!("status: {state}"),
            EventBody::Progress {
                task,
                percent,
                error: None,
            } => format!("{task}: {percent}%"),
            EventBody::Progress {
                task,
                error: Some(err),
                ..
            } => format!("{task} failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerStats {
    pub pid: Option<u32>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PlayerSample {
    pub name: String,
    #[serde(default)]
    pub id: String,
}

/// Result of one status-query round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerListing {
    pub online: bool,
    pub players_online: u32,
    pub players_max: u32,
    pub sample: Vec<PlayerSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}

impl ServerListing {
    pub fn unreachable() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ShutdownInfo {
    pub remaining_secs: u64,
    pub target_unix_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_non_empty() {
        let id = ServerId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn event_body_is_tagged_by_kind() {
        let ev = LogEvent::status_change(Some(ServerId::from("s1")), ServerState::Online);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["body"]["type"], "status_change");
        assert_eq!(v["body"]["state"], "online");
        assert_eq!(v["server_id"], "s1");
        assert_eq!(v["severity"], "info");
    }

    #[test]
    fn only_chatter_is_droppable() {
        assert!(LogEvent::line(None, Severity::Normal, "x").is_droppable());
        assert!(LogEvent::line(None, Severity::Info, "x").is_droppable());
        assert!(!LogEvent::line(None, Severity::Warning, "x").is_droppable());
        assert!(!LogEvent::line(None, Severity::Error, "x").is_droppable());
        assert!(!LogEvent::status_change(None, ServerState::Offline).is_droppable());
        assert!(LogEvent::progress(None, "java", 40, None).is_droppable());
        assert!(!LogEvent::progress(None, "java", 0, Some("boom".into())).is_droppable());
    }

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Normal < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn progress_percent_is_capped() {
        let ev = LogEvent::progress(None, "java", 250, None);
        assert_eq!(ev.message(), "java: 100%");
    }
}
