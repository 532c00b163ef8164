use std::path::PathBuf;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("launch failed: {0}")]
    LaunchFailure(String),

    #[error("start was cancelled by a stop request")]
    LaunchCancelled,

    #[error("server is already running ({0})")]
    AlreadyRunning(cobble_process::ServerState),

    #[error("server is not running")]
    NotRunning,

    #[error("server stopped unexpectedly{}", exit_suffix(.0))]
    UnexpectedExit(Option<i32>),

    #[error("server did not stop within {0}s")]
    GracefulStopTimeout(u64),

    #[error("runtime download failed: {0}")]
    RuntimeDownloadFailure(String),

    #[error("status query failed: {0}")]
    ProbeUnavailable(String),

    #[error("runtime install at {} is corrupt", .0.display())]
    CorruptRuntimeInstall(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" (exit code {c})"),
        None => String::new(),
    }
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::LaunchFailure(_) => "launch_failure",
            AgentError::LaunchCancelled => "launch_cancelled",
            AgentError::AlreadyRunning(_) => "already_running",
            AgentError::NotRunning => "not_running",
            AgentError::UnexpectedExit(_) => "unexpected_exit",
            AgentError::GracefulStopTimeout(_) => "graceful_stop_timeout",
            AgentError::RuntimeDownloadFailure(_) => "runtime_download_failure",
            AgentError::ProbeUnavailable(_) => "probe_unavailable",
            AgentError::CorruptRuntimeInstall(_) => "corrupt_runtime_install",
            AgentError::Io(_) => "io",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            AgentError::LaunchFailure(_) => Some(
                "Check the server folder contains a run script or a server jar, and that a Java runtime is available.",
            ),
            AgentError::LaunchCancelled => None,
            AgentError::AlreadyRunning(_) => Some("Stop the server before starting it again."),
            AgentError::NotRunning => None,
            AgentError::UnexpectedExit(_) => {
                Some("Inspect the server console output above for the crash reason.")
            }
            AgentError::GracefulStopTimeout(_) => Some("You can force stop the server now."),
            AgentError::RuntimeDownloadFailure(_) => {
                Some("Check network access to the runtime distribution API, then retry.")
            }
            AgentError::ProbeUnavailable(_) => None,
            AgentError::CorruptRuntimeInstall(_) => {
                Some("The install was removed and will be downloaded again on next start.")
            }
            AgentError::Io(_) => None,
        }
    }

    /// Retrying the same operation without operator action may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::RuntimeDownloadFailure(_)
                | AgentError::ProbeUnavailable(_)
                | AgentError::CorruptRuntimeInstall(_)
        )
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
