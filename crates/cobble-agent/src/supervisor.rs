use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use cobble_process::{ServerId, ServerListing, ServerState, ServerStats, Severity, ShutdownInfo};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::{Notify, watch},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};

use crate::{
    config::{AgentConfig, ServerSettings},
    error::{AgentError, format_error_chain},
    launch::{self, EntryPoint, EulaOutcome, HeapSize, LaunchSpec},
    log_bus::{LogBus, ServerLog},
    log_parser::{LogParser, PlayerSet, Signal},
    process_tree::ProcessTree,
    properties::{self, ServerProperties},
    runtime::{RuntimeResolver, RuntimeSource},
    status_probe,
};

/// How long the exit waiter lets readers flush buffered output.
const READER_DRAIN: Duration = Duration::from_secs(2);
const RUNTIME_TASK: &str = "Java runtime";

#[derive(Debug, Clone)]
struct RunningProcess {
    generation: u64,
    pid: Option<u32>,
    pgid: Option<i32>,
    started_at: Instant,
    command: String,
    cwd: PathBuf,
}

/// A start that has not produced a process yet.
struct LaunchTicket {
    id: u64,
    cancel: Arc<Notify>,
}

struct ScheduledShutdown {
    deadline: Instant,
    target_unix_ms: u64,
    timer: AbortHandle,
}

struct Shared {
    id: ServerId,
    config: AgentConfig,
    settings: ServerSettings,
    runtime: Arc<RuntimeResolver>,
    log: ServerLog,
    tree: ProcessTree,

    fully_started: AtomicBool,
    stopping: AtomicBool,
    stop_requested: AtomicBool,
    generation: AtomicU64,
    killed_generation: AtomicU64,
    saved_kill_armed: AtomicU64,
    launch_seq: AtomicU64,

    // Lock order: `launch` before `process`.
    launch: std::sync::Mutex<Option<LaunchTicket>>,
    process: std::sync::Mutex<Option<RunningProcess>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    players: std::sync::Mutex<PlayerSet>,
    shutdown: std::sync::Mutex<Option<ScheduledShutdown>>,
    last_list_request: std::sync::Mutex<Option<Instant>>,
    exited: watch::Sender<u64>,

    // The async mutexes double as non-overlap guards for the slow queries.
    stats_cache: tokio::sync::Mutex<Option<(Instant, u32, ServerStats)>>,
    listing_cache: tokio::sync::Mutex<Option<(Instant, ServerListing)>>,
}

/// Cheap to clone; all clones drive the same process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        id: ServerId,
        config: AgentConfig,
        settings: ServerSettings,
        runtime: Arc<RuntimeResolver>,
        bus: &LogBus,
    ) -> Self {
        let (exited, _) = watch::channel(0);
        Self {
            inner: Arc::new(Shared {
                log: bus.for_server(id.clone()),
                id,
                config,
                settings,
                runtime,
                tree: ProcessTree::new(),
                fully_started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                killed_generation: AtomicU64::new(0),
                saved_kill_armed: AtomicU64::new(0),
                launch_seq: AtomicU64::new(0),
                launch: std::sync::Mutex::new(None),
                process: std::sync::Mutex::new(None),
                stdin: tokio::sync::Mutex::new(None),
                players: std::sync::Mutex::new(PlayerSet::default()),
                shutdown: std::sync::Mutex::new(None),
                last_list_request: std::sync::Mutex::new(None),
                exited,
                stats_cache: tokio::sync::Mutex::new(None),
                listing_cache: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.inner.id
    }

    pub fn server_path(&self) -> Option<&Path> {
        self.inner.settings.server_path.as_deref()
    }

    fn running(&self) -> Option<RunningProcess> {
        self.inner
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn launch_pending(&self) -> bool {
        self.inner
            .launch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Clears the launch slot if it still holds `ticket`.
    fn end_launch(&self, ticket: u64) -> bool {
        let mut slot = self.inner.launch.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|t| t.id == ticket) {
            slot.take();
            true
        } else {
            false
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.running().map(|p| p.generation)
    }

    pub fn pid(&self) -> Option<u32> {
        self.running().and_then(|p| p.pid)
    }

    /// The command line of the live process.
    pub fn command(&self) -> Option<String> {
        self.running().map(|p| p.command)
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.running().map(|p| p.cwd)
    }

    pub fn status(&self) -> ServerState {
        let alive = self.running().is_some() || self.launch_pending();
        derive_state(
            alive,
            self.inner.stopping.load(Ordering::Acquire),
            self.inner.fully_started.load(Ordering::Acquire),
        )
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        let state = self.status();
        if state != ServerState::Offline {
            return Err(AgentError::AlreadyRunning(state));
        }
        let dir = self.server_dir()?;
        let (ticket, cancel) = {
            let mut slot = self.inner.launch.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() || self.running().is_some() {
                return Err(AgentError::AlreadyRunning(ServerState::Starting));
            }
            let id = self.inner.launch_seq.fetch_add(1, Ordering::AcqRel) + 1;
            let cancel = Arc::new(Notify::new());
            *slot = Some(LaunchTicket {
                id,
                cancel: cancel.clone(),
            });
            (id, cancel)
        };

        let inner = &self.inner;
        inner.fully_started.store(false, Ordering::Release);
        inner.stopping.store(false, Ordering::Release);
        inner.stop_requested.store(false, Ordering::Release);
        inner.players.lock().unwrap_or_else(|e| e.into_inner()).clear();
        inner.log.status(ServerState::Starting);

        let prepared = tokio::select! {
            biased;
            _ = cancel.notified() => Err(AgentError::LaunchCancelled),
            res = self.prepare(dir) => res,
        };
        let res = match prepared {
            Ok((spec, out_parser, err_parser)) => {
                self.spawn(spec, out_parser, err_parser, ticket).await
            }
            Err(err) => Err(err),
        };

        let owned = self.end_launch(ticket);
        match &res {
            Ok(()) => {}
            Err(AgentError::LaunchCancelled) => {
                tracing::info!(server_id = %inner.id, "start cancelled before the server was spawned");
            }
            // A stop already reported Offline for this launch.
            Err(err) if !owned => {
                tracing::info!(server_id = %inner.id, error = %err, "start failed after it was cancelled");
            }
            Err(err) => {
                tracing::warn!(server_id = %inner.id, error = %err, "start failed");
                inner
                    .log
                    .notice(Severity::Error, format!("Failed to start server: {err}"));
                inner.log.status(ServerState::Offline);
                inner.exited.send_modify(|_| {});
            }
        }
        res
    }

    fn server_dir(&self) -> Result<PathBuf, AgentError> {
        let dir = self
            .inner
            .settings
            .server_path
            .clone()
            .ok_or_else(|| AgentError::LaunchFailure("no server path configured".to_string()))?;
        if !dir.is_dir() {
            return Err(AgentError::LaunchFailure(format!(
                "server directory does not exist: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// Everything before the spawn. Dropping this future abandons the start.
    async fn prepare(
        &self,
        dir: PathBuf,
    ) -> Result<(LaunchSpec, LogParser, LogParser), AgentError> {
        let inner = &self.inner;
        let settings = &inner.settings;

        if settings.accept_eula {
            match launch::accept_eula(&dir) {
                Ok(EulaOutcome::AlreadyAccepted) => {}
                Ok(_) => inner
                    .log
                    .notice(Severity::Info, "Accepted the Minecraft EULA in eula.txt."),
                Err(err) => inner.log.notice(
                    Severity::Warning,
                    format!("Could not update eula.txt: {}", format_error_chain(&err)),
                ),
            }
        }
        match properties::ensure_default(&dir) {
            Ok(true) => inner
                .log
                .notice(Severity::Info, "Created a default server.properties."),
            Ok(false) => {}
            Err(err) => inner.log.notice(
                Severity::Warning,
                format!("Could not create server.properties: {}", format_error_chain(&err)),
            ),
        }

        let entry = launch::find_entry_point(&dir)
            .map_err(|e| AgentError::LaunchFailure(format_error_chain(&e)))?;
        let spec = match entry {
            EntryPoint::Script(script) => launch::script_command(&script, &dir),
            EntryPoint::Jar(jar) => {
                let (java, major) = self.resolve_java(&dir).await?;
                let heap = HeapSize {
                    min: settings.ram_min,
                    max: settings.ram_max,
                    unit: settings.ram_unit,
                };
                launch::java_command(&java, major, &jar, heap, &dir)
            }
        };

        // Parsers are built before spawning so a failure leaves no orphan.
        let out_parser =
            LogParser::new().map_err(|e| AgentError::LaunchFailure(format_error_chain(&e)))?;
        let err_parser =
            LogParser::new().map_err(|e| AgentError::LaunchFailure(format_error_chain(&e)))?;
        Ok((spec, out_parser, err_parser))
    }

    async fn resolve_java(&self, dir: &Path) -> Result<(PathBuf, Option<u32>), AgentError> {
        let inner = &self.inner;
        let log = &inner.log;

        if let Some(java) = &inner.settings.java_path {
            let major = inner.runtime.probe(java).await;
            match major {
                Some(m) => log.notice(
                    Severity::Info,
                    format!(
                        "Using Java {m} ({}) at {}",
                        RuntimeSource::Explicit.describe(),
                        java.display()
                    ),
                ),
                None => log.notice(
                    Severity::Warning,
                    format!(
                        "Configured Java at {} did not answer a version check; launching it anyway.",
                        java.display()
                    ),
                ),
            }
            return Ok((java.clone(), major));
        }

        let version = match inner.settings.minecraft_version.as_deref() {
            Some(v) => v.to_string(),
            None => {
                log.notice(
                    Severity::Warning,
                    "No Minecraft version configured; assuming the newest Java runtime.",
                );
                String::new()
            }
        };

        let progress_log = log.clone();
        let progress = move |pct: u8| progress_log.progress(RUNTIME_TASK, pct, None);
        let resolved = inner
            .runtime
            .resolve(dir, &version, inner.settings.allow_runtime_download, &progress)
            .await;

        match resolved {
            Ok(desc) => {
                if desc.repaired {
                    log.notice(
                        Severity::Warning,
                        format!(
                            "Removed a corrupt Java {} install; it will be downloaded again when needed.",
                            desc.major_version
                        ),
                    );
                }
                log.notice(
                    Severity::Info,
                    format!(
                        "Using Java {} ({}) at {}",
                        desc.major_version,
                        desc.source.describe(),
                        desc.executable_path.display()
                    ),
                );
                Ok((desc.executable_path, Some(desc.major_version)))
            }
            Err(err) => {
                if matches!(err, AgentError::RuntimeDownloadFailure(_)) {
                    log.progress(RUNTIME_TASK, 0, Some(err.to_string()));
                }
                Err(err)
            }
        }
    }

    async fn spawn(
        &self,
        spec: LaunchSpec,
        out_parser: LogParser,
        err_parser: LogParser,
        ticket: u64,
    ) -> Result<(), AgentError> {
        let inner = &self.inner;
        let command = spec.command_line();
        inner
            .log
            .notice(Severity::Info, format!("Starting server: {command}"));

        let mut cmd = tokio::process::Command::new(&spec.exec);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::LaunchFailure(format!("spawn {} (cwd {}): {e}", spec.exec, spec.cwd.display()))
        })?;

        let pid = child.id();
        let pgid = if cfg!(unix) {
            pid.and_then(|p| i32::try_from(p).ok())
        } else {
            None
        };
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Publishing the process and checking for a cancel happen under the
        // launch lock, so `stop` either sees the process or cancels the ticket.
        let accepted = {
            let launch = inner.launch.lock().unwrap_or_else(|e| e.into_inner());
            let current = launch.as_ref().is_some_and(|t| t.id == ticket);
            if current {
                *inner.process.lock().unwrap_or_else(|e| e.into_inner()) = Some(RunningProcess {
                    generation,
                    pid,
                    pgid,
                    started_at: Instant::now(),
                    command: command.clone(),
                    cwd: spec.cwd.clone(),
                });
            }
            current
        };
        if !accepted {
            tracing::info!(server_id = %inner.id, pid, "start cancelled while spawning; killing process");
            if let Some(pid) = pid {
                let shared = inner.clone();
                let _ = tokio::task::spawn_blocking(move || shared.tree.kill_tree(pid, pgid)).await;
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(AgentError::LaunchCancelled);
        }
        tracing::info!(server_id = %inner.id, pid, generation, command = %command, "server process spawned");
        *inner.stdin.lock().await = child.stdin.take();

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            let this = self.clone();
            readers.push(tokio::spawn(async move {
                this.pump(out, out_parser, generation, Severity::Normal).await
            }));
        }
        if let Some(err) = child.stderr.take() {
            let this = self.clone();
            readers.push(tokio::spawn(async move {
                this.pump(err, err_parser, generation, Severity::Error).await
            }));
        }

        let this = self.clone();
        tokio::spawn(async move { this.wait_exit(child, generation, readers).await });
        Ok(())
    }

    async fn pump<R>(self, stream: R, mut parser: LogParser, generation: u64, severity: Severity)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(server_id = %self.inner.id, error = %err, "console read failed");
                    break;
                }
            }
            // Output from a process that was already replaced or killed.
            if self.current_generation() != Some(generation) {
                continue;
            }
            let raw = String::from_utf8_lossy(&buf);
            let parsed = parser.feed(raw.trim_end_matches(['\r', '\n']));
            if !parsed.suppress {
                self.inner.log.line(severity, parsed.text);
            }
            for signal in parsed.signals {
                self.on_signal(signal, generation).await;
            }
        }
    }

    async fn on_signal(&self, signal: Signal, generation: u64) {
        let inner = &self.inner;
        if self.current_generation() != Some(generation) {
            return;
        }
        match signal {
            Signal::Started => {
                if inner.stopping.load(Ordering::Acquire)
                    || inner.fully_started.swap(true, Ordering::AcqRel)
                {
                    return;
                }
                tracing::info!(server_id = %inner.id, "server is online");
                inner.log.status(ServerState::Online);
                inner.log.notice(Severity::Success, "Server started.");
                if inner.stop_requested.swap(false, Ordering::AcqRel) {
                    self.begin_graceful_stop().await;
                }
            }
            Signal::Stopping => {
                if inner.fully_started.load(Ordering::Acquire)
                    && !inner.stopping.swap(true, Ordering::AcqRel)
                {
                    inner.log.status(ServerState::Stopping);
                }
            }
            Signal::WorldSaved => {
                if !inner.fully_started.load(Ordering::Acquire) {
                    return;
                }
                if !inner.stopping.swap(true, Ordering::AcqRel) {
                    inner.log.status(ServerState::Stopping);
                }
                self.arm_saved_kill(generation);
            }
            other => inner
                .players
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .apply(&other),
        }
    }

    /// Once the world is flushed, a process that does not exit is killed.
    fn arm_saved_kill(&self, generation: u64) {
        if self.inner.saved_kill_armed.swap(generation, Ordering::AcqRel) == generation {
            return;
        }
        let grace = self.inner.config.saved_kill_grace;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.current_generation() != Some(generation)
                || !this.inner.stopping.load(Ordering::Acquire)
            {
                return;
            }
            tracing::warn!(server_id = %this.inner.id, grace_secs = grace.as_secs(), "process hung after world save");
            this.inner.log.notice(
                Severity::Warning,
                "Server finished saving but hung. Forcing termination.",
            );
            this.force_kill(Some(generation)).await;
        });
    }

    async fn wait_exit(self, mut child: Child, generation: u64, readers: Vec<JoinHandle<()>>) {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                tracing::warn!(server_id = %self.inner.id, error = %err, "waiting for server process failed");
                None
            }
        };
        for mut handle in readers {
            // An escaped grandchild can hold the pipe open indefinitely.
            if tokio::time::timeout(READER_DRAIN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.finalize(generation, code).await;
    }

    /// Clears the process slot and reports the exit. Only the first caller
    /// for a generation does anything.
    async fn finalize(&self, generation: u64, code: Option<i32>) -> bool {
        let inner = &self.inner;
        let taken = {
            let mut slot = inner.process.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|p| p.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let Some(proc) = taken else {
            return false;
        };

        let was_stopping = inner.stopping.load(Ordering::Acquire);
        let killed = inner.killed_generation.load(Ordering::Acquire) == generation;

        *inner.stdin.lock().await = None;
        inner.fully_started.store(false, Ordering::Release);
        inner.stopping.store(false, Ordering::Release);
        inner.stop_requested.store(false, Ordering::Release);
        inner.players.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *inner.listing_cache.lock().await = None;
        if let Some(s) = inner.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            s.timer.abort();
        }

        let uptime = proc.started_at.elapsed().as_secs();
        if killed {
            tracing::info!(server_id = %inner.id, pid = proc.pid, uptime, "server process killed");
            inner.log.notice(Severity::Error, "Server process killed.");
        } else if was_stopping {
            tracing::info!(server_id = %inner.id, pid = proc.pid, code, uptime, "server stopped");
            inner.log.notice(Severity::Info, "Server stopped.");
        } else {
            let err = AgentError::UnexpectedExit(code);
            tracing::warn!(server_id = %inner.id, pid = proc.pid, uptime, error = %err, "server exited unexpectedly");
            let detail = code.map(|c| format!(" (exit code {c})")).unwrap_or_default();
            inner
                .log
                .notice(Severity::Error, format!("Server stopped unexpectedly{detail}."));
        }
        inner.log.status(ServerState::Offline);
        inner.exited.send_replace(generation);
        true
    }

    /// Kills the whole subtree and finalizes immediately.
    async fn force_kill(&self, generation: Option<u64>) {
        let target = self
            .running()
            .filter(|p| generation.is_none_or(|g| p.generation == g));
        let Some(proc) = target else {
            return;
        };
        self.inner
            .killed_generation
            .store(proc.generation, Ordering::Release);

        if let Some(pid) = proc.pid {
            let inner = self.inner.clone();
            let pgid = proc.pgid;
            if let Err(err) =
                tokio::task::spawn_blocking(move || inner.tree.kill_tree(pid, pgid)).await
            {
                tracing::warn!(server_id = %self.inner.id, error = %err, "kill task failed");
            }
        }
        self.finalize(proc.generation, None).await;
    }

    pub async fn stop(&self, force: bool) -> Result<(), AgentError> {
        let state = self.status();
        if state == ServerState::Offline {
            return Ok(());
        }
        self.cancel_shutdown_inner(false);

        if self.cancel_pending_launch() || self.running().is_none() {
            return Ok(());
        }

        if force {
            self.inner.log.notice(Severity::Warning, "Force stopping server...");
            self.force_kill(None).await;
            return Ok(());
        }

        match state {
            ServerState::Starting => {
                self.inner.stop_requested.store(true, Ordering::Release);
                self.inner.log.notice(
                    Severity::Info,
                    "Server is still starting; it will stop as soon as startup completes.",
                );
            }
            ServerState::Online => self.begin_graceful_stop().await,
            ServerState::Stopping | ServerState::Offline => {}
        }
        Ok(())
    }

    /// Aborts a start that has no process yet and reports Offline at once.
    fn cancel_pending_launch(&self) -> bool {
        let ticket = {
            let mut slot = self.inner.launch.lock().unwrap_or_else(|e| e.into_inner());
            if self.running().is_some() {
                return false;
            }
            slot.take()
        };
        let Some(ticket) = ticket else {
            return false;
        };
        ticket.cancel.notify_one();
        tracing::info!(server_id = %self.inner.id, launch = ticket.id, "cancelling pending start");
        let log = &self.inner.log;
        log.notice(Severity::Info, "Start cancelled; the server will not be launched.");
        log.status(ServerState::Offline);
        self.inner.exited.send_modify(|_| {});
        true
    }

    async fn begin_graceful_stop(&self) {
        let inner = &self.inner;
        let Some(proc) = self.running() else {
            return;
        };
        if inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.log.status(ServerState::Stopping);
        inner.log.notice(Severity::Info, "Stopping server...");

        // Taking stdin out of the slot closes it after the write.
        let sent = match inner.stdin.lock().await.take() {
            Some(mut stdin) => {
                stdin.write_all(b"stop\n").await.is_ok() && stdin.flush().await.is_ok()
            }
            None => false,
        };
        if !sent {
            tracing::warn!(server_id = %inner.id, "stdin unavailable; signalling process group");
            #[cfg(unix)]
            {
                if let Some(pgid) = proc.pgid {
                    unsafe {
                        libc::kill(-pgid, libc::SIGTERM);
                    }
                }
            }
        }

        let window = inner.config.stop_watchdog;
        let this = self.clone();
        let generation = proc.generation;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if this.current_generation() == Some(generation)
                && this.inner.stopping.load(Ordering::Acquire)
            {
                let err = AgentError::GracefulStopTimeout(window.as_secs());
                tracing::warn!(server_id = %this.inner.id, error = %err, "graceful stop is slow");
                this.inner.log.notice(
                    Severity::Warning,
                    "Server is taking a long time to stop. You can force stop it now.",
                );
            }
        });
    }

    async fn write_stdin(&self, line: &str) -> Result<(), String> {
        let mut guard = self.inner.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err("stdin is not available".to_string());
        };
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        let res = match stdin.write_all(&data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        res.map_err(|e| {
            *guard = None;
            e.to_string()
        })
    }

    /// Writes one command line to the server. Never errors; failures become
    /// a warning in the console.
    pub async fn send(&self, command: &str) -> bool {
        let command = command.trim_end_matches(['\r', '\n']);
        let log = &self.inner.log;
        let accepting = matches!(self.status(), ServerState::Starting | ServerState::Online);
        let res = if accepting {
            self.write_stdin(command).await
        } else {
            Err("server is not running".to_string())
        };
        match res {
            Ok(()) => {
                log.line(Severity::Input, format!("> {command}"));
                true
            }
            Err(reason) => {
                tracing::debug!(server_id = %self.inner.id, reason, "command not sent");
                log.notice(
                    Severity::Warning,
                    "Cannot send command: server is not running or stdin is not available.",
                );
                false
            }
        }
    }

    pub fn schedule_shutdown(&self, minutes: u32) -> Result<ShutdownInfo, AgentError> {
        let state = self.status();
        if state != ServerState::Online {
            return Err(AgentError::NotRunning);
        }
        let Some(generation) = self.current_generation() else {
            return Err(AgentError::NotRunning);
        };

        let delay = Duration::from_secs(u64::from(minutes) * 60);
        let deadline = Instant::now() + delay;
        let target_unix_ms = unix_ms().saturating_add(delay.as_millis() as u64);

        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.inner
                .shutdown
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if this.current_generation() != Some(generation) || this.status() != ServerState::Online {
                return;
            }
            this.inner
                .log
                .notice(Severity::Info, "Scheduled shutdown reached.");
            this.begin_graceful_stop().await;
        });

        let previous = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ScheduledShutdown {
                deadline,
                target_unix_ms,
                timer: task.abort_handle(),
            });
        if let Some(prev) = previous {
            prev.timer.abort();
        }
        self.inner.log.notice(
            Severity::Info,
            format!("Server will shut down in {minutes} minute(s)."),
        );
        Ok(ShutdownInfo {
            remaining_secs: delay.as_secs(),
            target_unix_ms,
        })
    }

    pub fn cancel_shutdown(&self) -> bool {
        self.cancel_shutdown_inner(true)
    }

    fn cancel_shutdown_inner(&self, announce_none: bool) -> bool {
        let taken = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(s) => {
                s.timer.abort();
                self.inner
                    .log
                    .notice(Severity::Info, "Scheduled shutdown cancelled.");
                true
            }
            None => {
                if announce_none {
                    tracing::debug!(server_id = %self.inner.id, "no scheduled shutdown to cancel");
                }
                false
            }
        }
    }

    pub fn shutdown_info(&self) -> Option<ShutdownInfo> {
        let guard = self.inner.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|s| ShutdownInfo {
            remaining_secs: s.deadline.saturating_duration_since(Instant::now()).as_secs(),
            target_unix_ms: s.target_unix_ms,
        })
    }

    pub async fn stats(&self) -> ServerStats {
        let Some(pid) = self.pid() else {
            return ServerStats::default();
        };
        let mut cache = self.inner.stats_cache.lock().await;
        if let Some((at, root, stats)) = cache.as_ref()
            && *root == pid
            && at.elapsed() < self.inner.config.stats_cache
        {
            return stats.clone();
        }

        let inner = self.inner.clone();
        let sampled = tokio::task::spawn_blocking(move || inner.tree.sample(pid))
            .await
            .ok()
            .flatten()
            .unwrap_or(ServerStats {
                pid: Some(pid),
                ..ServerStats::default()
            });
        *cache = Some((Instant::now(), pid, sampled.clone()));
        sampled
    }

    fn properties(&self) -> ServerProperties {
        self.server_path()
            .map(ServerProperties::load)
            .unwrap_or_default()
    }

    /// Cached status-query result; unreachable unless the process is up.
    pub async fn listing(&self) -> ServerListing {
        if !matches!(self.status(), ServerState::Online | ServerState::Stopping) {
            return ServerListing::unreachable();
        }
        let mut cache = self.inner.listing_cache.lock().await;
        if let Some((at, listing)) = cache.as_ref()
            && at.elapsed() < self.inner.config.status_cache
        {
            return listing.clone();
        }

        let props = self.properties();
        let (host, port) = (props.probe_host(), props.server_port());
        let listing = status_probe::query_status(&host, port, self.inner.config.probe_timeout).await;
        if !listing.online {
            let err = AgentError::ProbeUnavailable(format!("{host}:{port}"));
            tracing::debug!(server_id = %self.inner.id, error = %err, "status probe unavailable");
        }
        *cache = Some((Instant::now(), listing.clone()));
        listing
    }

    pub async fn player_count(&self) -> u32 {
        let listing = self.listing().await;
        if listing.online {
            return listing.players_online;
        }
        self.inner
            .players
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u32
    }

    pub async fn max_players(&self) -> u32 {
        let listing = self.listing().await;
        if listing.online && listing.players_max > 0 {
            return listing.players_max;
        }
        self.properties().max_players()
    }

    /// Sends a silent `list`, at most once per cooldown unless forced.
    pub async fn request_player_list_refresh(&self, force: bool) -> bool {
        if self.status() != ServerState::Online {
            return false;
        }
        {
            let mut last = self
                .inner
                .last_list_request
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !force
                && last.is_some_and(|t| t.elapsed() < self.inner.config.list_cooldown)
            {
                return false;
            }
            *last = Some(Instant::now());
        }
        self.write_stdin("list").await.is_ok()
    }

    pub async fn active_players(&self) -> Vec<String> {
        let online = self.status() == ServerState::Online;
        if online {
            self.request_player_list_refresh(false).await;
        }
        let names = self
            .inner
            .players
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .names();
        if !names.is_empty() || !online {
            return names;
        }
        self.listing()
            .await
            .sample
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    /// Waits for the process to exit. On timeout the tree is killed and
    /// `GracefulStopTimeout` is returned.
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut exited = self.inner.exited.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            while self.status() != ServerState::Offline {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if waited.is_ok() {
            return Ok(());
        }
        self.inner.log.notice(
            Severity::Warning,
            format!("Server did not stop within {}s; killing it.", timeout.as_secs()),
        );
        self.force_kill(None).await;
        Err(AgentError::GracefulStopTimeout(timeout.as_secs()))
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.inner.id)
            .field("state", &self.status())
            .field("pid", &self.pid())
            .finish()
    }
}

/// State is never stored, only derived.
fn derive_state(alive: bool, stopping: bool, fully_started: bool) -> ServerState {
    match (alive, stopping, fully_started) {
        (false, _, _) => ServerState::Offline,
        (true, true, _) => ServerState::Stopping,
        (true, false, true) => ServerState::Online,
        (true, false, false) => ServerState::Starting,
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The child must not outlive the agent.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
