use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::{AgentError, format_error_chain};

pub const NEWEST_MAJOR: u32 = 21;

const LINK_FILE: &str = "java_config.json";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DOWNLOAD_ATTEMPTS: u32 = 3;
/// Download occupies 0..90 of the progress range; extraction the rest.
const DOWNLOAD_PROGRESS_SPAN: u64 = 90;

const VERSION_TABLE: &[(&str, u32)] = &[
    ("1.21", 21),
    ("1.21.1", 21),
    ("1.21.2", 21),
    ("1.21.3", 21),
    ("1.21.4", 21),
    ("1.20.5", 21),
    ("1.20.6", 21),
    ("1.20", 17),
    ("1.20.1", 17),
    ("1.20.2", 17),
    ("1.20.3", 17),
    ("1.20.4", 17),
    ("1.19", 17),
    ("1.19.1", 17),
    ("1.19.2", 17),
    ("1.19.3", 17),
    ("1.19.4", 17),
    ("1.18", 17),
    ("1.18.1", 17),
    ("1.18.2", 17),
    ("1.17", 17),
    ("1.17.1", 17),
    ("1.16", 8),
    ("1.16.1", 8),
    ("1.16.2", 8),
    ("1.16.3", 8),
    ("1.16.4", 8),
    ("1.16.5", 8),
    ("1.15", 8),
    ("1.15.1", 8),
    ("1.15.2", 8),
    ("1.14", 8),
    ("1.14.1", 8),
    ("1.14.2", 8),
    ("1.14.3", 8),
    ("1.14.4", 8),
    ("1.13", 8),
    ("1.13.1", 8),
    ("1.13.2", 8),
    ("1.12", 8),
    ("1.12.1", 8),
    ("1.12.2", 8),
];

/// Java major version needed by a Minecraft version. Never fails: anything
/// unrecognised gets the newest known major.
pub fn required_major_version(minecraft_version: &str) -> u32 {
    let v = minecraft_version.trim().to_ascii_lowercase();
    let v = v.trim_start_matches('v');

    if let Some((_, major)) = VERSION_TABLE.iter().find(|(k, _)| *k == v) {
        return *major;
    }

    let mut parts = v.split('.').map(|p| p.parse::<u32>().ok());
    let (Some(Some(1)), Some(Some(minor))) = (parts.next(), parts.next()) else {
        return NEWEST_MAJOR;
    };
    let patch = parts.next().flatten().unwrap_or(0);

    match minor {
        m if m >= 21 => 21,
        20 if patch >= 5 => 21,
        m if m >= 17 => 17,
        _ => 8,
    }
}

pub fn parse_java_major_from_version_line(first_line: &str) -> anyhow::Result<u32> {
    // Typical formats:
    // - openjdk version "21.0.2" 2024-01-16
    // - java version "1.8.0_402"
    // Some builds omit quotes:
    // - openjdk 21.0.2 2024-01-16

    let ver = if let Some(quoted) = first_line.split('"').nth(1) {
        quoted
    } else {
        // First token starting with a digit; the version precedes the date.
        first_line
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| anyhow::anyhow!("failed to parse java version output: {first_line}"))?
    };

    let parse_leading_u32 = |s: &str| -> anyhow::Result<u32> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if end == 0 {
            anyhow::bail!("failed to parse java major from: {ver}");
        }
        s[..end]
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("failed to parse java major from: {ver}"))
    };

    let major = if ver.starts_with("1.") {
        let second = ver.split('.').nth(1).unwrap_or("");
        parse_leading_u32(second)?
    } else {
        let first = ver.split('.').next().unwrap_or("");
        parse_leading_u32(first)?
    };

    Ok(major)
}

/// Distribution API naming for the host.
pub fn platform() -> (&'static str, &'static str) {
    map_platform(std::env::consts::OS, std::env::consts::ARCH)
}

fn map_platform(os: &str, arch: &str) -> (&'static str, &'static str) {
    let os = match os {
        "windows" => "windows",
        "macos" => "mac",
        _ => "linux",
    };
    let arch = match arch {
        "aarch64" | "arm64" => "aarch64",
        _ => "x64",
    };
    (os, arch)
}

pub fn java_exe_name() -> &'static str {
    if cfg!(windows) { "java.exe" } else { "java" }
}

/// Finds the java executable inside an install dir.
pub fn executable_in(dir: &Path) -> Option<PathBuf> {
    [
        dir.join("bin").join("java.exe"),
        dir.join("bin").join("java"),
        dir.join("Contents").join("Home").join("bin").join("java"),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSource {
    Explicit,
    Linked,
    Local,
    System,
    Downloaded,
}

impl RuntimeSource {
    pub fn describe(self) -> &'static str {
        match self {
            RuntimeSource::Explicit => "configured",
            RuntimeSource::Linked => "linked",
            RuntimeSource::Local => "local install",
            RuntimeSource::System => "system",
            RuntimeSource::Downloaded => "downloaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDescriptor {
    pub major_version: u32,
    pub install_dir: Option<PathBuf>,
    pub executable_path: PathBuf,
    pub validated: bool,
    pub source: RuntimeSource,
    /// A corrupt local install was removed on the way.
    pub repaired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub required_major: u32,
    pub system: Option<(u32, PathBuf)>,
    pub local_available: bool,
    pub needs_download: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerLink {
    pub minecraft_version: String,
    pub java_path: String,
    pub java_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LinkFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerLink>,
    #[serde(default)]
    pub java_installations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Asset {
    binary: AssetBinary,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct AssetBinary {
    package: AssetPackage,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct AssetPackage {
    link: String,
    name: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Progress sink, called with percentages in `0..=100`.
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// Forwards only values above the highest one already reported, so retries
/// never move progress backwards.
struct MonotonicProgress<'a> {
    sink: &'a ProgressFn<'a>,
    reported: AtomicU8,
}

impl<'a> MonotonicProgress<'a> {
    fn new(sink: &'a ProgressFn<'a>) -> Self {
        Self {
            sink,
            reported: AtomicU8::new(0),
        }
    }

    fn report(&self, pct: u8) {
        let pct = pct.min(100);
        if self.reported.fetch_max(pct, Ordering::AcqRel) < pct {
            (self.sink)(pct);
        }
    }
}

pub struct RuntimeResolver {
    base_dir: PathBuf,
    api_url: String,
    client: reqwest::Client,
    locks: std::sync::Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    link_lock: std::sync::Mutex<()>,
}

impl RuntimeResolver {
    pub fn new(base_dir: impl Into<PathBuf>, api_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cobble-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            base_dir: base_dir.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client,
            locks: std::sync::Mutex::new(HashMap::new()),
            link_lock: std::sync::Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn install_dir(&self, major: u32) -> PathBuf {
        self.base_dir.join(format!("java-{major}"))
    }

    fn lock_for(&self, major: u32) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(major)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `<exe> -version`. Returns the major version if it exits cleanly.
    pub async fn probe(&self, exe: &Path) -> Option<u32> {
        let mut cmd = tokio::process::Command::new(exe);
        cmd.arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let out = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => {
                tracing::debug!(path = %exe.display(), error = %err, "java probe failed to run");
                return None;
            }
            Err(_) => {
                tracing::warn!(path = %exe.display(), "java probe timed out");
                return None;
            }
        };
        if !out.status.success() {
            tracing::warn!(path = %exe.display(), code = ?out.status.code(), "java probe exited with failure");
            return None;
        }

        // `java -version` prints to stderr; some wrappers use stdout.
        let text = if out.stderr.is_empty() {
            String::from_utf8_lossy(&out.stdout).to_string()
        } else {
            String::from_utf8_lossy(&out.stderr).to_string()
        };
        let first = text.lines().next().unwrap_or_default();
        match parse_java_major_from_version_line(first) {
            Ok(major) => Some(major),
            Err(err) => {
                tracing::warn!(path = %exe.display(), error = %err, "java probe output not understood");
                None
            }
        }
    }

    /// `JAVA_HOME` first, then `java` on `PATH`.
    pub async fn detect_system(&self) -> Option<(u32, PathBuf)> {
        let mut candidates = Vec::new();
        if let Some(home) = std::env::var_os("JAVA_HOME").filter(|h| !h.is_empty()) {
            candidates.push(PathBuf::from(home).join("bin").join(java_exe_name()));
        }
        if let Ok(p) = which::which("java") {
            candidates.push(p);
        }
        for exe in candidates {
            if !exe.is_file() {
                continue;
            }
            if let Some(major) = self.probe(&exe).await {
                return Some((major, exe));
            }
        }
        None
    }

    fn link_path(&self) -> PathBuf {
        self.base_dir.join(LINK_FILE)
    }

    pub fn load_links(&self) -> LinkFile {
        let path = self.link_path();
        let Ok(raw) = fs::read(&path) else {
            return LinkFile::default();
        };
        match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable runtime link file");
                LinkFile::default()
            }
        }
    }

    fn update_links(&self, f: impl FnOnce(&mut LinkFile)) -> anyhow::Result<()> {
        let _guard = self.link_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut links = self.load_links();
        f(&mut links);

        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create {}", self.base_dir.display()))?;
        let path = self.link_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&links)?;
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }

    fn link_server(&self, server_path: &Path, minecraft_version: &str, exe: &Path) {
        let key = link_key(server_path);
        let link = ServerLink {
            minecraft_version: minecraft_version.to_string(),
            java_path: exe.to_string_lossy().to_string(),
            java_version: required_major_version(minecraft_version),
        };
        if let Err(err) = self.update_links(|l| {
            l.servers.insert(key, link);
        }) {
            tracing::warn!(error = %format_error_chain(&err), "failed to persist runtime link");
        }
    }

    /// Validates the local install for `major`. A broken one is deleted.
    async fn check_local(&self, major: u32) -> LocalInstall {
        let dir = self.install_dir(major);
        if !dir.exists() {
            return LocalInstall::Missing;
        }
        if let Some(exe) = executable_in(&dir)
            && let Some(found) = self.probe(&exe).await
        {
            return LocalInstall::Valid(exe, found);
        }

        let err = AgentError::CorruptRuntimeInstall(dir.clone());
        tracing::warn!(major, error = %err, "removing corrupt runtime install");
        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove corrupt runtime install");
        }
        LocalInstall::Repaired
    }

    /// Linked runtime, then a local install, then the system runtime, then a
    /// download when allowed.
    pub async fn resolve(
        &self,
        server_path: &Path,
        minecraft_version: &str,
        allow_download: bool,
        progress: &ProgressFn<'_>,
    ) -> Result<RuntimeDescriptor, AgentError> {
        let required = required_major_version(minecraft_version);
        let key = link_key(server_path);

        if let Some(link) = self.load_links().servers.get(&key).cloned() {
            let exe = PathBuf::from(&link.java_path);
            if exe.is_file()
                && let Some(major) = self.probe(&exe).await
                && major >= required
            {
                return Ok(RuntimeDescriptor {
                    major_version: major,
                    install_dir: None,
                    executable_path: exe,
                    validated: true,
                    source: RuntimeSource::Linked,
                    repaired: false,
                });
            }
            tracing::info!(server = %key, "linked runtime no longer usable; resolving again");
        }

        let lock = self.lock_for(required);
        let _guard = lock.lock().await;

        let mut repaired = false;
        match self.check_local(required).await {
            LocalInstall::Valid(exe, major) => {
                self.link_server(server_path, minecraft_version, &exe);
                return Ok(RuntimeDescriptor {
                    major_version: major,
                    install_dir: Some(self.install_dir(required)),
                    executable_path: exe,
                    validated: true,
                    source: RuntimeSource::Local,
                    repaired: false,
                });
            }
            LocalInstall::Repaired => repaired = true,
            LocalInstall::Missing => {}
        }

        if let Some((major, exe)) = self.detect_system().await
            && major >= required
        {
            self.link_server(server_path, minecraft_version, &exe);
            return Ok(RuntimeDescriptor {
                major_version: major,
                install_dir: None,
                executable_path: exe,
                validated: true,
                source: RuntimeSource::System,
                repaired,
            });
        }

        if !allow_download {
            return Err(AgentError::LaunchFailure(format!(
                "no usable Java {required}+ runtime found and runtime downloads are disabled"
            )));
        }

        let exe = self
            .download_and_install(required, progress)
            .await
            .map_err(|e| AgentError::RuntimeDownloadFailure(format_error_chain(&e)))?;
        let dir = self.install_dir(required);
        let Some(major) = self.probe(&exe).await else {
            let _ = fs::remove_dir_all(&dir);
            return Err(AgentError::CorruptRuntimeInstall(dir));
        };
        self.link_server(server_path, minecraft_version, &exe);
        Ok(RuntimeDescriptor {
            major_version: major,
            install_dir: Some(dir),
            executable_path: exe,
            validated: true,
            source: RuntimeSource::Downloaded,
            repaired,
        })
    }

    /// Installs `major` locally unless a valid install already exists.
    pub async fn ensure_installed(
        &self,
        major: u32,
        progress: &ProgressFn<'_>,
    ) -> Result<PathBuf, AgentError> {
        let lock = self.lock_for(major);
        let _guard = lock.lock().await;
        if let LocalInstall::Valid(exe, _) = self.check_local(major).await {
            progress(100);
            return Ok(exe);
        }
        self.download_and_install(major, progress)
            .await
            .map_err(|e| AgentError::RuntimeDownloadFailure(format_error_chain(&e)))
    }

    pub async fn status(&self, minecraft_version: &str) -> RuntimeStatus {
        let required = required_major_version(minecraft_version);
        let system = self.detect_system().await;
        let local_available = executable_in(&self.install_dir(required)).is_some();
        let system_ok = system.as_ref().is_some_and(|(m, _)| *m >= required);
        RuntimeStatus {
            required_major: required,
            system,
            local_available,
            needs_download: !local_available && !system_ok,
        }
    }

    pub fn list_installed(&self) -> BTreeMap<u32, PathBuf> {
        let mut out = BTreeMap::new();
        let Ok(rd) = fs::read_dir(&self.base_dir) else {
            return out;
        };
        for e in rd.flatten() {
            let path = e.path();
            let Some(major) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("java-"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if path.is_dir() && executable_in(&path).is_some() {
                out.insert(major, path);
            }
        }
        out
    }

    /// Removes local installs whose major no linked server requires.
    pub async fn cleanup_unused(&self) -> anyhow::Result<Vec<u32>> {
        let links = self.load_links();
        let used: Vec<u32> = links.servers.values().map(|s| s.java_version).collect();

        let mut removed = Vec::new();
        for (major, dir) in self.list_installed() {
            if used.contains(&major) {
                continue;
            }
            let lock = self.lock_for(major);
            let _guard = lock.lock().await;
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            tracing::info!(major, path = %dir.display(), "removed unused runtime");
            removed.push(major);
        }
        if !removed.is_empty() {
            self.update_links(|l| {
                for m in &removed {
                    l.java_installations.remove(&m.to_string());
                }
            })?;
        }
        Ok(removed)
    }

    async fn find_package(&self, major: u32) -> anyhow::Result<AssetPackage> {
        let (os, arch) = platform();
        let url = format!("{}/assets/latest/{major}/hotspot", self.api_url);
        let assets: Vec<Asset> = self
            .client
            .get(&url)
            .query(&[
                ("vendor", "eclipse"),
                ("os", os),
                ("architecture", arch),
                ("image_type", "jre"),
            ])
            .send()
            .await
            .with_context(|| format!("query runtime api {url}"))?
            .error_for_status()
            .context("query runtime api (status)")?
            .json()
            .await
            .context("parse runtime api response")?;
        assets
            .into_iter()
            .next()
            .map(|a| a.binary.package)
            .ok_or_else(|| anyhow::anyhow!("no Java {major} release for {os}-{arch}"))
    }

    async fn download_archive(
        &self,
        pkg: &AssetPackage,
        dest: &Path,
        progress: &ProgressFn<'_>,
    ) -> anyhow::Result<()> {
        let tmp = dest.with_extension("part");
        let resp = self
            .client
            .get(&pkg.link)
            .send()
            .await
            .with_context(|| format!("download {}", pkg.link))?
            .error_for_status()
            .with_context(|| format!("download {} (status)", pkg.link))?;
        let total = resp.content_length().or(pkg.size).unwrap_or(0);

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut hasher = Sha256::new();
        let mut done: u64 = 0;
        let mut last_pct: u8 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read runtime archive body")?;
            hasher.update(&chunk);
            f.write_all(&chunk).await?;
            done = done.saturating_add(chunk.len() as u64);
            if total > 0 {
                let pct = (done.min(total) * DOWNLOAD_PROGRESS_SPAN / total) as u8;
                if pct != last_pct {
                    last_pct = pct;
                    progress(pct);
                }
            }
        }
        f.flush().await.ok();
        drop(f);

        if let Some(expected) = pkg.checksum.as_deref().filter(|c| !c.is_empty()) {
            let got = hex::encode(hasher.finalize());
            if !got.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&tmp).await;
                anyhow::bail!("runtime archive sha256 mismatch: expected {expected}, got {got}");
            }
        }
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    /// Caller holds the lock for `major`.
    async fn download_and_install(
        &self,
        major: u32,
        progress: &ProgressFn<'_>,
    ) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("create {}", self.base_dir.display()))?;

        let pkg = self.find_package(major).await?;
        let archive_name = Path::new(&pkg.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("runtime api returned an empty package name"))?;
        let archive = self.base_dir.join(&archive_name);
        tracing::info!(major, url = %pkg.link, "downloading runtime");

        let progress = MonotonicProgress::new(progress);
        let report = |pct: u8| progress.report(pct);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.download_archive(&pkg, &archive, &report).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(major, attempt, error = %format_error_chain(&e), "runtime download attempt failed");
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        progress.report(DOWNLOAD_PROGRESS_SPAN as u8);
        let dir = self.install_dir(major);
        let staging = self.base_dir.join(format!(".java-{major}.extract"));
        let archive_for_task = archive.clone();
        let staging_for_task = staging.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_archive(&archive_for_task, &staging_for_task)
        })
        .await
        .context("extraction task panicked")?;
        let _ = tokio::fs::remove_file(&archive).await;
        if let Err(e) = extracted {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        fs::rename(&staging, &dir).with_context(|| format!("install {}", dir.display()))?;

        let exe = executable_in(&dir).ok_or_else(|| {
            anyhow::anyhow!("java executable not found after extracting {archive_name}")
        })?;
        let dir_str = dir.to_string_lossy().to_string();
        if let Err(err) = self.update_links(|l| {
            l.java_installations.insert(major.to_string(), dir_str);
        }) {
            tracing::warn!(error = %format_error_chain(&err), "failed to record runtime install");
        }
        progress.report(100);
        tracing::info!(major, path = %dir.display(), "runtime installed");
        Ok(exe)
    }
}

enum LocalInstall {
    Valid(PathBuf, u32),
    Repaired,
    Missing,
}

fn link_key(server_path: &Path) -> String {
    fs::canonicalize(server_path)
        .unwrap_or_else(|_| server_path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

/// Extracts a `.zip` or `.tar.gz`/`.tgz` archive into `dest`, replacing it.
pub fn extract_archive(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("clear {}", dest.display()))?;
    }
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") {
        extract_zip(archive, dest)?;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(f));
        tar.set_preserve_permissions(true);
        tar.unpack(dest).context("extract tar.gz")?;
    } else if name.ends_with(".tar") {
        let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
        tar::Archive::new(f).unpack(dest).context("extract tar")?;
    } else {
        anyhow::bail!("unsupported runtime archive format: {name}");
    }

    flatten_single_root(dest)
}

fn extract_zip(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(f).context("open runtime zip")?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("read zip entry")?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).context("extract zip entry")?;
        fs::write(&out_path, buf)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }
    Ok(())
}

/// Archives usually wrap everything in one `jdk-xx` directory; hoist it.
pub fn flatten_single_root(dir: &Path) -> anyhow::Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(dir)?.flatten().map(|e| e.path()).collect();
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.is_dir() {
        return Ok(());
    }

    let tmp = dir.with_file_name(format!(
        "{}.flatten",
        dir.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    ));
    fs::rename(only, &tmp).with_context(|| format!("move {}", only.display()))?;
    for e in fs::read_dir(&tmp)?.flatten() {
        fs::rename(e.path(), dir.join(e.file_name()))?;
    }
    fs::remove_dir(&tmp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn required_major_known_versions() {
        assert_eq!(required_major_version("1.20.1"), 17);
        assert_eq!(required_major_version("1.21"), 21);
        assert_eq!(required_major_version("1.16.5"), 8);
        assert_eq!(required_major_version(" v1.20.6 "), 21);
    }

    #[test]
    fn required_major_thresholds_and_unknowns() {
        assert_eq!(required_major_version("1.99"), NEWEST_MAJOR);
        assert_eq!(required_major_version("1.21.9"), 21);
        assert_eq!(required_major_version("1.20.7"), 21);
        assert_eq!(required_major_version("1.19.9"), 17);
        assert_eq!(required_major_version("1.8.9"), 8);
        assert_eq!(required_major_version("24w14a"), NEWEST_MAJOR);
        assert_eq!(required_major_version(""), NEWEST_MAJOR);
    }

    #[test]
    fn parse_java_major_modern_openjdk() {
        let line = "openjdk version \"21.0.2\" 2024-01-16";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 21);
    }

    #[test]
    fn parse_java_major_modern_no_quotes() {
        let line = "openjdk 21.0.2 2024-01-16";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 21);
    }

    #[test]
    fn parse_java_major_legacy_1_8() {
        let line = "java version \"1.8.0_402\"";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 8);
    }

    #[test]
    fn parse_java_major_rejects_garbage() {
        let err = parse_java_major_from_version_line("not java").unwrap_err();
        assert!(err.to_string().contains("failed to parse java version output"));
    }

    #[test]
    fn platform_names() {
        assert_eq!(map_platform("macos", "aarch64"), ("mac", "aarch64"));
        assert_eq!(map_platform("windows", "x86_64"), ("windows", "x64"));
        assert_eq!(map_platform("linux", "x86_64"), ("linux", "x64"));
    }

    #[test]
    fn retried_download_progress_never_goes_backwards() {
        let seen = std::sync::Mutex::new(Vec::<u8>::new());
        let sink = |p: u8| seen.lock().unwrap().push(p);
        let progress = MonotonicProgress::new(&sink);
        for pct in [0, 30, 60, 0, 30, 60, 75, 90, 90, 100, 120] {
            progress.report(pct);
        }
        assert_eq!(seen.into_inner().unwrap(), vec![30, 60, 75, 90, 100]);
    }

    #[test]
    fn finds_executable_in_macos_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("Contents").join("Home").join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("java"), b"").unwrap();
        assert_eq!(executable_in(dir.path()), Some(bin.join("java")));
        assert_eq!(executable_in(&dir.path().join("nope")), None);
    }

    #[test]
    fn flatten_hoists_single_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("java-17");
        fs::create_dir_all(root.join("jdk-17.0.9+9-jre").join("bin")).unwrap();
        fs::write(root.join("jdk-17.0.9+9-jre").join("bin").join("java"), b"").unwrap();
        flatten_single_root(&root).unwrap();
        assert!(root.join("bin").join("java").is_file());
        assert!(!root.join("jdk-17.0.9+9-jre").exists());
    }

    #[test]
    fn flatten_leaves_multi_entry_dirs_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("release"), b"").unwrap();
        flatten_single_root(dir.path()).unwrap();
        assert!(dir.path().join("bin").is_dir());
    }

    #[test]
    fn zip_archive_is_extracted_and_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("OpenJDK21U-jre.zip");
        {
            let f = fs::File::create(&zip_path).unwrap();
            let mut w = zip::ZipWriter::new(f);
            let opts = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
            w.start_file("jdk-21.0.2-jre/bin/java", opts).unwrap();
            w.write_all(b"#!/bin/sh\n").unwrap();
            w.start_file("jdk-21.0.2-jre/release", opts).unwrap();
            w.write_all(b"JAVA_VERSION=\"21.0.2\"\n").unwrap();
            w.finish().unwrap();
        }
        let dest = dir.path().join("out");
        extract_archive(&zip_path, &dest).unwrap();
        assert!(executable_in(&dest).is_some());
        assert!(dest.join("release").is_file());
    }

    #[test]
    fn link_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), "http://127.0.0.1:9").unwrap();
        r.link_server(Path::new("/srv/mc"), "1.20.1", Path::new("/usr/bin/java"));
        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(LINK_FILE)).unwrap()).unwrap();
        let entry = &raw["servers"]["/srv/mc"];
        assert_eq!(entry["minecraft_version"], "1.20.1");
        assert_eq!(entry["java_path"], "/usr/bin/java");
        assert_eq!(entry["java_version"], 17);
        assert!(raw["java_installations"].is_object());
    }

    #[cfg(unix)]
    fn fake_java(path: &Path, version_line: &str, code: i32) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            path,
            format!("#!/bin/sh\necho '{version_line}' >&2\nexit {code}\n"),
        )
        .unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_install_is_used_then_linked() {
        let dir = tempfile::tempdir().unwrap();
        let server = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), "http://127.0.0.1:9").unwrap();
        let exe = r.install_dir(17).join("bin").join("java");
        fake_java(&exe, "openjdk version \"17.0.9\" 2023-10-17", 0);

        let first = r.resolve(server.path(), "1.20.1", false, &|_| {}).await.unwrap();
        assert_eq!(first.source, RuntimeSource::Local);
        assert_eq!(first.major_version, 17);
        assert_eq!(first.executable_path, exe);

        let second = r.resolve(server.path(), "1.20.1", false, &|_| {}).await.unwrap();
        assert_eq!(second.source, RuntimeSource::Linked);
        assert_eq!(r.list_installed().get(&17), Some(&r.install_dir(17)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_local_install_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let server = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), "http://127.0.0.1:9").unwrap();
        let exe = r.install_dir(21).join("bin").join("java");
        fake_java(&exe, "Error: could not open lib/modules", 1);

        // A suitable system runtime may or may not exist on this host.
        match r.resolve(server.path(), "1.21", false, &|_| {}).await {
            Ok(desc) => {
                assert_eq!(desc.source, RuntimeSource::System);
                assert!(desc.repaired);
            }
            Err(err) => assert_eq!(err.code(), "launch_failure"),
        }
        assert!(!r.install_dir(21).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cleanup_removes_unlinked_installs() {
        let dir = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), "http://127.0.0.1:9").unwrap();
        fake_java(&r.install_dir(8).join("bin").join("java"), "java version \"1.8.0_402\"", 0);
        fake_java(&r.install_dir(17).join("bin").join("java"), "openjdk version \"17.0.9\"", 0);
        r.link_server(Path::new("/srv/a"), "1.18.2", Path::new("/x/java"));

        let removed = r.cleanup_unused().await.unwrap();
        assert_eq!(removed, vec![8]);
        assert!(r.install_dir(17).exists());
        assert!(!r.install_dir(8).exists());
    }

    #[cfg(unix)]
    fn fake_runtime_tgz() -> Vec<u8> {
        let script = b"#!/bin/sh\necho 'openjdk version \"21.0.2\" 2024-01-16' >&2\n";
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "jdk-21.0.2+13-jre/bin/java", &script[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Serves the asset listing and the archive over plain HTTP.
    #[cfg(unix)]
    async fn fake_api(archive: Vec<u8>, checksum: String) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let link = format!("{base}/download/OpenJDK21U-jre.tar.gz");
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut req = Vec::new();
                let mut buf = [0u8; 1024];
                while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    req.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&req).to_string();
                let (ctype, body) = if head.starts_with("GET /v3/assets/latest/21/hotspot?") {
                    let json = serde_json::json!([{
                        "binary": {"package": {
                            "link": link,
                            "name": "OpenJDK21U-jre.tar.gz",
                            "checksum": checksum,
                            "size": archive.len()
                        }}
                    }]);
                    ("application/json", serde_json::to_vec(&json).unwrap())
                } else {
                    ("application/octet-stream", archive.clone())
                };
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: {ctype}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                sock.write_all(&body).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        format!("{base}/v3")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn downloads_verifies_and_installs() {
        let archive = fake_runtime_tgz();
        let checksum = hex::encode(Sha256::digest(&archive));
        let api = fake_api(archive, checksum).await;

        let dir = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), api).unwrap();
        let seen = std::sync::Mutex::new(Vec::<u8>::new());
        let exe = r
            .ensure_installed(21, &|p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(exe, r.install_dir(21).join("bin").join("java"));
        assert_eq!(r.probe(&exe).await, Some(21));
        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.contains(&90));
        assert_eq!(
            r.load_links().java_installations.get("21"),
            Some(&r.install_dir(21).to_string_lossy().to_string())
        );
        assert!(!dir.path().join("OpenJDK21U-jre.tar.gz").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn checksum_mismatch_is_a_download_failure() {
        let archive = fake_runtime_tgz();
        let api = fake_api(archive, "00".repeat(32)).await;

        let dir = tempfile::tempdir().unwrap();
        let r = RuntimeResolver::new(dir.path(), api).unwrap();
        let err = r.ensure_installed(21, &|_| {}).await.unwrap_err();
        assert_eq!(err.code(), "runtime_download_failure");
        assert!(err.to_string().contains("sha256 mismatch"));
        assert!(!r.install_dir(21).exists());
    }
}
