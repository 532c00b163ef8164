use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

/// Checked in order; anything else falls back to the first jar by name.
const PREFERRED_JARS: &[&str] = &[
    "server.jar",
    "minecraft_server.jar",
    "paper.jar",
    "spigot.jar",
    "fabric-server-launch.jar",
];

/// Passed only to runtimes new enough to understand them.
const COMPAT_FLAGS: &[&str] = &[
    "--add-modules=jdk.incubator.vector",
    "--enable-native-access=ALL-UNNAMED",
    "-XX:+UnlockExperimentalVMOptions",
    "--add-exports=java.base/sun.security.util=ALL-UNNAMED",
    "--add-opens=java.base/java.util.jar=ALL-UNNAMED",
    "--add-opens=java.base/java.lang=ALL-UNNAMED",
    "--add-opens=java.base/java.util=ALL-UNNAMED",
    "--add-opens=java.base/java.lang.invoke=ALL-UNNAMED",
    "--add-opens=java.base/java.lang.reflect=ALL-UNNAMED",
    "--add-opens=java.base/java.text=ALL-UNNAMED",
    "--add-opens=java.desktop/java.awt.font=ALL-UNNAMED",
    "--add-opens=java.base/java.nio=ALL-UNNAMED",
    "--add-opens=java.base/sun.nio.ch=ALL-UNNAMED",
    "--add-opens=java.management/sun.management=ALL-UNNAMED",
    "--add-opens=jdk.management/com.sun.management.internal=ALL-UNNAMED",
];
const COMPAT_FLAGS_MIN_MAJOR: u32 = 17;

#[cfg(windows)]
const LAUNCH_SCRIPT: &str = "run.bat";
#[cfg(not(windows))]
const LAUNCH_SCRIPT: &str = "run.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Script,
    Jar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: LaunchKind,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    pub fn command_line(&self) -> String {
        let mut out = self.exec.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    Script(PathBuf),
    Jar(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSize {
    pub min: u32,
    pub max: u32,
    pub unit: char,
}

impl HeapSize {
    fn flags(&self) -> [String; 2] {
        [
            format!("-Xmx{}{}", self.max.max(self.min), self.unit),
            format!("-Xms{}{}", self.min, self.unit),
        ]
    }
}

fn jars_in(dir: &Path) -> Vec<PathBuf> {
    let rd = match fs::read_dir(dir) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let mut out: Vec<PathBuf> = rd
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
        })
        .collect();
    out.sort();
    out
}

fn lower_file_name(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn find_server_jar(dir: &Path) -> Option<PathBuf> {
    let all = jars_in(dir);
    let candidates: Vec<&PathBuf> = all
        .iter()
        .filter(|p| !lower_file_name(p).contains("installer"))
        .collect();

    if candidates.is_empty() {
        // Only installers present; run one rather than refusing.
        return all.into_iter().next();
    }

    for name in PREFERRED_JARS {
        if let Some(p) = candidates.iter().find(|p| lower_file_name(p) == *name) {
            return Some((*p).clone());
        }
    }
    candidates.first().map(|p| (*p).clone())
}

pub fn find_launch_script(dir: &Path) -> Option<PathBuf> {
    let p = dir.join(LAUNCH_SCRIPT);
    p.is_file().then_some(p)
}

/// A launch script wins over any jar.
pub fn find_entry_point(dir: &Path) -> anyhow::Result<EntryPoint> {
    if !dir.is_dir() {
        anyhow::bail!("server directory does not exist: {}", dir.display());
    }
    if let Some(script) = find_launch_script(dir) {
        return Ok(EntryPoint::Script(script));
    }
    if let Some(jar) = find_server_jar(dir) {
        return Ok(EntryPoint::Jar(jar));
    }
    anyhow::bail!(
        "no server .jar file or {LAUNCH_SCRIPT} found in {}",
        dir.display()
    );
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(p).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

pub fn script_command(script: &Path, cwd: &Path) -> LaunchSpec {
    let script_str = script.to_string_lossy().to_string();

    #[cfg(unix)]
    {
        if !is_executable(script) {
            return LaunchSpec {
                exec: "sh".to_string(),
                args: vec![script_str, "--nogui".to_string()],
                kind: LaunchKind::Script,
                cwd: cwd.to_path_buf(),
            };
        }
    }

    LaunchSpec {
        exec: script_str,
        args: vec!["--nogui".to_string()],
        kind: LaunchKind::Script,
        cwd: cwd.to_path_buf(),
    }
}

pub fn java_command(
    java: &Path,
    java_major: Option<u32>,
    jar: &Path,
    heap: HeapSize,
    cwd: &Path,
) -> LaunchSpec {
    let mut args: Vec<String> = heap.flags().into_iter().collect();
    if java_major.is_some_and(|m| m >= COMPAT_FLAGS_MIN_MAJOR) {
        args.extend(COMPAT_FLAGS.iter().map(|s| s.to_string()));
    }

    // Relative to cwd when possible, to keep the command line short.
    let jar_arg = jar
        .strip_prefix(cwd)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| jar.to_string_lossy().to_string());
    args.push("-jar".to_string());
    args.push(jar_arg);
    args.push("--nogui".to_string());

    LaunchSpec {
        exec: java.to_string_lossy().to_string(),
        args,
        kind: LaunchKind::Jar,
        cwd: cwd.to_path_buf(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EulaOutcome {
    AlreadyAccepted,
    Accepted,
    Created,
}

pub fn accept_eula(dir: &Path) -> anyhow::Result<EulaOutcome> {
    let path = dir.join("eula.txt");
    match fs::read_to_string(&path) {
        Ok(content) if content.contains("eula=true") => Ok(EulaOutcome::AlreadyAccepted),
        Ok(_) => {
            fs::write(&path, b"eula=true\n")
                .with_context(|| format!("write {}", path.display()))?;
            Ok(EulaOutcome::Accepted)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(&path, b"eula=true\n")
                .with_context(|| format!("write {}", path.display()))?;
            Ok(EulaOutcome::Created)
        }
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, b"x").unwrap();
        p
    }

    #[test]
    fn prefers_known_jar_names_and_skips_installers() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "aaa-forge-installer.jar");
        touch(dir.path(), "mods-helper.jar");
        let paper = touch(dir.path(), "paper.jar");
        assert_eq!(find_server_jar(dir.path()), Some(paper));

        let server = touch(dir.path(), "server.jar");
        assert_eq!(find_server_jar(dir.path()), Some(server));
    }

    #[test]
    fn falls_back_to_first_jar_then_installer() {
        let dir = tempfile::tempdir().unwrap();
        let installer = touch(dir.path(), "forge-installer.jar");
        assert_eq!(find_server_jar(dir.path()), Some(installer));

        let b = touch(dir.path(), "b.jar");
        touch(dir.path(), "c.jar");
        assert_eq!(find_server_jar(dir.path()), Some(b));
    }

    #[test]
    fn launch_script_wins_over_jar() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "server.jar");
        let script = touch(dir.path(), LAUNCH_SCRIPT);
        assert_eq!(
            find_entry_point(dir.path()).unwrap(),
            EntryPoint::Script(script)
        );
    }

    #[test]
    fn empty_dir_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "readme.txt");
        let err = find_entry_point(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no server .jar"));
    }

    #[test]
    fn java_command_layout() {
        let dir = tempfile::tempdir().unwrap();
        let jar = touch(dir.path(), "server.jar");
        let heap = HeapSize {
            min: 2,
            max: 4,
            unit: 'G',
        };
        let spec = java_command(Path::new("/opt/java/bin/java"), Some(21), &jar, heap, dir.path());
        assert_eq!(spec.exec, "/opt/java/bin/java");
        assert_eq!(&spec.args[..2], &["-Xmx4G".to_string(), "-Xms2G".to_string()]);
        assert!(spec.args.iter().any(|a| a == "--add-modules=jdk.incubator.vector"));
        let n = spec.args.len();
        assert_eq!(
            &spec.args[n - 3..],
            &["-jar".to_string(), "server.jar".to_string(), "--nogui".to_string()]
        );

        let legacy = java_command(Path::new("java"), Some(8), &jar, heap, dir.path());
        assert_eq!(legacy.args.len(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_script_runs_through_sh() {
        let dir = tempfile::tempdir().unwrap();
        let script = touch(dir.path(), "run.sh");
        let spec = script_command(&script, dir.path());
        assert_eq!(spec.exec, "sh");
        assert_eq!(spec.args.last().map(String::as_str), Some("--nogui"));
    }

    #[test]
    fn eula_is_accepted_once() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(accept_eula(dir.path()).unwrap(), EulaOutcome::Created);
        assert_eq!(accept_eula(dir.path()).unwrap(), EulaOutcome::AlreadyAccepted);
        fs::write(dir.path().join("eula.txt"), "eula=false\n").unwrap();
        assert_eq!(accept_eula(dir.path()).unwrap(), EulaOutcome::Accepted);
        assert_eq!(
            fs::read_to_string(dir.path().join("eula.txt")).unwrap(),
            "eula=true\n"
        );
    }
}
