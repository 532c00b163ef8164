use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use anyhow::Context;

pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_MAX_PLAYERS: u32 = 20;

const DEFAULT_PROPERTIES: &str = "#Minecraft server properties
motd=A Minecraft Server
max-players=20
online-mode=true
enable-command-block=false
spawn-protection=16
view-distance=10
simulation-distance=10
difficulty=easy
gamemode=survival
pvp=true
allow-flight=false
";

/// Read-only view of `server.properties`.
#[derive(Debug, Clone, Default)]
pub struct ServerProperties {
    values: BTreeMap<String, String>,
}

impl ServerProperties {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Self { values }
    }

    /// Missing or unreadable files read as empty.
    pub fn load(server_dir: &Path) -> Self {
        fs::read_to_string(server_dir.join("server.properties"))
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn server_port(&self) -> u16 {
        self.get("server-port")
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn max_players(&self) -> u32 {
        self.get("max-players")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_PLAYERS)
    }

    /// Address to probe; a blank `server-ip` means all interfaces.
    pub fn probe_host(&self) -> String {
        match self.get("server-ip") {
            Some(ip) if ip != "0.0.0.0" && ip != "::" => ip.to_string(),
            _ => "127.0.0.1".to_string(),
        }
    }
}

/// Writes a default `server.properties` when none exists. Returns whether it did.
pub fn ensure_default(server_dir: &Path) -> anyhow::Result<bool> {
    let path = server_dir.join("server.properties");
    if path.exists() {
        return Ok(false);
    }
    fs::write(&path, DEFAULT_PROPERTIES)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_and_skips_comments() {
        let p = ServerProperties::parse(
            "#Minecraft server properties\n#Sat Jan 01\nserver-port=25570\nmax-players = 8\nmotd=a=b\nserver-ip=\n",
        );
        assert_eq!(p.server_port(), 25570);
        assert_eq!(p.max_players(), 8);
        assert_eq!(p.get("motd"), Some("a=b"));
        assert_eq!(p.get("server-ip"), None);
        assert_eq!(p.probe_host(), "127.0.0.1");
    }

    #[test]
    fn defaults_when_missing_or_invalid() {
        let p = ServerProperties::parse("server-port=abc\nmax-players=-1\n");
        assert_eq!(p.server_port(), DEFAULT_PORT);
        assert_eq!(p.max_players(), DEFAULT_MAX_PLAYERS);

        let dir = tempfile::tempdir().unwrap();
        let p = ServerProperties::load(dir.path());
        assert_eq!(p.server_port(), DEFAULT_PORT);
    }

    #[test]
    fn ensure_default_only_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_default(dir.path()).unwrap());
        fs::write(dir.path().join("server.properties"), "max-players=3\n").unwrap();
        assert!(!ensure_default(dir.path()).unwrap());
        assert_eq!(ServerProperties::load(dir.path()).max_players(), 3);
    }
}
