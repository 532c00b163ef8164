use std::{path::PathBuf, time::Duration};

const DEFAULT_RUNTIME_API_URL: &str = "https://api.adoptium.net/v3";

/// Agent-wide tunables, read once from `COBBLE_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub runtime_api_url: String,
    /// Warn (not kill) when a graceful stop outlives this.
    pub stop_watchdog: Duration,
    /// Force-kill this long after the world-saved signal if still running.
    pub saved_kill_grace: Duration,
    pub stats_cache: Duration,
    pub status_cache: Duration,
    pub probe_timeout: Duration,
    pub list_cooldown: Duration,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub capacity: usize,
    pub batch_max: usize,
    pub batch_window: Duration,
    pub delivery_timeout: Duration,
    pub history_per_server: usize,
    pub history_global: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            batch_max: 64,
            batch_window: Duration::from_millis(50),
            delivery_timeout: Duration::from_millis(2000),
            history_per_server: 1000,
            history_global: 500,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |name: &str| -> Option<u64> {
            lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
        };
        let ms = |name: &str, default: u64, lo: u64, hi: u64| {
            Duration::from_millis(num(name).map(|v| v.clamp(lo, hi)).unwrap_or(default))
        };
        let secs = |name: &str, default: u64, lo: u64, hi: u64| {
            Duration::from_secs(num(name).map(|v| v.clamp(lo, hi)).unwrap_or(default))
        };
        let count = |name: &str, default: u64, lo: u64, hi: u64| {
            num(name).map(|v| v.clamp(lo, hi)).unwrap_or(default) as usize
        };

        let data_root = absolutize(
            lookup("COBBLE_DATA_ROOT")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "./data".to_string()),
        );

        let runtime_api_url = lookup("COBBLE_RUNTIME_API_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RUNTIME_API_URL.to_string());

        Self {
            data_root,
            runtime_api_url,
            stop_watchdog: secs("COBBLE_STOP_WATCHDOG_SEC", 30, 5, 600),
            saved_kill_grace: secs("COBBLE_SAVED_KILL_GRACE_SEC", 7, 1, 120),
            stats_cache: ms("COBBLE_STATS_CACHE_MS", 3000, 250, 60_000),
            status_cache: ms("COBBLE_STATUS_CACHE_MS", 4000, 250, 60_000),
            probe_timeout: ms("COBBLE_PROBE_TIMEOUT_MS", 600, 100, 5000),
            list_cooldown: ms("COBBLE_LIST_COOLDOWN_MS", 4000, 500, 60_000),
            bus: BusConfig {
                capacity: count("COBBLE_BUS_CAPACITY", 2048, 16, 65_536),
                batch_max: count("COBBLE_BUS_BATCH_MAX", 64, 1, 4096),
                batch_window: ms("COBBLE_BUS_BATCH_WINDOW_MS", 50, 1, 5000),
                delivery_timeout: ms("COBBLE_BUS_DELIVERY_TIMEOUT_MS", 2000, 50, 60_000),
                history_per_server: count("COBBLE_HISTORY_PER_SERVER", 1000, 10, 50_000),
                history_global: count("COBBLE_HISTORY_GLOBAL", 500, 10, 50_000),
            },
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.data_root.join("runtimes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

fn absolutize(raw: String) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // The directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Per-server launch settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_path: Option<PathBuf>,
    pub minecraft_version: Option<String>,
    pub ram_min: u32,
    pub ram_max: u32,
    /// Heap unit suffix, `M` or `G`.
    pub ram_unit: char,
    pub java_path: Option<PathBuf>,
    pub allow_runtime_download: bool,
    pub accept_eula: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_path: None,
            minecraft_version: None,
            ram_min: 2,
            ram_max: 4,
            ram_unit: 'G',
            java_path: None,
            allow_runtime_download: true,
            accept_eula: true,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |name: &str, default: bool| match text(name)
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            Some("1") | Some("true") | Some("yes") | Some("on") => true,
            Some("0") | Some("false") | Some("no") | Some("off") => false,
            _ => default,
        };

        let defaults = Self::default();
        let ram_min = text("COBBLE_RAM_MIN")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.ram_min);
        let ram_max = text("COBBLE_RAM_MAX")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.ram_max)
            .max(ram_min);
        let ram_unit = match text("COBBLE_RAM_UNIT").as_deref() {
            Some("M") | Some("m") => 'M',
            _ => 'G',
        };

        Self {
            server_path: text("COBBLE_SERVER_PATH").map(PathBuf::from),
            minecraft_version: text("COBBLE_MC_VERSION"),
            ram_min,
            ram_max,
            ram_unit,
            java_path: text("COBBLE_JAVA_PATH").map(PathBuf::from),
            allow_runtime_download: flag("COBBLE_ALLOW_RUNTIME_DOWNLOAD", true),
            accept_eula: flag("COBBLE_ACCEPT_EULA", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = AgentConfig::from_lookup(|_| None);
        assert_eq!(cfg.stop_watchdog, Duration::from_secs(30));
        assert_eq!(cfg.saved_kill_grace, Duration::from_secs(7));
        assert_eq!(cfg.probe_timeout, Duration::from_millis(600));
        assert_eq!(cfg.bus.capacity, 2048);
        assert_eq!(cfg.bus.history_global, 500);
        assert_eq!(cfg.runtime_api_url, DEFAULT_RUNTIME_API_URL);
        assert!(cfg.data_root.is_absolute());
    }

    #[test]
    fn values_are_clamped() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("COBBLE_STOP_WATCHDOG_SEC", "1"),
            ("COBBLE_SAVED_KILL_GRACE_SEC", "100000"),
            ("COBBLE_BUS_CAPACITY", "2"),
            ("COBBLE_PROBE_TIMEOUT_MS", "garbage"),
        ]));
        assert_eq!(cfg.stop_watchdog, Duration::from_secs(5));
        assert_eq!(cfg.saved_kill_grace, Duration::from_secs(120));
        assert_eq!(cfg.bus.capacity, 16);
        assert_eq!(cfg.probe_timeout, Duration::from_millis(600));
    }

    #[test]
    fn api_url_trailing_slash_is_trimmed() {
        let cfg = AgentConfig::from_lookup(lookup(&[(
            "COBBLE_RUNTIME_API_URL",
            "http://127.0.0.1:9/v3/",
        )]));
        assert_eq!(cfg.runtime_api_url, "http://127.0.0.1:9/v3");
    }

    #[test]
    fn server_settings_parse_flags_and_heap() {
        let s = ServerSettings::from_lookup(lookup(&[
            ("COBBLE_SERVER_PATH", "/srv/mc"),
            ("COBBLE_RAM_MIN", "6"),
            ("COBBLE_RAM_MAX", "3"),
            ("COBBLE_RAM_UNIT", "m"),
            ("COBBLE_ACCEPT_EULA", "no"),
        ]));
        assert_eq!(s.server_path, Some(PathBuf::from("/srv/mc")));
        assert_eq!(s.ram_min, 6);
        assert_eq!(s.ram_max, 6);
        assert_eq!(s.ram_unit, 'M');
        assert!(!s.accept_eula);
        assert!(s.allow_runtime_download);
    }
}
