use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResponderError, Result};

/// Top level configuration, loaded from a TOML file and overridable with
/// `NSSRESPD_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Path of the unix socket clients connect to.
    pub socket_path: PathBuf,

    /// Path of the shared-memory cache file.
    pub mcache_path: PathBuf,

    /// Path of the persistent (sled) cache directory.
    pub sysdb_path: PathBuf,

    pub domains: Vec<DomainConfig>,

    pub negcache: NegCacheConfig,

    pub mcache: McacheConfig,

    pub enumeration: EnumConfig,

    pub provider: ProviderConfig,

    /// Global shell override/veto/allow-list policy, applied after a
    /// domain's own `override_shell`/`default_shell`.
    #[serde(default)]
    pub shell_policy: ShellConfig,

    /// Bind address for the `/metrics` and `/healthz` HTTP endpoints.
    pub http_bind_addr: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub domain_sid: Option<String>,
    pub id_min: u32,
    pub id_max: u32,
    #[serde(default)]
    pub enumerate: bool,
    #[serde(default)]
    pub fqnames: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub mpg: bool,
    pub override_gid: Option<u32>,
    pub override_homedir: Option<String>,
    pub fallback_homedir: Option<String>,
    pub override_shell: Option<String>,
    pub default_shell: Option<String>,
    #[serde(default)]
    pub subdomains: Vec<DomainConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegCacheConfig {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for NegCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McacheConfig {
    pub slot_count: u32,
    pub slot_size: u32,
}

impl Default for McacheConfig {
    fn default() -> Self {
        Self {
            slot_count: 8192,
            slot_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumConfig {
    #[serde(with = "duration_secs")]
    pub snapshot_ttl: Duration,
}

impl Default for EnumConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub refresh_window: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            refresh_window: Duration::from_secs(5),
        }
    }
}

/// Global-tier shell policy (spec's "shell override/veto/allow-list"):
/// applied to every domain after its own `override_shell`/`default_shell`
/// have had first say.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Overrides every record's resolved shell unconditionally.
    pub override_shell: Option<String>,
    /// Shells that must never be handed back verbatim; replaced by
    /// `shell_fallback` when matched.
    pub vetoed_shells: Vec<String>,
    /// When non-empty, only these shells (plus anything read from
    /// `shells_file`) may pass through unmodified; anything else falls
    /// back to `shell_fallback`.
    pub allowed_shells: Vec<String>,
    /// `/etc/shells`-equivalent file merged into `allowed_shells` at load
    /// time: one shell per line, blank lines and `#` comments ignored.
    pub shells_file: Option<PathBuf>,
    /// Substituted for a vetoed or disallowed shell. Falls back to the
    /// domain's `default_shell`, then to `NOLOGIN_SHELL`, if unset.
    pub shell_fallback: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            override_shell: None,
            vetoed_shells: Vec::new(),
            allowed_shells: Vec::new(),
            shells_file: None,
            shell_fallback: None,
        }
    }
}

impl ShellConfig {
    /// Reads `shells_file`, if configured, and merges its entries into
    /// `allowed_shells`. Called once at config load time so shell
    /// resolution later stays a pure, file-system-free function.
    fn merge_shells_file(&mut self) -> Result<()> {
        let Some(path) = &self.shells_file else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResponderError::Config(format!("reading {}: {e}", path.display())))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !self.allowed_shells.iter().any(|s| s == line) {
                self.allowed_shells.push(line.to_string());
            }
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/nssrespd/pipe"),
            mcache_path: PathBuf::from("/var/lib/nssrespd/mc/passwd.cache"),
            sysdb_path: PathBuf::from("/var/lib/nssrespd/db"),
            domains: Vec::new(),
            negcache: NegCacheConfig::default(),
            mcache: McacheConfig::default(),
            enumeration: EnumConfig::default(),
            provider: ProviderConfig::default(),
            shell_policy: ShellConfig::default(),
            http_bind_addr: None,
        }
    }
}

impl ResponderConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResponderError::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: ResponderConfig = toml::from_str(&text)
            .map_err(|e| ResponderError::Config(format!("parsing {}: {e}", path.display())))?;
        cfg.apply_env_overrides();
        cfg.shell_policy.merge_shells_file()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NSSRESPD_SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NSSRESPD_SYSDB_PATH") {
            self.sysdb_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NSSRESPD_HTTP_BIND_ADDR")
            && let Ok(addr) = v.parse()
        {
            self.http_bind_addr = Some(addr);
        }
    }

    pub fn validate(&self) -> Result<()> {
        for d in &self.domains {
            d.validate()?;
        }
        if self.mcache.slot_count == 0 {
            return Err(ResponderError::Config(
                "mcache.slot_count must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl DomainConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ResponderError::Config("domain name must not be empty".into()));
        }
        if self.id_min > self.id_max {
            return Err(ResponderError::Config(format!(
                "domain {}: id_min > id_max",
                self.name
            )));
        }
        for sub in &self.subdomains {
            sub.validate()?;
        }
        Ok(())
    }
}
