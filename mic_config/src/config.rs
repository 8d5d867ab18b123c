use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engineering tunables for the audio core. These are not user preferences —
/// no endpoint identity, volume, or mute state lives here — they are the
/// timing constants the coordinator, cache, poller, and meter rely on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Snapshot cache TTL, milliseconds.
    pub cache_ttl_ms: u64,
    /// Trailing-edge debounce window for default-device changes, milliseconds.
    pub debounce_ms: u64,
    /// External-state poller period, milliseconds.
    pub poll_period_ms: u64,
    /// Meter emission throttle, milliseconds. Must be in [8, 16].
    pub meter_throttle_ms: u64,
    /// Exponential release time constant for smoothed dB, milliseconds.
    pub peak_release_ms: u64,
    /// Peak-hold duration before decay begins, milliseconds.
    pub peak_hold_ms: u64,
    /// Peak decay rate once the hold expires, dB/s.
    pub peak_decay_db_per_s: f64,
    /// Bounded join timeout for the apartment worker's dispose(), milliseconds.
    pub apartment_dispose_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 100,
            debounce_ms: 50,
            poll_period_ms: 1000,
            meter_throttle_ms: 16,
            peak_release_ms: 300,
            peak_hold_ms: 5000,
            peak_decay_db_per_s: 20.0,
            apartment_dispose_timeout_ms: 1000,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(8..=16).contains(&self.meter_throttle_ms) {
            bail!(
                "meter_throttle_ms must be in [8, 16], got {}",
                self.meter_throttle_ms
            );
        }
        if self.cache_ttl_ms == 0 {
            bail!("cache_ttl_ms must be positive");
        }
        if self.debounce_ms == 0 {
            bail!("debounce_ms must be positive");
        }
        if self.poll_period_ms == 0 {
            bail!("poll_period_ms must be positive");
        }
        if self.peak_release_ms == 0 {
            bail!("peak_release_ms must be positive");
        }
        if self.peak_decay_db_per_s <= 0.0 {
            bail!("peak_decay_db_per_s must be positive");
        }
        if self.apartment_dispose_timeout_ms == 0 {
            bail!("apartment_dispose_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Manager providing thread-safe access and optional TOML persistence for
/// `CoreConfig`. Most embedders just construct `CoreConfig::default()` and
/// never touch this; it exists for the cases where tunables should live in
/// a file (e.g. tuning debounce on unusually slow hardware).
pub struct ConfigManager {
    path: PathBuf,
    inner: Arc<RwLock<CoreConfig>>,
}

impl ConfigManager {
    /// Load config from given base path (parent directory), or from default directory if None.
    /// If file does not exist, a default config is created and written.
    pub fn load(basepath: Option<PathBuf>) -> Result<Self> {
        let config_dir = basepath.unwrap_or_else(default_config_dir);
        let config_path = config_dir.join("mic_core.toml");

        if config_path.exists() {
            let s = fs::read_to_string(&config_path)
                .with_context(|| format!("reading config file: {}", config_path.display()))?;
            let cfg: CoreConfig = toml::from_str(&s).context("parsing TOML config")?;
            cfg.validate()?;
            Ok(Self {
                path: config_path,
                inner: Arc::new(RwLock::new(cfg)),
            })
        } else {
            // create parent dir if needed
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("creating config dir: {}", config_dir.display()))?;

            let cfg = CoreConfig::default();
            let toml_str = toml::to_string_pretty(&cfg).context("serializing default config")?;
            let mut f = fs::File::create(&config_path)
                .with_context(|| format!("creating config file: {}", config_path.display()))?;
            f.write_all(toml_str.as_bytes())?;
            Ok(Self {
                path: config_path,
                inner: Arc::new(RwLock::new(cfg)),
            })
        }
    }

    /// Save current config to disk atomically.
    pub fn save(&self) -> Result<()> {
        let cfg = *self.inner.read();
        cfg.validate()?;
        let tmp = self.path.with_extension("toml.tmp");
        let s = toml::to_string_pretty(&cfg).context("serializing config")?;
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating tmp config file: {}", tmp.display()))?;
        f.write_all(s.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "renaming tmp config {} -> {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    /// Returns a cloneable handle to the inner Arc<RwLock<CoreConfig>> to allow reads/writes.
    pub fn handle(&self) -> Arc<RwLock<CoreConfig>> {
        self.inner.clone()
    }

    /// Mutates the config in place and persists the result. Rolls back the
    /// in-memory value if the mutated config fails validation or the write
    /// fails.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CoreConfig),
    {
        let previous = *self.inner.read();
        {
            let mut cfg = self.inner.write();
            f(&mut cfg);
        }
        match self.save() {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.inner.write() = previous;
                Err(e)
            }
        }
    }

    /// Access path used for persistence (useful for tests)
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn default_config_dir() -> PathBuf {
    // Use the directory where the executable is located
    std::env::current_exe()
        .ok()
        .and_then(|exe_path| exe_path.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| Path::new(".").to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_throttle() {
        let mut cfg = CoreConfig::default();
        cfg.meter_throttle_ms = 32;
        assert!(cfg.validate().is_err());

        cfg.meter_throttle_ms = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialize_deserialize() {
        let cfg = CoreConfig {
            debounce_ms: 75,
            ..CoreConfig::default()
        };
        let s = toml::to_string_pretty(&cfg).expect("serialize");
        let decoded: CoreConfig = toml::from_str(&s).expect("deserialize");
        assert_eq!(decoded.debounce_ms, 75);
    }

    #[test]
    fn load_creates_default_file() {
        let td = tempdir().unwrap();
        let config_dir = td.path().to_path_buf();
        let expected_config_path = config_dir.join("mic_core.toml");
        assert!(!expected_config_path.exists());
        let mgr = ConfigManager::load(Some(config_dir)).expect("load");
        assert!(expected_config_path.exists());
        let cfg = mgr.handle();
        let c = *cfg.read();
        assert_eq!(c, CoreConfig::default());
    }

    #[test]
    fn update_persists_changes() {
        let td = tempdir().unwrap();
        let config_dir = td.path().to_path_buf();
        let expected_config_path = config_dir.join("mic_core.toml");
        let mgr = ConfigManager::load(Some(config_dir)).expect("load");
        mgr.update(|c| {
            c.debounce_ms = 80;
        })
        .expect("update");
        let s = fs::read_to_string(&expected_config_path).expect("read file");
        assert!(s.contains("debounce_ms = 80"));
    }

    #[test]
    fn update_rejects_invalid_value_and_rolls_back() {
        let td = tempdir().unwrap();
        let config_dir = td.path().to_path_buf();
        let mgr = ConfigManager::load(Some(config_dir)).expect("load");
        let res = mgr.update(|c| {
            c.meter_throttle_ms = 100;
        });
        assert!(res.is_err());
        assert_eq!(*mgr.handle().read(), CoreConfig::default());
    }
}
