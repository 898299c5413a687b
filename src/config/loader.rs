//! Locating, reading and writing `serial-transport.toml`.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use crate::port::{DataBits, Parity, ReadMode, StopBits, WriteMode};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SERIAL_TRANSPORT";

const CONFIG_FILE_NAME: &str = "serial-transport.toml";

/// Names a configuration file to use instead of the search path.
const CONFIG_PATH_ENV: &str = "SERIAL_TRANSPORT_CONFIG";

/// A [`Config`] together with the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// `None` when running on built-in defaults.
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl ConfigLoader {
    /// Find a configuration file, read it and apply environment overrides.
    ///
    /// The first existing file wins:
    /// 1. the path in `SERIAL_TRANSPORT_CONFIG`
    /// 2. `./serial-transport.toml`
    /// 3. `serial-transport.toml` in the platform config directory
    ///
    /// With no file the built-in defaults are used. `SERIAL_TRANSPORT_*`
    /// variables are applied on top either way.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();
        let config = match config_path {
            Some(ref path) => read_config(path)?,
            None => {
                let mut config = Config::default();
                apply_env_overrides(&mut config)?;
                validate(&config)?;
                config
            }
        };
        Ok(Self {
            config_path,
            config,
        })
    }

    /// Read `path`, ignoring the search path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        Ok(Self {
            config: read_config(path)?,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Built-in defaults plus environment overrides. Overrides that fail to
    /// parse or validate are dropped wholesale.
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        if apply_env_overrides(&mut config).is_err() || validate(&config).is_err() {
            config = Config::default();
        }
        Self {
            config_path: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Write the configuration back to the file it was loaded from.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self.config_path.as_ref().ok_or(ConfigError::NoPath)?;
        write_config(&self.config, path)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        write_config(&self.config, path.as_ref())
    }

    /// Re-read the backing file. A loader without one keeps its values.
    pub fn reload(&mut self) -> ConfigResult<()> {
        if let Some(path) = &self.config_path {
            self.config = read_config(path)?;
        }
        Ok(())
    }
}

/// The configuration file [`ConfigLoader::load`] would read, if any.
pub fn resolve_config_path() -> Option<PathBuf> {
    let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let local = Some(PathBuf::from(CONFIG_FILE_NAME));
    [explicit, local, get_default_config_path()]
        .into_iter()
        .flatten()
        .find(|path| path.is_file())
}

/// Per-user configuration directory, e.g. `~/.config/serial-transport`.
pub fn get_default_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "serial-transport")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Parse `path`, then apply overrides and validate.
fn read_config(path: &Path) -> ConfigResult<Config> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn write_config(config: &Config, path: &Path) -> ConfigResult<()> {
    let write_failed = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(write_failed)?;
    }
    let text = toml::to_string_pretty(config)?;
    std::fs::write(path, text).map_err(write_failed)
}

/// Check values the schema alone cannot constrain.
fn validate(config: &Config) -> ConfigResult<()> {
    config
        .serial
        .configuration()
        .validate()
        .map_err(|e| ConfigError::invalid("serial", e.to_string()))?;
    if !(1..=1000).contains(&config.events.tick_ms) {
        return Err(ConfigError::invalid(
            "events.tick_ms",
            "must be between 1 and 1000",
        ));
    }
    Ok(())
}

fn env_key(section: &str, key: &str) -> String {
    format!("{}_{}_{}", ENV_PREFIX, section, key)
}

/// Parse a number from the environment.
fn parse_env<T: std::str::FromStr>(var: &str, value: &str, what: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env(var, format!("Invalid {}", what)))
}

/// Parse an enum from the environment using its configuration-file spelling.
fn parse_env_enum<T: DeserializeOwned>(var: &str, value: &str) -> ConfigResult<T> {
    T::deserialize(toml::Value::String(value.trim().to_string()))
        .map_err(|e| ConfigError::env(var, e.to_string()))
}

/// Apply `SERIAL_TRANSPORT_<SECTION>_<KEY>` variables, e.g.
/// - `SERIAL_TRANSPORT_SERIAL_DEFAULT_BAUD=115200`
/// - `SERIAL_TRANSPORT_TIMEOUTS_READ_MODE=blocking`
/// - `SERIAL_TRANSPORT_LOGGING_LEVEL=debug`
///
/// The legacy hardware-test variable `TEST_BAUD` also sets the default baud.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    // Serial overrides (also support legacy TEST_BAUD)
    let var = env_key("SERIAL", "DEFAULT_BAUD");
    if let Ok(val) = std::env::var(&var).or_else(|_| std::env::var("TEST_BAUD")) {
        config.serial.default_baud = parse_env(&var, &val, "baud rate")?;
    }
    let var = env_key("SERIAL", "DATA_BITS");
    if let Ok(val) = std::env::var(&var) {
        let bits: u8 = parse_env(&var, &val, "data bits")?;
        config.serial.data_bits =
            DataBits::try_from(bits).map_err(|e| ConfigError::env(&var, e.to_string()))?;
    }
    let var = env_key("SERIAL", "PARITY");
    if let Ok(val) = std::env::var(&var) {
        config.serial.parity = parse_env_enum::<Parity>(&var, &val)?;
    }
    let var = env_key("SERIAL", "STOP_BITS");
    if let Ok(val) = std::env::var(&var) {
        config.serial.stop_bits = parse_env_enum::<StopBits>(&var, &val)?;
    }

    // Timeout overrides
    let var = env_key("TIMEOUTS", "READ_MODE");
    if let Ok(val) = std::env::var(&var) {
        config.timeouts.read_mode = parse_env_enum::<ReadMode>(&var, &val)?;
    }
    let var = env_key("TIMEOUTS", "READ_TIMEOUT_MS");
    if let Ok(val) = std::env::var(&var) {
        config.timeouts.read_timeout_ms = parse_env(&var, &val, "timeout")?;
    }
    let var = env_key("TIMEOUTS", "WRITE_MODE");
    if let Ok(val) = std::env::var(&var) {
        config.timeouts.write_mode = parse_env_enum::<WriteMode>(&var, &val)?;
    }
    let var = env_key("TIMEOUTS", "WRITE_TIMEOUT_MS");
    if let Ok(val) = std::env::var(&var) {
        config.timeouts.write_timeout_ms = parse_env(&var, &val, "timeout")?;
    }

    // Event overrides
    let var = env_key("EVENTS", "TICK_MS");
    if let Ok(val) = std::env::var(&var) {
        config.events.tick_ms = parse_env(&var, &val, "tick")?;
    }

    // Logging overrides
    if let Ok(val) = std::env::var(env_key("LOGGING", "LEVEL")) {
        config.logging.level = val;
    }
    let var = env_key("LOGGING", "FORMAT");
    if let Ok(val) = std::env::var(&var) {
        config.logging.format = parse_env_enum::<LogFormat>(&var, &val)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_default_loader() {
        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().serial.default_baud, 9600);
        assert!(loader.config_path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("SERIAL_TRANSPORT_SERIAL_DEFAULT_BAUD", "57600");
        env::set_var("SERIAL_TRANSPORT_TIMEOUTS_READ_MODE", "scanner");
        env::set_var("SERIAL_TRANSPORT_SERIAL_PARITY", "mark");

        let loader = ConfigLoader::with_defaults();

        env::remove_var("SERIAL_TRANSPORT_SERIAL_DEFAULT_BAUD");
        env::remove_var("SERIAL_TRANSPORT_TIMEOUTS_READ_MODE");
        env::remove_var("SERIAL_TRANSPORT_SERIAL_PARITY");

        assert_eq!(loader.config().serial.default_baud, 57600);
        assert_eq!(loader.config().timeouts.read_mode, ReadMode::Scanner);
        assert_eq!(loader.config().serial.parity, Parity::Mark);
    }

    #[test]
    #[serial]
    fn test_legacy_test_baud_env() {
        env::set_var("TEST_BAUD", "19200");

        let loader = ConfigLoader::with_defaults();

        env::remove_var("TEST_BAUD");
        assert_eq!(loader.config().serial.default_baud, 19200);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_reported() {
        env::set_var("SERIAL_TRANSPORT_SERIAL_DATA_BITS", "9");

        let mut config = Config::default();
        let result = apply_env_overrides(&mut config);

        env::remove_var("SERIAL_TRANSPORT_SERIAL_DATA_BITS");
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    #[serial]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut loader = ConfigLoader::with_defaults();
        loader.config_mut().serial.default_baud = 230400;
        loader
            .config_mut()
            .registry
            .aliases
            .insert("gps".to_string(), "/dev/ttyUSB3".to_string());
        loader.save_to(&path).unwrap();

        let mut reloaded = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(reloaded.config().serial.default_baud, 230400);
        assert_eq!(reloaded.config().registry.resolve_port("gps"), "/dev/ttyUSB3");

        std::fs::write(&path, "[serial]\ndefault_baud = 4800\n").unwrap();
        reloaded.reload().unwrap();
        assert_eq!(reloaded.config().serial.default_baud, 4800);
    }

    #[test]
    #[serial]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[events]\ntick_ms = 5000\n").unwrap();

        let result = ConfigLoader::load_from(&path);

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    #[serial]
    fn test_explicit_path_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[serial]\ndefault_baud = 38400\n").unwrap();
        env::set_var(CONFIG_PATH_ENV, &path);

        let resolved = resolve_config_path();

        env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(resolved, Some(path));
    }

    #[test]
    fn test_save_without_path_fails() {
        let loader = ConfigLoader {
            config_path: None,
            config: Config::default(),
        };
        assert!(matches!(loader.save(), Err(ConfigError::NoPath)));
    }
}
