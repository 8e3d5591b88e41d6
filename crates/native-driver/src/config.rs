//! Driver process configuration.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::encoding::Encoding;
use crate::error::ConfigError;

/// Conventional install location of a driver's native parser.
pub const DEFAULT_NATIVE_BINARY: &str = "/opt/driver/bin/native";

/// How long `close` waits for the driver to exit on its own.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long `start` watches a fresh driver for an early exit.
pub const DEFAULT_STARTUP_WINDOW: Duration = Duration::from_millis(100);

pub const ENV_BIN: &str = "NATIVE_DRIVER_BIN";
pub const ENV_ARGS: &str = "NATIVE_DRIVER_ARGS";
pub const ENV_ENCODING: &str = "NATIVE_DRIVER_ENCODING";
pub const ENV_TIMEOUT_MS: &str = "NATIVE_DRIVER_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub working_dir: Option<PathBuf>,
    pub encoding: Encoding,
    /// Applied to `parse` calls that bring no deadline of their own.
    pub timeout: Option<Duration>,
    pub close_grace: Duration,
    /// An exit within this window after spawn fails `start`.
    pub startup_window: Duration,
}

impl DriverConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            encoding: Encoding::default(),
            timeout: None,
            close_grace: DEFAULT_CLOSE_GRACE,
            startup_window: DEFAULT_STARTUP_WINDOW,
        }
    }

    pub fn native() -> Self {
        Self::new(DEFAULT_NATIVE_BINARY)
    }

    /// Load from `NATIVE_DRIVER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, using the `NATIVE_DRIVER_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let program = match lookup(ENV_BIN) {
            Some(bin) if bin.trim().is_empty() => return Err(ConfigError::MissingProgram),
            Some(bin) => PathBuf::from(bin),
            None => PathBuf::from(DEFAULT_NATIVE_BINARY),
        };

        let mut config = Self::new(program);

        if let Some(args) = lookup(ENV_ARGS) {
            config = config.with_args(args.split_whitespace());
        }
        if let Some(tag) = lookup(ENV_ENCODING) {
            config = config.with_encoding_tag(&tag)?;
        }
        if let Some(ms) = lookup(ENV_TIMEOUT_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(ms.clone()))?;
            if ms > 0 {
                config = config.with_timeout(Duration::from_millis(ms));
            }
        }

        Ok(config)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Select the encoding by its wire name. Unknown names are rejected here,
    /// before any driver is started.
    pub fn with_encoding_tag(self, tag: &str) -> Result<Self, ConfigError> {
        Ok(self.with_encoding(tag.parse()?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_startup_window(mut self, window: Duration) -> Self {
        self.startup_window = window;
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::native()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_target_native_binary() {
        let config = DriverConfig::default();
        assert_eq!(config.program, PathBuf::from(DEFAULT_NATIVE_BINARY));
        assert_eq!(config.encoding, Encoding::Utf8);
        assert!(config.timeout.is_none());
        assert_eq!(config.close_grace, DEFAULT_CLOSE_GRACE);
        assert_eq!(config.startup_window, DEFAULT_STARTUP_WINDOW);
    }

    #[test]
    fn builder_sets_fields() {
        let config = DriverConfig::new("/usr/bin/parser")
            .with_args(["--stdio", "--quiet"])
            .with_env("LANG", "C")
            .with_encoding(Encoding::Base64)
            .with_timeout(Duration::from_secs(2))
            .with_close_grace(Duration::from_millis(100))
            .with_startup_window(Duration::ZERO);

        assert_eq!(config.args, vec![OsString::from("--stdio"), OsString::from("--quiet")]);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.encoding, Encoding::Base64);
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.close_grace, Duration::from_millis(100));
        assert_eq!(config.startup_window, Duration::ZERO);
    }

    #[test]
    fn unknown_encoding_fails_at_construction() {
        let err = DriverConfig::new("parser")
            .with_encoding_tag("utf16")
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEncoding(_)));
    }

    #[test]
    fn loads_from_lookup() {
        let config = DriverConfig::from_lookup(lookup(&[
            (ENV_BIN, "/opt/driver/bin/python-native"),
            (ENV_ARGS, "--mode  stdio"),
            (ENV_ENCODING, "BASE64"),
            (ENV_TIMEOUT_MS, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.program, PathBuf::from("/opt/driver/bin/python-native"));
        assert_eq!(config.args, vec![OsString::from("--mode"), OsString::from("stdio")]);
        assert_eq!(config.encoding, Encoding::Base64);
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn empty_lookup_uses_defaults() {
        let config = DriverConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.program, PathBuf::from(DEFAULT_NATIVE_BINARY));
        assert!(config.args.is_empty());
    }

    #[test]
    fn zero_timeout_means_none() {
        let config = DriverConfig::from_lookup(lookup(&[(ENV_TIMEOUT_MS, "0")])).unwrap();
        assert!(config.timeout.is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            DriverConfig::from_lookup(lookup(&[(ENV_BIN, "  ")])),
            Err(ConfigError::MissingProgram)
        ));
        assert!(matches!(
            DriverConfig::from_lookup(lookup(&[(ENV_TIMEOUT_MS, "soon")])),
            Err(ConfigError::InvalidTimeout(_))
        ));
        assert!(matches!(
            DriverConfig::from_lookup(lookup(&[(ENV_ENCODING, "ebcdic")])),
            Err(ConfigError::UnknownEncoding(_))
        ));
    }
}
