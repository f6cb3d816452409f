//! Configuration loading and merging for kiln.
//!
//! Sources, from least to most significant:
//! - local configuration (`<ROOT>/.kiln/config.json`)
//! - environment variables (`KILN_*`)
//! - values set on [`KilnConfigBuilder`]

mod env;
mod file;

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    io,
    str::FromStr,
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use env::EnvVars;
use file::ConfigFile;
use kiln_types::ContinueMode;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_DIR: &str = ".kiln";
pub const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_WORKSPACE_MAX_AGE_DAYS: u64 = 7;
pub const DEFAULT_WORKSPACE_MAX_ENTRIES: usize = 1000;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Encountered an I/O error while attempting to read {config_path}: {error}")]
    FailedToReadConfig {
        config_path: Utf8PathBuf,
        error: io::Error,
    },
    #[error("Invalid configuration in {config_path}: {error}")]
    InvalidConfigFile {
        config_path: Utf8PathBuf,
        #[source]
        error: serde_json::Error,
    },
    #[error("{0} is not UTF8.")]
    Encoding(String),
    #[error("KILN_CONCURRENCY: Invalid value. Use a number of workers.")]
    InvalidConcurrency(#[source] std::num::ParseIntError),
    #[error("Concurrency must be at least 1.")]
    #[diagnostic(help("use 1 to run one node at a time"))]
    ZeroConcurrency,
    #[error("KILN_CONTINUE should be one of: always, never.")]
    InvalidContinue,
    #[error("Invalid cache setting '{0}'.")]
    #[diagnostic(help("use one of: rw, r, w, off"))]
    InvalidCache(String),
    #[error("KILN_WORKSPACE_MAX_AGE_DAYS: Invalid value. Use a number of days.")]
    InvalidWorkspaceMaxAge(#[source] std::num::ParseIntError),
    #[error("KILN_WORKSPACE_MAX_ENTRIES: Invalid value. Use a number of workspaces.")]
    InvalidWorkspaceMaxEntries(#[source] std::num::ParseIntError),
}

/// Whether the build cache may be read and written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct CacheConfig {
    pub read: bool,
    pub write: bool,
}

impl CacheConfig {
    pub fn enabled() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        !self.read && !self.write
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::enabled()
    }
}

impl FromStr for CacheConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (read, write) = match s {
            "rw" | "wr" => (true, true),
            "r" => (true, false),
            "w" => (false, true),
            "" | "off" => (false, false),
            _ => return Err(Error::InvalidCache(s.to_string())),
        };
        Ok(Self { read, write })
    }
}

impl TryFrom<String> for CacheConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// Not Serialize: callers that display the configuration pick what to show.
#[derive(Deserialize, Default, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationOptions {
    /// corresponds to env var KILN_CONCURRENCY
    pub concurrency: Option<usize>,
    /// corresponds to env var KILN_CONTINUE
    pub continue_mode: Option<ContinueMode>,
    /// corresponds to env var KILN_CACHE
    pub cache: Option<CacheConfig>,
    pub cache_dir: Option<Utf8PathBuf>,
    pub history_dir: Option<Utf8PathBuf>,
    pub workspace_dir: Option<Utf8PathBuf>,
    pub workspace_max_age_days: Option<u64>,
    pub workspace_max_entries: Option<usize>,
    pub resource_capacities: Option<BTreeMap<String, usize>>,
    pub run_summary: Option<bool>,
}

// Getters
impl ConfigurationOptions {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(num_cpus::get)
    }

    pub fn continue_mode(&self) -> ContinueMode {
        self.continue_mode.unwrap_or_default()
    }

    pub fn cache(&self) -> CacheConfig {
        self.cache.unwrap_or_default()
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        self.cache_dir
            .as_deref()
            .unwrap_or_else(|| Utf8Path::new(".kiln/cache"))
    }

    pub fn history_dir(&self) -> &Utf8Path {
        self.history_dir
            .as_deref()
            .unwrap_or_else(|| Utf8Path::new(".kiln/history"))
    }

    pub fn workspace_dir(&self) -> &Utf8Path {
        self.workspace_dir
            .as_deref()
            .unwrap_or_else(|| Utf8Path::new(".kiln/workspaces"))
    }

    pub fn workspace_max_age(&self) -> Duration {
        Duration::from_secs(
            self.workspace_max_age_days
                .unwrap_or(DEFAULT_WORKSPACE_MAX_AGE_DAYS)
                .saturating_mul(SECONDS_PER_DAY),
        )
    }

    pub fn workspace_max_entries(&self) -> usize {
        self.workspace_max_entries
            .unwrap_or(DEFAULT_WORKSPACE_MAX_ENTRIES)
    }

    pub fn resource_capacities(&self) -> BTreeMap<String, usize> {
        self.resource_capacities.clone().unwrap_or_default()
    }

    pub fn run_summary(&self) -> bool {
        self.run_summary.unwrap_or_default()
    }

    /// Fills every unset option from `other`.
    fn merge(&mut self, other: ConfigurationOptions) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(
                    if self.$field.is_none() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        fill!(
            concurrency,
            continue_mode,
            cache,
            cache_dir,
            history_dir,
            workspace_dir,
            workspace_max_age_days,
            workspace_max_entries,
            resource_capacities,
            run_summary
        );
    }
}

pub(crate) trait ResolvedConfigurationOptions {
    fn get_configuration_options(
        &self,
        existing_config: &ConfigurationOptions,
    ) -> Result<ConfigurationOptions, Error>;
}

impl<'a> ResolvedConfigurationOptions for &'a ConfigurationOptions {
    fn get_configuration_options(
        &self,
        _existing_config: &ConfigurationOptions,
    ) -> Result<ConfigurationOptions, Error> {
        Ok((*self).clone())
    }
}

fn get_lowercased_env_vars() -> HashMap<OsString, OsString> {
    std::env::vars_os()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

#[derive(Debug, Default)]
pub struct KilnConfigBuilder {
    root: Utf8PathBuf,
    override_config: ConfigurationOptions,
    environment: Option<HashMap<OsString, OsString>>,
}

impl KilnConfigBuilder {
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            root: root.to_owned(),
            override_config: Default::default(),
            environment: None,
        }
    }

    /// Reads variables from `environment` instead of the process environment.
    /// Keys are matched case-insensitively.
    pub fn with_environment(mut self, environment: HashMap<OsString, OsString>) -> Self {
        self.environment = Some(
            environment
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        );
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.override_config.concurrency = Some(concurrency);
        self
    }

    pub fn with_continue_mode(mut self, continue_mode: ContinueMode) -> Self {
        self.override_config.continue_mode = Some(continue_mode);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.override_config.cache = Some(cache);
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<Utf8PathBuf>) -> Self {
        self.override_config.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_history_dir(mut self, history_dir: impl Into<Utf8PathBuf>) -> Self {
        self.override_config.history_dir = Some(history_dir.into());
        self
    }

    pub fn with_workspace_dir(mut self, workspace_dir: impl Into<Utf8PathBuf>) -> Self {
        self.override_config.workspace_dir = Some(workspace_dir.into());
        self
    }

    pub fn with_resource_capacity(mut self, resource: impl Into<String>, capacity: usize) -> Self {
        self.override_config
            .resource_capacities
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), capacity);
        self
    }

    pub fn with_run_summary(mut self, run_summary: bool) -> Self {
        self.override_config.run_summary = Some(run_summary);
        self
    }

    fn get_environment(&self) -> HashMap<OsString, OsString> {
        self.environment
            .clone()
            .unwrap_or_else(get_lowercased_env_vars)
    }

    pub fn build(&self) -> Result<ConfigurationOptions, Error> {
        let env_vars = self.get_environment();
        let env_var_config = EnvVars::new(&env_vars)?;
        let local_config = ConfigFile::local_config(&self.root);

        // These are ordered from highest to lowest priority
        let sources: [Box<dyn ResolvedConfigurationOptions>; 3] = [
            Box::new(&self.override_config),
            Box::new(env_var_config),
            Box::new(local_config),
        ];

        let config = sources.into_iter().try_fold(
            ConfigurationOptions::default(),
            |mut acc, current_source| {
                let current_source_config = current_source.get_configuration_options(&acc)?;
                acc.merge(current_source_config);
                Ok::<_, Error>(acc)
            },
        )?;

        if config.concurrency == Some(0) {
            return Err(Error::ZeroConcurrency);
        }
        Ok(config)
    }
}
