use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
};

use camino::Utf8PathBuf;
use kiln_types::ContinueMode;

use super::{ConfigurationOptions, Error, ResolvedConfigurationOptions};

const KILN_MAPPING: &[(&str, &str)] = [
    ("kiln_concurrency", "concurrency"),
    ("kiln_continue", "continue_mode"),
    ("kiln_cache", "cache"),
    ("kiln_cache_dir", "cache_dir"),
    ("kiln_history_dir", "history_dir"),
    ("kiln_workspace_dir", "workspace_dir"),
    ("kiln_workspace_max_age_days", "workspace_max_age_days"),
    ("kiln_workspace_max_entries", "workspace_max_entries"),
    ("kiln_run_summary", "run_summary"),
]
.as_slice();

pub struct EnvVars {
    output_map: HashMap<&'static str, String>,
}

impl EnvVars {
    pub fn new(environment: &HashMap<OsString, OsString>) -> Result<Self, Error> {
        let kiln_mapping: HashMap<_, _> = KILN_MAPPING.iter().copied().collect();
        let output_map = map_environment(kiln_mapping, environment)?;
        Ok(Self { output_map })
    }

    fn truthy_value(&self, key: &str) -> Option<Option<bool>> {
        Some(truth_env_var(
            self.output_map.get(key).filter(|s| !s.is_empty())?,
        ))
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.output_map
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    fn path(&self, key: &str) -> Option<Utf8PathBuf> {
        self.non_empty(key).map(Utf8PathBuf::from)
    }
}

impl ResolvedConfigurationOptions for EnvVars {
    fn get_configuration_options(
        &self,
        _existing_config: &ConfigurationOptions,
    ) -> Result<ConfigurationOptions, Error> {
        let concurrency = self
            .non_empty("concurrency")
            .map(|s| s.parse())
            .transpose()
            .map_err(Error::InvalidConcurrency)?;

        let continue_mode = self
            .non_empty("continue_mode")
            .map(|s| match s {
                "always" | "true" | "1" => Ok(ContinueMode::Always),
                "never" | "false" | "0" => Ok(ContinueMode::Never),
                _ => Err(Error::InvalidContinue),
            })
            .transpose()?;

        // An empty KILN_CACHE disables the cache, so it is not filtered out.
        let cache = self
            .output_map
            .get("cache")
            .map(|c| c.parse())
            .transpose()?;

        let workspace_max_age_days = self
            .non_empty("workspace_max_age_days")
            .map(|s| s.parse())
            .transpose()
            .map_err(Error::InvalidWorkspaceMaxAge)?;

        let workspace_max_entries = self
            .non_empty("workspace_max_entries")
            .map(|s| s.parse())
            .transpose()
            .map_err(Error::InvalidWorkspaceMaxEntries)?;

        let output = ConfigurationOptions {
            concurrency,
            continue_mode,
            cache,
            cache_dir: self.path("cache_dir"),
            history_dir: self.path("history_dir"),
            workspace_dir: self.path("workspace_dir"),
            workspace_max_age_days,
            workspace_max_entries,
            resource_capacities: None,
            run_summary: self.truthy_value("run_summary").flatten(),
        };

        Ok(output)
    }
}

pub fn truth_env_var(s: &str) -> Option<bool> {
    match s {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn map_environment<'a>(
    // keys are environment variable names
    // values are properties of ConfigurationOptions we want to store the
    // values in
    mapping: HashMap<&str, &'a str>,

    // keys are lowercased environment variable names
    environment: &HashMap<OsString, OsString>,
) -> Result<HashMap<&'a str, String>, Error> {
    let mut output_map = HashMap::new();
    mapping
        .into_iter()
        .try_for_each(|(mapping_key, mapped_property)| -> Result<(), Error> {
            if let Some(value) = environment.get(OsStr::new(mapping_key)) {
                let converted = value
                    .to_str()
                    .ok_or_else(|| Error::Encoding(mapping_key.to_ascii_uppercase()))?;
                output_map.insert(mapped_property, converted.to_owned());
            }
            Ok(())
        })?;
    Ok(output_map)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::config::CacheConfig;

    fn resolve(vars: &[(&str, &str)]) -> Result<ConfigurationOptions, Error> {
        let env: HashMap<OsString, OsString> = vars
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect();
        EnvVars::new(&env)?.get_configuration_options(&ConfigurationOptions::default())
    }

    #[test]
    fn test_env_setting() -> Result<(), Error> {
        let config = resolve(&[
            ("kiln_concurrency", "3"),
            ("kiln_continue", "never"),
            ("kiln_cache", ""),
            ("kiln_cache_dir", "/tmp/kiln-cache"),
            ("kiln_workspace_max_age_days", "2"),
            ("kiln_workspace_max_entries", "10"),
            ("kiln_run_summary", "true"),
        ])?;

        assert_eq!(config.concurrency, Some(3));
        assert_eq!(config.continue_mode, Some(ContinueMode::Never));
        assert_eq!(config.cache, Some(CacheConfig::disabled()));
        assert_eq!(config.cache_dir, Some(Utf8PathBuf::from("/tmp/kiln-cache")));
        assert_eq!(config.history_dir, None);
        assert_eq!(config.workspace_max_age_days, Some(2));
        assert_eq!(config.workspace_max_entries, Some(10));
        assert_eq!(config.run_summary, Some(true));
        Ok(())
    }

    #[test]
    fn test_empty_env_setting() -> Result<(), Error> {
        let config = resolve(&[
            ("kiln_concurrency", ""),
            ("kiln_continue", ""),
            ("kiln_cache_dir", ""),
            ("kiln_run_summary", ""),
        ])?;
        assert_eq!(config, ConfigurationOptions::default());
        Ok(())
    }

    #[test_case("kiln_concurrency", "many" ; "concurrency")]
    #[test_case("kiln_continue", "sometimes" ; "continue")]
    #[test_case("kiln_cache", "remote:rw" ; "cache")]
    #[test_case("kiln_workspace_max_age_days", "-1" ; "max age")]
    fn test_invalid_env_setting(key: &str, value: &str) {
        assert!(resolve(&[(key, value)]).is_err());
    }

    #[test_case("true", Some(true))]
    #[test_case("1", Some(true))]
    #[test_case("false", Some(false))]
    #[test_case("0", Some(false))]
    #[test_case("yes", None)]
    fn test_truth_env_var(value: &str, expected: Option<bool>) {
        assert_eq!(truth_env_var(value), expected);
    }
}
