use std::{fs, io};

use camino::{Utf8Path, Utf8PathBuf};

use super::{ConfigurationOptions, Error, ResolvedConfigurationOptions, CONFIG_DIR, CONFIG_FILE};

pub struct ConfigFile {
    path: Utf8PathBuf,
}

impl ConfigFile {
    pub fn local_config(root: &Utf8Path) -> Self {
        let path = root.join(CONFIG_DIR).join(CONFIG_FILE);
        Self { path }
    }

    fn read_existing_to_string(&self) -> Result<Option<String>, io::Error> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl ResolvedConfigurationOptions for ConfigFile {
    fn get_configuration_options(
        &self,
        _existing_config: &ConfigurationOptions,
    ) -> Result<ConfigurationOptions, Error> {
        let contents = self
            .read_existing_to_string()
            .map_err(|error| Error::FailedToReadConfig {
                config_path: self.path.clone(),
                error,
            })?
            .filter(|s| !s.trim().is_empty());

        contents.as_deref().map_or_else(
            || Ok(ConfigurationOptions::default()),
            |contents| {
                serde_json::from_str(contents).map_err(|error| Error::InvalidConfigFile {
                    config_path: self.path.clone(),
                    error,
                })
            },
        )
    }
}
