//! Status and config files on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::config::DriverConfig;
use crate::domain::DomainObj;
use crate::error::{BlockJobError, Result};
use crate::types::DomainDef;

use super::{format_config, format_status, parse_config, parse_status};

/// Reads and writes `<dir>/<domain>.xml` files.
#[derive(Debug, Clone)]
pub struct StatusStore {
    state_dir: PathBuf,
    config_dir: PathBuf,
}

impl StatusStore {
    pub fn new(state_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            config_dir: config_dir.into(),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(&config.state_dir, &config.config_dir)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn status_path(&self, domain: &str) -> PathBuf {
        self.state_dir.join(format!("{}.xml", domain))
    }

    pub fn config_path(&self, domain: &str) -> PathBuf {
        self.config_dir.join(format!("{}.xml", domain))
    }

    /// Write the status file of `vm`, replacing the old one atomically.
    #[instrument(skip(self, vm), fields(domain = %vm.def.name))]
    pub fn save_status(&self, vm: &DomainObj) -> Result<()> {
        let path = self.status_path(&vm.def.name);
        write_atomic(&path, &format_status(vm))?;
        debug!(path = %path.display(), "Status saved");
        Ok(())
    }

    /// Load the status file of `domain`.
    #[instrument(skip(self))]
    pub fn load_status(&self, domain: &str) -> Result<DomainObj> {
        load_status_file(&self.status_path(domain))
    }

    /// Write the persistent definition.
    #[instrument(skip(self, def), fields(domain = %def.name))]
    pub fn save_config(&self, def: &DomainDef) -> Result<()> {
        let path = self.config_path(&def.name);
        write_atomic(&path, &format_config(def))?;
        info!(path = %path.display(), "Domain config saved");
        Ok(())
    }

    pub fn load_config(&self, domain: &str) -> Result<DomainDef> {
        let path = self.config_path(domain);
        let xml = fs::read_to_string(&path)?;
        parse_config(&xml)
    }

    /// Names of all domains with a status file, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the status file of `domain`.
    pub fn remove_status(&self, domain: &str) -> Result<()> {
        let path = self.status_path(domain);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Load a status file from an arbitrary path.
pub fn load_status_file(path: &Path) -> Result<DomainObj> {
    if !path.exists() {
        return Err(BlockJobError::NotFound(format!(
            "status file {}",
            path.display()
        )));
    }

    let xml = fs::read_to_string(path)?;
    parse_status(&xml)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BlockJobError::Internal(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp = path.with_extension("xml.new");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
