//! Service registry for svcmgr.
//!
//! The registry is an ordered list of [`ServiceSpec`] entries backed by a
//! small YAML (or JSON) file. Every mutation rewrites the file atomically.
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock, RwLock},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::constants::REGISTRY_LOCK_SUFFIX;
use crate::error::{ConfigError, ManagerError};

/// A user-declared background service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique identifier of the service.
    pub name: String,
    /// Shell command used to start the service.
    pub command: String,
    /// TCP port the service is expected to listen on.
    #[serde(
        default,
        alias = "expectedPort",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_port: Option<u16>,
}

impl ServiceSpec {
    /// Creates a spec without an expected port.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            expected_port: None,
        }
    }

    /// Sets the expected port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.expected_port = Some(port);
        self
    }

    /// The port this service should own: the explicit `expected_port`, or one
    /// parsed from a `--port`/`-p` flag in the command.
    pub fn declared_port(&self) -> Option<u16> {
        self.expected_port.or_else(|| extract_port(&self.command))
    }
}

/// Parses `--port=N`, `--port N` or `-p N` out of a command line.
pub fn extract_port(command: &str) -> Option<u16> {
    static PORT_FLAG: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PORT_FLAG
        .get_or_init(|| Regex::new(r"(?:^|\s)(?:--port[=\s]\s*|-p\s+)(\d+)\b").ok())
        .as_ref()?;
    re.captures(command)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

#[derive(Serialize)]
struct RegistryFileRef<'a> {
    services: &'a [ServiceSpec],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }
}

fn validate(specs: &[ServiceSpec]) -> Result<(), ConfigError> {
    for (index, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                index,
                field: "name",
            });
        }
        if spec.command.trim().is_empty() {
            return Err(ConfigError::MissingField {
                index,
                field: "command",
            });
        }
        if specs[..index].iter().any(|other| other.name == spec.name) {
            return Err(ConfigError::DuplicateName(spec.name.clone()));
        }
    }
    Ok(())
}

/// Loads the ordered list of services from `path`.
pub fn load(path: &Path) -> Result<Vec<ServiceSpec>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let file: RegistryFile = match FileFormat::for_path(path) {
        FileFormat::Yaml => serde_yaml::from_str(&content)?,
        FileFormat::Json => serde_json::from_str(&content)?,
    };

    validate(&file.services)?;
    debug!(
        "Loaded {} service(s) from {}",
        file.services.len(),
        path.display()
    );
    Ok(file.services)
}

/// Overwrites `path` with `specs` by writing a sibling temp file and renaming it.
pub fn save(path: &Path, specs: &[ServiceSpec]) -> Result<(), ConfigError> {
    let view = RegistryFileRef { services: specs };
    let content = match FileFormat::for_path(path) {
        FileFormat::Yaml => serde_yaml::to_string(&view)?,
        FileFormat::Json => {
            let mut json = serde_json::to_string_pretty(&view)?;
            json.push('\n');
            json
        }
    };

    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(ConfigError::WriteError)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(ConfigError::WriteError)?;
    tmp.write_all(content.as_bytes())
        .map_err(ConfigError::WriteError)?;
    tmp.as_file().sync_all().map_err(ConfigError::WriteError)?;
    tmp.persist(path)
        .map_err(|err| ConfigError::WriteError(err.error))?;

    debug!("Saved {} service(s) to {}", specs.len(), path.display());
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(REGISTRY_LOCK_SUFFIX);
    PathBuf::from(raw)
}

/// In-memory registry bound to its backing file.
///
/// Reads clone the current list. Writes are serialized by a mutex inside the
/// process and by an advisory file lock across processes.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    specs: RwLock<Vec<ServiceSpec>>,
    write_lock: Mutex<()>,
    load_error: Option<String>,
}

impl Registry {
    /// Loads the registry, failing on a missing or malformed file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let specs = load(&path)?;
        Ok(Self::with_specs(path, specs, None))
    }

    /// Loads the registry, falling back to an empty list when the file is
    /// missing or malformed. The failure is kept in [`Registry::load_error`].
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match load(&path) {
            Ok(specs) => Self::with_specs(path, specs, None),
            Err(ConfigError::ReadError(err)) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "No registry at {}; starting with an empty service list",
                    path.display()
                );
                Self::with_specs(path, Vec::new(), Some(err.to_string()))
            }
            Err(err) => {
                warn!("Ignoring unreadable registry {}: {err}", path.display());
                Self::with_specs(path, Vec::new(), Some(err.to_string()))
            }
        }
    }

    fn with_specs(
        path: PathBuf,
        specs: Vec<ServiceSpec>,
        load_error: Option<String>,
    ) -> Self {
        Self {
            path,
            specs: RwLock::new(specs),
            write_lock: Mutex::new(()),
            load_error,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The error that made [`Registry::open`] fall back to an empty list.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    /// A copy of the declared services in order.
    pub fn specs(&self) -> Vec<ServiceSpec> {
        self.specs
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<ServiceSpec> {
        self.specs().into_iter().find(|spec| spec.name == name)
    }

    /// Appends a new service and saves.
    pub fn add(&self, spec: ServiceSpec) -> Result<(), ManagerError> {
        self.mutate(|specs| {
            if specs.iter().any(|existing| existing.name == spec.name) {
                return Err(ManagerError::DuplicateService(spec.name.clone()));
            }
            info!("Adding service '{}'", spec.name);
            specs.push(spec);
            Ok(())
        })
    }

    /// Replaces the service called `name` with `spec` and saves.
    pub fn update(&self, name: &str, spec: ServiceSpec) -> Result<(), ManagerError> {
        self.mutate(|specs| {
            let index = specs
                .iter()
                .position(|existing| existing.name == name)
                .ok_or_else(|| ManagerError::ServiceNotFound(name.to_string()))?;
            if spec.name != name && specs.iter().any(|other| other.name == spec.name) {
                return Err(ManagerError::DuplicateService(spec.name.clone()));
            }
            info!("Updating service '{name}'");
            specs[index] = spec;
            Ok(())
        })
    }

    /// Removes the service called `name` and saves.
    pub fn remove(&self, name: &str) -> Result<ServiceSpec, ManagerError> {
        self.mutate(|specs| {
            let index = specs
                .iter()
                .position(|existing| existing.name == name)
                .ok_or_else(|| ManagerError::ServiceNotFound(name.to_string()))?;
            info!("Removing service '{name}'");
            Ok(specs.remove(index))
        })
    }

    /// The list a mutation starts from. Another process may have written
    /// since we last read; a missing file starts from what we hold in memory,
    /// while an unreadable one is never overwritten.
    fn reload(&self) -> Result<Vec<ServiceSpec>, ConfigError> {
        match load(&self.path) {
            Ok(specs) => Ok(specs),
            Err(ConfigError::ReadError(err)) if err.kind() == ErrorKind::NotFound => {
                debug!("Registry {} is missing; writing a new one", self.path.display());
                Ok(self.specs())
            }
            Err(err) => {
                warn!(
                    "Refusing to modify unreadable registry {}: {err}",
                    self.path.display()
                );
                Err(err)
            }
        }
    }

    fn mutate<T, F>(&self, apply: F) -> Result<T, ManagerError>
    where
        F: FnOnce(&mut Vec<ServiceSpec>) -> Result<T, ManagerError>,
    {
        let _guard = self.write_lock.lock()?;

        fs::create_dir_all(parent_dir(&self.path)).map_err(ConfigError::WriteError)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(&self.path))
            .map_err(ConfigError::WriteError)?;
        lock_file
            .lock_exclusive()
            .map_err(ConfigError::WriteError)?;

        let outcome = self
            .reload()
            .map_err(ManagerError::from)
            .and_then(|mut next| {
                let value = apply(&mut next)?;
                validate(&next)?;
                save(&self.path, &next)?;
                Ok((value, next))
            });

        if let Err(err) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to release registry lock: {err}");
        }

        let (value, next) = outcome?;
        *self.specs.write()? = next;
        Ok(value)
    }
}
