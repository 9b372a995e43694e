use std::{
    cell::RefCell,
    fs, io,
    path::{Path, PathBuf},
};

use hashbrown::HashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataPath {
    base: PathBuf,
}

impl DataPath {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self { base }
    }

    pub fn default_base() -> Option<PathBuf> {
        dirs::data_local_dir().map(|pb| pb.join("oni"))
    }

    pub fn default_base_or_cwd() -> PathBuf {
        Self::default_base().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn rel_path(&self, typ: DataPathType) -> PathBuf {
        match typ {
            DataPathType::Log => PathBuf::from("logs"),
            DataPathType::Setting => PathBuf::from("settings"),
        }
    }

    pub fn path(&self, typ: DataPathType) -> PathBuf {
        self.base.join(self.rel_path(typ))
    }
}

impl Default for DataPath {
    fn default() -> Self {
        Self::new(Self::default_base_or_cwd())
    }
}

pub enum DataPathType {
    Log,
    Setting,
}

/// String key to JSON string. Everything the app remembers between runs
/// goes through one of these.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RefCell<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.borrow_mut().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key in a directory
#[derive(Debug, PartialEq, Clone)]
pub struct FileStore {
    pub file_path: PathBuf,
}

impl FileStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub fn from_data_path(path: &DataPath) -> Self {
        Self::new(path.path(DataPathType::Setting))
    }

    fn file_name(key: &str) -> String {
        format!("{key}.json")
    }

    /// Keys that currently have a value
    pub fn keys(&self) -> Result<Vec<String>> {
        let dir = fs::read_dir(&self.file_path)?;
        let names = dir
            .filter_map(|f| f.ok())
            .filter(|f| f.path().is_file())
            .filter_map(|f| f.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(".json").map(str::to_owned))
            .collect();

        Ok(names)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let filepath = self.file_path.join(Self::file_name(key));
        if !filepath.is_file() {
            return None;
        }

        match fs::read_to_string(&filepath) {
            Ok(contents) => Some(contents),
            Err(e) => {
                error!("could not read {}: {e}", filepath.display());
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        write_file(&self.file_path, Self::file_name(key), value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        match delete_file(&self.file_path, Self::file_name(key)) {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

/// Write the file to the directory
pub fn write_file(directory: &Path, file_name: String, data: &str) -> Result<()> {
    if !directory.exists() {
        fs::create_dir_all(directory)?
    }

    fs::write(directory.join(file_name), data)?;
    Ok(())
}

pub fn delete_file(directory: &Path, file_name: String) -> Result<()> {
    let file_to_delete = directory.join(file_name.clone());
    if file_to_delete.is_file() {
        fs::remove_file(file_to_delete).map_err(Error::Io)
    } else {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Requested file to delete was not found: {file_name}"),
        )))
    }
}

/// Reads and decodes `key`. Missing or unreadable values are `None`.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("ignoring corrupt setting {key}: {e}");
            None
        }
    }
}

/// Persists `value` under `key`. Failures are logged, never fatal.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            error!("could not serialize {key}: {e}");
            return;
        }
    };

    match store.set(key, &json) {
        Ok(()) => debug!("saved {key}"),
        Err(e) => error!("could not save {key}: {e}"),
    }
}
