//! Key/value settings storage.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Key under which the folder of the last used image file is remembered.
pub const HOME_DIR_KEY: &str = "Settings/HomeDir";

/// A flat string-to-string settings store.
pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> io::Result<()>;
}

/// Settings kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: BTreeMap<String, String>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as a TOML table, rewritten on every change.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileSettings {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string(&self.values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, text)
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = FileSettings::open(&path).unwrap();
        assert_eq!(settings.get(HOME_DIR_KEY), None);
        settings.set(HOME_DIR_KEY, "/media/images").unwrap();

        let reopened = FileSettings::open(&path).unwrap();
        assert_eq!(reopened.get(HOME_DIR_KEY).as_deref(), Some("/media/images"));
    }

    #[test]
    fn garbage_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "this is = = not toml").unwrap();
        let err = FileSettings::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
