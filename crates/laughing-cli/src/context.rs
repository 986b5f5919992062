//! Project directory layout

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Context {
    pub root_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Context {
    /// `data_dir` defaults to `<root_dir>/data`.
    pub fn new(root_dir: impl Into<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let data_dir = data_dir.unwrap_or_else(|| root_dir.join("data"));
        Self { root_dir, data_dir }
    }

    pub fn processed(&self, name: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join("processed").join(name)
    }

    pub fn checkpoints(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join("checkpoints").join(name)
    }

    pub fn artifacts(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join("artifacts").join(name)
    }
}
