//! `params.yaml` configuration tree
//!
//! Model entries are resolved lazily, so a missing key is reported with its
//! full path only when a command actually needs it.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque keyword options forwarded to a stage
pub type StageOptions = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("failed to read params file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse params file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing key `{0}` in params")]
    MissingKey(String),
    #[error("key `{key}` in params must be {expected}")]
    InvalidType { key: String, expected: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// HuggingFace id (or local directory) of the pretrained model
    pub name: String,
    pub checkpoint_name: String,
    pub output_name: String,
    pub stages: Stages,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stages {
    pub train: StageOptions,
    pub generation: StageOptions,
}

#[derive(Debug, Clone)]
pub struct Params {
    root: Value,
}

impl Params {
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ParamsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        let root: Value = serde_yaml::from_str(raw)?;
        Ok(Self { root })
    }

    /// Resolve `models.<key>`.
    pub fn model(&self, key: &str) -> Result<ModelParams, ParamsError> {
        let base = ["models", key];
        let string = |field: &str| -> Result<String, ParamsError> {
            let path = [base[0], base[1], field];
            match self.lookup(&path)? {
                Value::String(s) => Ok(s.clone()),
                _ => Err(ParamsError::InvalidType {
                    key: path.join("."),
                    expected: "a string",
                }),
            }
        };

        Ok(ModelParams {
            name: string("name")?,
            checkpoint_name: string("checkpoint_name")?,
            output_name: string("output_name")?,
            stages: Stages {
                train: self.stage_options(&[base[0], base[1], "stages", "train"])?,
                generation: self.stage_options(&[base[0], base[1], "stages", "generation"])?,
            },
        })
    }

    fn stage_options(&self, path: &[&str]) -> Result<StageOptions, ParamsError> {
        match self.lookup(path)? {
            Value::Object(map) => Ok(map.clone()),
            // `train:` with nothing under it
            Value::Null => Ok(Map::new()),
            _ => Err(ParamsError::InvalidType {
                key: path.join("."),
                expected: "a mapping",
            }),
        }
    }

    fn lookup(&self, path: &[&str]) -> Result<&Value, ParamsError> {
        let mut node = &self.root;
        for (depth, key) in path.iter().enumerate() {
            node = node
                .get(key)
                .ok_or_else(|| ParamsError::MissingKey(path[..=depth].join(".")))?;
        }
        Ok(node)
    }
}
