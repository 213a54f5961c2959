//! YAML loading with tag expansion
//!
//! - `!include path` splices another file in place; relative paths resolve
//!   against the including file
//! - `!env_var NAME [fallback]` substitutes an environment variable

use crate::error::{ConfigError, ConfigResult};
use serde::de::DeserializeOwned;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Parsed `!env_var` argument
#[derive(Debug, PartialEq, Eq)]
struct EnvVarRef {
    name: String,
    fallback: Option<String>,
}

impl EnvVarRef {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.split_once(char::is_whitespace) {
            Some((name, fallback)) => Self {
                name: name.to_string(),
                fallback: Some(fallback.trim().to_string()),
            },
            None => Self {
                name: raw.to_string(),
                fallback: None,
            },
        })
    }

    fn resolve(self) -> ConfigResult<String> {
        match (std::env::var(&self.name), self.fallback) {
            (Ok(value), _) => {
                debug!(var = %self.name, "Substituted environment variable");
                Ok(value)
            }
            (Err(_), Some(fallback)) => Ok(fallback),
            (Err(_), None) => Err(ConfigError::MissingEnvVar { var: self.name }),
        }
    }
}

/// Loads YAML files and expands their tags
#[derive(Debug)]
pub struct YamlLoader {
    root: PathBuf,
    /// Files currently being loaded, outermost first
    chain: Vec<PathBuf>,
}

impl YamlLoader {
    /// Relative paths given to [`load_file`](Self::load_file) resolve against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chain: Vec::new(),
        }
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = match path.as_ref() {
            p if p.is_absolute() => p.to_path_buf(),
            p => self.root.join(p),
        };
        if self.chain.contains(&path) {
            let mut chain = self.chain.clone();
            chain.push(path);
            return Err(ConfigError::IncludeCycle { chain });
        }

        debug!(path = %path.display(), depth = self.chain.len(), "Loading YAML file");
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        self.chain.push(path.clone());
        let loaded = self.parse(&text, &path);
        self.chain.pop();
        loaded
    }

    /// Parse `text` as if it had been read from `origin`
    pub fn parse(&mut self, text: &str, origin: &Path) -> ConfigResult<Value> {
        let value = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: origin.to_path_buf(),
            source,
        })?;
        self.expand(value, origin)
    }

    fn expand(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.expand_tag(*tagged, origin),
            Value::Mapping(map) => map
                .into_iter()
                .map(|(k, v)| -> ConfigResult<(Value, Value)> {
                    Ok((self.expand(k, origin)?, self.expand(v, origin)?))
                })
                .collect::<ConfigResult<Mapping>>()
                .map(Value::Mapping),
            Value::Sequence(items) => items
                .into_iter()
                .map(|v| self.expand(v, origin))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            scalar => Ok(scalar),
        }
    }

    fn expand_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        let name = tagged.tag.to_string();
        trace!(tag = %name, "Expanding tag");

        match (name.as_str(), tagged.value) {
            ("!include", Value::String(target)) => {
                let base = origin.parent().unwrap_or(&self.root).to_path_buf();
                self.load_file(base.join(target))
            }
            ("!include", other) => Err(ConfigError::Include {
                target: format!("{:?}", other),
                reason: "expected a file path".to_string(),
            }),
            ("!env_var", Value::String(raw)) => match EnvVarRef::parse(&raw) {
                Some(var) => var.resolve().map(Value::String),
                None => Err(ConfigError::InvalidValue {
                    key: "!env_var".to_string(),
                    reason: "missing variable name".to_string(),
                }),
            },
            ("!env_var", _) => Err(ConfigError::InvalidValue {
                key: "!env_var".to_string(),
                reason: "variable name must be a string".to_string(),
            }),
            // Other tags pass through with their contents expanded
            (_, inner) => Ok(Value::Tagged(Box::new(TaggedValue {
                tag: tagged.tag,
                value: self.expand(inner, origin)?,
            }))),
        }
    }
}

/// Load `file` relative to `root` with tags expanded
pub fn load_yaml(root: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(root).load_file(file)
}

/// Load a YAML file and deserialize it into `T`
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    let path = path.as_ref();
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let value = YamlLoader::new(root).load_file(path)?;

    serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
