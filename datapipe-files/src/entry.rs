use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use datapipe_core::fmt::render_template;
use datapipe_core::{ArgValue, Environment};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("value {value} is not among option '{option}'")]
    ValueNotInOption { option: String, value: String },

    #[error("bad range specifier '{0}'")]
    BadRange(String),

    #[error("unsupported option value: {0}")]
    BadValue(String),

    #[error("path template: {0}")]
    Format(#[from] datapipe_core::fmt::FormatError),
}

/// On-disk form of an entry; option values arrive as raw YAML and are
/// normalized into scalar lists (expanding `range(...)` specifiers).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawEntry {
    #[serde(default)]
    pub description: String,
    pub id: String,
    #[serde(default)]
    pub filetype: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

/// One catalog entry: a path template plus the values each placeholder
/// may take. Iterating yields the Cartesian product of the options.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub description: String,
    pub id: String,
    pub filetype: String,
    pub path: String,
    pub author: Option<String>,
    pub options: BTreeMap<String, Vec<ArgValue>>,
}

/// A single concrete file: entry fields with every option pinned to one
/// value.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub description: String,
    pub id: String,
    pub filetype: String,
    pub path: String,
    pub author: Option<String>,
    pub options: BTreeMap<String, ArgValue>,
}

impl FileEntry {
    pub(crate) fn from_raw(raw: RawEntry) -> Result<Self, CatalogError> {
        let mut options = BTreeMap::new();
        for (name, value) in raw.options {
            options.insert(name, normalize_option(value)?);
        }
        Ok(Self {
            description: raw.description,
            id: raw.id,
            filetype: raw.filetype,
            path: raw.path,
            author: raw.author,
            options,
        })
    }

    pub(crate) fn to_raw(&self) -> RawEntry {
        RawEntry {
            description: self.description.clone(),
            id: self.id.clone(),
            filetype: self.filetype.clone(),
            path: self.path.clone(),
            author: self.author.clone(),
            options: self
                .options
                .iter()
                .map(|(name, values)| {
                    let seq = serde_yaml::Value::Sequence(
                        values.iter().map(scalar_to_yaml).collect(),
                    );
                    (name.clone(), seq)
                })
                .collect(),
        }
    }

    /// Number of concrete files described (product over option sizes).
    pub fn len(&self) -> usize {
        self.options.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restrict options to the given values; every filter key must name
    /// an option and every value must already be in it.
    pub fn select(
        &self,
        filters: &BTreeMap<String, Vec<ArgValue>>,
    ) -> Result<FileEntry, CatalogError> {
        let mut narrowed = self.clone();
        for (name, values) in filters {
            let current = narrowed
                .options
                .get(name)
                .ok_or_else(|| CatalogError::UnknownOption(name.clone()))?;
            for value in values {
                if !current.contains(value) {
                    return Err(CatalogError::ValueNotInOption {
                        option: name.clone(),
                        value: format!("{value:?}"),
                    });
                }
            }
            narrowed.options.insert(name.clone(), values.clone());
        }
        Ok(narrowed)
    }

    /// Iterate the Cartesian product of the options.
    pub fn iter(&self) -> impl Iterator<Item = File> + '_ {
        let names: Vec<&String> = self.options.keys().collect();
        let sizes: Vec<usize> = self.options.values().map(Vec::len).collect();
        let total = if sizes.iter().any(|&s| s == 0) {
            0
        } else {
            sizes.iter().product()
        };
        (0..total).map(move |mut index| {
            let mut picked = BTreeMap::new();
            for (name, size) in names.iter().zip(&sizes).rev() {
                let values = &self.options[*name];
                picked.insert((*name).clone(), values[index % size].clone());
                index /= size;
            }
            File {
                description: self.description.clone(),
                id: self.id.clone(),
                filetype: self.filetype.clone(),
                path: self.path.clone(),
                author: self.author.clone(),
                options: picked,
            }
        })
    }
}

impl File {
    /// Real path: `${NAME}` expanded from the environment, then the
    /// `{option}` / `{option:fmt}` fields formatted with this file's
    /// option values.
    pub fn rpath(&self, env: &Environment) -> Result<String, CatalogError> {
        let expanded = expand_env(&self.path, env);
        Ok(render_template(&expanded, &[], &self.options)?)
    }
}

/// Replace `${NAME}` with the environment's value; unknown names are
/// left in place.
fn expand_env(path: &str, env: &Environment) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn normalize_option(value: serde_yaml::Value) -> Result<Vec<ArgValue>, CatalogError> {
    match value {
        serde_yaml::Value::Sequence(items) => items.into_iter().map(yaml_to_scalar).collect(),
        serde_yaml::Value::String(s) if s.trim_start().starts_with("range(") => parse_range(&s),
        other => Ok(vec![yaml_to_scalar(other)?]),
    }
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
fn parse_range(spec: &str) -> Result<Vec<ArgValue>, CatalogError> {
    let inner = spec
        .trim()
        .strip_prefix("range(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| CatalogError::BadRange(spec.to_string()))?;
    let parts: Vec<i64> = inner
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| CatalogError::BadRange(spec.to_string()))?;
    let (start, stop, step) = match parts.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] if *step != 0 => (*start, *stop, *step),
        _ => return Err(CatalogError::BadRange(spec.to_string())),
    };
    let mut values = Vec::new();
    let mut v = start;
    while (step > 0 && v < stop) || (step < 0 && v > stop) {
        values.push(ArgValue::Int(v));
        v += step;
    }
    Ok(values)
}

fn yaml_to_scalar(value: serde_yaml::Value) -> Result<ArgValue, CatalogError> {
    match value {
        serde_yaml::Value::Null => Ok(ArgValue::Null),
        serde_yaml::Value::Bool(b) => Ok(ArgValue::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ArgValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(ArgValue::Float(f))
            } else {
                Err(CatalogError::BadValue(format!("{n:?}")))
            }
        }
        serde_yaml::Value::String(s) => Ok(ArgValue::Str(s)),
        other => Err(CatalogError::BadValue(format!("{other:?}"))),
    }
}

fn scalar_to_yaml(value: &ArgValue) -> serde_yaml::Value {
    match value {
        ArgValue::Null => serde_yaml::Value::Null,
        ArgValue::Bool(b) => serde_yaml::Value::Bool(*b),
        ArgValue::Int(i) => serde_yaml::Value::Number((*i).into()),
        ArgValue::Float(f) => {
            serde_yaml::Value::Number(serde_yaml::Number::from(*f))
        }
        ArgValue::Str(s) => serde_yaml::Value::String(s.clone()),
        other => serde_yaml::Value::String(format!("{other:?}")),
    }
}
