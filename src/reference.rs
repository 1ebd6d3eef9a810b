//! # Dependency References
//!
//! A [`Reference`] describes how to locate a dependency. Manifests write
//! references loosely: a bare string may be a path, a URL, or a
//! `name@predicate@registry` triple, and an object names its kind by its
//! key. Everything is normalized into the tagged union here once, at the
//! manifest boundary, and is immutable afterwards.

use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// How to locate a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A local filesystem path, relative to the requiring package.
    Path(PathBuf),
    /// A URL, possibly with a `#` fragment chain into archives.
    Href(String),
    /// An archive location; resolved exactly like `Href`.
    Archive(String),
    /// A named dependency selected from an installation registry.
    Named {
        name: String,
        predicate: String,
        registry: Option<String>,
        catalog: Option<String>,
    },
    /// A synthetic package granting a host capability.
    Capability(String),
    /// A single host-provided module.
    System(String),
}

impl Reference {
    /// Normalizes shorthand into a reference.
    ///
    /// Strings containing `@` become named references, strings with a URL
    /// scheme become hrefs, and anything else is a path.
    pub fn parse(shorthand: &str) -> Self {
        Self::parse_named(shorthand, None)
    }

    /// Like [`Reference::parse`], taking the name from `default_name` when the
    /// shorthand omits it (`"@1.x"` under the mapping key `left-pad`).
    pub fn parse_named(shorthand: &str, default_name: Option<&str>) -> Self {
        if shorthand.contains('@') && !has_scheme(shorthand) {
            let mut parts = shorthand.splitn(3, '@');
            let name = parts.next().unwrap_or_default();
            let predicate = parts.next().unwrap_or_default();
            let registry = parts.next().filter(|r| !r.is_empty());
            let name = if name.is_empty() {
                default_name.unwrap_or_default()
            } else {
                name
            };
            return Reference::Named {
                name: name.to_string(),
                predicate: predicate.to_string(),
                registry: registry.map(str::to_string),
                catalog: None,
            };
        }
        if has_scheme(shorthand) {
            Reference::Href(shorthand.to_string())
        } else {
            Reference::Path(PathBuf::from(shorthand))
        }
    }

    /// Builds a reference from a manifest value: a shorthand string or an
    /// object keyed by its kind.
    pub fn from_value(value: &Value, default_name: Option<&str>) -> Result<Self, String> {
        match value {
            Value::String(shorthand) => Ok(Self::parse_named(shorthand, default_name)),
            Value::Object(object) => {
                let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
                if let Some(system) = text("system") {
                    Ok(Reference::System(system))
                } else if let Some(capability) = text("capability") {
                    Ok(Reference::Capability(capability))
                } else if let Some(href) = text("href") {
                    Ok(Reference::Href(href))
                } else if let Some(archive) = text("archive") {
                    Ok(Reference::Archive(archive))
                } else if let Some(path) = text("path") {
                    Ok(Reference::Path(PathBuf::from(path)))
                } else if object.contains_key("name") || default_name.is_some() {
                    let name = text("name")
                        .or_else(|| default_name.map(str::to_string))
                        .unwrap_or_default();
                    Ok(Reference::Named {
                        name,
                        predicate: text("version").unwrap_or_else(|| "*".to_string()),
                        registry: text("registry"),
                        catalog: text("catalog"),
                    })
                } else {
                    Err(format!("unrecognized dependency {}", value))
                }
            }
            other => Err(format!("unrecognized dependency {}", other)),
        }
    }

    /// The location string for path-like references.
    pub fn location(&self) -> Option<String> {
        match self {
            Reference::Path(path) => Some(path.to_string_lossy().into_owned()),
            Reference::Href(href) | Reference::Archive(href) => Some(href.clone()),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Reference::Path(path) => serde_json::json!({ "path": path }),
            Reference::Href(href) => serde_json::json!({ "href": href }),
            Reference::Archive(archive) => serde_json::json!({ "archive": archive }),
            Reference::Named {
                name,
                predicate,
                registry,
                catalog,
            } => {
                let mut object = serde_json::Map::new();
                object.insert("name".to_string(), Value::from(name.as_str()));
                object.insert("version".to_string(), Value::from(predicate.as_str()));
                if let Some(registry) = registry {
                    object.insert("registry".to_string(), Value::from(registry.as_str()));
                }
                if let Some(catalog) = catalog {
                    object.insert("catalog".to_string(), Value::from(catalog.as_str()));
                }
                Value::Object(object)
            }
            Reference::Capability(name) => serde_json::json!({ "capability": name }),
            Reference::System(name) => serde_json::json!({ "system": name }),
        }
    }
}

fn has_scheme(text: &str) -> bool {
    match text.find(':') {
        // Single letters are Windows drive prefixes, not schemes.
        Some(index) if index > 1 => text[..index]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
        _ => false,
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Path(path) => write!(f, "{}", path.display()),
            Reference::Href(href) | Reference::Archive(href) => write!(f, "{}", href),
            Reference::Named {
                name,
                predicate,
                registry,
                ..
            } => match registry {
                Some(registry) => write!(f, "{}@{}@{}", name, predicate, registry),
                None => write!(f, "{}@{}", name, predicate),
            },
            Reference::Capability(name) => write!(f, "capability:{}", name),
            Reference::System(name) => write!(f, "system:{}", name),
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Reference::from_value(&value, None).map_err(de::Error::custom)
    }
}
