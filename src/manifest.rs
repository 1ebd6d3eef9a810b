//! # Package Manifests
//!
//! A package is described by a JSON manifest (`package.json`). Loading one
//! is a three-step pipeline over plain `serde_json` values, ending in an
//! immutable, typed [`Manifest`]:
//!
//! 1.  **Overlays**: `overlay.<variant>` objects for every active variant are
//!     merged over a fresh copy of the base fields, in variant order, and
//!     the variant is recorded as active.
//!
//! 2.  **Normalization**: the manifest styles returned by [`styles`] are
//!     tried in rank order; the first whose `applies` predicate accepts the
//!     manifest rewrites it into the native shape. A manifest no style
//!     accepts is rejected.
//!
//! 3.  **Typing**: the normalized object is deserialized into [`Manifest`]
//!     and its languages are validated.
//!
//! Only the fields the resolver consumes are typed; everything else is kept
//! in [`Manifest::extra`].

use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::DEFAULT_REGISTRY;
use crate::error::{Error, Result};
use crate::reference::Reference;

/// The field marking a manifest as written for this resolver.
pub const MARKER: &str = "pkglink";

/// The capability included into registry-style packages.
pub const HOST_CAPABILITY: &str = "host@1";

/// A language: an extension and the compiler that turns it into native
/// source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub extension: String,
    #[serde(default)]
    pub compiler: Option<Reference>,
}

/// A typed, normalized package manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub url: Option<String>,
    /// Path of the main module, relative to the package root.
    pub main: Option<String>,
    /// Explicit module id -> path entries.
    pub modules: BTreeMap<String, String>,
    /// Renamed standard directories (`lib`).
    pub directories: BTreeMap<String, String>,
    /// Declared languages, highest priority first.
    #[serde(deserialize_with = "deserialize_languages")]
    pub languages: Vec<Language>,
    /// Packages merged into this package's namespace.
    pub includes: Vec<Reference>,
    /// Named aliases to other packages.
    #[serde(deserialize_with = "deserialize_mappings")]
    pub mappings: BTreeMap<String, Reference>,
    /// Resource files and directories.
    pub resources: Vec<String>,
    /// Module ids exposed to mapping packages.
    pub public: Option<Vec<String>>,
    pub registry: Option<String>,
    pub catalog: Option<String>,
    /// Variables injected into the scope of this package's modules.
    pub scope: Map<String, Value>,
    /// Variants whose overlays were applied.
    #[serde(skip_deserializing)]
    pub active_variants: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Parses, overlays, normalizes and types a manifest.
    pub fn load(bytes: &[u8], href: &str, variants: &[String]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|error| Error::ManifestInvalid {
            href: href.to_string(),
            message: format!("Can't parse manifest: {}", error),
            hint: None,
        })?;
        let raw = match value {
            Value::Object(raw) => raw,
            other => {
                return Err(Error::ManifestInvalid {
                    href: href.to_string(),
                    message: format!("expected an object, found {}", kind_of(&other)),
                    hint: None,
                })
            }
        };

        let (raw, active_variants) = apply_overlays(raw, variants);
        let style = styles()
            .into_iter()
            .find(|style| style.applies(&raw))
            .ok_or_else(|| Error::ManifestInvalid {
                href: href.to_string(),
                message: "package is not designed for pkglink".to_string(),
                hint: Some(format!("Add \"{}\": true to the manifest", MARKER)),
            })?;
        let normalized = style.normalize(raw, href)?;

        let mut manifest: Manifest =
            serde_json::from_value(Value::Object(normalized)).map_err(|error| {
                Error::ManifestInvalid {
                    href: href.to_string(),
                    message: error.to_string(),
                    hint: None,
                }
            })?;
        manifest.active_variants = active_variants;
        manifest.validate(href)?;
        Ok(manifest)
    }

    /// The directory configured for a standard directory name.
    pub fn directory<'a>(&'a self, name: &'a str) -> &'a str {
        self.directories
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    fn validate(&self, href: &str) -> Result<()> {
        if self.extra.get(MARKER) != Some(&Value::Bool(true)) {
            return Err(Error::ManifestInvalid {
                href: href.to_string(),
                message: "package is not designed for pkglink".to_string(),
                hint: Some(format!("Add \"{}\": true to the manifest", MARKER)),
            });
        }
        for language in &self.languages {
            if language.compiler.is_none() {
                return Err(Error::ManifestInvalid {
                    href: href.to_string(),
                    message: format!(
                        "Language {:?} must have a compiler property",
                        language.extension
                    ),
                    hint: None,
                });
            }
        }
        Ok(())
    }
}

/// Merges `overlay.<variant>` over a fresh copy of the base fields.
///
/// Returns the merged fields and the variants that were marked active.
pub fn apply_overlays(
    mut base: Map<String, Value>,
    variants: &[String],
) -> (Map<String, Value>, Vec<String>) {
    let overlays = match base.remove("overlay") {
        Some(Value::Object(overlays)) => overlays,
        _ => return (base, Vec::new()),
    };
    let mut merged = base;
    let mut active = Vec::new();
    for variant in variants {
        if let Some(Value::Object(fields)) = overlays.get(variant) {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged.insert(variant.clone(), Value::Bool(true));
        active.push(variant.clone());
    }
    (merged, active)
}

/// A manifest shape this resolver knows how to read.
pub trait ManifestStyle: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this style claims the manifest.
    fn applies(&self, raw: &Map<String, Value>) -> bool;

    /// Rewrites the manifest into the native shape.
    fn normalize(&self, raw: Map<String, Value>, href: &str) -> Result<Map<String, Value>>;
}

/// Manifests written for this resolver.
pub struct NativeStyle;

impl ManifestStyle for NativeStyle {
    fn name(&self) -> &'static str {
        "native"
    }

    fn applies(&self, raw: &Map<String, Value>) -> bool {
        raw.get(MARKER) == Some(&Value::Bool(true))
    }

    fn normalize(&self, raw: Map<String, Value>, _href: &str) -> Result<Map<String, Value>> {
        Ok(raw)
    }
}

/// Manifests declaring dependencies as a list. Recognized only to be
/// rejected with a clear message.
pub struct ListDependenciesStyle;

impl ManifestStyle for ListDependenciesStyle {
    fn name(&self) -> &'static str {
        "list-dependencies"
    }

    fn applies(&self, raw: &Map<String, Value>) -> bool {
        matches!(raw.get("dependencies"), Some(Value::Array(_)))
    }

    fn normalize(&self, _raw: Map<String, Value>, href: &str) -> Result<Map<String, Value>> {
        Err(Error::ManifestInvalid {
            href: href.to_string(),
            message: "packages declaring dependencies as a list are not supported".to_string(),
            hint: Some("Declare dependencies as a name -> version map".to_string()),
        })
    }
}

/// Registry-installed packages declaring `dependencies` as a name ->
/// predicate map. Each dependency becomes a named mapping into the default
/// registry, and the host capability is included.
pub struct RegistryStyle;

impl ManifestStyle for RegistryStyle {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn applies(&self, raw: &Map<String, Value>) -> bool {
        matches!(raw.get("dependencies"), Some(Value::Object(_)))
            || (raw.contains_key("name") && raw.contains_key("version"))
    }

    fn normalize(&self, mut raw: Map<String, Value>, _href: &str) -> Result<Map<String, Value>> {
        let mut mappings = match raw.remove("mappings") {
            Some(Value::Object(mappings)) => mappings,
            _ => Map::new(),
        };
        if let Some(Value::Object(dependencies)) = raw.get("dependencies") {
            for (name, predicate) in dependencies {
                if mappings.contains_key(name) {
                    continue;
                }
                let predicate = predicate.as_str().unwrap_or("*");
                mappings.insert(
                    name.clone(),
                    json!({
                        "name": name,
                        "version": predicate,
                        "registry": DEFAULT_REGISTRY,
                    }),
                );
            }
        }
        raw.insert("mappings".to_string(), Value::Object(mappings));

        let mut includes = match raw.remove("includes") {
            Some(Value::Array(includes)) => includes,
            _ => Vec::new(),
        };
        includes.insert(0, json!({ "capability": HOST_CAPABILITY }));
        raw.insert("includes".to_string(), Value::Array(includes));
        raw.insert(MARKER.to_string(), Value::Bool(true));
        Ok(raw)
    }
}

/// The manifest styles in rank order.
pub fn styles() -> Vec<Box<dyn ManifestStyle>> {
    vec![
        Box::new(NativeStyle),
        Box::new(ListDependenciesStyle),
        Box::new(RegistryStyle),
    ]
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accepts either `[{extension, compiler}]` or `{extension: compiler}`.
fn deserialize_languages<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Language>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Languages {
        List(Vec<Language>),
        Map(Map<String, Value>),
    }

    match Languages::deserialize(deserializer)? {
        Languages::List(languages) => Ok(languages),
        Languages::Map(map) => map
            .into_iter()
            .map(|(extension, compiler)| {
                let compiler = Reference::from_value(&compiler, None)
                    .map_err(serde::de::Error::custom)?;
                Ok(Language {
                    extension,
                    compiler: Some(compiler),
                })
            })
            .collect(),
    }
}

/// Mapping values may omit the dependency name; the key supplies it.
fn deserialize_mappings<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Reference>, D::Error> {
    let raw = Map::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let reference =
                Reference::from_value(&value, Some(&key)).map_err(serde::de::Error::custom)?;
            Ok((key, reference))
        })
        .collect()
}
