//! # Resolution Options
//!
//! This module defines [`Options`], the knobs that shape a resolution run:
//! which variant overlays are active, whether debug roots participate, the
//! native source extension, where named registries are installed, and the
//! shared scope injected into every module.
//!
//! Options can be written as YAML (by default in `pkglink.yaml`):
//!
//! ```yaml
//! variants: [pkglink, browser]
//! debug: false
//! registries:
//!   npm: /opt/npm
//! scope:
//!   greeting: hello
//! ```
//!
//! Every field is optional; missing fields take the defaults below.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::version::Registry;

/// The default configuration file name.
pub const CONFIG_FILE: &str = "pkglink.yaml";

/// The registry used for dependencies declared as a name -> predicate map.
pub const DEFAULT_REGISTRY: &str = "npm";

/// Options for one resolution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Active variant names. Later variants override earlier ones.
    pub variants: Vec<String>,
    /// Whether `debug` roots take part in module and resource election.
    pub debug: bool,
    /// The extension of native source files, elected after every declared
    /// language.
    pub native_extension: String,
    /// The manifest file name looked up in every package.
    pub manifest: String,
    /// Named-dependency installation directories.
    pub registries: BTreeMap<String, PathBuf>,
    /// Extensions identifying archive files.
    pub archive_extensions: Vec<String>,
    /// Variables shared by every module's scope.
    pub scope: Map<String, Value>,
}

impl Default for Options {
    fn default() -> Self {
        let mut registries = BTreeMap::new();
        if let Some(home) = dirs::home_dir() {
            registries.insert(DEFAULT_REGISTRY.to_string(), home.join(".npm"));
        }
        Self {
            variants: vec!["pkglink".to_string()],
            debug: true,
            native_extension: ".json".to_string(),
            manifest: "package.json".to_string(),
            registries,
            archive_extensions: vec![".zip".to_string()],
            scope: Map::new(),
        }
    }
}

impl Options {
    /// Returns the registry named `name`, if one is configured.
    pub fn registry(&self, name: &str) -> Option<Registry> {
        self.registries
            .get(name)
            .map(|root| Registry::new(name, root.clone()))
    }

    /// Computes the ordered package roots, most specific first.
    ///
    /// Each active variant prepends `variants/<name>` ahead of the roots
    /// accumulated so far; debug mode puts `<root>/debug` ahead of every
    /// root.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![PathBuf::new()];
        for variant in &self.variants {
            roots.insert(0, Path::new("variants").join(variant));
        }
        if self.debug {
            roots = roots
                .into_iter()
                .flat_map(|root| [root.join("debug"), root])
                .collect();
        }
        roots
    }
}

/// Parse options from a YAML string
pub fn parse(yaml: &str) -> Result<Options> {
    if yaml.trim().is_empty() {
        return Ok(Options::default());
    }
    serde_yaml::from_str(yaml).map_err(Error::Yaml)
}

/// Load options from a YAML file
pub fn from_file(path: &Path) -> Result<Options> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

/// Load options from `path` when it exists, falling back to defaults.
pub fn load_or_default(path: &Path) -> Result<Options> {
    if path.is_file() {
        from_file(path)
    } else {
        Ok(Options::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.variants, vec!["pkglink"]);
        assert!(options.debug);
        assert_eq!(options.native_extension, ".json");
        assert_eq!(options.manifest, "package.json");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let options = parse(
            r#"
variants: [a, b]
debug: false
registries:
  npm: /opt/npm
scope:
  greeting: hello
"#,
        )
        .unwrap();
        assert_eq!(options.variants, vec!["a", "b"]);
        assert!(!options.debug);
        assert_eq!(
            options.registry("npm").unwrap().root(),
            Path::new("/opt/npm")
        );
        assert_eq!(options.scope["greeting"], Value::from("hello"));
        assert_eq!(options.native_extension, ".json");
    }

    #[test]
    fn test_parse_empty_is_default() {
        assert_eq!(parse("  \n").unwrap(), Options::default());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        assert!(parse("engines: [node]").is_err());
    }

    #[test]
    fn test_roots_order() {
        let options = Options {
            variants: vec!["a".to_string(), "b".to_string()],
            debug: true,
            ..Options::default()
        };
        let roots: Vec<String> = options
            .roots()
            .iter()
            .map(|root| root.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            roots,
            vec![
                "variants/b/debug",
                "variants/b",
                "variants/a/debug",
                "variants/a",
                "debug",
                "",
            ]
        );
    }

    #[test]
    fn test_roots_without_debug() {
        let options = Options {
            variants: vec![],
            debug: false,
            ..Options::default()
        };
        assert_eq!(options.roots(), vec![PathBuf::new()]);
    }
}
