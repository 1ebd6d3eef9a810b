//! # Host Facilities and Capability Providers
//!
//! Packages never reach the host directly. They reference it:
//!
//! - `{"system": "<name>"}` names a single host facility. It resolves to a
//!   package `system:<name>` with one main module standing in for the
//!   facility.
//! - `{"capability": "<name>"}` names a provider from the fixed table in
//!   [`provider`]. A provider synthesizes a whole package; its modules are
//!   virtual and compute their exports from the linkage graph at link time.
//!
//! Providers whose exports depend on the requiring package (`self@1`,
//! `package@0`) are keyed by that owner, so two owners never share one
//! synthetic package.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::linkage::{LinkageGraph, ModuleDescriptor, PackageNode};

/// Facility names granted by the `host@1` capability.
pub const HOST_FACILITIES: &[&str] = &["console", "env", "fs", "path", "process", "time"];

/// The href of the system package for `name`.
pub fn system_href(name: &str) -> String {
    format!("system:{}", name)
}

/// A package with one main module standing in for host facility `name`.
pub fn system_package(name: &str) -> PackageNode {
    let mut library = BTreeMap::new();
    library.insert(String::new(), ModuleDescriptor::system(name));
    PackageNode::synthetic(system_href(name), library)
}

/// The stand-in exports of a host facility, or `None` for unknown names.
pub fn host_facility(name: &str) -> Option<Value> {
    let value = match name {
        "console" => json!({ "levels": ["error", "warn", "info", "debug", "trace"] }),
        "env" => {
            let variables: Map<String, Value> = std::env::vars()
                .map(|(key, value)| (key, Value::from(value)))
                .collect();
            Value::Object(variables)
        }
        "fs" => json!({ "separator": std::path::MAIN_SEPARATOR.to_string() }),
        "path" => json!({
            "separator": std::path::MAIN_SEPARATOR.to_string(),
            "delimiter": if cfg!(windows) { ";" } else { ":" },
        }),
        "process" => json!({
            "pid": std::process::id(),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cwd": std::env::current_dir()
                .map(|cwd| cwd.display().to_string())
                .unwrap_or_default(),
        }),
        "time" => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default();
            json!({ "unix_millis": now })
        }
        _ => return None,
    };
    Some(value)
}

/// A named factory of synthetic packages.
pub trait CapabilityProvider: Send + Sync {
    /// The capability name, as written in references.
    fn name(&self) -> &'static str;

    /// Whether the package differs per requiring package.
    fn owner_dependent(&self) -> bool {
        false
    }

    /// The href of the package synthesized for `owner`.
    fn href(&self, owner: &str) -> String {
        if self.owner_dependent() {
            format!("capability:{}({})", self.name(), owner)
        } else {
            format!("capability:{}", self.name())
        }
    }

    /// Synthesizes the package for `owner`.
    fn package(&self, owner: &str) -> PackageNode {
        let mut library = BTreeMap::new();
        library.insert(
            String::new(),
            ModuleDescriptor::virtual_module(self.name(), owner),
        );
        PackageNode::synthetic(self.href(owner), library)
    }

    /// The exports of the virtual main module, computed from the graph.
    fn exports(&self, graph: &LinkageGraph, owner: &str) -> Result<Value>;
}

/// The host platform: a main module describing the host plus one system
/// module per host facility.
pub struct HostProvider;

impl CapabilityProvider for HostProvider {
    fn name(&self) -> &'static str {
        "host@1"
    }

    fn package(&self, owner: &str) -> PackageNode {
        let mut library = BTreeMap::new();
        library.insert(
            String::new(),
            ModuleDescriptor::virtual_module(self.name(), owner),
        );
        for facility in HOST_FACILITIES {
            library.insert(facility.to_string(), ModuleDescriptor::system(*facility));
        }
        PackageNode::synthetic(self.href(owner), library)
    }

    fn exports(&self, _graph: &LinkageGraph, _owner: &str) -> Result<Value> {
        Ok(json!({
            "platform": std::env::consts::OS,
            "facilities": HOST_FACILITIES,
        }))
    }
}

/// Read access to the owner's `data/` resources.
pub struct SelfProvider;

impl CapabilityProvider for SelfProvider {
    fn name(&self) -> &'static str {
        "self@1"
    }

    fn owner_dependent(&self) -> bool {
        true
    }

    fn exports(&self, graph: &LinkageGraph, owner: &str) -> Result<Value> {
        let package = graph.package(owner)?;
        let mut data = Map::new();
        for (path, resource) in &package.resources {
            if let Some(relative) = path.strip_prefix("data/") {
                data.insert(relative.to_string(), text(self.name(), path, resource.content.as_deref())?);
            }
        }
        Ok(json!({ "data": data }))
    }
}

/// Introspection of the owner's manifest and resources.
pub struct PackageProvider;

impl CapabilityProvider for PackageProvider {
    fn name(&self) -> &'static str {
        "package@0"
    }

    fn owner_dependent(&self) -> bool {
        true
    }

    fn exports(&self, graph: &LinkageGraph, owner: &str) -> Result<Value> {
        let package = graph.package(owner)?;
        let manifest = package.manifest.as_deref();
        let mut resources = Map::new();
        for (path, resource) in &package.resources {
            resources.insert(path.clone(), text(self.name(), path, resource.content.as_deref())?);
        }
        Ok(json!({
            "url": manifest.and_then(|m| m.url.clone()),
            "name": manifest.and_then(|m| m.name.clone()),
            "resources": resources,
        }))
    }
}

fn text(provider: &str, path: &str, content: Option<&[u8]>) -> Result<Value> {
    let content = content.ok_or_else(|| Error::Evaluation {
        id: provider.to_string(),
        message: format!("resource {:?} was not read", path),
    })?;
    Ok(Value::from(String::from_utf8_lossy(content).into_owned()))
}

/// Looks up a capability provider by name.
pub fn provider(name: &str) -> Option<Box<dyn CapabilityProvider>> {
    match name {
        "host@1" => Some(Box::new(HostProvider)),
        "self@1" => Some(Box::new(SelfProvider)),
        "package@0" => Some(Box::new(PackageProvider)),
        _ => None,
    }
}
