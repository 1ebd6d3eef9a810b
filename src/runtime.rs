//! # Module Runtime
//!
//! Turns a read and compiled [`LinkageGraph`] into executable modules.
//!
//! ## Key Components
//!
//! - **[`Factory`]**: a callable that evaluates one module. It receives a
//!   [`ModuleScope`] holding a `require` curried with the module's own id,
//!   a fresh exports value, the module record and the shared scope
//!   variables. Its `requirements` let a [`Requirer`] pull in the modules
//!   it needs ahead of time.
//!
//! - **[`Requirer`]**: the per-package `require`. A module is evaluated at
//!   most once, on first request; a failed evaluation leaves no record, so
//!   nothing half-built is ever observed. `ensure`, `require_async`, `exec`
//!   and `reload` work on a copy of the factory and module tables advanced
//!   through a [`Loader`], leaving the original untouched.
//!
//! - **[`Evaluator`]**: turns native source text into a factory. The
//!   built-in [`JsonEvaluator`] treats native source as JSON data in which
//!   `{"$require": "<id>"}` is replaced by that module's exports and
//!   `{"$scope": "<name>"}` by a shared scope variable.
//!
//! - **[`Compiler`]**: turns a declared language into native source. The
//!   linker holds a table of host compilers; a compiler package names one
//!   by exporting `{"compiler": "<name>"}` from its main module.
//!
//! - **[`Linker`]**: builds one requirer per package. Reference modules
//!   delegate to the target package's requirer, system modules to the host
//!   facility table and capability modules to their provider.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;
use serde_json::{Map, Value};

use crate::capabilities;
use crate::error::{Error, Result};
use crate::linkage::{LinkageGraph, ModuleSource};

type FactoryBody = dyn Fn(&mut ModuleScope<'_>) -> Result<Option<Value>> + Send + Sync;

/// Evaluates one module.
#[derive(Clone)]
pub struct Factory {
    path: Option<String>,
    requirements: Vec<String>,
    body: Arc<FactoryBody>,
}

impl Factory {
    /// A factory running `body`. Returning `Some` replaces the exports
    /// assembled in the scope.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut ModuleScope<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            path: None,
            requirements: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// A factory whose module exports `exports`.
    pub fn constant(exports: Value) -> Self {
        Self::new(move |_| Ok(Some(exports.clone())))
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Ids this module requires, relative to its own id.
    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("path", &self.path)
            .field("requirements", &self.requirements)
            .finish_non_exhaustive()
    }
}

/// The bindings a factory evaluates with.
pub struct ModuleScope<'a> {
    requirer: &'a Requirer,
    /// The module's id.
    pub id: String,
    /// Where the module came from, if anywhere.
    pub path: Option<String>,
    /// The exports container, initially an empty object.
    pub exports: Value,
    variables: Map<String, Value>,
}

impl ModuleScope<'_> {
    /// Requires `id`, resolving `./` and `../` against this module's id.
    pub fn require(&self, id: &str) -> Result<Value> {
        self.requirer.require_from(id, &self.id)
    }

    /// Like [`ModuleScope::require`], loading missing modules first.
    pub fn require_async(&self, id: &str) -> Result<Value> {
        self.requirer.require_async_from(id, Some(&self.id))
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// The id of the module being executed as the entry point.
    pub fn main(&self) -> Option<&str> {
        self.requirer.main()
    }

    pub fn requirer(&self) -> &Requirer {
        self.requirer
    }
}

/// Supplies factories a requirer does not have yet.
pub trait Loader: Send + Sync {
    fn load(&self, id: &str) -> Result<Factory>;
}

/// Construction options for a [`Requirer`].
#[derive(Clone, Default)]
pub struct RequirerOptions {
    pub factories: HashMap<String, Factory>,
    /// Already evaluated modules, by id.
    pub modules: HashMap<String, Value>,
    pub loader: Option<Arc<dyn Loader>>,
    /// Variables injected into every module's scope.
    pub scope: Map<String, Value>,
    pub main: Option<String>,
}

struct State {
    factories: Mutex<HashMap<String, Factory>>,
    modules: Mutex<HashMap<String, Value>>,
    loader: Option<Arc<dyn Loader>>,
    scope: Map<String, Value>,
    main: Option<String>,
}

/// A package's `require`.
#[derive(Clone)]
pub struct Requirer {
    state: Arc<State>,
}

impl fmt::Debug for Requirer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirer")
            .field("main", &self.state.main)
            .field("loader", &self.state.loader.is_some())
            .finish_non_exhaustive()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, context: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| Error::LockPoisoned {
        context: context.to_string(),
    })
}

impl Requirer {
    /// A requirer over a fixed factory table.
    pub fn new(factories: HashMap<String, Factory>) -> Self {
        Self::with_options(RequirerOptions {
            factories,
            ..RequirerOptions::default()
        })
    }

    pub fn with_options(options: RequirerOptions) -> Self {
        Self {
            state: Arc::new(State {
                factories: Mutex::new(options.factories),
                modules: Mutex::new(options.modules),
                loader: options.loader,
                scope: options.scope,
                main: options.main,
            }),
        }
    }

    /// The entry point id, when this requirer was made by `exec`.
    pub fn main(&self) -> Option<&str> {
        self.state.main.as_deref()
    }

    /// Whether the module `id` has been evaluated.
    pub fn is_evaluated(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.state.modules, "modules")?.contains_key(id))
    }

    /// Whether a factory for `id` is known.
    pub fn has_factory(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.state.factories, "factories")?.contains_key(id))
    }

    /// Requires a top-level id.
    pub fn require(&self, id: &str) -> Result<Value> {
        self.evaluate(&resolve_id(id, None), None)
    }

    /// Requires `id` on behalf of the module `base`.
    pub fn require_from(&self, id: &str, base: &str) -> Result<Value> {
        self.evaluate(&resolve_id(id, Some(base)), None)
    }

    fn evaluate(&self, id: &str, extra: Option<&Map<String, Value>>) -> Result<Value> {
        if let Some(exports) = lock(&self.state.modules, "modules")?.get(id) {
            return Ok(exports.clone());
        }
        let factory = lock(&self.state.factories, "factories")?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound {
                id: id.to_string(),
                href: None,
            })?;
        {
            let mut modules = lock(&self.state.modules, "modules")?;
            if let Some(exports) = modules.get(id) {
                return Ok(exports.clone());
            }
            // Registered before evaluation so a cycle sees the empty exports.
            modules.insert(id.to_string(), Value::Object(Map::new()));
        }

        debug!("Evaluating module {:?}", id);
        let mut variables = self.state.scope.clone();
        if let Some(extra) = extra {
            variables.extend(extra.clone());
        }
        let mut scope = ModuleScope {
            requirer: self,
            id: id.to_string(),
            path: factory.path.clone(),
            exports: Value::Object(Map::new()),
            variables,
        };
        match (factory.body)(&mut scope) {
            Ok(returned) => {
                let exports = returned.unwrap_or(scope.exports);
                lock(&self.state.modules, "modules")?.insert(id.to_string(), exports.clone());
                Ok(exports)
            }
            Err(error) => {
                lock(&self.state.modules, "modules")?.remove(id);
                Err(error)
            }
        }
    }

    fn load(&self, id: &str) -> Result<Factory> {
        if let Some(factory) = lock(&self.state.factories, "factories")?.get(id) {
            return Ok(factory.clone());
        }
        match &self.state.loader {
            Some(loader) => loader.load(id),
            None => Err(Error::ModuleNotFound {
                id: id.to_string(),
                href: None,
            }),
        }
    }

    /// Adds `id` and its transitive requirements to `factories`.
    fn advance(
        &self,
        id: &str,
        factories: &mut HashMap<String, Factory>,
        modules: &HashMap<String, Value>,
    ) -> Result<()> {
        let factory = match factories.get(id) {
            Some(factory) => factory.clone(),
            None => {
                let factory = self.load(id)?;
                factories.insert(id.to_string(), factory.clone());
                factory
            }
        };
        for requirement in factory.requirements() {
            let requirement = resolve_id(requirement, Some(id));
            if modules.contains_key(&requirement) || factories.contains_key(&requirement) {
                continue;
            }
            self.advance(&requirement, factories, modules)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<(HashMap<String, Factory>, HashMap<String, Value>)> {
        let factories = lock(&self.state.factories, "factories")?.clone();
        let modules = lock(&self.state.modules, "modules")?.clone();
        Ok((factories, modules))
    }

    fn derive(
        &self,
        factories: HashMap<String, Factory>,
        modules: HashMap<String, Value>,
        main: Option<String>,
    ) -> Requirer {
        Requirer::with_options(RequirerOptions {
            factories,
            modules,
            loader: self.state.loader.clone(),
            scope: self.state.scope.clone(),
            main,
        })
    }

    /// Loads `ids` and everything they require into a copy of this
    /// requirer, then hands the copy to `callback`.
    pub fn ensure<R, F>(&self, ids: &[&str], callback: F) -> Result<R>
    where
        F: FnOnce(Requirer) -> Result<R>,
    {
        let (mut factories, modules) = self.snapshot()?;
        for id in ids {
            self.advance(&resolve_id(id, None), &mut factories, &modules)?;
        }
        callback(self.derive(factories, modules, self.state.main.clone()))
    }

    /// Requires `id` from a copy of this requirer extended through the
    /// loader.
    pub fn require_async(&self, id: &str) -> Result<Value> {
        self.require_async_from(id, None)
    }

    fn require_async_from(&self, id: &str, base: Option<&str>) -> Result<Value> {
        let id = resolve_id(id, base);
        let (mut factories, modules) = self.snapshot()?;
        self.advance(&id, &mut factories, &modules)?;
        self.derive(factories, modules, self.state.main.clone())
            .evaluate(&id, None)
    }

    /// Executes `id` as the entry point and returns its exports.
    pub fn exec(&self, id: &str) -> Result<Value> {
        self.exec_with(id, &Map::new())
    }

    /// Like [`Requirer::exec`], with extra variables in the entry module's
    /// scope.
    pub fn exec_with(&self, id: &str, scope: &Map<String, Value>) -> Result<Value> {
        let id = resolve_id(id, None);
        let (mut factories, modules) = self.snapshot()?;
        self.advance(&id, &mut factories, &modules)?;
        self.derive(factories, modules, Some(id.clone()))
            .evaluate(&id, Some(scope))
    }

    /// A fresh requirer holding only `id`'s factories, with nothing
    /// evaluated.
    pub fn reload(&self, id: &str) -> Result<Requirer> {
        let id = resolve_id(id, None);
        let mut factories = HashMap::new();
        self.advance(&id, &mut factories, &HashMap::new())?;
        Ok(Requirer::with_options(RequirerOptions {
            factories,
            loader: self.state.loader.clone(),
            scope: self.state.scope.clone(),
            ..RequirerOptions::default()
        }))
    }
}

/// Resolves `./` and `../` in `id` against the directory of `base`.
pub fn resolve_id(id: &str, base: Option<&str>) -> String {
    let joined = match base {
        Some(base) if id.starts_with('.') => {
            let directory = base.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            format!("{}/{}", directory, id)
        }
        _ => id.to_string(),
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

/// Turns native source text into a factory.
pub trait Evaluator: Send + Sync {
    fn factory(&self, id: &str, href: &str, source: &str) -> Result<Factory>;
}

/// Native modules as JSON data.
#[derive(Debug, Clone, Default)]
pub struct JsonEvaluator;

impl Evaluator for JsonEvaluator {
    fn factory(&self, id: &str, href: &str, source: &str) -> Result<Factory> {
        let data: Value = serde_json::from_str(source).map_err(|error| Error::Compile {
            href: href.to_string(),
            id: id.to_string(),
            message: error.to_string(),
        })?;
        let mut requirements = Vec::new();
        collect_requirements(&data, &mut requirements);
        Ok(Factory::new(move |scope| substitute(&data, scope).map(Some))
            .with_path(href)
            .with_requirements(requirements))
    }
}

/// A directive object: exactly one key, naming a string.
fn directive<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    if object.len() == 1 {
        object.get(key).and_then(Value::as_str)
    } else {
        None
    }
}

fn collect_requirements(value: &Value, requirements: &mut Vec<String>) {
    match value {
        Value::Object(object) => match directive(object, "$require") {
            Some(id) => requirements.push(id.to_string()),
            None => object
                .values()
                .for_each(|value| collect_requirements(value, requirements)),
        },
        Value::Array(items) => items
            .iter()
            .for_each(|item| collect_requirements(item, requirements)),
        _ => {}
    }
}

fn substitute(value: &Value, scope: &ModuleScope<'_>) -> Result<Value> {
    match value {
        Value::Object(object) => {
            if let Some(id) = directive(object, "$require") {
                return scope.require(id);
            }
            if let Some(name) = directive(object, "$scope") {
                return scope.variable(name).cloned().ok_or_else(|| Error::Evaluation {
                    id: scope.id.clone(),
                    message: format!("no scope variable {:?}", name),
                });
            }
            let mut substituted = Map::new();
            for (key, value) in object {
                substituted.insert(key.clone(), substitute(value, scope)?);
            }
            Ok(Value::Object(substituted))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Turns source text of a declared language into native source text.
pub trait Compiler: Send + Sync {
    /// The name compiler packages export to select this compiler.
    fn name(&self) -> &str;

    fn compile(&self, source: &str) -> std::result::Result<String, String>;
}

/// YAML documents to JSON data.
#[derive(Debug, Clone, Default)]
pub struct YamlCompiler;

impl Compiler for YamlCompiler {
    fn name(&self) -> &str {
        "yaml"
    }

    fn compile(&self, source: &str) -> std::result::Result<String, String> {
        let value: Value = serde_yaml::from_str(source).map_err(|error| error.to_string())?;
        serde_json::to_string(&value).map_err(|error| error.to_string())
    }
}

/// TOML documents to JSON data.
#[derive(Debug, Clone, Default)]
pub struct TomlCompiler;

impl Compiler for TomlCompiler {
    fn name(&self) -> &str {
        "toml"
    }

    fn compile(&self, source: &str) -> std::result::Result<String, String> {
        let value: toml::Value = toml::from_str(source).map_err(|error| error.to_string())?;
        serde_json::to_string(&value).map_err(|error| error.to_string())
    }
}

/// A linked graph: one requirer per package.
#[derive(Debug, Clone)]
pub struct Program {
    main: String,
    requirers: Arc<BTreeMap<String, Requirer>>,
}

impl Program {
    /// The requirer of the package at `href`.
    pub fn requirer(&self, href: &str) -> Result<&Requirer> {
        self.requirers.get(href).ok_or_else(|| Error::NotFound {
            href: href.to_string(),
            message: "package is not linked".to_string(),
        })
    }

    /// The requirer of the entry package.
    pub fn main(&self) -> Result<&Requirer> {
        self.requirer(&self.main)
    }

    /// Executes module `id` of the entry package.
    pub fn exec(&self, id: &str) -> Result<Value> {
        self.main()?.exec(id)
    }
}

/// Builds requirers from a compiled graph.
#[derive(Clone)]
pub struct Linker {
    evaluator: Arc<dyn Evaluator>,
    compilers: BTreeMap<String, Arc<dyn Compiler>>,
    scope: Map<String, Value>,
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("compilers", &self.compilers.keys().collect::<Vec<_>>())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new(Arc::new(JsonEvaluator))
    }
}

enum Prepared {
    Ready(Factory),
    Reference { package: String, id: String },
}

impl Linker {
    /// A linker with the built-in compilers.
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            compilers: BTreeMap::new(),
            scope: Map::new(),
        }
        .with_compiler(Arc::new(YamlCompiler))
        .with_compiler(Arc::new(TomlCompiler))
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compilers.insert(compiler.name().to_string(), compiler);
        self
    }

    /// Variables shared by every module of every package.
    pub fn with_scope(mut self, scope: Map<String, Value>) -> Self {
        self.scope = scope;
        self
    }

    pub fn compiler(&self, name: &str) -> Option<Arc<dyn Compiler>> {
        self.compilers.get(name).cloned()
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    /// Links every package of `graph`.
    ///
    /// The graph must have been read and compiled.
    pub fn link(&self, graph: &LinkageGraph) -> Result<Program> {
        let mut prepared: BTreeMap<String, (HashMap<String, Prepared>, Map<String, Value>)> =
            BTreeMap::new();
        for (href, package) in &graph.packages {
            let mut factories = HashMap::new();
            for (id, module) in &package.library {
                let prepared =
                    self.prepare(graph, href, id, &module.source, module.native.as_deref())?;
                factories.insert(id.clone(), prepared);
            }
            let mut scope = self.scope.clone();
            scope.extend(package.scope());
            prepared.insert(href.clone(), (factories, scope));
        }

        let requirers = Arc::new_cyclic(|table: &Weak<BTreeMap<String, Requirer>>| {
            prepared
                .into_iter()
                .map(|(href, (factories, scope))| {
                    let factories = factories
                        .into_iter()
                        .map(|(id, prepared)| {
                            let factory = match prepared {
                                Prepared::Ready(factory) => factory,
                                Prepared::Reference { package, id } => {
                                    delegate(Weak::clone(table), package, id)
                                }
                            };
                            (id, factory)
                        })
                        .collect();
                    let requirer = Requirer::with_options(RequirerOptions {
                        factories,
                        scope,
                        ..RequirerOptions::default()
                    });
                    (href, requirer)
                })
                .collect()
        });

        Ok(Program {
            main: graph.main.clone(),
            requirers,
        })
    }

    fn prepare(
        &self,
        graph: &LinkageGraph,
        href: &str,
        id: &str,
        source: &ModuleSource,
        native: Option<&str>,
    ) -> Result<Prepared> {
        match source {
            ModuleSource::File { href: file, .. } => {
                let native = native.ok_or_else(|| Error::Compile {
                    href: href.to_string(),
                    id: id.to_string(),
                    message: "module has not been compiled".to_string(),
                })?;
                let factory = self.evaluator.factory(id, file, native)?;
                Ok(Prepared::Ready(factory))
            }
            ModuleSource::Reference { package, id } => Ok(Prepared::Reference {
                package: package.clone(),
                id: id.clone(),
            }),
            ModuleSource::System { name } => {
                let name = name.clone();
                Ok(Prepared::Ready(Factory::new(move |_| {
                    capabilities::host_facility(&name)
                        .map(Some)
                        .ok_or_else(|| Error::ModuleNotFound {
                            id: name.clone(),
                            href: Some(capabilities::system_href(&name)),
                        })
                })))
            }
            ModuleSource::Virtual { provider, owner } => {
                let capability = capabilities::provider(provider).ok_or_else(|| {
                    Error::ReferenceUnsupported {
                        reference: format!("capability:{}", provider),
                        message: "unknown capability".to_string(),
                    }
                })?;
                let exports = capability.exports(graph, owner)?;
                Ok(Prepared::Ready(Factory::constant(exports)))
            }
        }
    }
}

/// A factory forwarding to module `id` of the package at `package`.
fn delegate(table: Weak<BTreeMap<String, Requirer>>, package: String, id: String) -> Factory {
    Factory::new(move |_| {
        let requirers = table.upgrade().ok_or_else(|| Error::Evaluation {
            id: id.clone(),
            message: "the linked program has been dropped".to_string(),
        })?;
        let requirer = requirers.get(&package).ok_or_else(|| Error::ModuleNotFound {
            id: id.clone(),
            href: Some(package.clone()),
        })?;
        requirer.require(&id).map(Some)
    })
}
