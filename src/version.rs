//! # Version Predicates and Installed-Version Selection
//!
//! Named dependencies are installed side by side in a registry directory,
//! one subdirectory per version:
//!
//! ```text
//! <registry>/<name>/1.0.0/
//! <registry>/<name>/1.2.0/
//! <registry>/<name>/active -> 1.2.0
//! ```
//!
//! A predicate such as `>=1.0.0 <2.0.0 || 3` is an OR (`||`) of AND-clauses
//! (whitespace or `&&`) of atomic comparisons. Versions compare as
//! dot-separated integer tuples. The `active` label is never a candidate.
//!
//! When several installed versions satisfy a predicate, the highest one is
//! selected.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use crate::error::{Error, Result};
use crate::filesystem::FileSystem;

/// The installed label that names the currently active version.
pub const ACTIVE: &str = "active";

static ATOM_PATTERN: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(<=|>=|<|>|=)?(\d+(?:\.\d+)*)$"));
static AND_PATTERN: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\s*&&\s*|\s+"));

/// Compares dot-separated integer versions left to right.
///
/// When every compared component is equal, the shorter version is the
/// smaller one; non-numeric components compare as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a: Vec<u64> = a.split('.').map(|part| part.parse().unwrap_or(0)).collect();
    let b: Vec<u64> = b.split('.').map(|part| part.parse().unwrap_or(0)).collect();
    for (left, right) in a.iter().zip(b.iter()) {
        match left.cmp(right) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    Any,
    Compare(Operator, String),
    /// An atom that could not be parsed; it never matches.
    Never,
}

impl Atom {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Atom::Any => true,
            Atom::Never => false,
            Atom::Compare(operator, version) => {
                let ordering = compare_versions(candidate, version);
                match operator {
                    Operator::Less => ordering == Ordering::Less,
                    Operator::LessOrEqual => ordering != Ordering::Greater,
                    Operator::Greater => ordering == Ordering::Greater,
                    Operator::GreaterOrEqual => ordering != Ordering::Less,
                    Operator::Equal => ordering == Ordering::Equal,
                }
            }
        }
    }
}

/// A parsed version predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPredicate {
    source: String,
    clauses: Vec<Vec<Atom>>,
}

impl VersionPredicate {
    /// Parses a predicate. Malformed atoms are kept and never match.
    pub fn parse(predicate: &str) -> Result<Self> {
        let atom_pattern = ATOM_PATTERN.as_ref().map_err(Clone::clone)?;
        let and_pattern = AND_PATTERN.as_ref().map_err(Clone::clone)?;

        let clauses = predicate
            .split("||")
            .map(|clause| {
                and_pattern
                    .split(clause.trim())
                    .filter(|atom| !atom.is_empty())
                    .map(|atom| parse_atom(atom_pattern, atom))
                    .collect::<Vec<_>>()
            })
            .collect();

        Ok(Self {
            source: predicate.to_string(),
            clauses,
        })
    }

    /// Whether `candidate` satisfies any clause. The `active` label never
    /// does.
    pub fn matches(&self, candidate: &str) -> bool {
        if candidate == ACTIVE {
            return false;
        }
        self.clauses
            .iter()
            .any(|clause| clause.iter().all(|atom| atom.matches(candidate)))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn parse_atom(pattern: &Regex, atom: &str) -> Atom {
    if atom == "*" {
        return Atom::Any;
    }
    match pattern.captures(atom) {
        Some(captures) => {
            let operator = match captures.get(1).map(|m| m.as_str()) {
                Some("<") => Operator::Less,
                Some("<=") => Operator::LessOrEqual,
                Some(">") => Operator::Greater,
                Some(">=") => Operator::GreaterOrEqual,
                _ => Operator::Equal,
            };
            Atom::Compare(operator, captures[2].to_string())
        }
        None => Atom::Never,
    }
}

/// Selects the highest installed version satisfying `predicate`.
///
/// `name` is only used for the error message.
pub fn select(name: &str, predicate: &str, installed: &[String]) -> Result<String> {
    let parsed = VersionPredicate::parse(predicate)?;
    let mut candidates: Vec<&String> = installed
        .iter()
        .filter(|version| version.as_str() != ACTIVE)
        .collect();
    candidates.sort_by(|a, b| compare_versions(a, b));

    candidates
        .iter()
        .rev()
        .find(|version| parsed.matches(version))
        .map(|version| version.to_string())
        .ok_or_else(|| Error::VersionUnsatisfiable {
            name: name.to_string(),
            predicate: predicate.to_string(),
            installed: candidates.iter().map(|v| v.to_string()).collect(),
        })
}

/// A named-dependency installation directory.
#[derive(Debug, Clone)]
pub struct Registry {
    name: String,
    root: PathBuf,
}

impl Registry {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the installed versions of a package, `active` included.
    pub fn installed(&self, fs: &dyn FileSystem, package: &str) -> Result<Vec<String>> {
        let directory = self.root.join(package);
        if !fs.is_directory(&directory)? {
            return Err(Error::NotInstalled {
                name: package.to_string(),
                registry: self.name.clone(),
            });
        }
        fs.list(&directory)
    }

    /// Returns the directory of the best installed version of `package`.
    pub fn find(&self, fs: &dyn FileSystem, package: &str, predicate: &str) -> Result<PathBuf> {
        let installed = self.installed(fs, package)?;
        let version = select(package, predicate, &installed)?;
        debug!(
            "Selected {}@{} for {:?} from registry {}",
            package, version, predicate, self.name
        );
        Ok(self.root.join(package).join(version))
    }
}
