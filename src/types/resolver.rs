use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every file a resolution read or probed for, the entry file included.
pub type DependencySet = BTreeSet<PathBuf>;

#[derive(Debug, Error)]
pub enum TypeResolveError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no declaration at {path}:{position}")]
    DeclarationNotFound { path: PathBuf, position: usize },

    #[error("type resolution failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclarationKind {
    Interface,
    Type,
    Class,
    Function,
    Enum,
    Variable,
}

/// A declaration and the declarations it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedType {
    pub name: String,
    pub kind: DeclarationKind,
    pub text: String,
    pub file_path: PathBuf,
    /// Byte offset where the declaration starts.
    pub position: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ResolvedType>,
}

/// Narrows which referenced declarations are followed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeFilter {
    /// Only follow references with these names. `None` follows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<BTreeSet<String>>,
    /// Maximum reference depth; `0` resolves the declaration alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

impl TypeFilter {
    pub fn allows(&self, name: &str) -> bool {
        self.references
            .as_ref()
            .is_none_or(|names| names.contains(name))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub file_path: &'a Path,
    pub position: usize,
    pub filter: Option<&'a TypeFilter>,
}

/// The project handle: something that can turn a location into a type.
///
/// Implementations must insert every file they read into `dependencies`,
/// plus paths they looked for and did not find; the cache uses that set to
/// decide when a result has gone stale. Resolution may block on file I/O.
pub trait TypeResolver: Send + Sync {
    fn resolve(
        &self,
        request: ResolveRequest<'_>,
        dependencies: &mut DependencySet,
    ) -> Result<ResolvedType, TypeResolveError>;
}
