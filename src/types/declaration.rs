//! Built-in resolver for TypeScript/JavaScript-like sources.
//!
//! Declarations are recognised at the start of a line (`export`, `default`,
//! `declare`, `abstract` and `async` modifiers allowed) and extend to the
//! next declaration. References are the identifiers inside a declaration's
//! text that name another declaration in the same file or a relative
//! `import` binding; they are followed transitively.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use path_clean::PathClean;
use regex::Regex;

use super::resolver::{
    DeclarationKind, DependencySet, ResolveRequest, ResolvedType, TypeFilter, TypeResolveError,
    TypeResolver,
};

const DEFAULT_MAX_DEPTH: usize = 8;

/// Extensions tried, in order, for an extensionless relative import.
const MODULE_EXTENSIONS: &[&str] = &["ts", "tsx", "d.ts", "mts", "cts", "js", "jsx", "mjs"];

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:export[ \t]+)?(default[ \t]+)?(?:declare[ \t]+)?(?:abstract[ \t]+)?(?:async[ \t]+)?(interface|type|class|function|enum|const|let|var)[ \t]+([A-Za-z_$][\w$]*)",
    )
    .expect("valid regex for declarations")
});

static IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^import[ \t]+(?:type[ \t]+)?(?:([A-Za-z_$][\w$]*)[ \t]*,?[ \t]*)?(?:\{([^}]*)\})?[ \t]*from[ \t]+['"]([^'"]+)['"]"#,
    )
    .expect("valid regex for imports")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").expect("valid regex for identifiers"));

#[derive(Debug, Clone)]
struct Declaration {
    name: String,
    kind: DeclarationKind,
    is_default: bool,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ImportedName {
    Named(String),
    Default,
}

#[derive(Debug, Clone)]
struct Import {
    specifier: String,
    imported: ImportedName,
}

#[derive(Debug)]
struct ParsedFile {
    source: String,
    declarations: Vec<Declaration>,
    /// Local binding name -> where it comes from.
    imports: HashMap<String, Import>,
}

impl ParsedFile {
    fn parse(source: String) -> Self {
        let mut declarations: Vec<Declaration> = DECLARATION
            .captures_iter(&source)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(Declaration {
                    name: caps.get(3)?.as_str().to_string(),
                    kind: kind_from_keyword(caps.get(2)?.as_str()),
                    is_default: caps.get(1).is_some(),
                    start: whole.start(),
                    end: source.len(),
                })
            })
            .collect();
        for i in 1..declarations.len() {
            declarations[i - 1].end = declarations[i].start;
        }

        let mut imports = HashMap::new();
        for caps in IMPORT.captures_iter(&source) {
            let Some(specifier) = caps.get(3).map(|m| m.as_str().to_string()) else {
                continue;
            };
            if let Some(default) = caps.get(1) {
                imports.insert(
                    default.as_str().to_string(),
                    Import {
                        specifier: specifier.clone(),
                        imported: ImportedName::Default,
                    },
                );
            }
            if let Some(named) = caps.get(2) {
                for binding in named.as_str().split(',') {
                    let binding = binding.trim();
                    let binding = binding.strip_prefix("type ").unwrap_or(binding).trim();
                    if binding.is_empty() {
                        continue;
                    }
                    let (imported, local) = match binding.split_once(" as ") {
                        Some((imported, local)) => (imported.trim(), local.trim()),
                        None => (binding, binding),
                    };
                    let imported = if imported == "default" {
                        ImportedName::Default
                    } else {
                        ImportedName::Named(imported.to_string())
                    };
                    imports.insert(
                        local.to_string(),
                        Import {
                            specifier: specifier.clone(),
                            imported,
                        },
                    );
                }
            }
        }

        Self {
            source,
            declarations,
            imports,
        }
    }

    /// The declaration whose extent contains `position`.
    fn enclosing(&self, position: usize) -> Option<usize> {
        if position >= self.source.len() {
            return None;
        }
        self.declarations
            .iter()
            .rposition(|decl| decl.start <= position && position < decl.end)
    }

    fn find_named(&self, name: &str) -> Option<usize> {
        self.declarations.iter().position(|decl| decl.name == name)
    }

    fn find_default(&self) -> Option<usize> {
        self.declarations.iter().position(|decl| decl.is_default)
    }

    fn text_of(&self, index: usize) -> &str {
        let decl = &self.declarations[index];
        self.source[decl.start..decl.end].trim_end()
    }
}

fn kind_from_keyword(keyword: &str) -> DeclarationKind {
    match keyword {
        "interface" => DeclarationKind::Interface,
        "type" => DeclarationKind::Type,
        "class" => DeclarationKind::Class,
        "function" => DeclarationKind::Function,
        "enum" => DeclarationKind::Enum,
        _ => DeclarationKind::Variable,
    }
}

/// Resolve `./foo` style specifiers against the importing file.
///
/// Candidates probed before the match (all of them when nothing matches)
/// go into `probed`: a file created there later would change the result.
fn resolve_module(importer: &Path, specifier: &str, probed: &mut DependencySet) -> Option<PathBuf> {
    if !specifier.starts_with('.') {
        return None;
    }
    let base = importer.parent()?.join(specifier).clean();
    let with_extension = MODULE_EXTENSIONS.iter().map(|extension| {
        let mut candidate = base.clone().into_os_string();
        candidate.push(".");
        candidate.push(extension);
        PathBuf::from(candidate)
    });
    let index_module = MODULE_EXTENSIONS
        .iter()
        .map(|extension| base.join(format!("index.{extension}")));

    for candidate in std::iter::once(base.clone())
        .chain(with_extension)
        .chain(index_module)
    {
        if candidate.is_file() {
            return Some(candidate);
        }
        probed.insert(candidate);
    }
    None
}

/// Resolver that reads declarations straight from source files.
#[derive(Debug, Clone)]
pub struct SourceDeclarationResolver {
    max_depth: usize,
}

impl Default for SourceDeclarationResolver {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl SourceDeclarationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl TypeResolver for SourceDeclarationResolver {
    fn resolve(
        &self,
        request: ResolveRequest<'_>,
        dependencies: &mut DependencySet,
    ) -> Result<ResolvedType, TypeResolveError> {
        let default_filter = TypeFilter::default();
        let filter = request.filter.unwrap_or(&default_filter);
        let mut walk = Walk {
            filter,
            max_depth: filter
                .max_depth
                .map_or(self.max_depth, |depth| depth.min(self.max_depth)),
            dependencies,
            files: HashMap::new(),
            visiting: HashSet::new(),
        };

        let path = request.file_path.to_path_buf().clean();
        let file = walk.load(&path)?;
        let index = file
            .enclosing(request.position)
            .ok_or_else(|| TypeResolveError::DeclarationNotFound {
                path: path.clone(),
                position: request.position,
            })?;

        Ok(walk.build(&path, &file, index, 0))
    }
}

/// State for one resolution.
struct Walk<'a> {
    filter: &'a TypeFilter,
    max_depth: usize,
    dependencies: &'a mut DependencySet,
    files: HashMap<PathBuf, Arc<ParsedFile>>,
    visiting: HashSet<(PathBuf, usize)>,
}

impl Walk<'_> {
    fn load(&mut self, path: &Path) -> Result<Arc<ParsedFile>, TypeResolveError> {
        if let Some(file) = self.files.get(path) {
            return Ok(Arc::clone(file));
        }
        self.dependencies.insert(path.to_path_buf());
        let source = std::fs::read_to_string(path).map_err(|source| TypeResolveError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Arc::new(ParsedFile::parse(source));
        self.files.insert(path.to_path_buf(), Arc::clone(&file));
        Ok(file)
    }

    fn build(&mut self, path: &Path, file: &Arc<ParsedFile>, index: usize, depth: usize) -> ResolvedType {
        let decl = &file.declarations[index];
        let text = file.text_of(index);
        let mut references = Vec::new();

        if depth < self.max_depth {
            let key = (path.to_path_buf(), index);
            self.visiting.insert(key.clone());

            let mut seen: HashSet<&str> = HashSet::new();
            for ident in IDENTIFIER.find_iter(text) {
                let name = ident.as_str();
                if name == decl.name || !seen.insert(name) || !self.filter.allows(name) {
                    continue;
                }
                let Some((target_path, target_file, target_index)) = self.locate(path, file, name)
                else {
                    continue;
                };
                if self
                    .visiting
                    .contains(&(target_path.clone(), target_index))
                {
                    continue;
                }
                references.push(self.build(&target_path, &target_file, target_index, depth + 1));
            }

            self.visiting.remove(&key);
        }

        ResolvedType {
            name: decl.name.clone(),
            kind: decl.kind,
            text: text.to_string(),
            file_path: path.to_path_buf(),
            position: decl.start,
            references,
        }
    }

    /// Find the declaration `name` refers to from inside `file`.
    fn locate(
        &mut self,
        path: &Path,
        file: &Arc<ParsedFile>,
        name: &str,
    ) -> Option<(PathBuf, Arc<ParsedFile>, usize)> {
        if let Some(index) = file.find_named(name) {
            return Some((path.to_path_buf(), Arc::clone(file), index));
        }

        let import = file.imports.get(name)?;
        let target = resolve_module(path, &import.specifier, &mut *self.dependencies)?;
        let target_file = match self.load(&target) {
            Ok(target_file) => target_file,
            Err(e) => {
                log::debug!(
                    target: "tincture::types::resolver",
                    "Skipping import '{}' of {}: {}",
                    import.specifier,
                    path.display(),
                    e
                );
                return None;
            }
        };
        let index = match &import.imported {
            ImportedName::Named(imported) => target_file.find_named(imported)?,
            ImportedName::Default => target_file.find_default()?,
        };
        Some((target, target_file, index))
    }
}
