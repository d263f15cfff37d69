//! Memoized type resolution.
//!
//! Entries are keyed by `file:position` and carry the modification time of
//! every file the resolution looked at. Files that were probed but absent
//! are recorded as absent, so a file appearing later is a change too. A
//! lookup re-stats those files; any difference or stat error counts as
//! stale. Entries are replaced wholesale, never patched.
//!
//! Resolvers read files synchronously, so they run on tokio's blocking pool.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use log::debug;
use path_clean::PathClean;

use super::resolver::{
    DependencySet, ResolveRequest, ResolvedType, TypeFilter, TypeResolveError, TypeResolver,
};

/// A cached resolution and its dependency mtime snapshot.
#[derive(Debug, Clone)]
pub struct TypeCacheEntry {
    pub resolved: ResolvedType,
    pub filter: Option<TypeFilter>,
    /// File path -> last modified time in milliseconds since the epoch,
    /// `None` when the file did not exist.
    pub dependencies: HashMap<PathBuf, Option<u128>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct TypeResolutionCache {
    entries: DashMap<String, Arc<TypeCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn cache_key(file_path: &Path, position: usize) -> String {
    format!("{}:{}", file_path.display(), position)
}

/// `Ok(None)` for a missing file; other stat failures are errors.
async fn modified_millis(path: &Path) -> io::Result<Option<u128>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let millis = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(io::Error::other)?
        .as_millis();
    Ok(Some(millis))
}

/// Run a resolution on the blocking pool, handing back the dependency set.
async fn resolve_blocking<R>(
    resolver: &Arc<R>,
    file_path: &Path,
    position: usize,
    filter: Option<&TypeFilter>,
    mut dependencies: DependencySet,
) -> (Result<ResolvedType, TypeResolveError>, DependencySet)
where
    R: TypeResolver + ?Sized + 'static,
{
    let resolver = Arc::clone(resolver);
    let file_path = file_path.to_path_buf();
    let filter = filter.cloned();
    let task = tokio::task::spawn_blocking(move || {
        let request = ResolveRequest {
            file_path: &file_path,
            position,
            filter: filter.as_ref(),
        };
        let resolved = resolver.resolve(request, &mut dependencies);
        (resolved, dependencies)
    });
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => (
            Err(TypeResolveError::Other(format!("resolver task failed: {e}"))),
            DependencySet::new(),
        ),
    }
}

impl TypeResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the type of the declaration at `file_path:position`.
    ///
    /// `is_virtual` bypasses the cache entirely: nothing is read from or
    /// written to it.
    pub async fn resolve_type_at_location<R: TypeResolver + ?Sized + 'static>(
        &self,
        resolver: &Arc<R>,
        file_path: &Path,
        position: usize,
        filter: Option<&TypeFilter>,
        is_virtual: bool,
    ) -> Result<ResolvedType, TypeResolveError> {
        if is_virtual {
            let (resolved, _) =
                resolve_blocking(resolver, file_path, position, filter, DependencySet::new()).await;
            return resolved;
        }

        let key = cache_key(file_path, position);
        let cached = self.entries.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = cached {
            if entry.filter.as_ref() != filter {
                debug!(
                    target: "tincture::types::cache",
                    "Filter changed for {}, recomputing",
                    key
                );
            } else if let Some(changed) = Self::first_stale_dependency(&entry).await {
                debug!(
                    target: "tincture::types::cache",
                    "Dependency {} changed, recomputing {}",
                    changed.display(),
                    key
                );
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(target: "tincture::types::cache", "Cache hit for {}", key);
                return Ok(entry.resolved.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut dependencies = DependencySet::new();
        dependencies.insert(file_path.to_path_buf().clean());
        let (resolved, dependencies) =
            resolve_blocking(resolver, file_path, position, filter, dependencies).await;
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.entries.remove(&key);
                return Err(e);
            }
        };

        match Self::snapshot(&dependencies).await {
            Some(snapshot) => {
                debug!(
                    target: "tincture::types::cache",
                    "Cached {} with {} dependencies",
                    key,
                    snapshot.len()
                );
                self.entries.insert(
                    key,
                    Arc::new(TypeCacheEntry {
                        resolved: resolved.clone(),
                        filter: filter.cloned(),
                        dependencies: snapshot,
                    }),
                );
            }
            None => {
                debug!(
                    target: "tincture::types::cache",
                    "Not caching {}: a dependency could not be stat'ed",
                    key
                );
                self.entries.remove(&key);
            }
        }

        Ok(resolved)
    }

    async fn first_stale_dependency(entry: &TypeCacheEntry) -> Option<PathBuf> {
        for (path, recorded) in &entry.dependencies {
            match modified_millis(path).await {
                Ok(current) if current == *recorded => {}
                _ => return Some(path.clone()),
            }
        }
        None
    }

    async fn snapshot(dependencies: &DependencySet) -> Option<HashMap<PathBuf, Option<u128>>> {
        let mut snapshot = HashMap::with_capacity(dependencies.len());
        for path in dependencies {
            snapshot.insert(path.clone(), modified_millis(path).await.ok()?);
        }
        Some(snapshot)
    }

    /// Drop every entry that depends on `path`. Returns how many were dropped.
    ///
    /// `path` is normalised the same way resolvers record dependencies.
    pub fn invalidate_file(&self, path: &Path) -> usize {
        let path = path.to_path_buf().clean();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.dependencies.contains_key(&path));
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!(
                target: "tincture::types::cache",
                "Invalidated {} entries depending on {}",
                dropped,
                path.display()
            );
        }
        dropped
    }

    pub fn entry(&self, file_path: &Path, position: usize) -> Option<Arc<TypeCacheEntry>> {
        self.entries
            .get(&cache_key(file_path, position))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeclarationKind, SourceDeclarationResolver};
    use filetime::{FileTime, set_file_mtime};
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    /// Resolver that reports fixed dependencies and counts its calls.
    struct CountingResolver {
        calls: AtomicUsize,
        extra_dependencies: Vec<PathBuf>,
        fail: bool,
    }

    impl CountingResolver {
        fn new(extra_dependencies: Vec<PathBuf>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                extra_dependencies,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TypeResolver for CountingResolver {
        fn resolve(
            &self,
            request: ResolveRequest<'_>,
            dependencies: &mut DependencySet,
        ) -> Result<ResolvedType, TypeResolveError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(TypeResolveError::Other("boom".into()));
            }
            dependencies.insert(request.file_path.to_path_buf());
            dependencies.extend(self.extra_dependencies.iter().cloned());
            Ok(ResolvedType {
                name: format!("Resolved{call}"),
                kind: DeclarationKind::Type,
                text: String::new(),
                file_path: request.file_path.to_path_buf(),
                position: request.position,
                references: Vec::new(),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        entry: PathBuf,
        dependency: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("entry.ts");
        let dependency = dir.path().join("dep.ts");
        fs::write(&entry, "export type A = B;").unwrap();
        fs::write(&dependency, "export type B = string;").unwrap();
        set_file_mtime(&entry, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        set_file_mtime(&dependency, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        Fixture {
            _dir: dir,
            entry,
            dependency,
        }
    }

    #[tokio::test]
    async fn unchanged_dependencies_reuse_entry() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(vec![fx.dependency.clone()]));

        let first = cache
            .resolve_type_at_location(&resolver, &fx.entry, 12, None, false)
            .await
            .unwrap();
        let second = cache
            .resolve_type_at_location(&resolver, &fx.entry, 12, None, false)
            .await
            .unwrap();

        assert_eq!(resolver.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[tokio::test]
    async fn touching_a_dependency_forces_recompute_and_new_snapshot() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(vec![fx.dependency.clone()]));

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        let old_snapshot = cache.entry(&fx.entry, 0).unwrap().dependencies[&fx.dependency].unwrap();

        set_file_mtime(&fx.dependency, FileTime::from_unix_time(1_700_000_100, 0)).unwrap();
        let recomputed = cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2);
        assert_eq!(recomputed.name, "Resolved2");

        let new_snapshot = cache.entry(&fx.entry, 0).unwrap().dependencies[&fx.dependency].unwrap();
        assert_eq!(new_snapshot - old_snapshot, 100_000);

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2, "fresh snapshot is reused");
    }

    #[tokio::test]
    async fn deleted_dependency_is_treated_as_changed() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(vec![fx.dependency.clone()]));

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        fs::remove_file(&fx.dependency).unwrap();

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2);
        assert_eq!(
            cache.entry(&fx.entry, 0).unwrap().dependencies[&fx.dependency],
            None
        );

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2, "still absent, entry reused");
    }

    #[tokio::test]
    async fn absent_dependency_appearing_forces_recompute() {
        let fx = fixture();
        let missing = fx.entry.with_file_name("later.ts");
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(vec![missing.clone()]));

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(cache.entry(&fx.entry, 0).unwrap().dependencies[&missing], None);

        fs::write(&missing, "export type Later = 1;").unwrap();
        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2);
        assert!(
            cache.entry(&fx.entry, 0).unwrap().dependencies[&missing].is_some()
        );
    }

    #[tokio::test]
    async fn import_created_after_caching_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("types.ts");
        fs::write(
            &entry,
            "import { Address } from \"./address\";\n\nexport interface User {\n  address: Address;\n}\n",
        )
        .unwrap();
        let position = fs::read_to_string(&entry).unwrap().find("interface").unwrap();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(SourceDeclarationResolver::new());

        let before = cache
            .resolve_type_at_location(&resolver, &entry, position, None, false)
            .await
            .unwrap();
        assert!(before.references.is_empty());

        fs::write(
            dir.path().join("address.ts"),
            "export interface Address {\n  street: string;\n}\n",
        )
        .unwrap();
        let after = cache
            .resolve_type_at_location(&resolver, &entry, position, None, false)
            .await
            .unwrap();
        assert_eq!(after.references.len(), 1);
        assert_eq!(after.references[0].name, "Address");
        assert_eq!(cache.stats().hits, 0);
    }

    /// Records which thread each resolution ran on.
    struct ThreadResolver(std::sync::Mutex<Vec<std::thread::ThreadId>>);

    impl TypeResolver for ThreadResolver {
        fn resolve(
            &self,
            request: ResolveRequest<'_>,
            dependencies: &mut DependencySet,
        ) -> Result<ResolvedType, TypeResolveError> {
            self.0.lock().unwrap().push(std::thread::current().id());
            CountingResolver::new(Vec::new()).resolve(request, dependencies)
        }
    }

    #[tokio::test]
    async fn resolution_runs_off_the_runtime_thread() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(ThreadResolver(std::sync::Mutex::new(Vec::new())));

        for is_virtual in [false, true] {
            cache
                .resolve_type_at_location(&resolver, &fx.entry, 0, None, is_virtual)
                .await
                .unwrap();
        }

        let runtime_thread = std::thread::current().id();
        let threads = resolver.0.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn virtual_lookups_bypass_the_cache() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(Vec::new()));

        for _ in 0..3 {
            cache
                .resolve_type_at_location(&resolver, &fx.entry, 0, None, true)
                .await
                .unwrap();
        }
        assert_eq!(resolver.calls(), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn positions_are_cached_independently() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(Vec::new()));

        for position in [0, 5, 0, 5] {
            cache
                .resolve_type_at_location(&resolver, &fx.entry, position, None, false)
                .await
                .unwrap();
        }
        assert_eq!(resolver.calls(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn changed_filter_recomputes() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let resolver = Arc::new(CountingResolver::new(Vec::new()));
        let filter = TypeFilter {
            references: None,
            max_depth: Some(1),
        };

        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, None, false)
            .await
            .unwrap();
        cache
            .resolve_type_at_location(&resolver, &fx.entry, 0, Some(&filter), false)
            .await
            .unwrap();
        assert_eq!(resolver.calls(), 2);
        assert_eq!(cache.entry(&fx.entry, 0).unwrap().filter, Some(filter));
    }

    #[tokio::test]
    async fn failed_resolution_drops_previous_entry() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let ok = Arc::new(CountingResolver::new(vec![fx.dependency.clone()]));
        cache
            .resolve_type_at_location(&ok, &fx.entry, 0, None, false)
            .await
            .unwrap();

        set_file_mtime(&fx.entry, FileTime::from_unix_time(1_700_000_200, 0)).unwrap();
        let failing = Arc::new(CountingResolver {
            fail: true,
            ..CountingResolver::new(Vec::new())
        });
        let err = cache
            .resolve_type_at_location(&failing, &fx.entry, 0, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TypeResolveError::Other(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_file_drops_dependents_only() {
        let fx = fixture();
        let cache = TypeResolutionCache::new();
        let with_dep = Arc::new(CountingResolver::new(vec![fx.dependency.clone()]));
        let without_dep = Arc::new(CountingResolver::new(Vec::new()));

        cache
            .resolve_type_at_location(&with_dep, &fx.entry, 0, None, false)
            .await
            .unwrap();
        cache
            .resolve_type_at_location(&without_dep, &fx.entry, 1, None, false)
            .await
            .unwrap();

        let unnormalised = fx.dependency.parent().unwrap().join(".").join("dep.ts");
        assert_eq!(cache.invalidate_file(&unnormalised), 1);
        assert!(cache.entry(&fx.entry, 0).is_none());
        assert!(cache.entry(&fx.entry, 1).is_some());
    }
}
