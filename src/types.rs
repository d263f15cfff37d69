//! Declaration type resolution with a dependency-tracked cache.
//!
//! - `resolver`: the [`TypeResolver`] seam and the resolved-type model
//! - `declaration`: built-in resolver for TypeScript/JavaScript-like sources
//! - `cache`: memoization keyed by `file:position`, validated by the
//!   modification times of every file the resolution touched

mod cache;
mod declaration;
mod resolver;

pub use cache::{CacheStats, TypeCacheEntry, TypeResolutionCache};
pub use declaration::SourceDeclarationResolver;
pub use resolver::{
    DeclarationKind, DependencySet, ResolveRequest, ResolvedType, TypeFilter, TypeResolveError,
    TypeResolver,
};
