use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{TinctureError, TinctureResult};
use crate::theme::{Theme, ThemeRegistry, TokenStyle, compute_style_for_scopes};
use crate::tokenize::{GrammarMap, TokenizeJob, TokenizeResult, TokenizerPool};
use crate::types::{
    ResolvedType, SourceDeclarationResolver, TypeFilter, TypeResolutionCache, TypeResolver,
};

/// A declaration location to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeLocation {
    pub file_path: PathBuf,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TypeFilter>,
    /// Source that does not exist on disk as-is; never cached.
    #[serde(default)]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyledTokensRequest {
    pub grammar_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TypeLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyledToken {
    pub content: String,
    pub start: usize,
    pub end: usize,
    pub scopes: Vec<String>,
    pub style: TokenStyle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyledTokens {
    pub lines: Vec<Vec<StyledToken>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_info: Option<ResolvedType>,
    pub theme_id: String,
    pub base_color: String,
    pub truncated: bool,
}

/// Process-wide owner of the theme registry, worker pool and type cache.
///
/// Built once at startup and shared by reference with every handler.
pub struct AnalysisServices {
    themes: Arc<ThemeRegistry>,
    pool: TokenizerPool,
    types: TypeResolutionCache,
    resolver: Arc<dyn TypeResolver>,
    default_theme: Option<String>,
    time_limit_ms: Option<u64>,
}

impl AnalysisServices {
    pub fn new(themes: Arc<ThemeRegistry>, resolver: Arc<dyn TypeResolver>) -> Self {
        Self {
            pool: TokenizerPool::new(Arc::clone(&themes)),
            themes,
            types: TypeResolutionCache::new(),
            resolver,
            default_theme: None,
            time_limit_ms: None,
        }
    }

    pub fn with_default_theme(mut self, theme_id: impl Into<String>) -> Self {
        self.default_theme = Some(theme_id.into());
        self
    }

    pub fn with_time_limit(mut self, millis: u64) -> Self {
        self.time_limit_ms = Some(millis);
        self
    }

    /// Build services from settings: load every configured theme, read and
    /// register every configured grammar.
    pub async fn from_settings(settings: &Settings) -> TinctureResult<Self> {
        let themes = Arc::new(ThemeRegistry::new());
        for (id, path) in &settings.themes {
            themes.load_file(id.clone(), path)?;
        }

        let mut services = Self::new(themes, Arc::new(SourceDeclarationResolver::new()));
        services.default_theme = settings.default_theme.clone();
        services.time_limit_ms = settings.worker.time_limit_ms;

        if !settings.grammars.is_empty() {
            let mut grammars = GrammarMap::new();
            for (id, path) in &settings.grammars {
                grammars.insert(id.clone(), read_grammar(path).await?);
            }
            services.initialize_grammars(grammars).await?;
        }
        Ok(services)
    }

    pub fn themes(&self) -> &Arc<ThemeRegistry> {
        &self.themes
    }

    pub fn pool(&self) -> &TokenizerPool {
        &self.pool
    }

    pub fn types(&self) -> &TypeResolutionCache {
        &self.types
    }

    pub async fn initialize_grammars(&self, grammars: GrammarMap) -> TinctureResult<usize> {
        let count = grammars.len();
        self.pool.initialize_worker_grammars(grammars).await?;
        Ok(count)
    }

    /// Register (or replace) a theme. Returns whether an existing theme
    /// was replaced.
    pub fn register_theme(&self, id: impl Into<String>, theme: Theme) -> bool {
        self.themes.register(id, theme).is_some()
    }

    pub async fn resolve_type(&self, location: &TypeLocation) -> TinctureResult<ResolvedType> {
        let resolved = self
            .types
            .resolve_type_at_location(
                &self.resolver,
                &location.file_path,
                location.position,
                location.filter.as_ref(),
                location.is_virtual,
            )
            .await?;
        Ok(resolved)
    }

    pub fn invalidate_file(&self, path: &Path) -> usize {
        self.types.invalidate_file(path)
    }

    pub async fn raw_tokens(&self, mut job: TokenizeJob) -> TinctureResult<TokenizeResult> {
        if job.time_limit_ms.is_none() {
            job.time_limit_ms = self.time_limit_ms;
        }
        Ok(self.pool.run_tokenize_job(job).await?)
    }

    /// Type info for the location (if any), tokens from the worker, and a
    /// style per token from the selected theme. The first failing stage
    /// is returned as the error.
    pub async fn styled_tokens(&self, request: StyledTokensRequest) -> TinctureResult<StyledTokens> {
        let StyledTokensRequest {
            grammar_id,
            source,
            theme_id,
            time_limit,
            location,
        } = request;

        let type_info = match &location {
            Some(location) => Some(self.resolve_type(location).await?),
            None => None,
        };

        let theme_id = theme_id
            .or_else(|| self.default_theme.clone())
            .ok_or_else(|| TinctureError::theme("no theme selected and no default theme"))?;
        let theme = self.themes.require(&theme_id)?;

        let mut job = TokenizeJob::new(grammar_id, source);
        job.time_limit_ms = time_limit;
        let tokens = self.raw_tokens(job).await?;

        // Scope stacks repeat heavily within a file.
        let mut styles: HashMap<Vec<String>, TokenStyle> = HashMap::new();
        let lines = tokens
            .lines
            .into_iter()
            .map(|line| {
                line.into_iter()
                    .map(|token| {
                        let style = styles
                            .entry(token.scopes.clone())
                            .or_insert_with(|| compute_style_for_scopes(&token.scopes, &theme))
                            .clone();
                        StyledToken {
                            content: token.content,
                            start: token.start,
                            end: token.end,
                            scopes: token.scopes,
                            style,
                        }
                    })
                    .collect()
            })
            .collect();

        debug!(
            target: "tincture::analysis",
            "Styled tokens with theme '{}' ({} distinct scope stacks)",
            theme_id,
            styles.len()
        );

        Ok(StyledTokens {
            lines,
            type_info,
            base_color: theme.base_color().to_string(),
            theme_id,
            truncated: tokens.truncated,
        })
    }
}

async fn read_grammar(path: &Path) -> TinctureResult<String> {
    info!(target: "tincture::analysis", "Loading grammar {}", path.display());
    Ok(tokio::fs::read_to_string(path).await?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use std::fs;

    pub(crate) const TOY_GRAMMAR: &str = r#"%YAML 1.2
---
name: Toy
file_extensions: [toy]
scope: source.toy
contexts:
  main:
    - match: '\b(let|fn)\b'
      scope: keyword.declaration.toy
    - match: '\d+'
      scope: constant.numeric.toy
"#;

    pub(crate) const TOY_THEME: &str = r##"{
  "name": "Toy Dark",
  "type": "dark",
  "colors": { "editor.foreground": "#EEEEEE" },
  "tokenColors": [
    { "scope": "source", "settings": { "foreground": "#111111" } },
    { "scope": "source.toy keyword", "settings": { "foreground": "#222222", "fontStyle": "bold" } },
    { "scope": "constant.numeric", "settings": { "foreground": "#333333" } }
  ]
}"##;

    pub(crate) async fn toy_services() -> AnalysisServices {
        let themes = Arc::new(ThemeRegistry::new());
        themes.register("toy", Theme::from_json(TOY_THEME).unwrap());
        let services = AnalysisServices::new(themes, Arc::new(SourceDeclarationResolver::new()))
            .with_default_theme("toy");
        services
            .initialize_grammars(GrammarMap::from([(
                "toy".to_string(),
                TOY_GRAMMAR.to_string(),
            )]))
            .await
            .unwrap();
        services
    }

    fn request(source: &str) -> StyledTokensRequest {
        StyledTokensRequest {
            grammar_id: "toy".into(),
            source: source.into(),
            theme_id: None,
            time_limit: None,
            location: None,
        }
    }

    #[tokio::test]
    async fn styles_every_token_with_the_theme() {
        let services = toy_services().await;
        let styled = services.styled_tokens(request("let x = 42")).await.unwrap();

        assert_eq!(styled.theme_id, "toy");
        assert_eq!(styled.base_color, "#EEEEEE");
        assert!(styled.type_info.is_none());

        let line = &styled.lines[0];
        let keyword = line.iter().find(|t| t.content == "let").unwrap();
        assert_eq!(keyword.style.color.as_deref(), Some("#222222"));
        assert_eq!(keyword.style.font_weight.as_deref(), Some("bold"));

        let number = line.iter().find(|t| t.content == "42").unwrap();
        assert_eq!(number.style.color.as_deref(), Some("#333333"));

        let plain = line.iter().find(|t| t.content.contains('x')).unwrap();
        assert_eq!(plain.style.color.as_deref(), Some("#111111"));
    }

    #[tokio::test]
    async fn includes_type_info_for_the_location() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        fs::write(&file, "export type A = string;\n").unwrap();

        let services = toy_services().await;
        let mut req = request("let");
        req.location = Some(TypeLocation {
            file_path: file.clone(),
            position: 3,
            filter: None,
            is_virtual: false,
        });

        let styled = services.styled_tokens(req.clone()).await.unwrap();
        assert_eq!(styled.type_info.unwrap().name, "A");

        services.styled_tokens(req).await.unwrap();
        let stats = services.types().stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn unknown_theme_is_a_theme_error() {
        let services = toy_services().await;
        let mut req = request("let");
        req.theme_id = Some("missing".into());
        let error = services.styled_tokens(req).await.unwrap_err();
        assert_eq!(error.kind(), "themeNotFound");
    }

    #[tokio::test]
    async fn unknown_grammar_is_a_tokenize_error() {
        let services = toy_services().await;
        let mut req = request("let");
        req.grammar_id = "no-such-grammar".into();
        let error = services.styled_tokens(req).await.unwrap_err();
        assert_eq!(error.kind(), "tokenize");
    }

    #[tokio::test]
    async fn missing_declaration_file_is_a_type_error() {
        let services = toy_services().await;
        let mut req = request("let");
        req.location = Some(TypeLocation {
            file_path: PathBuf::from("/nonexistent/a.ts"),
            position: 0,
            filter: None,
            is_virtual: false,
        });
        let error = services.styled_tokens(req).await.unwrap_err();
        assert_eq!(error.kind(), "typeResolution");
    }

    #[tokio::test]
    async fn from_settings_loads_themes_and_grammars() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("toy.sublime-syntax"), TOY_GRAMMAR).unwrap();
        fs::write(dir.path().join("toy.json"), TOY_THEME).unwrap();

        let settings = Settings::from_toml_str(
            "default_theme = \"toy\"\n[grammars]\ntoy = \"toy.sublime-syntax\"\n[themes]\ntoy = \"toy.json\"\n",
        )
        .unwrap()
        .resolve_paths(dir.path());

        let services = AnalysisServices::from_settings(&settings).await.unwrap();
        assert_eq!(services.themes().ids(), vec!["toy".to_string()]);
        let styled = services.styled_tokens(request("fn")).await.unwrap();
        assert_eq!(styled.lines[0][0].style.color.as_deref(), Some("#222222"));
    }
}
