//! RPC surface of the analysis services.
//!
//! | method                | params                       | result                 |
//! |-----------------------|------------------------------|------------------------|
//! | `tokens/styled`       | `StyledTokensRequest`        | `StyledTokens`         |
//! | `tokens/raw`          | `TokenizeJob`                | `TokenizeResult`       |
//! | `types/resolve`       | `TypeLocation`               | `ResolvedType`         |
//! | `types/invalidate`    | `{ filePath }`               | `{ dropped }`          |
//! | `grammars/initialize` | `{ grammars: { id: yaml } }` | `{ count }`            |
//! | `themes/register`     | `{ id, theme }`              | `{ id, replaced }`     |
//! | `protocol/version`    | none                         | `{ protocol, server }` |
//!
//! `themes/register` broadcasts `themes:updated` and `types/invalidate`
//! broadcasts `types:invalidated` to every connected peer.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::services::{AnalysisServices, StyledTokensRequest, TypeLocation};
use crate::rpc::{ErrorObject, RpcServer};
use crate::theme::{RawTheme, Theme};
use crate::tokenize::{GrammarMap, TokenizeJob};

pub const TOKENS_STYLED: &str = "tokens/styled";
pub const TOKENS_RAW: &str = "tokens/raw";
pub const TYPES_RESOLVE: &str = "types/resolve";
pub const TYPES_INVALIDATE: &str = "types/invalidate";
pub const GRAMMARS_INITIALIZE: &str = "grammars/initialize";
pub const THEMES_REGISTER: &str = "themes/register";

pub const THEMES_UPDATED: &str = "themes:updated";
pub const TYPES_INVALIDATED: &str = "types:invalidated";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvalidateParams {
    file_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct GrammarParams {
    grammars: GrammarMap,
}

#[derive(Debug, Deserialize)]
struct ThemeParams {
    id: String,
    theme: RawTheme,
}

pub struct AnalysisServer {
    services: Arc<AnalysisServices>,
    rpc: RpcServer,
}

impl AnalysisServer {
    pub fn new(services: Arc<AnalysisServices>) -> Self {
        let server = Self {
            services,
            rpc: RpcServer::new(),
        };
        server.register_methods();
        server
    }

    pub fn services(&self) -> &Arc<AnalysisServices> {
        &self.services
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        self.rpc.serve(listener, shutdown).await;
    }

    fn register_methods(&self) {
        self.route(TOKENS_STYLED, |services, request: StyledTokensRequest| async move {
            Ok(services.styled_tokens(request).await?)
        });

        self.route(TOKENS_RAW, |services, job: TokenizeJob| async move {
            Ok(services.raw_tokens(job).await?)
        });

        self.route(TYPES_RESOLVE, |services, location: TypeLocation| async move {
            Ok(services.resolve_type(&location).await?)
        });

        let rpc = self.rpc.clone();
        self.route(TYPES_INVALIDATE, move |services, params: InvalidateParams| {
            let rpc = rpc.clone();
            async move {
                let dropped = services.invalidate_file(&params.file_path);
                rpc.broadcast(
                    TYPES_INVALIDATED,
                    json!({
                        "filePath": params.file_path.display().to_string(),
                        "dropped": dropped,
                    }),
                );
                Ok(json!({ "dropped": dropped }))
            }
        });

        self.route(GRAMMARS_INITIALIZE, |services, params: GrammarParams| async move {
            let count = services.initialize_grammars(params.grammars).await?;
            Ok(json!({ "count": count }))
        });

        let rpc = self.rpc.clone();
        self.route(THEMES_REGISTER, move |services, params: ThemeParams| {
            let rpc = rpc.clone();
            async move {
                let ThemeParams { id, theme } = params;
                let replaced = services.register_theme(id.clone(), Theme::new(theme));
                info!(
                    target: "tincture::analysis",
                    "Theme '{}' {} over RPC",
                    id,
                    if replaced { "replaced" } else { "registered" }
                );
                rpc.broadcast(THEMES_UPDATED, json!({ "id": id }));
                Ok(json!({ "id": id, "replaced": replaced }))
            }
        });
    }

    /// Register a method whose params deserialize into `P`.
    ///
    /// Params that do not fit `P` are answered with `-32602`.
    fn route<P, R, F, Fut>(&self, method: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(Arc<AnalysisServices>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorObject>> + Send + 'static,
    {
        let services = Arc::clone(&self.services);
        let handler = Arc::new(handler);
        self.rpc.register(method, move |params| {
            let services = Arc::clone(&services);
            let handler = Arc::clone(&handler);
            async move {
                let params: P = serde_json::from_value(params).map_err(ErrorObject::invalid_params)?;
                let result = handler(services, params).await?;
                serde_json::to_value(result).map_err(|e| ErrorObject::internal(e.to_string()))
            }
        });
    }
}
