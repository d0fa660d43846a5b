//! Routing proxy: the single HTTP surface in front of every slot backend.

mod relay;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_control_models::{EngineVariant, SlotConfig, SlotConfigPatch, SlotId};
use relay_protocol::StatusMessage;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use self::relay::{split_slot, wants_stream, ProxyError};
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ApiError;
use crate::registry::SlotRegistry;
use crate::supervisor::{Supervisor, SupervisorError, SupervisorOptions};

#[derive(Clone)]
pub struct ProxyState {
    pub supervisor: Arc<Supervisor>,
    pub client: reqwest::Client,
    pub control_timeout: Duration,
}

impl ProxyState {
    pub fn new(supervisor: Arc<Supervisor>, control_timeout: Duration) -> Self {
        Self {
            supervisor,
            client: reqwest::Client::new(),
            control_timeout,
        }
    }

    fn registry(&self) -> &SlotRegistry {
        self.supervisor.registry()
    }

    /// Runs a blocking supervisor call off the event loop.
    async fn supervise<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Supervisor) -> Result<T, SupervisorError> + Send + 'static,
    {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::task::spawn_blocking(move || op(&supervisor))
            .await
            .map_err(|e| ApiError::internal(format!("supervisor task failed: {}", e)))?
            .map_err(ApiError::from)
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/list_models", get(list_models))
        .route("/switch_model", post(switch_model))
        .route("/model_info", get(model_info))
        .route("/model_info/:slot", get(model_info_slot))
        .route("/is_alive", get(is_alive))
        .route("/reset_config", get(reset_config))
        .route("/reset_config/:slot", get(reset_config_slot))
        .route("/interrupt", get(interrupt_all).post(interrupt_all))
        .route("/interrupt/:slot", get(interrupt_slot).post(interrupt_slot))
        .route("/is_generating", get(is_generating))
        .route("/is_generating/:slot", get(is_generating_slot))
        .route("/reset_context", get(reset_context))
        .route("/reset_context/:slot", get(reset_context_slot))
        .fallback(passthrough)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct SlotQuery {
    slot: Option<SlotId>,
}

async fn list_models(
    State(state): State<ProxyState>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let slot = state.registry().resolve_slot(query.slot)?;
    Ok(Json(state.registry().list_models(slot)?))
}

async fn switch_model(
    State(state): State<ProxyState>,
    body: Bytes,
) -> Result<Json<StatusMessage<&'static str>>, ApiError> {
    let patch: SlotConfigPatch =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("Bad params: {}", e)))?;
    info!(patch = ?patch, "switching model");

    let (slot, config) = state.registry().prepare_switch(&patch)?;
    state
        .supervise(move |sup| sup.restart_for_new_config(slot, config))
        .await?;
    Ok(Json(StatusMessage::new("Model switch initiated")))
}

async fn model_info(State(state): State<ProxyState>) -> Response {
    let registry = state.registry();
    if !registry.is_multi_slot() {
        if let Some(cfg) = registry.live(registry.default_slot()) {
            return Json(cfg).into_response();
        }
    }
    Json(registry.all_live()).into_response()
}

async fn model_info_slot(
    State(state): State<ProxyState>,
    Path(slot): Path<SlotId>,
) -> Result<Json<SlotConfig>, ApiError> {
    state
        .registry()
        .live(slot)
        .map(Json)
        .ok_or_else(|| ConfigError::UnknownSlot(slot).into())
}

async fn is_alive(State(state): State<ProxyState>) -> Result<Json<StatusMessage<BTreeMap<SlotId, bool>>>, ApiError> {
    let liveness = state.supervise(|sup| Ok(sup.liveness())).await?;
    Ok(Json(StatusMessage::new(liveness)))
}

async fn reset_config(State(state): State<ProxyState>) -> Result<Json<StatusMessage<String>>, ApiError> {
    if state.registry().is_multi_slot() {
        return Err(ConfigError::SlotRequired.into());
    }
    let slot = state.registry().default_slot();
    restore_startup_config(&state, slot).await?;
    Ok(Json(StatusMessage::new("Reset Config".to_string())))
}

async fn reset_config_slot(
    State(state): State<ProxyState>,
    Path(slot): Path<SlotId>,
) -> Result<Json<StatusMessage<String>>, ApiError> {
    let slot = state.registry().resolve_slot(Some(slot))?;
    restore_startup_config(&state, slot).await?;
    Ok(Json(StatusMessage::new(format!("Reset Config for {}", slot))))
}

async fn restore_startup_config(state: &ProxyState, slot: SlotId) -> Result<(), ApiError> {
    let initial = state.registry().reset(slot)?;
    state
        .supervise(move |sup| sup.restart_for_new_config(slot, initial))
        .await
}

async fn interrupt_all(State(state): State<ProxyState>) -> Json<StatusMessage<&'static str>> {
    for slot in state.registry().slot_ids() {
        if let Err(err) = interrupt_one(&state, slot).await {
            warn!(slot = %slot, error = %err.message, "interrupt failed");
        }
    }
    Json(StatusMessage::new("Interrupted all models"))
}

async fn interrupt_slot(
    State(state): State<ProxyState>,
    Path(slot): Path<SlotId>,
) -> Result<Json<StatusMessage<String>>, ApiError> {
    let slot = state.registry().resolve_slot(Some(slot))?;
    interrupt_one(&state, slot).await?;
    Ok(Json(StatusMessage::new(format!("Interrupted slot {}", slot))))
}

/// Native backends expose `/interrupt`; llama-server only understands SIGINT.
async fn interrupt_one(state: &ProxyState, slot: SlotId) -> Result<(), ApiError> {
    let engine = state
        .registry()
        .live(slot)
        .map(|cfg| cfg.engine)
        .ok_or(ConfigError::UnknownSlot(slot))?;
    match engine {
        EngineVariant::Native => {
            let response = relay::forward(state, slot, Method::GET, "interrupt", None, Bytes::new()).await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(ApiError {
                    status: response.status(),
                    message: format!("backend for slot {} refused the interrupt", slot),
                })
            }
        }
        EngineVariant::LlamaServer => state.supervise(move |sup| sup.signal_interrupt(slot)).await,
    }
}

async fn is_generating(State(state): State<ProxyState>) -> Result<Response, ApiError> {
    forward_control(&state, None, "is_generating").await
}

async fn is_generating_slot(State(state): State<ProxyState>, Path(slot): Path<SlotId>) -> Result<Response, ApiError> {
    forward_control(&state, Some(slot), "is_generating").await
}

async fn reset_context(State(state): State<ProxyState>) -> Result<Response, ApiError> {
    forward_control(&state, None, "reset_context").await
}

async fn reset_context_slot(State(state): State<ProxyState>, Path(slot): Path<SlotId>) -> Result<Response, ApiError> {
    forward_control(&state, Some(slot), "reset_context").await
}

async fn forward_control(state: &ProxyState, slot: Option<SlotId>, endpoint: &str) -> Result<Response, ApiError> {
    let slot = state.registry().resolve_slot(slot)?;
    relay::forward(state, slot, Method::GET, endpoint, None, Bytes::new()).await
}

/// Any other path: `/{slot}/{endpoint}` or `/{endpoint}` for the default slot.
async fn passthrough(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    if method != Method::GET && method != Method::POST {
        return Err(ProxyError::MethodNotAllowed.into());
    }
    let (slot, endpoint) = split_slot(uri.path());
    let slot = state.registry().resolve_slot(slot)?;
    relay::forward(&state, slot, method, &endpoint, uri.query(), body).await
}

/// Loads the slot table, launches every backend and serves the proxy until shutdown.
pub async fn serve(config: ProxyConfig) -> anyhow::Result<()> {
    let slots = config.slot_table()?;
    let ports = slots
        .keys()
        .map(|id| Ok((*id, config.port_for(*id)?)))
        .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
    let registry = Arc::new(SlotRegistry::new(slots)?);
    let supervisor = Arc::new(Supervisor::new(
        registry,
        &ports,
        SupervisorOptions {
            backend_host: config.backend_host.clone(),
            ready_timeout: config.ready_timeout(),
            stop_timeout: config.stop_timeout(),
        },
    )?);

    let starter = Arc::clone(&supervisor);
    if let Err(err) = tokio::task::spawn_blocking(move || starter.start_all()).await? {
        let stopper = Arc::clone(&supervisor);
        tokio::task::spawn_blocking(move || stopper.stop_all()).await?;
        return Err(err.into());
    }

    let app = router(ProxyState::new(Arc::clone(&supervisor), config.control_timeout()));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, slots = ports.len(), "routing proxy listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await;

    info!("stopping backends");
    tokio::task::spawn_blocking(move || supervisor.stop_all()).await?;
    served?;
    Ok(())
}
