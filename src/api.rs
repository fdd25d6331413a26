use crate::auth::{AuthHeaders, DeviceAuthenticator};
use crate::auth_middleware::AdminAuth;
use crate::config::Settings;
use crate::context::GatewayContext;
use crate::error::ProtocolError;
use crate::gateway::SignalGateway;
use crate::keystore::DeviceKeyStore;
use crate::ledger::PositionLedger;
use crate::metrics;
use crate::model::{
    AckRequest, ClosePositionRequest, DecisionRequest, NewSignalRequest, PollBatch,
    RegisterDeviceRequest, RegisterDeviceResponse, RotateKeyResponse,
};
use crate::persistence::redb_store::{RedbStore, StoreError};
use crate::persistence::store::TrustStore;
use crate::replay::{RedbNonceStore, ReplayGuard};
use actix_web::dev::HttpServiceFactory;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Everything the handlers share. Assembled once at boot (or per test
/// fixture) and cloned into the actix data slot.
pub struct AppState {
    pub store: Arc<TrustStore>,
    pub keystore: Arc<DeviceKeyStore>,
    pub replay: Arc<ReplayGuard>,
    pub gateway: Arc<SignalGateway>,
    pub ledger: Arc<PositionLedger>,
    pub authenticator: Arc<DeviceAuthenticator>,
}

impl AppState {
    /// Wire the full component stack over one redb database.
    pub fn assemble(settings: &Settings, ctx: GatewayContext) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&settings.storage.data_dir)?;
        let db_path = std::path::Path::new(&settings.storage.data_dir).join("trust.redb");
        let redb = Arc::new(RedbStore::new(db_path)?);

        let store = Arc::new(TrustStore::new(redb.clone()));
        let keystore = Arc::new(DeviceKeyStore::new(
            store.clone(),
            ctx.clone(),
            settings.protocol.rotation_grace_secs,
            settings.protocol.key_retention_secs,
        ));
        let replay = Arc::new(ReplayGuard::new(
            Arc::new(RedbNonceStore::new(redb)),
            ctx.clone(),
            settings.protocol.timestamp_tolerance_secs,
            settings.protocol.nonce_ttl_secs,
        ));
        let ledger = Arc::new(PositionLedger::new(store.clone(), ctx.clone()));
        let gateway = Arc::new(SignalGateway::new(
            store.clone(),
            keystore.clone(),
            ledger.clone(),
            ctx,
            settings.protocol.max_poll_batch,
        ));
        let authenticator = Arc::new(DeviceAuthenticator::new(
            store.clone(),
            keystore.clone(),
            replay.clone(),
        ));

        Ok(Self {
            store,
            keystore,
            replay,
            gateway,
            ledger,
            authenticator,
        })
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn metrics_endpoint() -> impl Responder {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

// --- Device protocol surface ---

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub since: Option<String>,
}

pub async fn poll(
    req: HttpRequest,
    query: web::Query<PollQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let started = Instant::now();
    let headers = AuthHeaders::from_request(&req)?;
    // The canonical path excludes the query string; `since` is a paging
    // hint, not an authenticated field
    let device = state
        .authenticator
        .authenticate("GET", req.path(), b"", &headers)
        .await?;

    let since = match &query.since {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| {
                    ProtocolError::MalformedRequest(format!("since is not valid ISO-8601: {:?}", raw))
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let response = match state.gateway.poll(&device, since)? {
        Some(envelope) => HttpResponse::Ok().json(envelope),
        None => HttpResponse::Ok().json(PollBatch {
            signals: Vec::new(),
        }),
    };
    metrics::observe_poll_latency(started.elapsed().as_secs_f64());
    Ok(response)
}

pub async fn ack(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let headers = AuthHeaders::from_request(&req)?;
    // The signature covers the raw body bytes, so the payload is taken as
    // `web::Bytes` and parsed only after the gate passes
    let device = state
        .authenticator
        .authenticate("POST", req.path(), &body, &headers)
        .await?;

    let request: AckRequest = serde_json::from_slice(&body)
        .map_err(|e| ProtocolError::MalformedRequest(format!("ack body: {}", e)))?;
    let response = state.gateway.ack(&device, &request)?;
    Ok(HttpResponse::Created().json(response))
}

// --- Admin surface ---

pub async fn register_device(
    body: web::Json<RegisterDeviceRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let (device, key) = state.keystore.register(&body.client_id)?;
    Ok(HttpResponse::Created().json(RegisterDeviceResponse {
        device_id: device.device_id,
        client_id: device.client_id,
        key_b64: key.material_b64,
        key_version: key.version,
    }))
}

pub async fn rotate_key(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let device_id = path.into_inner();
    let device = state
        .store
        .load_device(&device_id)?
        .ok_or(ProtocolError::NotFound)?;
    if device.revoked {
        return Err(ProtocolError::MalformedRequest(
            "cannot rotate a revoked device".to_string(),
        ));
    }
    let key = state.keystore.rotate(&device)?;
    Ok(HttpResponse::Ok().json(RotateKeyResponse {
        device_id: device.device_id,
        key_b64: key.material_b64,
        key_version: key.version,
    }))
}

pub async fn revoke_device(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let device_id = path.into_inner();
    let device = state
        .store
        .load_device(&device_id)?
        .ok_or(ProtocolError::NotFound)?;
    let revoked = state.keystore.revoke(&device)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "device_id": revoked.device_id,
        "revoked": revoked.revoked,
        "revoked_at": revoked.revoked_at,
    })))
}

pub async fn create_signal(
    body: web::Json<NewSignalRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let signal = state.gateway.create_signal(&body)?;
    Ok(HttpResponse::Created().json(signal))
}

pub async fn decide_signal(
    path: web::Path<String>,
    body: web::Json<DecisionRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let signal = state.gateway.decide(&path.into_inner(), body.decision)?;
    Ok(HttpResponse::Ok().json(signal))
}

#[derive(Debug, Deserialize)]
pub struct PositionQuery {
    pub client_id: Option<String>,
}

pub async fn list_positions(
    query: web::Query<PositionQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let positions = state.ledger.positions(query.client_id.as_deref())?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "positions": positions })))
}

pub async fn close_position(
    path: web::Path<String>,
    body: web::Json<ClosePositionRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProtocolError> {
    let position = state
        .ledger
        .close_position(&path.into_inner(), body.reason.as_deref())?
        .ok_or(ProtocolError::NotFound)?;
    Ok(HttpResponse::Ok().json(position))
}

// --- Routing ---

pub fn public_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(metrics_endpoint)))
        .service(web::resource("/poll").route(web::get().to(poll)))
        .service(web::resource("/ack").route(web::post().to(ack)));
}

pub fn admin_scope(api_key: Option<String>) -> impl HttpServiceFactory {
    web::scope("/admin")
        .wrap(AdminAuth::new(api_key))
        .service(web::resource("/devices").route(web::post().to(register_device)))
        .service(web::resource("/devices/{device_id}/rotate").route(web::post().to(rotate_key)))
        .service(web::resource("/devices/{device_id}/revoke").route(web::post().to(revoke_device)))
        .service(web::resource("/signals").route(web::post().to(create_signal)))
        .service(
            web::resource("/signals/{signal_id}/decision").route(web::post().to(decide_signal)),
        )
        .service(web::resource("/positions").route(web::get().to(list_positions)))
        .service(
            web::resource("/positions/{position_id}/close").route(web::post().to(close_position)),
        )
}
