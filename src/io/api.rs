//! Access point HTTP API
//!
//! Routes:
//! - `POST /machine` (form: apikey, uuid) - tap-in check
//! - `POST /machine/job` (form: apikey, uuid, jobtime) - charge a finished job
//! - `GET /machine/job?uuid=&page=` - job history, 15 records per page
//! - `GET /environment?apikey=` - access point names and UI labels
//! - `GET /metrics`, `GET /health`
//!
//! Callers are identified by their network origin. Unknown origins and wrong
//! keys get the same bare 404 as unknown paths.

use crate::domain::{AccessPoint, BalanceSnapshot, ChargeRecord, Decision, ErrorCode, Membership};
use crate::infra::config::Config;
use crate::infra::context::AppContext;
use crate::io::prometheus::format_prometheus_metrics;
use crate::io::rest::CollaboratorError;
use crate::services::access::{AccessDecider, AccessPointError, JobError};
use crate::services::charge::ChargeError;
use crate::services::records::RecordsService;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

/// Largest accepted form body
const MAX_FORM_BYTES: usize = 4096;

type ApiResponse = Response<Full<Bytes>>;
type Params = FxHashMap<String, String>;

/// Shared request handling state
pub struct ApiState {
    ctx: AppContext,
    decider: AccessDecider,
    records: RecordsService,
}

impl ApiState {
    pub fn new(ctx: AppContext) -> Self {
        let decider = AccessDecider::new(&ctx);
        let records = RecordsService::new(&ctx);
        Self { ctx, decider, records }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }
}

#[derive(Serialize)]
struct AccessResponse<'a> {
    #[serde(flatten)]
    decision: Decision,
    access_point_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    membership: Option<Membership>,
    #[serde(flatten)]
    balance: Option<&'a BalanceSnapshot>,
}

#[derive(Serialize)]
struct JobResponse<'a> {
    #[serde(flatten)]
    decision: Decision,
    access_point_id: String,
    display_name: &'a str,
    membership: Membership,
    charges: &'a [ChargeRecord],
    #[serde(flatten)]
    balance: &'a BalanceSnapshot,
}

#[derive(Serialize)]
struct ErrorResponse {
    #[serde(flatten)]
    decision: Decision,
    error: String,
}

impl ErrorResponse {
    fn new(code: ErrorCode, error: impl ToString) -> Self {
        Self { decision: Decision::deny(code), error: error.to_string() }
    }
}

fn no_cache(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("Cache-Control", "no-cache, no-store, must-revalidate")
        .header("Pragma", "no-cache")
        .header("Expires", "0")
        .header("Content-Type", "application/json")
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> ApiResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => no_cache(status)
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "response_encode_failed");
            no_cache(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"{}")))
                .expect("static response should not fail")
        }
    }
}

fn not_found() -> ApiResponse {
    no_cache(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(br#"{"error":"not found"}"#)))
        .expect("static response should not fail")
}

fn invalid_input(message: &str) -> ApiResponse {
    json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(ErrorCode::InvalidInput, message))
}

/// Constant-time comparison of the shared secret
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len()
        && provided.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Whether a request carrying `provided` passes the shared-secret check
fn key_accepted(config: &Config, provided: Option<&String>) -> bool {
    if !config.api_key_enabled() {
        return true;
    }
    let expected = config.api_key();
    match provided {
        Some(key) if !expected.is_empty() => secrets_match(key.as_bytes(), expected.as_bytes()),
        _ => false,
    }
}

fn query_params(req: &Request<hyper::body::Incoming>) -> Params {
    req.uri()
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

async fn form_params(req: Request<hyper::body::Incoming>) -> Result<Params, ApiResponse> {
    let body = Limited::new(req.into_body(), MAX_FORM_BYTES)
        .collect()
        .await
        .map_err(|e| {
            warn!(error = %e, "form_body_rejected");
            invalid_input("unreadable form body")
        })?
        .to_bytes();
    Ok(form_urlencoded::parse(&body).into_owned().collect())
}

/// Malformed input is a 400 on every route; any other verdict is a 200
fn tap_in_status(decision: &Decision) -> StatusCode {
    if decision.error_code == ErrorCode::InvalidInput {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    }
}

fn job_error_status(err: &JobError) -> StatusCode {
    match err {
        JobError::InvalidInput(_) | JobError::Charge(ChargeError::AmountOverflow { .. }) => {
            StatusCode::BAD_REQUEST
        }
        JobError::OutOfService | JobError::UnknownCard => StatusCode::OK,
        JobError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Charge(ChargeError::StaleBalance { .. }) => StatusCode::CONFLICT,
        JobError::Charge(ChargeError::Ledger(CollaboratorError::OutcomeUnknown(_))) => {
            StatusCode::BAD_GATEWAY
        }
        JobError::Charge(ChargeError::Ledger(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn job_error_response(err: &JobError) -> ApiResponse {
    json_response(job_error_status(err), &ErrorResponse::new(err.error_code(), err))
}

impl ApiState {
    async fn access_point(&self, origin: IpAddr) -> Result<AccessPoint, ApiResponse> {
        match self.decider.resolve_access_point(origin).await {
            Ok(ap) => Ok(ap),
            Err(AccessPointError::Unrecognized(_)) => Err(not_found()),
            Err(e) => Err(json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorResponse::new(e.error_code(), &e),
            )),
        }
    }

    async fn tap_in(&self, req: Request<hyper::body::Incoming>, origin: IpAddr) -> ApiResponse {
        let ap = match self.access_point(origin).await {
            Ok(ap) => ap,
            Err(response) => return response,
        };
        let form = match form_params(req).await {
            Ok(form) => form,
            Err(response) => return response,
        };
        if !key_accepted(&self.ctx.config, form.get("apikey")) {
            warn!(origin = %origin, access_point_id = %ap.id, "api_key_rejected");
            return not_found();
        }
        let Some(card) = form.get("uuid") else {
            return invalid_input("missing uuid");
        };

        let outcome = self.decider.check(&ap, card).await;
        json_response(
            tap_in_status(&outcome.decision),
            &AccessResponse {
                decision: outcome.decision,
                access_point_id: ap.id.to_string(),
                display_name: outcome.contact.as_ref().map(|c| c.display_name.as_str()),
                membership: outcome.contact.as_ref().map(|c| c.membership),
                balance: outcome.balance.as_ref(),
            },
        )
    }

    async fn job_charge(&self, req: Request<hyper::body::Incoming>, origin: IpAddr) -> ApiResponse {
        let ap = match self.access_point(origin).await {
            Ok(ap) => ap,
            Err(response) => return response,
        };
        let form = match form_params(req).await {
            Ok(form) => form,
            Err(response) => return response,
        };
        if !key_accepted(&self.ctx.config, form.get("apikey")) {
            warn!(origin = %origin, access_point_id = %ap.id, "api_key_rejected");
            return not_found();
        }
        let (Some(card), Some(jobtime)) = (form.get("uuid"), form.get("jobtime")) else {
            return invalid_input("missing uuid or jobtime");
        };

        match self.decider.charge_job(&ap, card, jobtime).await {
            Ok(outcome) => json_response(
                StatusCode::OK,
                &JobResponse {
                    decision: outcome.decision,
                    access_point_id: ap.id.to_string(),
                    display_name: &outcome.contact.display_name,
                    membership: outcome.contact.membership,
                    charges: &outcome.records,
                    balance: &outcome.balance,
                },
            ),
            Err(e) => job_error_response(&e),
        }
    }

    async fn job_history(&self, req: Request<hyper::body::Incoming>, origin: IpAddr) -> ApiResponse {
        let ap = match self.access_point(origin).await {
            Ok(ap) => ap,
            Err(response) => return response,
        };
        let params = query_params(&req);
        let card = params.get("uuid").map(String::as_str).unwrap_or_default();
        let page = params.get("page").map(String::as_str);

        match self.records.job_history(&ap, card, page).await {
            Ok(records) => json_response(StatusCode::OK, &records),
            Err(e) => job_error_response(&e),
        }
    }

    async fn environment(&self, req: Request<hyper::body::Incoming>, origin: IpAddr) -> ApiResponse {
        let ap = match self.access_point(origin).await {
            Ok(ap) => ap,
            Err(response) => return response,
        };
        let params = query_params(&req);
        if !key_accepted(&self.ctx.config, params.get("apikey")) {
            warn!(origin = %origin, access_point_id = %ap.id, "api_key_rejected");
            return not_found();
        }

        match self.records.environment(&ap).await {
            Ok(environment) => json_response(StatusCode::OK, &environment),
            Err(e) => {
                self.ctx.metrics.record_collaborator_failure();
                warn!(access_point_id = %ap.id, error = %e, "environment_lookup_failed");
                json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &ErrorResponse::new(ErrorCode::UpstreamUnreachable, &e),
                )
            }
        }
    }
}

async fn route(req: Request<hyper::body::Incoming>, origin: IpAddr, state: &ApiState) -> ApiResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/machine") => state.tap_in(req, origin).await,
        (&Method::POST, "/machine/job") => state.job_charge(req, origin).await,
        (&Method::GET, "/machine/job") => state.job_history(req, origin).await,
        (&Method::GET, "/environment") => state.environment(req, origin).await,
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.ctx.metrics, state.ctx.config.site_id());
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail"),
        _ => not_found(),
    }
}

/// Handle one HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    origin: IpAddr,
    state: Arc<ApiState>,
) -> Result<ApiResponse, Infallible> {
    let request_id = Uuid::now_v7();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route(req, origin, &state).await;

    info!(
        request_id = %request_id,
        origin = %origin,
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        elapsed_us = %started.elapsed().as_micros(),
        "api_request"
    );
    Ok(response)
}

/// Bind the configured address and serve until shutdown
pub async fn start_api_server(
    state: Arc<ApiState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = &state.context().config;
    let listener = TcpListener::bind((config.bind_address(), config.port())).await?;
    serve(listener, state, shutdown).await
}

/// Serve the API on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, site = %state.ctx.config.site_id(), "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let origin = peer.ip().to_canonical();
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, origin, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
