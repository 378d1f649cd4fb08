//! Mock collaborator server
//!
//! Serves the ledger, directory and event schedule contracts from one
//! process so the access point API can run locally without the shop's
//! database.
//!
//! Endpoints:
//! - `GET /ledger_items?contact_id=&limit=&offset=[&date=][&amount=]`
//! - `POST /ledger_items` - 201 on append, 409 when `prev_ledger_item` is stale
//! - `GET /access_points[?origin=]`
//! - `GET /access_points/{id}/error_codes`
//! - `GET /contacts?card=`
//! - `GET /events?group=&page=`
//!
//! Usage:
//!   cargo run --bin mock_ledger -- --port 8089 --fixture config/mock_ledger.toml

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Local, NaiveDate, Utc};
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use machinetime::domain::{
    AccessPoint, AccessPointId, CardId, Contact, ContactId, LedgerEntry, Membership, Rate,
};
use machinetime::io::wire::{AccessPointRow, ContactRow};
use machinetime::io::schedule::EventRow;
use machinetime::io::{
    CollaboratorError, Directory, EventSchedule, LedgerQuery, LedgerService, MemoryDirectory,
    MemoryLedger, ScheduledEvent, StaticSchedule,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock_ledger")]
#[command(about = "Mock ledger, directory and schedule for local runs")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "8089")]
    port: u16,

    /// Fixture describing access points, card holders and events
    #[arg(short, long, default_value = "config/mock_ledger.toml")]
    fixture: String,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    access_points: Vec<AccessPointFixture>,
    #[serde(default)]
    contacts: Vec<ContactFixture>,
    #[serde(default)]
    error_labels: Vec<LabelFixture>,
    #[serde(default)]
    events: Vec<EventFixture>,
}

#[derive(Debug, Deserialize)]
struct AccessPointFixture {
    origin: IpAddr,
    id: u64,
    short_name: String,
    /// Minor units per hour
    member_rate: i64,
    non_member_rate: i64,
    #[serde(default)]
    non_member_perdiem: Option<i64>,
    #[serde(default = "default_operational")]
    operational: bool,
    #[serde(default)]
    open_hours_label: Option<String>,
}

fn default_operational() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ContactFixture {
    card: String,
    contact_id: u64,
    display_name: String,
    member: bool,
    #[serde(default)]
    member_store: i64,
    #[serde(default)]
    pocket_store: i64,
}

#[derive(Debug, Deserialize)]
struct LabelFixture {
    access_point_id: u64,
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct EventFixture {
    name: String,
    /// Start relative to server startup, may be negative
    starts_in_minutes: i64,
}

struct MockState {
    ledger: MemoryLedger,
    directory: MemoryDirectory,
    schedule: StaticSchedule,
}

impl MockState {
    fn from_fixture(fixture: Fixture) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let ledger = MemoryLedger::new();
        let directory = MemoryDirectory::new();
        let now = Utc::now();

        for ap in fixture.access_points {
            directory.add_access_point(
                ap.origin,
                AccessPoint {
                    id: AccessPointId(ap.id),
                    short_name: ap.short_name,
                    member_rate: Rate::per_hour(ap.member_rate),
                    non_member_rate: Rate::per_hour(ap.non_member_rate),
                    non_member_perdiem: ap.non_member_perdiem,
                    operational: ap.operational,
                    open_hours_label: ap.open_hours_label,
                },
            );
        }
        for contact in fixture.contacts {
            CardId::parse(&contact.card)?;
            let id = ContactId(contact.contact_id);
            let membership =
                if contact.member { Membership::Member } else { Membership::NonMember };
            directory.add_contact(
                &contact.card,
                Contact { id, display_name: contact.display_name, membership },
            );
            ledger.seed_balance(
                id,
                contact.member_store,
                contact.pocket_store,
                Local::now().naive_local(),
            );
        }
        for label in fixture.error_labels {
            directory.add_error_label(AccessPointId(label.access_point_id), &label.key, &label.value);
        }
        let events = fixture
            .events
            .into_iter()
            .map(|e| ScheduledEvent {
                name: e.name,
                start: now + ChronoDuration::minutes(e.starts_in_minutes),
            })
            .collect();

        Ok(Self { ledger, directory, schedule: StaticSchedule::new(events) })
    }
}

type MockResponse = Response<Full<Bytes>>;
type Params = FxHashMap<String, String>;

fn json<T: Serialize>(status: StatusCode, body: &T) -> MockResponse {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response should not fail")
}

fn status(status: StatusCode) -> MockResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response should not fail")
}

fn error_response(e: &CollaboratorError) -> MockResponse {
    match e {
        CollaboratorError::NotFound => status(StatusCode::NOT_FOUND),
        CollaboratorError::Conflict => status(StatusCode::CONFLICT),
        _ => status(StatusCode::SERVICE_UNAVAILABLE),
    }
}

fn ledger_query(params: &Params) -> Option<LedgerQuery> {
    let contact_id = ContactId(params.get("contact_id")?.parse().ok()?);
    let limit = params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(15);
    let offset = params.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
    let mut query = LedgerQuery::page(contact_id, limit, offset);
    if let Some(date) = params.get("date") {
        query = query.with_date(NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?);
    }
    if let Some(amount) = params.get("amount") {
        query = query.with_amount(amount.parse().ok()?);
    }
    Some(query)
}

async fn route(req: Request<hyper::body::Incoming>, state: &MockState) -> MockResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let params: Params = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    match (&method, path.as_str()) {
        (&Method::GET, "/ledger_items") => {
            let Some(query) = ledger_query(&params) else {
                return status(StatusCode::BAD_REQUEST);
            };
            match state.ledger.get(&query).await {
                Ok(records) => json(StatusCode::OK, &records),
                Err(e) => error_response(&e),
            }
        }
        (&Method::POST, "/ledger_items") => {
            let body = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(_) => return status(StatusCode::BAD_REQUEST),
            };
            let entry: LedgerEntry = match serde_json::from_slice(&body) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "ledger_entry_rejected");
                    return status(StatusCode::BAD_REQUEST);
                }
            };
            match state.ledger.create(&entry).await {
                Ok(record) => {
                    info!(
                        id = %record.id(),
                        contact_id = %record.contact_id(),
                        amount = %record.amount(),
                        "ledger_item_created"
                    );
                    json(StatusCode::CREATED, &record)
                }
                Err(e) => {
                    warn!(contact_id = %entry.contact_id, error = %e, "ledger_item_rejected");
                    error_response(&e)
                }
            }
        }
        (&Method::GET, "/access_points") => match params.get("origin") {
            Some(origin) => {
                let Ok(origin) = origin.parse::<IpAddr>() else {
                    return json(StatusCode::OK, &Vec::<AccessPointRow>::new());
                };
                match state.directory.access_point_by_origin(origin).await {
                    Ok(ap) => json(StatusCode::OK, &[AccessPointRow::from(&ap)]),
                    Err(CollaboratorError::NotFound) => {
                        json(StatusCode::OK, &Vec::<AccessPointRow>::new())
                    }
                    Err(e) => error_response(&e),
                }
            }
            None => match state.directory.access_points().await {
                Ok(aps) => {
                    json(StatusCode::OK, &aps.iter().map(AccessPointRow::from).collect::<Vec<_>>())
                }
                Err(e) => error_response(&e),
            },
        },
        (&Method::GET, "/contacts") => {
            let Some(card) = params.get("card").and_then(|c| CardId::parse(c).ok()) else {
                return json(StatusCode::OK, &Vec::<ContactRow>::new());
            };
            match state.directory.contact_by_card(&card).await {
                Ok(contact) => json(StatusCode::OK, &[ContactRow::from(&contact)]),
                Err(CollaboratorError::NotFound) => json(StatusCode::OK, &Vec::<ContactRow>::new()),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, "/events") => {
            let limit = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(5);
            match state.schedule.upcoming(limit).await {
                Ok(events) => {
                    json(StatusCode::OK, &events.iter().map(EventRow::from).collect::<Vec<_>>())
                }
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, p) => {
            let id = p
                .strip_prefix("/access_points/")
                .and_then(|rest| rest.strip_suffix("/error_codes"))
                .and_then(|id| id.parse().ok());
            match id {
                Some(id) => match state.directory.error_labels(AccessPointId(id)).await {
                    Ok(labels) => json(StatusCode::OK, &labels),
                    Err(e) => error_response(&e),
                },
                None => status(StatusCode::NOT_FOUND),
            }
        }
        _ => status(StatusCode::NOT_FOUND),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let content = std::fs::read_to_string(&args.fixture)?;
    let fixture: Fixture = toml::from_str(&content)?;
    let state = Arc::new(MockState::from_fixture(fixture)?);

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = %args.port, fixture = %args.fixture, "mock_ledger_started");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, &state).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "mock_http_error");
            }
        });
    }
}
