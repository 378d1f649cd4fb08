//! End-to-end tests of the access point API over in-memory collaborators

use chrono::{Duration, Local, TimeZone};
use machinetime::domain::{AccessPoint, AccessPointId, Contact, ContactId, Membership, Rate};
use machinetime::infra::{AppContext, Clock, Config, ManualClock};
use machinetime::io::{serve, ApiState, MemoryDirectory, MemoryLedger};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use url::form_urlencoded;

const API_KEY: &str = "shop-secret";
const MEMBER_CARD: &str = "04A1B2C3";
const GUEST_CARD: &str = "04D5E6F7A8";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    ledger: Arc<MemoryLedger>,
    directory: Arc<MemoryDirectory>,
    clock: Arc<ManualClock>,
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    async fn start() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());

        directory.add_access_point(
            IpAddr::from([127, 0, 0, 1]),
            AccessPoint {
                id: AccessPointId(1),
                short_name: "Laser".to_string(),
                member_rate: Rate::per_hour(600),
                non_member_rate: Rate::per_hour(1200),
                non_member_perdiem: Some(200),
                operational: true,
                open_hours_label: None,
            },
        );
        directory.add_contact(
            MEMBER_CARD,
            Contact {
                id: ContactId(42),
                display_name: "Ada".to_string(),
                membership: Membership::Member,
            },
        );
        directory.add_contact(
            GUEST_CARD,
            Contact {
                id: ContactId(77),
                display_name: "Bo".to_string(),
                membership: Membership::NonMember,
            },
        );
        // Midday so a test never straddles a date change
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
        ));
        let now = clock.now().naive_local();
        ledger.seed_balance(ContactId(42), 5000, 2000, now);
        ledger.seed_balance(ContactId(77), 0, 3500, now);

        let ctx = AppContext::with_collaborators(
            Config::default().with_api_key(API_KEY),
            ledger.clone(),
            directory.clone(),
            None,
            clock.clone(),
        );
        let state = Arc::new(ApiState::new(ctx));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, state, shutdown_rx));

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            ledger,
            directory,
            clock,
            _shutdown: shutdown_tx,
        }
    }

    async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> reqwest::Response {
        let body = form_urlencoded::Serializer::new(String::new()).extend_pairs(fields).finish();
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path_and_query: &str) -> reqwest::Response {
        self.client.get(format!("{}{}", self.base_url, path_and_query)).send().await.unwrap()
    }
}

async fn json(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_member_tap_in_is_granted() {
    let server = TestServer::start().await;

    let response = server.post_form("/machine", &[("apikey", API_KEY), ("uuid", MEMBER_CARD)]).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["cache-control"], "no-cache, no-store, must-revalidate");
    assert_eq!(response.headers()["expires"], "0");

    let body = json(response).await;
    assert_eq!(body["access"], 1);
    assert_eq!(body["error_code"], "x00");
    assert_eq!(body["display_name"], "Ada");
    assert_eq!(body["membership"], "member");
    assert_eq!(body["member_store"], 5000);
    assert_eq!(body["pocket_store"], 2000);
    assert_eq!(body["access_point_id"], "1");
}

#[tokio::test]
async fn test_wrong_or_missing_key_looks_like_not_found() {
    let server = TestServer::start().await;

    let response = server.post_form("/machine", &[("apikey", "guess"), ("uuid", MEMBER_CARD)]).await;
    assert_eq!(response.status(), 404);

    let response = server.post_form("/machine", &[("uuid", MEMBER_CARD)]).await;
    assert_eq!(response.status(), 404);

    let response = server.get("/environment?apikey=guess").await;
    assert_eq!(response.status(), 404);

    let response = server.get("/no/such/route").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_unknown_and_malformed_cards() {
    let server = TestServer::start().await;

    let response = server.post_form("/machine", &[("apikey", API_KEY), ("uuid", "0BADC0DE")]).await;
    assert_eq!(response.status(), 200);
    let body = json(response).await;
    assert_eq!(body["access"], 0);
    assert_eq!(body["error_code"], "x80");
    assert!(body.get("display_name").is_none());

    let response = server.post_form("/machine", &[("apikey", API_KEY), ("uuid", "zz")]).await;
    assert_eq!(response.status(), 400);
    assert_eq!(json(response).await["error_code"], "x03");
}

#[tokio::test]
async fn test_member_job_drains_member_store() {
    let server = TestServer::start().await;

    let response = server
        .post_form(
            "/machine/job",
            &[("apikey", API_KEY), ("uuid", MEMBER_CARD), ("jobtime", "30")],
        )
        .await;
    assert_eq!(response.status(), 200);

    let body = json(response).await;
    assert_eq!(body["access"], 1);
    assert_eq!(body["charges"].as_array().unwrap().len(), 1);
    assert_eq!(body["charges"][0]["amount"], 300);
    assert_eq!(body["charges"][0]["job_time"], 30);
    assert_eq!(body["member_store"], 4700);
    assert_eq!(body["pocket_store"], 2000);

    // Seed record plus the job
    assert_eq!(server.ledger.records().len(), 3);
}

#[tokio::test]
async fn test_guest_pays_perdiem_once_per_day() {
    let server = TestServer::start().await;
    let fields = [("apikey", API_KEY), ("uuid", GUEST_CARD), ("jobtime", "30")];

    let body = json(server.post_form("/machine/job", &fields).await).await;
    let charges = body["charges"].as_array().unwrap();
    assert_eq!(charges.len(), 2);
    assert_eq!(charges[0]["amount"], 200);
    assert_eq!(charges[0]["job_time"], 0);
    assert_eq!(charges[1]["amount"], 600);
    assert_eq!(body["pocket_store"], 2700);

    let body = json(server.post_form("/machine/job", &fields).await).await;
    assert_eq!(body["charges"].as_array().unwrap().len(), 1);
    assert_eq!(body["pocket_store"], 2100);

    // The next day owes the fee again
    server.clock.advance(Duration::days(1));
    let body = json(server.post_form("/machine/job", &fields).await).await;
    let charges = body["charges"].as_array().unwrap();
    assert_eq!(charges.len(), 2);
    assert_eq!(charges[0]["amount"], 200);
    assert_eq!(body["pocket_store"], 1300);
}

#[tokio::test]
async fn test_overdrawing_job_reports_x84() {
    let server = TestServer::start().await;

    // 300 minutes at 12.00/h is 6000, beyond the guest's 3500
    let body = json(
        server
            .post_form(
                "/machine/job",
                &[("apikey", API_KEY), ("uuid", GUEST_CARD), ("jobtime", "300")],
            )
            .await,
    )
    .await;
    assert_eq!(body["access"], 0);
    assert_eq!(body["error_code"], "x84");
    assert!(body["pocket_store"].as_i64().unwrap() < 0);

    let body = json(
        server.post_form("/machine", &[("apikey", API_KEY), ("uuid", GUEST_CARD)]).await,
    )
    .await;
    assert_eq!(body["error_code"], "x84");
}

#[tokio::test]
async fn test_bad_jobtime_is_rejected_without_charging() {
    let server = TestServer::start().await;

    let response = server
        .post_form(
            "/machine/job",
            &[("apikey", API_KEY), ("uuid", MEMBER_CARD), ("jobtime", "-5")],
        )
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(json(response).await["error_code"], "x03");
    assert_eq!(server.ledger.records().len(), 2);
}

#[tokio::test]
async fn test_ledger_outage_is_service_unavailable() {
    let server = TestServer::start().await;
    server.ledger.set_online(false);

    let body = json(
        server.post_form("/machine", &[("apikey", API_KEY), ("uuid", MEMBER_CARD)]).await,
    )
    .await;
    assert_eq!(body["access"], 0);
    assert_eq!(body["error_code"], "x81");

    let response = server
        .post_form(
            "/machine/job",
            &[("apikey", API_KEY), ("uuid", MEMBER_CARD), ("jobtime", "10")],
        )
        .await;
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_directory_outage_is_pre_auth() {
    let server = TestServer::start().await;
    server.directory.set_online(false);

    let response = server.post_form("/machine", &[("apikey", API_KEY), ("uuid", MEMBER_CARD)]).await;
    assert_eq!(response.status(), 503);
    assert_eq!(json(response).await["error_code"], "x02");
}

#[tokio::test]
async fn test_job_history_newest_first() {
    let server = TestServer::start().await;
    server
        .post_form(
            "/machine/job",
            &[("apikey", API_KEY), ("uuid", MEMBER_CARD), ("jobtime", "45")],
        )
        .await;

    let response = server.get(&format!("/machine/job?uuid={MEMBER_CARD}")).await;
    assert_eq!(response.status(), 200);
    let body = json(response).await;
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["job_time"], 45);
    assert_eq!(records[0]["notes"], "none");

    let body = json(server.get(&format!("/machine/job?uuid={MEMBER_CARD}&page=2")).await).await;
    assert!(body.as_array().unwrap().is_empty());

    let response = server.get(&format!("/machine/job?uuid={MEMBER_CARD}&page=two")).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_environment_lists_access_points() {
    let server = TestServer::start().await;
    server.directory.add_error_label(AccessPointId(1), "x84", "Please top up");

    let response = server.get(&format!("/environment?apikey={API_KEY}")).await;
    assert_eq!(response.status(), 200);
    let body = json(response).await;
    assert_eq!(body["1"], "Laser");
    assert_eq!(body["access_point_id"], "1");
    assert_eq!(body["x84"], "Please top up");
}

#[tokio::test]
async fn test_metrics_and_health() {
    let server = TestServer::start().await;
    server.post_form("/machine", &[("apikey", API_KEY), ("uuid", MEMBER_CARD)]).await;

    let response = server.get("/health").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let text = server.get("/metrics").await.text().await.unwrap();
    assert!(text.contains("machinetime_access_checks_total{site=\"machinetime\"} 1"));
    assert!(text.contains("machinetime_access_granted_total"));
}
