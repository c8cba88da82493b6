//! End-to-end tests for the axum API surface: boot a real server against an
//! in-memory database and drive it over HTTP, the same shape as the
//! teacher's `tests/api_integration_tests.rs` (spawn server, `reqwest`
//! client, assert on `StatusCode` and response bodies).

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use review_engine::assistant_runner::AssistantRunConfig;
use review_engine::batch_planner::BatchPlanConfig;
use review_engine::comment_adapter::CommentAdapterConfig;
use review_engine::db;
use review_engine::metrics::MetricsRegistry;
use review_engine::models::{Platform, RepoAuth, RepoConfig, TriggerMode};
use review_engine::poller::{Poller, PollerConfig};
use review_engine::scheduler::{Scheduler, SchedulerConfig};
use review_engine::{server, AppState, Config};
use serde_json::{json, Value};

async fn spawn_test_server() -> (String, sqlx::SqlitePool) {
    let write_pool = db::init_db("sqlite::memory:").await.expect("init_db");
    let read_pool = write_pool.clone();

    let dir = tempfile::TempDir::new().expect("tempdir");
    let scheduler = Arc::new(
        Scheduler::new(
            write_pool.clone(),
            dir.path().to_path_buf(),
            AssistantRunConfig::default(),
            BatchPlanConfig::default(),
            CommentAdapterConfig::default(),
            &SchedulerConfig::default(),
        )
        .expect("scheduler"),
    );
    let scheduler_handle = scheduler.clone();
    tokio::spawn(async move {
        let _ = scheduler_handle.run().await;
    });

    let poller = Arc::new(Poller::new(write_pool.clone(), scheduler.clone(), PollerConfig::default()));

    let state = AppState {
        config: Arc::new(Config::default()),
        write_pool,
        read_pool,
        scheduler,
        poller,
        metrics: Arc::new(MetricsRegistry::new()),
    };

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let app = server::build_router(state.clone());
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("http://{addr}"), state.write_pool)
}

fn sample_repo(repo_id: &str, clone_url: &str) -> RepoConfig {
    RepoConfig {
        repo_id: repo_id.to_string(),
        name: repo_id.to_string(),
        clone_url: clone_url.to_string(),
        branch: "main".to_string(),
        platform: Platform::Gitea,
        auth: RepoAuth::None,
        trigger_mode: TriggerMode::Webhook,
        polling_interval_minutes: 15,
        effective_from: chrono::Utc::now(),
        poll_commits: true,
        poll_mrs: true,
        enable_comment: false,
        enabled: true,
        local_path: None,
        clone_status: review_engine::models::CloneStatus::Absent,
        last_check_time: None,
        webhook_secret: None,
    }
}

#[tokio::test]
async fn health_check_reports_ok() {
    let (base_url, _pool) = spawn_test_server().await;
    let response = reqwest::get(format!("{base_url}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_exports_prometheus_text() {
    let (base_url, _pool) = spawn_test_server().await;
    let response = reqwest::get(format!("{base_url}/metrics")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("process_uptime_seconds"));
}

#[tokio::test]
async fn webhook_push_creates_a_task_and_enqueues_it() {
    let (base_url, pool) = spawn_test_server().await;

    db::add_repository(&pool, &sample_repo("demo", "https://gitea.example.com/org/demo.git"))
        .await
        .unwrap();

    let payload = json!({
        "ref": "refs/heads/main",
        "before": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        "after": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        "repository": { "clone_url": "https://gitea.example.com/org/demo.git" },
        "pusher": { "full_name": "Dev", "email": "dev@example.com" }
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/webhook/gitea"))
        .header("x-gitea-event", "push")
        .json(&payload)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    assert!(body["task_id"].as_str().is_some());

    let tasks = db::query_tasks(&pool, &db::TaskFilters::default(), 10, 0).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].revision_ref, "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
}

#[tokio::test]
async fn webhook_for_unconfigured_repo_is_ignored_not_errored() {
    let (base_url, _pool) = spawn_test_server().await;

    let payload = json!({
        "ref": "refs/heads/main",
        "before": "a",
        "after": "b",
        "repository": { "clone_url": "https://gitea.example.com/org/unknown.git" },
        "pusher": { "full_name": "Dev", "email": "dev@example.com" }
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/webhook/gitea"))
        .header("x-gitea-event", "push")
        .json(&payload)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn polling_start_stop_round_trips_through_status() {
    let (base_url, _pool) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let stopped = client.post(format!("{base_url}/polling/stop")).send().await.unwrap();
    let body: Value = stopped.json().await.unwrap();
    assert_eq!(body["running"], false);

    let status = reqwest::get(format!("{base_url}/polling/status")).await.unwrap();
    let body: Value = status.json().await.unwrap();
    assert_eq!(body["running"], false);

    let started = client.post(format!("{base_url}/polling/start")).send().await.unwrap();
    let body: Value = started.json().await.unwrap();
    assert_eq!(body["running"], true);
}

#[tokio::test]
async fn trigger_review_with_explicit_revision_enqueues_a_task() {
    let (base_url, pool) = spawn_test_server().await;
    db::add_repository(&pool, &sample_repo("demo", "https://gitea.example.com/org/demo.git"))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/polling/repos/demo/trigger"))
        .json(&json!({ "strategy": "commit", "revision_ref": "deadbeef" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert!(body["task_id"].as_str().is_some());
}

#[tokio::test]
async fn stats_reviews_lists_created_tasks() {
    let (base_url, pool) = spawn_test_server().await;
    db::add_repository(&pool, &sample_repo("demo", "https://gitea.example.com/org/demo.git"))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    client
        .post(format!("{base_url}/polling/repos/demo/trigger"))
        .json(&json!({ "strategy": "commit", "revision_ref": "deadbeef" }))
        .send()
        .await
        .unwrap();

    let response = reqwest::get(format!("{base_url}/stats/reviews?repo_id=demo")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn review_full_for_unknown_task_is_not_found() {
    let (base_url, _pool) = spawn_test_server().await;
    let response = reqwest::get(format!("{base_url}/stats/review/does-not-exist/full")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
