//! HTTP surface, exercised over a real socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use tier_router::config::Config;
use tier_router::server::api::build_router;
use tier_router::ServingStack;

struct TestServer {
    base: String,
    client: reqwest::Client,
    stack: Arc<ServingStack>,
}

impl TestServer {
    fn config() -> Config {
        let mut config = Config::default();
        config.speculative.vocab_size = 64;
        config.tiers.gold.max_tokens = 8;
        config.tiers.silver.max_tokens = 16;
        config.tiers.silver.simulated_latency_ms = 5;
        config.tiers.bronze.simulated_latency_ms = 20;
        config.tiers.bronze.max_tokens = 16;
        config.distillation.enabled = false;
        config
    }

    async fn start() -> Self {
        Self::start_with(Self::config()).await
    }

    async fn start_with(config: Config) -> Self {
        let stack = Arc::new(ServingStack::build(config).await.unwrap());
        let app = build_router(Arc::clone(&stack));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            stack,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    /// Poll `/jobs/{id}/result` until it stops answering 202.
    async fn job_result(&self, job_id: &str) -> Value {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let resp = self.get(&format!("/jobs/{job_id}/result")).await;
            if resp.status() == 200 {
                return resp.json().await.unwrap();
            }
            assert_eq!(resp.status(), 202);
            assert!(std::time::Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_route_returns_envelope() {
    let server = TestServer::start().await;
    let resp = server
        .post(
            "/v1/route",
            json!({
                "entity_id": "npc-guard",
                "sla_class": "interactive",
                "context": { "prompt": "Halt! Who goes there?" },
                "deadline_ms": 500
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["entity_id"], "npc-guard");
    assert!(body["tier_used"].is_string());
    assert!(body["degraded"].is_boolean());
    assert!(!body["content"].as_str().unwrap().is_empty());

    let metrics = server.get("/metrics").await;
    assert_eq!(metrics.status(), 200);
    let text = metrics.text().await.unwrap();
    assert!(text.contains("tier_router_routed_total"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_endpoints() {
    let server = TestServer::start().await;

    let resp = server.get("/health/silver").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["queue_depth"].is_number());
    assert!(body["avg_latency_ms"].is_number());

    let resp = server.get("/health/platinum").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unknown_tier");

    let resp = server
        .post("/admin/tiers/gold/health", json!({ "status": "degraded" }))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["gold"]["status"], "degraded");

    server
        .post("/admin/tiers/gold/health", json!({ "status": null }))
        .await;
    server
        .post("/admin/tiers/gold/health", json!({ "status": "healthy" }))
        .await;
    let body: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_submission_dedupes_and_completes() {
    let server = TestServer::start().await;
    let submit = json!({ "prompt": "Recount the fall of the old keep.", "dedupe_key": "keep-1" });

    let first = server.post("/jobs", submit.clone()).await;
    assert_eq!(first.status(), 202);
    let first: Value = first.json().await.unwrap();
    let second: Value = server.post("/jobs", submit).await.json().await.unwrap();
    assert_eq!(first["job_id"], second["job_id"]);
    let job_id = first["job_id"].as_str().unwrap().to_string();

    let job: Value = server.get(&format!("/jobs/{job_id}")).await.json().await.unwrap();
    assert_eq!(job["job_id"], job_id.as_str());

    let result = server.job_result(&job_id).await;
    assert_eq!(result["job_id"], job_id.as_str());
    assert!(!result["result"].as_str().unwrap().is_empty());
    assert_eq!(server.stack.traces.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_violating_job_result_is_replaced() {
    let mut config = TestServer::config();
    config.guardrail.max_chars = 3;
    config.guardrail.fallback_response = "Hm.".to_string();
    let server = TestServer::start_with(config).await;

    let submitted: Value = server
        .post("/jobs", json!({ "prompt": "Sing the whole saga.", "dedupe_key": "saga-1" }))
        .await
        .json()
        .await
        .unwrap();
    let job_id = submitted["job_id"].as_str().unwrap().to_string();

    let result = server.job_result(&job_id).await;
    assert_eq!(result["result"], "Hm.");
    let job: Value = server.get(&format!("/jobs/{job_id}")).await.json().await.unwrap();
    assert_eq!(job["guardrail_rule"], "max_length");
    assert_eq!(server.stack.traces.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_job_is_not_found() {
    let server = TestServer::start().await;
    let resp = server.get("/jobs/does-not-exist").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "job_not_found");

    let resp = server.get("/jobs/does-not-exist/result").await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tiers_and_cache_stats() {
    let server = TestServer::start().await;

    let tiers: Value = server.get("/v1/tiers").await.json().await.unwrap();
    let listed = tiers["tiers"].as_array().unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0]["id"], "gold");
    assert_eq!(listed[0]["model_ref"]["version"], 0);

    let stats: Value = server.get("/v1/cache/stats").await.json().await.unwrap();
    assert!(stats["gold"].is_object());
    assert!(stats["speculative"].is_object());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admin_distill_and_rollback() {
    let server = TestServer::start().await;

    // No traces yet: every target is skipped.
    let resp = server.post("/admin/distill", json!({})).await;
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    let outcomes = report["outcomes"].as_array().unwrap();
    assert!(!outcomes.is_empty());
    assert!(outcomes.iter().all(|o| o["outcome"] == "skipped"));

    let resp = server.post("/admin/tiers/silver/rollback", json!({})).await;
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "nothing_to_roll_back");
}
