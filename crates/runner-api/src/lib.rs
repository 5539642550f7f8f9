//! HTTP API (skeleton -> minimal JSON + SSE)

use std::sync::Arc;

use axum::{
    extract::State,
    response::{sse::{Event, Sse}, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use axum::extract::ws::{WebSocketUpgrade, Message};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Histogram, TextEncoder};
use runner_backend::{mock::MockBackend, InferenceBackend};
use runner_backend_llamacpp::LlamaCppBackend;
use runner_common::config::RunnerConfig;
use runner_core::serving::{BatchingEngine, EngineConfig, EngineHandle};
use runner_core::types::SamplingParams;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};
use runner_obs::{init as obs_init, spawn_gpu_polling};

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn InferenceBackend>,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
    ttft_seconds: Histogram,
    engine: EngineHandle,
    queue_depth_gauge: prometheus::IntGauge,
    batch_size_gauge: prometheus::IntGauge,
    kv_used_blocks: prometheus::IntGauge,
    kv_capacity_blocks: prometheus::IntGauge,
    limiter: RateLimiter,
    budgets: TokenBudgets,
    model_path: Arc<tokio::sync::RwLock<Option<String>>>,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

pub fn app() -> Router {
    let backend: Arc<dyn InferenceBackend> = select_backend();
    obs_init();
    spawn_gpu_polling();
    let engine_cfg = EngineConfig::from_runner_config(&RunnerConfig::load());
    let engine = BatchingEngine::start(backend.clone(), engine_cfg);
    let queue_depth_gauge = prometheus::register_int_gauge!("runner_queue_depth", "Engine admission queue depth").expect("gauge");
    let batch_size_gauge = prometheus::register_int_gauge!("runner_batch_size", "Last forward batch size").expect("gauge");
    let kv_used_blocks = prometheus::register_int_gauge!("runner_kv_used_blocks", "Pages currently checked out").expect("gauge");
    let kv_capacity_blocks = prometheus::register_int_gauge!("runner_kv_capacity_blocks", "Total pages in the pool").expect("gauge");
    let state = AppState {
        backend,
        requests_total: prometheus::register_int_counter!(
            "runner_requests_total",
            "Total number of /generate requests"
        )
        .expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!(
            "runner_tokens_generated_total",
            "Total output tokens (approx)"
        )
        .expect("counter"),
        ttft_seconds: prometheus::register_histogram!(
            "runner_ttft_seconds",
            "Time to first token (approx for mock)"
        )
        .expect("histogram"),
        engine,
        queue_depth_gauge,
        batch_size_gauge,
        kv_used_blocks,
        kv_capacity_blocks,
        limiter: RateLimiter::new(),
        budgets: TokenBudgets::new(),
        model_path: Arc::new(tokio::sync::RwLock::new(None)),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/generate", post(generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/sse/generate", get(generate_sse))
        .route("/ws/generate", get(ws_generate))
        .route("/admin/set_model", post(admin_set_model))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

fn select_backend() -> Arc<dyn InferenceBackend> {
    // Try llama backend first if model path is provided
    if let Ok(model_path) = std::env::var("RUNNER_MODEL") {
        let llama = LlamaCppBackend::new();
        // ignore params for now
        if llama.load_model(&model_path, runner_backend::LoadParams::default()).is_ok() {
            tracing::info!(target: "api", "using llama.cpp backend with model {}", model_path);
            return Arc::new(llama);
        } else {
            tracing::warn!(target: "api", "failed to init llama backend, falling back to mock");
        }
    }
    Arc::new(MockBackend::new())
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let has_model = state.model_path.read().await.is_some();
    ([("content-type", "text/plain")], if has_model { "ready" } else { "ready-no-model" })
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct GenerateResponse { text: String }

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerateResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(GenerateResponse { text: String::from("RATE_LIMITED") });
    }
    tracing::info!(target: "api", "generate request");
    let start = std::time::Instant::now();
    state.queue_depth_gauge.set(state.engine.queue_depth.load(std::sync::atomic::Ordering::Relaxed) as i64);
    state.batch_size_gauge.set(state.engine.last_batch_size.load(std::sync::atomic::Ordering::Relaxed) as i64);
    state.kv_used_blocks.set(state.engine.pages_in_use.load(std::sync::atomic::Ordering::Relaxed) as i64);
    state.kv_capacity_blocks.set(state.engine.pages_total as i64);

    let max_tokens = req.max_tokens.unwrap_or(128);
    let text = state.engine.generate(&req.prompt, SamplingParams::default(), max_tokens).await;
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    state.tokens_generated_total.inc_by(text.len() as u64);
    state.budgets.record(&tenant_id(), text.len() as u64).await;
    Json(GenerateResponse { text })
}

async fn generate_sse(State(state): State<AppState>) -> Sse<impl axum::response::sse::Stream<Item = runner_common::Result<Event>>> {
    state.requests_total.inc();
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let start = std::time::Instant::now();
    let engine = state.engine.clone();
    tokio::spawn(async move {
        let text = engine.generate("Hello", SamplingParams::default(), 32).await;
        for piece in text.split_whitespace() {
            let _ = tx.send(Ok(Event::default().data(piece.to_string()))).await;
        }
    });
    let stream = ReceiverStream::new(rx).map(|e| e);
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    Sse::new(stream)
}

async fn ws_generate(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket.send(Message::Text("hello".into())).await;
        let _ = socket.send(Message::Text(" ".into())).await;
        let _ = socket.send(Message::Text("world".into())).await;
        let _ = socket.send(Message::Text("!".into())).await;
        let _ = socket.close().await;
    })
}

async fn openapi() -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": "Next Inference API", "version": "0.1.0"},
        "paths": {
            "/generate": {"post": {"summary": "Generate text"}},
            "/v1/chat/completions": {"post": {"summary": "OpenAI chat subset"}},
            "/sse/generate": {"get": {"summary": "SSE stream demo"}},
            "/ws/generate": {"get": {"summary": "WebSocket stream demo"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}},
            "/admin/set_model": {"post": {"summary": "Hot load model"}}
        }
    });
    Json(spec)
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatRequest {
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[allow(dead_code)]
    stream: Option<bool>,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct ChatChoiceMessage { role: String, content: String }

#[derive(serde::Serialize)]
struct ChatChoice { index: u32, message: ChatChoiceMessage, finish_reason: String }

#[derive(serde::Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    choices: Vec<ChatChoice>,
}

async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(ChatResponse {
            id: "rate-limited".into(),
            object: "chat.completion".into(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatChoiceMessage { role: "assistant".into(), content: String::from("RATE_LIMITED") },
                finish_reason: "stop".into(),
            }],
        });
    }
    tracing::info!(target: "api", "chat request: {} messages", req.messages.len());
    let mut prompt = String::new();
    for m in &req.messages {
        if m.role == "system" || m.role == "user" {
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    let text = state.engine.generate(&prompt, SamplingParams::default(), req.max_tokens.unwrap_or(128)).await;
    let resp = ChatResponse {
        id: "chatcmpl-1".into(),
        object: "chat.completion".into(),
        choices: vec![ChatChoice { index: 0, message: ChatChoiceMessage { role: "assistant".into(), content: text }, finish_reason: "stop".into() }],
    };
    Json(resp)
}

#[derive(serde::Deserialize)]
struct SetModel { path: String }

async fn admin_set_model(State(state): State<AppState>, Json(req): Json<SetModel>) -> impl IntoResponse {
    state.model_path.write().await.replace(req.path);
    ([("content-type", "text/plain")], "ok")
}

fn tenant_id() -> String {
    // For now, a single-tenant placeholder. Extend with headers/ip as needed.
    "default".into()
}

use std::collections::HashMap;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
struct RateLimiter { inner: Arc<AsyncMutex<HashMap<String, (u64, std::time::Instant)>>> }
impl RateLimiter {
    fn new() -> Self { Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) } }
    async fn check_allow(&self, key: &str) -> bool {
        let mut g = self.inner.lock().await;
        let entry = g.entry(key.to_string()).or_insert((0, std::time::Instant::now()));
        if entry.1.elapsed() > std::time::Duration::from_secs(60) { *entry = (0, std::time::Instant::now()); }
        let limit: u64 = std::env::var("RUNNER_RATE_LIMIT_PER_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(600);
        if entry.0 >= limit { return false; }
        entry.0 += 1; true
    }
}

#[derive(Clone)]
struct TokenBudgets { inner: Arc<AsyncMutex<HashMap<String, u64>>> }
impl TokenBudgets {
    fn new() -> Self { Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) } }
    async fn record(&self, key: &str, tokens: u64) {
        let mut g = self.inner.lock().await;
        let v = g.entry(key.to_string()).or_insert(0);
        *v += tokens;
    }
    #[allow(dead_code)]
    async fn allowed(&self, key: &str, new_tokens: u64) -> bool {
        let budget: u64 = std::env::var("RUNNER_TOKEN_BUDGET").ok().and_then(|v| v.parse().ok()).unwrap_or(u64::MAX);
        let g = self.inner.lock().await;
        let used = *g.get(key).unwrap_or(&0);
        used + new_tokens <= budget
    }
}
