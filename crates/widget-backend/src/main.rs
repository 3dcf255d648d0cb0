use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Knobs for exercising the gateway's failure handling.
#[derive(Debug, Default, Deserialize)]
struct WidgetQuery {
    /// Respond with this status instead of 200.
    #[serde(default)]
    status: Option<u16>,
    /// Respond with `null` instead of a widget document.
    #[serde(default)]
    empty: bool,
}

const AUTHORS: [&str; 5] = ["Ada", "Grace", "Linus", "Barbara", "Ken"];
const TEXTS: [&str; 4] = [
    "Great quality, fast shipping.",
    "Exactly as described.",
    "Nice, would order again.",
    "Packaging could be better.",
];

async fn get_widget(Path(id): Path<String>, Query(query): Query<WidgetQuery>) -> Response {
    // Simulate upstream latency (20-80ms)
    let delay = rand::thread_rng().gen_range(20..=80);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    if let Some(code) = query.status {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::info!(widget = %id, status = status.as_u16(), "serving forced status");
        return (status, Json(json!({ "error": "forced failure" }))).into_response();
    }

    if query.empty {
        return Json(Value::Null).into_response();
    }

    Json(widget(&id)).into_response()
}

fn widget(id: &str) -> Value {
    let mut rng = rand::thread_rng();
    let reviews: Vec<Value> = (0..rng.gen_range(3..=6))
        .map(|i| {
            json!({
                "author": {
                    "name": AUTHORS[i % AUTHORS.len()],
                    "avatarUrl": format!("https://avatars.example/{i}.png"),
                },
                "text": TEXTS[i % TEXTS.len()],
                "rating": { "value": rng.gen_range(3..=5) },
                "publishedAt": format!("2024-0{}-1{}", (i % 9) + 1, i % 10),
            })
        })
        .collect();

    json!({
        "success": true,
        "data": {
            "widget": {
                "id": id,
                "reviews": reviews,
            }
        }
    })
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/api/v2/widgets/{id}", get(get_widget))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "widget backend starting");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
