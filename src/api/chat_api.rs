use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;

use super::chunk_segmenter::ThreadRngChance;
use super::config_manager::GatewaySettings;
use super::conversation_store::ConversationStore;
use super::data_models::*;
use super::error_handler::ChatError;
use super::im_gateway::ImGateway;
use super::outbound_delivery::{OneBotDelivery, OutboundDelivery};
use super::stream_router::StreamRouter;
use super::turn_state::TurnState;

/// 所有请求共享的状态
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<StreamRouter>,
    pub gateway: Arc<ImGateway>,
    pub turn_state: Arc<TurnState>,
}

impl AppState {
    pub fn new(
        settings: GatewaySettings,
        data_path: &str,
        delivery: Arc<dyn OutboundDelivery>,
    ) -> Result<Self, ChatError> {
        let store = Arc::new(ConversationStore::new(data_path));
        let turn_state = Arc::new(TurnState::new(
            settings.split_by_punctuations,
            Box::new(ThreadRngChance),
        ));
        let router = Arc::new(StreamRouter::new(
            settings,
            store.clone(),
            turn_state.clone(),
            delivery.clone(),
        )?);
        let gateway = Arc::new(ImGateway::new(
            router.clone(),
            store,
            turn_state.clone(),
            delivery,
            Box::new(ThreadRngChance),
        ));
        Ok(Self {
            router,
            gateway,
            turn_state,
        })
    }

    /// 用 OneBot HTTP 投递组装
    pub fn with_onebot(settings: GatewaySettings, data_path: &str) -> Result<Self, ChatError> {
        let timeout = Duration::from_secs(settings.connect_timeout_secs.max(1));
        let delivery = Arc::new(OneBotDelivery::new(&settings.onebot_http_path, timeout)?);
        Self::new(settings, data_path, delivery)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/conversation", post(post_conversation))
        .route("/gensokyo", post(post_gensokyo))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 后台定时清理被遗弃轮次留下的状态
pub fn spawn_eviction(turn_state: Arc<TurnState>, ttl: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = turn_state.evict_idle(ttl);
            if evicted > 0 {
                log::info!("evicted {} idle turn entries", evicted);
            }
        }
    })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "tracked_streams": state.turn_state.tracked_streams(),
    }))
}

async fn post_conversation(State(state): State<AppState>, Json(request): Json<TurnRequest>) -> Response {
    if !state.router.settings().use_sse {
        return match state.router.run_turn(request, |_| {}).await {
            Ok(envelope) => Json(envelope).into_response(),
            Err(e) => e.into_response(),
        };
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Result<TurnFrame, ChatError>>();
    let router = state.router.clone();
    tokio::spawn(async move {
        let frame_tx = tx.clone();
        let result = router
            .run_turn(request, move |frame| {
                let _ = frame_tx.send(Ok(frame));
            })
            .await;
        let _ = tx.send(result.map(TurnFrame::Final));
    });

    // 等到第一帧再回响应头，请求阶段的失败还能以状态码返回
    let first = match rx.recv().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return e.into_response(),
        None => {
            return ChatError::StreamError {
                message: "turn ended without a response".to_string(),
            }
            .into_response()
        }
    };

    let frames = futures::stream::once(futures::future::ready(Ok(first)))
        .chain(UnboundedReceiverStream::new(rx))
        .map(|item| {
            let event = match item {
                Ok(frame) => Event::default().data(frame.to_json()),
                // 响应头已经发出，只能在流里报错
                Err(e) => Event::default().event("error").data(e.to_string()),
            };
            Ok::<Event, Infallible>(event)
        });

    Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
}

async fn post_gensokyo(State(state): State<AppState>, Json(event): Json<OnebotMessageEvent>) -> Response {
    match state.gateway.handle(event).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => e.into_response(),
    }
}
