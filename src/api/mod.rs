use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::models::*;
use crate::store::SyncStore;
use crate::sync::{
    derive_thread_key, CounterReconciler, ReconcilePolicy, RelationshipToggle, SyncError,
    ThreadRegistry,
};

pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    pub threads: ThreadRegistry,
    pub interactions: RelationshipToggle,
    pub reconciler: CounterReconciler,
    pub reconcile_policy: Arc<ReconcilePolicy>,
}

fn sync_error_response(err: SyncError) -> HttpResponse {
    match err {
        SyncError::InvalidArgument(msg) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(msg))
        }
        SyncError::Unavailable(e) => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<()>::error(format!("sync store unavailable: {}", e))),
        // The client rolls its optimistic flip back to `prior`.
        SyncError::ToggleFailed { prior, source } => {
            HttpResponse::BadGateway().json(serde_json::json!({
                "success": false,
                "error": format!("toggle failed: {}", source),
                "prior": prior,
            }))
        }
    }
}

// ==================== Health Check ====================

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

// ==================== Thread Endpoints ====================

pub async fn thread_key(
    _auth_user: AuthUser,
    query: web::Query<ThreadKeyQuery>,
) -> impl Responder {
    match derive_thread_key(&query.user_a, &query.user_b) {
        Ok(key) => HttpResponse::Ok().json(ApiResponse::success(key)),
        Err(e) => sync_error_response(e),
    }
}

pub async fn open_thread(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<OpenThreadRequest>,
) -> impl Responder {
    match state
        .threads
        .get_or_create(&auth_user.user_id, &body.other_user_id)
        .await
    {
        Ok(handle) if handle.created => HttpResponse::Created().json(ApiResponse::success(handle)),
        Ok(handle) => HttpResponse::Ok().json(ApiResponse::success(handle)),
        Err(e) => sync_error_response(e),
    }
}

// ==================== Like Endpoints ====================

pub async fn get_likes(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let post_id = path.into_inner();
    match state
        .interactions
        .current(&auth_user.user_id, &post_id, RelationshipKind::Like)
        .await
    {
        Ok(current) => HttpResponse::Ok().json(ApiResponse::success(current)),
        Err(e) => sync_error_response(e),
    }
}

pub async fn toggle_like(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<RelationshipState>,
) -> impl Responder {
    let post_id = path.into_inner();
    let confirmed = match state
        .interactions
        .toggle(&auth_user.user_id, &post_id, RelationshipKind::Like, &body)
        .await
    {
        Ok(confirmed) => confirmed,
        Err(e) => return sync_error_response(e),
    };

    if state.reconcile_policy.due() {
        opportunistic_reconcile(&state, &post_id, CounterKind::Likes).await;
    }

    HttpResponse::Ok().json(ApiResponse::success(confirmed))
}

// ==================== Follow Endpoints ====================

pub async fn get_follows(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let user_id = path.into_inner();
    let current = match state
        .interactions
        .current(&auth_user.user_id, &user_id, RelationshipKind::Follow)
        .await
    {
        Ok(current) => current,
        Err(e) => return sync_error_response(e),
    };

    let following = match state
        .store
        .read(&CounterKind::Following.counter_path(&user_id))
        .await
    {
        Ok(value) => value.and_then(|v| v.as_i64()).unwrap_or(0),
        Err(e) => return sync_error_response(SyncError::Unavailable(e)),
    };

    HttpResponse::Ok().json(ApiResponse::success(FollowOverview {
        followers: current.counter,
        following,
        active: current.active,
    }))
}

pub async fn toggle_follow(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<RelationshipState>,
) -> impl Responder {
    let user_id = path.into_inner();
    let confirmed = match state
        .interactions
        .toggle(&auth_user.user_id, &user_id, RelationshipKind::Follow, &body)
        .await
    {
        Ok(confirmed) => confirmed,
        Err(e) => return sync_error_response(e),
    };

    if state.reconcile_policy.due() {
        opportunistic_reconcile(&state, &user_id, CounterKind::Followers).await;
        opportunistic_reconcile(&state, &auth_user.user_id, CounterKind::Following).await;
    }

    HttpResponse::Ok().json(ApiResponse::success(confirmed))
}

/// Post-toggle counter validation. Failures are logged and retried on the
/// next pass; the edge set stays authoritative meanwhile.
async fn opportunistic_reconcile(state: &AppState, owner: &str, kind: CounterKind) {
    if let Err(e) = state.reconciler.reconcile(owner, kind).await {
        log::warn!(
            "opportunistic reconcile of {} failed: {}",
            kind.counter_path(owner),
            e
        );
    }
}

// ==================== Reconcile Endpoint ====================

pub async fn reconcile_counter(
    state: web::Data<AppState>,
    _auth_user: AuthUser,
    body: web::Json<ReconcileRequest>,
) -> impl Responder {
    match state.reconciler.reconcile(&body.target_id, body.kind).await {
        Ok(count) => HttpResponse::Ok().json(ApiResponse::success(CorrectedCount { count })),
        Err(e) => sync_error_response(e),
    }
}

// ==================== Route Configuration ====================

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check
        .route("/health", web::get().to(health))
        // Threads
        .route("/api/threads/key", web::get().to(thread_key))
        .route("/api/threads", web::post().to(open_thread))
        // Likes
        .route("/api/posts/{id}/likes", web::get().to(get_likes))
        .route("/api/posts/{id}/likes/toggle", web::post().to(toggle_like))
        // Follows
        .route("/api/users/{id}/follows", web::get().to(get_follows))
        .route("/api/users/{id}/follows/toggle", web::post().to(toggle_follow))
        // Counters
        .route("/api/counters/reconcile", web::post().to(reconcile_counter));
}
