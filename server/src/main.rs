mod cleanup;
mod cluster;
mod config;
mod room;
mod state;
mod ws;

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{delete, get, post},
};
use config::Config;
use state::AppState;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use roomscope_shared::{
    BanUserRequest, ClusterMetadata, ClusterRequest, ClusterResponse, CreateRoomRequest,
    ErrorKind, Feature, LatLng, PushEvent, Room, RoomId, UserId, ViewportRoomsRequest,
    ViewportRoomsResponse,
};

use crate::room::RoomEntry;

const USER_ID_HEADER: &str = "x-user-id";

type ApiError = (StatusCode, Json<ErrorKind>);

fn reject(kind: ErrorKind) -> ApiError {
    let status = match &kind {
        ErrorKind::RoomNotFound => StatusCode::NOT_FOUND,
        ErrorKind::MissingUserId => StatusCode::UNAUTHORIZED,
        ErrorKind::NotRoomCreator => StatusCode::FORBIDDEN,
        ErrorKind::RoomNotActive => StatusCode::CONFLICT,
        ErrorKind::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        ErrorKind::Other { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(kind))
}

/// The `X-User-Id` of the caller, if one was sent
fn viewer(headers: &HeaderMap) -> Result<Option<UserId>, ApiError> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let invalid = |message: String| reject(ErrorKind::InvalidRequest { message });
    let value = value
        .to_str()
        .map_err(|_| invalid("X-User-Id is not valid text".to_string()))?;
    value
        .parse()
        .map(Some)
        .map_err(|e: roomscope_shared::UserIdError| invalid(e.to_string()))
}

fn require_user(headers: &HeaderMap) -> Result<UserId, ApiError> {
    viewer(headers)?.ok_or_else(|| reject(ErrorKind::MissingUserId))
}

/// Great-circle distance in kilometres
fn distance_km(a: LatLng, b: LatLng) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// GET /api/rooms/clusters - Clustered discovery features for a bounding box
async fn get_clusters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(request): Query<ClusterRequest>,
) -> Result<Json<ClusterResponse>, ApiError> {
    let started = Instant::now();
    let viewer = viewer(&headers)?;
    let bounds = request.bounds();

    let rooms: Vec<Room> = {
        let rooms = state.rooms.read().await;
        rooms
            .values()
            .filter(|entry| {
                entry.visible_to(viewer.as_ref())
                    && entry.within(&bounds)
                    && entry.matches_category(request.category.as_deref())
            })
            .map(|entry| entry.to_room(viewer.as_ref()))
            .collect()
    };
    let total_rooms = rooms.len() as u32;
    let features = cluster::cluster_rooms(rooms, request.zoom, state.discovery.cells_per_tile);
    let cluster_count = features
        .iter()
        .filter(|feature| matches!(feature, Feature::Cluster(_)))
        .count() as u32;

    Ok(Json(ClusterResponse {
        metadata: ClusterMetadata {
            cluster_count,
            individual_count: features.len() as u32 - cluster_count,
            total_rooms,
            processing_time_ms: started.elapsed().as_millis() as u64,
        },
        features,
    }))
}

/// GET /api/rooms/viewport - Paged room list, nearest first when the user location is known
async fn get_viewport_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(request): Query<ViewportRoomsRequest>,
) -> Result<Json<ViewportRoomsResponse>, ApiError> {
    let viewer = viewer(&headers)?;
    let bounds = request.bounds();
    let page_size = request.page_size.clamp(1, state.discovery.max_page_size.max(1)) as usize;
    let origin = request
        .user_lat
        .zip(request.user_lng)
        .map(|(lat, lng)| LatLng::new(lat, lng));

    let rooms = state.rooms.read().await;
    let mut matching: Vec<&RoomEntry> = rooms
        .values()
        .filter(|entry| {
            entry.visible_to(viewer.as_ref())
                && entry.within(&bounds)
                && entry.matches_category(request.category.as_deref())
        })
        .collect();
    match origin {
        Some(origin) => matching.sort_by(|a, b| {
            let da = distance_km(origin, LatLng::new(a.latitude, a.longitude));
            let db = distance_km(origin, LatLng::new(b.latitude, b.longitude));
            da.total_cmp(&db).then_with(|| a.id.cmp(&b.id))
        }),
        None => matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))),
    }

    let total = matching.len();
    let start = (request.page as usize).saturating_mul(page_size);
    let page: Vec<Room> = matching
        .iter()
        .skip(start)
        .take(page_size)
        .map(|entry| entry.to_room(viewer.as_ref()))
        .collect();

    Ok(Json(ViewportRoomsResponse {
        has_next: start.saturating_add(page_size) < total,
        total_elements: total as u64,
        rooms: page,
    }))
}

/// POST /api/rooms - Create a new room
async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let creator = require_user(&headers)?;
    let entry = RoomEntry::new(creator.clone(), request, state.discovery.default_ttl_minutes)
        .map_err(reject)?;
    let room_id = entry.id.clone();
    let room = entry.to_room(Some(&creator));
    let announced = entry.to_room(None);

    state.rooms.write().await.insert(room_id.clone(), entry);
    info!("Created new room: {} by {}", room_id, creator);
    state.publish(PushEvent::RoomCreated { room: announced });

    Ok((StatusCode::CREATED, Json(room)))
}

/// Apply a creator-only change and publish its event
async fn manage_room(
    state: &AppState,
    room_id: &RoomId,
    change: impl FnOnce(&mut RoomEntry) -> Result<PushEvent, ErrorKind>,
) -> Result<StatusCode, ApiError> {
    let event = {
        let mut rooms = state.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| reject(ErrorKind::RoomNotFound))?;
        change(room).map_err(reject)?
    };
    state.publish(event);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/rooms/:id/close - Close a room (creator only)
async fn close_room(
    Path(room_id): Path<RoomId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&headers)?;
    manage_room(&state, &room_id, |room| room.close(&user)).await
}

/// POST /api/rooms/:id/bans - Ban a user from a room (creator only)
async fn ban_user(
    Path(room_id): Path<RoomId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BanUserRequest>,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&headers)?;
    manage_room(&state, &room_id, |room| {
        room.ban(&user, request.user_id, request.reason)
    })
    .await
}

/// DELETE /api/rooms/:id/bans/:user - Lift a ban (creator only)
async fn unban_user(
    Path((room_id, banned)): Path<(RoomId, UserId)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&headers)?;
    manage_room(&state, &room_id, |room| room.unban(&user, &banned)).await
}

fn router(state: AppState) -> Router {
    // CORS configuration for browser clients
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/clusters", get(get_clusters))
        .route("/api/rooms/viewport", get(get_viewport_rooms))
        .route("/api/rooms/{id}/close", post(close_room))
        .route("/api/rooms/{id}/bans", post(ban_user))
        .route("/api/rooms/{id}/bans/{user}", delete(unban_user))
        .route("/api/events", get(ws::events_handler))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load("config.nix").await?;

    let state = AppState::new(config.discovery);
    let shutdown = CancellationToken::new();

    cleanup::spawn_cleanup_task(state.clone(), shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            signal_token.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .context("failed to bind to address")?;
    info!("Server listening on http://{}", config.server.bind);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn as_user(user: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(user));
        headers
    }

    fn new_room(lat: f64, lng: f64) -> CreateRoomRequest {
        CreateRoomRequest {
            latitude: lat,
            longitude: lng,
            radius_meters: 200,
            category: Some("music".to_string()),
            title: None,
            ttl_minutes: None,
        }
    }

    fn cluster_query(zoom: u32) -> ClusterRequest {
        ClusterRequest {
            min_lng: 20.0,
            min_lat: 51.0,
            max_lng: 22.0,
            max_lat: 53.0,
            zoom,
            category: None,
            user_lat: None,
            user_lng: None,
        }
    }

    async fn create(state: &AppState, user: &'static str, lat: f64, lng: f64) -> RoomId {
        let (status, Json(room)) = create_room(State(state.clone()), as_user(user), Json(new_room(lat, lng)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        room.id
    }

    async fn visible_ids(state: &AppState, headers: HeaderMap) -> Vec<RoomId> {
        let Json(response) = get_clusters(State(state.clone()), headers, Query(cluster_query(18)))
            .await
            .unwrap();
        response
            .features
            .iter()
            .filter_map(Feature::room_id)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn create_requires_user_id() {
        let state = AppState::default();
        let Err((status, Json(kind))) =
            create_room(State(state), HeaderMap::new(), Json(new_room(52.0, 21.0))).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(matches!(kind, ErrorKind::MissingUserId));
    }

    #[tokio::test]
    async fn create_broadcasts_neutral_room() {
        let state = AppState::default();
        let mut events = state.subscribe();
        let id = create(&state, "alice", 52.0, 21.0).await;

        let PushEvent::RoomCreated { room } = events.try_recv().unwrap() else {
            panic!("expected room.created");
        };
        assert_eq!(room.id, id);
        assert_eq!(room.is_creator, None);
        assert_eq!(room.creator_id, Some("alice".parse().unwrap()));
    }

    #[tokio::test]
    async fn clusters_group_nearby_rooms() {
        let state = AppState::default();
        for offset in [0.0, 0.001, 0.002] {
            create(&state, "alice", 52.23 + offset, 21.01 + offset).await;
        }
        create(&state, "alice", 51.5, 20.5).await;

        let Json(response) = get_clusters(State(state.clone()), HeaderMap::new(), Query(cluster_query(10)))
            .await
            .unwrap();
        assert_eq!(response.metadata.total_rooms, 4);
        assert_eq!(response.metadata.cluster_count, 1);
        assert_eq!(response.metadata.individual_count, 1);
        let cluster = response
            .features
            .iter()
            .find_map(|feature| match feature {
                Feature::Cluster(cluster) => Some(cluster),
                Feature::Point(_) => None,
            })
            .unwrap();
        assert_eq!(cluster.point_count, 3);
    }

    #[tokio::test]
    async fn banned_user_stops_seeing_room() {
        let state = AppState::default();
        let id = create(&state, "alice", 52.0, 21.0).await;
        let mut events = state.subscribe();

        let ban = BanUserRequest {
            user_id: "bob".parse().unwrap(),
            reason: Some("spam".to_string()),
        };
        let status = ban_user(Path(id.clone()), State(state.clone()), as_user("alice"), Json(ban))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(events.try_recv().unwrap().name(), "room.userBanned");

        assert!(visible_ids(&state, as_user("bob")).await.is_empty());
        assert_eq!(visible_ids(&state, as_user("carol")).await, vec![id.clone()]);

        unban_user(
            Path((id.clone(), "bob".parse().unwrap())),
            State(state.clone()),
            as_user("alice"),
        )
        .await
        .unwrap();
        assert_eq!(events.try_recv().unwrap().name(), "room.userUnbanned");
        assert_eq!(visible_ids(&state, as_user("bob")).await, vec![id]);
    }

    #[tokio::test]
    async fn only_creator_can_close() {
        let state = AppState::default();
        let id = create(&state, "alice", 52.0, 21.0).await;

        let Err((status, _)) = close_room(Path(id.clone()), State(state.clone()), as_user("bob")).await else {
            panic!("expected rejection");
        };
        assert_eq!(status, StatusCode::FORBIDDEN);

        let status = close_room(Path(id.clone()), State(state.clone()), as_user("alice"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(visible_ids(&state, HeaderMap::new()).await.is_empty());

        let Err((status, _)) = close_room(Path(id), State(state.clone()), as_user("alice")).await else {
            panic!("expected rejection");
        };
        assert_eq!(status, StatusCode::CONFLICT);

        let missing: RoomId = "missing".parse().unwrap();
        let Err((status, _)) = close_room(Path(missing), State(state), as_user("alice")).await else {
            panic!("expected rejection");
        };
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn viewport_pages_nearest_first() {
        let state = AppState::default();
        let far = create(&state, "alice", 52.9, 21.9).await;
        let near = create(&state, "alice", 52.01, 21.01).await;
        let middle = create(&state, "alice", 52.4, 21.4).await;

        let query = |page| ViewportRoomsRequest {
            min_lng: 20.0,
            min_lat: 51.0,
            max_lng: 22.0,
            max_lat: 53.0,
            user_lat: Some(52.0),
            user_lng: Some(21.0),
            category: Some("music".to_string()),
            page,
            page_size: 2,
        };

        let Json(first) = get_viewport_rooms(State(state.clone()), HeaderMap::new(), Query(query(0)))
            .await
            .unwrap();
        let ids: Vec<RoomId> = first.rooms.iter().map(|room| room.id.clone()).collect();
        assert_eq!(ids, vec![near, middle]);
        assert!(first.has_next);
        assert_eq!(first.total_elements, 3);

        let Json(second) = get_viewport_rooms(State(state), HeaderMap::new(), Query(query(1)))
            .await
            .unwrap();
        assert_eq!(second.rooms.len(), 1);
        assert_eq!(second.rooms[0].id, far);
        assert!(!second.has_next);
    }

    #[test]
    fn distance_is_symmetric() {
        let warsaw = LatLng::new(52.2297, 21.0122);
        let paris = LatLng::new(48.8566, 2.3522);
        let d = distance_km(warsaw, paris);
        assert!((d - 1367.0).abs() < 10.0);
        assert!((d - distance_km(paris, warsaw)).abs() < 1e-9);
    }
}
