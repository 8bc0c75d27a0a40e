use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AppState;

/// Spawns a background task that expires rooms past their lifetime and drops
/// rooms that ended longer than the retention window ago.
pub fn spawn_cleanup_task(state: AppState, shutdown: CancellationToken) {
    let interval = Duration::from_secs(state.discovery.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => cleanup_rooms(&state, Utc::now()).await,
            }
        }
    });
}

async fn cleanup_rooms(state: &AppState, now: DateTime<Utc>) {
    let retention = chrono::Duration::minutes(state.discovery.retention_minutes);

    let mut rooms = state.rooms.write().await;
    let initial_count = rooms.len();

    let mut expired = 0;
    for room in rooms.values_mut() {
        if room.expire_if_due(now) {
            info!(room_id = %room.id, "Room expired");
            expired += 1;
        }
    }

    rooms.retain(|room_id, room| match room.ended_at {
        Some(ended_at) if now.signed_duration_since(ended_at) > retention => {
            info!(
                "Removing room {} (ended {} minutes ago)",
                room_id,
                now.signed_duration_since(ended_at).num_minutes()
            );
            false
        }
        _ => true,
    });

    let removed = initial_count - rooms.len();
    if expired > 0 || removed > 0 {
        info!("Cleanup complete: expired {} rooms, removed {} rooms", expired, removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomEntry;
    use roomscope_shared::{CreateRoomRequest, RoomStatus};

    async fn insert_room(state: &AppState, ttl_minutes: u32) -> roomscope_shared::RoomId {
        let request = CreateRoomRequest {
            latitude: 1.0,
            longitude: 1.0,
            radius_meters: 100,
            category: None,
            title: None,
            ttl_minutes: Some(ttl_minutes),
        };
        let entry = RoomEntry::new("alice".parse().unwrap(), request, 60).unwrap();
        let id = entry.id.clone();
        state.rooms.write().await.insert(id.clone(), entry);
        id
    }

    #[tokio::test]
    async fn expires_then_drops_after_retention() {
        let state = AppState::default();
        let id = insert_room(&state, 10).await;
        let expires_at = state.rooms.read().await[&id].expires_at;

        cleanup_rooms(&state, expires_at - chrono::Duration::minutes(1)).await;
        assert_eq!(state.rooms.read().await[&id].status, RoomStatus::Active);

        cleanup_rooms(&state, expires_at).await;
        assert_eq!(state.rooms.read().await[&id].status, RoomStatus::Expired);

        cleanup_rooms(&state, expires_at + chrono::Duration::minutes(59)).await;
        assert!(state.rooms.read().await.contains_key(&id));

        cleanup_rooms(&state, expires_at + chrono::Duration::minutes(61)).await;
        assert!(!state.rooms.read().await.contains_key(&id));
    }
}
