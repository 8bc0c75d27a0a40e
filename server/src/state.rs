use crate::config::DiscoveryConfig;
use crate::room::RoomEntry;
use roomscope_shared::{PushEvent, RoomId};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

pub type Rooms = Arc<RwLock<HashMap<RoomId, RoomEntry>>>;

#[derive(Clone)]
pub struct AppState {
    pub rooms: Rooms,
    pub events: broadcast::Sender<PushEvent>,
    pub discovery: Arc<DiscoveryConfig>,
}

impl AppState {
    pub fn new(discovery: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            events,
            discovery: Arc::new(discovery),
        }
    }

    /// Send an event to every connected event stream
    pub fn publish(&self, event: PushEvent) {
        debug!(event = event.name(), room_id = %event.room_id(), "Publishing event");
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}
