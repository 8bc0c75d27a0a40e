use roomscope_shared::{
    ClusterResponse, Feature, LatLng, PushEvent, Room, RoomId, UserId, Viewport,
    ViewportRoomsResponse,
};
use std::collections::HashSet;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ClusterClient, DiscoveryApi, FetchError};
use crate::config::EngineConfig;
use crate::debounce::{DebounceDelays, ViewportDebouncer, ViewportSample};
use crate::events::{Actions, EventController, HandlerContext};
use crate::geo::bounds_from_center_zoom;
use crate::reconcile::{confirmed_pending, reconcile, reconcile_list};
use crate::store::LocalStore;

pub enum Command {
    ViewportChanged(Viewport),
    SetCategory(Option<String>),
    SetUserLocation(Option<LatLng>),
    /// Fetch the current viewport now, e.g. to retry after an error
    Refresh,
    /// Fetch ahead of an animated camera move
    Prefetch { center: LatLng, zoom: f64 },
    Push(PushEvent),
    RoomCreatedLocally(Room),
    RoomJoined(RoomId),
    RoomLeft(RoomId),
    /// Load the first page of the room list, or the next one
    LoadRooms { reset: bool },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomListSnapshot {
    pub rooms: Vec<Room>,
    pub has_more: bool,
    pub total_count: u64,
    pub loading: bool,
}

/// Everything the renderer needs, republished after every change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverySnapshot {
    pub features: Vec<Feature>,
    pub list: RoomListSnapshot,
    pub viewport: Option<Viewport>,
    pub category: Option<String>,
    pub loading: bool,
    /// Message of the last failed fetch; cleared by the next successful one
    pub error: Option<String>,
    pub pending_room_ids: Vec<RoomId>,
    pub hidden_room_ids: Vec<RoomId>,
}

impl DiscoverySnapshot {
    pub fn point_ids(&self) -> impl Iterator<Item = &RoomId> {
        self.features.iter().filter_map(Feature::room_id)
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<DiscoverySnapshot>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Discovery engine stopped, dropping command");
        }
    }

    pub fn viewport_changed(&self, viewport: Viewport) {
        self.send(Command::ViewportChanged(viewport));
    }

    pub fn set_category(&self, category: Option<String>) {
        self.send(Command::SetCategory(category));
    }

    pub fn set_user_location(&self, location: Option<LatLng>) {
        self.send(Command::SetUserLocation(location));
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn prefetch(&self, center: LatLng, zoom: f64) {
        self.send(Command::Prefetch { center, zoom });
    }

    pub fn push_event(&self, event: PushEvent) {
        self.send(Command::Push(event));
    }

    pub fn room_created(&self, room: Room) {
        self.send(Command::RoomCreatedLocally(room));
    }

    pub fn room_joined(&self, room_id: RoomId) {
        self.send(Command::RoomJoined(room_id));
    }

    pub fn room_left(&self, room_id: RoomId) {
        self.send(Command::RoomLeft(room_id));
    }

    pub fn load_rooms(&self, reset: bool) {
        self.send(Command::LoadRooms { reset });
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoverySnapshot> {
        self.snapshots.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

enum FetchOutcome {
    Clusters {
        seq: u64,
        result: Result<ClusterResponse, FetchError>,
    },
    Rooms {
        seq: u64,
        page: u32,
        result: Result<ViewportRoomsResponse, FetchError>,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RefetchRequest {
    #[default]
    None,
    Delayed,
    Immediate,
}

#[derive(Debug, Default)]
struct ListState {
    room_ids: Vec<RoomId>,
    next_page: u32,
    has_more: bool,
    total_count: u64,
    loaded: bool,
    /// First page asked for before any viewport settled
    requested: bool,
    loading: bool,
}

/// Handler-facing view of the engine state
struct EngineActions<'a> {
    store: &'a mut LocalStore,
    raw_features: &'a mut Vec<Feature>,
    list_ids: &'a mut Vec<RoomId>,
    config: &'a EngineConfig,
    now: Instant,
    refetch: RefetchRequest,
}

impl Actions for EngineActions<'_> {
    fn add_room(&mut self, room: Room) {
        let id = room.id.clone();
        self.store.upsert_room(room);
        self.store
            .mark_pending(id, self.config.pending_ttl(), self.now);
    }

    fn remove_room(&mut self, room_id: &RoomId) {
        self.store.remove_room(room_id);
        self.raw_features
            .retain(|feature| feature.room_id() != Some(room_id));
        self.list_ids.retain(|id| id != room_id);
    }

    fn exclude_room(&mut self, room_id: &RoomId) {
        self.store
            .hide(room_id.clone(), self.config.hidden_ttl(), self.now);
    }

    fn include_room(&mut self, room_id: &RoomId) {
        self.store.unhide(room_id);
    }

    fn refetch(&mut self, immediate: bool) {
        let request = if immediate {
            RefetchRequest::Immediate
        } else {
            RefetchRequest::Delayed
        };
        self.refetch = self.refetch.max(request);
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns all discovery state and runs on a single task, so commands, timer
/// expirations and fetch completions are handled one at a time.
pub struct DiscoveryEngine<A> {
    client: ClusterClient<A>,
    config: EngineConfig,
    store: LocalStore,
    controller: EventController,
    context: HandlerContext,
    debouncer: ViewportDebouncer,
    user_location: Option<LatLng>,
    raw_features: Vec<Feature>,
    list: ListState,
    refetch_at: Option<Instant>,
    cluster_seq: u64,
    list_seq: u64,
    clusters_loading: bool,
    error: Option<String>,
    results: mpsc::UnboundedSender<FetchOutcome>,
    snapshots: watch::Sender<DiscoverySnapshot>,
    shutdown: CancellationToken,
}

impl<A: DiscoveryApi> DiscoveryEngine<A> {
    pub fn spawn(
        client: ClusterClient<A>,
        config: EngineConfig,
        current_user: Option<UserId>,
    ) -> EngineHandle {
        Self::spawn_with_controller(client, config, current_user, EventController::new())
    }

    pub fn spawn_with_controller(
        client: ClusterClient<A>,
        config: EngineConfig,
        current_user: Option<UserId>,
        controller: EventController,
    ) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(DiscoverySnapshot::default());
        let shutdown = CancellationToken::new();

        let engine = Self {
            client,
            debouncer: ViewportDebouncer::new(DebounceDelays::from(&config)),
            config,
            store: LocalStore::new(),
            controller,
            context: HandlerContext { current_user },
            user_location: None,
            raw_features: Vec::new(),
            list: ListState::default(),
            refetch_at: None,
            cluster_seq: 0,
            list_seq: 0,
            clusters_loading: false,
            error: None,
            results: results_tx,
            snapshots: snapshot_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(engine.run(command_rx, results_rx));

        EngineHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            shutdown,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<FetchOutcome>,
    ) {
        info!(user = ?self.context.current_user, "Discovery engine started");
        let shutdown = self.shutdown.clone();
        loop {
            let debounce_at = self.debouncer.deadline();
            let refetch_at = self.refetch_at;
            let expiry_at = self.store.next_expiry();
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(outcome) = results.recv() => self.on_fetch_outcome(outcome),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                _ = sleep_until_some(debounce_at) => self.on_debounce_due(),
                _ = sleep_until_some(refetch_at) => self.on_refetch_due(),
                _ = sleep_until_some(expiry_at) => self.on_expiry_due(),
            }
        }
        shutdown.cancel();
        info!("Discovery engine stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ViewportChanged(viewport) => {
                self.debouncer.push(viewport, Instant::now());
            }
            Command::SetCategory(category) => match self.debouncer.set_category(category) {
                Some(sample) => self.fetch_viewport(&sample),
                None => self.publish(),
            },
            Command::SetUserLocation(location) => {
                self.user_location = location;
            }
            Command::Refresh => match self.debouncer.refresh() {
                Some(sample) => self.fetch_viewport(&sample),
                None => debug!("Refresh requested before any viewport"),
            },
            Command::Prefetch { center, zoom } => {
                let bounds = bounds_from_center_zoom(center, zoom, self.config.prefetch_padding);
                let sample = ViewportSample {
                    viewport: Viewport {
                        bounds,
                        zoom,
                        center,
                    },
                    category: self.debouncer.category().map(str::to_string),
                };
                self.fetch_clusters(&sample, true);
            }
            Command::Push(event) => {
                debug!(event = event.name(), room_id = %event.room_id(), "Push event");
                self.with_actions(|controller, context, actions| {
                    controller.dispatch(&event, context, actions);
                });
            }
            Command::RoomCreatedLocally(mut room) => {
                room.is_creator = Some(true);
                room.has_joined = Some(true);
                self.with_actions(|_, _, actions| {
                    actions.add_room(room);
                    actions.refetch(false);
                });
            }
            Command::RoomJoined(room_id) => {
                self.store.mark_joined(room_id);
                self.publish();
            }
            Command::RoomLeft(room_id) => {
                self.store.mark_left(&room_id);
                self.publish();
            }
            Command::LoadRooms { reset } => {
                if reset || !self.list.loaded {
                    self.fetch_rooms(0);
                } else if self.list.has_more && !self.list.loading {
                    self.fetch_rooms(self.list.next_page);
                }
            }
        }
    }

    /// Run `f` against the actions capability, then apply the refetch it asked
    /// for and republish.
    fn with_actions(
        &mut self,
        f: impl FnOnce(&EventController, &HandlerContext, &mut dyn Actions),
    ) {
        let mut actions = EngineActions {
            store: &mut self.store,
            raw_features: &mut self.raw_features,
            list_ids: &mut self.list.room_ids,
            config: &self.config,
            now: Instant::now(),
            refetch: RefetchRequest::None,
        };
        f(&self.controller, &self.context, &mut actions);
        let refetch = actions.refetch;

        match refetch {
            RefetchRequest::None => {}
            RefetchRequest::Delayed => {
                if self.refetch_at.is_none() {
                    self.refetch_at = Some(Instant::now() + self.config.refetch_delay());
                }
            }
            RefetchRequest::Immediate => {
                self.refetch_at = None;
                self.confirming_fetch();
            }
        }
        self.publish();
    }

    fn on_debounce_due(&mut self) {
        if let Some(sample) = self.debouncer.poll(Instant::now()) {
            self.fetch_viewport(&sample);
        }
    }

    fn on_refetch_due(&mut self) {
        self.refetch_at = None;
        self.confirming_fetch();
    }

    fn on_expiry_due(&mut self) {
        let expired = self.store.expire_due(Instant::now());
        if !expired.is_empty() {
            debug!(
                hidden = expired.hidden.len(),
                pending = expired.pending.len(),
                "TTL entries expired"
            );
            self.publish();
        }
    }

    fn confirming_fetch(&mut self) {
        match self.debouncer.current() {
            Some(sample) => self.fetch_viewport(&sample),
            None => debug!("No viewport yet, skipping refetch"),
        }
    }

    /// Clusters for the sample, plus the first list page if the list is in use
    fn fetch_viewport(&mut self, sample: &ViewportSample) {
        self.fetch_clusters(sample, true);
        if self.list.loaded || self.list.requested {
            self.fetch_rooms(0);
        }
    }

    fn fetch_clusters(&mut self, sample: &ViewportSample, expand: bool) {
        self.cluster_seq += 1;
        self.clusters_loading = true;

        let seq = self.cluster_seq;
        let client = self.client.clone();
        let results = self.results.clone();
        let shutdown = self.shutdown.clone();
        let bounds = sample.viewport.bounds;
        let zoom = sample.viewport.zoom;
        let category = sample.category.clone();
        let user_location = self.user_location;
        debug!(seq, zoom, expand, "Fetching clusters");

        tokio::spawn(async move {
            let fetch =
                client.fetch_clusters(&bounds, zoom, category.as_deref(), user_location, expand);
            select! {
                _ = shutdown.cancelled() => {}
                result = fetch => {
                    let _ = results.send(FetchOutcome::Clusters { seq, result });
                }
            }
        });
        self.publish();
    }

    fn fetch_rooms(&mut self, page: u32) {
        let Some(sample) = self.debouncer.current() else {
            debug!("Room list requested before any viewport, deferring");
            self.list.requested = true;
            return;
        };
        self.list.requested = false;
        self.list_seq += 1;
        self.list.loading = true;

        let seq = self.list_seq;
        let client = self.client.clone();
        let results = self.results.clone();
        let shutdown = self.shutdown.clone();
        let user_location = self.user_location;
        let page_size = self.config.page_size;
        debug!(seq, page, "Fetching room list");

        tokio::spawn(async move {
            let fetch = client.fetch_viewport_rooms(
                &sample.viewport.bounds,
                user_location,
                sample.category.as_deref(),
                page,
                page_size,
            );
            select! {
                _ = shutdown.cancelled() => {}
                result = fetch => {
                    let _ = results.send(FetchOutcome::Rooms { seq, page, result });
                }
            }
        });
        self.publish();
    }

    fn on_fetch_outcome(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Clusters { seq, result } => {
                if seq != self.cluster_seq {
                    debug!(seq, latest = self.cluster_seq, "Discarding stale cluster response");
                    return;
                }
                self.clusters_loading = false;
                match result {
                    Ok(response) => self.apply_clusters(response),
                    Err(err) => {
                        warn!("Cluster fetch failed: {}", err);
                        self.error = Some(err.to_string());
                    }
                }
            }
            FetchOutcome::Rooms { seq, page, result } => {
                if seq != self.list_seq {
                    debug!(seq, latest = self.list_seq, "Discarding stale room list response");
                    return;
                }
                self.list.loading = false;
                match result {
                    Ok(response) => self.apply_rooms(page, response),
                    Err(err) => {
                        warn!("Room list fetch failed: {}", err);
                        self.error = Some(err.to_string());
                    }
                }
            }
        }
        self.publish();
    }

    fn apply_clusters(&mut self, response: ClusterResponse) {
        self.error = None;
        self.store
            .upsert_rooms(response.features.iter().filter_map(|feature| match feature {
                Feature::Point(point) => Some(point.to_room()),
                Feature::Cluster(_) => None,
            }));
        for room_id in confirmed_pending(&response.features, &self.store) {
            debug!(room_id = %room_id, "Pending room confirmed by server");
            self.store.unmark_pending(&room_id);
        }
        self.raw_features = response.features;
        self.prune_store();
    }

    fn apply_rooms(&mut self, page: u32, response: ViewportRoomsResponse) {
        self.error = None;
        let ids: Vec<RoomId> = response.rooms.iter().map(|room| room.id.clone()).collect();
        self.store.upsert_rooms(response.rooms);
        if page == 0 {
            self.list.room_ids = ids;
        } else {
            for id in ids {
                if !self.list.room_ids.contains(&id) {
                    self.list.room_ids.push(id);
                }
            }
        }
        self.list.next_page = page + 1;
        self.list.has_more = response.has_next;
        self.list.total_count = response.total_elements;
        self.list.loaded = true;
        self.prune_store();
    }

    /// Drop room records that neither the map nor the list references anymore
    fn prune_store(&mut self) {
        let on_map: HashSet<&RoomId> =
            self.raw_features.iter().filter_map(Feature::room_id).collect();
        let listed: HashSet<&RoomId> = self.list.room_ids.iter().collect();
        let dropped = self
            .store
            .retain_rooms(|id| on_map.contains(id) || listed.contains(id));
        if dropped > 0 {
            debug!(dropped, "Pruned unreferenced room records");
        }
    }

    fn publish(&self) {
        let current = self.debouncer.current();
        let rooms = if self.list.loaded {
            reconcile_list(
                &self.list.room_ids,
                current.as_ref().map(|sample| &sample.viewport.bounds),
                &self.store,
            )
        } else {
            Vec::new()
        };

        let mut pending_room_ids: Vec<RoomId> = self.store.pending().ids().cloned().collect();
        pending_room_ids.sort();
        let mut hidden_room_ids: Vec<RoomId> = self.store.hidden().ids().cloned().collect();
        hidden_room_ids.sort();

        self.snapshots.send_replace(DiscoverySnapshot {
            features: reconcile(&self.raw_features, &self.store),
            list: RoomListSnapshot {
                rooms,
                has_more: self.list.has_more,
                total_count: self.list.total_count,
                loading: self.list.loading,
            },
            viewport: current.as_ref().map(|sample| sample.viewport),
            category: self.debouncer.category().map(str::to_string),
            loading: self.clusters_loading,
            error: self.error.clone(),
            pending_room_ids,
            hidden_room_ids,
        });
    }
}
