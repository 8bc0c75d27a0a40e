use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle events pushed by the server over the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PushEvent {
    #[serde(rename = "room.created")]
    RoomCreated { room: Room },
    #[serde(rename = "room.closed", rename_all = "camelCase")]
    RoomClosed {
        room_id: RoomId,
        closed_by: Option<UserId>,
    },
    #[serde(rename = "room.userBanned", rename_all = "camelCase")]
    UserBanned {
        room_id: RoomId,
        banned_user_id: UserId,
        banned_by: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "room.userUnbanned", rename_all = "camelCase")]
    UserUnbanned {
        room_id: RoomId,
        unbanned_user_id: UserId,
        unbanned_by: Option<UserId>,
    },
}

impl PushEvent {
    /// Wire name of the event, as found in the `type` field
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::RoomCreated { .. } => "room.created",
            PushEvent::RoomClosed { .. } => "room.closed",
            PushEvent::UserBanned { .. } => "room.userBanned",
            PushEvent::UserUnbanned { .. } => "room.userUnbanned",
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            PushEvent::RoomCreated { room } => &room.id,
            PushEvent::RoomClosed { room_id, .. }
            | PushEvent::UserBanned { room_id, .. }
            | PushEvent::UserUnbanned { room_id, .. } => room_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    RoomNotFound,
    MissingUserId,
    NotRoomCreator,
    RoomNotActive,
    InvalidRequest { message: String },
    Other { message: String },
}

fn validate_identifier(s: &str) -> Result<&str, &'static str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("must not be empty");
    }
    if trimmed.len() > 128 {
        return Err("must be at most 128 characters");
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err("must not contain whitespace or control characters");
    }
    Ok(trimmed)
}

/// A validated room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Get the room ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner String
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RoomIdError(String);

impl fmt::Display for RoomIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RoomIdError {}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_identifier(s)
            .map(|id| RoomId(id.to_string()))
            .map_err(|reason| RoomIdError(format!("Room ID {reason}")))
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RoomId> for String {
    fn from(r: RoomId) -> Self {
        r.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated user identifier, as issued by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Get the user ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct UserIdError(String);

impl fmt::Display for UserIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UserIdError {}

impl FromStr for UserId {
    type Err = UserIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_identifier(s)
            .map(|id| UserId(id.to_string()))
            .map_err(|reason| UserIdError(format!("User ID {reason}")))
    }
}

impl TryFrom<String> for UserId {
    type Error = UserIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UserId> for String {
    fn from(u: UserId) -> Self {
        u.0
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Geographic rectangle in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn lng_span(&self) -> f64 {
        self.east - self.west
    }

    pub fn lat_span(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.south + self.north) / 2.0,
            (self.west + self.east) / 2.0,
        )
    }
}

/// What the map currently shows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub bounds: Bounds,
    pub zoom: f64,
    pub center: LatLng,
}

impl Viewport {
    pub fn new(bounds: Bounds, zoom: f64) -> Self {
        Self {
            bounds,
            zoom,
            center: bounds.center(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Closed,
    Expired,
}

/// A room record as delivered by the API or a push event.
///
/// Everything but the id is optional so partial payloads still decode;
/// [`Room::merge`] only overwrites fields the incoming record defines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// 0 means the room is global
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_creator: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_joined: Option<bool>,
}

fn overlay<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            latitude: None,
            longitude: None,
            radius_meters: None,
            category: None,
            title: None,
            status: None,
            participant_count: None,
            expires_at: None,
            creator_id: None,
            is_creator: None,
            has_joined: None,
        }
    }

    pub fn coordinates(&self) -> Option<LatLng> {
        Some(LatLng::new(self.latitude?, self.longitude?))
    }

    pub fn is_global(&self) -> bool {
        self.radius_meters == Some(0)
    }

    /// Overlay every field `incoming` defines, keeping the rest
    pub fn merge(&mut self, incoming: Room) {
        let Room {
            id: _,
            latitude,
            longitude,
            radius_meters,
            category,
            title,
            status,
            participant_count,
            expires_at,
            creator_id,
            is_creator,
            has_joined,
        } = incoming;
        overlay(&mut self.latitude, latitude);
        overlay(&mut self.longitude, longitude);
        overlay(&mut self.radius_meters, radius_meters);
        overlay(&mut self.category, category);
        overlay(&mut self.title, title);
        overlay(&mut self.status, status);
        overlay(&mut self.participant_count, participant_count);
        overlay(&mut self.expires_at, expires_at);
        overlay(&mut self.creator_id, creator_id);
        overlay(&mut self.is_creator, is_creator);
        overlay(&mut self.has_joined, has_joined);
    }
}

/// A single room on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointFeature {
    pub room_id: RoomId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_joined: bool,
    #[serde(default)]
    pub is_creator: bool,
}

impl PointFeature {
    /// Build a point from a stored room, if it has coordinates
    pub fn from_room(room: &Room) -> Option<Self> {
        let position = room.coordinates()?;
        Some(Self {
            room_id: room.id.clone(),
            latitude: position.latitude,
            longitude: position.longitude,
            title: room.title.clone(),
            category: room.category.clone(),
            participant_count: room.participant_count,
            status: room.status,
            radius_meters: room.radius_meters,
            expires_at: room.expires_at,
            has_joined: room.has_joined.unwrap_or(false),
            is_creator: room.is_creator.unwrap_or(false),
        })
    }

    /// Partial room record carried by this point.
    ///
    /// `false` membership flags are left undefined so they never clear
    /// a flag the client already knows to be set.
    pub fn to_room(&self) -> Room {
        Room {
            id: self.room_id.clone(),
            latitude: Some(self.latitude),
            longitude: Some(self.longitude),
            radius_meters: self.radius_meters,
            category: self.category.clone(),
            title: self.title.clone(),
            status: self.status,
            participant_count: self.participant_count,
            expires_at: self.expires_at,
            creator_id: None,
            is_creator: self.is_creator.then_some(true),
            has_joined: self.has_joined.then_some(true),
        }
    }
}

/// Several nearby rooms aggregated into one marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFeature {
    pub cluster_id: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub point_count: u32,
    pub expansion_bounds: Bounds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Feature {
    Point(PointFeature),
    Cluster(ClusterFeature),
}

impl Feature {
    /// Room id of a point feature
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Feature::Point(point) => Some(&point.room_id),
            Feature::Cluster(_) => None,
        }
    }
}

/// Query for GET /api/rooms/clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
    pub zoom: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_lng: Option<f64>,
}

impl ClusterRequest {
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.min_lng, self.min_lat, self.max_lng, self.max_lat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    pub cluster_count: u32,
    pub individual_count: u32,
    pub total_rooms: u32,
    pub processing_time_ms: u64,
}

/// Response from GET /api/rooms/clusters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub features: Vec<Feature>,
    #[serde(default)]
    pub metadata: ClusterMetadata,
}

/// Query for GET /api/rooms/viewport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportRoomsRequest {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl ViewportRoomsRequest {
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.min_lng, self.min_lat, self.max_lng, self.max_lat)
    }
}

/// Response from GET /api/rooms/viewport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportRoomsResponse {
    pub rooms: Vec<Room>,
    pub has_next: bool,
    pub total_elements: u64,
}

/// Request for POST /api/rooms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius_meters: u32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

/// Request for POST /api/rooms/:id/bans
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanUserRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_id(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    #[test]
    fn valid_room_id() {
        assert!("550e8400-e29b-41d4-a716-446655440000".parse::<RoomId>().is_ok());
        assert!("X".parse::<RoomId>().is_ok());
        assert!("room_42".parse::<RoomId>().is_ok());
        assert!("a".repeat(128).parse::<RoomId>().is_ok());
    }

    #[test]
    fn room_id_invalid() {
        assert!("".parse::<RoomId>().is_err());
        assert!("   ".parse::<RoomId>().is_err());
        assert!("room 42".parse::<RoomId>().is_err());
        assert!("room\t42".parse::<RoomId>().is_err());
        assert!("a".repeat(129).parse::<RoomId>().is_err());
    }

    #[test]
    fn room_id_trims_whitespace() {
        let r: RoomId = "  abc  ".parse().unwrap();
        assert_eq!(r.as_str(), "abc");
    }

    #[test]
    fn room_id_error_message() {
        let err = "".parse::<RoomId>().unwrap_err();
        assert_eq!(err.to_string(), "Room ID must not be empty");
    }

    #[test]
    fn room_id_into_string() {
        let r = room_id("abc");
        let s: String = r.into();
        assert_eq!(s, "abc");
    }

    #[test]
    fn user_id_validation() {
        assert!("U".parse::<UserId>().is_ok());
        assert!("".parse::<UserId>().is_err());
        assert!("jan kowalski".parse::<UserId>().is_err());
        let u: UserId = "user-1".parse().unwrap();
        assert_eq!(format!("{}", u), "user-1");
    }

    #[test]
    fn room_id_rejected_during_deserialization() {
        let result = serde_json::from_str::<Room>(r#"{"id": ""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn partial_room_decodes() {
        let room: Room = serde_json::from_str(r#"{"id": "r1", "participantCount": 3}"#).unwrap();
        assert_eq!(room.id, room_id("r1"));
        assert_eq!(room.participant_count, Some(3));
        assert_eq!(room.latitude, None);
        assert_eq!(room.coordinates(), None);
    }

    #[test]
    fn merge_keeps_fields_missing_from_incoming() {
        let mut stored = Room::new(room_id("r1"));
        stored.latitude = Some(52.2);
        stored.longitude = Some(21.0);
        stored.is_creator = Some(true);
        stored.title = Some("Coffee".to_string());

        let mut incoming = Room::new(room_id("r1"));
        incoming.participant_count = Some(7);
        incoming.title = Some("Coffee & cake".to_string());
        stored.merge(incoming);

        assert_eq!(stored.is_creator, Some(true));
        assert_eq!(stored.latitude, Some(52.2));
        assert_eq!(stored.participant_count, Some(7));
        assert_eq!(stored.title.as_deref(), Some("Coffee & cake"));
    }

    #[test]
    fn global_room() {
        let mut room = Room::new(room_id("r1"));
        assert!(!room.is_global());
        room.radius_meters = Some(0);
        assert!(room.is_global());
        room.radius_meters = Some(500);
        assert!(!room.is_global());
    }

    #[test]
    fn feature_tagging() {
        let json = r#"[
            {"type": "point", "roomId": "r1", "latitude": 1.0, "longitude": 2.0},
            {"type": "cluster", "clusterId": 9, "latitude": 1.0, "longitude": 2.0, "pointCount": 4,
             "expansionBounds": {"west": 0.0, "south": 0.0, "east": 3.0, "north": 3.0}}
        ]"#;
        let features: Vec<Feature> = serde_json::from_str(json).unwrap();
        assert_eq!(features[0].room_id(), Some(&room_id("r1")));
        let Feature::Point(point) = &features[0] else {
            panic!("expected point");
        };
        assert!(!point.has_joined);
        assert!(!point.is_creator);
        assert!(matches!(&features[1], Feature::Cluster(c) if c.point_count == 4));
        assert_eq!(features[1].room_id(), None);
    }

    #[test]
    fn point_to_room_leaves_false_flags_undefined() {
        let mut room = Room::new(room_id("r1"));
        room.latitude = Some(1.0);
        room.longitude = Some(2.0);
        let point = PointFeature::from_room(&room).unwrap();
        let patch = point.to_room();
        assert_eq!(patch.is_creator, None);
        assert_eq!(patch.has_joined, None);
        assert_eq!(patch.latitude, Some(1.0));
    }

    #[test]
    fn point_requires_coordinates() {
        let room = Room::new(room_id("r1"));
        assert!(PointFeature::from_room(&room).is_none());
    }

    #[test]
    fn push_event_wire_format() {
        let json = r#"{"type": "room.userBanned", "payload": {"roomId": "X", "bannedUserId": "U", "bannedBy": "owner"}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.name(), "room.userBanned");
        assert_eq!(event.room_id(), &room_id("X"));
        match event {
            PushEvent::UserBanned {
                banned_user_id,
                reason,
                ..
            } => {
                assert_eq!(banned_user_id.as_str(), "U");
                assert_eq!(reason, None);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let created = r#"{"type": "room.created", "payload": {"room": {"id": "R", "radiusMeters": 0}}}"#;
        let event: PushEvent = serde_json::from_str(created).unwrap();
        assert!(matches!(&event, PushEvent::RoomCreated { room } if room.is_global()));
    }

    #[test]
    fn closed_event_without_closer() {
        let json = r#"{"type": "room.closed", "payload": {"roomId": "X"}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            PushEvent::RoomClosed {
                room_id: room_id("X"),
                closed_by: None,
            }
        );
    }

    #[test]
    fn bounds_center() {
        let bounds = Bounds::new(10.0, 40.0, 20.0, 50.0);
        assert_eq!(bounds.center(), LatLng::new(45.0, 15.0));
        assert_eq!(bounds.lng_span(), 10.0);
        assert_eq!(bounds.lat_span(), 10.0);
    }
}
