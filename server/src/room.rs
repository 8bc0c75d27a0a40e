use chrono::{DateTime, Duration, Utc};
use roomscope_shared::{
    Bounds, CreateRoomRequest, ErrorKind, PushEvent, Room, RoomId, RoomStatus, UserId,
};
use std::collections::{BTreeSet, HashMap};
use tracing::info;
use uuid::Uuid;

pub struct RoomEntry {
    pub id: RoomId,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: u32,
    pub category: Option<String>,
    pub title: Option<String>,
    pub creator_id: UserId,
    pub status: RoomStatus,
    pub participants: BTreeSet<UserId>,
    /// Banned user -> reason
    pub banned: HashMap<UserId, Option<String>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When the room stopped being active
    pub ended_at: Option<DateTime<Utc>>,
}

fn invalid(message: impl Into<String>) -> ErrorKind {
    ErrorKind::InvalidRequest {
        message: message.into(),
    }
}

impl RoomEntry {
    pub fn new(
        creator_id: UserId,
        request: CreateRoomRequest,
        default_ttl_minutes: u32,
    ) -> Result<Self, ErrorKind> {
        if !(-90.0..=90.0).contains(&request.latitude) {
            return Err(invalid("latitude must be within -90..=90"));
        }
        if !(-180.0..=180.0).contains(&request.longitude) {
            return Err(invalid("longitude must be within -180..=180"));
        }
        let ttl_minutes = request.ttl_minutes.unwrap_or(default_ttl_minutes);
        if ttl_minutes == 0 {
            return Err(invalid("ttlMinutes must be positive"));
        }

        let id = Uuid::new_v4()
            .to_string()
            .parse::<RoomId>()
            .map_err(|e| ErrorKind::Other {
                message: e.to_string(),
            })?;
        let now = Utc::now();
        Ok(Self {
            id,
            latitude: request.latitude,
            longitude: request.longitude,
            radius_meters: request.radius_meters,
            category: request.category,
            title: request.title,
            participants: BTreeSet::from([creator_id.clone()]),
            creator_id,
            status: RoomStatus::Active,
            banned: HashMap::new(),
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(ttl_minutes)),
            ended_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == RoomStatus::Active
    }

    pub fn is_banned(&self, user_id: &UserId) -> bool {
        self.banned.contains_key(user_id)
    }

    /// Whether `viewer` may discover this room
    pub fn visible_to(&self, viewer: Option<&UserId>) -> bool {
        self.is_active() && viewer.is_none_or(|user| !self.is_banned(user))
    }

    /// Inclusive on every edge
    pub fn within(&self, bounds: &Bounds) -> bool {
        self.longitude >= bounds.west
            && self.longitude <= bounds.east
            && self.latitude >= bounds.south
            && self.latitude <= bounds.north
    }

    pub fn matches_category(&self, category: Option<&str>) -> bool {
        category.is_none_or(|wanted| self.category.as_deref() == Some(wanted))
    }

    fn ensure_managed_by(&self, user_id: &UserId) -> Result<(), ErrorKind> {
        if &self.creator_id != user_id {
            return Err(ErrorKind::NotRoomCreator);
        }
        if !self.is_active() {
            return Err(ErrorKind::RoomNotActive);
        }
        Ok(())
    }

    pub fn close(&mut self, by: &UserId) -> Result<PushEvent, ErrorKind> {
        self.ensure_managed_by(by)?;
        self.status = RoomStatus::Closed;
        self.ended_at = Some(Utc::now());
        info!(room_id = %self.id, closed_by = %by, "Room closed");
        Ok(PushEvent::RoomClosed {
            room_id: self.id.clone(),
            closed_by: Some(by.clone()),
        })
    }

    pub fn ban(
        &mut self,
        by: &UserId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<PushEvent, ErrorKind> {
        self.ensure_managed_by(by)?;
        if &user_id == by {
            return Err(invalid("the room creator cannot be banned"));
        }
        self.participants.remove(&user_id);
        self.banned.insert(user_id.clone(), reason.clone());
        info!(room_id = %self.id, user = %user_id, "User banned");
        Ok(PushEvent::UserBanned {
            room_id: self.id.clone(),
            banned_user_id: user_id,
            banned_by: Some(by.clone()),
            reason,
        })
    }

    pub fn unban(&mut self, by: &UserId, user_id: &UserId) -> Result<PushEvent, ErrorKind> {
        self.ensure_managed_by(by)?;
        if self.banned.remove(user_id).is_none() {
            return Err(invalid(format!("user {user_id} is not banned")));
        }
        info!(room_id = %self.id, user = %user_id, "User unbanned");
        Ok(PushEvent::UserUnbanned {
            room_id: self.id.clone(),
            unbanned_user_id: user_id.clone(),
            unbanned_by: Some(by.clone()),
        })
    }

    /// Mark the room expired if its lifetime is over. Returns true on transition.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active() && self.expires_at <= now {
            self.status = RoomStatus::Expired;
            self.ended_at = Some(now);
            true
        } else {
            false
        }
    }

    /// The room as seen by `viewer`
    pub fn to_room(&self, viewer: Option<&UserId>) -> Room {
        let mut room = Room::new(self.id.clone());
        room.latitude = Some(self.latitude);
        room.longitude = Some(self.longitude);
        room.radius_meters = Some(self.radius_meters);
        room.category = self.category.clone();
        room.title = self.title.clone();
        room.status = Some(self.status);
        room.participant_count = Some(self.participants.len() as u32);
        room.expires_at = Some(self.expires_at);
        room.creator_id = Some(self.creator_id.clone());
        if let Some(viewer) = viewer {
            room.is_creator = Some(&self.creator_id == viewer);
            room.has_joined = Some(self.participants.contains(viewer));
        }
        room
    }
}
