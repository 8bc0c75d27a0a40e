//! Push event handling.
//!
//! Handlers never see the store or the rendered list. They describe what
//! should happen through [`Actions`], and the engine routes every change
//! back through reconciliation.

use roomscope_shared::{PushEvent, Room, RoomId, UserId};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RoomCreated,
    RoomClosed,
    UserBanned,
    UserUnbanned,
}

impl EventKind {
    pub fn of(event: &PushEvent) -> Self {
        match event {
            PushEvent::RoomCreated { .. } => EventKind::RoomCreated,
            PushEvent::RoomClosed { .. } => EventKind::RoomClosed,
            PushEvent::UserBanned { .. } => EventKind::UserBanned,
            PushEvent::UserUnbanned { .. } => EventKind::UserUnbanned,
        }
    }
}

/// What a handler is allowed to do
pub trait Actions {
    /// Add a room to the optimistic list; it stays pending until a fetch confirms it
    fn add_room(&mut self, room: Room);
    /// Drop a room from the optimistic list and the local store
    fn remove_room(&mut self, room_id: &RoomId);
    /// Hide a room from discovery for the hidden TTL
    fn exclude_room(&mut self, room_id: &RoomId);
    fn include_room(&mut self, room_id: &RoomId);
    /// Ask for a confirming fetch, now or after the refetch delay
    fn refetch(&mut self, immediate: bool);
}

#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub current_user: Option<UserId>,
}

impl HandlerContext {
    pub fn is_current_user(&self, user: &UserId) -> bool {
        self.current_user.as_ref() == Some(user)
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("room {0} has no coordinates")]
    MissingCoordinates(RoomId),

    #[error("unexpected event {0}")]
    UnexpectedEvent(&'static str),

    #[error("{0}")]
    Other(String),
}

pub trait EventHandler: Send {
    fn handle(
        &self,
        event: &PushEvent,
        context: &HandlerContext,
        actions: &mut dyn Actions,
    ) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&PushEvent, &HandlerContext, &mut dyn Actions) -> Result<(), HandlerError> + Send,
{
    fn handle(
        &self,
        event: &PushEvent,
        context: &HandlerContext,
        actions: &mut dyn Actions,
    ) -> Result<(), HandlerError> {
        self(event, context, actions)
    }
}

/// Registry of handlers per event kind
pub struct EventController {
    handlers: HashMap<EventKind, Vec<Box<dyn EventHandler>>>,
}

impl EventController {
    /// Controller without any handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Controller with the standard room lifecycle handlers
    pub fn new() -> Self {
        let mut controller = Self::empty();
        controller.register(EventKind::RoomCreated, on_room_created);
        controller.register(EventKind::RoomClosed, on_room_closed);
        controller.register(EventKind::UserBanned, on_user_banned);
        controller.register(EventKind::UserUnbanned, on_user_unbanned);
        controller
    }

    pub fn register(&mut self, kind: EventKind, handler: impl EventHandler + 'static) {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Run every handler registered for the event.
    ///
    /// A failing or panicking handler is logged and does not stop the others.
    /// Returns the number of handlers that failed.
    pub fn dispatch(
        &self,
        event: &PushEvent,
        context: &HandlerContext,
        actions: &mut dyn Actions,
    ) -> usize {
        let Some(handlers) = self.handlers.get(&EventKind::of(event)) else {
            debug!(event = event.name(), "No handler registered");
            return 0;
        };

        let mut failures = 0;
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.handle(event, context, &mut *actions)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(event = event.name(), room_id = %event.room_id(), "Event handler failed: {}", err);
                }
                Err(_) => {
                    failures += 1;
                    error!(event = event.name(), room_id = %event.room_id(), "Event handler panicked");
                }
            }
        }
        failures
    }
}

impl Default for EventController {
    fn default() -> Self {
        Self::new()
    }
}

/// Show rooms the current user created, and global rooms, before the
/// clustering index has them.
pub fn on_room_created(
    event: &PushEvent,
    context: &HandlerContext,
    actions: &mut dyn Actions,
) -> Result<(), HandlerError> {
    let PushEvent::RoomCreated { room } = event else {
        return Err(HandlerError::UnexpectedEvent(event.name()));
    };
    let created_by_me = room
        .creator_id
        .as_ref()
        .is_some_and(|creator| context.is_current_user(creator));
    if !created_by_me && !room.is_global() {
        return Ok(());
    }
    if room.coordinates().is_none() {
        return Err(HandlerError::MissingCoordinates(room.id.clone()));
    }

    let mut room = room.clone();
    if created_by_me {
        room.is_creator = Some(true);
        room.has_joined = Some(true);
    }
    debug!(room_id = %room.id, global = room.is_global(), "Adding created room optimistically");
    actions.add_room(room);
    actions.refetch(false);
    Ok(())
}

pub fn on_room_closed(
    event: &PushEvent,
    _context: &HandlerContext,
    actions: &mut dyn Actions,
) -> Result<(), HandlerError> {
    let PushEvent::RoomClosed { room_id, .. } = event else {
        return Err(HandlerError::UnexpectedEvent(event.name()));
    };
    actions.remove_room(room_id);
    actions.exclude_room(room_id);
    actions.refetch(false);
    Ok(())
}

pub fn on_user_banned(
    event: &PushEvent,
    context: &HandlerContext,
    actions: &mut dyn Actions,
) -> Result<(), HandlerError> {
    let PushEvent::UserBanned {
        room_id,
        banned_user_id,
        ..
    } = event
    else {
        return Err(HandlerError::UnexpectedEvent(event.name()));
    };
    if !context.is_current_user(banned_user_id) {
        return Ok(());
    }
    actions.remove_room(room_id);
    actions.exclude_room(room_id);
    actions.refetch(false);
    Ok(())
}

/// The user is waiting to see the room come back, so refetch right away
pub fn on_user_unbanned(
    event: &PushEvent,
    context: &HandlerContext,
    actions: &mut dyn Actions,
) -> Result<(), HandlerError> {
    let PushEvent::UserUnbanned {
        room_id,
        unbanned_user_id,
        ..
    } = event
    else {
        return Err(HandlerError::UnexpectedEvent(event.name()));
    };
    if !context.is_current_user(unbanned_user_id) {
        return Ok(());
    }
    actions.include_room(room_id);
    actions.refetch(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Add(RoomId),
        Remove(RoomId),
        Exclude(RoomId),
        Include(RoomId),
        Refetch(bool),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        added: Vec<Room>,
    }

    impl Actions for Recorder {
        fn add_room(&mut self, room: Room) {
            self.calls.push(Call::Add(room.id.clone()));
            self.added.push(room);
        }
        fn remove_room(&mut self, room_id: &RoomId) {
            self.calls.push(Call::Remove(room_id.clone()));
        }
        fn exclude_room(&mut self, room_id: &RoomId) {
            self.calls.push(Call::Exclude(room_id.clone()));
        }
        fn include_room(&mut self, room_id: &RoomId) {
            self.calls.push(Call::Include(room_id.clone()));
        }
        fn refetch(&mut self, immediate: bool) {
            self.calls.push(Call::Refetch(immediate));
        }
    }

    fn id(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    fn user(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn context() -> HandlerContext {
        HandlerContext {
            current_user: Some(user("U")),
        }
    }

    fn created(creator: &str, radius: u32) -> PushEvent {
        let mut room = Room::new(id("R"));
        room.latitude = Some(52.0);
        room.longitude = Some(21.0);
        room.radius_meters = Some(radius);
        room.creator_id = Some(user(creator));
        PushEvent::RoomCreated { room }
    }

    fn dispatch(event: &PushEvent) -> Recorder {
        let mut recorder = Recorder::default();
        let failures = EventController::new().dispatch(event, &context(), &mut recorder);
        assert_eq!(failures, 0);
        recorder
    }

    #[test]
    fn own_room_added_as_creator() {
        let recorder = dispatch(&created("U", 300));
        assert_eq!(recorder.calls, vec![Call::Add(id("R")), Call::Refetch(false)]);
        assert_eq!(recorder.added[0].is_creator, Some(true));
        assert_eq!(recorder.added[0].has_joined, Some(true));
    }

    #[test]
    fn global_room_from_someone_else_added() {
        let recorder = dispatch(&created("other", 0));
        assert_eq!(recorder.calls, vec![Call::Add(id("R")), Call::Refetch(false)]);
        assert_eq!(recorder.added[0].is_creator, None);
    }

    #[test]
    fn local_room_from_someone_else_ignored() {
        let recorder = dispatch(&created("other", 300));
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn created_room_without_coordinates_fails() {
        let mut room = Room::new(id("R"));
        room.radius_meters = Some(0);
        let event = PushEvent::RoomCreated { room };
        let mut recorder = Recorder::default();
        let failures = EventController::new().dispatch(&event, &context(), &mut recorder);
        assert_eq!(failures, 1);
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn closed_room_removed_and_hidden() {
        let event = PushEvent::RoomClosed {
            room_id: id("X"),
            closed_by: Some(user("owner")),
        };
        assert_eq!(
            dispatch(&event).calls,
            vec![
                Call::Remove(id("X")),
                Call::Exclude(id("X")),
                Call::Refetch(false)
            ]
        );
    }

    #[test]
    fn ban_only_applies_to_current_user() {
        let mine = PushEvent::UserBanned {
            room_id: id("X"),
            banned_user_id: user("U"),
            banned_by: Some(user("owner")),
            reason: Some("spam".to_string()),
        };
        assert_eq!(
            dispatch(&mine).calls,
            vec![
                Call::Remove(id("X")),
                Call::Exclude(id("X")),
                Call::Refetch(false)
            ]
        );

        let theirs = PushEvent::UserBanned {
            room_id: id("X"),
            banned_user_id: user("someone"),
            banned_by: None,
            reason: None,
        };
        assert!(dispatch(&theirs).calls.is_empty());
    }

    #[test]
    fn unban_refetches_immediately() {
        let event = PushEvent::UserUnbanned {
            room_id: id("X"),
            unbanned_user_id: user("U"),
            unbanned_by: None,
        };
        assert_eq!(
            dispatch(&event).calls,
            vec![Call::Include(id("X")), Call::Refetch(true)]
        );
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let mut controller = EventController::empty();
        controller.register(
            EventKind::RoomClosed,
            |_: &PushEvent, _: &HandlerContext, _: &mut dyn Actions| -> Result<(), HandlerError> {
                panic!("boom")
            },
        );
        controller.register(
            EventKind::RoomClosed,
            |_: &PushEvent, _: &HandlerContext, _: &mut dyn Actions| -> Result<(), HandlerError> {
                Err(HandlerError::Other("nope".to_string()))
            },
        );
        controller.register(EventKind::RoomClosed, on_room_closed);

        let event = PushEvent::RoomClosed {
            room_id: id("X"),
            closed_by: None,
        };
        let mut recorder = Recorder::default();
        let failures = controller.dispatch(&event, &context(), &mut recorder);
        assert_eq!(failures, 2);
        assert_eq!(recorder.calls.len(), 3);
    }

    #[test]
    fn unregistered_kind_is_ignored() {
        let event = PushEvent::RoomClosed {
            room_id: id("X"),
            closed_by: None,
        };
        let mut recorder = Recorder::default();
        assert_eq!(
            EventController::empty().dispatch(&event, &context(), &mut recorder),
            0
        );
        assert!(recorder.calls.is_empty());
    }
}
