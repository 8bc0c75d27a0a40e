//! Merging of fetched features with the client's optimistic state.
//!
//! Everything here is a pure function of the fetched features and the
//! [`LocalStore`]; running it twice on the same inputs gives the same output.

use roomscope_shared::{Bounds, ClusterFeature, Feature, PointFeature, Room, RoomId};
use std::collections::HashSet;

use crate::geo::point_in_bounds;
use crate::store::LocalStore;

fn hydrate(point: &PointFeature, store: &LocalStore) -> PointFeature {
    let mut hydrated = point.clone();
    hydrated.has_joined = store.is_joined(&point.room_id);
    hydrated.is_creator = store.is_created(&point.room_id);
    if let Some(room) = store.room(&point.room_id) {
        hydrated.participant_count = room.participant_count.or(point.participant_count);
        hydrated.status = room.status.or(point.status);
        hydrated.title = room.title.clone().or_else(|| point.title.clone());
        hydrated.category = room.category.clone().or_else(|| point.category.clone());
        hydrated.radius_meters = room.radius_meters.or(point.radius_meters);
        hydrated.expires_at = room.expires_at.or(point.expires_at);
    }
    hydrated
}

fn inside_any_cluster(lat: f64, lng: f64, clusters: &[&ClusterFeature]) -> bool {
    clusters
        .iter()
        .any(|cluster| point_in_bounds(lat, lng, &cluster.expansion_bounds))
}

fn sorted_pending(store: &LocalStore) -> Vec<&RoomId> {
    let mut pending: Vec<&RoomId> = store.pending().ids().collect();
    pending.sort();
    pending
}

/// Build the feature list handed to the renderer.
///
/// 1. Points are hydrated with membership flags and stored field values.
/// 2. Pending rooms missing from the list are added as points, unless a
///    cluster's expansion bounds already covers them.
/// 3. Hidden points are dropped. Clusters are never filtered.
pub fn reconcile(features: &[Feature], store: &LocalStore) -> Vec<Feature> {
    let clusters: Vec<&ClusterFeature> = features
        .iter()
        .filter_map(|feature| match feature {
            Feature::Cluster(cluster) => Some(cluster),
            Feature::Point(_) => None,
        })
        .collect();

    let mut seen = HashSet::new();
    let mut output = Vec::with_capacity(features.len() + store.pending().len());

    for feature in features {
        match feature {
            Feature::Point(point) => {
                if seen.insert(point.room_id.clone()) {
                    output.push(Feature::Point(hydrate(point, store)));
                }
            }
            Feature::Cluster(cluster) => output.push(Feature::Cluster(cluster.clone())),
        }
    }

    for id in sorted_pending(store) {
        if seen.contains(id) {
            continue;
        }
        let Some(point) = store.room(id).and_then(PointFeature::from_room) else {
            continue;
        };
        if inside_any_cluster(point.latitude, point.longitude, &clusters) {
            continue;
        }
        seen.insert(id.clone());
        output.push(Feature::Point(hydrate(&point, store)));
    }

    output.retain(|feature| match feature {
        Feature::Point(point) => !store.is_hidden(&point.room_id),
        Feature::Cluster(_) => true,
    });
    output
}

/// Pending rooms the server response now accounts for, either as a point
/// or inside a cluster's expansion bounds.
///
/// Rooms the response does not mention stay pending: an empty or partial
/// response usually means the index has not caught up yet.
pub fn confirmed_pending(features: &[Feature], store: &LocalStore) -> Vec<RoomId> {
    sorted_pending(store)
        .into_iter()
        .filter(|id| {
            let position = store.room(id).and_then(Room::coordinates);
            features.iter().any(|feature| match feature {
                Feature::Point(point) => &point.room_id == *id,
                Feature::Cluster(cluster) => position.is_some_and(|p| {
                    point_in_bounds(p.latitude, p.longitude, &cluster.expansion_bounds)
                }),
            })
        })
        .cloned()
        .collect()
}

/// The flat room list for list views: fetched rooms in server order, with
/// pending rooms inside `bounds` in front and hidden rooms removed.
pub fn reconcile_list(room_ids: &[RoomId], bounds: Option<&Bounds>, store: &LocalStore) -> Vec<Room> {
    let listed: HashSet<&RoomId> = room_ids.iter().collect();
    let pending = sorted_pending(store).into_iter().filter(|id| {
        !listed.contains(id)
            && store
                .room(id)
                .and_then(Room::coordinates)
                .is_some_and(|p| bounds.is_none_or(|b| point_in_bounds(p.latitude, p.longitude, b)))
    });

    let mut seen = HashSet::new();
    pending
        .chain(room_ids.iter())
        .filter(|id| !store.is_hidden(id) && seen.insert(*id))
        .filter_map(|id| {
            let mut room = store.room(id)?.clone();
            room.is_creator = Some(store.is_created(id));
            room.has_joined = Some(store.is_joined(id));
            Some(room)
        })
        .collect()
}
