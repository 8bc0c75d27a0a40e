use roomscope_shared::{Bounds, ClusterFeature, Feature, LatLng, PointFeature, Room};
use std::collections::BTreeMap;

/// Pushes the members' east and north extremes inside the half-open
/// expansion bounds.
const EDGE_NUDGE: f64 = 1e-7;

type Cell = (i64, i64);

/// Edge length in degrees of one grid cell at `zoom`
pub fn cell_size(zoom: u32, cells_per_tile: u32) -> f64 {
    360.0 / 2f64.powi(zoom.min(30) as i32) / f64::from(cells_per_tile.max(1))
}

fn cell_of(position: LatLng, size: f64) -> Cell {
    (
        ((position.longitude + 180.0) / size).floor() as i64,
        ((position.latitude + 90.0) / size).floor() as i64,
    )
}

fn cluster_id(zoom: u32, (x, y): Cell) -> u64 {
    (u64::from(zoom) << 56) | ((x as u64 & 0x0FFF_FFFF) << 28) | (y as u64 & 0x0FFF_FFFF)
}

/// Group rooms into grid cells. A cell holding one room becomes a point,
/// anything more a cluster. Rooms without coordinates are skipped.
pub fn cluster_rooms(rooms: impl IntoIterator<Item = Room>, zoom: u32, cells_per_tile: u32) -> Vec<Feature> {
    let size = cell_size(zoom, cells_per_tile);
    let mut cells: BTreeMap<Cell, Vec<(LatLng, Room)>> = BTreeMap::new();
    for room in rooms {
        let Some(position) = room.coordinates() else {
            continue;
        };
        cells
            .entry(cell_of(position, size))
            .or_default()
            .push((position, room));
    }

    cells
        .into_iter()
        .filter_map(|(cell, mut members)| {
            if members.len() == 1 {
                let (_, room) = members.pop()?;
                return PointFeature::from_room(&room).map(Feature::Point);
            }
            Some(Feature::Cluster(to_cluster(cluster_id(zoom, cell), &members)))
        })
        .collect()
}

fn to_cluster(cluster_id: u64, members: &[(LatLng, Room)]) -> ClusterFeature {
    let count = members.len() as f64;
    let (lat_sum, lng_sum) = members
        .iter()
        .fold((0.0, 0.0), |(lat, lng), (p, _)| (lat + p.latitude, lng + p.longitude));
    let extent = members.iter().fold(
        Bounds::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        |b, (p, _)| {
            Bounds::new(
                b.west.min(p.longitude),
                b.south.min(p.latitude),
                b.east.max(p.longitude),
                b.north.max(p.latitude),
            )
        },
    );

    ClusterFeature {
        cluster_id,
        latitude: lat_sum / count,
        longitude: lng_sum / count,
        point_count: members.len() as u32,
        expansion_bounds: Bounds::new(
            extent.west,
            extent.south,
            extent.east + EDGE_NUDGE,
            extent.north + EDGE_NUDGE,
        ),
    }
}
