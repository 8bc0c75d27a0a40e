use roomscope_shared::{Bounds, LatLng};

/// Latitude limit that keeps Web Mercator projections finite
pub const MAX_LATITUDE: f64 = 85.0;
pub const MAX_LONGITUDE: f64 = 180.0;

/// Fraction of the viewport span added on each side before a clustering fetch
pub const DEFAULT_EXPAND_FACTOR: f64 = 0.5;

fn clamped(west: f64, south: f64, east: f64, north: f64) -> Bounds {
    Bounds::new(
        west.max(-MAX_LONGITUDE),
        south.max(-MAX_LATITUDE),
        east.min(MAX_LONGITUDE),
        north.min(MAX_LATITUDE),
    )
}

/// Grow `bounds` on every side by `factor` times its span on that axis.
pub fn expand_bounds(bounds: &Bounds, factor: f64) -> Bounds {
    let lng_pad = bounds.lng_span() * factor;
    let lat_pad = bounds.lat_span() * factor;
    clamped(
        bounds.west - lng_pad,
        bounds.south - lat_pad,
        bounds.east + lng_pad,
        bounds.north + lat_pad,
    )
}

/// Approximate the rectangle a square viewport shows at `zoom` around `center`.
///
/// `padding` scales both spans; 1.0 means no padding.
pub fn bounds_from_center_zoom(center: LatLng, zoom: f64, padding: f64) -> Bounds {
    let lng_span = 360.0 / 2f64.powf(zoom) * padding;
    let lat_span = lng_span * center.latitude.to_radians().cos().abs();
    clamped(
        center.longitude - lng_span / 2.0,
        center.latitude - lat_span / 2.0,
        center.longitude + lng_span / 2.0,
        center.latitude + lat_span / 2.0,
    )
}

/// Half-open containment: west and south edges are inside, east and north are not.
pub fn point_in_bounds(lat: f64, lng: f64, bounds: &Bounds) -> bool {
    lng >= bounds.west && lng < bounds.east && lat >= bounds.south && lat < bounds.north
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn expand_grows_each_side_by_span_fraction() {
        let bounds = Bounds::new(10.0, 40.0, 12.0, 41.0);
        let expanded = expand_bounds(&bounds, 0.5);
        assert!(approx(expanded.west, 9.0));
        assert!(approx(expanded.east, 13.0));
        assert!(approx(expanded.south, 39.5));
        assert!(approx(expanded.north, 41.5));
    }

    #[test]
    fn expand_with_zero_factor_is_identity() {
        let bounds = Bounds::new(10.0, 40.0, 12.0, 41.0);
        assert_eq!(expand_bounds(&bounds, 0.0), bounds);
    }

    #[test]
    fn expand_clamps_to_mercator_limits() {
        let bounds = Bounds::new(-170.0, -80.0, 170.0, 80.0);
        let expanded = expand_bounds(&bounds, 0.5);
        assert_eq!(expanded, Bounds::new(-180.0, -85.0, 180.0, 85.0));
    }

    #[test]
    fn bounds_from_zoom_zero_covers_world() {
        let bounds = bounds_from_center_zoom(LatLng::new(0.0, 0.0), 0.0, 1.0);
        assert!(approx(bounds.west, -180.0));
        assert!(approx(bounds.east, 180.0));
        assert_eq!(bounds.south, -85.0);
        assert_eq!(bounds.north, 85.0);
    }

    #[test]
    fn bounds_from_zoom_halves_span_per_level() {
        let center = LatLng::new(0.0, 20.0);
        let z10 = bounds_from_center_zoom(center, 10.0, 1.0);
        let z11 = bounds_from_center_zoom(center, 11.0, 1.0);
        assert!(approx(z10.lng_span(), 360.0 / 1024.0));
        assert!(approx(z10.lng_span(), z11.lng_span() * 2.0));
        assert!(approx(z10.center().longitude, 20.0));
    }

    #[test]
    fn bounds_from_zoom_applies_padding_and_latitude() {
        let center = LatLng::new(60.0, 10.0);
        let plain = bounds_from_center_zoom(center, 12.0, 1.0);
        let padded = bounds_from_center_zoom(center, 12.0, 2.0);
        assert!(approx(padded.lng_span(), plain.lng_span() * 2.0));
        // cos(60°) = 0.5
        assert!(approx(plain.lat_span(), plain.lng_span() * 0.5));
    }

    #[test]
    fn point_in_bounds_is_half_open() {
        let bounds = Bounds::new(0.0, 0.0, 10.0, 10.0);
        assert!(point_in_bounds(5.0, 5.0, &bounds));
        assert!(point_in_bounds(0.0, 0.0, &bounds));
        assert!(!point_in_bounds(10.0, 5.0, &bounds));
        assert!(!point_in_bounds(5.0, 10.0, &bounds));
        assert!(!point_in_bounds(-0.1, 5.0, &bounds));
    }
}
