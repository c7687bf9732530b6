//! Geometry support: EWKB codec, exact spatial predicates, Morton curve.
//!
//! Geometries enter and leave the database as EWKB bytes. Internally they
//! are decoded once per recheck; the Z-order index only ever sees the
//! derived sidecar (MBR + centroid).

pub mod algorithms;
pub mod ewkb;
pub mod morton;

pub use algorithms::{haversine_m, SpatialPredicate};
pub use ewkb::{Coord, Geometry};

use serde::{Deserialize, Serialize};

/// Minimum bounding rectangle, planar coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Mbr {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Whether this MBR crosses the antimeridian (minx > maxx).
    ///
    /// The index is planar; such queries are rejected upstream with
    /// `InvalidInput` rather than silently wrapped.
    pub fn crosses_antimeridian(&self) -> bool {
        self.minx > self.maxx
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        self.minx <= other.maxx
            && self.maxx >= other.minx
            && self.miny <= other.maxy
            && self.maxy >= other.miny
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.minx && x <= self.maxx && y >= self.miny && y <= self.maxy
    }

    pub fn area(&self) -> f64 {
        (self.maxx - self.minx).max(0.0) * (self.maxy - self.miny).max(0.0)
    }

    /// Grow by `margin` on every side (used for ST_DWithin pre-filter).
    pub fn expanded(&self, margin: f64) -> Mbr {
        Mbr::new(
            self.minx - margin,
            self.miny - margin,
            self.maxx + margin,
            self.maxy + margin,
        )
    }

    /// Union of two MBRs.
    pub fn union(&self, other: &Mbr) -> Mbr {
        Mbr::new(
            self.minx.min(other.minx),
            self.miny.min(other.miny),
            self.maxx.max(other.maxx),
            self.maxy.max(other.maxy),
        )
    }
}

/// Derived sidecar persisted with the entity whenever `geometry` changes.
///
/// Carries everything the spatial index and the planner's selectivity model
/// need without re-parsing EWKB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoSidecar {
    pub mbr: Mbr,
    /// Centroid (x, y); the Morton cell of the entity is derived from it.
    pub centroid: (f64, f64),
    pub z_min: Option<f64>,
    pub z_max: Option<f64>,
}

impl GeoSidecar {
    /// Compute the sidecar for a geometry.
    pub fn from_geometry(geom: &Geometry) -> Self {
        let mbr = geom.mbr();
        let centroid = geom.centroid();
        let (z_min, z_max) = geom.z_range();
        Self { mbr, centroid, z_min, z_max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbr_intersects() {
        let a = Mbr::new(0.0, 0.0, 10.0, 10.0);
        let b = Mbr::new(5.0, 5.0, 15.0, 15.0);
        let c = Mbr::new(11.0, 11.0, 12.0, 12.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_antimeridian_detection() {
        assert!(Mbr::new(170.0, -10.0, -170.0, 10.0).crosses_antimeridian());
        assert!(!Mbr::new(-170.0, -10.0, 170.0, 10.0).crosses_antimeridian());
    }

    #[test]
    fn test_sidecar_from_point() {
        let geom = Geometry::Point(Coord::new(13.4, 52.5));
        let sc = GeoSidecar::from_geometry(&geom);
        assert_eq!(sc.mbr, Mbr::new(13.4, 52.5, 13.4, 52.5));
        assert_eq!(sc.centroid, (13.4, 52.5));
        assert!(sc.z_min.is_none());
    }
}
