//! Exact spatial predicate evaluation.
//!
//! The Morton index over-approximates; every candidate is rechecked here
//! against the real EWKB geometry. Distances are planar (coordinate units)
//! unless the column is declared geodetic, in which case Haversine meters
//! are used.

use crate::geo::ewkb::{Coord, Geometry};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Spatial predicates supported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpatialPredicate {
    /// ST_Intersects(candidate, query)
    Intersects(Geometry),
    /// ST_Within(candidate, query)
    Within(Geometry),
    /// ST_Contains(candidate, query)
    Contains(Geometry),
    /// ST_DWithin(candidate, query, distance)
    DWithin { geometry: Geometry, distance: f64, geodetic: bool },
}

impl SpatialPredicate {
    /// The query geometry's MBR, expanded for DWithin.
    pub fn query_mbr(&self) -> crate::geo::Mbr {
        match self {
            Self::Intersects(g) | Self::Within(g) | Self::Contains(g) => g.mbr(),
            Self::DWithin { geometry, distance, geodetic } => {
                // Geodetic margin converted to degrees at the widest case.
                let margin = if *geodetic {
                    distance / 111_320.0
                } else {
                    *distance
                };
                geometry.mbr().expanded(margin)
            }
        }
    }

    /// Evaluate exactly against a candidate geometry.
    pub fn matches(&self, candidate: &Geometry) -> bool {
        match self {
            Self::Intersects(q) => intersects(candidate, q),
            Self::Within(q) => within(candidate, q),
            Self::Contains(q) => within(q, candidate),
            Self::DWithin { geometry, distance, geodetic } => {
                if *geodetic {
                    geodetic_min_distance_m(candidate, geometry) <= *distance
                } else {
                    min_distance(candidate, geometry) <= *distance
                }
            }
        }
    }
}

/// Haversine great-circle distance in meters between two lon/lat points.
pub fn haversine_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// ST_Intersects: any shared point.
pub fn intersects(a: &Geometry, b: &Geometry) -> bool {
    if !a.mbr().intersects(&b.mbr()) {
        return false;
    }
    for_parts(a, &mut |pa| for_parts_any(b, |pb| parts_intersect(pa, pb)))
}

/// ST_Within: every point of `a` inside `b`.
pub fn within(a: &Geometry, b: &Geometry) -> bool {
    let parts_a = collect_parts(a);
    let parts_b = collect_parts(b);
    parts_a
        .iter()
        .all(|pa| parts_b.iter().any(|pb| part_within(pa, pb)))
}

/// Minimum planar distance between two geometries. Zero if they intersect.
pub fn min_distance(a: &Geometry, b: &Geometry) -> f64 {
    if intersects(a, b) {
        return 0.0;
    }
    let parts_a = collect_parts(a);
    let parts_b = collect_parts(b);
    let mut best = f64::INFINITY;
    for pa in &parts_a {
        for pb in &parts_b {
            best = best.min(part_distance(pa, pb));
        }
    }
    best
}

/// Minimum Haversine distance in meters, approximated over part vertices
/// and densified edges.
pub fn geodetic_min_distance_m(a: &Geometry, b: &Geometry) -> f64 {
    if intersects(a, b) {
        return 0.0;
    }
    let va = collect_vertices(a);
    let vb = collect_vertices(b);
    let mut best = f64::INFINITY;
    for ca in &va {
        for cb in &vb {
            best = best.min(haversine_m(ca.x, ca.y, cb.x, cb.y));
        }
    }
    best
}

/// A simple part: a point, an open polyline, or a single polygon
/// (exterior + holes). Multi-geometries decompose into these.
enum Part<'a> {
    Point(&'a Coord),
    Line(&'a [Coord]),
    Polygon(&'a [Vec<Coord>]),
}

fn collect_parts(g: &Geometry) -> Vec<Part<'_>> {
    match g {
        Geometry::Point(c) => vec![Part::Point(c)],
        Geometry::LineString(cs) => vec![Part::Line(cs)],
        Geometry::Polygon(rings) => vec![Part::Polygon(rings)],
        Geometry::MultiPoint(cs) => cs.iter().map(Part::Point).collect(),
        Geometry::MultiLineString(lines) => lines.iter().map(|l| Part::Line(l)).collect(),
        Geometry::MultiPolygon(polys) => polys.iter().map(|p| Part::Polygon(p)).collect(),
    }
}

fn collect_vertices(g: &Geometry) -> Vec<Coord> {
    let mut out = Vec::new();
    match g {
        Geometry::Point(c) => out.push(*c),
        Geometry::LineString(cs) | Geometry::MultiPoint(cs) => out.extend_from_slice(cs),
        Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
            rings.iter().for_each(|r| out.extend_from_slice(r))
        }
        Geometry::MultiPolygon(polys) => polys
            .iter()
            .flatten()
            .for_each(|r| out.extend_from_slice(r)),
    }
    out
}

fn for_parts(g: &Geometry, f: &mut dyn FnMut(&Part<'_>) -> bool) -> bool {
    collect_parts(g).iter().any(|p| f(p))
}

fn for_parts_any(g: &Geometry, f: impl Fn(&Part<'_>) -> bool) -> bool {
    collect_parts(g).iter().any(|p| f(p))
}

fn parts_intersect(a: &Part<'_>, b: &Part<'_>) -> bool {
    match (a, b) {
        (Part::Point(p), Part::Point(q)) => p.x == q.x && p.y == q.y,
        (Part::Point(p), Part::Line(l)) | (Part::Line(l), Part::Point(p)) => {
            point_on_polyline(p, l, 1e-12)
        }
        (Part::Point(p), Part::Polygon(rings)) | (Part::Polygon(rings), Part::Point(p)) => {
            point_in_polygon(p, rings)
        }
        (Part::Line(l1), Part::Line(l2)) => polylines_intersect(l1, l2),
        (Part::Line(l), Part::Polygon(rings)) | (Part::Polygon(rings), Part::Line(l)) => {
            line_polygon_intersect(l, rings)
        }
        (Part::Polygon(r1), Part::Polygon(r2)) => polygons_intersect(r1, r2),
    }
}

fn part_within(a: &Part<'_>, b: &Part<'_>) -> bool {
    match (a, b) {
        (Part::Point(p), Part::Point(q)) => p.x == q.x && p.y == q.y,
        (Part::Point(p), Part::Line(l)) => point_on_polyline(p, l, 1e-12),
        (Part::Point(p), Part::Polygon(rings)) => point_in_polygon(p, rings),
        (Part::Line(l), Part::Polygon(rings)) => {
            l.iter().all(|p| point_in_polygon(p, rings))
                && !polyline_crosses_rings(l, rings)
        }
        (Part::Polygon(inner), Part::Polygon(outer)) => {
            inner
                .first()
                .map(|ext| ext.iter().all(|p| point_in_polygon(p, outer)))
                .unwrap_or(false)
                && inner
                    .first()
                    .map(|ext| !polyline_crosses_rings(ext, outer))
                    .unwrap_or(false)
        }
        // A line or polygon is never within a point/line of lower dimension.
        _ => false,
    }
}

fn part_distance(a: &Part<'_>, b: &Part<'_>) -> f64 {
    match (a, b) {
        (Part::Point(p), Part::Point(q)) => dist(p, q),
        (Part::Point(p), Part::Line(l)) | (Part::Line(l), Part::Point(p)) => {
            point_polyline_distance(p, l)
        }
        (Part::Point(p), Part::Polygon(rings)) | (Part::Polygon(rings), Part::Point(p)) => {
            if point_in_polygon(p, rings) {
                0.0
            } else {
                rings
                    .iter()
                    .map(|r| point_polyline_distance(p, r))
                    .fold(f64::INFINITY, f64::min)
            }
        }
        (Part::Line(l1), Part::Line(l2)) => polyline_distance(l1, l2),
        (Part::Line(l), Part::Polygon(rings)) | (Part::Polygon(rings), Part::Line(l)) => {
            if l.iter().any(|p| point_in_polygon(p, rings)) {
                0.0
            } else {
                rings
                    .iter()
                    .map(|r| polyline_distance(l, r))
                    .fold(f64::INFINITY, f64::min)
            }
        }
        (Part::Polygon(r1), Part::Polygon(r2)) => {
            let d = r1
                .iter()
                .flat_map(|ra| r2.iter().map(move |rb| polyline_distance(ra, rb)))
                .fold(f64::INFINITY, f64::min);
            d
        }
    }
}

fn dist(a: &Coord, b: &Coord) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

fn point_segment_distance(p: &Coord, a: &Coord, b: &Coord) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return dist(p, a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    let proj = Coord::new(a.x + t * dx, a.y + t * dy);
    dist(p, &proj)
}

fn point_polyline_distance(p: &Coord, line: &[Coord]) -> f64 {
    line.windows(2)
        .map(|w| point_segment_distance(p, &w[0], &w[1]))
        .fold(if line.len() == 1 { dist(p, &line[0]) } else { f64::INFINITY }, f64::min)
}

fn polyline_distance(a: &[Coord], b: &[Coord]) -> f64 {
    let mut best = f64::INFINITY;
    for p in a {
        best = best.min(point_polyline_distance(p, b));
    }
    for p in b {
        best = best.min(point_polyline_distance(p, a));
    }
    best
}

fn point_on_polyline(p: &Coord, line: &[Coord], eps: f64) -> bool {
    point_polyline_distance(p, line) <= eps
}

fn orient(a: &Coord, b: &Coord, c: &Coord) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: &Coord, b: &Coord, p: &Coord) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(a1: &Coord, a2: &Coord, b1: &Coord, b2: &Coord) -> bool {
    let d1 = orient(b1, b2, a1);
    let d2 = orient(b1, b2, a2);
    let d3 = orient(a1, a2, b1);
    let d4 = orient(a1, a2, b2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(b1, b2, a1))
        || (d2 == 0.0 && on_segment(b1, b2, a2))
        || (d3 == 0.0 && on_segment(a1, a2, b1))
        || (d4 == 0.0 && on_segment(a1, a2, b2))
}

fn polylines_intersect(a: &[Coord], b: &[Coord]) -> bool {
    for s1 in a.windows(2) {
        for s2 in b.windows(2) {
            if segments_intersect(&s1[0], &s1[1], &s2[0], &s2[1]) {
                return true;
            }
        }
    }
    false
}

/// Ray-cast point-in-polygon honoring holes. Boundary counts as inside.
fn point_in_polygon(p: &Coord, rings: &[Vec<Coord>]) -> bool {
    let Some(exterior) = rings.first() else {
        return false;
    };
    if point_on_polyline(p, exterior, 1e-12) {
        return true;
    }
    if !ring_contains(p, exterior) {
        return false;
    }
    for hole in &rings[1..] {
        if ring_contains(p, hole) && !point_on_polyline(p, hole, 1e-12) {
            return false;
        }
    }
    true
}

fn ring_contains(p: &Coord, ring: &[Coord]) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (&ring[i], &ring[j]);
        if (pi.y > p.y) != (pj.y > p.y) {
            let x_cross = (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn polyline_crosses_rings(line: &[Coord], rings: &[Vec<Coord>]) -> bool {
    rings.iter().any(|r| {
        line.windows(2).any(|s| {
            r.windows(2).any(|t| {
                // Proper crossings only; shared boundary points are fine.
                let d1 = orient(&t[0], &t[1], &s[0]);
                let d2 = orient(&t[0], &t[1], &s[1]);
                let d3 = orient(&s[0], &s[1], &t[0]);
                let d4 = orient(&s[0], &s[1], &t[1]);
                ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
                    && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
            })
        })
    })
}

fn line_polygon_intersect(line: &[Coord], rings: &[Vec<Coord>]) -> bool {
    line.iter().any(|p| point_in_polygon(p, rings))
        || rings.iter().any(|r| polylines_intersect(line, r))
}

fn polygons_intersect(a: &[Vec<Coord>], b: &[Vec<Coord>]) -> bool {
    let (Some(ea), Some(eb)) = (a.first(), b.first()) else {
        return false;
    };
    // Edge crossing, or either contains a vertex of the other.
    polylines_intersect(ea, eb)
        || ea.iter().any(|p| point_in_polygon(p, b))
        || eb.iter().any(|p| point_in_polygon(p, a))
}
