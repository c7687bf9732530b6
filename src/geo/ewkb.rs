//! EWKB geometry codec.
//!
//! Recognizes Point, LineString, Polygon and their Multi- variants, with
//! optional Z and optional SRID. Serialization is little-endian;
//! `parse(serialize(g)) == g` structurally.

use crate::geo::Mbr;
use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};

const TYPE_POINT: u32 = 1;
const TYPE_LINESTRING: u32 = 2;
const TYPE_POLYGON: u32 = 3;
const TYPE_MULTIPOINT: u32 = 4;
const TYPE_MULTILINESTRING: u32 = 5;
const TYPE_MULTIPOLYGON: u32 = 6;

const FLAG_Z: u32 = 0x8000_0000;
const FLAG_SRID: u32 = 0x2000_0000;
// The WKB M flag; carried coordinates are not supported.
const FLAG_M: u32 = 0x4000_0000;

/// A single coordinate, optionally 3D.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn new_z(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Decoded geometry.
///
/// Polygons are ring lists; the first ring is the exterior, the rest are
/// holes. Rings are closed (first == last coordinate) as in EWKB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
}

impl Geometry {
    /// Parse EWKB bytes.
    ///
    /// # Errors
    ///
    /// Returns `ThemisError::MalformedBlob` on truncation, unknown geometry
    /// type, or an M-coordinate flag.
    pub fn parse_ewkb(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let geom = parse_geometry(&mut cur)?;
        Ok(geom)
    }

    /// Serialize to EWKB (little-endian, no SRID).
    pub fn to_ewkb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_geometry(&mut out, self);
        out
    }

    /// Whether any coordinate carries Z.
    pub fn has_z(&self) -> bool {
        self.coords_any(|c| c.z.is_some())
    }

    /// Minimum bounding rectangle over all coordinates.
    pub fn mbr(&self) -> Mbr {
        let mut minx = f64::INFINITY;
        let mut miny = f64::INFINITY;
        let mut maxx = f64::NEG_INFINITY;
        let mut maxy = f64::NEG_INFINITY;
        self.for_each_coord(&mut |c: &Coord| {
            minx = minx.min(c.x);
            miny = miny.min(c.y);
            maxx = maxx.max(c.x);
            maxy = maxy.max(c.y);
        });
        Mbr::new(minx, miny, maxx, maxy)
    }

    /// Arithmetic-mean centroid over all coordinates.
    ///
    /// Good enough for index cell placement; not an area-weighted centroid.
    pub fn centroid(&self) -> (f64, f64) {
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut n = 0usize;
        self.for_each_coord(&mut |c: &Coord| {
            sx += c.x;
            sy += c.y;
            n += 1;
        });
        if n == 0 {
            (0.0, 0.0)
        } else {
            (sx / n as f64, sy / n as f64)
        }
    }

    /// (z_min, z_max) over all coordinates carrying Z.
    pub fn z_range(&self) -> (Option<f64>, Option<f64>) {
        let mut z_min: Option<f64> = None;
        let mut z_max: Option<f64> = None;
        self.for_each_coord(&mut |c: &Coord| {
            if let Some(z) = c.z {
                z_min = Some(z_min.map_or(z, |m| m.min(z)));
                z_max = Some(z_max.map_or(z, |m| m.max(z)));
            }
        });
        (z_min, z_max)
    }

    fn for_each_coord<F: FnMut(&Coord)>(&self, f: &mut F) {
        match self {
            Self::Point(c) => f(c),
            Self::LineString(cs) | Self::MultiPoint(cs) => cs.iter().for_each(|c| f(c)),
            Self::Polygon(rings) | Self::MultiLineString(rings) => {
                rings.iter().flatten().for_each(|c| f(c))
            }
            Self::MultiPolygon(polys) => {
                polys.iter().flatten().flatten().for_each(|c| f(c))
            }
        }
    }

    fn coords_any<F: Fn(&Coord) -> bool>(&self, pred: F) -> bool {
        let mut hit = false;
        self.for_each_coord(&mut |c: &Coord| {
            if pred(c) {
                hit = true;
            }
        });
        hit
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ThemisError::malformed(format!(
                "EWKB truncated at offset {} (need {n} bytes)",
                self.pos
            )));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self, le: bool) -> Result<u32> {
        let b: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if le { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    }

    fn f64(&mut self, le: bool) -> Result<f64> {
        let b: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(if le { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) })
    }
}

fn parse_geometry(cur: &mut Cursor<'_>) -> Result<Geometry> {
    let le = match cur.u8()? {
        0 => false,
        1 => true,
        other => return Err(ThemisError::malformed(format!("bad byte order {other}"))),
    };

    let raw_type = cur.u32(le)?;
    if raw_type & FLAG_M != 0 {
        return Err(ThemisError::malformed("M coordinates are not supported"));
    }
    let has_z = raw_type & FLAG_Z != 0;
    if raw_type & FLAG_SRID != 0 {
        // SRID is read and discarded; columns declare geodesy, not values.
        let _srid = cur.u32(le)?;
    }
    let geom_type = raw_type & 0x0000_FFFF;

    match geom_type {
        TYPE_POINT => Ok(Geometry::Point(parse_coord(cur, le, has_z)?)),
        TYPE_LINESTRING => Ok(Geometry::LineString(parse_coords(cur, le, has_z)?)),
        TYPE_POLYGON => Ok(Geometry::Polygon(parse_rings(cur, le, has_z)?)),
        TYPE_MULTIPOINT => {
            let n = cur.u32(le)? as usize;
            let mut coords = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                match parse_geometry(cur)? {
                    Geometry::Point(c) => coords.push(c),
                    _ => return Err(ThemisError::malformed("MultiPoint member is not a Point")),
                }
            }
            Ok(Geometry::MultiPoint(coords))
        }
        TYPE_MULTILINESTRING => {
            let n = cur.u32(le)? as usize;
            let mut lines = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                match parse_geometry(cur)? {
                    Geometry::LineString(cs) => lines.push(cs),
                    _ => {
                        return Err(ThemisError::malformed(
                            "MultiLineString member is not a LineString",
                        ))
                    }
                }
            }
            Ok(Geometry::MultiLineString(lines))
        }
        TYPE_MULTIPOLYGON => {
            let n = cur.u32(le)? as usize;
            let mut polys = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                match parse_geometry(cur)? {
                    Geometry::Polygon(rings) => polys.push(rings),
                    _ => return Err(ThemisError::malformed("MultiPolygon member is not a Polygon")),
                }
            }
            Ok(Geometry::MultiPolygon(polys))
        }
        other => Err(ThemisError::malformed(format!("unknown geometry type {other}"))),
    }
}

fn parse_coord(cur: &mut Cursor<'_>, le: bool, has_z: bool) -> Result<Coord> {
    let x = cur.f64(le)?;
    let y = cur.f64(le)?;
    let z = if has_z { Some(cur.f64(le)?) } else { None };
    Ok(Coord { x, y, z })
}

fn parse_coords(cur: &mut Cursor<'_>, le: bool, has_z: bool) -> Result<Vec<Coord>> {
    let n = cur.u32(le)? as usize;
    let mut coords = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        coords.push(parse_coord(cur, le, has_z)?);
    }
    Ok(coords)
}

fn parse_rings(cur: &mut Cursor<'_>, le: bool, has_z: bool) -> Result<Vec<Vec<Coord>>> {
    let n = cur.u32(le)? as usize;
    let mut rings = Vec::with_capacity(n.min(64));
    for _ in 0..n {
        rings.push(parse_coords(cur, le, has_z)?);
    }
    Ok(rings)
}

fn write_geometry(out: &mut Vec<u8>, geom: &Geometry) {
    out.push(1); // little-endian
    let has_z = geom.has_z();
    let tag = |t: u32| if has_z { t | FLAG_Z } else { t };
    match geom {
        Geometry::Point(c) => {
            out.extend_from_slice(&tag(TYPE_POINT).to_le_bytes());
            write_coord(out, c, has_z);
        }
        Geometry::LineString(cs) => {
            out.extend_from_slice(&tag(TYPE_LINESTRING).to_le_bytes());
            write_coords(out, cs, has_z);
        }
        Geometry::Polygon(rings) => {
            out.extend_from_slice(&tag(TYPE_POLYGON).to_le_bytes());
            out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
            for ring in rings {
                write_coords(out, ring, has_z);
            }
        }
        Geometry::MultiPoint(cs) => {
            out.extend_from_slice(&tag(TYPE_MULTIPOINT).to_le_bytes());
            out.extend_from_slice(&(cs.len() as u32).to_le_bytes());
            for c in cs {
                write_geometry(out, &Geometry::Point(*c));
            }
        }
        Geometry::MultiLineString(lines) => {
            out.extend_from_slice(&tag(TYPE_MULTILINESTRING).to_le_bytes());
            out.extend_from_slice(&(lines.len() as u32).to_le_bytes());
            for line in lines {
                write_geometry(out, &Geometry::LineString(line.clone()));
            }
        }
        Geometry::MultiPolygon(polys) => {
            out.extend_from_slice(&tag(TYPE_MULTIPOLYGON).to_le_bytes());
            out.extend_from_slice(&(polys.len() as u32).to_le_bytes());
            for rings in polys {
                write_geometry(out, &Geometry::Polygon(rings.clone()));
            }
        }
    }
}

fn write_coord(out: &mut Vec<u8>, c: &Coord, has_z: bool) {
    out.extend_from_slice(&c.x.to_le_bytes());
    out.extend_from_slice(&c.y.to_le_bytes());
    if has_z {
        out.extend_from_slice(&c.z.unwrap_or(0.0).to_le_bytes());
    }
}

fn write_coords(out: &mut Vec<u8>, cs: &[Coord], has_z: bool) {
    out.extend_from_slice(&(cs.len() as u32).to_le_bytes());
    for c in cs {
        write_coord(out, c, has_z);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(cx: f64, cy: f64, half: f64) -> Geometry {
        Geometry::Polygon(vec![vec![
            Coord::new(cx - half, cy - half),
            Coord::new(cx + half, cy - half),
            Coord::new(cx + half, cy + half),
            Coord::new(cx - half, cy + half),
            Coord::new(cx - half, cy - half),
        ]])
    }

    #[test]
    fn test_point_roundtrip() {
        let g = Geometry::Point(Coord::new(13.4, 52.5));
        assert_eq!(Geometry::parse_ewkb(&g.to_ewkb()).unwrap(), g);
    }

    #[test]
    fn test_point_z_roundtrip() {
        let g = Geometry::Point(Coord::new_z(13.4, 52.5, 34.0));
        let parsed = Geometry::parse_ewkb(&g.to_ewkb()).unwrap();
        assert_eq!(parsed, g);
        assert!(parsed.has_z());
    }

    #[test]
    fn test_linestring_polygon_roundtrip() {
        let ls = Geometry::LineString(vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 1.0),
            Coord::new(2.0, 0.5),
        ]);
        assert_eq!(Geometry::parse_ewkb(&ls.to_ewkb()).unwrap(), ls);

        let poly = square(0.0, 0.0, 2.0);
        assert_eq!(Geometry::parse_ewkb(&poly.to_ewkb()).unwrap(), poly);
    }

    #[test]
    fn test_multi_roundtrip() {
        let mp = Geometry::MultiPoint(vec![Coord::new(1.0, 2.0), Coord::new(3.0, 4.0)]);
        assert_eq!(Geometry::parse_ewkb(&mp.to_ewkb()).unwrap(), mp);

        let mpoly = Geometry::MultiPolygon(vec![
            match square(0.0, 0.0, 1.0) {
                Geometry::Polygon(r) => r,
                _ => unreachable!(),
            },
            match square(10.0, 10.0, 1.0) {
                Geometry::Polygon(r) => r,
                _ => unreachable!(),
            },
        ]);
        assert_eq!(Geometry::parse_ewkb(&mpoly.to_ewkb()).unwrap(), mpoly);
    }

    #[test]
    fn test_big_endian_parse() {
        // Hand-built big-endian Point(1.0, 2.0)
        let mut b = vec![0u8];
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&1.0f64.to_be_bytes());
        b.extend_from_slice(&2.0f64.to_be_bytes());
        assert_eq!(
            Geometry::parse_ewkb(&b).unwrap(),
            Geometry::Point(Coord::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_srid_flag_is_consumed() {
        let mut b = vec![1u8];
        b.extend_from_slice(&(TYPE_POINT | FLAG_SRID).to_le_bytes());
        b.extend_from_slice(&4326u32.to_le_bytes());
        b.extend_from_slice(&13.4f64.to_le_bytes());
        b.extend_from_slice(&52.5f64.to_le_bytes());
        assert_eq!(
            Geometry::parse_ewkb(&b).unwrap(),
            Geometry::Point(Coord::new(13.4, 52.5))
        );
    }

    #[test]
    fn test_truncated_is_malformed() {
        let g = Geometry::Point(Coord::new(13.4, 52.5));
        let bytes = g.to_ewkb();
        let err = Geometry::parse_ewkb(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ThemisError::MalformedBlob(_)));
    }

    #[test]
    fn test_mbr_and_centroid() {
        let poly = square(5.0, 5.0, 2.0);
        let mbr = poly.mbr();
        assert_eq!((mbr.minx, mbr.miny, mbr.maxx, mbr.maxy), (3.0, 3.0, 7.0, 7.0));
        let (cx, cy) = poly.centroid();
        assert!((cx - 4.6).abs() < 0.5 && (cy - 4.6).abs() < 0.5);
    }
}
