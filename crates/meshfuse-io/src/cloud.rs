//! Per-keyframe point cloud loading.
//!
//! The upstream mapper writes one PCD (v0.7) file per keyframe, named after
//! the keyframe. [`PcdDirectory`] reads them; any other storage can plug in
//! by implementing [`CloudSource`].
//!
//! Supported PCD variants: `DATA ascii` and `DATA binary` with `x y z`
//! fields plus an optional `rgb`/`rgba` field, either float-packed (the PCL
//! convention) or stored as a 4-byte integer. Unknown fields are skipped.
//! Points with a non-finite coordinate (organized-cloud padding) are dropped.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use meshfuse_types::{FusionError, KeyframePose, RawPoint, Rgb};
use tracing::debug;

/// Color assigned when a cloud carries no color field.
const UNCOLORED: Rgb = Rgb {
    r: 255,
    g: 255,
    b: 255,
};

/// Anything that can produce the local-frame cloud of a keyframe.
pub trait CloudSource {
    /// Load the cloud of `pose`, expressed in the keyframe's own frame.
    ///
    /// A missing cloud must be reported as an error: the caller aborts the
    /// run rather than build a partial model.
    fn load(&self, pose: &KeyframePose) -> Result<Vec<RawPoint>, FusionError>;
}

/// In-memory clouds keyed by keyframe name.
impl CloudSource for HashMap<String, Vec<RawPoint>> {
    fn load(&self, pose: &KeyframePose) -> Result<Vec<RawPoint>, FusionError> {
        self.get(&pose.name).cloned().ok_or_else(|| {
            FusionError::io(
                &pose.name,
                std::io::Error::new(ErrorKind::NotFound, "no cloud for keyframe"),
            )
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PcdDirectory
// ────────────────────────────────────────────────────────────────────────────

/// Loads `<dir>/<keyframe name>.pcd`.
#[derive(Debug, Clone)]
pub struct PcdDirectory {
    dir: PathBuf,
}

impl PcdDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn cloud_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.pcd"))
    }
}

impl CloudSource for PcdDirectory {
    fn load(&self, pose: &KeyframePose) -> Result<Vec<RawPoint>, FusionError> {
        let path = self.cloud_path(&pose.name);
        let bytes = fs::read(&path).map_err(|e| FusionError::io(&path, e))?;
        let points = parse_pcd(&bytes, &path)?;
        debug!(keyframe = %pose.name, points = points.len(), "cloud loaded");
        Ok(points)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PCD parsing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Ascii,
    Binary,
}

#[derive(Debug, Clone)]
struct PcdField {
    name: String,
    size: usize,
    kind: char,
    count: usize,
    /// Byte offset inside a binary record.
    offset: usize,
    /// Token index inside an ascii record.
    column: usize,
}

#[derive(Debug)]
struct PcdHeader {
    fields: Vec<PcdField>,
    points: usize,
    data: DataKind,
    record_size: usize,
    body_start: usize,
}

impl PcdHeader {
    fn field(&self, name: &str) -> Option<&PcdField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Parse a complete PCD file held in memory.
pub fn parse_pcd(bytes: &[u8], path: &Path) -> Result<Vec<RawPoint>, FusionError> {
    let malformed = |reason: String| FusionError::CloudFormat {
        path: path.to_path_buf(),
        reason,
    };

    let header = parse_header(bytes).map_err(malformed)?;
    let x = header.field("x").ok_or_else(|| malformed("missing field `x`".into()))?;
    let y = header.field("y").ok_or_else(|| malformed("missing field `y`".into()))?;
    let z = header.field("z").ok_or_else(|| malformed("missing field `z`".into()))?;
    let color = header.field("rgb").or_else(|| header.field("rgba"));

    let body = &bytes[header.body_start..];
    // Every point takes at least one byte of body.
    let mut points = Vec::with_capacity(header.points.min(body.len()));

    match header.data {
        DataKind::Ascii => {
            let text = String::from_utf8_lossy(body);
            let width: usize = header.fields.iter().map(|f| f.count).sum();
            let mut rows = text.lines().map(str::trim).filter(|l| !l.is_empty());
            for i in 0..header.points {
                let row = rows
                    .next()
                    .ok_or_else(|| malformed(format!("expected {} points, found {i}", header.points)))?;
                let tokens: Vec<&str> = row.split_whitespace().collect();
                if tokens.len() < width {
                    return Err(malformed(format!("point {i}: expected {width} values, found {}", tokens.len())));
                }
                let coord = |f: &PcdField| {
                    tokens[f.column]
                        .parse::<f64>()
                        .map_err(|_| malformed(format!("point {i}: bad `{}` value {:?}", f.name, tokens[f.column])))
                };
                let rgb = match color {
                    Some(f) => ascii_color(tokens[f.column], f)
                        .ok_or_else(|| malformed(format!("point {i}: bad color value {:?}", tokens[f.column])))?,
                    None => UNCOLORED,
                };
                push_finite(&mut points, coord(x)?, coord(y)?, coord(z)?, rgb);
            }
        }
        DataKind::Binary => {
            let needed = header.points.checked_mul(header.record_size).ok_or_else(|| {
                malformed(format!(
                    "{} points of {} bytes overflow the addressable size",
                    header.points, header.record_size
                ))
            })?;
            if body.len() < needed {
                return Err(malformed(format!(
                    "binary body holds {} bytes, {} points need {needed}",
                    body.len(),
                    header.points
                )));
            }
            for record in body[..needed].chunks_exact(header.record_size) {
                let coord = |f: &PcdField| {
                    binary_scalar(&record[f.offset..f.offset + f.size], f.kind)
                        .ok_or_else(|| malformed(format!("unsupported `{}` type {}{}", f.name, f.kind, f.size)))
                };
                let rgb = match color {
                    Some(f) if f.size == 4 => {
                        let raw = &record[f.offset..f.offset + 4];
                        Rgb::from_packed(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                    }
                    Some(f) => return Err(malformed(format!("color field must be 4 bytes, is {}", f.size))),
                    None => UNCOLORED,
                };
                push_finite(&mut points, coord(x)?, coord(y)?, coord(z)?, rgb);
            }
        }
    }

    Ok(points)
}

fn push_finite(points: &mut Vec<RawPoint>, x: f64, y: f64, z: f64, color: Rgb) {
    let p = RawPoint::new(x as f32, y as f32, z as f32, color);
    if p.is_finite() {
        points.push(p);
    }
}

fn parse_header(bytes: &[u8]) -> Result<PcdHeader, String> {
    let mut names: Vec<String> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();
    let mut kinds: Vec<char> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let mut width: Option<usize> = None;
    let mut height: usize = 1;
    let mut points: Option<usize> = None;

    let mut pos = 0;
    let (data, body_start) = loop {
        if pos >= bytes.len() {
            return Err("header has no DATA line".into());
        }
        let end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|n| pos + n + 1)
            .unwrap_or(bytes.len());
        let line = String::from_utf8_lossy(&bytes[pos..end]);
        pos = end;

        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let values: Vec<&str> = parts.collect();
        let numbers = |what: &str| -> Result<Vec<usize>, String> {
            values
                .iter()
                .map(|v| v.parse::<usize>().map_err(|_| format!("bad {what} value {v:?}")))
                .collect()
        };

        match key.to_ascii_uppercase().as_str() {
            k if k.starts_with('#') => {}
            "VERSION" | "VIEWPOINT" => {}
            "FIELDS" | "COLUMNS" => names = values.iter().map(|v| v.to_string()).collect(),
            "SIZE" => sizes = numbers("SIZE")?,
            "TYPE" => {
                kinds = values
                    .iter()
                    .map(|v| v.chars().next().map(|c| c.to_ascii_uppercase()).unwrap_or('?'))
                    .collect()
            }
            "COUNT" => counts = numbers("COUNT")?,
            "WIDTH" => width = numbers("WIDTH")?.first().copied(),
            "HEIGHT" => height = numbers("HEIGHT")?.first().copied().unwrap_or(1),
            "POINTS" => points = numbers("POINTS")?.first().copied(),
            "DATA" => {
                let kind = match values.first().map(|v| v.to_ascii_lowercase()) {
                    Some(v) if v == "ascii" => DataKind::Ascii,
                    Some(v) if v == "binary" => DataKind::Binary,
                    Some(v) => return Err(format!("unsupported DATA encoding {v:?}")),
                    None => return Err("DATA line has no encoding".into()),
                };
                break (kind, pos);
            }
            other => return Err(format!("unknown header key {other:?}")),
        }
    };

    if names.is_empty() {
        return Err("header has no FIELDS".into());
    }
    if counts.is_empty() {
        counts = vec![1; names.len()];
    }
    if sizes.len() != names.len() || kinds.len() != names.len() || counts.len() != names.len() {
        return Err("FIELDS, SIZE, TYPE and COUNT disagree in length".into());
    }

    let mut fields = Vec::with_capacity(names.len());
    let (mut offset, mut column): (usize, usize) = (0, 0);
    for (i, name) in names.into_iter().enumerate() {
        if sizes[i] == 0 || counts[i] == 0 {
            return Err(format!("field {name:?} has zero SIZE or COUNT"));
        }
        let (Some(end), Some(next_column)) = (
            sizes[i].checked_mul(counts[i]).and_then(|b| b.checked_add(offset)),
            column.checked_add(counts[i]),
        ) else {
            return Err(format!("field {name:?} overflows the record size"));
        };
        fields.push(PcdField {
            name,
            size: sizes[i],
            kind: kinds[i],
            count: counts[i],
            offset,
            column,
        });
        offset = end;
        column = next_column;
    }

    let points = match (points, width) {
        (Some(n), _) => n,
        (None, Some(w)) => w
            .checked_mul(height)
            .ok_or_else(|| format!("WIDTH {w} by HEIGHT {height} overflows"))?,
        (None, None) => return Err("header has neither POINTS nor WIDTH".into()),
    };

    Ok(PcdHeader {
        fields,
        points,
        data,
        record_size: offset,
        body_start,
    })
}

fn binary_scalar(raw: &[u8], kind: char) -> Option<f64> {
    Some(match (kind, raw.len()) {
        ('F', 4) => f64::from(f32::from_le_bytes(raw.try_into().ok()?)),
        ('F', 8) => f64::from_le_bytes(raw.try_into().ok()?),
        ('U', 1) => f64::from(raw[0]),
        ('U', 2) => f64::from(u16::from_le_bytes(raw.try_into().ok()?)),
        ('U', 4) => f64::from(u32::from_le_bytes(raw.try_into().ok()?)),
        ('I', 1) => f64::from(raw[0] as i8),
        ('I', 2) => f64::from(i16::from_le_bytes(raw.try_into().ok()?)),
        ('I', 4) => f64::from(i32::from_le_bytes(raw.try_into().ok()?)),
        _ => return None,
    })
}

fn ascii_color(token: &str, field: &PcdField) -> Option<Rgb> {
    let packed = match field.kind {
        'F' => token.parse::<f32>().ok()?.to_bits(),
        'U' => token.parse::<u32>().ok()?,
        'I' => token.parse::<i64>().ok()? as u32,
        _ => return None,
    };
    Some(Rgb::from_packed(packed))
}
