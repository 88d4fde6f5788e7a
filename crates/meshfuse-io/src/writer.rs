//! Output writers and staged file persistence.
//!
//! A run produces several files. Each is first written in full to a
//! temporary file inside the output directory ([`StagedFile::stage`]); only
//! once every output has been staged are they moved into place
//! ([`StagedFile::commit`]). A failure while staging leaves the output
//! directory untouched.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use meshfuse_types::{FusionError, Mesh, RawPoint};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

/// PLY body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshFormat {
    #[default]
    Ascii,
    Binary,
}

// ────────────────────────────────────────────────────────────────────────────
// PLY
// ────────────────────────────────────────────────────────────────────────────

/// Write `mesh` as PLY with per-vertex RGB and triangle faces.
pub fn write_ply<W: Write>(mesh: &Mesh, format: MeshFormat, out: &mut W) -> io::Result<()> {
    let encoding = match format {
        MeshFormat::Ascii => "ascii",
        MeshFormat::Binary => "binary_little_endian",
    };
    writeln!(out, "ply")?;
    writeln!(out, "format {encoding} 1.0")?;
    writeln!(out, "comment fused keyframe surface")?;
    writeln!(out, "element vertex {}", mesh.vertices.len())?;
    for axis in ["x", "y", "z"] {
        writeln!(out, "property float {axis}")?;
    }
    for channel in ["red", "green", "blue"] {
        writeln!(out, "property uchar {channel}")?;
    }
    writeln!(out, "element face {}", mesh.triangles.len())?;
    writeln!(out, "property list uchar int vertex_indices")?;
    writeln!(out, "end_header")?;

    match format {
        MeshFormat::Ascii => {
            for v in &mesh.vertices {
                let p = v.position;
                writeln!(out, "{} {} {} {} {} {}", p.x, p.y, p.z, v.color.r, v.color.g, v.color.b)?;
            }
            for [a, b, c] in &mesh.triangles {
                writeln!(out, "3 {a} {b} {c}")?;
            }
        }
        MeshFormat::Binary => {
            for v in &mesh.vertices {
                for c in [v.position.x, v.position.y, v.position.z] {
                    out.write_all(&c.to_le_bytes())?;
                }
                out.write_all(&[v.color.r, v.color.g, v.color.b])?;
            }
            for tri in &mesh.triangles {
                out.write_all(&[3u8])?;
                for &i in tri {
                    let index = i32::try_from(i)
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "vertex index exceeds PLY int"))?;
                    out.write_all(&index.to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// PCD
// ────────────────────────────────────────────────────────────────────────────

/// Write `points` as an ascii PCD v0.7 cloud with a float-packed `rgb`
/// field, readable by PCL-based tools and by the loader in this crate.
pub fn write_pcd<W: Write>(points: &[RawPoint], out: &mut W) -> io::Result<()> {
    writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(out, "VERSION 0.7")?;
    writeln!(out, "FIELDS x y z rgb")?;
    writeln!(out, "SIZE 4 4 4 4")?;
    writeln!(out, "TYPE F F F F")?;
    writeln!(out, "COUNT 1 1 1 1")?;
    writeln!(out, "WIDTH {}", points.len())?;
    writeln!(out, "HEIGHT 1")?;
    writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(out, "POINTS {}", points.len())?;
    writeln!(out, "DATA ascii")?;
    for p in points {
        let rgb = f32::from_bits(p.color.packed());
        writeln!(out, "{} {} {} {:e}", p.position.x, p.position.y, p.position.z, rgb)?;
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Staged output
// ────────────────────────────────────────────────────────────────────────────

/// A fully written temporary file waiting to be moved to its final path.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    /// Write `target`'s contents to a temporary file in the same directory.
    pub fn stage<F>(target: impl Into<PathBuf>, write: F) -> Result<Self, FusionError>
    where
        F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> io::Result<()>,
    {
        let target = target.into();
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| FusionError::io(dir, e))?;
        {
            let mut buf = BufWriter::new(&mut tmp);
            write(&mut buf).map_err(|e| FusionError::io(&target, e))?;
            buf.flush().map_err(|e| FusionError::io(&target, e))?;
        }
        debug!(target = %target.display(), "output staged");
        Ok(Self { tmp, target })
    }

    /// Atomically move the staged file to its target path.
    pub fn commit(self) -> Result<PathBuf, FusionError> {
        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| FusionError::io(&target, e.error))?;
        Ok(target)
    }
}
