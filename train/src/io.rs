//! Scene exports: ASCII PLY for primitives and point clouds, `cameras.json`.
//!
//! The primitive PLY stores raw parameters (log scales, opacity logits,
//! unnormalised quaternions), with the higher SH coefficients laid out one
//! colour channel after another as common splat viewers expect.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use gs_core::{sh_coeff_count, CameraJson, PointCloud, Primitive, PrimitiveSet};
use nalgebra::{Point3, Vector3, Vector4};

use crate::{Error, Result};

struct PlyHeader {
    vertices: usize,
    properties: Vec<String>,
}

impl PlyHeader {
    fn column(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p == name)
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.column(name)
            .ok_or_else(|| Error::Dataset(format!("PLY is missing property '{name}'")))
    }
}

fn read_header<R: BufRead>(lines: &mut std::io::Lines<R>) -> Result<PlyHeader> {
    let first = lines
        .next()
        .ok_or_else(|| Error::Dataset("empty PLY file".into()))??;
    if first.trim() != "ply" {
        return Err(Error::Dataset("not a PLY file".into()));
    }

    let mut vertices = 0;
    let mut properties = Vec::new();
    let mut in_vertex = false;
    for line in lines.by_ref() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("format") => {
                let format = tokens.next().unwrap_or_default();
                if format != "ascii" {
                    return Err(Error::Dataset(format!(
                        "PLY format '{format}' not supported, only ASCII"
                    )));
                }
            }
            Some("element") => {
                in_vertex = tokens.next() == Some("vertex");
                if in_vertex {
                    vertices = tokens
                        .next()
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| Error::Dataset(format!("invalid element line '{line}'")))?;
                }
            }
            Some("property") if in_vertex => {
                if let Some(name) = tokens.last() {
                    properties.push(name.to_string());
                }
            }
            Some("end_header") => return Ok(PlyHeader { vertices, properties }),
            _ => {}
        }
    }
    Err(Error::Dataset("PLY header is not terminated".into()))
}

fn read_rows<R: BufRead>(lines: &mut std::io::Lines<R>, header: &PlyHeader) -> Result<Vec<Vec<f32>>> {
    let mut rows = Vec::with_capacity(header.vertices);
    for i in 0..header.vertices {
        let line = lines
            .next()
            .ok_or_else(|| Error::Dataset(format!("PLY ends after {i} of {} vertices", header.vertices)))??;
        let values = line
            .split_whitespace()
            .map(|s| {
                s.parse::<f32>()
                    .map_err(|_| Error::Dataset(format!("invalid number '{s}' in vertex {i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if values.len() < header.properties.len() {
            return Err(Error::Dataset(format!(
                "vertex {i} has {} values, header declares {}",
                values.len(),
                header.properties.len()
            )));
        }
        rows.push(values);
    }
    Ok(rows)
}

/// Reads an ASCII point cloud (`x y z`, optional `red green blue` in 0..255).
pub fn read_point_cloud_ply(path: impl AsRef<Path>) -> Result<PointCloud> {
    let mut lines = BufReader::new(File::open(path.as_ref())?).lines();
    let header = read_header(&mut lines)?;
    let (x, y, z) = (header.require("x")?, header.require("y")?, header.require("z")?);
    let color = match (header.column("red"), header.column("green"), header.column("blue")) {
        (Some(r), Some(g), Some(b)) => Some((r, g, b)),
        _ => None,
    };

    let rows = read_rows(&mut lines, &header)?;
    let points = rows.iter().map(|v| Point3::new(v[x], v[y], v[z])).collect();
    let cloud = PointCloud::new(points);
    match color {
        Some((r, g, b)) => {
            let colors = rows
                .iter()
                .map(|v| Vector3::new(v[r], v[g], v[b]) / 255.0)
                .collect();
            Ok(cloud.with_colors(colors)?)
        }
        None => Ok(cloud),
    }
}

pub fn write_point_cloud_ply(cloud: &PointCloud, path: impl AsRef<Path>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", cloud.len())?;
    for name in ["x", "y", "z"] {
        writeln!(out, "property float {name}")?;
    }
    for name in ["red", "green", "blue"] {
        writeln!(out, "property uchar {name}")?;
    }
    writeln!(out, "end_header")?;
    for (i, p) in cloud.points.iter().enumerate() {
        let c = cloud.color(i).map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8);
        writeln!(out, "{} {} {} {} {} {}", p.x, p.y, p.z, c.x, c.y, c.z)?;
    }
    out.flush()?;
    Ok(())
}

fn primitive_properties(rest_coeffs: usize) -> Vec<String> {
    let mut names: Vec<String> = ["x", "y", "z", "nx", "ny", "nz", "f_dc_0", "f_dc_1", "f_dc_2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    names.extend((0..rest_coeffs * 3).map(|i| format!("f_rest_{i}")));
    names.push("opacity".into());
    names.extend((0..3).map(|i| format!("scale_{i}")));
    names.extend((0..4).map(|i| format!("rot_{i}")));
    names
}

/// Writes every primitive with its raw parameters.
pub fn write_ply(set: &PrimitiveSet, path: impl AsRef<Path>) -> Result<()> {
    let rest_coeffs = sh_coeff_count(set.max_sh_degree()) - 1;
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", set.len())?;
    for name in primitive_properties(rest_coeffs) {
        writeln!(out, "property float {name}")?;
    }
    writeln!(out, "end_header")?;

    for i in 0..set.len() {
        let p = set.primitive(i);
        let mut row: Vec<f32> = Vec::with_capacity(17 + rest_coeffs * 3);
        row.extend_from_slice(p.position.as_slice());
        row.extend_from_slice(&[0.0, 0.0, 0.0]);
        row.extend_from_slice(p.features_dc.as_slice());
        for c in 0..3 {
            row.extend((0..rest_coeffs).map(|k| p.features_rest[k * 3 + c]));
        }
        row.push(p.opacity_logit);
        row.extend_from_slice(p.log_scale.as_slice());
        row.extend_from_slice(p.rotation.as_slice());

        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    out.flush()?;
    Ok(())
}

/// Reads a primitive PLY written by [`write_ply`]. The SH degree is inferred
/// from the number of `f_rest_*` properties.
pub fn read_ply(path: impl AsRef<Path>) -> Result<PrimitiveSet> {
    let mut lines = BufReader::new(File::open(path.as_ref())?).lines();
    let header = read_header(&mut lines)?;

    let rest_values = header
        .properties
        .iter()
        .filter(|p| p.starts_with("f_rest_"))
        .count();
    let degree = (0..=gs_rendering::MAX_SH_DEGREE)
        .find(|&d| 3 * (sh_coeff_count(d) - 1) == rest_values)
        .ok_or_else(|| Error::Dataset(format!("{rest_values} f_rest values match no SH degree")))?;
    let rest_coeffs = sh_coeff_count(degree) - 1;

    let xyz = [header.require("x")?, header.require("y")?, header.require("z")?];
    let dc = [header.require("f_dc_0")?, header.require("f_dc_1")?, header.require("f_dc_2")?];
    let rest = (0..rest_values)
        .map(|i| header.require(&format!("f_rest_{i}")))
        .collect::<Result<Vec<_>>>()?;
    let opacity = header.require("opacity")?;
    let scale = [header.require("scale_0")?, header.require("scale_1")?, header.require("scale_2")?];
    let rot = [
        header.require("rot_0")?,
        header.require("rot_1")?,
        header.require("rot_2")?,
        header.require("rot_3")?,
    ];

    let mut set = PrimitiveSet::new(degree);
    for v in read_rows(&mut lines, &header)? {
        let mut features_rest = vec![0.0; rest_values];
        for c in 0..3 {
            for k in 0..rest_coeffs {
                features_rest[k * 3 + c] = v[rest[c * rest_coeffs + k]];
            }
        }
        set.push(Primitive {
            position: Vector3::new(v[xyz[0]], v[xyz[1]], v[xyz[2]]),
            features_dc: Vector3::new(v[dc[0]], v[dc[1]], v[dc[2]]),
            features_rest,
            opacity_logit: v[opacity],
            log_scale: Vector3::new(v[scale[0]], v[scale[1]], v[scale[2]]),
            rotation: Vector4::new(v[rot[0]], v[rot[1]], v[rot[2]], v[rot[3]]),
        });
    }
    Ok(set)
}

/// Saves the primitives under `<model_path>/point_cloud/iteration_<it>/point_cloud.ply`.
pub fn save_iteration(set: &PrimitiveSet, model_path: &Path, iteration: usize) -> Result<PathBuf> {
    let dir = model_path
        .join("point_cloud")
        .join(format!("iteration_{iteration}"));
    fs::create_dir_all(&dir)?;
    let path = dir.join("point_cloud.ply");
    write_ply(set, &path)?;
    Ok(path)
}

/// Writes `cameras.json`, numbering the entries in the given order.
pub fn write_cameras_json(entries: &[CameraJson], path: impl AsRef<Path>) -> Result<()> {
    let entries: Vec<CameraJson> = entries
        .iter()
        .enumerate()
        .map(|(id, entry)| CameraJson {
            id,
            ..entry.clone()
        })
        .collect();
    let mut file = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer(&mut file, &entries)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_columns_follow_declaration() {
        let text = "ply\nformat ascii 1.0\nelement vertex 1\nproperty float y\nproperty float x\nproperty float z\nelement face 0\nproperty list uchar int vertex_indices\nend_header\n2 1 3\n";
        let mut lines = BufReader::new(text.as_bytes()).lines();
        let header = read_header(&mut lines).unwrap();
        assert_eq!(header.vertices, 1);
        assert_eq!(header.properties, vec!["y", "x", "z"]);
        let rows = read_rows(&mut lines, &header).unwrap();
        assert_eq!(rows[0][header.column("x").unwrap()], 1.0);
    }

    #[test]
    fn test_binary_format_rejected() {
        let text = "ply\nformat binary_little_endian 1.0\nend_header\n";
        let mut lines = BufReader::new(text.as_bytes()).lines();
        assert!(read_header(&mut lines).is_err());
    }

    #[test]
    fn test_property_names_for_degree_one() {
        let names = primitive_properties(3);
        assert_eq!(names.len(), 9 + 9 + 1 + 3 + 4);
        assert_eq!(names[9], "f_rest_0");
        assert_eq!(names[18], "opacity");
        assert_eq!(names.last().map(String::as_str), Some("rot_3"));
    }
}
