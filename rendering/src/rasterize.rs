//! Tile-based CPU rasterizer for Gaussian primitives.
//!
//! Primitives are projected to screen-space ellipses, binned into square
//! tiles, sorted front to back per tile and alpha-composited per pixel.
//! The backward pass replays the same traversal and propagates the image
//! gradient analytically to every raw parameter.
//!
//! ## Example
//!
//! ```rust
//! use gs_core::{Camera, Image, Primitive, PrimitiveSet};
//! use gs_rendering::{CpuRasterizer, Rasterizer, RenderSettings};
//! use nalgebra::{Matrix3, Vector3, Vector4};
//!
//! let mut set = PrimitiveSet::new(0);
//! set.push(Primitive {
//!     position: Vector3::new(0.0, 0.0, 4.0),
//!     features_dc: Vector3::zeros(),
//!     features_rest: vec![],
//!     opacity_logit: 2.0,
//!     log_scale: Vector3::repeat(-1.5),
//!     rotation: Vector4::new(1.0, 0.0, 0.0, 0.0),
//! });
//!
//! let target = Image::new(32, 32, 3);
//! let camera = Camera::new(
//!     0, "view", Matrix3::identity(), Vector3::zeros(),
//!     1.0, 1.0, target, None, Vector3::zeros(),
//! ).unwrap();
//!
//! let out = CpuRasterizer::default()
//!     .render(&camera, &set, &RenderSettings::default(), &Vector3::zeros())
//!     .unwrap();
//! assert!(out.visibility[0]);
//! ```

use gs_core::{
    Camera, Error, Image, ParamBuffer, ParamGradients, ParamGroup, PrimitiveSet, Result,
};
use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3, Vector4};
use rayon::prelude::*;

use crate::sh::{eval_sh, sh_backward, sh_basis};

/// Primitives closer to the camera than this are culled.
pub const NEAR_PLANE: f32 = 0.2;
pub const TILE_SIZE: u32 = 16;

const MAX_ALPHA: f32 = 0.99;
const MIN_ALPHA: f32 = 1.0 / 255.0;
const MIN_TRANSMITTANCE: f32 = 1e-4;
/// Added to the 2D covariance so every splat covers at least about a pixel.
const COV2D_DILATION: f32 = 0.3;

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub active_sh_degree: usize,
    pub scaling_modifier: f32,
    /// Checks every output for non-finite values.
    pub debug: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            active_sh_degree: 0,
            scaling_modifier: 1.0,
            debug: false,
        }
    }
}

/// Rendered image plus the per-primitive screen statistics density control needs.
#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub image: Image,
    /// `true` for primitives that landed on at least one tile.
    pub visibility: Vec<bool>,
    /// Screen radius along the major axis, in pixels. 0 when not visible.
    pub radii: Vec<f32>,
    /// Screen radius along the minor axis, in pixels. 0 when not visible.
    pub radii_min: Vec<f32>,
}

impl RenderOutput {
    pub fn visible_count(&self) -> usize {
        self.visibility.iter().filter(|&&v| v).count()
    }
}

#[derive(Clone, Debug)]
pub struct BackwardOutput {
    pub params: ParamGradients,
    /// Gradient of the loss with respect to each projected centre, in NDC units.
    pub screen_space: Vec<Vector2<f32>>,
}

/// A differentiable renderer for a [`PrimitiveSet`].
pub trait Rasterizer: Send + Sync {
    fn render(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        background: &Vector3<f32>,
    ) -> Result<RenderOutput>;

    /// Propagates `grad_image` (dL/dimage, same shape as `output.image`)
    /// back to the raw parameters.
    fn backward(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        background: &Vector3<f32>,
        output: &RenderOutput,
        grad_image: &Image,
    ) -> Result<BackwardOutput>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRect {
    pub fn is_empty(&self) -> bool {
        self.min_x >= self.max_x || self.min_y >= self.max_y
    }
}

/// One primitive after projection.
#[derive(Clone, Debug)]
struct Splat {
    index: usize,
    depth: f32,
    view: Vector3<f32>,
    mean: Vector2<f32>,
    conic: Matrix2<f32>,
    /// Jacobian of the projection times the view rotation.
    jw: Matrix2x3<f32>,
    opacity: f32,
    color: Vector3<f32>,
    clamped: [bool; 3],
    basis: Vec<f32>,
    radius: f32,
    radius_min: f32,
}

struct Frame {
    splats: Vec<Splat>,
    tiles: Vec<Vec<usize>>,
    tiles_x: u32,
}

#[derive(Clone, Copy, Debug)]
struct Contribution {
    splat: usize,
    alpha: f32,
    gaussian: f32,
    transmittance: f32,
    offset: Vector2<f32>,
    saturated: bool,
}

/// Reference rasterizer. Parallel over primitives and pixels with rayon.
#[derive(Clone, Debug)]
pub struct CpuRasterizer {
    pub tile_size: u32,
}

impl Default for CpuRasterizer {
    fn default() -> Self {
        Self::new(TILE_SIZE)
    }
}

impl CpuRasterizer {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size.max(1),
        }
    }

    pub fn num_tiles(&self, camera: &Camera) -> (u32, u32) {
        let tiles_x = (camera.width + self.tile_size - 1) / self.tile_size;
        let tiles_y = (camera.height + self.tile_size - 1) / self.tile_size;
        (tiles_x, tiles_y)
    }

    /// Tiles touched by the square of half-size `radius` around `center`.
    pub fn compute_tile_bounds(
        &self,
        camera: &Camera,
        center: &Vector2<f32>,
        radius: f32,
    ) -> TileRect {
        let (tiles_x, tiles_y) = self.num_tiles(camera);
        let ts = self.tile_size as f32;
        let lo = |v: f32, max: u32| ((v / ts).floor().max(0.0) as u32).min(max);
        let hi = |v: f32, max: u32| ((v / ts).ceil().max(0.0) as u32).min(max);
        TileRect {
            min_x: lo(center.x - radius, tiles_x),
            min_y: lo(center.y - radius, tiles_y),
            max_x: hi(center.x + radius, tiles_x),
            max_y: hi(center.y + radius, tiles_y),
        }
    }

    fn project(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        index: usize,
    ) -> Option<Splat> {
        let position = primitives.position(index);
        let view = camera.world_to_view(&position);
        if view.z <= NEAR_PLANE {
            return None;
        }

        let (fx, fy) = (camera.focal_x(), camera.focal_y());
        let (x, y, z) = (view.x, view.y, view.z);
        let jacobian = Matrix2x3::new(
            fx / z,
            0.0,
            -fx * x / (z * z),
            0.0,
            fy / z,
            -fy * y / (z * z),
        );
        let jw = jacobian * camera.rotation;
        let cov3d = primitives.covariance(index, settings.scaling_modifier);
        let cov2d = jw * cov3d * jw.transpose() + Matrix2::identity() * COV2D_DILATION;
        let det = cov2d.determinant();
        if det <= 0.0 || !det.is_finite() {
            return None;
        }
        let conic = cov2d.try_inverse()?;

        let mid = 0.5 * (cov2d[(0, 0)] + cov2d[(1, 1)]);
        let spread = (mid * mid - det).max(0.1).sqrt();
        let radius = (3.0 * (mid + spread).sqrt()).ceil();
        let radius_min = (3.0 * (mid - spread).max(0.0).sqrt()).ceil();

        let mean = Vector2::new(
            fx * x / z + 0.5 * camera.width as f32,
            fy * y / z + 0.5 * camera.height as f32,
        );
        if self.compute_tile_bounds(camera, &mean, radius).is_empty() {
            return None;
        }

        let dir = (position - camera.center().coords).normalize();
        let basis = sh_basis(settings.active_sh_degree, &dir);
        let dc = primitives.group(ParamGroup::FeaturesDc).vec3(index);
        let rest = primitives.group(ParamGroup::FeaturesRest).row(index);
        let raw = eval_sh(&basis, &dc, rest) + Vector3::repeat(0.5);

        Some(Splat {
            index,
            depth: z,
            view,
            mean,
            conic,
            jw,
            opacity: primitives.opacity(index),
            color: raw.map(|v| v.max(0.0)),
            clamped: [raw.x < 0.0, raw.y < 0.0, raw.z < 0.0],
            basis,
            radius,
            radius_min,
        })
    }

    fn prepare(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
    ) -> Frame {
        let splats: Vec<Splat> = (0..primitives.len())
            .into_par_iter()
            .filter_map(|i| self.project(camera, primitives, settings, i))
            .collect();

        let (tiles_x, tiles_y) = self.num_tiles(camera);
        let mut tiles: Vec<Vec<usize>> = vec![Vec::new(); (tiles_x * tiles_y) as usize];
        for (s, splat) in splats.iter().enumerate() {
            let rect = self.compute_tile_bounds(camera, &splat.mean, splat.radius);
            for ty in rect.min_y..rect.max_y {
                for tx in rect.min_x..rect.max_x {
                    tiles[(ty * tiles_x + tx) as usize].push(s);
                }
            }
        }
        tiles
            .par_iter_mut()
            .for_each(|list| list.sort_by(|&a, &b| splats[a].depth.total_cmp(&splats[b].depth)));

        Frame {
            splats,
            tiles,
            tiles_x,
        }
    }

    fn tile_of(&self, frame: &Frame, px: u32, py: u32) -> usize {
        ((py / self.tile_size) * frame.tiles_x + px / self.tile_size) as usize
    }
}

/// Front-to-back traversal of one pixel. Returns the final transmittance.
fn trace_pixel<F>(splats: &[Splat], list: &[usize], pixel: &Vector2<f32>, mut visit: F) -> f32
where
    F: FnMut(&Contribution),
{
    let mut t = 1.0f32;
    for &s in list {
        let splat = &splats[s];
        let d = pixel - splat.mean;
        let q = &splat.conic;
        let power = -0.5 * (q[(0, 0)] * d.x * d.x + q[(1, 1)] * d.y * d.y) - q[(0, 1)] * d.x * d.y;
        if power > 0.0 {
            continue;
        }
        let gaussian = power.exp();
        let raw = splat.opacity * gaussian;
        let alpha = raw.min(MAX_ALPHA);
        if alpha < MIN_ALPHA {
            continue;
        }
        let next = t * (1.0 - alpha);
        if next < MIN_TRANSMITTANCE {
            break;
        }
        visit(&Contribution {
            splat: s,
            alpha,
            gaussian,
            transmittance: t,
            offset: d,
            saturated: raw > MAX_ALPHA,
        });
        t = next;
    }
    t
}

fn pixel_center(pix: usize, width: u32) -> (u32, u32, Vector2<f32>) {
    let px = (pix % width as usize) as u32;
    let py = (pix / width as usize) as u32;
    (px, py, Vector2::new(px as f32 + 0.5, py as f32 + 0.5))
}

/// Screen-space gradients accumulated over all pixels, indexed by splat.
#[derive(Clone)]
struct SplatGrads {
    mean: Vec<Vector2<f32>>,
    conic: Vec<Matrix2<f32>>,
    color: Vec<Vector3<f32>>,
    opacity: Vec<f32>,
}

impl SplatGrads {
    fn zeros(n: usize) -> Self {
        Self {
            mean: vec![Vector2::zeros(); n],
            conic: vec![Matrix2::zeros(); n],
            color: vec![Vector3::zeros(); n],
            opacity: vec![0.0; n],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.mean.iter_mut().zip(other.mean) {
            *a += b;
        }
        for (a, b) in self.conic.iter_mut().zip(other.conic) {
            *a += b;
        }
        for (a, b) in self.color.iter_mut().zip(other.color) {
            *a += b;
        }
        for (a, b) in self.opacity.iter_mut().zip(other.opacity) {
            *a += b;
        }
        self
    }
}

/// Gradient of the rotation matrix of `q / |q|` pulled back to the raw quaternion.
fn quat_backward(q: &Vector4<f32>, d_rot: &Matrix3<f32>) -> Vector4<f32> {
    let norm = q.norm();
    if norm == 0.0 {
        return Vector4::zeros();
    }
    let qn = q / norm;
    let (w, x, y, z) = (qn[0], qn[1], qn[2], qn[3]);

    let dw = Matrix3::new(0.0, -2.0 * z, 2.0 * y, 2.0 * z, 0.0, -2.0 * x, -2.0 * y, 2.0 * x, 0.0);
    let dx = Matrix3::new(
        0.0,
        2.0 * y,
        2.0 * z,
        2.0 * y,
        -4.0 * x,
        -2.0 * w,
        2.0 * z,
        2.0 * w,
        -4.0 * x,
    );
    let dy = Matrix3::new(
        -4.0 * y,
        2.0 * x,
        2.0 * w,
        2.0 * x,
        0.0,
        2.0 * z,
        -2.0 * w,
        2.0 * z,
        -4.0 * y,
    );
    let dz = Matrix3::new(
        -4.0 * z,
        -2.0 * w,
        2.0 * x,
        2.0 * w,
        -4.0 * z,
        2.0 * y,
        2.0 * x,
        2.0 * y,
        0.0,
    );
    let g = Vector4::new(
        d_rot.component_mul(&dw).sum(),
        d_rot.component_mul(&dx).sum(),
        d_rot.component_mul(&dy).sum(),
        d_rot.component_mul(&dz).sum(),
    );
    (g - qn * qn.dot(&g)) / norm
}

struct RowGrad {
    position: Vector3<f32>,
    dc: [f32; 3],
    rest: Vec<f32>,
    opacity: f32,
    log_scale: Vector3<f32>,
    rotation: Vector4<f32>,
    screen: Vector2<f32>,
}

impl RowGrad {
    fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.dc.iter().all(|v| v.is_finite())
            && self.rest.iter().all(|v| v.is_finite())
            && self.opacity.is_finite()
            && self.log_scale.iter().all(|v| v.is_finite())
            && self.rotation.iter().all(|v| v.is_finite())
    }
}

impl CpuRasterizer {
    /// Chains the screen-space gradients of one splat down to its raw parameters.
    ///
    /// The projection Jacobian is treated as constant with respect to the
    /// primitive position, and the SH view direction likewise.
    fn chain(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        splat: &Splat,
        acc: &SplatGrads,
        k: usize,
    ) -> RowGrad {
        let i = splat.index;

        let mut dcolor = acc.color[k];
        for c in 0..3 {
            if splat.clamped[c] {
                dcolor[c] = 0.0;
            }
        }
        let mut dc = [0.0; 3];
        let mut rest = vec![0.0; primitives.group(ParamGroup::FeaturesRest).width()];
        sh_backward(&splat.basis, &dcolor, &mut dc, &mut rest);

        let o = splat.opacity;
        let opacity = acc.opacity[k] * o * (1.0 - o);

        let dcov2d = -(splat.conic * acc.conic[k] * splat.conic);
        let dcov3d = splat.jw.transpose() * dcov2d * splat.jw;
        let rot = primitives.rotation_matrix(i);
        let scale = primitives.scale(i) * settings.scaling_modifier;
        let s = Matrix3::from_diagonal(&scale);
        let m = rot * s;
        let dm = (dcov3d + dcov3d.transpose()) * m;
        let rt_dm = rot.transpose() * dm;
        let log_scale = Vector3::new(
            rt_dm[(0, 0)] * scale.x,
            rt_dm[(1, 1)] * scale.y,
            rt_dm[(2, 2)] * scale.z,
        );
        let rotation = quat_backward(&primitives.group(ParamGroup::Rotation).vec4(i), &(dm * s));

        let g = acc.mean[k];
        let (fx, fy) = (camera.focal_x(), camera.focal_y());
        let v = &splat.view;
        let dview = Vector3::new(
            g.x * fx / v.z,
            g.y * fy / v.z,
            -(g.x * fx * v.x + g.y * fy * v.y) / (v.z * v.z),
        );
        let position = camera.rotation.transpose() * dview;
        let screen = Vector2::new(
            g.x * 0.5 * camera.width as f32,
            g.y * 0.5 * camera.height as f32,
        );

        RowGrad {
            position,
            dc,
            rest,
            opacity,
            log_scale,
            rotation,
            screen,
        }
    }
}

impl Rasterizer for CpuRasterizer {
    fn render(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        background: &Vector3<f32>,
    ) -> Result<RenderOutput> {
        let frame = self.prepare(camera, primitives, settings);
        let (width, height) = (camera.width, camera.height);

        let pixels: Vec<Vector3<f32>> = (0..(width as usize * height as usize))
            .into_par_iter()
            .map(|pix| {
                let (px, py, center) = pixel_center(pix, width);
                let list = &frame.tiles[self.tile_of(&frame, px, py)];
                let mut color = Vector3::zeros();
                let t = trace_pixel(&frame.splats, list, &center, |c| {
                    color += frame.splats[c.splat].color * (c.alpha * c.transmittance);
                });
                color + *background * t
            })
            .collect();

        let mut image = Image::new(width, height, 3);
        let plane = image.plane_len();
        for (i, color) in pixels.iter().enumerate() {
            for c in 0..3 {
                image.data[c * plane + i] = color[c];
            }
        }

        let n = primitives.len();
        let mut visibility = vec![false; n];
        let mut radii = vec![0.0; n];
        let mut radii_min = vec![0.0; n];
        for splat in &frame.splats {
            visibility[splat.index] = true;
            radii[splat.index] = splat.radius;
            radii_min[splat.index] = splat.radius_min;
        }

        if settings.debug {
            tracing::debug!(
                "rendered {}x{} with {} of {} primitives visible",
                width,
                height,
                frame.splats.len(),
                n
            );
            if image.data.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvariantViolation(
                    "rendered image contains non-finite values".into(),
                ));
            }
        }

        Ok(RenderOutput {
            image,
            visibility,
            radii,
            radii_min,
        })
    }

    fn backward(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        settings: &RenderSettings,
        background: &Vector3<f32>,
        output: &RenderOutput,
        grad_image: &Image,
    ) -> Result<BackwardOutput> {
        if !grad_image.same_shape(&output.image) {
            return Err(Error::DimensionMismatch(format!(
                "image gradient is {}x{}x{}, render is {}x{}x{}",
                grad_image.width,
                grad_image.height,
                grad_image.channels,
                output.image.width,
                output.image.height,
                output.image.channels
            )));
        }
        if output.visibility.len() != primitives.len() {
            return Err(Error::InvariantViolation(format!(
                "render covers {} primitives, set has {}",
                output.visibility.len(),
                primitives.len()
            )));
        }

        let frame = self.prepare(camera, primitives, settings);
        let m = frame.splats.len();
        let plane = grad_image.plane_len();
        let width = camera.width;

        let acc = (0..plane)
            .into_par_iter()
            .fold(
                || SplatGrads::zeros(m),
                |mut acc, pix| {
                    let dl = Vector3::new(
                        grad_image.data[pix],
                        grad_image.data[plane + pix],
                        grad_image.data[2 * plane + pix],
                    );
                    if dl == Vector3::zeros() {
                        return acc;
                    }
                    let (px, py, center) = pixel_center(pix, width);
                    let list = &frame.tiles[self.tile_of(&frame, px, py)];
                    let mut hits = Vec::new();
                    let t_final = trace_pixel(&frame.splats, list, &center, |c| hits.push(*c));

                    // colour contributed by everything behind the current splat
                    let mut behind = *background * t_final;
                    for hit in hits.iter().rev() {
                        let splat = &frame.splats[hit.splat];
                        let weight = hit.alpha * hit.transmittance;
                        acc.color[hit.splat] += dl * weight;
                        let dalpha =
                            (splat.color * hit.transmittance - behind / (1.0 - hit.alpha)).dot(&dl);
                        behind += splat.color * weight;
                        if hit.saturated {
                            continue;
                        }
                        acc.opacity[hit.splat] += dalpha * hit.gaussian;
                        let dpower = dalpha * hit.alpha;
                        acc.mean[hit.splat] += splat.conic * hit.offset * dpower;
                        acc.conic[hit.splat] += hit.offset * hit.offset.transpose() * (-0.5 * dpower);
                    }
                    acc
                },
            )
            .reduce(|| SplatGrads::zeros(m), SplatGrads::merge);

        let rows: Vec<RowGrad> = frame
            .splats
            .par_iter()
            .enumerate()
            .map(|(k, splat)| self.chain(camera, primitives, settings, splat, &acc, k))
            .collect();

        let n = primitives.len();
        let rest_width = primitives.group(ParamGroup::FeaturesRest).width();
        let mut positions = ParamBuffer::zeros(n, 3);
        let mut features_dc = ParamBuffer::zeros(n, 3);
        let mut features_rest = ParamBuffer::zeros(n, rest_width);
        let mut opacities = ParamBuffer::zeros(n, 1);
        let mut scalings = ParamBuffer::zeros(n, 3);
        let mut rotations = ParamBuffer::zeros(n, 4);
        let mut touched = vec![false; n];
        let mut screen_space = vec![Vector2::zeros(); n];

        for (splat, row) in frame.splats.iter().zip(rows) {
            let i = splat.index;
            if settings.debug && !row.is_finite() {
                return Err(Error::InvariantViolation(format!(
                    "non-finite gradient for primitive {i}"
                )));
            }
            positions.row_mut(i).copy_from_slice(row.position.as_slice());
            features_dc.row_mut(i).copy_from_slice(&row.dc);
            features_rest.row_mut(i).copy_from_slice(&row.rest);
            opacities.row_mut(i)[0] = row.opacity;
            scalings.row_mut(i).copy_from_slice(row.log_scale.as_slice());
            rotations.row_mut(i).copy_from_slice(row.rotation.as_slice());
            touched[i] = true;
            screen_space[i] = row.screen;
        }

        Ok(BackwardOutput {
            params: ParamGradients {
                positions: Some(positions),
                features_dc: Some(features_dc),
                features_rest: Some(features_rest),
                opacities: Some(opacities),
                scalings: Some(scalings),
                rotations: Some(rotations),
                touched,
            },
            screen_space,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quat_backward_is_tangent() {
        let q = Vector4::new(0.9, 0.1, -0.3, 0.2);
        let d = Matrix3::new(1.0, 0.5, -0.2, 0.3, -1.0, 0.4, 0.0, 0.7, 0.2);
        let g = quat_backward(&q, &d);
        // scaling q does not change the rotation
        assert!(g.dot(&q).abs() < 1e-5);
    }

    #[test]
    fn test_quat_backward_matches_finite_difference() {
        let q = Vector4::new(0.8, 0.2, -0.4, 0.3);
        let d = Matrix3::new(0.3, -0.5, 0.2, 0.1, 0.4, -0.6, 0.9, 0.0, -0.2);
        let g = quat_backward(&q, &d);
        let f = |q: &Vector4<f32>| gs_core::primitives::quat_to_matrix(q).component_mul(&d).sum();
        let eps = 1e-3;
        for k in 0..4 {
            let mut hi = q;
            let mut lo = q;
            hi[k] += eps;
            lo[k] -= eps;
            let fd = (f(&hi) - f(&lo)) / (2.0 * eps);
            assert!((fd - g[k]).abs() < 2e-3, "component {k}: fd {fd} vs {}", g[k]);
        }
    }

    #[test]
    fn test_empty_tile_rect() {
        let r = TileRect::default();
        assert!(r.is_empty());
        let r = TileRect {
            min_x: 0,
            min_y: 0,
            max_x: 1,
            max_y: 1,
        };
        assert!(!r.is_empty());
    }
}
