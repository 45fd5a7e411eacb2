//! Real spherical harmonics up to degree 3.
//!
//! Coefficients are laid out the way [`gs_core::PrimitiveSet`] stores them:
//! the DC term in its own `Vector3`, the remaining `(D+1)^2 - 1` terms in a flat
//! slice, coefficient-major (`rest[(k - 1) * 3 + channel]`).

use gs_core::{sh_coeff_count, SH_C0};
use nalgebra::Vector3;

pub const SH_C1: f32 = 0.488_602_5;
pub const SH_C2: [f32; 5] = [
    1.092_548_4,
    -1.092_548_4,
    0.315_391_57,
    -1.092_548_4,
    0.546_274_2,
];
pub const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_34,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

pub const MAX_SH_DEGREE: usize = 3;

/// Basis values for a unit direction, `(degree + 1)^2` entries.
pub fn sh_basis(degree: usize, dir: &Vector3<f32>) -> Vec<f32> {
    let degree = degree.min(MAX_SH_DEGREE);
    let mut basis = Vec::with_capacity(sh_coeff_count(degree));
    basis.push(SH_C0);
    if degree == 0 {
        return basis;
    }

    let (x, y, z) = (dir.x, dir.y, dir.z);
    basis.extend_from_slice(&[-SH_C1 * y, SH_C1 * z, -SH_C1 * x]);
    if degree == 1 {
        return basis;
    }

    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);
    basis.extend_from_slice(&[
        SH_C2[0] * xy,
        SH_C2[1] * yz,
        SH_C2[2] * (2.0 * zz - xx - yy),
        SH_C2[3] * xz,
        SH_C2[4] * (xx - yy),
    ]);
    if degree == 2 {
        return basis;
    }

    basis.extend_from_slice(&[
        SH_C3[0] * y * (3.0 * xx - yy),
        SH_C3[1] * xy * z,
        SH_C3[2] * y * (4.0 * zz - xx - yy),
        SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy),
        SH_C3[4] * x * (4.0 * zz - xx - yy),
        SH_C3[5] * z * (xx - yy),
        SH_C3[6] * x * (xx - 3.0 * yy),
    ]);
    basis
}

/// Radiance before the `+0.5` offset and clamp, evaluated with `basis`.
///
/// Terms beyond `basis.len()` are ignored, so a model with a higher maximum
/// degree can be evaluated at a lower active degree.
pub fn eval_sh(basis: &[f32], dc: &Vector3<f32>, rest: &[f32]) -> Vector3<f32> {
    let mut color = dc * basis[0];
    for (k, b) in basis.iter().enumerate().skip(1) {
        let offset = (k - 1) * 3;
        if offset + 3 > rest.len() {
            break;
        }
        color += Vector3::new(rest[offset], rest[offset + 1], rest[offset + 2]) * *b;
    }
    color
}

/// Final colour of a primitive seen along `dir`: `max(sh + 0.5, 0)`.
///
/// The second value flags the channels that were clamped, which receive no gradient.
pub fn sh_to_color(
    degree: usize,
    dir: &Vector3<f32>,
    dc: &Vector3<f32>,
    rest: &[f32],
) -> (Vector3<f32>, [bool; 3]) {
    let basis = sh_basis(degree, dir);
    let raw = eval_sh(&basis, dc, rest) + Vector3::repeat(0.5);
    let clamped = [raw.x < 0.0, raw.y < 0.0, raw.z < 0.0];
    (raw.map(|v| v.max(0.0)), clamped)
}

/// Scatters a colour gradient onto the SH coefficients.
pub fn sh_backward(
    basis: &[f32],
    dcolor: &Vector3<f32>,
    ddc: &mut [f32],
    drest: &mut [f32],
) {
    for c in 0..3 {
        ddc[c] += basis[0] * dcolor[c];
    }
    for (k, b) in basis.iter().enumerate().skip(1) {
        let offset = (k - 1) * 3;
        if offset + 3 > drest.len() {
            break;
        }
        for c in 0..3 {
            drest[offset + c] += b * dcolor[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basis_lengths() {
        let dir = Vector3::new(0.0, 0.0, 1.0);
        for d in 0..=3 {
            assert_eq!(sh_basis(d, &dir).len(), sh_coeff_count(d));
        }
        assert_eq!(sh_basis(7, &dir).len(), 16);
    }

    #[test]
    fn test_dc_only_colour() {
        let dir = Vector3::new(1.0, 0.0, 0.0);
        let dc = Vector3::new(1.0, 0.0, -10.0);
        let (color, clamped) = sh_to_color(0, &dir, &dc, &[]);
        assert!((color.x - (SH_C0 + 0.5)).abs() < 1e-6);
        assert!((color.y - 0.5).abs() < 1e-6);
        assert_eq!(color.z, 0.0);
        assert_eq!(clamped, [false, false, true]);
    }

    #[test]
    fn test_active_degree_ignores_higher_terms() {
        let dir = Vector3::new(0.0, 1.0, 0.0);
        let dc = Vector3::zeros();
        let rest = vec![1.0; 45];
        let (c0, _) = sh_to_color(0, &dir, &dc, &rest);
        let (c1, _) = sh_to_color(1, &dir, &dc, &rest);
        assert!((c0.x - 0.5).abs() < 1e-6);
        // only the y-aligned degree-1 term is non-zero for this direction
        assert!((c1.x - (0.5 - SH_C1)).abs() < 1e-6);
    }

    #[test]
    fn test_backward_matches_basis() {
        let dir = Vector3::new(0.6, 0.0, 0.8);
        let basis = sh_basis(2, &dir);
        let mut ddc = [0.0; 3];
        let mut drest = vec![0.0; 45];
        sh_backward(&basis, &Vector3::new(1.0, 2.0, 0.0), &mut ddc, &mut drest);
        assert!((ddc[1] - 2.0 * SH_C0).abs() < 1e-6);
        assert!((drest[(2 - 1) * 3] - basis[2]).abs() < 1e-6);
        assert_eq!(drest[(2 - 1) * 3 + 2], 0.0);
        // degree-3 slots stay zero
        assert!(drest[24..].iter().all(|&v| v == 0.0));
    }
}
