//! Helix track parametrisation in a solenoidal field.
//!
//! A charged particle in a field `B ẑ` moves on a helix. Its perigee
//! parameters with respect to the origin are
//!
//! ```text
//!   d0         signed transverse distance of closest approach   [cm]
//!   phi0       momentum azimuth at the point of closest approach
//!   omega      signed curvature  a·B·q / pt                      [1/cm]
//!   z0         z at the point of closest approach                [cm]
//!   tan_lambda pz / pt
//! ```
//!
//! The point of closest approach is `(d0 sin phi0, −d0 cos phi0, z0)`. With
//! `omega > 0` the particle turns clockwise seen from +z; the azimuth after a
//! transverse arc length `s` is `phi0 − omega·s`.
//!
//! All functions take the bending constant `kappa = a·B·q` (GeV/cm) rather
//! than field and charge separately.

use nalgebra::{SMatrix, Vector2, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Jacobian of the helix parameters with respect to (x, y, z, px, py, pz).
pub type HelixJacobian = SMatrix<f64, 5, 6>;

/// Perigee helix parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Helix {
    pub d0: f64,
    pub phi0: f64,
    pub omega: f64,
    pub z0: f64,
    pub tan_lambda: f64,
}

/// Wraps an angle into (−π, π].
pub fn wrap_angle(phi: f64) -> f64 {
    let mut wrapped = phi % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

impl Helix {
    pub fn new(d0: f64, phi0: f64, omega: f64, z0: f64, tan_lambda: f64) -> Self {
        Self { d0, phi0, omega, z0, tan_lambda }
    }

    /// Parameters as `[d0, phi0, omega, z0, tan_lambda]`.
    pub fn to_vector(&self) -> Vector5<f64> {
        Vector5::new(self.d0, self.phi0, self.omega, self.z0, self.tan_lambda)
    }

    pub fn from_vector(v: &Vector5<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4])
    }

    /// Helix through `position` with `momentum` there.
    pub fn from_vertex(position: &Vector3<f64>, momentum: &Vector3<f64>, kappa: f64) -> Self {
        helix_from_vertex(position, momentum, kappa).0
    }

    /// Signed radius of curvature.
    pub fn radius(&self) -> f64 {
        1.0 / self.omega
    }

    /// Centre of the transverse circle.
    pub fn center(&self) -> Vector2<f64> {
        let scale = self.d0 + self.radius();
        Vector2::new(scale * self.phi0.sin(), -scale * self.phi0.cos())
    }

    /// Position after a transverse arc length `s` from the perigee.
    pub fn position_at(&self, s: f64) -> Vector3<f64> {
        let (sin0, cos0) = self.phi0.sin_cos();
        let phi = self.phi0 - self.omega * s;
        let x0 = self.d0 * sin0;
        let y0 = -self.d0 * cos0;
        Vector3::new(
            x0 + (sin0 - phi.sin()) / self.omega,
            y0 + (phi.cos() - cos0) / self.omega,
            self.z0 + s * self.tan_lambda,
        )
    }

    /// Transverse momentum for the given bending constant.
    pub fn transverse_momentum(&self, kappa: f64) -> f64 {
        (kappa / self.omega).abs()
    }

    /// Momentum after a transverse arc length `s` from the perigee.
    pub fn momentum_at(&self, s: f64, kappa: f64) -> Vector3<f64> {
        let pt = self.transverse_momentum(kappa);
        let phi = self.phi0 - self.omega * s;
        Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * self.tan_lambda)
    }

    /// Transverse arc length from the perigee to the point of the circle
    /// nearest to `(x, y)`, within half a turn.
    pub fn arc_length_to(&self, x: f64, y: f64) -> f64 {
        let c = self.center();
        let sign = self.omega.signum();
        let phi = f64::atan2(-(x - c.x) * sign, (y - c.y) * sign);
        wrap_angle(self.phi0 - phi) / self.omega
    }
}

/// Computes the helix through a vertex, the arc length from the perigee to
/// that vertex and the Jacobian `∂(helix)/∂(x, y, z, px, py, pz)`.
pub fn helix_from_vertex(
    position: &Vector3<f64>,
    momentum: &Vector3<f64>,
    kappa: f64,
) -> (Helix, f64, HelixJacobian) {
    let (x, y, z) = (position.x, position.y, position.z);
    let (px, py, pz) = (momentum.x, momentum.y, momentum.z);

    let pt2 = px * px + py * py;
    let pt = pt2.sqrt();
    let pt3 = pt2 * pt;
    let sign = kappa.signum();

    // Centre of the transverse circle is linear in the inputs
    let cx = x + py / kappa;
    let cy = y - px / kappa;
    let rc2 = cx * cx + cy * cy;
    let rc = rc2.sqrt();

    let phi = py.atan2(px);
    let phi0 = f64::atan2(sign * cx, -sign * cy);
    let dphi = wrap_angle(phi0 - phi);

    let omega = kappa / pt;
    let d0 = sign * rc - pt / kappa;
    let tan_lambda = pz / pt;
    let s = dphi / omega;
    let z0 = z - dphi * pz / kappa;

    let helix = Helix::new(d0, phi0, omega, z0, tan_lambda);

    // Partial derivatives of phi0 and phi
    let dphi0_dx = -cy / rc2;
    let dphi0_dy = cx / rc2;
    let dphi0_dpx = -cx / (rc2 * kappa);
    let dphi0_dpy = -cy / (rc2 * kappa);
    let dphi_dpx = -py / pt2;
    let dphi_dpy = px / pt2;

    let mut jacobian = HelixJacobian::zeros();

    // d0
    jacobian[(0, 0)] = sign * cx / rc;
    jacobian[(0, 1)] = sign * cy / rc;
    jacobian[(0, 3)] = -sign * cy / (rc * kappa) - px / (pt * kappa);
    jacobian[(0, 4)] = sign * cx / (rc * kappa) - py / (pt * kappa);

    // phi0
    jacobian[(1, 0)] = dphi0_dx;
    jacobian[(1, 1)] = dphi0_dy;
    jacobian[(1, 3)] = dphi0_dpx;
    jacobian[(1, 4)] = dphi0_dpy;

    // omega
    jacobian[(2, 3)] = -kappa * px / pt3;
    jacobian[(2, 4)] = -kappa * py / pt3;

    // z0
    let lever = -pz / kappa;
    jacobian[(3, 0)] = lever * dphi0_dx;
    jacobian[(3, 1)] = lever * dphi0_dy;
    jacobian[(3, 2)] = 1.0;
    jacobian[(3, 3)] = lever * (dphi0_dpx - dphi_dpx);
    jacobian[(3, 4)] = lever * (dphi0_dpy - dphi_dpy);
    jacobian[(3, 5)] = -dphi / kappa;

    // tan_lambda
    jacobian[(4, 3)] = -pz * px / pt3;
    jacobian[(4, 4)] = -pz * py / pt3;
    jacobian[(4, 5)] = 1.0 / pt;

    (helix, s, jacobian)
}

/// Point of closest approach of two helices.
///
/// Returns the arc lengths on both helices and the midpoint between the two
/// closest points, or `None` if the transverse circles are concentric.
pub fn helix_poca(first: &Helix, second: &Helix) -> Option<(f64, f64, Vector3<f64>)> {
    let c1 = first.center();
    let c2 = second.center();
    let r1 = first.radius().abs();
    let r2 = second.radius().abs();

    let delta = c2 - c1;
    let d = delta.norm();
    if !d.is_finite() || d < 1e-12 {
        return None;
    }
    let u = delta / d;

    let candidates: Vec<Vector2<f64>> = if d > r1 + r2 {
        // Disjoint circles: closest points face each other
        vec![0.5 * ((c1 + u * r1) + (c2 - u * r2))]
    } else if d < (r1 - r2).abs() {
        // One circle inside the other
        let dir = if r1 > r2 { u } else { -u };
        vec![0.5 * ((c1 + dir * r1) + (c2 + dir * r2))]
    } else {
        let a = (d * d + r1 * r1 - r2 * r2) / (2.0 * d);
        let h = (r1 * r1 - a * a).max(0.0).sqrt();
        let base = c1 + u * a;
        let perp = Vector2::new(-u.y, u.x);
        vec![base + perp * h, base - perp * h]
    };

    candidates
        .into_iter()
        .map(|xy| {
            let s1 = first.arc_length_to(xy.x, xy.y);
            let s2 = second.arc_length_to(xy.x, xy.y);
            let p1 = first.position_at(s1);
            let p2 = second.position_at(s2);
            (s1, s2, p1, p2)
        })
        .min_by(|a, b| {
            let dz_a = (a.2.z - a.3.z).abs();
            let dz_b = (b.2.z - b.3.z).abs();
            dz_a.total_cmp(&dz_b)
        })
        .map(|(s1, s2, p1, p2)| (s1, s2, 0.5 * (p1 + p2)))
}

/// Point of closest approach of two straight lines `p + t·d`.
///
/// Returns both line parameters, the midpoint of the closest points and
/// their distance, or `None` for parallel lines.
pub fn line_poca(
    p1: &Vector3<f64>,
    d1: &Vector3<f64>,
    p2: &Vector3<f64>,
    d2: &Vector3<f64>,
) -> Option<(f64, f64, Vector3<f64>, f64)> {
    let w0 = p1 - p2;
    let a = d1.dot(d1);
    let b = d1.dot(d2);
    let c = d2.dot(d2);
    let d = d1.dot(&w0);
    let e = d2.dot(&w0);

    let denom = a * c - b * b;
    if denom <= 1e-12 * a * c || a == 0.0 || c == 0.0 {
        return None;
    }

    let t1 = (b * e - c * d) / denom;
    let t2 = (a * e - b * d) / denom;
    let q1 = p1 + d1 * t1;
    let q2 = p2 + d2 * t2;
    Some((t1, t2, 0.5 * (q1 + q2), (q1 - q2).norm()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Same as [`helix_from_vertex`] with a central-difference Jacobian.
    fn helix_from_vertex_numerical(
        position: &Vector3<f64>,
        momentum: &Vector3<f64>,
        kappa: f64,
    ) -> (Helix, f64, HelixJacobian) {
        let (helix, s, _) = helix_from_vertex(position, momentum, kappa);

        let mut jacobian = HelixJacobian::zeros();
        for col in 0..6 {
            let mut pos_up = *position;
            let mut pos_down = *position;
            let mut mom_up = *momentum;
            let mut mom_down = *momentum;
            let step = if col < 3 {
                let h = 1e-6 * position[col].abs().max(1e-2);
                pos_up[col] += h;
                pos_down[col] -= h;
                h
            } else {
                let h = 1e-6 * momentum[col - 3].abs().max(1e-2);
                mom_up[col - 3] += h;
                mom_down[col - 3] -= h;
                h
            };

            let up = helix_from_vertex(&pos_up, &mom_up, kappa).0.to_vector();
            let down = helix_from_vertex(&pos_down, &mom_down, kappa).0.to_vector();
            let mut diff = up - down;
            diff[1] = wrap_angle(diff[1]);
            jacobian.set_column(col, &(diff / (2.0 * step)));
        }

        (helix, s, jacobian)
    }

    const KAPPA: f64 = 0.00299792458 * 1.5;

    #[test]
    fn test_track_from_origin_has_zero_impact() {
        let helix = Helix::from_vertex(&Vector3::zeros(), &Vector3::new(1.0, 0.0, 0.5), KAPPA);

        assert_relative_eq!(helix.d0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(helix.phi0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(helix.z0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(helix.tan_lambda, 0.5, epsilon = 1e-12);
        assert_relative_eq!(helix.omega, KAPPA, epsilon = 1e-15);
    }

    #[test]
    fn test_positive_track_turns_clockwise() {
        let helix = Helix::from_vertex(&Vector3::zeros(), &Vector3::new(1.0, 0.0, 0.0), KAPPA);
        let p = helix.position_at(10.0);
        assert!(p.x > 0.0);
        assert!(p.y < 0.0);

        let mom = helix.momentum_at(10.0, KAPPA);
        assert!(mom.y < 0.0);
        assert_relative_eq!(mom.xy().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vertex_round_trip() {
        let vertex = Vector3::new(0.3, -0.2, 1.1);
        let momentum = Vector3::new(-0.4, 0.9, 0.3);

        for kappa in [KAPPA, -KAPPA] {
            let (helix, s, _) = helix_from_vertex(&vertex, &momentum, kappa);
            let back = helix.position_at(s);
            let mom = helix.momentum_at(s, kappa);

            assert_relative_eq!(back, vertex, epsilon = 1e-9);
            assert_relative_eq!(mom, momentum, epsilon = 1e-9);
            assert_relative_eq!(helix.arc_length_to(vertex.x, vertex.y), s, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_analytic_jacobian_matches_numerical() {
        let vertex = Vector3::new(0.25, 0.4, -0.7);
        let momentum = Vector3::new(0.8, 0.35, -0.2);

        for kappa in [KAPPA, -KAPPA] {
            let (_, _, analytic) = helix_from_vertex(&vertex, &momentum, kappa);
            let (_, _, numerical) = helix_from_vertex_numerical(&vertex, &momentum, kappa);

            for row in 0..5 {
                for col in 0..6 {
                    let a = analytic[(row, col)];
                    let n = numerical[(row, col)];
                    assert!(
                        (a - n).abs() < 1e-5 * (1.0 + a.abs()),
                        "d(h{})/d(x{}) analytic {} numerical {}",
                        row,
                        col,
                        a,
                        n
                    );
                }
            }
        }
    }

    #[test]
    fn test_helix_poca_finds_common_vertex() {
        let vertex = Vector3::new(0.5, -0.3, 0.8);
        let h1 = Helix::from_vertex(&vertex, &Vector3::new(0.7, 0.4, 0.2), KAPPA);
        let h2 = Helix::from_vertex(&vertex, &Vector3::new(-0.2, 0.9, -0.1), -KAPPA);

        let (s1, s2, poca) = helix_poca(&h1, &h2).unwrap();
        assert_relative_eq!(poca, vertex, epsilon = 1e-8);
        assert_relative_eq!(h1.position_at(s1), vertex, epsilon = 1e-8);
        assert_relative_eq!(h2.position_at(s2), vertex, epsilon = 1e-8);
    }

    #[test]
    fn test_line_poca() {
        let (t1, t2, mid, doca) = line_poca(
            &Vector3::new(0.0, 0.0, 0.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &Vector3::new(2.0, -1.0, 1.0),
            &Vector3::new(0.0, 1.0, 0.0),
        )
        .unwrap();

        assert_relative_eq!(t1, 2.0, epsilon = 1e-12);
        assert_relative_eq!(t2, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mid, Vector3::new(2.0, 0.0, 0.5), epsilon = 1e-12);
        assert_relative_eq!(doca, 1.0, epsilon = 1e-12);

        let parallel = line_poca(
            &Vector3::zeros(),
            &Vector3::x(),
            &Vector3::y(),
            &Vector3::x(),
        );
        assert!(parallel.is_none());
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(0.1), 0.1, epsilon = 1e-12);
    }
}
