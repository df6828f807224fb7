//! Composites reconstructed from their daughters: vertex seeding, momentum
//! conservation and photon conversions.

use nalgebra::{Vector3, Vector4};
use tracing::debug;

use super::{Node, NodeId, Role, RoleKind, Tree};
use crate::error::ErrCode;
use crate::fit_params::FitParams;
use crate::helix::{helix_poca, line_poca};
use crate::projection::Projection;

/// Bending corrections smaller than this displacement (cm) are skipped.
const BENDING_PRECISION: f64 = 1e-4;

impl Tree {
    /// Seeds a composite with its own vertex: daughters first, then the
    /// vertex, then the daughters that need the vertex, then the momentum.
    pub(super) fn init_internal(&mut self, id: NodeId, fp: &mut FitParams) -> ErrCode {
        let Some(pos) = self.nodes[id.0].own_pos else {
            return ErrCode::BAD_SETUP;
        };
        fp.set_vector3(pos, &Vector3::zeros());

        let daughters = self.nodes[id.0].daughters.clone();
        let mut status = ErrCode::SUCCESS;
        for &d in &daughters {
            status |= self.init_par1(d, fp);
        }

        // A short-lived measured daughter may already have set the vertex
        if fp.is_zero_block(pos, 3) {
            status |= self.seed_vertex(id, pos, fp);
        }

        for &d in &daughters {
            status |= self.init_par2(d, fp);
        }
        self.init_mom(id, fp);
        status
    }

    /// Estimates a vertex: an existing one, the crossing of the two
    /// hardest tracks, the closest pair of straight trajectories, or the
    /// mother's vertex.
    fn seed_vertex(&mut self, id: NodeId, pos: usize, fp: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        if let Some(vertex) = node.seed_vertex.filter(|v| v.norm() > 0.0) {
            debug!("{}: using existing vertex {:?}", node.name, vertex.as_slice());
            fp.set_vector3(pos, &vertex);
            return ErrCode::SUCCESS;
        }

        let candidates = self.collect_vertex_daughters(id, pos);
        let mut tracks: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|d| self.nodes[d.0].kind() == RoleKind::Track)
            .collect();
        let vertexed: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|d| {
                self.nodes[d.0]
                    .own_pos
                    .is_some_and(|p| !fp.is_zero_block(p, 3))
            })
            .collect();

        let mut poca_failed = false;

        if tracks.len() >= 2 {
            let pt = |id: &NodeId| match &self.nodes[id.0].role {
                Role::Track(t) => t.transverse_momentum(),
                _ => 0.0,
            };
            tracks.sort_by(|a, b| pt(b).total_cmp(&pt(a)));

            let helices = match (&self.nodes[tracks[0].0].role, &self.nodes[tracks[1].0].role) {
                (Role::Track(first), Role::Track(second)) => Some((*first.helix(), *second.helix())),
                _ => None,
            };
            if let Some((first, second)) = helices {
                match helix_poca(&first, &second) {
                    Some((s1, s2, vertex)) => {
                        fp.set_vector3(pos, &vertex);
                        self.set_flight_length(tracks[0], s1);
                        self.set_flight_length(tracks[1], s2);
                        return ErrCode::SUCCESS;
                    }
                    None => {
                        debug!("{}: no helix crossing for the two hardest tracks", self.nodes[id.0].name);
                        poca_failed = true;
                    }
                }
            }
        }

        if tracks.len() + vertexed.len() >= 2 {
            let lines: Vec<(Vector3<f64>, Vector3<f64>)> = tracks
                .iter()
                .filter_map(|d| match &self.nodes[d.0].role {
                    Role::Track(t) => Some(t.trajectory_point()),
                    _ => None,
                })
                .chain(vertexed.iter().filter_map(|d| {
                    let n = &self.nodes[d.0];
                    Some((fp.vector3(n.own_pos?), fp.vector3(n.mom_index?)))
                }))
                .collect();

            let mut best: Option<(f64, Vector3<f64>)> = None;
            for i in 0..lines.len() {
                for j in 0..i {
                    let (p1, d1) = &lines[i];
                    let (p2, d2) = &lines[j];
                    if let Some((_, _, mid, doca)) = line_poca(p1, d1, p2, d2) {
                        if best.map_or(true, |(b, _)| doca < b) {
                            best = Some((doca, mid));
                        }
                    }
                }
            }
            match best {
                Some((_, vertex)) => {
                    fp.set_vector3(pos, &vertex);
                    return ErrCode::SUCCESS;
                }
                None => poca_failed = true,
            }
        }

        let node = &self.nodes[id.0];
        if let Some(mother_pos) = node.parent.and_then(|m| self.nodes[m.0].pos_index) {
            let vertex = fp.vector3(mother_pos);
            fp.set_vector3(pos, &vertex);
            return ErrCode::SUCCESS;
        }

        debug!(
            "{}: not enough trajectories to seed the vertex; a beam constraint may help",
            node.name
        );
        let status = ErrCode::BAD_SETUP;
        if poca_failed {
            status | ErrCode::POCA_FAILURE
        } else {
            status
        }
    }

    fn set_flight_length(&mut self, id: NodeId, flight_length: f64) {
        if let Role::Track(track) = &mut self.nodes[id.0].role {
            track.set_flight_length(flight_length);
        }
    }

    /// Daughters attached to the vertex at `pos`, looking through
    /// short-lived daughters that share it.
    fn collect_vertex_daughters(&self, id: NodeId, pos: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        for &d in &self.nodes[id.0].daughters {
            out.push(d);
            let daughter = &self.nodes[d.0];
            if daughter.own_pos.is_none()
                && daughter.pos_index == Some(pos)
                && !daughter.daughters.is_empty()
            {
                out.extend(self.collect_vertex_daughters(d, pos));
            }
        }
        out
    }

    /// Sets the four-momentum to the sum of the daughters'.
    pub(super) fn init_mom(&self, id: NodeId, fp: &mut FitParams) {
        let node = &self.nodes[id.0];
        let Some(mom) = node.mom_index else {
            return;
        };
        let sum: Vector4<f64> = node
            .daughters
            .iter()
            .filter_map(|d| self.nodes[d.0].four_momentum(fp))
            .sum();
        for i in 0..4 {
            fp.state_mut()[mom + i] = sum[i];
        }
    }

    /// Momentum conservation at the vertex: `p_mother − Σ p_daughter = 0`.
    ///
    /// Daughters with a three-momentum contribute `E = sqrt(p² + m²)`.
    /// Charged daughters with a flight parameter carry their momentum at
    /// their decay vertex; it is turned back to the production vertex.
    pub(super) fn project_kinematic(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let Some(mom) = node.mom_index else {
            return ErrCode::BAD_SETUP;
        };
        for i in 0..4 {
            p.r[i] = fp.par(mom + i);
            p.h[(i, mom + i)] = 1.0;
        }

        for &d in &node.daughters {
            let daughter = &self.nodes[d.0];
            let Some(dmom) = daughter.mom_index else {
                return ErrCode::BAD_SETUP;
            };

            if !daughter.has_energy() {
                let p3 = fp.vector3(dmom);
                let energy = (p3.norm_squared() + daughter.mass * daughter.mass).sqrt();
                for i in 0..3 {
                    p.r[i] -= p3[i];
                    p.h[(i, dmom + i)] = -1.0;
                    p.h[(3, dmom + i)] = -p3[i] / energy;
                }
                p.r[3] -= energy;
                continue;
            }

            for i in 0..4 {
                p.r[i] -= fp.par(dmom + i);
                p.h[(i, dmom + i)] = -1.0;
            }

            let Some(tau_index) = daughter.tau_index else {
                continue;
            };
            let lambda = daughter.bending;
            if lambda == 0.0 {
                continue;
            }
            let tau = fp.par(tau_index);
            let (px0, py0) = (fp.par(dmom), fp.par(dmom + 1));
            let pt0 = px0.hypot(py0);
            if (pt0 * lambda * tau * tau).abs() <= BENDING_PRECISION {
                continue;
            }

            let (sin, cos) = (lambda * tau).sin_cos();
            let px = px0 * cos - py0 * sin;
            let py = py0 * cos + px0 * sin;
            p.r[0] += px0 - px;
            p.r[1] += py0 - py;
            p.h[(0, dmom)] += 1.0 - cos;
            p.h[(0, dmom + 1)] += sin;
            p.h[(0, tau_index)] += lambda * py;
            p.h[(1, dmom)] += -sin;
            p.h[(1, dmom + 1)] += 1.0 - cos;
            p.h[(1, tau_index)] += -lambda * px;
        }
        ErrCode::SUCCESS
    }

    /// Photon conversion: both daughter momenta parallel,
    /// `p1·p2 − |p1||p2| = 0`.
    pub(super) fn project_conversion(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let [a, b] = node.daughters.as_slice() else {
            return ErrCode::BAD_SETUP;
        };
        let (Some(ia), Some(ib)) = (self.nodes[a.0].mom_index, self.nodes[b.0].mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        let pa = fp.vector3(ia);
        let pb = fp.vector3(ib);
        let (na, nb) = (pa.norm(), pb.norm());
        if na == 0.0 || nb == 0.0 {
            return ErrCode::FILTER_ERROR;
        }

        p.r[0] = pa.dot(&pb) - na * nb;
        for i in 0..3 {
            p.h[(0, ia + i)] = pb[i] - pa[i] / na * nb;
            p.h[(0, ib + i)] = pa[i] - pb[i] / nb * na;
        }
        ErrCode::SUCCESS
    }

    /// Makes every composite's four-momentum equal to the sum of its
    /// daughters', deepest vertices first.
    pub fn force_p4_sum(&self, fp: &mut FitParams) {
        self.force_p4_sum_from(self.root, fp);
    }

    fn force_p4_sum_from(&self, id: NodeId, fp: &mut FitParams) {
        let node = &self.nodes[id.0];
        for &d in &node.daughters {
            self.force_p4_sum_from(d, fp);
        }
        if !matches!(node.kind(), RoleKind::Internal | RoleKind::Resonance) {
            return;
        }
        let Some(mom) = node.mom_index else {
            return;
        };
        let mut p = Projection::new(fp.dim(), 4);
        if self.project_kinematic(node, fp, &mut p).is_success() {
            for i in 0..4 {
                fp.state_mut()[mom + i] -= p.r[i];
            }
        }
    }
}
