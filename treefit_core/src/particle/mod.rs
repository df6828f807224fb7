//! Nodes of the decay tree and the arena that holds them.
//!
//! Each reconstructed particle becomes one [`Node`] with a closed set of
//! roles:
//!
//! | Role | Own parameters | Constraints |
//! |------|----------------|-------------|
//! | Origin | x(3) | beamspot / origin |
//! | Internal | x(3), tau(1) if it has a mother, p(4) | kinematic, geometric, mass, lifetime, conversion |
//! | Resonance | p(4), vertex of the mother | kinematic, mass |
//! | Measured | x(3), tau, p(4) or p(4) only | composite / resonance, geometric, mass, lifetime |
//! | Track | p(3), vertex of the mother | track |
//! | Photon | p(3), vertex of the mother | photon |
//! | Klong | p(3), vertex of the mother | klong |
//!
//! Parameters are laid out daughters first, so a node's block always follows
//! the blocks of its whole subtree.

mod cluster;
mod composite;
mod measured;
mod origin;
mod track;

pub use cluster::{KlongNode, PhotonNode};
pub use measured::MeasuredNode;
pub use origin::OriginNode;
pub use track::TrackNode;

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::debug;
use treefit_env::{BeamKinematics, DetectorContext, EnvError, PdgCode};

use crate::candidate::{Measurement, Particle};
use crate::config::FitConfig;
use crate::constraint::{Constraint, ConstraintType, Projector};
use crate::error::{ErrCode, FitError};
use crate::fit_params::FitParams;
use crate::projection::Projection;

/// Particles with a shorter decay length (cm) share their mother's vertex.
pub const RESONANCE_CTAU: f64 = 1e-4;

/// Initial variance of a vertex coordinate (cm²).
const POSITION_PRIOR: f64 = 400.0;

/// Initial variance of a momentum or energy component (GeV²).
const MOMENTUM_PRIOR: f64 = 100.0;

/// Initial variance of a flight parameter ((cm/GeV)²).
const TAU_PRIOR: f64 = 1000.0;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Role of a node without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Origin,
    Internal,
    Resonance,
    Measured,
    Track,
    Photon,
    Klong,
}

/// Role of a node and the measurement it carries.
#[derive(Debug, Clone)]
pub enum Role {
    Origin(OriginNode),
    /// Composite with its own decay vertex
    Internal { conversion: bool },
    /// Composite decaying at its production vertex
    Resonance,
    Measured(MeasuredNode),
    Track(TrackNode),
    Photon(PhotonNode),
    Klong(KlongNode),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Origin(_) => RoleKind::Origin,
            Role::Internal { .. } => RoleKind::Internal,
            Role::Resonance => RoleKind::Resonance,
            Role::Measured(_) => RoleKind::Measured,
            Role::Track(_) => RoleKind::Track,
            Role::Photon(_) => RoleKind::Photon,
            Role::Klong(_) => RoleKind::Klong,
        }
    }
}

/// Which parameter blocks a node owns.
#[derive(Debug, Clone, Copy)]
struct Layout {
    position: bool,
    tau: bool,
    momentum: usize,
}

/// One particle of the decay tree.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    pdg: PdgCode,
    name: String,
    mass: f64,
    ctau: f64,
    charge: f64,
    /// Bending constant `a·B·q` in GeV/cm
    bending: f64,
    parent: Option<NodeId>,
    daughters: Vec<NodeId>,
    depth: usize,
    /// Daughter indices leading from the head candidate to this particle
    path: Option<Vec<usize>>,
    layout: Layout,
    own_pos: Option<usize>,
    pos_index: Option<usize>,
    tau_index: Option<usize>,
    mom_index: Option<usize>,
    mass_constraint: bool,
    lifetime_constraint: bool,
    seed_vertex: Option<Vector3<f64>>,
    role: Role,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn pdg(&self) -> PdgCode {
        self.pdg
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal mass in GeV.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn charge(&self) -> f64 {
        self.charge
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn daughters(&self) -> &[NodeId] {
        &self.daughters
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Path of daughter indices from the head candidate; `None` for the
    /// origin.
    pub fn candidate_path(&self) -> Option<&[usize]> {
        self.path.as_deref()
    }

    /// Start of the vertex this node decays at (own) or is produced at
    /// (shared with an ancestor).
    pub fn pos_index(&self) -> Option<usize> {
        self.pos_index
    }

    /// Returns true if the node owns its vertex parameters.
    pub fn has_own_position(&self) -> bool {
        self.own_pos.is_some()
    }

    pub fn tau_index(&self) -> Option<usize> {
        self.tau_index
    }

    pub fn mom_index(&self) -> Option<usize> {
        self.mom_index
    }

    /// Returns true if the momentum block includes the energy.
    pub fn has_energy(&self) -> bool {
        self.layout.momentum == 4
    }

    /// Expected flight parameter `cτ/m` in cm/GeV.
    pub fn nominal_tau(&self) -> f64 {
        self.ctau / self.mass
    }

    fn n_params(&self) -> usize {
        3 * usize::from(self.layout.position) + usize::from(self.layout.tau) + self.layout.momentum
    }

    /// Four-momentum at the current state, computing the energy of
    /// three-momentum nodes from the nominal mass.
    pub fn four_momentum(&self, fp: &FitParams) -> Option<Vector4<f64>> {
        let mom = self.mom_index?;
        let p = fp.vector3(mom);
        let energy = if self.has_energy() {
            fp.par(mom + 3)
        } else {
            (p.norm_squared() + self.mass * self.mass).sqrt()
        };
        Some(Vector4::new(p.x, p.y, p.z, energy))
    }
}

/// Arena of decay-tree nodes with the parameter bookkeeping.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    head: NodeId,
    dim: usize,
    beam: Option<BeamKinematics>,
}

impl Tree {
    /// Builds the tree for `candidate`, adding an origin node above it when a
    /// beam constraint is configured.
    pub fn build(
        candidate: &Particle,
        ctx: &dyn DetectorContext,
        config: &FitConfig,
    ) -> Result<Self, FitError> {
        if candidate.is_final_state() {
            return Err(FitError::bad_setup("head of the decay tree must be a composite"));
        }

        let mut tree = Tree {
            nodes: Vec::new(),
            root: NodeId(0),
            head: NodeId(0),
            dim: 0,
            beam: None,
        };

        match OriginNode::from_config(&config.beam_constraint, ctx.beam_spot()) {
            Some(origin) => {
                let root = tree.push_origin(origin);
                let head = tree.add_subtree(candidate, Some(root), 1, Vec::new(), ctx, config)?;
                tree.nodes[root.0].daughters.push(head);
                tree.root = root;
                tree.head = head;
            }
            None => {
                let head = tree.add_subtree(candidate, None, 0, Vec::new(), ctx, config)?;
                tree.root = head;
                tree.head = head;
            }
        }

        if config.beam_energy_constraint {
            tree.beam = Some(ctx.beam_kinematics().clone());
        }

        let mut next = 0;
        tree.assign_own_indices(tree.root, &mut next);
        tree.dim = next;
        tree.assign_pos_indices(tree.root, None);

        debug!(
            "built decay tree for {}: {} nodes, {} parameters",
            candidate.pdg,
            tree.nodes.len(),
            tree.dim
        );
        Ok(tree)
    }

    fn push_origin(&mut self, origin: OriginNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            pdg: PdgCode(0),
            name: "origin".to_string(),
            mass: 0.0,
            ctau: 0.0,
            charge: 0.0,
            bending: 0.0,
            parent: None,
            daughters: Vec::new(),
            depth: 0,
            path: None,
            layout: Layout { position: true, tau: false, momentum: 0 },
            own_pos: None,
            pos_index: None,
            tau_index: None,
            mom_index: None,
            mass_constraint: false,
            lifetime_constraint: false,
            seed_vertex: None,
            role: Role::Origin(origin),
        });
        id
    }

    fn add_subtree(
        &mut self,
        candidate: &Particle,
        parent: Option<NodeId>,
        depth: usize,
        path: Vec<usize>,
        ctx: &dyn DetectorContext,
        config: &FitConfig,
    ) -> Result<NodeId, FitError> {
        let props = ctx.particle(candidate.pdg).map_err(|e| match e {
            EnvError::UnknownParticle(code) => FitError::UnknownParticle(code),
            other => FitError::from(other),
        })?;
        let charge = f64::from(props.charge);
        let short_lived = parent.is_some() && props.ctau < RESONANCE_CTAU;
        let measured = matches!(candidate.measurement, Measurement::Composite { .. });

        let role = if candidate.is_final_state() || (measured && !config.force_fit_all) {
            match &candidate.measurement {
                Measurement::Track { helix, covariance } => {
                    if props.charge == 0 {
                        return Err(FitError::bad_setup(format!(
                            "track hypothesis {} is neutral",
                            props.name
                        )));
                    }
                    Role::Track(TrackNode::new(*helix, *covariance, ctx.bending_constant(charge)))
                }
                Measurement::Photon { position, energy, covariance } => {
                    Role::Photon(PhotonNode::new(*position, *energy, *covariance))
                }
                Measurement::Klong { position, covariance } => Role::Klong(KlongNode::new(
                    *position,
                    *covariance,
                    candidate.momentum.fixed_rows::<3>(0).norm(),
                )),
                Measurement::Composite { params, covariance } => {
                    Role::Measured(MeasuredNode::new(*params, *covariance, !short_lived))
                }
                Measurement::None => {
                    return Err(FitError::bad_setup(format!(
                        "final-state {} has no measurement",
                        props.name
                    )))
                }
            }
        } else if short_lived {
            Role::Resonance
        } else {
            Role::Internal { conversion: false }
        };

        let layout = match &role {
            Role::Origin(_) => Layout { position: true, tau: false, momentum: 0 },
            Role::Internal { .. } => Layout { position: true, tau: parent.is_some(), momentum: 4 },
            Role::Resonance => Layout { position: false, tau: false, momentum: 4 },
            Role::Measured(m) => Layout {
                position: m.has_position(),
                tau: m.has_position() && parent.is_some(),
                momentum: 4,
            },
            Role::Track(_) | Role::Photon(_) | Role::Klong(_) => {
                Layout { position: false, tau: false, momentum: 3 }
            }
        };
        let expands = matches!(role, Role::Internal { .. } | Role::Resonance);

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            pdg: candidate.pdg,
            name: props.name.clone(),
            mass: props.mass,
            ctau: props.ctau,
            charge,
            bending: ctx.bending_constant(charge),
            parent,
            daughters: Vec::new(),
            depth,
            path: Some(path.clone()),
            layout,
            own_pos: None,
            pos_index: None,
            tau_index: None,
            mom_index: None,
            mass_constraint: candidate.mass_constraint,
            lifetime_constraint: candidate.lifetime_constraint,
            seed_vertex: candidate.vertex,
            role,
        });

        if expands {
            for (i, daughter) in candidate.daughters.iter().enumerate() {
                let mut daughter_path = path.clone();
                daughter_path.push(i);
                let did = self.add_subtree(daughter, Some(id), depth + 1, daughter_path, ctx, config)?;
                self.nodes[id.0].daughters.push(did);
            }
        }

        // Photon conversion: the mass hypothesis becomes a collinearity constraint
        let conversion = candidate.pdg == PdgCode::PHOTON
            && candidate.mass_constraint
            && self.nodes[id.0].daughters.len() == 2
            && self.nodes[id.0]
                .daughters
                .iter()
                .all(|d| self.nodes[d.0].kind() == RoleKind::Track);
        if let Role::Internal { conversion: flag } = &mut self.nodes[id.0].role {
            *flag = conversion;
        }

        Ok(id)
    }

    fn assign_own_indices(&mut self, id: NodeId, next: &mut usize) {
        let daughters = self.nodes[id.0].daughters.clone();
        for d in daughters {
            self.assign_own_indices(d, next);
        }

        let node = &mut self.nodes[id.0];
        let start = *next;
        let mut offset = start;
        if node.layout.position {
            node.own_pos = Some(offset);
            offset += 3;
        }
        if node.layout.tau {
            node.tau_index = Some(offset);
            offset += 1;
        }
        if node.layout.momentum > 0 {
            node.mom_index = Some(offset);
        }
        *next = start + node.n_params();
    }

    fn assign_pos_indices(&mut self, id: NodeId, parent_pos: Option<usize>) {
        let node = &mut self.nodes[id.0];
        node.pos_index = node.own_pos.or(parent_pos);
        let pos = node.pos_index;
        let daughters = node.daughters.clone();
        for d in daughters {
            self.assign_pos_indices(d, pos);
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top node: the origin if present, otherwise the head.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Node of the candidate the fit was built for.
    pub fn head(&self) -> NodeId {
        self.head
    }

    /// Size of the state vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Collects every constraint of the tree, daughters before mothers.
    pub fn constraints(&self, config: &FitConfig) -> Vec<Constraint> {
        let mut list = Vec::new();
        self.collect_constraints(self.root, &mut list);
        list.into_iter()
            .map(|c| {
                let c = c
                    .with_tolerance(config.dchisq_converged)
                    .with_trace(config.verbosity >= 3);
                match config.max_constraint_iterations {
                    Some(n) => c.with_max_iterations(n),
                    None => c,
                }
            })
            .collect()
    }

    fn collect_constraints(&self, id: NodeId, list: &mut Vec<Constraint>) {
        for &d in &self.nodes[id.0].daughters {
            self.collect_constraints(d, list);
        }
        list.extend(self.node_constraints(id));
    }

    /// Constraints requested by one node.
    pub fn node_constraints(&self, id: NodeId) -> Vec<Constraint> {
        let node = &self.nodes[id.0];
        let mut list = Vec::new();
        let mut push = |ctype: ConstraintType, dim: usize| {
            list.push(Constraint::new(ctype, id, -(node.depth as i32), dim));
        };
        let flies = node.parent.is_some() && node.tau_index.is_some();

        match &node.role {
            Role::Origin(origin) => push(origin.constraint_type(), origin.dim()),
            Role::Internal { conversion } => {
                if node.tau_index.is_some() && node.lifetime_constraint {
                    push(ConstraintType::Lifetime, 1);
                }
                push(ConstraintType::Kinematic, 4);
                if flies {
                    push(ConstraintType::Geometric, 3);
                }
                if node.mass_constraint {
                    if *conversion {
                        push(ConstraintType::Conversion, 1);
                    } else if id == self.head && self.beam.is_some() {
                        push(ConstraintType::MassEnergy, 1);
                    } else {
                        push(ConstraintType::Mass, 1);
                    }
                }
            }
            Role::Resonance => {
                push(ConstraintType::Kinematic, 4);
                if node.mass_constraint {
                    push(ConstraintType::Mass, 1);
                }
            }
            Role::Measured(measured) => {
                push(measured.constraint_type(), measured.dim());
                if flies {
                    push(ConstraintType::Geometric, 3);
                }
                if node.mass_constraint {
                    push(ConstraintType::Mass, 1);
                }
                if node.tau_index.is_some() && node.lifetime_constraint {
                    push(ConstraintType::Lifetime, 1);
                }
            }
            Role::Track(_) => push(ConstraintType::Track, 5),
            Role::Photon(_) => push(ConstraintType::Photon, 3),
            Role::Klong(_) => push(ConstraintType::Klong, 2),
        }

        if id == self.head && self.beam.is_some() && node.has_energy() {
            push(ConstraintType::Beamenergy, 4);
        }
        list
    }

    /// Chi-square of the measurements in the subtree of `id` at `fp`,
    /// ignoring exact constraints.
    pub fn node_chi_square(&self, id: NodeId, fp: &FitParams) -> f64 {
        let daughters: f64 = self.nodes[id.0]
            .daughters
            .iter()
            .map(|&d| self.node_chi_square(d, fp))
            .sum();

        let own: f64 = self
            .node_constraints(id)
            .iter()
            .filter_map(|c| {
                let mut p = Projection::new(fp.dim(), c.dim());
                if self.project_constraint(c, fp, &mut p).is_failure() || p.is_exact() {
                    return None;
                }
                let chol = p.v.clone().cholesky()?;
                Some(p.r.dot(&chol.solve(&p.r)))
            })
            .sum();

        daughters + own
    }

    /// Seeds the whole state vector.
    pub fn init_par(&mut self, fp: &mut FitParams) -> ErrCode {
        let root = self.root;
        let status = self.init_par1(root, fp) | self.init_par2(root, fp);
        debug!("initialised {} parameters: {}", fp.dim(), status);
        status
    }

    /// First initialisation step: everything that does not need the
    /// production vertex.
    fn init_par1(&mut self, id: NodeId, fp: &mut FitParams) -> ErrCode {
        match self.nodes[id.0].kind() {
            RoleKind::Origin => self.init_origin(id, fp),
            RoleKind::Internal => self.init_internal(id, fp),
            RoleKind::Resonance => {
                let mut status = ErrCode::SUCCESS;
                for d in self.nodes[id.0].daughters.clone() {
                    status |= self.init_par1(d, fp);
                }
                self.init_mom(id, fp);
                status
            }
            RoleKind::Measured => {
                let node = &self.nodes[id.0];
                match &node.role {
                    Role::Measured(m) => m.init_par(node, fp),
                    _ => ErrCode::BAD_SETUP,
                }
            }
            RoleKind::Track => {
                let node = &self.nodes[id.0];
                match &node.role {
                    Role::Track(t) => t.init_momentum(node, fp),
                    _ => ErrCode::BAD_SETUP,
                }
            }
            RoleKind::Photon | RoleKind::Klong => self.init_cluster(id, fp),
        }
    }

    /// Second initialisation step, run once the production vertex is known.
    fn init_par2(&mut self, id: NodeId, fp: &mut FitParams) -> ErrCode {
        match self.nodes[id.0].kind() {
            RoleKind::Origin => ErrCode::SUCCESS,
            RoleKind::Internal | RoleKind::Measured => {
                self.copy_mother_position(id, fp);
                self.init_tau(id, fp);
                ErrCode::SUCCESS
            }
            RoleKind::Resonance => {
                let mut status = ErrCode::SUCCESS;
                for d in self.nodes[id.0].daughters.clone() {
                    status |= self.init_par2(d, fp);
                }
                self.init_mom(id, fp);
                status
            }
            RoleKind::Track => {
                let vertex = self.nodes[id.0].pos_index.map(|pos| fp.vector3(pos));
                let node = &mut self.nodes[id.0];
                let Role::Track(track) = &mut node.role else {
                    return ErrCode::BAD_SETUP;
                };
                if track.flight_length() == 0.0 {
                    if let Some(vertex) = vertex {
                        track.update_flight_length(&vertex);
                    }
                }
                let node = &self.nodes[id.0];
                match &node.role {
                    Role::Track(t) => t.init_momentum(node, fp),
                    _ => ErrCode::BAD_SETUP,
                }
            }
            RoleKind::Photon | RoleKind::Klong => self.init_cluster(id, fp),
        }
    }

    fn init_cluster(&self, id: NodeId, fp: &mut FitParams) -> ErrCode {
        let node = &self.nodes[id.0];
        match &node.role {
            Role::Photon(photon) => photon.init_momentum(node, fp),
            Role::Klong(klong) => klong.init_momentum(node, fp),
            _ => ErrCode::BAD_SETUP,
        }
    }

    fn copy_mother_position(&self, id: NodeId, fp: &mut FitParams) {
        let node = &self.nodes[id.0];
        let (Some(pos), Some(parent)) = (node.own_pos, node.parent) else {
            return;
        };
        if let Some(mother_pos) = self.nodes[parent.0].pos_index {
            if fp.is_zero_block(pos, 3) {
                let vertex = fp.vector3(mother_pos);
                fp.set_vector3(pos, &vertex);
            }
        }
    }

    /// Sets the flight parameter from the separation of the production and
    /// decay vertices: `tau = Δx·p / |p|²`.
    fn init_tau(&self, id: NodeId, fp: &mut FitParams) {
        let node = &self.nodes[id.0];
        let (Some(tau), Some(pos), Some(mom), Some(parent)) =
            (node.tau_index, node.own_pos, node.mom_index, node.parent)
        else {
            return;
        };
        let Some(mother_pos) = self.nodes[parent.0].pos_index else {
            return;
        };
        let dx = fp.vector3(pos) - fp.vector3(mother_pos);
        let p = fp.vector3(mom);
        let p2 = p.norm_squared();
        fp.state_mut()[tau] = if p2 > 0.0 { dx.dot(&p) / p2 } else { 0.0 };
    }

    /// Sets the diagonal priors of every parameter.
    pub fn init_cov(&self, fp: &mut FitParams) {
        let cov = fp.covariance_mut();
        for node in &self.nodes {
            if let Some(pos) = node.own_pos {
                for i in 0..3 {
                    cov[(pos + i, pos + i)] = POSITION_PRIOR;
                }
            }
            if let Some(tau) = node.tau_index {
                cov[(tau, tau)] = TAU_PRIOR;
            }
            if let Some(mom) = node.mom_index {
                for i in 0..node.layout.momentum {
                    cov[(mom + i, mom + i)] = MOMENTUM_PRIOR;
                }
            }
        }
    }

    /// Vertex displacement constraint: the decay vertex lies on the
    /// trajectory leaving the production vertex, `x = x_mother + Δ(p, tau)`.
    ///
    /// Charged particles follow a helix; `p` is the momentum at the decay
    /// vertex.
    fn project_geometric(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let (Some(parent), Some(pos), Some(tau_index), Some(mom)) =
            (node.parent, node.own_pos, node.tau_index, node.mom_index)
        else {
            return ErrCode::BAD_SETUP;
        };
        let Some(mother_pos) = self.nodes[parent.0].pos_index else {
            return ErrCode::BAD_SETUP;
        };

        let x_mother = fp.vector3(mother_pos);
        let x = fp.vector3(pos);
        let mom3 = fp.vector3(mom);
        let tau = fp.par(tau_index);

        for i in 0..3 {
            p.h[(i, mother_pos + i)] += 1.0;
            p.h[(i, pos + i)] -= 1.0;
        }

        let lambda = node.bending;
        if lambda == 0.0 {
            for i in 0..3 {
                p.r[i] = x_mother[i] + tau * mom3[i] - x[i];
                p.h[(i, tau_index)] = mom3[i];
                p.h[(i, mom + i)] = tau;
            }
        } else {
            let (px, py, pz) = (mom3.x, mom3.y, mom3.z);
            let (sin, cos) = (lambda * tau).sin_cos();
            let dx = (px * sin - py * (1.0 - cos)) / lambda;
            let dy = (py * sin + px * (1.0 - cos)) / lambda;
            let dz = pz * tau;

            p.r[0] = x_mother.x + dx - x.x;
            p.r[1] = x_mother.y + dy - x.y;
            p.r[2] = x_mother.z + dz - x.z;

            p.h[(0, mom)] = sin / lambda;
            p.h[(0, mom + 1)] = -(1.0 - cos) / lambda;
            p.h[(0, tau_index)] = px * cos - py * sin;
            p.h[(1, mom)] = (1.0 - cos) / lambda;
            p.h[(1, mom + 1)] = sin / lambda;
            p.h[(1, tau_index)] = py * cos + px * sin;
            p.h[(2, mom + 2)] = tau;
            p.h[(2, tau_index)] = pz;
        }
        ErrCode::SUCCESS
    }

    /// `E² − |p|² − m² = 0`.
    fn project_mass(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let Some(mom) = node.mom_index.filter(|_| node.has_energy()) else {
            return ErrCode::BAD_SETUP;
        };
        let mom3 = fp.vector3(mom);
        let energy = fp.par(mom + 3);

        p.r[0] = energy * energy - mom3.norm_squared() - node.mass * node.mass;
        for i in 0..3 {
            p.h[(0, mom + i)] = -2.0 * mom3[i];
        }
        p.h[(0, mom + 3)] = 2.0 * energy;
        ErrCode::SUCCESS
    }

    /// Flight parameter against its nominal value, with the exponential
    /// width as error.
    fn project_lifetime(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let Some(tau_index) = node.tau_index else {
            return ErrCode::BAD_SETUP;
        };
        let tau = node.nominal_tau();
        if !tau.is_finite() || tau <= 0.0 {
            return ErrCode::BAD_SETUP;
        }
        p.r[0] = fp.par(tau_index) - tau;
        p.h[(0, tau_index)] = 1.0;
        p.v[(0, 0)] = tau * tau;
        ErrCode::SUCCESS
    }

    /// Head four-momentum against the beam.
    fn project_beam_energy(&self, node: &Node, fp: &FitParams, p: &mut Projection) -> ErrCode {
        let (Some(beam), Some(mom)) = (&self.beam, node.mom_index) else {
            return ErrCode::BAD_SETUP;
        };
        if !node.has_energy() {
            return ErrCode::BAD_SETUP;
        }
        for i in 0..4 {
            p.r[i] = fp.par(mom + i) - beam.four_momentum[i];
            p.h[(i, mom + i)] = 1.0;
            for j in 0..4 {
                p.v[(i, j)] = beam.covariance[(i, j)];
            }
        }
        ErrCode::SUCCESS
    }
}

impl Projector for Tree {
    fn project_constraint(
        &self,
        constraint: &Constraint,
        fitparams: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        let Some(node) = constraint.node().and_then(|id| self.nodes.get(id.0)) else {
            return ErrCode::BAD_SETUP;
        };

        let status = match (constraint.constraint_type(), &node.role) {
            (ConstraintType::Beamspot | ConstraintType::Origin, Role::Origin(origin)) => {
                origin.project(node, fitparams, projection)
            }
            (ConstraintType::Beamenergy, _) => self.project_beam_energy(node, fitparams, projection),
            (ConstraintType::Composite | ConstraintType::Resonance, Role::Measured(measured)) => {
                measured.project(node, fitparams, projection)
            }
            (ConstraintType::Track | ConstraintType::Helix, Role::Track(track)) => {
                track.project(node, fitparams, projection)
            }
            (ConstraintType::Photon, Role::Photon(photon)) => photon.project(node, fitparams, projection),
            (ConstraintType::Klong, Role::Klong(klong)) => klong.project(node, fitparams, projection),
            (ConstraintType::Kinematic, Role::Internal { .. } | Role::Resonance) => {
                self.project_kinematic(node, fitparams, projection)
            }
            (ConstraintType::Geometric, _) => self.project_geometric(node, fitparams, projection),
            (ConstraintType::Mass | ConstraintType::MassEnergy, _) => {
                self.project_mass(node, fitparams, projection)
            }
            (ConstraintType::Lifetime, _) => self.project_lifetime(node, fitparams, projection),
            (ConstraintType::Conversion, Role::Internal { conversion: true }) => {
                self.project_conversion(node, fitparams, projection)
            }
            _ => ErrCode::BAD_SETUP,
        };

        if !status.is_failure() && !projection.is_finite() {
            return status | ErrCode::FILTER_ERROR;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Matrix7, Vector7};
    use crate::config::BeamConstraint;
    use crate::constraint::ConstraintOrdering;
    use crate::helix::Helix;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix4, Matrix5};
    use treefit_env::StaticDetector;

    fn exact_track(
        ctx: &StaticDetector,
        pdg: i32,
        vertex: Vector3<f64>,
        momentum: Vector3<f64>,
    ) -> Particle {
        let props = ctx.particle(PdgCode(pdg)).unwrap();
        let kappa = ctx.bending_constant(f64::from(props.charge));
        let helix = Helix::from_vertex(&vertex, &momentum, kappa);
        let energy = (momentum.norm_squared() + props.mass * props.mass).sqrt();
        Particle::track(pdg, helix, Matrix5::from_diagonal_element(1e-6))
            .with_momentum(Vector4::new(momentum.x, momentum.y, momentum.z, energy))
    }

    fn ks_vertex() -> Vector3<f64> {
        Vector3::new(1.0, 0.5, 0.2)
    }

    fn ks_momenta() -> (Vector3<f64>, Vector3<f64>) {
        (Vector3::new(0.6, 0.2, 0.1), Vector3::new(0.3, -0.25, 0.05))
    }

    fn ks_candidate(ctx: &StaticDetector) -> Particle {
        let (p1, p2) = ks_momenta();
        Particle::composite(
            PdgCode::K_SHORT,
            vec![
                exact_track(ctx, 211, ks_vertex(), p1),
                exact_track(ctx, -211, ks_vertex(), p2),
            ],
        )
    }

    fn b0_to_jpsi_ks(ctx: &StaticDetector) -> Particle {
        let b_vertex = Vector3::new(0.002, -0.001, 0.03);
        let jpsi = Particle::composite(
            PdgCode::JPSI,
            vec![
                exact_track(ctx, 13, b_vertex, Vector3::new(1.1, 0.4, 0.9)),
                exact_track(ctx, -13, b_vertex, Vector3::new(-0.2, 1.3, 0.5)),
            ],
        );
        Particle::composite(PdgCode::B0, vec![jpsi, ks_candidate(ctx)])
    }

    fn kinds(constraints: &[Constraint]) -> Vec<ConstraintType> {
        constraints.iter().map(Constraint::constraint_type).collect()
    }

    fn project(tree: &Tree, constraint: &Constraint, fp: &FitParams) -> Projection {
        let mut p = Projection::new(fp.dim(), constraint.dim());
        let status = tree.project_constraint(constraint, fp, &mut p);
        assert!(status.is_success(), "{} projection failed: {}", constraint.constraint_type(), status);
        p
    }

    /// Compares the analytic Jacobian with central differences in every
    /// state direction.
    fn assert_jacobian(tree: &Tree, constraint: &Constraint, fp: &FitParams) {
        let analytic = project(tree, constraint, fp);
        for col in 0..fp.dim() {
            let step = 1e-6 * fp.par(col).abs().max(1.0);
            let mut plus = fp.clone();
            plus.state_mut()[col] += step;
            let mut minus = fp.clone();
            minus.state_mut()[col] -= step;
            let r_plus = project(tree, constraint, &plus).r;
            let r_minus = project(tree, constraint, &minus).r;

            for row in 0..constraint.dim() {
                let numerical = (r_plus[row] - r_minus[row]) / (2.0 * step);
                let expected = analytic.h[(row, col)];
                assert!(
                    (numerical - expected).abs() < 1e-5 * (1.0 + expected.abs()),
                    "{} of node {:?}: d r[{}] / d x[{}] analytic {} numerical {}",
                    constraint.constraint_type(),
                    constraint.node(),
                    row,
                    col,
                    expected,
                    numerical
                );
            }
        }
    }

    #[test]
    fn test_two_track_layout() {
        let ctx = StaticDetector::new();
        let tree = Tree::build(&ks_candidate(&ctx), &ctx, &FitConfig::default()).unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.dim(), 13);
        assert_eq!(tree.root(), tree.head());

        let ks = tree.node(NodeId(0)).unwrap();
        assert_eq!(ks.kind(), RoleKind::Internal);
        assert_eq!(ks.pos_index(), Some(6));
        assert_eq!(ks.tau_index(), None);
        assert_eq!(ks.mom_index(), Some(9));

        let pi_plus = tree.node(NodeId(1)).unwrap();
        let pi_minus = tree.node(NodeId(2)).unwrap();
        assert_eq!(pi_plus.mom_index(), Some(0));
        assert_eq!(pi_minus.mom_index(), Some(3));
        assert_eq!(pi_plus.pos_index(), Some(6));
        assert!(!pi_plus.has_own_position());
        assert_eq!(pi_minus.candidate_path(), Some(&[1usize][..]));
    }

    #[test]
    fn test_nested_layout_with_beam_spot() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let tree = Tree::build(&b0_to_jpsi_ks(&ctx), &ctx, &config).unwrap();

        assert_eq!(tree.len(), 8);
        assert_eq!(tree.dim(), 35);
        assert_eq!(tree.root(), NodeId(0));
        assert_eq!(tree.head(), NodeId(1));

        let node = |i: usize| tree.node(NodeId(i)).unwrap();
        assert_eq!(node(0).kind(), RoleKind::Origin);
        assert_eq!(node(0).pos_index(), Some(32));

        // B0 decays at 24..27, with its flight parameter at 27
        assert_eq!(node(1).pos_index(), Some(24));
        assert_eq!(node(1).tau_index(), Some(27));
        assert_eq!(node(1).mom_index(), Some(28));

        // J/psi shares the B0 vertex
        assert_eq!(node(2).kind(), RoleKind::Resonance);
        assert_eq!(node(2).pos_index(), Some(24));
        assert_eq!(node(2).mom_index(), Some(6));
        assert_eq!(node(3).pos_index(), Some(24));
        assert_eq!(node(3).mom_index(), Some(0));
        assert_eq!(node(4).mom_index(), Some(3));

        assert_eq!(node(5).kind(), RoleKind::Internal);
        assert_eq!(node(5).pos_index(), Some(16));
        assert_eq!(node(5).tau_index(), Some(19));
        assert_eq!(node(5).mom_index(), Some(20));
        assert_eq!(node(6).pos_index(), Some(16));
        assert_eq!(node(6).mom_index(), Some(10));
        assert_eq!(node(7).mom_index(), Some(13));
        assert_eq!(node(7).depth(), 3);
        assert_eq!(node(7).candidate_path(), Some(&[1usize, 1][..]));
    }

    #[test]
    fn test_constraints_follow_post_order() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let tree = Tree::build(&b0_to_jpsi_ks(&ctx), &ctx, &config).unwrap();
        let constraints = tree.constraints(&config);

        use ConstraintType::*;
        assert_eq!(
            kinds(&constraints),
            vec![Track, Track, Kinematic, Track, Track, Kinematic, Geometric, Kinematic, Geometric, Beamspot]
        );
        let equations: usize = constraints.iter().map(Constraint::dim).sum();
        assert_eq!(equations, 41);
        assert!(constraints.iter().all(|c| (-3..=0).contains(&c.depth())));
    }

    #[test]
    fn test_sorted_constraints_filter_leaves_first() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let tree = Tree::build(&b0_to_jpsi_ks(&ctx), &ctx, &config).unwrap();
        let mut constraints = tree.constraints(&config);
        ConstraintOrdering::DepthThenType.sort(&mut constraints).unwrap();

        use ConstraintType::*;
        assert_eq!(
            kinds(&constraints),
            vec![Track, Track, Track, Track, Kinematic, Kinematic, Geometric, Kinematic, Geometric, Beamspot]
        );

        // every measurement precedes the vertex constraints of its mother
        for (i, mother) in constraints.iter().enumerate() {
            let Some(mother_id) = mother.node() else { continue };
            for after in &constraints[i + 1..] {
                let Some(id) = after.node() else { continue };
                let parent = tree.node(id).and_then(Node::parent);
                assert_ne!(
                    parent,
                    Some(mother_id),
                    "{} of a daughter sorted after {} of its mother",
                    after.constraint_type(),
                    mother.constraint_type()
                );
            }
        }
        assert_eq!(constraints.last().map(|c| c.depth()), Some(0));
    }

    #[test]
    fn test_mass_and_lifetime_requests() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let candidate = ks_candidate(&ctx).with_mass_constraint().with_lifetime_constraint();
        let tree = Tree::build(&candidate, &ctx, &config).unwrap();

        use ConstraintType::*;
        assert_eq!(
            kinds(&tree.node_constraints(tree.head())),
            vec![Lifetime, Kinematic, Geometric, Mass]
        );

        // Without a production vertex there is no flight parameter to constrain
        let tree = Tree::build(&candidate, &ctx, &FitConfig::default()).unwrap();
        assert_eq!(kinds(&tree.node_constraints(tree.head())), vec![Kinematic, Mass]);
    }

    #[test]
    fn test_beam_energy_on_head() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default()
            .with_beam_constraint(BeamConstraint::BeamSpot)
            .with_beam_energy_constraint(true);
        let candidate = ks_candidate(&ctx).with_mass_constraint();
        let tree = Tree::build(&candidate, &ctx, &config).unwrap();

        use ConstraintType::*;
        assert_eq!(
            kinds(&tree.node_constraints(tree.head())),
            vec![Kinematic, Geometric, MassEnergy, Beamenergy]
        );
        assert_eq!(kinds(&tree.node_constraints(tree.root())), vec![Beamspot]);
    }

    #[test]
    fn test_photon_conversion_detected() {
        let ctx = StaticDetector::new();
        let vertex = Vector3::new(10.0, 2.0, 1.0);
        let candidate = Particle::composite(
            PdgCode::PHOTON,
            vec![
                exact_track(&ctx, 11, vertex, Vector3::new(0.3, 0.05, 0.1)),
                exact_track(&ctx, -11, vertex, Vector3::new(0.2, 0.04, 0.07)),
            ],
        )
        .with_mass_constraint();
        let tree = Tree::build(&candidate, &ctx, &FitConfig::default()).unwrap();

        assert!(matches!(tree.node(tree.head()).unwrap().role(), Role::Internal { conversion: true }));
        use ConstraintType::*;
        assert_eq!(kinds(&tree.constraints(&FitConfig::default())), vec![Track, Track, Kinematic, Conversion]);
    }

    #[test]
    fn test_measured_composite_is_kept_whole() {
        let ctx = StaticDetector::new();
        let b_vertex = Vector3::new(0.0, 0.0, 0.05);
        let d_params = Vector7::from_column_slice(&[0.1, 0.05, 0.2, 1.0, 0.5, 0.4, 2.2]);
        let pions = vec![
            exact_track(&ctx, 211, b_vertex, Vector3::new(0.8, -0.3, 0.2)),
            exact_track(&ctx, -211, b_vertex, Vector3::new(-0.4, 0.7, 0.1)),
        ];
        let d_daughters = vec![
            exact_track(&ctx, -321, Vector3::new(0.1, 0.05, 0.2), Vector3::new(0.6, 0.3, 0.2)),
            exact_track(&ctx, 211, Vector3::new(0.1, 0.05, 0.2), Vector3::new(0.4, 0.2, 0.2)),
        ];
        let d0 = Particle::measured_composite(PdgCode::D0, d_params, Matrix7::identity() * 1e-4, d_daughters);
        let mut daughters = vec![d0];
        daughters.extend(pions);
        let candidate = Particle::composite(PdgCode::B0, daughters);

        let tree = Tree::build(&candidate, &ctx, &FitConfig::default()).unwrap();
        assert_eq!(tree.len(), 4);
        let d0 = tree.node(NodeId(1)).unwrap();
        assert_eq!(d0.kind(), RoleKind::Measured);
        assert!(d0.has_own_position());
        use ConstraintType::*;
        assert_eq!(kinds(&tree.node_constraints(NodeId(1))), vec![Composite, Geometric]);

        let tree =
            Tree::build(&candidate, &ctx, &FitConfig::default().with_force_fit_all(true)).unwrap();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.node(NodeId(1)).unwrap().kind(), RoleKind::Internal);
    }

    #[test]
    fn test_setup_errors() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default();

        let unknown = Particle::composite(99_999, ks_candidate(&ctx).daughters);
        assert!(matches!(
            Tree::build(&unknown, &ctx, &config),
            Err(FitError::UnknownParticle(99_999))
        ));

        let lone = exact_track(&ctx, 211, Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        assert!(matches!(Tree::build(&lone, &ctx, &config), Err(FitError::BadSetup(_))));

        let empty_leaf = Particle::composite(
            PdgCode::B0,
            vec![ks_candidate(&ctx), Particle::composite(PdgCode::K_SHORT, Vec::new())],
        );
        assert!(matches!(Tree::build(&empty_leaf, &ctx, &config), Err(FitError::BadSetup(_))));

        let neutral_track = Particle::composite(
            PdgCode::K_SHORT,
            vec![
                exact_track(&ctx, 211, ks_vertex(), Vector3::new(0.5, 0.1, 0.0)),
                Particle::track(PdgCode::K_LONG, Helix::new(0.0, 0.0, 0.01, 0.0, 0.0), Matrix5::identity()),
            ],
        );
        assert!(matches!(Tree::build(&neutral_track, &ctx, &config), Err(FitError::BadSetup(_))));
    }

    #[test]
    fn test_exact_tracks_seed_the_true_vertex() {
        let ctx = StaticDetector::new();
        let mut tree = Tree::build(&ks_candidate(&ctx), &ctx, &FitConfig::default()).unwrap();
        let mut fp = FitParams::new(tree.dim());
        assert!(tree.init_par(&mut fp).is_success());

        let vertex = fp.vector3(6);
        assert_relative_eq!(vertex, ks_vertex(), epsilon = 1e-6);

        let (p1, p2) = ks_momenta();
        assert_relative_eq!(fp.vector3(0), p1, epsilon = 1e-6);
        assert_relative_eq!(fp.vector3(3), p2, epsilon = 1e-6);

        let sum = p1 + p2;
        assert_relative_eq!(fp.vector3(9), sum, epsilon = 1e-6);
        let m_pi = ctx.particle(PdgCode::PION).unwrap().mass;
        let energy = (p1.norm_squared() + m_pi * m_pi).sqrt() + (p2.norm_squared() + m_pi * m_pi).sqrt();
        assert_relative_eq!(fp.par(12), energy, epsilon = 1e-6);

        for constraint in tree.constraints(&FitConfig::default()) {
            let p = project(&tree, &constraint, &fp);
            assert!(p.r.amax() < 1e-6, "{} residual {}", constraint.constraint_type(), p.r.amax());
        }
        assert!(tree.node_chi_square(tree.head(), &fp) < 1e-6);
    }

    #[test]
    fn test_existing_vertex_is_used_as_seed() {
        let ctx = StaticDetector::new();
        let seed = Vector3::new(0.9, 0.45, 0.25);
        let candidate = ks_candidate(&ctx).with_vertex(seed);
        let mut tree = Tree::build(&candidate, &ctx, &FitConfig::default()).unwrap();
        let mut fp = FitParams::new(tree.dim());
        tree.init_par(&mut fp);

        assert_relative_eq!(fp.vector3(6), seed, epsilon = 1e-12);
    }

    #[test]
    fn test_nested_seed_recovers_both_vertices() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let mut tree = Tree::build(&b0_to_jpsi_ks(&ctx), &ctx, &config).unwrap();
        let mut fp = FitParams::new(tree.dim());
        assert!(tree.init_par(&mut fp).is_success());

        assert_relative_eq!(fp.vector3(24), Vector3::new(0.002, -0.001, 0.03), epsilon = 1e-6);
        assert_relative_eq!(fp.vector3(16), ks_vertex(), epsilon = 1e-6);
        // Displacement along the K_S momentum
        assert!(fp.par(19) > 0.0);
    }

    #[test]
    fn test_init_cov_sets_priors() {
        let ctx = StaticDetector::new();
        let config = FitConfig::default().with_beam_constraint(BeamConstraint::BeamSpot);
        let tree = Tree::build(&ks_candidate(&ctx), &ctx, &config).unwrap();
        let mut fp = FitParams::new(tree.dim());
        tree.init_cov(&mut fp);

        let ks = tree.node(tree.head()).unwrap();
        let pos = ks.pos_index().unwrap();
        assert_eq!(fp.covariance()[(pos, pos)], POSITION_PRIOR);
        assert_eq!(fp.covariance()[(ks.tau_index().unwrap(), ks.tau_index().unwrap())], TAU_PRIOR);
        assert_eq!(fp.covariance()[(0, 0)], MOMENTUM_PRIOR);
        assert!(fp.test_covariance());
    }

    #[test]
    fn test_force_p4_sum_closes_kinematics() {
        let ctx = StaticDetector::new();
        let mut tree = Tree::build(&ks_candidate(&ctx), &ctx, &FitConfig::default()).unwrap();
        let mut fp = FitParams::new(tree.dim());
        tree.init_par(&mut fp);
        fp.state_mut()[9] += 0.2;
        fp.state_mut()[12] -= 0.1;

        let kinematic = Constraint::new(ConstraintType::Kinematic, tree.head(), 0, 4);
        assert!(project(&tree, &kinematic, &fp).r.amax() > 0.05);

        tree.force_p4_sum(&mut fp);
        assert!(project(&tree, &kinematic, &fp).r.amax() < 1e-12);
    }

    #[test]
    fn test_analytic_jacobians() {
        let ctx = StaticDetector::new();
        let b_vertex = Vector3::new(0.01, -0.02, 0.1);
        let d_vertex = b_vertex + Vector3::new(0.3, 0.2, 0.4);

        let d_minus = Particle::composite(
            PdgCode::D_PLUS.conjugate(),
            vec![
                exact_track(&ctx, 321, d_vertex, Vector3::new(0.5, 0.2, 0.3)),
                exact_track(&ctx, -211, d_vertex, Vector3::new(0.4, 0.25, 0.2)),
                exact_track(&ctx, -211, d_vertex, Vector3::new(0.3, 0.05, 0.1)),
            ],
        )
        .with_mass_constraint()
        .with_lifetime_constraint();

        let photon_cov = Matrix4::from_diagonal(&Vector4::new(0.25, 0.25, 0.25, 4e-4));
        let pi0 = Particle::composite(
            PdgCode::PI0,
            vec![
                Particle::photon(Vector3::new(120.0, 30.0, 40.0), 0.3, photon_cov),
                Particle::photon(Vector3::new(100.0, -20.0, 60.0), 0.5, photon_cov),
            ],
        )
        .with_mass_constraint();

        let klong = Particle::klong(
            Vector3::new(20.0, 150.0, 30.0),
            Matrix3::from_diagonal_element(4.0),
            Vector4::new(0.1, 1.0, 0.2, 1.14),
        );

        let candidate = Particle::composite(
            PdgCode::B0,
            vec![
                d_minus,
                exact_track(&ctx, 211, b_vertex, Vector3::new(-0.9, 0.6, 0.5)),
                pi0,
                klong,
            ],
        )
        .with_mass_constraint();

        let config = FitConfig::default()
            .with_beam_constraint(BeamConstraint::BeamSpot)
            .with_beam_energy_constraint(true);
        let mut tree = Tree::build(&candidate, &ctx, &config).unwrap();
        let mut fp = FitParams::new(tree.dim());
        tree.init_par(&mut fp);

        // Move away from the seed so that no residual is trivially zero
        for i in 0..fp.dim() {
            fp.state_mut()[i] += 1e-3 * (((i * 7) % 11) as f64 - 5.0) / 5.0;
        }
        let d_node = tree.node(NodeId(2)).unwrap();
        assert_eq!(d_node.charge(), -1.0);
        fp.state_mut()[d_node.tau_index().unwrap()] = 0.5;
        let b_node = tree.node(tree.head()).unwrap();
        fp.state_mut()[b_node.tau_index().unwrap()] = 0.05;

        let constraints = tree.constraints(&config);
        use ConstraintType::*;
        for ctype in [Track, Photon, Klong, Kinematic, Geometric, Mass, MassEnergy, Lifetime, Beamspot, Beamenergy] {
            assert!(
                constraints.iter().any(|c| c.constraint_type() == ctype),
                "missing {}",
                ctype
            );
        }
        for constraint in &constraints {
            assert_jacobian(&tree, constraint, &fp);
        }
    }

    #[test]
    fn test_conversion_jacobian() {
        let ctx = StaticDetector::new();
        let vertex = Vector3::new(10.0, 2.0, 1.0);
        let candidate = Particle::composite(
            PdgCode::PHOTON,
            vec![
                exact_track(&ctx, 11, vertex, Vector3::new(0.3, 0.05, 0.1)),
                exact_track(&ctx, -11, vertex, Vector3::new(0.2, 0.06, 0.07)),
            ],
        )
        .with_mass_constraint();
        let config = FitConfig::default();
        let mut tree = Tree::build(&candidate, &ctx, &config).unwrap();
        let mut fp = FitParams::new(tree.dim());
        tree.init_par(&mut fp);

        for constraint in tree.constraints(&config) {
            assert_jacobian(&tree, &constraint, &fp);
        }
    }
}
