//! Integrated gradients.
//!
//! Attribution for class `t` at pixel `p`:
//!
//! ```text
//! (x_p - x'_p) * ∫₀¹ ∂F_t(x' + α(x - x')) / ∂x_p dα
//! ```
//!
//! with an all-zero baseline `x'`. The integral is approximated by a fixed
//! quadrature rule over `steps` interpolation points; gradients come from the
//! network backend in batches of `internal_batch_size` points.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use ndarray::{s, Array2, Array4};
use tracing::debug;

use super::model::Model;
use super::types::{AttributionMap, NormalizedTensor};
use super::AttributionError;

/// Newton iterations per Gauss–Legendre root; converges in well under ten.
const MAX_NEWTON_ITERATIONS: usize = 100;

// ═══════════════════════════════════════════════════════════
// Quadrature rules
// ═══════════════════════════════════════════════════════════

/// How interpolation points and weights along the path are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadratureRule {
    RiemannLeft,
    RiemannRight,
    RiemannMiddle,
    RiemannTrapezoid,
    GaussLegendre,
}

impl QuadratureRule {
    pub fn min_steps(self) -> usize {
        match self {
            QuadratureRule::RiemannTrapezoid => 2,
            _ => 1,
        }
    }

    /// `(alpha, weight)` pairs on [0, 1], ascending in alpha. Weights sum to 1.
    pub fn nodes(self, steps: usize) -> Result<Vec<(f64, f64)>, AttributionError> {
        if steps < self.min_steps() {
            return Err(AttributionError::InvalidSteps {
                steps,
                minimum: self.min_steps(),
            });
        }
        let n = steps as f64;
        let nodes = match self {
            QuadratureRule::RiemannLeft => (0..steps).map(|k| (k as f64 / n, 1.0 / n)).collect(),
            QuadratureRule::RiemannRight => {
                (0..steps).map(|k| ((k + 1) as f64 / n, 1.0 / n)).collect()
            }
            QuadratureRule::RiemannMiddle => {
                (0..steps).map(|k| ((k as f64 + 0.5) / n, 1.0 / n)).collect()
            }
            QuadratureRule::RiemannTrapezoid => {
                let width = 1.0 / (n - 1.0);
                (0..steps)
                    .map(|k| {
                        let weight = if k == 0 || k == steps - 1 {
                            width / 2.0
                        } else {
                            width
                        };
                        (k as f64 * width, weight)
                    })
                    .collect()
            }
            QuadratureRule::GaussLegendre => gauss_legendre(steps)
                .into_iter()
                .map(|(x, w)| (0.5 * (x + 1.0), 0.5 * w))
                .collect(),
        };
        Ok(nodes)
    }
}

impl fmt::Display for QuadratureRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuadratureRule::RiemannLeft => "riemann_left",
            QuadratureRule::RiemannRight => "riemann_right",
            QuadratureRule::RiemannMiddle => "riemann_middle",
            QuadratureRule::RiemannTrapezoid => "riemann_trapezoid",
            QuadratureRule::GaussLegendre => "gausslegendre",
        };
        f.write_str(name)
    }
}

impl FromStr for QuadratureRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "riemann_left" => Ok(QuadratureRule::RiemannLeft),
            "riemann_right" => Ok(QuadratureRule::RiemannRight),
            "riemann_middle" => Ok(QuadratureRule::RiemannMiddle),
            "riemann_trapezoid" => Ok(QuadratureRule::RiemannTrapezoid),
            "gausslegendre" | "gauss_legendre" => Ok(QuadratureRule::GaussLegendre),
            other => Err(format!("unknown integration method '{other}'")),
        }
    }
}

/// Gauss–Legendre nodes and weights on [-1, 1], ascending.
///
/// Roots of P_n found by Newton's method from the Tricomi initial guess;
/// symmetric, so only half are computed.
fn gauss_legendre(n: usize) -> Vec<(f64, f64)> {
    let mut nodes = vec![(0.0, 0.0); n];
    let nf = n as f64;
    for i in 0..n.div_ceil(2) {
        let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
        let mut derivative = 1.0;
        for _ in 0..MAX_NEWTON_ITERATIONS {
            // Recurrence: j P_j = (2j - 1) z P_{j-1} - (j - 1) P_{j-2}
            let (mut p1, mut p2) = (1.0_f64, 0.0_f64);
            for j in 1..=n {
                let jf = j as f64;
                let p3 = p2;
                p2 = p1;
                p1 = ((2.0 * jf - 1.0) * z * p2 - (jf - 1.0) * p3) / jf;
            }
            derivative = nf * (z * p1 - p2) / (z * z - 1.0);
            let previous = z;
            z = previous - p1 / derivative;
            if (z - previous).abs() < 1e-15 {
                break;
            }
        }
        let weight = 2.0 / ((1.0 - z * z) * derivative * derivative);
        nodes[i] = (-z, weight);
        nodes[n - 1 - i] = (z, weight);
    }
    nodes
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct IntegratedGradients {
    steps: usize,
    rule: QuadratureRule,
    internal_batch_size: usize,
}

impl IntegratedGradients {
    pub fn new(steps: usize, rule: QuadratureRule) -> Self {
        Self {
            steps,
            rule,
            internal_batch_size: steps.max(1),
        }
    }

    /// Cap the number of interpolation points sent to the backend at once.
    pub fn with_internal_batch_size(mut self, size: usize) -> Self {
        self.internal_batch_size = size.max(1);
        self
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn rule(&self) -> QuadratureRule {
        self.rule
    }

    /// Attribute class `target`'s score to the pixels of `input`.
    ///
    /// Deterministic for a fixed model, rule and step count: nodes are
    /// accumulated in ascending order regardless of batching.
    pub fn attribute(
        &self,
        model: &Model,
        input: &NormalizedTensor,
        target: usize,
    ) -> Result<AttributionMap, AttributionError> {
        let size = model.vocabulary().len();
        if target >= size {
            return Err(AttributionError::TargetOutOfRange {
                index: target,
                size,
            });
        }

        let started = Instant::now();
        let nodes = self.rule.nodes(self.steps)?;
        let x = input.view();
        let (h, w) = x.dim();
        let baseline = Array2::<f32>::zeros((h, w));
        let delta = &x - &baseline;

        let mut path_gradient = Array2::<f32>::zeros((h, w));
        for chunk in nodes.chunks(self.internal_batch_size) {
            let batch = Array4::from_shape_fn((chunk.len(), 1, h, w), |(b, _, i, j)| {
                baseline[[i, j]] + chunk[b].0 as f32 * delta[[i, j]]
            });
            let grads = model.network().input_gradients(batch.view(), target)?;
            if grads.shape() != batch.shape() {
                return Err(AttributionError::GradientShape {
                    expected: batch.shape().to_vec(),
                    actual: grads.shape().to_vec(),
                });
            }
            for (b, (_, weight)) in chunk.iter().enumerate() {
                let grad = grads.slice(s![b, 0, .., ..]);
                path_gradient.scaled_add(*weight as f32, &grad);
            }
        }

        let attribution = path_gradient * &delta;
        if attribution.iter().any(|v| !v.is_finite()) {
            return Err(AttributionError::NonFinite);
        }

        debug!(
            target,
            steps = self.steps,
            rule = %self.rule,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Attributions computed"
        );

        Ok(AttributionMap::new(attribution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::INPUT_SIZE;
    use crate::pipeline::model::{LinearNetwork, Network, Vocabulary};
    use crate::pipeline::InferenceError;
    use ndarray::{Array1, Array3, ArrayView4};

    const ALL_RULES: [QuadratureRule; 5] = [
        QuadratureRule::RiemannLeft,
        QuadratureRule::RiemannRight,
        QuadratureRule::RiemannMiddle,
        QuadratureRule::RiemannTrapezoid,
        QuadratureRule::GaussLegendre,
    ];

    fn linear_model(classes: usize) -> Model {
        let names = (0..classes).map(|c| format!("Class{c}")).collect();
        Model::new(
            Vocabulary::new(names).unwrap(),
            Box::new(LinearNetwork::seeded(classes)),
        )
    }

    fn ramp_tensor() -> NormalizedTensor {
        NormalizedTensor::new(Array2::from_shape_fn((INPUT_SIZE, INPUT_SIZE), |(i, j)| {
            (i as f32 - j as f32) * 4.0
        }))
        .unwrap()
    }

    // ── quadrature ──

    #[test]
    fn weights_sum_to_one_for_every_rule() {
        for rule in ALL_RULES {
            for steps in [2, 5, 50] {
                let total: f64 = rule.nodes(steps).unwrap().iter().map(|(_, w)| w).sum();
                assert!((total - 1.0).abs() < 1e-10, "{rule} with {steps} steps: {total}");
            }
        }
    }

    #[test]
    fn alphas_ascending_within_unit_interval() {
        for rule in ALL_RULES {
            let nodes = rule.nodes(7).unwrap();
            assert!(nodes.iter().all(|(a, _)| (0.0..=1.0).contains(a)), "{rule}");
            assert!(nodes.windows(2).all(|pair| pair[0].0 < pair[1].0), "{rule}");
        }
    }

    #[test]
    fn riemann_endpoints() {
        let left = QuadratureRule::RiemannLeft.nodes(4).unwrap();
        assert_eq!(left.first().unwrap().0, 0.0);
        assert_eq!(left.last().unwrap().0, 0.75);
        let right = QuadratureRule::RiemannRight.nodes(4).unwrap();
        assert_eq!(right.last().unwrap().0, 1.0);
        let trap = QuadratureRule::RiemannTrapezoid.nodes(3).unwrap();
        assert_eq!(trap, vec![(0.0, 0.25), (0.5, 0.5), (1.0, 0.25)]);
    }

    #[test]
    fn gauss_legendre_two_point_nodes() {
        let nodes = QuadratureRule::GaussLegendre.nodes(2).unwrap();
        let offset = 0.5 / 3.0_f64.sqrt();
        assert!((nodes[0].0 - (0.5 - offset)).abs() < 1e-12);
        assert!((nodes[1].0 - (0.5 + offset)).abs() < 1e-12);
        assert!((nodes[0].1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn gauss_legendre_exact_for_cubic() {
        // ∫₀¹ t³ dt = 1/4, exact for n >= 2
        let nodes = QuadratureRule::GaussLegendre.nodes(2).unwrap();
        let integral: f64 = nodes.iter().map(|(a, w)| w * a.powi(3)).sum();
        assert!((integral - 0.25).abs() < 1e-12);
    }

    #[test]
    fn gauss_legendre_single_point_is_midpoint() {
        assert_eq!(QuadratureRule::GaussLegendre.nodes(1).unwrap(), vec![(0.5, 1.0)]);
    }

    #[test]
    fn invalid_step_counts_rejected() {
        assert!(matches!(
            QuadratureRule::RiemannLeft.nodes(0),
            Err(AttributionError::InvalidSteps { steps: 0, minimum: 1 })
        ));
        assert!(QuadratureRule::RiemannTrapezoid.nodes(1).is_err());
    }

    #[test]
    fn rule_names_round_trip() {
        for rule in ALL_RULES {
            assert_eq!(rule.to_string().parse::<QuadratureRule>().unwrap(), rule);
        }
        assert!("simpson".parse::<QuadratureRule>().is_err());
    }

    // ── attribution ──

    #[test]
    fn linear_network_attribution_is_weight_times_input() {
        let model = linear_model(3);
        let input = ramp_tensor();
        let net = LinearNetwork::seeded(3);
        let batch = Array4::zeros((1, 1, INPUT_SIZE, INPUT_SIZE));
        let weights = net.input_gradients(batch.view(), 1).unwrap();

        for rule in ALL_RULES {
            let map = IntegratedGradients::new(8, rule)
                .attribute(&model, &input, 1)
                .unwrap();
            assert_eq!(map.shape(), &[INPUT_SIZE, INPUT_SIZE]);
            for (i, j) in [(0, 0), (10, 200), (223, 5)] {
                let expected = weights[[0, 0, i, j]] * input.view()[[i, j]];
                assert!(
                    (map.view()[[i, j]] - expected).abs() < 1e-8,
                    "{rule} at ({i}, {j})"
                );
            }
        }
    }

    #[test]
    fn completeness_on_linear_network() {
        let model = linear_model(2);
        let input = ramp_tensor();
        let batch = input.to_batch();
        let scores = model.network().forward(batch.view()).unwrap();
        let baseline_scores = model
            .network()
            .forward(Array4::zeros((1, 1, INPUT_SIZE, INPUT_SIZE)).view())
            .unwrap();
        let expected = scores[[0, 0]] - baseline_scores[[0, 0]];

        let map = IntegratedGradients::new(50, QuadratureRule::GaussLegendre)
            .attribute(&model, &input, 0)
            .unwrap();
        assert!((map.total() - expected).abs() < 1e-3 * expected.abs().max(1.0));
    }

    #[test]
    fn attribution_is_deterministic() {
        let model = linear_model(4);
        let input = ramp_tensor();
        let ig = IntegratedGradients::new(20, QuadratureRule::GaussLegendre).with_internal_batch_size(6);
        let first = ig.attribute(&model, &input, 3).unwrap();
        let second = ig.attribute(&model, &input, 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn batching_does_not_change_result() {
        let model = linear_model(2);
        let input = ramp_tensor();
        let one_at_a_time = IntegratedGradients::new(9, QuadratureRule::RiemannMiddle)
            .with_internal_batch_size(1)
            .attribute(&model, &input, 1)
            .unwrap();
        let all_at_once = IntegratedGradients::new(9, QuadratureRule::RiemannMiddle)
            .attribute(&model, &input, 1)
            .unwrap();
        assert_eq!(one_at_a_time, all_at_once);
    }

    #[test]
    fn out_of_range_target_rejected() {
        let model = linear_model(3);
        let err = IntegratedGradients::new(4, QuadratureRule::RiemannLeft)
            .attribute(&model, &ramp_tensor(), 3)
            .unwrap_err();
        assert!(matches!(err, AttributionError::TargetOutOfRange { index: 3, size: 3 }));
    }

    #[test]
    fn zero_steps_rejected() {
        let model = linear_model(1);
        let err = IntegratedGradients::new(0, QuadratureRule::GaussLegendre)
            .attribute(&model, &ramp_tensor(), 0)
            .unwrap_err();
        assert!(matches!(err, AttributionError::InvalidSteps { .. }));
    }

    /// Returns gradients of the wrong size or NaN, depending on the flag.
    struct BrokenGradients {
        nan: bool,
    }

    impl Network for BrokenGradients {
        fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
            Ok(Array2::zeros((batch.shape()[0], 1)))
        }

        fn input_gradients(
            &self,
            batch: ArrayView4<'_, f32>,
            _target: usize,
        ) -> Result<Array4<f32>, AttributionError> {
            if self.nan {
                Ok(Array4::from_elem(batch.dim(), f32::NAN))
            } else {
                Ok(Array4::zeros((1, 1, 8, 8)))
            }
        }
    }

    fn broken_model(nan: bool) -> Model {
        Model::new(
            Vocabulary::new(vec!["Edema".into()]).unwrap(),
            Box::new(BrokenGradients { nan }),
        )
    }

    #[test]
    fn gradient_shape_mismatch_rejected() {
        let err = IntegratedGradients::new(3, QuadratureRule::RiemannLeft)
            .attribute(&broken_model(false), &ramp_tensor(), 0)
            .unwrap_err();
        assert!(matches!(err, AttributionError::GradientShape { .. }));
    }

    #[test]
    fn non_finite_gradients_rejected() {
        let err = IntegratedGradients::new(3, QuadratureRule::RiemannLeft)
            .attribute(&broken_model(true), &ramp_tensor(), 0)
            .unwrap_err();
        assert!(matches!(err, AttributionError::NonFinite));
    }

    #[test]
    fn zero_input_has_zero_attribution() {
        let model = Model::new(
            Vocabulary::new(vec!["A".into()]).unwrap(),
            Box::new(
                LinearNetwork::new(
                    Array3::from_elem((1, INPUT_SIZE, INPUT_SIZE), 2.0),
                    Array1::zeros(1),
                )
                .unwrap(),
            ),
        );
        let zero = NormalizedTensor::new(Array2::zeros((INPUT_SIZE, INPUT_SIZE))).unwrap();
        let map = IntegratedGradients::new(5, QuadratureRule::RiemannRight)
            .attribute(&model, &zero, 0)
            .unwrap();
        assert!(map.view().iter().all(|v| *v == 0.0));
    }
}
