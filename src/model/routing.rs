use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::trace;

use super::config::LambdaSchedule;
use super::layers::sigmoid;

/// Source du facteur d'interpolation entre `lambda.low` et `lambda.high`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum LambdaMix {
    /// Coefficient de routage moyen reçu par chaque type de sortie,
    /// recalculé avant chaque M-step
    #[default]
    RoutingMass,
    /// Facteur fourni par l'appelant, typiquement la progression de l'entraînement
    Progress(f32),
}

/// Scalaires appris par type de sortie et paire de températures inverses
#[derive(Debug, Clone, Copy)]
pub struct RoutingParams<'a> {
    pub beta_u: ArrayView1<'a, f32>,
    pub beta_a: ArrayView1<'a, f32>,
    pub lambda: LambdaSchedule,
}

/// Gaussienne ajustée sur les votes d'un échantillon, une ligne par type de sortie
#[derive(Debug, Clone)]
pub struct MStep {
    pub activations: Array1<f32>,
    pub mu: Array2<f32>,
    pub sigma_sq: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// (N, C, P²)
    pub poses: Array3<f32>,
    /// (N, C)
    pub activations: Array2<f32>,
    /// (N, B', C), coefficients utilisés par le dernier M-step
    pub coefficients: Array3<f32>,
}

/// Routage Expectation-Maximization entre deux couches de capsules
#[derive(Debug, Clone)]
pub struct EmRouting {
    pub num_iterations: usize,
    pub eps: f32,
}

impl EmRouting {
    pub fn new(num_iterations: usize, eps: f32) -> Self {
        Self { num_iterations, eps }
    }

    /// Route les votes `(N, B', C, P²)` pondérés par les activations d'entrée `(N, B')`.
    ///
    /// Les échantillons du premier axe sont indépendants et traités en parallèle.
    pub fn route(
        &self,
        votes: &ArrayView4<f32>,
        a_in: &ArrayView2<f32>,
        params: &RoutingParams,
        mix: LambdaMix,
    ) -> RoutingOutput {
        let (n, num_inputs, num_out, psize) = votes.dim();
        assert!(self.num_iterations > 0, "EM routing needs at least one iteration");
        assert!(num_inputs > 0 && num_out > 0, "empty vote tensor {:?}", votes.dim());
        assert_eq!(
            a_in.dim(),
            (n, num_inputs),
            "input activations must be (samples, input capsules)"
        );
        assert_eq!(params.beta_u.len(), num_out, "beta_u needs one entry per output type");
        assert_eq!(params.beta_a.len(), num_out, "beta_a needs one entry per output type");

        let per_sample: Vec<(MStep, Array2<f32>)> = (0..n)
            .into_par_iter()
            .map(|s| {
                self.route_sample(
                    votes.index_axis(Axis(0), s),
                    a_in.index_axis(Axis(0), s),
                    params,
                    mix,
                )
            })
            .collect();

        let mut poses = Array3::<f32>::zeros((n, num_out, psize));
        let mut activations = Array2::<f32>::zeros((n, num_out));
        let mut coefficients = Array3::<f32>::zeros((n, num_inputs, num_out));
        for (s, (m, r)) in per_sample.into_iter().enumerate() {
            poses.index_axis_mut(Axis(0), s).assign(&m.mu);
            activations.index_axis_mut(Axis(0), s).assign(&m.activations);
            coefficients.index_axis_mut(Axis(0), s).assign(&r);
        }

        trace!(
            samples = n,
            inputs = num_inputs,
            outputs = num_out,
            iterations = self.num_iterations,
            mean_activation = activations.mean().unwrap_or(0.0),
            "routage EM terminé"
        );

        RoutingOutput { poses, activations, coefficients }
    }

    fn route_sample(
        &self,
        votes: ArrayView3<f32>,
        a_in: ArrayView1<f32>,
        params: &RoutingParams,
        mix: LambdaMix,
    ) -> (MStep, Array2<f32>) {
        let (num_inputs, num_out, _) = votes.dim();
        let mut r = Array2::from_elem((num_inputs, num_out), 1.0 / num_out as f32);

        let mut iteration = 0;
        loop {
            let lambda = self.lambda_for(&r.view(), params.lambda, mix);
            let m = self.m_step(&a_in, &r.view(), &votes, &lambda.view(), params);
            iteration += 1;
            if iteration == self.num_iterations {
                return (m, r);
            }
            r = self.e_step(&m, &votes);
        }
    }

    /// Température inverse par type de sortie pour le prochain M-step
    pub fn lambda_for(
        &self,
        r: &ArrayView2<f32>,
        schedule: LambdaSchedule,
        mix: LambdaMix,
    ) -> Array1<f32> {
        match mix {
            LambdaMix::RoutingMass => {
                let num_inputs = r.nrows() as f32;
                r.sum_axis(Axis(0)).mapv(|mass| schedule.at(mass / num_inputs))
            }
            LambdaMix::Progress(t) => Array1::from_elem(r.ncols(), schedule.at(t)),
        }
    }

    /// Ajustement gaussien pondéré par type de sortie, puis son activation.
    ///
    /// La moyenne et la variance sont pondérées par `R ⊙ a_in`:
    /// ```text
    /// mu_j      = Σ_i r_ij a_i V_ij / (Σ_i r_ij a_i + eps)
    /// sigma²_j  = Σ_i r_ij a_i (V_ij - mu_j)² / (Σ_i r_ij a_i + eps) + eps
    /// cost_j    = Σ_h (beta_u_j + ln sigma_jh) · Σ_i r_ij a_i
    /// a_j       = logistic(lambda_j · (beta_a_j - cost_j))
    /// ```
    pub fn m_step(
        &self,
        a_in: &ArrayView1<f32>,
        r: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        lambda: &ArrayView1<f32>,
        params: &RoutingParams,
    ) -> MStep {
        let (num_inputs, num_out, psize) = votes.dim();
        let eps = self.eps;

        let mut r_sum = Array1::<f32>::zeros(num_out);
        for i in 0..num_inputs {
            for j in 0..num_out {
                r_sum[j] += r[[i, j]] * a_in[i];
            }
        }

        let mut mu = Array2::<f32>::zeros((num_out, psize));
        let mut sigma_sq = Array2::<f32>::zeros((num_out, psize));
        let mut activations = Array1::<f32>::zeros(num_out);

        for j in 0..num_out {
            let denom = r_sum[j] + eps;

            for i in 0..num_inputs {
                let coeff = r[[i, j]] * a_in[i] / denom;
                for h in 0..psize {
                    mu[[j, h]] += coeff * votes[[i, j, h]];
                }
            }

            for i in 0..num_inputs {
                let coeff = r[[i, j]] * a_in[i] / denom;
                for h in 0..psize {
                    let diff = votes[[i, j, h]] - mu[[j, h]];
                    sigma_sq[[j, h]] += coeff * diff * diff;
                }
            }

            let mut cost = 0.0;
            for h in 0..psize {
                sigma_sq[[j, h]] += eps;
                // ln(sqrt(x)) = 0.5 ln(x)
                cost += (params.beta_u[j] + 0.5 * sigma_sq[[j, h]].ln()) * r_sum[j];
            }

            activations[j] = sigmoid(lambda[j] * (params.beta_a[j] - cost));
        }

        MStep { activations, mu, sigma_sq }
    }

    /// Responsabilités: log-vraisemblance gaussienne diagonale plus ln a_j,
    /// normalisées sur les types de sortie.
    pub fn e_step(&self, m: &MStep, votes: &ArrayView3<f32>) -> Array2<f32> {
        let (num_inputs, num_out, psize) = votes.dim();
        let ln_2pi = (2.0 * PI).ln();
        let log_a = m.activations.mapv(|a| (a + self.eps).ln());

        let mut logits = Array2::<f32>::zeros((num_inputs, num_out));
        for i in 0..num_inputs {
            for j in 0..num_out {
                let mut ln_p = 0.0;
                for h in 0..psize {
                    let var = m.sigma_sq[[j, h]];
                    let diff = votes[[i, j, h]] - m.mu[[j, h]];
                    ln_p -= diff * diff / (2.0 * var) + 0.5 * (ln_2pi + var.ln());
                }
                logits[[i, j]] = ln_p + log_a[j];
            }
        }

        softmax_rows(logits)
    }
}

/// Softmax par ligne avec soustraction du max
///
/// Une ligne sans maximum fini retombe sur la distribution uniforme.
pub fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    let width = logits.ncols();
    for mut row in logits.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max_val.is_finite() {
            row.fill(1.0 / width as f32);
            continue;
        }

        row.mapv_inplace(|v| (v - max_val).exp());
        let exp_sum = row.sum();
        row /= exp_sum;
    }
    logits
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array2, Array4};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_inputs(
        n: usize,
        b: usize,
        c: usize,
        psize: usize,
        seed: u64,
    ) -> (Array4<f32>, Array2<f32>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let vote_dist = Uniform::new(-2.0f32, 2.0).unwrap();
        let votes = Array::random_using((n, b, c, psize), vote_dist, &mut rng);
        let a_in = Array::random_using((n, b), Uniform::new(0.0f32, 1.0).unwrap(), &mut rng);
        (votes, a_in)
    }

    fn unit_betas(c: usize) -> (Array1<f32>, Array1<f32>) {
        (Array1::ones(c), Array1::ones(c))
    }

    fn params_with<'a>(
        beta_u: &'a Array1<f32>,
        beta_a: &'a Array1<f32>,
        lambda: LambdaSchedule,
    ) -> RoutingParams<'a> {
        RoutingParams { beta_u: beta_u.view(), beta_a: beta_a.view(), lambda }
    }

    #[test]
    fn test_routing_dimensions() {
        let routing = EmRouting::new(3, 1e-8);
        let (votes, a_in) = random_inputs(4, 18, 5, 16, 1);
        let (beta_u, beta_a) = unit_betas(5);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(0.01, 0.1));

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        assert_eq!(out.poses.dim(), (4, 5, 16));
        assert_eq!(out.activations.dim(), (4, 5));
        assert_eq!(out.coefficients.dim(), (4, 18, 5));
    }

    #[test]
    fn test_coefficients_sum_to_one() {
        let routing = EmRouting::new(3, 1e-8);
        let (votes, a_in) = random_inputs(6, 27, 7, 16, 2);
        let (beta_u, beta_a) = unit_betas(7);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(1.0, 2.0));

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        for row in out.coefficients.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5, "row sums to {}", row.sum());
            assert!(row.iter().all(|&r| (0.0..=1.0).contains(&r)));
        }
    }

    #[test]
    fn test_activations_in_unit_interval() {
        let cases = [(3, LambdaSchedule::new(0.01, 0.1)), (4, LambdaSchedule::new(10.0, 100.0))];
        for (seed, lambda) in cases {
            let routing = EmRouting::new(3, 1e-8);
            let (votes, a_in) = random_inputs(5, 32, 4, 16, seed);
            let (beta_u, beta_a) = unit_betas(4);
            let params = RoutingParams { beta_u: beta_u.view(), beta_a: beta_a.view(), lambda };

            let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::Progress(0.5));

            assert!(out.activations.iter().all(|&a| a.is_finite() && (0.0..=1.0).contains(&a)));
            assert!(out.poses.iter().all(|p| p.is_finite()));
        }
    }

    #[test]
    fn test_single_output_type_closed_form() {
        let routing = EmRouting::new(3, 1e-8);
        let votes = Array4::from_shape_vec((1, 2, 1, 1), vec![1.0, 3.0]).unwrap();
        let a_in = Array2::from_shape_vec((1, 2), vec![1.0, 1.0]).unwrap();
        let (beta_u, beta_a) = unit_betas(1);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(1.0, 2.0));

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        // R = 1, mu = 2, sigma² = 1, cost = (1 + 0) * 2, lambda = high = 2
        let expected = 1.0 / (1.0 + 2.0f64.exp());
        assert!((out.poses[[0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((out.activations[[0, 0]] as f64 - expected).abs() < 1e-6);
        assert_eq!(out.coefficients[[0, 0, 0]], 1.0);
    }

    #[test]
    fn test_single_output_type_weighted_by_activation() {
        let routing = EmRouting::new(2, 1e-8);
        let votes = Array4::from_shape_vec((1, 2, 1, 1), vec![0.0, 3.0]).unwrap();
        let a_in = Array2::from_shape_vec((1, 2), vec![1.0, 0.5]).unwrap();
        let beta_u = Array1::from_elem(1, 0.5);
        let beta_a = Array1::from_elem(1, 2.0);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(0.0, 4.0));

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::Progress(0.25));

        // masse 1.5, mu = 1.5 / 1.5 = 1, sigma² = (1 + 0.5 * 4) / 1.5 = 2, lambda = 1
        let cost = (0.5 + 0.5 * 2.0f64.ln()) * 1.5;
        let expected = 1.0 / (1.0 + (-(2.0 - cost)).exp());
        assert!((out.poses[[0, 0, 0]] - 1.0).abs() < 1e-5);
        assert!((out.activations[[0, 0]] as f64 - expected).abs() < 1e-5);
    }

    #[test]
    fn test_single_iteration_keeps_uniform_coefficients() {
        let routing = EmRouting::new(1, 1e-8);
        let (votes, a_in) = random_inputs(2, 9, 4, 4, 5);
        let (beta_u, beta_a) = unit_betas(4);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::default());

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        assert!(out.coefficients.iter().all(|&r| r == 0.25));
    }

    #[test]
    fn test_e_step_prefers_nearby_cluster() {
        let routing = EmRouting::new(3, 1e-8);
        let m = MStep {
            activations: Array1::from_elem(2, 0.5),
            mu: Array2::from_shape_vec((2, 1), vec![0.0, 10.0]).unwrap(),
            sigma_sq: Array2::ones((2, 1)),
        };
        let votes = Array3::zeros((3, 2, 1));

        let r = routing.e_step(&m, &votes.view());

        for i in 0..3 {
            assert!(r[[i, 0]] > 0.999);
            assert!((r.row(i).sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_e_step_favors_active_outputs() {
        let routing = EmRouting::new(3, 1e-8);
        let m = MStep {
            activations: Array1::from_shape_vec(2, vec![0.9, 0.1]).unwrap(),
            mu: Array2::zeros((2, 4)),
            sigma_sq: Array2::ones((2, 4)),
        };
        let votes = Array3::zeros((1, 2, 4));

        let r = routing.e_step(&m, &votes.view());

        assert!((r[[0, 0]] - 0.9).abs() < 1e-5);
        assert!((r[[0, 1]] - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_routing_mass_lambda() {
        let routing = EmRouting::new(3, 1e-8);
        let schedule = LambdaSchedule::new(1.0, 5.0);
        let uniform = Array2::from_elem((6, 4), 0.25);

        let lambda = routing.lambda_for(&uniform.view(), schedule, LambdaMix::RoutingMass);
        assert!(lambda.iter().all(|&l| (l - 2.0).abs() < 1e-6));

        let mut skewed = Array2::<f32>::zeros((2, 2));
        skewed[[0, 0]] = 1.0;
        skewed[[1, 0]] = 1.0;
        let lambda = routing.lambda_for(&skewed.view(), schedule, LambdaMix::RoutingMass);
        assert_eq!(lambda.to_vec(), vec![5.0, 1.0]);

        let lambda = routing.lambda_for(&skewed.view(), schedule, LambdaMix::Progress(0.5));
        assert_eq!(lambda.to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = Array2::from_shape_fn((8, 10), |(i, j)| (i * j) as f32 * 0.37 - 4.0);
        let coeffs = softmax_rows(logits);

        for row in coeffs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_softmax_extreme_logits() {
        let inf = f32::NEG_INFINITY;
        let logits = Array2::from_shape_vec((2, 3), vec![1e30, -1e30, 0.0, inf, inf, inf]).unwrap();
        let coeffs = softmax_rows(logits);

        assert_eq!(coeffs.row(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert!(coeffs.row(1).iter().all(|&r| (r - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_zero_activation_inputs_stay_finite() {
        let routing = EmRouting::new(3, 1e-8);
        let (votes, _) = random_inputs(2, 9, 3, 16, 6);
        let a_in = Array2::<f32>::zeros((2, 9));
        let (beta_u, beta_a) = unit_betas(3);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(1.0, 2.0));

        let out = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        assert!(out.poses.iter().all(|p| p.is_finite()));
        assert!(out.activations.iter().all(|a| a.is_finite()));
        assert!(out.coefficients.iter().all(|r| r.is_finite()));
    }

    #[test]
    fn test_routing_is_deterministic() {
        let routing = EmRouting::new(3, 1e-8);
        let (votes, a_in) = random_inputs(8, 18, 6, 16, 7);
        let (beta_u, beta_a) = unit_betas(6);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::new(0.1, 1.0));

        let first = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);
        let second = routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);

        assert_eq!(first.activations, second.activations);
        assert_eq!(first.poses, second.poses);
    }

    #[test]
    #[should_panic(expected = "input activations")]
    fn test_rejects_mismatched_activations() {
        let routing = EmRouting::new(3, 1e-8);
        let (votes, _) = random_inputs(2, 9, 3, 4, 8);
        let a_in = Array2::<f32>::zeros((2, 8));
        let (beta_u, beta_a) = unit_betas(3);
        let params = params_with(&beta_u, &beta_a, LambdaSchedule::default());

        routing.route(&votes.view(), &a_in.view(), &params, LambdaMix::RoutingMass);
    }
}
