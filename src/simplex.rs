//! Derivative-free minimization with the Nelder–Mead simplex method.
//!
//! The refinement cost is piecewise smooth at best (pairs appear and vanish as
//! parameters move), so only function values are used. [`NelderMead`] follows
//! the classic formulation: reflection, expansion, inside/outside contraction
//! and shrink with coefficients `(1, 2, ½, ½)`. The starting simplex perturbs
//! each coordinate of `x0` by 5 %, or by `0.00025` where the coordinate is
//! zero.

/// Result of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    /// Best parameters found.
    pub x: Vec<f64>,
    /// Function value at `x`.
    pub fun: f64,
    /// Whether the convergence tolerances were met before any budget ran out.
    pub converged: bool,
    /// Simplex iterations performed.
    pub iterations: usize,
    /// Function evaluations performed.
    pub evaluations: usize,
}

/// A derivative-free minimizer over a real parameter vector.
pub trait Minimizer {
    fn minimize(&self, f: &dyn Fn(&[f64]) -> f64, x0: &[f64]) -> Minimum;
}

/// Nelder–Mead simplex minimizer.
#[derive(Debug, Clone, Copy)]
pub struct NelderMead {
    /// Absolute tolerance on the spread of function values over the simplex.
    pub fatol: f64,
    /// Absolute tolerance on the spread of the simplex vertices.
    pub xatol: f64,
    /// Iteration budget.
    pub max_iter: Option<usize>,
    /// Evaluation budget.
    ///
    /// With neither budget set both default to `200 * n`. Setting only one
    /// leaves the other unlimited.
    pub max_fev: Option<usize>,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            fatol: 1e-4,
            xatol: 1e-4,
            max_iter: None,
            max_fev: None,
        }
    }
}

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;
const NONZERO_DELTA: f64 = 0.05;
const ZERO_DELTA: f64 = 0.00025;

/// Affine combination `a * p + b * q`.
fn combine(a: f64, p: &[f64], b: f64, q: &[f64]) -> Vec<f64> {
    p.iter().zip(q.iter()).map(|(pi, qi)| a * pi + b * qi).collect()
}

impl Minimizer for NelderMead {
    fn minimize(&self, f: &dyn Fn(&[f64]) -> f64, x0: &[f64]) -> Minimum {
        let n = x0.len();
        let default_budget = 200 * n.max(1);
        let (max_iter, max_fev) = match (self.max_iter, self.max_fev) {
            (None, None) => (default_budget, default_budget),
            (Some(it), None) => (it, usize::MAX),
            (None, Some(fev)) => (usize::MAX, fev),
            (Some(it), Some(fev)) => (it, fev),
        };

        let evaluations = std::cell::Cell::new(0usize);
        let eval = |x: &[f64]| -> f64 {
            evaluations.set(evaluations.get() + 1);
            let v = f(x);
            if v.is_nan() {
                f64::INFINITY
            } else {
                v
            }
        };

        if n == 0 {
            let fun = eval(x0);
            return Minimum {
                x: Vec::new(),
                fun,
                converged: true,
                iterations: 0,
                evaluations: evaluations.get(),
            };
        }

        // Initial simplex
        let mut sim: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
        sim.push(x0.to_vec());
        for k in 0..n {
            let mut y = x0.to_vec();
            y[k] = if y[k] != 0.0 {
                (1.0 + NONZERO_DELTA) * y[k]
            } else {
                ZERO_DELTA
            };
            sim.push(y);
        }
        let mut fsim: Vec<f64> = sim.iter().map(|x| eval(x)).collect();
        sort_simplex(&mut sim, &mut fsim);

        let mut iterations = 1;
        let mut converged = false;

        while evaluations.get() < max_fev && iterations < max_iter {
            let x_spread = sim[1..]
                .iter()
                .flat_map(|v| v.iter().zip(sim[0].iter()).map(|(a, b)| (a - b).abs()))
                .fold(0.0f64, f64::max);
            let f_spread = fsim[1..]
                .iter()
                .map(|v| (fsim[0] - v).abs())
                .fold(0.0f64, f64::max);
            if x_spread <= self.xatol && f_spread <= self.fatol {
                converged = true;
                break;
            }

            // Centroid of all vertices but the worst.
            let mut xbar = vec![0.0; n];
            for v in &sim[..n] {
                for (c, vi) in xbar.iter_mut().zip(v.iter()) {
                    *c += vi / n as f64;
                }
            }
            let worst = sim[n].clone();

            let xr = combine(1.0 + RHO, &xbar, -RHO, &worst);
            let fxr = eval(&xr);
            let mut shrink = false;

            if fxr < fsim[0] {
                let xe = combine(1.0 + RHO * CHI, &xbar, -RHO * CHI, &worst);
                let fxe = eval(&xe);
                if fxe < fxr {
                    sim[n] = xe;
                    fsim[n] = fxe;
                } else {
                    sim[n] = xr;
                    fsim[n] = fxr;
                }
            } else if fxr < fsim[n - 1] {
                sim[n] = xr;
                fsim[n] = fxr;
            } else if fxr < fsim[n] {
                // Outside contraction
                let xc = combine(1.0 + PSI * RHO, &xbar, -PSI * RHO, &worst);
                let fxc = eval(&xc);
                if fxc <= fxr {
                    sim[n] = xc;
                    fsim[n] = fxc;
                } else {
                    shrink = true;
                }
            } else {
                // Inside contraction
                let xcc = combine(1.0 - PSI, &xbar, PSI, &worst);
                let fxcc = eval(&xcc);
                if fxcc < fsim[n] {
                    sim[n] = xcc;
                    fsim[n] = fxcc;
                } else {
                    shrink = true;
                }
            }

            if shrink {
                let best = sim[0].clone();
                for j in 1..=n {
                    sim[j] = combine(1.0 - SIGMA, &best, SIGMA, &sim[j]);
                    fsim[j] = eval(&sim[j]);
                }
            }

            iterations += 1;
            sort_simplex(&mut sim, &mut fsim);
        }

        Minimum {
            x: sim.swap_remove(0),
            fun: fsim[0],
            converged,
            iterations,
            evaluations: evaluations.get(),
        }
    }
}

/// Order vertices by ascending function value.
fn sort_simplex(sim: &mut Vec<Vec<f64>>, fsim: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..fsim.len()).collect();
    order.sort_by(|&a, &b| fsim[a].total_cmp(&fsim[b]));
    *sim = order.iter().map(|&i| sim[i].clone()).collect();
    *fsim = order.iter().map(|&i| fsim[i]).collect();
}
