//! Levenberg-Marquardt optimizer for small fixed-size parameter vectors.
//!
//! f64 throughout; patches are at most a few hundred pixels.

#[derive(Debug, Clone)]
pub(crate) struct LmConfig {
    pub max_iterations: usize,
    /// Stop once every parameter step is below this.
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 250,
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LmResult<const N: usize> {
    pub params: [f64; N],
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
}

pub(crate) trait LmModel<const N: usize> {
    fn evaluate(&self, x: f64, y: f64, params: &[f64; N]) -> f64;

    fn jacobian_row(&self, x: f64, y: f64, params: &[f64; N]) -> [f64; N];

    /// Clamp parameters back into their valid range after an update.
    fn constrain(&self, params: &mut [f64; N]);
}

/// Sample point `(x, y, value)`.
pub(crate) type Sample = (f64, f64, f64);

/// Returns `None` when the normal equations are singular on the first step.
pub(crate) fn optimize<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &[Sample],
    initial: [f64; N],
    config: &LmConfig,
) -> Option<LmResult<N>> {
    let mut params = initial;
    let mut lambda = config.initial_lambda;
    let mut chi2 = compute_chi2(model, samples, &params);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let (hessian, gradient) = normal_equations(model, samples, &params);
        let mut damped = hessian;
        for (i, row) in damped.iter_mut().enumerate() {
            row[i] *= 1.0 + lambda;
        }

        let Some(delta) = solve(&damped, &gradient) else {
            if iter == 0 {
                return None;
            }
            break;
        };

        let mut candidate = params;
        for (p, d) in candidate.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut candidate);

        let new_chi2 = compute_chi2(model, samples, &candidate);
        if new_chi2 < chi2 {
            params = candidate;
            chi2 = new_chi2;
            lambda *= config.lambda_down;

            let max_delta = delta.iter().fold(0.0f64, |a, d| a.max(d.abs()));
            if max_delta < config.convergence_threshold {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e10 {
                // No downhill step left at any damping.
                converged = true;
                break;
            }
        }
    }

    Some(LmResult {
        params,
        chi2,
        converged,
        iterations,
    })
}

fn compute_chi2<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &[Sample],
    params: &[f64; N],
) -> f64 {
    samples
        .iter()
        .map(|&(x, y, z)| {
            let r = z - model.evaluate(x, y, params);
            r * r
        })
        .sum()
}

/// `(JᵀJ, Jᵀr)`; only the upper triangle is accumulated.
#[allow(clippy::needless_range_loop)]
fn normal_equations<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &[Sample],
    params: &[f64; N],
) -> ([[f64; N]; N], [f64; N]) {
    let mut hessian = [[0.0f64; N]; N];
    let mut gradient = [0.0f64; N];

    for &(x, y, z) in samples {
        let row = model.jacobian_row(x, y, params);
        let r = z - model.evaluate(x, y, params);
        for i in 0..N {
            gradient[i] += row[i] * r;
            for j in i..N {
                hessian[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 1..N {
        for j in 0..i {
            hessian[i][j] = hessian[j][i];
        }
    }

    (hessian, gradient)
}

/// Gaussian elimination with partial pivoting. `None` if singular.
#[allow(clippy::needless_range_loop)]
pub(crate) fn solve<const N: usize>(a: &[[f64; N]; N], b: &[f64; N]) -> Option<[f64; N]> {
    let mut m = *a;
    let mut rhs = *b;

    for col in 0..N {
        let mut pivot = col;
        for row in (col + 1)..N {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            m.swap(col, pivot);
            rhs.swap(col, pivot);
        }

        for row in (col + 1)..N {
            let factor = m[row][col] / m[col][col];
            let pivot_row = m[col];
            for (j, v) in m[row].iter_mut().enumerate().skip(col) {
                *v -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= m[i][j] * xj;
        }
        x[i] = sum / m[i][i];
    }
    Some(x)
}
