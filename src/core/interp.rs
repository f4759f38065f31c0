use crate::types::{HsiError, HsiResult};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Behaviour of an interpolant outside its knot range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtrapolationPolicy {
    /// Hold the value of the nearest knot
    #[default]
    Clamp,
    /// Continue along the secant through the two outermost knots
    Linear,
}

/// Interpolant family between knots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpolationKind {
    Linear,
    /// Natural cubic spline (falls back to linear with fewer than 3 knots)
    #[default]
    Cubic,
}

/// One-dimensional interpolant over strictly increasing knots
#[derive(Debug, Clone)]
pub struct Interpolator {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots (all zero for linear)
    m: Vec<f64>,
    extrapolation: ExtrapolationPolicy,
}

impl Interpolator {
    pub fn new(
        x: &[f64],
        y: &[f64],
        kind: InterpolationKind,
        extrapolation: ExtrapolationPolicy,
    ) -> HsiResult<Self> {
        if x.len() != y.len() {
            return Err(HsiError::Processing(format!(
                "Interpolation knots have mismatched lengths ({} vs {})",
                x.len(),
                y.len()
            )));
        }
        if x.is_empty() {
            return Err(HsiError::Processing("Interpolation needs at least one knot".to_string()));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(HsiError::Processing("Interpolation knots must be finite".to_string()));
        }
        if let Some(w) = x.windows(2).find(|w| w[1] <= w[0]) {
            return Err(HsiError::Processing(format!(
                "Interpolation knots must be strictly increasing ({} followed by {})",
                w[0], w[1]
            )));
        }

        let m = second_derivatives(x, y, kind);

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
            extrapolation,
        })
    }

    pub fn extrapolation(&self) -> ExtrapolationPolicy {
        self.extrapolation
    }

    pub fn knots(&self) -> (&[f64], &[f64]) {
        (&self.x, &self.y)
    }

    pub fn eval(&self, xq: f64) -> f64 {
        eval_knots(
            ArrayView1::from(self.x.as_slice()),
            ArrayView1::from(self.y.as_slice()),
            ArrayView1::from(self.m.as_slice()),
            self.extrapolation,
            xq,
        )
    }
}

/// Knot second derivatives for `kind`; zero for linear or fewer than 3 knots
pub(crate) fn second_derivatives(x: &[f64], y: &[f64], kind: InterpolationKind) -> Vec<f64> {
    match kind {
        InterpolationKind::Cubic if x.len() >= 3 => natural_second_derivatives(x, y),
        _ => vec![0.0; x.len()],
    }
}

/// Evaluate the piecewise cubic through `(x, y)` with knot second
/// derivatives `m`. Knots must be strictly increasing and non-empty.
pub(crate) fn eval_knots(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    m: ArrayView1<f64>,
    extrapolation: ExtrapolationPolicy,
    xq: f64,
) -> f64 {
    let n = x.len();
    if n == 1 {
        return y[0];
    }

    let (x0, xn) = (x[0], x[n - 1]);
    if xq < x0 || xq > xn {
        return match extrapolation {
            ExtrapolationPolicy::Clamp => {
                if xq < x0 {
                    y[0]
                } else {
                    y[n - 1]
                }
            }
            ExtrapolationPolicy::Linear => {
                let (i, j) = if xq < x0 { (0, 1) } else { (n - 2, n - 1) };
                let slope = (y[j] - y[i]) / (x[j] - x[i]);
                let anchor = if xq < x0 { i } else { j };
                y[anchor] + slope * (xq - x[anchor])
            }
        };
    }

    // Segment k spans [x[k], x[k+1]]
    let (mut k, mut hi) = (0, n - 1);
    while hi - k > 1 {
        let mid = (k + hi) / 2;
        if x[mid] <= xq {
            k = mid;
        } else {
            hi = mid;
        }
    }
    let h = x[k + 1] - x[k];
    let a = (x[k + 1] - xq) / h;
    let b = (xq - x[k]) / h;
    a * y[k] + b * y[k + 1] + ((a * a * a - a) * m[k] + (b * b * b - b) * m[k + 1]) * h * h / 6.0
}

/// Second derivatives of the natural cubic spline through the knots (Thomas algorithm)
fn natural_second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut m = vec![0.0; n];
    let mut c_prime = vec![0.0; n];
    let mut d_prime = vec![0.0; n];

    for i in 1..n - 1 {
        let h0 = x[i] - x[i - 1];
        let h1 = x[i + 1] - x[i];
        let a = h0;
        let b = 2.0 * (h0 + h1);
        let c = h1;
        let d = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);

        let denom = b - a * c_prime[i - 1];
        c_prime[i] = c / denom;
        d_prime[i] = (d - a * d_prime[i - 1]) / denom;
    }

    for i in (1..n - 1).rev() {
        m[i] = d_prime[i] - c_prime[i] * m[i + 1];
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_knots_are_reproduced() {
        let x = [1.0, 2.0, 4.0, 8.0];
        let y = [3.0, -1.0, 2.0, 5.0];
        for kind in [InterpolationKind::Linear, InterpolationKind::Cubic] {
            let interp = Interpolator::new(&x, &y, kind, ExtrapolationPolicy::Clamp).unwrap();
            for (xi, yi) in x.iter().zip(y.iter()) {
                assert_abs_diff_eq!(interp.eval(*xi), *yi, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_cubic_reproduces_straight_line() {
        let x = [0.0, 1.0, 3.0, 6.0, 10.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let interp =
            Interpolator::new(&x, &y, InterpolationKind::Cubic, ExtrapolationPolicy::Clamp).unwrap();
        assert_abs_diff_eq!(interp.eval(4.5), 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(interp.eval(0.25), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_extrapolation_policies() {
        let x = [10.0, 20.0, 30.0];
        let y = [1.0, 2.0, 4.0];

        let clamp =
            Interpolator::new(&x, &y, InterpolationKind::Cubic, ExtrapolationPolicy::Clamp).unwrap();
        assert_eq!(clamp.eval(0.0), 1.0);
        assert_eq!(clamp.eval(100.0), 4.0);

        let linear =
            Interpolator::new(&x, &y, InterpolationKind::Cubic, ExtrapolationPolicy::Linear).unwrap();
        // Secant through (20, 2) and (30, 4)
        assert_abs_diff_eq!(linear.eval(40.0), 6.0, epsilon = 1e-12);
        // Secant through (10, 1) and (20, 2)
        assert_abs_diff_eq!(linear.eval(0.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_single_knot_is_constant() {
        let interp =
            Interpolator::new(&[5.0], &[7.0], InterpolationKind::Cubic, ExtrapolationPolicy::Linear)
                .unwrap();
        assert_eq!(interp.eval(-3.0), 7.0);
        assert_eq!(interp.eval(50.0), 7.0);
    }

    #[test]
    fn test_rejects_unsorted_knots() {
        let result = Interpolator::new(
            &[1.0, 1.0, 2.0],
            &[0.0, 1.0, 2.0],
            InterpolationKind::Linear,
            ExtrapolationPolicy::Clamp,
        );
        assert!(result.is_err());
    }
}
