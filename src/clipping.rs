/// `ln(exp(a) + exp(b))` without overflow.
pub fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + (-(a - b).abs()).exp().ln_1p()
}

/// Smoothly clip values into `[lower, upper]`.
///
/// The lower side is a smooth maximum `ln(e^{h x} + e^{h l}) / h`, the upper
/// side a smooth minimum. Larger hardness gets closer to a hard clip.
/// Missing bounds leave that side untouched.
pub fn soft_clipping(
    values: &[f64],
    lower: Option<f64>,
    upper: Option<f64>,
    lower_hardness: f64,
    upper_hardness: f64,
) -> Vec<f64> {
    values
        .iter()
        .map(|&x| {
            let x = match lower {
                Some(l) => logaddexp(x * lower_hardness, l * lower_hardness) / lower_hardness,
                None => x,
            };
            match upper {
                Some(u) => -logaddexp(-x * upper_hardness, -u * upper_hardness) / upper_hardness,
                None => x,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logaddexp() {
        assert!((logaddexp(0.0, 0.0) - 2.0_f64.ln()).abs() < 1e-15);
        assert!((logaddexp(1000.0, 1000.0) - (1000.0 + 2.0_f64.ln())).abs() < 1e-12);
        assert_eq!(logaddexp(f64::NEG_INFINITY, 3.0), 3.0);
        assert!((logaddexp(-1e300, 2.0) - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_soft_clipping_lower() {
        let out = soft_clipping(&[-1e300, -5.0, 10.0], Some(-10.0), None, 1.0, 1.0);
        assert!((out[0] + 10.0).abs() < 1e-12);
        assert!(out[1] > -5.0 && out[1] < -4.99);
        // ln(e^10 + e^-10)
        assert!((out[2] - (10.0 + (-20.0_f64).exp().ln_1p())).abs() < 1e-12);
    }

    #[test]
    fn test_soft_clipping_upper_and_hardness() {
        let out = soft_clipping(&[100.0, 0.0], None, Some(1.0), 1.0, 1.0);
        assert!((out[0] - 1.0).abs() < 1e-12);
        assert!(out[1] < 0.0);

        let soft = soft_clipping(&[1.0], None, Some(1.0), 1.0, 1.0)[0];
        let hard = soft_clipping(&[1.0], None, Some(1.0), 1.0, 50.0)[0];
        assert!((1.0 - hard) < (1.0 - soft));
    }

    #[test]
    fn test_no_bounds_is_identity() {
        let values = [-3.0, 0.0, 2.5];
        assert_eq!(soft_clipping(&values, None, None, 1.0, 1.0), values.to_vec());
    }
}
