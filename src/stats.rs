/*!
Plain statistics over f64 samples, self-contained on purpose.

Everything the quality filter and the statistical engine need lives here:
summary statistics, percentiles with linear interpolation, the Student t
survival function (via the regularized incomplete beta function), t critical
values, and Benjamini-Hochberg adjustment. The special functions are the
classic log-gamma (Lanczos) and continued-fraction incomplete beta
evaluations; they are accurate to well beyond what timing data can resolve.
*/

/// The arithmetic mean, or `None` for an empty slice.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        let sum: f64 = xs.iter().sum();
        Some(sum / (xs.len() as f64))
    }
}

/// The Bessel-corrected sample standard deviation. Zero for slices shorter
/// than two, since there is no variance to estimate.
pub fn stddev(xs: &[f64]) -> Option<f64> {
    let n = xs.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(0.0);
    }
    let mean = mean(xs)?;
    let mut deviation_sum_squared = 0.0;
    for &x in xs.iter() {
        deviation_sum_squared += (x - mean).powi(2);
    }
    Some((deviation_sum_squared / ((n - 1) as f64)).sqrt())
}

/// The q-th percentile (q in [0, 1]) of an ascending-sorted slice, using
/// linear interpolation between adjacent ranks.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// One-sided survival function of Student's t distribution: P(T > t) for
/// t >= 0. For negative t, use symmetry.
pub fn students_t_sf(t: f64, df: f64) -> f64 {
    if df <= 0.0 || !t.is_finite() {
        return if t == f64::INFINITY { 0.0 } else { f64::NAN };
    }
    let x = df / (df + t * t);
    let tail = 0.5 * beta_inc(0.5 * df, 0.5, x);
    if t >= 0.0 {
        tail
    } else {
        1.0 - tail
    }
}

/// Two-sided p-value for a t statistic with the given degrees of freedom.
pub fn two_sided_p(t: f64, df: f64) -> f64 {
    (2.0 * students_t_sf(t.abs(), df)).min(1.0)
}

/// The positive t value with the given upper tail probability, e.g.
/// `t_critical(df, 0.025)` for a 95% confidence interval. Solved by
/// bisection on the survival function, which is monotone.
pub fn t_critical(df: f64, tail: f64) -> f64 {
    debug_assert!(0.0 < tail && tail < 0.5);
    let mut lo = 0.0f64;
    let mut hi = 1.0f64;
    while students_t_sf(hi, df) > tail {
        hi *= 2.0;
        if hi > 1e12 {
            break;
        }
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if students_t_sf(mid, df) > tail {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Benjamini-Hochberg adjusted p-values at the same indices as the input.
///
/// Sorting the raw p-values ascending, the adjusted value at rank i (1
/// based) is `p_i * m / i`, clipped to the running minimum from the right
/// and to 1. The procedure is monotone: a smaller raw p never gets a larger
/// adjusted p.
pub fn benjamini_hochberg(ps: &[f64]) -> Vec<f64> {
    let m = ps.len();
    if m == 0 {
        return vec![];
    }
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| ps[i].total_cmp(&ps[j]));
    let mut adjusted = vec![0.0; m];
    let mut running_min = 1.0f64;
    for rank in (1..=m).rev() {
        let idx = order[rank - 1];
        let raw = ps[idx] * (m as f64) / (rank as f64);
        running_min = running_min.min(raw).min(1.0);
        adjusted[idx] = running_min;
    }
    adjusted
}

/// Regularized incomplete beta function I_x(a, b).
fn beta_inc(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
        + a * x.ln()
        + b * (1.0 - x).ln();
    let front = ln_front.exp();
    // The continued fraction converges fast for x below the mean of the
    // distribution; use the symmetry relation on the other side.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * betacf(a, b, x) / a
    } else {
        1.0 - front * betacf(b, a, 1.0 - x) / b
    }
}

/// Continued fraction for the incomplete beta function, evaluated with the
/// modified Lentz method.
fn betacf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3e-15;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        // Reflection formula keeps the approximation in its happy range.
        let pi = std::f64::consts::PI;
        pi.ln() - (pi * x).sin().abs().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut acc = COEFFS[0];
        let t = x + 7.5;
        for (i, &c) in COEFFS.iter().enumerate().skip(1) {
            acc += c / (x + i as f64);
        }
        0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t
            + acc.ln()
    }
}
