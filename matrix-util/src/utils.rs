/// `n` points evenly spaced on a log10 scale between `10^lb` and `10^ub`
/// (both inclusive)
pub fn logspace(lb: f64, ub: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![10_f64.powf(lb)],
        _ => {
            let step = (ub - lb) / (n - 1) as f64;
            (0..n)
                .map(|i| 10_f64.powf(lb + step * i as f64))
                .collect()
        }
    }
}
