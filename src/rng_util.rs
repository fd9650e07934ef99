/// Draw a standard normal variate (Box–Muller).
pub(crate) fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    // 1 - U keeps the argument of ln strictly positive.
    let u1 = 1.0 - rng.f64();
    let u2 = rng.f64();
    (-2.0 * u1.ln()).sqrt() * (core::f64::consts::TAU * u2).cos()
}

/// Draw a standard Gumbel variate.
pub(crate) fn standard_gumbel(rng: &mut fastrand::Rng) -> f64 {
    let u = (1.0 - rng.f64()).clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
    -(-u.ln()).ln()
}

/// A point drawn uniformly from `[0, 1]^dim`.
pub(crate) fn unit_point(rng: &mut fastrand::Rng, dim: usize) -> Vec<f64> {
    (0..dim).map(|_| rng.f64()).collect()
}

/// `SplitMix64` finalizer, used to derive independent per-iteration seeds.
pub(crate) fn mix_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
