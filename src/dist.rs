//! Seedable pseudo-random numbers and the distributions drawn from them.
//!
//! Every distribution owns its own Lehmer generator so that two tasks
//! sharing distribution parameters still draw independent streams. A
//! distribution is never cloned: `copy_from` advances a parent generator
//! once and seeds a fresh instance from the result, which keeps
//! Monte-Carlo workloads reproducible for a fixed top-level seed.

use std::f64::consts::PI;
use std::fmt;

use serde::Serialize;

/// Seeds are XORed with this so that seed 0 is usable.
pub const RAND_MASK: u32 = 123_456_789;

const LEHMER_M: u64 = 2_147_483_647;
const LEHMER_G: u64 = 16_807;

/// Minimal-standard Lehmer generator (multiplier 16807, modulus 2^31 - 1).
///
/// The step is computed exactly in 64 bits and the XORed seed is reduced
/// into the modulus. A 32-bit multiply would wrap for states above
/// `u32::MAX / 16807` and fall into cycles of a few ten thousand draws, so
/// seeded runs do not reproduce streams produced with that truncation.
#[derive(Debug)]
pub struct LehmerRng {
    state: u32,
}

impl LehmerRng {
    pub fn new(seed: u32) -> Self {
        let state = ((seed ^ RAND_MASK) as u64 % LEHMER_M) as u32;
        // Zero is a fixed point of the recurrence.
        Self {
            state: if state == 0 { 1 } else { state },
        }
    }

    /// Next value in `(0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.state = (LEHMER_G * self.state as u64 % LEHMER_M) as u32;
        self.state as f64 / LEHMER_M as f64
    }

    /// A value in `[low, high)`.
    pub fn range(&mut self, low: f64, high: f64) -> f64 {
        let r = self.next_f64();
        low + r * (high - low)
    }

    pub fn state(&self) -> u32 {
        self.state
    }
}

/// Distribution family, as named in workload files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DistKind {
    Gaussian,
    Poisson,
    Exponential,
    Lognormal,
}

impl DistKind {
    /// Indexable in the order random type selection uses.
    pub const ALL: [DistKind; 4] = [
        DistKind::Gaussian,
        DistKind::Poisson,
        DistKind::Exponential,
        DistKind::Lognormal,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            DistKind::Gaussian => "GAUSSIAN",
            DistKind::Poisson => "POISSON",
            DistKind::Exponential => "EXPONENTIAL",
            DistKind::Lognormal => "LOGNORMAL",
        }
    }
}

/// Parameters of a distribution without its generator state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DistParams {
    Gaussian { mu: i32, sigma: i32 },
    Poisson { mu: i32 },
    Exponential { mu: i32 },
    Lognormal { meanlog: f64, sdlog: f64 },
}

impl DistParams {
    pub fn kind(&self) -> DistKind {
        match self {
            DistParams::Gaussian { .. } => DistKind::Gaussian,
            DistParams::Poisson { .. } => DistKind::Poisson,
            DistParams::Exponential { .. } => DistKind::Exponential,
            DistParams::Lognormal { .. } => DistKind::Lognormal,
        }
    }

    /// Build a distribution with these parameters and a fresh generator.
    pub fn instantiate(self, seed: u32) -> RandDist {
        let state = match self {
            DistParams::Lognormal { .. } => DistState::Lognormal(Box::new(RandDist {
                params: DistParams::Gaussian { mu: 0, sigma: 1 },
                state: DistState::Own(LehmerRng::new(seed)),
            })),
            _ => DistState::Own(LehmerRng::new(seed)),
        };
        RandDist {
            params: self,
            state,
        }
    }

    /// Advance `parent` once and build a distribution seeded from it.
    pub fn reseed(self, parent: &mut LehmerRng) -> RandDist {
        parent.next_f64();
        self.instantiate(parent.state())
    }
}

impl fmt::Display for DistParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistParams::Lognormal { meanlog, sdlog } => {
                write!(f, "LOGNORMAL: meanlog = {meanlog:.6}, sdlog = {sdlog:.6}")
            }
            DistParams::Gaussian { mu, sigma } => write!(f, "GAUSSIAN: mean = {mu}, sd = {sigma}"),
            DistParams::Poisson { mu } => write!(f, "POISSON: mean = {mu}"),
            DistParams::Exponential { mu } => write!(f, "EXPONENTIAL: mean = {mu}"),
        }
    }
}

#[derive(Debug)]
enum DistState {
    Own(LehmerRng),
    /// Lognormal draws come from a nested standard normal.
    Lognormal(Box<RandDist>),
}

/// A seeded random distribution. Deliberately not `Clone`.
#[derive(Debug)]
pub struct RandDist {
    params: DistParams,
    state: DistState,
}

impl RandDist {
    pub fn gaussian(mu: i32, sigma: i32, seed: u32) -> Self {
        DistParams::Gaussian { mu, sigma }.instantiate(seed)
    }

    pub fn poisson(mu: i32, seed: u32) -> Self {
        DistParams::Poisson { mu }.instantiate(seed)
    }

    pub fn exponential(mu: i32, seed: u32) -> Self {
        DistParams::Exponential { mu }.instantiate(seed)
    }

    pub fn lognormal(meanlog: f64, sdlog: f64, seed: u32) -> Self {
        DistParams::Lognormal { meanlog, sdlog }.instantiate(seed)
    }

    pub fn params(&self) -> DistParams {
        self.params
    }

    pub fn kind(&self) -> DistKind {
        self.params.kind()
    }

    /// Advance `parent` once and seed an independent copy from it.
    pub fn copy_from(&self, parent: &mut LehmerRng) -> RandDist {
        self.params.reseed(parent)
    }

    /// Draw the next value.
    pub fn sample(&mut self) -> f64 {
        match (&self.params, &mut self.state) {
            (DistParams::Gaussian { mu, sigma }, DistState::Own(rng)) => {
                gaussian(*mu as f64, *sigma as f64, rng)
            }
            (DistParams::Poisson { mu }, DistState::Own(rng)) => poisson(*mu as f64, rng),
            (DistParams::Exponential { mu }, DistState::Own(rng)) => {
                let mut u = rng.next_f64();
                while u == 0.0 {
                    u = rng.next_f64();
                }
                -(*mu as f64) * u.ln()
            }
            (DistParams::Lognormal { meanlog, sdlog }, DistState::Lognormal(std)) => {
                let dev = std.sample();
                (meanlog + dev * sdlog).exp()
            }
            _ => unreachable!("distribution state does not match its parameters"),
        }
    }

    /// Draw a duration in nanoseconds. Negative draws clamp to zero.
    pub fn sample_ns(&mut self) -> u64 {
        self.sample().max(0.0) as u64
    }
}

impl fmt::Display for RandDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.params.fmt(f)
    }
}

/// Polar Box-Muller.
fn gaussian(mu: f64, sigma: f64, rng: &mut LehmerRng) -> f64 {
    loop {
        let x = -1.0 + 2.0 * rng.next_f64();
        let y = -1.0 + 2.0 * rng.next_f64();
        let r2 = x * x + y * y;
        if r2 <= 1.0 && r2 != 0.0 {
            return mu + sigma * y * (-2.0 * r2.ln() / r2).sqrt();
        }
    }
}

/// Log of the gamma function (Lanczos approximation).
pub fn gammaln(xx: f64) -> f64 {
    const COF: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866170e-2,
        -0.5395239384953e-5,
    ];
    let x = xx;
    let mut y = xx;
    let mut tmp = x + 5.5;
    tmp -= (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

/// Poisson deviate: direct product method for small means, rejection
/// against a Lorentzian for large ones.
fn poisson(mu: f64, rng: &mut LehmerRng) -> f64 {
    if mu < 12.0 {
        let g = (-mu).exp();
        let mut em = -1.0;
        let mut t = 1.0;
        loop {
            em += 1.0;
            t *= rng.next_f64();
            if t <= g {
                return em;
            }
        }
    }

    let sq = (2.0 * mu).sqrt();
    let alxm = mu.ln();
    let g = mu * alxm - gammaln(mu + 1.0);
    loop {
        let (em, y) = loop {
            let y = (PI * rng.next_f64()).tan();
            let em = sq * y + mu;
            if em >= 0.0 {
                break (em.floor(), y);
            }
        };
        let t = 0.9 * (1.0 + y * y) * (em * alxm - gammaln(em + 1.0) - g).exp();
        if rng.next_f64() <= t {
            return em;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(d: &mut RandDist, n: usize) -> f64 {
        (0..n).map(|_| d.sample()).sum::<f64>() / n as f64
    }

    #[test]
    fn test_lehmer_is_deterministic() {
        let mut a = LehmerRng::new(7);
        let mut b = LehmerRng::new(7);
        for _ in 0..100 {
            let x = a.next_f64();
            assert_eq!(x, b.next_f64());
            assert!(x > 0.0 && x < 1.0);
        }
        // First step from seed 0 is 16807 * MASK mod M.
        let mut z = LehmerRng::new(0);
        z.next_f64();
        assert_eq!(z.state() as u64, 16_807 * 123_456_789 % 2_147_483_647);
    }

    #[test]
    fn test_lehmer_step_does_not_truncate() {
        // (M - 1) * 16807 overflows 32 bits; exactly it is -16807 mod M.
        let mut rng = LehmerRng::new((LEHMER_M as u32 - 1) ^ RAND_MASK);
        assert_eq!(rng.state(), LEHMER_M as u32 - 1);
        rng.next_f64();
        assert_eq!(rng.state(), LEHMER_M as u32 - 16_807);

        // Seeds above the modulus are reduced into it.
        let rng = LehmerRng::new(u32::MAX ^ RAND_MASK);
        assert_eq!(rng.state() as u64, u32::MAX as u64 % LEHMER_M);

        // The stream does not repeat within the first hundred thousand draws.
        let mut rng = LehmerRng::new(7);
        let first = rng.state();
        for _ in 0..100_000 {
            rng.next_f64();
            assert_ne!(rng.state(), first);
        }
    }

    #[test]
    fn test_range_bounds() {
        let mut rng = LehmerRng::new(3);
        for _ in 0..1000 {
            let v = rng.range(5.0, 10.0);
            assert!((5.0..10.0).contains(&v));
        }
    }

    #[test]
    fn test_distribution_means() {
        let mut g = RandDist::gaussian(100, 10, 1);
        assert!((mean(&mut g, 20_000) - 100.0).abs() < 1.0);

        let mut p = RandDist::poisson(5, 2);
        assert!((mean(&mut p, 20_000) - 5.0).abs() < 0.2);

        let mut p = RandDist::poisson(50, 3);
        assert!((mean(&mut p, 20_000) - 50.0).abs() < 1.0);

        let mut e = RandDist::exponential(1000, 4);
        assert!((mean(&mut e, 50_000) - 1000.0).abs() < 30.0);

        let mut l = RandDist::lognormal(1.0, 0.5, 5);
        for _ in 0..1000 {
            assert!(l.sample() > 0.0);
        }
    }

    #[test]
    fn test_copies_are_independent() {
        let mut parent = LehmerRng::new(11);
        let template = RandDist::exponential(500, 0);
        let mut a = template.copy_from(&mut parent);
        let mut b = template.copy_from(&mut parent);
        assert_eq!(a.params(), b.params());
        let sa: Vec<f64> = (0..5).map(|_| a.sample()).collect();
        let sb: Vec<f64> = (0..5).map(|_| b.sample()).collect();
        assert_ne!(sa, sb);
    }

    #[test]
    fn test_gammaln_matches_factorial() {
        // ln(4!) = ln(24)
        assert!((gammaln(5.0) - 24f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RandDist::lognormal(1.5, 0.25, 0).to_string(),
            "LOGNORMAL: meanlog = 1.500000, sdlog = 0.250000"
        );
        assert_eq!(RandDist::gaussian(3, 4, 0).to_string(), "GAUSSIAN: mean = 3, sd = 4");
        assert_eq!(RandDist::poisson(9, 0).to_string(), "POISSON: mean = 9");
        assert_eq!(RandDist::exponential(7, 0).to_string(), "EXPONENTIAL: mean = 7");
    }
}
