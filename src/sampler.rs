/*!
# Adaptive Metropolis-Hastings

One [`AdaptiveMetropolis`] instance drives exactly one chain: it proposes a
Gaussian random-walk move, rejects non-positive candidates without touching
the target, accepts or rejects the rest with the Metropolis-Hastings test and,
once past warmup, rescales the proposal every iteration towards a target
acceptance rate:

\[
\sigma_{i+1} = \sigma_i \exp\big(\gamma\,(\hat a_i - a^\star)\big),
\qquad \hat a_i = \frac{\text{accepted}}{i}
\]

Every iteration appends exactly one sample (the accepted candidate or a copy
of the previous state), so a run of `iterations` produces a chain of exactly
`iterations` rows.

## Example

```rust
use sir_calibrate::distributions::Target;
use sir_calibrate::sampler::AdaptiveMetropolis;

#[derive(Clone)]
struct Exponential;

impl Target for Exponential {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        -theta[0]
    }
}

let mut sampler = AdaptiveMetropolis::new(Exponential).set_seed(42);
let chain = sampler.run(&[1.0], 2_000, 0.5, 0.234, 0.01).unwrap();
assert_eq!(chain.len(), 2_000);
assert!(chain.samples().iter().all(|&x| x > 0.0));
```
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::prelude::*;

use crate::distributions::{Proposal, RandomWalk, Target};
use crate::error::{CalibrationError, Result};
use crate::likelihood::REJECTED_LOG_DENSITY;

/// Iterations before proposal adaptation starts.
pub const DEFAULT_WARMUP: usize = 100;

const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a sampler instance. There is no way back to `Initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Initialized,
    Running,
    Completed,
}

/// Cooperative cancellation flag, checked at the top of every iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What happened to one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
    /// The candidate had a non-positive component and was never evaluated.
    Invalid,
}

/// Mutable position of a chain between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainCursor {
    pub current: Vec<f64>,
    pub log_density: f64,
    pub n_accepted: usize,
}

/// Multiplicative Robbins-Monro update of the proposal scale.
///
/// For `adapt_rate > 0` the scale strictly grows when `acceptance_rate`
/// exceeds `target_accept_rate` and strictly shrinks when it falls below.
pub fn adapt_scale(sd: f64, acceptance_rate: f64, target_accept_rate: f64, adapt_rate: f64) -> f64 {
    sd * (adapt_rate * (acceptance_rate - target_accept_rate)).exp()
}

/// The output of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    samples: Array2<f64>,
    log_densities: Vec<f64>,
    proposal_sd: Vec<f64>,
    n_accepted: usize,
    seed: u64,
}

impl Chain {
    /// Number of samples (iterations), including the seed sample.
    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.nrows() == 0
    }

    pub fn n_params(&self) -> usize {
        self.samples.ncols()
    }

    /// `iterations × n_params` matrix of samples.
    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    /// Log-density of the chain's state after each iteration.
    pub fn log_densities(&self) -> &[f64] {
        &self.log_densities
    }

    /// Proposal scale in effect after each iteration.
    pub fn proposal_sd_trace(&self) -> &[f64] {
        &self.proposal_sd
    }

    pub fn final_proposal_sd(&self) -> f64 {
        self.proposal_sd.last().copied().unwrap_or(f64::NAN)
    }

    pub fn n_accepted(&self) -> usize {
        self.n_accepted
    }

    /// Fraction of proposals accepted (the seed sample is not a proposal).
    pub fn acceptance_rate(&self) -> f64 {
        if self.len() < 2 {
            return 0.0;
        }
        self.n_accepted as f64 / (self.len() - 1) as f64
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Samples for one parameter, in iteration order.
    pub fn trace(&self, param: usize) -> ArrayView1<'_, f64> {
        self.samples.index_axis(Axis(1), param)
    }

    /// View of the samples after discarding `burnin` rows.
    pub fn post_burnin(&self, burnin: usize) -> Result<ArrayView2<'_, f64>> {
        if burnin >= self.len() {
            return Err(CalibrationError::InsufficientData(format!(
                "burn-in of {} leaves no samples from a chain of length {}",
                burnin,
                self.len()
            )));
        }
        Ok(self.samples.slice(ndarray::s![burnin.., ..]))
    }
}

/**
A single adaptive random-walk Metropolis chain.

The sampler owns its target, its random-number generator and its acceptance
bookkeeping; nothing is shared with other chains.
*/
#[derive(Debug, Clone)]
pub struct AdaptiveMetropolis<D> {
    /// The distribution to sample from.
    pub target: D,
    /// Seed of this chain's generator.
    pub seed: u64,
    /// Iterations before the proposal scale starts adapting.
    pub warmup: usize,
    rng: SmallRng,
    state: SamplerState,
    cancel: Option<CancelToken>,
}

impl<D: Target> AdaptiveMetropolis<D> {
    /// Creates a sampler with an entropy-drawn seed; see [`Self::set_seed`].
    pub fn new(target: D) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            target,
            seed,
            warmup: DEFAULT_WARMUP,
            rng: SmallRng::seed_from_u64(seed),
            state: SamplerState::Initialized,
            cancel: None,
        }
    }

    /// Reseeds the chain's generator for reproducible runs.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn set_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Makes the run stop with [`CalibrationError::Cancelled`] once `token` fires.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Starts a cursor at `seed_parameter`, evaluating the target once.
    pub fn cursor(&self, seed_parameter: &[f64]) -> ChainCursor {
        ChainCursor {
            current: seed_parameter.to_vec(),
            log_density: self.target.unnorm_log_prob(seed_parameter),
            n_accepted: 0,
        }
    }

    /**
    Performs one Metropolis-Hastings update of `cursor`.

    Candidates with any component `<= 0` are rejected before the target is
    consulted. Otherwise the candidate is accepted when
    `ln U < (log p(x') + log q(x | x')) - (log p(x) + log q(x' | x))`; for a
    symmetric proposal the q terms are skipped. A NaN ratio or a candidate at
    [`REJECTED_LOG_DENSITY`] is always a rejection.
    */
    pub fn step<Q: Proposal>(&mut self, cursor: &mut ChainCursor, proposal: &Q) -> StepOutcome {
        let candidate = proposal.sample(&cursor.current, &mut self.rng);
        if !candidate.iter().all(|&x| x > 0.0) {
            return StepOutcome::Invalid;
        }

        let candidate_lp = self.target.unnorm_log_prob(&candidate);
        let mut log_accept_ratio = candidate_lp - cursor.log_density;
        if !proposal.is_symmetric() {
            log_accept_ratio += proposal.log_prob(&candidate, &cursor.current)
                - proposal.log_prob(&cursor.current, &candidate);
        }

        let u: f64 = self.rng.gen();
        if candidate_lp > REJECTED_LOG_DENSITY && u.ln() < log_accept_ratio {
            cursor.current = candidate;
            cursor.log_density = candidate_lp;
            cursor.n_accepted += 1;
            StepOutcome::Accepted
        } else {
            StepOutcome::Rejected
        }
    }

    /**
    Runs the chain for `iterations` samples starting from `seed_parameter`.

    # Arguments

    * `seed_parameter` - Strictly positive starting point; stored as sample 0.
    * `iterations` - Total chain length.
    * `initial_proposal_sd` - Starting random-walk scale.
    * `target_accept_rate` - Acceptance rate the adaptation steers towards.
    * `adapt_rate` - Step size of the log-scale adaptation.

    # Errors

    [`CalibrationError::SamplerReused`] if the instance already ran,
    [`CalibrationError::InvalidConfig`] for bad arguments and
    [`CalibrationError::Cancelled`] if the cancel token fires.
    */
    pub fn run(
        &mut self,
        seed_parameter: &[f64],
        iterations: usize,
        initial_proposal_sd: f64,
        target_accept_rate: f64,
        adapt_rate: f64,
    ) -> Result<Chain> {
        self.run_inner(
            seed_parameter,
            iterations,
            initial_proposal_sd,
            target_accept_rate,
            adapt_rate,
            None,
        )
    }

    /// Same as [`Self::run`], reporting progress and the running acceptance
    /// rate on `pb` roughly every 500 ms.
    pub fn run_with_progress(
        &mut self,
        seed_parameter: &[f64],
        iterations: usize,
        initial_proposal_sd: f64,
        target_accept_rate: f64,
        adapt_rate: f64,
        pb: &ProgressBar,
    ) -> Result<Chain> {
        self.run_inner(
            seed_parameter,
            iterations,
            initial_proposal_sd,
            target_accept_rate,
            adapt_rate,
            Some(pb),
        )
    }

    fn run_inner(
        &mut self,
        seed_parameter: &[f64],
        iterations: usize,
        initial_proposal_sd: f64,
        target_accept_rate: f64,
        adapt_rate: f64,
        pb: Option<&ProgressBar>,
    ) -> Result<Chain> {
        if self.state != SamplerState::Initialized {
            return Err(CalibrationError::SamplerReused);
        }
        validate_run(
            seed_parameter,
            iterations,
            initial_proposal_sd,
            target_accept_rate,
            adapt_rate,
        )?;
        self.state = SamplerState::Running;
        debug!(
            "chain seed={} starting at {:?}, sd={}",
            self.seed, seed_parameter, initial_proposal_sd
        );

        let mut samples = Array2::<f64>::zeros((iterations, seed_parameter.len()));
        let mut log_densities = Vec::with_capacity(iterations);
        let mut sd_trace = Vec::with_capacity(iterations);
        let mut proposal = RandomWalk::new(initial_proposal_sd);
        let mut cursor = self.cursor(seed_parameter);

        samples
            .row_mut(0)
            .assign(&ArrayView1::from(cursor.current.as_slice()));
        log_densities.push(cursor.log_density);
        sd_trace.push(proposal.std);

        if let Some(pb) = pb {
            pb.set_length(iterations as u64);
        }
        let mut last_update = Instant::now();

        for i in 1..iterations {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                self.state = SamplerState::Completed;
                return Err(CalibrationError::Cancelled { iteration: i });
            }

            self.step(&mut cursor, &proposal);
            samples
                .row_mut(i)
                .assign(&ArrayView1::from(cursor.current.as_slice()));
            log_densities.push(cursor.log_density);

            if i > self.warmup {
                let acceptance_rate = cursor.n_accepted as f64 / i as f64;
                proposal.std = adapt_scale(
                    proposal.std,
                    acceptance_rate,
                    target_accept_rate,
                    adapt_rate,
                );
            }
            sd_trace.push(proposal.std);

            if let Some(pb) = pb {
                if last_update.elapsed() >= UPDATE_INTERVAL || i + 1 == iterations {
                    let accept_rate = cursor.n_accepted as f64 / i as f64;
                    pb.set_position(i as u64 + 1);
                    pb.set_message(format!("AcceptRate={:.3}", accept_rate));
                    last_update = Instant::now();
                }
            }
        }

        self.state = SamplerState::Completed;
        let chain = Chain {
            samples,
            log_densities,
            proposal_sd: sd_trace,
            n_accepted: cursor.n_accepted,
            seed: self.seed,
        };
        debug!(
            "chain seed={} done: acceptance={:.3}, final sd={:.3e}",
            self.seed,
            chain.acceptance_rate(),
            chain.final_proposal_sd()
        );
        Ok(chain)
    }
}

fn validate_run(
    seed_parameter: &[f64],
    iterations: usize,
    initial_proposal_sd: f64,
    target_accept_rate: f64,
    adapt_rate: f64,
) -> Result<()> {
    if iterations == 0 {
        return Err(CalibrationError::InvalidConfig(
            "iterations must be at least 1".to_string(),
        ));
    }
    if seed_parameter.is_empty() {
        return Err(CalibrationError::InvalidConfig(
            "seed parameter must have at least one component".to_string(),
        ));
    }
    if !seed_parameter.iter().all(|p| p.is_finite() && *p > 0.0) {
        return Err(CalibrationError::InvalidConfig(format!(
            "seed parameter must be strictly positive, got {seed_parameter:?}"
        )));
    }
    if !(initial_proposal_sd.is_finite() && initial_proposal_sd > 0.0) {
        return Err(CalibrationError::InvalidConfig(format!(
            "initial proposal sd must be strictly positive, got {initial_proposal_sd}"
        )));
    }
    if !(target_accept_rate > 0.0 && target_accept_rate < 1.0) {
        return Err(CalibrationError::InvalidConfig(format!(
            "target acceptance rate must lie in (0, 1), got {target_accept_rate}"
        )));
    }
    if !(adapt_rate.is_finite() && adapt_rate >= 0.0) {
        return Err(CalibrationError::InvalidConfig(format!(
            "adapt rate must be non-negative, got {adapt_rate}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Exponential(1) on the positive half-line.
    #[derive(Clone)]
    struct Exponential;

    impl Target for Exponential {
        fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
            -theta.iter().sum::<f64>()
        }
    }

    /// Counts how often it is evaluated and panics on non-positive input.
    struct Strict {
        calls: Cell<usize>,
    }

    impl Target for Strict {
        fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
            assert!(theta.iter().all(|&x| x > 0.0), "evaluated at {theta:?}");
            self.calls.set(self.calls.get() + 1);
            -(theta[0] - 1.0).powi(2)
        }
    }

    #[test]
    fn chain_has_exactly_iterations_positive_samples() {
        for iterations in [1, 2, 101, 3_000] {
            let mut sampler = AdaptiveMetropolis::new(Exponential).set_seed(42);
            let chain = sampler.run(&[0.5, 2.0], iterations, 1.0, 0.234, 0.01).unwrap();
            assert_eq!(chain.len(), iterations);
            assert_eq!(chain.log_densities().len(), iterations);
            assert_eq!(chain.proposal_sd_trace().len(), iterations);
            assert!(chain.samples().iter().all(|&x| x > 0.0));
            assert_eq!(chain.samples().row(0).to_vec(), vec![0.5, 2.0]);
            assert_eq!(sampler.state(), SamplerState::Completed);
        }
    }

    #[test]
    fn invalid_proposal_leaves_cursor_untouched() {
        let target = Strict {
            calls: Cell::new(0),
        };
        let mut sampler = AdaptiveMetropolis::new(target).set_seed(3);
        let mut cursor = sampler.cursor(&[0.05]);
        let proposal = RandomWalk::new(1.0);

        let mut n_invalid = 0;
        for _ in 0..500 {
            let before = cursor.clone();
            let calls_before = sampler.target.calls.get();
            match sampler.step(&mut cursor, &proposal) {
                StepOutcome::Invalid => {
                    n_invalid += 1;
                    assert_eq!(cursor, before);
                    assert_eq!(sampler.target.calls.get(), calls_before);
                }
                StepOutcome::Rejected => {
                    assert_eq!(cursor.log_density, before.log_density);
                    assert_eq!(cursor.n_accepted, before.n_accepted);
                }
                StepOutcome::Accepted => {
                    assert_eq!(cursor.n_accepted, before.n_accepted + 1);
                }
            }
        }
        assert!(n_invalid > 0, "expected some non-positive proposals");
    }

    #[test]
    fn rejected_sentinel_is_never_accepted() {
        struct Sentinel;
        impl Target for Sentinel {
            fn unnorm_log_prob(&self, _theta: &[f64]) -> f64 {
                REJECTED_LOG_DENSITY
            }
        }
        // Starting from the sentinel too: the ratio is 0 but the move must
        // still be refused.
        let mut sampler = AdaptiveMetropolis::new(Sentinel).set_seed(1);
        let chain = sampler.run(&[0.5], 500, 0.01, 0.234, 0.01).unwrap();
        assert_eq!(chain.n_accepted(), 0);
        assert!(chain.samples().iter().all(|&x| x == 0.5));
    }

    #[test]
    fn nan_log_density_resolves_to_rejection() {
        struct Infinite;
        impl Target for Infinite {
            fn unnorm_log_prob(&self, _theta: &[f64]) -> f64 {
                f64::NEG_INFINITY
            }
        }
        let mut sampler = AdaptiveMetropolis::new(Infinite).set_seed(1);
        let chain = sampler.run(&[0.5], 200, 0.01, 0.234, 0.01).unwrap();
        assert_eq!(chain.n_accepted(), 0);
    }

    #[test]
    fn adaptation_moves_scale_in_expected_direction() {
        for rate in [0.3, 0.5, 0.9, 1.0] {
            assert!(adapt_scale(0.1, rate, 0.234, 0.01) > 0.1);
        }
        for rate in [0.0, 0.1, 0.2] {
            assert!(adapt_scale(0.1, rate, 0.234, 0.01) < 0.1);
        }
        assert_eq!(adapt_scale(0.1, 0.234, 0.234, 0.01), 0.1);
        assert_eq!(adapt_scale(0.1, 0.9, 0.234, 0.0), 0.1);
    }

    #[test]
    fn scale_is_fixed_during_warmup_and_adapts_after() {
        let mut sampler = AdaptiveMetropolis::new(Exponential)
            .set_seed(5)
            .set_warmup(100);
        let chain = sampler.run(&[1.0], 300, 0.001, 0.234, 0.01).unwrap();
        let trace = chain.proposal_sd_trace();
        assert!(trace[..=100].iter().all(|&sd| sd == 0.001));
        // A tiny scale on a smooth target accepts nearly everything, so the
        // scale must grow once adaptation kicks in.
        assert!(trace[101] > 0.001);
        assert!(chain.final_proposal_sd() > 0.001);
    }

    #[test]
    fn adaptation_step_matches_running_acceptance() {
        let mut sampler = AdaptiveMetropolis::new(Exponential).set_seed(11);
        let chain = sampler.run(&[1.0], 400, 0.5, 0.234, 0.05).unwrap();
        let samples = chain.samples();
        let trace = chain.proposal_sd_trace();
        let mut accepted = 0usize;
        for i in 1..chain.len() {
            if samples[[i, 0]] != samples[[i - 1, 0]] {
                accepted += 1;
            }
            if i > DEFAULT_WARMUP {
                let rate = accepted as f64 / i as f64;
                let expected = adapt_scale(trace[i - 1], rate, 0.234, 0.05);
                assert!((trace[i] - expected).abs() <= 1e-12 * expected);
                if rate > 0.234 {
                    assert!(trace[i] > trace[i - 1]);
                } else if rate < 0.234 {
                    assert!(trace[i] < trace[i - 1]);
                }
            }
        }
        assert_eq!(accepted, chain.n_accepted());
    }

    #[test]
    fn exponential_mean_is_recovered() {
        let mut sampler = AdaptiveMetropolis::new(Exponential).set_seed(42);
        let chain = sampler.run(&[1.0], 60_000, 1.0, 0.44, 0.01).unwrap();
        let post = chain.post_burnin(5_000).unwrap();
        let mean = post.mean().unwrap();
        assert!((mean - 1.0).abs() < 0.1, "mean {mean}");
        let rate = chain.acceptance_rate();
        assert!((rate - 0.44).abs() < 0.1, "acceptance {rate}");
    }

    #[test]
    fn same_seed_same_chain() {
        let run = |seed| {
            AdaptiveMetropolis::new(Exponential)
                .set_seed(seed)
                .run(&[1.0], 500, 0.3, 0.234, 0.01)
                .unwrap()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    #[test]
    fn second_run_is_refused() {
        let mut sampler = AdaptiveMetropolis::new(Exponential).set_seed(1);
        sampler.run(&[1.0], 10, 0.3, 0.234, 0.01).unwrap();
        let err = sampler.run(&[1.0], 10, 0.3, 0.234, 0.01).unwrap_err();
        assert!(matches!(err, CalibrationError::SamplerReused));
    }

    #[test]
    fn invalid_arguments_are_refused_before_sampling() {
        let bad: [(&[f64], usize, f64, f64, f64); 5] = [
            (&[1.0], 0, 0.1, 0.234, 0.01),
            (&[-1.0], 10, 0.1, 0.234, 0.01),
            (&[1.0], 10, 0.0, 0.234, 0.01),
            (&[1.0], 10, 0.1, 1.0, 0.01),
            (&[1.0], 10, 0.1, 0.234, -0.5),
        ];
        for (seed, iterations, sd, target, adapt) in bad {
            let mut sampler = AdaptiveMetropolis::new(Exponential);
            let err = sampler.run(seed, iterations, sd, target, adapt).unwrap_err();
            assert!(matches!(err, CalibrationError::InvalidConfig(_)));
            assert_eq!(sampler.state(), SamplerState::Initialized);
        }
    }

    #[test]
    fn cancelled_run_stops_with_error() {
        let token = CancelToken::new();
        token.cancel();
        let mut sampler = AdaptiveMetropolis::new(Exponential).with_cancel(token);
        let err = sampler.run(&[1.0], 100, 0.3, 0.234, 0.01).unwrap_err();
        assert!(matches!(err, CalibrationError::Cancelled { iteration: 1 }));
    }

    #[test]
    fn run_with_progress_matches_run() {
        let pb = ProgressBar::hidden();
        let with_pb = AdaptiveMetropolis::new(Exponential)
            .set_seed(8)
            .run_with_progress(&[1.0], 300, 0.3, 0.234, 0.01, &pb)
            .unwrap();
        let without = AdaptiveMetropolis::new(Exponential)
            .set_seed(8)
            .run(&[1.0], 300, 0.3, 0.234, 0.01)
            .unwrap();
        assert_eq!(with_pb, without);
        assert_eq!(pb.position(), 300);
    }

    #[test]
    fn post_burnin_slices_and_checks() {
        let chain = AdaptiveMetropolis::new(Exponential)
            .set_seed(2)
            .run(&[1.0], 50, 0.3, 0.234, 0.01)
            .unwrap();
        assert_eq!(chain.post_burnin(10).unwrap().nrows(), 40);
        assert!(matches!(
            chain.post_burnin(50),
            Err(CalibrationError::InsufficientData(_))
        ));
    }
}
