use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

/// One sliding-window sample of observed task behaviour at a given
/// concurrency level.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyMetrics {
    pub concurrency: usize,
    /// Tasks per second over the sample window.
    pub throughput: f64,
    pub avg_latency_secs: f64,
    pub success_rate: f64,
    pub error_count: u64,
}

impl ConcurrencyMetrics {
    /// Throughput divided by latency. Zero latency means the sample carries
    /// no timing signal and must never drive an increase.
    pub fn optimization_score(&self) -> f64 {
        if self.avg_latency_secs <= 0.0 {
            return 0.0;
        }
        self.throughput / self.avg_latency_secs
    }
}

#[derive(Debug, Clone)]
pub struct TuningConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    /// Bound on the sample history.
    pub window_size: usize,
    /// No tuning decision is made before this many samples exist.
    pub min_samples_before_tuning: usize,
    /// Consecutive improving samples required before an additive increase.
    pub stability_window: u32,
    pub increase_step: usize,
    pub decrease_factor: f64,
    /// Trailing success rate below this triggers an immediate decrease.
    pub success_threshold: f64,
    /// Recent score must beat the older mean by this ratio to count as
    /// improving.
    pub increase_threshold: f64,
    /// Recent score at or below this ratio of the older mean triggers an
    /// immediate decrease.
    pub decrease_threshold: f64,
    /// A sample is cut every this many completions, or
    pub sample_every_tasks: u32,
    /// every this much wall time, whichever comes first.
    pub sample_every: Duration,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 20,
            initial_concurrency: 5,
            window_size: 50,
            min_samples_before_tuning: 2,
            stability_window: 3,
            increase_step: 1,
            decrease_factor: 0.75,
            success_threshold: 0.85,
            increase_threshold: 1.10,
            decrease_threshold: 0.90,
            sample_every_tasks: 10,
            sample_every: Duration::from_secs(5),
        }
    }
}

impl TuningConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.min_concurrency >= 1, "min_concurrency must be >= 1");
        anyhow::ensure!(
            self.min_concurrency <= self.max_concurrency,
            "min_concurrency {} exceeds max_concurrency {}",
            self.min_concurrency,
            self.max_concurrency
        );
        anyhow::ensure!(
            (self.min_concurrency..=self.max_concurrency).contains(&self.initial_concurrency),
            "initial_concurrency {} outside [{}, {}]",
            self.initial_concurrency,
            self.min_concurrency,
            self.max_concurrency
        );
        anyhow::ensure!(self.window_size >= 2, "window_size must be >= 2");
        anyhow::ensure!(
            self.decrease_factor > 0.0 && self.decrease_factor < 1.0,
            "decrease_factor must be in (0, 1)"
        );
        anyhow::ensure!(self.sample_every_tasks >= 1, "sample_every_tasks must be >= 1");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunerStats {
    pub current_concurrency: usize,
    pub total_tasks: u64,
    pub total_failures: u64,
    pub samples: usize,
    pub stability_counter: u32,
    pub last_score: Option<f64>,
    pub best_score: Option<f64>,
    pub avg_throughput: f64,
    pub avg_latency_secs: f64,
    pub latency_stddev_secs: f64,
}

/// AIMD concurrency tuner.
///
/// Feed it completions via [`record_task_completion`]; it cuts a
/// [`ConcurrencyMetrics`] sample every `sample_every_tasks` completions or
/// `sample_every` of wall time. [`get_optimal_concurrency`] then applies the
/// additive-increase / multiplicative-decrease rule over the sample history.
///
/// [`record_task_completion`]: AdaptiveConcurrencyTuner::record_task_completion
/// [`get_optimal_concurrency`]: AdaptiveConcurrencyTuner::get_optimal_concurrency
pub struct AdaptiveConcurrencyTuner {
    cfg: TuningConfig,
    current: usize,
    history: VecDeque<ConcurrencyMetrics>,
    stability_counter: u32,
    total_tasks: u64,
    total_failures: u64,
    window_tasks: u32,
    window_failures: u64,
    window_latency_sum: f64,
    window_started: Instant,
}

impl AdaptiveConcurrencyTuner {
    pub fn new(cfg: TuningConfig) -> Result<Self> {
        cfg.validate()?;
        let current = cfg.initial_concurrency;
        Ok(Self {
            cfg,
            current,
            history: VecDeque::new(),
            stability_counter: 0,
            total_tasks: 0,
            total_failures: 0,
            window_tasks: 0,
            window_failures: 0,
            window_latency_sum: 0.0,
            window_started: Instant::now(),
        })
    }

    pub fn current_concurrency(&self) -> usize {
        self.current
    }

    pub fn record_task_completion(&mut self, latency: Duration, success: bool) {
        self.total_tasks += 1;
        self.window_tasks += 1;
        self.window_latency_sum += latency.as_secs_f64();
        if !success {
            self.total_failures += 1;
            self.window_failures += 1;
        }

        let window_elapsed = self.window_started.elapsed();
        if self.window_tasks >= self.cfg.sample_every_tasks
            || window_elapsed >= self.cfg.sample_every
        {
            let tasks = f64::from(self.window_tasks);
            let elapsed_secs = window_elapsed.as_secs_f64().max(f64::EPSILON);
            let sample = ConcurrencyMetrics {
                concurrency: self.current,
                throughput: tasks / elapsed_secs,
                avg_latency_secs: self.window_latency_sum / tasks,
                success_rate: (tasks - self.window_failures as f64) / tasks,
                error_count: self.window_failures,
            };
            self.record_sample(sample);
            self.window_tasks = 0;
            self.window_failures = 0;
            self.window_latency_sum = 0.0;
            self.window_started = Instant::now();
        }
    }

    /// Push a pre-aggregated sample into the history.
    pub fn record_sample(&mut self, sample: ConcurrencyMetrics) {
        debug!(
            event = "tuner_sample",
            concurrency = sample.concurrency,
            throughput = sample.throughput,
            avg_latency_secs = sample.avg_latency_secs,
            success_rate = sample.success_rate,
            score = sample.optimization_score(),
            "recorded tuner sample"
        );
        self.history.push_back(sample);
        while self.history.len() > self.cfg.window_size {
            self.history.pop_front();
        }
    }

    /// Apply the AIMD rule and return the (possibly updated) concurrency
    /// level. The result always lies within the configured bounds.
    pub fn get_optimal_concurrency(&mut self) -> usize {
        if self.history.len() < self.cfg.min_samples_before_tuning {
            return self.current;
        }

        // The trailing sample carries the freshest failure signal.
        let trailing = &self.history[self.history.len() - 1];
        if trailing.success_rate < self.cfg.success_threshold {
            self.decrease("success_rate_below_threshold");
            return self.current;
        }

        let recent_len = self.history.len().div_ceil(2);
        let split = self.history.len() - recent_len;
        let older_mean = mean_score(self.history.iter().take(split));
        let recent_mean = mean_score(self.history.iter().skip(split));

        if older_mean <= 0.0 {
            self.stability_counter = 0;
            return self.current;
        }

        if recent_mean >= self.cfg.increase_threshold * older_mean {
            self.stability_counter += 1;
            if self.stability_counter >= self.cfg.stability_window {
                let next = (self.current + self.cfg.increase_step).min(self.cfg.max_concurrency);
                if next != self.current {
                    debug!(
                        event = "tuner_increase",
                        from = self.current,
                        to = next,
                        "additive increase"
                    );
                }
                self.current = next;
                self.stability_counter = 0;
            }
        } else if recent_mean <= self.cfg.decrease_threshold * older_mean {
            self.decrease("score_regression");
        } else {
            self.stability_counter = 0;
        }

        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.cfg.initial_concurrency;
        self.history.clear();
        self.stability_counter = 0;
        self.total_tasks = 0;
        self.total_failures = 0;
        self.window_tasks = 0;
        self.window_failures = 0;
        self.window_latency_sum = 0.0;
        self.window_started = Instant::now();
    }

    pub fn get_statistics(&self) -> TunerStats {
        let n = self.history.len();
        let (avg_throughput, avg_latency_secs, latency_stddev_secs) = if n == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let avg_tp = self.history.iter().map(|s| s.throughput).sum::<f64>() / n as f64;
            let avg_lat =
                self.history.iter().map(|s| s.avg_latency_secs).sum::<f64>() / n as f64;
            let var = self
                .history
                .iter()
                .map(|s| (s.avg_latency_secs - avg_lat).powi(2))
                .sum::<f64>()
                / n as f64;
            (avg_tp, avg_lat, var.sqrt())
        };
        TunerStats {
            current_concurrency: self.current,
            total_tasks: self.total_tasks,
            total_failures: self.total_failures,
            samples: n,
            stability_counter: self.stability_counter,
            last_score: self.history.back().map(ConcurrencyMetrics::optimization_score),
            best_score: self
                .history
                .iter()
                .map(ConcurrencyMetrics::optimization_score)
                .fold(None, |best, s| match best {
                    Some(b) if b >= s => Some(b),
                    _ => Some(s),
                }),
            avg_throughput,
            avg_latency_secs,
            latency_stddev_secs,
        }
    }

    fn decrease(&mut self, reason: &'static str) {
        let next = ((self.current as f64 * self.cfg.decrease_factor).floor() as usize)
            .max(self.cfg.min_concurrency);
        if next != self.current {
            debug!(
                event = "tuner_decrease",
                from = self.current,
                to = next,
                reason = reason,
                "multiplicative decrease"
            );
        }
        self.current = next;
        self.stability_counter = 0;
    }
}

fn mean_score<'a>(samples: impl Iterator<Item = &'a ConcurrencyMetrics>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for s in samples {
        sum += s.optimization_score();
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
