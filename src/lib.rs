use num_traits::ToPrimitive;
use std::{cmp::Ordering, io, num::NonZeroUsize, thread, time::Duration};
use thiserror::Error;
use timer::{ActiveTimer, Timer};

pub mod cli;
pub mod platform;

/// Name of the environment variable overriding the fan-out width.
pub const NCPUS_ENV: &str = "NCPUS";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid thread count: {value:?} (expected a positive integer)")]
    InvalidThreadCount { value: String },

    #[error("Unable to spawn worker thread")]
    ThreadSpawn(#[source] io::Error),

    #[error("No measurements given")]
    NoMeasurements,
}

/// Describes a single benchmark run
///
/// Computed once at startup and passed explicitly to [`run_benchmark()`].
/// Nothing here is mutated after construction.
///
/// Should be created by overriding only the needed properties, like so:
/// ```rust
/// use parsleep::RunSettings;
///
/// let settings = RunSettings {
///     rounds: 10,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Copy, Debug)]
pub struct RunSettings {
    /// Fan-out width: the number of concurrent sleep tasks per round
    pub threads: NonZeroUsize,

    /// The number of sequential fork-join rounds
    pub rounds: usize,

    /// Per-task sleep time
    pub sleep: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            threads: host_parallelism(),
            rounds: 100,
            sleep: Duration::from_micros(5_000),
        }
    }
}

/// Parses an `NCPUS`-style thread count override.
///
/// A value that is present but not a positive integer is a hard
/// configuration error, not a silent fallback to [`host_parallelism()`].
pub fn threads_from_env(value: &str) -> Result<NonZeroUsize, Error> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map_err(|_| Error::InvalidThreadCount {
            value: value.to_string(),
        })
}

/// Maximum parallelism reported by the host.
///
/// Falls back to 1 when the host is unable to report it.
pub fn host_parallelism() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// The line announced on stdout before any rounds execute.
pub fn thread_banner(threads: NonZeroUsize) -> String {
    format!("I am set up to use {} threads.", threads)
}

/// The per-task operation.
///
/// Takes a task index for parity with the fan-out loop, but the index has
/// no effect on behavior.
pub fn sleep_task(_index: usize, duration: Duration) {
    thread::sleep(duration);
}

/// Executes one fork-join round.
///
/// Spawns `width` worker threads, each running [`sleep_task()`] for `sleep`,
/// and returns only after all of them have finished. The implicit join of
/// [`thread::scope`] is the inter-round barrier.
pub fn run_round(width: NonZeroUsize, sleep: Duration) -> Result<(), Error> {
    thread::scope(|scope| {
        for index in 0..width.get() {
            thread::Builder::new()
                .name(format!("sleeper-{}", index))
                .spawn_scoped(scope, move || sleep_task(index, sleep))
                .map_err(Error::ThreadSpawn)?;
        }
        Ok(())
    })
}

/// Runs `settings.rounds` sequential fork-join rounds and measures them.
///
/// All tasks of round `i` complete before any task of round `i + 1` starts.
/// With perfect scaling the total wall time is `rounds * sleep` regardless
/// of the fan-out width; the returned report carries per-round timings so
/// a reporter can show how far the run deviated from that.
pub fn run_benchmark(settings: &RunSettings) -> Result<RunReport, Error> {
    let mut rounds = Vec::with_capacity(settings.rounds);

    let start = ActiveTimer::start();
    for _ in 0..settings.rounds {
        let round_start = ActiveTimer::start();
        run_round(settings.threads, settings.sleep)?;
        rounds.push(ActiveTimer::stop(round_start));
    }
    let total = ActiveTimer::stop(start);

    Ok(RunReport {
        settings: *settings,
        total: Duration::from_nanos(total),
        rounds: Summary::from(&rounds).ok_or(Error::NoMeasurements)?,
    })
}

/// Describes the results of a single benchmark run
pub struct RunReport {
    /// settings the run was executed with
    pub settings: RunSettings,

    /// total wall-clock time of all rounds
    pub total: Duration,

    /// per-round wall-clock times, in nanoseconds
    pub rounds: Summary<u64>,
}

impl RunReport {
    /// Wall-clock time the run would take with perfect parallel scaling
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing for absurdly
    /// large round counts or sleep times.
    pub fn ideal(&self) -> Duration {
        u32::try_from(self.settings.rounds)
            .ok()
            .and_then(|rounds| self.settings.sleep.checked_mul(rounds))
            .unwrap_or(Duration::MAX)
    }

    /// Relative slowdown against the ideal time, in percents
    pub fn overhead_pct(&self) -> f64 {
        let ideal = self.ideal().as_secs_f64();
        if ideal == 0. {
            return 0.;
        }
        (self.total.as_secs_f64() - ideal) / ideal * 100.
    }
}

pub trait Reporter {
    fn on_complete(&mut self, _report: &RunReport, _usage: &platform::RUsage) {}
}

/// Summary statistics of a set of round timings
///
/// Built in a single pass; mean and sample variance use Welford's online
/// update, so long runs do not lose precision to a naive sum of squares.
#[derive(Clone, Copy)]
pub struct Summary<T> {
    pub n: usize,
    pub min: T,
    pub max: T,
    pub mean: f64,
    pub variance: f64,
}

impl<T> Summary<T>
where
    T: PartialOrd + ToPrimitive + Copy,
{
    /// Returns `None` if there are no values or a value has no f64 image
    pub fn from(values: &[T]) -> Option<Self> {
        let mut iter = values.iter().copied();
        let first = iter.next()?;
        let mut summary = Summary {
            n: 1,
            min: first,
            max: first,
            mean: first.to_f64()?,
            variance: 0.,
        };

        let mut aggregate = 0.;
        for value in iter {
            let fvalue = value.to_f64()?;
            if let Some(Ordering::Less) = value.partial_cmp(&summary.min) {
                summary.min = value;
            }
            if let Some(Ordering::Greater) = value.partial_cmp(&summary.max) {
                summary.max = value;
            }
            summary.n += 1;
            let delta = fvalue - summary.mean;
            summary.mean += delta / summary.n as f64;
            aggregate += delta * (fvalue - summary.mean);
        }
        if summary.n > 1 {
            summary.variance = aggregate / (summary.n - 1) as f64;
        }
        Some(summary)
    }
}

mod timer {
    use std::time::Instant;

    pub(super) type ActiveTimer = PlatformTimer;

    pub(super) trait Timer<T> {
        fn start() -> T;
        fn stop(start_time: T) -> u64;
    }

    pub(super) struct PlatformTimer;

    impl Timer<Instant> for PlatformTimer {
        #[inline]
        fn start() -> Instant {
            Instant::now()
        }

        #[inline]
        fn stop(start_time: Instant) -> u64 {
            start_time.elapsed().as_nanos() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn check_threads_from_env_valid() {
        for (value, expected) in [("1", 1), ("2", 2), ("8", 8), (" 4\n", 4)] {
            let threads = threads_from_env(value).unwrap();
            assert_eq!(threads.get(), expected);
        }
    }

    #[test]
    fn check_threads_from_env_invalid() {
        for value in ["", "abc", "0", "-3", "1.5", "4 threads"] {
            let result = threads_from_env(value);
            assert!(
                matches!(result, Err(Error::InvalidThreadCount { .. })),
                "Expected configuration error for {:?}",
                value
            );
        }
    }

    #[test]
    fn check_host_parallelism_positive() {
        assert!(host_parallelism().get() >= 1);
    }

    #[test]
    fn check_thread_banner() {
        let one = NonZeroUsize::new(1).unwrap();
        let two = NonZeroUsize::new(2).unwrap();
        let eight = NonZeroUsize::new(8).unwrap();

        assert_eq!(thread_banner(one), "I am set up to use 1 threads.");
        assert_eq!(thread_banner(two), "I am set up to use 2 threads.");
        assert_eq!(thread_banner(eight), "I am set up to use 8 threads.");
    }

    /// Basic check that a round indeed runs its tasks concurrently
    ///
    /// This test is quite brittle. There is no guarantee the OS scheduler will wake up all workers
    /// soon enough to meet the measurement target. We try to mitigate this possibility using several strategies:
    /// 1. repeating the round several times and taking the median as the target measurement.
    /// 2. using a liberal checking condition (half of the fully serialized execution time)
    #[test]
    fn check_round_runs_tasks_in_parallel() {
        let width = NonZeroUsize::new(8).unwrap();
        let sleep = Duration::from_millis(10);
        let serial_bound = sleep * width.get() as u32;

        let median = median_round_time(width, sleep, 5);
        assert!(
            median >= sleep,
            "Round can not be shorter than a single sleep: {:?}",
            median
        );
        assert!(
            median < serial_bound / 2,
            "Round took {:?}, which suggests tasks were serialized",
            median
        );
    }

    #[test]
    fn check_single_task_round() {
        let width = NonZeroUsize::new(1).unwrap();
        let sleep = Duration::from_millis(1);

        let median = median_round_time(width, sleep, 5);
        assert!(median >= sleep);
    }

    #[test]
    fn check_benchmark_report() {
        let settings = RunSettings {
            threads: NonZeroUsize::new(2).unwrap(),
            rounds: 3,
            sleep: Duration::from_millis(1),
        };

        let report = run_benchmark(&settings).unwrap();

        assert_eq!(report.rounds.n, settings.rounds);
        assert!(report.total >= report.ideal());
        assert!(report.overhead_pct() >= 0.);
        assert!(Duration::from_nanos(report.rounds.min) >= settings.sleep);
    }

    #[test]
    fn check_benchmark_requires_rounds() {
        let settings = RunSettings {
            rounds: 0,
            ..Default::default()
        };

        assert!(matches!(
            run_benchmark(&settings),
            Err(Error::NoMeasurements)
        ));
    }

    fn median_round_time(width: NonZeroUsize, sleep: Duration, repeat: usize) -> Duration {
        assert!(repeat >= 1);
        let mut measures = (0..repeat)
            .map(|_| {
                let start = Instant::now();
                run_round(width, sleep).unwrap();
                start.elapsed()
            })
            .collect::<Vec<_>>();
        measures.sort();
        measures[measures.len() / 2]
    }

    #[test]
    fn check_summary_of_round_times() {
        // nanosecond timings of five 5 ms rounds, one hit by a scheduling hiccup
        let rounds: Vec<u64> = vec![5_000_000, 5_120_000, 5_030_000, 7_400_000, 5_050_000];
        let stat = Summary::from(&rounds).unwrap();

        assert_eq!(stat.n, 5);
        assert_eq!(stat.min, 5_000_000);
        assert_eq!(stat.max, 7_400_000);
        assert!((stat.mean - 5_520_000.).abs() < 1e-6);
        assert!((stat.variance - 1.10645e12).abs() < 1e6);
    }

    #[test]
    fn check_summary_matches_two_pass_reference() {
        let values = (0..100u64).map(|i| 5_000_000 + (i * 37) % 1_000).collect::<Vec<_>>();
        let stat = Summary::from(&values).unwrap();

        let n = values.len() as f64;
        let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
        let variance = values
            .iter()
            .map(|v| (*v as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.);

        assert!((stat.mean - mean).abs() < 1e-6);
        assert!((stat.variance - variance).abs() < 1e-3);
    }

    #[test]
    fn check_summary_degenerate_inputs() {
        assert!(Summary::from(<&[u64]>::default()).is_none());

        let single = Summary::from(&[5_000_000u64]).unwrap();
        assert_eq!(single.n, 1);
        assert_eq!(single.min, single.max);
        assert_eq!(single.variance, 0.);
    }

    #[test]
    fn check_ideal_saturates_instead_of_overflowing() {
        let saturated = |rounds, sleep| RunReport {
            settings: RunSettings {
                threads: NonZeroUsize::new(1).unwrap(),
                rounds,
                sleep,
            },
            total: Duration::from_secs(1),
            rounds: Summary::from(&[1u64]).unwrap(),
        };

        // Duration multiplication overflow
        let report = saturated(2, Duration::MAX);
        assert_eq!(report.ideal(), Duration::MAX);
        assert!(report.overhead_pct() < 0.);

        // round count beyond what a Duration can be multiplied by
        let report = saturated(usize::MAX, Duration::from_secs(1));
        assert!(report.ideal() >= Duration::from_secs(1) * u32::MAX);
    }
}
