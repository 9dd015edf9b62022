//! Schedule search driver.
//!
//! A tuning harness is a program that builds a pipeline and hands its
//! command line to [`autotune`]. Without a budget it times the pipeline as
//! scheduled. With a budget and a list of seeds, every seed appends one
//! `random` directive to each function the target reaches and then to the
//! target itself, and the run is timed under a [`Watchdog`]: a schedule
//! that blows the budget takes the whole process down, which the external
//! search reads as a failed candidate.
//!
//! ```text
//! blur-tune                       # baseline
//! blur-tune 2000000 17 4242       # budget in microseconds, then seeds
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics};
use tracing::{error, info};

use crate::error::Result;
use crate::ir::func::{Func, Pipeline};
use crate::runtime::Runtime;
use crate::schedule::archive::ScheduleArchive;
use crate::schedule::replay::Xorshift64;

/// Grace period added to the caller's budget before the watchdog fires.
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(about = "Time a pipeline under a randomized schedule")]
pub struct TuneArgs {
    /// Time budget in microseconds; omit to time the current schedule
    pub budget_us: Option<u64>,
    /// Seeds for the random schedule transforms
    pub seeds: Vec<u64>,
    /// Timed realizations after the first
    #[arg(long, default_value_t = 5)]
    pub runs: usize,
    /// Write the resulting schedule to this archive
    #[arg(long)]
    pub save: Option<PathBuf>,
}

impl Default for TuneArgs {
    fn default() -> Self {
        TuneArgs {
            budget_us: None,
            seeds: Vec::new(),
            runs: 5,
            save: None,
        }
    }
}

/// Kills the process if not dropped before its deadline.
pub struct Watchdog {
    disarmed: Arc<(Mutex<bool>, Condvar)>,
}

impl Watchdog {
    pub fn arm(limit: Duration) -> Watchdog {
        Self::arm_with(limit, || {
            error!("took too long, bailing out");
            std::process::exit(-1);
        })
    }

    /// Like [`Watchdog::arm`], running `expire` instead of exiting.
    pub fn arm_with(limit: Duration, expire: impl FnOnce() + Send + 'static) -> Watchdog {
        let disarmed = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&disarmed);
        info!(limit_us = limit.as_micros() as u64, "watchdog armed");
        thread::spawn(move || {
            let (lock, cv) = &*shared;
            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = cv
                .wait_timeout_while(guard, limit, |done| !*done)
                .unwrap_or_else(PoisonError::into_inner);
            if !*guard {
                drop(guard);
                expire();
            }
        });
        Watchdog { disarmed }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let (lock, cv) = &*self.disarmed;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }
}

/// Summary of per-run timings, in microseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub runs: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    pub fn of(samples: &[f64]) -> Option<Summary> {
        if samples.is_empty() {
            return None;
        }
        let mut data = Data::new(samples.to_vec());
        Some(Summary {
            runs: samples.len(),
            mean: data.mean().unwrap_or(0.0),
            std_dev: data.std_dev().unwrap_or(0.0),
            median: data.median(),
            min: data.min(),
            max: data.max(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct TuneReport {
    /// Wall time of the timed runs.
    pub total: Duration,
    /// Time of the first realization, compilation included.
    pub first: Duration,
    pub summary: Option<Summary>,
}

/// The line a search driver parses: total microseconds of the timed runs.
impl fmt::Display for TuneReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.total.as_micros())
    }
}

/// Append one random directive per reachable function, then one to `f`,
/// for every seed.
pub fn randomize(p: &mut Pipeline, f: Func, seeds: &[u64]) {
    let funcs = p.reachable(f);
    for &seed in seeds {
        let mut rng = Xorshift64::new(seed);
        for &g in &funcs {
            p.schedule(g).random(rng.next());
        }
        p.schedule(f).random(rng.next());
    }
}

pub fn autotune(
    p: &mut Pipeline,
    rt: &Runtime,
    f: Func,
    sizes: &[i32],
    args: &TuneArgs,
) -> Result<TuneReport> {
    info!(func = p.name(f), ?sizes, "tuning");
    let _watchdog = match args.budget_us {
        Some(budget) => {
            randomize(p, f, &args.seeds);
            Some(Watchdog::arm(Duration::from_micros(budget) + WATCHDOG_GRACE))
        }
        None => None,
    };

    let start = Instant::now();
    let mut out = p.realize(rt, f, sizes)?;
    let first = start.elapsed();

    let mut samples = Vec::with_capacity(args.runs);
    let start = Instant::now();
    for _ in 0..args.runs {
        let run = Instant::now();
        p.realize_into(rt, f, &mut out)?;
        samples.push(run.elapsed().as_secs_f64() * 1e6);
    }
    let report = TuneReport {
        total: start.elapsed(),
        first,
        summary: Summary::of(&samples),
    };
    info!(
        func = p.name(f),
        total_us = report.total.as_micros() as u64,
        first_us = report.first.as_micros() as u64,
        "tuned"
    );

    if let Some(path) = &args.save {
        ScheduleArchive::capture(p).save(path)?;
        info!(path = %path.display(), "saved schedule");
    }
    Ok(report)
}
