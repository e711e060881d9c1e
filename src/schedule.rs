//! Timer-like sources that synthesize jobs at defined cadences.

use std::time::{Duration, Instant};

use crate::job::Job;

/// A watched source of jobs. The scheduler polls `check` until `done`.
pub trait Schedule: Send + Sync {
    /// Return a job when the schedule's cadence says one is due.
    fn check(&self) -> Option<Job>;

    fn done(&self) -> bool {
        false
    }
}

/// Fires a freshly built job every `interval`, starting one interval from now.
pub struct Every {
    interval: Duration,
    last: parking_lot::Mutex<Instant>,
    make: Box<dyn Fn() -> Job + Send + Sync>,
}

impl Every {
    pub fn new(interval: Duration, make: impl Fn() -> Job + Send + Sync + 'static) -> Self {
        Self {
            interval,
            last: parking_lot::Mutex::new(Instant::now()),
            make: Box::new(make),
        }
    }
}

impl Schedule for Every {
    fn check(&self) -> Option<Job> {
        let mut last = self.last.lock();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            return Some((self.make)());
        }
        None
    }
}
