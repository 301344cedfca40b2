use parking_lot::{Condvar, Mutex};

use crate::common::Verbosity;

/// Barrier chain for the sort sub-phases. A worker advancing from phase
/// `from` to phase `to` checks off every phase in between, then blocks
/// until all workers have arrived at `to`. Workers that run out of input
/// advance through all remaining phases at once.
pub struct Phaser {
    countdowns: Mutex<Vec<u32>>,
    phase_done: Condvar,
    task_names: &'static [&'static str],
    verbosity: Verbosity,
}

impl Phaser {
    pub fn new(
        phase_count: usize,
        workers: u32,
        task_names: &'static [&'static str],
        verbosity: Verbosity,
    ) -> Phaser {
        Phaser {
            countdowns: Mutex::new(vec![workers; phase_count]),
            phase_done: Condvar::new(),
            task_names,
            verbosity,
        }
    }

    pub fn advance(&self, from: usize, to: usize) {
        debug_assert!(to > from);
        let mut countdowns = self.countdowns.lock();
        debug_assert!(to <= countdowns.len() + 1);
        for phase in from..to {
            debug_assert!(countdowns[phase] > 0);
            countdowns[phase] -= 1;
            if countdowns[phase] == 0 {
                if self.verbosity >= Verbosity::Normal {
                    if let Some(name) = self.task_names.get(phase + 1) {
                        eprintln!("{name}");
                    }
                }
                self.phase_done.notify_all();
            }
        }
        while countdowns[to - 1] > 0 {
            self.phase_done.wait(&mut countdowns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn no_worker_passes_before_all_arrive() {
        let phaser = Phaser::new(2, 3, &["a", "b", "c"], Verbosity::Quiet);
        let entered = AtomicU32::new(0);
        std::thread::scope(|scope| {
            for i in 0..3u32 {
                let phaser = &phaser;
                let entered = &entered;
                scope.spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(i as u64 * 20));
                    entered.fetch_add(1, Ordering::SeqCst);
                    phaser.advance(0, 1);
                    // all three must have checked in before anyone proceeds
                    assert_eq!(entered.load(Ordering::SeqCst), 3);
                    phaser.advance(1, 2);
                });
            }
        });
    }

    #[test]
    fn skipping_phases_checks_off_each_one() {
        let phaser = Phaser::new(3, 2, &["", "", "", ""], Verbosity::Quiet);
        std::thread::scope(|scope| {
            let p = &phaser;
            scope.spawn(move || p.advance(0, 3));
            scope.spawn(move || {
                p.advance(0, 1);
                p.advance(1, 2);
                p.advance(2, 3);
            });
        });
    }
}
