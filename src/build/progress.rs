use crate::common::Verbosity;

/// The four build phases, with their share of the overall work.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Analyze,
    Sort,
    Validate,
    Compile,
}

impl Phase {
    pub fn weight(self) -> u64 {
        match self {
            Phase::Analyze => 10,
            Phase::Sort => 40,
            Phase::Validate => 20,
            Phase::Compile => 30,
        }
    }
}

/// Coarse percentage meter on stderr. Phases with an unknown unit total
/// (analyze) only contribute their weight when they finish.
pub struct Progress {
    verbosity: Verbosity,
    completed: u64,
    phase_weight: u64,
    total_units: u64,
    done_units: u64,
    last_percent: u64,
}

impl Progress {
    pub fn new(verbosity: Verbosity) -> Progress {
        Progress {
            verbosity,
            completed: 0,
            phase_weight: 0,
            total_units: 0,
            done_units: 0,
            last_percent: u64::MAX,
        }
    }

    /// Announce the current task ("Sorting ways...").
    pub fn task(&self, msg: &str) {
        if self.verbosity >= Verbosity::Normal {
            eprintln!("{msg}");
        }
    }

    pub fn begin_phase(&mut self, phase: Phase, total_units: u64) {
        self.completed += self.phase_weight;
        self.phase_weight = phase.weight();
        self.total_units = total_units;
        self.done_units = 0;
    }

    pub fn advance(&mut self, units: u64) {
        self.done_units += units;
        if self.total_units == 0 || self.verbosity < Verbosity::Normal {
            return;
        }
        let pct = self.completed
            + (self.phase_weight * self.done_units.min(self.total_units)) / self.total_units;
        // only redraw on whole-percent steps
        if pct != self.last_percent {
            self.last_percent = pct;
            eprint!("\r{pct:3}%");
        }
    }

    pub fn finish(&mut self) {
        self.completed += self.phase_weight;
        self.phase_weight = 0;
        if self.verbosity >= Verbosity::Normal && self.last_percent != u64::MAX {
            eprintln!();
            self.last_percent = u64::MAX;
        }
    }
}
