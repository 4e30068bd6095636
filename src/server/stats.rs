//! Dispatcher counters.

use std::fmt;

/// Counters kept by the dispatcher over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted.
    pub job_count: u64,
    /// Most workers alive at once.
    pub max_active: usize,
    pub processes_started: u64,
    pub processes_exited: u64,
    /// Workers that exited with a non-zero code.
    pub process_errors: u64,
}

impl Stats {
    pub fn on_job_received(&mut self) {
        self.job_count += 1;
    }

    /// Record a new worker; `active` is the pool size including it.
    pub fn on_process_started(&mut self, active: usize) {
        self.processes_started += 1;
        self.max_active = self.max_active.max(active);
    }

    pub fn on_process_exited(&mut self, exit_code: i32) {
        self.processes_exited += 1;
        if exit_code != 0 {
            self.process_errors += 1;
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Jobs submitted = {}, max active processes = {}, processes started = {}, \
             exited = {}, errors = {}",
            self.job_count,
            self.max_active,
            self.processes_started,
            self.processes_exited,
            self.process_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = Stats::default();
        stats.on_job_received();
        stats.on_job_received();
        stats.on_process_started(1);
        stats.on_process_started(2);
        stats.on_process_exited(0);
        stats.on_process_started(1);
        stats.on_process_exited(3);

        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.max_active, 2);
        assert_eq!(stats.processes_started, 3);
        assert_eq!(stats.processes_exited, 2);
        assert_eq!(stats.process_errors, 1);
    }

    #[test]
    fn test_display() {
        let stats = Stats {
            job_count: 2,
            max_active: 1,
            processes_started: 1,
            processes_exited: 0,
            process_errors: 0,
        };
        assert_eq!(
            stats.to_string(),
            "Jobs submitted = 2, max active processes = 1, processes started = 1, \
             exited = 0, errors = 0"
        );
    }
}
