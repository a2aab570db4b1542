//! Phase timings and counters of one join run.
use std::fmt;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinStats {
    /// `|R| + |S|`.
    pub input_tuples: usize,
    pub result_tuples: i64,
    pub partition_tasks: usize,
    pub join_tasks: usize,
    pub first_pass: Duration,
    pub second_pass: Duration,
    pub join: Duration,
    pub total: Duration,
}

impl JoinStats {
    /// Million input tuples per second over the whole run.
    pub fn throughput_mtps(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.input_tuples as f64 / secs / 1e6
    }

    /// Total run time per input tuple.
    pub fn ns_per_tuple(&self) -> f64 {
        if self.input_tuples == 0 {
            return 0.0;
        }
        self.total.as_nanos() as f64 / self.input_tuples as f64
    }

    pub(crate) fn log(&self) {
        log::info!("{self}");
    }
}

impl fmt::Display for JoinStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "joined {} input tuples into {} results in {:?} \
             (pass1 {:?}, pass2 {:?}, join {:?}; {} partition tasks, {} join tasks) \
             {:.2} ns/tuple, {:.2} M tuples/s",
            self.input_tuples,
            self.result_tuples,
            self.total,
            self.first_pass,
            self.second_pass,
            self.join,
            self.partition_tasks,
            self.join_tasks,
            self.ns_per_tuple(),
            self.throughput_mtps(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates() {
        let stats = JoinStats {
            input_tuples: 2_000_000,
            total: Duration::from_millis(500),
            ..Default::default()
        };
        assert!((stats.throughput_mtps() - 4.0).abs() < 1e-9);
        assert!((stats.ns_per_tuple() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn empty_run_has_zero_rates() {
        let stats = JoinStats::default();
        assert_eq!(stats.throughput_mtps(), 0.0);
        assert_eq!(stats.ns_per_tuple(), 0.0);
        assert!(stats.to_string().contains("0 input tuples"));
    }
}
