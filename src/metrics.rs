use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free runtime metrics for the service process.
#[derive(Default)]
pub struct ServiceMetrics {
    /// Ingestion runs completed
    pub runs_completed: AtomicUsize,
    /// Items that reached a terminal outcome (cumulative)
    pub items_processed: AtomicUsize,
    pub items_succeeded: AtomicUsize,
    pub items_failed: AtomicUsize,
    /// Similarity queries served
    pub queries_served: AtomicUsize,
    /// Cumulative query latency in microseconds (divide by queries_served for avg)
    pub query_latency_us: AtomicUsize,
    /// Last ingestion run duration in milliseconds
    pub last_run_duration_ms: AtomicUsize,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, latency_us: usize) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
        self.query_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
    }

    pub fn record_run(&self, successful: usize, failed: usize, duration_ms: usize) {
        self.items_processed
            .fetch_add(successful + failed, Ordering::Relaxed);
        self.items_succeeded.fetch_add(successful, Ordering::Relaxed);
        self.items_failed.fetch_add(failed, Ordering::Relaxed);
        self.last_run_duration_ms
            .store(duration_ms, Ordering::Relaxed);
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn avg_query_latency_us(&self) -> usize {
        let queries = self.queries_served.load(Ordering::Relaxed);
        if queries > 0 {
            self.query_latency_us.load(Ordering::Relaxed) / queries
        } else {
            0
        }
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP photofinder_runs_completed_total Ingestion runs completed.\n\
             # TYPE photofinder_runs_completed_total counter\n\
             photofinder_runs_completed_total {}\n\
             # HELP photofinder_items_processed_total Items that reached a terminal outcome.\n\
             # TYPE photofinder_items_processed_total counter\n\
             photofinder_items_processed_total {}\n\
             # HELP photofinder_items_succeeded_total Items stored successfully.\n\
             # TYPE photofinder_items_succeeded_total counter\n\
             photofinder_items_succeeded_total {}\n\
             # HELP photofinder_items_failed_total Items that failed.\n\
             # TYPE photofinder_items_failed_total counter\n\
             photofinder_items_failed_total {}\n\
             # HELP photofinder_queries_served_total Similarity queries served.\n\
             # TYPE photofinder_queries_served_total counter\n\
             photofinder_queries_served_total {}\n\
             # HELP photofinder_query_latency_avg_us Average query latency in microseconds.\n\
             # TYPE photofinder_query_latency_avg_us gauge\n\
             photofinder_query_latency_avg_us {}\n\
             # HELP photofinder_last_run_duration_ms Duration of last ingestion run in milliseconds.\n\
             # TYPE photofinder_last_run_duration_ms gauge\n\
             photofinder_last_run_duration_ms {}\n",
            self.runs_completed.load(Ordering::Relaxed),
            self.items_processed.load(Ordering::Relaxed),
            self.items_succeeded.load(Ordering::Relaxed),
            self.items_failed.load(Ordering::Relaxed),
            self.queries_served.load(Ordering::Relaxed),
            self.avg_query_latency_us(),
            self.last_run_duration_ms.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_run_accumulates() {
        let m = ServiceMetrics::new();
        m.record_run(2, 1, 1500);
        m.record_run(0, 4, 200);
        assert_eq!(m.items_processed.load(Ordering::Relaxed), 7);
        assert_eq!(m.items_failed.load(Ordering::Relaxed), 5);
        assert_eq!(m.last_run_duration_ms.load(Ordering::Relaxed), 200);
        assert_eq!(m.runs_completed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_prometheus_output() {
        let m = ServiceMetrics::new();
        m.record_query(100);
        m.record_query(300);
        let text = m.to_prometheus();
        assert!(text.contains("photofinder_queries_served_total 2\n"));
        assert!(text.contains("photofinder_query_latency_avg_us 200\n"));
        assert!(text.contains("# TYPE photofinder_runs_completed_total counter"));
    }
}
