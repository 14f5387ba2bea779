use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct InFlightCounter {
    started: Counter,
    finished: Counter,
}

pub struct InFlightGuard<'a> {
    counter: &'a InFlightCounter,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.finished.inc();
    }
}

impl InFlightCounter {
    pub fn guard(&self) -> InFlightGuard<'_> {
        self.started.inc();
        InFlightGuard { counter: self }
    }

    pub fn started(&self) -> u64 {
        self.started.get()
    }

    pub fn pending(&self) -> u64 {
        // finished is read first so a concurrent guard drop can't make this go negative
        let finished = self.finished.get();
        self.started.get().saturating_sub(finished)
    }
}

/// Counters shared by all connection tasks of one process.
#[derive(Debug)]
pub struct Stats {
    pub connections: InFlightCounter,
    pub files_sent: Counter,
    pub files_created: Counter,
    pub files_unchanged: Counter,
    pub files_versioned: Counter,
    pub files_removed: Counter,
    pub deletes_notified: Counter,
    pub bytes_transferred: Counter,
    pub failures: Counter,
    start_time: std::time::Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            connections: Default::default(),
            files_sent: Default::default(),
            files_created: Default::default(),
            files_unchanged: Default::default(),
            files_versioned: Default::default(),
            files_removed: Default::default(),
            deletes_notified: Default::default(),
            bytes_transferred: Default::default(),
            failures: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "connections:      {}\n\
            files sent:       {}\n\
            files created:    {}\n\
            files unchanged:  {}\n\
            files versioned:  {}\n\
            files removed:    {}\n\
            delete notices:   {}\n\
            bytes:            {}\n\
            failures:         {}\n\
            uptime:           {:.1}s",
            self.connections.started(),
            self.files_sent.get(),
            self.files_created.get(),
            self.files_unchanged.get(),
            self.files_versioned.get(),
            self.files_removed.get(),
            self.deletes_notified.get(),
            bytesize::ByteSize(self.bytes_transferred.get()),
            self.failures.get(),
            self.get_duration().as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threaded_counting() {
        let counter = Counter::default();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        counter.inc();
                    }
                });
            }
        });
        assert_eq!(counter.get(), 1000);
    }

    #[test]
    fn guard_tracks_pending() {
        let in_flight = InFlightCounter::default();
        let first = in_flight.guard();
        let second = in_flight.guard();
        assert_eq!(in_flight.pending(), 2);
        drop(first);
        assert_eq!(in_flight.pending(), 1);
        drop(second);
        assert_eq!(in_flight.pending(), 0);
        assert_eq!(in_flight.started(), 2);
    }

    #[test]
    fn summary_mentions_counts() {
        let stats = Stats::new();
        stats.files_versioned.inc();
        stats.bytes_transferred.add(2048);
        let summary = stats.to_string();
        assert!(summary.contains("files versioned:  1"), "{summary}");
        assert!(summary.contains("bytes:"), "{summary}");
    }
}
