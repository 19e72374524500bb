use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;

use crate::sample::Sample;

/// LiveConsumer receives every live sample for every interface.
///
/// `write` must not block: a consumer that cannot keep up drops samples on
/// its own and only errors when it is gone for good, at which point the
/// feed detaches and closes it.
pub trait LiveConsumer: Send {
    /// Deliver one sample for the named interface.
    fn write(&mut self, name: &str, sample: &Sample) -> Result<()>;

    /// Release the consumer's resources.
    fn close(&mut self) -> Result<()>;
}

struct FeedState {
    next_id: u64,
    consumers: HashMap<u64, Box<dyn LiveConsumer>>,
}

/// Broadcast of live samples to an evolving consumer set.
///
/// Ids are allocated monotonically and never reused within a process
/// lifetime. A consumer whose write fails is removed and closed; the
/// producer never sees consumer errors.
pub struct LiveFeed {
    inner: Mutex<FeedState>,
}

impl LiveFeed {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FeedState {
                next_id: 0,
                consumers: HashMap::with_capacity(4),
            }),
        }
    }

    /// Register a consumer, returning its id.
    pub fn register(&self, consumer: Box<dyn LiveConsumer>) -> u64 {
        let mut st = self.inner.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.consumers.insert(id, consumer);
        id
    }

    /// Remove and close the consumer with the given id. A missing id is
    /// not an error.
    pub fn deregister(&self, id: u64) -> Result<()> {
        let consumer = self.inner.lock().consumers.remove(&id);
        match consumer {
            Some(mut c) => c.close(),
            None => Ok(()),
        }
    }

    /// Broadcast one sample to every consumer, detaching and closing any
    /// whose write fails.
    pub fn service(&self, name: &str, sample: &Sample) {
        let mut st = self.inner.lock();

        let mut failed = Vec::new();
        for (id, consumer) in st.consumers.iter_mut() {
            if consumer.write(name, sample).is_err() {
                failed.push(*id);
            }
        }

        for id in failed {
            if let Some(mut consumer) = st.consumers.remove(&id) {
                let _ = consumer.close();
            }
        }
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use chrono::Utc;

    use super::*;

    struct CountingConsumer {
        writes: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_after: usize,
    }

    impl LiveConsumer for CountingConsumer {
        fn write(&mut self, _name: &str, _sample: &Sample) -> Result<()> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.fail_after {
                bail!("consumer gone");
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample() -> Sample {
        Sample::new(Utc::now(), 1, 1)
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let feed = LiveFeed::new();
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let first = feed.register(Box::new(CountingConsumer {
            writes: Arc::clone(&writes),
            closes: Arc::clone(&closes),
            fail_after: usize::MAX,
        }));
        feed.deregister(first).expect("deregister");

        let second = feed.register(Box::new(CountingConsumer {
            writes,
            closes,
            fail_after: usize::MAX,
        }));
        assert!(second > first);
    }

    #[test]
    fn test_deregister_missing_id_is_ok() {
        let feed = LiveFeed::new();
        feed.deregister(42).expect("missing id is not an error");
    }

    #[test]
    fn test_deregister_closes_consumer() {
        let feed = LiveFeed::new();
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let id = feed.register(Box::new(CountingConsumer {
            writes,
            closes: Arc::clone(&closes),
            fail_after: usize::MAX,
        }));
        feed.deregister(id).expect("deregister");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_consumer_is_detached_and_closed() {
        let feed = LiveFeed::new();
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        feed.register(Box::new(CountingConsumer {
            writes: Arc::clone(&writes),
            closes: Arc::clone(&closes),
            fail_after: 1,
        }));

        feed.service("eth0", &sample());
        assert_eq!(feed.len(), 1);

        // Second write fails: the consumer must be removed and closed and
        // later broadcasts must not reach it.
        feed.service("eth0", &sample());
        assert_eq!(feed.len(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        feed.service("eth0", &sample());
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_service_reaches_all_consumers() {
        let feed = LiveFeed::new();
        let writes = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            feed.register(Box::new(CountingConsumer {
                writes: Arc::clone(&writes),
                closes: Arc::clone(&closes),
                fail_after: usize::MAX,
            }));
        }

        feed.service("eth0", &sample());
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }
}
