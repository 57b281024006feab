//! Names for test runs.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// The unique identifier of a run, also used as the name of its blob.
///
/// Identifiers consist of a time component and a random suffix, e.g.
/// `test_1760700000_67e5504410b1426f9247bb680e5fe0c8`. The time component keeps blobs of
/// one run sortable and recognizable in a container listing. The random suffix makes
/// collisions between concurrently running instances vanishingly unlikely without any
/// coordination between them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Generates a fresh identifier.
    pub fn generate() -> Self {
        let timestamp = Utc::now().timestamp();
        Self(format!("test_{timestamp}_{}", Uuid::new_v4().simple()))
    }

    /// Returns the identifier as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn has_time_and_random_component() {
        let id = TestId::generate();
        let parts: Vec<&str> = id.as_str().split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "test");
        assert!(parts[1].parse::<i64>().unwrap() > 0);
        assert_eq!(parts[2].len(), 32);
    }

    #[test]
    fn concurrent_generation_does_not_collide() {
        const THREADS: usize = 10;
        const PER_THREAD: usize = 1_000;

        let ids: Vec<TestId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| (0..PER_THREAD).map(|_| TestId::generate()).collect::<Vec<_>>())
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), THREADS * PER_THREAD);
        assert_eq!(unique.len(), ids.len());
    }
}
