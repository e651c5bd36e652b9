use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

const PREFIX: &str = "MSG";

/// Generates message ids of the form `MSG` + `yyyyMMdd` + `HHmmssSSS` + a
/// four digit random suffix.
///
/// Ids sort roughly by arrival time. Collisions within the same millisecond
/// are possible but rare, and storage re-rolls when it finds one on disk.
#[derive(Debug)]
pub struct MessageIdGenerator {
    rng: Mutex<StdRng>,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

impl MessageIdGenerator {
    /// A generator with a fixed seed, for reproducible ids in tests.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn generate(&self) -> String {
        self.generate_at(Utc::now())
    }

    #[must_use]
    pub fn generate_at(&self, at: DateTime<Utc>) -> String {
        let suffix: u16 = self.rng.lock().random_range(0..10_000);
        format!("{PREFIX}{}{suffix:04}", at.format("%Y%m%d%H%M%S%3f"))
    }
}
