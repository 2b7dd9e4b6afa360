//! Deterministic synthetic competitor bands for mock mode.
//!
//! Bands are seeded from the (property, date) pair so repeated lookups
//! and test runs see identical data.

use super::{CompetitorBand, CompetitorSource, FetchError};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub struct MockCompetitorSource {
    base_price: f64,
}

impl MockCompetitorSource {
    pub fn new(base_price: f64) -> Self {
        Self { base_price }
    }

    fn seed_for(property_id: &str, stay_date: NaiveDate) -> u64 {
        // FNV-1a over the property id, mixed with the date ordinal.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in property_id.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash ^ (stay_date.num_days_from_ce() as u64)
    }
}

#[async_trait]
impl CompetitorSource for MockCompetitorSource {
    async fn fetch_band(
        &self,
        property_id: &str,
        stay_date: NaiveDate,
    ) -> Result<Option<CompetitorBand>, FetchError> {
        let mut rng = ChaCha8Rng::seed_from_u64(Self::seed_for(property_id, stay_date));

        // Weekend stays run a little hotter than weekdays.
        let weekday = stay_date.weekday().num_days_from_monday();
        let weekend_bump = if weekday >= 4 { 1.1 } else { 1.0 };

        let p50 = self.base_price * weekend_bump * rng.gen_range(0.8..1.4);
        let p10 = p50 * rng.gen_range(0.70..0.85);
        let p90 = p50 * rng.gen_range(1.15..1.40);
        let count = rng.gen_range(5..40);

        Ok(Some(CompetitorBand {
            p10: Some(p10),
            p50,
            p90: Some(p90),
            count,
            source: "mock".to_string(),
        }))
    }
}
