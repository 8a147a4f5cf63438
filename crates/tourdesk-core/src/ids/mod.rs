//! Collision-checked business identifiers.
//!
//! IDs are `PREFIX + timestamp` (17 digits, `yyyyMMddHHmmssSSS`) or
//! `PREFIX + yyyyMMdd + sequence`. Uniqueness is enforced with a
//! check-then-retry loop rather than a reserved counter, so generation is safe
//! from concurrent requests without coordination.

use chrono::{DateTime, FixedOffset, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::db::{EntityRepository, LibSqlEntityRepository};
use crate::error::{Error, Result};
use crate::models::EntityKind;

/// Attempts before giving up on a unique candidate
pub const MAX_ATTEMPTS: u32 = 5;

const FALLBACK_PREFIX: &str = "X";
const SEQUENCE_WIDTH: usize = 4;
/// `HHmmssSSS` following the date in a timestamp-style ID
const TIME_OF_DAY_DIGITS: usize = 9;
const SUFFIX_LEN: usize = 4;

/// Existence checks the generator needs from storage
#[allow(async_fn_in_trait)]
pub trait IdLookup {
    async fn id_exists(&self, kind: EntityKind, id: &str) -> Result<bool>;

    async fn ids_starting_with(&self, kind: EntityKind, prefix: &str) -> Result<Vec<String>>;
}

impl IdLookup for LibSqlEntityRepository {
    async fn id_exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        self.exists(kind, id).await
    }

    async fn ids_starting_with(&self, kind: EntityKind, prefix: &str) -> Result<Vec<String>> {
        self.ids_with_prefix(kind, prefix).await
    }
}

/// Shape of the generated identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStyle {
    /// `PREFIX` + 17-digit timestamp
    Timestamp,
    /// `PREFIX` + 17-digit timestamp + `-row`, for bulk-created rows
    TimestampRow(u32),
    /// `PREFIX` + 8-digit date + zero-padded daily sequence
    DailySequence,
}

/// Strip diacritics, uppercase and drop whitespace; `X` when nothing usable remains.
pub fn normalize_prefix(raw: &str) -> String {
    let normalized: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c) && !c.is_whitespace())
        .map(|c| match c {
            // Đ/đ carry no combining mark under NFD
            'đ' | 'Đ' => 'D',
            other => other,
        })
        .flat_map(char::to_uppercase)
        .collect();

    if normalized.is_empty() {
        FALLBACK_PREFIX.to_string()
    } else {
        normalized
    }
}

/// 17-digit `yyyyMMddHHmmssSSS`
pub fn format_timestamp(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y%m%d%H%M%S%3f").to_string()
}

/// 8-digit `yyyyMMdd`
pub fn format_date(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y%m%d").to_string()
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|byte| char::from(byte).to_ascii_uppercase())
        .collect()
}

/// Highest daily sequence among `ids` that extend `base`.
///
/// Timestamp-style IDs share the `PREFIX + date` base; their nine time-of-day
/// digits are not a sequence.
fn max_sequence(ids: &[String], base: &str) -> Option<u64> {
    ids.iter()
        .filter_map(|id| id.strip_prefix(base))
        .filter(|rest| (SEQUENCE_WIDTH..TIME_OF_DAY_DIGITS).contains(&rest.len()))
        .filter(|rest| rest.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|rest| rest.parse::<u64>().ok())
        .max()
}

/// Generates identifiers for one storage backend
pub struct IdGenerator<L> {
    lookup: L,
    offset: FixedOffset,
    max_attempts: u32,
}

impl<L: IdLookup> IdGenerator<L> {
    /// Timestamps are rendered in the business timezone `offset`
    pub const fn new(lookup: L, offset: FixedOffset) -> Self {
        Self {
            lookup,
            offset,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Generate an identifier not yet present in `kind`'s table.
    ///
    /// The first candidate is derived from `now`; after a conflict the
    /// candidate is rebuilt from the current instant (plus a random suffix for
    /// timestamp styles, or a fresh max-sequence query for daily sequences).
    pub async fn generate(
        &self,
        kind: EntityKind,
        prefix: &str,
        style: IdStyle,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let prefix = normalize_prefix(prefix);

        for attempt in 0..self.max_attempts {
            let instant = if attempt == 0 { now } else { Utc::now() };
            let local = instant.with_timezone(&self.offset);

            let candidate = match style {
                IdStyle::Timestamp | IdStyle::TimestampRow(_) => {
                    let mut candidate = format!("{prefix}{}", format_timestamp(&local));
                    if let IdStyle::TimestampRow(row) = style {
                        candidate.push_str(&format!("-{row}"));
                    }
                    if attempt > 0 {
                        candidate.push_str(&random_suffix());
                    }
                    candidate
                }
                IdStyle::DailySequence => {
                    let base = format!("{prefix}{}", format_date(&local));
                    let existing = self.lookup.ids_starting_with(kind, &base).await?;
                    let next = max_sequence(&existing, &base).map_or(1, |max| max + 1);
                    format!("{base}{next:0width$}", width = SEQUENCE_WIDTH)
                }
            };

            if !self.lookup.id_exists(kind, &candidate).await? {
                return Ok(candidate);
            }

            tracing::debug!(
                entity_type = kind.as_str(),
                candidate = candidate.as_str(),
                attempt,
                "Identifier collision, regenerating"
            );
        }

        tracing::warn!(
            entity_type = kind.as_str(),
            prefix = prefix.as_str(),
            attempts = self.max_attempts,
            "Identifier generation exhausted"
        );
        Err(Error::IdExhausted {
            kind,
            prefix,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Fields;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn vietnam() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        // 2026-10-18 09:30:00.123 +07:00
        Utc.with_ymd_and_hms(2026, 10, 18, 2, 30, 0).unwrap() + chrono::Duration::milliseconds(123)
    }

    /// In-memory lookup that can report the first N candidates as taken
    #[derive(Default)]
    struct FakeLookup {
        taken: Mutex<HashSet<String>>,
        forced_collisions: AtomicU32,
        always_taken: bool,
    }

    impl IdLookup for FakeLookup {
        async fn id_exists(&self, _kind: EntityKind, id: &str) -> Result<bool> {
            if self.always_taken {
                return Ok(true);
            }
            let forced = self
                .forced_collisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced {
                return Ok(true);
            }
            let mut taken = self.taken.lock().unwrap();
            // Claim on success so a concurrent caller sees it
            Ok(!taken.insert(id.to_string()))
        }

        async fn ids_starting_with(&self, _kind: EntityKind, prefix: &str) -> Result<Vec<String>> {
            let taken = self.taken.lock().unwrap();
            Ok(taken
                .iter()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn normalize_strips_diacritics_and_whitespace() {
        assert_eq!(normalize_prefix("Đặng Thị Hà"), "DANGTHIHA");
        assert_eq!(normalize_prefix(" sale 01 "), "SALE01");
        assert_eq!(normalize_prefix("Nguyễn"), "NGUYEN");
    }

    #[test]
    fn normalize_falls_back_to_placeholder() {
        assert_eq!(normalize_prefix(""), "X");
        assert_eq!(normalize_prefix(" \t "), "X");
    }

    #[test]
    fn timestamp_has_seventeen_digits() {
        let local = fixed_now().with_timezone(&vietnam());
        let stamp = format_timestamp(&local);
        assert_eq!(stamp, "20261018093000123");
        assert_eq!(format_date(&local), "20261018");
    }

    #[test]
    fn max_sequence_ignores_foreign_suffixes() {
        let ids = vec![
            "BK202610180001".to_string(),
            "BK202610180007".to_string(),
            "BK20261018ABCD".to_string(),
        ];
        assert_eq!(max_sequence(&ids, "BK20261018"), Some(7));
        assert_eq!(max_sequence(&ids, "BK20261019"), None);
    }

    #[test]
    fn max_sequence_skips_timestamp_ids_under_the_same_base() {
        let ids = vec![
            "SALE01202610180004".to_string(),
            "SALE0120261018093000123".to_string(),
            "SALE0120261018093000123-2".to_string(),
            "SALE0120261018093000123K7QZ".to_string(),
        ];
        assert_eq!(max_sequence(&ids, "SALE0120261018"), Some(4));

        let only_timestamps = vec!["SALE0120261018093000123".to_string()];
        assert_eq!(max_sequence(&only_timestamps, "SALE0120261018"), None);
    }

    #[tokio::test]
    async fn daily_sequence_beside_timestamp_ids_starts_at_one() {
        let lookup = FakeLookup::default();
        lookup
            .taken
            .lock()
            .unwrap()
            .insert("SALE0120261018093000123".to_string());
        let generator = IdGenerator::new(lookup, vietnam());

        let id = generator
            .generate(EntityKind::Request, "sale01", IdStyle::DailySequence, fixed_now())
            .await
            .unwrap();
        assert_eq!(id, "SALE01202610180001");
    }

    #[tokio::test]
    async fn first_candidate_uses_prefix_and_timestamp() {
        let generator = IdGenerator::new(FakeLookup::default(), vietnam());
        let id = generator
            .generate(EntityKind::Request, "sale01", IdStyle::Timestamp, fixed_now())
            .await
            .unwrap();
        assert_eq!(id, "SALE0120261018093000123");

        let row_id = generator
            .generate(
                EntityKind::Operator,
                "bk1",
                IdStyle::TimestampRow(3),
                fixed_now(),
            )
            .await
            .unwrap();
        assert_eq!(row_id, "BK120261018093000123-3");
    }

    #[tokio::test]
    async fn daily_sequence_increments_and_widens() {
        let lookup = FakeLookup::default();
        lookup
            .taken
            .lock()
            .unwrap()
            .extend(["BK202610180001".to_string(), "BK202610180002".to_string()]);
        let generator = IdGenerator::new(lookup, vietnam());

        let id = generator
            .generate(EntityKind::Revenue, "bk", IdStyle::DailySequence, fixed_now())
            .await
            .unwrap();
        assert_eq!(id, "BK202610180003");

        let lookup = FakeLookup::default();
        lookup
            .taken
            .lock()
            .unwrap()
            .insert("BK202610189999".to_string());
        let generator = IdGenerator::new(lookup, vietnam());
        let id = generator
            .generate(EntityKind::Revenue, "bk", IdStyle::DailySequence, fixed_now())
            .await
            .unwrap();
        assert_eq!(id, "BK2026101810000");
    }

    #[tokio::test]
    async fn forced_collisions_yield_distinct_ids() {
        let lookup = FakeLookup {
            forced_collisions: AtomicU32::new(2),
            ..FakeLookup::default()
        };
        let generator = IdGenerator::new(lookup, vietnam());

        let (first, second) = tokio::join!(
            generator.generate(EntityKind::Request, "S1", IdStyle::Timestamp, fixed_now()),
            generator.generate(EntityKind::Request, "S1", IdStyle::Timestamp, fixed_now()),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with("S1"));
        assert!(second.starts_with("S1"));
        // Both retried, so neither is the bare fixed-time candidate
        assert_ne!(first, "S120261018093000123");
        assert_ne!(second, "S120261018093000123");
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_an_error() {
        let lookup = FakeLookup {
            always_taken: true,
            ..FakeLookup::default()
        };
        let generator = IdGenerator::new(lookup, vietnam()).with_max_attempts(3);

        let err = generator
            .generate(EntityKind::Request, "S1", IdStyle::Timestamp, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdExhausted { attempts: 3, .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generated_id_is_found_after_insert() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection().clone());
        let generator = IdGenerator::new(repo.clone(), vietnam());

        let id = generator
            .generate(EntityKind::Request, "Trần", IdStyle::Timestamp, Utc::now())
            .await
            .unwrap();
        assert!(id.starts_with("TRAN"));
        repo.create(EntityKind::Request, &id, Fields::new())
            .await
            .unwrap();

        assert!(repo.id_exists(EntityKind::Request, &id).await.unwrap());
        let next = generator
            .generate(EntityKind::Request, "Trần", IdStyle::Timestamp, Utc::now())
            .await
            .unwrap();
        assert_ne!(next, id);
    }
}
