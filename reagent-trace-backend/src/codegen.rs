//! Human-readable aliquot codes of the form `{SAMPLE}-{LOT}-{YYYYMMDD}-A{NN}-{SUFFIX}`, e.g.
//! `FBS-12345ABC-20260118-A10-K7P2`.

use std::sync::LazyLock;

use chrono::{NaiveDate, Utc};
use garde::Validate;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{self, Store},
    error::{Error, Result},
    model::{Aliquot, AliquotStatus, Batch, EntityType, GenerateAliquots, NewAliquot, Sample},
};

/// RFC 4648 base32 symbols
pub const SUFFIX_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
pub const SUFFIX_LEN: usize = 4;
pub const MAX_CODE_LEN: usize = 100;
const MAX_TOKEN_LEN: usize = 20;
const FALLBACK_TOKEN: &str = "X";
const MAX_LOOKUP_ATTEMPTS: usize = 10;
const MAX_INSERT_ATTEMPTS: usize = 3;
const BASE36_DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

static CANONICAL_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9]+-[A-Z0-9]+-\d{8}-A\d{2}-[A-Z2-7]{4,}$").unwrap()
});

static CODE_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z0-9]+)-([A-Z0-9]+)-(\d{8})-A(\d{2,})-([A-Z0-9]{4,})$").unwrap()
});

/// Uppercases `label`, keeps only `[A-Z0-9]` and caps the result at 20 characters
#[must_use]
pub fn sanitize_token(label: &str) -> String {
    let token: String = label
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .take(MAX_TOKEN_LEN)
        .collect();

    if token.is_empty() {
        FALLBACK_TOKEN.to_string()
    } else {
        token
    }
}

#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// # Errors
/// Indices start at 1
pub fn format_index(index: i32) -> Result<String> {
    if index <= 0 {
        return Err(Error::validation(format!(
            "aliquot index must be positive, got {index}"
        )));
    }

    Ok(format!("A{index:02}"))
}

/// Whether `code` has exactly the shape the synthesizer produces for indices below 100
#[must_use]
pub fn is_canonical_code(code: &str) -> bool {
    CANONICAL_CODE.is_match(code)
}

/// The pieces of a printed aliquot code
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CodeParts {
    pub sample: String,
    pub lot: String,
    pub made_on: NaiveDate,
    pub index: u32,
    pub suffix: String,
}

/// Reads a code back into its parts. Accepts wide indices and timestamped fallback suffixes.
#[must_use]
pub fn parse_code(code: &str) -> Option<CodeParts> {
    let caps = CODE_PARTS.captures(code)?;

    Some(CodeParts {
        sample: caps[1].to_string(),
        lot: caps[2].to_string(),
        made_on: NaiveDate::parse_from_str(&caps[3], "%Y%m%d").ok()?,
        index: caps[4].parse().ok()?,
        suffix: caps[5].to_string(),
    })
}

fn timestamp_tail(millis: i64) -> String {
    let millis = millis.unsigned_abs();
    let high = usize::try_from((millis / 36) % 36).unwrap_or_default();
    let low = usize::try_from(millis % 36).unwrap_or_default();

    [BASE36_DIGITS[high] as char, BASE36_DIGITS[low] as char]
        .iter()
        .collect()
}

/// Where code suffixes come from
pub trait SuffixSource: Send + Sync {
    fn next_suffix(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSuffix;

impl SuffixSource for RandomSuffix {
    fn next_suffix(&self) -> String {
        let mut rng = rand::rng();

        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeSynthesizer<R = RandomSuffix> {
    suffixes: R,
}

impl CodeSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: SuffixSource> CodeSynthesizer<R> {
    pub fn with_suffix_source(suffixes: R) -> Self {
        Self { suffixes }
    }

    /// Builds a code that was free at lookup time.
    ///
    /// After ten taken codes, a code carrying two base-36 digits of the current time is
    /// returned without a further lookup. The unique index on `aliquot.code` still applies.
    ///
    /// # Errors
    /// [`Error::Validation`] for a non-positive index, [`Error::Infrastructure`] if the store
    /// cannot be queried
    pub async fn synthesize(
        &self,
        store: &impl Store,
        sample_label: &str,
        lot_label: &str,
        made_on: NaiveDate,
        index: i32,
    ) -> Result<String> {
        let stem = format!(
            "{}-{}-{}-{}",
            sanitize_token(sample_label),
            sanitize_token(lot_label),
            format_date(made_on),
            format_index(index)?
        );

        for attempt in 1..=MAX_LOOKUP_ATTEMPTS {
            let code = format!("{stem}-{}", self.suffixes.next_suffix());

            if !store.code_exists(&code).await? {
                return Ok(code);
            }

            tracing::debug!(%code, attempt, "aliquot code collision");
        }

        let code: String = format!(
            "{stem}-{}{}",
            self.suffixes.next_suffix(),
            timestamp_tail(Utc::now().timestamp_millis())
        )
        .chars()
        .take(MAX_CODE_LEN)
        .collect();

        tracing::warn!(
            %code,
            attempts = MAX_LOOKUP_ATTEMPTS,
            "falling back to timestamped aliquot code"
        );

        Ok(code)
    }

    /// Subdivides a sample into `count` new aliquots with consecutive indices, all pending QC.
    /// Either every aliquot is created or none is.
    ///
    /// # Errors
    pub async fn generate_aliquots(
        &self,
        store: &impl Store,
        request: GenerateAliquots,
    ) -> Result<Vec<Aliquot>> {
        request.validate()?;

        let sample_id = request.sample_id;
        let sample = store
            .fetch_sample(sample_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Sample, sample_id))?;
        let batch = store
            .fetch_batch(sample.batch_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Batch, sample.batch_id))?;

        let first = store
            .allocate_aliquot_indices(sample_id, request.count)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Sample, sample_id))?;

        let indices = first..first + request.count;
        let mut pending = Vec::with_capacity(indices.len());
        for index in indices.clone() {
            pending.push(
                self.coded_aliquot(store, &sample, &batch, &request, index)
                    .await?,
            );
        }

        // The set lands as one unit. A code that a concurrent writer took after the lookup
        // rolls back the whole set and only that code is synthesized again.
        let mut attempt = 1;
        let created = loop {
            let clashing = match store.insert_aliquots(pending.clone()).await {
                Ok(created) => break created,
                Err(db::Error::DuplicateRecord { entity, field, value })
                    if entity == "aliquot"
                        && field.as_deref() == Some("code")
                        && attempt < MAX_INSERT_ATTEMPTS =>
                {
                    value
                }
                Err(err) => return Err(err.into()),
            };

            tracing::debug!(attempt, code = ?clashing, "aliquot code taken at insert, retrying");
            attempt += 1;

            for (slot, index) in pending.iter_mut().zip(indices.clone()) {
                if clashing.as_ref().is_none_or(|code| *code == slot.code) {
                    *slot = self
                        .coded_aliquot(store, &sample, &batch, &request, index)
                        .await?;
                }
            }
        };

        tracing::info!(
            %sample_id,
            count = created.len(),
            first_index = first,
            "generated aliquots"
        );

        Ok(created)
    }

    async fn coded_aliquot(
        &self,
        store: &impl Store,
        sample: &Sample,
        batch: &Batch,
        request: &GenerateAliquots,
        index: i32,
    ) -> Result<NewAliquot> {
        let code = self
            .synthesize(
                store,
                &sample.name,
                &batch.lot_number,
                request.made_on,
                index,
            )
            .await?;

        Ok(NewAliquot {
            id: Uuid::now_v7(),
            code,
            sample_id: sample.id,
            batch_id: batch.id,
            status: AliquotStatus::PendingQc,
            volume: request.volume,
            concentration: request.concentration,
            unit: request.unit.clone(),
            made_on: request.made_on,
            created_by: request.created_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashSet, VecDeque},
        sync::Mutex,
    };

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{
        CodeParts, CodeSynthesizer, MAX_CODE_LEN, SuffixSource, format_index, is_canonical_code,
        parse_code, sanitize_token,
    };
    use crate::{
        db::{
            Store,
            test_util::{FaultyStore, LOT_NUMBER, SAMPLE_NAME, World, date, new_aliquot, world},
        },
        error::Error,
        model::{AliquotStatus, GenerateAliquots},
    };

    /// Hands out the scripted suffixes in order, then repeats the last one
    struct Scripted(Mutex<VecDeque<&'static str>>);

    impl Scripted {
        fn new(suffixes: &[&'static str]) -> Self {
            Self(Mutex::new(suffixes.iter().copied().collect()))
        }
    }

    impl SuffixSource for Scripted {
        fn next_suffix(&self) -> String {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap().to_string()
            } else {
                queue.front().unwrap().to_string()
            }
        }
    }

    #[rstest]
    #[case("Sigma-Aldrich #2", "SIGMAALDRICH2")]
    #[case("Fetal Bovine Serum", "FETALBOVINESERUM")]
    #[case("  --  ", "X")]
    #[case("", "X")]
    #[case("abcdefghijklmnopqrstuvwxyz", "ABCDEFGHIJKLMNOPQRST")]
    fn sanitize(#[case] label: &str, #[case] token: &str) {
        assert_eq!(sanitize_token(label), token);
    }

    #[rstest]
    #[case(3, "A03")]
    #[case(42, "A42")]
    #[case(100, "A100")]
    fn index_padding(#[case] index: i32, #[case] formatted: &str) {
        assert_eq!(format_index(index).unwrap(), formatted);
    }

    #[rstest]
    #[case(0)]
    #[case(-4)]
    fn non_positive_index_is_rejected(#[case] index: i32) {
        assert!(matches!(format_index(index), Err(Error::Validation { .. })));
    }

    #[test]
    fn wide_index_parses_but_is_not_canonical() {
        let code = "FBS-12345ABC-20240118-A100-K7P2";

        assert!(!is_canonical_code(code));
        assert_eq!(
            parse_code(code),
            Some(CodeParts {
                sample: "FBS".to_string(),
                lot: "12345ABC".to_string(),
                made_on: date(2024, 1, 18),
                index: 100,
                suffix: "K7P2".to_string(),
            })
        );
    }

    #[rstest]
    #[case("fbs-12345ABC-20240118-A01-K7P2")]
    #[case("FBS-12345ABC-2024011-A01-K7P2")]
    #[case("FBS-12345ABC-20241340-A01-K7P2")]
    #[case("FBS-12345ABC-20240118-B01-K7P2")]
    fn unparseable_codes(#[case] code: &str) {
        assert_eq!(parse_code(code), None);
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn canonical_format(#[future] world: World) {
        let synthesizer = CodeSynthesizer::new();
        let code = synthesizer
            .synthesize(&world.store, SAMPLE_NAME, LOT_NUMBER, date(2024, 1, 18), 3)
            .await
            .unwrap();

        assert!(code.starts_with("FETALBOVINESERUM-12345ABC-20240118-A03-"));
        assert!(is_canonical_code(&code));

        let suffix = &code[code.len() - 4..];
        assert!(
            suffix
                .bytes()
                .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
        );
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn collision_regenerates_suffix(#[future] world: World) {
        // "AAAA" is aliquot X's suffix at index 1
        let synthesizer = CodeSynthesizer::with_suffix_source(Scripted::new(&["AAAA", "QQQQ"]));

        let code = synthesizer
            .synthesize(&world.store, SAMPLE_NAME, LOT_NUMBER, date(2024, 1, 18), 1)
            .await
            .unwrap();

        assert_eq!(code, "FETALBOVINESERUM-12345ABC-20240118-A01-QQQQ");
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn fallback_after_ten_collisions(#[future] world: World) {
        let synthesizer = CodeSynthesizer::with_suffix_source(Scripted::new(&["AAAA"]));

        let code = synthesizer
            .synthesize(&world.store, SAMPLE_NAME, LOT_NUMBER, date(2024, 1, 18), 1)
            .await
            .unwrap();

        let stem = "FETALBOVINESERUM-12345ABC-20240118-A01-AAAA";
        assert!(code.starts_with(stem));
        assert_eq!(code.len(), stem.len() + 2);
        assert!(code.len() <= MAX_CODE_LEN);
        assert!(parse_code(&code).is_some());
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn outage_is_infrastructure(#[future] world: World) {
        world.store.set_available(false);

        let result = CodeSynthesizer::new()
            .synthesize(&world.store, SAMPLE_NAME, LOT_NUMBER, date(2024, 1, 18), 4)
            .await;

        assert!(matches!(result, Err(Error::Infrastructure { .. })));
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn generation_continues_the_index(#[future] world: World) {
        let synthesizer = CodeSynthesizer::new();
        let request = GenerateAliquots::new(world.sample.id, 5, date(2024, 2, 1));

        let created = synthesizer
            .generate_aliquots(&world.store, request)
            .await
            .unwrap();

        let indices: Vec<_> = created
            .iter()
            .map(|a| parse_code(&a.code).unwrap().index)
            .collect();
        assert_eq!(indices, vec![4, 5, 6, 7, 8]);
        assert!(created.iter().all(|a| a.status == AliquotStatus::PendingQc));
        assert!(created.iter().all(|a| a.batch_id == world.batch.id));
        assert_eq!(world.store.count_batch_aliquots(world.batch.id).await.unwrap(), 8);
    }

    const RACED_CODE: &str = "FETALBOVINESERUM-12345ABC-20240201-A05-MMMM";

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn code_taken_after_lookup_is_synthesized_again(#[future] world: World) {
        world
            .store
            .insert_aliquots(vec![new_aliquot(&world.sample, RACED_CODE)])
            .await
            .unwrap();
        let store = FaultyStore::racing(world.store, &[RACED_CODE]);
        let synthesizer =
            CodeSynthesizer::with_suffix_source(Scripted::new(&["KKKK", "MMMM", "PPPP"]));

        let created = synthesizer
            .generate_aliquots(
                &store,
                GenerateAliquots::new(world.sample.id, 2, date(2024, 2, 1)),
            )
            .await
            .unwrap();

        let codes: Vec<_> = created.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(
            codes,
            vec![
                "FETALBOVINESERUM-12345ABC-20240201-A04-KKKK",
                "FETALBOVINESERUM-12345ABC-20240201-A05-PPPP",
            ]
        );
        assert_eq!(store.count_batch_aliquots(world.batch.id).await.unwrap(), 6);
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn failed_generation_leaves_nothing_behind(#[future] world: World) {
        world
            .store
            .insert_aliquots(vec![new_aliquot(&world.sample, RACED_CODE)])
            .await
            .unwrap();
        let store = FaultyStore::racing(world.store, &[RACED_CODE]);
        // Index 5 keeps drawing the raced suffix, so every insert of the set clashes
        let synthesizer = CodeSynthesizer::with_suffix_source(Scripted::new(&["KKKK", "MMMM"]));

        let result = synthesizer
            .generate_aliquots(
                &store,
                GenerateAliquots::new(world.sample.id, 5, date(2024, 2, 1)),
            )
            .await;

        assert!(matches!(result, Err(Error::Infrastructure { .. })));
        assert_eq!(store.count_batch_aliquots(world.batch.id).await.unwrap(), 4);
        assert_eq!(
            store
                .fetch_aliquot_by_code("FETALBOVINESERUM-12345ABC-20240201-A04-KKKK")
                .await
                .unwrap(),
            None
        );
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn many_codes_are_distinct(#[future] world: World) {
        let synthesizer = CodeSynthesizer::new();

        let mut codes = HashSet::new();
        for _ in 0..10 {
            let request = GenerateAliquots::new(world.sample.id, 100, date(2024, 2, 1));
            let created = synthesizer
                .generate_aliquots(&world.store, request)
                .await
                .unwrap();

            codes.extend(created.into_iter().map(|a| a.code));
        }

        assert_eq!(codes.len(), 1000);
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn concurrent_generation_does_not_overlap(#[future] world: World) {
        let synthesizer = CodeSynthesizer::new();
        let request = GenerateAliquots::new(world.sample.id, 20, date(2024, 2, 1));

        let (left, right) = tokio::join!(
            synthesizer.generate_aliquots(&world.store, request.clone()),
            synthesizer.generate_aliquots(&world.store, request)
        );

        let mut indices: Vec<_> = left
            .unwrap()
            .iter()
            .chain(right.unwrap().iter())
            .map(|a| parse_code(&a.code).unwrap().index)
            .collect();
        indices.sort_unstable();

        assert_eq!(indices, (4..44).collect::<Vec<_>>());
    }

    #[rstest]
    #[case(0)]
    #[case(101)]
    #[awt]
    #[tokio::test]
    async fn count_out_of_range(#[future] world: World, #[case] count: i32) {
        let request = GenerateAliquots::new(world.sample.id, count, date(2024, 1, 18));

        let result = CodeSynthesizer::new()
            .generate_aliquots(&world.store, request)
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn unknown_sample(#[future] world: World) {
        let request = GenerateAliquots::new(uuid::Uuid::now_v7(), 1, date(2024, 1, 18));

        let result = CodeSynthesizer::new()
            .generate_aliquots(&world.store, request)
            .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
