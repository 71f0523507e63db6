use std::collections::HashSet;

/// Separator for composite schedule keys. Scope tokens, month keys and
/// category names never contain it, so keys cannot collide across
/// dimension boundaries.
const KEY_SEPARATOR: char = '|';

/// Days a cafeteria plan can be generated for (school week only).
pub const WEEK_DAYS: [&str; 5] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];

pub const MEAL_TYPES: [&str; 3] = ["breakfast", "lunch", "snack"];

/// Fee periods are keyed by month name, in school-year display order.
pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// The scheduling dimensions of one generated item. The triple must be
/// unique across all persisted items of the same entity; nothing else
/// about an item participates in uniqueness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub scope: String,
    pub period: String,
    pub category: String,
}

impl ScheduleSlot {
    pub fn new(
        scope: impl Into<String>,
        period: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        ScheduleSlot {
            scope: scope.into(),
            period: period.into(),
            category: category.into(),
        }
    }
}

/// Deterministic composite key over (scope, period, category), in that
/// fixed order. Items that agree on the triple hash to the same key no
/// matter what their payload fields say.
pub fn build_key(slot: &ScheduleSlot) -> String {
    let mut key = String::with_capacity(
        slot.scope.len() + slot.period.len() + slot.category.len() + 2,
    );
    key.push_str(&slot.scope);
    key.push(KEY_SEPARATOR);
    key.push_str(&slot.period);
    key.push(KEY_SEPARATOR);
    key.push_str(&slot.category);
    key
}

/// Accepts "YYYY-MM" with a four digit year and a month in 01..=12.
pub fn parse_month_key(raw: &str) -> Option<(i32, u32)> {
    let t = raw.trim();
    let (y, m) = t.split_once('-')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

/// How a batch's period dimension is validated.
#[derive(Debug, Clone, Copy)]
pub enum PeriodRule {
    /// "YYYY-MM" month key.
    MonthKey,
    /// Membership in a fixed ordered token set (e.g. month names).
    Tokens(&'static [&'static str]),
}

impl PeriodRule {
    fn accepts(&self, period: &str) -> bool {
        match self {
            PeriodRule::MonthKey => parse_month_key(period).is_some(),
            PeriodRule::Tokens(tokens) => tokens.contains(&period),
        }
    }
}

/// Per-entity validation parameters. The same validator runs for meal
/// plans and fee items; only these inputs differ.
#[derive(Debug, Clone)]
pub struct BatchRules {
    /// Noun used in scope diagnostics, e.g. "day".
    pub scope_noun: &'static str,
    /// Noun used in category diagnostics, e.g. "meal type".
    pub category_noun: &'static str,
    /// When set, scopes must come from this token set. Entities whose
    /// scopes live in the database (students) leave this unset and let
    /// the call site collect membership errors instead.
    pub allowed_scopes: Option<&'static [&'static str]>,
    pub allowed_categories: Vec<String>,
    pub period: PeriodRule,
}

/// One batch entry: its slot, its entity payload, and the names of any
/// required fields the submission left empty (recorded by the call site
/// while decoding, reported here so the batch fails as one list).
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub slot: ScheduleSlot,
    pub payload: T,
    pub missing: Vec<&'static str>,
}

/// Field-presence and format validation. Collects every problem in the
/// batch rather than stopping at the first; an empty return means the
/// batch may proceed to duplicate detection. Pure: no storage access.
pub fn validate<T>(candidates: &[Candidate<T>], rules: &BatchRules) -> Vec<String> {
    let mut errors = Vec::new();
    for (i, cand) in candidates.iter().enumerate() {
        let n = i + 1;
        for field in &cand.missing {
            errors.push(format!("item {}: missing {}", n, field));
        }
        let slot = &cand.slot;
        if !slot.scope.is_empty() {
            if let Some(scopes) = rules.allowed_scopes {
                if !scopes.contains(&slot.scope.as_str()) {
                    errors.push(format!(
                        "item {}: '{}' is not a recognized {}",
                        n, slot.scope, rules.scope_noun
                    ));
                }
            }
        }
        if !slot.period.is_empty() && !rules.period.accepts(&slot.period) {
            match rules.period {
                PeriodRule::MonthKey => errors.push(format!(
                    "item {}: month '{}' must be YYYY-MM",
                    n, slot.period
                )),
                PeriodRule::Tokens(_) => errors.push(format!(
                    "item {}: '{}' is not a recognized month name",
                    n, slot.period
                )),
            }
        }
        if !slot.category.is_empty()
            && !rules
                .allowed_categories
                .iter()
                .any(|c| c == &slot.category)
        {
            errors.push(format!(
                "item {}: '{}' is not a recognized {}",
                n, slot.category, rules.category_noun
            ));
        }
    }
    errors
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub index: usize,
    pub reason: String,
}

/// Result of duplicate detection over one batch. The three partitions
/// cover the input exactly: every index lands in precisely one of them,
/// each in original submission order.
#[derive(Debug, Default)]
pub struct Partition {
    pub accepted: Vec<usize>,
    pub rejected_within_batch: Vec<Rejection>,
    pub rejected_against_existing: Vec<Rejection>,
}

impl Partition {
    pub fn is_clean(&self) -> bool {
        self.rejected_within_batch.is_empty() && self.rejected_against_existing.is_empty()
    }

    /// All rejection reasons merged back into submission order.
    pub fn rejection_messages(&self) -> Vec<String> {
        let mut all: Vec<&Rejection> = self
            .rejected_within_batch
            .iter()
            .chain(self.rejected_against_existing.iter())
            .collect();
        all.sort_by_key(|r| r.index);
        all.iter().map(|r| r.reason.clone()).collect()
    }
}

/// Two-phase duplicate detection. Intra-batch repeats are flagged first
/// (first occurrence wins, later ones rejected), then survivors are
/// checked against the persisted key set. The split keeps the two
/// failure modes distinguishable in the reported reasons.
pub fn detect(slots: &[ScheduleSlot], existing: &HashSet<String>) -> Partition {
    let mut partition = Partition::default();
    let mut seen_in_batch: HashSet<String> = HashSet::new();
    for (index, slot) in slots.iter().enumerate() {
        let key = build_key(slot);
        if seen_in_batch.contains(&key) {
            partition.rejected_within_batch.push(Rejection {
                index,
                reason: format!(
                    "Duplicate {} on {}-{}",
                    slot.category, slot.scope, slot.period
                ),
            });
            continue;
        }
        let collides_with_store = existing.contains(&key);
        seen_in_batch.insert(key);
        if collides_with_store {
            partition.rejected_against_existing.push(Rejection {
                index,
                reason: format!(
                    "A {} item already exists for {} in {}",
                    slot.category, slot.scope, slot.period
                ),
            });
            continue;
        }
        partition.accepted.push(index);
    }
    partition
}

/// Storage seam for batch generation. Implementations scope themselves
/// to one (class, period) neighborhood at construction; the driver never
/// learns what the backing store is.
pub trait ScheduleStore {
    type Item;

    /// Keys of every already-persisted item the batch could collide with.
    fn existing_keys(&self) -> anyhow::Result<HashSet<String>>;

    /// Insert the whole batch. Only called once the batch is clean.
    fn insert_many(&mut self, items: &[Candidate<Self::Item>]) -> anyhow::Result<usize>;

    /// Rebuild the current-state view for immediate redisplay.
    fn project(&self) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug)]
pub enum BatchError {
    /// Empty submission, rejected before any per-item inspection.
    Empty,
    /// Field/format problems, every one collected.
    Invalid(Vec<String>),
    /// Key collisions, within the batch or against the store.
    Duplicates(Vec<String>),
    /// Storage failed; includes unique-index violations from a
    /// concurrent writer that slipped past the key read.
    Store(anyhow::Error),
}

pub struct BatchOutcome {
    pub inserted: usize,
    pub projection: serde_json::Value,
}

/// Batch driver. Fail-closed: any validation error or any duplicate
/// rejects the whole batch and nothing is written. `extra_errors` lets a
/// call site fold its own per-item checks (e.g. roster membership) into
/// the same reported list.
pub fn run_batch<S: ScheduleStore>(
    store: &mut S,
    candidates: Vec<Candidate<S::Item>>,
    rules: &BatchRules,
    extra_errors: Vec<String>,
) -> Result<BatchOutcome, BatchError> {
    if candidates.is_empty() {
        return Err(BatchError::Empty);
    }

    let mut errors = validate(&candidates, rules);
    errors.extend(extra_errors);
    if !errors.is_empty() {
        return Err(BatchError::Invalid(errors));
    }

    let existing = store.existing_keys().map_err(BatchError::Store)?;
    let slots: Vec<ScheduleSlot> = candidates.iter().map(|c| c.slot.clone()).collect();
    let partition = detect(&slots, &existing);
    if !partition.is_clean() {
        return Err(BatchError::Duplicates(partition.rejection_messages()));
    }

    let inserted = store.insert_many(&candidates).map_err(BatchError::Store)?;
    let projection = store.project().map_err(BatchError::Store)?;
    Ok(BatchOutcome {
        inserted,
        projection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slot(scope: &str, period: &str, category: &str) -> ScheduleSlot {
        ScheduleSlot::new(scope, period, category)
    }

    fn meal_rules() -> BatchRules {
        BatchRules {
            scope_noun: "day",
            category_noun: "meal type",
            allowed_scopes: Some(&WEEK_DAYS),
            allowed_categories: MEAL_TYPES.iter().map(|s| s.to_string()).collect(),
            period: PeriodRule::MonthKey,
        }
    }

    fn cand(scope: &str, period: &str, category: &str) -> Candidate<&'static str> {
        Candidate {
            slot: slot(scope, period, category),
            payload: "",
            missing: Vec::new(),
        }
    }

    /// Tracks calls so tests can assert the driver never touched storage
    /// on a rejected batch.
    struct FakeStore {
        existing: HashSet<String>,
        inserted: Vec<String>,
        key_reads: std::cell::Cell<usize>,
    }

    impl FakeStore {
        fn new(existing: &[&ScheduleSlot]) -> Self {
            FakeStore {
                existing: existing.iter().map(|s| build_key(s)).collect(),
                inserted: Vec::new(),
                key_reads: std::cell::Cell::new(0),
            }
        }
    }

    impl ScheduleStore for FakeStore {
        type Item = &'static str;

        fn existing_keys(&self) -> anyhow::Result<HashSet<String>> {
            self.key_reads.set(self.key_reads.get() + 1);
            Ok(self.existing.clone())
        }

        fn insert_many(&mut self, items: &[Candidate<&'static str>]) -> anyhow::Result<usize> {
            for item in items {
                self.inserted.push(build_key(&item.slot));
            }
            Ok(items.len())
        }

        fn project(&self) -> anyhow::Result<serde_json::Value> {
            Ok(json!({ "keys": self.inserted }))
        }
    }

    #[test]
    fn key_depends_only_on_the_triple() {
        let a = slot("Monday", "2025-01", "breakfast");
        let b = slot("Monday", "2025-01", "breakfast");
        assert_eq!(build_key(&a), build_key(&b));
        assert_eq!(build_key(&a), "Monday|2025-01|breakfast");

        let c = slot("Monday", "2025-01", "lunch");
        assert_ne!(build_key(&a), build_key(&c));
    }

    #[test]
    fn month_key_accepts_only_real_months() {
        assert_eq!(parse_month_key("2025-01"), Some((2025, 1)));
        assert_eq!(parse_month_key(" 2025-12 "), Some((2025, 12)));
        assert_eq!(parse_month_key("2025-13"), None);
        assert_eq!(parse_month_key("2025-00"), None);
        assert_eq!(parse_month_key("2025-1"), None);
        assert_eq!(parse_month_key("25-01"), None);
        assert_eq!(parse_month_key("January"), None);
    }

    #[test]
    fn intra_batch_duplicate_rejects_later_occurrence_only() {
        let slots = vec![
            slot("Monday", "2025-01", "breakfast"),
            slot("Monday", "2025-01", "breakfast"),
        ];
        let partition = detect(&slots, &HashSet::new());
        assert_eq!(partition.accepted, vec![0]);
        assert_eq!(partition.rejected_within_batch.len(), 1);
        assert_eq!(partition.rejected_within_batch[0].index, 1);
        assert_eq!(
            partition.rejected_within_batch[0].reason,
            "Duplicate breakfast on Monday-2025-01"
        );
        assert!(partition.rejected_against_existing.is_empty());
    }

    #[test]
    fn persisted_key_rejects_even_without_internal_duplicates() {
        let persisted = slot("Monday", "2025-01", "lunch");
        let existing: HashSet<String> = [build_key(&persisted)].into_iter().collect();
        let slots = vec![slot("Monday", "2025-01", "lunch")];
        let partition = detect(&slots, &existing);
        assert!(partition.accepted.is_empty());
        assert_eq!(partition.rejected_against_existing.len(), 1);
        assert_eq!(
            partition.rejected_against_existing[0].reason,
            "A lunch item already exists for Monday in 2025-01"
        );
    }

    #[test]
    fn partition_covers_input_without_loss_or_overlap() {
        let persisted = slot("Tuesday", "2025-02", "snack");
        let existing: HashSet<String> = [build_key(&persisted)].into_iter().collect();
        let slots = vec![
            slot("Monday", "2025-02", "breakfast"),
            slot("Tuesday", "2025-02", "snack"),
            slot("Monday", "2025-02", "breakfast"),
            slot("Wednesday", "2025-02", "lunch"),
        ];
        let partition = detect(&slots, &existing);

        let mut all: Vec<usize> = partition.accepted.clone();
        all.extend(partition.rejected_within_batch.iter().map(|r| r.index));
        all.extend(partition.rejected_against_existing.iter().map(|r| r.index));
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);

        assert_eq!(partition.accepted, vec![0, 3]);
        assert_eq!(partition.rejected_within_batch[0].index, 2);
        assert_eq!(partition.rejected_against_existing[0].index, 1);
    }

    #[test]
    fn rejection_messages_come_back_in_submission_order() {
        let persisted = slot("Monday", "2025-01", "breakfast");
        let existing: HashSet<String> = [build_key(&persisted)].into_iter().collect();
        let slots = vec![
            slot("Monday", "2025-01", "breakfast"),
            slot("Friday", "2025-01", "lunch"),
            slot("Friday", "2025-01", "lunch"),
        ];
        let partition = detect(&slots, &existing);
        assert_eq!(
            partition.rejection_messages(),
            vec![
                "A breakfast item already exists for Monday in 2025-01".to_string(),
                "Duplicate lunch on Friday-2025-01".to_string(),
            ]
        );
    }

    #[test]
    fn validation_collects_every_problem_at_once() {
        let bad_period = cand("Monday", "2025-13", "breakfast");
        let mut missing_dish = cand("Funday", "2025-01", "brunch");
        missing_dish.missing = vec!["dish"];
        let errors = validate(&[bad_period.clone(), missing_dish.clone()], &meal_rules());
        assert_eq!(
            errors,
            vec![
                "item 1: month '2025-13' must be YYYY-MM".to_string(),
                "item 2: missing dish".to_string(),
                "item 2: 'Funday' is not a recognized day".to_string(),
                "item 2: 'brunch' is not a recognized meal type".to_string(),
            ]
        );

        // Pure function of its input: the same batch reports the same
        // list on every pass.
        let again = validate(&[bad_period, missing_dish], &meal_rules());
        assert_eq!(errors, again);
    }

    #[test]
    fn empty_slot_fields_are_reported_as_missing_not_format_errors() {
        let mut c = cand("", "", "");
        c.missing = vec!["day", "month", "mealType"];
        let errors = validate(&[c], &meal_rules());
        assert_eq!(
            errors,
            vec![
                "item 1: missing day".to_string(),
                "item 1: missing month".to_string(),
                "item 1: missing mealType".to_string(),
            ]
        );
    }

    #[test]
    fn empty_batch_is_a_structural_failure() {
        let mut store = FakeStore::new(&[]);
        let result = run_batch(&mut store, Vec::new(), &meal_rules(), Vec::new());
        assert!(matches!(result, Err(BatchError::Empty)));
    }

    #[test]
    fn invalid_batch_never_reaches_duplicate_check_or_storage() {
        let mut store = FakeStore::new(&[]);
        let result = run_batch(
            &mut store,
            vec![cand("Monday", "2025-13", "breakfast")],
            &meal_rules(),
            Vec::new(),
        );
        match result {
            Err(BatchError::Invalid(errors)) => {
                assert_eq!(errors, vec!["item 1: month '2025-13' must be YYYY-MM"]);
            }
            other => panic!("expected Invalid, got {:?}", other.err()),
        }
        assert_eq!(store.key_reads.get(), 0);
        assert!(store.inserted.is_empty());
    }

    #[test]
    fn any_duplicate_rejects_the_whole_batch() {
        let persisted = slot("Monday", "2025-01", "lunch");
        let mut store = FakeStore::new(&[&persisted]);
        let result = run_batch(
            &mut store,
            vec![
                cand("Monday", "2025-01", "breakfast"),
                cand("Monday", "2025-01", "lunch"),
            ],
            &meal_rules(),
            Vec::new(),
        );
        match result {
            Err(BatchError::Duplicates(errors)) => {
                assert_eq!(
                    errors,
                    vec!["A lunch item already exists for Monday in 2025-01"]
                );
            }
            other => panic!("expected Duplicates, got {:?}", other.err()),
        }
        assert!(store.inserted.is_empty());
    }

    #[test]
    fn extra_call_site_errors_fail_the_batch_with_the_collected_list() {
        let mut store = FakeStore::new(&[]);
        let result = run_batch(
            &mut store,
            vec![cand("Monday", "2025-01", "breakfast")],
            &meal_rules(),
            vec!["item 1: student not found in class".to_string()],
        );
        match result {
            Err(BatchError::Invalid(errors)) => {
                assert_eq!(errors, vec!["item 1: student not found in class"]);
            }
            other => panic!("expected Invalid, got {:?}", other.err()),
        }
        assert!(store.inserted.is_empty());
    }

    #[test]
    fn clean_batch_inserts_everything_and_projects() {
        let mut store = FakeStore::new(&[]);
        let result = run_batch(
            &mut store,
            vec![
                cand("Monday", "2025-01", "breakfast"),
                cand("Monday", "2025-01", "lunch"),
                cand("Tuesday", "2025-01", "breakfast"),
            ],
            &meal_rules(),
            Vec::new(),
        );
        let outcome = result.unwrap_or_else(|_| panic!("clean batch rejected"));
        assert_eq!(outcome.inserted, 3);
        assert_eq!(store.inserted.len(), 3);
        assert_eq!(
            outcome.projection,
            json!({
                "keys": [
                    "Monday|2025-01|breakfast",
                    "Monday|2025-01|lunch",
                    "Tuesday|2025-01|breakfast"
                ]
            })
        );
    }
}
