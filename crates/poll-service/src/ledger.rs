//! Per-poll authoritative state.
//!
//! A [`VoteLedger`] owns the question, options, tally and the set of
//! identities that have voted. It is plain synchronous data: the poll actor
//! that owns it is the only writer, which serializes every check-then-act
//! sequence for one poll. Readers never see the ledger itself, only
//! [`PollSnapshot`] copies taken after a mutation completes.
//!
//! Invariants held after every public method returns:
//! - `tally.len() == options.len()`
//! - `tally.iter().sum() == voters.len()`
//! - an ended ledger never becomes active again (unless an unpersisted
//!   transition is rolled back by its owner)

use crate::errors::PollError;
use crate::storage::{PollRecord, VoterRecord};
use chrono::{DateTime, Utc};
use common::types::{SessionCode, VoterIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum question length in characters.
pub const MAX_QUESTION_CHARS: usize = 500;

/// Minimum number of options.
pub const MIN_OPTIONS: usize = 2;

/// Maximum number of options.
pub const MAX_OPTIONS: usize = 20;

/// Maximum option length in characters.
pub const MAX_OPTION_CHARS: usize = 200;

/// Poll lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Ended,
}

impl PollStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Active => "active",
            PollStatus::Ended => "ended",
        }
    }
}

/// Why a poll moved to [`PollStatus::Ended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The owner ended it.
    Owner,
    /// Its end date passed.
    Expired,
    /// Ephemeral poll lost its last observer.
    Abandoned,
}

impl EndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Owner => "owner",
            EndReason::Expired => "expired",
            EndReason::Abandoned => "abandoned",
        }
    }
}

/// Creation input for a poll.
#[derive(Debug, Clone)]
pub struct PollDraft {
    pub question: String,
    pub options: Vec<String>,
    pub created_by: VoterIdentity,
    pub end_date: Option<DateTime<Utc>>,
    /// Listed to everyone when true, otherwise only to its creator.
    pub is_public: bool,
}

impl PollDraft {
    #[must_use]
    pub fn new(
        question: impl Into<String>,
        options: impl IntoIterator<Item = impl Into<String>>,
        created_by: VoterIdentity,
    ) -> Self {
        Self {
            question: question.into(),
            options: options.into_iter().map(Into::into).collect(),
            created_by,
            end_date: None,
            is_public: true,
        }
    }

    /// Set the time after which the poll stops accepting votes.
    #[must_use]
    pub fn with_end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Set whether the poll appears in the public listing.
    #[must_use]
    pub fn with_visibility(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Trim and validate the draft.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Validation` for an empty or oversized question,
    /// fewer than two or more than twenty options, a blank or oversized
    /// option, or an end date that is not in the future.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Self, PollError> {
        let question = self.question.trim().to_string();
        if question.is_empty() {
            return Err(PollError::Validation("Question is required".to_string()));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(PollError::Validation(format!(
                "Question must be at most {MAX_QUESTION_CHARS} characters"
            )));
        }

        let options: Vec<String> = self
            .options
            .iter()
            .map(|option| option.trim().to_string())
            .collect();
        if options.len() < MIN_OPTIONS {
            return Err(PollError::Validation(format!(
                "At least {MIN_OPTIONS} options are required"
            )));
        }
        if options.len() > MAX_OPTIONS {
            return Err(PollError::Validation(format!(
                "At most {MAX_OPTIONS} options are allowed"
            )));
        }
        if options.iter().any(String::is_empty) {
            return Err(PollError::Validation(
                "Options must not be blank".to_string(),
            ));
        }
        if options
            .iter()
            .any(|option| option.chars().count() > MAX_OPTION_CHARS)
        {
            return Err(PollError::Validation(format!(
                "Options must be at most {MAX_OPTION_CHARS} characters"
            )));
        }

        if let Some(end_date) = self.end_date {
            if end_date <= now {
                return Err(PollError::Validation(
                    "End date must be in the future".to_string(),
                ));
            }
        }

        Ok(Self {
            question,
            options,
            created_by: self.created_by,
            end_date: self.end_date,
            is_public: self.is_public,
        })
    }
}

/// Immutable, internally consistent view of a poll.
///
/// `version` increases by one with every committed mutation, so two
/// snapshots of the same poll are ordered by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    pub session_code: SessionCode,
    pub question: String,
    pub options: Vec<String>,
    pub tally: Vec<u64>,
    pub total_votes: u64,
    pub status: PollStatus,
    pub end_reason: Option<EndReason>,
    pub created_at: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_public: bool,
    pub version: u64,
}

impl PollSnapshot {
    /// Whether the end date has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end_date| end_date <= now)
    }

    /// The snapshot as a reader at `now` must see it.
    ///
    /// An active poll whose end date has passed reads as ended even before
    /// its owner commits the transition. The version is left alone.
    #[must_use]
    pub fn observed_at(self: Arc<Self>, now: DateTime<Utc>) -> Arc<Self> {
        if self.status == PollStatus::Active && self.is_expired_at(now) {
            let mut expired = (*self).clone();
            expired.status = PollStatus::Ended;
            expired.end_reason = Some(EndReason::Expired);
            expired.ended_at = expired.end_date;
            Arc::new(expired)
        } else {
            self
        }
    }
}

/// Result of a successful [`VoteLedger::apply_vote`].
///
/// Hand it back to [`VoteLedger::rollback_vote`] if the vote cannot be
/// persisted.
#[derive(Debug)]
pub struct AppliedVote {
    option_index: usize,
    identity: VoterIdentity,
    previous_version: u64,
}

/// Result of a successful [`VoteLedger::end`].
#[derive(Debug)]
pub struct EndTransition {
    previous_version: u64,
}

/// Authoritative state of one poll.
#[derive(Debug, Clone)]
pub struct VoteLedger {
    session_code: SessionCode,
    question: String,
    options: Vec<String>,
    tally: Vec<u64>,
    voters: HashMap<VoterIdentity, DateTime<Utc>>,
    status: PollStatus,
    end_reason: Option<EndReason>,
    created_by: VoterIdentity,
    created_at: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    is_public: bool,
    version: u64,
}

impl VoteLedger {
    /// Zero-initialized ledger for a validated draft.
    #[must_use]
    pub fn new(session_code: SessionCode, draft: PollDraft, now: DateTime<Utc>) -> Self {
        let tally = vec![0; draft.options.len()];
        Self {
            session_code,
            question: draft.question,
            options: draft.options,
            tally,
            voters: HashMap::new(),
            status: PollStatus::Active,
            end_reason: None,
            created_by: draft.created_by,
            created_at: now,
            end_date: draft.end_date,
            ended_at: None,
            is_public: draft.is_public,
            version: 1,
        }
    }

    /// Rebuild a ledger from a stored record.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Storage` if the record breaks a ledger invariant.
    pub fn from_record(record: PollRecord) -> Result<Self, PollError> {
        let code = record.session_code.clone();
        let corrupt = |what: &str| PollError::Storage(format!("corrupt record {code}: {what}"));

        if record.tally.len() != record.options.len() {
            return Err(corrupt("tally and options differ in length"));
        }
        if record.options.len() < MIN_OPTIONS {
            return Err(corrupt("fewer than two options"));
        }

        let mut voters = HashMap::with_capacity(record.voters.len());
        for voter in record.voters {
            if voters.insert(voter.identity, voter.voted_at).is_some() {
                return Err(corrupt("identity recorded twice"));
            }
        }

        let total: u64 = record.tally.iter().sum();
        if usize::try_from(total).ok() != Some(voters.len()) {
            return Err(corrupt("tally does not match voters"));
        }

        if (record.status == PollStatus::Ended) != record.end_reason.is_some() {
            return Err(corrupt("status and end reason disagree"));
        }

        Ok(Self {
            session_code: record.session_code,
            question: record.question,
            options: record.options,
            tally: record.tally,
            voters,
            status: record.status,
            end_reason: record.end_reason,
            created_by: record.created_by,
            created_at: record.created_at,
            end_date: record.end_date,
            ended_at: record.ended_at,
            is_public: record.is_public,
            version: record.version.max(1),
        })
    }

    /// Stored form of the ledger. Voters are ordered by vote time.
    #[must_use]
    pub fn to_record(&self) -> PollRecord {
        let mut voters: Vec<VoterRecord> = self
            .voters
            .iter()
            .map(|(identity, voted_at)| VoterRecord {
                identity: identity.clone(),
                voted_at: *voted_at,
            })
            .collect();
        voters.sort_by(|a, b| a.voted_at.cmp(&b.voted_at));

        PollRecord {
            session_code: self.session_code.clone(),
            question: self.question.clone(),
            options: self.options.clone(),
            tally: self.tally.clone(),
            voters,
            status: self.status,
            end_reason: self.end_reason,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            end_date: self.end_date,
            ended_at: self.ended_at,
            is_public: self.is_public,
            version: self.version,
        }
    }

    /// Record one vote.
    ///
    /// # Errors
    ///
    /// - `PollError::PollEnded` if the poll is ended or its end date passed
    /// - `PollError::InvalidOption` if `option_index` is out of range
    /// - `PollError::DuplicateVote` if `identity` already voted
    ///
    /// On error nothing changes.
    pub fn apply_vote(
        &mut self,
        option_index: usize,
        identity: VoterIdentity,
        now: DateTime<Utc>,
    ) -> Result<AppliedVote, PollError> {
        if self.status == PollStatus::Ended || self.is_expired_at(now) {
            return Err(PollError::PollEnded);
        }

        let option_count = self.options.len();
        let Some(count) = self.tally.get_mut(option_index) else {
            return Err(PollError::InvalidOption {
                index: option_index,
                option_count,
            });
        };

        if self.voters.contains_key(&identity) {
            return Err(PollError::DuplicateVote);
        }

        *count += 1;
        self.voters.insert(identity.clone(), now);
        let previous_version = self.version;
        self.version += 1;

        Ok(AppliedVote {
            option_index,
            identity,
            previous_version,
        })
    }

    /// Undo a vote that could not be persisted.
    pub fn rollback_vote(&mut self, applied: AppliedVote) {
        if self.voters.remove(&applied.identity).is_some() {
            if let Some(count) = self.tally.get_mut(applied.option_index) {
                *count = count.saturating_sub(1);
            }
        }
        self.version = applied.previous_version;
    }

    /// Move the poll to ended. Returns `None` if it already is.
    pub fn end(&mut self, reason: EndReason, now: DateTime<Utc>) -> Option<EndTransition> {
        if self.status == PollStatus::Ended {
            return None;
        }

        let previous_version = self.version;
        self.status = PollStatus::Ended;
        self.end_reason = Some(reason);
        self.ended_at = Some(match (reason, self.end_date) {
            (EndReason::Expired, Some(end_date)) => end_date,
            _ => now,
        });
        self.version += 1;

        Some(EndTransition { previous_version })
    }

    /// Undo an end transition that could not be persisted.
    pub fn rollback_end(&mut self, transition: EndTransition) {
        self.status = PollStatus::Active;
        self.end_reason = None;
        self.ended_at = None;
        self.version = transition.previous_version;
    }

    /// Whether the end date has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end_date| end_date <= now)
    }

    #[must_use]
    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            session_code: self.session_code.clone(),
            question: self.question.clone(),
            options: self.options.clone(),
            tally: self.tally.clone(),
            total_votes: self.total_votes(),
            status: self.status,
            end_reason: self.end_reason,
            created_at: self.created_at,
            end_date: self.end_date,
            ended_at: self.ended_at,
            is_public: self.is_public,
            version: self.version,
        }
    }

    #[must_use]
    pub fn session_code(&self) -> &SessionCode {
        &self.session_code
    }

    #[must_use]
    pub fn created_by(&self) -> &VoterIdentity {
        &self.created_by
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn status(&self) -> PollStatus {
        self.status
    }

    #[must_use]
    pub fn total_votes(&self) -> u64 {
        self.tally.iter().sum()
    }

    #[must_use]
    pub fn has_voted(&self, identity: &VoterIdentity) -> bool {
        self.voters.contains_key(identity)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn alice() -> VoterIdentity {
        VoterIdentity::Account("alice".to_string())
    }

    fn bob() -> VoterIdentity {
        VoterIdentity::Account("bob".to_string())
    }

    fn coffee_or_tea() -> VoteLedger {
        let draft = PollDraft::new("Coffee or tea?", ["Coffee", "Tea"], alice())
            .validate(Utc::now())
            .unwrap();
        VoteLedger::new(SessionCode::parse("AB23CD").unwrap(), draft, Utc::now())
    }

    fn assert_consistent(ledger: &VoteLedger) {
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.tally.len(), snapshot.options.len());
        assert_eq!(snapshot.total_votes as usize, ledger.voters.len());
    }

    #[test]
    fn test_new_ledger_is_zeroed_and_active() {
        let ledger = coffee_or_tea();
        let snapshot = ledger.snapshot();

        assert_eq!(snapshot.tally, vec![0, 0]);
        assert_eq!(snapshot.total_votes, 0);
        assert_eq!(snapshot.status, PollStatus::Active);
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.end_reason.is_none());
    }

    #[test]
    fn test_vote_sequence_and_duplicate() {
        let mut ledger = coffee_or_tea();
        let now = Utc::now();

        ledger.apply_vote(0, alice(), now).unwrap();
        assert_eq!(ledger.snapshot().tally, vec![1, 0]);

        ledger.apply_vote(1, bob(), now).unwrap();
        assert_eq!(ledger.snapshot().tally, vec![1, 1]);

        let result = ledger.apply_vote(0, alice(), now);
        assert!(matches!(result, Err(PollError::DuplicateVote)));
        assert_eq!(ledger.snapshot().tally, vec![1, 1]);
        assert_eq!(ledger.snapshot().version, 3);
        assert_consistent(&ledger);
    }

    #[test]
    fn test_duplicate_rejected_even_for_other_option() {
        let mut ledger = coffee_or_tea();
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();

        let result = ledger.apply_vote(1, alice(), Utc::now());
        assert!(matches!(result, Err(PollError::DuplicateVote)));
        assert_eq!(ledger.snapshot().tally, vec![1, 0]);
    }

    #[test]
    fn test_invalid_option_leaves_tally_unchanged() {
        let mut ledger = coffee_or_tea();

        let result = ledger.apply_vote(5, alice(), Utc::now());
        assert!(matches!(
            result,
            Err(PollError::InvalidOption {
                index: 5,
                option_count: 2
            })
        ));
        assert_eq!(ledger.snapshot().tally, vec![0, 0]);
        assert!(!ledger.has_voted(&alice()));

        // The rejected identity may still vote for a real option
        ledger.apply_vote(1, alice(), Utc::now()).unwrap();
        assert_eq!(ledger.snapshot().tally, vec![0, 1]);
    }

    #[test]
    fn test_account_and_anonymous_identities_are_distinct() {
        let mut ledger = coffee_or_tea();
        ledger
            .apply_vote(0, VoterIdentity::Account("x".to_string()), Utc::now())
            .unwrap();
        ledger
            .apply_vote(0, VoterIdentity::Anonymous("x".to_string()), Utc::now())
            .unwrap();
        assert_eq!(ledger.snapshot().tally, vec![2, 0]);
    }

    #[test]
    fn test_vote_after_end_is_rejected() {
        let mut ledger = coffee_or_tea();
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();

        assert!(ledger.end(EndReason::Owner, Utc::now()).is_some());
        let result = ledger.apply_vote(1, bob(), Utc::now());
        assert!(matches!(result, Err(PollError::PollEnded)));

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.status, PollStatus::Ended);
        assert_eq!(snapshot.end_reason, Some(EndReason::Owner));
        assert_eq!(snapshot.tally, vec![1, 0]);
    }

    #[test]
    fn test_end_twice_is_noop() {
        let mut ledger = coffee_or_tea();
        assert!(ledger.end(EndReason::Owner, Utc::now()).is_some());
        let version = ledger.snapshot().version;

        assert!(ledger.end(EndReason::Abandoned, Utc::now()).is_none());
        assert_eq!(ledger.snapshot().version, version);
        assert_eq!(ledger.snapshot().end_reason, Some(EndReason::Owner));
    }

    #[test]
    fn test_vote_after_end_date_is_rejected_without_transition() {
        let created = Utc::now();
        let draft = PollDraft::new("Lunch?", ["Yes", "No"], alice())
            .with_end_date(created + Duration::minutes(5))
            .validate(created)
            .unwrap();
        let mut ledger = VoteLedger::new(SessionCode::parse("LNCH22").unwrap(), draft, created);

        ledger
            .apply_vote(0, alice(), created + Duration::minutes(1))
            .unwrap();

        let late = created + Duration::minutes(6);
        let result = ledger.apply_vote(1, bob(), late);
        assert!(matches!(result, Err(PollError::PollEnded)));
        assert_eq!(ledger.status(), PollStatus::Active);
        assert!(ledger.is_expired_at(late));
    }

    #[test]
    fn test_expired_end_uses_end_date() {
        let created = Utc::now();
        let end_date = created + Duration::minutes(5);
        let draft = PollDraft::new("Lunch?", ["Yes", "No"], alice())
            .with_end_date(end_date)
            .validate(created)
            .unwrap();
        let mut ledger = VoteLedger::new(SessionCode::parse("LNCH22").unwrap(), draft, created);

        ledger.end(EndReason::Expired, created + Duration::minutes(9));
        assert_eq!(ledger.snapshot().ended_at, Some(end_date));
    }

    #[test]
    fn test_snapshot_observed_after_end_date_reads_ended() {
        let created = Utc::now();
        let draft = PollDraft::new("Lunch?", ["Yes", "No"], alice())
            .with_end_date(created + Duration::seconds(30))
            .validate(created)
            .unwrap();
        let ledger = VoteLedger::new(SessionCode::parse("LNCH22").unwrap(), draft, created);
        let snapshot = Arc::new(ledger.snapshot());

        let before = Arc::clone(&snapshot).observed_at(created + Duration::seconds(10));
        assert_eq!(before.status, PollStatus::Active);

        let after = snapshot.observed_at(created + Duration::seconds(31));
        assert_eq!(after.status, PollStatus::Ended);
        assert_eq!(after.end_reason, Some(EndReason::Expired));
        assert_eq!(after.version, 1);
    }

    #[test]
    fn test_rollback_vote_restores_state() {
        let mut ledger = coffee_or_tea();
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();
        let before = ledger.snapshot();

        let applied = ledger.apply_vote(1, bob(), Utc::now()).unwrap();
        ledger.rollback_vote(applied);

        assert_eq!(ledger.snapshot(), before);
        assert!(!ledger.has_voted(&bob()));
        assert_consistent(&ledger);
    }

    #[test]
    fn test_rollback_end_restores_active() {
        let mut ledger = coffee_or_tea();
        let before = ledger.snapshot();

        let transition = ledger.end(EndReason::Owner, Utc::now()).unwrap();
        ledger.rollback_end(transition);

        assert_eq!(ledger.snapshot(), before);
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();
    }

    #[test]
    fn test_record_round_trip_preserves_voters() {
        let mut ledger = coffee_or_tea();
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();
        ledger.apply_vote(1, bob(), Utc::now()).unwrap();
        ledger.end(EndReason::Owner, Utc::now());

        let restored = VoteLedger::from_record(ledger.to_record()).unwrap();
        assert_eq!(restored.snapshot(), ledger.snapshot());
        assert!(restored.has_voted(&alice()));
        assert!(restored.has_voted(&bob()));
        assert_eq!(restored.created_by(), &alice());
    }

    #[test]
    fn test_from_record_rejects_inconsistent_tally() {
        let mut ledger = coffee_or_tea();
        ledger.apply_vote(0, alice(), Utc::now()).unwrap();

        let mut record = ledger.to_record();
        record.tally = vec![2, 0];
        assert!(matches!(
            VoteLedger::from_record(record),
            Err(PollError::Storage(_))
        ));

        let mut record = ledger.to_record();
        record.tally = vec![1, 0, 0];
        assert!(matches!(
            VoteLedger::from_record(record),
            Err(PollError::Storage(_))
        ));
    }

    #[test]
    fn test_draft_validation_trims() {
        let draft = PollDraft::new("  Coffee or tea?  ", [" Coffee ", "Tea"], alice())
            .validate(Utc::now())
            .unwrap();
        assert_eq!(draft.question, "Coffee or tea?");
        assert_eq!(draft.options, vec!["Coffee", "Tea"]);
    }

    #[test]
    fn test_draft_validation_failures() {
        let now = Utc::now();
        let cases = [
            PollDraft::new("   ", ["A", "B"], alice()),
            PollDraft::new("Q?", ["Only"], alice()),
            PollDraft::new("Q?", ["A", "   "], alice()),
            PollDraft::new("x".repeat(MAX_QUESTION_CHARS + 1), ["A", "B"], alice()),
            PollDraft::new("Q?", vec!["opt"; MAX_OPTIONS + 1], alice()),
            PollDraft::new("Q?", ["A".repeat(MAX_OPTION_CHARS + 1), "B".to_string()], alice()),
            PollDraft::new("Q?", ["A", "B"], alice()).with_end_date(now - Duration::seconds(1)),
        ];

        for draft in cases {
            let description = format!("{draft:?}");
            assert!(
                matches!(draft.validate(now), Err(PollError::Validation(_))),
                "{description} should fail validation"
            );
        }
    }
}
