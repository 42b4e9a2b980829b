//! Credential ring: a fixed set of slots plus a cursor.
//!
//! The pool is an arena of optional credential slots addressed by index. The
//! cursor (`current`) always addresses a non-exhausted credential whenever one
//! exists; every mutating method restores that before returning. Time is passed
//! in so the ring stays deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named positions for the first three credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Primary,
    Secondary,
    Tertiary,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => 1,
            Slot::Tertiary => 2,
        }
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Slot::Primary),
            "secondary" => Ok(Slot::Secondary),
            "tertiary" => Ok(Slot::Tertiary),
            other => Err(format!(
                "unknown slot '{other}' (expected primary, secondary or tertiary)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("credential pool is empty")]
    Empty,
    #[error("all {0} credentials are exhausted")]
    AllExhausted(usize),
}

/// Mask a secret for logs and persisted records.
pub fn masked_id(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    exhausted: bool,
    exhausted_reason: Option<String>,
    exhausted_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            exhausted: false,
            exhausted_reason: None,
            exhausted_at: None,
        }
    }

    pub fn masked_id(&self) -> String {
        masked_id(&self.secret)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn exhausted_at(&self) -> Option<DateTime<Utc>> {
        self.exhausted_at
    }

    fn clear(&mut self) {
        self.exhausted = false;
        self.exhausted_reason = None;
        self.exhausted_at = None;
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("masked_id", &self.masked_id())
            .field("exhausted", &self.exhausted)
            .field("exhausted_reason", &self.exhausted_reason)
            .field("exhausted_at", &self.exhausted_at)
            .finish()
    }
}

/// The credential a session is bound to.
#[derive(Clone, PartialEq, Eq)]
pub struct ActiveCredential {
    pub index: usize,
    pub secret: String,
}

impl ActiveCredential {
    pub fn masked_id(&self) -> String {
        masked_id(&self.secret)
    }
}

impl fmt::Debug for ActiveCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCredential")
            .field("index", &self.index)
            .field("masked_id", &self.masked_id())
            .finish()
    }
}

/// Observability record for every pool mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub at: DateTime<Utc>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub reason: String,
}

/// Persisted per-slot state. Never contains the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub slot: usize,
    pub masked_id: String,
    pub exhausted: bool,
    pub exhausted_reason: Option<String>,
    pub exhausted_at: Option<DateTime<Utc>>,
}

/// Persisted pool record (`.quill/state/pool.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub credentials: Vec<CredentialRecord>,
    pub current_index: usize,
}

/// Persisted secrets keyed by slot (`.quill/state/credentials.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsRecord {
    pub slots: BTreeMap<usize, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPool {
    slots: Vec<Option<Credential>>,
    current: usize,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a pool from its persisted halves.
    ///
    /// Exhaustion state is only carried over when the record's masked id still
    /// matches the secret in that slot.
    pub fn from_records(record: &PoolRecord, secrets: &SecretsRecord) -> Self {
        let len = secrets.slots.keys().next_back().map_or(0, |max| max + 1);
        let mut slots: Vec<Option<Credential>> = vec![None; len];
        for (&index, secret) in &secrets.slots {
            let mut credential = Credential::new(secret.clone());
            if let Some(state) = record.credentials.iter().find(|c| c.slot == index)
                && state.masked_id == credential.masked_id()
                && state.exhausted
            {
                credential.exhausted = true;
                credential.exhausted_reason = state.exhausted_reason.clone();
                credential.exhausted_at = state.exhausted_at;
            }
            slots[index] = Some(credential);
        }
        let mut pool = Self {
            slots,
            current: record.current_index,
        };
        pool.normalize();
        pool
    }

    /// Number of occupied slots.
    pub fn size(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn credential(&self, index: usize) -> Option<&Credential> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Insert or overwrite a credential. Without a position it is appended.
    pub fn add(
        &mut self,
        secret: impl Into<String>,
        position: Option<Slot>,
        now: DateTime<Utc>,
    ) -> RotationEvent {
        let from = self.current_masked();
        let index = position.map_or(self.slots.len(), Slot::index);
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        let credential = Credential::new(secret);
        let masked = credential.masked_id();
        self.slots[index] = Some(credential);
        if self.size() == 1 {
            self.current = index;
        }
        self.normalize();
        RotationEvent {
            at: now,
            from,
            to: self.current_masked(),
            reason: format!("added {masked} at slot {index}"),
        }
    }

    /// The usable credential under the cursor.
    pub fn current(&self) -> Result<ActiveCredential, PoolError> {
        if self.size() == 0 {
            return Err(PoolError::Empty);
        }
        match self.credential(self.current) {
            Some(credential) if !credential.exhausted => Ok(ActiveCredential {
                index: self.current,
                secret: credential.secret.clone(),
            }),
            _ => Err(PoolError::AllExhausted(self.size())),
        }
    }

    /// Flag `target` as exhausted and advance the cursor if it was current.
    ///
    /// Idempotent: returns `None` when the credential is already exhausted or
    /// the slot no longer holds the same secret.
    pub fn mark_exhausted(
        &mut self,
        target: &ActiveCredential,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<RotationEvent> {
        let from = self.current_masked();
        let credential = self
            .slots
            .get_mut(target.index)
            .and_then(Option::as_mut)
            .filter(|c| c.secret == target.secret)?;
        if credential.exhausted {
            return None;
        }
        credential.exhausted = true;
        credential.exhausted_reason = Some(reason.to_string());
        credential.exhausted_at = Some(now);
        let masked = credential.masked_id();

        if self.current == target.index
            && let Some(next) = self.next_usable_after(self.current)
        {
            self.current = next;
        }
        Some(RotationEvent {
            at: now,
            from,
            to: self.current_masked(),
            reason: format!("exhausted {masked}: {reason}"),
        })
    }

    /// Clear every exhaustion flag and move the cursor to the first credential.
    pub fn reset_exhausted(&mut self, now: DateTime<Utc>) -> RotationEvent {
        let from = self.current_masked();
        for credential in self.slots.iter_mut().flatten() {
            credential.clear();
        }
        if let Some(first) = self.slots.iter().position(Option::is_some) {
            self.current = first;
        }
        RotationEvent {
            at: now,
            from,
            to: self.current_masked(),
            reason: "reset exhausted".to_string(),
        }
    }

    /// Advance to the next usable credential, whatever the state of the current one.
    pub fn rotate_manually(&mut self, now: DateTime<Utc>) -> RotationEvent {
        let from = self.current_masked();
        if let Some(next) = self.next_usable_after(self.current) {
            self.current = next;
        }
        RotationEvent {
            at: now,
            from,
            to: self.current_masked(),
            reason: "manual rotation".to_string(),
        }
    }

    /// Persistable view of the pool without secrets.
    pub fn record(&self) -> PoolRecord {
        let credentials = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, credential)| {
                credential.as_ref().map(|c| CredentialRecord {
                    slot,
                    masked_id: c.masked_id(),
                    exhausted: c.exhausted,
                    exhausted_reason: c.exhausted_reason.clone(),
                    exhausted_at: c.exhausted_at,
                })
            })
            .collect();
        PoolRecord {
            credentials,
            current_index: self.current,
        }
    }

    pub fn secrets(&self) -> SecretsRecord {
        SecretsRecord {
            slots: self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, c)| c.as_ref().map(|c| (slot, c.secret.clone())))
                .collect(),
        }
    }

    fn current_masked(&self) -> Option<String> {
        self.credential(self.current).map(Credential::masked_id)
    }

    fn is_usable(&self, index: usize) -> bool {
        self.credential(index).is_some_and(|c| !c.exhausted)
    }

    /// Probe at most `len - 1` slots after `start`, in ring order.
    fn next_usable_after(&self, start: usize) -> Option<usize> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        (1..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| self.is_usable(index))
    }

    fn normalize(&mut self) {
        if self.is_usable(self.current) {
            return;
        }
        if let Some(next) = self.next_usable_after(self.current) {
            self.current = next;
        } else if let Some(first) = self.slots.iter().position(Option::is_some) {
            self.current = first;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "key-aaaaaaaaaaaa-0001";
    const B: &str = "key-bbbbbbbbbbbb-0002";
    const C: &str = "key-cccccccccccc-0003";

    fn pool_of(secrets: &[&str]) -> CredentialPool {
        let mut pool = CredentialPool::new();
        for secret in secrets {
            pool.add(*secret, None, Utc::now());
        }
        pool
    }

    fn active(index: usize, secret: &str) -> ActiveCredential {
        ActiveCredential {
            index,
            secret: secret.to_string(),
        }
    }

    #[test]
    fn masks_secrets() {
        assert_eq!(masked_id(A), "key-…0001");
        assert_eq!(masked_id("short"), "****");
    }

    #[test]
    fn current_skips_to_only_usable_credential_from_any_position() {
        for start in 0..3 {
            let mut pool = pool_of(&[A, B, C]);
            for _ in 0..start {
                pool.rotate_manually(Utc::now());
            }
            pool.mark_exhausted(&active(0, A), "quota", Utc::now());
            pool.mark_exhausted(&active(2, C), "quota", Utc::now());
            let current = pool.current().expect("one usable credential");
            assert_eq!(current.index, 1, "start position {start}");
            assert_eq!(current.secret, B);
        }
    }

    #[test]
    fn exhausting_sole_credential_reports_all_exhausted() {
        let mut pool = pool_of(&[A]);
        let event = pool.mark_exhausted(&active(0, A), "quota", Utc::now());
        assert!(event.is_some());
        assert_eq!(pool.current(), Err(PoolError::AllExhausted(1)));
    }

    #[test]
    fn empty_pool_has_no_current() {
        assert_eq!(CredentialPool::new().current(), Err(PoolError::Empty));
    }

    #[test]
    fn mark_exhausted_twice_keeps_first_timestamp() {
        let mut pool = pool_of(&[A, B]);
        let first = Utc::now();
        let later = first + chrono::TimeDelta::seconds(30);
        assert!(pool.mark_exhausted(&active(0, A), "quota", first).is_some());
        assert!(pool.mark_exhausted(&active(0, A), "quota", later).is_none());
        let credential = pool.credential(0).expect("slot 0");
        assert_eq!(credential.exhausted_at(), Some(first));
        assert_eq!(pool.current_index(), 1);
    }

    #[test]
    fn marking_a_non_current_credential_keeps_the_cursor() {
        let mut pool = pool_of(&[A, B, C]);
        pool.mark_exhausted(&active(2, C), "quota", Utc::now());
        assert_eq!(pool.current_index(), 0);
    }

    #[test]
    fn stale_reference_after_overwrite_is_ignored() {
        let mut pool = pool_of(&[A, B]);
        pool.add(C, Some(Slot::Primary), Utc::now());
        assert!(pool.mark_exhausted(&active(0, A), "quota", Utc::now()).is_none());
        assert!(!pool.credential(0).expect("slot 0").is_exhausted());
    }

    #[test]
    fn rotation_wraps_around_the_ring() {
        let mut pool = pool_of(&[A, B, C]);
        pool.rotate_manually(Utc::now());
        pool.rotate_manually(Utc::now());
        assert_eq!(pool.current_index(), 2);
        let event = pool.rotate_manually(Utc::now());
        assert_eq!(pool.current_index(), 0);
        assert_eq!(event.from, Some(masked_id(C)));
        assert_eq!(event.to, Some(masked_id(A)));
    }

    #[test]
    fn manual_rotation_skips_exhausted_credentials() {
        let mut pool = pool_of(&[A, B, C]);
        pool.mark_exhausted(&active(1, B), "quota", Utc::now());
        pool.rotate_manually(Utc::now());
        assert_eq!(pool.current_index(), 2);
    }

    #[test]
    fn reset_clears_flags_and_returns_to_first_slot() {
        let mut pool = pool_of(&[A, B]);
        pool.mark_exhausted(&active(0, A), "quota", Utc::now());
        pool.mark_exhausted(&active(1, B), "quota", Utc::now());
        assert!(pool.current().is_err());
        pool.reset_exhausted(Utc::now());
        assert_eq!(pool.current().expect("usable").index, 0);
    }

    #[test]
    fn adding_to_an_exhausted_pool_moves_cursor_to_new_credential() {
        let mut pool = pool_of(&[A]);
        pool.mark_exhausted(&active(0, A), "quota", Utc::now());
        pool.add(B, Some(Slot::Tertiary), Utc::now());
        let current = pool.current().expect("usable");
        assert_eq!(current.index, 2);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn records_round_trip_without_secrets() {
        let mut pool = pool_of(&[A, B]);
        pool.mark_exhausted(&active(0, A), "quota", Utc::now());
        let record = pool.record();
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(!json.contains(A));

        let restored = CredentialPool::from_records(&record, &pool.secrets());
        assert_eq!(restored, pool);
    }

    #[test]
    fn replaced_secret_drops_persisted_exhaustion() {
        let mut pool = pool_of(&[A, B]);
        pool.mark_exhausted(&active(0, A), "quota", Utc::now());
        let record = pool.record();
        let mut secrets = pool.secrets();
        secrets.slots.insert(0, C.to_string());

        let restored = CredentialPool::from_records(&record, &secrets);
        assert!(!restored.credential(0).expect("slot 0").is_exhausted());
    }

    #[test]
    fn slots_parse_case_insensitively() {
        assert_eq!("Secondary".parse::<Slot>(), Ok(Slot::Secondary));
        assert!("fourth".parse::<Slot>().is_err());
    }
}
