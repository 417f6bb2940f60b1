use serde::{Deserialize, Serialize};

/// JSON body of a lock object.
///
/// `acquired_at_ms` is rewritten on every renewal, so it doubles as the last-touched time used
/// for range freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasePayload {
    pub owner: String,
    pub acquired_at_ms: u64,
    pub ttl_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl LeasePayload {
    pub fn new(owner: &str, acquired_at_ms: u64, ttl_ms: u64) -> Self {
        Self {
            owner: owner.to_string(),
            acquired_at_ms,
            ttl_ms,
            extra: serde_json::Value::Null,
        }
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.acquired_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) > self.ttl_ms
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// `None` for bodies that do not parse; callers treat those leases as stale.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Body of a done marker. Presence of the key is what matters; the body is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneRecord {
    pub owner: String,
    pub done_at_ms: u64,
}

impl DoneRecord {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::LeasePayload;

    #[test]
    fn staleness_is_strictly_after_ttl() {
        let lease = LeasePayload::new("a", 1_000, 500);
        assert!(!lease.is_stale(1_500));
        assert!(lease.is_stale(1_501));
        assert_eq!(lease.expires_at_ms(), 1_500);
    }

    #[test]
    fn decode_tolerates_missing_extra_and_rejects_garbage() {
        let decoded =
            LeasePayload::decode(br#"{"owner":"b","acquired_at_ms":5,"ttl_ms":10}"#).expect("lease");
        assert_eq!(decoded, LeasePayload::new("b", 5, 10));
        assert!(LeasePayload::decode(b"not json").is_none());
        assert_eq!(LeasePayload::decode(&decoded.encode()), Some(decoded));
    }
}
