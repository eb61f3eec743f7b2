use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named multi-dimensional resource amount, such as `{cpu: 4, net: 1}`.
///
/// Slots that are absent count as zero, and zero-valued slots are never
/// stored, so two vectors describing the same amounts always compare (and
/// hash) equal. That canonical form is what lets vectors act as map keys
/// for the queue's cost buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector {
    slots: BTreeMap<String, u64>,
}

impl ResourceVector {
    /// An empty vector: zero of everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, dropping zero amounts.
    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, amount: u64) -> Self {
        self.set(kind, amount);
        self
    }

    /// Sets a slot, removing it entirely when the amount is zero.
    pub fn set(&mut self, kind: impl Into<String>, amount: u64) {
        let kind = kind.into();
        if amount == 0 {
            self.slots.remove(&kind);
        } else {
            self.slots.insert(kind, amount);
        }
    }

    /// Returns the amount for a slot, zero when absent.
    #[must_use]
    pub fn get(&self, kind: &str) -> u64 {
        self.slots.get(kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Pointwise addition of `other` into `self`.
    pub fn add_assign(&mut self, other: &Self) {
        for (kind, amount) in &other.slots {
            if *amount == 0 {
                continue;
            }
            *self.slots.entry(kind.clone()).or_insert(0) += amount;
        }
    }

    /// Pointwise saturating subtraction of `other` from `self`.
    ///
    /// Slots that reach zero are removed to keep the canonical form.
    pub fn sub_assign(&mut self, other: &Self) {
        for (kind, amount) in &other.slots {
            if let Some(current) = self.slots.get_mut(kind) {
                *current = current.saturating_sub(*amount);
                if *current == 0 {
                    self.slots.remove(kind);
                }
            }
        }
    }

    /// True when every slot of `self` fits within `cap`.
    ///
    /// A slot absent from `cap` admits only a zero demand, which the
    /// canonical form never stores, so any stored slot missing from `cap`
    /// fails the check.
    #[must_use]
    pub fn fits_within(&self, cap: &Self) -> bool {
        self.slots
            .iter()
            .all(|(kind, amount)| *amount <= cap.get(kind))
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.slots.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{")?;
        for (i, (kind, amount)) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kind}: {amount}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, u64)> for ResourceVector {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (kind, amount) in iter {
            let prior = vector.get(&kind);
            vector.set(kind, prior + amount);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_slot_reads_as_zero() {
        let v = ResourceVector::new().with("cpu", 2);
        assert_eq!(v.get("cpu"), 2);
        assert_eq!(v.get("net"), 0);
    }

    #[test]
    fn zero_amounts_are_never_stored() {
        let explicit = ResourceVector::new().with("cpu", 0);
        assert_eq!(explicit, ResourceVector::new());

        let mut v = ResourceVector::new().with("cpu", 3);
        v.set("cpu", 0);
        assert!(v.is_empty());
        assert_eq!(v, ResourceVector::new());
    }

    #[test]
    fn canonical_form_gives_equal_hashes() {
        use std::collections::HashMap;

        let a = ResourceVector::new().with("cpu", 1);
        let b = ResourceVector::new().with("cpu", 1).with("net", 0);

        let mut buckets: HashMap<ResourceVector, u32> = HashMap::new();
        buckets.insert(a, 7);
        assert_eq!(buckets.get(&b), Some(&7));
    }

    #[test]
    fn add_then_sub_restores() {
        let mut usage = ResourceVector::new().with("cpu", 2);
        let cost = ResourceVector::new().with("cpu", 1).with("net", 1);

        usage.add_assign(&cost);
        assert_eq!(usage.get("cpu"), 3);
        assert_eq!(usage.get("net"), 1);

        usage.sub_assign(&cost);
        assert_eq!(usage, ResourceVector::new().with("cpu", 2));
    }

    #[test]
    fn sub_saturates_and_drops_zeroed_slots() {
        let mut usage = ResourceVector::new().with("cpu", 1);
        usage.sub_assign(&ResourceVector::new().with("cpu", 5).with("net", 1));
        assert!(usage.is_empty());
    }

    #[test]
    fn fits_within_is_pointwise() {
        let cap = ResourceVector::new().with("cpu", 4).with("net", 1);

        assert!(ResourceVector::new().fits_within(&cap));
        assert!(ResourceVector::new().with("cpu", 4).fits_within(&cap));
        assert!(!ResourceVector::new().with("cpu", 5).fits_within(&cap));
        assert!(!ResourceVector::new().with("disk", 1).fits_within(&cap));
    }

    #[test]
    fn display_is_stable_and_sorted() {
        let v = ResourceVector::new().with("net", 1).with("cpu", 2);
        assert_eq!(v.to_string(), "{cpu: 2, net: 1}");
        assert_eq!(ResourceVector::new().to_string(), "{}");
    }

    #[test]
    fn serde_is_a_bare_map() {
        let v = ResourceVector::new().with("cpu", 2).with("net", 1);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"cpu":2,"net":1}"#);

        let back: ResourceVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
