use std::collections::HashMap;

use crate::types::{LineKey, LineValue};

/// Last-seen odds per market line, owned by exactly one sport worker.
///
/// Not persisted: after a restart every line reads as changed once, which
/// costs one duplicate snapshot per line and nothing else.
#[derive(Debug, Default)]
pub struct ChangeCache {
    entries: HashMap<LineKey, LineValue>,
}

/// Prior cache state for keys touched during one event's diff, so a failed
/// write can put the cache back the way it was.
#[derive(Debug, Default)]
pub struct CacheUndo {
    prior: Vec<(LineKey, Option<LineValue>)>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True on first sight of `key` or when any field differs from the cached
    /// value; the cache then holds `value`. False leaves the cache untouched.
    pub fn has_changed(&mut self, key: LineKey, value: LineValue) -> bool {
        match self.entries.get(&key) {
            Some(cached) if *cached == value => false,
            _ => {
                self.entries.insert(key, value);
                true
            }
        }
    }

    /// Like [`has_changed`](Self::has_changed), recording the previous entry in `undo`
    /// whenever the cache is modified.
    pub fn observe(&mut self, key: LineKey, value: LineValue, undo: &mut CacheUndo) -> bool {
        let prior = self.entries.get(&key).cloned();
        let changed = self.has_changed(key, value);
        if changed {
            undo.prior.push((key, prior));
        }
        changed
    }

    /// Restores every entry recorded in `undo`, newest first.
    pub fn revert(&mut self, undo: CacheUndo) {
        for (key, prior) in undo.prior.into_iter().rev() {
            match prior {
                Some(value) => {
                    self.entries.insert(key, value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
impl ChangeCache {
    pub(crate) fn get(&self, key: &LineKey) -> Option<&LineValue> {
        self.entries.get(key)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
impl CacheUndo {
    pub(crate) fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TeamSide;

    fn ml(home: f64, draw: f64, away: f64) -> LineValue {
        LineValue::MoneyLine { home: Some(home), draw: Some(draw), away: Some(away) }
    }

    #[test]
    fn first_observation_is_a_change_and_is_cached() {
        let mut cache = ChangeCache::new();
        let key = LineKey::money_line(1001, 0);
        assert!(cache.has_changed(key, ml(1.91, 3.40, 4.20)));
        assert_eq!(cache.get(&key), Some(&ml(1.91, 3.40, 4.20)));
    }

    #[test]
    fn identical_payload_is_unchanged() {
        let mut cache = ChangeCache::new();
        let key = LineKey::money_line(1001, 0);
        assert!(cache.has_changed(key, ml(1.91, 3.40, 4.20)));
        assert!(!cache.has_changed(key, ml(1.91, 3.40, 4.20)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn any_field_difference_is_a_change() {
        let mut cache = ChangeCache::new();
        let key = LineKey::spread(1001, 0, -0.5);
        let base = LineValue::Spread { home: Some(1.9), away: Some(2.0), max_bet: Some(500.0) };
        assert!(cache.has_changed(key, base.clone()));

        let bumped_limit = LineValue::Spread { home: Some(1.9), away: Some(2.0), max_bet: Some(750.0) };
        assert!(cache.has_changed(key, bumped_limit.clone()));
        assert_eq!(cache.get(&key), Some(&bumped_limit));

        let pulled = LineValue::Spread { home: Some(1.9), away: None, max_bet: Some(750.0) };
        assert!(cache.has_changed(key, pulled));
    }

    #[test]
    fn keys_are_independent() {
        let mut cache = ChangeCache::new();
        let value = LineValue::TeamTotal { points: Some(1.5), over: Some(1.8), under: Some(2.0) };
        assert!(cache.has_changed(LineKey::team_total(1, 0, TeamSide::Home), value.clone()));
        assert!(cache.has_changed(LineKey::team_total(1, 0, TeamSide::Away), value.clone()));
        assert!(cache.has_changed(LineKey::team_total(1, 1, TeamSide::Home), value.clone()));
        assert!(cache.has_changed(LineKey::team_total(2, 0, TeamSide::Home), value));
    }

    #[test]
    fn revert_restores_prior_entries() {
        let mut cache = ChangeCache::new();
        let seen = LineKey::total(5, 0, 2.5);
        let fresh = LineKey::total(5, 0, 3.0);
        let old = LineValue::Total { over: Some(1.9), under: Some(1.9), max_bet: None };
        cache.has_changed(seen, old.clone());

        let mut undo = CacheUndo::default();
        let moved = LineValue::Total { over: Some(1.8), under: Some(2.0), max_bet: None };
        assert!(cache.observe(seen, moved.clone(), &mut undo));
        assert!(cache.observe(fresh, moved.clone(), &mut undo));
        assert!(!cache.observe(fresh, moved, &mut undo));

        cache.revert(undo);
        assert_eq!(cache.get(&seen), Some(&old));
        assert_eq!(cache.get(&fresh), None);
    }
}
