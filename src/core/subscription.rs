//! Subject/key subscription table.
//!
//! The wildcard is an explicit sentinel, not a missing key: a subject row
//! holds a set of [`KeyFilter`]s and an empty row never persists.

use std::collections::{HashMap, HashSet};

use crate::core::message::SubjectMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyFilter {
    /// Matches every message on the subject, keyed or not.
    Any,
    /// Matches messages whose key for the subject equals this value.
    Key(String),
}

impl KeyFilter {
    fn admits(&self, key: Option<&str>) -> bool {
        match self {
            KeyFilter::Any => true,
            KeyFilter::Key(k) => key == Some(k.as_str()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionTable {
    subjects: HashMap<String, HashSet<KeyFilter>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add filters for a subject; `None` adds the wildcard. Returns only the
    /// filters that actually entered the set, so idempotent adds are silent.
    pub fn add(&mut self, subject: &str, keys: Option<&[String]>) -> Vec<KeyFilter> {
        let entry = self.subjects.entry(subject.to_string()).or_default();
        let mut changed = Vec::new();
        match keys {
            None => {
                if entry.insert(KeyFilter::Any) {
                    changed.push(KeyFilter::Any);
                }
            }
            Some(keys) => {
                for key in keys {
                    let filter = KeyFilter::Key(key.clone());
                    if entry.insert(filter.clone()) {
                        changed.push(filter);
                    }
                }
            }
        }
        if entry.is_empty() {
            self.subjects.remove(subject);
        }
        changed
    }

    /// Remove filters for a subject; `None` drops the whole subject row.
    /// Returns only the filters that actually left the set.
    pub fn remove(&mut self, subject: &str, keys: Option<&[String]>) -> Vec<KeyFilter> {
        match keys {
            None => match self.subjects.remove(subject) {
                Some(set) => {
                    let mut removed: Vec<KeyFilter> = set.into_iter().collect();
                    removed.sort();
                    removed
                }
                None => Vec::new(),
            },
            Some(keys) => {
                let Some(entry) = self.subjects.get_mut(subject) else {
                    return Vec::new();
                };
                let mut removed = Vec::new();
                for key in keys {
                    let filter = KeyFilter::Key(key.clone());
                    if entry.remove(&filter) {
                        removed.push(filter);
                    }
                }
                if entry.is_empty() {
                    self.subjects.remove(subject);
                }
                removed
            }
        }
    }

    /// True iff at least one of the message's subjects is admitted.
    pub fn matches(&self, subjects: &SubjectMap) -> bool {
        subjects.iter().any(|(subject, key)| {
            self.subjects
                .get(subject)
                .is_some_and(|set| set.iter().any(|f| f.admits(key.as_deref())))
        })
    }

    pub fn contains_subject(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.subjects.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Full filter snapshot, used for re-subscription after reconnect.
    pub fn snapshot(&self) -> Vec<(String, Vec<KeyFilter>)> {
        let mut rows: Vec<(String, Vec<KeyFilter>)> = self
            .subjects
            .iter()
            .map(|(subject, set)| {
                let mut filters: Vec<KeyFilter> = set.iter().cloned().collect();
                filters.sort();
                (subject.clone(), filters)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }
}
