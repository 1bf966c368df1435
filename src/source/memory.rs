//! In-process data source.
//!
//! Holds documents in a mutex-guarded table keyed by foreign id. Used by the
//! test suite and available as the `memory` driver for local experiments;
//! supports injecting one-shot failures and latency to exercise the worker's
//! retry paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::model::Document;

use super::{DataSource, SourceFault};

#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    next_id: u64,
    fail_next: Option<String>,
    delay_next: Option<Duration>,
    fail_next_set: Option<String>,
    delay_next_set: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings are accepted for config-file compatibility; the driver keeps
    /// no state outside the process.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        let _ = settings;
        Self::new()
    }

    /// Seed a document under a chosen foreign id.
    pub fn insert(&self, foreign_id: impl Into<String>, doc: Document) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.docs.insert(foreign_id.into(), doc);
    }

    pub fn document(&self, foreign_id: &str) -> Option<Document> {
        let inner = self.inner.lock().expect("memory source lock poisoned");
        inner.docs.get(foreign_id).cloned()
    }

    pub fn remove(&self, foreign_id: &str) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.docs.remove(foreign_id);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("memory source lock poisoned");
        inner.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next call fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.fail_next = Some(reason.into());
    }

    /// Make the next call sleep for `delay` before answering.
    pub fn delay_next(&self, delay: Duration) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.delay_next = Some(delay);
    }

    /// Make the next `set` call fail with `reason`; reads are unaffected.
    pub fn fail_next_set(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.fail_next_set = Some(reason.into());
    }

    /// Make the next `set` call sleep for `delay`; reads are unaffected.
    pub fn delay_next_set(&self, delay: Duration) {
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        inner.delay_next_set = Some(delay);
    }

    /// Consume pending injections; returns an error if a failure was armed.
    fn check_injections(&self, is_set: bool) -> Result<(), SourceFault> {
        let (fail, delay) = {
            let mut inner = self.inner.lock().expect("memory source lock poisoned");
            let mut fail = inner.fail_next.take();
            let mut delay = inner.delay_next.take();
            if is_set {
                fail = fail.or_else(|| inner.fail_next_set.take());
                delay = delay.or_else(|| inner.delay_next_set.take());
            }
            (fail, delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match fail {
            Some(reason) => Err(SourceFault(reason)),
            None => Ok(()),
        }
    }
}

impl DataSource for MemorySource {
    fn get(&self, foreign_id: &str) -> Result<Option<Document>, SourceFault> {
        self.check_injections(false)?;
        Ok(self.document(foreign_id))
    }

    fn set(&self, foreign_id: Option<&str>, doc: &Document) -> Result<String, SourceFault> {
        self.check_injections(true)?;
        let mut inner = self.inner.lock().expect("memory source lock poisoned");
        let id = match foreign_id {
            Some(id) => id.to_string(),
            None => {
                inner.next_id += 1;
                format!("m{}", inner.next_id)
            }
        };
        inner.docs.insert(id.clone(), doc.clone());
        Ok(id)
    }

    fn delete(&self, foreign_id: &str) -> Result<(), SourceFault> {
        self.check_injections(false)?;
        self.remove(foreign_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentPath;

    fn doc(value: &str) -> Document {
        let mut d = Document::new();
        d.insert(DocumentPath::new(["name"]).expect("path"), value.to_string());
        d
    }

    #[test]
    fn set_without_id_allocates_fresh_ids() {
        let source = MemorySource::new();
        let a = source.set(None, &doc("Alice")).expect("set");
        let b = source.set(None, &doc("Bob")).expect("set");
        assert_ne!(a, b);
        assert_eq!(source.document(&a), Some(doc("Alice")));
    }

    #[test]
    fn delete_of_absent_id_is_a_no_op() {
        let source = MemorySource::new();
        source.delete("ghost").expect("delete");
        assert!(source.is_empty());
    }

    #[test]
    fn armed_failure_fires_once() {
        let source = MemorySource::new();
        source.fail_next("boom");
        assert!(source.get("1").is_err());
        assert!(source.get("1").is_ok());
    }
}
