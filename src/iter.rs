//! Iterator module: lazy enumeration of a value set on a background producer.
//!
//! The producer walks the values (flattening list-shaped values) and hands them over one at a
//! time through a bounded channel. Dropping or cancelling the iterator stops the producer.

use crate::evidence::EvidenceNode;
use crate::value::{ValueId, ValueRef, Values};
use crate::{critical, SyntaxFlowError};
use crossbeam_channel::{bounded, Receiver};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// Shared flag telling a producer to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumer side of one enumeration, plus the per-element flags collected while it runs.
pub struct ValueIter {
    receiver: Option<Receiver<ValueRef>>,
    producer: Option<JoinHandle<()>>,
    cancel: CancelToken,
    current: Option<ValueRef>,
    /// Evidence of filters run for the current element.
    evidence: Vec<EvidenceNode>,
    results: Vec<(ValueRef, bool)>,
    collected: Vec<EvidenceNode>,
    exhausted: bool,
}

impl ValueIter {
    pub fn spawn(values: Values) -> Self {
        let (tx, rx) = bounded::<ValueRef>(1);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let producer = thread::spawn(move || {
            let mut seen: HashSet<ValueId> = HashSet::new();
            let mut pending: Vec<ValueRef> = values.iter().cloned().rev().collect();
            while let Some(value) = pending.pop() {
                if token.is_cancelled() {
                    trace!("iterator producer cancelled");
                    return;
                }
                if !seen.insert(value.id()) {
                    continue;
                }
                if value.is_list() {
                    pending.extend(value.list_elements().into_iter().rev());
                    continue;
                }
                if tx.send(value).is_err() {
                    return;
                }
            }
        });
        Self {
            receiver: Some(rx),
            producer: Some(producer),
            cancel,
            current: None,
            evidence: Vec::new(),
            results: Vec::new(),
            collected: Vec::new(),
            exhausted: false,
        }
    }

    /// Pull the next element; `None` once the producer has closed its side.
    pub fn next_value(&mut self) -> Option<ValueRef> {
        if self.exhausted {
            return None;
        }
        let next = self.receiver.as_ref().and_then(|rx| rx.recv().ok());
        match &next {
            Some(v) => self.current = Some(Arc::clone(v)),
            None => {
                self.current = None;
                self.exhausted = true;
            }
        }
        next
    }

    /// Record the outcome for the element handed out last.
    pub fn record(&mut self, passed: bool) -> Result<(), SyntaxFlowError> {
        let current = self.current.take().ok_or_else(|| critical("iterator: collect without a current element"))?;
        self.results.push((current, passed));
        self.collected.append(&mut self.evidence);
        Ok(())
    }

    /// Keep evidence of a filter evaluated for the current element.
    pub fn attach_evidence(&mut self, evidence: EvidenceNode) -> Result<(), SyntaxFlowError> {
        if self.current.is_none() {
            return Err(critical("iterator: evidence without a current element"));
        }
        self.evidence.push(evidence);
        Ok(())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Stop the producer and return the collected values, flags and nested evidence.
    pub fn finish(mut self) -> (Values, Vec<bool>, Vec<EvidenceNode>) {
        self.shutdown();
        let results = std::mem::take(&mut self.results);
        let flags = results.iter().map(|(_, passed)| *passed).collect();
        let values = Values::from_vec(results.into_iter().map(|(v, _)| v).collect());
        (values, flags, std::mem::take(&mut self.collected))
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        // dropping the receiver unblocks a producer waiting on a full channel
        self.receiver.take();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ValueIter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
