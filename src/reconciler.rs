/// Absorbs writes made to the local node by a remote master
///
/// A slave-mode transport reports each served write as an [`ExternalWrite`].
/// The reconciler maps the reported words or bits onto the store's logical
/// entries, reassembling multi-word values, and returns one `Remote`-origin
/// change set so nothing is echoed back onto the bus.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{ModbusError, ModbusResult};
use crate::register_store::{ChangeOrigin, ChangeSet, EntryId, FieldChange, RegisterKind, RegisterStore};
use crate::transport::{ExternalValues, ExternalWrite};

/// A multi-word entry the write only partly covered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSpan {
    pub id: EntryId,
    pub address: u16,
    pub span: usize,
    /// Words of the span that were present in the write
    pub present: usize,
}

/// Result of reconciling one external write
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub changes: ChangeSet,
    /// Entries whose value changed, in address order
    pub touched: Vec<(RegisterKind, EntryId)>,
    pub partial: Vec<PartialSpan>,
    /// Written addresses no entry covers
    pub unmatched: Vec<u16>,
}

impl ReconcileOutcome {
    fn new() -> Self {
        Self {
            changes: ChangeSet::new(ChangeOrigin::Remote),
            touched: Vec::new(),
            partial: Vec::new(),
            unmatched: Vec::new(),
        }
    }
}

/// Maps external writes onto a [`RegisterStore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalWriteReconciler;

impl ExternalWriteReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Apply one external write
    ///
    /// Each affected entry gets exactly one value change and is flagged as
    /// recently modified. Words a write does not carry are never invented: an
    /// entry only partly inside the written range keeps its other words.
    pub fn apply(&self, store: &mut RegisterStore, write: &ExternalWrite) -> ModbusResult<ReconcileOutcome> {
        if !write.kind.is_writable() {
            return Err(ModbusError::invalid_data(format!(
                "{} are read-only for a remote master",
                write.kind
            )));
        }
        let outcome = match (&write.values, write.kind.is_bit()) {
            (ExternalValues::Bits(bits), true) => self.apply_bits(store, write.kind, write.start_address, bits)?,
            (ExternalValues::Words(words), false) => self.apply_words(store, write.kind, write.start_address, words)?,
            _ => {
                return Err(ModbusError::invalid_data(format!(
                    "external write to {} carries mismatched values",
                    write.kind
                )))
            }
        };

        if !outcome.unmatched.is_empty() {
            debug!(
                "External write to {} hit {} unmapped addresses",
                write.kind,
                outcome.unmatched.len()
            );
        }
        Ok(outcome)
    }

    fn apply_bits(
        &self,
        store: &mut RegisterStore,
        kind: RegisterKind,
        start: u16,
        bits: &[bool],
    ) -> ModbusResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::new();
        for (offset, &value) in bits.iter().enumerate() {
            let address = start.wrapping_add(offset as u16);
            let Some(id) = store.coil(kind, address).map(|entry| entry.id()) else {
                outcome.unmatched.push(address);
                continue;
            };
            outcome.changes.extend(store.set_coil(kind, address, value, ChangeOrigin::Remote)?);
            outcome.touched.push((kind, id));
        }
        mark_touched(store, &mut outcome);
        Ok(outcome)
    }

    fn apply_words(
        &self,
        store: &mut RegisterStore,
        kind: RegisterKind,
        start: u16,
        words: &[u16],
    ) -> ModbusResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::new();
        let written_end = start as u32 + words.len() as u32;
        let word_at = |address: u32| -> Option<u16> {
            if address >= start as u32 && address < written_end {
                Some(words[(address - start as u32) as usize])
            } else {
                None
            }
        };

        // Entry layout is captured up front; patching never moves entries
        let layout: Vec<(EntryId, u16, usize)> = store
            .registers(kind)
            .iter()
            .map(|entry| (entry.id(), entry.address(), entry.word_span()))
            .collect();

        let mut covered = BTreeSet::new();
        for (id, address, span) in layout {
            let base = address as u32;
            let patch: Vec<(usize, u16)> = (0..span)
                .filter_map(|offset| word_at(base + offset as u32).map(|word| (offset, word)))
                .collect();
            if patch.is_empty() {
                continue;
            }
            for &(offset, _) in &patch {
                covered.insert(base + offset as u32);
            }

            if patch.len() < span {
                warn!(
                    "Partial update of {} entry at {}: {} of {} words written, keeping the rest",
                    kind,
                    address,
                    patch.len(),
                    span
                );
                outcome.partial.push(PartialSpan {
                    id,
                    address,
                    span,
                    present: patch.len(),
                });
            }

            outcome
                .changes
                .extend(store.patch_words(kind, id, &patch, ChangeOrigin::Remote)?);
            outcome.touched.push((kind, id));
        }

        outcome.unmatched = (start as u32..written_end)
            .filter(|address| !covered.contains(address))
            .map(|address| address as u16)
            .collect();
        mark_touched(store, &mut outcome);
        Ok(outcome)
    }
}

fn mark_touched(store: &mut RegisterStore, outcome: &mut ReconcileOutcome) {
    for &(kind, id) in &outcome.touched {
        if let Some(change) = store.set_recently_modified(kind, id, true) {
            outcome.changes.push(change.kind, change.id, change.field);
        }
    }
}

/// Shared "recently modified" highlight with one timer for all entries
///
/// Marking entries starts the timer only when it is not already running, so
/// a burst of writes inside the window ends in a single clear.
#[derive(Debug, Clone)]
pub struct HighlightTracker {
    duration: Duration,
    deadline: Option<Instant>,
    entries: BTreeSet<(RegisterKind, EntryId)>,
}

impl Default for HighlightTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::DEFAULT_HIGHLIGHT_MS))
    }
}

impl HighlightTracker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
            entries: BTreeSet::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// When the running timer fires
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn contains(&self, kind: RegisterKind, id: EntryId) -> bool {
        self.entries.contains(&(kind, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add entries to the highlight set
    ///
    /// Returns true if this call started the timer.
    pub fn mark<I>(&mut self, entries: I, now: Instant) -> bool
    where
        I: IntoIterator<Item = (RegisterKind, EntryId)>,
    {
        self.entries.extend(entries);
        if self.deadline.is_some() || self.entries.is_empty() {
            return false;
        }
        self.deadline = Some(now + self.duration);
        true
    }

    /// Clear every highlighted entry once the deadline has passed
    ///
    /// Returns the flag changes, or `None` if the timer has not fired yet.
    pub fn expire(&mut self, store: &mut RegisterStore, now: Instant) -> Option<ChangeSet> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }
        self.deadline = None;

        let mut changes = ChangeSet::new(ChangeOrigin::Remote);
        for (kind, id) in std::mem::take(&mut self.entries) {
            if let Some(change) = store.set_recently_modified(kind, id, false) {
                changes.push(change.kind, change.id, change.field);
            }
        }
        debug!("Highlight cleared on {} entries", changes.len());
        Some(changes)
    }
}

/// Count value refreshes per entry in a change set
pub fn refresh_count(changes: &ChangeSet, id: EntryId) -> usize {
    changes
        .for_entry(id)
        .filter(|change| matches!(change.field, FieldChange::Value { .. } | FieldChange::Coil { .. }))
        .count()
}
