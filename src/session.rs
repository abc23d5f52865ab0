//! # Session Dispatch Loop
//!
//! Every mutation of the register map goes through one task. Operator edits,
//! writes reported by a slave-mode transport, words read back from a device
//! and scanner events all arrive as [`SessionEvent`]s on one channel and are
//! applied in arrival order, so the [`RegisterStore`] needs no lock.
//!
//! The loop publishes what changed as [`SessionUpdate`]s for the UI, mirrors
//! operator changes into the local register bank and clears the shared
//! "recently modified" highlight when its timer fires.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_workbench::register_store::RegisterStore;
//! use voltage_modbus_workbench::session::{Session, SessionEvent};
//! use voltage_modbus_workbench::transport::ExternalWrite;
//!
//! # async fn demo() {
//! let (session, handle, mut updates) = Session::new(RegisterStore::new(), Duration::from_secs(5));
//! let task = tokio::spawn(session.run());
//!
//! handle.send(SessionEvent::ExternalWrite(ExternalWrite::registers(10, vec![2, 1]))).unwrap();
//! while let Some(update) = updates.recv().await {
//!     println!("{:?}", update);
//! }
//! # let _ = task;
//! # }
//! ```

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::codec::{DataType, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::reconciler::{ExternalWriteReconciler, HighlightTracker};
use crate::register_bank::ModbusRegisterBank;
use crate::register_store::{
    BooleanRegisterDefinition, ChangeOrigin, ChangeSet, RegisterDefinition, RegisterKind, RegisterStore,
};
use crate::scanner::{DeviceScanResult, ScanEvent, ScanEventSender, ScanSummary};
use crate::transport::ExternalWrite;

/// Edits made by the operator
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    AddRegister {
        kind: RegisterKind,
        definition: RegisterDefinition,
    },
    AddCoil {
        kind: RegisterKind,
        definition: BooleanRegisterDefinition,
    },
    Remove {
        kind: RegisterKind,
        address: u16,
    },
    SetValue {
        kind: RegisterKind,
        address: u16,
        text: String,
    },
    SetDataType {
        kind: RegisterKind,
        address: u16,
        data_type: DataType,
    },
    SetCoil {
        kind: RegisterKind,
        address: u16,
        value: bool,
    },
    SetWordOrder(WordOrder),
    Resequence(RegisterKind),
}

/// Input of the dispatch loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Operator(OperatorCommand),
    /// A remote master wrote to the local node
    ExternalWrite(ExternalWrite),
    /// Words read from a device, to refresh the entries they fully cover
    ResponseWords {
        kind: RegisterKind,
        start_address: u16,
        words: Vec<u16>,
    },
    Scan(ScanEvent),
    Shutdown,
}

/// Output of the dispatch loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Changes(ChangeSet),
    /// An operator command failed; the store is unchanged
    Rejected { command: OperatorCommand, error: ModbusError },
    /// Previous scan results were cleared
    ScanStarted,
    ScanResult(DeviceScanResult),
    ScanFinished(ScanSummary),
    ScanAborted { error: ModbusError, summary: ScanSummary },
}

/// Cloneable sender side of a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) -> ModbusResult<()> {
        self.events
            .send(event)
            .map_err(|_| ModbusError::internal("session loop has stopped"))
    }

    pub fn operator(&self, command: OperatorCommand) -> ModbusResult<()> {
        self.send(SessionEvent::Operator(command))
    }

    pub fn shutdown(&self) -> ModbusResult<()> {
        self.send(SessionEvent::Shutdown)
    }

    /// Sender for a device scanner whose events are marshaled into the session
    pub fn scan_events(&self) -> (ScanEventSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(SessionEvent::Scan(event)).is_err() {
                    break;
                }
            }
        });
        (tx, forwarder)
    }

    /// Forward a transport's external write reports into the session
    pub fn forward_external_writes(&self, mut writes: mpsc::UnboundedReceiver<ExternalWrite>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(write) = writes.recv().await {
                if events.send(SessionEvent::ExternalWrite(write)).is_err() {
                    break;
                }
            }
        })
    }
}

/// Owner of the register map and the scan result list
pub struct Session {
    store: RegisterStore,
    bank: Option<ModbusRegisterBank>,
    reconciler: ExternalWriteReconciler,
    highlight: HighlightTracker,
    scan_results: Vec<DeviceScanResult>,
    last_summary: Option<ScanSummary>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl Session {
    /// Create a session around `store`
    ///
    /// `highlight` is how long externally written entries stay flagged.
    pub fn new(
        store: RegisterStore,
        highlight: Duration,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let session = Self {
            store,
            bank: None,
            reconciler: ExternalWriteReconciler::new(),
            highlight: HighlightTracker::new(highlight),
            scan_results: Vec::new(),
            last_summary: None,
            events: event_rx,
            updates: update_tx,
        };
        (session, SessionHandle { events: event_tx }, update_rx)
    }

    /// Mirror operator changes into the local node's register bank
    pub fn with_bank(mut self, bank: ModbusRegisterBank) -> ModbusResult<Self> {
        bank.load_store(&self.store)?;
        self.bank = Some(bank);
        Ok(self)
    }

    pub fn store(&self) -> &RegisterStore {
        &self.store
    }

    pub fn scan_results(&self) -> &[DeviceScanResult] {
        &self.scan_results
    }

    pub fn last_summary(&self) -> Option<&ScanSummary> {
        self.last_summary.as_ref()
    }

    pub fn highlight(&self) -> &HighlightTracker {
        &self.highlight
    }

    /// Process events until shutdown or until every handle is dropped
    ///
    /// Returns the session so its final state can be inspected.
    pub async fn run(mut self) -> Self {
        info!("Session loop started");
        loop {
            let deadline = self.highlight.deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    None | Some(SessionEvent::Shutdown) => break,
                    Some(event) => self.handle(event, Instant::now()),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_highlight(Instant::now());
                }
            }
        }
        info!("Session loop stopped");
        self
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Operator(command) => self.handle_operator(command),
            SessionEvent::ExternalWrite(write) => self.handle_external_write(&write, now),
            SessionEvent::ResponseWords {
                kind,
                start_address,
                words,
            } => match self.apply_response(kind, start_address, &words) {
                Ok(changes) => self.publish_changes(changes),
                Err(error) => warn!("Response refresh of {} failed: {}", kind, error),
            },
            SessionEvent::Scan(event) => self.handle_scan(event),
            SessionEvent::Shutdown => {}
        }
    }

    /// Clear the highlight if its timer has fired
    pub fn expire_highlight(&mut self, now: Instant) {
        if let Some(changes) = self.highlight.expire(&mut self.store, now) {
            self.publish_changes(changes);
        }
    }

    fn handle_operator(&mut self, command: OperatorCommand) {
        match self.apply_operator(&command) {
            Ok(changes) => {
                if let Some(bank) = &self.bank {
                    if let Err(error) = bank.apply_changes(&changes, &self.store) {
                        warn!("Register bank out of sync: {}", error);
                    }
                }
                self.publish_changes(changes);
            }
            Err(error) => {
                debug!("Operator command rejected: {}", error);
                self.publish(SessionUpdate::Rejected { command, error });
            }
        }
    }

    fn apply_operator(&mut self, command: &OperatorCommand) -> ModbusResult<ChangeSet> {
        let store = &mut self.store;
        match command.clone() {
            OperatorCommand::AddRegister { kind, definition } => Ok(store.add_register(kind, definition)?.1),
            OperatorCommand::AddCoil { kind, definition } => Ok(store.add_coil(kind, definition)?.1),
            OperatorCommand::Remove { kind, address } => store.remove(kind, address),
            OperatorCommand::SetValue { kind, address, text } => {
                store.set_value(kind, address, &text, ChangeOrigin::Operator)
            }
            OperatorCommand::SetDataType {
                kind,
                address,
                data_type,
            } => store.set_data_type(kind, address, data_type),
            OperatorCommand::SetCoil { kind, address, value } => {
                store.set_coil(kind, address, value, ChangeOrigin::Operator)
            }
            OperatorCommand::SetWordOrder(order) => Ok(store.set_word_order(order)),
            OperatorCommand::Resequence(kind) => store.resequence(kind),
        }
    }

    fn handle_external_write(&mut self, write: &ExternalWrite, now: Instant) {
        match self.reconciler.apply(&mut self.store, write) {
            Ok(outcome) => {
                if self.highlight.mark(outcome.touched.iter().copied(), now) {
                    debug!("Highlight timer started");
                }
                self.publish_changes(outcome.changes);
            }
            Err(error) => warn!("External write ignored: {}", error),
        }
    }

    /// Refresh entries that lie completely inside the read range
    fn apply_response(&mut self, kind: RegisterKind, start: u16, words: &[u16]) -> ModbusResult<ChangeSet> {
        let end = start as u32 + words.len() as u32;
        let targets: Vec<(u16, usize)> = self
            .store
            .registers(kind)
            .iter()
            .filter(|entry| {
                let base = entry.address() as u32;
                base >= start as u32 && base + entry.word_span() as u32 <= end
            })
            .map(|entry| (entry.address(), entry.word_span()))
            .collect();

        let mut changes = ChangeSet::new(ChangeOrigin::Response);
        for (address, span) in targets {
            let offset = (address - start) as usize;
            changes.extend(
                self.store
                    .set_words(kind, address, &words[offset..offset + span], ChangeOrigin::Response)?,
            );
        }
        Ok(changes)
    }

    fn handle_scan(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Started { .. } => {
                self.scan_results.clear();
                self.last_summary = None;
                self.publish(SessionUpdate::ScanStarted);
            }
            ScanEvent::Result(result) => {
                self.scan_results.push(result.clone());
                self.publish(SessionUpdate::ScanResult(result));
            }
            ScanEvent::Finished(summary) => {
                self.last_summary = Some(summary.clone());
                self.publish(SessionUpdate::ScanFinished(summary));
            }
            ScanEvent::Aborted { error, summary } => {
                self.last_summary = Some(summary.clone());
                self.publish(SessionUpdate::ScanAborted { error, summary });
            }
        }
    }

    fn publish_changes(&self, changes: ChangeSet) {
        if !changes.is_empty() {
            self.publish(SessionUpdate::Changes(changes));
        }
    }

    fn publish(&self, update: SessionUpdate) {
        if self.updates.send(update).is_err() {
            debug!("Session update dropped, no listener");
        }
    }
}
