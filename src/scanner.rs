//! # Device Scanner
//!
//! Walks a range of slave ids on the shared transport and classifies each one
//! as `Success`, `Exception` or `Timeout`.
//!
//! Probes are strictly sequential: the bus is assumed to be a single
//! half-duplex line, so the transport mutex is held for exactly one probe at a
//! time. Every classification is sent as a [`ScanEvent`] the moment it is
//! known. Cancellation is cooperative and checked before each probe; an
//! in-flight probe always runs to completion.
//!
//! ```text
//! Idle --start--> Scanning --cancel--> Cancelling
//!  ^                 |                     |
//!  +-----------------+---------------------+
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{exception_text, ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::transport::{ModbusTransport, ProbeOutcome};
use crate::utils::{format, validation};

/// Scan range and probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub first_slave_id: SlaveId,
    pub last_slave_id: SlaveId,
    /// Deadline for a single probe
    pub probe_timeout_ms: u64,
    /// Holding register read by each probe
    pub probe_address: u16,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            first_slave_id: crate::MIN_SLAVE_ID,
            last_slave_id: crate::MAX_SLAVE_ID,
            probe_timeout_ms: 200,
            probe_address: 0,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        validation::validate_scan_range(self.first_slave_id, self.last_slave_id)?;
        if self.probe_timeout_ms == 0 {
            return Err(ModbusError::configuration("probe_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Number of ids a full scan probes
    pub fn len(&self) -> usize {
        (self.last_slave_id as usize + 1).saturating_sub(self.first_slave_id as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scanner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    Idle = 0,
    Scanning = 1,
    Cancelling = 2,
}

impl ScanState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Scanning,
            2 => ScanState::Cancelling,
            _ => ScanState::Idle,
        }
    }
}

/// Classification of one probed id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Success,
    Exception,
    Timeout,
}

/// Outcome of probing one slave id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceScanResult {
    pub slave_id: SlaveId,
    pub status: ScanStatus,
    pub response_time: Duration,
    /// Set for `Exception` results
    pub exception_text: Option<String>,
}

impl DeviceScanResult {
    fn from_outcome(slave_id: SlaveId, outcome: &ProbeOutcome) -> Self {
        let (status, exception) = match outcome {
            ProbeOutcome::Reply { .. } => (ScanStatus::Success, None),
            ProbeOutcome::Exception { code, .. } => (
                ScanStatus::Exception,
                Some(format!("{} (0x{:02X})", exception_text(*code), code)),
            ),
            ProbeOutcome::Timeout { .. } => (ScanStatus::Timeout, None),
        };
        Self {
            slave_id,
            status,
            response_time: outcome.elapsed(),
            exception_text: exception,
        }
    }
}

/// Counts reported when a scan ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub success: usize,
    pub exception: usize,
    pub timeout: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ScanSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            success: 0,
            exception: 0,
            timeout: 0,
            cancelled: false,
            started_at,
            elapsed: Duration::ZERO,
        }
    }

    fn record(&mut self, status: ScanStatus) {
        match status {
            ScanStatus::Success => self.success += 1,
            ScanStatus::Exception => self.exception += 1,
            ScanStatus::Timeout => self.timeout += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.exception + self.timeout
    }
}

/// Streaming scan notification
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Prior results are void
    Started { started_at: DateTime<Utc> },
    Result(DeviceScanResult),
    /// Loop finished normally or after cancellation
    Finished(ScanSummary),
    /// The link was lost; the summary covers the ids probed so far
    Aborted { error: ModbusError, summary: ScanSummary },
}

pub type ScanEventSender = mpsc::UnboundedSender<ScanEvent>;

/// Sequential, cancellable slave id scanner
///
/// Clones share state, so any clone can cancel a scan started by another.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    config: ScanConfig,
    state: Arc<AtomicU8>,
    cancel_requested: Arc<AtomicBool>,
}

/// Returns the scanner to `Idle` however the loop exits
struct ActiveScan<'a> {
    scanner: &'a DeviceScanner,
}

impl Drop for ActiveScan<'_> {
    fn drop(&mut self) {
        self.scanner.cancel_requested.store(false, Ordering::SeqCst);
        self.scanner.state.store(ScanState::Idle as u8, Ordering::SeqCst);
    }
}

impl DeviceScanner {
    pub fn new(config: ScanConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(AtomicU8::new(ScanState::Idle as u8)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() != ScanState::Idle
    }

    /// Request cancellation of the running scan
    ///
    /// Returns false when no scan is running. The current probe is not
    /// interrupted; the loop stops before the next one.
    pub fn cancel(&self) -> bool {
        let switched = self
            .state
            .compare_exchange(
                ScanState::Scanning as u8,
                ScanState::Cancelling as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if switched {
            self.cancel_requested.store(true, Ordering::SeqCst);
            info!("Scan cancellation requested");
        }
        switched
    }

    /// Spawn a scan on its own task
    ///
    /// # Errors
    ///
    /// `ModbusError::ScanInProgress` if a scan is already running. Errors of
    /// the scan itself are returned through the join handle.
    pub fn start<T>(
        &self,
        transport: Arc<Mutex<T>>,
        events: ScanEventSender,
    ) -> ModbusResult<JoinHandle<ModbusResult<ScanSummary>>>
    where
        T: ModbusTransport + 'static,
    {
        self.begin()?;
        let scanner = self.clone();
        Ok(tokio::spawn(async move {
            let active = ActiveScan { scanner: &scanner };
            let result = scanner.run(&transport, &events).await;
            drop(active);
            result
        }))
    }

    /// Run a scan on the current task
    pub async fn scan<T>(&self, transport: &Mutex<T>, events: &ScanEventSender) -> ModbusResult<ScanSummary>
    where
        T: ModbusTransport + ?Sized,
    {
        self.begin()?;
        let _active = ActiveScan { scanner: self };
        self.run(transport, events).await
    }

    fn begin(&self) -> ModbusResult<()> {
        self.state
            .compare_exchange(
                ScanState::Idle as u8,
                ScanState::Scanning as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| ModbusError::ScanInProgress)?;
        self.cancel_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run<T>(&self, transport: &Mutex<T>, events: &ScanEventSender) -> ModbusResult<ScanSummary>
    where
        T: ModbusTransport + ?Sized,
    {
        let started = Instant::now();
        let mut summary = ScanSummary::new(Utc::now());
        info!(
            "Scanning slave ids {}-{} (probe timeout {}ms)",
            self.config.first_slave_id, self.config.last_slave_id, self.config.probe_timeout_ms
        );
        emit(events, ScanEvent::Started {
            started_at: summary.started_at,
        });

        for slave_id in self.config.first_slave_id..=self.config.last_slave_id {
            if self.cancel_requested.load(Ordering::SeqCst) {
                summary.cancelled = true;
                break;
            }

            let outcome = {
                let mut transport = transport.lock().await;
                transport
                    .probe(slave_id, self.config.probe_address, self.config.probe_timeout())
                    .await
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(error) => {
                    summary.elapsed = started.elapsed();
                    warn!("Scan aborted at slave {}: {}", slave_id, error);
                    emit(events, ScanEvent::Aborted {
                        error: error.clone(),
                        summary,
                    });
                    return Err(error);
                }
            };

            let result = DeviceScanResult::from_outcome(slave_id, &outcome);
            debug!("Slave {}: {:?} in {:?}", slave_id, result.status, result.response_time);
            summary.record(result.status);
            emit(events, ScanEvent::Result(result));
        }

        summary.elapsed = started.elapsed();
        info!(
            "Scan {} after {}: {} success, {} exception, {} timeout",
            if summary.cancelled { "cancelled" } else { "finished" },
            format::format_duration(summary.elapsed),
            summary.success,
            summary.exception,
            summary.timeout
        );
        emit(events, ScanEvent::Finished(summary.clone()));
        Ok(summary)
    }
}

fn emit(events: &ScanEventSender, event: ScanEvent) {
    if events.send(event).is_err() {
        debug!("Scan event dropped, no listener");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ModbusRequest, ModbusResponse, Payload};
    use crate::transport::{ConnectionParams, TransportStats};
    use async_trait::async_trait;

    /// Bus where only a few ids answer
    struct ScriptedBus {
        success: Vec<SlaveId>,
        exception: Vec<SlaveId>,
        lost_at: Option<SlaveId>,
        cancel_at: Option<(SlaveId, DeviceScanner)>,
        probed: Vec<SlaveId>,
    }

    impl ScriptedBus {
        fn new(success: Vec<SlaveId>, exception: Vec<SlaveId>) -> Self {
            Self {
                success,
                exception,
                lost_at: None,
                cancel_at: None,
                probed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ModbusTransport for ScriptedBus {
        async fn connect(&mut self, _params: &ConnectionParams) -> ModbusResult<bool> {
            Ok(true)
        }

        async fn disconnect(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
            let slave_id = request.slave_id;
            self.probed.push(slave_id);
            if let Some((at, scanner)) = &self.cancel_at {
                if *at == slave_id {
                    assert!(scanner.cancel());
                }
            }
            if self.lost_at == Some(slave_id) {
                return Err(ModbusError::connection("serial port unplugged"));
            }
            if self.success.contains(&slave_id) {
                Ok(ModbusResponse::new_success(slave_id, request.function, Payload::Words(vec![0])))
            } else if self.exception.contains(&slave_id) {
                Ok(ModbusResponse::new_exception(slave_id, request.function, 0x02))
            } else {
                Err(ModbusError::timeout("probe", 10))
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn results(events: &[ScanEvent]) -> Vec<DeviceScanResult> {
        events
            .iter()
            .filter_map(|event| match event {
                ScanEvent::Result(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_range_classification() {
        let scanner = DeviceScanner::new(ScanConfig::default()).unwrap();
        let bus = Mutex::new(ScriptedBus::new(vec![42], vec![99]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = scanner.scan(&bus, &tx).await.unwrap();
        let events = drain(&mut rx);
        let results = results(&events);

        assert_eq!(results.len(), 247);
        assert_eq!((summary.success, summary.exception, summary.timeout), (1, 1, 245));
        assert!(!summary.cancelled);
        assert_eq!(results[41].slave_id, 42);
        assert_eq!(results[41].status, ScanStatus::Success);
        assert_eq!(results[98].status, ScanStatus::Exception);
        assert!(results[98].exception_text.as_deref().unwrap().contains("Illegal Data Address"));

        assert!(matches!(events.first(), Some(ScanEvent::Started { .. })));
        assert!(matches!(events.last(), Some(ScanEvent::Finished(_))));
        assert_eq!(scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_stops_after_current_probe() {
        let scanner = DeviceScanner::new(ScanConfig::default()).unwrap();
        let mut bus = ScriptedBus::new(vec![42], vec![]);
        bus.cancel_at = Some((50, scanner.clone()));
        let bus = Mutex::new(bus);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = scanner.scan(&bus, &tx).await.unwrap();
        let results = results(&drain(&mut rx));

        assert!(summary.cancelled);
        assert_eq!(results.len(), 50);
        assert_eq!(results.last().unwrap().slave_id, 50);
        assert_eq!(*bus.lock().await.probed.last().unwrap(), 50);
        assert_eq!(scanner.state(), ScanState::Idle);
        assert!(!scanner.cancel());
    }

    #[tokio::test]
    async fn test_link_loss_aborts_scan() {
        let scanner = DeviceScanner::new(ScanConfig::default()).unwrap();
        let mut bus = ScriptedBus::new(vec![], vec![]);
        bus.lost_at = Some(5);
        let bus = Mutex::new(bus);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let error = scanner.scan(&bus, &tx).await.unwrap_err();
        assert!(error.is_transport_failure());

        let events = drain(&mut rx);
        assert_eq!(results(&events).len(), 4);
        match events.last() {
            Some(ScanEvent::Aborted { summary, .. }) => assert_eq!(summary.timeout, 4),
            other => panic!("expected abort event, got {:?}", other),
        }
        assert_eq!(scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let config = ScanConfig {
            first_slave_id: 1,
            last_slave_id: 3,
            ..ScanConfig::default()
        };
        let scanner = DeviceScanner::new(config).unwrap();
        let bus = Arc::new(Mutex::new(ScriptedBus::new(vec![2], vec![])));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Hold the bus so the spawned scan cannot finish yet
        let guard = bus.lock().await;
        let handle = scanner.start(bus.clone(), tx.clone()).unwrap();
        assert!(matches!(
            scanner.start(bus.clone(), tx.clone()),
            Err(ModbusError::ScanInProgress)
        ));
        drop(guard);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.success, 1);
        assert_eq!(results(&drain(&mut rx)).len(), 3);
        assert_eq!(scanner.state(), ScanState::Idle);
    }

    #[test]
    fn test_config_validation() {
        assert!(ScanConfig::default().validate().is_ok());
        assert_eq!(ScanConfig::default().len(), 247);

        let bad = ScanConfig {
            first_slave_id: 0,
            ..ScanConfig::default()
        };
        assert!(DeviceScanner::new(bad).is_err());

        let bad = ScanConfig {
            probe_timeout_ms: 0,
            ..ScanConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
