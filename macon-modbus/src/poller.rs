//! Periodic polling of the device into snapshots.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::codec::MAX_READ_COUNT;
use crate::error::PollError;
use crate::registers::{RegisterDescriptor, RegisterMap};
use crate::sink::{Record, RecordSink};
use crate::snapshot::DeviceSnapshot;
use crate::transport::Bus;

/// One read request covering a run of polled registers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadGroup {
    pub start: u16,
    pub count: u16,
    pub registers: Vec<&'static RegisterDescriptor>,
}

impl ReadGroup {
    fn new(desc: &'static RegisterDescriptor) -> Self {
        Self {
            start: desc.address,
            count: desc.count(),
            registers: vec![desc],
        }
    }

    /// Last address read by this group.
    pub fn end(&self) -> u16 {
        self.start + self.count - 1
    }
}

/// Group polled registers into as few read requests as possible.
///
/// Neighbouring registers share a request when the hole between them is at
/// most `max_gap` registers and the request stays within the protocol's
/// read limit.
pub fn plan_reads(map: &RegisterMap, max_gap: u16) -> Vec<ReadGroup> {
    let mut polled: Vec<_> = map.polled().collect();
    polled.sort_by_key(|d| d.address);

    let mut groups: Vec<ReadGroup> = Vec::new();
    for desc in polled {
        if let Some(group) = groups.last_mut() {
            let gap = desc.address.saturating_sub(group.end() + 1);
            let count = desc.end_address() - group.start + 1;
            if desc.address > group.end() && gap <= max_gap && count <= MAX_READ_COUNT {
                group.count = count;
                group.registers.push(desc);
                continue;
            }
        }
        groups.push(ReadGroup::new(desc));
    }
    groups
}

/// Reads the polled register set and assembles snapshots.
pub struct Poller<B> {
    bus: Arc<B>,
    map: &'static RegisterMap,
    groups: Vec<ReadGroup>,
}

impl<B: Bus> Poller<B> {
    pub fn new(bus: Arc<B>, map: &'static RegisterMap, max_gap: u16) -> Self {
        let groups = plan_reads(map, max_gap);
        Self { bus, map, groups }
    }

    pub fn groups(&self) -> &[ReadGroup] {
        &self.groups
    }

    /// Perform a single poll cycle.
    ///
    /// Any failing group fails the whole cycle; no partial snapshot is built.
    pub async fn poll_once(&self) -> Result<DeviceSnapshot, PollError> {
        let timestamp = Utc::now();
        let mut values = BTreeMap::new();

        for group in &self.groups {
            let words = self
                .bus
                .read_registers(group.start, group.count)
                .await
                .map_err(|source| PollError::Group {
                    start: group.start,
                    end: group.end(),
                    source,
                })?;

            if words.len() != group.count as usize {
                return Err(PollError::UnexpectedResponse {
                    start: group.start,
                    detail: format!("{} word(s) for {} requested", words.len(), group.count),
                });
            }

            for desc in &group.registers {
                let offset = (desc.address - group.start) as usize;
                values.insert(desc.name, desc.decode(&words[offset..])?);
            }
        }

        debug!(
            values = values.len(),
            groups = self.groups.len(),
            "Poll cycle complete"
        );
        Ok(DeviceSnapshot::new(timestamp, values, self.map))
    }

    /// Run poll cycles every `interval` until `shutdown` flips to true.
    ///
    /// Each cycle emits exactly one record: the snapshot or the failure.
    /// Shutdown is only observed between cycles.
    pub async fn run<S: RecordSink>(
        &self,
        interval: Duration,
        sink: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs_f64(),
            groups = self.groups.len(),
            "Starting poller"
        );

        loop {
            let record = match self.poll_once().await {
                Ok(snapshot) => Record::Snapshot(snapshot),
                Err(e) => {
                    error!(error = %e, "Poll cycle failed");
                    Record::PollFailure {
                        timestamp: Utc::now(),
                        reason: e.to_string(),
                    }
                }
            };
            sink.emit(&record);

            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);
            let signalled = tokio::select! {
                _ = &mut sleep => false,
                changed = shutdown.changed() => changed.is_ok(),
            };
            if signalled && *shutdown.borrow() {
                info!("Poller stopped");
                return;
            }
            // A dropped sender can no longer stop the loop; keep the interval.
            sleep.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ExceptionCode, Request};
    use crate::error::TransportError;
    use crate::registers::{BRINE_PUMP, Value};
    use crate::testing::MockBus;

    fn spans(groups: &[ReadGroup]) -> Vec<(u16, u16)> {
        groups.iter().map(|g| (g.start, g.count)).collect()
    }

    #[test]
    fn test_plan_reads_default_gap() {
        let groups = plan_reads(RegisterMap::macon(), 8);
        assert_eq!(spans(&groups), vec![(2004, 4), (2047, 11), (2100, 39)]);

        let polled: usize = groups.iter().map(|g| g.registers.len()).sum();
        assert_eq!(polled, RegisterMap::macon().polled().count());
    }

    #[test]
    fn test_plan_reads_strictly_adjacent() {
        let groups = plan_reads(RegisterMap::macon(), 0);
        let spans = spans(&groups);

        assert!(spans.contains(&(2004, 1)));
        assert!(spans.contains(&(2056, 2)));
        assert!(spans.contains(&(2102, 4)));
        assert!(spans.contains(&(2124, 4)));
        assert!(spans.contains(&(2133, 6)));
        for group in &groups {
            let covered: u16 = group.registers.iter().map(|d| d.count()).sum();
            assert_eq!(covered, group.count);
        }
    }

    #[test]
    fn test_plan_reads_respects_read_limit() {
        let groups = plan_reads(RegisterMap::macon(), u16::MAX);
        assert!(groups.iter().all(|g| g.count <= MAX_READ_COUNT));
        assert_eq!(spans(&groups), vec![(2004, 124), (2133, 6)]);
    }

    fn device_words(address: u16) -> u16 {
        match address {
            2004 => 46,
            2057 => 700,
            2110 => 0xFFFB,
            2126 => 0x0001,
            2127 => 0x0000,
            2136 => 0x0008,
            _ => 0,
        }
    }

    fn answering_bus() -> MockBus {
        MockBus::new(|request| match request {
            Request::ReadHoldingRegisters { address, count } => Ok(
                crate::codec::Response::ReadHoldingRegisters(
                    (address..address + count).map(device_words).collect(),
                ),
            ),
            Request::WriteSingleRegister { address, value } => {
                Ok(crate::codec::Response::WriteSingleRegister { address, value })
            }
        })
    }

    #[tokio::test]
    async fn test_poll_once_builds_snapshot() {
        let bus = Arc::new(answering_bus());
        let poller = Poller::new(bus.clone(), RegisterMap::macon(), 8);

        let snapshot = poller.poll_once().await.unwrap();
        assert_eq!(bus.reads(), 3);
        assert_eq!(bus.writes(), 0);

        assert_eq!(snapshot.values().len(), 30);
        assert_eq!(snapshot.number("hot_water_setpoint"), Some(46.0));
        assert_eq!(snapshot.number("host_compressor_frequency"), Some(70.0));
        assert_eq!(snapshot.number("outdoor_ambient_temperature"), Some(-5.0));
        assert_eq!(snapshot.number("volume_flow"), Some(6553.6));
        assert_eq!(snapshot.flag(BRINE_PUMP), Some(true));
        assert!(!snapshot.has_faults());
        assert!(snapshot.get("unit_on_off").is_none());
        assert!(matches!(
            snapshot.get("error_code_3"),
            Some(Value::Bits(_))
        ));
    }

    #[tokio::test]
    async fn test_group_failure_fails_whole_cycle() {
        let bus = Arc::new(MockBus::new(|request| match request {
            Request::ReadHoldingRegisters { address: 2047, .. } => {
                Err(TransportError::DeviceException {
                    function: 0x03,
                    code: ExceptionCode::IllegalDataAddress,
                })
            }
            Request::ReadHoldingRegisters { count, .. } => Ok(
                crate::codec::Response::ReadHoldingRegisters(vec![0; count as usize]),
            ),
            Request::WriteSingleRegister { address, value } => {
                Ok(crate::codec::Response::WriteSingleRegister { address, value })
            }
        }));
        let poller = Poller::new(bus.clone(), RegisterMap::macon(), 8);

        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(
            err,
            PollError::Group {
                start: 2047,
                end: 2057,
                ..
            }
        ));
        // The remaining group is not read once the cycle has failed.
        assert_eq!(bus.reads(), 2);
    }

    #[tokio::test]
    async fn test_short_response_fails_cycle() {
        let bus = Arc::new(MockBus::new(|_| {
            Ok(crate::codec::Response::ReadHoldingRegisters(vec![0]))
        }));
        let poller = Poller::new(bus, RegisterMap::macon(), 8);

        assert!(matches!(
            poller.poll_once().await,
            Err(PollError::UnexpectedResponse { start: 2004, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_one_record_per_cycle() {
        let bus = Arc::new(answering_bus());
        let poller = Poller::new(bus.clone(), RegisterMap::macon(), 8);
        let (tx, rx) = watch::channel(false);
        let mut sink: Vec<Record> = Vec::new();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            tx.send(true).unwrap();
        });

        poller.run(Duration::from_secs(10), &mut sink, rx).await;
        stopper.await.unwrap();

        // Cycles at t=0, 10 and 20, then shutdown at 25.
        assert_eq!(sink.len(), 3);
        assert!(sink.iter().all(|r| matches!(r, Record::Snapshot(_))));
        assert_eq!(bus.reads(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_interval_after_sender_dropped() {
        let bus = Arc::new(answering_bus());
        let poller = Poller::new(bus.clone(), RegisterMap::macon(), 8);
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut sink: Vec<Record> = Vec::new();

        let started = tokio::time::Instant::now();
        let stopped = tokio::time::timeout(
            Duration::from_secs(150),
            poller.run(Duration::from_secs(60), &mut sink, rx),
        )
        .await;

        // Never stops on its own; cycles at t=0, 60 and 120.
        assert!(stopped.is_err());
        assert!(started.elapsed() >= Duration::from_secs(150));
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ignores_false_signal() {
        let bus = Arc::new(answering_bus());
        let poller = Poller::new(bus.clone(), RegisterMap::macon(), 8);
        let (tx, rx) = watch::channel(false);
        let mut sink: Vec<Record> = Vec::new();

        let signaller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(false).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(true).unwrap();
        });

        poller.run(Duration::from_secs(10), &mut sink, rx).await;
        signaller.await.unwrap();

        // Cycles at t=0 and 10; the false signal at 5 does not cut the wait short.
        assert_eq!(sink.len(), 2);
    }
}
