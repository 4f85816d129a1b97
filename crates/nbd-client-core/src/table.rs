use crate::{
    control::{ControlRequest, ControlResponse, ControlSurface},
    controller::ConnectionController,
    device::UnitHandle,
    dispatch::IoDispatcher,
    error::{DeviceError, DeviceErrorKind, DeviceResult},
    metrics,
    record::DeviceRecord,
    transport::{ConnectivityEvent, ConnectivityNotifier, Connector, TransportId},
};
use nbd_proto::TRANSFER_BLOCK_SIZE;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, Weak,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// Number of units a default table carries.
pub const DEFAULT_DEVICE_COUNT: usize = 16;

/// Configuration for [`DeviceTable`].
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    pub device_count: usize,
    /// Wire granularity used to turn block numbers into byte offsets.
    pub transfer_block_size: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            device_count: DEFAULT_DEVICE_COUNT,
            transfer_block_size: TRANSFER_BLOCK_SIZE,
        }
    }
}

/// Fixed-size registry of device records, indexed by unit.
///
/// Constructed once by the owning service and shared by reference (or `Arc`) with every
/// component; records are never reallocated, only wiped.
pub struct DeviceTable {
    records: Box<[DeviceRecord]>,
    connector: Arc<dyn Connector>,
    transfer_block_size: u32,
    events_tx: mpsc::UnboundedSender<ConnectivityEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
    next_transport_id: AtomicU64,
}

impl DeviceTable {
    /// Initialize every record zeroed with its own lock.
    pub fn new(config: TableConfig, connector: Arc<dyn Connector>) -> DeviceResult<Self> {
        if config.device_count == 0 {
            return Err(DeviceError::with_message(
                DeviceErrorKind::InvalidArgument,
                "device table needs at least one unit",
            ));
        }
        if config.transfer_block_size == 0 {
            return Err(DeviceError::with_message(
                DeviceErrorKind::InvalidArgument,
                "transfer block size must be non-zero",
            ));
        }
        let records = (0..config.device_count).map(DeviceRecord::new).collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        debug!(
            units = config.device_count,
            transfer_block_size = config.transfer_block_size,
            "device table initialized"
        );
        Ok(Self {
            records,
            connector,
            transfer_block_size: config.transfer_block_size,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            next_transport_id: AtomicU64::new(1),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn transfer_block_size(&self) -> u32 {
        self.transfer_block_size
    }

    pub fn get(&self, unit: usize) -> DeviceResult<&DeviceRecord> {
        self.records.get(unit).ok_or_else(|| {
            DeviceError::with_message(
                DeviceErrorKind::InvalidUnit,
                format!("unit {unit} outside [0, {})", self.records.len()),
            )
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    pub(crate) fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Notifier for a fresh transport on `unit`, carrying a never-reused identity.
    pub(crate) fn notifier(&self, unit: usize) -> ConnectivityNotifier {
        let id = TransportId(self.next_transport_id.fetch_add(1, Ordering::Relaxed));
        ConnectivityNotifier::new(unit, id, self.events_tx.clone())
    }

    pub fn controller(&self) -> ConnectionController<'_> {
        ConnectionController::new(self)
    }

    pub fn dispatcher(&self) -> IoDispatcher<'_> {
        IoDispatcher::new(self)
    }

    pub fn control_surface(&self) -> ControlSurface<'_> {
        ControlSurface::new(self)
    }

    /// Run one control request against `unit`.
    pub async fn control(
        &self,
        unit: usize,
        request: ControlRequest,
    ) -> DeviceResult<ControlResponse> {
        self.control_surface().execute(unit, request).await
    }

    /// Host-facing handle for one unit.
    pub fn handle(self: &Arc<Self>, unit: usize) -> DeviceResult<UnitHandle> {
        self.get(unit)?;
        Ok(UnitHandle::new(self.clone(), unit))
    }

    /// Take the connectivity event stream, for callers driving it themselves.
    pub fn take_connectivity_events(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Apply every connectivity event to its record until the table is dropped.
    pub fn spawn_connectivity_monitor(self: &Arc<Self>) -> DeviceResult<JoinHandle<()>> {
        let mut events = self.take_connectivity_events().ok_or_else(|| {
            DeviceError::with_message(
                DeviceErrorKind::InvalidState,
                "connectivity monitor already running",
            )
        })?;
        let table: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.controller().on_connectivity_change(event).await;
            }
            debug!("connectivity monitor stopped");
        }))
    }

    /// Close whatever is still associated with any unit and wipe every record.
    ///
    /// Callers should have torn down every unit first; leftovers are closed with a warning.
    pub async fn shutdown(&self) {
        for record in self.records.iter() {
            let mut state = record.lock().await;
            if let Some(mut transport) = state.connection.take() {
                warn!(
                    unit = record.unit(),
                    transport = %transport.id(),
                    "closing transport left attached at shutdown"
                );
                transport.close().await;
                metrics::unit_detached();
            }
            state.wipe();
        }
        info!(units = self.records.len(), "device table shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    #[test]
    fn rejects_empty_table() {
        let err = DeviceTable::new(
            TableConfig {
                device_count: 0,
                ..TableConfig::default()
            },
            Arc::new(FakeConnector::default()),
        )
        .err()
        .expect("empty table rejected");
        assert_eq!(err.kind(), DeviceErrorKind::InvalidArgument);
    }

    #[test]
    fn get_bounds_checks_units() {
        let table = DeviceTable::new(TableConfig::default(), Arc::new(FakeConnector::default()))
            .expect("table");
        assert_eq!(table.len(), DEFAULT_DEVICE_COUNT);
        assert_eq!(table.get(15).expect("last unit").unit(), 15);
        assert_eq!(
            table.get(16).expect_err("out of range").kind(),
            DeviceErrorKind::InvalidUnit
        );
    }

    #[test]
    fn transport_ids_are_never_reused() {
        let table = DeviceTable::new(TableConfig::default(), Arc::new(FakeConnector::default()))
            .expect("table");
        let a = table.notifier(0).transport();
        let b = table.notifier(0).transport();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn monitor_can_only_start_once() {
        let table = Arc::new(
            DeviceTable::new(TableConfig::default(), Arc::new(FakeConnector::default()))
                .expect("table"),
        );
        let monitor = table.spawn_connectivity_monitor().expect("first monitor");
        assert_eq!(
            table
                .spawn_connectivity_monitor()
                .expect_err("second monitor")
                .kind(),
            DeviceErrorKind::InvalidState
        );
        monitor.abort();
    }

    #[tokio::test]
    async fn shutdown_closes_leftover_transports() {
        let connector = Arc::new(FakeConnector::default());
        let table = DeviceTable::new(TableConfig::default(), connector.clone()).expect("table");
        table
            .controller()
            .connect(2, crate::testing::endpoint(10809))
            .await
            .expect("connect");
        table.shutdown().await;
        assert_eq!(connector.link(0).closes(), 1);
        assert!(!table.get(2).expect("unit").lock().await.is_attached());
    }
}
