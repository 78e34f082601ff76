//! Notification fan-out for connection events
//! Delivers disconnect and data events to every interested subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::bluetooth::error::SubscribeError;
use crate::core::bluetooth::types::{DataPacket, DeviceId};

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Disconnected { device_id: DeviceId },
    DataReceived(DataPacket),
}

impl BridgeEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Disconnected { device_id } => device_id,
            Self::DataReceived(packet) => &packet.device_id,
        }
    }
}

pub type SubscriptionId = u64;

/// Handler invoked for each data packet; an `Err` is logged and delivery continues.
pub type DataHandler = Box<dyn FnMut(&DataPacket) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    All,
    Disconnected,
    Data,
}

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    device: Option<DeviceId>,
    sender: UnboundedSender<BridgeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &BridgeEvent) -> bool {
        let kind_ok = match (self.kind, event) {
            (EventKind::All, _) => true,
            (EventKind::Disconnected, BridgeEvent::Disconnected { .. }) => true,
            (EventKind::Data, BridgeEvent::DataReceived(_)) => true,
            _ => false,
        };
        kind_ok && self.device.as_ref().is_none_or(|d| d == event.device_id())
    }
}

/// Fan-out point for [`BridgeEvent`]s.
///
/// Every subscriber owns an unbounded channel, so `emit` never waits on a
/// subscriber and each subscriber sees events in emission order. Handler
/// subscribers run on their own task; a handler that errors or panics only
/// affects itself.
///
/// Handler tasks are spawned on the runtime the emitter was built in, so
/// handlers can be registered from threads outside any runtime.
#[derive(Default)]
pub struct NotificationEmitter {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    runtime: Option<Handle>,
}

impl NotificationEmitter {
    /// Creates an emitter bound to the current runtime, if there is one.
    pub fn new() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            ..Self::default()
        }
    }

    /// Creates an emitter whose handler tasks run on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..Self::default()
        }
    }

    fn handler_runtime(&self) -> Result<Handle, SubscribeError> {
        self.runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or(SubscribeError::NoRuntime)
    }

    fn add(
        &self,
        kind: EventKind,
        device: Option<DeviceId>,
    ) -> (SubscriptionId, UnboundedReceiver<BridgeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            kind,
            device,
            sender,
        });
        (id, receiver)
    }

    /// Subscribes to every event as a channel.
    pub fn subscribe(&self) -> (SubscriptionId, UnboundedReceiver<BridgeEvent>) {
        self.add(EventKind::All, None)
    }

    /// Subscribes to the events of a single device as a channel.
    pub fn subscribe_device(
        &self,
        device_id: DeviceId,
    ) -> (SubscriptionId, UnboundedReceiver<BridgeEvent>) {
        self.add(EventKind::All, Some(device_id))
    }

    /// Calls `handler` with the id of every device that disconnects.
    pub fn on_disconnected<F>(&self, mut handler: F) -> Result<SubscriptionId, SubscribeError>
    where
        F: FnMut(&DeviceId) -> anyhow::Result<()> + Send + 'static,
    {
        let runtime = self.handler_runtime()?;
        let (id, mut receiver) = self.add(EventKind::Disconnected, None);
        runtime.spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = handler(event.device_id()) {
                    warn!("Disconnect handler {} failed: {:#}", id, e);
                }
            }
            debug!("Disconnect handler {} finished", id);
        });
        Ok(id)
    }

    /// Calls `handler` with every data packet, optionally only those of one device.
    pub fn on_data<F>(
        &self,
        device: Option<DeviceId>,
        mut handler: F,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        F: FnMut(&DataPacket) -> anyhow::Result<()> + Send + 'static,
    {
        let runtime = self.handler_runtime()?;
        let (id, mut receiver) = self.add(EventKind::Data, device);
        runtime.spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let BridgeEvent::DataReceived(packet) = &event {
                    if let Err(e) = handler(packet) {
                        warn!("Data handler {} failed: {:#}", id, e);
                    }
                }
            }
            debug!("Data handler {} finished", id);
        });
        Ok(id)
    }

    /// Ties a subscription to a guard that removes it when dropped.
    pub fn scoped(self: &Arc<Self>, id: SubscriptionId) -> SubscriptionGuard {
        SubscriptionGuard {
            emitter: Arc::downgrade(self),
            id,
        }
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivers an event to every matching subscriber, dropping the ones whose receiver is gone.
    pub fn emit(&self, event: BridgeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !subscriber.wants(&event) {
                return true;
            }
            match subscriber.sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    error!(
                        "Subscriber {} stopped receiving events, removing it",
                        subscriber.id
                    );
                    false
                }
            }
        });
    }

    pub fn emit_disconnected(&self, device_id: DeviceId) {
        self.emit(BridgeEvent::Disconnected { device_id });
    }

    pub fn emit_data(&self, packet: DataPacket) {
        self.emit(BridgeEvent::DataReceived(packet));
    }
}

/// Removes its subscription from the emitter when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard {
    emitter: Weak<NotificationEmitter>,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.upgrade() {
            emitter.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::DataSource;
    use chrono::Utc;

    fn packet(device: &str, byte: u8) -> DataPacket {
        DataPacket {
            device_id: DeviceId::from(device),
            source: DataSource::Ecg,
            payload: vec![byte],
            received_at: Utc::now(),
        }
    }

    #[test]
    fn every_subscriber_sees_events_in_emission_order() {
        let emitter = NotificationEmitter::new();
        let (_, mut first) = emitter.subscribe();
        let (_, mut second) = emitter.subscribe();

        emitter.emit_data(packet("A", 1));
        emitter.emit_disconnected(DeviceId::from("A"));
        emitter.emit_data(packet("B", 2));

        for receiver in [&mut first, &mut second] {
            assert!(matches!(receiver.try_recv(), Ok(BridgeEvent::DataReceived(p)) if p.payload == [1]));
            assert!(matches!(receiver.try_recv(), Ok(BridgeEvent::Disconnected { .. })));
            assert!(matches!(receiver.try_recv(), Ok(BridgeEvent::DataReceived(p)) if p.payload == [2]));
            assert!(receiver.try_recv().is_err());
        }
    }

    #[test]
    fn device_subscribers_only_see_their_device() {
        let emitter = NotificationEmitter::new();
        let (_, mut only_a) = emitter.subscribe_device(DeviceId::from("A"));

        emitter.emit_data(packet("B", 1));
        emitter.emit_data(packet("A", 2));

        let event = only_a.try_recv().unwrap();
        assert_eq!(event.device_id(), &DeviceId::from("A"));
        assert!(only_a.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_pruned_without_affecting_others() {
        let emitter = NotificationEmitter::new();
        let (_, gone) = emitter.subscribe();
        let (_, mut alive) = emitter.subscribe();
        drop(gone);

        emitter.emit_disconnected(DeviceId::from("A"));

        assert_eq!(emitter.subscriber_count(), 1);
        assert!(alive.try_recv().is_ok());
    }

    #[test]
    fn guards_unsubscribe_on_drop() {
        let emitter = Arc::new(NotificationEmitter::new());
        let (id, _receiver) = emitter.subscribe();
        let guard = emitter.scoped(id);
        assert_eq!(guard.id(), id);

        drop(guard);
        assert_eq!(emitter.subscriber_count(), 0);
        assert!(!emitter.unsubscribe(id));
    }

    #[tokio::test]
    async fn failing_handlers_do_not_stop_delivery() {
        let emitter = NotificationEmitter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        emitter
            .on_data(None, |_| anyhow::bail!("decoder exploded"))
            .unwrap();
        emitter
            .on_data(None, move |p| {
                tx.send(p.payload.clone())?;
                Ok(())
            })
            .unwrap();

        emitter.emit_data(packet("A", 1));
        emitter.emit_data(packet("A", 2));

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn panicking_handlers_are_isolated() {
        let emitter = NotificationEmitter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        emitter.on_disconnected(|_| panic!("handler bug")).unwrap();
        emitter
            .on_disconnected(move |id| {
                tx.send(id.clone())?;
                Ok(())
            })
            .unwrap();

        emitter.emit_disconnected(DeviceId::from("A"));
        assert_eq!(rx.recv().await, Some(DeviceId::from("A")));

        // Let the panicked task finish so its receiver is dropped.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        emitter.emit_disconnected(DeviceId::from("B"));
        assert_eq!(rx.recv().await, Some(DeviceId::from("B")));
    }

    #[test]
    fn handlers_without_a_runtime_are_refused() {
        let emitter = NotificationEmitter::new();

        let err = emitter.on_disconnected(|_| Ok(())).unwrap_err();

        assert_eq!(err, SubscribeError::NoRuntime);
        assert!(emitter.on_data(None, |_| Ok(())).is_err());
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn handlers_registered_off_runtime_run_on_the_bound_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let emitter = Arc::new(NotificationEmitter::with_runtime(runtime.handle().clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let registering = emitter.clone();
        std::thread::spawn(move || {
            registering.on_disconnected(move |id| {
                tx.send(id.clone())?;
                Ok(())
            })
        })
        .join()
        .unwrap()
        .unwrap();
        emitter.emit_disconnected(DeviceId::from("A"));

        assert_eq!(runtime.block_on(rx.recv()), Some(DeviceId::from("A")));
    }
}
