use crate::{tid, Receiver};

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use flume as channel;

type InnerSender = channel::Sender<Box<dyn BusEvent>>;
type InnerReceiver = channel::Receiver<Box<dyn BusEvent>>;

/// Default capacity of a registered channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Trait for events that can travel through the bus. Implemented for every
/// `Send + 'static` type; the `as_any` hook lets receivers downcast back to
/// the concrete event type.
pub trait BusEvent: Send {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> BusEvent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone)]
struct Channel {
    tx: InnerSender,
    rx: InnerReceiver,
    dropped: Arc<AtomicU64>,
}

/// Event bus with one bounded channel per event type.
///
/// [`EventBus::publish`] is non-blocking and lossy: when a channel is full
/// the event is discarded and the channel's dropped counter is bumped.
/// Use [`EventBus::extract`] to hand a service only the channels it needs.
///
/// # Examples
/// ```
/// use event_bus::{typeid, EventBus, Receiver};
///
/// #[derive(Clone)]
/// struct Ping(u32);
///
/// let mut bus = EventBus::default();
/// bus.register::<Ping>(Some(16));
///
/// let narrowed = bus.extract(&typeid![Ping], &typeid![Ping]).unwrap();
/// narrowed.publish(Ping(1));
///
/// let rx: Receiver<Ping> = narrowed.subscribe();
/// assert_eq!(rx.try_recv().unwrap().0, 1);
/// ```
#[derive(Clone, Default)]
pub struct EventBus {
    channels: HashMap<TypeId, Channel>,
}

impl EventBus {
    /// Register a channel for the event type. `capacity` of `None` uses
    /// [`DEFAULT_CHANNEL_CAPACITY`]. Returns true when the channel already
    /// existed.
    pub fn register<E: BusEvent + Clone + 'static>(&mut self, capacity: Option<usize>) -> bool {
        if self.channels.contains_key(&tid::<E>()) {
            return true;
        }

        let (tx, rx) = channel::bounded(capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY));
        self.channels.insert(
            tid::<E>(),
            Channel {
                tx,
                rx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );

        false
    }

    /// Extract the subset of channels a service publishes to (`tx_ids`) and
    /// subscribes to (`rx_ids`). Fails if any channel is unregistered.
    ///
    /// Use the [`typeid!`](`crate::typeid`) macro for the id lists.
    pub fn extract(&self, tx_ids: &[TypeId], rx_ids: &[TypeId]) -> Result<Self, Error> {
        let mut channels = HashMap::new();
        for id in tx_ids.iter().chain(rx_ids) {
            let chan = self
                .channels
                .get(id)
                .ok_or(Error::ChannelForTypeIdDoesntExist)?;
            channels.insert(*id, chan.clone());
        }
        Ok(Self { channels })
    }

    /// Subscribe to the channel for the event type.
    ///
    /// # Panics
    ///
    /// Panics when the channel is unregistered; use
    /// [`EventBus::try_subscribe`] to avoid the panic.
    pub fn subscribe<E: BusEvent + Clone + 'static>(&self) -> Receiver<E> {
        self.try_subscribe()
            .expect("channel for event must be registered")
    }

    /// Subscribe to the channel for the event type, failing if it is not
    /// registered.
    pub fn try_subscribe<E: BusEvent + Clone + 'static>(&self) -> Result<Receiver<E>, Error> {
        let chan = self
            .channels
            .get(&tid::<E>())
            .ok_or(Error::ChannelForTypeIdDoesntExist)?;

        Ok(Receiver::new(chan.rx.clone()))
    }

    /// Publish an event without blocking. A full channel drops the event
    /// and bumps the dropped counter.
    ///
    /// # Panics
    ///
    /// Panics when the channel is unregistered; use
    /// [`EventBus::try_publish`] to avoid the panic.
    pub fn publish<E: BusEvent + 'static>(&self, event: E) {
        self.try_publish(event)
            .expect("channel for event must be registered")
    }

    /// Publish an event without blocking, failing if the channel is not
    /// registered.
    pub fn try_publish<E: BusEvent + 'static>(&self, event: E) -> Result<(), Error> {
        let chan = self
            .channels
            .get(&tid::<E>())
            .ok_or(Error::ChannelForTypeIdDoesntExist)?;

        match chan.tx.try_send(Box::new(event)) {
            Ok(()) => Ok(()),
            Err(channel::TrySendError::Full(_)) => {
                let dropped = chan.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(dropped, "event channel full, event dropped");
                Ok(())
            }
            Err(channel::TrySendError::Disconnected(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Number of events dropped so far on the channel for the event type.
    pub fn dropped<E: BusEvent + 'static>(&self) -> u64 {
        self.channels
            .get(&tid::<E>())
            .map_or(0, |chan| chan.dropped.load(Ordering::Relaxed))
    }
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// All receivers for the channel are gone.
    ChannelClosed,
    /// No channel is registered for the event type.
    ChannelForTypeIdDoesntExist,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "all receivers for the channel are dropped"),
            Self::ChannelForTypeIdDoesntExist => {
                write!(f, "channel for event id doesn't exist")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeid;

    #[derive(Clone, Debug, PartialEq)]
    struct Tick(u64);

    #[test]
    fn publish_and_receive() {
        let mut bus = EventBus::default();
        bus.register::<Tick>(Some(4));

        bus.publish(Tick(7));
        let rx = bus.subscribe::<Tick>();
        assert_eq!(rx.try_recv(), Some(Tick(7)));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let mut bus = EventBus::default();
        bus.register::<Tick>(Some(2));
        // Keep a receiver alive so the channel stays open but full.
        let rx = bus.subscribe::<Tick>();

        for n in 0..5 {
            bus.publish(Tick(n));
        }
        assert_eq!(bus.dropped::<Tick>(), 3);
        assert_eq!(rx.try_recv(), Some(Tick(0)));
        assert_eq!(rx.try_recv(), Some(Tick(1)));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn extract_missing_channel_fails() {
        let bus = EventBus::default();
        assert!(bus.extract(&typeid![Tick], &[]).is_err());
    }

    #[test]
    fn register_is_idempotent() {
        let mut bus = EventBus::default();
        assert!(!bus.register::<Tick>(None));
        assert!(bus.register::<Tick>(None));
    }
}
