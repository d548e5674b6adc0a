use std::marker::PhantomData;

use flume as channel;
use flume::RecvError;

use crate::event_bus::BusEvent;

/// Typed wrapper over a channel receiver. Encapsulates downcasting the
/// boxed event back to its concrete type.
#[derive(Clone)]
pub struct Receiver<E: Clone> {
    inner: channel::Receiver<Box<dyn BusEvent>>,
    __event: PhantomData<E>,
}

impl<E: Clone + 'static> Receiver<E> {
    pub(crate) fn new(inner: channel::Receiver<Box<dyn BusEvent>>) -> Self {
        Self {
            inner,
            __event: Default::default(),
        }
    }

    /// Receive the next event, waiting for one to arrive.
    pub async fn recv(&self) -> Result<E, RecvError> {
        let event_raw = self.inner.recv_async().await?;
        Ok(downcast(&*event_raw))
    }

    /// Receive an already-queued event, if any.
    pub fn try_recv(&self) -> Option<E> {
        self.inner.try_recv().ok().map(|raw| downcast(&*raw))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

fn downcast<E: Clone + 'static>(raw: &dyn BusEvent) -> E {
    match raw.as_any().downcast_ref::<E>() {
        Some(inner) => inner.clone(),
        None => panic!("invalid event type"),
    }
}
