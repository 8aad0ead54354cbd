use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use super::message::{ChannelState, InboundMessage};

pub(crate) type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
pub(crate) type StateHandler = Arc<dyn Fn(ChannelState) + Send + Sync>;

/// Identifies one registered handler for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Category-keyed message handlers and state observers.
///
/// Handlers are cloned out of the lock before being called, so a handler
/// may register or remove subscriptions itself.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    messages: Mutex<HashMap<String, Vec<(SubscriptionId, MessageHandler)>>>,
    states: Mutex<Vec<(SubscriptionId, StateHandler)>>,
}

impl Subscribers {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn subscribe(&self, category: String, handler: MessageHandler) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.messages)
            .entry(category)
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn on_state_change(&self, handler: StateHandler) -> SubscriptionId {
        let id = self.next_id();
        lock(&self.states).push((id, handler));
        id
    }

    /// Removes a message or state subscription. Returns whether it existed.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut messages = lock(&self.messages);
        let emptied = messages.iter_mut().find_map(|(category, handlers)| {
            let index = handlers.iter().position(|(entry, _)| *entry == id)?;
            handlers.remove(index);
            Some((category.clone(), handlers.is_empty()))
        });
        if let Some((category, is_empty)) = emptied {
            if is_empty {
                messages.remove(&category);
            }
            return true;
        }
        drop(messages);

        let mut states = lock(&self.states);
        let before = states.len();
        states.retain(|(entry, _)| *entry != id);
        states.len() != before
    }

    /// Calls every handler registered for the message category and returns
    /// how many ran.
    pub(crate) fn dispatch(&self, message: &InboundMessage) -> usize {
        let handlers: Vec<MessageHandler> = lock(&self.messages)
            .get(&message.category)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    pub(crate) fn notify_state(&self, state: ChannelState) {
        let handlers: Vec<StateHandler> = lock(&self.states)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(state);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
