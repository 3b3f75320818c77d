use std::sync::{Arc, Mutex, PoisonError, Weak};
use log::{debug, info};
use thiserror::Error;

use crate::telegram::Telegram;

pub mod frame;
pub mod utils;

pub use frame::{parse_frame, parse_input_line};

/// Errors raised while turning received bytes into a [`Telegram`]
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Telegram too short")]
    TelegramTooShort,
    #[error("Telegram too long")]
    TelegramTooLong,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("Unsupported C field {0:02x}")]
    UnsupportedTelegramType(u8),
    #[error("CI field {0:02x} not supported")]
    CiFieldNotSupported(u8),
    #[error("Non hex input: {0}")]
    NonHexInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    C1,
}

impl LinkMode {
    pub fn to_string(&self) -> String {
        match self {
            LinkMode::C1 => "C1".to_string(),
        }
    }
}

/// Anything that wants to see every telegram the link layer receives.
pub trait TelegramListener: Send + Sync {
    /// Returns true if the telegram was meant for this listener.
    fn handle_telegram(&self, t: &mut Telegram) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    listener: Weak<dyn TelegramListener>,
}

struct Listeners {
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

/// Link layer dispatcher, owns the subscription list of the meter drivers.
pub struct WMBus {
    link_modes: Vec<LinkMode>,
    listeners: Mutex<Listeners>,
}

impl WMBus {
    pub fn new(link_modes: Vec<LinkMode>) -> Arc<Self> {
        Arc::new(WMBus {
            link_modes,
            listeners: Mutex::new(Listeners { next_id: 0, entries: Vec::new() }),
        })
    }

    pub fn link_modes(&self) -> &[LinkMode] {
        &self.link_modes
    }

    pub fn listens_on(&self, mode: LinkMode) -> bool {
        self.link_modes.contains(&mode)
    }

    pub fn register(&self, listener: Weak<dyn TelegramListener>) -> ListenerId {
        let mut l = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(l.next_id);
        l.next_id += 1;
        l.entries.push(ListenerEntry { id, listener });
        debug!("Registered telegram listener {id:?}");
        id
    }

    pub fn unregister(&self, id: ListenerId) {
        let mut l = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        l.entries.retain(|e| e.id != id);
        debug!("Removed telegram listener {id:?}");
    }

    pub fn num_listeners(&self) -> usize {
        let l = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        l.entries.iter().filter(|e| e.listener.strong_count() > 0).count()
    }

    /// Hand the telegram to every live listener in registration order.
    /// A listener rejecting or failing on a telegram never stops the others.
    pub fn dispatch(&self, t: &mut Telegram) -> bool {
        /* Do not hold the lock while drivers run, they may drop and unregister */
        let listeners: Vec<Arc<dyn TelegramListener>> = {
            let l = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            l.entries.iter().filter_map(|e| e.listener.upgrade()).collect()
        };

        let mut handled = false;
        for listener in listeners {
            if listener.handle_telegram(t) {
                handled = true;
            }
        }

        if !handled {
            info!("Telegram from {} ignored by all configured meters", t.id);
        }
        handled
    }
}

/// Registration guard, removes the listener from the bus when dropped.
pub struct Subscription {
    bus: Arc<WMBus>,
    id: ListenerId,
}

impl Subscription {
    pub fn new(bus: &Arc<WMBus>, listener: Weak<dyn TelegramListener>) -> Self {
        let id = bus.register(listener);
        Subscription { bus: bus.clone(), id }
    }

    pub fn bus(&self) -> &Arc<WMBus> {
        &self.bus
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}
