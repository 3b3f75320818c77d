use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::telegram::Telegram;
use crate::wmbus::utils::{get_device_medium, get_manufacturer};
use crate::wmbus::{LinkMode, Subscription, TelegramListener, WMBus};
use super::{MeterError, MeterOptions, MeterType, MeterUpdate};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const UPDATE_CHANNEL_SIZE: usize = 16;

/// Immutable identity of one configured meter.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterIdentity {
    pub name: String,
    /// Lower case, as printed on the meter
    pub id: String,
    pub meter_type: MeterType,
    pub manufacturer: u16,
    /// Accepted device types of the A field
    pub media: Vec<u8>,
    pub link_mode: LinkMode,
    pub key: Option<[u8; 16]>,
}

impl MeterIdentity {
    pub fn new(name: &str, id: &str, key: &str, meter_type: MeterType, manufacturer: u16, media: Vec<u8>, link_mode: LinkMode) -> Result<Self, MeterError> {
        Ok(MeterIdentity {
            name: name.to_string(),
            id: parse_id(id)?,
            meter_type,
            manufacturer,
            media,
            link_mode,
            key: parse_key(key)?,
        })
    }
}

pub fn parse_id(id: &str) -> Result<String, MeterError> {
    if id.len() != 8 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MeterError::InvalidId(id.to_string()));
    }
    Ok(id.to_ascii_lowercase())
}

/// An empty key means the meter sends plaintext.
pub fn parse_key(key: &str) -> Result<Option<[u8; 16]>, MeterError> {
    if key.is_empty() {
        return Ok(None);
    }
    let bytes = hex::decode(key).map_err(|e| MeterError::InvalidKey(format!("{e}")))?;
    let key: [u8; 16] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| MeterError::InvalidKey(format!("expected 16 bytes, got {}", b.len())))?;
    Ok(Some(key))
}

/// AES-128-CBC with the mode 5 IV: M field, A field, access number eight times.
/// Only `encrypted_len` bytes are ciphertext, anything after is appended as is.
pub fn decrypt_mode5(t: &Telegram, key: &[u8; 16]) -> Result<Vec<u8>, MeterError> {
    let mut iv = [t.access_number; 16];
    iv[0..2].copy_from_slice(&t.m_field.to_le_bytes());
    iv[2..6].copy_from_slice(&t.a_field_address);
    iv[6] = t.a_field_version;
    iv[7] = t.a_field_device_type;

    let encrypted_len = match t.num_encrypted_blocks {
        Some(blocks) => blocks * 16,
        None => t.payload.len(),
    };
    if encrypted_len == 0 || encrypted_len % 16 != 0 || encrypted_len > t.payload.len() {
        return Err(MeterError::DecryptionFailed(format!(
            "{} encrypted bytes in a {} byte payload is not a whole number of blocks", encrypted_len, t.payload.len())));
    }

    let (ciphertext, plaintext) = t.payload.split_at(encrypted_len);
    let mut content = Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| MeterError::DecryptionFailed(format!("{e}")))?;

    /* Verify that the data is valid */
    if content.len() < 2 || content[0] != 0x2F || content[1] != 0x2F {
        return Err(MeterError::DecryptionFailed("content does not start with 2f2f, wrong key?".to_string()));
    }

    content.extend_from_slice(plaintext);
    Ok(content)
}

/// State and behaviour shared by all meter drivers: identity, acceptance,
/// decryption and update notification.
pub struct MeterCommon {
    identity: MeterIdentity,
    options: MeterOptions,
    updates: broadcast::Sender<MeterUpdate>,
    pipeline: Mutex<()>,
    warned_manufacturer: AtomicBool,
    warned_media: AtomicBool,
    /* Encrypted telegrams handled without a key */
    missing_key: AtomicU64,
    subscription: Subscription,
}

impl MeterCommon {
    /// Registers `listener` on the bus, it stays registered until this is dropped.
    pub fn new(bus: &Arc<WMBus>, listener: Weak<dyn TelegramListener>, identity: MeterIdentity, options: MeterOptions) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        MeterCommon {
            identity,
            options,
            updates,
            pipeline: Mutex::new(()),
            warned_manufacturer: AtomicBool::new(false),
            warned_media: AtomicBool::new(false),
            missing_key: AtomicU64::new(0),
            subscription: Subscription::new(bus, listener),
        }
    }

    pub fn identity(&self) -> &MeterIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn options(&self) -> MeterOptions {
        self.options
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Held for the whole processing of one telegram.
    pub fn lock_pipeline(&self) -> MutexGuard<'_, ()> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tag(&self) -> String {
        self.identity.meter_type.to_string()
    }

    /// Address match decides. A differing manufacturer or media is suspicious
    /// but reported only once.
    pub fn is_telegram_for_me(&self, t: &Telegram) -> bool {
        debug!("({}) {}: for me? {}", self.tag(), self.identity.name, t.id);
        if !t.id.eq_ignore_ascii_case(&self.identity.id) {
            debug!("({}) {}: not for me", self.tag(), self.identity.name);
            return false;
        }

        if self.identity.manufacturer != 0
            && t.m_field != self.identity.manufacturer
            && !self.warned_manufacturer.swap(true, Ordering::Relaxed)
        {
            warn!("({}) {}: probably not for me since manufacturer {} differs from {}",
                  self.tag(), self.identity.name, get_manufacturer(t.m_field), get_manufacturer(self.identity.manufacturer));
        }

        if !self.identity.media.contains(&t.a_field_device_type)
            && !self.warned_media.swap(true, Ordering::Relaxed)
        {
            warn!("({}) {}: probably not for me since media {} is not expected",
                  self.tag(), self.identity.name, get_device_medium(t.a_field_device_type));
        }

        true
    }

    pub fn log_accepted(&self, t: &Telegram) {
        match self.options.verbose {
            true => info!("({}) {} {}", self.tag(), self.identity.name, t.address_hex()),
            false => debug!("({}) {} {}", self.tag(), self.identity.name, t.address_hex()),
        }
    }

    pub fn expect_version(&self, t: &Telegram, driver: &'static str, expected: u8) -> Result<(), MeterError> {
        if t.a_field_version != expected {
            return Err(MeterError::VersionMismatch { driver, expected, got: t.a_field_version });
        }
        Ok(())
    }

    /// Fill the working content of `t`, decrypted when a key is configured.
    /// Returns where the content sits in the parse log.
    pub fn populate_content(&self, t: &mut Telegram) -> Result<Range<usize>, MeterError> {
        let content = match &self.identity.key {
            Some(key) => decrypt_mode5(t, key)?,
            None => {
                if t.is_encrypted() && !t.is_simulated() {
                    warn!("({}) warning: telegram is encrypted but no key supplied!", self.tag());
                    self.missing_key.fetch_add(1, Ordering::Relaxed);
                }
                t.payload.clone()
            }
        };

        let range = t.set_content(content);
        if self.options.log_telegrams {
            info!("({}) telegram=|{}|{}|", self.tag(), t.header_hex(), t.content_hex());
        }
        Ok(range)
    }

    /// How often an encrypted telegram arrived while no key is configured.
    pub fn missing_key_warnings(&self) -> u64 {
        self.missing_key.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeterUpdate> {
        self.updates.subscribe()
    }

    /// Nobody listening is fine, the update is simply lost.
    pub fn notify_update(&self, t: &Telegram) {
        let update = MeterUpdate { meter: self.identity.name.clone(), telegram: t.clone() };
        if self.updates.send(update).is_err() {
            debug!("({}) {}: no update subscribers", self.tag(), self.identity.name);
        }
    }
}
