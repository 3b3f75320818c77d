use crc16::{State, EN_13757};

use super::FrameError;

/* This functions returns a new vector with all data if the crc matches */
pub fn verify_crc(telegram: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut result: Vec<u8> = Vec::with_capacity(telegram.len());
    /*
        The first block has 10 bytes,
        each following block has 16 bytes,
        the last one may be shorter
        */
    let mut start = 0;
    let mut block_len = 10;
    while start < telegram.len() {
        let remaining = telegram.len() - start;
        /* A block needs at least one byte of data and two bytes of CRC */
        if remaining < 3 {
            return Err(FrameError::TelegramTooShort);
        }
        let len = block_len.min(remaining - 2);
        let end_of_data = start + len;

        let data = &telegram[start..end_of_data];
        let crc = State::<EN_13757>::calculate(data).to_be_bytes();
        if crc[0] != telegram[end_of_data] || crc[1] != telegram[end_of_data + 1] {
            return Err(FrameError::CrcMismatch);
        }

        result.extend_from_slice(data);
        start = end_of_data + 2;
        block_len = 16;
    }

    Ok(result)
}

/// Three letter manufacturer flag, see https://www.m-bus.de/man.html
pub fn get_manufacturer(m_field: u16) -> String {
    [(m_field >> 10) & 0x1F, (m_field >> 5) & 0x1F, m_field & 0x1F]
        .iter()
        .map(|c| char::from((*c as u8) + 64))
        .collect()
}

pub fn manufacturer_code(flag: &str) -> Option<u16> {
    let b = flag.as_bytes();
    if b.len() != 3 || !b.iter().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    Some(((b[0] - 64) as u16) << 10 | ((b[1] - 64) as u16) << 5 | (b[2] - 64) as u16)
}

pub fn get_device_medium(device_type: u8) -> &'static str {
    match device_type {
        0x02 => "Electricity",
        0x03 => "Gas",
        0x04 => "Heat",
        0x06 => "Water (hot)",
        0x07 => "Water (cold)",
        0x08 => "Heat Cost Allocator",
        0x0A | 0x0B => "Cooling",
        0x0C => "Heat",
        0x0D => "Heat / Cooling Combined",
        0x15 => "Water (hot)",
        0x16 => "Water (cold)",
        0x20 | 0x21 => "Breaker / Valve",
        _ => "unknown",
    }
}
