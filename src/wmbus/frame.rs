use log::debug;

use crate::telegram::Telegram;
use super::{utils, FrameError};

/* Annex D D.2, transport layer headers used slave to master */
const CI_NO_HEADER: u8 = 0x78;
const CI_SHORT_HEADER: u8 = 0x7A;
const CI_LONG_HEADER: u8 = 0x72;

const SND_NR: u8 = 0x44;
const SECURITY_MODE_AES_CBC_IV: u16 = 5;

/// Parse a wM-Bus frame as delivered by the radio into a [`Telegram`].
///
/// Some receivers strip the DLL CRC blocks, others hand them over; `with_crc`
/// selects which one we got.
pub fn parse_frame(frame: &[u8], with_crc: bool, simulated: bool) -> Result<Telegram, FrameError> {
    let data = match with_crc {
        true => utils::verify_crc(frame)?,
        false => frame.to_vec(),
    };

    if data.len() < 11 {
        return Err(FrameError::TelegramTooShort);
    }
    if data.len() > 256 {
        return Err(FrameError::TelegramTooLong);
    }

    /* The L field does not count itself */
    let frame_len = data[0] as usize + 1;
    if frame_len > data.len() {
        return Err(FrameError::TelegramTooShort);
    }
    let data = &data[..frame_len];
    if data.len() < 11 {
        return Err(FrameError::TelegramTooShort);
    }

    if data[1] != SND_NR {
        return Err(FrameError::UnsupportedTelegramType(data[1]));
    }

    let mut m_field = u16::from_le_bytes([data[2], data[3]]);
    let mut address = [data[4], data[5], data[6], data[7]];
    let mut version = data[8];
    let mut device_type = data[9];
    let ci = data[10];

    let (header_len, access_number, config_field) = match ci {
        CI_SHORT_HEADER => {
            if data.len() < 15 {
                return Err(FrameError::TelegramTooShort);
            }
            (15, data[11], u16::from_le_bytes([data[13], data[14]]))
        }
        CI_LONG_HEADER => {
            if data.len() < 23 {
                return Err(FrameError::TelegramTooShort);
            }
            /* A long header changes the identification of the meter but not the sender */
            address = [data[11], data[12], data[13], data[14]];
            m_field = u16::from_le_bytes([data[15], data[16]]);
            version = data[17];
            device_type = data[18];
            (23, data[19], u16::from_le_bytes([data[21], data[22]]))
        }
        CI_NO_HEADER => (11, 0, 0),
        _ => return Err(FrameError::CiFieldNotSupported(ci)),
    };

    let mut t = Telegram::new(m_field, address, version, device_type, data[header_len..].to_vec());
    t.ci_field = ci;
    t.access_number = access_number;
    t.simulated = simulated;

    /* Issue 5.0.1 / 2023-12 Table 18 */
    let security_mode = (config_field >> 8) & 0x1F;
    if security_mode == SECURITY_MODE_AES_CBC_IV {
        t.encrypted = true;
        let blocks = ((config_field >> 4) & 0x0F) as usize;
        t.num_encrypted_blocks = if blocks > 0 { Some(blocks) } else { None };
    }

    t.set_header(&data[..header_len]);
    t.add_explanation(0, 1, format!("length ({} bytes)", data[0]));
    t.add_explanation(1, 1, "dll-c (from meter SND_NR)");
    t.add_explanation(2, 2, format!("dll-mfct ({})", utils::get_manufacturer(u16::from_le_bytes([data[2], data[3]]))));
    t.add_explanation(4, 4, format!("dll-id ({})", crate::telegram::format_id(&[data[4], data[5], data[6], data[7]])));
    t.add_explanation(8, 1, format!("dll-version ({:02x})", data[8]));
    t.add_explanation(9, 1, format!("dll-type ({})", utils::get_device_medium(data[9])));
    t.add_explanation(10, 1, format!("tpl-ci-field ({ci:02x})"));
    if header_len > 11 {
        t.add_explanation(header_len - 4, 1, format!("tpl-acc-field ({access_number})"));
        t.add_explanation(header_len - 2, 2, format!("tpl-cfg ({config_field:04x}) security mode {security_mode}"));
    }

    debug!("Frame from {} {} parsed, ci {ci:02x}, {} payload bytes, encrypted {}",
           utils::get_manufacturer(t.m_field), t.id, t.payload.len(), t.encrypted);
    Ok(t)
}

/// Accept a plain hex frame or a simulation line like `telegram=|2E44...|+12`.
/// Returns the frame bytes and whether the line was a simulation.
pub fn parse_input_line(line: &str) -> Result<(Vec<u8>, bool), FrameError> {
    let line = line.trim();
    let (hex_part, simulated) = match line.strip_prefix("telegram=") {
        Some(rest) => {
            let rest = rest.trim_start_matches('|');
            let end = rest.rfind('|').unwrap_or(rest.len());
            (&rest[..end], true)
        }
        None => (line, false),
    };

    let cleaned: String = hex_part.chars().filter(|c| !matches!(c, '|' | '_' | ' ')).collect();
    let bytes = hex::decode(&cleaned).map_err(|_| FrameError::NonHexInput(line.to_string()))?;
    Ok((bytes, simulated))
}
