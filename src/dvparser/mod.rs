use std::collections::{BTreeMap, HashMap};
use log::{debug, warn};

pub mod vif;

use vif::vif_info;

/// One decoded data record.
#[derive(Debug, Clone, PartialEq)]
pub struct DvEntry {
    /// Offset of the record (its DIF) inside the content
    pub offset: usize,
    /// Length of the whole record, DIF to last data byte
    pub len: usize,
    /// Decoded value with the VIF exponent applied, None for non numeric data
    pub value: Option<f64>,
    pub quantity: &'static str,
    pub unit: &'static str,
}

/// Data record lookup table: type code (DIF/DIFE/VIF/VIFE as hex) -> (offset, entry)
pub type DvEntries = BTreeMap<String, (usize, DvEntry)>;

/// Turns the content of a telegram into a lookup table of data records.
pub trait DataRecordParser: Send + Sync {
    fn parse(&self, content: &[u8]) -> DvEntries;
}

/// The standard EN 13757-3 data record parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct DvParser;

impl DataRecordParser for DvParser {
    fn parse(&self, content: &[u8]) -> DvEntries {
        parse_dv(content)
    }
}

const DIF_IDLE_FILLER: u8 = 0x2F;
const DIF_MANUFACTURER_SPECIFIC: u8 = 0x0F;
const DIF_MORE_RECORDS_FOLLOW: u8 = 0x1F;

/* Variable length data, the first data byte (LVAR) tells the length */
fn lvar_length(lvar: u8) -> usize {
    match lvar {
        0x00..=0xBF => lvar as usize,
        0xC0..=0xDF => (lvar & 0x0F) as usize,
        0xE0..=0xEF => (lvar - 0xE0) as usize,
        0xF0..=0xF4 => 4 * (lvar - 0xEC) as usize,
        0xF5 => 48,
        0xF6 => 64,
        _ => 0,
    }
}

fn read_int(data: &[u8]) -> f64 {
    data.iter().rev().fold(0u64, |acc, b| acc << 8 | *b as u64) as f64
}

fn read_bcd(data: &[u8]) -> Option<f64> {
    let mut result: u64 = 0;
    for byte in data.iter().rev() {
        let high = (byte >> 4) & 0x0F;
        let low = byte & 0x0F;
        if high > 9 || low > 9 {
            return None;
        }
        result = result * 100 + (high * 10 + low) as u64;
    }
    Some(result as f64)
}

fn decode_value(dif: u8, data: &[u8]) -> Option<f64> {
    match dif & 0x0F {
        0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 => Some(read_int(data)),
        0x5 => {
            let bytes: [u8; 4] = data.try_into().ok()?;
            Some(f32::from_le_bytes(bytes) as f64)
        }
        0x9 | 0xA | 0xB | 0xC | 0xE => read_bcd(data),
        _ => None,
    }
}

/// Parse all data records of `content`. Unknown records are kept under their
/// type code, a truncated record ends the parsing.
pub fn parse_dv(content: &[u8]) -> DvEntries {
    let mut ret = DvEntries::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    let mut pos: usize = 0;
    'records: while pos < content.len() {
        let start = pos;
        let dif = content[pos];
        pos += 1;

        match dif {
            DIF_IDLE_FILLER => continue,
            DIF_MANUFACTURER_SPECIFIC | DIF_MORE_RECORDS_FOLLOW => {
                debug!("Manufacturer specific data at {start}, {} bytes not parsed", content.len() - pos);
                break;
            }
            _ => {}
        }

        let mut code = vec![dif];

        /* A DIF can be followed by up to 10 DIFEs */
        let mut extension = dif & 0x80 != 0;
        while extension {
            let Some(&dife) = content.get(pos) else {
                warn!("Data record at {start} truncated in DIFE");
                break 'records;
            };
            code.push(dife);
            pos += 1;
            extension = dife & 0x80 != 0;
        }

        let Some(&vif) = content.get(pos) else {
            warn!("Data record at {start} has no VIF");
            break;
        };
        code.push(vif);
        pos += 1;

        let mut vif_extension: Option<u8> = None;
        let mut extension = vif & 0x80 != 0;
        while extension {
            let Some(&vife) = content.get(pos) else {
                warn!("Data record at {start} truncated in VIFE");
                break 'records;
            };
            if vif_extension.is_none() {
                vif_extension = Some(vife);
            }
            code.push(vife);
            pos += 1;
            extension = vife & 0x80 != 0;
        }

        /* Plain text unit, length byte and ascii characters before the data */
        if vif & 0x7F == 0x7C {
            let Some(&len) = content.get(pos) else {
                warn!("Data record at {start} truncated in plain text VIF");
                break;
            };
            pos += 1 + len as usize;
        }

        let data_len = match dif & 0x0F {
            0x0 | 0x8 | 0xF => 0,
            0x1 | 0x9 => 1,
            0x2 | 0xA => 2,
            0x3 | 0xB => 3,
            0x4 | 0x5 | 0xC => 4,
            0x6 | 0xE => 6,
            0x7 => 8,
            _ => {
                /* 0xD variable length */
                let Some(&lvar) = content.get(pos) else {
                    warn!("Data record at {start} truncated in LVAR");
                    break;
                };
                pos += 1;
                lvar_length(lvar)
            }
        };

        let end = pos + data_len;
        if end > content.len() {
            warn!("Data record at {start} needs {data_len} bytes, only {} left", content.len().saturating_sub(pos));
            break;
        }
        let data = &content[pos..end];
        pos = end;

        let info = vif_info(vif, vif_extension);
        let value = decode_value(dif, data).map(|v| v * info.scale);

        let mut key = hex::encode_upper(&code);
        let count = seen.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            key = format!("{key}_{count}");
        }

        debug!("Record {key} at {start}: {} {value:?} {}", info.quantity, info.unit);
        ret.insert(key, (start, DvEntry {
            offset: start,
            len: end - start,
            value,
            quantity: info.quantity,
            unit: info.unit,
        }));
    }

    ret
}

/// Look up a numeric value, a miss is not an error.
pub fn extract_dv_double(values: &DvEntries, key: &str) -> Option<(usize, f64)> {
    let (offset, entry) = values.get(key)?;
    entry.value.map(|v| (*offset, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_energy_record() {
        let content = vec![0x2F, 0x2F, 0x04, 0x83, 0x3B, 0x64, 0x00, 0x00, 0x00, 0x2F];
        let values = parse_dv(&content);

        assert_eq!(values.len(), 1);
        let (offset, entry) = &values["04833B"];
        assert_eq!(*offset, 2);
        assert_eq!(entry.len, 7);
        assert_eq!(entry.quantity, "energy");
        assert_eq!(entry.unit, "Wh");
        assert_eq!(extract_dv_double(&values, "04833B"), Some((2, 100.0)));
        assert_eq!(extract_dv_double(&values, "04AB3B"), None);
    }

    #[test]
    fn test_scaling_and_repeated_codes() {
        /* 0x06 = energy in kWh, second occurrence gets a suffix */
        let content = vec![0x02, 0x06, 0x0A, 0x00, 0x02, 0x06, 0x14, 0x00];
        let values = parse_dv(&content);
        assert_eq!(extract_dv_double(&values, "0206"), Some((0, 10000.0)));
        assert_eq!(extract_dv_double(&values, "0206_2"), Some((4, 20000.0)));
    }

    #[test]
    fn test_bcd_and_real() {
        let mut content = vec![0x0C, 0x13, 0x78, 0x56, 0x34, 0x12];
        content.extend_from_slice(&[0x05, 0x2B]);
        content.extend_from_slice(&1.5f32.to_le_bytes());
        let values = parse_dv(&content);
        /* volume in m³ with litre resolution */
        let (_, v) = extract_dv_double(&values, "0C13").unwrap();
        assert!((v - 12345.678).abs() < 1e-6);
        assert_eq!(extract_dv_double(&values, "052B"), Some((6, 1.5)));
    }

    #[test]
    fn test_invalid_bcd_has_no_value() {
        let values = parse_dv(&[0x0A, 0x5B, 0xFF, 0x12]);
        assert!(values.contains_key("0A5B"));
        assert_eq!(extract_dv_double(&values, "0A5B"), None);
    }

    #[test]
    fn test_extensions_form_the_key() {
        /* DIFE storage 1, VIF FD extension voltage */
        let content = vec![0x82, 0x01, 0xFD, 0x49, 0xE6, 0x00];
        let values = parse_dv(&content);
        let (_, entry) = &values["8201FD49"];
        assert_eq!(entry.quantity, "voltage");
        assert_eq!(entry.value, Some(230.0));
    }

    #[test]
    fn test_variable_length_and_manufacturer_data() {
        let content = vec![0x0D, 0xFD, 0x11, 0x03, 0x41, 0x42, 0x43, 0x0F, 0x01, 0x02];
        let values = parse_dv(&content);
        assert_eq!(values.len(), 1);
        let (offset, entry) = &values["0DFD11"];
        assert_eq!(*offset, 0);
        assert_eq!(entry.len, 7);
        assert_eq!(entry.value, None);
    }

    #[test]
    fn test_truncated_records_do_not_panic() {
        assert!(parse_dv(&[0x04, 0x83, 0x3B, 0x64]).is_empty());
        assert!(parse_dv(&[0x84]).is_empty());
        assert!(parse_dv(&[0x04]).is_empty());
        assert!(parse_dv(&[0x04, 0xFD]).is_empty());
        assert!(parse_dv(&[0x0D, 0x13]).is_empty());
        assert!(parse_dv(&[0x01, 0x7C, 0x05, 0x41]).is_empty());
        assert!(parse_dv(&[]).is_empty());

        let values = parse_dv(&[0x01, 0x13, 0x05, 0x04, 0x83]);
        assert_eq!(values.len(), 1);
    }
}
