/* Comments from https://m-bus.com/documentation-wired/08-appendix */

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VifInfo {
    pub quantity: &'static str,
    pub unit: &'static str,
    /// Multiplier applied to the raw value
    pub scale: f64,
}

fn info(quantity: &'static str, unit: &'static str, scale: f64) -> VifInfo {
    VifInfo { quantity, unit, scale }
}

fn exp(n: u8, offset: i32) -> f64 {
    10f64.powi(n as i32 + offset)
}

/* nn = 00 seconds nn = 01 minutes nn = 10 hours nn = 11 days */
fn duration(quantity: &'static str, vif: u8) -> VifInfo {
    let scale = match vif & 0x3 {
        0b00 => 1.0,
        0b01 => 60.0,
        0b10 => 3600.0,
        _ => 86400.0,
    };
    info(quantity, "s", scale)
}

/// Describe a value information field. `extension` is the byte following a
/// 0xFB or 0xFD VIF.
pub fn vif_info(vif: u8, extension: Option<u8>) -> VifInfo {
    match (vif, extension) {
        (0xFB, Some(ext)) => return vif_info_fb(ext),
        (0xFD, Some(ext)) => return vif_info_fd(ext),
        _ => {}
    }

    let v = vif & 0x7F;
    match v {
        /*    E0000nnn	Energy	10(nnn-3) Wh	0.001Wh to 10000Wh */
        0x00..=0x07 => info("energy", "Wh", exp(v & 0x7, -3)),
        /*    E0001nnn	Energy	10(nnn) J	0.001kJ to 10000kJ  */
        0x08..=0x0F => info("energy", "J", exp(v & 0x7, 0)),
        /*    E0010nnn	Volume	10(nnn-6) m3	0.001l to 10000l */
        0x10..=0x17 => info("volume", "m³", exp(v & 0x7, -6)),
        /*    E0011nnn	Mass	10(nnn-3) kg	0.001kg to 10000kg */
        0x18..=0x1F => info("mass", "kg", exp(v & 0x7, -3)),
        0x20..=0x23 => duration("on_time", v),
        0x24..=0x27 => duration("operating_time", v),
        /*    E0101nnn	Power	10(nnn-3) W	0.001W to 10000W */
        0x28..=0x2F => info("power", "W", exp(v & 0x7, -3)),
        /*    E0110nnn	Power	10(nnn) J/h	0.001kJ/h to 10000kJ/h */
        0x30..=0x37 => info("power", "J/h", exp(v & 0x7, 0)),
        /*    E0111nnn	Volume Flow	10(nnn-6) m3/h	0.001l/h to 10000l/h */
        0x38..=0x3F => info("volume_flow", "m³/h", exp(v & 0x7, -6)),
        /*    E1000nnn	Volume Flow ext.	10(nnn-7) m3/min	0.0001l/min to 1000l/min */
        0x40..=0x47 => info("volume_flow_ext", "m³/min", exp(v & 0x7, -7)),
        /*    E1001nnn	Volume Flow ext.	10(nnn-9) m3/s	0.001ml/s to 10000ml/s */
        0x48..=0x4F => info("volume_flow_ext", "m³/s", exp(v & 0x7, -9)),
        /*    E1010nnn	Mass flow	10(nnn-3) kg/h	0.001kg/h to 10000kg/h */
        0x50..=0x57 => info("mass_flow", "kg/h", exp(v & 0x7, -3)),
        0x58..=0x5B => info("flow_temperature", "°C", exp(v & 0x3, -3)),
        0x5C..=0x5F => info("return_temperature", "°C", exp(v & 0x3, -3)),
        0x60..=0x63 => info("temperature_difference", "K", exp(v & 0x3, -3)),
        0x64..=0x67 => info("external_temperature", "°C", exp(v & 0x3, -3)),
        0x68..=0x6B => info("pressure", "bar", exp(v & 0x3, -3)),
        /*    E110110n	Time Point	n = 0 date (datatype G) n = 1 time & date (datatype F) */
        0x6C => info("date", "", 1.0),
        0x6D => info("datetime", "", 1.0),
        0x6E => info("hca_units", "", 1.0),
        0x70..=0x73 => duration("averaging_duration", v),
        0x74..=0x77 => duration("actuality_duration", v),
        0x78 => info("fabrication_no", "", 1.0),
        0x79 => info("enhanced_identification", "", 1.0),
        0x7A => info("bus_address", "", 1.0),
        0x7C => info("plain_text", "", 1.0),
        0x7F => info("manufacturer_specific", "", 1.0),
        _ => info("unknown", "unknown", 1.0),
    }
}

fn vif_info_fb(ext: u8) -> VifInfo {
    let v = ext & 0x7F;
    match v {
        /*    E000000n	Energy	10(n-1) MWh	0.1MWh to 1MWh */
        0x00..=0x01 => info("energy", "MWh", exp(v & 0x1, -1)),
        /*    E000100n	Energy	10(n-1) GJ	0.1GJ to 1GJ */
        0x08..=0x09 => info("energy", "GJ", exp(v & 0x1, -1)),
        /*    E001000n	Volume	10(n+2) m3	100m3 to 1000m3 */
        0x10..=0x11 => info("volume", "m³", exp(v & 0x1, 2)),
        /*    E010100n	Power	10(n-1) MW	0.1MW to 1MW */
        0x28..=0x29 => info("power", "MW", exp(v & 0x1, -1)),
        _ => info("unknown", "unknown", 1.0),
    }
}

fn vif_info_fd(ext: u8) -> VifInfo {
    let v = ext & 0x7F;
    match v {
        0x00..=0x03 => info("credit", "currency_units", exp(v & 0x3, -3)),
        0x04..=0x07 => info("debit", "currency_units", exp(v & 0x3, -3)),
        0x08 => info("access_number", "count", 1.0),
        0x09 => info("medium", "", 1.0),
        0x0A => info("manufacturer", "", 1.0),
        0x0C => info("model_version", "", 1.0),
        0x0D => info("hardware_version", "", 1.0),
        0x0E => info("firmware_version", "", 1.0),
        0x0F => info("software_version", "", 1.0),
        0x17 => info("error_flags", "", 1.0),
        /*    E100nnnn  10nnnn-9 Volt */
        0x40..=0x4F => info("voltage", "V", exp(v & 0xF, -9)),
        /*    E101nnnn  10nnnn-12 A */
        0x50..=0x5F => info("current", "A", exp(v & 0xF, -12)),
        _ => info("unknown", "unknown", 1.0),
    }
}
