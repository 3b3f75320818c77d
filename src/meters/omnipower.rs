use std::sync::{Arc, PoisonError, RwLock, Weak};
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::broadcast;

use crate::dvparser::{extract_dv_double, DataRecordParser, DvParser};
use crate::telegram::Telegram;
use crate::wmbus::utils::manufacturer_code;
use crate::wmbus::{LinkMode, TelegramListener, WMBus};
use super::utils::{datetime_human_readable, datetime_robot, format_f, format_space_sign, json_number, json_string};
use super::{log_outcome, ElectricityMeter, Meter, MeterCommon, MeterError, MeterIdentity, MeterOptions, MeterReport,
            MeterType, MeterUpdate, TelegramStatus};

const DRIVER: &str = "omnipower";
const MANUFACTURER: &str = "KAM";
const MEDIA_ELECTRICITY: u8 = 0x02;
const SUPPORTED_VERSION: u8 = 0x01;

/* 32 bit integer, energy Wh, forward flow */
const TOTAL_ENERGY_CODE: &str = "04833B";
/* 32 bit integer, power W, forward flow */
const CURRENT_POWER_CODE: &str = "04AB3B";

/// Last known readings of a Kamstrup Omnipower.
#[derive(Debug, Clone, PartialEq)]
pub struct OmnipowerState {
    pub total_energy_kwh: f64,
    pub current_power_kw: f64,
    pub datetime_of_update: DateTime<Utc>,
    pub num_updates: u64,
}

impl Default for OmnipowerState {
    fn default() -> Self {
        OmnipowerState {
            total_energy_kwh: 0.0,
            current_power_kw: 0.0,
            datetime_of_update: DateTime::<Utc>::UNIX_EPOCH,
            num_updates: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Extracted {
    total_energy_kwh: Option<f64>,
    current_power_kw: Option<f64>,
}

pub struct MeterOmnipower {
    common: MeterCommon,
    parser: Box<dyn DataRecordParser>,
    state: RwLock<OmnipowerState>,
}

/// Create a driver with the default data record parser and no diagnostics.
pub fn create_omnipower(bus: &Arc<WMBus>, name: &str, id: &str, key: &str) -> Result<Arc<dyn ElectricityMeter>, MeterError> {
    let meter = MeterOmnipower::new(bus, name, id, key, MeterOptions::default(), Box::new(DvParser))?;
    Ok(meter)
}

impl MeterOmnipower {
    /// The driver is listening on `bus` as soon as this returns and stops when
    /// the last handle is dropped.
    pub fn new(bus: &Arc<WMBus>, name: &str, id: &str, key: &str, options: MeterOptions,
               parser: Box<dyn DataRecordParser>) -> Result<Arc<Self>, MeterError> {
        let manufacturer = manufacturer_code(MANUFACTURER).unwrap_or(0);
        let identity = MeterIdentity::new(name, id, key, MeterType::Omnipower, manufacturer,
                                          vec![MEDIA_ELECTRICITY], LinkMode::C1)?;

        Ok(Arc::new_cyclic(|me: &Weak<MeterOmnipower>| {
            let listener: Weak<dyn TelegramListener> = me.clone();
            MeterOmnipower {
                common: MeterCommon::new(bus, listener, identity, options),
                parser,
                state: RwLock::new(OmnipowerState::default()),
            }
        }))
    }

    pub fn state(&self) -> OmnipowerState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn process_content(&self, t: &mut Telegram, content_start: usize) -> Extracted {
        let values = self.parser.parse(&t.content);
        for (key, (offset, entry)) in &values {
            t.add_explanation(content_start + offset, entry.len, format!("{key} {}", entry.quantity));
        }

        let mut extracted = Extracted::default();

        if let Some((offset, total_energy)) = extract_dv_double(&values, TOTAL_ENERGY_CODE) {
            extracted.total_energy_kwh = Some(total_energy);
            t.add_more_explanation(content_start + offset, format!(" total power ({total_energy:.6} kwh)"));
        }

        if let Some((offset, current_power)) = extract_dv_double(&values, CURRENT_POWER_CODE) {
            extracted.current_power_kw = Some(current_power);
            t.add_more_explanation(content_start + offset, format!(" current power ({current_power:.6} kw)"));
        }

        extracted
    }

    fn commit(&self, extracted: Extracted) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = extracted.total_energy_kwh {
            state.total_energy_kwh = v;
        }
        if let Some(v) = extracted.current_power_kw {
            state.current_power_kw = v;
        }
        state.datetime_of_update = Utc::now();
        state.num_updates += 1;
    }
}

/// Render the four report formats from one snapshot.
pub fn render_report(name: &str, id: &str, state: &OmnipowerState, separator: char) -> MeterReport {
    let total = state.total_energy_kwh;
    let power = state.current_power_kw;
    let robot_ts = datetime_robot(&state.datetime_of_update);

    let human_readable = format!("{name}\t{id}\t{} kwh\t{} kwh\t{}",
                                 format_space_sign(total), format_space_sign(power),
                                 datetime_human_readable(&state.datetime_of_update));

    let fields = format!("{name}{separator}{id}{separator}{}{separator}{}{separator}{robot_ts}",
                         format_f(total), format_f(power));

    let json_name = json_string(name);
    let json_id = json_string(id);
    let mut json = String::with_capacity(192 + json_name.len() + json_id.len());
    json.push('{');
    json.push_str(&format!("\"media\":\"{}\",", MeterType::Omnipower.media()));
    json.push_str(&format!("\"meter\":\"{DRIVER}\","));
    json.push_str(&format!("\"name\":{json_name},"));
    json.push_str(&format!("\"id\":{json_id},"));
    json.push_str(&format!("\"total_energy_consumption_kwh\":{},", json_number(total)));
    json.push_str(&format!("\"current_power_consumption_kw\":{},", json_number(power)));
    json.push_str(&format!("\"timestamp\":\"{robot_ts}\""));
    json.push('}');

    let envs = vec![
        format!("METER_JSON={json}"),
        format!("METER_TYPE={DRIVER}"),
        format!("METER_ID={id}"),
        format!("METER_TOTAL_ENERGY_CONSUMPTION_KWH={}", format_f(total)),
        format!("METER_CURRENT_POWER_CONSUMPTION_KW={}", format_f(power)),
        format!("METER_TIMESTAMP={robot_ts}"),
    ];

    MeterReport { human_readable, fields, json, envs }
}

impl Meter for MeterOmnipower {
    fn name(&self) -> &str {
        self.common.name()
    }

    fn id(&self) -> &str {
        self.common.id()
    }

    fn meter_type(&self) -> MeterType {
        MeterType::Omnipower
    }

    fn link_mode(&self) -> LinkMode {
        self.common.identity().link_mode
    }

    fn num_updates(&self) -> u64 {
        self.state().num_updates
    }

    fn subscribe(&self) -> broadcast::Receiver<MeterUpdate> {
        self.common.subscribe()
    }

    fn process_telegram(&self, t: &mut Telegram) -> Result<TelegramStatus, MeterError> {
        let _pipeline = self.common.lock_pipeline();

        if !self.common.is_telegram_for_me(t) {
            return Ok(TelegramStatus::NotForMe);
        }
        self.common.log_accepted(t);
        self.common.expect_version(t, DRIVER, SUPPORTED_VERSION)?;

        let content = self.common.populate_content(t)?;
        let extracted = self.process_content(t, content.start);
        if self.common.options().debug {
            debug!("({DRIVER}) explanation of {}:\n{}", self.name(), t.explain_parse(&format!("({DRIVER})"), content.start));
        }

        self.commit(extracted);
        self.common.notify_update(t);
        Ok(TelegramStatus::Handled)
    }

    fn print_meter(&self, t: &Telegram, separator: char) -> MeterReport {
        render_report(self.name(), &t.id, &self.state(), separator)
    }
}

impl ElectricityMeter for MeterOmnipower {
    fn total_energy_consumption(&self) -> f64 {
        self.state().total_energy_kwh
    }

    fn current_power_consumption(&self) -> f64 {
        self.state().current_power_kw
    }

    fn total_energy_production(&self) -> f64 {
        0.0
    }

    fn current_power_production(&self) -> f64 {
        0.0
    }
}

impl TelegramListener for MeterOmnipower {
    fn handle_telegram(&self, t: &mut Telegram) -> bool {
        log_outcome(MeterType::Omnipower, self.name(), self.process_telegram(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    use crate::dvparser::DvEntries;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    const KEY: &str = "000102030405060708090A0B0C0D0E0F";

    struct CountingParser {
        calls: Arc<AtomicUsize>,
    }

    impl DataRecordParser for CountingParser {
        fn parse(&self, content: &[u8]) -> DvEntries {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DvParser.parse(content)
        }
    }

    fn meter(key: &str) -> (Arc<WMBus>, Arc<MeterOmnipower>, Arc<AtomicUsize>) {
        let bus = WMBus::new(vec![LinkMode::C1]);
        let calls = Arc::new(AtomicUsize::new(0));
        let parser = Box::new(CountingParser { calls: calls.clone() });
        let m = MeterOmnipower::new(&bus, "MyElectricity", "12345678", key, MeterOptions::default(), parser).unwrap();
        (bus, m, calls)
    }

    fn records(total_wh: u32, power_w: Option<u32>) -> Vec<u8> {
        let mut content = vec![0x04, 0x83, 0x3B];
        content.extend_from_slice(&total_wh.to_le_bytes());
        if let Some(p) = power_w {
            content.extend_from_slice(&[0x04, 0xAB, 0x3B]);
            content.extend_from_slice(&p.to_le_bytes());
        }
        content
    }

    /* Short header frame for meter 12345678 */
    fn frame(version: u8, config_field: u16, payload: &[u8]) -> Vec<u8> {
        let cfg = config_field.to_le_bytes();
        let mut data = vec![0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, version, 0x02, 0x7A, 0x17, 0x00, cfg[0], cfg[1]];
        data.extend_from_slice(payload);
        data[0] = (data.len() - 1) as u8;
        data
    }

    fn plaintext_telegram(version: u8, payload: &[u8]) -> Telegram {
        crate::wmbus::parse_frame(&frame(version, 0x0000, payload), false, false).unwrap()
    }

    fn encrypted_telegram(key: &str, plain: &[u8], simulated: bool) -> Telegram {
        let mut padded = vec![0x2F, 0x2F];
        padded.extend_from_slice(plain);
        while padded.len() % 16 != 0 {
            padded.push(0x2F);
        }
        let blocks = (padded.len() / 16) as u16;
        let config_field = 0x0500 | (blocks << 4);

        /* Frame the plaintext first to learn the IV inputs */
        let t = crate::wmbus::parse_frame(&frame(0x01, config_field, &padded), false, simulated).unwrap();
        let mut iv = [t.access_number; 16];
        iv[0..2].copy_from_slice(&t.m_field.to_le_bytes());
        iv[2..6].copy_from_slice(&t.a_field_address);
        iv[6] = t.a_field_version;
        iv[7] = t.a_field_device_type;

        let key: [u8; 16] = hex::decode(key).unwrap().try_into().unwrap();
        let ciphertext = Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<NoPadding>(&padded);
        crate::wmbus::parse_frame(&frame(0x01, config_field, &ciphertext), false, simulated).unwrap()
    }

    fn number_after(s: &str, prefix: &str) -> f64 {
        let start = s.find(prefix).unwrap() + prefix.len();
        let rest = &s[start..];
        let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == ' ')).unwrap_or(rest.len());
        rest[..end].trim().parse().unwrap()
    }

    #[test]
    fn test_total_energy_scenario() {
        let (_bus, m, calls) = meter("");
        let mut t = plaintext_telegram(0x01, &records(100, None));

        assert_eq!(m.process_telegram(&mut t).unwrap(), TelegramStatus::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.total_energy_consumption(), 100.0);
        assert_eq!(m.current_power_consumption(), 0.0);
        assert_eq!(m.total_energy_production(), 0.0);
        assert_eq!(m.current_power_production(), 0.0);
        assert_eq!(m.num_updates(), 1);

        let report = m.print_meter(&t, ';');
        assert!(report.json.contains("\"total_energy_consumption_kwh\":100.000000"));
        assert!(report.human_readable.starts_with("MyElectricity\t12345678\t 100.000 kwh\t 0.000 kwh\t"));
        assert!(report.fields.starts_with("MyElectricity;12345678;100.000000;0.000000;"));
    }

    #[test]
    fn test_both_codes_and_explanations() {
        let (_bus, m, _calls) = meter("");
        let mut t = plaintext_telegram(0x01, &records(123456, Some(1500)));
        m.process_telegram(&mut t).unwrap();

        let state = m.state();
        assert_eq!(state.total_energy_kwh, 123456.0);
        assert_eq!(state.current_power_kw, 1500.0);
        assert!(state.datetime_of_update > DateTime::<Utc>::UNIX_EPOCH);

        let explained = t.explain_parse("(omnipower)", t.content_start());
        assert!(explained.contains("015: 04833B40E20100 04833B energy total power (123456.000000 kwh)"));
        assert!(explained.contains("022: 04AB3BDC050000 04AB3B power current power (1500.000000 kw)"));
    }

    #[test]
    fn test_optional_code_missing_keeps_value() {
        let (_bus, m, _calls) = meter("");
        m.process_telegram(&mut plaintext_telegram(0x01, &records(10, Some(7)))).unwrap();
        m.process_telegram(&mut plaintext_telegram(0x01, &records(20, None))).unwrap();

        assert_eq!(m.total_energy_consumption(), 20.0);
        assert_eq!(m.current_power_consumption(), 7.0);
        assert_eq!(m.num_updates(), 2);

        /* Without the mandatory code the update still happens */
        m.process_telegram(&mut plaintext_telegram(0x01, &[0x2F, 0x2F])).unwrap();
        assert_eq!(m.total_energy_consumption(), 20.0);
        assert_eq!(m.num_updates(), 3);
    }

    #[test]
    fn test_address_mismatch() {
        let (bus, m, calls) = meter("");
        let mut data = frame(0x01, 0x0000, &records(100, None));
        data[4] = 0x79;
        let mut t = crate::wmbus::parse_frame(&data, false, false).unwrap();

        assert_eq!(m.process_telegram(&mut t).unwrap(), TelegramStatus::NotForMe);
        assert!(!bus.dispatch(&mut t));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(m.state(), OmnipowerState::default());
    }

    #[test]
    fn test_version_mismatch_before_parsing() {
        let (_bus, m, calls) = meter("");
        m.process_telegram(&mut plaintext_telegram(0x01, &records(50, None))).unwrap();
        let before = m.state();
        let report_before = m.print_meter(&plaintext_telegram(0x01, &[]), ';');

        let mut t = plaintext_telegram(0x02, &records(100, None));
        assert!(matches!(m.process_telegram(&mut t), Err(MeterError::VersionMismatch { expected: 0x01, got: 0x02, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.state(), before);
        assert_eq!(m.print_meter(&plaintext_telegram(0x01, &[]), ';'), report_before);
    }

    #[test]
    fn test_encrypted_without_key() {
        let (_bus, m, calls) = meter("");
        let mut t = encrypted_telegram(KEY, &records(100, None), false);
        assert!(t.is_encrypted());

        /* Garbage in, garbage out, but no failure */
        assert_eq!(m.process_telegram(&mut t).unwrap(), TelegramStatus::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.content, t.payload);
        assert_eq!(m.num_updates(), 1);
        assert_eq!(m.common.missing_key_warnings(), 1);
    }

    #[test]
    fn test_simulated_encrypted_without_key_is_quiet() {
        let (_bus, m, _calls) = meter("");
        let mut t = encrypted_telegram(KEY, &records(100, None), true);
        assert!(t.is_encrypted() && t.is_simulated());

        assert_eq!(m.process_telegram(&mut t).unwrap(), TelegramStatus::Handled);
        assert_eq!(m.num_updates(), 1);
        assert_eq!(m.common.missing_key_warnings(), 0);
    }

    #[test]
    fn test_encrypted_with_key() {
        let (_bus, m, _calls) = meter(KEY);
        let mut t = encrypted_telegram(KEY, &records(4242, Some(321)), false);

        assert_eq!(m.process_telegram(&mut t).unwrap(), TelegramStatus::Handled);
        assert_eq!(&t.content[..2], &[0x2F, 0x2F]);
        assert_eq!(m.total_energy_consumption(), 4242.0);
        assert_eq!(m.current_power_consumption(), 321.0);
    }

    #[test]
    fn test_wrong_key_is_a_failure() {
        let (_bus, m, calls) = meter("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF");
        let mut t = encrypted_telegram(KEY, &records(4242, None), false);

        assert!(matches!(m.process_telegram(&mut t), Err(MeterError::DecryptionFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(m.state(), OmnipowerState::default());
    }

    #[test]
    fn test_bad_block_count_is_a_failure() {
        let (_bus, m, _calls) = meter(KEY);
        /* Key configured but the payload is not a whole number of blocks */
        let mut t = plaintext_telegram(0x01, &records(1, None));
        assert!(matches!(m.process_telegram(&mut t), Err(MeterError::DecryptionFailed(_))));
        assert_eq!(m.num_updates(), 0);
    }

    #[test]
    fn test_formats_agree() {
        let (_bus, m, _calls) = meter("");
        let mut t = plaintext_telegram(0x01, &records(98765, Some(2345)));
        m.process_telegram(&mut t).unwrap();
        let report = m.print_meter(&t, ',');

        let from_human = number_after(&report.human_readable, "12345678\t");
        let from_json = number_after(&report.json, "\"total_energy_consumption_kwh\":");
        let env = report.envs.iter().find(|e| e.starts_with("METER_TOTAL_ENERGY_CONSUMPTION_KWH=")).unwrap();
        let from_env = number_after(env, "=");
        let from_fields: f64 = report.fields.split(',').nth(2).unwrap().parse().unwrap();

        assert!((from_human - 98765.0).abs() < 1e-3);
        assert!((from_json - from_human).abs() < 1e-3);
        assert!((from_env - from_json).abs() < 1e-9);
        assert!((from_fields - from_json).abs() < 1e-9);
    }

    #[test]
    fn test_report_is_idempotent() {
        let (_bus, m, _calls) = meter("");
        let mut t = plaintext_telegram(0x01, &records(1, Some(2)));
        m.process_telegram(&mut t).unwrap();
        assert_eq!(m.print_meter(&t, ';'), m.print_meter(&t, ';'));
    }

    #[test]
    fn test_report_layout() {
        let state = OmnipowerState {
            total_energy_kwh: 1.5,
            current_power_kw: -0.25,
            datetime_of_update: DateTime::parse_from_rfc3339("2024-03-09T07:05:02Z").unwrap().with_timezone(&Utc),
            num_updates: 1,
        };
        let report = render_report("house", "12345678", &state, ';');

        assert_eq!(report.fields, "house;12345678;1.500000;-0.250000;2024-03-09T07:05:02Z");
        assert_eq!(report.json, "{\"media\":\"electricity\",\"meter\":\"omnipower\",\"name\":\"house\",\"id\":\"12345678\",\
                                 \"total_energy_consumption_kwh\":1.500000,\"current_power_consumption_kw\":-0.250000,\
                                 \"timestamp\":\"2024-03-09T07:05:02Z\"}");
        assert!(report.human_readable.starts_with("house\t12345678\t 1.500 kwh\t-0.250 kwh\t2024-03-"));
        assert_eq!(report.envs, vec![
            format!("METER_JSON={}", report.json),
            "METER_TYPE=omnipower".to_string(),
            "METER_ID=12345678".to_string(),
            "METER_TOTAL_ENERGY_CONSUMPTION_KWH=1.500000".to_string(),
            "METER_CURRENT_POWER_CONSUMPTION_KW=-0.250000".to_string(),
            "METER_TIMESTAMP=2024-03-09T07:05:02Z".to_string(),
        ]);
    }

    #[test]
    fn test_report_before_first_update() {
        let report = render_report("house", "12345678", &OmnipowerState::default(), ';');
        assert_eq!(report.fields, "house;12345678;0.000000;0.000000;1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_json_stays_valid() {
        let name = format!("{}\"quoted\"\\{}", "x".repeat(70_000), "\n");
        let state = OmnipowerState { total_energy_kwh: f64::NAN, ..Default::default() };
        let report = render_report(&name, "12345678", &state, ';');

        let v: serde_json::Value = serde_json::from_str(&report.json).unwrap();
        assert_eq!(v["name"].as_str().unwrap(), name);
        assert!(v["total_energy_consumption_kwh"].is_null());
        assert_eq!(v["current_power_consumption_kw"].as_f64(), Some(0.0));
    }

    #[tokio::test]
    async fn test_notification_via_bus() {
        let (bus, m, _calls) = meter("");
        let mut rx = m.subscribe();

        let mut t = plaintext_telegram(0x01, &records(100, None));
        assert!(bus.dispatch(&mut t));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.meter, "MyElectricity");
        let report = m.print_meter(&update.telegram, ';');
        assert!(report.json.contains("\"total_energy_consumption_kwh\":100.000000"));
    }

    #[test]
    fn test_errors_do_not_stop_dispatch() {
        let bus = WMBus::new(vec![LinkMode::C1]);
        let strict = MeterOmnipower::new(&bus, "a", "12345678", "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF", MeterOptions::default(), Box::new(DvParser)).unwrap();
        let plain = MeterOmnipower::new(&bus, "b", "12345678", "", MeterOptions::default(), Box::new(DvParser)).unwrap();

        let mut t = plaintext_telegram(0x01, &records(100, None));
        assert!(bus.dispatch(&mut t));
        assert_eq!(strict.num_updates(), 0);
        assert_eq!(plain.total_energy_consumption(), 100.0);
    }

    #[test]
    fn test_concurrent_process_and_print() {
        let (_bus, m, _calls) = meter("");
        /* Total and power always move together, a torn read would break that */
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=500u32 {
                    m.process_telegram(&mut plaintext_telegram(0x01, &records(i, Some(i)))).unwrap();
                }
            });
            s.spawn(|| {
                let t = plaintext_telegram(0x01, &[]);
                for _ in 0..500 {
                    let report = m.print_meter(&t, ';');
                    let fields: Vec<&str> = report.fields.split(';').collect();
                    assert_eq!(fields[2], fields[3]);
                }
            });
        });
        assert_eq!(m.num_updates(), 500);
        assert_eq!(m.total_energy_consumption(), 500.0);
    }

    #[test]
    fn test_drop_unregisters() {
        let bus = WMBus::new(vec![LinkMode::C1]);
        let m = create_omnipower(&bus, "house", "12345678", "").unwrap();
        assert_eq!(bus.num_listeners(), 1);
        drop(m);
        assert_eq!(bus.num_listeners(), 0);
        assert!(!bus.dispatch(&mut plaintext_telegram(0x01, &records(1, None))));
    }
}
