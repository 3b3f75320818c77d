use chrono::{DateTime, Local, Utc};

/* C printf renders nan/inf in lower case, keep that for the text outputs */
fn c_float(value: f64, decimals: usize) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value.is_sign_negative() { "-inf" } else { "inf" }.to_string();
    }
    format!("{:.*}", decimals, value)
}

/// `%f`, six decimals
pub fn format_f(value: f64) -> String {
    c_float(value, 6)
}

/// `% 3.3f`, a blank in place of the sign for non negative values
pub fn format_space_sign(value: f64) -> String {
    let s = c_float(value, 3);
    match s.starts_with('-') {
        true => s,
        false => format!(" {s}"),
    }
}

/// Bare JSON number with six decimals, `null` when it can not be represented.
pub fn json_number(value: f64) -> String {
    match value.is_finite() {
        true => format!("{value:.6}"),
        false => "null".to_string(),
    }
}

/// Quoted and escaped JSON string.
pub fn json_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

pub fn datetime_human_readable(t: &DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M.%S").to_string()
}

pub fn datetime_robot(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
