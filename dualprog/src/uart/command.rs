//! Command vocabulary of the board's control microcontroller.
//!
//! Commands are ASCII lines `SET <PARAM>=<VALUE>` and `GET <PARAM>`. A SET
//! is acknowledged by echoing `<PARAM>=<VALUE>`; `GET STATUS` answers with
//! a multi-line `key: value` dump.

use crate::error::{Error, Result};

/// 12 V supply switch.
pub const POWER: &str = "EN_12V";
/// SWD relay selecting the LV or HV target.
pub const SWD_MODE: &str = "SWICH_SWD1__2";
/// Switching profile.
pub const PROFILE: &str = "SWICH_PROFILE";
/// Switching mode.
pub const SWITCH_MODE: &str = "SWICH_MODE";
/// Full status dump.
pub const STATUS: &str = "STATUS";

/// The status query used by the test plan.
pub const GET_STATUS: &str = "GET STATUS";

/// Settable parameters with their accepted values and default.
const SETTABLE: &[(&str, &[&str], &str)] = &[
    (POWER, &["ON", "OFF"], "ON"),
    (SWD_MODE, &["LV", "HV"], "LV"),
    (PROFILE, &["00", "FF"], "00"),
    (SWITCH_MODE, &["00", "01", "FF"], "00"),
];

/// Parameters that can be queried.
const QUERYABLE: &[&str] = &[STATUS, SWD_MODE];

/// `SET <param>=<value>`.
pub fn set(param: &str, value: &str) -> String {
    format!("SET {param}={value}")
}

/// `GET <param>`.
pub fn get(param: &str) -> String {
    format!("GET {param}")
}

/// `SET EN_12V=ON|OFF`.
pub fn power(on: bool) -> String {
    set(POWER, if on { "ON" } else { "OFF" })
}

/// Acknowledgement expected for a SET command, `None` for anything else.
pub fn expected_ack(command: &str) -> Option<String> {
    let rest = command.trim().strip_prefix("SET ")?;
    let (param, value) = rest.split_once('=')?;
    Some(format!("{}={}", param.trim(), value.trim()))
}

/// Build a validated command from its parts.
///
/// A SET without a value uses the parameter's default.
pub fn build(kind: &str, param: &str, value: Option<&str>) -> Result<String> {
    let param = param.trim().to_uppercase();
    match kind.trim().to_uppercase().as_str() {
        "GET" => {
            if QUERYABLE.contains(&param.as_str()) {
                Ok(get(&param))
            } else {
                Err(Error::InvalidArgument(format!("'{param}' cannot be queried")))
            }
        },
        "SET" => {
            let Some((_, values, default)) = SETTABLE.iter().find(|(p, _, _)| *p == param) else {
                return Err(Error::InvalidArgument(format!("'{param}' cannot be set")));
            };
            let value = value.map_or_else(|| (*default).to_string(), |v| v.trim().to_uppercase());
            if values.contains(&value.as_str()) {
                Ok(set(&param, &value))
            } else {
                Err(Error::InvalidArgument(format!(
                    "invalid value '{value}' for {param}, expected one of {}",
                    values.join(", ")
                )))
            }
        },
        other => Err(Error::InvalidArgument(format!("unknown command type '{other}'"))),
    }
}

/// Whether the command is a SET that moves the SWD relay or switching
/// profile, after which status snapshots may be stale.
pub fn is_mode_setting(command: &str) -> bool {
    command.trim().to_uppercase().starts_with("SET SWICH")
}
