//! MAVLink message-id to name mapping for metric keys and log lines.
//!
//! The forwarder counts frames per message type. The types it cares about are
//! a closed set enumerated here; anything else is keyed by its numeric id so
//! unknown or vendor messages still show up in the counters.

use std::borrow::Cow;

use crate::mavlink_ext::SESSION_HEARTBEAT_ID;

/// Returns the canonical upper-snake name for a MAVLink message id, or
/// `MSG_<id>` for ids outside the known set.
pub fn message_name(id: u32) -> Cow<'static, str> {
    let name = match id {
        0 => "HEARTBEAT",
        1 => "SYS_STATUS",
        2 => "SYSTEM_TIME",
        4 => "PING",
        11 => "SET_MODE",
        20 => "PARAM_REQUEST_READ",
        21 => "PARAM_REQUEST_LIST",
        22 => "PARAM_VALUE",
        23 => "PARAM_SET",
        24 => "GPS_RAW_INT",
        27 => "RAW_IMU",
        29 => "SCALED_PRESSURE",
        30 => "ATTITUDE",
        32 => "LOCAL_POSITION_NED",
        33 => "GLOBAL_POSITION_INT",
        36 => "SERVO_OUTPUT_RAW",
        39 => "MISSION_ITEM",
        42 => "MISSION_CURRENT",
        44 => "MISSION_COUNT",
        47 => "MISSION_ACK",
        65 => "RC_CHANNELS",
        69 => "MANUAL_CONTROL",
        70 => "RC_CHANNELS_OVERRIDE",
        74 => "VFR_HUD",
        76 => "COMMAND_LONG",
        77 => "COMMAND_ACK",
        87 => "POSITION_TARGET_GLOBAL_INT",
        105 => "HIGHRES_IMU",
        111 => "TIMESYNC",
        141 => "ALTITUDE",
        147 => "BATTERY_STATUS",
        148 => "AUTOPILOT_VERSION",
        230 => "ESTIMATOR_STATUS",
        241 => "VIBRATION",
        242 => "HOME_POSITION",
        245 => "EXTENDED_SYS_STATE",
        253 => "STATUSTEXT",
        SESSION_HEARTBEAT_ID => "SESSION_HEARTBEAT",
        other => return Cow::Owned(format!("MSG_{}", other)),
    };
    Cow::Borrowed(name)
}
