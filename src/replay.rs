//! Recorded raw-event streams for the replay and dump subcommands.
//!
//! A recording is a plain text file, one event per line, `#` comments and
//! blank lines ignored:
//!
//! ```text
//! add 1
//! 1 key btn-touch 1
//! 1 abs x 100
//! 1 abs y 200
//! 1 abs pressure 50
//! 1 syn report
//! 1 key btn-touch 0
//! 1 syn report
//! remove 1
//! ```
//!
//! Codes may be symbolic (`x`, `mt-x`, `btn-touch`, ...) or numeric.

use std::path::Path;
use std::sync::Arc;

use crate::config::{self, FileConfig};
use crate::dispatch::ConsoleDispatcher;
use crate::event::{
    code_name, RawEvent, RawEventKind, ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_MT_TOUCH_MAJOR,
    ABS_MT_TRACKING_ID, ABS_MT_WIDTH_MAJOR, ABS_PRESSURE, ABS_TOOL_WIDTH, ABS_X, ABS_Y, BTN_MOUSE,
    BTN_TOUCH, REL_X, REL_Y, SYN_MT_REPORT, SYN_REPORT,
};
use crate::hub::{QueueDevice, QueueEventHub, RawAxisInfo};
use crate::policy::StaticPolicy;
use crate::reader::InputReader;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Parse a whole recording; errors carry the offending line number.
pub fn parse_recording(text: &str) -> Result<Vec<RawEvent>, String> {
    let mut events = Vec::new();
    for (number, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => return Err(format!("line {}: {}", number + 1, e)),
        }
    }
    Ok(events)
}

fn parse_line(line: &str) -> Result<Option<RawEvent>, String> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["add", id] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::DeviceAdded,
            0,
            0,
        ))),
        ["remove", id] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::DeviceRemoved,
            0,
            0,
        ))),
        [id, "syn", which] => {
            let scan_code = match *which {
                "report" => SYN_REPORT,
                "mt" => SYN_MT_REPORT,
                other => return Err(format!("unknown sync marker '{}'", other)),
            };
            Ok(Some(RawEvent::new(
                parse_number(id)?,
                RawEventKind::Sync,
                scan_code,
                0,
            )))
        }
        [id, "key", code, value] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::Key,
            parse_key_code(code)?,
            parse_number(value)?,
        ))),
        [id, "abs", axis, value] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::AbsoluteMotion,
            parse_abs_axis(axis)?,
            parse_number(value)?,
        ))),
        [id, "rel", axis, value] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::RelativeMotion,
            parse_rel_axis(axis)?,
            parse_number(value)?,
        ))),
        [id, "sw", code, value] => Ok(Some(RawEvent::new(
            parse_number(id)?,
            RawEventKind::Switch,
            parse_u16(code)?,
            parse_number(value)?,
        ))),
        _ => Err(format!("unrecognized event line '{}'", line)),
    }
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Result<T, String> {
    token
        .parse()
        .map_err(|_| format!("invalid number '{}'", token))
}

fn parse_u16(token: &str) -> Result<u16, String> {
    parse_number(token)
}

fn parse_key_code(token: &str) -> Result<u16, String> {
    match token {
        "btn-touch" => Ok(BTN_TOUCH),
        "btn-mouse" => Ok(BTN_MOUSE),
        other => parse_u16(other),
    }
}

fn parse_abs_axis(token: &str) -> Result<u16, String> {
    match token {
        "x" => Ok(ABS_X),
        "y" => Ok(ABS_Y),
        "pressure" => Ok(ABS_PRESSURE),
        "tool-width" => Ok(ABS_TOOL_WIDTH),
        "mt-x" => Ok(ABS_MT_POSITION_X),
        "mt-y" => Ok(ABS_MT_POSITION_Y),
        "mt-touch-major" => Ok(ABS_MT_TOUCH_MAJOR),
        "mt-width-major" => Ok(ABS_MT_WIDTH_MAJOR),
        "mt-tracking-id" => Ok(ABS_MT_TRACKING_ID),
        other => parse_u16(other),
    }
}

fn parse_rel_axis(token: &str) -> Result<u16, String> {
    match token {
        "x" => Ok(REL_X),
        "y" => Ok(REL_Y),
        other => parse_u16(other),
    }
}

/// Build the scripted hub described by the config's `[[devices]]` tables.
/// Plain and multi-touch axis codes are both registered so the same config
/// works for either protocol.
pub fn hub_from_config(config: &FileConfig) -> QueueEventHub {
    let hub = QueueEventHub::new();

    for device_config in &config.devices {
        let mut device = QueueDevice {
            id: device_config.id,
            name: device_config.name.clone(),
            classes: device_config.device_classes(),
            ..QueueDevice::default()
        };

        let mut register = |codes: [u16; 2], range: Option<crate::config::AxisRangeConfig>| {
            if let Some(range) = range {
                let info = RawAxisInfo {
                    min: range.min,
                    max: range.max,
                    flat: range.flat,
                    fuzz: range.fuzz,
                };
                for code in codes {
                    device.axes.insert(code, info);
                }
            }
        };

        register([ABS_X, ABS_MT_POSITION_X], device_config.axes.x);
        register([ABS_Y, ABS_MT_POSITION_Y], device_config.axes.y);
        register([ABS_PRESSURE, ABS_MT_TOUCH_MAJOR], device_config.axes.pressure);
        register([ABS_TOOL_WIDTH, ABS_MT_WIDTH_MAJOR], device_config.axes.size);

        for entry in &device_config.keymap {
            device.keymap.insert(entry.scan, entry.key);
        }

        hub.add_device(device);
    }

    hub
}

/// Replay a recording through a full reader pipeline and print every
/// dispatch.
pub fn run_replay(config_path: Option<&Path>, recording_path: &Path) -> Result<(), BoxError> {
    let config = config::load(config_path);

    let text = std::fs::read_to_string(recording_path)?;
    let events =
        parse_recording(&text).map_err(|e| format!("{}: {}", recording_path.display(), e))?;

    log::info!(
        "Replaying {} events from {}",
        events.len(),
        recording_path.display()
    );

    let hub = Arc::new(hub_from_config(&config));
    for event in events {
        hub.push_event(event);
    }

    let policy = Arc::new(StaticPolicy::from_config(&config));
    let dispatcher = Arc::new(ConsoleDispatcher);

    let mut reader = InputReader::new(hub, policy, dispatcher);
    while reader.loop_once() {}

    Ok(())
}

/// Decode a recording and print the raw events without running the reader.
pub fn run_dump(recording_path: &Path) -> Result<(), BoxError> {
    let text = std::fs::read_to_string(recording_path)?;
    let events =
        parse_recording(&text).map_err(|e| format!("{}: {}", recording_path.display(), e))?;

    for (number, event) in events.iter().enumerate() {
        println!(
            "{:6}  device {}  {}  value={}",
            number + 1,
            event.device_id,
            code_name(event.kind, event.scan_code),
            event.value
        );
    }

    Ok(())
}
