//! Raw event model and the Linux input-event code vocabulary.

use std::sync::OnceLock;
use std::time::Instant;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_SW: u16 = 0x05;

pub const SYN_REPORT: u16 = 0;
pub const SYN_MT_REPORT: u16 = 2;

pub const BTN_MOUSE: u16 = 0x110;
pub const BTN_TOUCH: u16 = 0x14a;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_PRESSURE: u16 = 0x18;
pub const ABS_TOOL_WIDTH: u16 = 0x1c;
pub const ABS_MT_TOUCH_MAJOR: u16 = 0x30;
pub const ABS_MT_WIDTH_MAJOR: u16 = 0x32;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;
pub const ABS_MT_TRACKING_ID: u16 = 0x39;

/// What a raw event is, after the hub has classified it.
///
/// `DeviceAdded` and `DeviceRemoved` are synthesized by the event hub when it
/// scans or loses a device node; the rest map one-to-one onto `EV_*` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    DeviceAdded,
    DeviceRemoved,
    Sync,
    Key,
    RelativeMotion,
    AbsoluteMotion,
    Switch,
}

/// One event as delivered by the event hub.
///
/// `when` is re-stamped by the reader with [`uptime_nanos`] on ingestion so
/// every downstream consumer sees a single monotonic timebase regardless of
/// what the driver put in the event.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub device_id: i32,
    pub kind: RawEventKind,
    pub scan_code: u16,
    pub key_code: i32,
    pub flags: u32,
    pub value: i32,
    pub when: u64,
}

impl RawEvent {
    pub fn new(device_id: i32, kind: RawEventKind, scan_code: u16, value: i32) -> Self {
        Self {
            device_id,
            kind,
            scan_code,
            key_code: 0,
            flags: 0,
            value,
            when: 0,
        }
    }
}

/// Monotonic nanoseconds since the first call in this process.
pub fn uptime_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Human-readable name for an event type/code pair, for dump output.
pub fn code_name(kind: RawEventKind, code: u16) -> String {
    match kind {
        RawEventKind::DeviceAdded => "DEVICE_ADDED".into(),
        RawEventKind::DeviceRemoved => "DEVICE_REMOVED".into(),
        RawEventKind::Sync => match code {
            SYN_REPORT => "SYN_REPORT".into(),
            SYN_MT_REPORT => "SYN_MT_REPORT".into(),
            _ => format!("SYN/{}", code),
        },
        RawEventKind::Key => match code {
            BTN_TOUCH => "KEY_BTN_TOUCH".into(),
            BTN_MOUSE => "KEY_BTN_MOUSE".into(),
            _ => format!("KEY/{}", code),
        },
        RawEventKind::RelativeMotion => match code {
            REL_X => "REL_X".into(),
            REL_Y => "REL_Y".into(),
            _ => format!("REL/{}", code),
        },
        RawEventKind::AbsoluteMotion => {
            let abs = match code {
                ABS_X => "X",
                ABS_Y => "Y",
                ABS_PRESSURE => "PRESSURE",
                ABS_TOOL_WIDTH => "TOOL_WIDTH",
                ABS_MT_TOUCH_MAJOR => "MT_TOUCH_MAJOR",
                ABS_MT_WIDTH_MAJOR => "MT_WIDTH_MAJOR",
                ABS_MT_POSITION_X => "MT_POSITION_X",
                ABS_MT_POSITION_Y => "MT_POSITION_Y",
                ABS_MT_TRACKING_ID => "MT_TRACKING_ID",
                _ => "?",
            };
            format!("ABS_{}({})", abs, code)
        }
        RawEventKind::Switch => format!("SW/{}", code),
    }
}
