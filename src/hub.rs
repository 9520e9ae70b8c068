//! Event-source interface and a scripted in-memory implementation.
//!
//! The hub hides where raw events come from. Production hubs watch kernel
//! device nodes; [`QueueEventHub`] serves a prepared script and backs both
//! the replay tool and the test harness.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::device::DeviceClasses;
use crate::event::{RawEvent, RawEventKind};
use crate::keys::KeyState;

/// Axis metadata as the driver reports it, before validity checking.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawAxisInfo {
    pub min: i32,
    pub max: i32,
    pub flat: i32,
    pub fuzz: i32,
}

/// Blocking source of raw events plus stateless device metadata queries.
///
/// `next_event` returns `None` when the source is closed or exhausted; the
/// reader's loop reports that to its thread harness so it can stop.
pub trait EventHub: Send + Sync {
    fn next_event(&self) -> Option<RawEvent>;

    fn device_classes(&self, device_id: i32) -> DeviceClasses;

    fn device_name(&self, device_id: i32) -> String;

    fn absolute_axis_info(&self, device_id: i32, axis: u16) -> Option<RawAxisInfo>;

    /// Translate a scan code through the device's key layout map. Returns
    /// the key code and layout flags.
    fn scan_code_to_key_code(&self, device_id: i32, scan_code: u16) -> Option<(i32, u32)>;

    /// Devices with this name are dropped at open time and report no
    /// classes.
    fn add_excluded_device(&self, name: &str);

    fn scan_code_state(&self, device_id: i32, classes: DeviceClasses, scan_code: u16) -> KeyState;

    fn key_code_state(&self, device_id: i32, classes: DeviceClasses, key_code: i32) -> KeyState;

    fn switch_state(&self, device_id: i32, classes: DeviceClasses, switch_code: u16) -> KeyState;

    /// For each requested key code, set the matching flag byte if some
    /// device can produce it. Returns true if every code was recognized.
    fn has_keys(&self, key_codes: &[i32], out_flags: &mut [u8]) -> bool;
}

/// Description of one scripted device.
#[derive(Debug, Clone, Default)]
pub struct QueueDevice {
    pub id: i32,
    pub name: String,
    pub classes: DeviceClasses,
    pub axes: HashMap<u16, RawAxisInfo>,
    /// Scan code → key code. Scan codes without an entry fail translation.
    pub keymap: HashMap<u16, i32>,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<RawEvent>,
    devices: HashMap<i32, QueueDevice>,
    excluded: Vec<String>,
}

/// Scripted event hub: devices and events are loaded up front and served
/// in order; metadata queries answer from the device table.
#[derive(Debug, Default)]
pub struct QueueEventHub {
    state: Mutex<QueueState>,
}

impl QueueEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: QueueDevice) {
        if let Ok(mut state) = self.state.lock() {
            state.devices.insert(device.id, device);
        }
    }

    pub fn push_event(&self, event: RawEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.events.push_back(event);
        }
    }

    pub fn push_device_added(&self, device_id: i32) {
        self.push_event(RawEvent::new(device_id, RawEventKind::DeviceAdded, 0, 0));
    }

    pub fn push_device_removed(&self, device_id: i32) {
        self.push_event(RawEvent::new(device_id, RawEventKind::DeviceRemoved, 0, 0));
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    fn is_excluded(&self, state: &QueueState, device_id: i32) -> bool {
        state
            .devices
            .get(&device_id)
            .map(|d| state.excluded.iter().any(|name| *name == d.name))
            .unwrap_or(false)
    }
}

impl EventHub for QueueEventHub {
    fn next_event(&self) -> Option<RawEvent> {
        let mut state = self.state.lock().ok()?;
        let mut event = state.events.pop_front()?;
        // Fill in the key code the way a kernel hub would, from the layout
        // map, so the reader sees translated keys.
        if event.kind == RawEventKind::Key && event.key_code == 0 {
            if let Some(device) = state.devices.get(&event.device_id) {
                if let Some(&key_code) = device.keymap.get(&event.scan_code) {
                    event.key_code = key_code;
                }
            }
        }
        Some(event)
    }

    fn device_classes(&self, device_id: i32) -> DeviceClasses {
        let Ok(state) = self.state.lock() else {
            return DeviceClasses::empty();
        };
        if self.is_excluded(&state, device_id) {
            return DeviceClasses::empty();
        }
        state
            .devices
            .get(&device_id)
            .map(|d| d.classes)
            .unwrap_or_default()
    }

    fn device_name(&self, device_id: i32) -> String {
        let Ok(state) = self.state.lock() else {
            return String::new();
        };
        state
            .devices
            .get(&device_id)
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    fn absolute_axis_info(&self, device_id: i32, axis: u16) -> Option<RawAxisInfo> {
        let state = self.state.lock().ok()?;
        state.devices.get(&device_id)?.axes.get(&axis).copied()
    }

    fn scan_code_to_key_code(&self, device_id: i32, scan_code: u16) -> Option<(i32, u32)> {
        let state = self.state.lock().ok()?;
        let key_code = *state.devices.get(&device_id)?.keymap.get(&scan_code)?;
        Some((key_code, 0))
    }

    fn add_excluded_device(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.excluded.push(name.to_string());
        }
    }

    fn scan_code_state(&self, _device_id: i32, _classes: DeviceClasses, _scan_code: u16) -> KeyState {
        KeyState::Unknown
    }

    fn key_code_state(&self, _device_id: i32, _classes: DeviceClasses, _key_code: i32) -> KeyState {
        KeyState::Unknown
    }

    fn switch_state(&self, _device_id: i32, _classes: DeviceClasses, _switch_code: u16) -> KeyState {
        KeyState::Unknown
    }

    fn has_keys(&self, key_codes: &[i32], out_flags: &mut [u8]) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        for (i, key_code) in key_codes.iter().enumerate() {
            let known = state
                .devices
                .values()
                .any(|d| d.keymap.values().any(|k| k == key_code));
            if known {
                if let Some(flag) = out_flags.get_mut(i) {
                    *flag = 1;
                }
            }
        }
        key_codes
            .iter()
            .enumerate()
            .all(|(i, _)| out_flags.get(i).map(|&f| f != 0).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_device() -> QueueEventHub {
        let hub = QueueEventHub::new();
        hub.add_device(QueueDevice {
            id: 1,
            name: "panel".into(),
            classes: DeviceClasses::TOUCHSCREEN,
            axes: HashMap::from([(crate::event::ABS_X, RawAxisInfo {
                min: 0,
                max: 1023,
                flat: 0,
                fuzz: 0,
            })]),
            keymap: HashMap::from([(158u16, crate::keys::KEYCODE_BACK)]),
        });
        hub
    }

    #[test]
    fn events_come_back_in_order_then_none() {
        let hub = hub_with_device();
        hub.push_device_added(1);
        hub.push_event(RawEvent::new(1, RawEventKind::Sync, 0, 0));

        assert_eq!(hub.next_event().map(|e| e.kind), Some(RawEventKind::DeviceAdded));
        assert_eq!(hub.next_event().map(|e| e.kind), Some(RawEventKind::Sync));
        assert!(hub.next_event().is_none());
    }

    #[test]
    fn key_events_are_translated_through_the_keymap() {
        let hub = hub_with_device();
        hub.push_event(RawEvent::new(1, RawEventKind::Key, 158, 1));

        let event = hub.next_event().unwrap();
        assert_eq!(event.key_code, crate::keys::KEYCODE_BACK);
    }

    #[test]
    fn excluded_devices_report_no_classes() {
        let hub = hub_with_device();
        assert!(!hub.device_classes(1).is_empty());

        hub.add_excluded_device("panel");
        assert!(hub.device_classes(1).is_empty());
    }

    #[test]
    fn axis_info_misses_are_none() {
        let hub = hub_with_device();
        assert!(hub.absolute_axis_info(1, crate::event::ABS_X).is_some());
        assert!(hub.absolute_axis_info(1, crate::event::ABS_Y).is_none());
        assert!(hub.absolute_axis_info(9, crate::event::ABS_X).is_none());
    }
}
