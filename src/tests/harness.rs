//! Shared fixtures for end-to-end pipeline tests: a scripted hub, a
//! recording dispatcher, and a policy whose verdicts the tests can change
//! between loop iterations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::DeviceClasses;
use crate::dispatch::{
    Dispatcher, EdgeFlags, EventNature, KeyAction, KeyFlags, MotionAction, PointerCoords,
};
use crate::event::{
    RawEvent, RawEventKind, ABS_MT_POSITION_X, ABS_MT_POSITION_Y, ABS_MT_TOUCH_MAJOR,
    ABS_MT_WIDTH_MAJOR, ABS_PRESSURE, ABS_TOOL_WIDTH, ABS_X, ABS_Y, SYN_MT_REPORT, SYN_REPORT,
};
use crate::hub::{QueueDevice, QueueEventHub, RawAxisInfo};
use crate::keys::MetaState;
use crate::orientation::Rotation;
use crate::policy::{DisplayInfo, PolicyActions, PolicyFlags, ReaderPolicy, VirtualKeyDefinition};
use crate::reader::InputReader;

/// One dispatcher notification with timestamps stripped, so replays of the
/// same stream compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Key {
        device_id: i32,
        action: KeyAction,
        flags: KeyFlags,
        key_code: i32,
        scan_code: u16,
        meta_state: MetaState,
    },
    Motion {
        device_id: i32,
        nature: EventNature,
        action: MotionAction,
        edge_flags: EdgeFlags,
        pointer_ids: Vec<u32>,
        pointer_coords: Vec<PointerCoords>,
        x_precision: f32,
        y_precision: f32,
    },
    ConfigurationChanged,
    AppSwitchComing,
}

#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<Dispatched>>,
}

impl RecordingDispatcher {
    pub fn take(&self) -> Vec<Dispatched> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl Dispatcher for RecordingDispatcher {
    fn notify_key(
        &self,
        _when: u64,
        device_id: i32,
        _nature: EventNature,
        _policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
        key_code: i32,
        scan_code: u16,
        meta_state: MetaState,
        _down_time: u64,
    ) {
        self.events.lock().unwrap().push(Dispatched::Key {
            device_id,
            action,
            flags,
            key_code,
            scan_code,
            meta_state,
        });
    }

    fn notify_motion(
        &self,
        _when: u64,
        device_id: i32,
        nature: EventNature,
        _policy_flags: PolicyFlags,
        action: MotionAction,
        _meta_state: MetaState,
        edge_flags: EdgeFlags,
        pointer_ids: &[u32],
        pointer_coords: &[PointerCoords],
        x_precision: f32,
        y_precision: f32,
        _down_time: u64,
    ) {
        self.events.lock().unwrap().push(Dispatched::Motion {
            device_id,
            nature,
            action,
            edge_flags,
            pointer_ids: pointer_ids.to_vec(),
            pointer_coords: pointer_coords.to_vec(),
            x_precision,
            y_precision,
        });
    }

    fn notify_configuration_changed(&self, _when: u64) {
        self.events
            .lock()
            .unwrap()
            .push(Dispatched::ConfigurationChanged);
    }

    fn notify_app_switch_coming(&self, _when: u64) {
        self.events.lock().unwrap().push(Dispatched::AppSwitchComing);
    }
}

/// Policy whose display info and intercept verdicts can be swapped while a
/// test runs.
pub struct TestPolicy {
    pub display: Mutex<Option<DisplayInfo>>,
    pub filter_touch: bool,
    pub filter_jumpy: bool,
    pub virtual_keys: Vec<(String, VirtualKeyDefinition)>,
    pub key_actions: Mutex<PolicyActions>,
    pub touch_actions: Mutex<PolicyActions>,
    pub trackball_actions: Mutex<PolicyActions>,
    pub switch_actions: Mutex<PolicyActions>,
    pub feedback_count: Mutex<u32>,
    pub switch_log: Mutex<Vec<(u16, i32)>>,
}

impl Default for TestPolicy {
    fn default() -> Self {
        Self {
            display: Mutex::new(Some(DisplayInfo {
                width: 1024,
                height: 768,
                orientation: Rotation::Rot0,
            })),
            filter_touch: false,
            filter_jumpy: false,
            virtual_keys: Vec::new(),
            key_actions: Mutex::new(PolicyActions::DISPATCH),
            touch_actions: Mutex::new(PolicyActions::DISPATCH),
            trackball_actions: Mutex::new(PolicyActions::DISPATCH),
            switch_actions: Mutex::new(PolicyActions::empty()),
            feedback_count: Mutex::new(0),
            switch_log: Mutex::new(Vec::new()),
        }
    }
}

impl TestPolicy {
    pub fn with_orientation(orientation: Rotation) -> Self {
        let policy = Self::default();
        *policy.display.lock().unwrap() = Some(DisplayInfo {
            width: 1024,
            height: 768,
            orientation,
        });
        policy
    }

    pub fn set_display(&self, display: Option<DisplayInfo>) {
        *self.display.lock().unwrap() = display;
    }

    pub fn set_touch_actions(&self, actions: PolicyActions) {
        *self.touch_actions.lock().unwrap() = actions;
    }
}

impl ReaderPolicy for TestPolicy {
    fn display_info(&self, _display_id: i32) -> Option<DisplayInfo> {
        *self.display.lock().unwrap()
    }

    fn virtual_key_definitions(&self, device_name: &str) -> Vec<VirtualKeyDefinition> {
        self.virtual_keys
            .iter()
            .filter(|(name, _)| name == device_name)
            .map(|&(_, def)| def)
            .collect()
    }

    fn excluded_device_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn filter_touch_events(&self) -> bool {
        self.filter_touch
    }

    fn filter_jumpy_touch_events(&self) -> bool {
        self.filter_jumpy
    }

    fn virtual_key_down_feedback(&self) {
        *self.feedback_count.lock().unwrap() += 1;
    }

    fn intercept_key(
        &self,
        _when: u64,
        _device_id: i32,
        _down: bool,
        _key_code: i32,
        _scan_code: u16,
        _policy_flags: PolicyFlags,
    ) -> PolicyActions {
        *self.key_actions.lock().unwrap()
    }

    fn intercept_touch(&self, _when: u64) -> PolicyActions {
        *self.touch_actions.lock().unwrap()
    }

    fn intercept_trackball(
        &self,
        _when: u64,
        _down_changed: bool,
        _down: bool,
        _delta_changed: bool,
    ) -> PolicyActions {
        *self.trackball_actions.lock().unwrap()
    }

    fn intercept_switch(&self, _when: u64, switch_code: u16, value: i32) -> PolicyActions {
        self.switch_log.lock().unwrap().push((switch_code, value));
        *self.switch_actions.lock().unwrap()
    }
}

pub struct TestHarness {
    pub hub: Arc<QueueEventHub>,
    pub policy: Arc<TestPolicy>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub reader: InputReader,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_policy(TestPolicy::default())
    }

    pub fn with_policy(policy: TestPolicy) -> Self {
        let hub = Arc::new(QueueEventHub::new());
        let policy = Arc::new(policy);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let reader = InputReader::new(hub.clone(), policy.clone(), dispatcher.clone());
        Self {
            hub,
            policy,
            dispatcher,
            reader,
        }
    }

    /// Drain the hub through the reader.
    pub fn run_all(&mut self) {
        while self.reader.loop_once() {}
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatcher.take()
    }

    /// Dispatched events with configuration-changed notifications dropped,
    /// for tests that only care about the input stream.
    pub fn dispatched_input(&self) -> Vec<Dispatched> {
        self.dispatched()
            .into_iter()
            .filter(|e| !matches!(e, Dispatched::ConfigurationChanged))
            .collect()
    }

    pub fn push(&self, device_id: i32, kind: RawEventKind, scan_code: u16, value: i32) {
        self.hub
            .push_event(RawEvent::new(device_id, kind, scan_code, value));
    }

    pub fn key(&self, device_id: i32, scan_code: u16, value: i32) {
        self.push(device_id, RawEventKind::Key, scan_code, value);
    }

    pub fn abs(&self, device_id: i32, axis: u16, value: i32) {
        self.push(device_id, RawEventKind::AbsoluteMotion, axis, value);
    }

    pub fn rel(&self, device_id: i32, axis: u16, value: i32) {
        self.push(device_id, RawEventKind::RelativeMotion, axis, value);
    }

    pub fn switch(&self, device_id: i32, code: u16, value: i32) {
        self.push(device_id, RawEventKind::Switch, code, value);
    }

    pub fn syn_report(&self, device_id: i32) {
        self.push(device_id, RawEventKind::Sync, SYN_REPORT, 0);
    }

    pub fn syn_mt(&self, device_id: i32) {
        self.push(device_id, RawEventKind::Sync, SYN_MT_REPORT, 0);
    }

    /// Report one multi-touch pointer: position, contact and tool size,
    /// terminated by the per-pointer sync.
    pub fn mt_pointer(&self, device_id: i32, x: i32, y: i32, touch_major: i32, width_major: i32) {
        self.abs(device_id, ABS_MT_POSITION_X, x);
        self.abs(device_id, ABS_MT_POSITION_Y, y);
        self.abs(device_id, ABS_MT_TOUCH_MAJOR, touch_major);
        self.abs(device_id, ABS_MT_WIDTH_MAJOR, width_major);
        self.syn_mt(device_id);
    }
}

fn axis(min: i32, max: i32) -> RawAxisInfo {
    RawAxisInfo {
        min,
        max,
        flat: 0,
        fuzz: 0,
    }
}

/// Single-touch panel with the geometry used throughout the scenarios:
/// x 0..1023, y 0..767, pressure 0..255, tool width 0..15.
pub fn single_touch_device(id: i32, name: &str) -> QueueDevice {
    QueueDevice {
        id,
        name: name.into(),
        classes: DeviceClasses::TOUCHSCREEN,
        axes: HashMap::from([
            (ABS_X, axis(0, 1023)),
            (ABS_Y, axis(0, 767)),
            (ABS_PRESSURE, axis(0, 255)),
            (ABS_TOOL_WIDTH, axis(0, 15)),
        ]),
        keymap: HashMap::new(),
    }
}

pub fn multi_touch_device(id: i32, name: &str) -> QueueDevice {
    QueueDevice {
        id,
        name: name.into(),
        classes: DeviceClasses::TOUCHSCREEN | DeviceClasses::TOUCHSCREEN_MT,
        axes: HashMap::from([
            (ABS_MT_POSITION_X, axis(0, 1023)),
            (ABS_MT_POSITION_Y, axis(0, 767)),
            (ABS_MT_TOUCH_MAJOR, axis(0, 255)),
            (ABS_MT_WIDTH_MAJOR, axis(0, 15)),
        ]),
        keymap: HashMap::new(),
    }
}

pub fn keyboard_device(id: i32, name: &str, keymap: &[(u16, i32)]) -> QueueDevice {
    QueueDevice {
        id,
        name: name.into(),
        classes: DeviceClasses::KEYBOARD | DeviceClasses::ALPHAKEY,
        axes: HashMap::new(),
        keymap: keymap.iter().copied().collect(),
    }
}

pub fn trackball_device(id: i32, name: &str) -> QueueDevice {
    QueueDevice {
        id,
        name: name.into(),
        classes: DeviceClasses::TRACKBALL,
        axes: HashMap::new(),
        keymap: HashMap::new(),
    }
}

/// Coordinates go through axis scaling, so dispatched positions land within
/// a pixel of the nominal display-space value.
pub fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1.0,
        "expected ~{}, got {}",
        expected,
        actual
    );
}
