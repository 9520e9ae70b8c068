//! The input reader: pulls one raw event at a time from the event hub,
//! routes it into per-device accumulators, and on sync boundaries commits
//! the accumulated state through the touch/key/trackball pipelines out to
//! the dispatcher.
//!
//! Threading: one dedicated thread drives [`InputReader::loop_once`] and is
//! the only writer of device state. Other threads query through
//! [`ReaderQueries`], which reads nothing but the mutex-guarded exported
//! snapshot and the hub's stateless lookups.

use std::sync::{Arc, Mutex};

use crate::bits::BitSet32;
use crate::device::{
    AxisInfo, DeviceClasses, DeviceRegistry, InputDevice, MtPointerFields, SingleTouchFields,
    TouchTransform, TrackballFields, VirtualKey, VirtualKeyStatus,
};
use crate::dispatch::{
    Dispatcher, EdgeFlags, EventNature, KeyAction, KeyFlags, MotionAction, PointerCoords,
};
use crate::event::{
    uptime_nanos, RawEvent, RawEventKind, ABS_MT_POSITION_X, ABS_MT_POSITION_Y,
    ABS_MT_TOUCH_MAJOR, ABS_MT_TRACKING_ID, ABS_MT_WIDTH_MAJOR, ABS_PRESSURE, ABS_TOOL_WIDTH,
    ABS_X, ABS_Y, BTN_MOUSE, BTN_TOUCH, REL_X, REL_Y, SYN_MT_REPORT, SYN_REPORT,
};
use crate::hub::EventHub;
use crate::keys::{self, KeyState, MetaState};
use crate::orientation::Rotation;
use crate::policy::{PolicyActions, PolicyFlags, ReaderPolicy};
use crate::touch::{TouchFrame, TouchPointer, MAX_POINTERS, MAX_POINTER_ID};

/// How far the trackball must travel to count as one unit of motion.
const TRACKBALL_MOVEMENT_THRESHOLD: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchScreenConfig {
    #[default]
    NoTouch,
    Finger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyboardConfig {
    #[default]
    NoKeys,
    Qwerty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NavigationConfig {
    #[default]
    NoNav,
    Dpad,
    Trackball,
}

/// Coarse summary of what input hardware is present, recomputed whenever a
/// device is added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputConfiguration {
    pub touch_screen: TouchScreenConfig,
    pub keyboard: KeyboardConfig,
    pub navigation: NavigationConfig,
}

/// The cross-thread snapshot. Everything else in the reader belongs to the
/// reader thread alone.
#[derive(Debug)]
struct ExportedState {
    configuration: InputConfiguration,
    virtual_key_code: i32,
    virtual_scan_code: i32,
}

impl Default for ExportedState {
    fn default() -> Self {
        Self {
            configuration: InputConfiguration::default(),
            virtual_key_code: -1,
            virtual_scan_code: -1,
        }
    }
}

/// Cloneable query surface for threads other than the reader thread.
#[derive(Clone)]
pub struct ReaderQueries {
    exported: Arc<Mutex<ExportedState>>,
    hub: Arc<dyn EventHub>,
}

impl ReaderQueries {
    pub fn current_input_configuration(&self) -> InputConfiguration {
        self.exported
            .lock()
            .map(|e| e.configuration)
            .unwrap_or_default()
    }

    /// The active virtual key as `(key_code, scan_code)`, or `None` when no
    /// virtual key is down on any device.
    pub fn current_virtual_key(&self) -> Option<(i32, i32)> {
        let Ok(exported) = self.exported.lock() else {
            return None;
        };
        (exported.virtual_key_code != -1)
            .then(|| (exported.virtual_key_code, exported.virtual_scan_code))
    }

    pub fn current_scan_code_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        scan_code: u16,
    ) -> KeyState {
        if let Ok(exported) = self.exported.lock() {
            if exported.virtual_scan_code == scan_code as i32 {
                return KeyState::Virtual;
            }
        }
        self.hub.scan_code_state(device_id, classes, scan_code)
    }

    pub fn current_key_code_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        key_code: i32,
    ) -> KeyState {
        if let Ok(exported) = self.exported.lock() {
            if exported.virtual_key_code == key_code {
                return KeyState::Virtual;
            }
        }
        self.hub.key_code_state(device_id, classes, key_code)
    }

    pub fn current_switch_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        switch_code: u16,
    ) -> KeyState {
        self.hub.switch_state(device_id, classes, switch_code)
    }

    pub fn has_keys(&self, key_codes: &[i32], out_flags: &mut [u8]) -> bool {
        self.hub.has_keys(key_codes, out_flags)
    }
}

pub struct InputReader {
    hub: Arc<dyn EventHub>,
    policy: Arc<dyn ReaderPolicy>,
    dispatcher: Arc<dyn Dispatcher>,
    devices: DeviceRegistry,
    /// OR of all keyboards' meta state; `None` while the cache is invalid.
    global_meta_state: Option<MetaState>,
    /// Display size; -1 until the policy has reported it.
    display_width: i32,
    display_height: i32,
    display_orientation: Rotation,
    exported: Arc<Mutex<ExportedState>>,
}

impl InputReader {
    pub fn new(
        hub: Arc<dyn EventHub>,
        policy: Arc<dyn ReaderPolicy>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let reader = Self {
            hub,
            policy,
            dispatcher,
            devices: DeviceRegistry::new(),
            global_meta_state: None,
            display_width: -1,
            display_height: -1,
            display_orientation: Rotation::Rot0,
            exported: Arc::new(Mutex::new(ExportedState::default())),
        };

        for name in reader.policy.excluded_device_names() {
            reader.hub.add_excluded_device(&name);
        }
        reader.update_exported_virtual_key_state();
        reader.update_exported_input_configuration();
        reader
    }

    /// Handle for query threads; see [`ReaderQueries`].
    pub fn queries(&self) -> ReaderQueries {
        ReaderQueries {
            exported: Arc::clone(&self.exported),
            hub: Arc::clone(&self.hub),
        }
    }

    /// Block for one raw event and run it through the pipeline. Returns
    /// false when the event source is exhausted and the driving thread
    /// should stop.
    pub fn loop_once(&mut self) -> bool {
        let Some(mut raw) = self.hub.next_event() else {
            log::debug!("Event source closed, stopping reader loop");
            return false;
        };

        // Re-stamp so all downstream consumers share one monotonic
        // timebase regardless of driver clocks.
        raw.when = uptime_nanos();

        log::trace!(
            "Input event: device=0x{:x} kind={:?} scan={} key={} value={}",
            raw.device_id,
            raw.kind,
            raw.scan_code,
            raw.key_code,
            raw.value
        );

        self.process(&raw);
        true
    }

    fn process(&mut self, raw: &RawEvent) {
        match raw.kind {
            RawEventKind::DeviceAdded => self.handle_device_added(raw),
            RawEventKind::DeviceRemoved => self.handle_device_removed(raw),
            RawEventKind::Sync => self.handle_sync(raw),
            RawEventKind::Key => self.handle_key(raw),
            RawEventKind::RelativeMotion => self.handle_relative_motion(raw),
            RawEventKind::AbsoluteMotion => self.handle_absolute_motion(raw),
            RawEventKind::Switch => self.handle_switch(raw),
        }
    }

    // --- Device lifecycle ---

    fn handle_device_added(&mut self, raw: &RawEvent) {
        if self.devices.contains(raw.device_id) {
            log::warn!(
                "Ignoring spurious device added event for device id {}",
                raw.device_id
            );
            return;
        }

        let classes = self.hub.device_classes(raw.device_id);
        let name = self.hub.device_name(raw.device_id);
        let mut device = InputDevice::new(raw.device_id, classes, name);

        if !classes.is_empty() {
            log::info!(
                "Device added: id=0x{:x}, name={}, classes={:#04x}",
                device.id,
                device.name,
                device.classes.bits()
            );
            self.configure_device(&mut device);
        } else {
            log::info!(
                "Device added: id=0x{:x}, name={} (ignored non-input device)",
                device.id,
                device.name
            );
            device.ignored = true;
        }

        device.reset();
        let ignored = device.ignored;
        self.devices.insert(device);

        if !ignored {
            self.on_configuration_changed(raw.when);
        }
    }

    fn handle_device_removed(&mut self, raw: &RawEvent) {
        let Some(device) = self.devices.remove(raw.device_id) else {
            log::warn!(
                "Ignoring spurious device removed event for device id {}",
                raw.device_id
            );
            return;
        };

        if !device.ignored {
            log::info!(
                "Device removed: id=0x{:x}, name={}, classes={:#04x}",
                device.id,
                device.name,
                device.classes.bits()
            );
            self.on_configuration_changed(raw.when);
        } else {
            log::info!(
                "Device removed: id=0x{:x}, name={} (ignored non-input device)",
                device.id,
                device.name
            );
        }
    }

    fn on_configuration_changed(&mut self, when: u64) {
        // The meta-state cache depends on the set of configured devices.
        self.reset_global_meta_state();

        self.update_exported_virtual_key_state();
        self.update_exported_input_configuration();

        self.dispatcher.notify_configuration_changed(when);
    }

    // --- Device configuration ---

    fn configure_device(&self, device: &mut InputDevice) {
        if device.classes.is_multi_touch_screen() {
            device.touch_screen.parameters.x_axis = self.read_axis(device.id, ABS_MT_POSITION_X, "X");
            device.touch_screen.parameters.y_axis = self.read_axis(device.id, ABS_MT_POSITION_Y, "Y");
            device.touch_screen.parameters.pressure_axis =
                self.read_axis(device.id, ABS_MT_TOUCH_MAJOR, "Pressure");
            device.touch_screen.parameters.size_axis =
                self.read_axis(device.id, ABS_MT_WIDTH_MAJOR, "Size");
        } else if device.classes.is_single_touch_screen() {
            device.touch_screen.parameters.x_axis = self.read_axis(device.id, ABS_X, "X");
            device.touch_screen.parameters.y_axis = self.read_axis(device.id, ABS_Y, "Y");
            device.touch_screen.parameters.pressure_axis =
                self.read_axis(device.id, ABS_PRESSURE, "Pressure");
            device.touch_screen.parameters.size_axis =
                self.read_axis(device.id, ABS_TOOL_WIDTH, "Size");
        }

        if device.classes.is_touch_screen() {
            let params = &mut device.touch_screen.parameters;
            params.use_bad_touch_filter = self.policy.filter_touch_events();
            params.use_averaging_touch_filter = self.policy.filter_touch_events();
            params.use_jumpy_touch_filter = self.policy.filter_jumpy_touch_events();

            let precalc = &mut device.touch_screen.precalculated;
            if params.pressure_axis.valid {
                precalc.pressure_origin = params.pressure_axis.min;
                precalc.pressure_scale = 1.0 / params.pressure_axis.range as f32;
            } else {
                precalc.pressure_origin = 0;
                precalc.pressure_scale = 1.0;
            }

            if params.size_axis.valid {
                precalc.size_origin = params.size_axis.min;
                precalc.size_scale = 1.0 / params.size_axis.range as f32;
            } else {
                precalc.size_origin = 0;
                precalc.size_scale = 1.0;
            }
        }

        if device.classes.is_trackball() {
            let precalc = &mut device.trackball.precalculated;
            precalc.x_precision = TRACKBALL_MOVEMENT_THRESHOLD as f32;
            precalc.y_precision = TRACKBALL_MOVEMENT_THRESHOLD as f32;
            precalc.x_scale = 1.0 / TRACKBALL_MOVEMENT_THRESHOLD as f32;
            precalc.y_scale = 1.0 / TRACKBALL_MOVEMENT_THRESHOLD as f32;
        }

        Self::configure_device_for_display_size(
            &*self.hub,
            &*self.policy,
            self.display_width,
            self.display_height,
            device,
        );
    }

    fn read_axis(&self, device_id: i32, axis: u16, label: &str) -> AxisInfo {
        if let Some(raw) = self.hub.absolute_axis_info(device_id, axis) {
            let range = raw.max - raw.min;
            if range != 0 {
                log::info!(
                    "  {}: min={} max={} flat={} fuzz={}",
                    label,
                    raw.min,
                    raw.max,
                    raw.flat,
                    raw.fuzz
                );
                return AxisInfo {
                    valid: true,
                    min: raw.min,
                    max: raw.max,
                    range,
                    flat: raw.flat,
                    fuzz: raw.fuzz,
                };
            }
        }

        log::info!("  {}: unknown axis values, marking as invalid", label);
        AxisInfo::default()
    }

    /// Derive the axis-to-display transforms. Re-run for every device when
    /// the display size changes.
    fn configure_device_for_display_size(
        hub: &dyn EventHub,
        policy: &dyn ReaderPolicy,
        display_width: i32,
        display_height: i32,
        device: &mut InputDevice,
    ) {
        if !device.classes.is_touch_screen() {
            return;
        }

        let params = device.touch_screen.parameters;
        let precalc = &mut device.touch_screen.precalculated;

        if params.x_axis.valid && params.y_axis.valid {
            precalc.x_origin = params.x_axis.min;
            precalc.y_origin = params.y_axis.min;

            if display_width < 0 {
                log::debug!("Skipping part of touch screen configuration since display size is unknown");
                precalc.x_scale = 1.0;
                precalc.y_scale = 1.0;
            } else {
                log::info!(
                    "Device configured: id=0x{:x}, name={} (display size changed)",
                    device.id,
                    device.name
                );
                precalc.x_scale = display_width as f32 / params.x_axis.range as f32;
                precalc.y_scale = display_height as f32 / params.y_axis.range as f32;

                Self::configure_virtual_keys(hub, policy, display_width, display_height, device);
            }
        } else {
            precalc.x_origin = 0;
            precalc.x_scale = 1.0;
            precalc.y_origin = 0;
            precalc.y_scale = 1.0;
        }
    }

    /// Convert the policy's display-space key definitions into hit boxes in
    /// raw touch coordinates.
    fn configure_virtual_keys(
        hub: &dyn EventHub,
        policy: &dyn ReaderPolicy,
        display_width: i32,
        display_height: i32,
        device: &mut InputDevice,
    ) {
        device.touch_screen.virtual_keys.clear();

        let definitions = policy.virtual_key_definitions(&device.name);
        if definitions.is_empty() {
            return;
        }

        let params = device.touch_screen.parameters;
        let touch_left = params.x_axis.min;
        let touch_top = params.y_axis.min;
        let touch_width = params.x_axis.range;
        let touch_height = params.y_axis.range;

        for def in definitions {
            let Some((key_code, flags)) = hub.scan_code_to_key_code(device.id, def.scan_code)
            else {
                log::warn!(
                    "  Virtual key {}: could not obtain key code, ignoring",
                    def.scan_code
                );
                continue;
            };

            let half_width = def.width / 2;
            let half_height = def.height / 2;

            let virtual_key = VirtualKey {
                scan_code: def.scan_code,
                key_code,
                flags,
                hit_left: (def.center_x - half_width) * touch_width / display_width + touch_left,
                hit_right: (def.center_x + half_width) * touch_width / display_width + touch_left,
                hit_top: (def.center_y - half_height) * touch_height / display_height + touch_top,
                hit_bottom: (def.center_y + half_height) * touch_height / display_height
                    + touch_top,
            };

            log::info!(
                "  Virtual key {}: keyCode={} hit=({},{})-({},{})",
                virtual_key.scan_code,
                virtual_key.key_code,
                virtual_key.hit_left,
                virtual_key.hit_top,
                virtual_key.hit_right,
                virtual_key.hit_bottom
            );
            device.touch_screen.virtual_keys.push(virtual_key);
        }
    }

    // --- Raw event routing ---

    fn handle_sync(&mut self, raw: &RawEvent) {
        match raw.scan_code {
            SYN_MT_REPORT => {
                // The driver finished reporting one pointer of the frame.
                let Some(device) = self.devices.get_mut(raw.device_id) else {
                    return;
                };
                if device.ignored || !device.classes.is_multi_touch_screen() {
                    return;
                }

                let accumulator = &mut device.multi_touch.accumulator;
                let index = accumulator.pointer_count;
                if !accumulator.pointers[index].fields.is_empty() {
                    if index == MAX_POINTERS {
                        log::warn!(
                            "Multi-touch driver reported more than the maximum of {} pointers",
                            MAX_POINTERS
                        );
                    } else {
                        accumulator.pointer_count = index + 1;
                    }
                }
                let next = accumulator.pointer_count;
                accumulator.pointers[next].clear();
            }
            SYN_REPORT => self.on_frame_sync(raw.when, raw.device_id),
            _ => {}
        }
    }

    /// Frame boundary: commit every dirty accumulator on the device.
    fn on_frame_sync(&mut self, when: u64, device_id: i32) {
        let Some(device) = self.devices.get(device_id) else {
            return;
        };
        if device.ignored {
            return;
        }

        let multi_dirty =
            device.classes.is_multi_touch_screen() && device.multi_touch.accumulator.is_dirty();
        let single_dirty =
            device.classes.is_single_touch_screen() && device.single_touch.accumulator.is_dirty();
        let trackball_dirty =
            device.classes.is_trackball() && device.trackball.accumulator.is_dirty();

        if !multi_dirty && !single_dirty && !trackball_dirty {
            return;
        }

        // Display geometry and the meta-state cache feed the frame handlers;
        // resolve both before the device is mutably borrowed. When display
        // info is unavailable the frame is dropped but accumulators still
        // cycle.
        let display_ok = self.refresh_display_properties();
        let meta_state = self.global_meta_state();
        let other_virtual_key = self.exported_virtual_key_excluding(device_id);

        let ctx = FrameContext {
            policy: &*self.policy,
            dispatcher: &*self.dispatcher,
            display_width: self.display_width,
            display_height: self.display_height,
            display_orientation: self.display_orientation,
            meta_state,
            other_virtual_key,
            exported: &*self.exported,
        };

        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };

        if multi_dirty {
            if display_ok {
                ctx.on_multi_touch_changed(when, device);
            }
            device.multi_touch.accumulator.clear();
        }
        if single_dirty {
            if display_ok {
                ctx.on_single_touch_changed(when, device);
            }
            device.single_touch.accumulator.clear();
        }
        if trackball_dirty {
            if display_ok {
                ctx.on_trackball_changed(when, device);
            }
            device.trackball.accumulator.clear();
        }
    }

    fn handle_key(&mut self, raw: &RawEvent) {
        let down = raw.value != 0;

        {
            let Some(device) = self.devices.get_mut(raw.device_id) else {
                return;
            };
            if device.ignored {
                return;
            }

            // Touch and mouse buttons belong to their accumulators and are
            // committed at frame sync, not dispatched immediately.
            if device.classes.is_single_touch_screen() && raw.scan_code == BTN_TOUCH {
                device.single_touch.accumulator.fields |= SingleTouchFields::BTN_TOUCH;
                device.single_touch.accumulator.btn_touch = down;
                return;
            }

            if device.classes.is_trackball() && raw.scan_code == BTN_MOUSE {
                device.trackball.accumulator.fields |= TrackballFields::BTN_MOUSE;
                device.trackball.accumulator.btn_mouse = down;
                return;
            }

            if !device.classes.is_keyboard() {
                return;
            }
        }

        self.on_key(raw.when, raw.device_id, down, raw.key_code, raw.scan_code, raw.flags);
    }

    fn on_key(
        &mut self,
        when: u64,
        device_id: i32,
        down: bool,
        key_code: i32,
        scan_code: u16,
        raw_flags: u32,
    ) {
        // Display orientation decides how DPAD codes rotate.
        if !self.refresh_display_properties() {
            return;
        }
        let orientation = self.display_orientation;

        let mut meta_changed = false;
        let meta_state;
        let down_time;
        {
            let Some(device) = self.devices.get_mut(device_id) else {
                return;
            };

            let old_meta = device.keyboard.current.meta_state;
            let new_meta = keys::update_meta_state(key_code, down, old_meta);
            if old_meta != new_meta {
                device.keyboard.current.meta_state = new_meta;
                meta_changed = true;
            }

            if down {
                device.keyboard.current.down_time = when;
            }

            meta_state = device.keyboard.current.meta_state;
            down_time = device.keyboard.current.down_time;
        }

        if meta_changed {
            self.reset_global_meta_state();
        }

        let key_code = keys::rotate_key_code(key_code, orientation);

        let mut policy_flags = PolicyFlags::from_bits_retain(raw_flags);
        let actions = self
            .policy
            .intercept_key(when, device_id, down, key_code, scan_code, policy_flags);

        if !apply_policy_actions(&*self.dispatcher, when, actions, &mut policy_flags) {
            return; // event dropped
        }

        let action = if down { KeyAction::Down } else { KeyAction::Up };
        let mut flags = KeyFlags::FROM_SYSTEM;
        if actions.contains(PolicyActions::WOKE_HERE) {
            flags |= KeyFlags::WOKE_HERE;
        }

        self.dispatcher.notify_key(
            when,
            device_id,
            EventNature::Key,
            policy_flags,
            action,
            flags,
            key_code,
            scan_code,
            meta_state,
            down_time,
        );
    }

    fn handle_relative_motion(&mut self, raw: &RawEvent) {
        let Some(device) = self.devices.get_mut(raw.device_id) else {
            return;
        };
        if device.ignored || !device.classes.is_trackball() {
            return;
        }

        let accumulator = &mut device.trackball.accumulator;
        match raw.scan_code {
            REL_X => {
                accumulator.fields |= TrackballFields::REL_X;
                accumulator.rel_x = raw.value;
            }
            REL_Y => {
                accumulator.fields |= TrackballFields::REL_Y;
                accumulator.rel_y = raw.value;
            }
            _ => {}
        }
    }

    fn handle_absolute_motion(&mut self, raw: &RawEvent) {
        let Some(device) = self.devices.get_mut(raw.device_id) else {
            return;
        };
        if device.ignored {
            return;
        }

        if device.classes.is_multi_touch_screen() {
            let accumulator = &mut device.multi_touch.accumulator;
            let index = accumulator.pointer_count;
            let pointer = &mut accumulator.pointers[index];

            match raw.scan_code {
                ABS_MT_POSITION_X => {
                    pointer.fields |= MtPointerFields::ABS_MT_POSITION_X;
                    pointer.abs_mt_position_x = raw.value;
                }
                ABS_MT_POSITION_Y => {
                    pointer.fields |= MtPointerFields::ABS_MT_POSITION_Y;
                    pointer.abs_mt_position_y = raw.value;
                }
                ABS_MT_TOUCH_MAJOR => {
                    pointer.fields |= MtPointerFields::ABS_MT_TOUCH_MAJOR;
                    pointer.abs_mt_touch_major = raw.value;
                }
                ABS_MT_WIDTH_MAJOR => {
                    pointer.fields |= MtPointerFields::ABS_MT_WIDTH_MAJOR;
                    pointer.abs_mt_width_major = raw.value;
                }
                ABS_MT_TRACKING_ID => {
                    pointer.fields |= MtPointerFields::ABS_MT_TRACKING_ID;
                    pointer.abs_mt_tracking_id = raw.value;
                }
                _ => {}
            }
        } else if device.classes.is_single_touch_screen() {
            let accumulator = &mut device.single_touch.accumulator;
            match raw.scan_code {
                ABS_X => {
                    accumulator.fields |= SingleTouchFields::ABS_X;
                    accumulator.abs_x = raw.value;
                }
                ABS_Y => {
                    accumulator.fields |= SingleTouchFields::ABS_Y;
                    accumulator.abs_y = raw.value;
                }
                ABS_PRESSURE => {
                    accumulator.fields |= SingleTouchFields::ABS_PRESSURE;
                    accumulator.abs_pressure = raw.value;
                }
                ABS_TOOL_WIDTH => {
                    accumulator.fields |= SingleTouchFields::ABS_TOOL_WIDTH;
                    accumulator.abs_tool_width = raw.value;
                }
                _ => {}
            }
        }
    }

    fn handle_switch(&mut self, raw: &RawEvent) {
        let Some(device) = self.devices.get(raw.device_id) else {
            return;
        };
        if device.ignored {
            return;
        }

        // Switches are policy-only; nothing reaches the dispatcher.
        let actions = self.policy.intercept_switch(raw.when, raw.scan_code, raw.value);
        let mut policy_flags = PolicyFlags::empty();
        apply_policy_actions(&*self.dispatcher, raw.when, actions, &mut policy_flags);
    }

    // --- Reader-wide state ---

    fn reset_global_meta_state(&mut self) {
        self.global_meta_state = None;
    }

    fn global_meta_state(&mut self) -> MetaState {
        if let Some(meta) = self.global_meta_state {
            return meta;
        }

        let mut meta = MetaState::empty();
        for device in self.devices.values() {
            if device.classes.is_keyboard() {
                meta |= device.keyboard.current.meta_state;
            }
        }
        self.global_meta_state = Some(meta);
        meta
    }

    fn reset_display_properties(&mut self) {
        self.display_width = -1;
        self.display_height = -1;
        self.display_orientation = Rotation::Rot0;
    }

    /// Pull current display geometry from the policy. On a size change every
    /// device's transforms are recomputed; on failure display properties are
    /// reset and the caller must drop the frame.
    fn refresh_display_properties(&mut self) -> bool {
        let Some(info) = self.policy.display_info(0) else {
            self.reset_display_properties();
            return false;
        };

        if info.width != self.display_width || info.height != self.display_height {
            log::debug!(
                "Display size changed from {}x{} to {}x{}, updating device configuration",
                self.display_width,
                self.display_height,
                info.width,
                info.height
            );

            self.display_width = info.width;
            self.display_height = info.height;

            let hub = Arc::clone(&self.hub);
            let policy = Arc::clone(&self.policy);
            for device in self.devices.values_mut() {
                Self::configure_device_for_display_size(
                    &*hub,
                    &*policy,
                    info.width,
                    info.height,
                    device,
                );
            }
        }

        if info.orientation != self.display_orientation {
            log::debug!("Display orientation changed to {}", info.orientation);
            self.display_orientation = info.orientation;
        }

        true
    }

    // --- Exported state ---

    fn update_exported_virtual_key_state(&self) {
        let mut key_code = -1;
        let mut scan_code = -1;
        for device in self.devices.values() {
            if device.classes.is_touch_screen()
                && device.touch_screen.current_virtual_key.status == VirtualKeyStatus::Down
            {
                key_code = device.touch_screen.current_virtual_key.key_code;
                scan_code = device.touch_screen.current_virtual_key.scan_code as i32;
            }
        }

        if let Ok(mut exported) = self.exported.lock() {
            exported.virtual_key_code = key_code;
            exported.virtual_scan_code = scan_code;
        }
    }

    /// Virtual key held down on any device other than `device_id`, if any.
    /// Lets a frame handler refresh the exported state while it holds the
    /// one device that can be transitioning.
    fn exported_virtual_key_excluding(&self, device_id: i32) -> Option<(i32, i32)> {
        let mut found = None;
        for device in self.devices.values() {
            if device.id != device_id
                && device.classes.is_touch_screen()
                && device.touch_screen.current_virtual_key.status == VirtualKeyStatus::Down
            {
                found = Some((
                    device.touch_screen.current_virtual_key.key_code,
                    device.touch_screen.current_virtual_key.scan_code as i32,
                ));
            }
        }
        found
    }

    fn update_exported_input_configuration(&self) {
        let mut touch_screen = TouchScreenConfig::NoTouch;
        let mut keyboard = KeyboardConfig::NoKeys;
        let mut navigation = NavigationConfig::NoNav;

        for device in self.devices.values() {
            if device.classes.is_touch_screen() {
                touch_screen = TouchScreenConfig::Finger;
            }
            if device.classes.contains(DeviceClasses::ALPHAKEY) {
                keyboard = KeyboardConfig::Qwerty;
            }
            if device.classes.contains(DeviceClasses::TRACKBALL) {
                navigation = NavigationConfig::Trackball;
            } else if device.classes.contains(DeviceClasses::DPAD) {
                navigation = NavigationConfig::Dpad;
            }
        }

        if let Ok(mut exported) = self.exported.lock() {
            exported.configuration = InputConfiguration {
                touch_screen,
                keyboard,
                navigation,
            };
        }
    }

    // --- Query surface (same snapshot ReaderQueries reads) ---

    pub fn current_input_configuration(&self) -> InputConfiguration {
        self.exported
            .lock()
            .map(|e| e.configuration)
            .unwrap_or_default()
    }

    pub fn current_virtual_key(&self) -> Option<(i32, i32)> {
        let Ok(exported) = self.exported.lock() else {
            return None;
        };
        (exported.virtual_key_code != -1)
            .then(|| (exported.virtual_key_code, exported.virtual_scan_code))
    }

    pub fn current_scan_code_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        scan_code: u16,
    ) -> KeyState {
        self.queries().current_scan_code_state(device_id, classes, scan_code)
    }

    pub fn current_key_code_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        key_code: i32,
    ) -> KeyState {
        self.queries().current_key_code_state(device_id, classes, key_code)
    }

    pub fn current_switch_state(
        &self,
        device_id: i32,
        classes: DeviceClasses,
        switch_code: u16,
    ) -> KeyState {
        self.hub.switch_state(device_id, classes, switch_code)
    }

    pub fn has_keys(&self, key_codes: &[i32], out_flags: &mut [u8]) -> bool {
        self.hub.has_keys(key_codes, out_flags)
    }
}

/// Everything a frame handler needs besides the device itself, captured by
/// value or shared borrow so the device can stay mutably borrowed.
struct FrameContext<'a> {
    policy: &'a dyn ReaderPolicy,
    dispatcher: &'a dyn Dispatcher,
    display_width: i32,
    display_height: i32,
    display_orientation: Rotation,
    meta_state: MetaState,
    other_virtual_key: Option<(i32, i32)>,
    exported: &'a Mutex<ExportedState>,
}

impl FrameContext<'_> {
    // --- Touch assembly ---

    fn on_multi_touch_changed(&self, when: u64, device: &mut InputDevice) {
        let required = MtPointerFields::ABS_MT_POSITION_X
            | MtPointerFields::ABS_MT_POSITION_Y
            | MtPointerFields::ABS_MT_TOUCH_MAJOR
            | MtPointerFields::ABS_MT_WIDTH_MAJOR;

        let accumulator = device.multi_touch.accumulator;
        let out = &mut device.touch_screen.current_touch;
        out.clear();

        let mut have_pointer_ids = true;

        for index in 0..accumulator.pointer_count {
            let pointer = &accumulator.pointers[index];

            if !pointer.fields.contains(required) {
                log::debug!(
                    "Dropping multi-touch pointer with missing required fields: index={}, fields={:?}",
                    index,
                    pointer.fields
                );
                continue;
            }

            if pointer.abs_mt_touch_major <= 0 {
                // Pointer is not down.
                continue;
            }

            let out_index = out.pointer_count;
            out.pointers[out_index] = TouchPointer {
                id: 0,
                x: pointer.abs_mt_position_x,
                y: pointer.abs_mt_position_y,
                // The driver has no separate pressure/size axes in this
                // protocol; contact and tool size stand in for them.
                pressure: pointer.abs_mt_touch_major,
                size: pointer.abs_mt_width_major,
            };

            if have_pointer_ids {
                if pointer.fields.contains(MtPointerFields::ABS_MT_TRACKING_ID) {
                    let id = pointer.abs_mt_tracking_id;
                    if id < 0 || id as u32 > MAX_POINTER_ID {
                        log::debug!(
                            "Ignoring driver-provided pointer id {}: outside the supported range",
                            id
                        );
                        have_pointer_ids = false;
                    } else {
                        let id = id as u32;
                        out.pointers[out_index].id = id;
                        out.id_to_index[id as usize] = out_index;
                        out.id_bits.mark_bit(id);
                    }
                } else {
                    have_pointer_ids = false;
                }
            }

            out.pointer_count = out_index + 1;
        }

        self.on_touch_changed(when, device, have_pointer_ids);
    }

    fn on_single_touch_changed(&self, when: u64, device: &mut InputDevice) {
        // Merge the reported fields into the committed state; everything
        // else stays sticky from previous frames.
        let accumulator = device.single_touch.accumulator;
        let fields = accumulator.fields;
        let current = &mut device.single_touch.current;

        if fields.contains(SingleTouchFields::BTN_TOUCH) {
            current.down = accumulator.btn_touch;
        }
        if fields.contains(SingleTouchFields::ABS_X) {
            current.x = accumulator.abs_x;
        }
        if fields.contains(SingleTouchFields::ABS_Y) {
            current.y = accumulator.abs_y;
        }
        if fields.contains(SingleTouchFields::ABS_PRESSURE) {
            current.pressure = accumulator.abs_pressure;
        }
        if fields.contains(SingleTouchFields::ABS_TOOL_WIDTH) {
            current.size = accumulator.abs_tool_width;
        }

        let committed = *current;
        let out = &mut device.touch_screen.current_touch;
        out.clear();

        if committed.down {
            out.push_pointer(TouchPointer {
                id: 0,
                x: committed.x,
                y: committed.y,
                pressure: committed.pressure,
                size: committed.size,
            });
        }

        self.on_touch_changed(when, device, true);
    }

    /// Shared tail of both assemblers: policy check, filters, pointer-id
    /// resolution, virtual-key overlay, dispatch, last-touch bookkeeping.
    fn on_touch_changed(&self, when: u64, device: &mut InputDevice, mut have_pointer_ids: bool) {
        let actions = self.policy.intercept_touch(when);
        let mut policy_flags = PolicyFlags::empty();
        if !apply_policy_actions(self.dispatcher, when, actions, &mut policy_flags) {
            // Dropped: forget the last frame so the next one starts fresh.
            device.touch_screen.last_touch.clear();
            return;
        }

        let touch_screen = &mut device.touch_screen;

        if touch_screen.parameters.use_bad_touch_filter && touch_screen.apply_bad_touch_filter() {
            have_pointer_ids = false;
        }
        if touch_screen.parameters.use_jumpy_touch_filter && touch_screen.apply_jumpy_touch_filter()
        {
            have_pointer_ids = false;
        }

        if !have_pointer_ids {
            touch_screen.calculate_pointer_ids();
        }

        // The averaging filter must see its own input next frame, not its
        // output, so the pre-averaging frame is what becomes last_touch.
        let saved_touch = touch_screen.current_touch;
        if touch_screen.parameters.use_averaging_touch_filter {
            touch_screen.apply_averaging_touch_filter();
        }

        if !self.consume_virtual_key_touches(when, device, policy_flags) {
            self.dispatch_touches(when, device, policy_flags);
        }

        device.touch_screen.last_touch = saved_touch;
    }

    // --- Virtual-key overlay ---

    /// Run the virtual-key state machine for this frame. Returns true if
    /// the frame was consumed and no motion must be dispatched.
    fn consume_virtual_key_touches(
        &self,
        when: u64,
        device: &mut InputDevice,
        policy_flags: PolicyFlags,
    ) -> bool {
        let pointer_count = device.touch_screen.current_touch.pointer_count;

        match device.touch_screen.current_virtual_key.status {
            VirtualKeyStatus::Canceled => {
                if pointer_count == 0 {
                    // Pointer went up after the key was canceled.
                    device.touch_screen.current_virtual_key.status = VirtualKeyStatus::Up;
                }
                true
            }

            VirtualKeyStatus::Down => {
                if pointer_count == 0 {
                    // Pointer went up while the virtual key was down.
                    device.touch_screen.current_virtual_key.status = VirtualKeyStatus::Up;
                    log::debug!(
                        "Virtual key up: keyCode={}, scanCode={}",
                        device.touch_screen.current_virtual_key.key_code,
                        device.touch_screen.current_virtual_key.scan_code
                    );
                    self.dispatch_virtual_key(
                        when,
                        device,
                        policy_flags,
                        KeyAction::Up,
                        KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY,
                    );
                    return true;
                }

                if pointer_count == 1 {
                    if let Some(hit) = device.touch_screen.find_virtual_key_hit() {
                        if hit.key_code == device.touch_screen.current_virtual_key.key_code {
                            // Still inside the key.
                            return true;
                        }
                    }
                }

                // Pointer left the key area or a second pointer went down.
                device.touch_screen.current_virtual_key.status = VirtualKeyStatus::Canceled;
                log::debug!(
                    "Virtual key canceled: keyCode={}, scanCode={}",
                    device.touch_screen.current_virtual_key.key_code,
                    device.touch_screen.current_virtual_key.scan_code
                );
                self.dispatch_virtual_key(
                    when,
                    device,
                    policy_flags,
                    KeyAction::Up,
                    KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY | KeyFlags::CANCELED,
                );
                true
            }

            _ => {
                if pointer_count == 1 && device.touch_screen.last_touch.pointer_count == 0 {
                    // Fresh single-pointer down: check for a virtual key hit.
                    if let Some(hit) = device.touch_screen.find_virtual_key_hit().copied() {
                        let virtual_key = &mut device.touch_screen.current_virtual_key;
                        virtual_key.status = VirtualKeyStatus::Down;
                        virtual_key.down_time = when;
                        virtual_key.key_code = hit.key_code;
                        virtual_key.scan_code = hit.scan_code;
                        log::debug!(
                            "Virtual key down: keyCode={}, scanCode={}",
                            hit.key_code,
                            hit.scan_code
                        );
                        self.dispatch_virtual_key(
                            when,
                            device,
                            policy_flags,
                            KeyAction::Down,
                            KeyFlags::FROM_SYSTEM | KeyFlags::VIRTUAL_HARD_KEY,
                        );
                        return true;
                    }
                }
                false
            }
        }
    }

    fn dispatch_virtual_key(
        &self,
        when: u64,
        device: &InputDevice,
        policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
    ) {
        self.refresh_exported_virtual_key(device);

        let virtual_key = device.touch_screen.current_virtual_key;

        if action == KeyAction::Down {
            self.policy.virtual_key_down_feedback();
        }

        let actions = self.policy.intercept_key(
            when,
            device.id,
            action == KeyAction::Down,
            virtual_key.key_code,
            virtual_key.scan_code,
            policy_flags,
        );

        let mut policy_flags = policy_flags;
        if apply_policy_actions(self.dispatcher, when, actions, &mut policy_flags) {
            self.dispatcher.notify_key(
                when,
                device.id,
                EventNature::Key,
                policy_flags,
                action,
                flags,
                virtual_key.key_code,
                virtual_key.scan_code,
                self.meta_state,
                virtual_key.down_time,
            );
        }
    }

    fn refresh_exported_virtual_key(&self, device: &InputDevice) {
        let virtual_key = device.touch_screen.current_virtual_key;
        let own = (virtual_key.status == VirtualKeyStatus::Down)
            .then_some((virtual_key.key_code, virtual_key.scan_code as i32));
        let (key_code, scan_code) = own.or(self.other_virtual_key).unwrap_or((-1, -1));

        if let Ok(mut exported) = self.exported.lock() {
            exported.virtual_key_code = key_code;
            exported.virtual_scan_code = scan_code;
        }
    }

    // --- Touch dispatch ---

    fn dispatch_touches(&self, when: u64, device: &mut InputDevice, policy_flags: PolicyFlags) {
        let current_count = device.touch_screen.current_touch.pointer_count;
        let last_count = device.touch_screen.last_touch.pointer_count;
        if current_count == 0 && last_count == 0 {
            return;
        }

        let current_id_bits = device.touch_screen.current_touch.id_bits;
        let last_id_bits = device.touch_screen.last_touch.id_bits;

        if current_id_bits == last_id_bits {
            // Same pointers as last frame: one move event carries them all.
            let touch_screen = &device.touch_screen;
            self.dispatch_touch(
                when,
                device.id,
                policy_flags,
                &touch_screen.current_touch,
                &touch_screen.precalculated,
                touch_screen.down_time,
                current_id_bits,
                MotionAction::Move,
            );
            return;
        }

        // Pointers may go up and down in the same frame. Ups first, then
        // downs, lowest id first, shrinking and growing the active set one
        // pointer at a time.
        let mut up_id_bits = last_id_bits.difference(current_id_bits);
        let mut down_id_bits = current_id_bits.difference(last_id_bits);
        let mut active_id_bits = last_id_bits;

        while !up_id_bits.is_empty() {
            let up_id = up_id_bits.first_marked_bit();
            up_id_bits.clear_bit(up_id);
            let old_active_id_bits = active_id_bits;
            active_id_bits.clear_bit(up_id);

            let action = if active_id_bits.is_empty() {
                MotionAction::Up
            } else {
                MotionAction::PointerUp { id: up_id }
            };

            let touch_screen = &device.touch_screen;
            self.dispatch_touch(
                when,
                device.id,
                policy_flags,
                &touch_screen.last_touch,
                &touch_screen.precalculated,
                touch_screen.down_time,
                old_active_id_bits,
                action,
            );
        }

        while !down_id_bits.is_empty() {
            let down_id = down_id_bits.first_marked_bit();
            down_id_bits.clear_bit(down_id);
            let old_active_id_bits = active_id_bits;
            active_id_bits.mark_bit(down_id);

            let action = if old_active_id_bits.is_empty() {
                device.touch_screen.down_time = when;
                MotionAction::Down
            } else {
                MotionAction::PointerDown { id: down_id }
            };

            let touch_screen = &device.touch_screen;
            self.dispatch_touch(
                when,
                device.id,
                policy_flags,
                &touch_screen.current_touch,
                &touch_screen.precalculated,
                touch_screen.down_time,
                active_id_bits,
                action,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_touch(
        &self,
        when: u64,
        device_id: i32,
        policy_flags: PolicyFlags,
        touch: &TouchFrame,
        precalculated: &TouchTransform,
        down_time: u64,
        mut id_bits: BitSet32,
        action: MotionAction,
    ) {
        let (oriented_width, oriented_height) = self
            .display_orientation
            .oriented_size(self.display_width, self.display_height);

        let mut pointer_ids = [0u32; MAX_POINTERS];
        let mut pointer_coords = [PointerCoords::default(); MAX_POINTERS];
        let mut pointer_count = 0;

        // Map raw touch coordinates into display space and rotate into the
        // oriented frame, lowest id first.
        while !id_bits.is_empty() {
            let id = id_bits.first_marked_bit();
            id_bits.clear_bit(id);
            let index = touch.id_to_index[id as usize];
            let pointer = &touch.pointers[index];

            let x = (pointer.x - precalculated.x_origin) as f32 * precalculated.x_scale;
            let y = (pointer.y - precalculated.y_origin) as f32 * precalculated.y_scale;
            let pressure =
                (pointer.pressure - precalculated.pressure_origin) as f32
                    * precalculated.pressure_scale;
            let size = (pointer.size - precalculated.size_origin) as f32 * precalculated.size_scale;

            let (x, y) = self.display_orientation.transform_point(
                x,
                y,
                self.display_width as f32,
                self.display_height as f32,
            );

            pointer_ids[pointer_count] = id;
            pointer_coords[pointer_count] = PointerCoords {
                x,
                y,
                pressure,
                size,
            };
            pointer_count += 1;
        }

        // Edge flags are event-global, derived from the first pointer only,
        // and only reported on the initial down.
        let mut edge_flags = EdgeFlags::empty();
        if action == MotionAction::Down && pointer_count > 0 {
            if pointer_coords[0].x <= 0.0 {
                edge_flags |= EdgeFlags::LEFT;
            } else if pointer_coords[0].x >= oriented_width as f32 {
                edge_flags |= EdgeFlags::RIGHT;
            }
            if pointer_coords[0].y <= 0.0 {
                edge_flags |= EdgeFlags::TOP;
            } else if pointer_coords[0].y >= oriented_height as f32 {
                edge_flags |= EdgeFlags::BOTTOM;
            }
        }

        self.dispatcher.notify_motion(
            when,
            device_id,
            EventNature::Touch,
            policy_flags,
            action,
            self.meta_state,
            edge_flags,
            &pointer_ids[..pointer_count],
            &pointer_coords[..pointer_count],
            0.0,
            0.0,
            down_time,
        );
    }

    // --- Trackball ---

    fn on_trackball_changed(&self, when: u64, device: &mut InputDevice) {
        let accumulator = device.trackball.accumulator;
        let fields = accumulator.fields;

        let down_changed = fields.contains(TrackballFields::BTN_MOUSE);
        let delta_changed =
            fields.intersects(TrackballFields::REL_X | TrackballFields::REL_Y);

        let down = if down_changed {
            if accumulator.btn_mouse {
                device.trackball.current.down = true;
                device.trackball.current.down_time = when;
                true
            } else {
                device.trackball.current.down = false;
                false
            }
        } else {
            device.trackball.current.down
        };

        let actions = self
            .policy
            .intercept_trackball(when, down_changed, down, delta_changed);

        let mut policy_flags = PolicyFlags::empty();
        if !apply_policy_actions(self.dispatcher, when, actions, &mut policy_flags) {
            return; // event dropped
        }

        let action = if down_changed {
            if down {
                MotionAction::Down
            } else {
                MotionAction::Up
            }
        } else {
            MotionAction::Move
        };

        let precalculated = device.trackball.precalculated;
        let x = if fields.contains(TrackballFields::REL_X) {
            accumulator.rel_x as f32 * precalculated.x_scale
        } else {
            0.0
        };
        let y = if fields.contains(TrackballFields::REL_Y) {
            accumulator.rel_y as f32 * precalculated.y_scale
        } else {
            0.0
        };

        let (x, y) = self.display_orientation.transform_delta(x, y);

        let coords = PointerCoords {
            x,
            y,
            pressure: 1.0,
            size: 0.0,
        };

        self.dispatcher.notify_motion(
            when,
            device.id,
            EventNature::Trackball,
            policy_flags,
            action,
            self.meta_state,
            EdgeFlags::empty(),
            &[0],
            &[coords],
            precalculated.x_precision,
            precalculated.y_precision,
            device.trackball.current.down_time,
        );
    }
}

/// Apply the dispatcher-visible parts of a policy verdict and report
/// whether the event may be delivered at all.
fn apply_policy_actions(
    dispatcher: &dyn Dispatcher,
    when: u64,
    actions: PolicyActions,
    policy_flags: &mut PolicyFlags,
) -> bool {
    if actions.contains(PolicyActions::APP_SWITCH_COMING) {
        dispatcher.notify_app_switch_coming(when);
    }
    if actions.contains(PolicyActions::WOKE_HERE) {
        *policy_flags |= PolicyFlags::WOKE_HERE;
    }
    if actions.contains(PolicyActions::BRIGHT_HERE) {
        *policy_flags |= PolicyFlags::BRIGHT_HERE;
    }
    actions.contains(PolicyActions::DISPATCH)
}
