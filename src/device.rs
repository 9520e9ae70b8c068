//! Per-device state: class bitmask, axis metadata, sticky accumulators for
//! every component, and the ordered device registry.
//!
//! Accumulators carry a `fields` bitmask telling which members were written
//! since the last sync; members not named by `fields` keep their previous
//! value. This is what makes partial driver updates work: a frame that only
//! reports a new X still has the old Y available when it is committed.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::keys::MetaState;
use crate::touch::{PointerHistory, TouchFrame, MAX_POINTERS, MAX_POINTER_ID};

bitflags! {
    /// What kind of input a device provides, as reported by the event hub.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceClasses: u32 {
        const KEYBOARD = 0x01;
        /// Keyboard with a full alphabetic layout.
        const ALPHAKEY = 0x02;
        const TOUCHSCREEN = 0x04;
        const TRACKBALL = 0x08;
        const DPAD = 0x10;
        /// Touchscreen with a multi-touch driver protocol.
        const TOUCHSCREEN_MT = 0x20;
    }
}

impl DeviceClasses {
    pub fn is_keyboard(self) -> bool {
        self.contains(DeviceClasses::KEYBOARD)
    }

    pub fn is_trackball(self) -> bool {
        self.contains(DeviceClasses::TRACKBALL)
    }

    pub fn is_multi_touch_screen(self) -> bool {
        self.contains(DeviceClasses::TOUCHSCREEN_MT)
    }

    pub fn is_single_touch_screen(self) -> bool {
        self.contains(DeviceClasses::TOUCHSCREEN) && !self.contains(DeviceClasses::TOUCHSCREEN_MT)
    }

    pub fn is_touch_screen(self) -> bool {
        self.intersects(DeviceClasses::TOUCHSCREEN | DeviceClasses::TOUCHSCREEN_MT)
    }
}

/// Range metadata for one absolute axis, derived from the hub's raw info.
/// An axis with unknown or zero range is marked invalid and the pipeline
/// falls back to identity scaling for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxisInfo {
    pub valid: bool,
    pub min: i32,
    pub max: i32,
    pub range: i32,
    pub flat: i32,
    pub fuzz: i32,
}

// --- Keyboard ---

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyboardCurrent {
    pub meta_state: MetaState,
    pub down_time: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyboardState {
    pub current: KeyboardCurrent,
}

// --- Trackball ---

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackballFields: u32 {
        const BTN_MOUSE = 0x01;
        const REL_X = 0x02;
        const REL_Y = 0x04;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackballAccumulator {
    pub fields: TrackballFields,
    pub btn_mouse: bool,
    pub rel_x: i32,
    pub rel_y: i32,
}

impl TrackballAccumulator {
    pub fn is_dirty(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackballCurrent {
    pub down: bool,
    pub down_time: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackballPrecalculated {
    pub x_scale: f32,
    pub y_scale: f32,
    pub x_precision: f32,
    pub y_precision: f32,
}

impl Default for TrackballPrecalculated {
    fn default() -> Self {
        Self {
            x_scale: 1.0,
            y_scale: 1.0,
            x_precision: 1.0,
            y_precision: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackballState {
    pub accumulator: TrackballAccumulator,
    pub current: TrackballCurrent,
    pub precalculated: TrackballPrecalculated,
}

// --- Single-touch screen ---

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SingleTouchFields: u32 {
        const BTN_TOUCH = 0x01;
        const ABS_X = 0x02;
        const ABS_Y = 0x04;
        const ABS_PRESSURE = 0x08;
        const ABS_TOOL_WIDTH = 0x10;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTouchAccumulator {
    pub fields: SingleTouchFields,
    pub btn_touch: bool,
    pub abs_x: i32,
    pub abs_y: i32,
    pub abs_pressure: i32,
    pub abs_tool_width: i32,
}

impl SingleTouchAccumulator {
    pub fn is_dirty(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Committed single-touch state. Sticky: fields absent from a frame keep
/// their last committed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTouchCurrent {
    pub down: bool,
    pub x: i32,
    pub y: i32,
    pub pressure: i32,
    pub size: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTouchState {
    pub accumulator: SingleTouchAccumulator,
    pub current: SingleTouchCurrent,
}

// --- Multi-touch screen ---

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MtPointerFields: u32 {
        const ABS_MT_POSITION_X = 0x01;
        const ABS_MT_POSITION_Y = 0x02;
        const ABS_MT_TOUCH_MAJOR = 0x04;
        const ABS_MT_WIDTH_MAJOR = 0x08;
        const ABS_MT_TRACKING_ID = 0x10;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MtPointer {
    pub fields: MtPointerFields,
    pub abs_mt_position_x: i32,
    pub abs_mt_position_y: i32,
    pub abs_mt_touch_major: i32,
    pub abs_mt_width_major: i32,
    pub abs_mt_tracking_id: i32,
}

impl MtPointer {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Multi-touch accumulator. `pointer_count` is advanced by per-pointer sync
/// markers; absolute-motion events always write into the slot at
/// `pointer_count`. One spare slot past `MAX_POINTERS` absorbs writes from
/// an overflowing frame so the excess pointer can be dropped cleanly.
#[derive(Debug, Clone, Copy)]
pub struct MultiTouchAccumulator {
    pub pointer_count: usize,
    pub pointers: [MtPointer; MAX_POINTERS + 1],
}

impl Default for MultiTouchAccumulator {
    fn default() -> Self {
        Self {
            pointer_count: 0,
            pointers: [MtPointer::default(); MAX_POINTERS + 1],
        }
    }
}

impl MultiTouchAccumulator {
    pub fn is_dirty(&self) -> bool {
        self.pointer_count != 0 || !self.pointers[0].fields.is_empty()
    }

    /// Rewind for the next frame. Slots past the first are cleared lazily as
    /// per-pointer sync markers advance into them.
    pub fn clear(&mut self) {
        self.pointer_count = 0;
        self.pointers[0].clear();
    }

    pub fn clear_all(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MultiTouchState {
    pub accumulator: MultiTouchAccumulator,
}

// --- Touch screen (shared between single- and multi-touch) ---

#[derive(Debug, Clone, Copy, Default)]
pub struct TouchParams {
    pub use_bad_touch_filter: bool,
    pub use_jumpy_touch_filter: bool,
    pub use_averaging_touch_filter: bool,
    pub x_axis: AxisInfo,
    pub y_axis: AxisInfo,
    pub pressure_axis: AxisInfo,
    pub size_axis: AxisInfo,
}

/// Origin/scale pairs mapping raw axis values into display space, derived
/// once at configuration time.
#[derive(Debug, Clone, Copy)]
pub struct TouchTransform {
    pub x_origin: i32,
    pub x_scale: f32,
    pub y_origin: i32,
    pub y_scale: f32,
    pub pressure_origin: i32,
    pub pressure_scale: f32,
    pub size_origin: i32,
    pub size_scale: f32,
}

impl Default for TouchTransform {
    fn default() -> Self {
        Self {
            x_origin: 0,
            x_scale: 1.0,
            y_origin: 0,
            y_scale: 1.0,
            pressure_origin: 0,
            pressure_scale: 1.0,
            size_origin: 0,
            size_scale: 1.0,
        }
    }
}

/// A touch region that acts as a hardware key. The hit rectangle is in raw
/// touch-axis coordinates, precomputed from the policy's display-space key
/// definition.
#[derive(Debug, Clone, Copy)]
pub struct VirtualKey {
    pub scan_code: u16,
    pub key_code: i32,
    pub flags: u32,
    pub hit_left: i32,
    pub hit_right: i32,
    pub hit_top: i32,
    pub hit_bottom: i32,
}

impl VirtualKey {
    pub fn is_hit(&self, x: i32, y: i32) -> bool {
        x >= self.hit_left && x <= self.hit_right && y >= self.hit_top && y <= self.hit_bottom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtualKeyStatus {
    #[default]
    None,
    Down,
    Canceled,
    Up,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentVirtualKey {
    pub status: VirtualKeyStatus,
    pub key_code: i32,
    pub scan_code: u16,
    pub down_time: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JumpyFilterState {
    pub transition_drops: u32,
}

#[derive(Debug, Clone)]
pub struct AveragingState {
    pub histories: [PointerHistory; MAX_POINTER_ID as usize + 1],
}

impl Default for AveragingState {
    fn default() -> Self {
        Self {
            histories: [PointerHistory::default(); MAX_POINTER_ID as usize + 1],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TouchScreenState {
    pub parameters: TouchParams,
    pub precalculated: TouchTransform,
    pub virtual_keys: Vec<VirtualKey>,
    pub current_touch: TouchFrame,
    pub last_touch: TouchFrame,
    pub down_time: u64,
    pub current_virtual_key: CurrentVirtualKey,
    pub averaging: AveragingState,
    pub jumpy: JumpyFilterState,
}

// --- Device record ---

/// Everything the reader tracks for one device. Created on device-added,
/// mutated only by the reader thread, destroyed on device-removed.
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub id: i32,
    pub name: String,
    pub classes: DeviceClasses,
    pub ignored: bool,
    pub keyboard: KeyboardState,
    pub trackball: TrackballState,
    pub single_touch: SingleTouchState,
    pub multi_touch: MultiTouchState,
    pub touch_screen: TouchScreenState,
}

impl InputDevice {
    pub fn new(id: i32, classes: DeviceClasses, name: String) -> Self {
        Self {
            id,
            name,
            classes,
            ignored: false,
            keyboard: KeyboardState::default(),
            trackball: TrackballState::default(),
            single_touch: SingleTouchState::default(),
            multi_touch: MultiTouchState::default(),
            touch_screen: TouchScreenState::default(),
        }
    }

    /// Drop all transient state (accumulators, committed positions, filter
    /// history, virtual-key progress). Configuration-derived state —
    /// parameters, precalculated transforms, virtual-key rectangles — is
    /// kept.
    pub fn reset(&mut self) {
        self.keyboard.current = KeyboardCurrent::default();

        self.trackball.accumulator.clear();
        self.trackball.current = TrackballCurrent::default();

        self.single_touch.accumulator.clear();
        self.single_touch.current = SingleTouchCurrent::default();

        self.multi_touch.accumulator.clear_all();

        self.touch_screen.current_touch.clear();
        self.touch_screen.last_touch.clear();
        self.touch_screen.down_time = 0;
        self.touch_screen.current_virtual_key = CurrentVirtualKey::default();
        self.touch_screen.averaging = AveragingState::default();
        self.touch_screen.jumpy = JumpyFilterState::default();
    }
}

/// Devices keyed by id, iterated in id order so aggregate queries (global
/// meta state, exported configuration) are deterministic.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<i32, InputDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn get(&self, id: i32) -> Option<&InputDevice> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut InputDevice> {
        self.devices.get_mut(&id)
    }

    pub fn insert(&mut self, device: InputDevice) {
        self.devices.insert(device.id, device);
    }

    pub fn remove(&mut self, id: i32) -> Option<InputDevice> {
        self.devices.remove(&id)
    }

    pub fn values(&self) -> impl Iterator<Item = &InputDevice> {
        self.devices.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut InputDevice> {
        self.devices.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_predicates() {
        let single = DeviceClasses::TOUCHSCREEN;
        assert!(single.is_single_touch_screen());
        assert!(single.is_touch_screen());
        assert!(!single.is_multi_touch_screen());

        let multi = DeviceClasses::TOUCHSCREEN | DeviceClasses::TOUCHSCREEN_MT;
        assert!(multi.is_multi_touch_screen());
        assert!(!multi.is_single_touch_screen());
    }

    #[test]
    fn mt_accumulator_dirtiness() {
        let mut acc = MultiTouchAccumulator::default();
        assert!(!acc.is_dirty());

        acc.pointers[0].fields |= MtPointerFields::ABS_MT_POSITION_X;
        assert!(acc.is_dirty());

        acc.clear();
        assert!(!acc.is_dirty());
    }

    #[test]
    fn reset_keeps_configuration() {
        let mut device = InputDevice::new(
            1,
            DeviceClasses::TOUCHSCREEN,
            "panel".into(),
        );
        device.touch_screen.precalculated.x_scale = 2.0;
        device.touch_screen.current_touch.pointer_count = 1;
        device.single_touch.current.down = true;

        device.reset();

        assert_eq!(device.touch_screen.precalculated.x_scale, 2.0);
        assert_eq!(device.touch_screen.current_touch.pointer_count, 0);
        assert!(!device.single_touch.current.down);
    }

    #[test]
    fn registry_iterates_in_id_order() {
        let mut registry = DeviceRegistry::new();
        registry.insert(InputDevice::new(7, DeviceClasses::KEYBOARD, "b".into()));
        registry.insert(InputDevice::new(2, DeviceClasses::KEYBOARD, "a".into()));

        let ids: Vec<i32> = registry.values().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 7]);
    }
}
