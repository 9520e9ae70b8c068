//! Policy interface: the external component consulted before anything is
//! dispatched. It owns display geometry, virtual-key layouts, device
//! exclusions, filter enablement, and per-event interception.

use bitflags::bitflags;

use crate::config::FileConfig;
use crate::orientation::Rotation;

bitflags! {
    /// Verdict bits returned by the intercept hooks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyActions: u32 {
        /// The policy recognized a global app-switch chord; the dispatcher
        /// is warned before the triggering event arrives.
        const APP_SWITCH_COMING = 0x01;
        /// Deliver the event. Without this bit the event is dropped.
        const DISPATCH = 0x02;
        const WOKE_HERE = 0x04;
        const BRIGHT_HERE = 0x08;
    }
}

bitflags! {
    /// Flags carried on dispatched events, seeded from the raw event and
    /// extended by policy actions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyFlags: u32 {
        const WOKE_HERE = 0x1000_0000;
        const BRIGHT_HERE = 0x2000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: i32,
    pub height: i32,
    pub orientation: Rotation,
}

/// A virtual key described in display coordinates; the reader inverse-maps
/// the rectangle into touch-axis space when configuring a device.
#[derive(Debug, Clone, Copy)]
pub struct VirtualKeyDefinition {
    pub scan_code: u16,
    pub center_x: i32,
    pub center_y: i32,
    pub width: i32,
    pub height: i32,
}

pub trait ReaderPolicy: Send + Sync {
    /// Current geometry and rotation of the given display, or `None` while
    /// it is unavailable (frames are dropped until it comes back).
    fn display_info(&self, display_id: i32) -> Option<DisplayInfo>;

    fn virtual_key_definitions(&self, device_name: &str) -> Vec<VirtualKeyDefinition>;

    fn excluded_device_names(&self) -> Vec<String>;

    /// Enables the bad-touch and averaging filters for touch devices.
    fn filter_touch_events(&self) -> bool;

    fn filter_jumpy_touch_events(&self) -> bool;

    /// Haptic/audible feedback hook for a virtual-key press.
    fn virtual_key_down_feedback(&self) {}

    fn intercept_key(
        &self,
        when: u64,
        device_id: i32,
        down: bool,
        key_code: i32,
        scan_code: u16,
        policy_flags: PolicyFlags,
    ) -> PolicyActions;

    fn intercept_touch(&self, when: u64) -> PolicyActions;

    fn intercept_trackball(
        &self,
        when: u64,
        down_changed: bool,
        down: bool,
        delta_changed: bool,
    ) -> PolicyActions;

    fn intercept_switch(&self, when: u64, switch_code: u16, value: i32) -> PolicyActions;
}

/// Config-file-backed policy for the replay tool: fixed display geometry,
/// fixed virtual-key layout, and dispatch-everything interception.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    pub display: Option<DisplayInfo>,
    pub filter_touch: bool,
    pub filter_jumpy: bool,
    pub excluded: Vec<String>,
    pub virtual_keys: Vec<(String, VirtualKeyDefinition)>,
}

impl StaticPolicy {
    pub fn from_config(config: &FileConfig) -> Self {
        Self {
            display: config.display.as_ref().map(|d| DisplayInfo {
                width: d.width,
                height: d.height,
                orientation: d.orientation,
            }),
            filter_touch: config.filters.touch,
            filter_jumpy: config.filters.jumpy,
            excluded: config.excluded.clone(),
            virtual_keys: config
                .virtual_keys
                .iter()
                .map(|k| {
                    (
                        k.device.clone(),
                        VirtualKeyDefinition {
                            scan_code: k.scan_code,
                            center_x: k.center_x,
                            center_y: k.center_y,
                            width: k.width,
                            height: k.height,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl ReaderPolicy for StaticPolicy {
    fn display_info(&self, _display_id: i32) -> Option<DisplayInfo> {
        self.display
    }

    fn virtual_key_definitions(&self, device_name: &str) -> Vec<VirtualKeyDefinition> {
        self.virtual_keys
            .iter()
            .filter(|(name, _)| name == device_name)
            .map(|&(_, def)| def)
            .collect()
    }

    fn excluded_device_names(&self) -> Vec<String> {
        self.excluded.clone()
    }

    fn filter_touch_events(&self) -> bool {
        self.filter_touch
    }

    fn filter_jumpy_touch_events(&self) -> bool {
        self.filter_jumpy
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
        PolicyActions::DISPATCH
    }

    fn intercept_touch(&self, _when: u64) -> PolicyActions {
        PolicyActions::DISPATCH
    }

    fn intercept_trackball(
        &self,
        _when: u64,
        _down_changed: bool,
        _down: bool,
        _delta_changed: bool,
    ) -> PolicyActions {
        PolicyActions::DISPATCH
    }

    fn intercept_switch(&self, _when: u64, _switch_code: u16, _value: i32) -> PolicyActions {
        // Switches never reach the dispatcher; there is nothing to gate.
        PolicyActions::empty()
    }
}
