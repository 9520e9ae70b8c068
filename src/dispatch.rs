//! Normalized-event vocabulary and the dispatcher interface the reader
//! feeds: key events, motion events, configuration changes.

use bitflags::bitflags;

use crate::keys::MetaState;
use crate::policy::PolicyFlags;

/// Which pipeline produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventNature {
    Key,
    Touch,
    Trackball,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        const WOKE_HERE = 0x01;
        const FROM_SYSTEM = 0x08;
        /// The up event ends the gesture without acting on the key.
        const CANCELED = 0x20;
        /// Synthesized from a touch on a virtual-key region.
        const VIRTUAL_HARD_KEY = 0x40;
    }
}

/// Motion action. Pointer transitions name the id that went up or down;
/// the remaining pointers ride along in the event's pointer array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down,
    Up,
    Move,
    PointerDown { id: u32 },
    PointerUp { id: u32 },
}

bitflags! {
    /// Set on DOWN when the first pointer lands at or past the oriented
    /// display bounds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EdgeFlags: u32 {
        const TOP = 0x01;
        const BOTTOM = 0x02;
        const LEFT = 0x04;
        const RIGHT = 0x08;
    }
}

/// One pointer's position in oriented display space.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
}

/// Downstream consumer of normalized events. Implementations must be safe
/// to call from the reader thread while query threads hold their own state.
pub trait Dispatcher: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn notify_key(
        &self,
        when: u64,
        device_id: i32,
        nature: EventNature,
        policy_flags: PolicyFlags,
        action: KeyAction,
        flags: KeyFlags,
        key_code: i32,
        scan_code: u16,
        meta_state: MetaState,
        down_time: u64,
    );

    #[allow(clippy::too_many_arguments)]
    fn notify_motion(
        &self,
        when: u64,
        device_id: i32,
        nature: EventNature,
        policy_flags: PolicyFlags,
        action: MotionAction,
        meta_state: MetaState,
        edge_flags: EdgeFlags,
        pointer_ids: &[u32],
        pointer_coords: &[PointerCoords],
        x_precision: f32,
        y_precision: f32,
        down_time: u64,
    );

    fn notify_configuration_changed(&self, when: u64);

    fn notify_app_switch_coming(&self, when: u64);
}

/// Prints every notification to stdout; the `replay` subcommand's sink.
#[derive(Debug, Default)]
pub struct ConsoleDispatcher;

impl Dispatcher for ConsoleDispatcher {
    fn notify_key(
        &self,
        when: u64,
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
        println!(
            "[{:>12}] device {} key {:?} keyCode={} scanCode={} meta={:?} flags={:?}",
            when, device_id, action, key_code, scan_code, meta_state, flags
        );
    }

    fn notify_motion(
        &self,
        when: u64,
        device_id: i32,
        nature: EventNature,
        _policy_flags: PolicyFlags,
        action: MotionAction,
        _meta_state: MetaState,
        edge_flags: EdgeFlags,
        pointer_ids: &[u32],
        pointer_coords: &[PointerCoords],
        _x_precision: f32,
        _y_precision: f32,
        _down_time: u64,
    ) {
        let points: Vec<String> = pointer_ids
            .iter()
            .zip(pointer_coords)
            .map(|(id, c)| format!("{}:({:.1},{:.1},p={:.2})", id, c.x, c.y, c.pressure))
            .collect();
        println!(
            "[{:>12}] device {} {:?} motion {:?} edges={:?} pointers=[{}]",
            when,
            device_id,
            nature,
            action,
            edge_flags,
            points.join(" ")
        );
    }

    fn notify_configuration_changed(&self, when: u64) {
        println!("[{:>12}] configuration changed", when);
    }

    fn notify_app_switch_coming(&self, when: u64) {
        println!("[{:>12}] app switch coming", when);
    }
}
