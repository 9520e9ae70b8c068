//! Key codes, modifier (meta) state, and orientation-aware key rotation.

use bitflags::bitflags;

use crate::orientation::Rotation;

pub const KEYCODE_HOME: i32 = 3;
pub const KEYCODE_BACK: i32 = 4;
pub const KEYCODE_DPAD_UP: i32 = 19;
pub const KEYCODE_DPAD_DOWN: i32 = 20;
pub const KEYCODE_DPAD_LEFT: i32 = 21;
pub const KEYCODE_DPAD_RIGHT: i32 = 22;
pub const KEYCODE_ALT_LEFT: i32 = 57;
pub const KEYCODE_ALT_RIGHT: i32 = 58;
pub const KEYCODE_SHIFT_LEFT: i32 = 59;
pub const KEYCODE_SHIFT_RIGHT: i32 = 60;
pub const KEYCODE_SYM: i32 = 63;
pub const KEYCODE_MENU: i32 = 82;

bitflags! {
    /// Bitmask of held modifier keys carried on every dispatched event.
    ///
    /// The combined `ALT_ON`/`SHIFT_ON` bits are derived: they are set
    /// exactly when the corresponding left or right bit is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaState: u32 {
        const SHIFT_ON = 0x01;
        const ALT_ON = 0x02;
        const SYM_ON = 0x04;
        const ALT_LEFT_ON = 0x10;
        const ALT_RIGHT_ON = 0x20;
        const SHIFT_LEFT_ON = 0x40;
        const SHIFT_RIGHT_ON = 0x80;
    }
}

/// Result of a hub key-state or switch-state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Unknown,
    Up,
    Down,
    /// The key is synthesized from a touch on a virtual-key region.
    Virtual,
}

/// Fold one key press or release into the meta-state bitmask.
pub fn update_meta_state(key_code: i32, down: bool, old: MetaState) -> MetaState {
    let mask = match key_code {
        KEYCODE_ALT_LEFT => MetaState::ALT_LEFT_ON,
        KEYCODE_ALT_RIGHT => MetaState::ALT_RIGHT_ON,
        KEYCODE_SHIFT_LEFT => MetaState::SHIFT_LEFT_ON,
        KEYCODE_SHIFT_RIGHT => MetaState::SHIFT_RIGHT_ON,
        KEYCODE_SYM => MetaState::SYM_ON,
        _ => return old,
    };

    let mut new = if down {
        old | mask
    } else {
        old & !mask & !(MetaState::ALT_ON | MetaState::SHIFT_ON)
    };

    if new.intersects(MetaState::ALT_LEFT_ON | MetaState::ALT_RIGHT_ON) {
        new |= MetaState::ALT_ON;
    }
    if new.intersects(MetaState::SHIFT_LEFT_ON | MetaState::SHIFT_RIGHT_ON) {
        new |= MetaState::SHIFT_ON;
    }

    new
}

// DPAD key codes enumerated counter-clockwise with the unrotated key first.
const KEY_CODE_ROTATION_MAP: [[i32; 4]; 4] = [
    [KEYCODE_DPAD_DOWN, KEYCODE_DPAD_RIGHT, KEYCODE_DPAD_UP, KEYCODE_DPAD_LEFT],
    [KEYCODE_DPAD_RIGHT, KEYCODE_DPAD_UP, KEYCODE_DPAD_LEFT, KEYCODE_DPAD_DOWN],
    [KEYCODE_DPAD_UP, KEYCODE_DPAD_LEFT, KEYCODE_DPAD_DOWN, KEYCODE_DPAD_RIGHT],
    [KEYCODE_DPAD_LEFT, KEYCODE_DPAD_DOWN, KEYCODE_DPAD_RIGHT, KEYCODE_DPAD_UP],
];

/// Remap a DPAD key code so that "down" on the device means "down" on the
/// rotated display. Non-DPAD codes pass through untouched.
pub fn rotate_key_code(key_code: i32, orientation: Rotation) -> i32 {
    if orientation == Rotation::Rot0 {
        return key_code;
    }
    for row in &KEY_CODE_ROTATION_MAP {
        if row[0] == key_code {
            return row[orientation.index()];
        }
    }
    key_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_and_right_imply_combined() {
        let meta = update_meta_state(KEYCODE_SHIFT_LEFT, true, MetaState::default());
        assert!(meta.contains(MetaState::SHIFT_LEFT_ON | MetaState::SHIFT_ON));

        let meta = update_meta_state(KEYCODE_ALT_RIGHT, true, meta);
        assert!(meta.contains(MetaState::ALT_RIGHT_ON | MetaState::ALT_ON));
    }

    #[test]
    fn releasing_last_modifier_clears_combined_bit() {
        let mut meta = update_meta_state(KEYCODE_SHIFT_LEFT, true, MetaState::default());
        meta = update_meta_state(KEYCODE_SHIFT_RIGHT, true, meta);
        meta = update_meta_state(KEYCODE_SHIFT_LEFT, false, meta);
        assert!(meta.contains(MetaState::SHIFT_ON));

        meta = update_meta_state(KEYCODE_SHIFT_RIGHT, false, meta);
        assert!(!meta.contains(MetaState::SHIFT_ON));
        assert!(meta.is_empty());
    }

    #[test]
    fn non_modifier_keys_leave_meta_untouched() {
        let meta = update_meta_state(KEYCODE_HOME, true, MetaState::SYM_ON);
        assert_eq!(meta, MetaState::SYM_ON);
    }

    #[test]
    fn dpad_rotation_cycles_counter_clockwise() {
        assert_eq!(rotate_key_code(KEYCODE_DPAD_DOWN, Rotation::Rot0), KEYCODE_DPAD_DOWN);
        assert_eq!(rotate_key_code(KEYCODE_DPAD_DOWN, Rotation::Rot90), KEYCODE_DPAD_RIGHT);
        assert_eq!(rotate_key_code(KEYCODE_DPAD_DOWN, Rotation::Rot180), KEYCODE_DPAD_UP);
        assert_eq!(rotate_key_code(KEYCODE_DPAD_DOWN, Rotation::Rot270), KEYCODE_DPAD_LEFT);
        assert_eq!(rotate_key_code(KEYCODE_DPAD_LEFT, Rotation::Rot90), KEYCODE_DPAD_DOWN);
    }

    #[test]
    fn non_dpad_keys_do_not_rotate() {
        assert_eq!(rotate_key_code(KEYCODE_HOME, Rotation::Rot90), KEYCODE_HOME);
    }
}
