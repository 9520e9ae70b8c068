//! Touch frames and the preprocessing applied to them before dispatch:
//! bad-sample rejection, jumpy-screen debouncing, position averaging, and
//! pointer-id assignment when the driver does not provide usable ids.

use crate::bits::BitSet32;
use crate::device::{TouchScreenState, VirtualKey};

pub const MAX_POINTERS: usize = 10;
/// Pointer ids must fit in a [`BitSet32`], which also keeps the dense
/// id-to-index tables small.
pub const MAX_POINTER_ID: u32 = 31;

pub const AVERAGING_HISTORY_SIZE: usize = 5;

/// Frames dropped while debouncing a pointer-count transition on a jumpy
/// panel before the new count is believed.
const JUMPY_TRANSITION_DROPS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchPointer {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub pressure: i32,
    pub size: i32,
}

/// The committed pointer set for one sync interval.
///
/// Invariant: `id_bits` is exactly the set of ids carried by the first
/// `pointer_count` slots, and `id_to_index[id]` names the slot holding `id`
/// for every id in `id_bits`.
#[derive(Debug, Clone, Copy)]
pub struct TouchFrame {
    pub pointers: [TouchPointer; MAX_POINTERS],
    pub pointer_count: usize,
    pub id_bits: BitSet32,
    pub id_to_index: [usize; MAX_POINTER_ID as usize + 1],
}

impl Default for TouchFrame {
    fn default() -> Self {
        Self {
            pointers: [TouchPointer::default(); MAX_POINTERS],
            pointer_count: 0,
            id_bits: BitSet32::default(),
            id_to_index: [0; MAX_POINTER_ID as usize + 1],
        }
    }
}

impl TouchFrame {
    pub fn clear(&mut self) {
        self.pointer_count = 0;
        self.id_bits.clear();
    }

    pub fn copy_from(&mut self, other: &TouchFrame) {
        *self = *other;
    }

    /// Append a pointer and keep `id_bits`/`id_to_index` in sync. The caller
    /// guarantees capacity and id range.
    pub fn push_pointer(&mut self, pointer: TouchPointer) {
        let index = self.pointer_count;
        self.pointers[index] = pointer;
        self.id_to_index[pointer.id as usize] = index;
        self.id_bits.mark_bit(pointer.id);
        self.pointer_count = index + 1;
    }
}

/// Short per-pointer position history backing the averaging filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointerHistory {
    len: usize,
    next: usize,
    samples: [(i32, i32, i32); AVERAGING_HISTORY_SIZE],
}

impl PointerHistory {
    /// Restart the history at a single sample (pointer just went down).
    pub fn reset(&mut self, x: i32, y: i32, pressure: i32) {
        self.samples[0] = (x, y, pressure);
        self.len = 1;
        self.next = 1 % AVERAGING_HISTORY_SIZE;
    }

    pub fn push(&mut self, x: i32, y: i32, pressure: i32) {
        self.samples[self.next] = (x, y, pressure);
        self.next = (self.next + 1) % AVERAGING_HISTORY_SIZE;
        if self.len < AVERAGING_HISTORY_SIZE {
            self.len += 1;
        }
    }

    /// Pressure-weighted mean position over the window; plain mean when all
    /// recorded pressures are zero.
    pub fn average(&self) -> (i32, i32) {
        let mut sum_x: i64 = 0;
        let mut sum_y: i64 = 0;
        let mut sum_wx: i64 = 0;
        let mut sum_wy: i64 = 0;
        let mut total_weight: i64 = 0;
        for &(x, y, pressure) in &self.samples[..self.len] {
            sum_x += x as i64;
            sum_y += y as i64;
            sum_wx += x as i64 * pressure as i64;
            sum_wy += y as i64 * pressure as i64;
            total_weight += pressure as i64;
        }
        if total_weight > 0 {
            ((sum_wx / total_weight) as i32, (sum_wy / total_weight) as i32)
        } else if self.len > 0 {
            (
                (sum_x / self.len as i64) as i32,
                (sum_y / self.len as i64) as i32,
            )
        } else {
            (0, 0)
        }
    }
}

impl TouchScreenState {
    /// Reject implausible samples. Some panels occasionally report a single
    /// sample far away from the actual contact; when a pointer appears to
    /// travel more than 7/16 of the Y-axis range within one frame, keep its
    /// previous position instead. Returns true if anything was rewritten, in
    /// which case driver-provided ids are no longer trustworthy.
    pub fn apply_bad_touch_filter(&mut self) -> bool {
        if !self.parameters.y_axis.valid {
            return false;
        }

        let pointer_count = self.current_touch.pointer_count;
        if pointer_count == 0 || pointer_count != self.last_touch.pointer_count {
            return false;
        }

        let max_delta_y = self.parameters.y_axis.range * 7 / 16;
        if max_delta_y <= 0 {
            return false;
        }

        let mut filtered = false;
        for i in 0..pointer_count {
            let dy = self.current_touch.pointers[i].y - self.last_touch.pointers[i].y;
            if dy.abs() > max_delta_y {
                log::debug!(
                    "Bad touch filter: pointer slot {} jumped {} on y, suppressing sample",
                    i,
                    dy
                );
                self.current_touch.pointers[i].x = self.last_touch.pointers[i].x;
                self.current_touch.pointers[i].y = self.last_touch.pointers[i].y;
                filtered = true;
            }
        }
        filtered
    }

    /// Debounce jumpy panels that flicker between pointer counts and emit
    /// single-frame position spikes. Only engages for small pointer counts.
    /// Returns true if the frame was rewritten.
    pub fn apply_jumpy_touch_filter(&mut self) -> bool {
        if !self.parameters.y_axis.valid {
            return false;
        }

        let current_count = self.current_touch.pointer_count;
        let last_count = self.last_touch.pointer_count;

        if current_count != last_count {
            if current_count <= 2
                && last_count <= 2
                && self.jumpy.transition_drops < JUMPY_TRANSITION_DROPS
            {
                // Hold the previous frame until the new count persists.
                self.jumpy.transition_drops += 1;
                let last = self.last_touch;
                self.current_touch.copy_from(&last);
                return true;
            }
            self.jumpy.transition_drops = 0;
            return false;
        }
        self.jumpy.transition_drops = 0;

        if current_count == 0 || current_count > 2 {
            return false;
        }

        // A quarter of the Y range in one frame is a spike, not a swipe.
        let jump_threshold = self.parameters.y_axis.range / 4;
        if jump_threshold <= 0 {
            return false;
        }

        let mut filtered = false;
        for i in 0..current_count {
            let dx = self.current_touch.pointers[i].x - self.last_touch.pointers[i].x;
            let dy = self.current_touch.pointers[i].y - self.last_touch.pointers[i].y;
            if dx.abs() > jump_threshold || dy.abs() > jump_threshold {
                log::debug!("Jumpy touch filter: suppressing spike on pointer slot {}", i);
                self.current_touch.pointers[i].x = self.last_touch.pointers[i].x;
                self.current_touch.pointers[i].y = self.last_touch.pointers[i].y;
                filtered = true;
            }
        }
        filtered
    }

    /// Smooth pointer positions with a pressure-weighted mean over a short
    /// window. Continuing pointers extend their history; pointers that just
    /// went down restart it, so a reused id never inherits stale samples.
    pub fn apply_averaging_touch_filter(&mut self) {
        for i in 0..self.current_touch.pointer_count {
            let pointer = self.current_touch.pointers[i];
            let history = &mut self.averaging.histories[pointer.id as usize];

            if !self.last_touch.id_bits.has_bit(pointer.id) {
                history.reset(pointer.x, pointer.y, pointer.pressure);
                continue;
            }

            history.push(pointer.x, pointer.y, pointer.pressure);
            let (x, y) = history.average();
            self.current_touch.pointers[i].x = x;
            self.current_touch.pointers[i].y = y;
        }
    }

    /// Assign pointer ids so contacts keep their identity across frames:
    /// greedy nearest-neighbor matching against the last frame, with fresh
    /// ids (lowest unused first) for unmatched pointers.
    pub fn calculate_pointer_ids(&mut self) {
        let current_count = self.current_touch.pointer_count;
        let last_count = self.last_touch.pointer_count;

        self.current_touch.id_bits.clear();
        if current_count == 0 {
            return;
        }

        if last_count == 0 {
            for i in 0..current_count {
                let id = i as u32;
                self.current_touch.pointers[i].id = id;
                self.current_touch.id_to_index[i] = i;
                self.current_touch.id_bits.mark_bit(id);
            }
            return;
        }

        // Squared distances for every (current, last) pair; ties break on
        // slot order so the result is deterministic.
        let mut pairs: Vec<(u64, usize, usize)> = Vec::with_capacity(current_count * last_count);
        for c in 0..current_count {
            for l in 0..last_count {
                let dx = (self.current_touch.pointers[c].x - self.last_touch.pointers[l].x) as i64;
                let dy = (self.current_touch.pointers[c].y - self.last_touch.pointers[l].y) as i64;
                pairs.push(((dx * dx + dy * dy) as u64, c, l));
            }
        }
        pairs.sort_unstable();

        let mut current_matched = [false; MAX_POINTERS];
        let mut last_matched = [false; MAX_POINTERS];
        for &(_, c, l) in &pairs {
            if current_matched[c] || last_matched[l] {
                continue;
            }
            current_matched[c] = true;
            last_matched[l] = true;

            let id = self.last_touch.pointers[l].id;
            self.current_touch.pointers[c].id = id;
            self.current_touch.id_to_index[id as usize] = c;
            self.current_touch.id_bits.mark_bit(id);
        }

        // Unmatched pointers are new contacts: draw ids from the complement
        // of the last frame's set, lowest first.
        let mut used = self.last_touch.id_bits;
        for c in 0..current_count {
            if current_matched[c] {
                continue;
            }
            let id = used.first_unmarked_bit();
            used.mark_bit(id);
            self.current_touch.pointers[c].id = id;
            self.current_touch.id_to_index[id as usize] = c;
            self.current_touch.id_bits.mark_bit(id);
        }
    }

    /// Hit-test the first current pointer against the virtual-key list, in
    /// raw touch coordinates.
    pub fn find_virtual_key_hit(&self) -> Option<&VirtualKey> {
        if self.current_touch.pointer_count == 0 {
            return None;
        }
        let x = self.current_touch.pointers[0].x;
        let y = self.current_touch.pointers[0].y;
        self.virtual_keys.iter().find(|key| key.is_hit(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AxisInfo;

    fn frame(points: &[(u32, i32, i32)]) -> TouchFrame {
        let mut frame = TouchFrame::default();
        for &(id, x, y) in points {
            frame.push_pointer(TouchPointer {
                id,
                x,
                y,
                pressure: 1,
                size: 1,
            });
        }
        frame
    }

    fn frame_invariant_holds(frame: &TouchFrame) -> bool {
        if frame.pointer_count != frame.id_bits.count() as usize {
            return false;
        }
        let mut bits = frame.id_bits;
        while !bits.is_empty() {
            let id = bits.first_marked_bit();
            bits.clear_bit(id);
            let index = frame.id_to_index[id as usize];
            if index >= frame.pointer_count || frame.pointers[index].id != id {
                return false;
            }
        }
        true
    }

    fn touch_state() -> TouchScreenState {
        let mut state = TouchScreenState::default();
        state.parameters.y_axis = AxisInfo {
            valid: true,
            min: 0,
            max: 1023,
            range: 1023,
            flat: 0,
            fuzz: 0,
        };
        state
    }

    #[test]
    fn stationary_pointers_keep_their_ids() {
        let mut state = touch_state();
        state.last_touch = frame(&[(0, 100, 100), (1, 500, 500)]);
        // Slots arrive in the opposite order this frame.
        state.current_touch = frame(&[(9, 498, 502), (9, 101, 99)]);

        state.calculate_pointer_ids();

        assert!(frame_invariant_holds(&state.current_touch));
        assert_eq!(state.current_touch.pointers[0].id, 1);
        assert_eq!(state.current_touch.pointers[1].id, 0);
    }

    #[test]
    fn new_pointer_gets_lowest_free_id() {
        let mut state = touch_state();
        state.last_touch = frame(&[(0, 100, 100)]);
        state.current_touch = frame(&[(9, 100, 100), (9, 900, 900)]);

        state.calculate_pointer_ids();

        assert!(frame_invariant_holds(&state.current_touch));
        assert_eq!(state.current_touch.pointers[0].id, 0);
        assert_eq!(state.current_touch.pointers[1].id, 1);
    }

    #[test]
    fn first_frame_assigns_sequential_ids() {
        let mut state = touch_state();
        state.current_touch = frame(&[(9, 10, 10), (9, 20, 20), (9, 30, 30)]);

        state.calculate_pointer_ids();

        assert!(frame_invariant_holds(&state.current_touch));
        assert_eq!(state.current_touch.id_bits.value, 0b111);
    }

    #[test]
    fn bad_touch_filter_suppresses_y_spike() {
        let mut state = touch_state();
        state.last_touch = frame(&[(0, 100, 100)]);
        state.current_touch = frame(&[(0, 110, 900)]);

        assert!(state.apply_bad_touch_filter());
        assert_eq!(state.current_touch.pointers[0].y, 100);
        assert_eq!(state.current_touch.pointers[0].x, 100);
    }

    #[test]
    fn bad_touch_filter_passes_normal_motion() {
        let mut state = touch_state();
        state.last_touch = frame(&[(0, 100, 100)]);
        state.current_touch = frame(&[(0, 120, 140)]);

        assert!(!state.apply_bad_touch_filter());
        assert_eq!(state.current_touch.pointers[0].y, 140);
    }

    #[test]
    fn jumpy_filter_debounces_count_transitions() {
        let mut state = touch_state();
        state.last_touch = frame(&[(0, 100, 100)]);
        state.current_touch = frame(&[(0, 100, 100), (1, 500, 500)]);

        // Transition frames are held back until the new count persists.
        let mut dropped = 0;
        loop {
            state.current_touch = frame(&[(0, 100, 100), (1, 500, 500)]);
            if !state.apply_jumpy_touch_filter() {
                break;
            }
            assert_eq!(state.current_touch.pointer_count, 1);
            dropped += 1;
            assert!(dropped <= JUMPY_TRANSITION_DROPS);
        }
        assert_eq!(dropped, JUMPY_TRANSITION_DROPS);
        assert_eq!(state.current_touch.pointer_count, 2);
    }

    #[test]
    fn averaging_smooths_continuing_pointers() {
        let mut state = touch_state();
        // Pointer goes down: history restarts, position untouched.
        state.current_touch = frame(&[(0, 100, 100)]);
        state.apply_averaging_touch_filter();
        assert_eq!(state.current_touch.pointers[0].x, 100);

        // Pointer continues: the sample joins the single-entry history and
        // the result is the two-sample mean.
        state.last_touch = state.current_touch;
        state.current_touch = frame(&[(0, 200, 100)]);
        state.apply_averaging_touch_filter();

        assert_eq!(state.current_touch.pointers[0].x, 150);
        assert_eq!(state.current_touch.pointers[0].y, 100);
    }

    #[test]
    fn virtual_key_hit_test() {
        let mut state = touch_state();
        state.virtual_keys.push(VirtualKey {
            scan_code: 158,
            key_code: 4,
            flags: 0,
            hit_left: 50,
            hit_right: 150,
            hit_top: 50,
            hit_bottom: 150,
        });

        state.current_touch = frame(&[(0, 100, 100)]);
        assert!(state.find_virtual_key_hit().is_some());

        state.current_touch = frame(&[(0, 500, 500)]);
        assert!(state.find_virtual_key_hit().is_none());

        state.current_touch.clear();
        assert!(state.find_virtual_key_hit().is_none());
    }
}
