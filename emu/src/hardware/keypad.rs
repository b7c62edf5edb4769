//! Keypad registers and the KEYCNT interrupt condition.
//!
//! KEYINPUT is active low: a held key reads as 0. Host key transitions
//! arrive through [`Keypad::set_key`]; the bus re-evaluates the KEYCNT
//! condition on every transition and raises the keypad IRQ when it holds.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// The ten pad inputs. The discriminant is the key's bit position in
/// KEYINPUT and KEYCNT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    A,
    B,
    Select,
    Start,
    Right,
    Left,
    Up,
    Down,
    R,
    L,
}

impl Key {
    const fn bit(self) -> u8 {
        self as u8
    }
}

/// KEYINPUT with no key held.
const KEYS_RELEASED: u16 = 0x03FF;

#[derive(Serialize, Deserialize)]
pub struct Keypad {
    /// KEYINPUT
    pub keyinput: u16,
    /// KEYCNT
    pub keycnt: u16,
}

impl Default for Keypad {
    fn default() -> Self {
        Self {
            keyinput: KEYS_RELEASED,
            keycnt: 0,
        }
    }
}

impl Keypad {
    /// Applies a host key transition; pressing clears the key's bit.
    pub fn set_key(&mut self, key: Key, pressed: bool) {
        self.keyinput.set_bit(key.bit(), !pressed);
    }

    pub fn is_pressed(&self, key: Key) -> bool {
        self.keyinput.is_bit_off(key.bit())
    }

    /// Evaluates the KEYCNT condition against the current key state.
    ///
    /// In AND mode every selected key must be held; in OR mode any one of
    /// them suffices. Returns true when the keypad IRQ should be raised.
    pub fn interrupt_condition_met(&self) -> bool {
        if self.keycnt.is_bit_off(14) {
            return false;
        }

        let mask = self.keycnt.get_bits(0..=9);
        let held = !self.keyinput & KEYS_RELEASED;

        if self.keycnt.get_bit(15) {
            mask != 0 && (held & mask) == mask
        } else {
            (held & mask) != 0
        }
    }
}
