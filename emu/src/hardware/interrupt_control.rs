use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Interrupt sources, in IF/IE bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    VBlank,
    HBlank,
    VCount,
    Timer(usize),
    Serial,
    Dma(usize),
    Keypad,
    GamePak,
}

impl Interrupt {
    const fn mask(self) -> u16 {
        match self {
            Self::VBlank => 1 << 0,
            Self::HBlank => 1 << 1,
            Self::VCount => 1 << 2,
            Self::Timer(id) => 1 << (3 + id),
            Self::Serial => 1 << 7,
            Self::Dma(id) => 1 << (8 + id),
            Self::Keypad => 1 << 12,
            Self::GamePak => 1 << 13,
        }
    }
}

/// IE/IF/IME register block.
///
/// Pending bits are latched by [`Self::raise`] and acknowledged by the guest
/// writing 1s to IF.
#[derive(Default, Serialize, Deserialize)]
pub struct InterruptControl {
    /// IE, interrupt enable mask.
    pub interrupt_enable: u16,
    /// IF, latched pending sources.
    pub interrupt_request: u16,
    /// IME, master enable (only bit 0 matters).
    pub interrupt_master_enable: u16,
    /// POSTFLG, set by the BIOS after boot.
    pub post_boot_flag: u8,
}

impl InterruptControl {
    pub fn raise(&mut self, source: Interrupt) {
        self.interrupt_request |= source.mask();
    }

    /// An interrupt can reach the CPU when an enabled source is pending and
    /// the master switch is on.
    pub fn has_servable_irq(&self) -> bool {
        self.interrupt_master_enable.get_bit(0)
            && (self.interrupt_enable & self.interrupt_request) != 0
    }

    /// True when an enabled source is pending regardless of IME. This is
    /// what wakes the CPU from halt.
    pub fn has_pending_irq(&self) -> bool {
        (self.interrupt_enable & self.interrupt_request) != 0
    }

    pub fn read_register_byte(&self, offset: usize) -> u8 {
        match offset {
            0x200 => self.interrupt_enable.get_byte(0),
            0x201 => self.interrupt_enable.get_byte(1),
            0x202 => self.interrupt_request.get_byte(0),
            0x203 => self.interrupt_request.get_byte(1),
            0x208 => self.interrupt_master_enable.get_byte(0),
            0x209 => self.interrupt_master_enable.get_byte(1),
            0x300 => self.post_boot_flag,
            _ => 0,
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8) {
        match offset {
            0x200 => self.interrupt_enable.set_byte(0, value),
            0x201 => self.interrupt_enable.set_byte(1, value),
            // Writing a 1 to a pending IF bit acknowledges (clears) it.
            0x202 => self.interrupt_request &= !(value as u16),
            0x203 => self.interrupt_request &= !((value as u16) << 8),
            0x208 => self.interrupt_master_enable.set_byte(0, value),
            0x209 => self.interrupt_master_enable.set_byte(1, value),
            0x300 => self.post_boot_flag = value,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_latches_pending_bits() {
        let mut irq = InterruptControl::default();
        irq.raise(Interrupt::VBlank);
        irq.raise(Interrupt::Dma(2));

        assert_eq!(irq.interrupt_request, 0b0100_0000_0001);
    }

    #[test]
    fn servable_needs_enable_and_master() {
        let mut irq = InterruptControl::default();
        irq.raise(Interrupt::Timer(0));
        assert!(!irq.has_servable_irq());

        irq.interrupt_enable = Interrupt::Timer(0).mask();
        assert!(!irq.has_servable_irq());
        assert!(irq.has_pending_irq());

        irq.interrupt_master_enable = 1;
        assert!(irq.has_servable_irq());
    }

    #[test]
    fn writing_if_acknowledges() {
        let mut irq = InterruptControl::default();
        irq.raise(Interrupt::HBlank);
        irq.raise(Interrupt::Keypad);

        irq.write_register_byte(0x202, Interrupt::HBlank.mask() as u8);
        assert_eq!(irq.interrupt_request, Interrupt::Keypad.mask());

        irq.write_register_byte(0x203, (Interrupt::Keypad.mask() >> 8) as u8);
        assert_eq!(irq.interrupt_request, 0);
    }
}
