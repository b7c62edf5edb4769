use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Serial I/O register storage.
///
/// No link protocol is emulated; guests that probe SIOCNT/RCNT read back
/// what they wrote, which is enough for cartridges that only detect the
/// absence of a link partner.
#[derive(Default, Serialize, Deserialize)]
pub struct Serial {
    /// SIOCNT, serial control.
    pub sio_control_register: u16,
    /// SIODATA8 / multiplayer send data.
    pub sio_multi_data_send_data_8: u16,
    /// RCNT, mode selection.
    pub sio_mode_select: u16,
}

impl Serial {
    pub fn read_register_byte(&self, offset: usize) -> u8 {
        match offset {
            0x128 => self.sio_control_register.get_byte(0),
            0x129 => self.sio_control_register.get_byte(1),
            0x12A => self.sio_multi_data_send_data_8.get_byte(0),
            0x12B => self.sio_multi_data_send_data_8.get_byte(1),
            0x134 => self.sio_mode_select.get_byte(0),
            0x135 => self.sio_mode_select.get_byte(1),
            _ => 0,
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8) {
        match offset {
            0x128 => self.sio_control_register.set_byte(0, value),
            0x129 => self.sio_control_register.set_byte(1, value),
            0x12A => self.sio_multi_data_send_data_8.set_byte(0, value),
            0x12B => self.sio_multi_data_send_data_8.set_byte(1, value),
            0x134 => self.sio_mode_select.set_byte(0, value),
            0x135 => self.sio_mode_select.set_byte(1, value),
            _ => {}
        }
    }
}
