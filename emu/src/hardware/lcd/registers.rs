//! LCD I/O register bank (0x04000000..0x0400005F).
//!
//! Flags in DISPSTAT and the live VCOUNT are owned by the scanline state
//! machine in the parent module; everything else is plain storage decoded
//! on demand by the renderers.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Affine background reference point: a 28-bit signed 20.8 fixed-point
/// register plus the internal accumulator the PPU actually steps while it
/// walks down the frame.
#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReferencePoint {
    raw: u32,
    /// Internal accumulator; advanced per scanline, reloaded at VBlank.
    pub current: i32,
}

impl ReferencePoint {
    /// Byte writes land in the programmed register and take effect on the
    /// internal accumulator immediately.
    pub fn write_byte(&mut self, byte_nth: u8, value: u8) {
        self.raw.set_byte(byte_nth, value);
        self.current = Self::sign_extend(self.raw);
    }

    pub fn reload(&mut self) {
        self.current = Self::sign_extend(self.raw);
    }

    fn sign_extend(raw: u32) -> i32 {
        ((raw << 4) as i32) >> 4
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Registers {
    /// LCD Control
    pub dispcnt: u16,
    /// Undocumented - Green Swap
    pub green_swap: u16,
    /// General LCD Status
    pub dispstat: u16,
    /// Vertical Counter
    pub vcount: u8,
    /// BG0-BG3 Control
    pub bgcnt: [u16; 4],
    /// BG0-BG3 X-Offset
    pub bghofs: [u16; 4],
    /// BG0-BG3 Y-Offset
    pub bgvofs: [u16; 4],
    /// BG2/BG3 Rotation/Scaling Parameters (dx, dmx, dy, dmy)
    pub bgpa: [u16; 2],
    pub bgpb: [u16; 2],
    pub bgpc: [u16; 2],
    pub bgpd: [u16; 2],
    /// BG2/BG3 Reference Points
    pub bgx: [ReferencePoint; 2],
    pub bgy: [ReferencePoint; 2],
    /// Window 0/1 Horizontal Dimensions
    pub winh: [u16; 2],
    /// Window 0/1 Vertical Dimensions
    pub winv: [u16; 2],
    /// Inside of Window 0 and 1
    pub winin: u16,
    /// Inside of OBJ Window & Outside of Windows
    pub winout: u16,
    /// Mosaic Size
    pub mosaic: u16,
    /// Color Special Effects Selection
    pub bldcnt: u16,
    /// Alpha Blending Coefficients
    pub bldalpha: u16,
    /// Brightness (Fade-In/Out) Coefficient
    pub bldy: u16,
}

impl Registers {
    pub fn bg_mode(&self) -> u8 {
        self.dispcnt.get_bits(0..=2) as u8
    }

    /// Mode 4/5 active bitmap page.
    pub fn frame_select(&self) -> bool {
        self.dispcnt.get_bit(4)
    }

    /// false = 2D (32x32 tile matrix), true = 1D (linear).
    pub fn obj_one_dimensional(&self) -> bool {
        self.dispcnt.get_bit(6)
    }

    pub fn forced_blank(&self) -> bool {
        self.dispcnt.get_bit(7)
    }

    pub fn bg_enabled(&self, id: usize) -> bool {
        self.dispcnt.get_bit(8 + id as u8)
    }

    pub fn obj_enabled(&self) -> bool {
        self.dispcnt.get_bit(12)
    }

    pub fn win0_enabled(&self) -> bool {
        self.dispcnt.get_bit(13)
    }

    pub fn win1_enabled(&self) -> bool {
        self.dispcnt.get_bit(14)
    }

    pub fn winobj_enabled(&self) -> bool {
        self.dispcnt.get_bit(15)
    }

    pub fn any_window_enabled(&self) -> bool {
        self.win0_enabled() || self.win1_enabled() || self.winobj_enabled()
    }

    pub fn vcount_setting(&self) -> u8 {
        self.dispstat.get_byte(1)
    }

    pub fn vblank_irq_enable(&self) -> bool {
        self.dispstat.get_bit(3)
    }

    pub fn hblank_irq_enable(&self) -> bool {
        self.dispstat.get_bit(4)
    }

    pub fn vcount_irq_enable(&self) -> bool {
        self.dispstat.get_bit(5)
    }

    pub fn set_vblank_flag(&mut self, value: bool) {
        self.dispstat.set_bit(0, value);
    }

    pub fn set_hblank_flag(&mut self, value: bool) {
        self.dispstat.set_bit(1, value);
    }

    pub fn vcount_flag(&self) -> bool {
        self.dispstat.get_bit(2)
    }

    pub fn set_vcount_flag(&mut self, value: bool) {
        self.dispstat.set_bit(2, value);
    }

    pub fn bg_priority(&self, id: usize) -> u8 {
        self.bgcnt[id].get_bits(0..=1) as u8
    }

    /// Character base block, 16 KiB units.
    pub fn bg_tile_block(&self, id: usize) -> u32 {
        u32::from(self.bgcnt[id].get_bits(2..=3)) * 0x4000
    }

    pub fn bg_mosaic_enable(&self, id: usize) -> bool {
        self.bgcnt[id].get_bit(6)
    }

    /// false = 4bpp (16x16 palettes), true = 8bpp (one 256 color palette).
    pub fn bg_full_palette(&self, id: usize) -> bool {
        self.bgcnt[id].get_bit(7)
    }

    /// Screen base block, 2 KiB units.
    pub fn bg_map_block(&self, id: usize) -> u32 {
        u32::from(self.bgcnt[id].get_bits(8..=12)) * 0x800
    }

    /// Affine backgrounds wrap instead of clipping when set.
    pub fn bg_wraparound(&self, id: usize) -> bool {
        self.bgcnt[id].get_bit(13)
    }

    pub fn bg_size(&self, id: usize) -> u8 {
        self.bgcnt[id].get_bits(14..=15) as u8
    }

    /// Mosaic dimensions (BG width, BG height, OBJ width, OBJ height).
    pub fn mosaic_sizes(&self) -> (u16, u16, u16, u16) {
        (
            self.mosaic.get_bits(0..=3) + 1,
            self.mosaic.get_bits(4..=7) + 1,
            self.mosaic.get_bits(8..=11) + 1,
            self.mosaic.get_bits(12..=15) + 1,
        )
    }

    /// Layer enable vector (BG0-3, OBJ, SFX) inside window 0 or 1.
    pub fn winin_enable(&self, id: usize) -> [bool; 6] {
        let bits = self.winin >> (id * 8);
        layer_enable_vector(bits)
    }

    /// Layer enable vector outside all windows.
    pub fn winout_enable(&self) -> [bool; 6] {
        layer_enable_vector(self.winout)
    }

    /// Layer enable vector inside the OBJ window.
    pub fn winobj_enable(&self) -> [bool; 6] {
        layer_enable_vector(self.winout >> 8)
    }

    /// Window horizontal bounds as (min, max), `x` inside when
    /// `min <= x < max`, wrapping when min > max.
    pub fn win_h_bounds(&self, id: usize) -> (u8, u8) {
        (self.winh[id].get_byte(1), self.winh[id].get_byte(0))
    }

    pub fn win_v_bounds(&self, id: usize) -> (u8, u8) {
        (self.winv[id].get_byte(1), self.winv[id].get_byte(0))
    }

    /// BLDCNT effect: 0 none, 1 alpha, 2 brighten, 3 darken.
    pub fn blend_effect(&self) -> u8 {
        self.bldcnt.get_bits(6..=7) as u8
    }

    /// First/second blend target vector (BG0-3, OBJ, backdrop).
    pub fn blend_targets(&self, nth: usize) -> [bool; 6] {
        layer_enable_vector(self.bldcnt >> (nth * 8))
    }

    pub fn blend_eva(&self) -> u16 {
        self.bldalpha.get_bits(0..=4).min(16)
    }

    pub fn blend_evb(&self) -> u16 {
        self.bldalpha.get_bits(8..=12).min(16)
    }

    pub fn blend_evy(&self) -> u16 {
        self.bldy.get_bits(0..=4).min(16)
    }

    pub fn read_register_byte(&self, offset: usize) -> u8 {
        match offset {
            0x00 => self.dispcnt.get_byte(0),
            0x01 => self.dispcnt.get_byte(1),
            0x02 => self.green_swap.get_byte(0),
            0x03 => self.green_swap.get_byte(1),
            0x04 => self.dispstat.get_byte(0),
            0x05 => self.dispstat.get_byte(1),
            0x06 => self.vcount,
            0x07 => 0,
            0x08..=0x0F => {
                let id = (offset - 0x08) / 2;
                self.bgcnt[id].get_byte(((offset - 0x08) % 2) as u8)
            }
            0x48 => self.winin.get_byte(0),
            0x49 => self.winin.get_byte(1),
            0x4A => self.winout.get_byte(0),
            0x4B => self.winout.get_byte(1),
            0x50 => self.bldcnt.get_byte(0),
            0x51 => self.bldcnt.get_byte(1),
            0x52 => self.bldalpha.get_byte(0),
            0x53 => self.bldalpha.get_byte(1),
            // Scroll, affine, window bounds, mosaic and BLDY are write-only.
            _ => 0,
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8) {
        match offset {
            0x00 => self.dispcnt.set_byte(0, value),
            0x01 => self.dispcnt.set_byte(1, value),
            0x02 => self.green_swap.set_byte(0, value),
            0x03 => self.green_swap.set_byte(1, value),
            // Bits 0-2 are hardware status, not writable.
            0x04 => {
                let flags = self.dispstat & 0b111;
                self.dispstat.set_byte(0, value & !0b111);
                self.dispstat |= flags;
            }
            0x05 => self.dispstat.set_byte(1, value),
            // VCOUNT is read-only.
            0x06 | 0x07 => {}
            0x08..=0x0F => {
                let id = (offset - 0x08) / 2;
                self.bgcnt[id].set_byte(((offset - 0x08) % 2) as u8, value);
            }
            0x10..=0x1F => {
                let id = (offset - 0x10) / 4;
                let byte = ((offset - 0x10) % 2) as u8;
                if (offset - 0x10) % 4 < 2 {
                    self.bghofs[id].set_byte(byte, value & if byte == 1 { 1 } else { 0xFF });
                } else {
                    self.bgvofs[id].set_byte(byte, value & if byte == 1 { 1 } else { 0xFF });
                }
            }
            0x20..=0x3F => self.write_affine_byte(offset, value),
            0x40 => self.winh[0].set_byte(0, value),
            0x41 => self.winh[0].set_byte(1, value),
            0x42 => self.winh[1].set_byte(0, value),
            0x43 => self.winh[1].set_byte(1, value),
            0x44 => self.winv[0].set_byte(0, value),
            0x45 => self.winv[0].set_byte(1, value),
            0x46 => self.winv[1].set_byte(0, value),
            0x47 => self.winv[1].set_byte(1, value),
            0x48 => self.winin.set_byte(0, value),
            0x49 => self.winin.set_byte(1, value),
            0x4A => self.winout.set_byte(0, value),
            0x4B => self.winout.set_byte(1, value),
            0x4C => self.mosaic.set_byte(0, value),
            0x4D => self.mosaic.set_byte(1, value),
            0x50 => self.bldcnt.set_byte(0, value),
            0x51 => self.bldcnt.set_byte(1, value),
            0x52 => self.bldalpha.set_byte(0, value),
            0x53 => self.bldalpha.set_byte(1, value),
            0x54 => self.bldy.set_byte(0, value),
            0x55 => self.bldy.set_byte(1, value),
            _ => {}
        }
    }

    /// BG2/BG3 affine parameter block: per background 8 parameter bytes
    /// (PA..PD) followed by the two 4-byte reference points.
    fn write_affine_byte(&mut self, offset: usize, value: u8) {
        let id = (offset - 0x20) / 0x10;
        let byte = ((offset % 0x10) % 2) as u8;

        match (offset - 0x20) % 0x10 {
            0x0 | 0x1 => self.bgpa[id].set_byte(byte, value),
            0x2 | 0x3 => self.bgpb[id].set_byte(byte, value),
            0x4 | 0x5 => self.bgpc[id].set_byte(byte, value),
            0x6 | 0x7 => self.bgpd[id].set_byte(byte, value),
            n @ 0x8..=0xB => self.bgx[id].write_byte((n - 0x8) as u8, value),
            n @ 0xC..=0xF => self.bgy[id].write_byte((n - 0xC) as u8, value),
            _ => unreachable!(),
        }
    }
}

fn layer_enable_vector(bits: u16) -> [bool; 6] {
    [
        bits.get_bit(0),
        bits.get_bit(1),
        bits.get_bit(2),
        bits.get_bit(3),
        bits.get_bit(4),
        bits.get_bit(5),
    ]
}
