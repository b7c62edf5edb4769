//! GamePak: ROM image, backup media and the prefetch buffer.
//!
//! The ROM is mirrored through the 32 MiB window with a power-of-two mask;
//! reads past the end of the image return the address bus pattern the
//! cartridge leaves floating (`(address / 2) & 0xFFFF`, halfword
//! addressing). Backup media is detected by the vendor signature strings
//! games embed in their ROM; only SRAM carries a full implementation, the
//! serial protocols (EEPROM, Flash) fall back to no backup with a warning.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Backup media signatures burned into retail ROMs by the SDK.
const BACKUP_SIGNATURES: [(&[u8], BackupType); 5] = [
    (b"EEPROM_V", BackupType::Eeprom),
    (b"SRAM_V", BackupType::Sram),
    (b"FLASH_V", BackupType::Flash64),
    (b"FLASH512_V", BackupType::Flash64),
    (b"FLASH1M_V", BackupType::Flash128),
];

const SRAM_SIZE: usize = 0x1_0000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    #[default]
    None,
    Sram,
    Eeprom,
    Flash64,
    Flash128,
}

/// Scans the ROM image for a backup vendor signature.
pub fn detect_backup_type(rom: &[u8]) -> BackupType {
    for (signature, backup_type) in BACKUP_SIGNATURES {
        if rom
            .windows(signature.len())
            .any(|window| window == signature)
        {
            return backup_type;
        }
    }

    BackupType::None
}

/// GamePak prefetch buffer.
///
/// A linear burst reader synchronized to sequential ROM timing. It stores
/// no data, only the window of addresses whose halfwords/words are already
/// paid for: `last_address == head_address + count * opcode_width` whenever
/// `count > 0`, and `count` never exceeds `capacity`.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Prefetch {
    pub active: bool,
    pub head_address: u32,
    pub last_address: u32,
    pub count: u32,
    pub capacity: u32,
    pub opcode_width: u32,
    pub countdown: i32,
    pub duty: i32,
}

impl Prefetch {
    pub fn flush(&mut self) {
        *self = Self::default();
    }

    /// Arms a new burst starting right after the opcode fetched at
    /// `address`. THUMB bursts hold 8 halfwords, ARM bursts 4 words.
    pub fn arm(&mut self, address: u32, opcode_width: u32, duty: i32) {
        self.active = true;
        self.opcode_width = opcode_width;
        self.capacity = if opcode_width == 2 { 8 } else { 4 };
        self.head_address = address + opcode_width;
        self.last_address = self.head_address;
        self.count = 0;
        self.duty = duty;
        self.countdown = duty;
    }

    /// Advances the in-flight ROM read while the bus is busy elsewhere.
    pub fn step(&mut self, cycles: i32) {
        if !self.active || self.count == self.capacity {
            return;
        }

        self.countdown -= cycles;
        while self.countdown <= 0 && self.count < self.capacity {
            self.count += 1;
            self.last_address += self.opcode_width;
            if self.count < self.capacity {
                self.countdown += self.duty;
            } else {
                self.countdown = 0;
            }
        }
    }

    /// True when a code fetch at `address` hits the front of the buffer.
    pub fn hits_head(&self, address: u32) -> bool {
        self.count > 0 && address == self.head_address
    }

    /// True when a code fetch at `address` matches the unit currently being
    /// read from ROM.
    pub fn hits_in_flight(&self, address: u32) -> bool {
        self.active && self.count < self.capacity && address == self.last_address
    }

    /// Consumes the front unit.
    pub fn consume_head(&mut self) {
        self.head_address += self.opcode_width;
        self.count -= 1;
    }

    /// Completes the in-flight unit early and restarts the burst after it.
    /// Returns the cycles still owed on that unit.
    pub fn complete_in_flight(&mut self) -> i32 {
        let owed = self.countdown.max(1);
        self.head_address = self.last_address + self.opcode_width;
        self.last_address = self.head_address;
        self.count = 0;
        self.countdown = self.duty;
        owed
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct GamePak {
    rom: Vec<u8>,
    /// Power-of-two mirror mask applied before the size check.
    mask: u32,
    pub backup_type: BackupType,
    sram: Vec<u8>,
    save_path: Option<PathBuf>,
    pub prefetch: Prefetch,
}

impl GamePak {
    pub fn load(rom: Vec<u8>, save_path: Option<PathBuf>) -> Self {
        let backup_type = detect_backup_type(&rom);

        match backup_type {
            BackupType::None | BackupType::Sram => {}
            other => {
                tracing::warn!(
                    "unsupported backup type {other:?} detected, falling back to no backup"
                );
            }
        }

        let mut sram = vec![0xFF; SRAM_SIZE];
        if backup_type == BackupType::Sram {
            if let Some(path) = &save_path {
                if let Ok(image) = std::fs::read(path) {
                    let len = image.len().min(SRAM_SIZE);
                    sram[..len].copy_from_slice(&image[..len]);
                }
            }
        }

        Self {
            mask: calculate_mirror_mask(rom.len()),
            rom,
            backup_type,
            sram,
            save_path,
            prefetch: Prefetch::default(),
        }
    }

    pub fn read_rom_byte(&self, address: u32) -> u8 {
        let address = (address & self.mask) as usize;
        if address < self.rom.len() {
            self.rom[address]
        } else {
            (((address >> 1) & 0xFFFF) as u16).get_byte((address & 1) as u8)
        }
    }

    pub fn read_rom_half(&self, address: u32) -> u16 {
        let address = (address & self.mask) as usize;
        if address + 1 < self.rom.len() {
            u16::from_le_bytes([self.rom[address], self.rom[address + 1]])
        } else {
            ((address >> 1) & 0xFFFF) as u16
        }
    }

    pub fn read_rom_word(&self, address: u32) -> u32 {
        let low = self.read_rom_half(address);
        let high = self.read_rom_half(address + 2);
        (u32::from(high) << 16) | u32::from(low)
    }

    /// SRAM sits on an 8-bit bus; wider accesses are resolved by the bus
    /// replicating the byte.
    pub fn read_sram(&self, address: u32) -> u8 {
        if self.backup_type == BackupType::Sram {
            self.sram[(address as usize) & (SRAM_SIZE - 1)]
        } else {
            0xFF
        }
    }

    pub fn write_sram(&mut self, address: u32, value: u8) {
        if self.backup_type == BackupType::Sram {
            self.sram[(address as usize) & (SRAM_SIZE - 1)] = value;
        }
    }

    /// Writes the backup image to disk.
    pub fn flush_backup(&self) -> io::Result<()> {
        if self.backup_type != BackupType::Sram {
            return Ok(());
        }

        match &self.save_path {
            Some(path) => std::fs::write(path, &self.sram),
            None => Ok(()),
        }
    }
}

/// Mirror mask for the 32 MiB ROM window: the image repeats at the next
/// power of two.
pub fn calculate_mirror_mask(size: usize) -> u32 {
    if size == 0 {
        return 0x01FF_FFFF;
    }

    (size.next_power_of_two() as u32 - 1).min(0x01FF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_backup_signatures() {
        let mut rom = vec![0_u8; 256];
        rom[100..108].copy_from_slice(b"SRAM_V13");
        assert_eq!(detect_backup_type(&rom), BackupType::Sram);

        let mut rom = vec![0_u8; 256];
        rom[32..42].copy_from_slice(b"FLASH1M_V1");
        assert_eq!(detect_backup_type(&rom), BackupType::Flash128);

        assert_eq!(detect_backup_type(&[0; 64]), BackupType::None);
    }

    #[test]
    fn mirror_mask_rounds_to_power_of_two() {
        assert_eq!(calculate_mirror_mask(0x40_0000), 0x3F_FFFF);
        assert_eq!(calculate_mirror_mask(0x30_0000), 0x3F_FFFF);
        assert_eq!(calculate_mirror_mask(0x0200_0000), 0x01FF_FFFF);
    }

    #[test]
    fn out_of_bounds_rom_reads_return_address_pattern() {
        let pak = GamePak::load(vec![1, 2, 3, 4], None);

        assert_eq!(pak.read_rom_byte(0), 1);
        // Mirrored within the power-of-two window.
        assert_eq!(pak.read_rom_byte(4), 1);

        // Beyond the mirror window the bus floats the halfword address.
        let address = 0x0100_0000;
        assert_eq!(pak.read_rom_half(address), ((address >> 1) & 0xFFFF) as u16);
    }

    #[test]
    fn sram_requires_detected_backup() {
        let mut rom = vec![0_u8; 64];
        rom[0..7].copy_from_slice(b"SRAM_V1");
        let mut pak = GamePak::load(rom, None);

        pak.write_sram(0x1234, 0xAB);
        assert_eq!(pak.read_sram(0x1234), 0xAB);

        let mut bare = GamePak::load(vec![0_u8; 64], None);
        bare.write_sram(0, 0xAB);
        assert_eq!(bare.read_sram(0), 0xFF);
    }

    #[test]
    fn prefetch_never_exceeds_capacity() {
        let mut prefetch = Prefetch::default();
        prefetch.arm(0x0800_0000, 2, 2);

        prefetch.step(1000);

        assert_eq!(prefetch.count, 8);
        assert_eq!(
            prefetch.last_address,
            prefetch.head_address + prefetch.count * prefetch.opcode_width
        );
    }

    #[test]
    fn consume_tracks_head_and_count() {
        let mut prefetch = Prefetch::default();
        prefetch.arm(0x0800_0000, 2, 2);
        prefetch.step(4);
        assert_eq!(prefetch.count, 2);

        assert!(prefetch.hits_head(0x0800_0002));
        prefetch.consume_head();
        assert_eq!(prefetch.count, 1);
        assert!(prefetch.hits_head(0x0800_0004));
    }

    #[test]
    fn in_flight_completion_charges_remaining_countdown() {
        let mut prefetch = Prefetch::default();
        prefetch.arm(0x0800_0000, 4, 5);
        prefetch.step(3);

        assert!(prefetch.hits_in_flight(0x0800_0004));
        let owed = prefetch.complete_in_flight();
        assert_eq!(owed, 2);
        assert_eq!(prefetch.count, 0);
        assert_eq!(prefetch.head_address, 0x0800_0008);
    }
}
