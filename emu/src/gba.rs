//! Top-level GBA system: asset loading and the run loop.
//!
//! Owns the bus and the pluggable ARM7TDMI interpreter and arbitrates
//! between them: between instructions the CPU yields the bus entirely to
//! any runnable DMA channel, and a halted CPU fast-forwards the scheduler
//! to its next event instead of burning cycles.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::bus::{Bus, HaltControl};
use crate::cartridge_header::CartridgeHeader;
use crate::config::Config;
use crate::cpu::Arm7tdmi;
use crate::hardware::gamepak::GamePak;
use crate::hardware::keypad::Key;

/// Master cycles per frame: 228 scanlines of 1232 cycles.
pub const CYCLES_PER_FRAME: u64 = 280_896;

/// ROM images larger than this cannot exist on a GamePak.
const ROM_MAX_SIZE: usize = 0x0200_0000;

const BIOS_SIZE: usize = 0x4000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("BIOS file not found: {0}")]
    BiosNotFound(PathBuf),
    #[error("BIOS image must be exactly 16 KiB")]
    BiosWrongSize,
    #[error("game file not found: {0}")]
    GameNotFound(PathBuf),
    #[error("game image exceeds the 32 MiB GamePak limit")]
    GameWrongSize,
}

pub struct Gba {
    pub cpu: Box<dyn Arm7tdmi>,
    pub bus: Bus,
    pub config: Config,
    pub cartridge_header: Option<CartridgeHeader>,
    bios_loaded: bool,
}

impl Gba {
    pub fn new(cpu: Box<dyn Arm7tdmi>, config: Config) -> Self {
        Self {
            cpu,
            bus: Bus::default(),
            config,
            cartridge_header: None,
            bios_loaded: false,
        }
    }

    pub fn load_bios(&mut self, path: &Path) -> Result<(), LoadError> {
        let image = std::fs::read(path)
            .map_err(|_| LoadError::BiosNotFound(path.to_path_buf()))?;

        if image.len() != BIOS_SIZE {
            return Err(LoadError::BiosWrongSize);
        }

        self.bus.load_bios(image);
        self.bios_loaded = true;
        Ok(())
    }

    pub fn load_game(&mut self, path: &Path) -> Result<(), LoadError> {
        let image = std::fs::read(path)
            .map_err(|_| LoadError::GameNotFound(path.to_path_buf()))?;

        if image.len() > ROM_MAX_SIZE {
            return Err(LoadError::GameWrongSize);
        }

        self.cartridge_header = Some(CartridgeHeader::new(&image));

        let save_path = self
            .config
            .save_path
            .clone()
            .unwrap_or_else(|| path.with_extension("sav"));
        self.bus.gamepak = GamePak::load(image, Some(save_path));

        self.reset();
        Ok(())
    }

    /// Re-initializes every subsystem; with `skip_bios` the interpreter is
    /// seeded with the post-BIOS register state.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus, self.config.skip_bios);
    }

    /// Advances emulation by up to `cycles` master cycles.
    pub fn run_for(&mut self, cycles: u64) {
        let limit = self.bus.scheduler.now() + cycles;

        while self.bus.scheduler.now() < limit {
            if self.bus.haltcnt != HaltControl::Run
                && self.bus.interrupt_control.has_servable_irq()
            {
                self.bus.haltcnt = HaltControl::Run;
            }

            if self.bus.dma_is_running() {
                self.bus.run_dma();
            } else if self.bus.haltcnt == HaltControl::Run {
                self.cpu
                    .set_irq_line(self.bus.interrupt_control.has_servable_irq());
                self.cpu.step(&mut self.bus);
            } else {
                self.bus.fast_forward();
            }
        }
    }

    /// Runs exactly one full frame.
    pub fn frame(&mut self) {
        self.run_for(CYCLES_PER_FRAME);
    }

    pub fn set_key(&mut self, key: Key, pressed: bool) {
        self.bus.set_key(key, pressed);
    }

    /// Persists the cartridge backup image.
    pub fn flush_backup(&self) -> std::io::Result<()> {
        self.bus.gamepak.flush_backup()
    }

    pub const fn bios_loaded(&self) -> bool {
        self.bios_loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Access;

    /// Interpreter stand-in that only burns internal cycles.
    struct IdleCpu;

    impl Arm7tdmi for IdleCpu {
        fn reset(&mut self, _bus: &mut Bus, _skip_bios: bool) {}

        fn step(&mut self, bus: &mut Bus) {
            bus.idle();
        }

        fn set_irq_line(&mut self, _asserted: bool) {}
    }

    fn gba() -> Gba {
        Gba::new(Box::new(IdleCpu), Config::default())
    }

    #[test]
    fn frame_advances_exactly_one_frame_of_cycles() {
        let mut gba = gba();
        let start = gba.bus.scheduler.now();

        gba.frame();

        assert_eq!(gba.bus.scheduler.now() - start, CYCLES_PER_FRAME);
        assert_eq!(gba.bus.lcd.registers.vcount, 0);
    }

    #[test]
    fn halt_fast_forwards_to_irq() {
        let mut gba = gba();

        // Enable the VBlank interrupt, then halt.
        gba.bus
            .write_half(0x0400_0004, 1 << 3, Access::NonSequential);
        gba.bus.write_half(0x0400_0200, 1, Access::NonSequential);
        gba.bus.write_half(0x0400_0208, 1, Access::NonSequential);
        gba.bus.write_byte(0x0400_0301, 0, Access::NonSequential);
        assert_eq!(gba.bus.haltcnt, HaltControl::Halt);

        gba.frame();

        // The halt broke when VBlank was raised.
        assert_eq!(gba.bus.haltcnt, HaltControl::Run);
        assert_ne!(gba.bus.interrupt_control.interrupt_request & 1, 0);
        assert!(gba.bus.interrupt_control.has_servable_irq());
    }

    #[test]
    fn missing_files_surface_as_load_errors() {
        let mut gba = gba();

        assert!(matches!(
            gba.load_bios(Path::new("/nonexistent/bios.bin")),
            Err(LoadError::BiosNotFound(_))
        ));
        assert!(matches!(
            gba.load_game(Path::new("/nonexistent/game.gba")),
            Err(LoadError::GameNotFound(_))
        ));
    }

    #[test]
    fn wrong_sized_bios_is_rejected() {
        let mut gba = gba();
        let path = std::env::temp_dir().join("mandarine-test-short-bios.bin");
        std::fs::write(&path, vec![0_u8; 0x1000]).unwrap();

        assert!(matches!(
            gba.load_bios(&path),
            Err(LoadError::BiosWrongSize)
        ));
        assert!(!gba.bios_loaded());

        std::fs::remove_file(path).ok();
    }
}
