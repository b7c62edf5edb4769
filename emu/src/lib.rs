//! # Mandarine Emulation Core
//!
//! Cycle-approximate GBA hardware emulation - no UI code.
//!
//! ## Module Overview
//!
//! | Module               | Description                                      |
//! |----------------------|--------------------------------------------------|
//! | [`gba`]              | Top-level system and run loop (start here)       |
//! | [`bus`]              | Memory bus, wait states, MMIO, DMA execution     |
//! | [`scheduler`]        | Cycle-keyed event queue driving all hardware     |
//! | [`cpu`]              | Interface to the external ARM7TDMI interpreter   |
//! | [`hardware`]         | LCD, DMA, timers, GamePak, keypad, sound, serial |
//! | [`cartridge_header`] | ROM header parsing                               |
//! | [`devices`]          | Host video/audio collaborator traits             |
//!
//! ## Quick Start
//!
//! ```ignore
//! use emu::{config::Config, gba::Gba};
//!
//! let mut gba = Gba::new(Box::new(interpreter), Config::default());
//! gba.load_bios("gba_bios.bin".as_ref())?;
//! gba.load_game("game.gba".as_ref())?;
//! loop { gba.frame(); }
//! ```
//!
//! ## Architecture
//!
//! Time is a single cycle counter owned by the [`scheduler`]; every bus
//! access charges its wait states there and drains whatever hardware
//! events came due. See [`bus`] for the memory map and [`gba`] for how the
//! CPU, DMA and halt states arbitrate.

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
mod bitwise;

#[allow(clippy::missing_panics_doc)]
#[allow(clippy::cast_lossless)]
pub mod bus;

pub mod cartridge_header;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod gba;
pub mod hardware;
pub mod scheduler;
