//! Seam to the ARM7TDMI interpreter.
//!
//! The instruction decoder and register file are conventional ARMv4
//! machinery and live outside this crate; the core only needs the three
//! operations below. The bus handed to the interpreter is the single
//! memory capability: all loads, stores and opcode fetches go through its
//! typed accessors with an explicit [`Access`](crate::bus::Access) kind,
//! which is what couples the interpreter to the cycle economy.

use crate::bus::Bus;

pub trait Arm7tdmi {
    /// Re-initializes the register file. With `skip_bios` the post-BIOS
    /// state is seeded instead of starting at the reset vector:
    /// `r13_svc = 0x03007FE0`, `r13_irq = 0x03007FA0`, `r13 = 0x03007F00`,
    /// `r15 = 0x08000000`, CPSR mode = System.
    fn reset(&mut self, bus: &mut Bus, skip_bios: bool);

    /// Executes a single instruction to completion, performing its memory
    /// traffic against `bus`.
    fn step(&mut self, bus: &mut Bus);

    /// Level-triggered IRQ line. Raised by the run loop whenever the
    /// interrupt controller has a servable interrupt; the interpreter takes
    /// the exception when CPSR.I allows.
    fn set_irq_line(&mut self, asserted: bool);
}
