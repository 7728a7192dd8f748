// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]

//! Crate for handling LoongArch64 registers.
//! defs - CSR and TLB-entry bitfield layouts
//! ids - architectural CSR index constants
//! regs - LoongArch64 General Purpose Registers (GPRs), 0-31.
//! traps - exception causes and guest-exit reasons

mod defs;
mod ids;
mod regs;
mod traps;

pub use defs::*;
pub use ids::*;
pub use regs::*;
pub use traps::*;

pub use tock_registers::fields::{Field, FieldValue};
pub use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
pub use tock_registers::LocalRegisterCopy;
