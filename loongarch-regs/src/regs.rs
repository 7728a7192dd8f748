// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// General purpose registers for LoongArch64.

/// Array of LoongArch64 general purpose registers with accessors/setters.
/// Used to save the state of guest vCPUs when they aren't running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralPurposeRegisters([u64; 32]);

/// Index of LoongArch64 general purpose registers in `GeneralPurposeRegisters`.
#[derive(Copy, Clone)]
pub enum GprIndex {
    Zero = 0,
    RA,
    TP,
    SP,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
    T7,
    T8,
    U0,
    FP,
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
}

impl GeneralPurposeRegisters {
    /// Returns the value of the given register.
    pub fn reg(&self, reg_index: GprIndex) -> u64 {
        self.0[reg_index as usize]
    }

    /// Sets the value of the given register. r0 is hard-wired to zero.
    pub fn set_reg(&mut self, reg_index: GprIndex, val: u64) {
        if let GprIndex::Zero = reg_index {
            return;
        }
        self.0[reg_index as usize] = val;
    }

    /// Returns the argument registers.
    /// This avoids many calls when a hypercall handler needs all of the argument regs.
    pub fn a_regs(&self) -> &[u64] {
        &self.0[GprIndex::A0 as usize..=GprIndex::A7 as usize]
    }

    /// Returns the raw register file.
    pub fn raw(&self) -> &[u64; 32] {
        &self.0
    }

    /// Replaces the raw register file.
    pub fn set_raw(&mut self, regs: [u64; 32]) {
        self.0 = regs;
        self.0[0] = 0;
    }
}
