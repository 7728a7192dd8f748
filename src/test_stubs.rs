// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the machine-context seam.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use loongarch_regs::{cpucfg2, CPUCFG1_ARCH_LA64};

use crate::cpu::{GpaClass, MachineContext, CPUCFG_WORDS};

/// A CPUCFG identity with LA64 and the LVZ capability set.
pub(crate) fn lvz_cpucfg() -> [u32; CPUCFG_WORDS] {
    let mut cfg = [0u32; CPUCFG_WORDS];
    cfg[1] = CPUCFG1_ARCH_LA64;
    cfg[2] = cpucfg2::lvz.val(1).modify(0);
    cfg
}

/// Deterministic machine: scripted entropy, recorded flushes, a sparse
/// physical memory, and the usual IOCSR/MMIO windows.
#[derive(Default)]
pub(crate) struct TestMachine {
    /// Values handed out by `guest_random`, front first; 0 when exhausted.
    pub random_values: Vec<u32>,
    pub full_flushes: u32,
    pub range_flushes: Vec<(u64, u64, u32)>,
    pub phys_mem: BTreeMap<u64, u64>,
    pub phys_reads: Vec<u64>,
    pub vcpu_index: u64,
    pub ticks: u64,
    pub timer_config: Option<u64>,
    pub timer_acks: u32,
    pub halted: bool,
}

impl MachineContext for TestMachine {
    fn flush_translation_cache(&mut self) {
        self.full_flushes += 1;
    }

    fn flush_translation_range(&mut self, base: u64, size: u64, mmu_idx: u32) {
        self.range_flushes.push((base, size, mmu_idx));
    }

    fn guest_random(&mut self) -> u32 {
        if self.random_values.is_empty() {
            0
        } else {
            self.random_values.remove(0)
        }
    }

    fn load_phys(&mut self, pa: u64) -> u64 {
        self.phys_reads.push(pa);
        self.phys_mem.get(&pa).copied().unwrap_or(0)
    }

    fn classify_gpa(&self, gpa: u64) -> GpaClass {
        if (0x1fe0_0000..0x2000_0000).contains(&gpa) {
            GpaClass::Iocsr
        } else if (0xe000_0000..0xf000_0000).contains(&gpa) {
            GpaClass::Mmio
        } else {
            GpaClass::Ram
        }
    }

    fn vcpu_index(&self) -> u64 {
        self.vcpu_index
    }

    fn timer_ticks(&self) -> u64 {
        self.ticks
    }

    fn set_timer_config(&mut self, val: u64) {
        self.timer_config = Some(val);
    }

    fn ack_timer_interrupt(&mut self) {
        self.timer_acks += 1;
    }

    fn halt(&mut self) {
        self.halted = true;
    }
}
