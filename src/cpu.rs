// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Per-vCPU architectural state and the seam to the surrounding emulator.

use loongarch_regs::{
    cpucfg1, cpucfg2, crmd, gstat, gtlbc, misc, GeneralPurposeRegisters, VmExitReason,
    CPUCFG1_ARCH_LA64,
};

use crate::csr::CsrBank;
use crate::tlb::TlbArray;

/// MMU index for kernel-privilege translation.
pub const MMU_KERNEL_IDX: u32 = 0;
/// MMU index for user-privilege translation.
pub const MMU_USER_IDX: u32 = 3;
/// MMU index for direct-addressing mode.
pub const MMU_DA_IDX: u32 = 4;

/// Width of the virtual address space; bits above must be a sign extension.
pub const VIRT_ADDR_BITS: u32 = 48;
/// Mask of implemented virtual address bits.
pub const VIRT_MASK: u64 = (1 << VIRT_ADDR_BITS) - 1;
/// Mask of implemented physical address bits.
pub const PHYS_MASK: u64 = (1 << VIRT_ADDR_BITS) - 1;

/// Number of implemented CPUCFG words.
pub const CPUCFG_WORDS: usize = 21;

/// The kind of memory access being translated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemAccess {
    Fetch,
    Load,
    Store,
}

impl MemAccess {
    /// Access-type code stored in the migration image.
    pub fn code(&self) -> u32 {
        match self {
            MemAccess::Load => 1,
            MemAccess::Store => 2,
            MemAccess::Fetch => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(MemAccess::Load),
            2 => Some(MemAccess::Store),
            4 => Some(MemAccess::Fetch),
            _ => None,
        }
    }
}

/// Classification of a guest physical address by the surrounding machine.
/// The machine owns the memory map; the core only needs to know whether a
/// second-level miss must be serviced by the hypervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GpaClass {
    /// Backed by RAM the hypervisor may map through the VMM TLB.
    Ram,
    /// An emulated-device window; always traps.
    Mmio,
    /// The IOCSR window; always traps.
    Iocsr,
}

/// What to do when a second-level translation misses and no trap applies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecondLevelPolicy {
    /// Exit to the hypervisor so it can install a VMM mapping.
    Fault,
    /// Pass the GPA through unchanged. Unsafe outside bring-up debugging.
    IdentityMap,
}

/// Services the core requires from the surrounding emulator.
pub trait MachineContext {
    /// Invalidates every host-side cached translation for this vCPU.
    fn flush_translation_cache(&mut self);

    /// Invalidates host-side cached translations covering
    /// `[base, base + size)` for the given MMU index.
    fn flush_translation_range(&mut self, base: u64, size: u64, mmu_idx: u32);

    /// Returns 32 bits from the guest entropy source. Drives TLB replacement;
    /// tests substitute a scripted source.
    fn guest_random(&mut self) -> u32;

    /// Loads a little-endian u64 from host physical memory (page walks).
    fn load_phys(&mut self, pa: u64) -> u64;

    /// Classifies a guest physical address for second-level translation.
    fn classify_gpa(&self, gpa: u64) -> GpaClass;

    /// Index of this vCPU, reported through `CSR_CPUID`.
    fn vcpu_index(&self) -> u64;

    /// Current constant-timer tick count.
    fn timer_ticks(&self) -> u64;

    /// Forwards a `CSR_TCFG` write to the machine timer.
    fn set_timer_config(&mut self, val: u64);

    /// Acknowledges the timer interrupt (`CSR_TICLR` bit 0). The machine
    /// serializes this against interrupt delivery.
    fn ack_timer_interrupt(&mut self);

    /// Halts the vCPU until the next interrupt.
    fn halt(&mut self);
}

/// Fault context captured at a VM exit, readable by the hypervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmExitContext {
    pub fault_gpa: u64,
    pub fault_gva: u64,
    pub gid: u8,
    /// Reason for the most recent exit; `None` before the first exit.
    pub reason: Option<VmExitReason>,
    pub access: Option<MemAccess>,
    pub is_tlb_refill: bool,
}

/// Architectural state of a single vCPU.
///
/// Owned by the vCPU thread; nothing in this core mutates another vCPU's
/// state. The surrounding machine is reached only through [`MachineContext`]
/// arguments, never stored here.
#[derive(Debug, PartialEq)]
pub struct CpuState {
    pub gprs: GeneralPurposeRegisters,
    pub pc: u64,
    pub cpucfg: [u32; CPUCFG_WORDS],

    /// Host CSR bank.
    pub csr: CsrBank,
    /// Guest shadow CSR bank; architecturally visible while `GSTAT.VM` is set.
    pub gcsr: CsrBank,

    pub tlb: TlbArray,

    /// Whether LVZ has been turned on by the hypervisor.
    pub lvz_enabled: bool,
    pub second_level_policy: SecondLevelPolicy,
    pub vm_exit_ctx: VmExitContext,

    /// LL reservation address; a write of 1 clears any reservation.
    pub lladdr: u64,
}

impl CpuState {
    /// Creates a vCPU with the given CPUCFG identity and reset-state CSRs.
    pub fn new(cpucfg: [u32; CPUCFG_WORDS]) -> Self {
        let mut cpu = Self {
            gprs: GeneralPurposeRegisters::default(),
            pc: 0,
            cpucfg,
            csr: CsrBank::default(),
            gcsr: CsrBank::default(),
            tlb: TlbArray::default(),
            lvz_enabled: false,
            second_level_policy: SecondLevelPolicy::Fault,
            vm_exit_ctx: VmExitContext::default(),
            lladdr: 0,
        };
        cpu.reset();
        cpu
    }

    /// Resets CSRs to their architectural defaults and disables every TLB
    /// entry. CPUCFG identity and the LVZ enable survive reset.
    pub fn reset(&mut self) {
        self.csr.reset();
        self.gcsr.reset();
        self.tlb = TlbArray::default();
        self.vm_exit_ctx = VmExitContext::default();
        self.lladdr = 0;
    }

    /// Turns on second-level translation with the given miss policy.
    pub fn enable_virtualization(&mut self, policy: SecondLevelPolicy) {
        if !self.has_lvz() {
            return;
        }
        self.lvz_enabled = true;
        self.second_level_policy = policy;
        self.vm_exit_ctx = VmExitContext::default();
    }

    /// Turns off second-level translation.
    pub fn disable_virtualization(&mut self) {
        self.lvz_enabled = false;
    }

    pub fn is_la64(&self) -> bool {
        cpucfg1::arch.read(self.cpucfg[1]) == CPUCFG1_ARCH_LA64
    }

    fn is_va32(&self) -> bool {
        let mut va32 = !self.is_la64();
        let plv = crmd::plv.read(self.csr.crmd);
        if plv >= 1 && (misc::va32.read(self.csr.misc) & (1 << plv)) != 0 {
            va32 = true;
        }
        va32
    }

    /// Sets the program counter, truncating in 32-bit address mode.
    pub fn set_pc(&mut self, value: u64) {
        if self.is_va32() {
            self.pc = value as u32 as u64;
        } else {
            self.pc = value;
        }
    }

    /// Whether the CPU implements the LVZ extension at all.
    pub fn has_lvz(&self) -> bool {
        cpucfg2::lvz.read(self.cpucfg[2]) != 0
    }

    /// Whether the vCPU is currently executing guest instructions.
    pub fn is_guest_mode(&self) -> bool {
        self.has_lvz() && gstat::vm.read(self.csr.gstat) != 0
    }

    /// GID of the current guest, from `GSTAT`.
    pub fn guest_id(&self) -> u8 {
        gstat::gid.read(self.csr.gstat) as u8
    }

    /// Whether virtualization is switched on (capability plus enable).
    pub fn virtualization_active(&self) -> bool {
        self.has_lvz() && self.lvz_enabled
    }

    /// Whether we are executing guest code under active virtualization.
    pub fn is_guest_context(&self) -> bool {
        self.virtualization_active() && self.is_guest_mode()
    }

    /// Whether we are executing hypervisor code under active virtualization.
    pub fn is_hypervisor_context(&self) -> bool {
        self.virtualization_active() && !self.is_guest_mode()
    }

    /// The GID that tags TLB lookups: the guest's GID in guest mode, 0 (the
    /// VMM tag) everywhere else.
    pub fn effective_gid(&self) -> u8 {
        if self.is_guest_mode() {
            self.guest_id()
        } else {
            0
        }
    }

    /// The GID stamped on TLB fills. `GTLBC.USETGID` lets the hypervisor
    /// direct fills at another guest's tag.
    pub fn target_gid(&self) -> u8 {
        if !self.virtualization_active() {
            return 0;
        }
        if gtlbc::use_tgid.read(self.csr.gtlbc) != 0 {
            gtlbc::tgid.read(self.csr.gtlbc) as u8
        } else {
            self.effective_gid()
        }
    }

    /// Whether GPA->HPA translation applies to the current access stream.
    pub fn second_level_enabled(&self) -> bool {
        self.is_guest_mode() && self.virtualization_active()
    }

    /// The CSR bank architecturally visible right now.
    pub fn effective_bank(&self) -> &CsrBank {
        if self.is_guest_mode() {
            &self.gcsr
        } else {
            &self.csr
        }
    }

    pub fn effective_bank_mut(&mut self) -> &mut CsrBank {
        if self.is_guest_mode() {
            &mut self.gcsr
        } else {
            &mut self.csr
        }
    }

    /// MMU index of the current execution mode.
    pub fn mmu_index(&self) -> u32 {
        let da = crmd::da.read(self.csr.crmd) != 0;
        let pg = crmd::pg.read(self.csr.crmd) != 0;
        if da && !pg {
            MMU_DA_IDX
        } else {
            crmd::plv.read(self.csr.crmd) as u32
        }
    }
}
