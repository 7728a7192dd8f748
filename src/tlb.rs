// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The unified, GID-tagged TLB and the TLB instruction helpers.
//!
//! One physical array backs every address space on the vCPU: entries tagged
//! `GID == 0` belong to the host/VMM (and serve as second-stage mappings
//! under virtualization), entries with a non-zero GID belong to that guest.
//! Helpers only ever touch entries whose tag matches the current effective
//! GID, which partitions the array into per-guest logical TLBs without
//! copying.

use core::ops::{Index, IndexMut};

use log::{trace, warn};
use loongarch_regs::{
    asid, stlbps, tlb_misc, tlbehi, tlbentry, tlbidx, tlbrehi, tlbrera, Exception, VmExitReason,
    TLB_MISC_VPPN_SHIFT,
};
use static_assertions::const_assert;

use crate::cpu::{CpuState, MachineContext, VIRT_MASK};

/// Number of sets in the set-associative STLB.
pub const STLB_SETS: usize = 256;
/// Number of ways per STLB set.
pub const STLB_WAYS: usize = 8;
/// Total STLB entries.
pub const STLB_ENTRIES: usize = STLB_SETS * STLB_WAYS;
/// Fully-associative MTLB entries.
pub const MTLB_ENTRIES: usize = 64;
/// Total entries in the unified array.
pub const TLB_ENTRIES: usize = STLB_ENTRIES + MTLB_ENTRIES;

// Every index must be expressible in TLBIDX.INDEX.
const_assert!(TLB_ENTRIES <= 1 << 12);

// Page sizes are software-controlled 6-bit fields; clamp to the implemented
// address width so shift arithmetic stays defined for junk values.
pub(crate) const MAX_PS: u8 = 47;

/// A single TLB entry: one tag word and an even/odd pair of page-frame
/// descriptors, in the architectural bit layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub misc: u64,
    pub entry0: u64,
    pub entry1: u64,
}

impl TlbEntry {
    pub fn enabled(&self) -> bool {
        tlb_misc::e.read(self.misc) != 0
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.misc = tlb_misc::e.val(enabled as u64).modify(self.misc);
    }

    /// Marks the entry as not participating in any lookup.
    pub fn invalidate(&mut self) {
        self.set_enabled(false);
    }

    pub fn gid(&self) -> u8 {
        tlb_misc::gid.read(self.misc) as u8
    }

    pub fn set_gid(&mut self, gid: u8) {
        self.misc = tlb_misc::gid.val(gid as u64).modify(self.misc);
    }

    pub fn asid(&self) -> u16 {
        tlb_misc::asid.read(self.misc) as u16
    }

    pub fn set_asid(&mut self, asid: u16) {
        self.misc = tlb_misc::asid.val(asid as u64).modify(self.misc);
    }

    pub fn vppn(&self) -> u64 {
        tlb_misc::vppn.read(self.misc)
    }

    pub fn set_vppn(&mut self, vppn: u64) {
        self.misc = tlb_misc::vppn.val(vppn).modify(self.misc);
    }

    /// The PS field; only meaningful for MTLB entries.
    pub fn raw_page_size(&self) -> u8 {
        tlb_misc::ps.read(self.misc) as u8
    }

    pub fn set_page_size(&mut self, ps: u8) {
        self.misc = tlb_misc::ps.val(ps as u64).modify(self.misc);
    }

    /// Global bit; kept identical in both descriptor halves by the fill
    /// helpers, read from the even half as the architecture does.
    pub fn global(&self) -> bool {
        tlbentry::g.read(self.entry0) != 0
    }

    /// Returns the descriptor for the odd or even page of the pair.
    pub fn descriptor(&self, odd: bool) -> u64 {
        if odd {
            self.entry1
        } else {
            self.entry0
        }
    }
}

/// The unified TLB array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlbArray([TlbEntry; TLB_ENTRIES]);

impl Default for TlbArray {
    fn default() -> Self {
        Self([TlbEntry::default(); TLB_ENTRIES])
    }
}

impl Index<usize> for TlbArray {
    type Output = TlbEntry;

    fn index(&self, index: usize) -> &TlbEntry {
        &self.0[index]
    }
}

impl IndexMut<usize> for TlbArray {
    fn index_mut(&mut self, index: usize) -> &mut TlbEntry {
        &mut self.0[index]
    }
}

impl TlbArray {
    pub fn iter(&self) -> impl Iterator<Item = &TlbEntry> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TlbEntry> {
        self.0.iter_mut()
    }
}

impl CpuState {
    /// The effective STLB page size.
    pub(crate) fn stlb_page_size(&self) -> u8 {
        (stlbps::ps.read(self.effective_bank().stlbps) as u8).min(MAX_PS)
    }

    /// Effective log2 page size of the entry at `index`: the per-entry PS for
    /// MTLB entries, the shared `STLBPS` setting for STLB entries.
    pub(crate) fn entry_page_size(&self, index: usize) -> u8 {
        if index >= STLB_ENTRIES {
            self.tlb[index].raw_page_size().min(MAX_PS)
        } else {
            self.stlb_page_size()
        }
    }

    /// Whether the entry belongs to the current guest/host context.
    pub(crate) fn entry_matches_gid(&self, entry: &TlbEntry) -> bool {
        if !self.has_lvz() {
            return true;
        }
        entry.gid() == self.effective_gid()
    }

    // Guest TLB instructions trap to the hypervisor when GTLBC.TOTI is set.
    fn tlb_op_guard(&mut self) -> Result<(), Exception> {
        if self.vm_exit_gated(&VmExitReason::Tlb) {
            return Err(self.vm_exit(VmExitReason::Tlb, 0, 0, None));
        }
        Ok(())
    }

    // Flushes the host-side cached pages an entry may have produced, then
    // leaves the entry itself untouched.
    pub(crate) fn flush_entry_pages(&mut self, mach: &mut dyn MachineContext, index: usize) {
        let entry = self.tlb[index];
        let mmu_idx = self.mmu_index();
        let ps = self.entry_page_size(index);
        let pagesize = 1u64 << ps;
        let pair_mask = (1u64 << (ps + 1)) - 1;
        let base = (entry.vppn() << TLB_MISC_VPPN_SHIFT) & !pair_mask;

        if tlbentry::v.read(entry.entry0) != 0 {
            mach.flush_translation_range(base, pagesize, mmu_idx);
        }
        if tlbentry::v.read(entry.entry1) != 0 {
            mach.flush_translation_range(base | pagesize, pagesize, mmu_idx);
        }
    }

    // Writes the effective CSR window (or the refill window while servicing
    // a refill) into the entry at `index`, stamping ASID and GID tags.
    fn fill_tlb_entry(&mut self, index: usize) {
        let bank = self.effective_bank();
        let refill = tlbrera::istlbr.read(bank.tlbrera) != 0;
        let (csr_ps, csr_vppn, lo0, lo1) = if refill {
            (
                tlbrehi::ps.read(bank.tlbrehi) as u8,
                tlbrehi::vppn.read(bank.tlbrehi),
                bank.tlbrelo0,
                bank.tlbrelo1,
            )
        } else {
            (
                tlbidx::ps.read(bank.tlbidx) as u8,
                tlbehi::vppn.read(bank.tlbehi),
                bank.tlbelo0,
                bank.tlbelo1,
            )
        };
        let csr_asid = asid::asid.read(bank.asid) as u16;

        if csr_ps == 0 {
            trace!(target: "mmu", "page size is 0");
        }

        let lvz = self.has_lvz();
        let gid = self.target_gid();
        let entry = &mut self.tlb[index];
        // Only MTLB entries carry a page size.
        if index >= STLB_ENTRIES {
            entry.set_page_size(csr_ps);
        }
        entry.set_vppn(csr_vppn);
        entry.set_asid(csr_asid);
        if lvz {
            entry.set_gid(gid);
        }
        entry.set_enabled(true);
        entry.entry0 = lo0;
        entry.entry1 = lo1;
    }

    // Random value in [low, high], drawn from the machine entropy source.
    fn random_in(mach: &mut dyn MachineContext, low: u32, high: u32) -> u32 {
        mach.guest_random() % (high - low + 1) + low
    }

    /// `tlbsrch`: looks up the effective `TLBEHI` (or `TLBREHI` during a
    /// refill) and reports the matching index through `TLBIDX`.
    pub fn tlbsrch(&mut self, _mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let bank = self.effective_bank();
        let search_ehi = if tlbrera::istlbr.read(bank.tlbrera) != 0 {
            bank.tlbrehi
        } else {
            bank.tlbehi
        };

        let tlbidx_val = self.effective_bank().tlbidx;
        match self.tlb_lookup(search_ehi) {
            Some(index) => {
                let new = (tlbidx::index.val(index as u64) + tlbidx::ne.val(0)).modify(tlbidx_val);
                self.effective_bank_mut().tlbidx = new;
            }
            None => {
                self.effective_bank_mut().tlbidx = tlbidx::ne.val(1).modify(tlbidx_val);
            }
        }
        Ok(())
    }

    /// Searches STLB then MTLB for an enabled entry covering `vaddr` with a
    /// matching GID and ASID (or the global bit).
    pub(crate) fn tlb_lookup(&self, vaddr: u64) -> Option<usize> {
        let csr_asid = asid::asid.read(self.effective_bank().asid) as u16;
        let stlb_ps = self.stlb_page_size();
        let vpn = (vaddr & VIRT_MASK) >> (stlb_ps + 1);
        let stlb_idx = (vpn & 0xff) as usize;
        let compare_shift = (stlb_ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);

        // STLB: the eight ways of the set selected by the low VPN bits.
        for way in 0..STLB_WAYS {
            let index = way * STLB_SETS + stlb_idx;
            let entry = &self.tlb[index];
            if !entry.enabled() || !self.entry_matches_gid(entry) {
                continue;
            }
            if (entry.global() || entry.asid() == csr_asid)
                && vpn == entry.vppn() >> compare_shift
            {
                return Some(index);
            }
        }

        // MTLB: fully associative, per-entry page size.
        for index in STLB_ENTRIES..TLB_ENTRIES {
            let entry = &self.tlb[index];
            if !entry.enabled() || !self.entry_matches_gid(entry) {
                continue;
            }
            let ps = self.entry_page_size(index);
            let compare_shift = (ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);
            let vpn = (vaddr & VIRT_MASK) >> (ps + 1);
            if (entry.global() || entry.asid() == csr_asid)
                && vpn == entry.vppn() >> compare_shift
            {
                return Some(index);
            }
        }
        None
    }

    /// `tlbrd`: copies the entry at the effective `TLBIDX.INDEX` into the
    /// CSR window, or reports it as non-existent if disabled or owned by a
    /// different guest.
    pub fn tlbrd(&mut self, _mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let index = tlbidx::index.read(self.effective_bank().tlbidx) as usize;
        let visible = index < TLB_ENTRIES
            && self.entry_matches_gid(&self.tlb[index])
            && self.tlb[index].enabled();

        if !visible {
            let bank = self.effective_bank_mut();
            bank.tlbidx = tlbidx::ne.val(1).modify(bank.tlbidx);
            bank.asid = asid::asid.val(0).modify(bank.asid);
            bank.tlbehi = 0;
            bank.tlbelo0 = 0;
            bank.tlbelo1 = 0;
            bank.tlbidx = tlbidx::ps.val(0).modify(bank.tlbidx);
            return Ok(());
        }

        let entry = self.tlb[index];
        let ps = self.entry_page_size(index);
        let bank = self.effective_bank_mut();
        bank.tlbidx = (tlbidx::ne.val(0) + tlbidx::ps.val(ps as u64 & 0x3f)).modify(bank.tlbidx);
        bank.tlbehi = entry.vppn() << TLB_MISC_VPPN_SHIFT;
        bank.tlbelo0 = entry.entry0;
        bank.tlbelo1 = entry.entry1;
        bank.asid = asid::asid.val(entry.asid() as u64).modify(bank.asid);
        Ok(())
    }

    /// `tlbwr`: replaces the entry at the effective `TLBIDX.INDEX`, or
    /// invalidates it when `TLBIDX.NE` is set.
    pub fn tlbwr(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let index = tlbidx::index.read(self.effective_bank().tlbidx) as usize;
        if index >= TLB_ENTRIES {
            warn!(target: "guest_error", "tlbwr index {} out of range", index);
            return Ok(());
        }
        // A live entry owned by another guest is off limits.
        if self.tlb[index].enabled() && !self.entry_matches_gid(&self.tlb[index]) {
            warn!(
                target: "guest_error",
                "tlbwr at {} targets GID {} from GID {}",
                index,
                self.tlb[index].gid(),
                self.effective_gid()
            );
            return Ok(());
        }

        self.flush_entry_pages(mach, index);

        if tlbidx::ne.read(self.effective_bank().tlbidx) != 0 {
            self.tlb[index].invalidate();
            return Ok(());
        }
        self.fill_tlb_entry(index);
        Ok(())
    }

    /// `tlbfill`: fills a randomly chosen slot. STLB-sized pages land in a
    /// random way of the set their address selects, everything else in a
    /// random MTLB slot.
    pub fn tlbfill(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let bank = self.effective_bank();
        let (entryhi, pagesize) = if tlbrera::istlbr.read(bank.tlbrera) != 0 {
            (bank.tlbrehi, tlbrehi::ps.read(bank.tlbrehi) as u8)
        } else {
            (bank.tlbehi, tlbidx::ps.read(bank.tlbidx) as u8)
        };
        let stlb_ps = self.stlb_page_size();

        let index = if pagesize == stlb_ps {
            // Only bits [47:13] participate in set selection.
            let address = entryhi & !((1u64 << TLB_MISC_VPPN_SHIFT) - 1);
            let way = Self::random_in(mach, 0, STLB_WAYS as u32 - 1) as usize;
            let stlb_idx = ((address >> (stlb_ps + 1)) & 0xff) as usize;
            way * STLB_SETS + stlb_idx
        } else {
            Self::random_in(mach, STLB_ENTRIES as u32, TLB_ENTRIES as u32 - 1) as usize
        };

        // Never evict a live mapping that belongs to another guest.
        if self.tlb[index].enabled() && !self.entry_matches_gid(&self.tlb[index]) {
            warn!(
                target: "guest_error",
                "tlbfill victim {} owned by GID {}", index, self.tlb[index].gid()
            );
            return Ok(());
        }

        self.flush_entry_pages(mach, index);
        self.fill_tlb_entry(index);
        Ok(())
    }

    /// `tlbclr`: invalidates non-global entries with the effective ASID, in
    /// the STLB set selected by `TLBIDX.INDEX` or the whole MTLB.
    pub fn tlbclr(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let bank = self.effective_bank();
        let csr_asid = asid::asid.read(bank.asid) as u16;
        let index = tlbidx::index.read(bank.tlbidx) as usize;

        if index < STLB_ENTRIES {
            for way in 0..STLB_WAYS {
                let i = way * STLB_SETS + (index % STLB_SETS);
                let entry = self.tlb[i];
                if !self.entry_matches_gid(&entry) {
                    continue;
                }
                if !entry.global() && entry.asid() == csr_asid {
                    self.tlb[i].invalidate();
                }
            }
        } else if index < TLB_ENTRIES {
            for i in STLB_ENTRIES..TLB_ENTRIES {
                let entry = self.tlb[i];
                if !self.entry_matches_gid(&entry) {
                    continue;
                }
                if !entry.global() && entry.asid() == csr_asid {
                    self.tlb[i].invalidate();
                }
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// `tlbflush`: invalidates the STLB set selected by `TLBIDX.INDEX` or
    /// the whole MTLB, regardless of ASID or the global bit.
    pub fn tlbflush(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let index = tlbidx::index.read(self.effective_bank().tlbidx) as usize;
        if index < STLB_ENTRIES {
            for way in 0..STLB_WAYS {
                let i = way * STLB_SETS + (index % STLB_SETS);
                if self.entry_matches_gid(&self.tlb[i]) {
                    self.tlb[i].invalidate();
                }
            }
        } else if index < TLB_ENTRIES {
            for i in STLB_ENTRIES..TLB_ENTRIES {
                if self.entry_matches_gid(&self.tlb[i]) {
                    self.tlb[i].invalidate();
                }
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// `invtlb` op 0/1: invalidates every entry of the current context.
    pub fn invtlb_all(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        for i in 0..TLB_ENTRIES {
            if self.entry_matches_gid(&self.tlb[i]) {
                self.tlb[i].invalidate();
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// `invtlb` op 2/3: invalidates entries whose global bit equals `g`.
    pub fn invtlb_all_g(
        &mut self,
        mach: &mut dyn MachineContext,
        g: bool,
    ) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        for i in 0..TLB_ENTRIES {
            let entry = self.tlb[i];
            if entry.global() == g && self.entry_matches_gid(&entry) {
                self.tlb[i].invalidate();
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// `invtlb` op 4: invalidates non-global entries with the given ASID.
    pub fn invtlb_all_asid(
        &mut self,
        mach: &mut dyn MachineContext,
        info: u64,
    ) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let asid = (info & 0x3ff) as u16;
        for i in 0..TLB_ENTRIES {
            let entry = self.tlb[i];
            if !entry.global() && entry.asid() == asid && self.entry_matches_gid(&entry) {
                self.tlb[i].invalidate();
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// Invalidates the non-global entries of `gid` tagged with `asid`.
    /// Backs the guest-mode `CSR_ASID` write side effect, which retires the
    /// outgoing address space's first-stage mappings.
    pub(crate) fn invalidate_gid_asid_entries(&mut self, gid: u8, asid: u16) {
        for i in 0..TLB_ENTRIES {
            let entry = self.tlb[i];
            if entry.enabled() && !entry.global() && entry.gid() == gid && entry.asid() == asid {
                self.tlb[i].invalidate();
            }
        }
    }

    /// `invtlb` op 5: invalidates the non-global entry with the given ASID
    /// covering `addr`. Global entries survive.
    pub fn invtlb_page_asid(
        &mut self,
        mach: &mut dyn MachineContext,
        info: u64,
        addr: u64,
    ) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let asid = (info & 0x3ff) as u16;
        for i in 0..TLB_ENTRIES {
            let entry = self.tlb[i];
            if !entry.enabled() || !self.entry_matches_gid(&entry) {
                continue;
            }
            let ps = self.entry_page_size(i);
            let vpn = (addr & VIRT_MASK) >> (ps + 1);
            let compare_shift = (ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);
            if !entry.global() && entry.asid() == asid && vpn == entry.vppn() >> compare_shift {
                self.tlb[i].invalidate();
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }

    /// `invtlb` op 6: like op 5, but global entries covering the page are
    /// invalidated as well.
    pub fn invtlb_page_asid_or_g(
        &mut self,
        mach: &mut dyn MachineContext,
        info: u64,
        addr: u64,
    ) -> Result<(), Exception> {
        self.tlb_op_guard()?;

        let asid = (info & 0x3ff) as u16;
        for i in 0..TLB_ENTRIES {
            let entry = self.tlb[i];
            if !entry.enabled() || !self.entry_matches_gid(&entry) {
                continue;
            }
            let ps = self.entry_page_size(i);
            let vpn = (addr & VIRT_MASK) >> (ps + 1);
            let compare_shift = (ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);
            if (entry.global() || entry.asid() == asid) && vpn == entry.vppn() >> compare_shift {
                self.tlb[i].invalidate();
            }
        }
        mach.flush_translation_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SecondLevelPolicy;
    use crate::test_stubs::{lvz_cpucfg, TestMachine};
    use loongarch_regs::{gstat, gtlbc, tlbentry_64};

    const PS_16K: u8 = 0xe;

    fn host_cpu() -> CpuState {
        CpuState::new(lvz_cpucfg())
    }

    fn guest_cpu(gid: u8) -> CpuState {
        let mut cpu = host_cpu();
        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        cpu.csr.gstat =
            (gstat::vm.val(1) + gstat::gid.val(gid as u64)).modify(cpu.csr.gstat);
        cpu
    }

    // Loads the CSR window with a mapping for `va` and returns the entry
    // fields tlbwr would stamp.
    fn load_window(cpu: &mut CpuState, va: u64, pa: u64, index: usize) {
        let bank = cpu.effective_bank_mut();
        bank.tlbehi = va & !0x1fff;
        bank.tlbelo0 = (tlbentry::v.val(1) + tlbentry::d.val(1)).modify(0)
            | tlbentry_64::ppn.val(pa >> 12).modify(0);
        bank.tlbelo1 = (tlbentry::v.val(1) + tlbentry::d.val(1)).modify(0)
            | tlbentry_64::ppn.val((pa + (1 << PS_16K)) >> 12).modify(0);
        bank.tlbidx = (tlbidx::index.val(index as u64)
            + tlbidx::ps.val(PS_16K as u64)
            + tlbidx::ne.val(0))
        .modify(bank.tlbidx);
    }

    #[test]
    fn tlbwr_then_tlbrd_round_trips() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();

        cpu.csr.asid = asid::asid.val(7).modify(cpu.csr.asid);
        load_window(&mut cpu, 0x4000_0000, 0x8000_0000, 100);
        let (ehi, lo0, lo1) = (cpu.csr.tlbehi, cpu.csr.tlbelo0, cpu.csr.tlbelo1);

        cpu.tlbwr(&mut mach).unwrap();
        assert!(cpu.tlb[100].enabled());

        // Scramble the window, then read the entry back.
        cpu.csr.tlbehi = 0;
        cpu.csr.tlbelo0 = 0;
        cpu.csr.tlbelo1 = 0;
        cpu.csr.asid = asid::asid.val(0).modify(cpu.csr.asid);
        cpu.tlbrd(&mut mach).unwrap();

        assert_eq!(cpu.csr.tlbehi, ehi);
        assert_eq!(cpu.csr.tlbelo0, lo0);
        assert_eq!(cpu.csr.tlbelo1, lo1);
        assert_eq!(asid::asid.read(cpu.csr.asid), 7);
        assert_eq!(tlbidx::ne.read(cpu.csr.tlbidx), 0);
    }

    #[test]
    fn tlbsrch_finds_stlb_entry() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();

        let va = 0x4000_0000u64;
        load_window(&mut cpu, va, 0x8000_0000, 0);
        // Place the entry where the set hash will look for it.
        let set = ((va >> (PS_16K + 1)) & 0xff) as usize;
        cpu.csr.tlbidx = tlbidx::index.val(set as u64).modify(cpu.csr.tlbidx);
        cpu.tlbwr(&mut mach).unwrap();

        cpu.csr.tlbidx = tlbidx::index.val(0).modify(cpu.csr.tlbidx);
        cpu.csr.tlbehi = va & !0x1fff;
        cpu.tlbsrch(&mut mach).unwrap();
        assert_eq!(tlbidx::ne.read(cpu.csr.tlbidx), 0);
        assert_eq!(tlbidx::index.read(cpu.csr.tlbidx) as usize, set);
    }

    #[test]
    fn tlbsrch_miss_sets_ne() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();

        cpu.csr.tlbehi = 0x4000_0000;
        cpu.tlbsrch(&mut mach).unwrap();
        assert_eq!(tlbidx::ne.read(cpu.csr.tlbidx), 1);
    }

    #[test]
    fn tlbrd_of_foreign_entry_reports_nonexistent() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        // A VMM-owned entry at index 5.
        let mut entry = TlbEntry::default();
        entry.set_enabled(true);
        entry.set_gid(0);
        entry.set_vppn(0x123);
        cpu.tlb[5] = entry;

        cpu.gcsr.tlbidx = tlbidx::index.val(5).modify(cpu.gcsr.tlbidx);
        cpu.gcsr.tlbehi = 0xdead;
        cpu.tlbrd(&mut mach).unwrap();

        assert_eq!(tlbidx::ne.read(cpu.gcsr.tlbidx), 1);
        assert_eq!(cpu.gcsr.tlbehi, 0);
        // The foreign entry is untouched.
        assert_eq!(cpu.tlb[5], entry);
    }

    #[test]
    fn tlbfill_stlb_page_size_uses_set_hash() {
        let mut cpu = host_cpu();
        // Way 3 for the first random draw.
        let mut mach = TestMachine::default();
        mach.random_values.push(3);

        let va = 0x0000_0000_0200_0000u64;
        load_window(&mut cpu, va, 0x8000_0000, 0);
        cpu.tlbfill(&mut mach).unwrap();

        let set = ((va >> (PS_16K + 1)) & 0xff) as usize;
        let index = 3 * STLB_SETS + set;
        assert!(cpu.tlb[index].enabled());
    }

    #[test]
    fn tlbfill_other_page_size_uses_mtlb() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();
        mach.random_values.push(10);

        load_window(&mut cpu, 0x4000_0000, 0x8000_0000, 0);
        // A 4KiB page cannot live in the 16KiB STLB.
        let bank = cpu.effective_bank_mut();
        bank.tlbidx = tlbidx::ps.val(0xc).modify(bank.tlbidx);
        cpu.tlbfill(&mut mach).unwrap();

        assert!(cpu.tlb[STLB_ENTRIES + 10].enabled());
    }

    #[test]
    fn tlbclr_spares_global_and_other_asid() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();

        cpu.csr.asid = asid::asid.val(7).modify(cpu.csr.asid);

        let mut matching = TlbEntry::default();
        matching.set_enabled(true);
        matching.set_asid(7);
        cpu.tlb[0] = matching;

        let mut global = TlbEntry::default();
        global.set_enabled(true);
        global.set_asid(7);
        global.entry0 = tlbentry::g.val(1).modify(global.entry0);
        cpu.tlb[STLB_SETS] = global; // way 1, same set

        let mut other = TlbEntry::default();
        other.set_enabled(true);
        other.set_asid(9);
        cpu.tlb[2 * STLB_SETS] = other; // way 2, same set

        cpu.csr.tlbidx = tlbidx::index.val(0).modify(cpu.csr.tlbidx);
        cpu.tlbclr(&mut mach).unwrap();

        assert!(!cpu.tlb[0].enabled());
        assert!(cpu.tlb[STLB_SETS].enabled());
        assert!(cpu.tlb[2 * STLB_SETS].enabled());
        assert_eq!(mach.full_flushes, 1);
    }

    #[test]
    fn invtlb_page_asid_respects_global() {
        let mut cpu = host_cpu();
        let mut mach = TestMachine::default();

        let va = 0x4000_0000u64;
        let vppn = (va & VIRT_MASK) >> TLB_MISC_VPPN_SHIFT;

        let mut global = TlbEntry::default();
        global.set_enabled(true);
        global.set_asid(7);
        global.set_vppn(vppn);
        global.entry0 = tlbentry::g.val(1).modify(global.entry0);
        cpu.tlb[0] = global;

        cpu.invtlb_page_asid(&mut mach, 7, va).unwrap();
        assert!(cpu.tlb[0].enabled());

        cpu.invtlb_page_asid_or_g(&mut mach, 7, va).unwrap();
        assert!(!cpu.tlb[0].enabled());
    }

    #[test]
    fn guest_helpers_leave_foreign_entries_intact() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        let mut vmm = TlbEntry::default();
        vmm.set_enabled(true);
        vmm.set_gid(0);
        vmm.set_asid(1);
        cpu.tlb[0] = vmm;

        let mut other_guest = TlbEntry::default();
        other_guest.set_enabled(true);
        other_guest.set_gid(5);
        other_guest.set_asid(1);
        cpu.tlb[STLB_ENTRIES] = other_guest;

        cpu.invtlb_all(&mut mach).unwrap();
        cpu.tlbflush(&mut mach).unwrap();

        assert_eq!(cpu.tlb[0], vmm);
        assert_eq!(cpu.tlb[STLB_ENTRIES], other_guest);
    }

    #[test]
    fn guest_tlb_ops_trap_when_toti_set() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();
        cpu.csr.gtlbc = gtlbc::toti.val(1).modify(cpu.csr.gtlbc);

        assert_eq!(
            cpu.tlbflush(&mut mach).unwrap_err(),
            Exception::HypervisorCall
        );
        assert_eq!(cpu.vm_exit_ctx.reason, Some(VmExitReason::Tlb));
    }

    #[test]
    fn fill_without_lvz_capability_keeps_gid_zero() {
        let mut cfg = lvz_cpucfg();
        cfg[2] = 0;
        let mut cpu = CpuState::new(cfg);
        let mut mach = TestMachine::default();

        load_window(&mut cpu, 0x4000_0000, 0x8000_0000, 20);
        cpu.tlbwr(&mut mach).unwrap();
        assert!(cpu.tlb[20].enabled());
        assert_eq!(cpu.tlb[20].gid(), 0);
    }

    #[test]
    fn fill_stamps_current_gid() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        load_window(&mut cpu, 0x4000_0000, 0x8000_0000, 50);
        cpu.tlbwr(&mut mach).unwrap();
        assert_eq!(cpu.tlb[50].gid(), 3);
    }
}
