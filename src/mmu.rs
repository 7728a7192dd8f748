// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The translation engine.
//!
//! Maps a virtual address and access type to a physical address or a fault:
//! direct-addressing shortcut, then the four direct-mapped windows, then the
//! canonical-address check, then the GID/ASID-filtered TLB. Under active
//! virtualization the result is a guest physical address and is fed through
//! the second-level (GID 0) translation; misses there become VM exits.

use core::ops::BitOr;

use log::{trace, warn};
use loongarch_regs::{
    asid, crmd, dbg, dmw, pwch, pwcl, stlbps, tlbentry, tlbentry_64, tlbrehi, tlbrera, Exception,
    VmExitReason, TLBENTRY_64_PPN_SHIFT, TLB_MISC_VPPN_SHIFT,
};

use crate::cpu::{
    CpuState, GpaClass, MachineContext, MemAccess, SecondLevelPolicy, MMU_KERNEL_IDX,
    MMU_USER_IDX, PHYS_MASK, VIRT_ADDR_BITS, VIRT_MASK,
};
use crate::tlb::{MAX_PS, MTLB_ENTRIES, STLB_ENTRIES, STLB_SETS, STLB_WAYS, TLB_ENTRIES};

/// Access permissions of a completed translation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Prot(u8);

impl Prot {
    pub const NONE: Prot = Prot(0);
    pub const READ: Prot = Prot(1);
    pub const WRITE: Prot = Prot(2);
    pub const EXEC: Prot = Prot(4);
    pub const ALL: Prot = Prot(7);

    pub fn contains(&self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        Prot(self.0 | rhs.0)
    }
}

/// Why a translation could not complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlbFault {
    /// Non-canonical virtual address.
    BadAddr,
    /// No TLB entry covers the address; drives the refill path.
    NoMatch,
    /// Matching entry with a clear valid bit.
    Invalid,
    /// Store through a clean page.
    Dirty,
    /// Fetch from an execute-inhibited page.
    ExecInhibit,
    /// Load from a read-inhibited page.
    ReadInhibit,
    /// Privilege check failed.
    Privilege,
    /// Second-level translation requires the hypervisor; the VM exit
    /// context has already been captured.
    SecondLevel,
}

/// A successful translation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub pa: u64,
    pub prot: Prot,
}

impl CpuState {
    /// Translates `va` for the given access under the current CSR and TLB
    /// state. Pure: no state is modified, no fault is recorded. Under
    /// virtualization the result is a guest physical address.
    pub fn get_physical_address(
        &self,
        va: u64,
        access: MemAccess,
        mmu_idx: u32,
    ) -> Result<Translation, TlbFault> {
        let da = crmd::da.read(self.csr.crmd) != 0;
        let pg = crmd::pg.read(self.csr.crmd) != 0;
        if da && !pg {
            return Ok(Translation {
                pa: va & PHYS_MASK,
                prot: Prot::ALL,
            });
        }

        // Direct-mapped windows. The window's low bits double as its PLV
        // permission mask.
        let plv_mask: u64 = match mmu_idx {
            MMU_KERNEL_IDX => 1,
            MMU_USER_IDX => 1 << 3,
            _ => 0,
        };
        for i in 0..4 {
            let win = self.csr.dmw[i];
            if plv_mask & win != 0 && dmw::vseg.read(win) == va >> 60 {
                return Ok(Translation {
                    pa: va & VIRT_MASK,
                    prot: Prot::ALL,
                });
            }
        }

        // Bits above the implemented address space must be a sign extension.
        let addr_high = (va as i64) >> VIRT_ADDR_BITS;
        if addr_high != 0 && addr_high != -1 {
            return Err(TlbFault::BadAddr);
        }

        let index = self.tlb_lookup(va).ok_or(TlbFault::NoMatch)?;
        self.map_tlb_entry(index, va, access, mmu_idx)
    }

    // Decodes the matched entry and enforces its permission bits.
    fn map_tlb_entry(
        &self,
        index: usize,
        va: u64,
        access: MemAccess,
        mmu_idx: u32,
    ) -> Result<Translation, TlbFault> {
        let entry = &self.tlb[index];
        let plv = mmu_idx as u64;
        let tlb_ps = self.entry_page_size(index);
        let odd = (va >> tlb_ps) & 1 != 0;
        let desc = entry.descriptor(odd);

        let valid = tlbentry::v.read(desc) != 0;
        let dirty = tlbentry::d.read(desc) != 0;
        let entry_plv = tlbentry::plv.read(desc);
        let mut ppn = tlbentry_64::ppn.read(desc);
        let (nx, nr, rplv) = if self.is_la64() {
            (
                tlbentry_64::nx.read(desc) != 0,
                tlbentry_64::nr.read(desc) != 0,
                tlbentry_64::rplv.read(desc),
            )
        } else {
            (false, false, 0)
        };

        // Software bits may live between bit 12 and the page-size bit.
        if tlb_ps > 12 {
            ppn &= !((1u64 << (tlb_ps - 12)) - 1);
        }

        if !valid {
            return Err(TlbFault::Invalid);
        }
        if access == MemAccess::Fetch && nx {
            return Err(TlbFault::ExecInhibit);
        }
        if access == MemAccess::Load && nr {
            return Err(TlbFault::ReadInhibit);
        }
        if (rplv == 0 && plv > entry_plv) || (rplv == 1 && plv != entry_plv) {
            return Err(TlbFault::Privilege);
        }
        if access == MemAccess::Store && !dirty {
            return Err(TlbFault::Dirty);
        }

        let pa = (ppn << TLBENTRY_64_PPN_SHIFT) | (va & ((1u64 << tlb_ps) - 1));
        let mut prot = Prot::READ;
        if dirty {
            prot = prot | Prot::WRITE;
        }
        if !nx {
            prot = prot | Prot::EXEC;
        }
        Ok(Translation { pa, prot })
    }

    /// Records a translation fault into the effective CSR bank and returns
    /// the exception to deliver. `NoMatch` arms the TLB refill window.
    pub fn record_mmu_fault(&mut self, va: u64, access: MemAccess, fault: TlbFault) -> Exception {
        let exception = match fault {
            TlbFault::BadAddr => match access {
                MemAccess::Fetch => Exception::AddressErrorFetch,
                _ => Exception::AddressErrorAccess,
            },
            TlbFault::NoMatch | TlbFault::Invalid => match access {
                MemAccess::Load => Exception::PageInvalidLoad,
                MemAccess::Store => Exception::PageInvalidStore,
                MemAccess::Fetch => Exception::PageInvalidFetch,
            },
            TlbFault::Dirty => Exception::PageModified,
            TlbFault::ExecInhibit => Exception::PageNonExecutable,
            TlbFault::ReadInhibit => Exception::PageNonReadable,
            TlbFault::Privilege => Exception::PagePrivilege,
            // The VM exit controller already captured the context.
            TlbFault::SecondLevel => return Exception::HypervisorCall,
        };

        let stlb_ps = self.stlb_page_size();
        let bank = self.effective_bank_mut();
        if fault == TlbFault::NoMatch {
            bank.tlbrera = tlbrera::istlbr.val(1).modify(bank.tlbrera);
            bank.tlbrbadv = va;
            bank.tlbrehi = tlbrehi::vppn
                .val((va >> TLB_MISC_VPPN_SHIFT) & ((1 << 35) - 1))
                .modify(bank.tlbrehi);
        } else {
            if dbg::dst.read(bank.dbg) == 0 {
                bank.badv = va;
            }
            bank.tlbehi = va & !((1u64 << (stlb_ps + 1)) - 1);
        }
        exception
    }

    /// Translation entry point for the address-space fabric: performs the
    /// one- or two-stage walk, records faults, and reports the exception the
    /// caller should raise. The caller installs the mapping on success.
    pub fn translate_for_access(
        &mut self,
        mach: &mut dyn MachineContext,
        va: u64,
        access: MemAccess,
        mmu_idx: u32,
    ) -> Result<Translation, Exception> {
        let result = if self.second_level_enabled() {
            self.translate_two_stage(mach, va, access, mmu_idx)
        } else {
            self.get_physical_address(va, access, mmu_idx)
        };
        match result {
            Ok(translation) => {
                trace!(
                    target: "mmu",
                    "address={:#x} physical={:#x} prot {}",
                    va,
                    translation.pa,
                    translation.prot.bits()
                );
                Ok(translation)
            }
            Err(fault) => {
                trace!(target: "mmu", "address={:#x} fault {:?}", va, fault);
                Err(self.record_mmu_fault(va, access, fault))
            }
        }
    }

    // Guest translation: GVA -> GPA through the guest's own entries, then
    // GPA -> HPA through the VMM entries. Either stage can hand control to
    // the hypervisor.
    fn translate_two_stage(
        &mut self,
        mach: &mut dyn MachineContext,
        va: u64,
        access: MemAccess,
        mmu_idx: u32,
    ) -> Result<Translation, TlbFault> {
        let stage1 = match self.get_physical_address(va, access, mmu_idx) {
            Ok(t) => t,
            Err(fault) => {
                trace!(target: "mmu", "stage 1 failed: va={:#x} fault {:?}", va, fault);
                self.vm_exit(VmExitReason::Tlb, va, 0, Some(access));
                return Err(TlbFault::SecondLevel);
            }
        };
        trace!(target: "mmu", "stage 1 complete: va={:#x} gpa={:#x}", va, stage1.pa);

        let hpa = self.second_level_translate(mach, va, stage1.pa, access)?;
        trace!(target: "mmu", "stage 2 complete: gpa={:#x} hpa={:#x}", stage1.pa, hpa);
        Ok(Translation {
            pa: hpa,
            prot: stage1.prot,
        })
    }

    /// Second-level translation of a guest physical address. A miss either
    /// exits to the hypervisor or, under the identity-map debug policy,
    /// passes the GPA through.
    pub(crate) fn second_level_translate(
        &mut self,
        mach: &mut dyn MachineContext,
        gva: u64,
        gpa: u64,
        access: MemAccess,
    ) -> Result<u64, TlbFault> {
        if !self.second_level_enabled() {
            return Ok(gpa);
        }

        if let Some(hpa) = self.vmm_tlb_lookup(gpa) {
            return Ok(hpa);
        }

        match mach.classify_gpa(gpa) {
            // Device windows always need the hypervisor.
            GpaClass::Mmio | GpaClass::Iocsr => {
                trace!(target: "mmu", "second-level MMIO trap: gpa={:#x}", gpa);
                self.vm_exit(VmExitReason::Mmio, gva, gpa, Some(access));
                Err(TlbFault::SecondLevel)
            }
            GpaClass::Ram => {
                if self.vm_exit_gated(&VmExitReason::Mmio) {
                    self.vm_exit(VmExitReason::Mmio, gva, gpa, Some(access));
                    return Err(TlbFault::SecondLevel);
                }
                match self.second_level_policy {
                    SecondLevelPolicy::IdentityMap => Ok(gpa),
                    SecondLevelPolicy::Fault => {
                        self.vm_exit(VmExitReason::Tlb, gva, gpa, Some(access));
                        Err(TlbFault::SecondLevel)
                    }
                }
            }
        }
    }

    /// Looks up the VMM (GID 0) mapping covering `gpa`, returning the host
    /// physical address on a hit.
    pub(crate) fn vmm_tlb_lookup(&self, gpa: u64) -> Option<u64> {
        let host_stlb_ps = (stlbps::ps.read(self.csr.stlbps) as u8).min(MAX_PS);
        for index in 0..TLB_ENTRIES {
            let entry = &self.tlb[index];
            if !entry.enabled() || entry.gid() != 0 {
                continue;
            }
            let ps = if index >= STLB_ENTRIES {
                entry.raw_page_size().min(MAX_PS)
            } else {
                host_stlb_ps
            };
            let compare_shift = (ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);
            let vpn = (gpa & VIRT_MASK) >> (ps + 1);
            if vpn != entry.vppn() >> compare_shift {
                continue;
            }
            let desc = entry.descriptor((gpa >> ps) & 1 != 0);
            if tlbentry::v.read(desc) == 0 {
                continue;
            }
            let mut ppn = tlbentry_64::ppn.read(desc);
            if ps > 12 {
                ppn &= !((1u64 << (ps - 12)) - 1);
            }
            return Some((ppn << TLBENTRY_64_PPN_SHIFT) | (gpa & ((1u64 << ps) - 1)));
        }
        None
    }

    /// Hypervisor-side fill of a first-stage mapping for the current guest.
    pub fn fill_guest_tlb(&mut self, mach: &mut dyn MachineContext, va: u64, gpa: u64, ps: u8) {
        if !self.is_guest_mode() {
            return;
        }
        let gid = self.guest_id();
        self.fill_software_entry(mach, va, gpa, ps, gid);
        trace!(target: "mmu", "fill guest TLB: va={:#x} gpa={:#x} gid={}", va, gpa, gid);
    }

    /// Hypervisor-side fill of a second-stage (VMM) mapping.
    pub fn fill_vmm_tlb(&mut self, mach: &mut dyn MachineContext, gpa: u64, hpa: u64, ps: u8) {
        self.fill_software_entry(mach, gpa, hpa, ps, 0);
        trace!(target: "mmu", "fill VMM TLB: gpa={:#x} hpa={:#x}", gpa, hpa);
    }

    // Builds a present, dirty, kernel-privilege entry for the selected half
    // of the page pair, choosing the victim slot with the same random policy
    // as tlbfill.
    fn fill_software_entry(
        &mut self,
        mach: &mut dyn MachineContext,
        va: u64,
        pa: u64,
        ps: u8,
        gid: u8,
    ) {
        let host_stlb_ps = (stlbps::ps.read(self.csr.stlbps) as u8).min(MAX_PS);
        let index = if ps == host_stlb_ps {
            let way = (mach.guest_random() % STLB_WAYS as u32) as usize;
            let set = (((va & VIRT_MASK) >> (ps + 1)) & 0xff) as usize;
            way * STLB_SETS + set
        } else {
            STLB_ENTRIES + (mach.guest_random() % MTLB_ENTRIES as u32) as usize
        };

        let victim = self.tlb[index];
        if victim.enabled() && victim.gid() != gid {
            warn!(
                target: "guest_error",
                "software TLB fill victim {} owned by GID {}", index, victim.gid()
            );
            return;
        }
        self.flush_entry_pages(mach, index);

        let csr_asid = asid::asid.read(self.effective_bank().asid) as u16;
        let entry = &mut self.tlb[index];
        *entry = Default::default();
        entry.set_vppn((va & VIRT_MASK) >> TLB_MISC_VPPN_SHIFT);
        entry.set_asid(csr_asid);
        entry.set_gid(gid);
        if index >= STLB_ENTRIES {
            entry.set_page_size(ps);
        }
        entry.set_enabled(true);

        let desc = (tlbentry::v.val(1) + tlbentry::d.val(1)).modify(0)
            | tlbentry_64::ppn.val((pa & PHYS_MASK) >> TLBENTRY_64_PPN_SHIFT).modify(0);
        if (va >> ps) & 1 != 0 {
            entry.entry1 = desc;
        } else {
            entry.entry0 = desc;
        }
    }

    /// Invalidates every first-stage entry belonging to `gid`.
    pub fn clear_guest_tlb_by_gid(&mut self, mach: &mut dyn MachineContext, gid: u8) {
        for i in 0..TLB_ENTRIES {
            let entry = &mut self.tlb[i];
            if entry.gid() == gid && entry.gid() != 0 {
                entry.invalidate();
            }
        }
        mach.flush_translation_cache();
        trace!(target: "mmu", "cleared guest TLB for gid={}", gid);
    }

    /// Finds the first-stage entry of `gid` covering `va`, if any.
    pub fn search_guest_tlb(&self, va: u64, gid: u8) -> Option<usize> {
        if gid == 0 {
            return None;
        }
        (0..TLB_ENTRIES).find(|&i| {
            let entry = &self.tlb[i];
            if !entry.enabled() || entry.gid() != gid {
                return false;
            }
            let ps = self.entry_page_size(i);
            let compare_shift = (ps as u64 + 1).saturating_sub(TLB_MISC_VPPN_SHIFT);
            (va & VIRT_MASK) >> (ps + 1) == entry.vppn() >> compare_shift
        })
    }

    // Directory base and width for the given walk level; level 0 is the
    // leaf page table itself.
    fn dir_base_width(&self, level: u64) -> (u64, u64) {
        let bank = self.effective_bank();
        match level {
            1 => (
                pwcl::dir1_base.read(bank.pwcl),
                pwcl::dir1_width.read(bank.pwcl),
            ),
            2 => (
                pwcl::dir2_base.read(bank.pwcl),
                pwcl::dir2_width.read(bank.pwcl),
            ),
            3 => (
                pwch::dir3_base.read(bank.pwch),
                pwch::dir3_width.read(bank.pwch),
            ),
            4 => (
                pwch::dir4_base.read(bank.pwch),
                pwch::dir4_width.read(bank.pwch),
            ),
            _ => (
                pwcl::ptbase.read(bank.pwcl),
                pwcl::ptwidth.read(bank.pwcl),
            ),
        }
    }

    /// `lddir`: loads the next-level directory entry for the refill address.
    /// Out-of-range levels are a logged no-op returning the input.
    pub fn lddir(
        &mut self,
        mach: &mut dyn MachineContext,
        base: u64,
        level: u64,
        _mem_idx: u32,
    ) -> u64 {
        if level == 0 || level > 4 {
            warn!(target: "guest_error", "attempted lddir with level {}", level);
            return base;
        }

        if tlbentry::huge.read(base) != 0 {
            if level == 4 {
                warn!(target: "guest_error", "attempted use of level 4 huge page");
            }
            if tlbentry::level.read(base) != 0 {
                return base;
            }
            return tlbentry::level.val(level).modify(base);
        }

        let badvaddr = self.effective_bank().tlbrbadv;
        let base = base & PHYS_MASK;

        let shift = (pwcl::ptewidth.read(self.effective_bank().pwcl) + 1) * 3;
        let (dir_base, dir_width) = self.dir_base_width(level);
        let index = (badvaddr >> dir_base) & ((1 << dir_width) - 1);
        mach.load_phys(base | (index << shift)) & PHYS_MASK
    }

    /// `ldpte`: loads one half of the page pair into the refill window and
    /// records its page size. Huge directory entries are split into their
    /// even/odd halves.
    pub fn ldpte(&mut self, mach: &mut dyn MachineContext, base: u64, odd: bool, _mem_idx: u32) {
        let bank = self.effective_bank();
        let ptbase = pwcl::ptbase.read(bank.pwcl);
        let ptwidth = pwcl::ptwidth.read(bank.pwcl);
        let badv = bank.tlbrbadv;

        let base = base & PHYS_MASK;
        let (value, ps) = if tlbentry::huge.read(base) != 0 {
            let (dir_base, dir_width) = self.dir_base_width(tlbentry::level.read(base));

            // Strip the level/huge markers and promote HGLOBAL to G.
            let mut value = tlbentry::level.val(0).modify(base);
            value = tlbentry::huge.val(0).modify(value);
            if tlbentry::hglobal.read(value) != 0 {
                value = tlbentry::hglobal.val(0).modify(value);
                value = tlbentry::g.val(1).modify(value);
            }

            // A huge page loads as an even/odd pair of half-size pages.
            let ps = (dir_base + dir_width).saturating_sub(1).min(MAX_PS as u64);
            if odd {
                value += 1u64 << ps;
            }
            (value, ps)
        } else {
            let shift = (pwcl::ptewidth.read(bank.pwcl) + 1) * 3;
            let ptindex = ((badv >> ptbase) & ((1 << ptwidth) - 1)) & !0x1;
            let offset = (ptindex + odd as u64) << shift;
            (mach.load_phys(base | offset) & PHYS_MASK, ptbase)
        };

        let bank = self.effective_bank_mut();
        if odd {
            bank.tlbrelo1 = value;
        } else {
            bank.tlbrelo0 = value;
        }
        bank.tlbrehi = tlbrehi::ps.val(ps).modify(bank.tlbrehi);
    }
}
