// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! CSR banks and the mediated access path.
//!
//! Two flat records of the same shape hold the host (`CSR_*`) and guest
//! shadow (`GCSR_*`) register files. Every architectural access goes through
//! the mediator on [`CpuState`], which routes to the bank selected by
//! `GSTAT.VM` and applies the per-register guest trap policy from `GCFG`.

use loongarch_regs::{
    asid, crmd, gcfg, stlbps, tlbrera, Exception, VmExitReason, CSR_ASID, CSR_BADI, CSR_BADV,
    CSR_CNTC, CSR_CPUID, CSR_CRMD, CSR_CTAG, CSR_DBG, CSR_DERA, CSR_DMW_BASE, CSR_DMW_LAST,
    CSR_DSAVE, CSR_ECFG, CSR_EENTRY, CSR_ERA, CSR_ESTAT, CSR_EUEN, CSR_GCFG, CSR_GCNTC,
    CSR_GINTC, CSR_GSTAT, CSR_GTLBC, CSR_IMPCTL1, CSR_IMPCTL2, CSR_LLBCTL, CSR_MERRCTL,
    CSR_MERRENTRY, CSR_MERRERA, CSR_MERRINFO1, CSR_MERRINFO2, CSR_MERRSAVE, CSR_MISC, CSR_PGD,
    CSR_PGDH, CSR_PGDL, CSR_PRCFG1, CSR_PRCFG2, CSR_PRCFG3, CSR_PRMD, CSR_PWCH, CSR_PWCL,
    CSR_RVACFG, CSR_SAVE_BASE, CSR_SAVE_LAST, CSR_STLBPS, CSR_TCFG, CSR_TICLR, CSR_TID,
    CSR_TLBEHI, CSR_TLBELO0, CSR_TLBELO1, CSR_TLBIDX, CSR_TLBRBADV, CSR_TLBREHI, CSR_TLBRELO0,
    CSR_TLBRELO1, CSR_TLBRENTRY, CSR_TLBRERA, CSR_TLBRPRMD, CSR_TLBRSAVE, CSR_TRGP, CSR_TVAL,
};

use crate::cpu::{CpuState, MachineContext};
use log::warn;

/// Writable portion of `ESTAT`: the two software interrupt bits.
const ESTAT_IS_WRITABLE: u64 = 0x3;
/// Writable portion of `ASID`: the 10-bit ASID field.
const ASID_WRITABLE: u64 = 0x3ff;

/// One complete CSR register file. The host bank and the guest shadow bank
/// are both instances of this record; neither is privileged by the type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrBank {
    pub crmd: u64,
    pub prmd: u64,
    pub euen: u64,
    pub misc: u64,
    pub ecfg: u64,
    pub estat: u64,
    pub era: u64,
    pub badv: u64,
    pub badi: u64,
    pub eentry: u64,
    pub tlbidx: u64,
    pub tlbehi: u64,
    pub tlbelo0: u64,
    pub tlbelo1: u64,
    pub asid: u64,
    pub pgdl: u64,
    pub pgdh: u64,
    pub pgd: u64,
    pub pwcl: u64,
    pub pwch: u64,
    pub stlbps: u64,
    pub rvacfg: u64,
    pub cpuid: u64,
    pub prcfg1: u64,
    pub prcfg2: u64,
    pub prcfg3: u64,
    pub save: [u64; 16],
    pub tid: u64,
    pub tcfg: u64,
    pub tval: u64,
    pub cntc: u64,
    pub ticlr: u64,
    pub llbctl: u64,
    pub impctl1: u64,
    pub impctl2: u64,
    pub tlbrentry: u64,
    pub tlbrbadv: u64,
    pub tlbrera: u64,
    pub tlbrsave: u64,
    pub tlbrelo0: u64,
    pub tlbrelo1: u64,
    pub tlbrehi: u64,
    pub tlbrprmd: u64,
    pub merrctl: u64,
    pub merrinfo1: u64,
    pub merrinfo2: u64,
    pub merrentry: u64,
    pub merrera: u64,
    pub merrsave: u64,
    pub ctag: u64,
    pub dmw: [u64; 4],
    pub dbg: u64,
    pub dera: u64,
    pub dsave: u64,

    // LVZ control registers. Only the host bank's instances are
    // architecturally reachable; the shadow copies exist so both banks share
    // one shape.
    pub gstat: u64,
    pub gcfg: u64,
    pub gintc: u64,
    pub gcntc: u64,
    pub gtlbc: u64,
    pub trgp: u64,
}

impl CsrBank {
    /// Restores architectural reset values: direct addressing, 10 ASID bits,
    /// 16KiB STLB pages, and the fixed PRCFG identity words.
    pub fn reset(&mut self) {
        *self = Self::default();
        self.crmd = crmd::da.val(1).modify(0);
        self.asid = asid::asidbits.val(10).modify(0);
        self.stlbps = stlbps::ps.val(0xe).modify(0);
        // 16 scratch registers, 47-bit timer, 7 vector slots.
        self.prcfg1 = 0x7 << 12 | 0x2f << 4 | 0x8;
        // Supported page sizes: 4KiB through 1GiB.
        self.prcfg2 = 0x3ffff000;
        // STLB 8 ways x 256 sets plus 64-entry MTLB.
        self.prcfg3 = 0x8 << 20 | 0x7 << 12 | 63 << 4 | 0x2;
    }

    /// Returns the register with the given architectural index, or `None`
    /// for an unimplemented index.
    pub fn get(&self, csr: u16) -> Option<u64> {
        Some(match csr {
            CSR_CRMD => self.crmd,
            CSR_PRMD => self.prmd,
            CSR_EUEN => self.euen,
            CSR_MISC => self.misc,
            CSR_ECFG => self.ecfg,
            CSR_ESTAT => self.estat,
            CSR_ERA => self.era,
            CSR_BADV => self.badv,
            CSR_BADI => self.badi,
            CSR_EENTRY => self.eentry,
            CSR_TLBIDX => self.tlbidx,
            CSR_TLBEHI => self.tlbehi,
            CSR_TLBELO0 => self.tlbelo0,
            CSR_TLBELO1 => self.tlbelo1,
            CSR_GTLBC => self.gtlbc,
            CSR_TRGP => self.trgp,
            CSR_ASID => self.asid,
            CSR_PGDL => self.pgdl,
            CSR_PGDH => self.pgdh,
            CSR_PGD => self.pgd,
            CSR_PWCL => self.pwcl,
            CSR_PWCH => self.pwch,
            CSR_STLBPS => self.stlbps,
            CSR_RVACFG => self.rvacfg,
            CSR_CPUID => self.cpuid,
            CSR_PRCFG1 => self.prcfg1,
            CSR_PRCFG2 => self.prcfg2,
            CSR_PRCFG3 => self.prcfg3,
            CSR_SAVE_BASE..=CSR_SAVE_LAST => self.save[(csr - CSR_SAVE_BASE) as usize],
            CSR_TID => self.tid,
            CSR_TCFG => self.tcfg,
            CSR_TVAL => self.tval,
            CSR_CNTC => self.cntc,
            CSR_TICLR => self.ticlr,
            CSR_GSTAT => self.gstat,
            CSR_GCFG => self.gcfg,
            CSR_GINTC => self.gintc,
            CSR_GCNTC => self.gcntc,
            CSR_LLBCTL => self.llbctl,
            CSR_IMPCTL1 => self.impctl1,
            CSR_IMPCTL2 => self.impctl2,
            CSR_TLBRENTRY => self.tlbrentry,
            CSR_TLBRBADV => self.tlbrbadv,
            CSR_TLBRERA => self.tlbrera,
            CSR_TLBRSAVE => self.tlbrsave,
            CSR_TLBRELO0 => self.tlbrelo0,
            CSR_TLBRELO1 => self.tlbrelo1,
            CSR_TLBREHI => self.tlbrehi,
            CSR_TLBRPRMD => self.tlbrprmd,
            CSR_MERRCTL => self.merrctl,
            CSR_MERRINFO1 => self.merrinfo1,
            CSR_MERRINFO2 => self.merrinfo2,
            CSR_MERRENTRY => self.merrentry,
            CSR_MERRERA => self.merrera,
            CSR_MERRSAVE => self.merrsave,
            CSR_CTAG => self.ctag,
            CSR_DMW_BASE..=CSR_DMW_LAST => self.dmw[(csr - CSR_DMW_BASE) as usize],
            CSR_DBG => self.dbg,
            CSR_DERA => self.dera,
            CSR_DSAVE => self.dsave,
            _ => return None,
        })
    }

    /// Mutable access by architectural index.
    pub fn get_mut(&mut self, csr: u16) -> Option<&mut u64> {
        Some(match csr {
            CSR_CRMD => &mut self.crmd,
            CSR_PRMD => &mut self.prmd,
            CSR_EUEN => &mut self.euen,
            CSR_MISC => &mut self.misc,
            CSR_ECFG => &mut self.ecfg,
            CSR_ESTAT => &mut self.estat,
            CSR_ERA => &mut self.era,
            CSR_BADV => &mut self.badv,
            CSR_BADI => &mut self.badi,
            CSR_EENTRY => &mut self.eentry,
            CSR_TLBIDX => &mut self.tlbidx,
            CSR_TLBEHI => &mut self.tlbehi,
            CSR_TLBELO0 => &mut self.tlbelo0,
            CSR_TLBELO1 => &mut self.tlbelo1,
            CSR_GTLBC => &mut self.gtlbc,
            CSR_TRGP => &mut self.trgp,
            CSR_ASID => &mut self.asid,
            CSR_PGDL => &mut self.pgdl,
            CSR_PGDH => &mut self.pgdh,
            CSR_PGD => &mut self.pgd,
            CSR_PWCL => &mut self.pwcl,
            CSR_PWCH => &mut self.pwch,
            CSR_STLBPS => &mut self.stlbps,
            CSR_RVACFG => &mut self.rvacfg,
            CSR_CPUID => &mut self.cpuid,
            CSR_PRCFG1 => &mut self.prcfg1,
            CSR_PRCFG2 => &mut self.prcfg2,
            CSR_PRCFG3 => &mut self.prcfg3,
            CSR_SAVE_BASE..=CSR_SAVE_LAST => &mut self.save[(csr - CSR_SAVE_BASE) as usize],
            CSR_TID => &mut self.tid,
            CSR_TCFG => &mut self.tcfg,
            CSR_TVAL => &mut self.tval,
            CSR_CNTC => &mut self.cntc,
            CSR_TICLR => &mut self.ticlr,
            CSR_GSTAT => &mut self.gstat,
            CSR_GCFG => &mut self.gcfg,
            CSR_GINTC => &mut self.gintc,
            CSR_GCNTC => &mut self.gcntc,
            CSR_LLBCTL => &mut self.llbctl,
            CSR_IMPCTL1 => &mut self.impctl1,
            CSR_IMPCTL2 => &mut self.impctl2,
            CSR_TLBRENTRY => &mut self.tlbrentry,
            CSR_TLBRBADV => &mut self.tlbrbadv,
            CSR_TLBRERA => &mut self.tlbrera,
            CSR_TLBRSAVE => &mut self.tlbrsave,
            CSR_TLBRELO0 => &mut self.tlbrelo0,
            CSR_TLBRELO1 => &mut self.tlbrelo1,
            CSR_TLBREHI => &mut self.tlbrehi,
            CSR_TLBRPRMD => &mut self.tlbrprmd,
            CSR_MERRCTL => &mut self.merrctl,
            CSR_MERRINFO1 => &mut self.merrinfo1,
            CSR_MERRINFO2 => &mut self.merrinfo2,
            CSR_MERRENTRY => &mut self.merrentry,
            CSR_MERRERA => &mut self.merrera,
            CSR_MERRSAVE => &mut self.merrsave,
            CSR_CTAG => &mut self.ctag,
            CSR_DMW_BASE..=CSR_DMW_LAST => &mut self.dmw[(csr - CSR_DMW_BASE) as usize],
            CSR_DBG => &mut self.dbg,
            CSR_DERA => &mut self.dera,
            CSR_DSAVE => &mut self.dsave,
            _ => return None,
        })
    }
}

impl CpuState {
    /// Whether the guest may touch `csr` directly, per the `GCFG` policy.
    /// Anything not explicitly allowed traps to the hypervisor.
    fn guest_csr_access_allowed(&self, csr: u16, is_write: bool) -> bool {
        if !self.has_lvz() {
            return false;
        }
        match csr {
            CSR_CRMD | CSR_PRMD | CSR_EUEN | CSR_MISC | CSR_ECFG | CSR_ERA | CSR_BADV
            | CSR_BADI | CSR_EENTRY => true,
            CSR_TLBIDX | CSR_TLBEHI | CSR_TLBELO0 | CSR_TLBELO1 | CSR_ASID | CSR_PGDL
            | CSR_PGDH | CSR_PGD | CSR_PWCL | CSR_PWCH | CSR_STLBPS | CSR_RVACFG => true,
            CSR_TID | CSR_TCFG | CSR_TVAL | CSR_CNTC => {
                if is_write {
                    gcfg::tito.read(self.csr.gcfg) != 0
                } else {
                    gcfg::titp.read(self.csr.gcfg) != 0
                }
            }
            // Timer acknowledge always needs hypervisor intervention.
            CSR_TICLR => false,
            CSR_ESTAT => {
                if is_write {
                    gcfg::sito.read(self.csr.gcfg) != 0
                } else {
                    gcfg::sitp.read(self.csr.gcfg) != 0
                }
            }
            CSR_CPUID | CSR_PRCFG1 | CSR_PRCFG2 | CSR_PRCFG3 => !is_write,
            CSR_SAVE_BASE..=CSR_SAVE_LAST => true,
            CSR_LLBCTL => true,
            CSR_DMW_BASE..=CSR_DMW_LAST => true,
            // TLB refill window, machine error block, implementation control
            // and debug block stay with the hypervisor.
            CSR_TLBRENTRY..=CSR_TLBRPRMD => false,
            CSR_MERRCTL..=CSR_MERRSAVE | CSR_CTAG => false,
            CSR_IMPCTL1 | CSR_IMPCTL2 => false,
            CSR_DBG | CSR_DERA | CSR_DSAVE => false,
            _ => false,
        }
    }

    // Reads from the effective bank, computing the registers that are not
    // plain storage.
    fn csr_read_effective(&mut self, mach: &mut dyn MachineContext, csr: u16) -> Option<u64> {
        match csr {
            CSR_PGD => Some(self.csr_read_pgd()),
            CSR_CPUID => {
                let index = mach.vcpu_index();
                self.effective_bank_mut().cpuid = index;
                Some(index)
            }
            CSR_TVAL => {
                let ticks = mach.timer_ticks();
                self.effective_bank_mut().tval = ticks;
                Some(ticks)
            }
            _ => self.effective_bank().get(csr),
        }
    }

    // PGD reads select PGDL or PGDH by the sign of the faulting address.
    fn csr_read_pgd(&self) -> u64 {
        let bank = self.effective_bank();
        let badv = if tlbrera::istlbr.read(bank.tlbrera) != 0 {
            bank.tlbrbadv
        } else {
            bank.badv
        };
        if (badv >> 63) & 1 != 0 {
            bank.pgdh
        } else {
            bank.pgdl
        }
    }

    // Writes to the effective bank, applying per-register side effects.
    // Returns the old value, or `None` for an unimplemented index.
    fn csr_write_effective(
        &mut self,
        mach: &mut dyn MachineContext,
        csr: u16,
        val: u64,
    ) -> Option<u64> {
        match csr {
            CSR_ESTAT => {
                let bank = self.effective_bank_mut();
                let old = bank.estat;
                bank.estat = (old & !ESTAT_IS_WRITABLE) | (val & ESTAT_IS_WRITABLE);
                Some(old)
            }
            CSR_ASID => {
                let old = self.effective_bank().asid;
                let new = (old & !ASID_WRITABLE) | (val & ASID_WRITABLE);
                self.effective_bank_mut().asid = new;
                if new != old {
                    if self.is_guest_mode() {
                        // The guest's first-stage mappings under the outgoing
                        // ASID must not survive the switch.
                        let gid = self.guest_id();
                        self.invalidate_gid_asid_entries(gid, (old & ASID_WRITABLE) as u16);
                    }
                    // Cached translations keyed on the old ASID must not
                    // survive either.
                    mach.flush_translation_cache();
                }
                Some(old)
            }
            CSR_TCFG => {
                let bank = self.effective_bank_mut();
                let old = bank.tcfg;
                bank.tcfg = val;
                mach.set_timer_config(val);
                Some(old)
            }
            CSR_TICLR => {
                if val & 1 != 0 {
                    mach.ack_timer_interrupt();
                }
                Some(0)
            }
            // Read-only identity registers; writes retire without effect.
            CSR_TVAL | CSR_CPUID | CSR_PRCFG1 | CSR_PRCFG2 | CSR_PRCFG3 => {
                self.effective_bank().get(csr)
            }
            _ => {
                let slot = self.effective_bank_mut().get_mut(csr)?;
                let old = *slot;
                *slot = val;
                Some(old)
            }
        }
    }

    /// Mediated CSR read (`csrrd`).
    pub fn csrrd(&mut self, mach: &mut dyn MachineContext, csr: u16) -> Result<u64, Exception> {
        if self.is_guest_mode() && !self.guest_csr_access_allowed(csr, false) {
            return Err(self.vm_exit(VmExitReason::CsrRead(csr), 0, 0, None));
        }
        match self.csr_read_effective(mach, csr) {
            Some(v) => Ok(v),
            None if self.is_guest_mode() => {
                Err(self.vm_exit(VmExitReason::CsrRead(csr), 0, 0, None))
            }
            None => {
                warn!(target: "guest_error", "csrrd of unimplemented CSR {:#x}", csr);
                Ok(0)
            }
        }
    }

    /// Mediated CSR write (`csrwr`). Returns the old value.
    pub fn csrwr(
        &mut self,
        mach: &mut dyn MachineContext,
        csr: u16,
        val: u64,
    ) -> Result<u64, Exception> {
        if self.is_guest_mode() && !self.guest_csr_access_allowed(csr, true) {
            return Err(self.vm_exit(VmExitReason::CsrWrite(csr), 0, 0, None));
        }
        match self.csr_write_effective(mach, csr, val) {
            Some(old) => Ok(old),
            None if self.is_guest_mode() => {
                Err(self.vm_exit(VmExitReason::CsrWrite(csr), 0, 0, None))
            }
            None => {
                warn!(target: "guest_error", "csrwr of unimplemented CSR {:#x}", csr);
                Ok(0)
            }
        }
    }

    /// Mediated CSR exchange (`csrxchg`): replaces the bits selected by
    /// `mask` with those of `rj`. Returns the old value.
    pub fn csrxchg(
        &mut self,
        mach: &mut dyn MachineContext,
        csr: u16,
        rj: u64,
        mask: u64,
    ) -> Result<u64, Exception> {
        if self.is_guest_mode() && !self.guest_csr_access_allowed(csr, true) {
            return Err(self.vm_exit(VmExitReason::CsrExchange(csr), 0, 0, None));
        }
        let old = match self.csr_read_effective(mach, csr) {
            Some(v) => v,
            None if self.is_guest_mode() => {
                return Err(self.vm_exit(VmExitReason::CsrExchange(csr), 0, 0, None))
            }
            None => {
                warn!(target: "guest_error", "csrxchg of unimplemented CSR {:#x}", csr);
                return Ok(0);
            }
        };
        let new = (old & !mask) | (rj & mask);
        let _ = self.csr_write_effective(mach, csr, new);
        Ok(old)
    }

    /// Guest-only CSR read (`gcsrrd`). Illegal outside guest mode. Past its
    /// own trap gates it has the semantics of a guest-mode `csrrd`: the
    /// effective bank is the shadow bank, and the computed registers
    /// (`PGD`, `CPUID`, `TVAL`) are computed the same way.
    pub fn gcsrrd(&mut self, mach: &mut dyn MachineContext, csr: u16) -> Result<u64, Exception> {
        if !self.is_guest_mode() {
            return Err(Exception::InstructionPrivilege);
        }
        match csr {
            CSR_ESTAT if gcfg::sitp.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::CsrRead(csr), 0, 0, None))
            }
            CSR_TCFG | CSR_TVAL if gcfg::titp.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::Timer, 0, 0, None))
            }
            _ => match self.csr_read_effective(mach, csr) {
                Some(v) => Ok(v),
                None => Err(self.vm_exit(VmExitReason::CsrRead(csr), 0, 0, None)),
            },
        }
    }

    /// Guest-only CSR write (`gcsrwr`). Illegal outside guest mode. Past its
    /// own trap gates the write carries the same per-register side effects
    /// as the mediated form (timer programming, ASID switch, field masks).
    pub fn gcsrwr(
        &mut self,
        mach: &mut dyn MachineContext,
        csr: u16,
        val: u64,
    ) -> Result<u64, Exception> {
        if !self.is_guest_mode() {
            return Err(Exception::InstructionPrivilege);
        }
        match csr {
            CSR_ESTAT if gcfg::sito.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::CsrWrite(csr), 0, 0, None))
            }
            CSR_TCFG if gcfg::tito.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::Timer, 0, 0, None))
            }
            CSR_TICLR => Err(self.vm_exit(VmExitReason::Timer, 0, 0, None)),
            _ => match self.csr_write_effective(mach, csr, val) {
                Some(old) => Ok(old),
                None => Err(self.vm_exit(VmExitReason::CsrWrite(csr), 0, 0, None)),
            },
        }
    }

    /// Guest-only CSR exchange (`gcsrxchg`). Illegal outside guest mode.
    pub fn gcsrxchg(
        &mut self,
        mach: &mut dyn MachineContext,
        csr: u16,
        rj: u64,
        mask: u64,
    ) -> Result<u64, Exception> {
        if !self.is_guest_mode() {
            return Err(Exception::InstructionPrivilege);
        }
        match csr {
            CSR_ESTAT if gcfg::sito.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::CsrExchange(csr), 0, 0, None))
            }
            CSR_TCFG if gcfg::tito.read(self.csr.gcfg) == 0 => {
                Err(self.vm_exit(VmExitReason::Timer, 0, 0, None))
            }
            CSR_TICLR => Err(self.vm_exit(VmExitReason::Timer, 0, 0, None)),
            _ => {
                let old = match self.csr_read_effective(mach, csr) {
                    Some(v) => v,
                    None => {
                        return Err(self.vm_exit(VmExitReason::CsrExchange(csr), 0, 0, None))
                    }
                };
                let new = (old & !mask) | (rj & mask);
                let _ = self.csr_write_effective(mach, csr, new);
                Ok(old)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SecondLevelPolicy;
    use crate::test_stubs::{lvz_cpucfg, TestMachine};
    use crate::tlb::TlbEntry;
    use loongarch_regs::{csr_save, gstat, tlbentry};

    fn guest_cpu(gid: u8) -> CpuState {
        let mut cpu = CpuState::new(lvz_cpucfg());
        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        cpu.csr.gstat =
            (gstat::vm.val(1) + gstat::gid.val(gid as u64)).modify(cpu.csr.gstat);
        cpu
    }

    #[test]
    fn host_read_write_round_trip() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        let old = cpu.csrwr(&mut mach, CSR_EENTRY, 0x1c00_0000).unwrap();
        assert_eq!(old, 0);
        assert_eq!(cpu.csrrd(&mut mach, CSR_EENTRY).unwrap(), 0x1c00_0000);
        assert_eq!(cpu.csr.eentry, 0x1c00_0000);
    }

    #[test]
    fn guest_access_targets_shadow_bank() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        cpu.csrwr(&mut mach, CSR_EENTRY, 0x2000).unwrap();
        assert_eq!(cpu.gcsr.eentry, 0x2000);
        // The host bank is untouched by a guest write.
        assert_eq!(cpu.csr.eentry, 0);
    }

    #[test]
    fn guest_ticlr_write_exits_without_timer_effect() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        let err = cpu.csrwr(&mut mach, CSR_TICLR, 1).unwrap_err();
        assert_eq!(err, Exception::HypervisorCall);
        assert_eq!(
            cpu.vm_exit_ctx.reason,
            Some(VmExitReason::CsrWrite(CSR_TICLR))
        );
        assert_eq!(mach.timer_acks, 0);
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 0);
    }

    #[test]
    fn guest_estat_gated_by_gcfg() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();

        // Trapped while SITP is clear.
        assert!(cpu.csrrd(&mut mach, CSR_ESTAT).is_err());

        let mut cpu = guest_cpu(3);
        cpu.csr.gcfg = gcfg::sitp.val(1).modify(cpu.csr.gcfg);
        assert!(cpu.csrrd(&mut mach, CSR_ESTAT).is_ok());
    }

    #[test]
    fn estat_write_only_touches_software_interrupts() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        cpu.csr.estat = 0xdead_0000;
        cpu.csrwr(&mut mach, CSR_ESTAT, 0xffff_ffff).unwrap();
        assert_eq!(cpu.csr.estat, 0xdead_0003);
    }

    #[test]
    fn asid_write_flushes_and_preserves_tlb() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        let mut entry = TlbEntry::default();
        entry.set_enabled(true);
        entry.set_asid(7);
        cpu.tlb[0] = entry;
        cpu.csr.asid = (cpu.csr.asid & !0x3ff) | 7;

        cpu.csrwr(&mut mach, CSR_ASID, 8).unwrap();
        assert_eq!(cpu.csr.asid & 0x3ff, 8);
        assert_eq!(mach.full_flushes, 1);
        // The entry itself stays; only the cached translations go.
        assert!(cpu.tlb[0].enabled());
        assert_eq!(cpu.tlb[0].asid(), 7);

        // Rewriting the same value is not a switch.
        cpu.csrwr(&mut mach, CSR_ASID, 8).unwrap();
        assert_eq!(mach.full_flushes, 1);
    }

    #[test]
    fn guest_asid_write_retires_stale_guest_entries() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();
        cpu.gcsr.asid = (cpu.gcsr.asid & !0x3ff) | 7;

        // The outgoing address space of this guest.
        let mut stale = TlbEntry::default();
        stale.set_enabled(true);
        stale.set_gid(3);
        stale.set_asid(7);
        cpu.tlb[0] = stale;

        // A global mapping of the same guest survives the switch.
        let mut global = TlbEntry::default();
        global.set_enabled(true);
        global.set_gid(3);
        global.set_asid(7);
        global.entry0 = tlbentry::g.val(1).modify(global.entry0);
        cpu.tlb[1] = global;

        // Another guest's entries are not ours to touch.
        let mut other = TlbEntry::default();
        other.set_enabled(true);
        other.set_gid(5);
        other.set_asid(7);
        cpu.tlb[2] = other;

        cpu.csrwr(&mut mach, CSR_ASID, 8).unwrap();
        assert_eq!(cpu.gcsr.asid & 0x3ff, 8);
        // The host bank and its ASID are untouched by the guest write.
        assert_eq!(cpu.csr.asid & 0x3ff, 0);

        assert!(!cpu.tlb[0].enabled());
        assert!(cpu.tlb[1].enabled());
        assert!(cpu.tlb[2].enabled());
        assert_eq!(mach.full_flushes, 1);
    }

    #[test]
    fn gcsrwr_tcfg_programs_timer_when_passthrough() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();
        cpu.csr.gcfg = gcfg::tito.val(1).modify(cpu.csr.gcfg);

        cpu.gcsrwr(&mut mach, CSR_TCFG, 0x1234).unwrap();
        assert_eq!(cpu.gcsr.tcfg, 0x1234);
        assert_eq!(mach.timer_config, Some(0x1234));
    }

    #[test]
    fn gcsrwr_asid_masks_and_retires_stale_entries() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();
        cpu.gcsr.asid = (cpu.gcsr.asid & !0x3ff) | 7;

        let mut stale = TlbEntry::default();
        stale.set_enabled(true);
        stale.set_gid(3);
        stale.set_asid(7);
        cpu.tlb[0] = stale;

        cpu.gcsrwr(&mut mach, CSR_ASID, 0xffff_fff8).unwrap();
        // Only the 10-bit field is writable; ASIDBITS stays.
        assert_eq!(cpu.gcsr.asid & 0x3ff, 0x3f8);
        assert_eq!((cpu.gcsr.asid >> 16) & 0xff, 10);

        assert!(!cpu.tlb[0].enabled());
        assert_eq!(mach.full_flushes, 1);
    }

    #[test]
    fn gcsrwr_estat_masks_to_software_interrupts() {
        let mut cpu = guest_cpu(3);
        let mut mach = TestMachine::default();
        cpu.csr.gcfg = gcfg::sito.val(1).modify(cpu.csr.gcfg);

        cpu.gcsr.estat = 0xdead_0000;
        cpu.gcsrwr(&mut mach, CSR_ESTAT, 0xffff_ffff).unwrap();
        assert_eq!(cpu.gcsr.estat, 0xdead_0003);
    }

    #[test]
    fn csrxchg_with_zero_mask_is_a_read() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        cpu.csr.save[2] = 0x1234;
        let old = cpu.csrxchg(&mut mach, csr_save(2), 0xffff, 0).unwrap();
        assert_eq!(old, 0x1234);
        assert_eq!(cpu.csr.save[2], 0x1234);
    }

    #[test]
    fn csrxchg_merges_masked_bits() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        cpu.csr.save[0] = 0xff00;
        let old = cpu.csrxchg(&mut mach, csr_save(0), 0x00ff, 0x0fff).unwrap();
        assert_eq!(old, 0xff00);
        assert_eq!(cpu.csr.save[0], 0xf0ff);
    }

    #[test]
    fn gcsr_forms_illegal_in_host_mode() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        assert_eq!(
            cpu.gcsrrd(&mut mach, CSR_CRMD).unwrap_err(),
            Exception::InstructionPrivilege
        );
        assert_eq!(
            cpu.gcsrwr(&mut mach, CSR_CRMD, 0).unwrap_err(),
            Exception::InstructionPrivilege
        );
    }

    #[test]
    fn pgd_read_selects_by_fault_sign() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();

        cpu.csr.pgdl = 0x1000;
        cpu.csr.pgdh = 0x2000;
        cpu.csr.badv = 0x0000_7fff_0000_0000;
        assert_eq!(cpu.csrrd(&mut mach, CSR_PGD).unwrap(), 0x1000);

        cpu.csr.badv = 0xffff_8000_0000_0000;
        assert_eq!(cpu.csrrd(&mut mach, CSR_PGD).unwrap(), 0x2000);
    }

    #[test]
    fn cpuid_reads_vcpu_index() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine {
            vcpu_index: 5,
            ..TestMachine::default()
        };
        assert_eq!(cpu.csrrd(&mut mach, CSR_CPUID).unwrap(), 5);
        assert_eq!(cpu.csr.cpuid, 5);
    }
}
