// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! VM-exit controller and the guest/host mode state machine.
//!
//! A VM exit is a synchronous control transfer, not an error: the trapped
//! instruction retires nothing, the fault context lands in `vm_exit_ctx` and
//! the mandated guest CSRs, `GSTAT.VM` moves to `PVM`, and the hypervisor is
//! re-entered through the hypervisor-call exception vector. `ertn` undoes
//! the transfer.

use log::{debug, warn};
use loongarch_regs::{
    cpucfg2, crmd, estat, gcfg, gstat, gtlbc, misc, prmd, tlbrera, tlbrprmd, Exception,
    LocalRegisterCopy, TlbreraHelpers, VmExitReason,
};

use crate::cpu::{CpuState, MachineContext, MemAccess, VmExitContext};

impl CpuState {
    /// Whether the guest configuration gates the given exit cause on.
    /// Hypercalls always exit; device windows are handled by their callers.
    pub fn vm_exit_gated(&self, reason: &VmExitReason) -> bool {
        if !self.is_guest_context() {
            return false;
        }
        use VmExitReason::*;
        match reason {
            Hypercall(_) => true,
            Timer => gcfg::toe.read(self.csr.gcfg) != 0,
            Iocsr => gcfg::tit.read(self.csr.gcfg) != 0,
            Tlb => gtlbc::toti.read(self.csr.gtlbc) != 0,
            Mmio | Interrupt | CsrRead(_) | CsrWrite(_) | CsrExchange(_) | CpuCfg | Cache => {
                gcfg::toep.read(self.csr.gcfg) != 0
            }
        }
    }

    /// GUEST -> HOST transition. Captures the fault context, parks the guest
    /// return state in its shadow bank, and returns the exception that
    /// re-enters the hypervisor at the host `EENTRY`.
    ///
    /// The trapped instruction is non-retiring: `GCSR_ERA` holds its own PC
    /// and no general register has been written.
    pub fn vm_exit(
        &mut self,
        reason: VmExitReason,
        gva: u64,
        gpa: u64,
        access: Option<MemAccess>,
    ) -> Exception {
        if !self.is_guest_context() {
            warn!(
                target: "guest_error",
                "VM exit requested outside guest context, reason {:?}", reason
            );
        }

        self.vm_exit_ctx = VmExitContext {
            fault_gpa: gpa,
            fault_gva: gva,
            gid: self.guest_id(),
            reason: Some(reason),
            access,
            is_tlb_refill: matches!(reason, VmExitReason::Tlb),
        };

        // Stash the virtualization mode and drop to the hypervisor.
        let vm = gstat::vm.read(self.csr.gstat);
        self.csr.gstat = (gstat::pvm.val(vm) + gstat::vm.val(0)).modify(self.csr.gstat);

        // The guest sees a taken exception: PRMD from CRMD, ERA at the
        // trapped instruction, HVC in ESTAT.
        let pplv = crmd::plv.read(self.csr.crmd);
        let pie = crmd::ie.read(self.csr.crmd);
        self.gcsr.prmd = (prmd::pplv.val(pplv) + prmd::pie.val(pie)).modify(self.gcsr.prmd);
        self.gcsr.era = self.pc;
        self.gcsr.estat = estat::ecode
            .val(Exception::HypervisorCall.ecode() as u64)
            .modify(self.gcsr.estat);

        // Hypervisor runs at PLV0 with interrupts masked.
        self.csr.crmd = (crmd::plv.val(0) + crmd::ie.val(0)).modify(self.csr.crmd);

        // Faults with a GPA component publish it for the hypervisor.
        if matches!(reason, VmExitReason::Mmio | VmExitReason::Tlb) {
            self.csr.trgp = gpa;
            self.csr.badv = gva;
            self.gcsr.badv = gva;
        }

        debug!(
            target: "int",
            "VM exit: reason {:?} gid {} gva {:#x} gpa {:#x}",
            reason,
            self.vm_exit_ctx.gid,
            gva,
            gpa
        );
        Exception::HypervisorCall
    }

    /// HOST -> GUEST transition: makes the guest bank architecturally
    /// visible. The hypervisor prepares the guest `ERA` beforehand.
    pub fn vm_enter(&mut self) {
        if !self.is_hypervisor_context() {
            return;
        }
        self.csr.gstat = gstat::vm.val(1).modify(self.csr.gstat);
        debug!(target: "int", "entering guest mode, gid {}", self.guest_id());
    }

    /// Exception return. Restores PLV/IE and the PC from the PRMD/ERA pair
    /// of the bank the exception was taken into (the refill window while
    /// `TLBRERA.ISTLBR` is set), and re-enters the guest when the previous
    /// mode was guest.
    pub fn ertn(&mut self) {
        // A VM-exit return reads the guest bank: that is where the exit
        // controller parked the guest's state.
        let returning_to_guest =
            self.virtualization_active() && gstat::pvm.read(self.csr.gstat) != 0;
        let use_guest = self.is_guest_mode() || returning_to_guest;

        let bank = if use_guest { &self.gcsr } else { &self.csr };
        let istlbr = tlbrera::istlbr.read(bank.tlbrera) != 0;
        let (pplv, pie, return_address) = if istlbr {
            let tlbrera_copy = LocalRegisterCopy::<u64, tlbrera::Register>::new(bank.tlbrera);
            (
                tlbrprmd::pplv.read(bank.tlbrprmd),
                tlbrprmd::pie.read(bank.tlbrprmd),
                tlbrera_copy.return_pc(),
            )
        } else {
            (
                prmd::pplv.read(bank.prmd),
                prmd::pie.read(bank.prmd),
                bank.era,
            )
        };

        if istlbr {
            let bank = if use_guest {
                &mut self.gcsr
            } else {
                &mut self.csr
            };
            bank.tlbrera = tlbrera::istlbr.val(0).modify(bank.tlbrera);
            self.csr.crmd = (crmd::da.val(0) + crmd::pg.val(1)).modify(self.csr.crmd);
        }

        self.set_pc(return_address);
        self.csr.crmd = (crmd::plv.val(pplv) + crmd::ie.val(pie)).modify(self.csr.crmd);

        if returning_to_guest {
            self.csr.gstat = gstat::vm.val(1).modify(self.csr.gstat);
            debug!(target: "int", "ertn: resumed guest, gid {}", self.guest_id());
        }

        // Any LL reservation is gone.
        self.lladdr = 1;
    }

    /// `hvcl code`: hypercall. Guest-only; elsewhere it does not exist.
    pub fn hvcl(&mut self, code: u32) -> Result<(), Exception> {
        if !self.is_guest_mode() {
            return Err(Exception::InstructionNonExistent);
        }
        Err(self.vm_exit(VmExitReason::Hypercall(code), 0, 0, None))
    }

    /// `cpucfg rj`: configuration word read, with guest-side masking. Word 2
    /// hides the LVZ capability from guests; words above 15 trap.
    pub fn cpucfg(&mut self, rj: u64) -> Result<u64, Exception> {
        if self.is_guest_context() {
            if rj == 2 {
                let word = cpucfg2::lvz.val(0).modify(self.cpucfg[2]);
                return Ok(word as u64);
            }
            if rj > 15 {
                return Err(self.vm_exit(VmExitReason::CpuCfg, 0, 0, None));
            }
        }
        Ok(self.cpucfg.get(rj as usize).copied().unwrap_or(0) as u64)
    }

    /// `rdtime`: constant timer read, gated per-PLV by `MISC.DRDTL`. Guests
    /// see their counter compensation applied.
    pub fn rdtime(&mut self, mach: &mut dyn MachineContext) -> Result<u64, Exception> {
        let plv = crmd::plv.read(self.csr.crmd);
        if self.is_guest_context() {
            if (misc::drdtl.read(self.gcsr.misc) >> plv) & 1 != 0 {
                return Err(self.vm_exit(VmExitReason::Timer, 0, 0, None));
            }
            Ok(mach.timer_ticks().wrapping_add(self.csr.gcntc))
        } else {
            if (misc::drdtl.read(self.csr.misc) >> plv) & 1 != 0 {
                return Err(Exception::InstructionPrivilege);
            }
            Ok(mach.timer_ticks())
        }
    }

    /// `idle`: halts until the next interrupt; a gated guest exits instead.
    pub fn idle(&mut self, mach: &mut dyn MachineContext) -> Result<(), Exception> {
        if self.vm_exit_gated(&VmExitReason::CpuCfg) {
            return Err(self.vm_exit(VmExitReason::CpuCfg, 0, 0, None));
        }
        mach.halt();
        Ok(())
    }

    /// Hypervisor world-switch helper: parks the live window CSRs into the
    /// guest bank before switching away from a guest.
    pub fn vm_save_state(&mut self) {
        if !self.is_guest_context() {
            return;
        }
        self.gcsr.crmd = self.csr.crmd;
        self.gcsr.asid = self.csr.asid;
        self.gcsr.pgdl = self.csr.pgdl;
        self.gcsr.pgdh = self.csr.pgdh;
        self.gcsr.badv = self.csr.badv;
        self.gcsr.badi = self.csr.badi;
        self.gcsr.eentry = self.csr.eentry;
        self.gcsr.tlbidx = self.csr.tlbidx;
        self.gcsr.tlbehi = self.csr.tlbehi;
        self.gcsr.tlbelo0 = self.csr.tlbelo0;
        self.gcsr.tlbelo1 = self.csr.tlbelo1;
        debug!(target: "int", "VM state saved for gid {}", self.guest_id());
    }

    /// Hypervisor world-switch helper: loads the guest bank back into the
    /// live window CSRs before re-entering a guest.
    pub fn vm_restore_state(&mut self) {
        if !self.is_hypervisor_context() {
            return;
        }
        self.csr.crmd = self.gcsr.crmd;
        self.csr.asid = self.gcsr.asid;
        self.csr.pgdl = self.gcsr.pgdl;
        self.csr.pgdh = self.gcsr.pgdh;
        self.csr.badv = self.gcsr.badv;
        self.csr.badi = self.gcsr.badi;
        self.csr.eentry = self.gcsr.eentry;
        self.csr.tlbidx = self.gcsr.tlbidx;
        self.csr.tlbehi = self.gcsr.tlbehi;
        self.csr.tlbelo0 = self.gcsr.tlbelo0;
        self.csr.tlbelo1 = self.gcsr.tlbelo1;
        debug!(target: "int", "VM state restored for gid {}", self.guest_id());
    }

    /// Hypervisor-mode switch of the current GID. Cached translations of the
    /// outgoing guest must not leak into the incoming one.
    pub fn vm_context_switch(&mut self, mach: &mut dyn MachineContext, target_gid: u8) {
        if !self.is_hypervisor_context() {
            return;
        }
        let current = self.guest_id();
        if current == target_gid {
            return;
        }
        self.csr.gstat = gstat::gid.val(target_gid as u64).modify(self.csr.gstat);
        mach.flush_translation_cache();
        debug!(
            target: "int",
            "context switch from gid {} to gid {}", current, target_gid
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SecondLevelPolicy;
    use crate::test_stubs::{lvz_cpucfg, TestMachine};

    fn guest_cpu(gid: u8) -> CpuState {
        let mut cpu = CpuState::new(lvz_cpucfg());
        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        cpu.csr.gstat =
            (gstat::vm.val(1) + gstat::gid.val(gid as u64)).modify(cpu.csr.gstat);
        cpu
    }

    #[test]
    fn vm_exit_swaps_mode_and_captures_state() {
        let mut cpu = guest_cpu(3);
        cpu.pc = 0x1000;
        cpu.csr.crmd = (crmd::plv.val(3) + crmd::ie.val(1)).modify(cpu.csr.crmd);

        let e = cpu.vm_exit(VmExitReason::Mmio, 0x4000, 0x1fe0_0000, Some(MemAccess::Store));
        assert_eq!(e, Exception::HypervisorCall);

        // VM stashed into PVM, hypervisor at PLV0 with interrupts off.
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 0);
        assert_eq!(gstat::pvm.read(cpu.csr.gstat), 1);
        assert_eq!(crmd::plv.read(cpu.csr.crmd), 0);
        assert_eq!(crmd::ie.read(cpu.csr.crmd), 0);

        // Guest return state parked in the shadow bank.
        assert_eq!(prmd::pplv.read(cpu.gcsr.prmd), 3);
        assert_eq!(prmd::pie.read(cpu.gcsr.prmd), 1);
        assert_eq!(cpu.gcsr.era, 0x1000);
        assert_eq!(
            estat::ecode.read(cpu.gcsr.estat),
            Exception::HypervisorCall.ecode() as u64
        );

        // GPA-bearing exit publishes the fault addresses.
        assert_eq!(cpu.csr.trgp, 0x1fe0_0000);
        assert_eq!(cpu.csr.badv, 0x4000);
        assert_eq!(cpu.gcsr.badv, 0x4000);
        assert!(!cpu.vm_exit_ctx.is_tlb_refill);
    }

    #[test]
    fn hypercall_round_trip() {
        let mut cpu = guest_cpu(4);
        cpu.pc = 0x2000;

        let err = cpu.hvcl(0x42).unwrap_err();
        assert_eq!(err, Exception::HypervisorCall);
        assert_eq!(cpu.vm_exit_ctx.reason, Some(VmExitReason::Hypercall(0x42)));
        assert_eq!(cpu.gcsr.era, 0x2000);
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 0);

        // Hypervisor emulates the call, bumps the guest ERA, returns.
        cpu.gcsr.era += 4;
        cpu.ertn();
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 1);
        assert_eq!(cpu.pc, 0x2004);
    }

    #[test]
    fn hvcl_outside_guest_is_nonexistent() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        assert_eq!(
            cpu.hvcl(1).unwrap_err(),
            Exception::InstructionNonExistent
        );
    }

    #[test]
    fn ertn_restores_previous_mode_bits() {
        let mut cpu = guest_cpu(2);
        cpu.csr.crmd = (crmd::plv.val(3) + crmd::ie.val(1)).modify(cpu.csr.crmd);
        cpu.pc = 0x3000;
        cpu.vm_exit(VmExitReason::CpuCfg, 0, 0, None);

        cpu.ertn();
        // Guest mode back, with the pre-exit PLV and IE.
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 1);
        assert_eq!(crmd::plv.read(cpu.csr.crmd), 3);
        assert_eq!(crmd::ie.read(cpu.csr.crmd), 1);
        assert_eq!(cpu.pc, 0x3000);
        assert_eq!(cpu.lladdr, 1);
    }

    #[test]
    fn ertn_refill_path_uses_refill_window() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        cpu.csr.tlbrera = tlbrera::istlbr.val(1).modify(0x8000);
        cpu.csr.tlbrprmd = (tlbrprmd::pplv.val(3) + tlbrprmd::pie.val(1)).modify(0);
        cpu.csr.prmd = 0; // would restore PLV0 if consulted

        cpu.ertn();
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(crmd::plv.read(cpu.csr.crmd), 3);
        assert_eq!(tlbrera::istlbr.read(cpu.csr.tlbrera), 0);
        // Refill return turns paging back on.
        assert_eq!(crmd::pg.read(cpu.csr.crmd), 1);
        assert_eq!(crmd::da.read(cpu.csr.crmd), 0);
    }

    #[test]
    fn vm_enter_requires_hypervisor_context() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        // Virtualization off: no transition.
        cpu.vm_enter();
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 0);

        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        cpu.vm_enter();
        assert_eq!(gstat::vm.read(cpu.csr.gstat), 1);
    }

    #[test]
    fn guest_cpucfg_hides_lvz() {
        let mut cpu = guest_cpu(1);
        assert_eq!(cpucfg2::lvz.read(cpu.cpucfg[2]), 1);
        let word = cpu.cpucfg(2).unwrap() as u32;
        assert_eq!(cpucfg2::lvz.read(word), 0);
    }

    #[test]
    fn guest_cpucfg_high_words_trap() {
        let mut cpu = guest_cpu(1);
        assert_eq!(
            cpu.cpucfg(16).unwrap_err(),
            Exception::HypervisorCall
        );
        assert_eq!(cpu.vm_exit_ctx.reason, Some(VmExitReason::CpuCfg));
    }

    #[test]
    fn host_cpucfg_reads_raw_words() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        assert_eq!(cpu.cpucfg(2).unwrap() as u32, cpu.cpucfg[2]);
        // Out of range reads as zero.
        assert_eq!(cpu.cpucfg(100).unwrap(), 0);
    }

    #[test]
    fn rdtime_gates_by_plv() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine {
            ticks: 1234,
            ..TestMachine::default()
        };
        assert_eq!(cpu.rdtime(&mut mach).unwrap(), 1234);

        // Disable rdtime at PLV3, then run at PLV3.
        cpu.csr.misc = misc::drdtl.val(1 << 3).modify(cpu.csr.misc);
        cpu.csr.crmd = crmd::plv.val(3).modify(cpu.csr.crmd);
        assert_eq!(
            cpu.rdtime(&mut mach).unwrap_err(),
            Exception::InstructionPrivilege
        );
    }

    #[test]
    fn guest_rdtime_applies_compensation_or_exits() {
        let mut cpu = guest_cpu(1);
        let mut mach = TestMachine {
            ticks: 1000,
            ..TestMachine::default()
        };
        cpu.csr.gcntc = 50;
        assert_eq!(cpu.rdtime(&mut mach).unwrap(), 1050);

        cpu.gcsr.misc = misc::drdtl.val(1).modify(cpu.gcsr.misc); // PLV0 gated
        assert_eq!(
            cpu.rdtime(&mut mach).unwrap_err(),
            Exception::HypervisorCall
        );
        assert_eq!(cpu.vm_exit_ctx.reason, Some(VmExitReason::Timer));
    }

    #[test]
    fn idle_halts_or_exits() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        let mut mach = TestMachine::default();
        cpu.idle(&mut mach).unwrap();
        assert!(mach.halted);

        let mut cpu = guest_cpu(1);
        let mut mach = TestMachine::default();
        cpu.csr.gcfg = gcfg::toep.val(1).modify(cpu.csr.gcfg);
        assert!(cpu.idle(&mut mach).is_err());
        assert!(!mach.halted);
    }

    #[test]
    fn save_restore_round_trips_window_csrs() {
        let mut cpu = guest_cpu(6);
        cpu.csr.asid = 0x123;
        cpu.csr.eentry = 0xeeee;
        cpu.vm_save_state();
        assert_eq!(cpu.gcsr.asid, 0x123);
        assert_eq!(cpu.gcsr.eentry, 0xeeee);

        // Back in hypervisor context, scrambled live CSRs are recovered.
        cpu.csr.gstat = gstat::vm.val(0).modify(cpu.csr.gstat);
        cpu.csr.asid = 0;
        cpu.csr.eentry = 0;
        cpu.vm_restore_state();
        assert_eq!(cpu.csr.asid, 0x123);
        assert_eq!(cpu.csr.eentry, 0xeeee);
    }

    #[test]
    fn context_switch_changes_gid_and_flushes() {
        let mut cpu = CpuState::new(lvz_cpucfg());
        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        let mut mach = TestMachine::default();

        cpu.vm_context_switch(&mut mach, 7);
        assert_eq!(cpu.guest_id(), 7);
        assert_eq!(mach.full_flushes, 1);

        // Same GID is a no-op.
        cpu.vm_context_switch(&mut mach, 7);
        assert_eq!(mach.full_flushes, 1);
    }
}
