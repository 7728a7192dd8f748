// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Migratable state image.
//!
//! The image is a fixed-order little-endian layout: a versioned base section
//! (GPRs, PC, CPUCFG, host CSR bank) followed by length-prefixed
//! subsections. Readers reject unknown base versions, skip unknown
//! subsection tags by length, and never commit partial state: decoding
//! builds a fresh vCPU or fails. The FPU/SIMD banks of the surrounding
//! emulator are separate subsections outside this core.

use alloc::vec::Vec;
use arrayvec::ArrayVec;

use loongarch_regs::{cpucfg2, VmExitReason};

use crate::cpu::{CpuState, MemAccess, VmExitContext, CPUCFG_WORDS};
use crate::csr::CsrBank;
use crate::tlb::{TlbEntry, TLB_ENTRIES};

/// Why an image failed to load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Not a vCPU state image.
    BadMagic(u32),
    /// Base section with an unknown major version.
    UnsupportedVersion(u32),
    /// Known subsection with a version newer than this reader.
    UnsupportedSubsection { tag: u32, version: u32 },
    /// The same subsection appeared twice.
    DuplicateSubsection(u32),
    /// The image ended early.
    Truncated,
    /// A field held a value with no in-memory representation.
    BadValue,
}

pub type Result<T> = core::result::Result<T, Error>;

const MAGIC: u32 = 0x4c56_5a4d;
/// Base (CPU) section major version.
const BASE_VERSION: u32 = 2;

const SUBSECTION_TLB: u32 = 1;
const SUBSECTION_LVZ: u32 = 2;
const TLB_VERSION: u32 = 0;
const LVZ_VERSION: u32 = 1;

// Bound on distinct subsections a well-formed image can carry.
const MAX_SUBSECTIONS: usize = 8;

struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
}

struct ImageReader<'a> {
    buf: &'a [u8],
}

impl<'a> ImageReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

// The bank field list. Order is part of the wire format: append-only, and
// any change bumps the owning section's version.
fn write_bank(w: &mut ImageWriter, bank: &CsrBank) {
    w.put_u64(bank.crmd);
    w.put_u64(bank.prmd);
    w.put_u64(bank.euen);
    w.put_u64(bank.misc);
    w.put_u64(bank.ecfg);
    w.put_u64(bank.estat);
    w.put_u64(bank.era);
    w.put_u64(bank.badv);
    w.put_u64(bank.badi);
    w.put_u64(bank.eentry);
    w.put_u64(bank.tlbidx);
    w.put_u64(bank.tlbehi);
    w.put_u64(bank.tlbelo0);
    w.put_u64(bank.tlbelo1);
    w.put_u64(bank.asid);
    w.put_u64(bank.pgdl);
    w.put_u64(bank.pgdh);
    w.put_u64(bank.pgd);
    w.put_u64(bank.pwcl);
    w.put_u64(bank.pwch);
    w.put_u64(bank.stlbps);
    w.put_u64(bank.rvacfg);
    w.put_u64(bank.cpuid);
    w.put_u64(bank.prcfg1);
    w.put_u64(bank.prcfg2);
    w.put_u64(bank.prcfg3);
    for save in &bank.save {
        w.put_u64(*save);
    }
    w.put_u64(bank.tid);
    w.put_u64(bank.tcfg);
    w.put_u64(bank.tval);
    w.put_u64(bank.cntc);
    w.put_u64(bank.ticlr);
    w.put_u64(bank.llbctl);
    w.put_u64(bank.impctl1);
    w.put_u64(bank.impctl2);
    w.put_u64(bank.tlbrentry);
    w.put_u64(bank.tlbrbadv);
    w.put_u64(bank.tlbrera);
    w.put_u64(bank.tlbrsave);
    w.put_u64(bank.tlbrelo0);
    w.put_u64(bank.tlbrelo1);
    w.put_u64(bank.tlbrehi);
    w.put_u64(bank.tlbrprmd);
    w.put_u64(bank.merrctl);
    w.put_u64(bank.merrinfo1);
    w.put_u64(bank.merrinfo2);
    w.put_u64(bank.merrentry);
    w.put_u64(bank.merrera);
    w.put_u64(bank.merrsave);
    w.put_u64(bank.ctag);
    for dmw in &bank.dmw {
        w.put_u64(*dmw);
    }
    w.put_u64(bank.dbg);
    w.put_u64(bank.dera);
    w.put_u64(bank.dsave);
}

fn read_bank(r: &mut ImageReader, bank: &mut CsrBank) -> Result<()> {
    bank.crmd = r.take_u64()?;
    bank.prmd = r.take_u64()?;
    bank.euen = r.take_u64()?;
    bank.misc = r.take_u64()?;
    bank.ecfg = r.take_u64()?;
    bank.estat = r.take_u64()?;
    bank.era = r.take_u64()?;
    bank.badv = r.take_u64()?;
    bank.badi = r.take_u64()?;
    bank.eentry = r.take_u64()?;
    bank.tlbidx = r.take_u64()?;
    bank.tlbehi = r.take_u64()?;
    bank.tlbelo0 = r.take_u64()?;
    bank.tlbelo1 = r.take_u64()?;
    bank.asid = r.take_u64()?;
    bank.pgdl = r.take_u64()?;
    bank.pgdh = r.take_u64()?;
    bank.pgd = r.take_u64()?;
    bank.pwcl = r.take_u64()?;
    bank.pwch = r.take_u64()?;
    bank.stlbps = r.take_u64()?;
    bank.rvacfg = r.take_u64()?;
    bank.cpuid = r.take_u64()?;
    bank.prcfg1 = r.take_u64()?;
    bank.prcfg2 = r.take_u64()?;
    bank.prcfg3 = r.take_u64()?;
    for save in bank.save.iter_mut() {
        *save = r.take_u64()?;
    }
    bank.tid = r.take_u64()?;
    bank.tcfg = r.take_u64()?;
    bank.tval = r.take_u64()?;
    bank.cntc = r.take_u64()?;
    bank.ticlr = r.take_u64()?;
    bank.llbctl = r.take_u64()?;
    bank.impctl1 = r.take_u64()?;
    bank.impctl2 = r.take_u64()?;
    bank.tlbrentry = r.take_u64()?;
    bank.tlbrbadv = r.take_u64()?;
    bank.tlbrera = r.take_u64()?;
    bank.tlbrsave = r.take_u64()?;
    bank.tlbrelo0 = r.take_u64()?;
    bank.tlbrelo1 = r.take_u64()?;
    bank.tlbrehi = r.take_u64()?;
    bank.tlbrprmd = r.take_u64()?;
    bank.merrctl = r.take_u64()?;
    bank.merrinfo1 = r.take_u64()?;
    bank.merrinfo2 = r.take_u64()?;
    bank.merrentry = r.take_u64()?;
    bank.merrera = r.take_u64()?;
    bank.merrsave = r.take_u64()?;
    bank.ctag = r.take_u64()?;
    for dmw in bank.dmw.iter_mut() {
        *dmw = r.take_u64()?;
    }
    bank.dbg = r.take_u64()?;
    bank.dera = r.take_u64()?;
    bank.dsave = r.take_u64()?;
    Ok(())
}

fn write_tlb_payload(w: &mut ImageWriter, cpu: &CpuState) {
    for entry in cpu.tlb.iter() {
        w.put_u64(entry.misc);
        w.put_u64(entry.entry0);
        w.put_u64(entry.entry1);
    }
}

fn read_tlb_payload(r: &mut ImageReader, cpu: &mut CpuState) -> Result<()> {
    for i in 0..TLB_ENTRIES {
        cpu.tlb[i] = TlbEntry {
            misc: r.take_u64()?,
            entry0: r.take_u64()?,
            entry1: r.take_u64()?,
        };
    }
    Ok(())
}

fn write_lvz_payload(w: &mut ImageWriter, cpu: &CpuState) {
    w.put_u64(cpu.csr.gstat);
    w.put_u64(cpu.csr.gcfg);
    w.put_u64(cpu.csr.gintc);
    w.put_u64(cpu.csr.gcntc);
    w.put_u64(cpu.csr.gtlbc);
    w.put_u64(cpu.csr.trgp);
    write_bank(w, &cpu.gcsr);
    w.put_u8(cpu.lvz_enabled as u8);

    let ctx = &cpu.vm_exit_ctx;
    w.put_u64(ctx.fault_gpa);
    w.put_u64(ctx.fault_gva);
    w.put_u8(ctx.gid);
    w.put_u32(ctx.reason.map_or(0, |r| r.code()));
    w.put_u32(ctx.reason.map_or(0, |r| r.aux()));
    w.put_u32(ctx.access.map_or(0, |a| a.code()));
    w.put_u8(ctx.is_tlb_refill as u8);
}

fn read_lvz_payload(r: &mut ImageReader, cpu: &mut CpuState) -> Result<()> {
    cpu.csr.gstat = r.take_u64()?;
    cpu.csr.gcfg = r.take_u64()?;
    cpu.csr.gintc = r.take_u64()?;
    cpu.csr.gcntc = r.take_u64()?;
    cpu.csr.gtlbc = r.take_u64()?;
    cpu.csr.trgp = r.take_u64()?;
    read_bank(r, &mut cpu.gcsr)?;
    cpu.lvz_enabled = r.take_u8()? != 0;

    let fault_gpa = r.take_u64()?;
    let fault_gva = r.take_u64()?;
    let gid = r.take_u8()?;
    let reason_code = r.take_u32()?;
    let aux = r.take_u32()?;
    let access_code = r.take_u32()?;
    let is_tlb_refill = r.take_u8()? != 0;

    let reason = if reason_code == 0 {
        None
    } else {
        Some(VmExitReason::from_parts(reason_code, aux).map_err(|_| Error::BadValue)?)
    };
    let access = if access_code == 0 {
        None
    } else {
        Some(MemAccess::from_code(access_code).ok_or(Error::BadValue)?)
    };
    cpu.vm_exit_ctx = VmExitContext {
        fault_gpa,
        fault_gva,
        gid,
        reason,
        access,
        is_tlb_refill,
    };
    Ok(())
}

fn write_subsection(w: &mut ImageWriter, tag: u32, version: u32, payload: ImageWriter) {
    w.put_u32(tag);
    w.put_u32(version);
    w.put_u32(payload.buf.len() as u32);
    w.buf.extend_from_slice(&payload.buf);
}

impl CpuState {
    /// Serializes the full core state. The LVZ subsection is present only
    /// when the vCPU implements the capability.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ImageWriter::new();
        w.put_u32(MAGIC);
        w.put_u32(BASE_VERSION);

        for reg in self.gprs.raw() {
            w.put_u64(*reg);
        }
        w.put_u64(self.pc);
        for word in &self.cpucfg {
            w.put_u32(*word);
        }
        write_bank(&mut w, &self.csr);

        let mut tlb = ImageWriter::new();
        write_tlb_payload(&mut tlb, self);
        write_subsection(&mut w, SUBSECTION_TLB, TLB_VERSION, tlb);

        if cpucfg2::lvz.read(self.cpucfg[2]) != 0 {
            let mut lvz = ImageWriter::new();
            write_lvz_payload(&mut lvz, self);
            write_subsection(&mut w, SUBSECTION_LVZ, LVZ_VERSION, lvz);
        }

        w.buf
    }

    /// Decodes an image into a fresh vCPU. Nothing is committed on failure.
    /// Runtime configuration (the second-level miss policy) is not part of
    /// the image and keeps its construction default.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = ImageReader::new(bytes);

        let magic = r.take_u32()?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let version = r.take_u32()?;
        if version != BASE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut gprs = [0u64; 32];
        for reg in gprs.iter_mut() {
            *reg = r.take_u64()?;
        }
        let pc = r.take_u64()?;
        let mut cpucfg = [0u32; CPUCFG_WORDS];
        for word in cpucfg.iter_mut() {
            *word = r.take_u32()?;
        }

        let mut cpu = CpuState::new(cpucfg);
        cpu.gprs.set_raw(gprs);
        cpu.pc = pc;
        read_bank(&mut r, &mut cpu.csr)?;

        let mut seen: ArrayVec<u32, MAX_SUBSECTIONS> = ArrayVec::new();
        while !r.is_empty() {
            let tag = r.take_u32()?;
            let version = r.take_u32()?;
            let len = r.take_u32()? as usize;
            let payload = r.take(len)?;
            if seen.contains(&tag) {
                return Err(Error::DuplicateSubsection(tag));
            }
            let _ = seen.try_push(tag);

            let mut sub = ImageReader::new(payload);
            match tag {
                SUBSECTION_TLB => {
                    if version > TLB_VERSION {
                        return Err(Error::UnsupportedSubsection { tag, version });
                    }
                    read_tlb_payload(&mut sub, &mut cpu)?;
                }
                SUBSECTION_LVZ => {
                    if version > LVZ_VERSION {
                        return Err(Error::UnsupportedSubsection { tag, version });
                    }
                    read_lvz_payload(&mut sub, &mut cpu)?;
                }
                // Additive subsections from newer writers are skipped.
                _ => {}
            }
        }

        Ok(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SecondLevelPolicy;
    use crate::test_stubs::lvz_cpucfg;
    use loongarch_regs::gstat;

    fn populated_cpu() -> CpuState {
        let mut cpu = CpuState::new(lvz_cpucfg());
        cpu.enable_virtualization(SecondLevelPolicy::Fault);
        cpu.pc = 0x1c00_0042;
        cpu.csr.eentry = 0x1c00_0000;
        cpu.csr.save[3] = 0xdead_beef;
        cpu.csr.gstat = (gstat::vm.val(1) + gstat::gid.val(5)).modify(cpu.csr.gstat);
        cpu.gcsr.era = 0x4000_1234;
        cpu.gcsr.estat = 0x55;

        // Two VMM entries, two guest entries.
        for (i, gid) in [(0usize, 0u8), (7, 0), (100, 5), (2100, 5)] {
            let mut entry = TlbEntry::default();
            entry.set_enabled(true);
            entry.set_gid(gid);
            entry.set_vppn(0x1000 + i as u64);
            entry.entry0 = 0x1111 * (i as u64 + 1);
            entry.entry1 = 0x2222 * (i as u64 + 1);
            cpu.tlb[i] = entry;
        }

        cpu.vm_exit_ctx = VmExitContext {
            fault_gpa: 0x1fe0_0000,
            fault_gva: 0x4000_0000,
            gid: 5,
            reason: Some(VmExitReason::Hypercall(0x42)),
            access: Some(MemAccess::Store),
            is_tlb_refill: false,
        };
        cpu
    }

    #[test]
    fn round_trip_reproduces_all_state() {
        let cpu = populated_cpu();
        let image = cpu.serialize();
        let restored = CpuState::deserialize(&image).unwrap();

        assert_eq!(restored.pc, cpu.pc);
        assert_eq!(restored.gprs.raw(), cpu.gprs.raw());
        assert_eq!(restored.cpucfg, cpu.cpucfg);
        assert_eq!(restored.csr, cpu.csr);
        assert_eq!(restored.gcsr, cpu.gcsr);
        assert_eq!(restored.lvz_enabled, cpu.lvz_enabled);
        assert_eq!(restored.vm_exit_ctx, cpu.vm_exit_ctx);
        for i in 0..TLB_ENTRIES {
            assert_eq!(restored.tlb[i], cpu.tlb[i]);
        }
    }

    #[test]
    fn serialize_then_serialize_is_stable() {
        let cpu = populated_cpu();
        let image = cpu.serialize();
        let restored = CpuState::deserialize(&image).unwrap();
        assert_eq!(restored.serialize(), image);
    }

    #[test]
    fn unknown_major_version_rejected() {
        let cpu = populated_cpu();
        let mut image = cpu.serialize();
        image[4..8].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(
            CpuState::deserialize(&image),
            Err(Error::UnsupportedVersion(3))
        );
    }

    #[test]
    fn bad_magic_rejected() {
        assert_eq!(
            CpuState::deserialize(&[0u8; 64]),
            Err(Error::BadMagic(0))
        );
    }

    #[test]
    fn truncated_image_rejected() {
        let cpu = populated_cpu();
        let image = cpu.serialize();
        let cut = image.len() - 5;
        assert_eq!(
            CpuState::deserialize(&image[..cut]),
            Err(Error::Truncated)
        );
    }

    #[test]
    fn unknown_subsection_is_skipped() {
        let cpu = populated_cpu();
        let mut image = cpu.serialize();
        // A future writer appended a subsection this reader does not know.
        image.extend_from_slice(&99u32.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&8u32.to_le_bytes());
        image.extend_from_slice(&[0xa5; 8]);

        let restored = CpuState::deserialize(&image).unwrap();
        assert_eq!(restored.gcsr, cpu.gcsr);
    }

    #[test]
    fn newer_known_subsection_rejected() {
        // No LVZ capability, so the TLB subsection is the only (and last)
        // subsection in the image.
        let mut cfg = lvz_cpucfg();
        cfg[2] = 0;
        let cpu = CpuState::new(cfg);
        let mut image = cpu.serialize();

        let sub_at = image.len() - 12 - TLB_ENTRIES * 24;
        assert_eq!(&image[sub_at..sub_at + 4], &SUBSECTION_TLB.to_le_bytes());
        image[sub_at + 4..sub_at + 8].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            CpuState::deserialize(&image),
            Err(Error::UnsupportedSubsection { tag: 1, version: 7 })
        );
    }

    #[test]
    fn lvz_subsection_needs_capability() {
        let mut cfg = lvz_cpucfg();
        cfg[2] = 0;
        let mut cpu = CpuState::new(cfg);
        cpu.gcsr.era = 0x77;

        let image = cpu.serialize();
        let restored = CpuState::deserialize(&image).unwrap();
        // Without the capability the guest bank is not part of the image.
        assert_eq!(restored.gcsr.era, 0);
    }
}
