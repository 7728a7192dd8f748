// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Exception causes and guest-exit reasons.

/// Errors as a result of converting to/from raw cause values.
#[derive(Copy, Clone, Debug)]
pub enum Error {
    /// Unknown exception code.
    UnknownException(u32),

    /// Unknown VM exit reason code.
    UnknownExitReason(u32),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Architectural exception causes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    Interrupt,
    /// Page invalid on load.
    PageInvalidLoad,
    /// Page invalid on store.
    PageInvalidStore,
    /// Page invalid on fetch.
    PageInvalidFetch,
    /// Page modification (store to a clean page).
    PageModified,
    /// Page non-readable.
    PageNonReadable,
    /// Page non-executable.
    PageNonExecutable,
    /// Page privilege violation.
    PagePrivilege,
    /// Address error on fetch.
    AddressErrorFetch,
    /// Address error on load/store.
    AddressErrorAccess,
    AddressUnaligned,
    BoundCheck,
    Syscall,
    Breakpoint,
    /// Instruction non-existent.
    InstructionNonExistent,
    /// Instruction privilege violation.
    InstructionPrivilege,
    FpDisabled,
    SimdDisabled,
    AdvancedSimdDisabled,
    FpError,
    VectorFpError,
    WatchpointFetch,
    WatchpointMemory,
    BinaryTranslationDisabled,
    BinaryTranslationError,
    /// Hypervisor call; also the VM-exit delivery vector.
    HypervisorCall,
    Debug,
}

// Exception codes pack a 6-bit major code with a subcode above it.
const fn excode(code: u32, subcode: u32) -> u32 {
    (subcode << 6) | code
}

impl Exception {
    /// Returns the packed architectural exception code.
    pub fn code(&self) -> u32 {
        use Exception::*;
        match self {
            Interrupt => excode(0, 0),
            PageInvalidLoad => excode(1, 0),
            PageInvalidStore => excode(2, 0),
            PageInvalidFetch => excode(3, 0),
            PageModified => excode(4, 0),
            PageNonReadable => excode(5, 0),
            PageNonExecutable => excode(6, 0),
            PagePrivilege => excode(7, 0),
            AddressErrorFetch => excode(8, 0),
            AddressErrorAccess => excode(8, 1),
            AddressUnaligned => excode(9, 0),
            BoundCheck => excode(10, 0),
            Syscall => excode(11, 0),
            Breakpoint => excode(12, 0),
            InstructionNonExistent => excode(13, 0),
            InstructionPrivilege => excode(14, 0),
            FpDisabled => excode(15, 0),
            SimdDisabled => excode(16, 0),
            AdvancedSimdDisabled => excode(17, 0),
            FpError => excode(18, 0),
            VectorFpError => excode(18, 1),
            WatchpointFetch => excode(19, 0),
            WatchpointMemory => excode(19, 1),
            BinaryTranslationDisabled => excode(20, 0),
            BinaryTranslationError => excode(21, 0),
            HypervisorCall => excode(22, 0),
            Debug => excode(26, 0),
        }
    }

    /// Returns the 6-bit major exception code, as written to `ESTAT.ECODE`.
    pub fn ecode(&self) -> u32 {
        self.code() & 0x3f
    }

    /// Returns the exception subcode, as written to `ESTAT.ESUBCODE`.
    pub fn esubcode(&self) -> u32 {
        self.code() >> 6
    }

    /// Returns the Exception corresponding to a packed code.
    pub fn from_code(code: u32) -> Result<Self> {
        use Exception::*;
        let e = match (code & 0x3f, code >> 6) {
            (0, 0) => Interrupt,
            (1, 0) => PageInvalidLoad,
            (2, 0) => PageInvalidStore,
            (3, 0) => PageInvalidFetch,
            (4, 0) => PageModified,
            (5, 0) => PageNonReadable,
            (6, 0) => PageNonExecutable,
            (7, 0) => PagePrivilege,
            (8, 0) => AddressErrorFetch,
            (8, 1) => AddressErrorAccess,
            (9, 0) => AddressUnaligned,
            (10, 0) => BoundCheck,
            (11, 0) => Syscall,
            (12, 0) => Breakpoint,
            (13, 0) => InstructionNonExistent,
            (14, 0) => InstructionPrivilege,
            (15, 0) => FpDisabled,
            (16, 0) => SimdDisabled,
            (17, 0) => AdvancedSimdDisabled,
            (18, 0) => FpError,
            (18, 1) => VectorFpError,
            (19, 0) => WatchpointFetch,
            (19, 1) => WatchpointMemory,
            (20, 0) => BinaryTranslationDisabled,
            (21, 0) => BinaryTranslationError,
            (22, 0) => HypervisorCall,
            (26, 0) => Debug,
            _ => return Err(Error::UnknownException(code)),
        };
        Ok(e)
    }
}

/// Reasons for guest exits. The payload carries the auxiliary information the
/// hypervisor needs to emulate the trapped operation; the wire encoding stays
/// a bare (code, aux) integer pair for migration compatibility.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmExitReason {
    /// MMIO access needing device emulation.
    Mmio,
    /// Interrupt delivery.
    Interrupt,
    /// Timer access or expiry.
    Timer,
    /// IOCSR access.
    Iocsr,
    /// Trapped CSR read.
    CsrRead(u16),
    /// Trapped CSR write.
    CsrWrite(u16),
    /// Trapped CSR exchange.
    CsrExchange(u16),
    /// Hypercall with its immediate code.
    Hypercall(u32),
    /// Trapped CPUCFG (or gated idle).
    CpuCfg,
    /// TLB operation needing hypervisor service.
    Tlb,
    /// Cache operation.
    Cache,
}

impl VmExitReason {
    /// Returns the fixed u32 reason code used in the migration image.
    pub fn code(&self) -> u32 {
        use VmExitReason::*;
        match self {
            Mmio => 1,
            Interrupt => 2,
            Timer => 3,
            Iocsr => 4,
            CsrRead(_) => 5,
            CsrWrite(_) => 6,
            CsrExchange(_) => 7,
            Hypercall(_) => 8,
            CpuCfg => 9,
            Tlb => 10,
            Cache => 11,
        }
    }

    /// Returns the auxiliary slot value (CSR index or hypercall code).
    pub fn aux(&self) -> u32 {
        use VmExitReason::*;
        match self {
            CsrRead(csr) | CsrWrite(csr) | CsrExchange(csr) => *csr as u32,
            Hypercall(code) => *code,
            _ => 0,
        }
    }

    /// Reassembles a reason from its wire encoding.
    pub fn from_parts(code: u32, aux: u32) -> Result<Self> {
        use VmExitReason::*;
        let r = match code {
            1 => Mmio,
            2 => Interrupt,
            3 => Timer,
            4 => Iocsr,
            5 => CsrRead(aux as u16),
            6 => CsrWrite(aux as u16),
            7 => CsrExchange(aux as u16),
            8 => Hypercall(aux),
            9 => CpuCfg,
            10 => Tlb,
            11 => Cache,
            v => return Err(Error::UnknownExitReason(v)),
        };
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes_round_trip() {
        for code in 0..2048 {
            if let Ok(e) = Exception::from_code(code) {
                assert_eq!(e.code(), code);
                assert_eq!(e.ecode(), code & 0x3f);
            }
        }
        // Subcoded exceptions decode distinctly.
        assert_eq!(
            Exception::from_code(0x48).unwrap(),
            Exception::AddressErrorAccess
        );
        assert_eq!(Exception::HypervisorCall.ecode(), 22);
    }

    #[test]
    fn exit_reasons_round_trip() {
        let reasons = [
            VmExitReason::Mmio,
            VmExitReason::Timer,
            VmExitReason::CsrWrite(0x44),
            VmExitReason::Hypercall(0x42),
            VmExitReason::Tlb,
        ];
        for r in reasons {
            assert_eq!(VmExitReason::from_parts(r.code(), r.aux()).unwrap(), r);
        }
        assert!(VmExitReason::from_parts(0, 0).is_err());
        assert!(VmExitReason::from_parts(12, 0).is_err());
    }
}
