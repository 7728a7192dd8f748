// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

// Current mode information.
register_bitfields![u64,
    pub crmd [
        // Current privilege level, 0 (kernel) through 3 (user).
        plv OFFSET(0) NUMBITS(2) [],
        // Global interrupt enable.
        ie OFFSET(2) NUMBITS(1) [],
        // Direct-addressing translation mode.
        da OFFSET(3) NUMBITS(1) [],
        // Paged translation mode.
        pg OFFSET(4) NUMBITS(1) [],
        // Memory access type for fetches in direct-addressing mode.
        datf OFFSET(5) NUMBITS(2) [],
        // Memory access type for loads/stores in direct-addressing mode.
        datm OFFSET(7) NUMBITS(2) [],
        // Watchpoint enable.
        we OFFSET(9) NUMBITS(1) [],
    ]
];

// Pre-exception mode information.
register_bitfields![u64,
    pub prmd [
        // Privilege level prior to taking the exception.
        pplv OFFSET(0) NUMBITS(2) [],
        // Interrupt enable prior to taking the exception.
        pie OFFSET(2) NUMBITS(1) [],
        // Watchpoint enable prior to taking the exception.
        pwe OFFSET(3) NUMBITS(1) [],
    ]
];

// Extended unit enables.
register_bitfields![u64,
    pub euen [
        fpe OFFSET(0) NUMBITS(1) [],
        sxe OFFSET(1) NUMBITS(1) [],
        asxe OFFSET(2) NUMBITS(1) [],
        bte OFFSET(3) NUMBITS(1) [],
    ]
];

// Miscellaneous control.
register_bitfields![u64,
    pub misc [
        // Per-PLV 32-bit address mode enables.
        va32 OFFSET(0) NUMBITS(4) [],
        // Per-PLV rdtime disable bits.
        drdtl OFFSET(4) NUMBITS(4) [],
    ]
];

// Exception configuration.
register_bitfields![u64,
    pub ecfg [
        // Local interrupt enable mask.
        lie OFFSET(0) NUMBITS(13) [],
        // Vector spacing.
        vs OFFSET(16) NUMBITS(3) [],
    ]
];

// Exception status.
register_bitfields![u64,
    pub estat [
        // Interrupt status bits. Only IS[1:0] (the software interrupts) are
        // writable through the CSR interface.
        is OFFSET(0) NUMBITS(13) [],
        // Exception code of the most recent exception.
        ecode OFFSET(16) NUMBITS(6) [],
        esubcode OFFSET(22) NUMBITS(9) [],
    ]
];

// TLB index and operation window control.
register_bitfields![u64,
    pub tlbidx [
        // Index of the entry targeted by tlbrd/tlbwr.
        index OFFSET(0) NUMBITS(12) [],
        // Page size used when filling an MTLB entry.
        ps OFFSET(24) NUMBITS(6) [],
        // Non-existent: set when a search misses or a read hits a disabled
        // entry; a set NE turns tlbwr into an invalidation.
        ne OFFSET(31) NUMBITS(1) [],
    ]
];

// TLB entry high half (64-bit layout): virtual page pair number.
register_bitfields![u64,
    pub tlbehi [
        vppn OFFSET(13) NUMBITS(35) [],
    ]
];

// Address space identifier.
register_bitfields![u64,
    pub asid [
        asid OFFSET(0) NUMBITS(10) [],
        asidbits OFFSET(16) NUMBITS(8) [],
    ]
];

// Page-walk control, lower half: page table and directory 1/2 geometry.
register_bitfields![u64,
    pub pwcl [
        ptbase OFFSET(0) NUMBITS(5) [],
        ptwidth OFFSET(5) NUMBITS(5) [],
        dir1_base OFFSET(10) NUMBITS(5) [],
        dir1_width OFFSET(15) NUMBITS(5) [],
        dir2_base OFFSET(20) NUMBITS(5) [],
        dir2_width OFFSET(25) NUMBITS(5) [],
        // PTE width: 0 is 64-bit, each step adds 64 bits.
        ptewidth OFFSET(30) NUMBITS(2) [],
    ]
];

// Page-walk control, upper half: directory 3/4 geometry.
register_bitfields![u64,
    pub pwch [
        dir3_base OFFSET(0) NUMBITS(6) [],
        dir3_width OFFSET(6) NUMBITS(6) [],
        dir4_base OFFSET(12) NUMBITS(6) [],
        dir4_width OFFSET(18) NUMBITS(6) [],
    ]
];

// STLB page size, log2.
register_bitfields![u64,
    pub stlbps [
        ps OFFSET(0) NUMBITS(6) [],
    ]
];

// TLB refill exception return address and state.
register_bitfields![u64,
    pub tlbrera [
        // Set while servicing a TLB refill; selects the refill CSR window.
        istlbr OFFSET(0) NUMBITS(1) [],
        // Return PC, stored right-shifted by 2.
        pc OFFSET(2) NUMBITS(62) [],
    ]
];

pub trait TlbreraHelpers {
    fn return_pc(&self) -> u64;
}

impl TlbreraHelpers for LocalRegisterCopy<u64, tlbrera::Register> {
    fn return_pc(&self) -> u64 {
        self.read(tlbrera::pc) << 2
    }
}

// TLB refill entry high half: refill page size and VPPN.
register_bitfields![u64,
    pub tlbrehi [
        ps OFFSET(0) NUMBITS(6) [],
        vppn OFFSET(13) NUMBITS(35) [],
    ]
];

// TLB refill pre-exception mode information.
register_bitfields![u64,
    pub tlbrprmd [
        pplv OFFSET(0) NUMBITS(2) [],
        pie OFFSET(2) NUMBITS(1) [],
    ]
];

// Direct-mapped window configuration (64-bit layout).
register_bitfields![u64,
    pub dmw [
        // Privilege levels permitted to use the window.
        plv0 OFFSET(0) NUMBITS(1) [],
        plv1 OFFSET(1) NUMBITS(1) [],
        plv2 OFFSET(2) NUMBITS(1) [],
        plv3 OFFSET(3) NUMBITS(1) [],
        // Memory access type for the window.
        mat OFFSET(4) NUMBITS(2) [],
        // Virtual segment tag compared against va[63:60].
        vseg OFFSET(60) NUMBITS(4) [],
    ]
];

// LL bit control.
register_bitfields![u64,
    pub llbctl [
        rollb OFFSET(0) NUMBITS(1) [],
        wcllb OFFSET(1) NUMBITS(1) [],
        klo OFFSET(2) NUMBITS(1) [],
    ]
];

// Timer interrupt clear.
register_bitfields![u64,
    pub ticlr [
        clr OFFSET(0) NUMBITS(1) [],
    ]
];

// Debug control.
register_bitfields![u64,
    pub dbg [
        // Debug state; suppresses BADV updates while set.
        dst OFFSET(0) NUMBITS(1) [],
    ]
];

// Guest status.
register_bitfields![u64,
    pub gstat [
        // Virtualization mode: set while executing guest instructions.
        vm OFFSET(0) NUMBITS(1) [],
        // VM value stashed at the most recent VM exit.
        pvm OFFSET(1) NUMBITS(1) [],
        // Guest identifier of the current guest.
        gid OFFSET(16) NUMBITS(8) [],
    ]
];

// Guest configuration: per-cause trap enables.
register_bitfields![u64,
    pub gcfg [
        // Trap on second-level page faults and MMIO accesses.
        toep OFFSET(0) NUMBITS(1) [],
        // Trap on timer expiry.
        toe OFFSET(1) NUMBITS(1) [],
        // Trap on IOCSR access.
        tit OFFSET(2) NUMBITS(1) [],
        // Guest ESTAT read/write passthrough.
        sitp OFFSET(6) NUMBITS(1) [],
        sito OFFSET(7) NUMBITS(1) [],
        // Guest timer read/write passthrough.
        titp OFFSET(8) NUMBITS(1) [],
        tito OFFSET(9) NUMBITS(1) [],
    ]
];

// Guest TLB control.
register_bitfields![u64,
    pub gtlbc [
        gmtlb_num OFFSET(0) NUMBITS(6) [],
        // When set, TLB fills are tagged with TGID instead of the current GID.
        use_tgid OFFSET(12) NUMBITS(1) [],
        // Trap on guest TLB instructions.
        toti OFFSET(13) NUMBITS(1) [],
        tgid OFFSET(16) NUMBITS(8) [],
    ]
];

// TLB entry tag word: enable, ASID, VPPN, page size and guest ID.
register_bitfields![u64,
    pub tlb_misc [
        e OFFSET(0) NUMBITS(1) [],
        asid OFFSET(1) NUMBITS(10) [],
        // Virtual page pair number, va[47:13].
        vppn OFFSET(13) NUMBITS(35) [],
        // log2 page size; only meaningful for MTLB entries.
        ps OFFSET(48) NUMBITS(6) [],
        // Guest ID tag; 0 marks a VMM (second-stage) mapping.
        gid OFFSET(54) NUMBITS(8) [],
    ]
];

/// Shift of the VPPN field within `tlb_misc` and `tlbehi`.
pub const TLB_MISC_VPPN_SHIFT: u64 = 13;

// TLB page-frame descriptor, fields shared by both address widths. The same
// word doubles as a page-walk directory entry, where bit 6 is HUGE.
register_bitfields![u64,
    pub tlbentry [
        v OFFSET(0) NUMBITS(1) [],
        d OFFSET(1) NUMBITS(1) [],
        plv OFFSET(2) NUMBITS(2) [],
        mat OFFSET(4) NUMBITS(2) [],
        g OFFSET(6) NUMBITS(1) [],
        huge OFFSET(6) NUMBITS(1) [],
        hglobal OFFSET(12) NUMBITS(1) [],
        level OFFSET(13) NUMBITS(2) [],
    ]
];

// TLB page-frame descriptor, 64-bit-only fields.
register_bitfields![u64,
    pub tlbentry_64 [
        ppn OFFSET(12) NUMBITS(36) [],
        nr OFFSET(61) NUMBITS(1) [],
        nx OFFSET(62) NUMBITS(1) [],
        rplv OFFSET(63) NUMBITS(1) [],
    ]
];

/// Shift of the PPN field within a 64-bit TLB page-frame descriptor.
pub const TLBENTRY_64_PPN_SHIFT: u64 = 12;

// CPUCFG word 1: base architecture description.
register_bitfields![u32,
    pub cpucfg1 [
        arch OFFSET(0) NUMBITS(2) [],
        pgmmu OFFSET(2) NUMBITS(1) [],
        iocsr OFFSET(3) NUMBITS(1) [],
        palen OFFSET(4) NUMBITS(8) [],
        valen OFFSET(12) NUMBITS(8) [],
    ]
];

/// `cpucfg1.arch` values.
pub const CPUCFG1_ARCH_LA32R: u32 = 0;
pub const CPUCFG1_ARCH_LA32: u32 = 1;
pub const CPUCFG1_ARCH_LA64: u32 = 2;

// CPUCFG word 2: ISA extensions, including the virtualization capability.
register_bitfields![u32,
    pub cpucfg2 [
        fp OFFSET(0) NUMBITS(1) [],
        lsx OFFSET(6) NUMBITS(1) [],
        lasx OFFSET(7) NUMBITS(1) [],
        lvz OFFSET(10) NUMBITS(1) [],
        lvz_ver OFFSET(11) NUMBITS(3) [],
        llftp OFFSET(14) NUMBITS(1) [],
    ]
];
