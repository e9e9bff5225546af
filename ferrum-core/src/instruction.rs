//! The instruction identity catalogue.
//!
//! Every opcode the simulator supports has exactly one identity in
//! [`InstId`]. The decoder's lookup tables map encodings to identities, and
//! the trace/disassembly paths map identities back to mnemonic text. The
//! enumeration is closed: extending the supported ISA means adding
//! enumerators here first.
//!
//! [`InstId::Illegal`] precedes everything; [`InstId::MAX_ID`] equals the
//! last enumerator, so identities fit lookup tables of
//! `InstId::MAX_ID as usize + 1` entries.

use std::fmt;

macro_rules! inst_ids {
    (
        $( $(#[$group:meta])* $variant:ident => $name:literal ),* $(,)?
    ) => {
        /// Unique identity of each supported instruction.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[repr(u16)]
        pub enum InstId {
            $( $(#[$group])* $variant ),*
        }

        impl InstId {
            /// Every identity, in enumeration order. `ALL[id as usize]`
            /// is `id` for any identity.
            pub const ALL: &'static [InstId] = &[ $( InstId::$variant ),* ];

            /// The assembly mnemonic of this identity, as emitted in trace
            /// and disassembly text.
            pub fn name(self) -> &'static str {
                match self {
                    $( InstId::$variant => $name ),*
                }
            }
        }
    };
}

inst_ids! {
    Illegal => "illegal",

    // RV32I base.
    Lui => "lui",
    Auipc => "auipc",
    Jal => "jal",
    Jalr => "jalr",
    Beq => "beq",
    Bne => "bne",
    Blt => "blt",
    Bge => "bge",
    Bltu => "bltu",
    Bgeu => "bgeu",
    Lb => "lb",
    Lh => "lh",
    Lw => "lw",
    Lbu => "lbu",
    Lhu => "lhu",
    Sb => "sb",
    Sh => "sh",
    Sw => "sw",
    Addi => "addi",
    Slti => "slti",
    Sltiu => "sltiu",
    Xori => "xori",
    Ori => "ori",
    Andi => "andi",
    Slli => "slli",
    Srli => "srli",
    Srai => "srai",
    Add => "add",
    Sub => "sub",
    Sll => "sll",
    Slt => "slt",
    Sltu => "sltu",
    Xor => "xor",
    Srl => "srl",
    Sra => "sra",
    Or => "or",
    And => "and",
    Fence => "fence",
    Fencei => "fence.i",
    Ecall => "ecall",
    Ebreak => "ebreak",

    // CSR access.
    Csrrw => "csrrw",
    Csrrs => "csrrs",
    Csrrc => "csrrc",
    Csrrwi => "csrrwi",
    Csrrsi => "csrrsi",
    Csrrci => "csrrci",

    // RV64I.
    Lwu => "lwu",
    Ld => "ld",
    Sd => "sd",
    Addiw => "addiw",
    Slliw => "slliw",
    Srliw => "srliw",
    Sraiw => "sraiw",
    Addw => "addw",
    Subw => "subw",
    Sllw => "sllw",
    Srlw => "srlw",
    Sraw => "sraw",

    // Multiply/divide.
    Mul => "mul",
    Mulh => "mulh",
    Mulhsu => "mulhsu",
    Mulhu => "mulhu",
    Div => "div",
    Divu => "divu",
    Rem => "rem",
    Remu => "remu",

    // 64-bit multiply/divide.
    Mulw => "mulw",
    Divw => "divw",
    Divuw => "divuw",
    Remw => "remw",
    Remuw => "remuw",

    // Atomic.
    LrW => "lr.w",
    ScW => "sc.w",
    AmoswapW => "amoswap.w",
    AmoaddW => "amoadd.w",
    AmoxorW => "amoxor.w",
    AmoandW => "amoand.w",
    AmoorW => "amoor.w",
    AmominW => "amomin.w",
    AmomaxW => "amomax.w",
    AmominuW => "amominu.w",
    AmomaxuW => "amomaxu.w",

    // 64-bit atomic.
    LrD => "lr.d",
    ScD => "sc.d",
    AmoswapD => "amoswap.d",
    AmoaddD => "amoadd.d",
    AmoxorD => "amoxor.d",
    AmoandD => "amoand.d",
    AmoorD => "amoor.d",
    AmominD => "amomin.d",
    AmomaxD => "amomax.d",
    AmominuD => "amominu.d",
    AmomaxuD => "amomaxu.d",

    // RV32F.
    Flw => "flw",
    Fsw => "fsw",
    FmaddS => "fmadd.s",
    FmsubS => "fmsub.s",
    FnmsubS => "fnmsub.s",
    FnmaddS => "fnmadd.s",
    FaddS => "fadd.s",
    FsubS => "fsub.s",
    FmulS => "fmul.s",
    FdivS => "fdiv.s",
    FsqrtS => "fsqrt.s",
    FsgnjS => "fsgnj.s",
    FsgnjnS => "fsgnjn.s",
    FsgnjxS => "fsgnjx.s",
    FminS => "fmin.s",
    FmaxS => "fmax.s",
    FcvtWS => "fcvt.w.s",
    FcvtWuS => "fcvt.wu.s",
    FmvXW => "fmv.x.w",
    FeqS => "feq.s",
    FltS => "flt.s",
    FleS => "fle.s",
    FclassS => "fclass.s",
    FcvtSW => "fcvt.s.w",
    FcvtSWu => "fcvt.s.wu",
    FmvWX => "fmv.w.x",

    // RV64F.
    FcvtLS => "fcvt.l.s",
    FcvtLuS => "fcvt.lu.s",
    FcvtSL => "fcvt.s.l",
    FcvtSLu => "fcvt.s.lu",

    // RV32D.
    Fld => "fld",
    Fsd => "fsd",
    FmaddD => "fmadd.d",
    FmsubD => "fmsub.d",
    FnmsubD => "fnmsub.d",
    FnmaddD => "fnmadd.d",
    FaddD => "fadd.d",
    FsubD => "fsub.d",
    FmulD => "fmul.d",
    FdivD => "fdiv.d",
    FsqrtD => "fsqrt.d",
    FsgnjD => "fsgnj.d",
    FsgnjnD => "fsgnjn.d",
    FsgnjxD => "fsgnjx.d",
    FminD => "fmin.d",
    FmaxD => "fmax.d",
    FcvtSD => "fcvt.s.d",
    FcvtDS => "fcvt.d.s",
    FeqD => "feq.d",
    FltD => "flt.d",
    FleD => "fle.d",
    FclassD => "fclass.d",
    FcvtWD => "fcvt.w.d",
    FcvtWuD => "fcvt.wu.d",
    FcvtDW => "fcvt.d.w",
    FcvtDWu => "fcvt.d.wu",

    // RV64D.
    FcvtLD => "fcvt.l.d",
    FcvtLuD => "fcvt.lu.d",
    FmvXD => "fmv.x.d",
    FcvtDL => "fcvt.d.l",
    FcvtDLu => "fcvt.d.lu",
    FmvDX => "fmv.d.x",

    // Privileged.
    Mret => "mret",
    Uret => "uret",
    Sret => "sret",
    Wfi => "wfi",

    // Supervisor.
    SfenceVma => "sfence.vma",

    // Compressed.
    CAddi4spn => "c.addi4spn",
    CFld => "c.fld",
    CLq => "c.lq",
    CLw => "c.lw",
    CFlw => "c.flw",
    CLd => "c.ld",
    CFsd => "c.fsd",
    CSq => "c.sq",
    CSw => "c.sw",
    CFsw => "c.fsw",
    CSd => "c.sd",
    CAddi => "c.addi",
    CJal => "c.jal",
    CLi => "c.li",
    CAddi16sp => "c.addi16sp",
    CLui => "c.lui",
    CSrli => "c.srli",
    CSrli64 => "c.srli64",
    CSrai => "c.srai",
    CSrai64 => "c.srai64",
    CAndi => "c.andi",
    CSub => "c.sub",
    CXor => "c.xor",
    COr => "c.or",
    CAnd => "c.and",
    CSubw => "c.subw",
    CAddw => "c.addw",
    CJ => "c.j",
    CBeqz => "c.beqz",
    CBnez => "c.bnez",
    CSlli => "c.slli",
    CSlli64 => "c.slli64",
    CFldsp => "c.fldsp",
    CLwsp => "c.lwsp",
    CFlwsp => "c.flwsp",
    CLdsp => "c.ldsp",
    CJr => "c.jr",
    CMv => "c.mv",
    CEbreak => "c.ebreak",
    CJalr => "c.jalr",
    CAdd => "c.add",
    CFsdsp => "c.fsdsp",
    CSwsp => "c.swsp",
    CFswsp => "c.fswsp",
    CAddiw => "c.addiw",
    CSdsp => "c.sdsp",

    // Zbb.
    Clz => "clz",
    Ctz => "ctz",
    Pcnt => "pcnt",
    Andn => "andn",
    Orn => "orn",
    Xnor => "xnor",
    Slo => "slo",
    Sro => "sro",
    Sloi => "sloi",
    Sroi => "sroi",
    Min => "min",
    Max => "max",
    Minu => "minu",
    Maxu => "maxu",
    Rol => "rol",
    Ror => "ror",
    Rori => "rori",
    Rev8 => "rev8",
    Rev => "rev",
    Pack => "pack",
    Addwu => "addwu",
    Subwu => "subwu",
    Addiwu => "addiwu",
    SextB => "sext.b",
    SextH => "sext.h",
    AdduW => "addu.w",
    SubuW => "subu.w",
    SlliuW => "slliu.w",
    Packh => "packh",
    Packu => "packu",
    Packw => "packw",
    Packuw => "packuw",
    Grev => "grev",
    Grevi => "grevi",
    Gorc => "gorc",
    Gorci => "gorci",
    Shfl => "shfl",
    Shfli => "shfli",
    Unshfl => "unshfl",
    Unshfli => "unshfli",

    Sbset => "sbset",
    Sbclr => "sbclr",
    Sbinv => "sbinv",
    Sbext => "sbext",
    Sbseti => "sbseti",
    Sbclri => "sbclri",
    Sbinvi => "sbinvi",
    Sbexti => "sbexti",

    // Zbe.
    Bdep => "bdep",
    Bext => "bext",

    // Zbf.
    Bfp => "bfp",

    // Zbc.
    Clmul => "clmul",
    Clmulh => "clmulh",
    Clmulr => "clmulr",

    // Zba.
    Sh1add => "sh1add",
    Sh2add => "sh2add",
    Sh3add => "sh3add",
    Sh1adduW => "sh1addu.w",
    Sh2adduW => "sh2addu.w",
    Sh3adduW => "sh3addu.w",

    // Zbr.
    Crc32B => "crc32.b",
    Crc32H => "crc32.h",
    Crc32W => "crc32.w",
    Crc32D => "crc32.d",
    Crc32cB => "crc32c.b",
    Crc32cH => "crc32c.h",
    Crc32cW => "crc32c.w",
    Crc32cD => "crc32c.d",

    // Zbm.
    Bmator => "bmator",
    Bmatxor => "bmatxor",
    Bmatflip => "bmatflip",

    // Zbt.
    Cmov => "cmov",
    Cmix => "cmix",
    Fsl => "fsl",
    Fsr => "fsr",
    Fsri => "fsri",

    // Vector.
    VaddVv => "vadd.vv",
    VaddVx => "vadd.vx",
    VaddVi => "vadd.vi",

    VsubVv => "vsub.vv",
    VsubVx => "vsub.vx",

    VrsubVx => "vrsub.vx",
    VrsubVi => "vrsub.vi",

    VminuVv => "vminu.vv",
    VminuVx => "vminu.vx",
    VminVv => "vmin.vv",
    VminVx => "vmin.vx",

    VmaxuVv => "vmaxu.vv",
    VmaxuVx => "vmaxu.vx",
    VmaxVv => "vmax.vv",
    VmaxVx => "vmax.vx",

    VandVv => "vand.vv",
    VandVx => "vand.vx",
    VandVi => "vand.vi",

    VorVv => "vor.vv",
    VorVx => "vor.vx",
    VorVi => "vor.vi",

    VxorVv => "vxor.vv",
    VxorVx => "vxor.vx",
    VxorVi => "vxor.vi",

    VrgatherVv => "vrgather.vv",
    VrgatherVx => "vrgather.vx",
    VrgatherVi => "vrgather.vi",
}

impl InstId {
    /// Sentinel equal to the last enumerator.
    pub const MAX_ID: InstId = InstId::VrgatherVi;

    /// The identity with the given numeric value, or `None` past
    /// [`MAX_ID`](Self::MAX_ID). Inverse of `id as u16`, for table-driven
    /// decoders.
    pub fn from_u16(id: u16) -> Option<InstId> {
        Self::ALL.get(id as usize).copied()
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_comes_first() {
        assert_eq!(InstId::Illegal as u16, 0);
        assert_eq!(InstId::ALL[0], InstId::Illegal);
    }

    #[test]
    fn max_id_is_the_last_enumerator() {
        assert_eq!(InstId::ALL.last(), Some(&InstId::MAX_ID));
        assert_eq!(InstId::ALL.len(), InstId::MAX_ID as usize + 1);
    }

    #[test]
    fn all_is_in_enumeration_order() {
        for (index, id) in InstId::ALL.iter().enumerate() {
            assert_eq!(*id as usize, index);
        }
    }

    #[test]
    fn from_u16_round_trips() {
        for id in InstId::ALL {
            assert_eq!(InstId::from_u16(*id as u16), Some(*id));
        }
        assert_eq!(InstId::from_u16(InstId::MAX_ID as u16 + 1), None);
        assert_eq!(InstId::from_u16(u16::MAX), None);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = InstId::ALL.iter().map(|id| id.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), InstId::ALL.len());
    }

    #[test]
    fn mnemonics() {
        assert_eq!(InstId::Lui.name(), "lui");
        assert_eq!(InstId::Fencei.name(), "fence.i");
        assert_eq!(InstId::ScW.name(), "sc.w");
        assert_eq!(InstId::AmomaxuD.name(), "amomaxu.d");
        assert_eq!(InstId::FcvtWuS.name(), "fcvt.wu.s");
        assert_eq!(InstId::FmvDX.name(), "fmv.d.x");
        assert_eq!(InstId::SfenceVma.name(), "sfence.vma");
        assert_eq!(InstId::CAddi4spn.name(), "c.addi4spn");
        assert_eq!(InstId::SextB.name(), "sext.b");
        assert_eq!(InstId::Sh3adduW.name(), "sh3addu.w");
        assert_eq!(InstId::Crc32cD.name(), "crc32c.d");
        assert_eq!(InstId::VrgatherVi.to_string(), "vrgather.vi");
    }

    #[test]
    fn extension_groups_are_contiguous() {
        // The decoder relies on a few group boundaries when building its
        // lookup tables.
        assert_eq!(InstId::Lui as u16, 1);
        assert_eq!(InstId::ScW as u16, InstId::LrW as u16 + 1);
        assert_eq!(InstId::LrD as u16, InstId::AmomaxuW as u16 + 1);
        assert_eq!(InstId::CSdsp as u16, InstId::CAddiw as u16 + 1);
        assert_eq!(InstId::VaddVv as u16, InstId::Fsri as u16 + 1);
    }
}
