//! Partial x86-64 decoder for trapped MMIO accesses.
//!
//! The ghostbus fault handler needs exactly three things from the faulting
//! instruction: what kind of access it is, how wide it is, and how many
//! bytes to skip when resuming. This crate provides that for the access
//! classes drivers actually emit against device windows — scalar `MOV`
//! loads and stores (register and immediate forms, including the
//! zero/sign-extending `0F B6/B7/BE/BF` loads) and `STOS` bulk stores with
//! an optional `REP` prefix. Everything else is reported as unsupported so
//! the caller can refuse to emulate rather than misemulate.
//!
//! ## Design notes
//!
//! - Deterministic and allocation free: decoding is a pure function over a
//!   byte slice, safe to run from a signal handler.
//! - Prefix handling accepts any number of legacy prefixes in any order
//!   with last-prefix-wins semantics, then one optional REX byte.
//! - VEX/EVEX encodings are deliberately *not* decoded; an AVX-optimized
//!   bulk store trips the unsupported-opcode path by design.

#![deny(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Maximum architectural x86 instruction length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Segment override prefix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// ES (`26`)
    Es,
    /// CS (`2E`)
    Cs,
    /// SS (`36`)
    Ss,
    /// DS (`3E`)
    Ds,
    /// FS (`64`)
    Fs,
    /// GS (`65`)
    Gs,
}

/// REX prefix byte and decoded bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rex {
    /// Raw REX byte (`0x40..=0x4F`).
    pub byte: u8,
}

impl Rex {
    /// REX.W: 64-bit operand size.
    #[inline]
    pub fn w(self) -> bool {
        self.byte & 0b1000 != 0
    }
    /// REX.R: extends ModR/M.reg.
    #[inline]
    pub fn r(self) -> bool {
        self.byte & 0b0100 != 0
    }
    /// REX.X: extends SIB.index.
    #[inline]
    pub fn x(self) -> bool {
        self.byte & 0b0010 != 0
    }
    /// REX.B: extends ModR/M.rm or SIB.base.
    #[inline]
    pub fn b(self) -> bool {
        self.byte & 0b0001 != 0
    }
}

/// Legacy + REX prefix state for one instruction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Prefixes {
    /// `LOCK` prefix (`F0`)
    pub lock: bool,
    /// `REP`/`REPE` prefix (`F3`)
    pub rep: bool,
    /// `REPNE` prefix (`F2`)
    pub repne: bool,
    /// Segment override prefix, if present.
    pub segment: Option<Segment>,
    /// Operand-size override prefix (`66`)
    pub operand_size_override: bool,
    /// Address-size override prefix (`67`)
    pub address_size_override: bool,
    /// REX prefix, if present.
    pub rex: Option<Rex>,
}

impl Prefixes {
    /// Operand size in bytes for the non-byte opcodes (`89`, `8B`, `AB`,
    /// and the `0F Bx` destination): REX.W wins over `66`.
    fn operand_size(&self) -> u8 {
        if self.rex.is_some_and(|r| r.w()) {
            8
        } else if self.operand_size_override {
            2
        } else {
            4
        }
    }
}

/// A general-purpose register reference in the saved register file.
///
/// `index` is the x86 encoding order (0 = RAX, 1 = RCX, …, 15 = R15).
/// `high_byte` marks the legacy `AH/CH/DH/BH` byte forms, which address
/// bits 8..16 of RAX/RCX/RDX/RBX.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reg {
    /// Register index in x86 encoding order (0–15).
    pub index: u8,
    /// Bits 8..16 of the underlying register (`AH`-style) instead of the
    /// low bits.
    pub high_byte: bool,
}

impl Reg {
    /// A plain (low-bits) register reference.
    pub fn low(index: u8) -> Self {
        Self {
            index,
            high_byte: false,
        }
    }
}

/// Where a scalar store takes its value from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreSource {
    /// The ModR/M `reg` operand, masked to the store size.
    Register(Reg),
    /// Immediate bytes from the instruction stream. For the REX.W form of
    /// `C7` the 4-byte immediate is already sign-extended to 8 bytes.
    Immediate(u64),
}

/// Classification of a supported faulting access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    /// `MOV r, [m]` and the `0F B6/B7/BE/BF` extending forms.
    Load {
        /// Destination register.
        dest: Reg,
        /// Memory operand size in bytes (1, 2, 4, or 8).
        mem_size: u8,
        /// Destination operand size in bytes; differs from `mem_size` only
        /// for the extending forms.
        dest_size: u8,
        /// Sign-extend (`0F BE/BF`) rather than zero-extend.
        sign_extend: bool,
    },
    /// `MOV [m], r` / `MOV [m], imm`.
    Store {
        /// Value source (register or decoded immediate).
        source: StoreSource,
        /// Store size in bytes (1, 2, 4, or 8).
        size: u8,
    },
    /// `STOS` with implicit operands (RDI destination, RAX accumulator,
    /// RCX count when `rep` is set).
    BulkStore {
        /// Element size in bytes (1, 2, 4, or 8).
        elem_size: u8,
        /// `F3` prefix present; without it the instruction stores exactly
        /// one element and does not touch the count register.
        rep: bool,
    },
}

/// Decoded faulting instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodedAccess {
    /// Total instruction length in bytes; add to RIP to resume past it.
    pub len: u8,
    /// What the instruction does to memory.
    pub access: Access,
    /// Prefix state, kept for diagnostics.
    pub prefixes: Prefixes,
}

/// Which opcode map an unsupported opcode was found in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpcodeMap {
    /// Single-byte opcodes.
    Primary,
    /// `0F xx`.
    Map0F,
    /// `0F 38 xx` (recognized only far enough to name the third byte).
    Map0F38,
    /// `0F 3A xx` (recognized only far enough to name the third byte).
    Map0F3A,
}

impl fmt::Display for OpcodeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpcodeMap::Primary => "primary",
            OpcodeMap::Map0F => "0f",
            OpcodeMap::Map0F38 => "0f 38",
            OpcodeMap::Map0F3A => "0f 3a",
        })
    }
}

/// Decoder error.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes than the instruction needs (the caller reads up to
    /// [`MAX_INSTRUCTION_LEN`] bytes from the faulting RIP).
    #[error("truncated instruction")]
    UnexpectedEof,
    /// Opcode outside the supported access classes.
    #[error("unsupported opcode {opcode:#04x} ({map} map)")]
    UnsupportedOpcode {
        /// The offending opcode byte.
        opcode: u8,
        /// The map it was found in.
        map: OpcodeMap,
    },
    /// A supported opcode with a register-direct ModR/M; such an
    /// instruction cannot fault on memory, so seeing one here means the
    /// fault did not come from a decodable device access.
    #[error("register-direct mov cannot fault on memory")]
    NoMemoryOperand,
    /// `C6`/`C7` with a ModR/M extension other than `/0` (not a MOV).
    #[error("unsupported modrm opcode extension /{0}")]
    UnsupportedExtension(u8),
}

/// Decode one instruction from `bytes` (the bytes at the faulting RIP).
///
/// `bytes` should contain the next [`MAX_INSTRUCTION_LEN`] bytes when
/// possible; shorter input may return [`DecodeError::UnexpectedEof`].
pub fn decode(bytes: &[u8]) -> Result<DecodedAccess, DecodeError> {
    let bytes = if bytes.len() > MAX_INSTRUCTION_LEN {
        &bytes[..MAX_INSTRUCTION_LEN]
    } else {
        bytes
    };

    let (prefixes, idx) = parse_prefixes(bytes)?;
    let opcode = *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?;
    let idx = idx + 1;

    let (access, end) = match opcode {
        // MOV [m], r8
        0x88 => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            (
                Access::Store {
                    source: StoreSource::Register(byte_reg(reg, &prefixes)),
                    size: 1,
                },
                end,
            )
        }
        // MOV [m], r16/32/64
        0x89 => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            (
                Access::Store {
                    source: StoreSource::Register(Reg::low(reg)),
                    size: prefixes.operand_size(),
                },
                end,
            )
        }
        // MOV r8, [m]
        0x8A => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            (
                Access::Load {
                    dest: byte_reg(reg, &prefixes),
                    mem_size: 1,
                    dest_size: 1,
                    sign_extend: false,
                },
                end,
            )
        }
        // MOV r16/32/64, [m]
        0x8B => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            let size = prefixes.operand_size();
            (
                Access::Load {
                    dest: Reg::low(reg),
                    mem_size: size,
                    dest_size: size,
                    sign_extend: false,
                },
                end,
            )
        }
        // MOV [m], imm8
        0xC6 => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            if reg & 0x7 != 0 {
                return Err(DecodeError::UnsupportedExtension(reg & 0x7));
            }
            let (imm, end) = read_imm(bytes, end, 1)?;
            (
                Access::Store {
                    source: StoreSource::Immediate(imm),
                    size: 1,
                },
                end,
            )
        }
        // MOV [m], imm16/32. The immediate stays 4 bytes under REX.W and is
        // sign-extended to the 8-byte store value, as the architecture does.
        0xC7 => {
            let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
            if reg & 0x7 != 0 {
                return Err(DecodeError::UnsupportedExtension(reg & 0x7));
            }
            let size = prefixes.operand_size();
            let imm_len = if size == 2 { 2 } else { 4 };
            let (raw, end) = read_imm(bytes, end, imm_len)?;
            let imm = if size == 8 {
                raw as u32 as i32 as i64 as u64
            } else {
                raw
            };
            (
                Access::Store {
                    source: StoreSource::Immediate(imm),
                    size,
                },
                end,
            )
        }
        // STOSB
        0xAA => (
            Access::BulkStore {
                elem_size: 1,
                rep: prefixes.rep,
            },
            idx,
        ),
        // STOSW/STOSD/STOSQ
        0xAB => (
            Access::BulkStore {
                elem_size: prefixes.operand_size(),
                rep: prefixes.rep,
            },
            idx,
        ),
        0x0F => return decode_0f(bytes, idx, prefixes),
        other => {
            return Err(DecodeError::UnsupportedOpcode {
                opcode: other,
                map: OpcodeMap::Primary,
            })
        }
    };

    Ok(DecodedAccess {
        len: end as u8,
        access,
        prefixes,
    })
}

/// `0F`-map opcodes: the extending loads, plus enough of `0F 38`/`0F 3A`
/// to name the third byte in the error.
fn decode_0f(
    bytes: &[u8],
    idx: usize,
    prefixes: Prefixes,
) -> Result<DecodedAccess, DecodeError> {
    let opcode = *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?;
    let idx = idx + 1;

    let (mem_size, sign_extend) = match opcode {
        0xB6 => (1, false),
        0xB7 => (2, false),
        0xBE => (1, true),
        0xBF => (2, true),
        0x38 | 0x3A => {
            let third = *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?;
            return Err(DecodeError::UnsupportedOpcode {
                opcode: third,
                map: if opcode == 0x38 {
                    OpcodeMap::Map0F38
                } else {
                    OpcodeMap::Map0F3A
                },
            });
        }
        other => {
            return Err(DecodeError::UnsupportedOpcode {
                opcode: other,
                map: OpcodeMap::Map0F,
            })
        }
    };

    let (reg, end) = parse_memory_modrm(bytes, idx, &prefixes)?;
    Ok(DecodedAccess {
        len: end as u8,
        access: Access::Load {
            dest: Reg::low(reg),
            mem_size,
            dest_size: prefixes.operand_size(),
            sign_extend,
        },
        prefixes,
    })
}

fn is_segment_override(byte: u8) -> Option<Segment> {
    Some(match byte {
        0x26 => Segment::Es,
        0x2E => Segment::Cs,
        0x36 => Segment::Ss,
        0x3E => Segment::Ds,
        0x64 => Segment::Fs,
        0x65 => Segment::Gs,
        _ => return None,
    })
}

/// Parse legacy prefixes (any number, any order, last-prefix-wins) followed
/// by one optional REX byte. Returns the prefix state and the index of the
/// opcode byte.
fn parse_prefixes(bytes: &[u8]) -> Result<(Prefixes, usize), DecodeError> {
    let mut p = Prefixes::default();
    let mut idx = 0usize;

    while idx < bytes.len() && idx < MAX_INSTRUCTION_LEN {
        let b = bytes[idx];
        match b {
            0xF0 => p.lock = true,
            0xF2 => {
                p.repne = true;
                p.rep = false;
            }
            0xF3 => {
                p.rep = true;
                p.repne = false;
            }
            0x66 => p.operand_size_override = true,
            0x67 => p.address_size_override = true,
            _ => {
                if let Some(seg) = is_segment_override(b) {
                    p.segment = Some(seg);
                } else {
                    break;
                }
            }
        }
        idx += 1;
    }

    if let Some(&b) = bytes.get(idx) {
        if (0x40..=0x4F).contains(&b) {
            p.rex = Some(Rex { byte: b });
            idx += 1;
        }
    }

    if idx >= bytes.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok((p, idx))
}

/// Parse a ModR/M byte that must name a memory operand, plus its SIB byte
/// and displacement. Returns the REX-extended `reg` field and the index of
/// the first byte past the addressing form.
fn parse_memory_modrm(
    bytes: &[u8],
    idx: usize,
    prefixes: &Prefixes,
) -> Result<(u8, usize), DecodeError> {
    let modrm = *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?;
    let mode = modrm >> 6;
    let mut reg = (modrm >> 3) & 0x7;
    let rm = modrm & 0x7;

    if mode == 3 {
        return Err(DecodeError::NoMemoryOperand);
    }
    if prefixes.rex.is_some_and(|r| r.r()) {
        reg |= 0x8;
    }

    let mut idx = idx + 1;
    let mut disp = match mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };

    if rm == 4 {
        // SIB. A base field of 5 with mod=00 means no base, disp32.
        let sib = *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?;
        idx += 1;
        if mode == 0 && (sib & 0x7) == 5 {
            disp = 4;
        }
    } else if mode == 0 && rm == 5 {
        // RIP-relative, disp32.
        disp = 4;
    }

    if idx + disp > bytes.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok((reg, idx + disp))
}

/// Byte-register mapping for the `reg` field of `88`/`8A`: without a REX
/// prefix, encodings 4–7 are the legacy high-byte registers AH/CH/DH/BH.
fn byte_reg(reg: u8, prefixes: &Prefixes) -> Reg {
    if prefixes.rex.is_none() && (4..8).contains(&reg) {
        Reg {
            index: reg - 4,
            high_byte: true,
        }
    } else {
        Reg::low(reg)
    }
}

fn read_imm(bytes: &[u8], idx: usize, len: usize) -> Result<(u64, usize), DecodeError> {
    if idx + len > bytes.len() {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut value = 0u64;
    for (i, &b) in bytes[idx..idx + len].iter().enumerate() {
        value |= (b as u64) << (8 * i);
    }
    Ok((value, idx + len))
}
