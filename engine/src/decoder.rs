//! x86-64 Mini-Decoder (C3)
//!
//! Enough decoding to classify a faulting memory access and to advance the
//! instruction pointer past it. Anything outside the recognized opcode set
//! comes back as [`Kind::Unknown`]; the fault handler treats that as fatal
//! rather than guess at the correct emulation.

use crate::context::GpReg;

/// Where a scalar store's value comes from.
#[derive(Debug, Clone, Copy)]
pub enum StoreSource {
    /// The low `size` bytes of this general-purpose register.
    Register { reg: GpReg, high_byte: bool },
    /// An immediate encoded in the instruction stream, already sign-extended
    /// to 64 bits per the opcode's architectural rule; the fault handler
    /// masks it down to the store size.
    Immediate(i64),
}

#[derive(Debug, Clone, Copy)]
pub enum Kind {
    /// `MOV r, [m]`, optionally zero/sign-extending, per `8A`/`8B`/`0F B6`/`0F BE`/`0F B7`/`0F BF`.
    ScalarLoad {
        /// Bytes read from memory (hence from the model): 1 or 2 for the
        /// extending forms, otherwise equal to `operand_size`.
        size: usize,
        /// Bytes written into the destination register: 1, 2, 4 or 8.
        operand_size: usize,
        sign_extend: bool,
        dest: GpReg,
        dest_high_byte: bool,
    },
    /// `MOV [m], r` or `MOV [m], imm`, per `88`/`89`/`C6`/`C7`.
    ScalarStore { size: usize, source: StoreSource },
    /// `REP STOSB`/`STOSW`/`STOSD`/`STOSQ`.
    BulkStore { element_size: usize },
    /// Anything not in the recognized set. `opcode_bytes` is the first few
    /// raw bytes, kept only so the caller can log them before exiting.
    Unknown { opcode_bytes: [u8; 4] },
}

#[derive(Debug, Clone, Copy)]
pub struct DecodedInstr {
    /// Total instruction length in bytes; the fault handler advances RIP by this much.
    pub length: usize,
    pub kind: Kind,
}

/// Decodes the instruction starting at `bytes[0]`.
///
/// `bytes` must contain at least the instruction's bytes (15 is the
/// architectural maximum x86-64 instruction length); shorter slices are
/// treated as `Unknown` rather than panicking.
pub fn decode(bytes: &[u8]) -> DecodedInstr {
    let mut i = 0usize;
    let mut prefix_66 = false;
    let mut rep = false;

    while i < bytes.len() {
        match bytes[i] {
            0xF0 | 0xF2 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0x67 => i += 1,
            0xF3 => {
                rep = true;
                i += 1;
            }
            0x66 => {
                prefix_66 = true;
                i += 1;
            }
            _ => break,
        }
    }

    let rex = if i < bytes.len() && (bytes[i] & 0xF0) == 0x40 {
        let r = bytes[i];
        i += 1;
        Some(r)
    } else {
        None
    };
    let rex_w = rex.is_some_and(|r| r & 0x08 != 0);
    let rex_r = rex.is_some_and(|r| r & 0x04 != 0);
    let rex_b = rex.is_some_and(|r| r & 0x01 != 0);

    let Some(&opcode) = bytes.get(i) else {
        return unknown(bytes, i);
    };
    i += 1;

    if rep && (opcode == 0xAA || opcode == 0xAB) {
        let element_size = if opcode == 0xAA {
            1
        } else if rex_w {
            8
        } else if prefix_66 {
            2
        } else {
            4
        };
        return DecodedInstr {
            length: i,
            kind: Kind::BulkStore { element_size },
        };
    }

    match opcode {
        0x8A => scalar_load(bytes, i, rex, rex_r, 1, 1, false, true),
        0x8B => {
            let sz = operand_size(rex_w, prefix_66);
            scalar_load(bytes, i, rex, rex_r, sz, sz, false, false)
        }
        0x88 => scalar_store_reg(bytes, i, rex, rex_r, rex_b, 1),
        0x89 => {
            let sz = operand_size(rex_w, prefix_66);
            scalar_store_reg(bytes, i, rex, rex_r, rex_b, sz)
        }
        0xC6 => scalar_store_imm(bytes, i, 1, 1),
        0xC7 => {
            let mem_size = operand_size(rex_w, prefix_66);
            let imm_len = if prefix_66 { 2 } else { 4 };
            scalar_store_imm(bytes, i, mem_size, imm_len)
        }
        0x0F => decode_0f(bytes, i, rex, rex_w, rex_r, rex_b, prefix_66),
        _ => unknown(bytes, i),
    }
}

fn operand_size(rex_w: bool, prefix_66: bool) -> usize {
    if rex_w {
        8
    } else if prefix_66 {
        2
    } else {
        4
    }
}

fn decode_0f(
    bytes: &[u8],
    mut i: usize,
    rex: Option<u8>,
    rex_w: bool,
    rex_r: bool,
    rex_b: bool,
    prefix_66: bool,
) -> DecodedInstr {
    let Some(&op2) = bytes.get(i) else {
        return unknown(bytes, i);
    };
    i += 1;

    let dest_size = operand_size(rex_w, prefix_66);
    let _ = rex_b;
    match op2 {
        0xB6 => scalar_load(bytes, i, rex, rex_r, 1, dest_size, false, false),
        0xBE => scalar_load(bytes, i, rex, rex_r, 1, dest_size, true, false),
        0xB7 => scalar_load(bytes, i, rex, rex_r, 2, dest_size, false, false),
        0xBF => scalar_load(bytes, i, rex, rex_r, 2, dest_size, true, false),
        0x38 | 0x3A => {
            // Three-byte opcode escape: not part of our recognized set, but
            // account for the extra opcode byte so a caller computing length
            // for logging purposes isn't off by one.
            i += 1;
            let _ = rex;
            unknown(bytes, i)
        }
        _ => unknown(bytes, i),
    }
}

/// Parses a ModR/M byte (and any SIB/displacement that follow) purely to
/// determine the `reg` field and the number of bytes consumed: the fault
/// handler never needs the effective address, since the faulting address
/// (or the destination-index register, for bulk stores) already gives it.
fn parse_modrm(bytes: &[u8], pos: usize) -> Option<(u8, usize)> {
    let modrm = *bytes.get(pos)?;
    let md = modrm >> 6;
    let reg = (modrm >> 3) & 0b111;
    let rm = modrm & 0b111;
    let mut consumed = 1usize;

    let mut sib_base = None;
    if md != 0b11 && rm == 0b100 {
        let sib = *bytes.get(pos + consumed)?;
        sib_base = Some(sib & 0b111);
        consumed += 1;
    }

    let disp_len = match md {
        0b00 => {
            if sib_base == Some(0b101) {
                4
            } else if sib_base.is_none() && rm == 0b101 {
                4 // RIP-relative
            } else {
                0
            }
        }
        0b01 => 1,
        0b10 => 4,
        _ => 0,
    };
    consumed += disp_len;

    Some((reg, consumed))
}

#[allow(clippy::too_many_arguments)]
fn scalar_load(
    bytes: &[u8],
    pos: usize,
    rex: Option<u8>,
    rex_r: bool,
    size: usize,
    operand_size: usize,
    sign_extend: bool,
    byte_destination: bool,
) -> DecodedInstr {
    let Some((reg, consumed)) = parse_modrm(bytes, pos) else {
        return unknown(bytes, pos);
    };
    // Without any REX prefix, reg indices 4-7 in a true 8-bit destination
    // (8A, not the 0F B6/BE zero/sign-extending forms, whose destination is
    // always the full operand-size register) name the legacy high-byte
    // registers AH/CH/DH/BH — the high byte of RAX/RCX/RDX/RBX — rather than
    // SPL/BPL/SIL/DIL.
    let dest_high_byte = byte_destination && rex.is_none() && (4..=7).contains(&reg);
    let index = if dest_high_byte {
        reg - 4
    } else {
        reg | ((rex_r as u8) << 3)
    };
    DecodedInstr {
        length: pos + consumed,
        kind: Kind::ScalarLoad {
            size,
            operand_size,
            sign_extend,
            dest: GpReg::from_index(index),
            dest_high_byte,
        },
    }
}

fn scalar_store_reg(
    bytes: &[u8],
    pos: usize,
    rex: Option<u8>,
    rex_r: bool,
    rex_b: bool,
    size: usize,
) -> DecodedInstr {
    let _ = rex_b;
    let Some((reg, consumed)) = parse_modrm(bytes, pos) else {
        return unknown(bytes, pos);
    };
    // 88 is the only caller of this function with size == 1 (89 is always
    // word/dword/qword), so an 8-bit store here is always the true 8A-style
    // 8-bit destination: reg 4-7 without REX names AH/CH/DH/BH.
    let high_byte = size == 1 && rex.is_none() && (4..=7).contains(&reg);
    let index = if high_byte {
        reg - 4
    } else {
        reg | ((rex_r as u8) << 3)
    };
    DecodedInstr {
        length: pos + consumed,
        kind: Kind::ScalarStore {
            size,
            source: StoreSource::Register {
                reg: GpReg::from_index(index),
                high_byte,
            },
        },
    }
}

fn scalar_store_imm(bytes: &[u8], pos: usize, mem_size: usize, imm_len: usize) -> DecodedInstr {
    let Some((_reg, modrm_len)) = parse_modrm(bytes, pos) else {
        return unknown(bytes, pos);
    };
    let imm_start = pos + modrm_len;
    let Some(imm_bytes) = bytes.get(imm_start..imm_start + imm_len) else {
        return unknown(bytes, pos);
    };

    let value: i64 = match imm_len {
        1 => imm_bytes[0] as i8 as i64,
        2 => i16::from_le_bytes(imm_bytes.try_into().unwrap()) as i64,
        4 => i32::from_le_bytes(imm_bytes.try_into().unwrap()) as i64,
        _ => unreachable!("store immediates are 1, 2 or 4 bytes"),
    };

    DecodedInstr {
        length: imm_start + imm_len,
        kind: Kind::ScalarStore {
            size: mem_size,
            source: StoreSource::Immediate(value),
        },
    }
}

fn unknown(bytes: &[u8], consumed_hint: usize) -> DecodedInstr {
    let mut opcode_bytes = [0u8; 4];
    let n = bytes.len().min(4);
    opcode_bytes[..n].copy_from_slice(&bytes[..n]);
    DecodedInstr {
        length: consumed_hint.max(1),
        kind: Kind::Unknown { opcode_bytes },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_byte_store_immediate() {
        // mov byte [rax], 0x7f  => C6 00 7F
        let instr = decode(&[0xC6, 0x00, 0x7F]);
        assert_eq!(instr.length, 3);
        match instr.kind {
            Kind::ScalarStore { size, source: StoreSource::Immediate(v) } => {
                assert_eq!(size, 1);
                assert_eq!(v, 0x7F);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_dword_store_immediate() {
        // mov dword [rax+4], 0x12345678 => C7 40 04 78 56 34 12
        let instr = decode(&[0xC7, 0x40, 0x04, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(instr.length, 7);
        match instr.kind {
            Kind::ScalarStore { size, source: StoreSource::Immediate(v) } => {
                assert_eq!(size, 4);
                assert_eq!(v, 0x1234_5678);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_qword_store_immediate_with_4_byte_encoding() {
        // mov qword [rax], 0xFFFFFFFF (sign-extends to -1) => 48 C7 00 FF FF FF FF
        let instr = decode(&[0x48, 0xC7, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(instr.length, 7);
        match instr.kind {
            Kind::ScalarStore { size, source: StoreSource::Immediate(v) } => {
                assert_eq!(size, 8);
                assert_eq!(v, -1);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_dword_load() {
        // mov eax, [rcx] => 8B 01
        let instr = decode(&[0x8B, 0x01]);
        assert_eq!(instr.length, 2);
        match instr.kind {
            Kind::ScalarLoad { size, operand_size, dest, .. } => {
                assert_eq!(size, 4);
                assert_eq!(operand_size, 4);
                assert_eq!(dest, GpReg::Rax);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_qword_load_with_rex_w_and_extended_register() {
        // mov r9, [rax] => 4C 8B 08
        let instr = decode(&[0x4C, 0x8B, 0x08]);
        assert_eq!(instr.length, 3);
        match instr.kind {
            Kind::ScalarLoad { size, dest, .. } => {
                assert_eq!(size, 8);
                assert_eq!(dest, GpReg::R9);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_zero_extending_byte_load() {
        // movzx eax, byte [rcx] => 0F B6 01
        let instr = decode(&[0x0F, 0xB6, 0x01]);
        assert_eq!(instr.length, 3);
        match instr.kind {
            Kind::ScalarLoad { size, operand_size, sign_extend, .. } => {
                assert_eq!(size, 1);
                assert_eq!(operand_size, 4);
                assert!(!sign_extend);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_byte_load_into_legacy_high_byte_register() {
        // mov ah, [rcx] => 8A 21 (ModRM.reg = 4 = AH, no REX)
        let instr = decode(&[0x8A, 0x21]);
        assert_eq!(instr.length, 2);
        match instr.kind {
            Kind::ScalarLoad { size, dest, dest_high_byte, .. } => {
                assert_eq!(size, 1);
                assert!(dest_high_byte);
                assert_eq!(dest, GpReg::Rax);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn zero_extending_byte_load_never_targets_a_high_byte_register() {
        // movzx eax, byte [rcx+?] with ModRM.reg = 4 would be ESP as a
        // destination, not AH: 0F B6 never writes a legacy high byte.
        let instr = decode(&[0x0F, 0xB6, 0x21]);
        match instr.kind {
            Kind::ScalarLoad { dest, dest_high_byte, .. } => {
                assert!(!dest_high_byte);
                assert_eq!(dest, GpReg::Rsp);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn decodes_rep_stosb() {
        // rep stosb => F3 AA
        let instr = decode(&[0xF3, 0xAA]);
        assert_eq!(instr.length, 2);
        assert!(matches!(instr.kind, Kind::BulkStore { element_size: 1 }));
    }

    #[test]
    fn decodes_rep_stosq() {
        // rep stosq => F3 48 AB
        let instr = decode(&[0xF3, 0x48, 0xAB]);
        assert_eq!(instr.length, 3);
        assert!(matches!(instr.kind, Kind::BulkStore { element_size: 8 }));
    }

    #[test]
    fn unrecognized_opcode_is_unknown() {
        let instr = decode(&[0x90]); // NOP
        assert!(matches!(instr.kind, Kind::Unknown { .. }));
    }

    #[test]
    fn decodes_sib_addressed_store() {
        // mov [rax+rbx*1], cl => 88 0C 18
        let instr = decode(&[0x88, 0x0C, 0x18]);
        assert_eq!(instr.length, 3);
    }
}
