//! Differential length conformance against `iced-x86`.
//!
//! The decoder's one non-negotiable duty is computing the exact length of
//! every instruction it claims to understand: the fault handler adds that
//! length to the saved RIP, and an off-by-one there corrupts the resumed
//! program. This test generates a deterministic corpus of supported forms
//! with randomized addressing bytes and checks our length against a
//! table-driven production decoder.

use ghostbus_decoder::{decode, Access};
use iced_x86::{Code, Decoder, DecoderError, DecoderOptions, Mnemonic};

/// Deterministic PRNG so failures reproduce without a seed dance.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn byte(&mut self) -> u8 {
        (self.next() >> 32) as u8
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.next() % 100 < percent
    }
}

const SCALAR_OPCODES: &[u8] = &[0x88, 0x89, 0x8A, 0x8B, 0xC6, 0xC7];
const EXTENDING_OPCODES: &[u8] = &[0xB6, 0xB7, 0xBE, 0xBF];
const STOS_OPCODES: &[u8] = &[0xAA, 0xAB];

fn expected_mnemonic(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Mov
            | Mnemonic::Movzx
            | Mnemonic::Movsx
            | Mnemonic::Stosb
            | Mnemonic::Stosw
            | Mnemonic::Stosd
            | Mnemonic::Stosq
    )
}

fn check_against_iced(bytes: &[u8]) {
    let Ok(ours) = decode(bytes) else {
        // Rejected forms (mod=3, non-/0 extensions) are out of scope here;
        // the unit tests pin those.
        return;
    };

    let mut iced = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
    let instruction = iced.decode();
    assert_eq!(
        iced.last_error(),
        DecoderError::None,
        "iced rejected bytes we accepted: {bytes:02x?}"
    );
    assert!(
        expected_mnemonic(instruction.mnemonic()),
        "classified {bytes:02x?} as an access but iced says {:?}",
        instruction.code()
    );
    assert_eq!(
        ours.len as usize,
        instruction.len(),
        "length mismatch for {bytes:02x?} (iced: {:?})",
        instruction.code()
    );

    // STOS classification must agree with iced's element width.
    if let Access::BulkStore { elem_size, .. } = ours.access {
        let iced_elem = match instruction.code() {
            Code::Stosb_m8_AL => 1,
            Code::Stosw_m16_AX => 2,
            Code::Stosd_m32_EAX => 4,
            Code::Stosq_m64_RAX => 8,
            other => panic!("unexpected stos code {other:?} for {bytes:02x?}"),
        };
        assert_eq!(elem_size, iced_elem, "element size for {bytes:02x?}");
    }
}

fn push_prefixes(rng: &mut XorShift64, out: &mut Vec<u8>, allow_rep: bool) {
    if rng.chance(20) {
        out.push(0x66);
    }
    if rng.chance(10) {
        // Segment override; FS/GS are the ones compilers emit.
        out.push(if rng.chance(50) { 0x64 } else { 0x65 });
    }
    if allow_rep && rng.chance(50) {
        out.push(0xF3);
    }
    if rng.chance(40) {
        out.push(0x40 | (rng.byte() & 0x0F));
    }
}

#[test]
fn scalar_mov_lengths_match_iced() {
    let mut rng = XorShift64::new(0x6d2b_79f5_5c1e_8837);
    for _ in 0..4096 {
        let mut bytes = Vec::with_capacity(24);
        push_prefixes(&mut rng, &mut bytes, false);
        bytes.push(SCALAR_OPCODES[(rng.next() % SCALAR_OPCODES.len() as u64) as usize]);
        // Random ModR/M, SIB, displacement, and immediate material. The
        // decoders read exactly as many of these as the form requires, so
        // unused padding cannot skew the comparison.
        for _ in 0..16 {
            bytes.push(rng.byte());
        }
        check_against_iced(&bytes);
    }
}

#[test]
fn extending_load_lengths_match_iced() {
    let mut rng = XorShift64::new(0x9e37_79b9_7f4a_7c15);
    for _ in 0..4096 {
        let mut bytes = Vec::with_capacity(24);
        push_prefixes(&mut rng, &mut bytes, false);
        bytes.push(0x0F);
        bytes.push(EXTENDING_OPCODES[(rng.next() % EXTENDING_OPCODES.len() as u64) as usize]);
        for _ in 0..16 {
            bytes.push(rng.byte());
        }
        check_against_iced(&bytes);
    }
}

#[test]
fn stos_lengths_match_iced() {
    let mut rng = XorShift64::new(0x52c6_71d9_a4f2_31b9);
    for _ in 0..1024 {
        let mut bytes = Vec::with_capacity(8);
        push_prefixes(&mut rng, &mut bytes, true);
        bytes.push(STOS_OPCODES[(rng.next() % 2) as usize]);
        // Trailing garbage must not change a no-operand instruction.
        bytes.push(rng.byte());
        bytes.push(rng.byte());
        check_against_iced(&bytes);
    }
}

#[test]
fn exhaustive_modrm_space_for_plain_mov() {
    // Every ModR/M value with every displacement-relevant SIB for the
    // bread-and-butter opcode: lengths must match iced across the board.
    for modrm in 0u16..=0xFF {
        for sib in [0x00u8, 0x24, 0x25, 0x65, 0xC5, 0xE5] {
            let bytes = [
                0x8B, modrm as u8, sib, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
            ];
            check_against_iced(&bytes);
        }
    }
}
