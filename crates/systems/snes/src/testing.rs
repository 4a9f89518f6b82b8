//! Tiny LoROM images for tests and benchmarks.
//!
//! The demo program switches to native mode, turns the display on, enables
//! NMI and auto-joypad read, then spins incrementing `$10`. Its NMI handler
//! keeps a few counters in WRAM so tests can observe frames and input:
//!
//! | WRAM   | contents                                   |
//! |--------|--------------------------------------------|
//! | `$00`  | NMI count (one per frame)                  |
//! | `$02`  | JOY1 high byte (B Y Select Start U D L R)  |
//! | `$03`  | frames with Right held                     |
//! | `$04`  | JOY1 low byte (A X L R)                    |
//! | `$05`  | NMI count in BCD                           |
//! | `$10`  | main loop iterations                       |
//!
//! The backdrop color is rewritten from the NMI count every frame, so the
//! rendered picture changes too.

pub const NMI_COUNT: usize = 0x00;
pub const JOY1_HIGH: usize = 0x02;
pub const RIGHT_FRAMES: usize = 0x03;
pub const JOY1_LOW: usize = 0x04;
pub const BCD_FRAMES: usize = 0x05;
pub const MAIN_LOOP: usize = 0x10;

const ROM_SIZE: usize = 0x8000;
const HEADER: usize = 0x7FC0;
const DEMO_NMI: u16 = 0x801E;

#[rustfmt::skip]
const DEMO_PROGRAM: [u8; 74] = [
    // $8000: reset
    0x78,             // SEI
    0x18,             // CLC
    0xFB,             // XCE
    0xC2, 0x10,       // REP #$10
    0xE2, 0x20,       // SEP #$20
    0xA2, 0xFF, 0x1F, // LDX #$1FFF
    0x9A,             // TXS
    0xA9, 0x0F,       // LDA #$0F
    0x8D, 0x00, 0x21, // STA $2100
    0xA9, 0x01,       // LDA #$01
    0x8D, 0x2C, 0x21, // STA $212C
    0xA9, 0x81,       // LDA #$81
    0x8D, 0x00, 0x42, // STA $4200
    // $801A: main loop
    0xE6, 0x10,       // INC $10
    0x80, 0xFC,       // BRA $801A
    // $801E: NMI
    0x48,             // PHA
    0xAD, 0x10, 0x42, // LDA $4210
    0xE6, 0x00,       // INC $00
    0xAD, 0x19, 0x42, // LDA $4219
    0x85, 0x02,       // STA $02
    0x29, 0x01,       // AND #$01
    0xF0, 0x02,       // BEQ +2
    0xE6, 0x03,       // INC $03
    0xAD, 0x18, 0x42, // LDA $4218
    0x85, 0x04,       // STA $04
    0xF8,             // SED
    0x18,             // CLC
    0xA5, 0x05,       // LDA $05
    0x69, 0x01,       // ADC #$01
    0x85, 0x05,       // STA $05
    0xD8,             // CLD
    0x9C, 0x21, 0x21, // STZ $2121
    0xA5, 0x00,       // LDA $00
    0x8D, 0x22, 0x21, // STA $2122
    0x8D, 0x22, 0x21, // STA $2122
    0x68,             // PLA
    0x40,             // RTI
];

/// The demo cartridge described above.
pub fn demo_rom() -> Vec<u8> {
    lorom(&DEMO_PROGRAM, DEMO_NMI, 0)
}

/// A 32 KiB LoROM image with `program` at `$8000`, both NMI vectors at
/// `nmi`, a valid header checksum and `sram_code` as the SRAM size byte.
pub fn lorom(program: &[u8], nmi: u16, sram_code: u8) -> Vec<u8> {
    let mut rom = vec![0u8; ROM_SIZE];
    rom[..program.len()].copy_from_slice(program);

    rom[HEADER..HEADER + 21].copy_from_slice(b"FRAMESTEP DEMO       ");
    rom[HEADER + 0x15] = 0x20; // LoROM
    rom[HEADER + 0x17] = 0x08; // 256 KiB class
    rom[HEADER + 0x18] = sram_code;
    rom[HEADER + 0x1C..HEADER + 0x20].copy_from_slice(&[0xFF, 0xFF, 0x00, 0x00]);

    let vectors = [
        (0x7FEA, nmi),    // native NMI
        (0x7FFA, nmi),    // emulation NMI
        (0x7FFC, 0x8000), // reset
    ];
    for (at, target) in vectors {
        rom[at..at + 2].copy_from_slice(&target.to_le_bytes());
    }

    // A checksum/complement pair always sums to $1FE, so the total is stable
    let sum = rom.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    rom[HEADER + 0x1C..HEADER + 0x1E].copy_from_slice(&(!sum).to_le_bytes());
    rom[HEADER + 0x1E..HEADER + 0x20].copy_from_slice(&sum.to_le_bytes());
    rom
}
