//! x86-64 instruction boundary lookup.
//!
//! A PC-relative relocation's addend is biased by the distance from the
//! relocation site to the end of the containing instruction. To undo that
//! bias we decode the section from the start until we reach the instruction
//! covering the relocation site.

use crate::error::Result;
use anyhow::bail;
use iced_x86::Decoder;
use iced_x86::DecoderOptions;

/// Returns the offset of the first byte after the instruction that covers
/// `offset`.
pub(crate) fn next_instruction_offset(bytes: &[u8], offset: u64) -> Result<u64> {
    let mut decoder = Decoder::new(64, bytes, DecoderOptions::NONE);
    while decoder.can_decode() {
        let start = decoder.position() as u64;
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            bail!("can't decode instruction at offset {start:#x}");
        }
        let end = decoder.position() as u64;
        if (start..end).contains(&offset) {
            return Ok(end);
        }
    }
    bail!("no instruction covers offset {offset:#x}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_containing_instruction() {
        // nop; call rel32; ret
        let bytes = [0x90, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3];
        assert_eq!(next_instruction_offset(&bytes, 0).unwrap(), 1);
        // The call's rel32 operand starts at offset 2; the instruction ends
        // at offset 6.
        assert_eq!(next_instruction_offset(&bytes, 2).unwrap(), 6);
        assert_eq!(next_instruction_offset(&bytes, 6).unwrap(), 7);
    }

    #[test]
    fn rejects_offset_past_end() {
        let bytes = [0x90];
        assert!(next_instruction_offset(&bytes, 5).is_err());
    }
}
