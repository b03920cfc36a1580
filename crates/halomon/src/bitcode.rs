//! Minimal LLVM bitstream reader.
//!
//! The JIT linker needs the module's data layout string before it can link
//! anything, and the only authoritative source is the bitcode embedded in
//! the original executable. This reader understands just enough of the
//! bitstream container (blocks, abbreviation definitions, VBR integers,
//! char6/blob operands, and the BLOCKINFO block) to walk into the module
//! block and pull out the `MODULE_CODE_DATALAYOUT` record. Everything else
//! is skipped structurally.
//!
//! Reference: the LLVM bitstream container format. Bits are read from the
//! least-significant end of each byte.

use crate::error::{HaloError, Result};

// Builtin abbreviation ids.
const END_BLOCK: u64 = 0;
const ENTER_SUBBLOCK: u64 = 1;
const DEFINE_ABBREV: u64 = 2;
const UNABBREV_RECORD: u64 = 3;
/// First id assigned to application-defined abbreviations.
const FIRST_APPLICATION_ABBREV: u64 = 4;

// Block ids.
const BLOCKINFO_BLOCK_ID: u64 = 0;
const MODULE_BLOCK_ID: u64 = 8;

// Record codes.
const BLOCKINFO_CODE_SETBID: u64 = 1;
const MODULE_CODE_DATALAYOUT: u64 = 4;

// Abbreviation operand encodings.
const ENCODING_FIXED: u64 = 1;
const ENCODING_VBR: u64 = 2;
const ENCODING_ARRAY: u64 = 3;
const ENCODING_CHAR6: u64 = 4;
const ENCODING_BLOB: u64 = 5;

/// Magic of the optional offset/size wrapper some toolchains prepend.
const WRAPPER_MAGIC: u32 = 0x0B17_C0DE;

fn err(msg: impl Into<String>) -> HaloError {
    HaloError::Bitcode(msg.into())
}

/// Extract the data layout string from an embedded bitcode image.
pub fn data_layout_from_bitcode(data: &[u8]) -> Result<String> {
    let bitcode = strip_wrapper(data)?;

    if bitcode.len() < 4 || bitcode[0] != b'B' || bitcode[1] != b'C' || bitcode[2] != 0xC0
        || bitcode[3] != 0xDE
    {
        return Err(err("missing BC magic"));
    }

    let mut cursor = BitCursor::new(&bitcode[4..]);
    let mut blockinfo = BlockInfo::default();

    // Top level: a sequence of blocks at abbrev width 2. Only ENTER_SUBBLOCK
    // is meaningful here.
    while cursor.bits_remaining() >= 32 {
        let abbrev = cursor.read(2)?;
        if abbrev != ENTER_SUBBLOCK {
            return Err(err(format!("unexpected top-level abbrev id {abbrev}")));
        }
        let block_id = cursor.read_vbr(8)?;
        let abbrev_width = cursor.read_vbr(4)? as u32;
        cursor.align32();
        let block_words = cursor.read(32)?;

        match block_id {
            BLOCKINFO_BLOCK_ID => scan_blockinfo(&mut cursor, abbrev_width, &mut blockinfo)?,
            MODULE_BLOCK_ID => {
                return scan_module(&mut cursor, abbrev_width, &blockinfo);
            }
            _ => cursor.skip_words(block_words)?,
        }
    }

    Err(err("no module block in bitcode"))
}

/// Peel the offset/size wrapper if present.
fn strip_wrapper(data: &[u8]) -> Result<&[u8]> {
    if data.len() >= 20 {
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic == WRAPPER_MAGIC {
            let offset = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
            let size = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
            return data
                .get(offset..offset + size)
                .ok_or_else(|| err("wrapper offset/size out of range"));
        }
    }
    Ok(data)
}

/// Walk the module block until the data layout record shows up.
fn scan_module(cursor: &mut BitCursor<'_>, abbrev_width: u32, info: &BlockInfo) -> Result<String> {
    let mut abbrevs: Vec<Abbrev> = info.abbrevs_for(MODULE_BLOCK_ID).to_vec();

    loop {
        let abbrev_id = cursor.read(abbrev_width)?;
        match abbrev_id {
            END_BLOCK => {
                return Err(err("module block has no data layout record"));
            }
            ENTER_SUBBLOCK => {
                // Function bodies, type tables, etc.: skip whole blocks.
                let _block_id = cursor.read_vbr(8)?;
                let _width = cursor.read_vbr(4)?;
                cursor.align32();
                let words = cursor.read(32)?;
                cursor.skip_words(words)?;
            }
            DEFINE_ABBREV => {
                abbrevs.push(Abbrev::parse(cursor)?);
            }
            UNABBREV_RECORD => {
                let code = cursor.read_vbr(6)?;
                let numops = cursor.read_vbr(6)?;
                let mut ops = Vec::with_capacity(numops as usize);
                for _ in 0..numops {
                    ops.push(cursor.read_vbr(6)?);
                }
                if code == MODULE_CODE_DATALAYOUT {
                    return string_from_fields(&ops, &[]);
                }
            }
            id => {
                let index = (id - FIRST_APPLICATION_ABBREV) as usize;
                let abbrev = abbrevs
                    .get(index)
                    .ok_or_else(|| err(format!("undefined abbrev id {id} in module block")))?
                    .clone();
                let (fields, blob) = abbrev.read_record(cursor)?;
                let Some((&code, rest)) = fields.split_first() else {
                    return Err(err("abbreviated record with no code"));
                };
                if code == MODULE_CODE_DATALAYOUT {
                    return string_from_fields(rest, &blob);
                }
            }
        }
    }
}

/// Parse a BLOCKINFO block, registering abbrevs for the blocks it names.
fn scan_blockinfo(
    cursor: &mut BitCursor<'_>,
    abbrev_width: u32,
    info: &mut BlockInfo,
) -> Result<()> {
    let mut current_bid: Option<u64> = None;

    loop {
        let abbrev_id = cursor.read(abbrev_width)?;
        match abbrev_id {
            END_BLOCK => {
                cursor.align32();
                return Ok(());
            }
            ENTER_SUBBLOCK => {
                let _block_id = cursor.read_vbr(8)?;
                let _width = cursor.read_vbr(4)?;
                cursor.align32();
                let words = cursor.read(32)?;
                cursor.skip_words(words)?;
            }
            DEFINE_ABBREV => {
                let abbrev = Abbrev::parse(cursor)?;
                let bid =
                    current_bid.ok_or_else(|| err("DEFINE_ABBREV in blockinfo before SETBID"))?;
                info.register(bid, abbrev);
            }
            UNABBREV_RECORD => {
                let code = cursor.read_vbr(6)?;
                let numops = cursor.read_vbr(6)?;
                let mut ops = Vec::with_capacity(numops as usize);
                for _ in 0..numops {
                    ops.push(cursor.read_vbr(6)?);
                }
                if code == BLOCKINFO_CODE_SETBID {
                    current_bid = ops.first().copied();
                }
                // Block names and record names are ignorable.
            }
            id => {
                return Err(err(format!("unsupported abbrev id {id} inside blockinfo")));
            }
        }
    }
}

fn string_from_fields(fields: &[u64], blob: &[u8]) -> Result<String> {
    if !blob.is_empty() {
        return String::from_utf8(blob.to_vec()).map_err(|_| err("non-utf8 data layout"));
    }
    let bytes: Vec<u8> = fields
        .iter()
        .map(|&v| u8::try_from(v).map_err(|_| err("non-byte char in data layout record")))
        .collect::<Result<_>>()?;
    String::from_utf8(bytes).map_err(|_| err("non-utf8 data layout"))
}

/// Abbreviations registered by the BLOCKINFO block, keyed by the block id
/// they apply to. They precede any locally defined abbrevs in id order.
#[derive(Debug, Default)]
struct BlockInfo {
    by_block: std::collections::HashMap<u64, Vec<Abbrev>>,
}

impl BlockInfo {
    fn register(&mut self, block_id: u64, abbrev: Abbrev) {
        self.by_block.entry(block_id).or_default().push(abbrev);
    }

    fn abbrevs_for(&self, block_id: u64) -> &[Abbrev] {
        self.by_block
            .get(&block_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Abbreviations
// ---------------------------------------------------------------------------

/// One operand of an abbreviation definition.
#[derive(Debug, Clone, Copy)]
enum AbbrevOp {
    Literal(u64),
    Fixed(u32),
    Vbr(u32),
    Char6,
    Array,
    Blob,
}

/// A parsed abbreviation definition.
#[derive(Debug, Clone)]
struct Abbrev {
    ops: Vec<AbbrevOp>,
}

impl Abbrev {
    fn parse(cursor: &mut BitCursor<'_>) -> Result<Self> {
        let numops = cursor.read_vbr(5)?;
        let mut ops = Vec::with_capacity(numops as usize);
        for _ in 0..numops {
            let is_literal = cursor.read(1)? == 1;
            if is_literal {
                ops.push(AbbrevOp::Literal(cursor.read_vbr(8)?));
                continue;
            }
            let encoding = cursor.read(3)?;
            ops.push(match encoding {
                ENCODING_FIXED => AbbrevOp::Fixed(cursor.read_vbr(5)? as u32),
                ENCODING_VBR => AbbrevOp::Vbr(cursor.read_vbr(5)? as u32),
                ENCODING_ARRAY => AbbrevOp::Array,
                ENCODING_CHAR6 => AbbrevOp::Char6,
                ENCODING_BLOB => AbbrevOp::Blob,
                other => return Err(err(format!("unknown abbrev operand encoding {other}"))),
            });
        }
        Ok(Abbrev { ops })
    }

    /// Decode one record following this abbreviation. Char6 values are
    /// mapped to their ASCII characters so string records come out as bytes.
    fn read_record(&self, cursor: &mut BitCursor<'_>) -> Result<(Vec<u64>, Vec<u8>)> {
        let mut fields = Vec::new();
        let mut blob = Vec::new();

        let mut i = 0;
        while i < self.ops.len() {
            match self.ops[i] {
                AbbrevOp::Literal(v) => fields.push(v),
                AbbrevOp::Fixed(width) => fields.push(cursor.read(width)?),
                AbbrevOp::Vbr(width) => fields.push(cursor.read_vbr(width)?),
                AbbrevOp::Char6 => fields.push(char6_to_ascii(cursor.read(6)?)? as u64),
                AbbrevOp::Array => {
                    let count = cursor.read_vbr(6)?;
                    i += 1;
                    let elt = *self
                        .ops
                        .get(i)
                        .ok_or_else(|| err("array abbrev op without element type"))?;
                    for _ in 0..count {
                        let v = match elt {
                            AbbrevOp::Literal(v) => v,
                            AbbrevOp::Fixed(width) => cursor.read(width)?,
                            AbbrevOp::Vbr(width) => cursor.read_vbr(width)?,
                            AbbrevOp::Char6 => char6_to_ascii(cursor.read(6)?)? as u64,
                            AbbrevOp::Array | AbbrevOp::Blob => {
                                return Err(err("invalid array element encoding"))
                            }
                        };
                        fields.push(v);
                    }
                }
                AbbrevOp::Blob => {
                    let len = cursor.read_vbr(6)? as usize;
                    cursor.align32();
                    blob = cursor.read_bytes(len)?;
                    cursor.align32();
                }
            }
            i += 1;
        }
        Ok((fields, blob))
    }
}

fn char6_to_ascii(v: u64) -> Result<u8> {
    Ok(match v {
        0..=25 => b'a' + v as u8,
        26..=51 => b'A' + (v - 26) as u8,
        52..=61 => b'0' + (v - 52) as u8,
        62 => b'.',
        63 => b'_',
        _ => return Err(err(format!("char6 value {v} out of range"))),
    })
}

// ---------------------------------------------------------------------------
// Bit cursor
// ---------------------------------------------------------------------------

/// LSB-first bit reader over a byte slice.
struct BitCursor<'a> {
    data: &'a [u8],
    /// Absolute bit position.
    pos: usize,
}

impl<'a> BitCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitCursor { data, pos: 0 }
    }

    fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Read `width` bits (0..=32), LSB first.
    fn read(&mut self, width: u32) -> Result<u64> {
        debug_assert!(width <= 32);
        if width == 0 {
            return Ok(0);
        }
        if self.bits_remaining() < width as usize {
            return Err(err("bitstream exhausted"));
        }
        let mut value: u64 = 0;
        let mut got: u32 = 0;
        while got < width {
            let byte = self.data[self.pos / 8];
            let bit_in_byte = (self.pos % 8) as u32;
            let avail = 8 - bit_in_byte;
            let take = avail.min(width - got);
            let chunk = ((byte >> bit_in_byte) as u64) & ((1u64 << take) - 1);
            value |= chunk << got;
            got += take;
            self.pos += take as usize;
        }
        Ok(value)
    }

    /// Variable-bit-rate integer: chunks of `width` bits, high bit of each
    /// chunk means "more follows".
    fn read_vbr(&mut self, width: u32) -> Result<u64> {
        debug_assert!(width >= 2);
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let chunk = self.read(width)?;
            let payload = chunk & ((1u64 << (width - 1)) - 1);
            value |= payload << shift;
            if chunk & (1u64 << (width - 1)) == 0 {
                return Ok(value);
            }
            shift += width - 1;
            if shift >= 64 {
                return Err(err("vbr integer overflows 64 bits"));
            }
        }
    }

    /// Advance to the next 32-bit boundary.
    fn align32(&mut self) {
        self.pos = (self.pos + 31) & !31;
    }

    /// Read `len` bytes; the caller must be 32-bit aligned.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        debug_assert_eq!(self.pos % 8, 0);
        let start = self.pos / 8;
        let bytes = self
            .data
            .get(start..start + len)
            .ok_or_else(|| err("blob extends past end of bitstream"))?
            .to_vec();
        self.pos += len * 8;
        Ok(bytes)
    }

    /// Skip a block body of `words` 32-bit words.
    fn skip_words(&mut self, words: u64) -> Result<()> {
        let bits = words as usize * 32;
        if self.bits_remaining() < bits {
            return Err(err("block length extends past end of bitstream"));
        }
        self.pos += bits;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// LSB-first bit writer mirroring the reader, for building fixtures.
    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        /// Bits used in the last byte.
        bit: u32,
    }

    impl BitWriter {
        fn write(&mut self, width: u32, value: u64) {
            for i in 0..width {
                let bit = ((value >> i) & 1) as u8;
                if self.bit == 0 {
                    self.bytes.push(0);
                }
                let last = self.bytes.len() - 1;
                self.bytes[last] |= bit << self.bit;
                self.bit = (self.bit + 1) % 8;
            }
        }

        fn write_vbr(&mut self, width: u32, mut value: u64) {
            let mask = (1u64 << (width - 1)) - 1;
            loop {
                let payload = value & mask;
                value >>= width - 1;
                if value != 0 {
                    self.write(width, payload | (mask + 1));
                } else {
                    self.write(width, payload);
                    return;
                }
            }
        }

        fn align32(&mut self) {
            while self.bytes.len() % 4 != 0 || self.bit != 0 {
                self.write(1, 0);
            }
        }

        fn bits_len(&self) -> usize {
            if self.bit == 0 {
                self.bytes.len() * 8
            } else {
                (self.bytes.len() - 1) * 8 + self.bit as usize
            }
        }
    }

    /// Assemble `BC C0 DE` + a module block whose body is produced by `body`.
    fn module_fixture(body: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
        let mut inner = BitWriter::default();
        body(&mut inner);
        inner.align32();
        let body_words = (inner.bytes.len() / 4) as u64;

        let mut w = BitWriter::default();
        w.write(2, ENTER_SUBBLOCK);
        w.write_vbr(8, MODULE_BLOCK_ID);
        w.write_vbr(4, 3); // abbrev width inside the module block
        w.align32();
        w.write(32, body_words);
        assert_eq!(w.bits_len() % 8, 0);

        let mut out = vec![b'B', b'C', 0xC0, 0xDE];
        out.extend_from_slice(&w.bytes);
        out.extend_from_slice(&inner.bytes);
        out
    }

    fn unabbrev_record(w: &mut BitWriter, width: u32, code: u64, ops: &[u64]) {
        w.write(width, UNABBREV_RECORD);
        w.write_vbr(6, code);
        w.write_vbr(6, ops.len() as u64);
        for &op in ops {
            w.write_vbr(6, op);
        }
    }

    const LAYOUT: &str = "e-m:e-i64:64-f80:128-n8:16:32:64-S128";

    #[test]
    fn unabbreviated_data_layout() {
        let data = module_fixture(|w| {
            // A triple record first, to prove unrelated records are passed over.
            unabbrev_record(w, 3, 2, &[b'x' as u64, b'8' as u64, b'6' as u64]);
            let chars: Vec<u64> = LAYOUT.bytes().map(|b| b as u64).collect();
            unabbrev_record(w, 3, MODULE_CODE_DATALAYOUT, &chars);
        });
        assert_eq!(data_layout_from_bitcode(&data).unwrap(), LAYOUT);
    }

    #[test]
    fn abbreviated_data_layout_with_char6_array() {
        // Layout restricted to the char6 alphabet.
        let layout = "em.i64.64_n8";
        let data = module_fixture(|w| {
            // DEFINE_ABBREV: [literal DATALAYOUT, array of char6]
            w.write(3, DEFINE_ABBREV);
            w.write_vbr(5, 3); // three operands
            w.write(1, 1); // literal
            w.write_vbr(8, MODULE_CODE_DATALAYOUT);
            w.write(1, 0); // encoded
            w.write(3, ENCODING_ARRAY);
            w.write(1, 0); // encoded (element type)
            w.write(3, ENCODING_CHAR6);

            // The record, with abbrev id 4.
            w.write(3, FIRST_APPLICATION_ABBREV);
            w.write_vbr(6, layout.len() as u64);
            for b in layout.bytes() {
                let v = match b {
                    b'a'..=b'z' => (b - b'a') as u64,
                    b'A'..=b'Z' => (b - b'A') as u64 + 26,
                    b'0'..=b'9' => (b - b'0') as u64 + 52,
                    b'.' => 62,
                    b'_' => 63,
                    _ => unreachable!(),
                };
                w.write(6, v);
            }
        });
        assert_eq!(data_layout_from_bitcode(&data).unwrap(), layout);
    }

    #[test]
    fn nested_blocks_are_skipped() {
        let data = module_fixture(|w| {
            // An inner block (e.g. a type table) that must be skipped whole.
            let mut inner = BitWriter::default();
            unabbrev_record(&mut inner, 2, 99, &[1, 2, 3]);
            inner.align32();
            let words = (inner.bytes.len() / 4) as u64;

            w.write(3, ENTER_SUBBLOCK);
            w.write_vbr(8, 17);
            w.write_vbr(4, 2);
            w.align32();
            w.write(32, words);
            for &b in &inner.bytes {
                w.write(8, b as u64);
            }

            let chars: Vec<u64> = LAYOUT.bytes().map(|b| b as u64).collect();
            unabbrev_record(w, 3, MODULE_CODE_DATALAYOUT, &chars);
        });
        assert_eq!(data_layout_from_bitcode(&data).unwrap(), LAYOUT);
    }

    #[test]
    fn wrapper_is_stripped() {
        let inner = module_fixture(|w| {
            let chars: Vec<u64> = LAYOUT.bytes().map(|b| b as u64).collect();
            unabbrev_record(w, 3, MODULE_CODE_DATALAYOUT, &chars);
        });

        let mut wrapped = Vec::new();
        wrapped.extend_from_slice(&WRAPPER_MAGIC.to_le_bytes());
        wrapped.extend_from_slice(&0u32.to_le_bytes()); // version
        wrapped.extend_from_slice(&20u32.to_le_bytes()); // offset
        wrapped.extend_from_slice(&(inner.len() as u32).to_le_bytes()); // size
        wrapped.extend_from_slice(&0u32.to_le_bytes()); // cputype
        wrapped.extend_from_slice(&inner);
        assert_eq!(data_layout_from_bitcode(&wrapped).unwrap(), LAYOUT);
    }

    #[test]
    fn missing_magic_rejected() {
        assert!(data_layout_from_bitcode(&[0, 1, 2, 3, 4, 5, 6, 7]).is_err());
        assert!(data_layout_from_bitcode(&[]).is_err());
    }

    #[test]
    fn module_without_layout_is_an_error() {
        let data = module_fixture(|w| {
            unabbrev_record(w, 3, 2, &[b'x' as u64]);
            w.write(3, END_BLOCK);
            w.align32();
        });
        assert!(data_layout_from_bitcode(&data).is_err());
    }

    #[test]
    fn vbr_round_trip() {
        let mut w = BitWriter::default();
        for &v in &[0u64, 1, 63, 64, 1000, u32::MAX as u64, u64::MAX / 2] {
            w.write_vbr(6, v);
        }
        let mut c = BitCursor::new(&w.bytes);
        for &v in &[0u64, 1, 63, 64, 1000, u32::MAX as u64, u64::MAX / 2] {
            assert_eq!(c.read_vbr(6).unwrap(), v);
        }
    }
}
