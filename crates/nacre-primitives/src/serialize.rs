//! Binary codec for chain objects.
//!
//! Integers are LEB128 varints, fixed-size values are raw bytes, vectors are
//! a varint count followed by elements. The same encoding feeds hashing and
//! persistence, so it must stay deterministic.

use crate::types::{
    Block, BlockHeader, BlockTemplate, CoinbaseInput, Hash, KeyImage, KeyInput, KeyOutput,
    OutputTarget, ParentBlock, PublicKey, RawBlock, Signature, Transaction, TransactionInput,
    TransactionOutput, TransactionPrefix,
};
use thiserror::Error;

/// Wire tag for a coinbase input.
const TAG_INPUT_COINBASE: u8 = 0xff;
/// Wire tag for a key input.
const TAG_INPUT_KEY: u8 = 0x02;
/// Wire tag for a key output target.
const TAG_OUTPUT_KEY: u8 = 0x02;

/// Codec failures. Reading past the end or meeting an unknown tag means the
/// bytes did not come from this codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("varint longer than 64 bits at offset {0}")]
    VarintOverflow(usize),
    #[error("unknown tag {tag:#x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("trailing bytes after object")]
    TrailingBytes,
    #[error("declared count {0} exceeds input size")]
    OversizedCount(u64),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Byte sink for serialization.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }
}

/// Cursor over input bytes.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(CodecError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u32_le(&mut self) -> CodecResult<u32> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_varint(&mut self) -> CodecResult<u64> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::VarintOverflow(start));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow(start));
            }
        }
    }

    pub fn read_exact(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(CodecError::UnexpectedEnd(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_blob(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_varint()?;
        if len > (self.buf.len() - self.pos) as u64 {
            return Err(CodecError::OversizedCount(len));
        }
        Ok(self.read_exact(len as usize)?.to_vec())
    }

    /// Upper bound on element counts, so corrupt input cannot trigger huge
    /// allocations before the read fails anyway.
    fn read_count(&mut self) -> CodecResult<usize> {
        let count = self.read_varint()?;
        if count > (self.buf.len() - self.pos) as u64 {
            return Err(CodecError::OversizedCount(count));
        }
        Ok(count as usize)
    }

    fn read_hash(&mut self) -> CodecResult<Hash> {
        Ok(Hash(self.read_exact(32)?.try_into().unwrap()))
    }

    fn read_public_key(&mut self) -> CodecResult<PublicKey> {
        Ok(PublicKey(self.read_exact(32)?.try_into().unwrap()))
    }
}

fn write_hash_vec(writer: &mut Writer, hashes: &[Hash]) {
    writer.write_varint(hashes.len() as u64);
    for hash in hashes {
        writer.write_bytes(&hash.0);
    }
}

fn read_hash_vec(reader: &mut Reader<'_>) -> CodecResult<Vec<Hash>> {
    let count = reader.read_count()?;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(reader.read_hash()?);
    }
    Ok(hashes)
}

fn write_input(writer: &mut Writer, input: &TransactionInput) {
    match input {
        TransactionInput::Coinbase(coinbase) => {
            writer.write_u8(TAG_INPUT_COINBASE);
            writer.write_varint(u64::from(coinbase.block_index));
        }
        TransactionInput::Key(key_input) => {
            writer.write_u8(TAG_INPUT_KEY);
            writer.write_varint(key_input.amount);
            writer.write_varint(key_input.output_indexes.len() as u64);
            for index in &key_input.output_indexes {
                writer.write_varint(u64::from(*index));
            }
            writer.write_bytes(&key_input.key_image.0);
        }
    }
}

fn read_input(reader: &mut Reader<'_>) -> CodecResult<TransactionInput> {
    let offset = reader.pos;
    let tag = reader.read_u8()?;
    match tag {
        TAG_INPUT_COINBASE => Ok(TransactionInput::Coinbase(CoinbaseInput {
            block_index: reader.read_varint()? as u32,
        })),
        TAG_INPUT_KEY => {
            let amount = reader.read_varint()?;
            let count = reader.read_count()?;
            let mut output_indexes = Vec::with_capacity(count);
            for _ in 0..count {
                output_indexes.push(reader.read_varint()? as u32);
            }
            let key_image = KeyImage(reader.read_exact(32)?.try_into().unwrap());
            Ok(TransactionInput::Key(KeyInput {
                amount,
                output_indexes,
                key_image,
            }))
        }
        tag => Err(CodecError::UnknownTag { tag, offset }),
    }
}

fn write_output(writer: &mut Writer, output: &TransactionOutput) {
    writer.write_varint(output.amount);
    match &output.target {
        OutputTarget::Key(key_output) => {
            writer.write_u8(TAG_OUTPUT_KEY);
            writer.write_bytes(&key_output.key.0);
        }
    }
}

fn read_output(reader: &mut Reader<'_>) -> CodecResult<TransactionOutput> {
    let amount = reader.read_varint()?;
    let offset = reader.pos;
    let tag = reader.read_u8()?;
    match tag {
        TAG_OUTPUT_KEY => Ok(TransactionOutput {
            amount,
            target: OutputTarget::Key(KeyOutput {
                key: reader.read_public_key()?,
            }),
        }),
        tag => Err(CodecError::UnknownTag { tag, offset }),
    }
}

impl TransactionPrefix {
    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(u64::from(self.version));
        writer.write_varint(self.unlock_time);
        writer.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            write_input(writer, input);
        }
        writer.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            write_output(writer, output);
        }
        writer.write_blob(&self.extra);
    }

    pub fn read(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let version = reader.read_varint()? as u8;
        let unlock_time = reader.read_varint()?;
        let input_count = reader.read_count()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(read_input(reader)?);
        }
        let output_count = reader.read_count()?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(read_output(reader)?);
        }
        let extra = reader.read_blob()?;
        Ok(Self {
            version,
            unlock_time,
            inputs,
            outputs,
            extra,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }
}

impl Transaction {
    pub fn write(&self, writer: &mut Writer) {
        self.prefix.write(writer);
        writer.write_varint(self.signatures.len() as u64);
        for per_input in &self.signatures {
            writer.write_varint(per_input.len() as u64);
            for signature in per_input {
                writer.write_bytes(&signature.0);
            }
        }
    }

    pub fn read(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let prefix = TransactionPrefix::read(reader)?;
        let outer = reader.read_count()?;
        let mut signatures = Vec::with_capacity(outer);
        for _ in 0..outer {
            let inner = reader.read_count()?;
            let mut per_input = Vec::with_capacity(inner);
            for _ in 0..inner {
                per_input.push(Signature(reader.read_exact(64)?.try_into().unwrap()));
            }
            signatures.push(per_input);
        }
        Ok(Self { prefix, signatures })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        let tx = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(tx)
    }

    /// Serialized size in bytes.
    pub fn binary_size(&self) -> usize {
        self.to_bytes().len()
    }
}

impl BlockHeader {
    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(u64::from(self.major_version));
        writer.write_varint(u64::from(self.minor_version));
        writer.write_u32_le(self.nonce);
        writer.write_varint(u64::from(self.timestamp));
        writer.write_bytes(&self.previous_block_hash.0);
    }

    pub fn read(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            major_version: reader.read_varint()? as u8,
            minor_version: reader.read_varint()? as u8,
            nonce: reader.read_u32_le()?,
            timestamp: reader.read_varint()? as u32,
            previous_block_hash: reader.read_hash()?,
        })
    }
}

impl ParentBlock {
    pub fn write(&self, writer: &mut Writer) {
        writer.write_varint(u64::from(self.major_version));
        writer.write_varint(u64::from(self.minor_version));
        writer.write_bytes(&self.previous_block_hash.0);
        writer.write_varint(u64::from(self.transaction_count));
        write_hash_vec(writer, &self.base_transaction_branch);
        self.base_transaction.write(writer);
        write_hash_vec(writer, &self.blockchain_branch);
    }

    pub fn read(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            major_version: reader.read_varint()? as u8,
            minor_version: reader.read_varint()? as u8,
            previous_block_hash: reader.read_hash()?,
            transaction_count: reader.read_varint()? as u16,
            base_transaction_branch: read_hash_vec(reader)?,
            base_transaction: TransactionPrefix::read(reader)?,
            blockchain_branch: read_hash_vec(reader)?,
        })
    }

    pub fn binary_size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes().len()
    }
}

impl BlockTemplate {
    pub fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        if self.header.major_version >= 2 {
            self.parent_block.write(writer);
        }
        self.base_transaction.write(writer);
        write_hash_vec(writer, &self.transaction_hashes);
    }

    pub fn read(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let header = BlockHeader::read(reader)?;
        let parent_block = if header.major_version >= 2 {
            ParentBlock::read(reader)?
        } else {
            ParentBlock::default()
        };
        let base_transaction = Transaction::read(reader)?;
        let transaction_hashes = read_hash_vec(reader)?;
        Ok(Self {
            header,
            parent_block,
            base_transaction,
            transaction_hashes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        let template = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(template)
    }
}

impl Block {
    /// Parse a raw block into a template and transaction bodies.
    pub fn from_raw_block(raw: &RawBlock) -> CodecResult<Self> {
        let header = BlockTemplate::from_bytes(&raw.block)?;
        let mut transactions = Vec::with_capacity(raw.transactions.len());
        for body in &raw.transactions {
            transactions.push(Transaction::from_bytes(body)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Serialize back into the wire shape.
    pub fn to_raw_block(&self) -> RawBlock {
        RawBlock {
            block: self.header.to_bytes(),
            transactions: self.transactions.iter().map(|tx| tx.to_bytes()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyImage, PublicKey};

    fn sample_transaction() -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: 17,
                inputs: vec![
                    TransactionInput::Key(KeyInput {
                        amount: 7_000_000,
                        output_indexes: vec![4, 1, 9],
                        key_image: KeyImage([3u8; 32]),
                    }),
                    TransactionInput::Coinbase(CoinbaseInput { block_index: 42 }),
                ],
                outputs: vec![TransactionOutput {
                    amount: 6_900_000,
                    target: OutputTarget::Key(KeyOutput {
                        key: PublicKey([9u8; 32]),
                    }),
                }],
                extra: vec![1, 2, 3],
            },
            signatures: vec![vec![Signature([5u8; 64]); 3], vec![]],
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut writer = Writer::new();
            writer.write_varint(value);
            let bytes = writer.into_bytes();
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_varint_rejects_overlong() {
        // Eleven continuation bytes encode more than 64 bits.
        let bytes = [0xffu8; 11];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            reader.read_varint(),
            Err(CodecError::VarintOverflow(_))
        ));
    }

    #[test]
    fn test_transaction_round_trip() {
        let tx = sample_transaction();
        let bytes = tx.to_bytes();
        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn test_transaction_rejects_trailing_bytes() {
        let mut bytes = sample_transaction().to_bytes();
        bytes.push(0);
        assert_eq!(
            Transaction::from_bytes(&bytes),
            Err(CodecError::TrailingBytes)
        );
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = sample_transaction().to_bytes();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(Transaction::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_unknown_input_tag_rejected() {
        let mut writer = Writer::new();
        writer.write_varint(1); // version
        writer.write_varint(0); // unlock
        writer.write_varint(1); // one input
        writer.write_u8(0x77); // bogus tag
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            TransactionPrefix::read(&mut reader),
            Err(CodecError::UnknownTag { tag: 0x77, .. })
        ));
    }

    #[test]
    fn test_block_template_v1_skips_parent() {
        let template = BlockTemplate {
            header: BlockHeader {
                major_version: 1,
                minor_version: 0,
                nonce: 70,
                timestamp: 0,
                previous_block_hash: Hash::ZERO,
            },
            parent_block: ParentBlock::default(),
            base_transaction: sample_transaction(),
            transaction_hashes: vec![Hash([1u8; 32])],
        };
        let parsed = BlockTemplate::from_bytes(&template.to_bytes()).unwrap();
        assert_eq!(parsed, template);
    }

    #[test]
    fn test_block_template_v2_carries_parent() {
        let mut template = BlockTemplate {
            header: BlockHeader {
                major_version: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        template.parent_block.transaction_count = 1;
        template.parent_block.blockchain_branch = vec![Hash([7u8; 32])];
        let parsed = BlockTemplate::from_bytes(&template.to_bytes()).unwrap();
        assert_eq!(parsed.parent_block.transaction_count, 1);
        assert_eq!(parsed.parent_block.blockchain_branch.len(), 1);
    }

    #[test]
    fn test_raw_block_round_trip() {
        let block = Block {
            header: BlockTemplate {
                header: BlockHeader {
                    major_version: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            transactions: vec![sample_transaction()],
        };
        let raw = block.to_raw_block();
        let parsed = Block::from_raw_block(&raw).unwrap();
        assert_eq!(parsed, block);
    }
}
