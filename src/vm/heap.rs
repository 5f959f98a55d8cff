use tracing::debug;

use super::error::{Result, VmError};
use super::value::{Address, BlockId};

/// Size in bytes of a pointer slot in heap memory.
pub const PTR_SIZE: usize = 8;

/// Size in bytes of an `int` slot in heap memory.
pub const INT_SIZE: usize = 4;

// =============================================================================
// Blocks
// =============================================================================

/// Header of an array allocated by `NEWARRAY`.
///
/// The elements live in a separate bytes block so that element pointers are
/// ordinary addresses that the load/store instructions understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayHeader {
    pub elt_size: u32,
    pub count: i32,
    pub elems: BlockId,
}

#[derive(Debug, Clone)]
enum Block {
    Bytes { data: Vec<u8>, read_only: bool },
    Array(ArrayHeader),
}

// =============================================================================
// Pointer encoding
// =============================================================================
//
// A pointer stored in memory takes PTR_SIZE bytes:
//
// +-------------------+-------------------+
// | block + 1 (u32 LE)| offset (u32 LE)   |
// +-------------------+-------------------+
//
// All-zero bytes decode to NULL, so zero-filled memory reads back as null
// pointers the way calloc'd memory does.

fn encode_ptr(ptr: Option<Address>) -> [u8; PTR_SIZE] {
    let mut out = [0u8; PTR_SIZE];
    if let Some(addr) = ptr {
        out[..4].copy_from_slice(&(addr.block + 1).to_le_bytes());
        out[4..].copy_from_slice(&addr.offset.to_le_bytes());
    }
    out
}

fn decode_ptr(bytes: &[u8]) -> Option<Address> {
    let tag = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if tag == 0 {
        return None;
    }
    let offset = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Some(Address::new(tag - 1, offset))
}

/// Dereference check shared by every memory instruction.
fn non_null(ptr: Option<Address>) -> Result<Address> {
    ptr.ok_or_else(|| VmError::memory("attempt to dereference null pointer"))
}

// =============================================================================
// Heap
// =============================================================================

/// The VM heap.
///
/// Blocks are allocated and never freed; they are released together when
/// the heap is dropped at the end of a run.
#[derive(Debug, Default)]
pub struct Heap {
    blocks: Vec<Block>,
    bytes_allocated: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks allocated so far (arrays count their header and
    /// element storage separately).
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes of block storage allocated so far.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    fn push_block(&mut self, block: Block) -> Result<BlockId> {
        let id = BlockId::try_from(self.blocks.len())
            .ok()
            .filter(|id| *id < u32::MAX)
            .ok_or_else(|| VmError::memory("heap exhausted"))?;
        self.blocks.push(block);
        Ok(id)
    }

    fn zeroed(size: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| VmError::memory("allocation failed"))?;
        data.resize(size, 0);
        Ok(data)
    }

    /// Allocate a zero-filled block of `size` bytes (`NEW`).
    pub fn alloc(&mut self, size: usize) -> Result<Address> {
        let data = Self::zeroed(size)?;
        self.bytes_allocated += size;
        let id = self.push_block(Block::Bytes {
            data,
            read_only: false,
        })?;
        debug!(block = id, size, "alloc");
        Ok(Address::new(id, 0))
    }

    /// Map an immutable byte segment, such as the string pool.
    pub fn alloc_static(&mut self, bytes: &[u8]) -> Result<Address> {
        self.bytes_allocated += bytes.len();
        let id = self.push_block(Block::Bytes {
            data: bytes.to_vec(),
            read_only: true,
        })?;
        Ok(Address::new(id, 0))
    }

    /// Allocate a NUL-terminated copy of `bytes` in fresh mutable storage.
    pub fn alloc_c_string(&mut self, bytes: &[u8]) -> Result<Address> {
        let addr = self.alloc(bytes.len() + 1)?;
        if let Block::Bytes { data, .. } = &mut self.blocks[addr.block as usize] {
            data[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(addr)
    }

    /// Allocate an array of `count` elements of `elt_size` bytes (`NEWARRAY`).
    pub fn alloc_array(&mut self, elt_size: u8, count: i32) -> Result<Address> {
        let len = usize::try_from(count)
            .map_err(|_| VmError::memory("array size must be non-negative"))?;
        let size = len
            .checked_mul(elt_size as usize)
            .filter(|size| *size <= u32::MAX as usize)
            .ok_or_else(|| VmError::memory("allocation failed"))?;
        let data = Self::zeroed(size)?;
        self.bytes_allocated += size;
        let elems = self.push_block(Block::Bytes {
            data,
            read_only: false,
        })?;
        let header = self.push_block(Block::Array(ArrayHeader {
            elt_size: elt_size as u32,
            count,
            elems,
        }))?;
        debug!(block = header, elt_size, count, "alloc_array");
        Ok(Address::new(header, 0))
    }

    fn array_header(&self, ptr: Option<Address>) -> Result<ArrayHeader> {
        let addr = non_null(ptr)?;
        match self.blocks.get(addr.block as usize) {
            Some(Block::Array(header)) if addr.offset == 0 => Ok(*header),
            _ => Err(VmError::memory("pointer does not refer to an array")),
        }
    }

    /// Element count of an array (`ARRAYLENGTH`).
    pub fn array_length(&self, ptr: Option<Address>) -> Result<i32> {
        Ok(self.array_header(ptr)?.count)
    }

    /// Address of element `index` of an array (`AADDS`).
    pub fn array_element(&self, ptr: Option<Address>, index: i32) -> Result<Address> {
        let header = self.array_header(ptr)?;
        if index < 0 {
            return Err(VmError::Memory(format!("negative array index {}", index)));
        }
        if index >= header.count {
            return Err(VmError::Memory(format!(
                "array index {} out of bounds for length {}",
                index, header.count
            )));
        }
        // alloc_array keeps count * elt_size within u32.
        Ok(Address::new(header.elems, index as u32 * header.elt_size))
    }

    /// Address of the field `offset` bytes into a struct (`AADDF`).
    pub fn field(&self, ptr: Option<Address>, offset: u8) -> Result<Address> {
        Ok(non_null(ptr)?.add(offset as u32))
    }

    fn bytes(&self, ptr: Option<Address>, len: usize) -> Result<&[u8]> {
        let addr = non_null(ptr)?;
        match self.blocks.get(addr.block as usize) {
            Some(Block::Bytes { data, .. }) => {
                let start = addr.offset as usize;
                data.get(start..start + len)
                    .ok_or_else(|| VmError::memory("access outside allocated block"))
            }
            Some(Block::Array(_)) => Err(VmError::memory("direct access to array header")),
            None => Err(VmError::memory("dangling pointer")),
        }
    }

    fn bytes_mut(&mut self, ptr: Option<Address>, len: usize) -> Result<&mut [u8]> {
        let addr = non_null(ptr)?;
        match self.blocks.get_mut(addr.block as usize) {
            Some(Block::Bytes { read_only: true, .. }) => {
                Err(VmError::memory("write to read-only memory"))
            }
            Some(Block::Bytes { data, .. }) => {
                let start = addr.offset as usize;
                data.get_mut(start..start + len)
                    .ok_or_else(|| VmError::memory("access outside allocated block"))
            }
            Some(Block::Array(_)) => Err(VmError::memory("direct access to array header")),
            None => Err(VmError::memory("dangling pointer")),
        }
    }

    /// `IMLOAD`
    pub fn load_int(&self, ptr: Option<Address>) -> Result<i32> {
        let b = self.bytes(ptr, INT_SIZE)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `IMSTORE`
    pub fn store_int(&mut self, ptr: Option<Address>, value: i32) -> Result<()> {
        self.bytes_mut(ptr, INT_SIZE)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// `AMLOAD`
    pub fn load_ptr(&self, ptr: Option<Address>) -> Result<Option<Address>> {
        Ok(decode_ptr(self.bytes(ptr, PTR_SIZE)?))
    }

    /// `AMSTORE`
    pub fn store_ptr(&mut self, ptr: Option<Address>, value: Option<Address>) -> Result<()> {
        self.bytes_mut(ptr, PTR_SIZE)?.copy_from_slice(&encode_ptr(value));
        Ok(())
    }

    /// `CMLOAD`: the byte is sign-extended, as C `char` is.
    pub fn load_char(&self, ptr: Option<Address>) -> Result<i32> {
        Ok(self.bytes(ptr, 1)?[0] as i8 as i32)
    }

    /// `CMSTORE`: only the low 7 bits are stored (ASCII).
    pub fn store_char(&mut self, ptr: Option<Address>, value: i32) -> Result<()> {
        self.bytes_mut(ptr, 1)?[0] = (value & 0x7F) as u8;
        Ok(())
    }

    /// Bytes of the NUL-terminated string starting at `ptr`, without the NUL.
    pub fn read_c_string(&self, ptr: Option<Address>) -> Result<Vec<u8>> {
        let addr = non_null(ptr)?;
        let rest = match self.blocks.get(addr.block as usize) {
            Some(Block::Bytes { data, .. }) => data
                .get(addr.offset as usize..)
                .ok_or_else(|| VmError::memory("access outside allocated block"))?,
            _ => return Err(VmError::memory("pointer does not refer to a string")),
        };
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| VmError::memory("unterminated string"))?;
        Ok(rest[..end].to_vec())
    }
}
