//! FF-A v1.0 memory transaction descriptors (DEN0077A, section 5.12).
//!
//! Wire structs are little-endian and byte aligned, so they can be viewed
//! at any offset inside a mailbox page. Nothing here trusts an offset or a
//! count: every nested structure is located through a bounds-checked
//! accessor on the slice that was actually received.

use core::mem::size_of;

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Memory region descriptor header (Table 5.19). 32 bytes.
///
/// Followed by `ep_count` endpoint access descriptors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MemRegion {
    /// Sender endpoint id
    pub sender_id: U16,
    /// Memory region attributes (Table 5.18)
    pub attributes: U16,
    /// Transaction flags (Table 5.20)
    pub flags: U32,
    /// Handle assigned by the SPMC, zero on a new transaction
    pub handle: U64,
    /// Implementation-defined tag
    pub tag: U64,
    pub reserved: U32,
    /// Number of endpoint access descriptors that follow
    pub ep_count: U32,
}

/// Endpoint memory access descriptor (Table 5.16). 16 bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct EndpointAccess {
    /// Receiver endpoint id
    pub receiver: U16,
    /// Memory access permissions (Table 5.15)
    pub permissions: u8,
    pub flags: u8,
    /// Offset from the start of the memory region to the composite descriptor
    pub composite_off: U32,
    pub reserved: U64,
}

/// Composite memory region descriptor (Table 5.13). 16 bytes.
///
/// Followed by `addr_range_cnt` address ranges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CompositeRegion {
    pub total_pg_cnt: U32,
    pub addr_range_cnt: U32,
    pub reserved: U64,
}

/// Constituent memory region descriptor (Table 5.14). 16 bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AddrRange {
    /// Base physical address, page aligned
    pub address: U64,
    /// Number of 4KB pages
    pub pg_cnt: U32,
    pub reserved: U32,
}

impl AddrRange {
    pub fn new(address: u64, pg_cnt: u32) -> Self {
        Self {
            address: U64::new(address),
            pg_cnt: U32::new(pg_cnt),
            reserved: U32::new(0),
        }
    }

    pub fn address(&self) -> u64 {
        self.address.get()
    }

    pub fn pg_cnt(&self) -> u32 {
        self.pg_cnt.get()
    }
}

pub const MEM_REGION_SIZE: usize = size_of::<MemRegion>();
pub const EP_ACCESS_SIZE: usize = size_of::<EndpointAccess>();
pub const COMPOSITE_SIZE: usize = size_of::<CompositeRegion>();
pub const ADDR_RANGE_SIZE: usize = size_of::<AddrRange>();

/// Smallest fragment that can describe a transfer: header plus one receiver.
pub const MIN_XFER_FRAGMENT: usize = MEM_REGION_SIZE + EP_ACCESS_SIZE;

const _: () = assert!(MEM_REGION_SIZE == 32);
const _: () = assert!(EP_ACCESS_SIZE == 16);
const _: () = assert!(COMPOSITE_SIZE == 16);
const _: () = assert!(ADDR_RANGE_SIZE == 16);

/// Structural problem found while walking a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("{what} at offset {offset:#x} overruns the {len}-byte descriptor")]
    OutOfBounds {
        what: &'static str,
        offset: usize,
        len: usize,
    },
    #[error("endpoint {index} not present (ep_count {count})")]
    NoSuchEndpoint { index: u32, count: u32 },
    #[error("composite region offset is zero")]
    NullComposite,
    #[error("buffer of {len} bytes cannot hold a {needed}-byte descriptor")]
    BufferTooSmall { needed: usize, len: usize },
}

// ── Reading ──────────────────────────────────────────────────────────

/// Bounds-checked view of a memory region descriptor.
///
/// `buf` is exactly the received descriptor (the fragment), never the
/// whole mailbox page, so offsets are checked against what was sent.
#[derive(Debug, Clone, Copy)]
pub struct MemRegionView<'a> {
    buf: &'a [u8],
    header: &'a MemRegion,
}

impl<'a> MemRegionView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, DescriptorError> {
        let (header, _) =
            MemRegion::ref_from_prefix(buf).map_err(|_| DescriptorError::OutOfBounds {
                what: "memory region header",
                offset: 0,
                len: buf.len(),
            })?;
        Ok(Self { buf, header })
    }

    pub fn sender_id(&self) -> u16 {
        self.header.sender_id.get()
    }

    pub fn handle(&self) -> u64 {
        self.header.handle.get()
    }

    pub fn ep_count(&self) -> u32 {
        self.header.ep_count.get()
    }

    /// Endpoint access descriptor `index`, which must be declared and present.
    pub fn endpoint(&self, index: u32) -> Result<&'a EndpointAccess, DescriptorError> {
        let count = self.ep_count();
        if index >= count {
            return Err(DescriptorError::NoSuchEndpoint { index, count });
        }
        let offset = MEM_REGION_SIZE + index as usize * EP_ACCESS_SIZE;
        let bytes = self.buf.get(offset..).ok_or(DescriptorError::OutOfBounds {
            what: "endpoint access descriptor",
            offset,
            len: self.buf.len(),
        })?;
        EndpointAccess::ref_from_prefix(bytes)
            .map(|(ep, _)| ep)
            .map_err(|_| DescriptorError::OutOfBounds {
                what: "endpoint access descriptor",
                offset,
                len: self.buf.len(),
            })
    }

    /// Composite region at `offset`, with its whole range array in bounds.
    pub fn composite_at(&self, offset: u32) -> Result<CompositeView<'a>, DescriptorError> {
        if offset == 0 {
            return Err(DescriptorError::NullComposite);
        }
        let offset = offset as usize;
        let len = self.buf.len();
        let bytes = self.buf.get(offset..).ok_or(DescriptorError::OutOfBounds {
            what: "composite region",
            offset,
            len,
        })?;
        let (header, rest) =
            CompositeRegion::ref_from_prefix(bytes).map_err(|_| DescriptorError::OutOfBounds {
                what: "composite region",
                offset,
                len,
            })?;
        let count = header.addr_range_cnt.get() as usize;
        let (ranges, _) = <[AddrRange]>::ref_from_prefix_with_elems(rest, count).map_err(|_| {
            DescriptorError::OutOfBounds {
                what: "address range array",
                offset: offset + COMPOSITE_SIZE,
                len,
            }
        })?;
        Ok(CompositeView { header, ranges })
    }

    /// Composite region referenced by the first endpoint.
    pub fn composite(&self) -> Result<CompositeView<'a>, DescriptorError> {
        let ep = self.endpoint(0)?;
        self.composite_at(ep.composite_off.get())
    }
}

/// A composite region whose constituents are known to lie in bounds.
#[derive(Debug, Clone, Copy)]
pub struct CompositeView<'a> {
    header: &'a CompositeRegion,
    ranges: &'a [AddrRange],
}

impl<'a> CompositeView<'a> {
    pub fn total_pg_cnt(&self) -> u32 {
        self.header.total_pg_cnt.get()
    }

    pub fn ranges(&self) -> &'a [AddrRange] {
        self.ranges
    }
}

// ── Writing ──────────────────────────────────────────────────────────

/// Offset of the composite region written by [`MemRegionBuilder`].
pub const BUILDER_COMPOSITE_OFFSET: usize = MEM_REGION_SIZE + EP_ACCESS_SIZE;

/// Writes a single-receiver memory region descriptor.
///
/// Layout: header, one endpoint access descriptor, composite region,
/// constituents. Used to build retrieve requests and responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemRegionBuilder<'r> {
    pub sender_id: u16,
    pub attributes: u16,
    pub flags: u32,
    pub handle: u64,
    pub tag: u64,
    pub receiver: u16,
    pub permissions: u8,
    pub ranges: &'r [AddrRange],
}

impl MemRegionBuilder<'_> {
    /// Total length of the descriptor this builder emits.
    pub fn encoded_len(&self) -> usize {
        BUILDER_COMPOSITE_OFFSET + COMPOSITE_SIZE + self.ranges.len() * ADDR_RANGE_SIZE
    }

    /// Serialize into the front of `buf`, returning the descriptor length.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize, DescriptorError> {
        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(DescriptorError::BufferTooSmall {
                needed,
                len: buf.len(),
            });
        }
        buf[..needed].fill(0);

        let header = MemRegion {
            sender_id: U16::new(self.sender_id),
            attributes: U16::new(self.attributes),
            flags: U32::new(self.flags),
            handle: U64::new(self.handle),
            tag: U64::new(self.tag),
            reserved: U32::new(0),
            ep_count: U32::new(1),
        };
        let ep = EndpointAccess {
            receiver: U16::new(self.receiver),
            permissions: self.permissions,
            flags: 0,
            composite_off: U32::new(BUILDER_COMPOSITE_OFFSET as u32),
            reserved: U64::new(0),
        };
        let total_pg_cnt = self
            .ranges
            .iter()
            .fold(0u32, |acc, r| acc.wrapping_add(r.pg_cnt()));
        let composite = CompositeRegion {
            total_pg_cnt: U32::new(total_pg_cnt),
            addr_range_cnt: U32::new(self.ranges.len() as u32),
            reserved: U64::new(0),
        };

        let ranges_off = BUILDER_COMPOSITE_OFFSET + COMPOSITE_SIZE;
        buf[..MEM_REGION_SIZE].copy_from_slice(header.as_bytes());
        buf[MEM_REGION_SIZE..BUILDER_COMPOSITE_OFFSET].copy_from_slice(ep.as_bytes());
        buf[BUILDER_COMPOSITE_OFFSET..ranges_off].copy_from_slice(composite.as_bytes());
        buf[ranges_off..needed].copy_from_slice(self.ranges.as_bytes());
        Ok(needed)
    }
}

/// Write the bare header the proxy sends as a retrieve request for `handle`.
pub fn write_retrieve_req(buf: &mut [u8], sender_id: u16, handle: u64) -> Result<usize, DescriptorError> {
    let header = MemRegion {
        sender_id: U16::new(sender_id),
        handle: U64::new(handle),
        ..MemRegion::default()
    };
    header
        .write_to_prefix(buf)
        .map_err(|_| DescriptorError::BufferTooSmall {
            needed: MEM_REGION_SIZE,
            len: buf.len(),
        })?;
    Ok(MEM_REGION_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(ranges: &[AddrRange]) -> ([u8; 256], usize) {
        let mut buf = [0u8; 256];
        let len = MemRegionBuilder {
            sender_id: 0,
            receiver: 0x8001,
            ranges,
            ..Default::default()
        }
        .write(&mut buf)
        .unwrap();
        (buf, len)
    }

    #[test]
    fn parses_builder_output() {
        let ranges = [AddrRange::new(0x8000_0000, 2), AddrRange::new(0x8001_0000, 1)];
        let (buf, len) = build(&ranges);
        assert_eq!(len, 64 + 2 * 16);

        let view = MemRegionView::parse(&buf[..len]).unwrap();
        assert_eq!(view.ep_count(), 1);
        assert_eq!(view.endpoint(0).unwrap().receiver.get(), 0x8001);
        let composite = view.composite().unwrap();
        assert_eq!(composite.total_pg_cnt(), 3);
        assert_eq!(composite.ranges(), &ranges);
    }

    #[test]
    fn range_array_must_fit_fragment() {
        let ranges = [AddrRange::new(0x8000_0000, 1), AddrRange::new(0x8000_1000, 1)];
        let (buf, len) = build(&ranges);
        let view = MemRegionView::parse(&buf[..len - 1]).unwrap();
        assert!(matches!(
            view.composite(),
            Err(DescriptorError::OutOfBounds { what: "address range array", .. })
        ));
    }

    #[test]
    fn composite_offset_checked() {
        let (buf, len) = build(&[]);
        let view = MemRegionView::parse(&buf[..len]).unwrap();
        assert_eq!(view.composite_at(0).unwrap_err(), DescriptorError::NullComposite);
        assert!(view.composite_at(len as u32).is_err());
        assert!(view.composite_at(u32::MAX).is_err());
    }

    #[test]
    fn undeclared_endpoint_rejected() {
        let (buf, len) = build(&[]);
        let view = MemRegionView::parse(&buf[..len]).unwrap();
        assert_eq!(
            view.endpoint(1).unwrap_err(),
            DescriptorError::NoSuchEndpoint { index: 1, count: 1 }
        );
    }

    #[test]
    fn short_header_rejected() {
        assert!(MemRegionView::parse(&[0u8; MEM_REGION_SIZE - 1]).is_err());
    }
}
