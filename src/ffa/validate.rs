//! Request classification and validation.
//!
//! Everything here is read-only: registers and staged descriptor bytes go
//! in, a decoded request or an [`FfaError`] comes out. No check in this
//! module touches ownership state or the secure world.

use crate::ffa::descriptors::{AddrRange, DescriptorError, MemRegionView, MIN_XFER_FRAGMENT};
use crate::ffa::mailbox::{HostBuffers, MailboxGeometry};
use crate::ffa::*;

/// Host memory transaction that the proxy mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferKind {
    Share,
    Lend,
}

impl XferKind {
    /// Function id sent downstream; 32-bit requests are reissued as SMC64.
    pub const fn function_id(self) -> u64 {
        match self {
            Self::Share => FFA_MEM_SHARE_64,
            Self::Lend => FFA_MEM_LEND_64,
        }
    }
}

/// A host FF-A call, decoded once from its registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    RxtxMap {
        tx_pa: u64,
        rx_pa: u64,
        ffa_pages: u32,
    },
    RxtxUnmap {
        id: u32,
    },
    MemXfer {
        kind: XferKind,
        len: u32,
        fraglen: u32,
        addr_mbz: u64,
        npages_mbz: u32,
    },
    MemReclaim {
        handle: u64,
        flags: u32,
    },
    Features {
        id: u32,
    },
    /// Explicitly outside the mediated subset.
    Unsupported,
    /// Not mediated; goes to the secure world unchanged.
    PassThrough,
}

/// Calls rejected with NOT_SUPPORTED, both when issued and when queried.
pub const fn is_unsupported(function_id: u64) -> bool {
    matches!(
        function_id,
        FFA_MEM_OP_PAUSE
            | FFA_MEM_OP_RESUME
            | FFA_MEM_FRAG_RX
            | FFA_MEM_FRAG_TX
            | FFA_MSG_SEND
            | FFA_MSG_POLL
            | FFA_MSG_WAIT
            | FFA_MSG_SEND_DIRECT_REQ_32
            | FFA_MSG_SEND_DIRECT_RESP_32
            | FFA_RXTX_MAP_32
            | FFA_MEM_DONATE_32
            | FFA_MEM_DONATE_64
            | FFA_MEM_RETRIEVE_REQ_32
            | FFA_MEM_RETRIEVE_REQ_64
            | FFA_MEM_RETRIEVE_RESP
            | FFA_MEM_RELINQUISH
    )
}

impl Request {
    pub fn decode(args: &SmcArgs) -> Self {
        let fid = args.function_id();
        if is_unsupported(fid) {
            return Self::Unsupported;
        }
        let xfer = |kind| Self::MemXfer {
            kind,
            len: args.x1 as u32,
            fraglen: args.x2 as u32,
            addr_mbz: args.x3,
            npages_mbz: args.x4 as u32,
        };
        match fid {
            FFA_RXTX_MAP_64 => Self::RxtxMap {
                tx_pa: args.x1,
                rx_pa: args.x2,
                ffa_pages: args.x3 as u32,
            },
            FFA_RXTX_UNMAP => Self::RxtxUnmap { id: args.x1 as u32 },
            FFA_MEM_SHARE_32 | FFA_MEM_SHARE_64 => xfer(XferKind::Share),
            FFA_MEM_LEND_32 | FFA_MEM_LEND_64 => xfer(XferKind::Lend),
            FFA_MEM_RECLAIM => Self::MemReclaim {
                handle: pack_handle(args.x1 as u32, args.x2 as u32),
                flags: args.x3 as u32,
            },
            FFA_FEATURES => Self::Features { id: args.x1 as u32 },
            _ => Self::PassThrough,
        }
    }
}

// ── RX/TX buffers ────────────────────────────────────────────────────

/// FFA_RXTX_MAP: exact negotiated size, page-aligned buffers.
pub fn rxtx_map(
    tx_pa: u64,
    rx_pa: u64,
    ffa_pages: u32,
    geometry: &MailboxGeometry,
) -> Result<HostBuffers, FfaError> {
    if ffa_pages as u64 != geometry.ffa_pages() {
        return Err(FfaError::InvalidParameters);
    }
    if tx_pa % geometry.page_size != 0 || rx_pa % geometry.page_size != 0 {
        return Err(FfaError::InvalidParameters);
    }
    Ok(HostBuffers {
        tx_pa,
        rx_pa,
        nr_pages: geometry.nr_pages,
    })
}

/// FFA_RXTX_UNMAP: only the host may release its buffers.
pub fn rxtx_unmap(id: u32) -> Result<(), FfaError> {
    if id != HOST_FFA_ID as u32 {
        return Err(FfaError::InvalidParameters);
    }
    Ok(())
}

// ── Memory transactions ──────────────────────────────────────────────

/// Register checks for FFA_MEM_SHARE / FFA_MEM_LEND.
///
/// Returns the fragment length to stage. A fragment shorter than the
/// whole transaction needs FFA_MEM_FRAG_TX, which is not offered, so it
/// is reported as aborted rather than invalid.
pub fn xfer_registers(
    len: u32,
    fraglen: u32,
    addr_mbz: u64,
    npages_mbz: u32,
    capacity: usize,
) -> Result<usize, FfaError> {
    if addr_mbz != 0 || npages_mbz != 0 || fraglen > len || fraglen as usize > capacity {
        return Err(FfaError::InvalidParameters);
    }
    if fraglen < len {
        return Err(FfaError::Aborted);
    }
    if (fraglen as usize) < MIN_XFER_FRAGMENT {
        return Err(FfaError::InvalidParameters);
    }
    Ok(fraglen as usize)
}

/// Descriptor checks on the staged copy of a transfer fragment.
///
/// `fragment` must be the proxy's private copy, exactly `fraglen` long.
/// Returns the constituent ranges, all of which lie inside the fragment.
pub fn xfer_descriptor(fragment: &[u8]) -> Result<&[AddrRange], FfaError> {
    let invalid = |err: DescriptorError| {
        log::debug!("ffa: bad transfer descriptor: {err}");
        FfaError::InvalidParameters
    };
    let view = MemRegionView::parse(fragment).map_err(invalid)?;
    if view.ep_count() != 1 {
        log::debug!("ffa: {} receivers, expected one", view.ep_count());
        return Err(FfaError::InvalidParameters);
    }
    if view.sender_id() != HOST_FFA_ID {
        log::debug!("ffa: sender {:#x} is not the host", view.sender_id());
        return Err(FfaError::InvalidParameters);
    }
    let composite = view.composite().map_err(invalid)?;
    Ok(composite.ranges())
}

// ── Reclaim ──────────────────────────────────────────────────────────

/// Check the registers of an FFA_MEM_RETRIEVE_RESP.
///
/// Returns the response length. A response split over several fragments
/// cannot be collected without FFA_MEM_FRAG_RX and aborts the reclaim.
pub fn retrieve_response(res: &SmcResult, capacity: usize) -> Result<usize, FfaError> {
    let len = res.x1 as u32;
    let fraglen = res.x2 as u32;
    if len != fraglen {
        log::debug!("ffa: fragmented retrieve response ({fraglen}/{len})");
        return Err(FfaError::Aborted);
    }
    if len as usize > capacity {
        return Err(FfaError::Aborted);
    }
    Ok(len as usize)
}

/// Ranges described by a retrieve response of `desc.len()` bytes.
pub fn retrieved_ranges(desc: &[u8]) -> Result<&[AddrRange], FfaError> {
    MemRegionView::parse(desc)
        .and_then(|view| view.composite())
        .map(|composite| composite.ranges())
        .map_err(|err| {
            log::warn!("ffa: malformed retrieve response: {err}");
            FfaError::Aborted
        })
}
