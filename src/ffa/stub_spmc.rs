//! Stub SPMC: an in-memory secure world.
//!
//! Answers the downstream side of the protocol the proxy relies on
//! (version, id, features, RX/TX map, share, lend, retrieve, reclaim) and
//! keeps the transactions it has accepted in a fixed table. Used for
//! bring-up on platforms without an SPMC, and by the tests, which also use
//! its call log and fault injection.

use core::mem::offset_of;

use crate::ffa::descriptors::{
    AddrRange, EndpointAccess, MemRegionBuilder, MemRegionView, MEM_REGION_SIZE,
};
use crate::ffa::smc_forward::SecureWorld;
use crate::ffa::*;

/// Partition id the stub reports as receiver of retrieved memory.
pub const STUB_SP_ID: u16 = 0x8001;

/// Maximum concurrent transactions.
pub const MAX_SHARES: usize = 16;

/// Maximum address ranges per transaction.
pub const MAX_SHARE_RANGES: usize = 4;

/// Calls remembered by the call log.
pub const CALL_LOG_LEN: usize = 64;

/// Handles start here so that both halves are exercised.
const FIRST_HANDLE: u64 = 0x1_0000_0001;

/// A transaction accepted by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareRecord {
    pub handle: u64,
    pub sender_id: u16,
    pub receiver_id: u16,
    pub is_lend: bool,
    ranges: [AddrRange; MAX_SHARE_RANGES],
    range_count: usize,
}

impl ShareRecord {
    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges[..self.range_count]
    }

    pub fn total_pages(&self) -> u64 {
        self.ranges().iter().map(|r| r.pg_cnt() as u64).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFault {
    function_id: u64,
    error: FfaError,
}

pub struct StubSpmc {
    smccc_version: u32,
    /// `None` makes FFA_VERSION answer NOT_SUPPORTED.
    ffa_version: Option<u32>,
    id: u16,
    rxtx_min_size: u64,
    rxtx_mapped: Option<(u64, u64, u32)>,
    /// RX holds a response the proxy has not released yet.
    rx_full: bool,
    fragment_retrieve: bool,
    /// Composite offset written into the next retrieve response.
    corrupt_retrieve: Option<u32>,
    fault: Option<InjectedFault>,
    shares: [Option<ShareRecord>; MAX_SHARES],
    next_handle: u64,
    log: [SmcArgs; CALL_LOG_LEN],
    log_total: usize,
}

impl Default for StubSpmc {
    fn default() -> Self {
        Self::new()
    }
}

impl StubSpmc {
    /// An SPMC speaking FF-A v1.0 over SMCCC v1.2 with 4K buffers.
    pub const fn new() -> Self {
        Self {
            smccc_version: SMCCC_VERSION_1_2,
            ffa_version: Some(FFA_VERSION_1_0),
            id: HOST_FFA_ID,
            rxtx_min_size: FFA_FEAT_RXTX_MIN_SZ_4K,
            rxtx_mapped: None,
            rx_full: false,
            fragment_retrieve: false,
            corrupt_retrieve: None,
            fault: None,
            shares: [None; MAX_SHARES],
            next_handle: FIRST_HANDLE,
            log: [SmcArgs::new(0, 0, 0, 0, 0); CALL_LOG_LEN],
            log_total: 0,
        }
    }

    // ── Configuration ────────────────────────────────────────────────

    pub fn with_smccc_version(mut self, version: u32) -> Self {
        self.smccc_version = version;
        self
    }

    pub fn with_ffa_version(mut self, version: Option<u32>) -> Self {
        self.ffa_version = version;
        self
    }

    /// Id reported by FFA_ID_GET for the non-secure physical instance.
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    /// FFA_FEATURES(RXTX_MAP) minimum buffer size code.
    pub fn with_rxtx_min_size(mut self, code: u64) -> Self {
        self.rxtx_min_size = code;
        self
    }

    /// Answer retrieve requests with a response split over two fragments.
    pub fn set_fragment_retrieve(&mut self, on: bool) {
        self.fragment_retrieve = on;
    }

    /// Point the composite offset of the next retrieve response at
    /// `composite_off`, leaving its registers intact.
    pub fn corrupt_next_retrieve(&mut self, composite_off: u32) {
        self.corrupt_retrieve = Some(composite_off);
    }

    /// Fail the next call to `function_id` with `error`, with no side effect.
    pub fn fail_next(&mut self, function_id: u64, error: FfaError) {
        self.fault = Some(InjectedFault { function_id, error });
    }

    /// Record a transaction as if it had been shared earlier.
    pub fn seed_share(&mut self, sender_id: u16, ranges: &[AddrRange], is_lend: bool) -> Option<u64> {
        self.insert_share(sender_id, STUB_SP_ID, ranges, is_lend).ok()
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn is_rxtx_mapped(&self) -> bool {
        self.rxtx_mapped.is_some()
    }

    pub fn share(&self, handle: u64) -> Option<&ShareRecord> {
        self.shares().find(|s| s.handle == handle)
    }

    /// Transactions accepted and not yet reclaimed.
    pub fn shares(&self) -> impl Iterator<Item = &ShareRecord> {
        self.shares.iter().flatten()
    }

    pub fn active_shares(&self) -> usize {
        self.shares().count()
    }

    /// Number of calls to `function_id` among the most recent ones.
    pub fn calls_to(&self, function_id: u64) -> usize {
        self.calls().filter(|c| c.x0 == function_id).count()
    }

    /// Most recent calls, oldest first.
    pub fn calls(&self) -> impl Iterator<Item = &SmcArgs> {
        let kept = self.log_total.min(CALL_LOG_LEN);
        let start = self.log_total - kept;
        (start..self.log_total).map(move |i| &self.log[i % CALL_LOG_LEN])
    }

    pub fn last_call(&self) -> Option<&SmcArgs> {
        self.calls().last()
    }

    pub fn clear_calls(&mut self) {
        self.log_total = 0;
    }

    // ── Handlers ─────────────────────────────────────────────────────

    fn record(&mut self, args: SmcArgs) {
        self.log[self.log_total % CALL_LOG_LEN] = args;
        self.log_total += 1;
    }

    fn take_fault(&mut self, function_id: u64) -> Option<FfaError> {
        match self.fault {
            Some(f) if f.function_id == function_id => {
                self.fault = None;
                Some(f.error)
            }
            _ => None,
        }
    }

    fn version(&self) -> SmcResult {
        let x0 = match self.ffa_version {
            Some(v) => v as u64,
            None => FFA_RET_NOT_SUPPORTED as i64 as u64,
        };
        SmcResult { x0, ..SmcResult::default() }
    }

    fn features(&self, id: u64) -> Result<u64, FfaError> {
        match id {
            FFA_RXTX_MAP_64 => Ok(self.rxtx_min_size),
            FFA_RXTX_UNMAP | FFA_RX_RELEASE | FFA_ID_GET | FFA_MEM_SHARE_32 | FFA_MEM_SHARE_64
            | FFA_MEM_LEND_32 | FFA_MEM_LEND_64 | FFA_MEM_RETRIEVE_REQ_64 | FFA_MEM_RECLAIM => Ok(0),
            _ => Err(FfaError::NotSupported),
        }
    }

    fn rxtx_map(&mut self, tx: u64, rx: u64, pages: u32) -> Result<u64, FfaError> {
        if self.rxtx_mapped.is_some() {
            return Err(FfaError::Denied);
        }
        if pages == 0 || tx == rx {
            return Err(FfaError::InvalidParameters);
        }
        self.rxtx_mapped = Some((tx, rx, pages));
        self.rx_full = false;
        Ok(0)
    }

    fn rxtx_unmap(&mut self) -> Result<u64, FfaError> {
        self.rxtx_mapped.take().ok_or(FfaError::InvalidParameters)?;
        Ok(0)
    }

    fn rx_release(&mut self) -> Result<u64, FfaError> {
        if !self.rx_full {
            return Err(FfaError::Denied);
        }
        self.rx_full = false;
        Ok(0)
    }

    fn insert_share(
        &mut self,
        sender_id: u16,
        receiver_id: u16,
        ranges: &[AddrRange],
        is_lend: bool,
    ) -> Result<u64, FfaError> {
        if ranges.len() > MAX_SHARE_RANGES {
            return Err(FfaError::NoMemory);
        }
        let slot = self
            .shares
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(FfaError::NoMemory)?;
        let handle = self.next_handle;
        self.next_handle += 1;

        let mut record = ShareRecord {
            handle,
            sender_id,
            receiver_id,
            is_lend,
            ranges: [AddrRange::default(); MAX_SHARE_RANGES],
            range_count: ranges.len(),
        };
        record.ranges[..ranges.len()].copy_from_slice(ranges);
        *slot = Some(record);
        Ok(handle)
    }

    fn mem_xfer(&mut self, len: u32, fraglen: u32, is_lend: bool, tx: &[u8]) -> SmcResult {
        if self.rxtx_mapped.is_none() {
            return FfaError::Denied.into_result();
        }
        if fraglen != len {
            return FfaError::InvalidParameters.into_result();
        }
        let Some(desc) = tx.get(..len as usize) else {
            return FfaError::InvalidParameters.into_result();
        };
        let parsed = MemRegionView::parse(desc).and_then(|view| {
            let receiver = view.endpoint(0)?.receiver.get();
            Ok((view.sender_id(), receiver, view.composite()?.ranges()))
        });
        let Ok((sender, receiver, ranges)) = parsed else {
            return FfaError::InvalidParameters.into_result();
        };
        match self.insert_share(sender, receiver, ranges, is_lend) {
            Ok(handle) => {
                let (lo, hi) = unpack_handle(handle);
                SmcResult {
                    x0: FFA_SUCCESS_32,
                    x1: 0,
                    x2: lo as u64,
                    x3: hi as u64,
                }
            }
            Err(err) => err.into_result(),
        }
    }

    fn retrieve_req(&mut self, len: u32, tx: &[u8], rx: &mut [u8]) -> SmcResult {
        if self.rxtx_mapped.is_none() {
            return FfaError::Denied.into_result();
        }
        if self.rx_full {
            return FfaError::Busy.into_result();
        }
        let handle = match tx.get(..len as usize).map(MemRegionView::parse) {
            Some(Ok(view)) => view.handle(),
            _ => return FfaError::InvalidParameters.into_result(),
        };
        let Some(record) = self.share(handle).copied() else {
            return FfaError::InvalidParameters.into_result();
        };
        let resp = MemRegionBuilder {
            sender_id: record.sender_id,
            handle,
            receiver: record.receiver_id,
            ranges: record.ranges(),
            ..MemRegionBuilder::default()
        };
        let written = match resp.write(rx) {
            Ok(n) => n as u64,
            Err(_) => return FfaError::NoMemory.into_result(),
        };
        if let Some(off) = self.corrupt_retrieve.take() {
            let at = MEM_REGION_SIZE + offset_of!(EndpointAccess, composite_off);
            rx[at..at + 4].copy_from_slice(&off.to_le_bytes());
        }
        self.rx_full = true;
        let fraglen = if self.fragment_retrieve {
            written / 2
        } else {
            written
        };
        SmcResult {
            x0: FFA_MEM_RETRIEVE_RESP,
            x1: written,
            x2: fraglen,
            x3: 0,
        }
    }

    fn reclaim(&mut self, handle: u64) -> Result<u64, FfaError> {
        let slot = self
            .shares
            .iter_mut()
            .find(|s| s.is_some_and(|s| s.handle == handle))
            .ok_or(FfaError::InvalidParameters)?;
        *slot = None;
        Ok(0)
    }
}

impl SecureWorld for StubSpmc {
    fn call(&mut self, args: SmcArgs, tx: &[u8], rx: &mut [u8]) -> SmcResult {
        self.record(args);
        let fid = args.function_id();
        if let Some(err) = self.take_fault(fid) {
            log::debug!("stub spmc: injected {err} for {fid:#x}");
            return err.into_result();
        }

        match fid {
            SMCCC_VERSION => SmcResult {
                x0: self.smccc_version as u64,
                ..SmcResult::default()
            },
            FFA_VERSION => self.version(),
            FFA_ID_GET => SmcResult::success(self.id as u64),
            FFA_FEATURES => self.features(args.x1 as u32 as u64).into(),
            FFA_RXTX_MAP_64 => self.rxtx_map(args.x1, args.x2, args.x3 as u32).into(),
            FFA_RXTX_UNMAP => self.rxtx_unmap().into(),
            FFA_RX_RELEASE => self.rx_release().into(),
            FFA_MEM_SHARE_64 => self.mem_xfer(args.x1 as u32, args.x2 as u32, false, tx),
            FFA_MEM_LEND_64 => self.mem_xfer(args.x1 as u32, args.x2 as u32, true, tx),
            FFA_MEM_RETRIEVE_REQ_64 => self.retrieve_req(args.x1 as u32, tx, rx),
            FFA_MEM_RECLAIM => self
                .reclaim(pack_handle(args.x1 as u32, args.x2 as u32))
                .into(),
            _ => FfaError::NotSupported.into_result(),
        }
    }
}
