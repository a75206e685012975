//! FF-A proxy: mediation of host FF-A calls.
//!
//! Routes host FF-A function ids to local handlers, rejects the explicitly
//! unsupported ones, and leaves everything else to be forwarded unchanged.
//! Memory transactions are checked against host page ownership, applied to
//! the host stage-2 and only then reissued to the secure world; if the
//! secure world refuses, the local update is rolled back (pKVM-compatible).
//!
//! All calls that touch the RX/TX buffers run under one lock, held from
//! validation of the staged descriptor to the final commit or rollback.

use crate::ffa::descriptors::{self, AddrRange};
use crate::ffa::init::Capabilities;
use crate::ffa::mailbox::{HostBuffers, HostMailbox, HostMemory, HypMailbox, MailboxGeometry};
use crate::ffa::memory::{self, phys_to_pfn, HostStage2};
use crate::ffa::smc_forward::SecureWorld;
use crate::ffa::validate::{self, Request, XferKind};
use crate::ffa::*;
use crate::sync::SpinLock;

/// Result of offering a host call to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfaDispatch {
    /// The proxy answered; return this to the host.
    Handled(SmcResult),
    /// Not mediated; forward to the secure world unchanged.
    PassThrough,
}

/// What the host gets back: `Err` carries a locally produced error.
type Outcome = Result<SmcResult, SmcResult>;

/// Everything the lock protects.
struct ProxyState<'a, S, T> {
    spmd: S,
    stage2: T,
    hyp: HypMailbox<'a>,
    host: HostMailbox,
}

impl<S: SecureWorld, T> ProxyState<'_, S, T> {
    fn spmd_call(&mut self, args: SmcArgs) -> SmcResult {
        let (tx, rx) = self.hyp.buffers_mut();
        self.spmd.call(args, tx, rx)
    }

    fn spmd_unmap(&mut self) {
        let res = self.spmd_call(SmcArgs::new(FFA_RXTX_UNMAP, HOST_FFA_ID as u64, 0, 0, 0));
        if !res.is_success() {
            log::warn!("ffa: SPMD refused RXTX_UNMAP: {}", res.error_code());
        }
    }
}

/// How far an FFA_RXTX_MAP got before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapProgress {
    Nothing,
    SpmdMapped,
    TxGranted,
}

impl MapProgress {
    /// Undo every completed step, latest first.
    fn rollback<S: SecureWorld, T: HostStage2>(
        self,
        st: &mut ProxyState<'_, S, T>,
        host: &HostBuffers,
        page_size: u64,
    ) {
        if self == Self::TxGranted {
            let pfn = phys_to_pfn(host.tx_pa, page_size);
            if let Err(err) = memory::revoke_pages(&mut st.stage2, pfn, host.nr_pages) {
                log::error!("ffa: cannot revoke host TX during unwind: {err}");
            }
        }
        if self != Self::Nothing {
            st.spmd_unmap();
        }
    }
}

/// The FF-A proxy instance.
///
/// Built by [`negotiate`](crate::ffa::init::negotiate); lives for the rest
/// of the hypervisor's lifetime and is shared by every core.
pub struct FfaProxy<'a, S, T, M> {
    state: SpinLock<ProxyState<'a, S, T>>,
    host_mem: M,
    geometry: MailboxGeometry,
    caps: Capabilities,
}

impl<'a, S, T, M> FfaProxy<'a, S, T, M>
where
    S: SecureWorld,
    T: HostStage2,
    M: HostMemory,
{
    pub(crate) fn new(spmd: S, stage2: T, host_mem: M, hyp: HypMailbox<'a>, caps: Capabilities) -> Self {
        Self {
            state: SpinLock::new(ProxyState {
                spmd,
                stage2,
                hyp,
                host: HostMailbox::new(),
            }),
            host_mem,
            geometry: caps.geometry,
            caps,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Offer a host call to the proxy.
    pub fn handle(&self, args: &SmcArgs) -> FfaDispatch {
        if !is_ffa_call(args.function_id()) {
            return FfaDispatch::PassThrough;
        }

        let outcome = match Request::decode(args) {
            Request::RxtxMap {
                tx_pa,
                rx_pa,
                ffa_pages,
            } => self.rxtx_map(tx_pa, rx_pa, ffa_pages),
            Request::RxtxUnmap { id } => self.rxtx_unmap(id),
            Request::MemXfer {
                kind,
                len,
                fraglen,
                addr_mbz,
                npages_mbz,
            } => self.mem_xfer(kind, len, fraglen, addr_mbz, npages_mbz),
            Request::MemReclaim { handle, flags } => self.mem_reclaim(handle, flags),
            Request::Features { id } => match self.features(id) {
                Some(res) => Ok(res),
                None => return FfaDispatch::PassThrough,
            },
            Request::Unsupported => {
                log::debug!("ffa: unsupported call {:#x}", args.function_id());
                Err(FfaError::NotSupported.into())
            }
            Request::PassThrough => return FfaDispatch::PassThrough,
        };
        FfaDispatch::Handled(outcome.unwrap_or_else(|err| err))
    }

    /// Send an unmediated call to the secure world unchanged.
    pub fn forward(&self, args: &SmcArgs) -> SmcResult {
        self.state.lock().spmd_call(*args)
    }

    /// [`handle`](Self::handle), forwarding whatever the proxy declines.
    pub fn handle_or_forward(&self, args: &SmcArgs) -> SmcResult {
        match self.handle(args) {
            FfaDispatch::Handled(res) => res,
            FfaDispatch::PassThrough => self.forward(args),
        }
    }

    /// Run `f` on the collaborators and the host mailbox, under the lock.
    ///
    /// Inspection hook for bring-up and tests: `f` sees the stage-2 record
    /// directly, outside the ownership engine.
    #[doc(hidden)]
    pub fn with_backends<R>(&self, f: impl FnOnce(&mut S, &mut T, &HostMailbox) -> R) -> R {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        f(&mut st.spmd, &mut st.stage2, &st.host)
    }

    // ── RXTX Mailbox ─────────────────────────────────────────────────

    /// FFA_RXTX_MAP (64-bit only)
    ///
    /// Input: x1 = host TX PA, x2 = host RX PA, w3 = page count (4K pages)
    /// Output: x0 = FFA_SUCCESS_32 or FFA_ERROR
    ///
    /// Registers the proxy's own staging pair with the SPMD, then shares
    /// both host buffers with the hypervisor.
    fn rxtx_map(&self, tx_pa: u64, rx_pa: u64, ffa_pages: u32) -> Outcome {
        let host = validate::rxtx_map(tx_pa, rx_pa, ffa_pages, &self.geometry)?;
        let page_size = self.geometry.page_size;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.host.is_mapped() {
            log::debug!("ffa: RXTX_MAP while buffers are mapped");
            return Err(FfaError::Denied.into());
        }

        let mut progress = MapProgress::Nothing;
        match Self::map_buffers(st, &host, ffa_pages, page_size, &mut progress) {
            Ok(()) => {
                log::debug!("ffa: host RXTX mapped tx={tx_pa:#x} rx={rx_pa:#x}");
                Ok(SmcResult::success(0))
            }
            Err(err) => {
                log::warn!("ffa: RXTX_MAP failed at {progress:?}, unwinding");
                progress.rollback(st, &host, page_size);
                Err(err)
            }
        }
    }

    fn map_buffers(
        st: &mut ProxyState<'a, S, T>,
        host: &HostBuffers,
        ffa_pages: u32,
        page_size: u64,
        progress: &mut MapProgress,
    ) -> Result<(), SmcResult> {
        let (hyp_tx, hyp_rx) = (st.hyp.tx_pa(), st.hyp.rx_pa());
        let res = st.spmd_call(SmcArgs::new(FFA_RXTX_MAP_64, hyp_tx, hyp_rx, ffa_pages as u64, 0));
        if !res.is_success() {
            return Err(SmcResult::error(res.x2 as u32 as i32));
        }
        *progress = MapProgress::SpmdMapped;

        let tx_pfn = phys_to_pfn(host.tx_pa, page_size);
        memory::grant_pages(&mut st.stage2, tx_pfn, host.nr_pages).map_err(|err| {
            log::debug!("ffa: host TX not shareable: {err}");
            FfaError::InvalidParameters
        })?;
        *progress = MapProgress::TxGranted;

        let rx_pfn = phys_to_pfn(host.rx_pa, page_size);
        memory::grant_pages(&mut st.stage2, rx_pfn, host.nr_pages).map_err(|err| {
            log::debug!("ffa: host RX not shareable: {err}");
            FfaError::InvalidParameters
        })?;

        st.host.set(*host);
        Ok(())
    }

    /// FFA_RXTX_UNMAP
    ///
    /// Input: w1 = endpoint id, must be the host's
    /// Output: x0 = FFA_SUCCESS_32 or FFA_ERROR
    fn rxtx_unmap(&self, id: u32) -> Outcome {
        validate::rxtx_unmap(id)?;
        let page_size = self.geometry.page_size;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(host) = st.host.clear() else {
            log::debug!("ffa: RXTX_UNMAP without mapped buffers");
            return Err(FfaError::InvalidParameters.into());
        };

        let tx_pfn = phys_to_pfn(host.tx_pa, page_size);
        if let Err(err) = memory::revoke_pages(&mut st.stage2, tx_pfn, host.nr_pages) {
            log::warn!("ffa: revoking host TX: {err}");
        }
        let rx_pfn = phys_to_pfn(host.rx_pa, page_size);
        if let Err(err) = memory::revoke_pages(&mut st.stage2, rx_pfn, host.nr_pages) {
            log::warn!("ffa: revoking host RX: {err}");
        }
        st.spmd_unmap();

        log::debug!("ffa: host RXTX unmapped");
        Ok(SmcResult::success(0))
    }

    // ── Memory Sharing ───────────────────────────────────────────────

    /// FFA_MEM_SHARE / FFA_MEM_LEND (32 or 64-bit)
    ///
    /// Input: w1 = total length, w2 = fragment length, x3/w4 = MBZ
    /// Output: downstream result, or FFA_ERROR
    ///
    /// The descriptor is copied out of host TX before it is looked at, so
    /// the host cannot change it between validation and use.
    fn mem_xfer(&self, kind: XferKind, len: u32, fraglen: u32, addr_mbz: u64, npages_mbz: u32) -> Outcome {
        let capacity = self.geometry.bytes() as usize;
        let fraglen = validate::xfer_registers(len, fraglen, addr_mbz, npages_mbz, capacity)?;
        let page_size = self.geometry.page_size;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(host) = st.host.buffers() else {
            log::debug!("ffa: {kind:?} without mapped buffers");
            return Err(FfaError::InvalidParameters.into());
        };

        let (tx, rx) = st.hyp.buffers_mut();
        let staged = tx.get_mut(..fraglen).ok_or(FfaError::InvalidParameters)?;
        self.host_mem.read(host.tx_pa, staged).map_err(|err| {
            log::warn!("ffa: reading host TX: {err}");
            FfaError::InvalidParameters
        })?;

        let tx: &[u8] = tx;
        let ranges = validate::xfer_descriptor(&tx[..fraglen])?;
        memory::share_ranges(&mut st.stage2, ranges, page_size)?;

        let args = SmcArgs::new(kind.function_id(), len as u64, fraglen as u64, 0, 0);
        let res = st.spmd.call(args, tx, rx);
        if res.is_success() {
            log::debug!(
                "ffa: {kind:?} of {} ranges, handle {:#x}",
                ranges.len(),
                pack_handle(res.x2 as u32, res.x3 as u32)
            );
        } else {
            log::debug!("ffa: {kind:?} refused downstream ({}), rolling back", res.error_code());
            Self::unshare_or_log(&mut st.stage2, ranges, page_size);
        }
        Ok(res)
    }

    fn unshare_or_log(stage2: &mut T, ranges: &[AddrRange], page_size: u64) {
        if let Err(err) = memory::unshare_ranges(stage2, ranges, page_size) {
            log::error!("ffa: failed to return {} ranges to the host: {err}", ranges.len());
        }
    }

    /// FFA_MEM_RECLAIM
    ///
    /// Input: w1 = handle low, w2 = handle high, w3 = flags
    /// Output: downstream result, or FFA_ERROR
    ///
    /// The ranges to return to the host come from the SPMC's own record of
    /// the transaction, fetched with a retrieve request, never from the host.
    fn mem_reclaim(&self, handle: u64, flags: u32) -> Outcome {
        let page_size = self.geometry.page_size;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let (tx, rx) = st.hyp.buffers_mut();

        let req_len = descriptors::write_retrieve_req(tx, HOST_FFA_ID, handle)
            .map_err(|_| FfaError::NoMemory)? as u64;
        let res = st.spmd.call(SmcArgs::new(FFA_MEM_RETRIEVE_REQ_64, req_len, req_len, 0, 0), tx, rx);
        if res.x0 != FFA_MEM_RETRIEVE_RESP {
            log::debug!("ffa: retrieve of {handle:#x} answered {:#x}", res.x0);
            return Ok(res);
        }

        // Take a private copy of the response, then hand RX back.
        let resp_len = validate::retrieve_response(&res, rx.len().min(tx.len()));
        if let Ok(len) = resp_len {
            tx[..len].copy_from_slice(&rx[..len]);
        }
        let release = st.spmd.call(SmcArgs::new(FFA_RX_RELEASE, 0, 0, 0, 0), tx, rx);
        if !release.is_success() {
            log::debug!("ffa: RX_RELEASE failed: {}", release.error_code());
        }

        let tx: &[u8] = tx;
        let ranges = validate::retrieved_ranges(&tx[..resp_len?])?;
        let (lo, hi) = unpack_handle(handle);
        let args = SmcArgs::new(FFA_MEM_RECLAIM, lo as u64, hi as u64, flags as u64, 0);
        let res = st.spmd.call(args, tx, rx);
        if res.is_success() {
            // The SPMC has already let go of the memory.
            if let Err(err) = memory::unshare_ranges(&mut st.stage2, ranges, page_size) {
                log::warn!("ffa: reclaimed {handle:#x} but its pages were not shared: {err}");
            }
            log::debug!("ffa: reclaimed {handle:#x}");
        }
        Ok(res)
    }

    // ── Features ─────────────────────────────────────────────────────

    /// FFA_FEATURES
    ///
    /// Input: w1 = function id queried
    /// Output: x0 = FFA_SUCCESS_32 (w2 = properties) or FFA_ERROR, or
    /// `None` to let the secure world answer.
    fn features(&self, id: u32) -> Option<SmcResult> {
        let id = id as u64;
        if validate::is_unsupported(id) {
            return Some(FfaError::NotSupported.into());
        }
        match id {
            // No support for dynamic buffers.
            FFA_MEM_SHARE_32 | FFA_MEM_SHARE_64 | FFA_MEM_LEND_32 | FFA_MEM_LEND_64 => {
                Some(SmcResult::success(0))
            }
            _ => None,
        }
    }
}
