//! Shared fixtures: a fake host physical memory, a negotiated proxy over
//! the stub SPMC, and descriptor helpers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ffa_proxy::ffa::descriptors::{AddrRange, MemRegionBuilder};
use ffa_proxy::ffa::mailbox::{HostMemory, HostMemoryError, HypMailbox};
use ffa_proxy::ffa::memory::{PageOwnership, PageStateTable};
use ffa_proxy::ffa::stub_spmc::{StubSpmc, STUB_SP_ID};
use ffa_proxy::ffa::*;
use ffa_proxy::{negotiate, FfaDispatch, FfaProxy, Negotiation, ProxyConfig};

pub const PAGE: u64 = 4096;

/// Host RAM window tracked by the ownership table.
pub const HOST_BASE: u64 = 0x8000_0000;
pub const HOST_PAGES: usize = 64;

pub const HOST_TX: u64 = HOST_BASE;
pub const HOST_RX: u64 = HOST_BASE + 0x4000;
/// First page handed out for sharing.
pub const SHARE_BASE: u64 = HOST_BASE + 0x10000;

pub const HYP_TX_PA: u64 = 0x4000_0000;
pub const HYP_RX_PA: u64 = 0x4010_0000;

pub type Table = PageStateTable<HOST_PAGES>;
pub type Proxy = FfaProxy<'static, StubSpmc, Table, FakeHostMemory>;

/// Host physical memory backed by a byte vector, shared with the test.
#[derive(Clone)]
pub struct FakeHostMemory {
    base: u64,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl FakeHostMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// Host-side store, e.g. the host filling its TX buffer.
    pub fn write(&self, phys: u64, data: &[u8]) {
        let off = (phys - self.base) as usize;
        self.bytes.lock().unwrap()[off..off + data.len()].copy_from_slice(data);
    }
}

impl HostMemory for FakeHostMemory {
    fn read(&self, phys: u64, dst: &mut [u8]) -> Result<(), HostMemoryError> {
        let bytes = self.bytes.lock().unwrap();
        let err = HostMemoryError::Unmapped {
            phys,
            len: dst.len(),
        };
        let off = phys.checked_sub(self.base).ok_or(err)? as usize;
        let src = bytes.get(off..off + dst.len()).ok_or(err)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

pub fn pfn(pa: u64) -> u64 {
    pa / PAGE
}

/// Staging pair of `bytes` per direction; leaked to get a `'static` proxy.
pub fn staging(bytes: usize) -> HypMailbox<'static> {
    let tx = Box::leak(vec![0u8; bytes].into_boxed_slice());
    let rx = Box::leak(vec![0u8; bytes].into_boxed_slice());
    HypMailbox::new(tx, HYP_TX_PA, rx, HYP_RX_PA)
}

pub fn host_memory() -> FakeHostMemory {
    FakeHostMemory::new(HOST_BASE, HOST_PAGES * PAGE as usize)
}

pub fn try_negotiate(
    config: &ProxyConfig,
    spmc: StubSpmc,
) -> Result<Negotiation<'static, StubSpmc, Table, FakeHostMemory>, ffa_proxy::InitError> {
    let staging = staging((config.page_size * config.mailbox_pages) as usize);
    negotiate(config, spmc, Table::new(pfn(HOST_BASE)), host_memory(), staging)
}

/// Proxy built over a default stub, plus a handle on host memory.
pub fn proxy_with(config: ProxyConfig) -> (Proxy, FakeHostMemory) {
    let mem = host_memory();
    let staging = staging((config.page_size * config.mailbox_pages) as usize);
    let negotiated = negotiate(
        &config,
        StubSpmc::new(),
        Table::new(pfn(HOST_BASE)),
        mem.clone(),
        staging,
    )
    .expect("negotiation failed");
    match negotiated {
        Negotiation::Enabled(proxy) => {
            proxy.with_backends(|spmc, _, _| spmc.clear_calls());
            (proxy, mem)
        }
        Negotiation::Disabled(reason) => panic!("proxy disabled: {reason:?}"),
    }
}

pub fn proxy() -> (Proxy, FakeHostMemory) {
    proxy_with(ProxyConfig::default())
}

/// Proxy whose host buffers are already mapped.
pub fn mapped_proxy() -> (Proxy, FakeHostMemory) {
    let (proxy, mem) = proxy();
    let res = call(&proxy, map_args(HOST_TX, HOST_RX, 1));
    assert!(res.is_success(), "RXTX_MAP failed: {res:?}");
    (proxy, mem)
}

/// Result of a call the proxy must handle itself.
pub fn call(proxy: &Proxy, args: SmcArgs) -> SmcResult {
    match proxy.handle(&args) {
        FfaDispatch::Handled(res) => res,
        FfaDispatch::PassThrough => panic!("{:#x} was passed through", args.x0),
    }
}

pub fn map_args(tx: u64, rx: u64, ffa_pages: u64) -> SmcArgs {
    SmcArgs::new(FFA_RXTX_MAP_64, tx, rx, ffa_pages, 0)
}

pub fn unmap_args(id: u64) -> SmcArgs {
    SmcArgs::new(FFA_RXTX_UNMAP, id, 0, 0, 0)
}

pub fn xfer_args(function_id: u64, len: u32, fraglen: u32) -> SmcArgs {
    SmcArgs::new(function_id, len as u64, fraglen as u64, 0, 0)
}

pub fn reclaim_args(handle: u64) -> SmcArgs {
    let (lo, hi) = unpack_handle(handle);
    SmcArgs::new(FFA_MEM_RECLAIM, lo as u64, hi as u64, 0, 0)
}

/// Encode a single-receiver transfer descriptor.
pub fn descriptor(sender_id: u16, ranges: &[AddrRange]) -> Vec<u8> {
    let builder = MemRegionBuilder {
        sender_id,
        receiver: STUB_SP_ID,
        permissions: 0b0110,
        ranges,
        ..Default::default()
    };
    let mut buf = vec![0u8; builder.encoded_len()];
    builder.write(&mut buf).unwrap();
    buf
}

/// Place a host transfer descriptor for `ranges` in host TX.
pub fn stage_descriptor(mem: &FakeHostMemory, ranges: &[AddrRange]) -> u32 {
    let desc = descriptor(HOST_FFA_ID, ranges);
    mem.write(HOST_TX, &desc);
    desc.len() as u32
}

/// Share `ranges` through the proxy, returning the handle.
pub fn share(proxy: &Proxy, mem: &FakeHostMemory, ranges: &[AddrRange]) -> u64 {
    let len = stage_descriptor(mem, ranges);
    let res = call(proxy, xfer_args(FFA_MEM_SHARE_64, len, len));
    assert!(res.is_success(), "MEM_SHARE failed: {res:?}");
    pack_handle(res.x2 as u32, res.x3 as u32)
}

pub fn one_page(pa: u64) -> [AddrRange; 1] {
    [AddrRange::new(pa, 1)]
}

pub fn state(proxy: &Proxy, pa: u64) -> PageOwnership {
    proxy.with_backends(|_, table, _| table.state(pfn(pa)).unwrap())
}

pub fn table(proxy: &Proxy) -> Table {
    proxy.with_backends(|_, table, _| table.clone())
}

pub fn calls_to(proxy: &Proxy, function_id: u64) -> usize {
    proxy.with_backends(|spmc, _, _| spmc.calls_to(function_id))
}

/// The ownership record marks exactly the pages the secure world holds.
pub fn assert_consistent(proxy: &Proxy) {
    proxy.with_backends(|spmc, table, _| {
        let mut held = vec![false; HOST_PAGES];
        for record in spmc.shares() {
            for range in record.ranges() {
                let first = pfn(range.address()) - pfn(HOST_BASE);
                for i in first..first + range.pg_cnt() as u64 {
                    held[i as usize] = true;
                }
            }
        }
        for (i, &held) in held.iter().enumerate() {
            let state = table.state(pfn(HOST_BASE) + i as u64).unwrap();
            assert_eq!(
                state == PageOwnership::SharedFfa,
                held,
                "page {i} is {state:?} but held={held}"
            );
        }
    });
}
