//! FFA_MEM_SHARE / FFA_MEM_LEND mediation.

mod common;

use common::*;
use ffa_proxy::ffa::descriptors::AddrRange;
use ffa_proxy::ffa::memory::PageOwnership;
use ffa_proxy::ffa::*;

fn invalid() -> SmcResult {
    SmcResult::error(FFA_RET_INVALID_PARAMETERS)
}

#[test]
fn share_marks_pages_and_returns_handle() {
    let (proxy, mem) = mapped_proxy();
    let ranges = [AddrRange::new(SHARE_BASE, 2), AddrRange::new(SHARE_BASE + 4 * PAGE, 1)];

    let handle = share(&proxy, &mem, &ranges);

    for pa in [SHARE_BASE, SHARE_BASE + PAGE, SHARE_BASE + 4 * PAGE] {
        assert_eq!(state(&proxy, pa), PageOwnership::SharedFfa);
    }
    assert_eq!(state(&proxy, SHARE_BASE + 2 * PAGE), PageOwnership::Owned);
    assert_eq!(table(&proxy).count(PageOwnership::SharedFfa), 3);

    proxy.with_backends(|spmc, _, _| {
        let record = spmc.share(handle).expect("no record downstream");
        assert_eq!(record.sender_id, HOST_FFA_ID);
        assert_eq!(record.ranges(), &ranges);
        assert_eq!(record.total_pages(), 3);
        assert!(!record.is_lend);
    });
}

#[test]
fn smc32_transfers_are_forwarded_as_smc64() {
    let (proxy, mem) = mapped_proxy();

    let len = stage_descriptor(&mem, &one_page(SHARE_BASE));
    assert!(call(&proxy, xfer_args(FFA_MEM_SHARE_32, len, len)).is_success());
    let len = stage_descriptor(&mem, &one_page(SHARE_BASE + PAGE));
    assert!(call(&proxy, xfer_args(FFA_MEM_LEND_32, len, len)).is_success());

    proxy.with_backends(|spmc, _, _| {
        assert_eq!(spmc.calls_to(FFA_MEM_SHARE_64), 1);
        assert_eq!(spmc.calls_to(FFA_MEM_LEND_64), 1);
        assert_eq!(spmc.calls_to(FFA_MEM_SHARE_32), 0);
        assert_eq!(spmc.calls_to(FFA_MEM_LEND_32), 0);
        let lend = spmc.last_call().unwrap();
        assert_eq!((lend.x1, lend.x2), (len as u64, len as u64));
    });
}

/// Downstream refuses a lend: the page goes back to the host and the
/// downstream error is what the host sees.
#[test]
fn lend_refused_downstream_is_rolled_back() {
    let (proxy, mem) = mapped_proxy();
    proxy.with_backends(|spmc, _, _| spmc.fail_next(FFA_MEM_LEND_64, FfaError::Busy));
    let before = table(&proxy);

    let len = stage_descriptor(&mem, &one_page(SHARE_BASE));
    let res = call(&proxy, xfer_args(FFA_MEM_LEND_64, len, len));

    assert_eq!(res, SmcResult::error(FFA_RET_BUSY));
    assert_eq!(state(&proxy, SHARE_BASE), PageOwnership::Owned);
    assert_eq!(table(&proxy), before);
    proxy.with_backends(|spmc, _, _| assert_eq!(spmc.active_shares(), 0));
}

#[test]
fn fragmented_transfer_is_aborted() {
    let (proxy, mem) = mapped_proxy();
    stage_descriptor(&mem, &one_page(SHARE_BASE));
    let before = table(&proxy);

    let res = call(&proxy, xfer_args(FFA_MEM_SHARE_64, 20, 10));

    assert_eq!(res, SmcResult::error(FFA_RET_ABORTED));
    assert_eq!(table(&proxy), before);
    assert_eq!(calls_to(&proxy, FFA_MEM_SHARE_64), 0);
}

#[test]
fn register_checks() {
    let (proxy, mem) = mapped_proxy();
    let len = stage_descriptor(&mem, &one_page(SHARE_BASE));
    let before = table(&proxy);

    // Fragment longer than the transaction.
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len + 16)), invalid());
    // Fragment larger than the mailbox.
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, 8192, 8192)), invalid());
    // Shorter than header plus one receiver.
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, 40, 40)), invalid());
    // MBZ registers.
    let mut args = xfer_args(FFA_MEM_SHARE_64, len, len);
    args.x3 = 0x8000_0000;
    assert_eq!(call(&proxy, args), invalid());
    let mut args = xfer_args(FFA_MEM_SHARE_64, len, len);
    args.x4 = 1;
    assert_eq!(call(&proxy, args), invalid());

    assert_eq!(table(&proxy), before);
    assert_eq!(calls_to(&proxy, FFA_MEM_SHARE_64), 0);
}

#[test]
fn share_without_mapped_buffers_is_invalid() {
    let (proxy, mem) = proxy();
    let len = stage_descriptor(&mem, &one_page(SHARE_BASE));
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len)), invalid());
    assert_eq!(state(&proxy, SHARE_BASE), PageOwnership::Owned);
}

#[test]
fn exactly_one_receiver() {
    let (proxy, mem) = mapped_proxy();
    let before = table(&proxy);

    for ep_count in [0u32, 2, 0xFFFF_FFFF] {
        let mut desc = descriptor(HOST_FFA_ID, &one_page(SHARE_BASE));
        desc[28..32].copy_from_slice(&ep_count.to_le_bytes());
        mem.write(HOST_TX, &desc);
        let len = desc.len() as u32;
        assert_eq!(
            call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len)),
            invalid(),
            "ep_count {ep_count}"
        );
    }

    assert_eq!(table(&proxy), before);
    assert_eq!(calls_to(&proxy, FFA_MEM_SHARE_64), 0);
}

#[test]
fn sender_must_be_host() {
    let (proxy, mem) = mapped_proxy();
    let desc = descriptor(0x8002, &one_page(SHARE_BASE));
    mem.write(HOST_TX, &desc);
    let len = desc.len() as u32;

    assert_eq!(call(&proxy, xfer_args(FFA_MEM_LEND_64, len, len)), invalid());
    assert_eq!(state(&proxy, SHARE_BASE), PageOwnership::Owned);
}

#[test]
fn composite_must_fit_fragment() {
    let (proxy, mem) = mapped_proxy();
    let before = table(&proxy);
    let ranges = [AddrRange::new(SHARE_BASE, 1), AddrRange::new(SHARE_BASE + PAGE, 1)];

    // Fragment cut inside the range array.
    let desc = descriptor(HOST_FFA_ID, &ranges);
    mem.write(HOST_TX, &desc);
    let short = desc.len() as u32 - 16;
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, short, short)), invalid());

    // Range count claiming more entries than were sent.
    let mut desc = descriptor(HOST_FFA_ID, &ranges);
    desc[52..56].copy_from_slice(&3u32.to_le_bytes());
    mem.write(HOST_TX, &desc);
    let len = desc.len() as u32;
    assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len)), invalid());

    // Composite offset zero, then past the end.
    for offset in [0u32, len] {
        let mut desc = descriptor(HOST_FFA_ID, &ranges);
        desc[36..40].copy_from_slice(&offset.to_le_bytes());
        mem.write(HOST_TX, &desc);
        assert_eq!(call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len)), invalid());
    }

    assert_eq!(table(&proxy), before);
    assert_eq!(calls_to(&proxy, FFA_MEM_SHARE_64), 0);
}

/// Second range belongs to a guest: the first is rolled back and the
/// secure world never hears of the transaction.
#[test]
fn guest_page_is_denied_and_rolled_back() {
    let (proxy, mem) = mapped_proxy();
    let guest = SHARE_BASE + 8 * PAGE;
    proxy.with_backends(|_, table, _| table.set_state(pfn(guest), PageOwnership::NotOwned).unwrap());
    let before = table(&proxy);

    let ranges = [AddrRange::new(SHARE_BASE, 4), AddrRange::new(guest, 1)];
    let len = stage_descriptor(&mem, &ranges);
    let res = call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len));

    assert_eq!(res, SmcResult::error(FFA_RET_DENIED));
    assert_eq!(table(&proxy), before);
    assert_eq!(calls_to(&proxy, FFA_MEM_SHARE_64), 0);
}

#[test]
fn sharing_twice_is_denied() {
    let (proxy, mem) = mapped_proxy();
    share(&proxy, &mem, &one_page(SHARE_BASE));

    let len = stage_descriptor(&mem, &one_page(SHARE_BASE));
    let res = call(&proxy, xfer_args(FFA_MEM_LEND_64, len, len));
    assert_eq!(res, SmcResult::error(FFA_RET_DENIED));
    proxy.with_backends(|spmc, _, _| assert_eq!(spmc.active_shares(), 1));
}

#[test]
fn mailbox_pages_cannot_be_shared() {
    let (proxy, mem) = mapped_proxy();
    let len = stage_descriptor(&mem, &one_page(HOST_RX));
    let res = call(&proxy, xfer_args(FFA_MEM_SHARE_64, len, len));
    assert_eq!(res, SmcResult::error(FFA_RET_DENIED));
    assert_eq!(state(&proxy, HOST_RX), PageOwnership::SharedHyp);
}

/// The host rewriting TX after the call has no effect on what was shared.
#[test]
fn descriptor_is_read_from_private_copy() {
    let (proxy, mem) = mapped_proxy();
    let handle = share(&proxy, &mem, &one_page(SHARE_BASE));
    stage_descriptor(&mem, &one_page(SHARE_BASE + PAGE));

    proxy.with_backends(|spmc, _, _| {
        assert_eq!(spmc.share(handle).unwrap().ranges(), &one_page(SHARE_BASE));
    });
    assert_eq!(state(&proxy, SHARE_BASE + PAGE), PageOwnership::Owned);
}
