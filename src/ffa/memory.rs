//! Host page ownership transitions for FF-A memory sharing.
//!
//! The authoritative record lives in the host stage-2 (pKVM keeps it in the
//! PTE software bits); the proxy only reaches it through [`HostStage2`].
//! Every transition applied here is reversible, and a multi-range call
//! either completes or leaves the record exactly as it found it.

use core::ops::Range;

use crate::ffa::descriptors::AddrRange;
use crate::ffa::{FfaError, FFA_PAGE_SIZE};

/// Ownership state of a host page (the stage-2 SW bits [56:55] in pKVM).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageOwnership {
    /// Exclusively owned by the host.
    #[default]
    Owned = 0b00,
    /// Owned by the host, shared with the secure world through FF-A.
    SharedFfa = 0b01,
    /// Owned by the host, shared with the hypervisor (mailbox pages).
    SharedHyp = 0b10,
    /// Not the host's: donated to a protected guest or the hypervisor.
    NotOwned = 0b11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Stage2Error {
    #[error("pfn {pfn:#x} (+{nr_pages}) outside the host ownership record")]
    OutOfRange { pfn: u64, nr_pages: u64 },
    #[error("pfn {pfn:#x} is {state:?}, expected {expected:?}")]
    InvalidState {
        pfn: u64,
        state: PageOwnership,
        expected: PageOwnership,
    },
    #[error("range at {address:#x} of {pg_cnt} FF-A pages is not hypervisor-page aligned")]
    Misaligned { address: u64, pg_cnt: u32 },
}

/// Host stage-2 ownership operations consumed by the proxy.
///
/// Each call either applies to every page it names or to none of them.
pub trait HostStage2 {
    /// Owned -> SharedFfa for `nr_pages` pages starting at `pfn`.
    fn share_ffa(&mut self, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error>;
    /// SharedFfa -> Owned for `nr_pages` pages starting at `pfn`.
    fn unshare_ffa(&mut self, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error>;
    /// Owned -> SharedHyp for one page.
    fn share_hyp(&mut self, pfn: u64) -> Result<(), Stage2Error>;
    /// SharedHyp -> Owned for one page.
    fn unshare_hyp(&mut self, pfn: u64) -> Result<(), Stage2Error>;
}

pub const fn phys_to_pfn(phys: u64, page_size: u64) -> u64 {
    phys / page_size
}

// ── In-memory ownership record ───────────────────────────────────────

/// Ownership record for a window of `N` host pages starting at `base_pfn`.
///
/// Backs the proxy on platforms where the stage-2 is managed elsewhere and
/// serves as the reference record in tests. Pages outside the window are
/// treated as unknown and every transition on them fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStateTable<const N: usize> {
    base_pfn: u64,
    pages: [PageOwnership; N],
}

impl<const N: usize> PageStateTable<N> {
    /// All pages start host-owned.
    pub const fn new(base_pfn: u64) -> Self {
        Self {
            base_pfn,
            pages: [PageOwnership::Owned; N],
        }
    }

    pub fn base_pfn(&self) -> u64 {
        self.base_pfn
    }

    pub fn state(&self, pfn: u64) -> Option<PageOwnership> {
        self.window(pfn, 1).ok().map(|w| self.pages[w.start])
    }

    /// Force the state of one page, e.g. to model a page donated to a guest.
    pub fn set_state(&mut self, pfn: u64, state: PageOwnership) -> Result<(), Stage2Error> {
        let w = self.window(pfn, 1)?;
        self.pages[w.start] = state;
        Ok(())
    }

    /// Number of pages currently in `state`.
    pub fn count(&self, state: PageOwnership) -> usize {
        self.pages.iter().filter(|&&s| s == state).count()
    }

    fn window(&self, pfn: u64, nr_pages: u64) -> Result<Range<usize>, Stage2Error> {
        let err = Stage2Error::OutOfRange { pfn, nr_pages };
        let start = pfn.checked_sub(self.base_pfn).ok_or(err)?;
        let end = start.checked_add(nr_pages).ok_or(err)?;
        if end > N as u64 {
            return Err(err);
        }
        Ok(start as usize..end as usize)
    }

    /// Check-then-commit transition of a page run.
    fn transition(
        &mut self,
        pfn: u64,
        nr_pages: u64,
        from: PageOwnership,
        to: PageOwnership,
    ) -> Result<(), Stage2Error> {
        let w = self.window(pfn, nr_pages)?;
        if let Some(i) = self.pages[w.clone()].iter().position(|&s| s != from) {
            return Err(Stage2Error::InvalidState {
                pfn: pfn + i as u64,
                state: self.pages[w.start + i],
                expected: from,
            });
        }
        self.pages[w].fill(to);
        Ok(())
    }
}

impl<const N: usize> HostStage2 for PageStateTable<N> {
    fn share_ffa(&mut self, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error> {
        self.transition(pfn, nr_pages, PageOwnership::Owned, PageOwnership::SharedFfa)
    }

    fn unshare_ffa(&mut self, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error> {
        self.transition(pfn, nr_pages, PageOwnership::SharedFfa, PageOwnership::Owned)
    }

    fn share_hyp(&mut self, pfn: u64) -> Result<(), Stage2Error> {
        self.transition(pfn, 1, PageOwnership::Owned, PageOwnership::SharedHyp)
    }

    fn unshare_hyp(&mut self, pfn: u64) -> Result<(), Stage2Error> {
        self.transition(pfn, 1, PageOwnership::SharedHyp, PageOwnership::Owned)
    }
}

// ── Reversible transitions ───────────────────────────────────────────

/// Apply `forward` to each item in order. On the first failure, apply
/// `reverse` to every item that had succeeded, in the same order, and
/// return the failure.
///
/// A failing `reverse` means the record no longer matches what the secure
/// world believes; it is logged and counted, nothing more can be done.
fn apply_reversible<T, I>(
    stage2: &mut T,
    items: I,
    forward: impl Fn(&mut T, I::Item) -> Result<(), Stage2Error>,
    reverse: impl Fn(&mut T, I::Item) -> Result<(), Stage2Error>,
) -> Result<(), Stage2Error>
where
    I: IntoIterator + Clone,
{
    let mut done = 0;
    for item in items.clone() {
        if let Err(err) = forward(stage2, item) {
            let mut stuck = 0;
            for item in items.into_iter().take(done) {
                if let Err(undo_err) = reverse(stage2, item) {
                    log::error!("ffa: rollback step failed: {undo_err}");
                    stuck += 1;
                }
            }
            if stuck != 0 {
                log::error!("ffa: rollback of {done} steps left {stuck} inconsistent");
            }
            return Err(err);
        }
        done += 1;
    }
    Ok(())
}

/// Host pages covered by an FF-A address range.
fn range_pages(range: &AddrRange, page_size: u64) -> Result<(u64, u64), Stage2Error> {
    let size = range.pg_cnt() as u64 * FFA_PAGE_SIZE;
    let address = range.address();
    if size % page_size != 0 || address % page_size != 0 {
        return Err(Stage2Error::Misaligned {
            address,
            pg_cnt: range.pg_cnt(),
        });
    }
    Ok((phys_to_pfn(address, page_size), size / page_size))
}

fn share_range<T: HostStage2>(stage2: &mut T, range: &AddrRange, page_size: u64) -> Result<(), Stage2Error> {
    let (pfn, nr_pages) = range_pages(range, page_size)?;
    stage2.share_ffa(pfn, nr_pages)
}

fn unshare_range<T: HostStage2>(stage2: &mut T, range: &AddrRange, page_size: u64) -> Result<(), Stage2Error> {
    let (pfn, nr_pages) = range_pages(range, page_size)?;
    stage2.unshare_ffa(pfn, nr_pages)
}

/// Mark every range shared with the secure world, or none of them.
pub fn share_ranges<T: HostStage2>(
    stage2: &mut T,
    ranges: &[AddrRange],
    page_size: u64,
) -> Result<(), FfaError> {
    apply_reversible(
        stage2,
        ranges,
        |s, r| share_range(s, r, page_size),
        |s, r| unshare_range(s, r, page_size),
    )
    .map_err(|err| {
        log::debug!("ffa: share of {} ranges denied: {err}", ranges.len());
        FfaError::Denied
    })
}

/// Return every range to exclusive host ownership, or none of them.
pub fn unshare_ranges<T: HostStage2>(
    stage2: &mut T,
    ranges: &[AddrRange],
    page_size: u64,
) -> Result<(), FfaError> {
    apply_reversible(
        stage2,
        ranges,
        |s, r| unshare_range(s, r, page_size),
        |s, r| share_range(s, r, page_size),
    )
    .map_err(|err| {
        log::debug!("ffa: unshare of {} ranges denied: {err}", ranges.len());
        FfaError::Denied
    })
}

/// Share `nr_pages` host pages from `pfn` with the hypervisor, all or none.
pub fn grant_pages<T: HostStage2>(stage2: &mut T, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error> {
    apply_reversible(
        stage2,
        pfn..pfn + nr_pages,
        |s, p| s.share_hyp(p),
        |s, p| s.unshare_hyp(p),
    )
}

/// Stop sharing `nr_pages` host pages from `pfn` with the hypervisor.
///
/// Keeps going past failures so that as much as possible is returned to
/// the host; reports the first failure.
pub fn revoke_pages<T: HostStage2>(stage2: &mut T, pfn: u64, nr_pages: u64) -> Result<(), Stage2Error> {
    let mut first = Ok(());
    for p in pfn..pfn + nr_pages {
        if let Err(err) = stage2.unshare_hyp(p) {
            if first.is_ok() {
                first = Err(err);
            }
        }
    }
    first
}
