//! RX/TX buffer pairs.
//!
//! Two pairs exist. The host maps its own pair with FFA_RXTX_MAP; the proxy
//! only records where it lives and reads host TX through [`HostMemory`].
//! The proxy's staging pair ([`HypMailbox`]) is the one actually registered
//! with the secure world: transfer descriptors are copied into its TX half
//! before they are validated, and retrieve responses land in its RX half.

use crate::ffa::FFA_PAGE_SIZE;

/// Fixed size of each mailbox buffer, agreed once at negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxGeometry {
    /// Hypervisor page size in bytes.
    pub page_size: u64,
    /// Buffer length in hypervisor pages.
    pub nr_pages: u64,
}

impl MailboxGeometry {
    /// Buffer length in bytes.
    pub const fn bytes(&self) -> u64 {
        self.page_size * self.nr_pages
    }

    /// Buffer length in FF-A (4K) pages, as the host must state it.
    pub const fn ffa_pages(&self) -> u64 {
        self.bytes() / FFA_PAGE_SIZE
    }
}

/// Staging buffers owned by the proxy and shared with the secure world.
pub struct HypMailbox<'a> {
    tx: &'a mut [u8],
    rx: &'a mut [u8],
    tx_pa: u64,
    rx_pa: u64,
}

impl<'a> HypMailbox<'a> {
    /// `tx_pa`/`rx_pa` are the physical addresses the secure world is told
    /// to map for `tx`/`rx`.
    pub fn new(tx: &'a mut [u8], tx_pa: u64, rx: &'a mut [u8], rx_pa: u64) -> Self {
        Self { tx, rx, tx_pa, rx_pa }
    }

    pub fn tx_pa(&self) -> u64 {
        self.tx_pa
    }

    pub fn rx_pa(&self) -> u64 {
        self.rx_pa
    }

    pub fn tx(&self) -> &[u8] {
        &*self.tx
    }

    pub fn rx(&self) -> &[u8] {
        &*self.rx
    }

    /// Both halves at once, (tx, rx).
    pub fn buffers_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut *self.tx, &mut *self.rx)
    }
}

/// Location of the host's mapped RX/TX pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBuffers {
    pub tx_pa: u64,
    pub rx_pa: u64,
    /// Length of each buffer in hypervisor pages.
    pub nr_pages: u64,
}

/// Host-side mailbox registration. Empty until FFA_RXTX_MAP succeeds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostMailbox {
    buffers: Option<HostBuffers>,
}

impl HostMailbox {
    pub const fn new() -> Self {
        Self { buffers: None }
    }

    pub fn is_mapped(&self) -> bool {
        self.buffers.is_some()
    }

    pub fn buffers(&self) -> Option<HostBuffers> {
        self.buffers
    }

    pub(crate) fn set(&mut self, buffers: HostBuffers) {
        self.buffers = Some(buffers);
    }

    pub(crate) fn clear(&mut self) -> Option<HostBuffers> {
        self.buffers.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostMemoryError {
    #[error("host range {phys:#x}+{len:#x} is not accessible")]
    Unmapped { phys: u64, len: usize },
}

/// Read access to host physical memory.
pub trait HostMemory {
    /// Copy `dst.len()` bytes starting at host physical address `phys`.
    fn read(&self, phys: u64, dst: &mut [u8]) -> Result<(), HostMemoryError>;
}

/// Host memory reachable at `va == pa` inside a fixed window.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMap {
    base: u64,
    size: u64,
}

impl IdentityMap {
    /// # Safety
    /// `base..base + size` must be mapped readable at the same virtual
    /// address for as long as this value is used.
    pub const unsafe fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }
}

impl HostMemory for IdentityMap {
    fn read(&self, phys: u64, dst: &mut [u8]) -> Result<(), HostMemoryError> {
        let err = HostMemoryError::Unmapped {
            phys,
            len: dst.len(),
        };
        let end = phys.checked_add(dst.len() as u64).ok_or(err)?;
        if phys < self.base || end > self.base.saturating_add(self.size) {
            return Err(err);
        }
        // SAFETY: the window is mapped at va == pa (see `new`).
        unsafe {
            core::ptr::copy_nonoverlapping(phys as usize as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    #[test]
    fn identity_map_reads_inside_window() {
        let mut page = Page([0; 4096]);
        page.0[..4].copy_from_slice(b"ffa!");
        let base = page.0.as_ptr() as u64;
        let mem = unsafe { IdentityMap::new(base, 4096) };

        let mut out = [0u8; 4];
        mem.read(base, &mut out).unwrap();
        assert_eq!(&out, b"ffa!");

        assert!(mem.read(base + 4094, &mut out).is_err());
        assert!(mem.read(base - 1, &mut out).is_err());
    }

    #[test]
    fn host_mailbox_lifecycle() {
        let mut mbox = HostMailbox::new();
        assert!(!mbox.is_mapped());
        let bufs = HostBuffers {
            tx_pa: 0x1000,
            rx_pa: 0x2000,
            nr_pages: 1,
        };
        mbox.set(bufs);
        assert_eq!(mbox.buffers(), Some(bufs));
        assert_eq!(mbox.clear(), Some(bufs));
        assert!(!mbox.is_mapped());
    }
}
