//! Downstream transport to the secure world.
//!
//! From EL2, executing `smc #0` goes directly to EL3: `HCR_EL2.TSC` only
//! traps EL1 SMC to EL2, not EL2 SMC. The SPMD at EL3 relays FF-A calls to
//! the SPMC.

use crate::ffa::mailbox::HypMailbox;
use crate::ffa::{SmcArgs, SmcResult};

/// Synchronous call into the secure world.
///
/// `tx` and `rx` are the proxy's staging pair. A real SPMC reaches them
/// through the physical addresses registered with FFA_RXTX_MAP; an
/// in-memory implementation reads descriptors from `tx` and writes
/// retrieve responses into `rx`.
pub trait SecureWorld {
    fn call(&mut self, args: SmcArgs, tx: &[u8], rx: &mut [u8]) -> SmcResult;
}

/// Issue a call with no mailbox payload (version, features, id queries).
pub(crate) fn call_regs<S: SecureWorld>(
    spmd: &mut S,
    mailbox: &mut HypMailbox<'_>,
    function_id: u64,
    x1: u64,
) -> SmcResult {
    let (tx, rx) = mailbox.buffers_mut();
    spmd.call(SmcArgs::new(function_id, x1, 0, 0, 0), tx, rx)
}

/// SMC conduit to EL3.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default)]
pub struct SmcConduit;

#[cfg(target_arch = "aarch64")]
impl SecureWorld for SmcConduit {
    fn call(&mut self, args: SmcArgs, _tx: &[u8], _rx: &mut [u8]) -> SmcResult {
        forward_smc(args)
    }
}

/// Execute `smc #0` with x0-x7 from `args`, returning x0-x3.
///
/// Not `nomem`: the secure world reads and writes the staging buffers.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub fn forward_smc(args: SmcArgs) -> SmcResult {
    let r0: u64;
    let r1: u64;
    let r2: u64;
    let r3: u64;
    // SAFETY: SMCCC call; the callee preserves x18-x30 and sp.
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") args.x0 => r0,
            inout("x1") args.x1 => r1,
            inout("x2") args.x2 => r2,
            inout("x3") args.x3 => r3,
            // x4-x17 may be clobbered by the SMC call per SMCCC
            inout("x4") args.x4 => _,
            inout("x5") args.x5 => _,
            inout("x6") args.x6 => _,
            inout("x7") args.x7 => _,
            lateout("x8") _,
            lateout("x9") _,
            lateout("x10") _,
            lateout("x11") _,
            lateout("x12") _,
            lateout("x13") _,
            lateout("x14") _,
            lateout("x15") _,
            lateout("x16") _,
            lateout("x17") _,
            options(nostack),
        );
    }
    SmcResult {
        x0: r0,
        x1: r1,
        x2: r2,
        x3: r3,
    }
}
