//! One-shot FF-A negotiation with the secure world.
//!
//! Runs once at boot, before the host can issue any FF-A call. Either
//! yields the proxy, or reports why FF-A is left disabled (the host then
//! sees no FF-A at all), or fails hard on a secure world that answers in a
//! way the proxy cannot work with.

use crate::config::{ConfigError, ProxyConfig};
use crate::ffa::mailbox::{HostMemory, HypMailbox, MailboxGeometry};
use crate::ffa::memory::HostStage2;
use crate::ffa::proxy::FfaProxy;
use crate::ffa::smc_forward::{call_regs, SecureWorld};
use crate::ffa::*;

/// What the secure world agreed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// FF-A version word reported by the secure world.
    pub version: u32,
    /// Minimum RX/TX buffer size, in bytes.
    pub min_rxtx_size: u64,
    pub geometry: MailboxGeometry,
}

/// Why the proxy stays out of the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    /// SMCCC older than v1.2 cannot carry FF-A arguments in x4-x7.
    SmcccTooOld(u32),
    /// No FF-A implementation answers at EL3.
    FfaNotSupported,
    /// The secure world needs buffers larger than a hypervisor page.
    RxtxGranule { min_size: u64, page_size: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("bad configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("FF-A version {found:#x} is incompatible (need {min:#x})")]
    Version { found: u32, min: u32 },
    #[error("FFA_ID_GET failed: {0:?}")]
    IdGet(Option<FfaError>),
    #[error("host FF-A id is {0:#x}, expected 0")]
    HostId(u64),
    #[error("FFA_FEATURES(RXTX_MAP) failed: {0:?}")]
    RxtxFeatures(Option<FfaError>),
    #[error("reserved RX/TX granule code {0}")]
    InvalidGranule(u64),
    #[error("staging buffers are {tx}/{rx} bytes at {tx_pa:#x}/{rx_pa:#x}, expected {expected} page-aligned bytes")]
    StagingBuffers {
        tx: usize,
        rx: usize,
        tx_pa: u64,
        rx_pa: u64,
        expected: u64,
    },
}

/// Outcome of a successful negotiation.
pub enum Negotiation<'a, S, T, M> {
    Enabled(FfaProxy<'a, S, T, M>),
    Disabled(DisabledReason),
}

impl<'a, S, T, M> Negotiation<'a, S, T, M> {
    pub fn proxy(&self) -> Option<&FfaProxy<'a, S, T, M>> {
        match self {
            Self::Enabled(proxy) => Some(proxy),
            Self::Disabled(_) => None,
        }
    }

    pub fn disabled_reason(&self) -> Option<DisabledReason> {
        match self {
            Self::Enabled(_) => None,
            Self::Disabled(reason) => Some(*reason),
        }
    }
}

fn min_rxtx_size(code: u64) -> Result<u64, InitError> {
    match code {
        FFA_FEAT_RXTX_MIN_SZ_4K => Ok(4 * 1024),
        FFA_FEAT_RXTX_MIN_SZ_16K => Ok(16 * 1024),
        FFA_FEAT_RXTX_MIN_SZ_64K => Ok(64 * 1024),
        _ => Err(InitError::InvalidGranule(code)),
    }
}

fn check_staging(mailbox: &HypMailbox<'_>, geometry: &MailboxGeometry) -> Result<(), InitError> {
    let expected = geometry.bytes();
    let tx = mailbox.tx().len();
    let rx = mailbox.rx().len();
    let (tx_pa, rx_pa) = (mailbox.tx_pa(), mailbox.rx_pa());
    let aligned = tx_pa % geometry.page_size == 0 && rx_pa % geometry.page_size == 0;
    let disjoint = tx_pa.abs_diff(rx_pa) >= expected;
    if tx as u64 != expected || rx as u64 != expected || !aligned || !disjoint {
        return Err(InitError::StagingBuffers {
            tx,
            rx,
            tx_pa,
            rx_pa,
            expected,
        });
    }
    Ok(())
}

/// Negotiate with the secure world and build the proxy.
///
/// `mailbox` must hold `config.mailbox_pages` pages per direction; it
/// becomes the staging pair registered with the SPMD on every host
/// FFA_RXTX_MAP.
///
/// The secure world must answer with major version 1 and a minor version
/// no older than `config.min_version`. A different major version is a
/// different ABI, whose descriptors this proxy cannot parse, so a newer
/// major is refused like an older one.
pub fn negotiate<'a, S, T, M>(
    config: &ProxyConfig,
    mut spmd: S,
    stage2: T,
    host_mem: M,
    mut mailbox: HypMailbox<'a>,
) -> Result<Negotiation<'a, S, T, M>, InitError>
where
    S: SecureWorld,
    T: HostStage2,
    M: HostMemory,
{
    config.validate()?;

    let res = call_regs(&mut spmd, &mut mailbox, SMCCC_VERSION, 0);
    let smccc = res.x0 as u32;
    if (smccc as i32) < 0 || smccc < SMCCC_VERSION_1_2 {
        log::info!("ffa: SMCCC {smccc:#x} predates v1.2, FF-A disabled");
        return Ok(Negotiation::Disabled(DisabledReason::SmcccTooOld(smccc)));
    }

    let res = call_regs(&mut spmd, &mut mailbox, FFA_VERSION, FFA_VERSION_1_0 as u64);
    if res.x0 as u32 as i32 == FFA_RET_NOT_SUPPORTED {
        log::info!("ffa: no FF-A at EL3, FF-A disabled");
        return Ok(Negotiation::Disabled(DisabledReason::FfaNotSupported));
    }
    let version = res.x0 as u32;
    if version & (1 << 31) != 0
        || version_major(version) != version_major(FFA_VERSION_1_0)
        || version < config.min_version
    {
        return Err(InitError::Version {
            found: version,
            min: config.min_version,
        });
    }

    let res = call_regs(&mut spmd, &mut mailbox, FFA_ID_GET, 0);
    res.status().map_err(InitError::IdGet)?;
    if res.x2 != HOST_FFA_ID as u64 {
        return Err(InitError::HostId(res.x2));
    }

    let res = call_regs(&mut spmd, &mut mailbox, FFA_FEATURES, FFA_RXTX_MAP_64);
    res.status().map_err(InitError::RxtxFeatures)?;
    let min_size = min_rxtx_size(res.x2 & FFA_FEAT_RXTX_MIN_SZ_MASK)?;
    if min_size > config.page_size {
        log::warn!(
            "ffa: RX/TX granule {min_size:#x} exceeds page size {:#x}, FF-A disabled",
            config.page_size
        );
        return Ok(Negotiation::Disabled(DisabledReason::RxtxGranule {
            min_size,
            page_size: config.page_size,
        }));
    }

    let geometry = config.geometry();
    check_staging(&mailbox, &geometry)?;

    log::info!(
        "ffa: proxy enabled, FF-A v{}.{}, {} page mailbox",
        version_major(version),
        version_minor(version),
        geometry.nr_pages
    );
    let caps = Capabilities {
        version,
        min_rxtx_size: min_size,
        geometry,
    };
    Ok(Negotiation::Enabled(FfaProxy::new(
        spmd, stage2, host_mem, mailbox, caps,
    )))
}
