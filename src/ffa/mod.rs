//! FF-A v1.0 memory-sharing proxy.
//!
//! Sits between the untrusted host and the SPMD/SPMC at EL3. Every call in
//! the FF-A range issued by the host is either forwarded unmodified,
//! rejected as unsupported, or checked against the host's page ownership,
//! applied locally and then reissued to the secure world. Operations that
//! touch the RX/TX buffers are serialized under a single lock so the local
//! page-table updates can be rolled back if the secure world refuses the
//! call.

pub mod descriptors;
pub mod init;
pub mod mailbox;
pub mod memory;
pub mod proxy;
pub mod smc_forward;
pub mod stub_spmc;
pub mod validate;

// ── SMCCC function id encoding ───────────────────────────────────────

pub const SMCCC_FAST_CALL: u64 = 1 << 31;
pub const SMCCC_SMC64: u64 = 1 << 30;
pub const SMCCC_OWNER_SHIFT: u64 = 24;
pub const SMCCC_OWNER_MASK: u64 = 0x3F;
pub const SMCCC_OWNER_STANDARD: u64 = 4;
pub const SMCCC_FUNC_MASK: u64 = 0xFFFF;

/// SMCCC_VERSION (Arm architecture call).
pub const SMCCC_VERSION: u64 = 0x8000_0000;
/// SMCCC v1.2, the first revision allowing x4-x17 as FF-A arguments.
pub const SMCCC_VERSION_1_2: u32 = 0x0001_0002;

/// Lowest and highest function number owned by FF-A.
pub const FFA_MIN_FUNC_NUM: u64 = 0x60;
pub const FFA_MAX_FUNC_NUM: u64 = 0x7F;

const fn smc32(num: u64) -> u64 {
    SMCCC_FAST_CALL | (SMCCC_OWNER_STANDARD << SMCCC_OWNER_SHIFT) | num
}

const fn smc64(num: u64) -> u64 {
    smc32(num) | SMCCC_SMC64
}

// ── FF-A function ids ────────────────────────────────────────────────

pub const FFA_ERROR: u64 = smc32(0x60);
pub const FFA_SUCCESS_32: u64 = smc32(0x61);
pub const FFA_SUCCESS_64: u64 = smc64(0x61);
pub const FFA_VERSION: u64 = smc32(0x63);
pub const FFA_FEATURES: u64 = smc32(0x64);
pub const FFA_RX_RELEASE: u64 = smc32(0x65);
pub const FFA_RXTX_MAP_32: u64 = smc32(0x66);
pub const FFA_RXTX_MAP_64: u64 = smc64(0x66);
pub const FFA_RXTX_UNMAP: u64 = smc32(0x67);
pub const FFA_PARTITION_INFO_GET: u64 = smc32(0x68);
pub const FFA_ID_GET: u64 = smc32(0x69);
pub const FFA_MSG_POLL: u64 = smc32(0x6A);
pub const FFA_MSG_WAIT: u64 = smc32(0x6B);
pub const FFA_MSG_SEND: u64 = smc32(0x6E);
pub const FFA_MSG_SEND_DIRECT_REQ_32: u64 = smc32(0x6F);
pub const FFA_MSG_SEND_DIRECT_REQ_64: u64 = smc64(0x6F);
pub const FFA_MSG_SEND_DIRECT_RESP_32: u64 = smc32(0x70);
pub const FFA_MSG_SEND_DIRECT_RESP_64: u64 = smc64(0x70);
pub const FFA_MEM_DONATE_32: u64 = smc32(0x71);
pub const FFA_MEM_DONATE_64: u64 = smc64(0x71);
pub const FFA_MEM_LEND_32: u64 = smc32(0x72);
pub const FFA_MEM_LEND_64: u64 = smc64(0x72);
pub const FFA_MEM_SHARE_32: u64 = smc32(0x73);
pub const FFA_MEM_SHARE_64: u64 = smc64(0x73);
pub const FFA_MEM_RETRIEVE_REQ_32: u64 = smc32(0x74);
pub const FFA_MEM_RETRIEVE_REQ_64: u64 = smc64(0x74);
pub const FFA_MEM_RETRIEVE_RESP: u64 = smc32(0x75);
pub const FFA_MEM_RELINQUISH: u64 = smc32(0x76);
pub const FFA_MEM_RECLAIM: u64 = smc32(0x77);
pub const FFA_MEM_OP_PAUSE: u64 = smc32(0x78);
pub const FFA_MEM_OP_RESUME: u64 = smc32(0x79);
pub const FFA_MEM_FRAG_RX: u64 = smc32(0x7A);
pub const FFA_MEM_FRAG_TX: u64 = smc32(0x7B);

// ── Versions, ids, sizes ─────────────────────────────────────────────

pub const FFA_VERSION_MAJOR_SHIFT: u32 = 16;
pub const FFA_VERSION_MAJOR_MASK: u32 = 0x7FFF;
pub const FFA_VERSION_MINOR_MASK: u32 = 0xFFFF;
pub const FFA_VERSION_1_0: u32 = 1 << FFA_VERSION_MAJOR_SHIFT;
pub const FFA_VERSION_1_1: u32 = (1 << FFA_VERSION_MAJOR_SHIFT) | 1;

/// "ID value 0 must be returned at the Non-secure physical FF-A instance."
/// The proxy shares this id with the host.
pub const HOST_FFA_ID: u16 = 0;

/// FF-A always counts memory in 4KB pages, whatever the translation granule.
pub const FFA_PAGE_SIZE: u64 = 4096;

/// RXTX_MAP feature property: minimum buffer size and alignment.
pub const FFA_FEAT_RXTX_MIN_SZ_MASK: u64 = 0x3;
pub const FFA_FEAT_RXTX_MIN_SZ_4K: u64 = 0;
pub const FFA_FEAT_RXTX_MIN_SZ_64K: u64 = 1;
pub const FFA_FEAT_RXTX_MIN_SZ_16K: u64 = 2;

// ── Error codes ──────────────────────────────────────────────────────

pub const FFA_RET_SUCCESS: i32 = 0;
pub const FFA_RET_NOT_SUPPORTED: i32 = -1;
pub const FFA_RET_INVALID_PARAMETERS: i32 = -2;
pub const FFA_RET_NO_MEMORY: i32 = -3;
pub const FFA_RET_BUSY: i32 = -4;
pub const FFA_RET_INTERRUPTED: i32 = -5;
pub const FFA_RET_DENIED: i32 = -6;
pub const FFA_RET_RETRY: i32 = -7;
pub const FFA_RET_ABORTED: i32 = -8;

/// FF-A status codes the proxy can produce or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FfaError {
    #[error("not supported")]
    NotSupported,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("no memory")]
    NoMemory,
    #[error("busy")]
    Busy,
    #[error("interrupted")]
    Interrupted,
    #[error("denied")]
    Denied,
    #[error("retry")]
    Retry,
    #[error("aborted")]
    Aborted,
}

impl FfaError {
    /// Wire value carried in w2 of an FFA_ERROR return.
    pub const fn code(self) -> i32 {
        match self {
            Self::NotSupported => FFA_RET_NOT_SUPPORTED,
            Self::InvalidParameters => FFA_RET_INVALID_PARAMETERS,
            Self::NoMemory => FFA_RET_NO_MEMORY,
            Self::Busy => FFA_RET_BUSY,
            Self::Interrupted => FFA_RET_INTERRUPTED,
            Self::Denied => FFA_RET_DENIED,
            Self::Retry => FFA_RET_RETRY,
            Self::Aborted => FFA_RET_ABORTED,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            FFA_RET_NOT_SUPPORTED => Self::NotSupported,
            FFA_RET_INVALID_PARAMETERS => Self::InvalidParameters,
            FFA_RET_NO_MEMORY => Self::NoMemory,
            FFA_RET_BUSY => Self::Busy,
            FFA_RET_INTERRUPTED => Self::Interrupted,
            FFA_RET_DENIED => Self::Denied,
            FFA_RET_RETRY => Self::Retry,
            FFA_RET_ABORTED => Self::Aborted,
            _ => return None,
        })
    }

    /// Encode as an FFA_ERROR return.
    pub const fn into_result(self) -> SmcResult {
        SmcResult::error(self.code())
    }
}

// ── Register frames ──────────────────────────────────────────────────

/// Arguments of an SMCCC call (x0 = function id, x1-x7 = parameters).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SmcArgs {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
}

impl SmcArgs {
    /// Build a call with up to four parameters; x5-x7 are zero.
    pub const fn new(function_id: u64, x1: u64, x2: u64, x3: u64, x4: u64) -> Self {
        Self {
            x0: function_id,
            x1,
            x2,
            x3,
            x4,
            x5: 0,
            x6: 0,
            x7: 0,
        }
    }

    pub const fn function_id(&self) -> u64 {
        self.x0
    }
}

/// Result of an SMCCC call (x0-x3).
///
/// x0 = status tag, x1 = reserved or target info, x2 = error code or
/// property word, x3 = reserved or handle high half.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SmcResult {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
}

impl SmcResult {
    pub const fn success(prop: u64) -> Self {
        Self {
            x0: FFA_SUCCESS_32,
            x1: 0,
            x2: prop,
            x3: 0,
        }
    }

    /// FF-A error codes are 32-bit signed values in w2, not sign-extended.
    pub const fn error(code: i32) -> Self {
        Self {
            x0: FFA_ERROR,
            x1: 0,
            x2: code as u32 as u64,
            x3: 0,
        }
    }

    pub const fn is_success(&self) -> bool {
        self.x0 == FFA_SUCCESS_32 || self.x0 == FFA_SUCCESS_64
    }

    /// Status code of this result, reading w2 of an FFA_ERROR return.
    ///
    /// Returns `Ok(())` for FFA_SUCCESS and `Err(None)` for any other tag.
    pub fn status(&self) -> Result<(), Option<FfaError>> {
        if self.is_success() {
            Ok(())
        } else if self.x0 == FFA_ERROR {
            Err(FfaError::from_code(self.x2 as u32 as i32))
        } else {
            Err(None)
        }
    }

    /// The w2 error code of an FFA_ERROR return, or SUCCESS otherwise.
    pub fn error_code(&self) -> i32 {
        if self.x0 == FFA_ERROR {
            self.x2 as u32 as i32
        } else {
            FFA_RET_SUCCESS
        }
    }
}

impl From<FfaError> for SmcResult {
    fn from(err: FfaError) -> Self {
        err.into_result()
    }
}

impl From<Result<u64, FfaError>> for SmcResult {
    fn from(result: Result<u64, FfaError>) -> Self {
        match result {
            Ok(prop) => Self::success(prop),
            Err(err) => err.into_result(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// True for fast calls owned by the standard secure service in the FF-A range.
pub const fn is_ffa_call(function_id: u64) -> bool {
    let num = function_id & SMCCC_FUNC_MASK;
    function_id & SMCCC_FAST_CALL != 0
        && (function_id >> SMCCC_OWNER_SHIFT) & SMCCC_OWNER_MASK == SMCCC_OWNER_STANDARD
        && num >= FFA_MIN_FUNC_NUM
        && num <= FFA_MAX_FUNC_NUM
}

pub const fn version_major(version: u32) -> u32 {
    (version >> FFA_VERSION_MAJOR_SHIFT) & FFA_VERSION_MAJOR_MASK
}

pub const fn version_minor(version: u32) -> u32 {
    version & FFA_VERSION_MINOR_MASK
}

/// Join the two 32-bit halves a memory handle travels in.
pub const fn pack_handle(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Split a memory handle into (low, high) 32-bit halves.
pub const fn unpack_handle(handle: u64) -> (u32, u32) {
    (handle as u32, (handle >> 32) as u32)
}
