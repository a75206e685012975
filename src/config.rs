//! Proxy configuration.
//!
//! Built-in defaults, optionally overridden by a `pkvm,ffa-proxy` node in
//! the flattened device tree handed over at boot:
//!
//! ```text
//! ffa-proxy {
//!     compatible = "pkvm,ffa-proxy";
//!     mailbox-pages = <1>;
//!     min-ffa-version = <0x10000>;
//! };
//! ```
//!
//! The `fdt` crate does zero-copy parsing, no heap allocation needed.

use crate::ffa::mailbox::MailboxGeometry;
use crate::ffa::{version_major, FFA_PAGE_SIZE, FFA_VERSION_1_0};

pub const COMPATIBLE: &str = "pkvm,ffa-proxy";
pub const PROP_MAILBOX_PAGES: &str = "mailbox-pages";
pub const PROP_MIN_VERSION: &str = "min-ffa-version";

/// Upper bound on the mailbox size, in hypervisor pages.
pub const MAX_MAILBOX_PAGES: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed device tree: {0:?}")]
    Fdt(fdt::FdtError),
    #[error("property {0} is not a 32-bit cell")]
    BadProperty(&'static str),
    #[error("page size {0:#x} is not a power of two of at least 4K")]
    PageSize(u64),
    #[error("mailbox of {0} pages is not supported")]
    MailboxPages(u64),
    #[error("invalid FF-A version word {0:#x}")]
    Version(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Hypervisor page size in bytes.
    pub page_size: u64,
    /// Size of each mailbox buffer, in hypervisor pages.
    pub mailbox_pages: u64,
    /// Oldest FF-A version the secure world may report.
    pub min_version: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            mailbox_pages: 1,
            min_version: FFA_VERSION_1_0,
        }
    }
}

impl ProxyConfig {
    /// Defaults overridden by the proxy node of `blob`, if there is one.
    pub fn from_fdt(blob: &[u8]) -> Result<Self, ConfigError> {
        let fdt = fdt::Fdt::new(blob).map_err(ConfigError::Fdt)?;
        let mut config = Self::default();

        let Some(node) = fdt.find_compatible(&[COMPATIBLE]) else {
            log::debug!("config: no {COMPATIBLE} node, using defaults");
            return Ok(config);
        };
        if let Some(pages) = node.property(PROP_MAILBOX_PAGES) {
            config.mailbox_pages = read_cell(pages.value, PROP_MAILBOX_PAGES)? as u64;
        }
        if let Some(version) = node.property(PROP_MIN_VERSION) {
            config.min_version = read_cell(version.value, PROP_MIN_VERSION)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || self.page_size < FFA_PAGE_SIZE {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.mailbox_pages == 0 || self.mailbox_pages > MAX_MAILBOX_PAGES {
            return Err(ConfigError::MailboxPages(self.mailbox_pages));
        }
        if self.min_version & (1 << 31) != 0 || version_major(self.min_version) == 0 {
            return Err(ConfigError::Version(self.min_version));
        }
        Ok(())
    }

    pub fn geometry(&self) -> MailboxGeometry {
        MailboxGeometry {
            page_size: self.page_size,
            nr_pages: self.mailbox_pages,
        }
    }
}

fn read_cell(value: &[u8], name: &'static str) -> Result<u32, ConfigError> {
    let cell: [u8; 4] = value.try_into().map_err(|_| ConfigError::BadProperty(name))?;
    Ok(u32::from_be_bytes(cell))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FDT_BEGIN_NODE: u32 = 1;
    const FDT_END_NODE: u32 = 2;
    const FDT_PROP: u32 = 3;
    const FDT_END: u32 = 9;

    /// Minimal DTB: a root node and, if `node` is set, one child carrying
    /// `compatible = node` plus `cells`.
    fn build_dtb(node: Option<&str>, cells: &[(&str, &[u8])]) -> Vec<u8> {
        let mut strings: Vec<u8> = Vec::new();
        let mut st: Vec<u8> = Vec::new();

        fn word(buf: &mut Vec<u8>, v: u32) {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        fn padded(buf: &mut Vec<u8>, bytes: &[u8]) {
            buf.extend_from_slice(bytes);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        let mut prop = |st: &mut Vec<u8>, name: &str, value: &[u8]| {
            let nameoff = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            word(st, FDT_PROP);
            word(st, value.len() as u32);
            word(st, nameoff);
            padded(st, value);
        };

        word(&mut st, FDT_BEGIN_NODE);
        padded(&mut st, b"\0");
        prop(&mut st, "#address-cells", &2u32.to_be_bytes());
        prop(&mut st, "#size-cells", &2u32.to_be_bytes());
        if let Some(compatible) = node {
            word(&mut st, FDT_BEGIN_NODE);
            padded(&mut st, b"ffa-proxy\0");
            let mut value = compatible.as_bytes().to_vec();
            value.push(0);
            prop(&mut st, "compatible", &value);
            for (name, value) in cells {
                prop(&mut st, name, value);
            }
            word(&mut st, FDT_END_NODE);
        }
        word(&mut st, FDT_END_NODE);
        word(&mut st, FDT_END);

        let off_rsvmap = 40u32;
        let off_struct = off_rsvmap + 16;
        let off_strings = off_struct + st.len() as u32;
        let total = off_strings + strings.len() as u32;

        let mut blob = Vec::new();
        for v in [
            0xD00D_FEED,
            total,
            off_struct,
            off_strings,
            off_rsvmap,
            17,
            16,
            0,
            strings.len() as u32,
            st.len() as u32,
        ] {
            word(&mut blob, v);
        }
        blob.extend_from_slice(&[0; 16]);
        blob.extend_from_slice(&st);
        blob.extend_from_slice(&strings);
        blob
    }

    #[test]
    fn defaults_without_node() {
        let blob = build_dtb(None, &[]);
        assert_eq!(ProxyConfig::from_fdt(&blob).unwrap(), ProxyConfig::default());
    }

    #[test]
    fn node_overrides_defaults() {
        let blob = build_dtb(
            Some(COMPATIBLE),
            &[
                (PROP_MAILBOX_PAGES, &4u32.to_be_bytes()),
                (PROP_MIN_VERSION, &0x1_0001u32.to_be_bytes()),
            ],
        );
        let config = ProxyConfig::from_fdt(&blob).unwrap();
        assert_eq!(config.mailbox_pages, 4);
        assert_eq!(config.min_version, 0x1_0001);
        assert_eq!(config.geometry().ffa_pages(), 4);
    }

    #[test]
    fn other_compatible_is_ignored() {
        let blob = build_dtb(Some("arm,pl011"), &[(PROP_MAILBOX_PAGES, &4u32.to_be_bytes())]);
        assert_eq!(ProxyConfig::from_fdt(&blob).unwrap().mailbox_pages, 1);
    }

    #[test]
    fn rejects_bad_values() {
        let zero = build_dtb(Some(COMPATIBLE), &[(PROP_MAILBOX_PAGES, &0u32.to_be_bytes())]);
        assert!(matches!(ProxyConfig::from_fdt(&zero), Err(ConfigError::MailboxPages(0))));

        let wide = build_dtb(Some(COMPATIBLE), &[(PROP_MAILBOX_PAGES, &1u64.to_be_bytes())]);
        assert!(matches!(ProxyConfig::from_fdt(&wide), Err(ConfigError::BadProperty(_))));

        assert!(matches!(ProxyConfig::from_fdt(&[0u8; 8]), Err(ConfigError::Fdt(_))));
    }

    #[test]
    fn page_geometry() {
        let config = ProxyConfig::default().with_page_size(16384);
        config.validate().unwrap();
        assert_eq!(config.geometry().ffa_pages(), 4);
        assert!(ProxyConfig::default().with_page_size(6000).validate().is_err());
    }
}
