//! Opaque addresses within a managed space.

use std::fmt;

use serde::Serialize;

/// Raw sentinel meaning "no block" in stored link fields.
///
/// Never crosses a public seam; links travel as `Option<Address>` everywhere
/// and the raw value survives only inside the embedded store's byte
/// encoding.
pub(crate) const NULL_LINK: u64 = u64::MAX;

/// Offset of a block within a managed address space.
///
/// Addresses are opaque 64-bit offsets, not pointers: the same manager can
/// run over real memory offsets or purely logical slot numbers. The newtype
/// keeps address arithmetic from mixing with ordinary sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address(u64);

impl Address {
    /// Wraps a raw offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// Address `delta` bytes forward.
    pub(crate) const fn forward(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// Address `delta` bytes backward.
    pub(crate) const fn backward(self, delta: u64) -> Self {
        Self(self.0 - delta)
    }

    /// Encodes an optional link for storage in a metadata field.
    pub(crate) fn encode_link(link: Option<Self>) -> u64 {
        link.map_or(NULL_LINK, |addr| addr.0)
    }

    /// Decodes a stored metadata field back into an optional link.
    pub(crate) fn decode_link(raw: u64) -> Option<Self> {
        (raw != NULL_LINK).then_some(Self(raw))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_roundtrip() {
        let addr = Address::new(0x1234);
        assert_eq!(addr.offset(), 0x1234);
        assert_eq!(addr.forward(0x10).offset(), 0x1244);
        assert_eq!(addr.backward(0x4).offset(), 0x1230);
    }

    #[test]
    fn test_link_encoding() {
        assert_eq!(Address::encode_link(None), NULL_LINK);
        assert_eq!(Address::encode_link(Some(Address::new(42))), 42);
        assert_eq!(Address::decode_link(NULL_LINK), None);
        assert_eq!(Address::decode_link(42), Some(Address::new(42)));
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(Address::new(256).to_string(), "0x100");
    }
}
