//! Key slicing.
//!
//! A key is consumed eight bytes per layer. Each layer orders its entries by
//! `(ikey, class)`: the next eight bytes as a zero-padded big-endian `u64`,
//! then the number of those bytes actually present (`0..=8`), or [`LAYER`]
//! when more bytes follow and the entry links to the next layer down.
//! Within a layer that order equals byte-lexicographic order of the
//! remaining key bytes.

/// Bytes consumed by one layer.
pub(crate) const SLICE_LEN: usize = 8;

/// Length class of an entry whose value is a link to the next layer.
pub(crate) const LAYER: u8 = 9;

/// Splits the head of `rest` into its slice and length class.
pub(crate) fn slice_of(rest: &[u8]) -> (u64, u8) {
    let take = rest.len().min(SLICE_LEN);
    let mut buf = [0u8; SLICE_LEN];
    buf[..take].copy_from_slice(&rest[..take]);
    let class = if rest.len() > SLICE_LEN {
        LAYER
    } else {
        take as u8
    };
    (u64::from_be_bytes(buf), class)
}

/// A key positioned at one layer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Key<'a> {
    full: &'a [u8],
    offset: usize,
}

impl<'a> Key<'a> {
    pub(crate) fn new(full: &'a [u8]) -> Self {
        Self { full, offset: 0 }
    }

    /// Bytes from the current layer on.
    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.full[self.offset..]
    }

    pub(crate) fn ikey(&self) -> u64 {
        slice_of(self.rest()).0
    }

    pub(crate) fn class(&self) -> u8 {
        slice_of(self.rest()).1
    }

    /// Whether the key continues below the current layer.
    pub(crate) fn has_suffix(&self) -> bool {
        self.rest().len() > SLICE_LEN
    }

    /// Moves one layer down.
    pub(crate) fn shift(&mut self) {
        debug_assert!(self.has_suffix());
        self.offset += SLICE_LEN;
    }
}

/// Rebuilds the bytes a `(ikey, class)` entry contributes to a key.
pub(crate) fn push_slice(out: &mut Vec<u8>, ikey: u64, class: u8) {
    let bytes = ikey.to_be_bytes();
    let len = usize::from(class.min(SLICE_LEN as u8));
    out.extend_from_slice(&bytes[..len]);
}

/// Order-preserving byte encoding for callers that key the table by integers.
///
/// The table compares raw bytes; encoding integers big-endian makes that
/// comparison agree with numeric order.
pub trait KeyCodec: Sized {
    /// Appends the encoded form of `key` to `out`.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Decodes a key previously produced by [`KeyCodec::encode_key`].
    fn decode_key(bytes: &[u8]) -> Option<Self>;
}

macro_rules! big_endian_codec {
    ($($ty:ty),*) => {$(
        impl KeyCodec for $ty {
            fn encode_key(key: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&key.to_be_bytes());
            }

            fn decode_key(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$ty>::from_be_bytes)
            }
        }
    )*};
}

big_endian_codec!(u16, u32, u64, u128);
