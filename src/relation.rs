//! Tuples, relations and materialized join rows.

/// Join key. 32-bit unless the `key-8b` feature is enabled.
#[cfg(not(feature = "key-8b"))]
pub type Key = u32;
#[cfg(feature = "key-8b")]
pub type Key = u64;

/// Tuple payload, same width as [`Key`].
#[cfg(not(feature = "key-8b"))]
pub type Payload = u32;
#[cfg(feature = "key-8b")]
pub type Payload = u64;

/// Number of bits in a [`Key`].
pub const KEY_BITS: u32 = Key::BITS;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Tuple {
    pub key: Key,
    pub payload: Payload,
}

impl Tuple {
    #[inline(always)]
    pub const fn new(key: Key, payload: Payload) -> Self {
        Self { key, payload }
    }
}

/// An owned relation. The engine only ever borrows relations handed to it;
/// this type is a convenience for callers and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Relation {
    tuples: Vec<Tuple>,
}

impl Relation {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self { tuples }
    }

    /// Builds a relation whose payload is the tuple's position.
    ///
    /// Positions wrap modulo `2^Payload::BITS`, so relations of more than
    /// 2^32 tuples repeat payloads unless built with `key-8b`.
    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        let tuples = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| Tuple::new(key, position_payload(i)))
            .collect();
        Self { tuples }
    }

    pub fn count(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn into_tuples(self) -> Vec<Tuple> {
        self.tuples
    }
}

impl From<Vec<Tuple>> for Relation {
    fn from(tuples: Vec<Tuple>) -> Self {
        Self { tuples }
    }
}

impl AsRef<[Tuple]> for Relation {
    fn as_ref(&self) -> &[Tuple] {
        &self.tuples
    }
}

/// Payload for the tuple at position `i`, wrapping to the payload width.
fn position_payload(i: usize) -> Payload {
    (i as u64 & Payload::MAX as u64) as Payload
}

/// One materialized match.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinRow {
    pub key: Key,
    pub r_payload: Payload,
    pub s_payload: Payload,
}
