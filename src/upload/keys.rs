use slotmap::{Key, KeyData, new_key_type};

new_key_type! { pub(crate) struct TransactionKey; }

/// Opaque handle to one upload or creation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);

    pub fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn key(self) -> TransactionKey {
        TransactionKey::from(KeyData::from_ffi(self.0))
    }
}

impl From<TransactionKey> for TransactionId {
    fn from(key: TransactionKey) -> Self {
        TransactionId(key.data().as_ffi())
    }
}

/// Sequence number of a published reposition event list. Zero means "none".
pub type EventListId = u32;

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    #[test]
    fn ids_round_trip_through_keys() {
        let mut map: SlotMap<TransactionKey, ()> = SlotMap::with_key();
        let key = map.insert(());
        let id = TransactionId::from(key);
        assert_ne!(id, TransactionId::INVALID);
        assert_eq!(id.key(), key);
        assert!(map.get(TransactionId::INVALID.key()).is_none());
    }
}
