//! Proptest generators for property-based testing.

use proptest::prelude::*;

use asap_core::{Era, PeerId};

/// Generate any era, wrap-around values included.
pub fn era() -> impl Strategy<Value = Era> {
    prop_oneof![
        Just(Era::ZERO),
        Just(Era::MAX),
        any::<u32>().prop_map(Era::new),
    ]
}

/// Generate a short lowercase peer identity.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    "[a-z]{1,8}".prop_map(PeerId::from)
}

/// Generate a channel URI, including characters that need escaping on disk.
pub fn channel_uri() -> impl Strategy<Value = String> {
    "[a-z]{1,6}(/[a-z0-9:?|%]{1,6}){0,3}".prop_map(|path| format!("sn2://{path}"))
}

/// Generate one message, possibly empty.
pub fn message(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a batch of messages.
pub fn messages(max_count: usize, max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(message(max_len), 0..=max_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_store::{escape_uri, unescape_uri, ChunkStorage};

    proptest! {
        #[test]
        fn test_chunk_replays_messages(batch in messages(16, 32)) {
            let storage = ChunkStorage::in_memory();
            let mut chunk = storage.get_chunk("sn2://p", Era::ZERO).unwrap();
            for m in &batch {
                chunk.add_message(m).unwrap();
            }

            let replayed: Vec<Vec<u8>> = storage
                .existing_chunk("sn2://p", Era::ZERO)
                .unwrap()
                .unwrap()
                .messages()
                .unwrap()
                .map(|m| m.to_vec())
                .collect();
            prop_assert_eq!(replayed, batch);
        }

        #[test]
        fn test_block_append_matches_single_appends(
            first in messages(8, 16),
            second in messages(8, 16),
        ) {
            prop_assume!(!second.is_empty());
            let storage = ChunkStorage::in_memory();

            let mut single = storage.get_chunk("sn2://single", Era::ZERO).unwrap();
            for m in first.iter().chain(second.iter()) {
                single.add_message(m).unwrap();
            }

            let mut block = storage.get_chunk("sn2://block", Era::ZERO).unwrap();
            for m in &first {
                block.add_message(m).unwrap();
            }
            let mut content = Vec::new();
            let mut offsets = Vec::new();
            for (i, m) in second.iter().enumerate() {
                if i > 0 {
                    offsets.push(content.len() as u64);
                }
                content.extend_from_slice(m);
            }
            block.add_messages(&content, &offsets).unwrap();

            let a: Vec<_> = single.messages().unwrap().collect();
            let b: Vec<_> = block.messages().unwrap().collect();
            prop_assert_eq!(a, b);
            prop_assert_eq!(single.offsets(), block.offsets());
        }

        #[test]
        fn test_uri_escape_is_single_component(uri in channel_uri()) {
            let escaped = escape_uri(&uri);
            prop_assert!(!escaped.contains('/'));
            prop_assert!(!escaped.contains(':'));
            prop_assert_eq!(unescape_uri(&escaped), uri);
        }

        #[test]
        fn test_era_range_ends_at_last(start in era(), steps in 0u32..64) {
            let end = Era::new(start.value().wrapping_add(steps));
            let walked: Vec<Era> = start.through(end).collect();
            prop_assert_eq!(walked.len(), steps as usize + 1);
            prop_assert_eq!(walked.last().copied(), Some(end));
            prop_assert_eq!(end.back(steps), start);
        }

        #[test]
        fn test_peer_ids_nonempty(peer in peer_id()) {
            prop_assert!(!peer.as_str().is_empty());
        }
    }
}
