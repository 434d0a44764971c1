//! Random identifier generation.

use rand::Rng;

/// Alphabet without easily confused characters (no 0/O, 1/l/I, ...).
const UNMISTAKABLE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// Generate a random identifier of `len` characters.
///
/// Drawn from the thread-local CSPRNG, so ids of different connections are
/// unrelated.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| UNMISTAKABLE_CHARS[rng.gen_range(0..UNMISTAKABLE_CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_id_format() {
        let id = random_id(17);
        assert_eq!(id.len(), 17);
        assert!(id.bytes().all(|b| UNMISTAKABLE_CHARS.contains(&b)), "{}", id);
    }

    #[test]
    fn test_random_ids_do_not_repeat() {
        let ids: HashSet<String> = (0..1000).map(|_| random_id(17)).collect();
        assert_eq!(ids.len(), 1000);
    }
}
