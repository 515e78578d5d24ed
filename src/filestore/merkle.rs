//! Merkle root over fixed-size content chunks

use crate::digest;

/// Chunk size used for upload merkle roots (64KB)
pub const MERKLE_CHUNK_SIZE: usize = 64 * 1024;

/// Hex merkle root of `data` split into `chunk_size` chunks
///
/// Leaves are the SHA-256 of each chunk. Each level hashes the concatenated
/// hex of adjacent pairs; an odd last node is paired with itself. Empty data
/// has the hash of the empty string as its root.
pub fn merkle_root(data: &[u8], chunk_size: usize) -> String {
    let chunk_size = chunk_size.max(1);
    let mut level: Vec<String> = data.chunks(chunk_size).map(digest::hash).collect();
    if level.is_empty() {
        return digest::hash(b"");
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                digest::hash(format!("{}{}", pair[0], right))
            })
            .collect();
    }
    level.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_root_is_leaf() {
        assert_eq!(merkle_root(b"hello", 64), digest::hash(b"hello"));
    }

    #[test]
    fn test_odd_leaf_is_duplicated() {
        let a = digest::hash(b"aa");
        let b = digest::hash(b"bb");
        let c = digest::hash(b"cc");
        let ab = digest::hash(format!("{}{}", a, b));
        let cc = digest::hash(format!("{}{}", c, c));
        let expected = digest::hash(format!("{}{}", ab, cc));
        assert_eq!(merkle_root(b"aabbcc", 2), expected);
    }

    #[test]
    fn test_any_chunk_change_changes_root() {
        let data = vec![7u8; 10 * 1024];
        let mut tampered = data.clone();
        tampered[9000] = 8;
        assert_ne!(merkle_root(&data, 1024), merkle_root(&tampered, 1024));
    }
}
