//! Molt default hash functions.
//!
//! Method tokens are the stable identity of a transformed method: they key
//! the frame-descriptor catalog and the entry-point registry, and they are
//! what a serialized continuation carries across process boundaries. All
//! functions here are bitwise-deterministic on every platform; nothing
//! depends on the standard library's randomized hashing.

/// FNV-1a 32-bit offset basis.
const FNV_OFFSET: u32 = 0x811C_9DC5;
/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes the 32-bit FNV-1a hash of a byte slice, reinterpreted as `i32`.
pub fn fnv1a(bytes: &[u8]) -> i32 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i32
}

/// Mixes a sequence of integer hashes into one: `h = (h * 33) ^ x`, seeded
/// with 17. An empty sequence yields 0, not the seed.
pub fn combine<I>(values: I) -> i32
where
    I: IntoIterator<Item = i32>,
{
    let mut iter = values.into_iter();
    let first = match iter.next() {
        Some(x) => x,
        None => return 0,
    };
    let mut hash = 17i32.wrapping_mul(33) ^ first;
    for x in iter {
        hash = hash.wrapping_mul(33) ^ x;
    }
    hash
}

/// Derives the stable method token for `(type, method, param types…)`.
///
/// Two independent builds of the same assembly produce identical tokens; the
/// token is how a restored continuation finds its way back to the right
/// method body.
pub fn method_token<'a, I>(type_name: &str, method_name: &str, param_type_names: I) -> i32
where
    I: IntoIterator<Item = &'a str>,
{
    let hashes = [fnv1a(type_name.as_bytes()), fnv1a(method_name.as_bytes())]
        .into_iter()
        .chain(param_type_names.into_iter().map(|p| fnv1a(p.as_bytes())));
    combine(hashes)
}
