//! Command hashing.  The build log records a 64-bit hash of each executed
//! command; comparing against it on later runs detects command-line changes.

use std::hash::Hasher;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hash(pub u64);

const UNIT_SEPARATOR: u8 = 0x1F;

/// Hash a fully-expanded command line.  Response file content is mixed in so
/// that editing rspfile_content reruns the command even though the command
/// line itself is unchanged.  DefaultHasher is unkeyed when constructed with
/// new(), so the value is reproducible across runs.
pub fn hash_command(cmdline: &str, rspfile_content: Option<&str>) -> Hash {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    h.write(cmdline.as_bytes());
    if let Some(content) = rspfile_content {
        h.write_u8(UNIT_SEPARATOR);
        h.write(content.as_bytes());
    }
    Hash(h.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_within_process() {
        assert_eq!(hash_command("cc -c foo.c", None), hash_command("cc -c foo.c", None));
    }

    #[test]
    fn distinguishes_rsp_content() {
        let plain = hash_command("link @foo.rsp", None);
        let a = hash_command("link @foo.rsp", Some("a.o"));
        let b = hash_command("link @foo.rsp", Some("b.o"));
        assert_ne!(plain, a);
        assert_ne!(a, b);
    }
}
