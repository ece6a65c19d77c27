//! Path canonicalization.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar".
/// These paths can show up due to variable expansion in particular.
/// Both separator styles are folded so manifests written on either platform
/// canonicalize the same way.
pub fn canon_path_in_place(path: &mut String) {
    assert!(!path.is_empty());
    let src = path.as_bytes();
    let len = src.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);
    // Offsets within `out` where components begin, for ".." to pop back to.
    let mut components: Vec<usize> = Vec::new();

    let mut pos = 0;
    if let b'/' | b'\\' = src[0] {
        out.push(src[0]);
        pos = 1;
    }

    // Outer loop: one iteration per path component.
    while pos < len {
        let copy_component = match src[pos] {
            b'/' | b'\\' => {
                // Redundant separator.
                pos += 1;
                continue;
            }
            b'.' => {
                if pos + 1 == len {
                    break; // Trailing '.', trim.
                }
                match src[pos + 1] {
                    b'/' | b'\\' => {
                        // "./", skip.
                        pos += 2;
                        continue;
                    }
                    b'.' if pos + 2 == len || matches!(src[pos + 2], b'/' | b'\\') => {
                        // ".." component, try to back up.
                        if let Some(ofs) = components.pop() {
                            out.truncate(ofs);
                        } else {
                            out.push(b'.');
                            out.push(b'.');
                            if pos + 2 != len {
                                out.push(src[pos + 2]);
                            }
                        }
                        pos += 3;
                        continue;
                    }
                    // A component that merely starts with "..".
                    _ => true,
                }
            }
            _ => true,
        };

        if copy_component {
            // Mark this point as a possible target to pop to.
            components.push(out.len());
            // Copy one path component, including a trailing separator.
            while pos < len {
                let c = src[pos];
                out.push(c);
                pos += 1;
                if let b'/' | b'\\' = c {
                    break;
                }
            }
        }
    }

    if out.is_empty() {
        path.clear();
        path.push('.');
    } else {
        // Safety: `out` is whole components and ASCII separators copied from a
        // valid str, so it remains valid UTF-8.
        *path = unsafe { String::from_utf8_unchecked(out) };
    }
}

pub fn canon_path(path: impl Into<String>) -> String {
    let mut path = path.into();
    canon_path_in_place(&mut path);
    path
}
