use std::{
    fmt::{self, Debug, Write},
    ptr::NonNull,
};

/// Pointer wrapper that prints as a plain hex address
///
/// Used for fields of tracing events
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(usize);

impl Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value.cast::<()>() as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value.cast::<()>() as usize)
    }
}

impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr().cast::<()>() as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self::from(value as *const T)
    }
}

/// Format a byte buffer as a classic hex + ascii dump, 16 bytes per line
pub fn debug_hexdump(buf: &[u8]) -> Result<String, fmt::Error> {
    let mut s = String::new();

    for (line_i, chunk) in buf.chunks(16).enumerate() {
        write!(&mut s, "{:08X}: ", line_i * 16)?;
        for c in chunk {
            write!(&mut s, "{:02X} ", c)?;
        }
        for _ in chunk.len()..16 {
            write!(&mut s, "   ")?;
        }
        write!(&mut s, "| ")?;
        for &c in chunk {
            if c.is_ascii_graphic() {
                s.push(c as char);
            } else {
                s.push('.');
            }
        }
        s.push('\n');
    }

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_ptr_formats_as_hex() {
        let p = 0x1234usize as *const u8;
        assert_eq!(format!("{:?}", UsizePtr::from(p)), "0x1234");

        let x = [0u8; 4];
        let slice_ref: &[u8] = &x;
        assert_eq!(UsizePtr::from(slice_ref), UsizePtr::from(x.as_ptr()));
    }

    #[test]
    fn hexdump_short_and_multiline() {
        assert_eq!(debug_hexdump(&[]).unwrap(), "");

        let s = debug_hexdump(b"AB\0").unwrap();
        assert_eq!(s, format!("00000000: 41 42 00 {}| AB.\n", "   ".repeat(13)));

        let buf = (0x40u8..0x51).collect::<Vec<_>>();
        let s = debug_hexdump(&buf).unwrap();
        let lines = s.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("| @ABCDEFGHIJKLMNO"));
        assert!(lines[1].starts_with("00000010: 50 "));
        assert!(lines[1].ends_with("| P"));
    }
}
