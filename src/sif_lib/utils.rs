use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;

lazy_static! {
    static ref PAGE_SIZE: i64 = {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as i64
        }
    };
}

/// System page size, the default payload alignment
pub fn system_page_size() -> i64 {
    *PAGE_SIZE
}

/// Round `x` up to the next multiple of `a`; alignments of one or less
/// leave `x` unchanged
pub fn align_up(x: i64, a: i64) -> i64 {
    if a <= 1 || x % a == 0 {
        x
    } else {
        x + a - x % a
    }
}

/// Slice a NUL-padded byte field down to its content
pub fn trim_zero_bytes(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(n) => &field[..n],
        None => field,
    }
}

/// Current time as Unix seconds
pub fn now_unix() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub fn init_logs() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_boundaries() {
        assert_eq!(align_up(10, 0), 10);
        assert_eq!(align_up(10, 1), 10);
        assert_eq!(align_up(10, 4), 12);
        assert_eq!(align_up(12, 4), 12);
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
    }

    #[test]
    fn trim_zero_bytes_stops_at_nul() {
        assert_eq!(trim_zero_bytes(b"abc\0\0\0"), b"abc");
        assert_eq!(trim_zero_bytes(b"abc"), b"abc");
        assert_eq!(trim_zero_bytes(b"\0abc"), b"");
    }
}
