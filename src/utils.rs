use std::any::Any;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};

use memmap2::{Mmap, MmapOptions};

use crate::errors::Result;

/*
 加载文件到内存
 */
#[inline]
pub fn load_file(path: &str) -> Result<Mmap> {
    let file = File::open(path)?;
    Ok(unsafe { MmapOptions::new().map(&file)? })
}

/*
 值向上对齐, 溢出返回 None
 */
#[inline]
pub fn align(value: u32, size: u32) -> Option<u32> {
    if value % size == 0 {
        Some(value)
    } else {
        (value / size).checked_add(1)?.checked_mul(size)
    }
}

/// Runs `f`, turning both an `Err` and a panic into a message.
///
/// Used where untrusted state is touched (module entry points, resource
/// release during drain) so one bad resource cannot abort the caller.
pub fn fault_boundary<T, F>(f: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0, 0x1000), Some(0));
        assert_eq!(align(1, 0x1000), Some(0x1000));
        assert_eq!(align(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align(13, 4), Some(16));
        assert_eq!(align(0xffff_f000, 0x1000), Some(0xffff_f000));
    }

    #[test]
    fn align_reports_overflow() {
        assert_eq!(align(0xffff_ffff, 0x1000), None);
        assert_eq!(align(0xffff_f001, 0x1000), None);
        assert_eq!(align(0xffff_ffff, 16), None);
    }

    #[test]
    fn fault_boundary_contains_errors_and_panics() {
        assert_eq!(fault_boundary(|| Ok(3)), Ok(3));
        let err = fault_boundary::<(), _>(|| Err(ErrorKind::InvalidHandle(7).into())).unwrap_err();
        assert!(err.contains("0x00000007"));
        let err = fault_boundary::<(), _>(|| panic!("double free")).unwrap_err();
        assert_eq!(err, "panic: double free");
    }
}
