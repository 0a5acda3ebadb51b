//! Primitive field codecs.
//!
//! Every codec is a `static` [`VmStateInfo`] so schemas can refer to it by `&'static` reference.
//! All integers are big-endian on the wire.

use std::fmt;

use crate::channel::Channel;
use crate::error::{Result, VmStateError};

/// Sentinel stored on the wire for a timer with no pending deadline.
pub const TIMER_NOT_PENDING: u64 = u64::MAX;

/// Get/put pair for one primitive value type.
pub struct VmStateInfo<V: ?Sized> {
    pub name: &'static str,
    /// Encoded size in bytes.
    pub size: usize,
    pub get: fn(&mut Channel, &mut V) -> Result<()>,
    pub put: fn(&mut Channel, &V),
}

impl<V: ?Sized> fmt::Debug for VmStateInfo<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmStateInfo")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

macro_rules! int_info {
    ($static:ident, $name:literal, $ty:ty, $get:ident, $put:ident) => {
        pub static $static: VmStateInfo<$ty> = VmStateInfo {
            name: $name,
            size: std::mem::size_of::<$ty>(),
            get: $get,
            put: $put,
        };

        fn $get(ch: &mut Channel, v: &mut $ty) -> Result<()> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            ch.get_buffer(&mut buf)?;
            *v = <$ty>::from_be_bytes(buf);
            Ok(())
        }

        fn $put(ch: &mut Channel, v: &$ty) {
            ch.put_buffer(&v.to_be_bytes());
        }
    };
}

int_info!(INT8, "int8", i8, get_i8, put_i8);
int_info!(INT16, "int16", i16, get_i16, put_i16);
int_info!(INT32, "int32", i32, get_i32, put_i32);
int_info!(INT64, "int64", i64, get_i64, put_i64);
int_info!(UINT8, "uint8", u8, get_u8, put_u8);
int_info!(UINT16, "uint16", u16, get_u16, put_u16);
int_info!(UINT32, "uint32", u32, get_u32, put_u32);
int_info!(UINT64, "uint64", u64, get_u64, put_u64);

// Equal variants write the value as-is and refuse to load anything but the value the
// destination already holds.
macro_rules! equal_info {
    ($static:ident, $name:literal, $ty:ty, $get:ident, $put:ident) => {
        pub static $static: VmStateInfo<$ty> = VmStateInfo {
            name: $name,
            size: std::mem::size_of::<$ty>(),
            get: $get,
            put: $put,
        };

        fn $get(ch: &mut Channel, v: &mut $ty) -> Result<()> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            ch.get_buffer(&mut buf)?;
            let loaded = <$ty>::from_be_bytes(buf);
            if loaded != *v {
                return Err(VmStateError::ValueMismatch {
                    info: $name,
                    expected: v.to_string(),
                    found: loaded.to_string(),
                });
            }
            Ok(())
        }
    };
}

equal_info!(UINT8_EQUAL, "uint8 equal", u8, get_u8_equal, put_u8);
equal_info!(UINT16_EQUAL, "uint16 equal", u16, get_u16_equal, put_u16);
equal_info!(INT32_EQUAL, "int32 equal", i32, get_i32_equal, put_i32);
equal_info!(UINT32_EQUAL, "uint32 equal", u32, get_u32_equal, put_u32);
equal_info!(UINT64_EQUAL, "uint64 equal", u64, get_u64_equal, put_u64);

/// Loaded value must be non-negative and not exceed the destination's current value, which then
/// takes the loaded value. Used for counts bounded by a statically sized container.
pub static INT32_LE: VmStateInfo<i32> = VmStateInfo {
    name: "int32 le",
    size: 4,
    get: get_i32_le,
    put: put_i32,
};

fn get_i32_le(ch: &mut Channel, v: &mut i32) -> Result<()> {
    let loaded = ch.get_be32()? as i32;
    if loaded < 0 || loaded > *v {
        return Err(VmStateError::ValueMismatch {
            info: "int32 le",
            expected: format!("0..={}", *v),
            found: loaded.to_string(),
        });
    }
    *v = loaded;
    Ok(())
}

pub static BOOL: VmStateInfo<bool> = VmStateInfo {
    name: "bool",
    size: 1,
    get: get_bool,
    put: put_bool,
};

fn get_bool(ch: &mut Channel, v: &mut bool) -> Result<()> {
    *v = ch.get_u8()? != 0;
    Ok(())
}

fn put_bool(ch: &mut Channel, v: &bool) {
    ch.put_u8(u8::from(*v));
}

pub static FLOAT64: VmStateInfo<f64> = VmStateInfo {
    name: "float64",
    size: 8,
    get: get_f64,
    put: put_f64,
};

fn get_f64(ch: &mut Channel, v: &mut f64) -> Result<()> {
    *v = f64::from_bits(ch.get_be64()?);
    Ok(())
}

fn put_f64(ch: &mut Channel, v: &f64) {
    ch.put_be64(v.to_bits());
}

/// A one-shot timer deadline, in ticks of whatever clock the owning device uses.
///
/// Only the deadline is persisted; the callback is rebuilt by the device on load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timer {
    expire: Option<u64>,
}

impl Timer {
    pub const fn new() -> Self {
        Self { expire: None }
    }

    /// Arm the timer for the absolute tick `deadline`.
    pub fn modify(&mut self, deadline: u64) {
        // The sentinel cannot be represented as a deadline.
        self.expire = Some(deadline.min(TIMER_NOT_PENDING - 1));
    }

    pub fn cancel(&mut self) {
        self.expire = None;
    }

    pub fn is_pending(&self) -> bool {
        self.expire.is_some()
    }

    pub fn expire_time(&self) -> Option<u64> {
        self.expire
    }

    /// True if the timer is pending and its deadline is at or before `now`.
    pub fn expired(&self, now: u64) -> bool {
        self.expire.is_some_and(|deadline| deadline <= now)
    }
}

pub static TIMER: VmStateInfo<Timer> = VmStateInfo {
    name: "timer",
    size: 8,
    get: get_timer,
    put: put_timer,
};

fn get_timer(ch: &mut Channel, v: &mut Timer) -> Result<()> {
    let raw = ch.get_be64()?;
    v.expire = (raw != TIMER_NOT_PENDING).then_some(raw);
    Ok(())
}

fn put_timer(ch: &mut Channel, v: &Timer) {
    ch.put_be64(v.expire.unwrap_or(TIMER_NOT_PENDING));
}
