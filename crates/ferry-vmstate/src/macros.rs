//! Shorthand for the common field declarations.
//!
//! Each macro takes the state type and the field name, and expands to a
//! [`VmStateField`](crate::VmStateField) whose accessor borrows that field.

/// A scalar or nested-struct field. Optional trailing argument: the first stream version that
/// carries the field.
#[macro_export]
macro_rules! vmstate_single {
    ($state:ty, $field:ident, $codec:expr) => {
        $crate::VmStateField::<$state>::single(
            stringify!($field),
            |s: &mut $state| &mut s.$field,
            $codec,
        )
    };
    ($state:ty, $field:ident, $codec:expr, $version:expr) => {
        $crate::vmstate_single!($state, $field, $codec).since($version)
    };
}

/// A nested struct described by its own `VmStateDescription`.
#[macro_export]
macro_rules! vmstate_struct {
    ($state:ty, $field:ident, $vmsd:expr) => {
        $crate::vmstate_single!($state, $field, $vmsd)
    };
    ($state:ty, $field:ident, $vmsd:expr, $version:expr) => {
        $crate::vmstate_single!($state, $field, $vmsd, $version)
    };
}

/// The first `$count` elements of an array field.
#[macro_export]
macro_rules! vmstate_array {
    ($state:ty, $field:ident, $count:expr, $codec:expr) => {
        $crate::VmStateField::<$state>::array(
            stringify!($field),
            |s: &mut $state| &mut s.$field[..],
            $count,
            $codec,
        )
    };
}

/// An array field whose element count is held in the earlier field `$num`.
#[macro_export]
macro_rules! vmstate_varray {
    ($state:ty, $field:ident, $num:ident, $codec:expr) => {
        $crate::VmStateField::<$state>::varray(
            stringify!($field),
            |s: &mut $state| &mut s.$field[..],
            |s: &$state| s.$num as usize,
            $codec,
        )
    };
}

/// A `Vec` field whose length is held in the earlier field `$num`.
#[macro_export]
macro_rules! vmstate_vec {
    ($state:ty, $field:ident, $num:ident, $codec:expr) => {
        $crate::VmStateField::<$state>::varray_vec(
            stringify!($field),
            |s: &mut $state| &mut s.$field,
            |s: &$state| s.$num as usize,
            $codec,
        )
    };
}

/// A byte array written verbatim.
#[macro_export]
macro_rules! vmstate_buffer {
    ($state:ty, $field:ident) => {
        $crate::VmStateField::<$state>::buffer(stringify!($field), |s: &mut $state| {
            &mut s.$field[..]
        })
    };
}

/// A `Vec<u8>` whose byte length is the earlier field `$size` (times `$multiply`).
#[macro_export]
macro_rules! vmstate_vbuffer {
    ($state:ty, $field:ident, $size:ident) => {
        $crate::vmstate_vbuffer!($state, $field, $size, 1)
    };
    ($state:ty, $field:ident, $size:ident, $multiply:expr) => {
        $crate::VmStateField::<$state>::vbuffer(
            stringify!($field),
            |s: &mut $state| &mut s.$field,
            |s: &$state| s.$size as usize,
            $multiply,
        )
    };
}

#[macro_export]
macro_rules! vmstate_timer {
    ($state:ty, $field:ident) => {
        $crate::vmstate_single!($state, $field, &$crate::info::TIMER)
    };
}

/// `$bits` is the earlier field holding the bitmap length in bits.
#[macro_export]
macro_rules! vmstate_bitmap {
    ($state:ty, $field:ident, $bits:ident) => {
        $crate::VmStateField::<$state>::bitmap(
            stringify!($field),
            |s: &mut $state| &mut s.$field[..],
            |s: &$state| s.$bits as usize,
        )
    };
}

#[macro_export]
macro_rules! vmstate_pointer {
    ($state:ty, $field:ident, $codec:expr) => {
        $crate::VmStateField::<$state>::pointer(
            stringify!($field),
            |s: &mut $state| &mut s.$field,
            $codec,
        )
    };
}

#[macro_export]
macro_rules! vmstate_unused {
    ($state:ty, $size:expr) => {
        $crate::VmStateField::<$state>::unused($size)
    };
}
