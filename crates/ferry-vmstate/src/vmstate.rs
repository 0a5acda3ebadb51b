//! Declarative, versioned state schemas.
//!
//! A [`VmStateDescription`] lists the fields of a state struct in wire order. Each field carries a
//! typed accessor (`fn(&mut T) -> &mut V`) plus a [`FieldKind`] describing how many elements it
//! holds, so the same description drives both save and load. Descriptions are built once and
//! usually kept in a `OnceLock` static:
//!
//! ```
//! use std::sync::OnceLock;
//! use ferry_vmstate::{vmstate_single, VmStateDescription, UINT32};
//!
//! #[derive(Default)]
//! struct Counter {
//!     count: u32,
//! }
//!
//! fn vmstate_counter() -> &'static VmStateDescription<Counter> {
//!     static VMSD: OnceLock<VmStateDescription<Counter>> = OnceLock::new();
//!     VMSD.get_or_init(|| {
//!         VmStateDescription::new("counter", 1).field(vmstate_single!(Counter, count, &UINT32))
//!     })
//! }
//! # assert_eq!(vmstate_counter().name(), "counter");
//! ```

use std::fmt;

use crate::channel::Channel;
use crate::dump::{ElementDump, FieldDump, VmStateDump};
use crate::error::{Result, VmStateError};
use crate::info::VmStateInfo;

/// Marker byte preceding each subsection inside an entity payload.
pub const VMSTATE_SUBSECTION: u8 = 0x05;

/// Placeholder written for an absent element of an array of pointers.
pub const VMS_NULLPTR_MARKER: u8 = 0x30;

const BYTES_CHUNK: usize = 4096;

/// Legacy loader for stream versions older than the declarative minimum.
pub type LoadStateOld<T> = fn(&mut Channel, &mut T, u32) -> Result<()>;

/// How a single element of a field is encoded: a primitive codec or a nested description.
pub enum ElementCodec<V: 'static> {
    Info(&'static VmStateInfo<V>),
    Struct(&'static VmStateDescription<V>),
}

impl<V> Clone for ElementCodec<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for ElementCodec<V> {}

impl<V> From<&'static VmStateInfo<V>> for ElementCodec<V> {
    fn from(info: &'static VmStateInfo<V>) -> Self {
        Self::Info(info)
    }
}

impl<V> From<&'static VmStateDescription<V>> for ElementCodec<V> {
    fn from(vmsd: &'static VmStateDescription<V>) -> Self {
        Self::Struct(vmsd)
    }
}

impl<V> ElementCodec<V> {
    fn put(&self, ch: &mut Channel, v: &mut V) -> Result<()> {
        match self {
            Self::Info(info) => {
                (info.put)(ch, v);
                Ok(())
            }
            Self::Struct(vmsd) => vmsd.save(ch, v),
        }
    }

    fn get(&self, ch: &mut Channel, v: &mut V) -> Result<()> {
        match self {
            Self::Info(info) => (info.get)(ch, v),
            // Nested structs are always loaded at their own current version.
            Self::Struct(vmsd) => vmsd.load(ch, v, vmsd.version_id),
        }
    }

    fn dump(&self) -> ElementDump {
        match self {
            Self::Info(info) => ElementDump::Info {
                name: info.name,
                size: info.size,
            },
            Self::Struct(vmsd) => ElementDump::Struct(Box::new(vmsd.dump())),
        }
    }
}

/// Element-count descriptor of a field.
pub enum FieldKind<T> {
    /// Exactly one element.
    Single,
    /// Fixed element count; the container must hold at least that many.
    Array(usize),
    /// Element count read from an earlier field of the same struct.
    VArray { num: fn(&T) -> usize },
    /// Raw bytes filling the whole container.
    Buffer,
    /// Raw bytes whose length is read from an earlier field, times `multiply`.
    VBuffer {
        size: fn(&T) -> usize,
        multiply: usize,
    },
    /// Bytes written as zero and skipped on load.
    Unused(usize),
    /// Bitmap of `bits` bits, stored as big-endian 64-bit words.
    Bitmap { bits: fn(&T) -> usize },
    /// One boxed element; saving `None` fails, loading allocates.
    Pointer,
    /// Fixed count of optional boxed elements; `None` is stored as a marker byte.
    ArrayOfPointer(usize),
}

impl<T> FieldKind<T> {
    /// Number of elements to transfer, or `None` for "the whole container".
    fn count(&self, opaque: &T) -> Option<usize> {
        match self {
            Self::Single | Self::Pointer => Some(1),
            Self::Array(n) | Self::ArrayOfPointer(n) | Self::Unused(n) => Some(*n),
            Self::VArray { num } => Some(num(opaque)),
            Self::Buffer => None,
            Self::VBuffer { size, multiply } => Some(size(opaque).saturating_mul(*multiply)),
            Self::Bitmap { bits } => Some(bits(opaque)),
        }
    }

    fn static_count(&self) -> Option<usize> {
        match self {
            Self::Single | Self::Pointer => Some(1),
            Self::Array(n) | Self::ArrayOfPointer(n) | Self::Unused(n) => Some(*n),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Array(_) => "array",
            Self::VArray { .. } => "varray",
            Self::Buffer => "buffer",
            Self::VBuffer { .. } => "vbuffer",
            Self::Unused(_) => "unused",
            Self::Bitmap { .. } => "bitmap",
            Self::Pointer => "pointer",
            Self::ArrayOfPointer(_) => "array of pointer",
        }
    }
}

trait FieldAccess<T>: Send + Sync {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()>;

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()>;

    fn element(&self) -> ElementDump;
}

fn check_capacity(field: &'static str, count: usize, capacity: usize) -> Result<()> {
    if count > capacity {
        return Err(VmStateError::CountOverflow {
            field,
            count,
            capacity,
        });
    }
    Ok(())
}

struct SingleAccess<T, V: 'static> {
    get: fn(&mut T) -> &mut V,
    codec: ElementCodec<V>,
}

impl<T, V> FieldAccess<T> for SingleAccess<T, V> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        _: &'static str,
        _: Option<usize>,
    ) -> Result<()> {
        self.codec.put(ch, (self.get)(opaque))
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        _: &'static str,
        _: Option<usize>,
    ) -> Result<()> {
        self.codec.get(ch, (self.get)(opaque))
    }

    fn element(&self) -> ElementDump {
        self.codec.dump()
    }
}

struct SliceAccess<T, V: 'static> {
    get: fn(&mut T) -> &mut [V],
    codec: ElementCodec<V>,
}

impl<T, V> FieldAccess<T> for SliceAccess<T, V> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let items = (self.get)(opaque);
        let count = count.unwrap_or(items.len());
        check_capacity(field, count, items.len())?;
        for item in &mut items[..count] {
            self.codec.put(ch, item)?;
        }
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let items = (self.get)(opaque);
        let count = count.unwrap_or(items.len());
        check_capacity(field, count, items.len())?;
        for item in &mut items[..count] {
            self.codec.get(ch, item)?;
        }
        Ok(())
    }

    fn element(&self) -> ElementDump {
        self.codec.dump()
    }
}

/// Variable-length array backed by a `Vec`, which is resized to the loaded count.
struct VecAccess<T, V: 'static> {
    get: fn(&mut T) -> &mut Vec<V>,
    codec: ElementCodec<V>,
}

impl<T, V: Default> FieldAccess<T> for VecAccess<T, V> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let items = (self.get)(opaque);
        let count = count.unwrap_or(items.len());
        check_capacity(field, count, items.len())?;
        for item in &mut items[..count] {
            self.codec.put(ch, item)?;
        }
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        _: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let items = (self.get)(opaque);
        let count = count.unwrap_or(items.len());
        items.truncate(count);
        for item in items.iter_mut() {
            self.codec.get(ch, item)?;
        }
        // Grow one element at a time so a corrupt count runs into end of stream instead of a
        // huge allocation.
        while items.len() < count {
            let mut item = V::default();
            self.codec.get(ch, &mut item)?;
            items.push(item);
        }
        Ok(())
    }

    fn element(&self) -> ElementDump {
        self.codec.dump()
    }
}

struct BytesAccess<T> {
    get: fn(&mut T) -> &mut [u8],
}

impl<T> FieldAccess<T> for BytesAccess<T> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let bytes = (self.get)(opaque);
        let count = count.unwrap_or(bytes.len());
        check_capacity(field, count, bytes.len())?;
        ch.put_buffer(&bytes[..count]);
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let bytes = (self.get)(opaque);
        let count = count.unwrap_or(bytes.len());
        check_capacity(field, count, bytes.len())?;
        ch.get_buffer(&mut bytes[..count])?;
        Ok(())
    }

    fn element(&self) -> ElementDump {
        ElementDump::Bytes
    }
}

struct ByteVecAccess<T> {
    get: fn(&mut T) -> &mut Vec<u8>,
}

impl<T> FieldAccess<T> for ByteVecAccess<T> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let bytes = (self.get)(opaque);
        let count = count.unwrap_or(bytes.len());
        check_capacity(field, count, bytes.len())?;
        ch.put_buffer(&bytes[..count]);
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        _: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let bytes = (self.get)(opaque);
        let count = count.unwrap_or(bytes.len());
        bytes.clear();
        let mut chunk = [0u8; BYTES_CHUNK];
        while bytes.len() < count {
            let n = (count - bytes.len()).min(BYTES_CHUNK);
            ch.get_buffer(&mut chunk[..n])?;
            bytes.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn element(&self) -> ElementDump {
        ElementDump::Bytes
    }
}

struct UnusedAccess;

impl<T> FieldAccess<T> for UnusedAccess {
    fn save(
        &self,
        ch: &mut Channel,
        _: &mut T,
        _: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let zeros = [0u8; BYTES_CHUNK];
        let mut remaining = count.unwrap_or(0);
        while remaining > 0 {
            let n = remaining.min(BYTES_CHUNK);
            ch.put_buffer(&zeros[..n]);
            remaining -= n;
        }
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        _: &mut T,
        _: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        ch.skip(count.unwrap_or(0))?;
        Ok(())
    }

    fn element(&self) -> ElementDump {
        ElementDump::Unused
    }
}

// Host words making up one 64-bit wire word.
const WORDS_PER_U64: usize = 64 / usize::BITS as usize;

struct BitmapAccess<T> {
    get: fn(&mut T) -> &mut [usize],
}

impl<T> BitmapAccess<T> {
    fn check(field: &'static str, bits: usize, map: &[usize]) -> Result<usize> {
        let needed = bits.div_ceil(usize::BITS as usize);
        check_capacity(field, needed, map.len())?;
        Ok(bits.div_ceil(64))
    }
}

impl<T> FieldAccess<T> for BitmapAccess<T> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let map = (self.get)(opaque);
        let bits = count.unwrap_or(map.len() * usize::BITS as usize);
        let words = Self::check(field, bits, map)?;
        for w in 0..words {
            let mut word = 0u64;
            for i in 0..WORDS_PER_U64 {
                if let Some(&part) = map.get(w * WORDS_PER_U64 + i) {
                    word |= (part as u64) << (i * usize::BITS as usize);
                }
            }
            ch.put_be64(word);
        }
        Ok(())
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let map = (self.get)(opaque);
        let bits = count.unwrap_or(map.len() * usize::BITS as usize);
        let words = Self::check(field, bits, map)?;
        for w in 0..words {
            let word = ch.get_be64()?;
            for i in 0..WORDS_PER_U64 {
                if let Some(part) = map.get_mut(w * WORDS_PER_U64 + i) {
                    *part = (word >> (i * usize::BITS as usize)) as usize;
                }
            }
        }
        Ok(())
    }

    fn element(&self) -> ElementDump {
        ElementDump::Bitmap
    }
}

struct PointerAccess<T, V: 'static> {
    get: fn(&mut T) -> &mut Option<Box<V>>,
    codec: ElementCodec<V>,
}

impl<T, V: Default> FieldAccess<T> for PointerAccess<T, V> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        _: Option<usize>,
    ) -> Result<()> {
        match (self.get)(opaque) {
            Some(v) => self.codec.put(ch, v),
            None => Err(VmStateError::NullPointer { field }),
        }
    }

    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        _: &'static str,
        _: Option<usize>,
    ) -> Result<()> {
        let v = (self.get)(opaque).get_or_insert_with(Box::default);
        self.codec.get(ch, v)
    }

    fn element(&self) -> ElementDump {
        self.codec.dump()
    }
}

struct PointerArrayAccess<T, V: 'static> {
    get: fn(&mut T) -> &mut [Option<Box<V>>],
    codec: ElementCodec<V>,
}

impl<T, V> FieldAccess<T> for PointerArrayAccess<T, V> {
    fn save(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let slots = (self.get)(opaque);
        let count = count.unwrap_or(slots.len());
        check_capacity(field, count, slots.len())?;
        for slot in &mut slots[..count] {
            match slot {
                Some(v) => self.codec.put(ch, v)?,
                None => ch.put_u8(VMS_NULLPTR_MARKER),
            }
        }
        Ok(())
    }

    // The destination layout decides: an empty slot expects the marker, a filled one the element.
    fn load(
        &self,
        ch: &mut Channel,
        opaque: &mut T,
        field: &'static str,
        count: Option<usize>,
    ) -> Result<()> {
        let slots = (self.get)(opaque);
        let count = count.unwrap_or(slots.len());
        check_capacity(field, count, slots.len())?;
        for slot in &mut slots[..count] {
            match slot {
                Some(v) => self.codec.get(ch, v)?,
                None => {
                    let found = ch.get_u8()?;
                    if found != VMS_NULLPTR_MARKER {
                        return Err(VmStateError::MissingNullMarker { field, found });
                    }
                }
            }
        }
        Ok(())
    }

    fn element(&self) -> ElementDump {
        self.codec.dump()
    }
}

/// One entry of a [`VmStateDescription`].
pub struct VmStateField<T> {
    name: &'static str,
    version_id: u32,
    field_exists: Option<fn(&T, u32) -> bool>,
    kind: FieldKind<T>,
    access: Box<dyn FieldAccess<T>>,
}

impl<T> fmt::Debug for VmStateField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmStateField")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("version_id", &self.version_id)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> VmStateField<T> {
    fn with_access(
        name: &'static str,
        kind: FieldKind<T>,
        access: Box<dyn FieldAccess<T>>,
    ) -> Self {
        Self {
            name,
            version_id: 0,
            field_exists: None,
            kind,
            access,
        }
    }

    pub fn single<V: 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut V,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        let access = Box::new(SingleAccess { get, codec });
        Self::with_access(name, FieldKind::Single, access)
    }

    /// The first `count` elements of a fixed-capacity container.
    pub fn array<V: 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut [V],
        count: usize,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        let access = Box::new(SliceAccess { get, codec });
        Self::with_access(name, FieldKind::Array(count), access)
    }

    /// The first `num(state)` elements of a fixed-capacity container.
    pub fn varray<V: 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut [V],
        num: fn(&T) -> usize,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        let access = Box::new(SliceAccess { get, codec });
        Self::with_access(name, FieldKind::VArray { num }, access)
    }

    /// Like [`VmStateField::varray`], but the `Vec` is resized to the loaded count.
    pub fn varray_vec<V: Default + 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut Vec<V>,
        num: fn(&T) -> usize,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        let access = Box::new(VecAccess { get, codec });
        Self::with_access(name, FieldKind::VArray { num }, access)
    }

    pub fn buffer(name: &'static str, get: fn(&mut T) -> &mut [u8]) -> Self {
        Self::with_access(name, FieldKind::Buffer, Box::new(BytesAccess { get }))
    }

    /// Bytes whose count is `size(state) * multiply`; the `Vec` is resized on load.
    pub fn vbuffer(
        name: &'static str,
        get: fn(&mut T) -> &mut Vec<u8>,
        size: fn(&T) -> usize,
        multiply: usize,
    ) -> Self {
        Self::with_access(
            name,
            FieldKind::VBuffer { size, multiply },
            Box::new(ByteVecAccess { get }),
        )
    }

    pub fn unused(size: usize) -> Self {
        Self::with_access("unused", FieldKind::Unused(size), Box::new(UnusedAccess))
    }

    pub fn bitmap(
        name: &'static str,
        get: fn(&mut T) -> &mut [usize],
        bits: fn(&T) -> usize,
    ) -> Self {
        let access = Box::new(BitmapAccess { get });
        Self::with_access(name, FieldKind::Bitmap { bits }, access)
    }

    pub fn pointer<V: Default + 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut Option<Box<V>>,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        let access = Box::new(PointerAccess { get, codec });
        Self::with_access(name, FieldKind::Pointer, access)
    }

    pub fn array_of_pointer<V: 'static>(
        name: &'static str,
        get: fn(&mut T) -> &mut [Option<Box<V>>],
        count: usize,
        codec: impl Into<ElementCodec<V>>,
    ) -> Self {
        let codec = codec.into();
        Self::with_access(
            name,
            FieldKind::ArrayOfPointer(count),
            Box::new(PointerArrayAccess { get, codec }),
        )
    }

    /// Only present in streams of version `version_id` or newer.
    pub fn since(mut self, version_id: u32) -> Self {
        self.version_id = version_id;
        self
    }

    /// Presence decided by `exists(state, version)` instead of the version gate.
    pub fn exists_if(mut self, exists: fn(&T, u32) -> bool) -> Self {
        self.field_exists = Some(exists);
        self
    }
}

impl<T> VmStateField<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &FieldKind<T> {
        &self.kind
    }

    fn present(&self, opaque: &T, version_id: u32) -> bool {
        match self.field_exists {
            Some(exists) => exists(opaque, version_id),
            None => version_id >= self.version_id,
        }
    }

    fn dump(&self) -> FieldDump {
        FieldDump {
            field: self.name,
            kind: self.kind.label(),
            version_id: self.version_id,
            field_exists: self.field_exists.is_some(),
            count: self.kind.static_count(),
            element: self.access.element(),
        }
    }
}

/// Versioned schema of one state struct.
pub struct VmStateDescription<T: 'static> {
    name: &'static str,
    version_id: u32,
    minimum_version_id: u32,
    minimum_version_id_old: u32,
    unmigratable: bool,
    load_state_old: Option<LoadStateOld<T>>,
    pre_save: Option<fn(&mut T) -> Result<()>>,
    pre_load: Option<fn(&mut T) -> Result<()>>,
    post_load: Option<fn(&mut T, u32) -> Result<()>>,
    needed: Option<fn(&T) -> bool>,
    fields: Vec<VmStateField<T>>,
    subsections: Vec<&'static VmStateDescription<T>>,
}

impl<T> fmt::Debug for VmStateDescription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmStateDescription")
            .field("name", &self.name)
            .field("version_id", &self.version_id)
            .field("minimum_version_id", &self.minimum_version_id)
            .field("fields", &self.fields)
            .field(
                "subsections",
                &self.subsections.iter().map(|s| s.name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<T: 'static> VmStateDescription<T> {
    pub fn new(name: &'static str, version_id: u32) -> Self {
        Self {
            name,
            version_id,
            minimum_version_id: 0,
            minimum_version_id_old: 0,
            unmigratable: false,
            load_state_old: None,
            pre_save: None,
            pre_load: None,
            post_load: None,
            needed: None,
            fields: Vec::new(),
            subsections: Vec::new(),
        }
    }

    pub fn minimum_version_id(mut self, version_id: u32) -> Self {
        self.minimum_version_id = version_id;
        self
    }

    /// Streams older than `minimum_version_id` but at least `version_id` go through `load`.
    pub fn load_state_old(mut self, version_id: u32, load: LoadStateOld<T>) -> Self {
        self.minimum_version_id_old = version_id;
        self.load_state_old = Some(load);
        self
    }

    pub fn unmigratable(mut self) -> Self {
        self.unmigratable = true;
        self
    }

    pub fn pre_save(mut self, hook: fn(&mut T) -> Result<()>) -> Self {
        self.pre_save = Some(hook);
        self
    }

    pub fn pre_load(mut self, hook: fn(&mut T) -> Result<()>) -> Self {
        self.pre_load = Some(hook);
        self
    }

    /// Runs after every field and subsection is loaded; its result is the result of the load.
    pub fn post_load(mut self, hook: fn(&mut T, u32) -> Result<()>) -> Self {
        self.post_load = Some(hook);
        self
    }

    /// Subsection predicate; a subsection is only written when this returns true.
    pub fn needed(mut self, needed: fn(&T) -> bool) -> Self {
        self.needed = Some(needed);
        self
    }

    pub fn field(mut self, field: VmStateField<T>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = VmStateField<T>>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn subsection(mut self, subsection: &'static VmStateDescription<T>) -> Self {
        debug_assert!(
            subsection.name.len() > self.name.len() && subsection.name.starts_with(self.name),
            "subsection {:?} must be prefixed by {:?}",
            subsection.name,
            self.name
        );
        self.subsections.push(subsection);
        self
    }
}

impl<T: 'static> VmStateDescription<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn minimum_version(&self) -> u32 {
        self.minimum_version_id
    }

    pub fn is_unmigratable(&self) -> bool {
        self.unmigratable
    }

    pub fn field_list(&self) -> &[VmStateField<T>] {
        &self.fields
    }

    pub fn is_needed(&self, opaque: &T) -> bool {
        self.needed.map_or(true, |needed| needed(opaque))
    }

    pub fn save(&self, ch: &mut Channel, opaque: &mut T) -> Result<()> {
        if let Some(pre_save) = self.pre_save {
            pre_save(opaque)?;
        }

        for field in &self.fields {
            if !field.present(opaque, self.version_id) {
                continue;
            }
            let count = field.kind.count(opaque);
            field.access.save(ch, opaque, field.name, count)?;
        }

        self.save_subsections(ch, opaque)
    }

    fn save_subsections(&self, ch: &mut Channel, opaque: &mut T) -> Result<()> {
        for sub in &self.subsections {
            if !sub.is_needed(opaque) {
                continue;
            }
            tracing::trace!(vmsd = self.name, subsection = sub.name, "saving subsection");
            ch.put_u8(VMSTATE_SUBSECTION);
            ch.put_counted_string(sub.name);
            ch.put_be32(sub.version_id);
            sub.save(ch, opaque)?;
        }
        Ok(())
    }

    pub fn load(&self, ch: &mut Channel, opaque: &mut T, version_id: u32) -> Result<()> {
        tracing::trace!(vmsd = self.name, version_id, "loading");

        if version_id > self.version_id {
            return Err(VmStateError::VersionTooNew {
                name: self.name,
                version_id,
                supported: self.version_id,
            });
        }
        if version_id < self.minimum_version_id {
            return match self.load_state_old {
                Some(load_old) if version_id >= self.minimum_version_id_old => {
                    load_old(ch, opaque, version_id)
                }
                Some(_) => Err(VmStateError::VersionTooOld {
                    name: self.name,
                    version_id,
                    minimum: self.minimum_version_id_old,
                }),
                None => Err(VmStateError::VersionTooOld {
                    name: self.name,
                    version_id,
                    minimum: self.minimum_version_id,
                }),
            };
        }

        if let Some(pre_load) = self.pre_load {
            pre_load(opaque)?;
        }

        for field in &self.fields {
            if !field.present(opaque, version_id) {
                continue;
            }
            let count = field.kind.count(opaque);
            if let Err(err) = field.access.load(ch, opaque, field.name, count) {
                tracing::debug!(vmsd = self.name, field = field.name, %err, "field load failed");
                return Err(err);
            }
        }

        self.load_subsections(ch, opaque)?;

        match self.post_load {
            Some(post_load) => post_load(opaque, version_id),
            None => Ok(()),
        }
    }

    fn load_subsections(&self, ch: &mut Channel, opaque: &mut T) -> Result<()> {
        while ch.peek_u8(0) == Some(VMSTATE_SUBSECTION) {
            let Some(len) = ch.peek_u8(1) else {
                return Ok(());
            };
            let len = len as usize;
            if len <= self.name.len() {
                return Ok(());
            }
            let idstr = match ch.peek_buffer(len, 2) {
                Ok(bytes) if bytes.len() == len => bytes.to_vec(),
                _ => return Ok(()),
            };
            // Anything not prefixed by our name belongs to an enclosing level.
            if !idstr.starts_with(self.name.as_bytes()) {
                return Ok(());
            }

            let Some(sub) = self
                .subsections
                .iter()
                .find(|sub| sub.name.as_bytes() == idstr.as_slice())
            else {
                let name = String::from_utf8_lossy(&idstr).into_owned();
                tracing::warn!(vmsd = self.name, subsection = %name, "unknown subsection");
                return Err(VmStateError::UnknownSubsection {
                    parent: self.name,
                    name,
                });
            };

            ch.skip(2 + len)?;
            let version_id = ch.get_be32()?;
            sub.load(ch, opaque, version_id)?;
        }
        Ok(())
    }

    /// Serializable description of this schema, including nested structs and subsections.
    pub fn dump(&self) -> VmStateDump {
        VmStateDump {
            name: self.name,
            version_id: self.version_id,
            minimum_version_id: self.minimum_version_id,
            unmigratable: self.unmigratable,
            fields: self.fields.iter().map(VmStateField::dump).collect(),
            subsections: self.subsections.iter().map(|sub| sub.dump()).collect(),
        }
    }
}
