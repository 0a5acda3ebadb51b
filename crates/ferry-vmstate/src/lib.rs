//! Versioned serialization of emulated component state.
//!
//! [`Channel`] buffers a big-endian byte stream over a [`Transport`]. [`VmStateDescription`]
//! declares how a state struct maps onto that stream, with per-field version gates, nested
//! structs and optional named subsections, so that newer builds keep loading older streams.

mod macros;

pub mod channel;
pub mod dump;
pub mod error;
pub mod info;
pub mod transport;
pub mod vmstate;

pub use crate::channel::{Channel, ChannelMode, IO_BUF_SIZE};
pub use crate::dump::{ElementDump, FieldDump, VmStateDump};
pub use crate::error::{ChannelError, Result, VmStateError};
pub use crate::info::{
    Timer, VmStateInfo, BOOL, FLOAT64, INT16, INT32, INT32_EQUAL, INT32_LE, INT64, INT8, TIMER,
    TIMER_NOT_PENDING, UINT16, UINT16_EQUAL, UINT32, UINT32_EQUAL, UINT64, UINT64_EQUAL, UINT8,
    UINT8_EQUAL,
};
pub use crate::transport::{
    MemTransport, ReaderTransport, SeekTransport, Transport, WriterTransport,
};
pub use crate::vmstate::{
    ElementCodec, FieldKind, LoadStateOld, VmStateDescription, VmStateField, VMSTATE_SUBSECTION,
    VMS_NULLPTR_MARKER,
};
