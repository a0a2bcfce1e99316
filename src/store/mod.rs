//! Byte-level persistence: positional reads/writes over large files.

mod byte_store;
mod cursor;
mod endian;
mod stream;

pub use byte_store::ByteStore;
pub use cursor::StoreCursor;
pub use endian::{ByteBuf, Endian};
pub use stream::OStream;
