//! UVF format constants and semantic tables.
//!
//! Every table is stored on disk as a u64 tag. Tags this reader does not
//! know are kept verbatim so files written by newer tools round-trip.

/// UVF magic bytes.
pub const UVF_MAGIC: &[u8; 8] = b"UVF-DATA";

/// Version written by this library; files with a newer version are rejected.
pub const UVF_VERSION: u64 = 4;

/// Bytes preceding the checksum: magic, endian flag, version, scheme, checksum length.
pub const CHECKSUM_OFFSET: u64 = 8 + 1 + 8 + 8 + 8;

/// Smallest possible file: magic plus a header with an empty checksum.
pub const MIN_FILE_SIZE: u64 = CHECKSUM_OFFSET + 8 + 8;

/// Chunk size for checksum and payload streaming.
pub const IO_CHUNK_SIZE: usize = 1024 * 1024;

macro_rules! tagged_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident($unknown:ident) {
            $( $(#[$vmeta:meta])* $variant:ident = $tag:literal => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// Tag not known to this reader.
            $unknown(u64),
        }

        impl $name {
            /// Decode from the on-disk tag.
            pub const fn from_tag(tag: u64) -> Self {
                match tag {
                    $( $tag => Self::$variant, )+
                    other => Self::$unknown(other),
                }
            }

            /// On-disk tag.
            pub const fn tag(self) -> u64 {
                match self {
                    $( Self::$variant => $tag, )+
                    Self::$unknown(tag) => tag,
                }
            }

            /// Human-readable name.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                    Self::$unknown(_) => "unknown",
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    Self::$unknown(tag) => write!(f, "unknown ({})", tag),
                    other => f.write_str(other.name()),
                }
            }
        }
    };
}

tagged_enum! {
    /// Semantic tag of a data block; selects the specialised parser.
    pub enum BlockSemantic(Unknown) {
        Empty = 0 => "empty",
        RegularNDimGrid = 1 => "regular N-dimensional grid",
        KeyValuePairs = 2 => "key/value pairs",
        Histogram1D = 3 => "1D histogram",
        Histogram2D = 4 => "2D histogram",
    }
}

tagged_enum! {
    /// Whole-file checksum algorithm.
    pub enum ChecksumScheme(Unknown) {
        None = 0 => "none",
        Crc32 = 1 => "CRC32",
        Md5 = 2 => "MD5",
    }
}

tagged_enum! {
    /// Compression applied to a block payload.
    pub enum CompressionScheme(Unknown) {
        None = 0 => "none",
        Zlib = 1 => "zlib",
    }
}

tagged_enum! {
    /// Meaning of one raster axis.
    pub enum DomainSemantic(Other) {
        X = 0 => "X",
        Y = 1 => "Y",
        Z = 2 => "Z",
        Time = 3 => "time",
    }
}

tagged_enum! {
    /// Meaning of one element component.
    pub enum ElementSemantic(Other) {
        Undefined = 0 => "undefined",
        Intensity = 1 => "intensity",
        Red = 2 => "red",
        Green = 3 => "green",
        Blue = 4 => "blue",
        Alpha = 5 => "alpha",
        Gradient = 6 => "gradient",
    }
}

impl ChecksumScheme {
    /// Digest length in bytes, `None` for unknown schemes.
    pub const fn digest_len(self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::Crc32 => Some(4),
            Self::Md5 => Some(16),
            Self::Unknown(_) => None,
        }
    }
}

impl Default for ChecksumScheme {
    fn default() -> Self {
        Self::None
    }
}

impl Default for CompressionScheme {
    fn default() -> Self {
        Self::None
    }
}
