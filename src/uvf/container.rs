//! UVF container: global header plus an ordered list of data blocks.
//!
//! The block list is the source of truth while a container is loaded; the
//! on-disk "offset to next" chain is only read during [`Container::open`]
//! and recomputed by [`Container::create`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::block::Block;
use super::checksum;
use super::format::{ChecksumScheme, MIN_FILE_SIZE};
use super::header::GlobalHeader;
use super::raster::RasterDataBlock;
use crate::store::{ByteStore, OStream};
use crate::util::{Error, Result};

/// Options for [`Container::open`].
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    /// Recompute and compare the whole-file checksum.
    pub verify: bool,
    /// Allow in-place brick updates; the checksum is rewritten on close.
    pub read_write: bool,
    /// Memory-map read-only files.
    pub use_mmap: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { verify: true, read_write: false, use_mmap: true }
    }
}

impl OpenOptions {
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn read_write(mut self, read_write: bool) -> Self {
        self.read_write = read_write;
        self
    }

    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }
}

/// A UVF file, opened for reading or assembled for writing.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    header: GlobalHeader,
    blocks: Vec<Block>,
    store: Option<Arc<ByteStore>>,
    read_write: bool,
    closed: bool,
}

impl Container {
    /// Start a new container to be written to `path` by [`Self::create`].
    pub fn new(path: impl AsRef<Path>, header: GlobalHeader) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            header: header.canonical(),
            blocks: Vec::new(),
            store: None,
            read_write: false,
            closed: false,
        }
    }

    /// Open and parse an existing container.
    ///
    /// Fails without partial state on missing files, bad magic, truncated
    /// headers, checksum mismatches (when `verify` is set) and broken block
    /// chains. Malformed specialised block bodies are kept as opaque blocks.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let store = ByteStore::open(path, options.read_write, options.use_mmap)?;
        if store.size() < MIN_FILE_SIZE {
            return Err(Error::FileTooSmall(store.size()));
        }

        let header = GlobalHeader::read(&store)?;
        if options.verify {
            checksum::verify(&header, &store)?;
        }

        let store = Arc::new(store);
        let mut blocks = Vec::new();
        let mut pos = header.first_block_offset();
        if pos > store.size() {
            return Err(Error::invalid(format!(
                "first block offset {} is past the end of the file ({} bytes)",
                pos,
                store.size()
            )));
        }
        while pos < store.size() {
            let (block, block_header) = Block::parse(&store, pos, header.endian)?;
            blocks.push(block);
            if block_header.offset_to_next == 0 {
                break;
            }
            pos += block_header.offset_to_next;
        }

        tracing::info!(
            version = header.version,
            checksum = %header.checksum_scheme,
            verified = options.verify,
            blocks = blocks.len(),
            "opened container"
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            blocks,
            store: Some(store),
            read_write: options.read_write,
            closed: false,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn header(&self) -> &GlobalHeader {
        &self.header
    }

    #[inline]
    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// Replace the header. Writer-controlled fields are canonicalised.
    pub fn set_global_header(&mut self, header: GlobalHeader) {
        self.header = header.canonical();
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    /// Mutable access; in read-write containers raster brick writes go to disk.
    #[inline]
    pub fn block_mut(&mut self, index: usize) -> Option<&mut Block> {
        self.blocks.get_mut(index)
    }

    /// First block with the given id.
    pub fn find(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    /// Raster blocks with their indices.
    pub fn rasters(&self) -> impl Iterator<Item = (usize, &RasterDataBlock)> {
        self.blocks.iter().enumerate().filter_map(|(i, b)| b.as_raster().map(|r| (i, r)))
    }

    /// Verify `block` and append it. On failure the container is unchanged.
    pub fn add_data_block(&mut self, block: impl Into<Block>) -> Result<()> {
        let block = block.into();
        block.verify()?;
        tracing::debug!(id = %block.id(), semantic = %block.semantic(), "added block");
        self.blocks.push(block);
        Ok(())
    }

    /// Recompute the stored checksum and compare (opened containers only).
    pub fn verify_checksum(&self) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::invalid("container was not opened from a file"))?;
        checksum::verify(&self.header, store)
    }

    /// Write header and blocks to this container's path.
    pub fn create(&self) -> Result<()> {
        self.write_to(&self.path)
    }

    /// Write header and blocks to `path`.
    ///
    /// Output goes to a sibling temporary file that replaces `path` once the
    /// checksum has been stamped, so a container may be rewritten onto the
    /// file it was read from.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::validation(format!("'{}' is not a file path", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        let result = self.write_file(&tmp).and_then(|_| Ok(std::fs::rename(&tmp, path)?));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        let header = self.header.clone().canonical();
        let mut out = OStream::create(path, header.endian)?;
        out.write_bytes(&header.encode())?;
        let count = self.blocks.len();
        for (i, block) in self.blocks.iter().enumerate() {
            block.write(&mut out, i + 1 == count)?;
        }
        let size = out.pos();
        out.finish()?;

        if header.checksum_scheme != ChecksumScheme::None {
            let store = ByteStore::open(path, true, false)?;
            let digest = checksum::compute(header.checksum_scheme, &store, header.checksum_end())?;
            store.write_at(header.checksum_offset(), &digest)?;
            store.flush()?;
        }
        tracing::info!(blocks = count, bytes = size, checksum = %header.checksum_scheme, "wrote container");
        Ok(())
    }

    /// Rewrite the checksum of a read-write container, then release it.
    pub fn close(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.read_write {
            return Ok(());
        }
        if let Some(store) = &self.store {
            if self.header.checksum_scheme != ChecksumScheme::None {
                let digest = checksum::compute(self.header.checksum_scheme, store, self.header.checksum_end())?;
                store.write_at(self.header.checksum_offset(), &digest)?;
                self.header.checksum = digest;
            }
            store.flush()?;
            tracing::info!(path = %self.path.display(), "closed read-write container");
        }
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to finalize container");
        }
    }
}
