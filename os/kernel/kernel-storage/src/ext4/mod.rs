//! # ext4
//!
//! [`Ext4Volume`] reads the superblock when probed, then resolves inodes
//! through the group descriptor table and file data through extent trees.
//! Every transfer is staged through a [`StagingPage`](crate::StagingPage), so
//! the volume only needs a [`BlockDevice`] and the memory services.
//!
//! ```text
//! inode n ─► group (n-1)/inodes_per_group ─► descriptor ─► inode table
//!         ─► i_block extent root ─► [index blocks] ─► leaf extents ─► data
//! ```
//!
//! Metadata writes live in [`write`]: inode and block allocation through the
//! group bitmaps, inode updates, and the descriptor and superblock counts
//! that go with them.
//!
//! Files mapped by indirect blocks, inline data and the journal are not
//! supported.

pub mod checksum;
pub mod dir;
pub mod extent;
pub mod group;
pub mod inode;
pub mod superblock;
pub mod write;

use crate::block::BlockDevice;
use crate::error::{Result, StorageError};
use crate::staging::read_span;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::MemoryServices;
use log::{debug, info};

pub use self::dir::DirEntry;
pub use self::extent::Extent;
pub use self::group::GroupDescriptor;
pub use self::inode::{Inode, NodeKind, ROOT_INODE};
pub use self::superblock::Superblock;

use self::extent::{ExtentNode, MAX_DEPTH, parse_node};
use self::superblock::{SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};

/// A file or directory as the rest of the kernel sees it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FsNode {
    pub node_id: u32,
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    /// 512-byte units, as stored in `i_blocks_lo`.
    pub blocks: u32,
    /// Permission bits only.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FsNode {
    #[must_use]
    pub fn from_inode(node_id: u32, name: &str, inode: &Inode) -> Self {
        Self {
            node_id,
            name: name.to_string(),
            kind: inode.kind(),
            size: inode.size,
            blocks: inode.blocks,
            mode: inode.permissions(),
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

pub struct Ext4Volume<D> {
    device: D,
    superblock: Superblock,
    /// The superblock as read, so a rewrite keeps the fields not modelled.
    superblock_raw: Vec<u8>,
    root: Option<FsNode>,
}

impl<D: BlockDevice> Ext4Volume<D> {
    /// Read and validate the superblock.
    ///
    /// # Errors
    /// `BadSuperblock` or `UnsupportedFeature` if this is not an ext4 volume
    /// this driver can read, otherwise device and memory errors.
    pub fn probe<S: MemoryServices + ?Sized>(mut device: D, services: &mut S) -> Result<Self> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        read_span(&mut device, services, SUPERBLOCK_OFFSET, &mut raw)?;
        let superblock = Superblock::parse(&raw)?;
        info!(
            "ext4 '{}': {} blocks of {} bytes, {} groups",
            superblock.volume_name(),
            superblock.blocks_count,
            superblock.block_size(),
            superblock.group_count()
        );
        Ok(Self {
            device,
            superblock,
            superblock_raw: raw,
            root: None,
        })
    }

    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.superblock.block_size()
    }

    #[must_use]
    pub const fn is_mounted(&self) -> bool {
        self.root.is_some()
    }

    /// The root directory while mounted.
    #[must_use]
    pub const fn root(&self) -> Option<&FsNode> {
        self.root.as_ref()
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Load the root directory, inode 2, under the name `/`.
    ///
    /// # Errors
    /// `AlreadyMounted`, or `Corrupt` if inode 2 is not a directory.
    pub fn mount<S: MemoryServices + ?Sized>(&mut self, services: &mut S) -> Result<FsNode> {
        if self.root.is_some() {
            return Err(StorageError::AlreadyMounted);
        }
        let inode = self.read_inode(services, ROOT_INODE)?;
        if inode.kind() != NodeKind::Directory {
            return Err(StorageError::Corrupt("root inode is not a directory"));
        }
        let root = FsNode::from_inode(ROOT_INODE, "/", &inode);
        self.root = Some(root.clone());
        info!("ext4 '{}' mounted", self.superblock.volume_name());
        Ok(root)
    }

    /// # Errors
    /// `NotMounted`.
    pub fn unmount(&mut self) -> Result<()> {
        self.root.take().map(|_| ()).ok_or(StorageError::NotMounted)
    }

    /// Read filesystem block `block` into `buf`, which is at most one block.
    ///
    /// # Errors
    /// `Corrupt` past the end of the volume, otherwise device and memory errors.
    pub fn read_block<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        block: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.read_in_block(services, block, 0, buf)
    }

    fn read_in_block<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        block: u64,
        within: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if block >= self.superblock.blocks_count {
            return Err(StorageError::Corrupt("block beyond the volume"));
        }
        let block_size = self.block_size();
        debug_assert!(within + buf.len() as u64 <= block_size);
        let at = block * block_size + within;
        read_span(&mut self.device, services, at, buf)
    }

    /// Block and byte offset of descriptor `group`.
    fn descriptor_location(&self, group: u32) -> Result<(u64, u64)> {
        if group >= self.superblock.group_count() {
            return Err(StorageError::NotFound);
        }
        let offset = u64::from(group) * u64::from(self.superblock.descriptor_size());
        let block = self.superblock.descriptor_table_block() + offset / self.block_size();
        Ok((block, offset % self.block_size()))
    }

    /// # Errors
    /// `NotFound` for a group the volume does not have.
    pub fn read_group_descriptor<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
    ) -> Result<GroupDescriptor> {
        let (block, within) = self.descriptor_location(group)?;
        let desc_size = self.superblock.descriptor_size();
        let mut raw = vec![0u8; usize::from(desc_size)];
        self.read_in_block(services, block, within, &mut raw)?;
        Ok(GroupDescriptor::parse(&raw, desc_size))
    }

    /// Block and byte offset of inode `number` in its group's table.
    fn inode_location<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        number: u32,
    ) -> Result<(u64, u64)> {
        if number == 0 || number > self.superblock.inodes_count {
            return Err(StorageError::NotFound);
        }
        let ipg = self.superblock.inodes_per_group;
        let desc = self.read_group_descriptor(services, (number - 1) / ipg)?;
        let offset = u64::from((number - 1) % ipg) * u64::from(self.superblock.inode_size());
        Ok((desc.inode_table + offset / self.block_size(), offset % self.block_size()))
    }

    /// # Errors
    /// `NotFound` for inode 0 or one past `inodes_count`.
    pub fn read_inode<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        number: u32,
    ) -> Result<Inode> {
        let (block, within) = self.inode_location(services, number)?;
        let mut raw = vec![0u8; usize::from(self.superblock.inode_size())];
        self.read_in_block(services, block, within, &mut raw)?;
        Ok(Inode::parse(&raw))
    }

    /// Every leaf extent of `inode`, in tree order.
    ///
    /// # Errors
    /// `UnsupportedFeature` for block-mapped files, `Corrupt` for a malformed
    /// tree.
    pub fn extents<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        inode: &Inode,
    ) -> Result<Vec<Extent>> {
        if !inode.uses_extents() {
            return Err(StorageError::UnsupportedFeature("block-mapped files"));
        }
        let mut out = Vec::new();
        self.walk_extents(services, &inode.block, None, &mut out)?;
        Ok(out)
    }

    fn walk_extents<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        raw: &[u8],
        expected_depth: Option<u16>,
        out: &mut Vec<Extent>,
    ) -> Result<()> {
        let (header, node) = parse_node(raw)?;
        if expected_depth.is_some_and(|d| d != header.depth) {
            return Err(StorageError::Corrupt("extent tree depth"));
        }
        match node {
            ExtentNode::Leaf(extents) => out.extend(extents),
            ExtentNode::Index(children) => {
                debug_assert!(header.depth > 0 && header.depth <= MAX_DEPTH);
                let mut block = vec![0u8; usize::try_from(self.block_size()).unwrap_or(0)];
                for child in children {
                    self.read_block(services, child.child, &mut block)?;
                    self.walk_extents(services, &block, Some(header.depth - 1), out)?;
                }
            }
        }
        Ok(())
    }

    /// The entries of directory `dir`, without `.` and `..`.
    ///
    /// # Errors
    /// `NotMounted` or `NotADirectory`.
    pub fn list_dir<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        dir: &FsNode,
    ) -> Result<Vec<FsNode>> {
        if !self.is_mounted() {
            return Err(StorageError::NotMounted);
        }
        if !dir.is_directory() {
            return Err(StorageError::NotADirectory);
        }
        let inode = self.read_inode(services, dir.node_id)?;
        let extents = self.extents(services, &inode)?;
        let block_size = self.block_size();
        let mut block = vec![0u8; usize::try_from(block_size).unwrap_or(0)];
        let mut entries = Vec::new();
        for extent in extents.iter().filter(|e| !e.uninitialized) {
            for n in 0..u64::from(extent.len) {
                if (u64::from(extent.logical) + n) * block_size >= inode.size {
                    break;
                }
                self.read_block(services, extent.physical + n, &mut block)?;
                dir::parse_block(&block, self.superblock.has_file_type(), &mut entries)?;
            }
        }

        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let inode = self.read_inode(services, entry.inode)?;
            nodes.push(FsNode::from_inode(entry.inode, &entry.name, &inode));
        }
        debug!("ext4: {} entries in '{}'", nodes.len(), dir.name);
        Ok(nodes)
    }

    /// The entry of `dir` called `name`.
    ///
    /// # Errors
    /// `NotFound`, or as [`list_dir`](Self::list_dir).
    pub fn find<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        dir: &FsNode,
        name: &str,
    ) -> Result<FsNode> {
        self.list_dir(services, dir)?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or(StorageError::NotFound)
    }

    /// Resolve an absolute or root-relative path. `.` components are
    /// ignored; `..` and symlinks are not followed.
    ///
    /// # Errors
    /// `NotMounted`, `NotFound` or `NotADirectory` for an intermediate file.
    pub fn lookup<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        path: &str,
    ) -> Result<FsNode> {
        let mut node = self.root.clone().ok_or(StorageError::NotMounted)?;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            node = self.find(services, &node, part)?;
        }
        Ok(node)
    }

    /// Copy file bytes starting at `offset` into `buf`; returns how many were
    /// copied, zero at or past the end. Holes and uninitialized extents read
    /// as zeros.
    ///
    /// # Errors
    /// `NotMounted`, or as [`extents`](Self::extents).
    pub fn read_file<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        node: &FsNode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if !self.is_mounted() {
            return Err(StorageError::NotMounted);
        }
        let inode = self.read_inode(services, node.node_id)?;
        if offset >= inode.size {
            return Ok(0);
        }
        let len = usize::try_from(inode.size - offset).map_or(buf.len(), |rest| rest.min(buf.len()));
        let extents = self.extents(services, &inode)?;
        let block_size = self.block_size();

        let mut done = 0usize;
        while done < len {
            let at = offset + done as u64;
            let within = at % block_size;
            let n = usize::try_from(block_size - within)
                .unwrap_or(usize::MAX)
                .min(len - done);
            let out = &mut buf[done..done + n];
            let physical = extents
                .iter()
                .filter(|e| !e.uninitialized)
                .find_map(|e| e.physical_of(at / block_size));
            match physical {
                Some(block) => self.read_in_block(services, block, within, out)?,
                None => out.fill(0),
            }
            done += n;
        }
        Ok(len)
    }

    /// The whole file.
    ///
    /// # Errors
    /// As [`read_file`](Self::read_file).
    pub fn read_to_vec<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        node: &FsNode,
    ) -> Result<Vec<u8>> {
        let size = usize::try_from(node.size).map_err(|_| StorageError::Corrupt("file size"))?;
        let mut data = vec![0u8; size];
        let n = self.read_file(services, node, 0, &mut data)?;
        data.truncate(n);
        Ok(data)
    }
}
