//! # AHCI
//!
//! The HBA exposes its registers at the physical address in PCI BAR5 (ABAR):
//! a generic block at `0x00` followed by one 128-byte block per port at
//! `0x100 + port * 0x80`. Both are mapped uncached at their offset-mapped
//! address.
//!
//! Each port gets three PFA pages:
//!
//! ```text
//! page 0   command list (32 headers x 32 B) at 0x000, received FIS at 0x400
//! page 1   command tables for slots  0..16, 256 B each
//! page 2   command tables for slots 16..32
//! ```
//!
//! Commands are issued through slot 0 and completed by polling `PxCI`. There
//! are no interrupts and no NCQ.

use crate::block::{BlockDevice, check_lba};
use crate::error::{Result, StorageError};
use crate::staging::StagingPage;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_alloc::{MemoryError, MemoryServices};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::{debug, info, warn};

/// Register offsets and bits.
pub mod regs {
    pub const CAP: u64 = 0x00;
    pub const GHC: u64 = 0x04;
    pub const IS: u64 = 0x08;
    pub const PI: u64 = 0x0C;
    pub const VS: u64 = 0x10;

    /// `GHC.AE`: AHCI enable.
    pub const GHC_AE: u32 = 1 << 31;

    pub const PORT_BASE: u64 = 0x100;
    pub const PORT_STRIDE: u64 = 0x80;

    pub const PX_CLB: u64 = 0x00;
    pub const PX_CLBU: u64 = 0x04;
    pub const PX_FB: u64 = 0x08;
    pub const PX_FBU: u64 = 0x0C;
    pub const PX_IS: u64 = 0x10;
    pub const PX_IE: u64 = 0x14;
    pub const PX_CMD: u64 = 0x18;
    pub const PX_TFD: u64 = 0x20;
    pub const PX_SIG: u64 = 0x24;
    pub const PX_SSTS: u64 = 0x28;
    pub const PX_SERR: u64 = 0x30;
    pub const PX_SACT: u64 = 0x34;
    pub const PX_CI: u64 = 0x38;

    pub const CMD_ST: u32 = 1 << 0;
    pub const CMD_FRE: u32 = 1 << 4;
    pub const CMD_FR: u32 = 1 << 14;
    pub const CMD_CR: u32 = 1 << 15;

    pub const TFD_ERR: u32 = 0x01;
    pub const TFD_DRQ: u32 = 0x08;
    pub const TFD_BSY: u32 = 0x80;

    /// Interface fatal, host bus data and host bus fatal errors.
    pub const IS_FATAL: u32 = (1 << 27) | (1 << 28) | (1 << 29);
    /// Task file error.
    pub const IS_TFES: u32 = 1 << 30;
}

/// Generic block plus 32 port blocks.
pub const HBA_SIZE: u64 = regs::PORT_BASE + 32 * regs::PORT_STRIDE;

pub const SATA_SECTOR_SIZE: u32 = 512;

/// Largest addressable device under 48-bit LBA; used until IDENTIFY runs.
pub const LBA48_SECTORS: u64 = 1 << 48;

/// Polls of a status register before giving up.
pub const DEFAULT_POLL_LIMIT: u32 = 1_000_000;

const COMMAND_SLOTS: u64 = 32;
const COMMAND_HEADER_SIZE: u64 = 32;
const RECEIVED_FIS_OFFSET: u64 = 0x400;
const COMMAND_TABLE_SIZE: u64 = 256;
const TABLES_PER_PAGE: u64 = PAGE_SIZE / COMMAND_TABLE_SIZE;
const PRDT_OFFSET: u64 = 0x80;
const PRDT_ENTRIES: u16 = 8;

const FIS_TYPE_REG_H2D: u8 = 0x27;
/// Register FIS byte 1: the FIS carries a command.
const FIS_COMMAND: u8 = 0x80;
/// Device register: LBA addressing.
const DEVICE_LBA: u8 = 1 << 6;
/// A register H2D FIS is five dwords.
const FIS_H2D_DWORDS: u8 = 5;

pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;

const SIG_ATAPI: u32 = 0xEB14_0101;
const SIG_SEMB: u32 = 0xC33C_0101;
const SIG_PM: u32 = 0x9669_0101;

const SSTS_DET_PRESENT: u32 = 3;
const SSTS_IPM_ACTIVE: u32 = 1;

/// Dword 0 of a command header.
#[bitfield(u32)]
pub struct CommandHeaderFlags {
    /// FIS length in dwords.
    #[bits(5)]
    pub fis_length: u8,
    pub atapi: bool,
    /// Host to device.
    pub write: bool,
    pub prefetchable: bool,
    pub reset: bool,
    pub bist: bool,
    pub clear_busy: bool,
    __: bool,
    #[bits(4)]
    pub port_multiplier: u8,
    /// Entries in the physical region descriptor table.
    pub prd_count: u16,
}

/// Dword 3 of a physical region descriptor.
#[bitfield(u32)]
pub struct PrdByteCount {
    /// Bytes to transfer minus one; bit 0 must be set.
    #[bits(22)]
    pub byte_count: u32,
    #[bits(9)]
    __: u16,
    pub interrupt: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceType {
    None,
    Sata,
    Satapi,
    EnclosureBridge,
    PortMultiplier,
}

impl DeviceType {
    /// Classify a port from its `PxSSTS` and `PxSIG`.
    #[must_use]
    pub const fn from_status(ssts: u32, sig: u32) -> Self {
        let det = ssts & 0x0F;
        let ipm = (ssts >> 8) & 0x0F;
        if det != SSTS_DET_PRESENT || ipm != SSTS_IPM_ACTIVE {
            return Self::None;
        }
        match sig {
            SIG_ATAPI => Self::Satapi,
            SIG_SEMB => Self::EnclosureBridge,
            SIG_PM => Self::PortMultiplier,
            _ => Self::Sata,
        }
    }
}

/// An attached host bus adapter.
#[derive(Debug)]
pub struct AhciController {
    abar: PhysicalAddress,
    base: VirtualAddress,
    capabilities: u32,
    ports_implemented: u32,
    version: u32,
    poll_limit: u32,
}

impl AhciController {
    /// Map the register block uncached, enable AHCI mode and read `CAP`,
    /// `PI` and `VS`.
    ///
    /// Register pages that fall inside RAM are locked in the PFA.
    ///
    /// # Errors
    /// `InvalidAddress` above the offset-mapped window, or a mapping failure.
    pub fn attach<S: MemoryServices + ?Sized>(services: &mut S, abar: PhysicalAddress) -> Result<Self> {
        let base = abar
            .to_offset_mapped()
            .ok_or(MemoryError::InvalidAddress { address: abar })?;
        for page in register_pages(abar) {
            match services.lock_page(page) {
                Ok(()) | Err(MemoryError::InvalidAddress { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            services.map_offset(page, false)?;
        }

        let mut hba = Self {
            abar,
            base,
            capabilities: 0,
            ports_implemented: 0,
            version: 0,
            poll_limit: DEFAULT_POLL_LIMIT,
        };
        let ghc = hba.read(services, regs::GHC)?;
        hba.write(services, regs::GHC, ghc | regs::GHC_AE)?;
        hba.capabilities = hba.read(services, regs::CAP)?;
        hba.ports_implemented = hba.read(services, regs::PI)?;
        hba.version = hba.read(services, regs::VS)?;
        info!(
            "AHCI {}.{} at {abar:?}: {} slots, ports {:#010x}",
            hba.version >> 16,
            hba.version & 0xFFFF,
            hba.command_slots(),
            hba.ports_implemented
        );
        Ok(hba)
    }

    /// Give the register block back. Ports must be detached first.
    ///
    /// Pages inside RAM are unlocked and get their cacheable offset mapping
    /// back, like a released staging page; pages outside it are unmapped.
    ///
    /// # Errors
    /// Propagates the PFA's answer.
    pub fn detach<S: MemoryServices + ?Sized>(self, services: &mut S) -> Result<()> {
        for page in register_pages(self.abar) {
            let Some(va) = page.to_offset_mapped() else {
                continue;
            };
            match services.free_page(page) {
                Ok(()) => services.map_memory(va, page, true)?,
                Err(MemoryError::InvalidAddress { .. }) => {
                    services.unmap_memory(va);
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!("AHCI at {:?} detached", self.abar);
        Ok(())
    }

    #[must_use]
    pub const fn abar(&self) -> PhysicalAddress {
        self.abar
    }

    #[must_use]
    pub const fn capabilities(&self) -> u32 {
        self.capabilities
    }

    #[must_use]
    pub const fn ports_implemented(&self) -> u32 {
        self.ports_implemented
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// `CAP.NCS + 1`.
    #[must_use]
    pub const fn command_slots(&self) -> u32 {
        ((self.capabilities >> 8) & 0x1F) + 1
    }

    /// `CAP.S64A`.
    #[must_use]
    pub const fn supports_64bit(&self) -> bool {
        self.capabilities & (1 << 31) != 0
    }

    pub const fn set_poll_limit(&mut self, polls: u32) {
        self.poll_limit = polls;
    }

    pub fn implemented_ports(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(|&p| self.ports_implemented & (1 << p) != 0)
    }

    /// # Errors
    /// `NoDevice` for a port the HBA does not implement.
    pub fn device_type<S: MemoryServices + ?Sized>(&self, services: &S, port: u8) -> Result<DeviceType> {
        let port_regs = self.port_registers(port)?;
        let ssts = services.read_u32(port_regs + regs::PX_SSTS)?;
        let sig = services.read_u32(port_regs + regs::PX_SIG)?;
        Ok(DeviceType::from_status(ssts, sig))
    }

    /// Every implemented port with something attached.
    ///
    /// # Errors
    /// Memory errors reading the registers.
    pub fn probe_ports<S: MemoryServices + ?Sized>(&self, services: &S) -> Result<Vec<(u8, DeviceType)>> {
        let mut found = Vec::new();
        for port in self.implemented_ports() {
            let ty = self.device_type(services, port)?;
            if ty != DeviceType::None {
                debug!("AHCI port {port}: {ty:?}");
                found.push((port, ty));
            }
        }
        Ok(found)
    }

    /// Rebase `port` onto fresh PFA pages and return it ready for commands.
    ///
    /// # Errors
    /// `NoDevice` unless a SATA disk is attached, `Timeout` if the port does
    /// not stop or start, otherwise memory errors.
    pub fn port<S: MemoryServices + ?Sized>(&self, services: &mut S, port: u8) -> Result<AhciPort> {
        if self.device_type(services, port)? != DeviceType::Sata {
            return Err(StorageError::NoDevice { port });
        }
        AhciPort::rebase(services, self.port_registers(port)?, port, self.poll_limit)
    }

    fn port_registers(&self, port: u8) -> Result<VirtualAddress> {
        if port >= 32 || self.ports_implemented & (1 << port) == 0 {
            return Err(StorageError::NoDevice { port });
        }
        Ok(self.base + (regs::PORT_BASE + u64::from(port) * regs::PORT_STRIDE))
    }

    fn read<S: MemoryServices + ?Sized>(&self, services: &S, reg: u64) -> Result<u32> {
        Ok(services.read_u32(self.base + reg)?)
    }

    fn write<S: MemoryServices + ?Sized>(&self, services: &mut S, reg: u64, value: u32) -> Result<()> {
        Ok(services.write_u32(self.base + reg, value)?)
    }
}

/// Pages covering `[abar, abar + HBA_SIZE)`.
fn register_pages(abar: PhysicalAddress) -> impl Iterator<Item = PhysicalAddress> {
    let first = abar.as_u64() & !(PAGE_SIZE - 1);
    let end = (abar.as_u64() + HBA_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    (first..end).step_by(PAGE_SIZE as usize).map(PhysicalAddress::new)
}

/// A rebased SATA port.
#[derive(Debug)]
pub struct AhciPort {
    index: u8,
    regs: VirtualAddress,
    command_list: StagingPage,
    tables: [StagingPage; 2],
    sector_count: u64,
    poll_limit: u32,
}

impl AhciPort {
    fn rebase<S: MemoryServices + ?Sized>(
        services: &mut S,
        port_regs: VirtualAddress,
        index: u8,
        poll_limit: u32,
    ) -> Result<Self> {
        Self::stop_registers(services, port_regs, index, poll_limit)?;
        let command_list = StagingPage::acquire(services)?;
        let low = match StagingPage::acquire(services) {
            Ok(page) => page,
            Err(e) => {
                command_list.release(services)?;
                return Err(e);
            }
        };
        let high = match StagingPage::acquire(services) {
            Ok(page) => page,
            Err(e) => {
                command_list.release(services)?;
                low.release(services)?;
                return Err(e);
            }
        };

        let port = Self {
            index,
            regs: port_regs,
            command_list,
            tables: [low, high],
            sector_count: LBA48_SECTORS,
            poll_limit,
        };
        if let Err(e) = port.program(services) {
            port.release_pages(services)?;
            return Err(e);
        }
        info!("AHCI port {index} rebased, command list at {:?}", port.command_list.physical());
        Ok(port)
    }

    /// Point the port at its pages, then start it.
    fn program<S: MemoryServices + ?Sized>(&self, services: &mut S) -> Result<()> {
        let cl = self.command_list.physical().as_u64();
        let fis = cl + RECEIVED_FIS_OFFSET;
        self.write(services, regs::PX_CLB, low(cl))?;
        self.write(services, regs::PX_CLBU, high(cl))?;
        self.write(services, regs::PX_FB, low(fis))?;
        self.write(services, regs::PX_FBU, high(fis))?;

        let flags = CommandHeaderFlags::new().with_prd_count(PRDT_ENTRIES);
        for slot in 0..COMMAND_SLOTS {
            let table = self.command_table(slot).as_u64();
            let mut header = [0u8; COMMAND_HEADER_SIZE as usize];
            header[0..4].copy_from_slice(&flags.into_bits().to_le_bytes());
            header[8..12].copy_from_slice(&low(table).to_le_bytes());
            header[12..16].copy_from_slice(&high(table).to_le_bytes());
            self.command_list
                .write(services, (slot * COMMAND_HEADER_SIZE) as usize, &header)?;
        }

        self.write(services, regs::PX_IE, 0)?;
        self.write(services, regs::PX_SERR, u32::MAX)?;
        self.start(services)
    }

    /// Physical address of the command table of `slot`.
    fn command_table(&self, slot: u64) -> PhysicalAddress {
        let page = &self.tables[usize::from(slot >= TABLES_PER_PAGE)];
        page.physical_at((slot % TABLES_PER_PAGE) * COMMAND_TABLE_SIZE)
    }

    /// Clear `ST` and wait for `CR`, then clear `FRE` and wait for `FR`.
    fn stop_registers<S: MemoryServices + ?Sized>(
        services: &mut S,
        port_regs: VirtualAddress,
        port: u8,
        poll_limit: u32,
    ) -> Result<()> {
        let cmd_reg = port_regs + regs::PX_CMD;
        let cmd = services.read_u32(cmd_reg)?;
        services.write_u32(cmd_reg, cmd & !regs::CMD_ST)?;
        wait_clear(services, cmd_reg, regs::CMD_CR, poll_limit, port)?;
        let cmd = services.read_u32(cmd_reg)?;
        services.write_u32(cmd_reg, cmd & !regs::CMD_FRE)?;
        wait_clear(services, cmd_reg, regs::CMD_FR, poll_limit, port)
    }

    fn start<S: MemoryServices + ?Sized>(&self, services: &mut S) -> Result<()> {
        wait_clear(services, self.regs + regs::PX_CMD, regs::CMD_CR, self.poll_limit, self.index)?;
        let cmd = self.read(services, regs::PX_CMD)?;
        self.write(services, regs::PX_CMD, cmd | regs::CMD_FRE)?;
        self.write(services, regs::PX_CMD, cmd | regs::CMD_FRE | regs::CMD_ST)
    }

    /// Stop the port and return its pages to the PFA.
    ///
    /// # Errors
    /// `Timeout` if the port does not stop; the pages are kept then, since
    /// the HBA may still write to them.
    pub fn detach<S: MemoryServices + ?Sized>(self, services: &mut S) -> Result<()> {
        Self::stop_registers(services, self.regs, self.index, self.poll_limit)?;
        self.release_pages(services)
    }

    fn release_pages<S: MemoryServices + ?Sized>(self, services: &mut S) -> Result<()> {
        let [low, high] = self.tables;
        self.command_list.release(services)?;
        low.release(services)?;
        high.release(services)
    }

    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Physical address of the command list.
    #[must_use]
    pub const fn command_list(&self) -> PhysicalAddress {
        self.command_list.physical()
    }

    /// Run IDENTIFY DEVICE and take the 48-bit sector count from words
    /// 100..104.
    ///
    /// # Errors
    /// As a sector read.
    pub fn identify<S: MemoryServices + ?Sized>(&mut self, services: &mut S) -> Result<u64> {
        let page = StagingPage::acquire(services)?;
        let issued = self.issue(services, ATA_CMD_IDENTIFY, 0, 0, page.physical(), false);
        let mut words = [0u8; 8];
        let read = issued.and_then(|()| page.read(services, 200, &mut words));
        page.release(services)?;
        read?;
        let count = u64::from_le_bytes(words);
        if count == 0 {
            warn!("AHCI port {}: IDENTIFY reported no LBA48 sectors", self.index);
        } else {
            self.sector_count = count;
        }
        Ok(count)
    }

    /// Build the command in slot 0, issue it and poll for completion.
    fn issue<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        command: u8,
        lba: u64,
        count: u16,
        buffer: PhysicalAddress,
        write: bool,
    ) -> Result<()> {
        let port = self.index;
        wait_clear(
            services,
            self.regs + regs::PX_TFD,
            regs::TFD_BSY | regs::TFD_DRQ,
            self.poll_limit,
            port,
        )?;

        // IDENTIFY has no sector count but still returns 512 bytes.
        let bytes = u32::from(count.max(1)) * SATA_SECTOR_SIZE;
        let flags = CommandHeaderFlags::new()
            .with_fis_length(FIS_H2D_DWORDS)
            .with_write(write)
            .with_prd_count(1);
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&flags.into_bits().to_le_bytes());
        self.command_list.write(services, 0, &header)?;

        let lba_bytes = lba.to_le_bytes();
        let count = count.to_le_bytes();
        let fis: [u8; 20] = [
            FIS_TYPE_REG_H2D,
            FIS_COMMAND,
            command,
            0,
            lba_bytes[0],
            lba_bytes[1],
            lba_bytes[2],
            DEVICE_LBA,
            lba_bytes[3],
            lba_bytes[4],
            lba_bytes[5],
            0,
            count[0],
            count[1],
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        let dba = buffer.as_u64();
        let mut prd = [0u8; 16];
        prd[0..4].copy_from_slice(&low(dba).to_le_bytes());
        prd[4..8].copy_from_slice(&high(dba).to_le_bytes());
        let dbc = PrdByteCount::new().with_byte_count(bytes - 1).with_interrupt(true);
        prd[12..16].copy_from_slice(&dbc.into_bits().to_le_bytes());

        let table = self.command_table(0);
        let table = table
            .to_offset_mapped()
            .ok_or(MemoryError::InvalidAddress { address: table })?;
        services.fill_bytes(table, 0, (PRDT_OFFSET + 16) as usize)?;
        services.write_bytes(table, &fis)?;
        services.write_bytes(table + PRDT_OFFSET, &prd)?;

        self.write(services, regs::PX_CI, 1)?;
        let mut polls = 0u32;
        loop {
            let is = self.read(services, regs::PX_IS)?;
            if is & regs::IS_TFES != 0 {
                let status = self.read(services, regs::PX_TFD)? & 0xFF;
                self.write(services, regs::PX_IS, is)?;
                warn!("AHCI port {port}: task file error, status {status:#04x}");
                #[allow(clippy::cast_possible_truncation)]
                return Err(StorageError::TaskFileError { port, status: status as u8 });
            }
            if is & regs::IS_FATAL != 0 {
                self.write(services, regs::PX_IS, is)?;
                return Err(StorageError::DeviceIo { lba });
            }
            if self.read(services, regs::PX_CI)? & 1 == 0 {
                self.write(services, regs::PX_IS, is)?;
                return Ok(());
            }
            polls += 1;
            if polls >= self.poll_limit {
                return Err(StorageError::Timeout { port });
            }
            core::hint::spin_loop();
        }
    }

    fn read<S: MemoryServices + ?Sized>(&self, services: &S, reg: u64) -> Result<u32> {
        Ok(services.read_u32(self.regs + reg)?)
    }

    fn write<S: MemoryServices + ?Sized>(&self, services: &mut S, reg: u64, value: u32) -> Result<()> {
        Ok(services.write_u32(self.regs + reg, value)?)
    }
}

impl BlockDevice for AhciPort {
    fn sector_size(&self) -> u32 {
        SATA_SECTOR_SIZE
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        check_lba(lba, self.sector_count)?;
        self.issue(services, ATA_CMD_READ_DMA_EXT, lba, 1, buffer, false)
    }

    fn write_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        check_lba(lba, self.sector_count)?;
        self.issue(services, ATA_CMD_WRITE_DMA_EXT, lba, 1, buffer, true)
    }
}

/// Poll the register at `va` until `mask` clears.
fn wait_clear<S: MemoryServices + ?Sized>(
    services: &S,
    va: VirtualAddress,
    mask: u32,
    limit: u32,
    port: u8,
) -> Result<()> {
    for _ in 0..limit {
        if services.read_u32(va)? & mask == 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(StorageError::Timeout { port })
}

#[allow(clippy::cast_possible_truncation)]
const fn low(value: u64) -> u32 {
    value as u32
}

const fn high(value: u64) -> u32 {
    (value >> 32) as u32
}
