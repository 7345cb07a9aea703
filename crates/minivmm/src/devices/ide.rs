//! Primary-channel IDE disk controller backed by an in-memory image.
//!
//! Models the eight command-block registers at `0x1F0..=0x1F7` closely
//! enough for the xv6 boot block and kernel driver: the address
//! registers latch whatever the guest writes, and writing
//! [`CMD_READ_SECTORS`] to the command register positions the read
//! cursor at the start of the addressed sector.  The guest then drains
//! the sector through the data register.
//!
//! The controller is always ready: the status register reads
//! [`STATUS_READY`] and no command ever sets BSY, DRQ or ERR.

use std::io;
use std::path::Path;

use log::debug;

use crate::verified::ide::{check_read, lba28, sector_offset};

/// First port of the primary-channel command block (data register).
pub const IDE_PORT_BASE: u16 = 0x1F0;

/// Status register value while idle: DRDY set, no error.
pub const STATUS_READY: u8 = 0x40;

/// READ SECTOR(S) with retry.
pub const CMD_READ_SECTORS: u8 = 0x20;

/// Errors returned by the disk controller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DiskError {
    /// The guest issued a command this controller does not implement.
    #[error("unsupported IDE command {command:#04x}")]
    UnsupportedCommand { command: u8 },

    /// A data-register read ran past the end of the backing image.
    #[error("disk read out of bounds: offset {offset}, len {len}, image size {image_size}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        image_size: u64,
    },
}

/// One register of the command block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdeRegister {
    Data,
    Features,
    SectorCount,
    LbaLow,
    LbaMid,
    LbaHigh,
    DriveHead,
    StatusCommand,
}

impl IdeRegister {
    /// Map a port in `0x1F0..=0x1F7` to its register.
    pub fn from_port(port: u16) -> Option<Self> {
        let reg = match port.checked_sub(IDE_PORT_BASE)? {
            0 => Self::Data,
            1 => Self::Features,
            2 => Self::SectorCount,
            3 => Self::LbaLow,
            4 => Self::LbaMid,
            5 => Self::LbaHigh,
            6 => Self::DriveHead,
            7 => Self::StatusCommand,
            _ => return None,
        };
        Some(reg)
    }
}

/// Latched register contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFile {
    pub data: u16,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub drive_head: u8,
    pub status: u8,
}

impl Default for TaskFile {
    fn default() -> Self {
        Self {
            data: 0,
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            drive_head: 0,
            status: STATUS_READY,
        }
    }
}

impl TaskFile {
    /// The 28-bit LBA currently addressed by the task file.
    pub fn lba(&self) -> u32 {
        lba28(self.lba_low, self.lba_mid, self.lba_high, self.drive_head)
    }
}

/// Command and transfer counters for an [`IdeDisk`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdeStats {
    /// READ SECTOR commands accepted.
    pub read_commands: u64,
    /// Bytes transferred to the guest through the data register.
    pub bytes_read: u64,
}

/// An IDE disk whose contents live in a byte vector.
///
/// # Examples
///
/// ```
/// use minivmm::devices::ide::{IdeDisk, IdeRegister, CMD_READ_SECTORS};
///
/// let mut image = vec![0u8; 1024];
/// image[512..516].copy_from_slice(b"ELF!");
/// let mut disk = IdeDisk::from_image(image);
///
/// disk.write_register(IdeRegister::LbaLow, 1).unwrap();
/// disk.write_register(IdeRegister::StatusCommand, u16::from(CMD_READ_SECTORS)).unwrap();
///
/// let mut word = [0u8; 4];
/// disk.read_data(&mut word).unwrap();
/// assert_eq!(&word, b"ELF!");
/// ```
#[derive(Clone, Debug)]
pub struct IdeDisk {
    image: Vec<u8>,
    regs: TaskFile,
    read_cursor: u64,
    stats: IdeStats,
}

impl IdeDisk {
    /// Create a disk over an already-loaded image.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            image,
            regs: TaskFile::default(),
            read_cursor: 0,
            stats: IdeStats::default(),
        }
    }

    /// Load the whole image at `path` into memory.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::read(path).map(Self::from_image)
    }

    /// Size of the backing image in bytes.
    pub fn size(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn task_file(&self) -> &TaskFile {
        &self.regs
    }

    /// Byte offset of the next data-register read.
    pub fn read_cursor(&self) -> u64 {
        self.read_cursor
    }

    pub fn stats(&self) -> &IdeStats {
        &self.stats
    }

    /// Current status register value.
    pub fn status(&self) -> u8 {
        self.regs.status
    }

    /// Handle a guest write to `reg`.
    ///
    /// Address and data registers only latch `value` (truncated to the
    /// register width).  A write to the command register executes the
    /// command.
    pub fn write_register(&mut self, reg: IdeRegister, value: u16) -> Result<(), DiskError> {
        let byte = value as u8;
        match reg {
            IdeRegister::Data => self.regs.data = value,
            IdeRegister::Features => {}
            IdeRegister::SectorCount => self.regs.sector_count = byte,
            IdeRegister::LbaLow => self.regs.lba_low = byte,
            IdeRegister::LbaMid => self.regs.lba_mid = byte,
            IdeRegister::LbaHigh => self.regs.lba_high = byte,
            IdeRegister::DriveHead => self.regs.drive_head = byte,
            IdeRegister::StatusCommand => return self.execute(byte),
        }
        Ok(())
    }

    /// Fill `buf` from the image at the read cursor and advance the
    /// cursor by `buf.len()`.
    ///
    /// Fails without moving the cursor if the read would run past the
    /// end of the image.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<(), DiskError> {
        let len = buf.len() as u64;
        check_read(self.size(), self.read_cursor, len)?;

        let start = self.read_cursor as usize;
        buf.copy_from_slice(&self.image[start..start + buf.len()]);

        self.read_cursor += len;
        self.stats.bytes_read += len;
        Ok(())
    }

    fn execute(&mut self, command: u8) -> Result<(), DiskError> {
        match command {
            CMD_READ_SECTORS => {
                let lba = self.regs.lba();
                self.read_cursor = sector_offset(lba);
                self.stats.read_commands += 1;
                debug!(
                    "IDE READ SECTOR lba={} count={} -> cursor {:#x}",
                    lba, self.regs.sector_count, self.read_cursor,
                );
                Ok(())
            }
            command => Err(DiskError::UnsupportedCommand { command }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Image where every byte encodes its own offset modulo 251.
    fn patterned_image(sectors: usize) -> Vec<u8> {
        (0..sectors * 512).map(|i| (i % 251) as u8).collect()
    }

    fn issue_read(disk: &mut IdeDisk, low: u8, mid: u8, high: u8, head: u8) {
        disk.write_register(IdeRegister::LbaLow, low.into()).unwrap();
        disk.write_register(IdeRegister::LbaMid, mid.into()).unwrap();
        disk.write_register(IdeRegister::LbaHigh, high.into()).unwrap();
        disk.write_register(IdeRegister::DriveHead, head.into()).unwrap();
        disk.write_register(IdeRegister::StatusCommand, CMD_READ_SECTORS.into())
            .unwrap();
    }

    #[test]
    fn port_mapping() {
        assert_eq!(IdeRegister::from_port(0x1F0), Some(IdeRegister::Data));
        assert_eq!(IdeRegister::from_port(0x1F1), Some(IdeRegister::Features));
        assert_eq!(IdeRegister::from_port(0x1F5), Some(IdeRegister::LbaHigh));
        assert_eq!(IdeRegister::from_port(0x1F6), Some(IdeRegister::DriveHead));
        assert_eq!(IdeRegister::from_port(0x1F7), Some(IdeRegister::StatusCommand));
        assert_eq!(IdeRegister::from_port(0x1EF), None);
        assert_eq!(IdeRegister::from_port(0x1F8), None);
    }

    #[test]
    fn idle_status_is_ready() {
        let disk = IdeDisk::from_image(vec![0; 512]);
        assert_eq!(disk.status(), STATUS_READY);
        assert_eq!(disk.read_cursor(), 0);
    }

    #[test]
    fn registers_latch_without_side_effects() {
        let mut disk = IdeDisk::from_image(patterned_image(4));
        disk.write_register(IdeRegister::SectorCount, 1).unwrap();
        disk.write_register(IdeRegister::LbaLow, 0x12).unwrap();
        disk.write_register(IdeRegister::LbaMid, 0x34).unwrap();
        disk.write_register(IdeRegister::LbaHigh, 0x56).unwrap();
        disk.write_register(IdeRegister::DriveHead, 0xE7).unwrap();
        disk.write_register(IdeRegister::Data, 0xBEEF).unwrap();

        // Writing the same values again changes nothing.
        let before = disk.task_file().clone();
        disk.write_register(IdeRegister::LbaLow, 0x12).unwrap();
        disk.write_register(IdeRegister::SectorCount, 1).unwrap();
        assert_eq!(disk.task_file(), &before);

        assert_eq!(before.sector_count, 1);
        assert_eq!(before.lba_low, 0x12);
        assert_eq!(before.lba_mid, 0x34);
        assert_eq!(before.lba_high, 0x56);
        assert_eq!(before.drive_head, 0xE7);
        assert_eq!(before.data, 0xBEEF);
        assert_eq!(before.status, STATUS_READY);
        assert_eq!(disk.read_cursor(), 0, "no command issued yet");
        assert_eq!(disk.stats().read_commands, 0);
    }

    #[test]
    fn lba_high_does_not_alias_drive_head() {
        let mut disk = IdeDisk::from_image(vec![0; 512]);
        disk.write_register(IdeRegister::DriveHead, 0xE0).unwrap();
        disk.write_register(IdeRegister::LbaHigh, 0x0F).unwrap();
        assert_eq!(disk.task_file().drive_head, 0xE0);
        assert_eq!(disk.task_file().lba_high, 0x0F);
    }

    #[test]
    fn byte_registers_truncate() {
        let mut disk = IdeDisk::from_image(vec![0; 512]);
        disk.write_register(IdeRegister::LbaLow, 0x1FF).unwrap();
        assert_eq!(disk.task_file().lba_low, 0xFF);
    }

    #[test]
    fn read_command_sets_cursor() {
        let mut disk = IdeDisk::from_image(patterned_image(4));
        issue_read(&mut disk, 1, 0, 0, 0xE0);
        assert_eq!(disk.read_cursor(), 512);
        assert_eq!(disk.stats().read_commands, 1);
    }

    #[test]
    fn read_command_uses_full_lba28() {
        let mut disk = IdeDisk::from_image(Vec::new());
        issue_read(&mut disk, 0x01, 0x02, 0x03, 0xE4);
        assert_eq!(disk.read_cursor(), 0x0403_0201 * 512);
    }

    #[test]
    fn sequential_reads_drain_sector() {
        let image = patterned_image(4);
        let mut disk = IdeDisk::from_image(image.clone());
        issue_read(&mut disk, 2, 0, 0, 0xE0);

        let mut drained = Vec::new();
        for _ in 0..128 {
            let mut word = [0u8; 4];
            disk.read_data(&mut word).unwrap();
            drained.extend_from_slice(&word);
        }
        assert_eq!(&drained[..], &image[1024..1536]);
        assert_eq!(disk.read_cursor(), 1536);
        assert_eq!(disk.stats().bytes_read, 512);
    }

    #[test]
    fn new_command_repositions_cursor() {
        let image = patterned_image(4);
        let mut disk = IdeDisk::from_image(image.clone());
        issue_read(&mut disk, 3, 0, 0, 0xE0);
        let mut word = [0u8; 4];
        disk.read_data(&mut word).unwrap();

        issue_read(&mut disk, 0, 0, 0, 0xE0);
        disk.read_data(&mut word).unwrap();
        assert_eq!(&word, &image[0..4]);
    }

    #[test]
    fn read_past_end_fails_and_keeps_cursor() {
        let mut disk = IdeDisk::from_image(patterned_image(1));
        issue_read(&mut disk, 1, 0, 0, 0xE0);

        let mut word = [0u8; 4];
        let err = disk.read_data(&mut word).unwrap_err();
        assert_eq!(
            err,
            DiskError::OutOfBounds {
                offset: 512,
                len: 4,
                image_size: 512
            }
        );
        assert_eq!(disk.read_cursor(), 512);
    }

    #[test]
    fn unsupported_command() {
        let mut disk = IdeDisk::from_image(vec![0; 512]);
        // WRITE SECTOR(S)
        let err = disk.write_register(IdeRegister::StatusCommand, 0x30).unwrap_err();
        assert_eq!(err, DiskError::UnsupportedCommand { command: 0x30 });
    }
}
