//! A polling ATA disk driver that blocks by yielding.
//!
//! The device sits on the primary ATA channel at I/O base 0x1F0 and is
//! driven in PIO mode: program the sector registers, issue the command,
//! wait for the data-request bit, then move the 512-byte block as 256
//! word-sized port transfers.
//!
//! The wait is where this driver earns its name. A plain polling driver
//! burns the CPU until the device raises DRQ; this one re-queues the
//! calling thread and yields on every unsuccessful poll, so other
//! threads run while the platters spin. The call still looks
//! synchronous to the caller.

use bitflags::bitflags;

use crate::task::{scheduler, thread};

/// Bytes per disk block.
pub const BLOCK_SIZE: usize = 512;

const IO_BASE: u16 = 0x1F0;
const REG_DATA: u16 = IO_BASE;
const REG_FEATURES: u16 = IO_BASE + 1;
const REG_SECTOR_COUNT: u16 = IO_BASE + 2;
const REG_LBA_LOW: u16 = IO_BASE + 3;
const REG_LBA_MID: u16 = IO_BASE + 4;
const REG_LBA_HIGH: u16 = IO_BASE + 5;
const REG_DRIVE_SELECT: u16 = IO_BASE + 6;
/// Status on read, command on write.
const REG_STATUS: u16 = IO_BASE + 7;
const REG_COMMAND: u16 = IO_BASE + 7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;

bitflags! {
    /// ATA status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// The previous command ended in error.
        const ERR  = 1 << 0;
        /// Data request: the device wants a PIO transfer.
        const DRQ  = 1 << 3;
        /// Device ready.
        const DRDY = 1 << 6;
        /// Device busy; other bits are invalid while set.
        const BSY  = 1 << 7;
    }
}

/// Which of the two drives on the primary channel to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    Master = 0,
    Slave = 1,
}

/// A disk on the primary ATA channel with a yielding ready-wait.
pub struct BlockingDisk {
    drive: Drive,
    /// Capacity in blocks, as reported by the boot probe.
    size_blocks: usize,
}

impl BlockingDisk {
    pub fn new(drive: Drive, size_blocks: usize) -> BlockingDisk {
        klog::info!("blocking disk on {:?}, {} blocks", drive, size_blocks);
        BlockingDisk { drive, size_blocks }
    }

    /// Capacity in blocks.
    pub fn size(&self) -> usize {
        self.size_blocks
    }

    /// Programs the sector registers and issues `command` for `block`.
    fn issue_operation(&self, command: u8, block: usize) {
        use khal::port::outb;
        // SAFETY: the primary ATA register block is present on the
        // machine configurations the kernel targets; hosted builds hit
        // the simulated port space.
        unsafe {
            outb(REG_FEATURES, 0x00);
            outb(REG_SECTOR_COUNT, 1);
            outb(REG_LBA_LOW, block as u8);
            outb(REG_LBA_MID, (block >> 8) as u8);
            outb(REG_LBA_HIGH, (block >> 16) as u8);
            outb(
                REG_DRIVE_SELECT,
                0xE0 | ((self.drive as u8) << 4) | ((block >> 24) & 0x0F) as u8,
            );
            outb(REG_COMMAND, command);
        }
    }

    /// Whether the device is ready for the data transfer.
    pub fn is_ready(&self) -> bool {
        // SAFETY: as in issue_operation.
        let status = Status::from_bits_truncate(unsafe { khal::port::inb(REG_STATUS) });
        status.contains(Status::DRQ)
    }

    /// Polls until the device raises DRQ, re-queuing the calling thread
    /// and yielding between polls so the wait costs no CPU time.
    fn wait_until_ready(&self) {
        while !self.is_ready() {
            let current = thread::current().expect("disk wait outside a thread");
            // SAFETY: the current thread is live by definition.
            scheduler::resume(unsafe { &mut *current.as_ptr() });
            scheduler::yield_now();
        }
    }

    /// Reads one block into `buf`. No error check; the teaching device
    /// never reports one.
    pub fn read(&self, block: usize, buf: &mut [u8; BLOCK_SIZE]) {
        self.issue_operation(CMD_READ_SECTORS, block);
        self.wait_until_ready();
        for i in 0..BLOCK_SIZE / 2 {
            // SAFETY: as in issue_operation.
            let word = unsafe { khal::port::inw(REG_DATA) };
            buf[2 * i] = word as u8;
            buf[2 * i + 1] = (word >> 8) as u8;
        }
    }

    /// Writes one block from `buf`.
    pub fn write(&self, block: usize, buf: &[u8; BLOCK_SIZE]) {
        self.issue_operation(CMD_WRITE_SECTORS, block);
        self.wait_until_ready();
        for i in 0..BLOCK_SIZE / 2 {
            let word = buf[2 * i] as u16 | ((buf[2 * i + 1] as u16) << 8);
            // SAFETY: as in issue_operation.
            unsafe { khal::port::outw(REG_DATA, word) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{machine, spawn_thread};
    use core::sync::atomic::{AtomicUsize, Ordering};

    static STATUS_POLLS: AtomicUsize = AtomicUsize::new(0);
    static NEXT_WORD: AtomicUsize = AtomicUsize::new(0);

    /// Device model: busy for the first two status polls, then ready;
    /// the data port streams bytes 0, 1, 2, ... as little-endian words.
    fn slow_disk(port: u16) -> Option<u16> {
        match port {
            REG_STATUS => {
                let poll = STATUS_POLLS.fetch_add(1, Ordering::SeqCst);
                if poll < 2 {
                    Some(Status::BSY.bits() as u16)
                } else {
                    Some((Status::DRDY | Status::DRQ).bits() as u16)
                }
            }
            REG_DATA => {
                let word = NEXT_WORD.fetch_add(1, Ordering::SeqCst);
                let low = (2 * word) as u8;
                let high = (2 * word + 1) as u8;
                Some(((high as u16) << 8) | low as u16)
            }
            _ => None,
        }
    }

    #[test]
    fn busy_read_yields_until_ready_then_transfers() {
        let _m = machine();
        STATUS_POLLS.store(0, Ordering::SeqCst);
        NEXT_WORD.store(0, Ordering::SeqCst);
        khal::sim::set_in_hook(slow_disk);

        let mut reader = spawn_thread();
        let mut other = spawn_thread();
        unsafe { crate::task::thread::make_current(&mut reader) };
        scheduler::add(&mut other);

        let disk = BlockingDisk::new(Drive::Master, 1024);
        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(3, &mut buf);

        // Two busy polls, each of which re-queued the caller and handed
        // the CPU over: first to the other thread, then back.
        assert_eq!(STATUS_POLLS.load(Ordering::SeqCst), 3);
        khal::sim::with_dispatches(|ids| {
            assert_eq!(ids, [other.id(), reader.id()]);
        });

        // The block arrived in byte order.
        for (i, &byte) in buf.iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
    }

    #[test]
    fn ready_read_never_yields() {
        let _m = machine();
        STATUS_POLLS.store(0, Ordering::SeqCst);
        NEXT_WORD.store(0, Ordering::SeqCst);
        khal::sim::set_port_value(REG_STATUS, (Status::DRDY | Status::DRQ).bits() as u16);

        let mut reader = spawn_thread();
        unsafe { crate::task::thread::make_current(&mut reader) };

        let disk = BlockingDisk::new(Drive::Master, 1024);
        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(0, &mut buf);

        khal::sim::with_dispatches(|ids| assert!(ids.is_empty()));
    }

    #[test]
    fn write_programs_registers_and_streams_block() {
        let _m = machine();
        khal::sim::set_port_value(REG_STATUS, (Status::DRDY | Status::DRQ).bits() as u16);

        let mut writer = spawn_thread();
        unsafe { crate::task::thread::make_current(&mut writer) };

        let disk = BlockingDisk::new(Drive::Slave, 1024);
        let mut buf = [0u8; BLOCK_SIZE];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let block = 0x01C0_FFEE;
        disk.write(block, &buf);

        khal::sim::with_dispatches(|ids| assert!(ids.is_empty()));
        khal::sim::with_port_writes(|writes| {
            assert_eq!(
                &writes[..7],
                &[
                    (REG_FEATURES, 0x00),
                    (REG_SECTOR_COUNT, 1),
                    (REG_LBA_LOW, 0xEE),
                    (REG_LBA_MID, 0xFF),
                    (REG_LBA_HIGH, 0xC0),
                    // Slave select plus LBA bits 24..27.
                    (REG_DRIVE_SELECT, 0xF1),
                    (REG_COMMAND, CMD_WRITE_SECTORS as u16),
                ]
            );
            assert_eq!(writes.len(), 7 + BLOCK_SIZE / 2);
            for (i, &(port, word)) in writes[7..].iter().enumerate() {
                assert_eq!(port, REG_DATA);
                let expected =
                    buf[2 * i] as u16 | ((buf[2 * i + 1] as u16) << 8);
                assert_eq!(word, expected);
            }
        });
    }
}
