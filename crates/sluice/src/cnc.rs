//! The control-and-counters file: one mapped file every client attaches to.
//!
//! Layout, all regions aligned to the file page size:
//!
//! ```text
//! header page (version, pid, heartbeat, region lengths, page size)
//! to-driver region    SPSC ring of DriverCommand
//! to-clients region   broadcast ring of ClientEvent
//! counters metadata
//! counters values
//! error log
//! ```

use std::path::Path;

use sluice_logbuffer::{
    AtomicBuffer, CounterTable, MappedRegion,
    ring::{Ring, RingKind},
};
use sluice_timing::Nanos;

use crate::{
    command::{ClientEvent, DriverCommand},
    config::DriverConfig,
    error::DriverError,
};

pub const CNC_FILE: &str = "cnc.dat";
pub const CNC_VERSION: i32 = 1;

const VERSION_OFFSET: usize = 0;
const PID_OFFSET: usize = 8;
const HEARTBEAT_OFFSET: usize = 16;
const TO_DRIVER_LENGTH_OFFSET: usize = 24;
const TO_CLIENTS_LENGTH_OFFSET: usize = 28;
const COUNTERS_METADATA_LENGTH_OFFSET: usize = 32;
const COUNTERS_VALUES_LENGTH_OFFSET: usize = 36;
const ERROR_LOG_LENGTH_OFFSET: usize = 40;
const FILE_PAGE_SIZE_OFFSET: usize = 44;

pub struct CncFile {
    region: MappedRegion,
    header: AtomicBuffer,
    pub to_driver: Ring<DriverCommand>,
    pub to_clients: Ring<ClientEvent>,
    pub counters: CounterTable,
    error_log: AtomicBuffer,
}

struct Layout {
    page: usize,
    to_driver_len: usize,
    to_clients_len: usize,
    metadata_len: usize,
    values_len: usize,
    error_len: usize,
}

impl Layout {
    fn from_config(config: &DriverConfig) -> Self {
        let page = config.file_page_size;
        let align = |len: usize| (len + page - 1) & !(page - 1);
        let values_len = align(config.counter_values_buffer_length);
        Self {
            page,
            to_driver_len: align(config.conductor_buffer_length),
            to_clients_len: align(config.to_clients_buffer_length),
            // 512-byte metadata records beside 64-byte value slots
            metadata_len: align(values_len * 8),
            values_len,
            error_len: align(config.error_buffer_length),
        }
    }

    fn total(&self) -> usize {
        self.page
            + self.to_driver_len
            + self.to_clients_len
            + self.metadata_len
            + self.values_len
            + self.error_len
    }
}

impl CncFile {
    pub fn create(config: &DriverConfig) -> Result<Self, DriverError> {
        let layout = Layout::from_config(config);
        let path = config.dir.join(CNC_FILE);
        let region = MappedRegion::create(&path, layout.total())?;
        Self::wrap(region, layout, config, true)
    }

    /// Attach to a live driver's cnc file.
    pub fn open(dir: &Path, config: &DriverConfig) -> Result<Self, DriverError> {
        let layout = Layout::from_config(config);
        let region = MappedRegion::open(&dir.join(CNC_FILE), layout.total())?;
        Self::wrap(region, layout, config, false)
    }

    fn wrap(
        region: MappedRegion,
        layout: Layout,
        config: &DriverConfig,
        init: bool,
    ) -> Result<Self, DriverError> {
        let header = region.buffer(0, layout.page);
        let mut offset = layout.page;

        let to_driver = Ring::from_region(
            unsafe { region.ptr().add(offset) },
            layout.to_driver_len,
            RingKind::Spsc,
            init,
        )?;
        offset += layout.to_driver_len;

        let to_clients = Ring::from_region(
            unsafe { region.ptr().add(offset) },
            layout.to_clients_len,
            RingKind::Broadcast,
            init,
        )?;
        offset += layout.to_clients_len;

        let metadata = region.buffer(offset, layout.metadata_len);
        offset += layout.metadata_len;
        let values = region.buffer(offset, layout.values_len);
        offset += layout.values_len;
        let counters = CounterTable::new(metadata, values, config.counter_free_to_reuse_timeout);

        let error_log = region.buffer(offset, layout.error_len);

        if init {
            header.put_i64(PID_OFFSET, std::process::id() as i64);
            header.put_i32(TO_DRIVER_LENGTH_OFFSET, layout.to_driver_len as i32);
            header.put_i32(TO_CLIENTS_LENGTH_OFFSET, layout.to_clients_len as i32);
            header.put_i32(COUNTERS_METADATA_LENGTH_OFFSET, layout.metadata_len as i32);
            header.put_i32(COUNTERS_VALUES_LENGTH_OFFSET, layout.values_len as i32);
            header.put_i32(ERROR_LOG_LENGTH_OFFSET, layout.error_len as i32);
            header.put_i32(FILE_PAGE_SIZE_OFFSET, layout.page as i32);
            // version last: attaching clients spin until it lands
            header.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);
        } else if header.get_i32_volatile(VERSION_OFFSET) != CNC_VERSION {
            return Err(DriverError::Generic(format!(
                "cnc version mismatch: {}",
                header.get_i32_volatile(VERSION_OFFSET)
            )));
        }

        Ok(Self { region, header, to_driver, to_clients, counters, error_log })
    }

    #[inline]
    pub fn error_log_buffer(&self) -> AtomicBuffer {
        self.error_log
    }

    #[inline]
    pub fn update_heartbeat(&self, now: Nanos) {
        self.header.put_i64_ordered(HEARTBEAT_OFFSET, i64::from(now));
    }

    #[inline]
    pub fn heartbeat(&self) -> Nanos {
        Nanos(self.header.get_i64_volatile(HEARTBEAT_OFFSET) as u64)
    }

    #[inline]
    pub fn driver_pid(&self) -> i64 {
        self.header.get_i64(PID_OFFSET)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use sluice_logbuffer::ring::{RingConsumer, RingProducer};

    use super::*;

    fn config(dir: &Path) -> DriverConfig {
        DriverConfig { dir: dir.to_path_buf(), ..Default::default() }
    }

    #[test]
    fn create_then_attach() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let cnc = CncFile::create(&config).unwrap();
        cnc.update_heartbeat(Nanos(42));

        let view = CncFile::open(dir.path(), &config).unwrap();
        assert_eq!(view.heartbeat(), Nanos(42));
        assert_eq!(view.driver_pid(), std::process::id() as i64);

        // a command produced through the attached view reaches the driver
        let mut consumer = RingConsumer::from(cnc.to_driver);
        let producer = RingProducer::from(view.to_driver);
        producer.produce(&DriverCommand::ClientKeepalive { client_id: 9 }).unwrap();

        let mut cmd = DriverCommand::default();
        consumer.try_consume(&mut cmd).unwrap();
        assert!(matches!(cmd, DriverCommand::ClientKeepalive { client_id: 9 }));
    }

    #[test]
    fn counters_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let cnc = CncFile::create(&config).unwrap();

        let id = cnc
            .counters
            .allocate(7, b"k", "shared counter", -1, 1, Nanos(1))
            .unwrap();
        cnc.counters.position(id).set_ordered(1234);

        let view = CncFile::open(dir.path(), &config).unwrap();
        assert_eq!(view.counters.position(id).get_volatile(), 1234);
        assert_eq!(view.counters.label(id), "shared counter");
    }
}
