use crate::qemu_trace;
use kernel_sync::SyncOnceCell;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct QemuLogger {
    max_level: LevelFilter,
}

static LOGGER: SyncOnceCell<QemuLogger> = SyncOnceCell::new();

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Call this once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        let logger: &'static Self = LOGGER.get_or_init(|| self);
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(all(test, feature = "enabled"))]
mod tests {
    use super::*;
    use crate::port::take_captured;
    use log::Level;

    #[test]
    fn formats_level_target_and_message() {
        let logger = QemuLogger::new(LevelFilter::Info);
        take_captured();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("kernel_net::dhcp")
                .args(format_args!("lease {}", "192.168.1.50"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("kernel_net::eth")
                .args(format_args!("dropped"))
                .build(),
        );

        assert_eq!(take_captured(), "[INFO] kernel_net::dhcp: lease 192.168.1.50\n");
    }
}
