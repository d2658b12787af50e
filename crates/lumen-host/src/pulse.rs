//! Pulse device sinks and the driver sub-FSM.
//!
//! The pulse engine consumes the raw step-byte stream. On the target it is
//! a character device; off-target the same stream goes to a capture file
//! so a run can be inspected byte for byte. Either way it is just a
//! [`PulseSink`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use motion::stepper::{PulseError, PulseSink};
use tracing::info;

use crate::fsm::{Fsm, SubFsm, SysState};

/// Driver states reported to the system FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    Init = 0,
    Idle = 1,
    Run = 2,
    Disabled = 3,
    Fault = 4,
}

const DRIVER_STATE_MAP: &[(SysState, u8)] = &[
    (SysState::Init, DriverState::Init as u8),
    (SysState::Sleep, DriverState::Disabled as u8),
    (SysState::Idle, DriverState::Idle as u8),
    (SysState::Homing, DriverState::Run as u8),
    (SysState::Homing, DriverState::Idle as u8),
    (SysState::Run, DriverState::Run as u8),
    (SysState::Hold, DriverState::Idle as u8),
    (SysState::Fault, DriverState::Fault as u8),
];

/// Register the driver sub-FSM.
///
/// Without the real pulse engine there is no state attribute to poll, so
/// the driver reports idle immediately and stays there; write failures on
/// the sink surface as motion faults instead.
pub fn register_driver(fsm: &Fsm) {
    fsm.register(SubFsm::Driver, DRIVER_STATE_MAP, None);
    fsm.update(SubFsm::Driver, DriverState::Idle as u8);
    info!("pulse driver registered");
}

/// Buffered byte sink onto the pulse device node or a capture file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<FileSink> {
        let file = File::create(path)
            .with_context(|| format!("opening pulse device {}", path.display()))?;
        Ok(FileSink {
            writer: BufWriter::new(file),
        })
    }
}

impl PulseSink for FileSink {
    fn write_byte(&mut self, byte: u8) -> Result<(), PulseError> {
        self.writer.write_all(&[byte])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PulseError> {
        self.writer.flush()?;
        Ok(())
    }
}
