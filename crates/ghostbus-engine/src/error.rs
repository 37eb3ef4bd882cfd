use thiserror::Error;

/// Errors surfaced by the public engine API.
///
/// Fault-time failures never appear here: an access the engine cannot
/// honor is fatal to the process (see the fault module), because returning
/// an error to an instruction that already executed is not an option.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("device table is full")]
    DeviceTableFull,

    #[error("device {0} is already registered")]
    DuplicateDevice(u32),

    #[error("window {base:#x} (+{len:#x} bytes) overlaps a registered window")]
    OverlappingWindow { base: u32, len: u32 },

    #[error("device base {0:#x} is not page-aligned")]
    UnalignedBase(u32),

    #[error("device window must have a non-zero length")]
    EmptyWindow,

    #[error("could not reserve window at {base:#x}: {source}")]
    WindowUnavailable {
        base: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("no device registered as {0}")]
    UnknownDevice(u32),

    #[error("no device window contains address {0:#x}")]
    NoDeviceAt(u32),

    #[error("access size {0} is not 1, 2, 4, or 8")]
    InvalidAccessSize(u32),

    #[error("interrupt handler table is full")]
    HandlerTableFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
