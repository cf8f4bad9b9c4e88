//! Top-level result codes returned by the CLI, distinct from the `anyhow`
//! error chains used internally: these are the small stable vocabulary a
//! caller scripts against.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    InvalidParam = 1,
    DiskFull = 2,
    IoError = 3,
    FatalError = 4,
    PatchReadError = 5,
    PatchWriteError = 6,
    InvalidOldImage = 7,
    InvalidNewImage = 8,
    CrcMismatch = 9,
    InvalidPatch = 10,
    OutdatedPatchFormat = 11,
    UnsupportedPatchFormat = 12,
}

impl StatusCode {
    pub fn exit_code(self) -> i32 {
        self.into()
    }
}
